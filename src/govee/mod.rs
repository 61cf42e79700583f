pub mod cache;
pub mod command;
pub mod device;
pub mod error;
pub mod gateway;
