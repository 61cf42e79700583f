pub mod https;
pub mod mqtt;
