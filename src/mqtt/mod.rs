pub mod events;
pub mod mqtt_device;
pub mod publish;
