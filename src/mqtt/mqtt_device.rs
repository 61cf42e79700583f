use color_eyre::Result;
use derive_builder::Builder;
use palette::{FromColor, Hsv, Srgb};
use serde::{Deserialize, Serialize};

use crate::{
    govee::{
        command::DeviceCommand,
        device::{Device, PowerState, Rgb, Segment},
    },
    protocols::mqtt::MqttClient,
    settings::Settings,
};

/// Device state as exchanged over MQTT. Published retained on the light
/// topic; set messages use the same shape with every field optional.
#[derive(Builder, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[builder(setter(into, strip_option), default)]
#[serde(default)]
pub struct MqttDevice {
    pub id: String,
    pub name: String,
    pub power: Option<bool>,

    /// 0.0 - 1.0
    pub brightness: Option<f32>,
    pub color: Option<Hsv>,
    pub online: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<Segment>>,
}

pub fn rgb_to_hsv(rgb: Rgb) -> Hsv {
    Hsv::from_color(Srgb::new(rgb.r, rgb.g, rgb.b).into_format::<f32>())
}

pub fn hsv_to_rgb(hsv: Hsv) -> Rgb {
    let srgb: Srgb = Srgb::from_color(hsv);
    let srgb: Srgb<u8> = srgb.into_format();
    Rgb::new(srgb.red, srgb.green, srgb.blue)
}

impl MqttDevice {
    pub fn from_device(device: &Device) -> Result<MqttDevice> {
        let mut builder = MqttDeviceBuilder::default();
        builder.id(device.device.clone()).name(device.device_name.clone());

        if let Some(properties) = &device.properties {
            if let Some(power_state) = properties.power_state {
                builder.power(power_state == PowerState::On);
            }

            if let Some(brightness) = properties.brightness {
                builder.brightness(f32::from(brightness) / 100.0);
            }

            if let Some(color) = properties.color {
                builder.color(rgb_to_hsv(color));
            }

            if let Some(online) = properties.online {
                builder.online(online);
            }
        }

        Ok(builder.build()?)
    }

    /// Overwrites fields with the ones present in a newer set message.
    pub fn merge(&mut self, newer: MqttDevice) {
        if newer.power.is_some() {
            self.power = newer.power;
        }
        if newer.brightness.is_some() {
            self.brightness = newer.brightness;
        }
        if newer.color.is_some() {
            self.color = newer.color;
        }
        if newer.online.is_some() {
            self.online = newer.online;
        }
        if newer.scene.is_some() {
            self.scene = newer.scene;
        }
        if newer.segments.is_some() {
            self.segments = newer.segments;
        }
    }

    /// Logical commands requested by a set message, in the order they are sent.
    pub fn to_commands(&self) -> Vec<DeviceCommand> {
        let mut commands = vec![];

        if let Some(power) = self.power {
            commands.push(DeviceCommand::Turn(if power { PowerState::On } else { PowerState::Off }));
        }

        if let Some(brightness) = self.brightness {
            let brightness = (brightness * 100.0).round().clamp(0.0, 100.0) as u8;
            commands.push(DeviceCommand::Brightness(brightness));
        }

        if let Some(color) = self.color {
            commands.push(DeviceCommand::Color(hsv_to_rgb(color)));
        }

        if let Some(scene) = &self.scene {
            commands.push(DeviceCommand::Scene(scene.clone()));
        }

        if let Some(segments) = &self.segments {
            commands.push(DeviceCommand::Segments(segments.clone()));
        }

        commands
    }
}

pub async fn publish_mqtt_device(
    mqtt_client: &MqttClient,
    settings: &Settings,
    mqtt_device: &MqttDevice,
) -> Result<()> {
    let topic = settings.mqtt.light_topic.replace("{id}", &mqtt_device.id);

    let json = serde_json::to_string(&mqtt_device)?;

    mqtt_client
        .client
        .publish(topic, rumqttc::QoS::AtLeastOnce, true, json)
        .await?;

    Ok(())
}
