use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb { r, g, b }
    }

    /// 24-bit `0xRRGGBB` packing used by the capability API
    pub fn packed(&self) -> u32 {
        (u32::from(self.r) << 16) + (u32::from(self.g) << 8) + u32::from(self.b)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
        }
    }
}

/// Partial snapshot of a device's state. Any subset of fields may be present.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Rgb>,

    /// 0 - 100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<PowerState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        self == &Properties::default()
    }

    /// Field-wise merge: present fields in `update` overwrite, absent ones are kept.
    pub fn merge(&mut self, update: &Properties) {
        if let Some(color) = update.color {
            self.color = Some(color);
        }
        if let Some(brightness) = update.brightness {
            self.brightness = Some(brightness);
        }
        if let Some(power_state) = update.power_state {
            self.power_state = Some(power_state);
        }
        if let Some(online) = update.online {
            self.online = Some(online);
        }
    }

    /// Copies the current value of every field that is present in `mask`,
    /// including absent values.
    pub fn project(&self, mask: &Properties) -> Properties {
        Properties {
            color: mask.color.and(self.color),
            brightness: mask.brightness.and(self.brightness),
            power_state: mask.power_state.and(self.power_state),
            online: mask.online.and(self.online),
        }
    }

    /// Overwrites every field present in `mask` with the value from `previous`,
    /// absent values included.
    pub fn restore(&mut self, previous: &Properties, mask: &Properties) {
        if mask.color.is_some() {
            self.color = previous.color;
        }
        if mask.brightness.is_some() {
            self.brightness = previous.brightness;
        }
        if mask.power_state.is_some() {
            self.power_state = previous.power_state;
        }
        if mask.online.is_some() {
            self.online = previous.online;
        }
    }

    /// Builds properties from the `data.properties` array of the legacy state
    /// endpoint, where each element reports a single field.
    pub fn from_reported(reported: &[Value]) -> Properties {
        let mut properties = Properties::default();

        for entry in reported {
            if let Some(power_state) = entry.get("powerState") {
                if let Ok(power_state) = serde_json::from_value(power_state.clone()) {
                    properties.power_state = Some(power_state);
                }
            }

            if let Some(brightness) = entry.get("brightness").and_then(Value::as_u64) {
                properties.brightness = Some(brightness.min(100) as u8);
            }

            if let Some(color) = entry.get("color") {
                if let Ok(color) = serde_json::from_value(color.clone()) {
                    properties.color = Some(color);
                }
            }

            match entry.get("online") {
                Some(Value::Bool(online)) => properties.online = Some(*online),
                Some(Value::String(online)) => properties.online = online.parse().ok(),
                _ => {}
            }
        }

        properties
    }
}

/// One entry of a segment command. Position in the sequence is the physical
/// segment index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Segment {
    pub color: Rgb,
    pub brightness: u8,
}

/// What the segment sub-calls have applied to one physical segment so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SegmentState {
    pub color: Option<Rgb>,
    pub brightness: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device: String,
    pub model: String,
    pub device_name: String,

    #[serde(default)]
    pub controllable: bool,

    #[serde(default)]
    pub retrievable: bool,

    #[serde(default)]
    pub support_cmds: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<SegmentState>,
}

impl Device {
    pub fn device_ref(&self) -> DeviceRef {
        DeviceRef {
            device: self.device.clone(),
            model: self.model.clone(),
        }
    }

    pub fn apply_segment_colors(&mut self, segments: &[Segment]) {
        self.segments.resize(segments.len().max(self.segments.len()), SegmentState::default());
        for (state, segment) in self.segments.iter_mut().zip(segments) {
            state.color = Some(segment.color);
        }
    }

    pub fn apply_segment_brightness(&mut self, segments: &[Segment]) {
        self.segments.resize(segments.len().max(self.segments.len()), SegmentState::default());
        for (state, segment) in self.segments.iter_mut().zip(segments) {
            state.brightness = Some(segment.brightness);
        }
    }
}

/// Identifier pair every remote read and write is addressed by.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DeviceRef {
    pub device: String,
    pub model: String,
}

/// One element of a batch state read. `properties` is `None` when that
/// device's read failed in this round.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BatchEntry {
    pub device: String,
    pub properties: Option<Properties>,
}
