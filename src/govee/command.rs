use hyper::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    device::{PowerState, Properties, Rgb, Segment},
    error::GatewayError,
};

const SEGMENT_COLOR_SETTING: &str = "devices.capabilities.segment_color_setting";

/// Logical command as requested by a user or automation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceCommand {
    Turn(PowerState),
    Brightness(u8),
    Color(Rgb),
    Scene(String),
    Segments(Vec<Segment>),
}

impl DeviceCommand {
    /// Properties the command is expected to produce once the remote applies it.
    pub fn optimistic_properties(&self) -> Properties {
        match self {
            DeviceCommand::Turn(power_state) => Properties {
                power_state: Some(*power_state),
                ..Default::default()
            },
            DeviceCommand::Brightness(brightness) => Properties {
                brightness: Some(*brightness),
                ..Default::default()
            },
            DeviceCommand::Color(color) => Properties {
                color: Some(*color),
                ..Default::default()
            },
            DeviceCommand::Scene(_) | DeviceCommand::Segments(_) => Properties::default(),
        }
    }

    /// Translates the command into the wire requests that carry it, in send order.
    pub fn translate(&self, device: &str, model: &str) -> Result<Vec<ControlRequest>, GatewayError> {
        let command = match self {
            DeviceCommand::Turn(power_state) => {
                WireCommand::legacy("turn", Value::from(power_state.as_str()))
            }
            DeviceCommand::Brightness(brightness) => {
                if *brightness > 100 {
                    return Err(GatewayError::Validation(format!(
                        "brightness {brightness} is out of range 0-100"
                    )));
                }
                WireCommand::legacy("brightness", Value::from(*brightness))
            }
            DeviceCommand::Color(color) => WireCommand::legacy("color", json!(color)),
            DeviceCommand::Scene(scene) => WireCommand::legacy("scene", Value::from(scene.as_str())),
            DeviceCommand::Segments(segments) => {
                let (color, brightness) = segment_requests(device, model, segments)?;
                return Ok(vec![color, brightness]);
            }
        };

        Ok(vec![ControlRequest::new(device, model, command)?])
    }
}

/// Builds the two capability requests of a segment command: colors first,
/// then brightness. They are sent one after the other and are not atomic.
pub fn segment_requests(
    device: &str,
    model: &str,
    segments: &[Segment],
) -> Result<(ControlRequest, ControlRequest), GatewayError> {
    if segments.is_empty() {
        return Err(GatewayError::Validation(
            "segment command needs at least one segment".to_string(),
        ));
    }

    if let Some(segment) = segments.iter().find(|segment| segment.brightness > 100) {
        return Err(GatewayError::Validation(format!(
            "segment brightness {} is out of range 0-100",
            segment.brightness
        )));
    }

    let colors = segments
        .iter()
        .enumerate()
        .map(|(idx, segment)| json!({ "index": [idx], "rgb": segment.color.packed() }))
        .collect();

    let brightness = segments
        .iter()
        .enumerate()
        .map(|(idx, segment)| json!({ "index": [idx], "value": segment.brightness }))
        .collect();

    let color = ControlRequest::new(
        device,
        model,
        WireCommand::Capability(Capability {
            kind: SEGMENT_COLOR_SETTING.to_string(),
            instance: "segmentedColorRgb".to_string(),
            value: Value::Array(colors),
        }),
    )?;

    let brightness = ControlRequest::new(
        device,
        model,
        WireCommand::Capability(Capability {
            kind: SEGMENT_COLOR_SETTING.to_string(),
            instance: "segmentedBrightness".to_string(),
            value: Value::Array(brightness),
        }),
    )?;

    Ok((color, brightness))
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct LegacyCommand {
    pub name: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Capability {
    #[serde(rename = "type")]
    pub kind: String,
    pub instance: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireCommand {
    Legacy(LegacyCommand),
    Capability(Capability),
}

impl WireCommand {
    fn legacy(name: &str, value: Value) -> Self {
        WireCommand::Legacy(LegacyCommand {
            name: name.to_string(),
            value,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// `PUT {legacy}/devices/control`
    Legacy,
    /// `POST {open}/device/control`
    Capability,
}

impl Endpoint {
    pub fn method(&self) -> Method {
        match self {
            Endpoint::Legacy => Method::PUT,
            Endpoint::Capability => Method::POST,
        }
    }
}

#[derive(Serialize, Debug)]
struct LegacyBody<'a> {
    device: &'a str,
    model: &'a str,
    cmd: &'a LegacyCommand,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CapabilityBody<'a> {
    request_id: String,
    payload: CapabilityPayload<'a>,
}

#[derive(Serialize, Debug)]
struct CapabilityPayload<'a> {
    sku: &'a str,
    device: &'a str,
    capability: &'a Capability,
}

/// A command addressed to one device, ready to be sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlRequest {
    pub device: String,
    pub model: String,
    pub command: WireCommand,
}

impl ControlRequest {
    pub fn new(device: &str, model: &str, command: WireCommand) -> Result<Self, GatewayError> {
        if device.is_empty() || model.is_empty() {
            return Err(GatewayError::Validation(
                "missing required fields: device, model".to_string(),
            ));
        }

        Ok(ControlRequest {
            device: device.to_string(),
            model: model.to_string(),
            command,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        match self.command {
            WireCommand::Legacy(_) => Endpoint::Legacy,
            WireCommand::Capability(_) => Endpoint::Capability,
        }
    }

    /// JSON body for the selected endpoint. Capability bodies get a fresh
    /// request id on every call.
    pub fn body(&self) -> Result<String, GatewayError> {
        let body = match &self.command {
            WireCommand::Legacy(cmd) => serde_json::to_string(&LegacyBody {
                device: &self.device,
                model: &self.model,
                cmd,
            })?,
            WireCommand::Capability(capability) => serde_json::to_string(&CapabilityBody {
                request_id: Uuid::new_v4().to_string(),
                payload: CapabilityPayload {
                    sku: &self.model,
                    device: &self.device,
                    capability,
                },
            })?,
        };

        Ok(body)
    }
}

/// Control body as accepted by the proxy route: `{device, model, cmd?, capability?}`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawControlBody {
    pub device: Option<String>,
    pub model: Option<String>,
    pub cmd: Option<LegacyCommand>,
    pub capability: Option<Value>,
}

impl TryFrom<RawControlBody> for ControlRequest {
    type Error = GatewayError;

    fn try_from(body: RawControlBody) -> Result<Self, Self::Error> {
        let device = body.device.unwrap_or_default();
        let model = body.model.unwrap_or_default();

        // A non-empty capability object wins over `cmd`
        let capability = body
            .capability
            .filter(|capability| capability.as_object().is_some_and(|o| !o.is_empty()));

        let command = match (capability, body.cmd) {
            (Some(capability), _) => {
                let capability: Capability = serde_json::from_value(capability)
                    .map_err(|e| GatewayError::Validation(format!("invalid capability: {e}")))?;
                WireCommand::Capability(capability)
            }
            (None, Some(cmd)) => WireCommand::Legacy(cmd),
            (None, None) => {
                return Err(GatewayError::Validation(
                    "missing required fields: device, model, cmd".to_string(),
                ))
            }
        };

        ControlRequest::new(&device, &model, command)
    }
}
