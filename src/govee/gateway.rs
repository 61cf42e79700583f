use std::time::Duration;

use hyper::Uri;
use log::{debug, error, warn};
use serde::Deserialize;
use serde_json::Value;

use super::{
    cache::StateCache,
    command::{ControlRequest, Endpoint},
    device::{BatchEntry, Device, DeviceRef, Properties},
    error::GatewayError,
};
use crate::{
    protocols::https::{mk_get_request, mk_json_request, HyperHttpsClient},
    settings::GoveeSettings,
};

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct RemoteDevice {
    device: String,
    model: String,

    #[serde(default)]
    device_name: String,

    #[serde(default)]
    controllable: bool,

    #[serde(default)]
    retrievable: bool,

    #[serde(default)]
    support_cmds: Vec<String>,
}

impl From<RemoteDevice> for Device {
    fn from(remote: RemoteDevice) -> Self {
        Device {
            device: remote.device,
            model: remote.model,
            device_name: remote.device_name,
            controllable: remote.controllable,
            retrievable: remote.retrievable,
            support_cmds: remote.support_cmds,
            properties: None,
            segments: vec![],
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
struct DeviceListData {
    #[serde(default)]
    devices: Vec<RemoteDevice>,
}

#[derive(Deserialize, Debug, Clone)]
struct DeviceListResponse {
    data: Option<DeviceListData>,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct StateData {
    #[serde(default)]
    properties: Vec<Value>,
}

#[derive(Deserialize, Debug, Clone)]
struct StateResponse {
    data: Option<StateData>,
}

/// Both control APIs answer 200 with a `code` field that may still signal an
/// error (the legacy API calls the text `message`, the capability API `msg`).
/// Only `code` has to be an integer; any value is accepted for it.
#[derive(Deserialize, Debug, Clone)]
struct ControlResponseStatus {
    code: Option<i64>,
    message: Option<Value>,
    msg: Option<Value>,
}

impl ControlResponseStatus {
    fn text(&self) -> String {
        [&self.message, &self.msg]
            .into_iter()
            .flatten()
            .find_map(|value| value.as_str().map(str::to_string))
            .unwrap_or_default()
    }
}

/// Remote service access: device listing, state reads (through the state
/// cache) and command delivery.
pub struct Gateway {
    client: HyperHttpsClient,
    settings: GoveeSettings,
    cache: StateCache,
}

impl Gateway {
    pub fn new(settings: &GoveeSettings, client: HyperHttpsClient) -> Self {
        Gateway {
            client,
            settings: settings.clone(),
            cache: StateCache::new(Duration::from_secs(settings.state_cache_ttl_seconds)),
        }
    }

    fn legacy_uri(&self, path: &str) -> Result<Uri, GatewayError> {
        Ok(format!("{}{}", self.settings.legacy_url, path).parse()?)
    }

    fn endpoint_uri(&self, endpoint: Endpoint) -> Result<Uri, GatewayError> {
        match endpoint {
            Endpoint::Legacy => self.legacy_uri("/devices/control"),
            Endpoint::Capability => {
                Ok(format!("{}/device/control", self.settings.open_api_url).parse()?)
            }
        }
    }

    /// Lists the devices on the account, without properties. Failures are
    /// logged and degrade to an empty list.
    pub async fn list_devices(&self) -> Vec<Device> {
        let result = async {
            let uri = self.legacy_uri("/devices")?;
            let response: DeviceListResponse =
                mk_get_request(&self.client, &self.settings, &uri).await?;

            Ok::<_, GatewayError>(response.data.unwrap_or_default().devices)
        }
        .await;

        match result {
            Ok(devices) => devices.into_iter().map(Device::from).collect(),
            Err(e) => {
                error!("Failed to fetch Govee devices: {}", e);
                vec![]
            }
        }
    }

    /// Reads the current state of one device. Served from the state cache when
    /// a successful read for the same device happened within the TTL.
    pub async fn read_state(&self, device: &str, model: &str) -> Result<Properties, GatewayError> {
        if let Some(properties) = self.cache.get(device).await {
            debug!("State cache hit for {}", device);
            return Ok(properties);
        }

        let properties = self.read_remote_state(device, model).await?;
        self.cache.put(device, properties.clone()).await;

        Ok(properties)
    }

    async fn read_remote_state(&self, device: &str, model: &str) -> Result<Properties, GatewayError> {
        let url = url::Url::parse_with_params(
            &format!("{}/devices/state", self.settings.legacy_url),
            &[("device", device), ("model", model)],
        )?;
        let uri: Uri = url.as_str().parse()?;

        let response: StateResponse = mk_get_request(&self.client, &self.settings, &uri).await?;
        let reported = response.data.unwrap_or_default().properties;

        Ok(Properties::from_reported(&reported))
    }

    /// Reads the state of every listed device, in order, pausing between
    /// remote reads. A failed read yields `None` for that device and the batch
    /// carries on; a rate limit aborts the whole batch with no partial result.
    pub async fn read_states(&self, devices: &[DeviceRef]) -> Result<Vec<BatchEntry>, GatewayError> {
        let delay = Duration::from_millis(self.settings.batch_delay_ms);
        let mut entries = Vec::with_capacity(devices.len());

        for (idx, device_ref) in devices.iter().enumerate() {
            let cached = self.cache.get(&device_ref.device).await;

            let properties = match cached {
                Some(properties) => {
                    debug!("State cache hit for {}", device_ref.device);
                    Some(properties)
                }
                None => {
                    let result = self
                        .read_remote_state(&device_ref.device, &device_ref.model)
                        .await;

                    // Only remote reads count against the rate limit
                    if idx + 1 < devices.len() && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }

                    match result {
                        Ok(properties) => {
                            self.cache.put(&device_ref.device, properties.clone()).await;
                            Some(properties)
                        }
                        Err(e @ GatewayError::RateLimited { .. }) => return Err(e),
                        Err(e) => {
                            warn!("Error fetching state for {}: {}", device_ref.device, e);
                            None
                        }
                    }
                }
            };

            entries.push(BatchEntry {
                device: device_ref.device.clone(),
                properties,
            });
        }

        Ok(entries)
    }

    /// Delivers one control request to the endpoint its command shape selects.
    /// Does not touch the state cache.
    pub async fn send_command(&self, request: &ControlRequest) -> Result<Value, GatewayError> {
        let endpoint = request.endpoint();
        let uri = self.endpoint_uri(endpoint)?;
        let body = request.body()?;

        let response: Value =
            mk_json_request(&self.client, &self.settings, endpoint.method(), &uri, body).await?;

        if let Ok(status) = serde_json::from_value::<ControlResponseStatus>(response.clone()) {
            match status.code {
                None | Some(200) => {}
                Some(429) => return Err(GatewayError::RateLimited { retry_after: None }),
                Some(code) => {
                    let message = status.text();

                    // Codes outside the HTTP range keep their value in the message
                    let (status, message) = match u16::try_from(code) {
                        Ok(status) => (status, message),
                        Err(_) => (0, format!("code {code}: {message}")),
                    };

                    return Err(GatewayError::Client { status, message });
                }
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
pub fn test_gateway(base_url: &str) -> Gateway {
    Gateway::new(
        &crate::settings::test_govee_settings(base_url),
        crate::protocols::https::mk_test_client(),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, body_partial_json, header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::govee::{
        command::DeviceCommand,
        device::{PowerState, Rgb, Segment},
    };

    fn device_ref(device: &str, model: &str) -> DeviceRef {
        DeviceRef {
            device: device.to_string(),
            model: model.to_string(),
        }
    }

    fn state_body(power: &str, brightness: u8) -> Value {
        json!({
            "code": 200,
            "message": "Success",
            "data": {
                "device": "AA",
                "model": "H6008",
                "properties": [
                    { "online": true },
                    { "powerState": power },
                    { "brightness": brightness },
                    { "color": { "r": 255, "g": 128, "b": 0 } }
                ]
            }
        })
    }

    async fn mount_state(server: &MockServer, device: &str, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path("/v1/devices/state"))
            .and(query_param("device", device))
            .respond_with(response)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn lists_devices_without_properties() {
        let server = MockServer::start().await;
        let gateway = test_gateway(&server.uri());

        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .and(header("Govee-API-Key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "message": "Success",
                "data": {
                    "devices": [{
                        "device": "AA:BB:CC",
                        "model": "H6008",
                        "deviceName": "Desk lamp",
                        "controllable": true,
                        "retrievable": true,
                        "supportCmds": ["turn", "brightness", "color"],
                        "properties": { "colorTem": { "range": { "min": 2000, "max": 9000 } } }
                    }]
                }
            })))
            .mount(&server)
            .await;

        let devices = gateway.list_devices().await;

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device, "AA:BB:CC");
        assert_eq!(devices[0].device_name, "Desk lamp");
        assert_eq!(devices[0].support_cmds.len(), 3);
        assert!(devices[0].properties.is_none());
    }

    #[tokio::test]
    async fn listing_failure_degrades_to_empty() {
        let server = MockServer::start().await;
        let gateway = test_gateway(&server.uri());

        Mock::given(method("GET"))
            .and(path("/v1/devices"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(gateway.list_devices().await.is_empty());
    }

    #[tokio::test]
    async fn read_state_normalizes_and_caches() {
        let server = MockServer::start().await;
        let gateway = test_gateway(&server.uri());

        Mock::given(method("GET"))
            .and(path("/v1/devices/state"))
            .and(query_param("device", "AA"))
            .and(query_param("model", "H6008"))
            .respond_with(ResponseTemplate::new(200).set_body_json(state_body("on", 70)))
            .expect(1)
            .mount(&server)
            .await;

        let first = gateway.read_state("AA", "H6008").await.unwrap();
        let second = gateway.read_state("AA", "H6008").await.unwrap();

        assert_eq!(first.power_state, Some(PowerState::On));
        assert_eq!(first.brightness, Some(70));
        assert_eq!(first.color, Some(Rgb::new(255, 128, 0)));
        assert_eq!(first.online, Some(true));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn read_state_classifies_failures() {
        let server = MockServer::start().await;
        let gateway = test_gateway(&server.uri());

        mount_state(
            &server,
            "LIMITED",
            ResponseTemplate::new(429).insert_header("Retry-After", "45"),
        )
        .await;
        mount_state(&server, "BAD", ResponseTemplate::new(400).set_body_string("bad device")).await;
        mount_state(&server, "GARBLED", ResponseTemplate::new(200).set_body_string("<html>")).await;

        assert_eq!(
            gateway.read_state("LIMITED", "H6008").await,
            Err(GatewayError::RateLimited { retry_after: Some(45) })
        );
        assert_eq!(
            gateway.read_state("BAD", "H6008").await,
            Err(GatewayError::Client {
                status: 400,
                message: "bad device".to_string()
            })
        );
        assert!(matches!(
            gateway.read_state("GARBLED", "H6008").await,
            Err(GatewayError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn failed_reads_are_not_cached() {
        let server = MockServer::start().await;
        let gateway = test_gateway(&server.uri());

        Mock::given(method("GET"))
            .and(path("/v1/devices/state"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        assert!(gateway.read_state("AA", "H6008").await.is_err());
        assert!(gateway.read_state("AA", "H6008").await.is_err());
    }

    #[tokio::test]
    async fn slow_response_is_a_transport_error() {
        let server = MockServer::start().await;
        let gateway = test_gateway(&server.uri());

        mount_state(
            &server,
            "AA",
            ResponseTemplate::new(200)
                .set_body_json(state_body("on", 10))
                .set_delay(Duration::from_secs(5)),
        )
        .await;

        assert_eq!(
            gateway.read_state("AA", "H6008").await,
            Err(GatewayError::Transport("request timed out".to_string()))
        );
    }

    #[tokio::test]
    async fn batch_read_tolerates_individual_failures() {
        let server = MockServer::start().await;
        let gateway = test_gateway(&server.uri());

        mount_state(&server, "A", ResponseTemplate::new(200).set_body_json(state_body("on", 10))).await;
        mount_state(&server, "B", ResponseTemplate::new(500)).await;
        mount_state(&server, "C", ResponseTemplate::new(200).set_body_json(state_body("off", 30))).await;

        let entries = gateway
            .read_states(&[
                device_ref("A", "H6008"),
                device_ref("B", "H6008"),
                device_ref("C", "H6008"),
            ])
            .await
            .unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].properties.as_ref().unwrap().brightness, Some(10));
        assert_eq!(entries[1].device, "B");
        assert_eq!(entries[1].properties, None);
        assert_eq!(
            entries[2].properties.as_ref().unwrap().power_state,
            Some(PowerState::Off)
        );
    }

    #[tokio::test]
    async fn batch_read_aborts_on_rate_limit() {
        let server = MockServer::start().await;
        let gateway = test_gateway(&server.uri());

        mount_state(&server, "A", ResponseTemplate::new(200).set_body_json(state_body("on", 10))).await;
        mount_state(
            &server,
            "B",
            ResponseTemplate::new(429).insert_header("Retry-After", "45"),
        )
        .await;

        let result = gateway
            .read_states(&[device_ref("A", "H6008"), device_ref("B", "H6008")])
            .await;

        assert_eq!(result, Err(GatewayError::RateLimited { retry_after: Some(45) }));
    }

    #[tokio::test]
    async fn legacy_command_is_put_to_legacy_endpoint() {
        let server = MockServer::start().await;
        let gateway = test_gateway(&server.uri());

        Mock::given(method("PUT"))
            .and(path("/v1/devices/control"))
            .and(header("Govee-API-Key", "test-key"))
            .and(body_json(json!({
                "device": "AA",
                "model": "H6008",
                "cmd": { "name": "brightness", "value": 55 }
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "code": 200, "message": "Success", "data": {} })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let request = DeviceCommand::Brightness(55).translate("AA", "H6008").unwrap();
        gateway.send_command(&request[0]).await.unwrap();
    }

    #[tokio::test]
    async fn capability_command_is_posted_to_open_api() {
        let server = MockServer::start().await;
        let gateway = test_gateway(&server.uri());

        Mock::given(method("POST"))
            .and(path("/router/api/v1/device/control"))
            .and(body_partial_json(json!({
                "payload": {
                    "sku": "H6199",
                    "device": "AA",
                    "capability": { "instance": "segmentedColorRgb" }
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "requestId": "1",
                "msg": "success",
                "code": 200
            })))
            .expect(1)
            .mount(&server)
            .await;

        let requests = DeviceCommand::Segments(vec![Segment {
            color: Rgb::new(1, 2, 3),
            brightness: 50,
        }])
        .translate("AA", "H6199")
        .unwrap();

        gateway.send_command(&requests[0]).await.unwrap();
    }

    #[tokio::test]
    async fn error_code_in_body_is_a_failure() {
        let server = MockServer::start().await;
        let gateway = test_gateway(&server.uri());

        Mock::given(method("PUT"))
            .and(path("/v1/devices/control"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 400,
                "message": "Unsupported Cmd",
                "data": {}
            })))
            .mount(&server)
            .await;

        let request = DeviceCommand::Scene("movie".to_string())
            .translate("AA", "H6008")
            .unwrap();

        assert_eq!(
            gateway.send_command(&request[0]).await,
            Err(GatewayError::Client {
                status: 400,
                message: "Unsupported Cmd".to_string()
            })
        );
    }

    #[tokio::test]
    async fn out_of_range_body_code_is_still_a_failure() {
        let server = MockServer::start().await;
        let gateway = test_gateway(&server.uri());

        Mock::given(method("POST"))
            .and(path("/router/api/v1/device/control"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 70001,
                "msg": "device offline"
            })))
            .mount(&server)
            .await;

        let segments = [Segment {
            color: Rgb::new(1, 1, 1),
            brightness: 10,
        }];
        let request = DeviceCommand::Segments(segments.to_vec())
            .translate("AA", "H6199")
            .unwrap();

        assert_eq!(
            gateway.send_command(&request[0]).await,
            Err(GatewayError::Client {
                status: 0,
                message: "code 70001: device offline".to_string()
            })
        );
    }
}
