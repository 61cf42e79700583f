use serde::Deserialize;

fn default_legacy_url() -> String {
    "https://developer-api.govee.com/v1".to_string()
}

fn default_open_api_url() -> String {
    "https://openapi.api.govee.com/router/api/v1".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    10
}

fn default_state_cache_ttl_seconds() -> u64 {
    30
}

fn default_batch_delay_ms() -> u64 {
    200
}

fn default_poll_interval_seconds() -> u64 {
    300
}

fn default_retry_after_seconds() -> u64 {
    60
}

fn default_list_retry_seconds() -> u64 {
    10
}

fn default_group_topic_refresh() -> String {
    "govee/group/{id}/refresh".to_string()
}

#[derive(Clone, Deserialize, Debug)]
pub struct GoveeSettings {
    pub api_key: String,

    #[serde(default = "default_legacy_url")]
    pub legacy_url: String,

    #[serde(default = "default_open_api_url")]
    pub open_api_url: String,

    /// PEM encoded CA certificate(s). When set, replaces the platform trust
    /// roots, e.g. for deployments behind a TLS intercepting proxy.
    pub ca_cert: Option<String>,

    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    #[serde(default = "default_state_cache_ttl_seconds")]
    pub state_cache_ttl_seconds: u64,

    /// Pause between remote reads within one batch refresh
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

#[derive(Clone, Deserialize, Debug)]
pub struct SyncSettings {
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    /// Cooldown used when a rate limit response carries no retry hint
    #[serde(default = "default_retry_after_seconds")]
    pub default_retry_after_seconds: u64,

    /// How soon to list devices again while the device list is empty
    #[serde(default = "default_list_retry_seconds")]
    pub list_retry_seconds: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            poll_interval_seconds: default_poll_interval_seconds(),
            default_retry_after_seconds: default_retry_after_seconds(),
            list_retry_seconds: default_list_retry_seconds(),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct MqttSettings {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub light_topic: String,
    pub light_topic_set: String,
    pub group_topic_set: String,

    #[serde(default = "default_group_topic_refresh")]
    pub group_topic_refresh: String,

    pub status_topic: String,
}

#[derive(Clone, Deserialize, Debug)]
pub struct ApiSettings {
    pub bind: String,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct GroupSettings {
    pub id: String,
    pub name: String,
    pub devices: Vec<String>,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Settings {
    pub govee: GoveeSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    pub mqtt: MqttSettings,
    pub api: Option<ApiSettings>,

    #[serde(default)]
    pub groups: Vec<GroupSettings>,
}

impl Settings {
    pub fn group(&self, id: &str) -> Option<&GroupSettings> {
        self.groups.iter().find(|group| group.id == id)
    }
}

pub fn read_settings() -> Result<Settings, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::with_name("Settings"))
        .add_source(config::Environment::with_prefix("GOVEE_MQTT").separator("__"))
        .build()?
        .try_deserialize::<Settings>()
}

#[cfg(test)]
pub fn test_govee_settings(base_url: &str) -> GoveeSettings {
    GoveeSettings {
        api_key: "test-key".to_string(),
        legacy_url: format!("{base_url}/v1"),
        open_api_url: format!("{base_url}/router/api/v1"),
        ca_cert: None,
        request_timeout_seconds: 2,
        state_cache_ttl_seconds: 30,
        batch_delay_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use config::{Config, File, FileFormat};

    use super::*;

    const MINIMAL: &str = r#"
        [govee]
        api_key = "abc"

        [mqtt]
        id = "govee-mqtt"
        host = "localhost"
        port = 1883
        light_topic = "govee/light/{id}"
        light_topic_set = "govee/light/{id}/set"
        group_topic_set = "govee/group/{id}/set"
        status_topic = "govee/status"

        [[groups]]
        id = "living-room"
        name = "Living room"
        devices = ["AA:BB", "CC:DD"]
    "#;

    fn parse(source: &str) -> Settings {
        Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn fills_in_defaults() {
        let settings = parse(MINIMAL);

        assert_eq!(settings.govee.api_key, "abc");
        assert_eq!(settings.govee.legacy_url, "https://developer-api.govee.com/v1");
        assert_eq!(settings.govee.state_cache_ttl_seconds, 30);
        assert_eq!(settings.govee.batch_delay_ms, 200);
        assert_eq!(settings.govee.request_timeout_seconds, 10);
        assert_eq!(settings.sync.poll_interval_seconds, 300);
        assert_eq!(settings.sync.default_retry_after_seconds, 60);
        assert_eq!(settings.sync.list_retry_seconds, 10);
        assert_eq!(settings.mqtt.group_topic_refresh, "govee/group/{id}/refresh");
        assert!(settings.api.is_none());
    }

    #[test]
    fn looks_up_groups_by_id() {
        let settings = parse(MINIMAL);

        let group = settings.group("living-room").unwrap();
        assert_eq!(group.devices, vec!["AA:BB".to_string(), "CC:DD".to_string()]);
        assert!(settings.group("kitchen").is_none());
    }
}
