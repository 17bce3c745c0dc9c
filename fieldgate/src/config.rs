//! Configuration for the gateway.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use fieldgate_common::config::{LoggingConfig, ZenohConfig};
use fieldgate_common::topic::DEFAULT_PREFIX;

use crate::link::{Endpoint, LinkSettings};
use crate::register::RegisterClass;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Polling, command and device settings
    pub gateway: GatewaySection,

    /// Time-series store; samples are only published on the bus when absent
    #[serde(default)]
    pub influxdb: Option<InfluxConfig>,

    /// Streaming subscriber server; disabled when absent
    #[serde(default)]
    pub realtime: Option<RealtimeConfig>,
}

/// Core gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Key expression prefix for data topics (default: "modbus/gateway")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Scheduler tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Timeout for connecting and for every request, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Reconnect delay ceiling in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Topic carrying write commands
    #[serde(default = "default_command_topic")]
    pub command_topic: String,

    /// Topic for command acknowledgements (none published when unset)
    #[serde(default)]
    pub response_topic: Option<String>,

    /// Batches buffered between the lanes and the fanout task
    #[serde(default = "default_fanout_capacity")]
    pub fanout_capacity: usize,

    /// Devices to poll
    pub devices: Vec<DeviceConfig>,
}

fn default_key_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_command_topic() -> String {
    "modbus/control/command".to_string()
}

fn default_fanout_capacity() -> usize {
    64
}

/// Configuration for a single field device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable identifier, unique across the configuration
    pub id: String,

    /// Display name (used in topics and tags)
    pub name: String,

    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Register ranges, polled in this order
    #[serde(default)]
    pub registers: Vec<RegisterGroup>,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_poll_interval() -> u64 {
    10
}

/// A contiguous range of registers of one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterGroup {
    /// Register class
    #[serde(rename = "type")]
    pub class: RegisterClass,

    /// Starting address (0-based)
    pub address: u16,

    /// Number of registers to read (default: 1)
    #[serde(default = "default_count")]
    pub count: u16,
}

fn default_count() -> u16 {
    1
}

/// InfluxDB v2 connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// Base URL, e.g. "http://localhost:8086"
    pub url: String,
    pub org: String,
    pub bucket: String,

    /// API token, sent as `Authorization: Token ...`
    #[serde(default)]
    pub token: Option<String>,

    /// Measurement name (default: "modbus_data")
    #[serde(default = "default_measurement")]
    pub measurement: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_influx_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_measurement() -> String {
    "modbus_data".to_string()
}

fn default_influx_timeout_ms() -> u64 {
    5000
}

/// WebSocket server for live updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Listen address (default: "0.0.0.0:8080")
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// WebSocket path (default: "/ws/realtime")
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Key expression to subscribe to (default: every data topic under the prefix)
    #[serde(default)]
    pub subscribe_key: Option<String>,

    /// Capacity of the hand-off queue between the bus and the dispatcher
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Messages buffered per subscriber before it is evicted
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_ws_path() -> String {
    "/ws/realtime".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_subscriber_buffer() -> usize {
    64
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_ws_path(),
            subscribe_key: None,
            queue_capacity: default_queue_capacity(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json5(&content)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.zenoh.validate().map_err(ConfigError::Validation)?;

        let gateway = &self.gateway;

        if gateway.devices.is_empty() {
            return Err(ConfigError::Validation(
                "At least one device must be configured".to_string(),
            ));
        }
        if gateway.key_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Validation(
                "key_prefix cannot be empty".to_string(),
            ));
        }
        if gateway.command_topic.is_empty() {
            return Err(ConfigError::Validation(
                "command_topic cannot be empty".to_string(),
            ));
        }
        if gateway.tick_ms == 0 || gateway.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "tick_ms and request_timeout_ms must be positive".to_string(),
            ));
        }
        if gateway.backoff_initial_ms == 0 || gateway.backoff_max_ms < gateway.backoff_initial_ms
        {
            return Err(ConfigError::Validation(
                "backoff_max_ms must be at least backoff_initial_ms, which must be positive"
                    .to_string(),
            ));
        }
        if gateway.fanout_capacity == 0 {
            return Err(ConfigError::Validation(
                "fanout_capacity must be positive".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for device in &gateway.devices {
            device.validate()?;
            if !ids.insert(device.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate device id '{}'",
                    device.id
                )));
            }
        }

        if let Some(influx) = &self.influxdb {
            for (field, value) in [
                ("url", &influx.url),
                ("org", &influx.org),
                ("bucket", &influx.bucket),
                ("measurement", &influx.measurement),
            ] {
                if value.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "influxdb.{} cannot be empty",
                        field
                    )));
                }
            }
        }

        if let Some(realtime) = &self.realtime {
            if !realtime.path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "realtime.path '{}' must start with '/'",
                    realtime.path
                )));
            }
            if realtime.queue_capacity == 0 || realtime.subscriber_buffer == 0 {
                return Err(ConfigError::Validation(
                    "realtime queue_capacity and subscriber_buffer must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl GatewaySection {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

/// Characters a device name cannot carry into a Zenoh key expression.
const NAME_FORBIDDEN: [char; 5] = ['/', '*', '$', '#', '?'];

impl DeviceConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::Validation(
                "Device id cannot be empty".to_string(),
            ));
        }
        if self.name.is_empty() || self.name.contains(NAME_FORBIDDEN) {
            return Err(ConfigError::Validation(format!(
                "Device '{}': name must be non-empty and contain none of / * $ # ?",
                self.id
            )));
        }
        if self.host.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Device '{}': host cannot be empty",
                self.id
            )));
        }
        if !(1..=247).contains(&self.unit_id) {
            return Err(ConfigError::Validation(format!(
                "Device '{}': unit_id must be 1-247",
                self.id
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(format!(
                "Device '{}': poll_interval_secs must be at least 1",
                self.id
            )));
        }
        if self.registers.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Device '{}': at least one register group is required",
                self.id
            )));
        }

        for group in &self.registers {
            let max = group.class.max_read_count();
            if group.count == 0 || group.count > max {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': {} count {} at address {} must be 1-{}",
                    self.id, group.class, group.count, group.address, max
                )));
            }
            if u32::from(group.address) + u32::from(group.count) > 0x1_0000 {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': {} range at {} overruns the address space",
                    self.id, group.class, group.address
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TANK: &str = r#"{
        zenoh: { mode: "peer" },
        gateway: {
            devices: [
                {
                    id: "tank-1",
                    name: "Tank1",
                    host: "192.168.1.10",
                    poll_interval_secs: 5,
                    registers: [
                        { type: "holding_registers", address: 10, count: 2 }
                    ]
                }
            ]
        }
    }"#;

    #[test]
    fn test_parse_defaults() {
        let config = GatewayConfig::from_json5(TANK).unwrap();
        let gateway = &config.gateway;

        assert_eq!(gateway.key_prefix, "modbus/gateway");
        assert_eq!(gateway.command_topic, "modbus/control/command");
        assert_eq!(gateway.tick(), Duration::from_secs(1));
        assert!(gateway.response_topic.is_none());

        let device = &gateway.devices[0];
        assert_eq!(device.port, 502);
        assert_eq!(device.unit_id, 1);
        assert_eq!(device.poll_interval(), Duration::from_secs(5));
        assert_eq!(device.endpoint().to_string(), "192.168.1.10:502");
        assert_eq!(
            device.registers[0],
            RegisterGroup {
                class: RegisterClass::HoldingRegister,
                address: 10,
                count: 2
            }
        );

        let link = gateway.link_settings();
        assert_eq!(link.backoff_initial, Duration::from_secs(1));
        assert_eq!(link.backoff_max, Duration::from_secs(30));

        assert!(config.influxdb.is_none());
        assert!(config.realtime.is_none());
    }

    #[test]
    fn test_parse_optional_sections() {
        let json = r#"{
            gateway: {
                response_topic: "modbus/control/response",
                devices: [
                    {
                        id: "plc", name: "PLC", host: "plc.local", port: 5020, unit_id: 3,
                        registers: [ { type: "coil", address: 0, count: 16 } ]
                    }
                ]
            },
            influxdb: { url: "http://localhost:8086", org: "plant", bucket: "modbus", token: "secret" },
            realtime: { listen: "127.0.0.1:9000", queue_capacity: 8 }
        }"#;

        let config = GatewayConfig::from_json5(json).unwrap();

        let influx = config.influxdb.unwrap();
        assert_eq!(influx.measurement, "modbus_data");
        assert_eq!(influx.token.as_deref(), Some("secret"));

        let realtime = config.realtime.unwrap();
        assert_eq!(realtime.listen.port(), 9000);
        assert_eq!(realtime.path, "/ws/realtime");
        assert_eq!(realtime.queue_capacity, 8);
        assert_eq!(realtime.subscriber_buffer, 64);
    }

    #[test]
    fn test_validate_empty_devices() {
        let json = r#"{ gateway: { devices: [] } }"#;
        assert!(matches!(
            GatewayConfig::from_json5(json),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let mut config = GatewayConfig::from_json5(TANK).unwrap();
        let copy = config.gateway.devices[0].clone();
        config.gateway.devices.push(copy);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_name_is_a_key_chunk() {
        let mut config = GatewayConfig::from_json5(TANK).unwrap();
        for name in ["Tank/1", "Tank#1", "Tank*", "$Tank", "Tank?"] {
            config.gateway.devices[0].name = name.to_string();
            assert!(config.validate().is_err(), "name {} should be rejected", name);
        }
        config.gateway.devices[0].name = "Tank_1-A".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_unit_id_range() {
        let mut config = GatewayConfig::from_json5(TANK).unwrap();
        config.gateway.devices[0].unit_id = 0;
        assert!(config.validate().is_err());
        config.gateway.devices[0].unit_id = 248;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_register_counts() {
        let mut config = GatewayConfig::from_json5(TANK).unwrap();
        config.gateway.devices[0].registers[0].count = 126;
        assert!(config.validate().is_err());

        config.gateway.devices[0].registers[0] = RegisterGroup {
            class: RegisterClass::Coil,
            address: 0,
            count: 2000,
        };
        assert!(config.validate().is_ok());

        config.gateway.devices[0].registers[0].address = 65000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_interval() {
        let mut config = GatewayConfig::from_json5(TANK).unwrap();
        config.gateway.devices[0].poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_influx_fields() {
        let mut config = GatewayConfig::from_json5(TANK).unwrap();
        config.influxdb = Some(InfluxConfig {
            url: "http://localhost:8086".to_string(),
            org: String::new(),
            bucket: "modbus".to_string(),
            token: None,
            measurement: default_measurement(),
            timeout_ms: 1000,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldgate.json5");
        std::fs::write(&path, TANK).unwrap();

        let config = GatewayConfig::load_from_file(&path).unwrap();
        assert_eq!(config.gateway.devices[0].name, "Tank1");

        assert!(matches!(
            GatewayConfig::load_from_file(dir.path().join("missing.json5")),
            Err(ConfigError::Io(_))
        ));
    }
}
