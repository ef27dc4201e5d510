//! Configuration types for the transport and bridge
//!
//! The configuration is read once at startup and frozen afterwards. Every
//! field has a default so a partial JSON file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::address::MacAddress;
use crate::error::{NowMqttError, Result};
use crate::mqtt::Qos;

/// Maximum data bytes carried by one ESP-NOW frame
pub const ESPNOW_MAX_DATA_LEN: usize = 250;

/// Frame envelope magic number ("NM")
pub const FRAME_MAGIC: u16 = 0x4E4D;

/// Current frame envelope version
pub const FRAME_VERSION: u8 = 1;

/// Envelope size: magic + version + kind + length
pub const FRAME_HEADER_LEN: usize = 6;

/// Largest payload that fits one frame
pub const MAX_PAYLOAD_LEN: usize = ESPNOW_MAX_DATA_LEN - FRAME_HEADER_LEN;

/// Lowest valid 2.4 GHz WiFi channel
pub const MIN_WIFI_CHANNEL: u8 = 1;

/// Highest valid 2.4 GHz WiFi channel
pub const MAX_WIFI_CHANNEL: u8 = 14;

/// Default radio channel
pub const DEFAULT_WIFI_CHANNEL: u8 = 1;

/// Default wait for a delivery callback
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 1000;

/// Default capacity of the pending send table
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Default silence before a device is marked offline
pub const DEFAULT_LIVENESS_TIMEOUT_SECS: u64 = 300;

/// Default period of the liveness sweep
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default UDP port for channel 0 of the emulated radio
pub const DEFAULT_RADIO_BASE_PORT: u16 = 47000;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NowMqttConfig {
    /// Transport (sender) settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Bridge (receiver/MQTT) settings
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// MQTT broker connection
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Emulated radio settings
    #[serde(default)]
    pub radio: RadioConfig,

    /// Channel reported by an independent network connection, if any
    #[serde(default)]
    pub station_channel: Option<u8>,
}

impl NowMqttConfig {
    /// Reject values the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        check_channel("transport.wifi_channel", self.transport.wifi_channel)?;
        check_channel("bridge.wifi_channel", self.bridge.wifi_channel)?;
        if let Some(channel) = self.station_channel {
            check_channel("station_channel", channel)?;
        }

        if self.transport.max_in_flight == 0 {
            return Err(NowMqttError::InvalidConfig(
                "transport.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.transport.queue_size == 0 {
            return Err(NowMqttError::InvalidConfig(
                "transport.queue_size must be at least 1".to_string(),
            ));
        }
        if self.transport.send_timeout.is_zero() {
            return Err(NowMqttError::InvalidConfig(
                "transport.send_timeout must be positive".to_string(),
            ));
        }
        if self.bridge.liveness_timeout.is_zero() || self.bridge.sweep_interval.is_zero() {
            return Err(NowMqttError::InvalidConfig(
                "bridge.liveness_timeout and bridge.sweep_interval must be positive".to_string(),
            ));
        }
        if self.bridge.topic_prefix.is_empty() || self.bridge.topic_prefix.contains(['+', '#']) {
            return Err(NowMqttError::InvalidConfig(format!(
                "bridge.topic_prefix '{}' is not a valid topic level",
                self.bridge.topic_prefix
            )));
        }
        Ok(())
    }
}

fn check_channel(field: &str, channel: u8) -> Result<()> {
    if (MIN_WIFI_CHANNEL..=MAX_WIFI_CHANNEL).contains(&channel) {
        Ok(())
    } else {
        Err(NowMqttError::InvalidConfig(format!(
            "{} = {} is outside {}..={}",
            field, channel, MIN_WIFI_CHANNEL, MAX_WIFI_CHANNEL
        )))
    }
}

/// Transport (sender side) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Fallback radio channel
    #[serde(default = "default_wifi_channel")]
    pub wifi_channel: u8,

    /// Extended-range PHY
    #[serde(default = "default_true")]
    pub long_range_mode: bool,

    /// Wait for a delivery callback before failing the send
    #[serde(with = "humantime_serde", default = "default_send_timeout")]
    pub send_timeout: Duration,

    /// Sends that may be pending in the driver at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Capacity of the submission queue
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            wifi_channel: DEFAULT_WIFI_CHANNEL,
            long_range_mode: true,
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            queue_size: 32,
        }
    }
}

/// Bridge (receiver side) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Fallback radio channel for bridge-only deployments
    #[serde(default = "default_wifi_channel")]
    pub wifi_channel: u8,

    /// Publish online/offline per device
    #[serde(default = "default_true")]
    pub publish_availability: bool,

    /// Silence after which a device is considered offline
    #[serde(with = "humantime_serde", default = "default_liveness_timeout")]
    pub liveness_timeout: Duration,

    /// Period of the liveness sweep
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,

    /// Root of data, status and state topics
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// QoS of every publication
    #[serde(default = "default_qos")]
    pub qos: Qos,

    /// Publish Home Assistant discovery documents
    #[serde(default = "default_true")]
    pub discovery: bool,

    /// Root of discovery topics
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    /// Re-announce an entity after this long
    #[serde(with = "humantime_serde", default = "default_discovery_refresh")]
    pub discovery_refresh: Duration,

    /// Announcement cache capacity
    #[serde(default = "default_max_discovery_entries")]
    pub max_discovery_entries: usize,

    /// Publications held while the broker is unreachable
    #[serde(default = "default_outbox_size")]
    pub outbox_size: usize,

    /// Peers listed as `unknown` before their first frame
    #[serde(default)]
    pub known_peers: Vec<MacAddress>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            wifi_channel: DEFAULT_WIFI_CHANNEL,
            publish_availability: true,
            liveness_timeout: Duration::from_secs(DEFAULT_LIVENESS_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            topic_prefix: default_topic_prefix(),
            qos: default_qos(),
            discovery: true,
            discovery_prefix: default_discovery_prefix(),
            discovery_refresh: Duration::from_secs(3600),
            max_discovery_entries: 512,
            outbox_size: 256,
            known_peers: Vec::new(),
        }
    }
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client id (generated when absent)
    #[serde(default)]
    pub client_id: Option<String>,

    /// Username
    #[serde(default)]
    pub username: Option<String>,

    /// Password
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
        }
    }
}

impl MqttConfig {
    /// Client id, generating one when none is configured
    pub fn client_id_or_generate(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("now_mqtt_{}", uuid::Uuid::new_v4().simple()))
    }
}

/// Emulated radio (UDP) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Local bind address
    #[serde(default = "default_radio_bind")]
    pub bind: String,

    /// Destination used for broadcast frames
    #[serde(default = "default_radio_broadcast")]
    pub broadcast: String,

    /// Port of channel 0; channel N listens on `base_port + N`
    #[serde(default = "default_radio_base_port")]
    pub base_port: u16,

    /// Own radio address (random when absent)
    #[serde(default)]
    pub address: Option<MacAddress>,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            bind: default_radio_bind(),
            broadcast: default_radio_broadcast(),
            base_port: DEFAULT_RADIO_BASE_PORT,
            address: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_wifi_channel() -> u8 {
    DEFAULT_WIFI_CHANNEL
}

fn default_send_timeout() -> Duration {
    Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS)
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_queue_size() -> usize {
    32
}

fn default_liveness_timeout() -> Duration {
    Duration::from_secs(DEFAULT_LIVENESS_TIMEOUT_SECS)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS)
}

fn default_topic_prefix() -> String {
    "now_mqtt".to_string()
}

fn default_qos() -> Qos {
    Qos::AtLeastOnce
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_discovery_refresh() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_discovery_entries() -> usize {
    512
}

fn default_outbox_size() -> usize {
    256
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_radio_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_radio_broadcast() -> String {
    "255.255.255.255".to_string()
}

fn default_radio_base_port() -> u16 {
    DEFAULT_RADIO_BASE_PORT
}

/// Builder for NowMqttConfig
#[derive(Debug, Default)]
pub struct NowMqttConfigBuilder {
    config: NowMqttConfig,
}

impl NowMqttConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the same fallback channel for transport and bridge
    pub fn wifi_channel(mut self, channel: u8) -> Self {
        self.config.transport.wifi_channel = channel;
        self.config.bridge.wifi_channel = channel;
        self
    }

    /// Set the transport fallback channel
    pub fn transport_channel(mut self, channel: u8) -> Self {
        self.config.transport.wifi_channel = channel;
        self
    }

    /// Set the bridge fallback channel
    pub fn bridge_channel(mut self, channel: u8) -> Self {
        self.config.bridge.wifi_channel = channel;
        self
    }

    /// Enable or disable long range mode
    pub fn long_range_mode(mut self, enabled: bool) -> Self {
        self.config.transport.long_range_mode = enabled;
        self
    }

    /// Set the delivery callback timeout
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.send_timeout = timeout;
        self
    }

    /// Set the pending send table capacity
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.config.transport.max_in_flight = max;
        self
    }

    /// Enable or disable availability publication
    pub fn publish_availability(mut self, enabled: bool) -> Self {
        self.config.bridge.publish_availability = enabled;
        self
    }

    /// Set the liveness timeout
    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.config.bridge.liveness_timeout = timeout;
        self
    }

    /// Set the liveness sweep period
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.bridge.sweep_interval = interval;
        self
    }

    /// Enable or disable discovery documents
    pub fn discovery(mut self, enabled: bool) -> Self {
        self.config.bridge.discovery = enabled;
        self
    }

    /// Set the topic prefix
    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.bridge.topic_prefix = prefix.into();
        self
    }

    /// Set the QoS of every publication
    pub fn qos(mut self, qos: Qos) -> Self {
        self.config.bridge.qos = qos;
        self
    }

    /// Add a peer to register at bridge startup
    pub fn known_peer(mut self, address: MacAddress) -> Self {
        self.config.bridge.known_peers.push(address);
        self
    }

    /// Set the MQTT broker address
    pub fn mqtt_broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.mqtt.host = host.into();
        self.config.mqtt.port = port;
        self
    }

    /// Set the independent channel source
    pub fn station_channel(mut self, channel: Option<u8>) -> Self {
        self.config.station_channel = channel;
        self
    }

    /// Build the configuration
    pub fn build(self) -> NowMqttConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NowMqttConfig::default();
        assert_eq!(config.transport.wifi_channel, 1);
        assert!(config.transport.long_range_mode);
        assert_eq!(config.bridge.wifi_channel, 1);
        assert!(config.bridge.publish_availability);
        assert_eq!(config.bridge.liveness_timeout, Duration::from_secs(300));
        assert_eq!(config.bridge.qos, Qos::AtLeastOnce);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_payload_budget() {
        assert_eq!(MAX_PAYLOAD_LEN, 244);
    }

    #[test]
    fn test_config_builder() {
        let config = NowMqttConfigBuilder::new()
            .wifi_channel(6)
            .long_range_mode(false)
            .publish_availability(false)
            .station_channel(Some(3))
            .build();

        assert_eq!(config.transport.wifi_channel, 6);
        assert_eq!(config.bridge.wifi_channel, 6);
        assert!(!config.transport.long_range_mode);
        assert!(!config.bridge.publish_availability);
        assert_eq!(config.station_channel, Some(3));
    }

    #[test]
    fn test_validate_rejects_bad_channel() {
        let config = NowMqttConfigBuilder::new().transport_channel(15).build();
        assert!(matches!(
            config.validate(),
            Err(NowMqttError::InvalidConfig(_))
        ));

        let config = NowMqttConfigBuilder::new().station_channel(Some(0)).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = NowMqttConfigBuilder::new().max_in_flight(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{
            "transport": { "wifi_channel": 6, "send_timeout": "250ms" },
            "bridge": { "liveness_timeout": "2m", "publish_availability": false, "qos": "exactly_once" },
            "mqtt": { "host": "broker.local" }
        }"#;
        let config: NowMqttConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.transport.wifi_channel, 6);
        assert!(config.transport.long_range_mode);
        assert_eq!(config.transport.send_timeout, Duration::from_millis(250));
        assert_eq!(config.bridge.liveness_timeout, Duration::from_secs(120));
        assert!(!config.bridge.publish_availability);
        assert_eq!(config.bridge.qos, Qos::ExactlyOnce);
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
    }

    #[test]
    fn test_generated_client_id() {
        let config = MqttConfig::default();
        assert!(config.client_id_or_generate().starts_with("now_mqtt_"));
    }
}
