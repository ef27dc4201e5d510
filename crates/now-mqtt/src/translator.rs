//! Radio frame → MQTT publication translation
//!
//! [`BridgeTranslator`] is the pure core of the bridge. It takes one
//! [`Reception`] at a time and returns the publications it implies, in the
//! order they must be published:
//!
//! 1. availability (`online`) if the sender just came online
//! 2. for sensor readings: the discovery document when due, then the state
//! 3. for data frames: the raw payload
//!
//! Malformed frames produce nothing, are counted, and do not refresh the
//! sender's liveness.
//!
//! # Topics
//!
//! | Topic | Payload | Retain |
//! |---|---|---|
//! | `<prefix>/<addr>/data` | raw payload | no |
//! | `<prefix>/<addr>/status` | `online` / `offline` | yes |
//! | `<prefix>/<addr>/<component>/<object_id>/state` | reading state | yes |
//! | `<discovery_prefix>/<component>/<addr>/<object_id>/config` | discovery JSON | yes |
//!
//! `<addr>` is the sender address as twelve lower-case hex digits.

use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::address::MacAddress;
use crate::availability::{AvailabilityTracker, AvailabilityTransition};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::frame::{Component, Frame, FrameKind, SensorReading};
use crate::mqtt::{MqttPublication, Qos};
use crate::radio::Reception;

/// Manufacturer reported in discovery documents
const DISCOVERY_MANUFACTURER: &str = "espressif";

/// Builds topic names for a bridge instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    prefix: String,
    discovery_prefix: String,
}

impl TopicScheme {
    /// Create a scheme with explicit prefixes
    pub fn new(prefix: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            discovery_prefix: discovery_prefix.into(),
        }
    }

    /// Create from bridge configuration
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(&config.topic_prefix, &config.discovery_prefix)
    }

    /// Raw data topic
    pub fn data(&self, address: &MacAddress) -> String {
        format!("{}/{}/data", self.prefix, address.topic_key())
    }

    /// Availability topic
    pub fn status(&self, address: &MacAddress) -> String {
        format!("{}/{}/status", self.prefix, address.topic_key())
    }

    /// State topic of one entity
    pub fn state(&self, address: &MacAddress, component: Component, object_id: &str) -> String {
        format!(
            "{}/{}/{}/{}/state",
            self.prefix,
            address.topic_key(),
            component.as_str(),
            object_id
        )
    }

    /// Discovery topic of one entity
    pub fn discovery(&self, address: &MacAddress, component: Component, object_id: &str) -> String {
        format!(
            "{}/{}/{}/{}/config",
            self.discovery_prefix,
            component.discovery_component(),
            address.topic_key(),
            object_id
        )
    }
}

/// Translator counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslatorStats {
    /// Receptions handled
    pub frames_received: u64,
    /// Receptions dropped as malformed
    pub malformed_dropped: u64,
    /// Raw data publications
    pub data_published: u64,
    /// State publications
    pub readings_published: u64,
    /// Discovery documents
    pub discovery_published: u64,
    /// Availability publications
    pub availability_published: u64,
}

#[derive(Serialize)]
struct DiscoveryDevice<'a> {
    ids: [String; 1],
    name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    sw: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    mdl: &'a str,
    mf: &'static str,
}

#[derive(Serialize)]
struct DiscoveryDocument<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dev_cla: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stat_cla: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_meas: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
    stat_t: String,
    uniq_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    avty_t: Option<String>,
    dev: DiscoveryDevice<'a>,
}

type EntityKey = (MacAddress, Component, String);

/// Turns receptions into MQTT publications
pub struct BridgeTranslator {
    topics: TopicScheme,
    tracker: AvailabilityTracker,
    publish_availability: bool,
    qos: Qos,
    discovery: bool,
    discovery_refresh: Duration,
    /// When each entity was last announced
    announced: LruCache<EntityKey, Instant>,
    stats: TranslatorStats,
}

impl BridgeTranslator {
    /// Create from bridge configuration
    pub fn from_config(config: &BridgeConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.max_discovery_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            topics: TopicScheme::from_config(config),
            tracker: AvailabilityTracker::from_config(config),
            publish_availability: config.publish_availability,
            qos: config.qos,
            discovery: config.discovery,
            discovery_refresh: config.discovery_refresh,
            announced: LruCache::new(capacity),
            stats: TranslatorStats::default(),
        }
    }

    /// Translate one reception
    pub fn handle(&mut self, reception: &Reception, now: Instant) -> Vec<MqttPublication> {
        self.stats.frames_received += 1;
        let source = reception.source;

        let decoded = Frame::decode(&reception.data).and_then(|frame| match frame.kind {
            FrameKind::Data => Ok((frame, None)),
            FrameKind::Reading => frame.as_reading().map(|r| (frame, Some(r))),
        });
        let (frame, reading) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats.malformed_dropped += 1;
                debug!(%source, code = e.error_code(), "Dropping frame: {}", e);
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        if let Some(transition) = self.tracker.observe(source, now) {
            out.extend(self.availability_publication(&transition));
        }

        match reading {
            Some(reading) => {
                self.tracker.set_name(source, &reading.node);
                if let Some(discovery) = self.discovery_publication(&source, &reading, now) {
                    out.push(discovery);
                }
                out.push(MqttPublication::new(
                    self.topics
                        .state(&source, reading.component, &reading.object_id),
                    reading.state,
                    self.qos,
                    true,
                ));
                self.stats.readings_published += 1;
            }
            None => {
                out.push(MqttPublication::new(
                    self.topics.data(&source),
                    frame.payload,
                    self.qos,
                    false,
                ));
                self.stats.data_published += 1;
            }
        }

        trace!(%source, publications = out.len(), "Frame translated");
        out
    }

    /// Run the liveness sweep, returning the `offline` publications
    pub fn sweep(&mut self, now: Instant) -> Vec<MqttPublication> {
        self.tracker
            .sweep(now)
            .iter()
            .filter_map(|t| self.availability_publication(t))
            .collect()
    }

    /// List a peer as `unknown` until its first frame arrives
    pub fn register_peer(&mut self, address: MacAddress, now: Instant) -> bool {
        self.tracker.register(address, now)
    }

    /// Availability state of all peers
    pub fn tracker(&self) -> &AvailabilityTracker {
        &self.tracker
    }

    /// Topic builder in use
    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Counters
    pub fn stats(&self) -> &TranslatorStats {
        &self.stats
    }

    fn availability_publication(
        &mut self,
        transition: &AvailabilityTransition,
    ) -> Option<MqttPublication> {
        if !self.publish_availability {
            return None;
        }
        self.stats.availability_published += 1;
        Some(MqttPublication::new(
            self.topics.status(&transition.address),
            transition.to.as_str(),
            self.qos,
            true,
        ))
    }

    fn discovery_publication(
        &mut self,
        source: &MacAddress,
        reading: &SensorReading,
        now: Instant,
    ) -> Option<MqttPublication> {
        if !self.discovery {
            return None;
        }

        let key = (*source, reading.component, reading.object_id.clone());
        if let Some(at) = self.announced.get(&key) {
            if now.saturating_duration_since(*at) < self.discovery_refresh {
                return None;
            }
        }

        match self.discovery_document(source, reading) {
            Ok(publication) => {
                self.announced.put(key, now);
                self.stats.discovery_published += 1;
                Some(publication)
            }
            Err(e) => {
                warn!(%source, object_id = %reading.object_id, "Discovery document: {}", e);
                None
            }
        }
    }

    fn discovery_document(
        &self,
        source: &MacAddress,
        reading: &SensorReading,
    ) -> Result<MqttPublication> {
        let document = DiscoveryDocument {
            name: &reading.object_id,
            dev_cla: reading.device_class.as_deref(),
            stat_cla: reading.state_class.as_deref(),
            unit_of_meas: reading.unit.as_deref(),
            icon: reading.icon.as_deref(),
            stat_t: self
                .topics
                .state(source, reading.component, &reading.object_id),
            uniq_id: format!("{}_{}", source.topic_key(), reading.object_id),
            avty_t: self
                .publish_availability
                .then(|| self.topics.status(source)),
            dev: DiscoveryDevice {
                ids: [source.topic_key()],
                name: &reading.node,
                sw: &reading.sw_version,
                mdl: &reading.model,
                mf: DISCOVERY_MANUFACTURER,
            },
        };

        Ok(MqttPublication::new(
            self.topics
                .discovery(source, reading.component, &reading.object_id),
            serde_json::to_vec(&document)?,
            self.qos,
            true,
        ))
    }
}

impl std::fmt::Debug for BridgeTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeTranslator")
            .field("topics", &self.topics)
            .field("peers", &self.tracker.len())
            .field("announced", &self.announced.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const PEER: MacAddress = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);

    fn reception(frame: &Frame) -> Reception {
        Reception {
            source: PEER,
            data: frame.encode(),
        }
    }

    fn temperature() -> SensorReading {
        SensorReading::sensor("Garden Node", "Temperature", 21.456, 1)
            .device_class("temperature")
            .state_class("measurement")
            .unit("°C")
            .firmware("2024.6.0", "esp32dev")
    }

    #[test]
    fn test_topics() {
        let topics = TopicScheme::new("now_mqtt", "homeassistant");
        assert_eq!(topics.data(&PEER), "now_mqtt/aabbccddee01/data");
        assert_eq!(topics.status(&PEER), "now_mqtt/aabbccddee01/status");
        assert_eq!(
            topics.state(&PEER, Component::TextSensor, "version"),
            "now_mqtt/aabbccddee01/text_sensor/version/state"
        );
        assert_eq!(
            topics.discovery(&PEER, Component::TextSensor, "version"),
            "homeassistant/sensor/aabbccddee01/version/config"
        );
    }

    #[test]
    fn test_data_frame() {
        let mut translator = BridgeTranslator::from_config(&BridgeConfig::default());
        let frame = Frame::data(Bytes::from_static(b"hello")).unwrap();

        let out = translator.handle(&reception(&frame), Instant::now());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].topic, "now_mqtt/aabbccddee01/status");
        assert_eq!(out[0].payload_str(), Some("online"));
        assert!(out[0].retain);
        assert_eq!(out[1].topic, "now_mqtt/aabbccddee01/data");
        assert_eq!(&out[1].payload[..], b"hello");
        assert!(!out[1].retain);

        // second frame: no availability repeat
        let out = translator.handle(&reception(&frame), Instant::now());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_reading_with_discovery() {
        let mut translator = BridgeTranslator::from_config(&BridgeConfig::default());
        let frame = Frame::reading(&temperature()).unwrap();
        let t0 = Instant::now();

        let out = translator.handle(&reception(&frame), t0);
        assert_eq!(out.len(), 3);
        assert_eq!(
            out[1].topic,
            "homeassistant/sensor/aabbccddee01/temperature/config"
        );
        assert_eq!(
            out[2].topic,
            "now_mqtt/aabbccddee01/sensor/temperature/state"
        );
        assert_eq!(out[2].payload_str(), Some("21.5"));

        let doc: serde_json::Value = serde_json::from_slice(&out[1].payload).unwrap();
        assert_eq!(doc["uniq_id"], "aabbccddee01_temperature");
        assert_eq!(doc["dev_cla"], "temperature");
        assert_eq!(doc["unit_of_meas"], "°C");
        assert_eq!(doc["stat_t"], "now_mqtt/aabbccddee01/sensor/temperature/state");
        assert_eq!(doc["avty_t"], "now_mqtt/aabbccddee01/status");
        assert_eq!(doc["dev"]["name"], "garden_node");
        assert_eq!(doc["dev"]["mf"], "espressif");
        assert_eq!(doc["dev"]["mdl"], "esp32dev");
        assert!(doc.get("icon").is_none());

        assert_eq!(
            translator.tracker().get(&PEER).unwrap().name.as_deref(),
            Some("garden_node")
        );

        // announced once until the refresh period passes
        let out = translator.handle(&reception(&frame), t0 + Duration::from_secs(60));
        assert_eq!(out.len(), 1);
        let out = translator.handle(&reception(&frame), t0 + Duration::from_secs(3601));
        assert_eq!(out.len(), 2);
        assert_eq!(translator.stats().discovery_published, 2);
    }

    #[test]
    fn test_reading_with_unsafe_identifiers_dropped() {
        let mut translator = BridgeTranslator::from_config(&BridgeConfig::default());
        let t0 = Instant::now();

        for (node, object_id) in [("garden", "temp#"), ("garden/+", "temperature")] {
            let reading = SensorReading {
                node: node.to_string(),
                object_id: object_id.to_string(),
                ..temperature()
            };
            let frame = Frame::reading(&reading).unwrap();
            assert!(translator.handle(&reception(&frame), t0).is_empty());
        }
        assert_eq!(translator.stats().malformed_dropped, 2);
        assert!(translator.tracker().get(&PEER).is_none());

        // every topic built from an accepted reading is publishable
        let frame = Frame::reading(&temperature()).unwrap();
        let out = translator.handle(&reception(&frame), t0);
        assert_eq!(out.len(), 3);
        for publication in &out {
            assert!(crate::mqtt::validate_topic(&publication.topic).is_ok());
        }
    }

    #[test]
    fn test_discovery_and_availability_disabled() {
        let config = BridgeConfig {
            discovery: false,
            publish_availability: false,
            ..BridgeConfig::default()
        };
        let mut translator = BridgeTranslator::from_config(&config);
        let frame = Frame::reading(&SensorReading::binary_sensor("node", "Door", true)).unwrap();
        let t0 = Instant::now();

        let out = translator.handle(&reception(&frame), t0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic, "now_mqtt/aabbccddee01/binary_sensor/door/state");
        assert_eq!(out[0].payload_str(), Some("ON"));

        // state is still tracked
        assert!(translator.sweep(t0 + Duration::from_secs(301)).is_empty());
        assert_eq!(translator.tracker().online_count(), 0);
    }

    #[test]
    fn test_malformed_frames_dropped() {
        let mut translator = BridgeTranslator::from_config(&BridgeConfig::default());
        let junk = [
            &b""[..],
            &b"\x4E\x4D"[..],
            &b"\x00\x00\x01\x00\x00\x00"[..],
            &b"\x4E\x4D\x01\x07\x00\x00"[..],
            &b"\x4E\x4D\x01\x00\x00\x09abc"[..],
            &b"\x4E\x4D\x01\x01\x00\x02\xFF\xFF"[..],
        ];
        for data in junk {
            let rx = Reception {
                source: PEER,
                data: Bytes::copy_from_slice(data),
            };
            assert!(translator.handle(&rx, Instant::now()).is_empty());
        }
        assert_eq!(translator.stats().malformed_dropped, junk.len() as u64);
        assert!(translator.tracker().is_empty());
    }

    #[test]
    fn test_sweep_publishes_offline() {
        let mut translator = BridgeTranslator::from_config(&BridgeConfig::default());
        let frame = Frame::data(Bytes::from_static(b"x")).unwrap();
        let t0 = Instant::now();
        translator.handle(&reception(&frame), t0);

        let out = translator.sweep(t0 + Duration::from_secs(360));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload_str(), Some("offline"));
        assert!(translator.sweep(t0 + Duration::from_secs(420)).is_empty());
    }
}
