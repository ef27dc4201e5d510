//! ESP-NOW to MQTT bridge
//!
//! This crate moves small frames from battery-powered ESP-NOW nodes to an
//! MQTT broker. It has two halves that can run on separate devices or side
//! by side in one process:
//!
//! - the **transport** sends frames over the radio and reports each send's
//!   outcome exactly once through automation hooks
//! - the **bridge** receives frames, tracks which peers are alive and
//!   republishes everything on MQTT topics derived from the sender address
//!
//! # Architecture
//!
//! 1. **Radio** - [`RadioDriver`] trait, [`UdpRadio`] host emulation
//! 2. **Framing** - [`Frame`] envelope, [`SensorReading`] payloads
//! 3. **Transport** - [`SendPipeline`] inside [`NowMqttTransport`]
//! 4. **Bridge** - [`BridgeTranslator`] and [`AvailabilityTracker`] inside
//!    [`NowMqttBridge`], publishing through [`MqttPublisher`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use now_mqtt::{
//!     Destination, NoChannelSource, NowMqttConfigBuilder, NowMqttTransport, SendHooks,
//!     UdpRadio,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NowMqttConfigBuilder::new()
//!         .wifi_channel(6)
//!         .long_range_mode(true)
//!         .build();
//!
//!     let hooks = SendHooks::new()
//!         .on_sent(|latency| println!("sent in {:.3}s", latency))
//!         .on_send_failure(|| println!("send failed"));
//!
//!     let radio = UdpRadio::from_config(&config.radio)?;
//!     let (transport, handle) =
//!         NowMqttTransport::new(radio, &config, hooks, Box::new(NoChannelSource));
//!     tokio::spawn(transport.run());
//!
//!     handle.submit(Destination::Broadcast, &b"hello"[..])?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `mqtt` - [`RumqttPublisher`] on top of `rumqttc` (default)
//! - `udp` - [`UdpRadio`] radio emulation over UDP broadcast (default)
//!
//! # Frame Format
//!
//! - Bytes 0-1: Magic number `0x4E4D`
//! - Byte 2: Version (`1`)
//! - Byte 3: Kind (`0` raw data, `1` sensor reading)
//! - Bytes 4-5: Payload length (big-endian u16)
//! - Bytes 6+: Payload
//!
//! ESP-NOW carries at most **250 bytes** per frame, leaving **244 bytes**
//! of payload.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core types
pub mod address;
pub mod config;
pub mod error;
pub mod frame;

// Radio
pub mod channel;
pub mod radio;

// Transport
pub mod hooks;
pub mod pipeline;
pub mod transport;

// Bridge
pub mod availability;
pub mod bridge;
pub mod mqtt;
pub mod translator;

// Testing utilities
pub mod test_utils;

pub use address::{Destination, MacAddress};
pub use config::{
    BridgeConfig, MqttConfig, NowMqttConfig, NowMqttConfigBuilder, RadioConfig, TransportConfig,
};
pub use error::{NowMqttError, Result};
pub use frame::{Component, Frame, FrameKind, SensorReading};

pub use channel::{ChannelOrigin, ChannelSource, FixedChannelSource, NoChannelSource, RadioChannel};
pub use radio::{DeliveryOutcome, DeliveryReport, RadioDriver, RadioEvent, Reception};

#[cfg(feature = "udp")]
pub use radio::UdpRadio;

pub use hooks::SendHooks;
pub use pipeline::{FailureReason, PipelineStats, SendId, SendOutcome, SendPipeline};
pub use transport::{NowMqttTransport, TransportHandle, TransportStats};

pub use availability::{AvailabilityTracker, PeerDevice, PeerState};
pub use bridge::{BridgeHandle, BridgeStats, NowMqttBridge};
pub use mqtt::{validate_topic, MqttPublication, MqttPublisher, Outbox, Qos};
pub use translator::{BridgeTranslator, TopicScheme, TranslatorStats};

#[cfg(feature = "mqtt")]
pub use mqtt::RumqttPublisher;

pub use test_utils::{HookEvent, HookRecorder, MockRadio, MockRadioController, RecordingPublisher};

// Protocol constants re-exports
pub use config::{ESPNOW_MAX_DATA_LEN, FRAME_MAGIC, FRAME_VERSION, MAX_PAYLOAD_LEN};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(FRAME_MAGIC, 0x4E4D);
        assert_eq!(ESPNOW_MAX_DATA_LEN, 250);
        assert_eq!(MAX_PAYLOAD_LEN, 244);
    }
}
