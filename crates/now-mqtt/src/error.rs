//! Error types for the ESP-NOW/MQTT bridge
//!
//! Every fallible operation in the crate returns [`NowMqttError`]. Only radio
//! initialization is fatal; everything that can go wrong in steady state is
//! reported here so callers can count it and move on.

use thiserror::Error;

use crate::pipeline::SendId;

/// Main error type for transport and bridge operations
#[derive(Error, Debug)]
pub enum NowMqttError {
    // ===== Radio Errors =====
    /// Radio could not be brought up on the resolved channel
    #[error("Radio initialization failed: {0}")]
    RadioInit(String),

    /// Channel number outside 1..=14
    #[error("Invalid WiFi channel {0}: must be between 1 and 14")]
    InvalidChannel(u8),

    /// Co-located transport and bridge configured on different channels
    #[error("Channel mismatch: transport on {transport}, bridge on {bridge}")]
    ChannelMismatch {
        /// Transport channel
        transport: u8,
        /// Bridge channel
        bridge: u8,
    },

    /// Radio driver refused a frame
    #[error("Radio transmit failed: {0}")]
    TransmitFailed(String),

    /// Radio driver stopped producing events
    #[error("Radio link closed")]
    RadioClosed,

    // ===== Send Pipeline Errors =====
    /// Payload does not fit a single frame
    #[error("Payload too large: {size} bytes exceeds frame maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Send was not acknowledged by the driver in time
    #[error("Send {id} timed out after {duration_ms}ms")]
    SendTimeout {
        /// Request that timed out
        id: SendId,
        /// Timeout in milliseconds
        duration_ms: u64,
    },

    /// Second delivery callback for an already resolved send
    #[error("Duplicate delivery callback for send {0}")]
    DuplicateCallback(SendId),

    /// Delivery callback for an id the pipeline never issued
    #[error("Delivery callback for unknown send {0}")]
    UnknownSend(SendId),

    /// Submission queue is full
    #[error("Send queue is full")]
    QueueFull,

    // ===== Frame Errors =====
    /// Inbound frame failed to decode
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Invalid radio address
    #[error("Invalid radio address: {0}")]
    InvalidAddress(String),

    // ===== MQTT Errors =====
    /// MQTT client error
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// Broker connection is down
    #[error("MQTT client is disconnected")]
    MqttDisconnected,

    /// Topic name the broker would never accept
    #[error("Invalid MQTT topic: {0:?}")]
    InvalidTopic(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Service Errors =====
    /// Service loop is not running
    #[error("Service is not running")]
    ServiceNotRunning,

    /// Internal channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Payload encoding error
    #[error("Encode error: {0}")]
    Encode(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NowMqttError {
    /// Check if the operation may succeed when repeated later
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            NowMqttError::QueueFull
                | NowMqttError::MqttDisconnected
                | NowMqttError::Mqtt(_)
                | NowMqttError::TransmitFailed(_)
                | NowMqttError::SendTimeout { .. }
        )
    }

    /// Check if this is a bad-data error from the radio side
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            NowMqttError::MalformedFrame(_) | NowMqttError::InvalidAddress(_)
        )
    }

    /// Check if this error should abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NowMqttError::RadioInit(_)
                | NowMqttError::InvalidChannel(_)
                | NowMqttError::ChannelMismatch { .. }
                | NowMqttError::InvalidConfig(_)
        )
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            NowMqttError::RadioInit(_) => "RADIO_INIT",
            NowMqttError::InvalidChannel(_) => "INVALID_CHANNEL",
            NowMqttError::ChannelMismatch { .. } => "CHANNEL_MISMATCH",
            NowMqttError::TransmitFailed(_) => "TRANSMIT_FAILED",
            NowMqttError::RadioClosed => "RADIO_CLOSED",
            NowMqttError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            NowMqttError::SendTimeout { .. } => "SEND_TIMEOUT",
            NowMqttError::DuplicateCallback(_) => "DUPLICATE_CALLBACK",
            NowMqttError::UnknownSend(_) => "UNKNOWN_SEND",
            NowMqttError::QueueFull => "QUEUE_FULL",
            NowMqttError::MalformedFrame(_) => "MALFORMED_FRAME",
            NowMqttError::InvalidAddress(_) => "INVALID_ADDRESS",
            NowMqttError::Mqtt(_) => "MQTT_ERROR",
            NowMqttError::MqttDisconnected => "MQTT_DISCONNECTED",
            NowMqttError::InvalidTopic(_) => "INVALID_TOPIC",
            NowMqttError::InvalidConfig(_) => "INVALID_CONFIG",
            NowMqttError::ServiceNotRunning => "SERVICE_NOT_RUNNING",
            NowMqttError::ChannelClosed => "CHANNEL_CLOSED",
            NowMqttError::Encode(_) => "ENCODE_ERROR",
            NowMqttError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, NowMqttError>;

impl From<serde_cbor::Error> for NowMqttError {
    fn from(err: serde_cbor::Error) -> Self {
        NowMqttError::Encode(err.to_string())
    }
}

impl From<serde_json::Error> for NowMqttError {
    fn from(err: serde_json::Error) -> Self {
        NowMqttError::Encode(err.to_string())
    }
}

#[cfg(feature = "mqtt")]
impl From<rumqttc::ClientError> for NowMqttError {
    fn from(err: rumqttc::ClientError) -> Self {
        NowMqttError::Mqtt(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for NowMqttError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        NowMqttError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = NowMqttError::MalformedFrame("short".to_string());
        assert_eq!(err.error_code(), "MALFORMED_FRAME");
        assert_eq!(NowMqttError::QueueFull.error_code(), "QUEUE_FULL");
    }

    #[test]
    fn test_classification() {
        assert!(NowMqttError::MqttDisconnected.is_retriable());
        assert!(NowMqttError::Mqtt("request channel full".into()).is_retriable());
        assert!(!NowMqttError::InvalidTopic("a/#".into()).is_retriable());
        assert!(!NowMqttError::RadioInit("no radio".into()).is_retriable());
        assert!(NowMqttError::MalformedFrame("x".into()).is_frame_error());
        assert!(NowMqttError::RadioInit("x".into()).is_fatal());
        assert!(NowMqttError::ChannelMismatch {
            transport: 1,
            bridge: 6
        }
        .is_fatal());
        assert!(!NowMqttError::DuplicateCallback(SendId::new(3)).is_fatal());
    }

    #[test]
    fn test_payload_too_large_message() {
        let err = NowMqttError::PayloadTooLarge {
            size: 300,
            max: 244,
        };
        assert!(err.to_string().contains("300"));
        assert!(err.to_string().contains("244"));
    }
}
