//! Wire framing shared by transport and bridge
//!
//! Every ESP-NOW frame starts with a 6-byte envelope:
//!
//! ```text
//! +--------+--------+------+--------+-----------+
//! | magic  | version| kind | length | payload   |
//! | 2 (BE) | 1      | 1    | 2 (BE) | length    |
//! +--------+--------+------+--------+-----------+
//! ```
//!
//! The whole frame must fit in 250 bytes, leaving 244 bytes of payload.
//! Kind `0` carries opaque bytes that the bridge republishes verbatim; kind
//! `1` carries a CBOR-encoded [`SensorReading`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{ESPNOW_MAX_DATA_LEN, FRAME_HEADER_LEN, FRAME_MAGIC, FRAME_VERSION, MAX_PAYLOAD_LEN};
use crate::error::{NowMqttError, Result};

/// Payload type carried by a frame
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Opaque application bytes
    Data = 0,
    /// CBOR-encoded sensor reading
    Reading = 1,
}

impl TryFrom<u8> for FrameKind {
    type Error = NowMqttError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Reading),
            other => Err(NowMqttError::MalformedFrame(format!(
                "unknown frame kind {}",
                other
            ))),
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Payload type
    pub kind: FrameKind,
    /// Payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Opaque data frame
    pub fn data(payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        check_payload_len(payload.len())?;
        Ok(Self {
            kind: FrameKind::Data,
            payload,
        })
    }

    /// Sensor reading frame
    pub fn reading(reading: &SensorReading) -> Result<Self> {
        let payload = Bytes::from(serde_cbor::to_vec(reading)?);
        check_payload_len(payload.len())?;
        Ok(Self {
            kind: FrameKind::Reading,
            payload,
        })
    }

    /// Serialize envelope and payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u16(FRAME_MAGIC);
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a frame received from the radio
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(NowMqttError::MalformedFrame(format!(
                "{} bytes is shorter than the {} byte header",
                data.len(),
                FRAME_HEADER_LEN
            )));
        }
        if data.len() > ESPNOW_MAX_DATA_LEN {
            return Err(NowMqttError::MalformedFrame(format!(
                "{} bytes exceeds the {} byte frame limit",
                data.len(),
                ESPNOW_MAX_DATA_LEN
            )));
        }

        let magic = u16::from_be_bytes([data[0], data[1]]);
        if magic != FRAME_MAGIC {
            return Err(NowMqttError::MalformedFrame(format!(
                "bad magic 0x{:04X}",
                magic
            )));
        }
        if data[2] != FRAME_VERSION {
            return Err(NowMqttError::MalformedFrame(format!(
                "unsupported version {}",
                data[2]
            )));
        }
        let kind = FrameKind::try_from(data[3])?;

        let length = u16::from_be_bytes([data[4], data[5]]) as usize;
        let body = &data[FRAME_HEADER_LEN..];
        if body.len() != length {
            return Err(NowMqttError::MalformedFrame(format!(
                "declared length {} but {} payload bytes present",
                length,
                body.len()
            )));
        }

        Ok(Self {
            kind,
            payload: Bytes::copy_from_slice(body),
        })
    }

    /// Decode the payload of a reading frame
    pub fn as_reading(&self) -> Result<SensorReading> {
        if self.kind != FrameKind::Reading {
            return Err(NowMqttError::MalformedFrame(
                "not a reading frame".to_string(),
            ));
        }
        let reading: SensorReading = serde_cbor::from_slice(&self.payload)
            .map_err(|e| NowMqttError::MalformedFrame(format!("reading: {}", e)))?;
        // both end up as topic levels
        for (field, value) in [("node", &reading.node), ("object id", &reading.object_id)] {
            if !is_topic_identifier(value) {
                return Err(NowMqttError::MalformedFrame(format!(
                    "{} {:?} is not a snake_case identifier",
                    field, value
                )));
            }
        }
        Ok(reading)
    }
}

/// Reject payloads that do not fit one frame
pub fn check_payload_len(len: usize) -> Result<()> {
    if len > MAX_PAYLOAD_LEN {
        Err(NowMqttError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_LEN,
        })
    } else {
        Ok(())
    }
}

/// Entity type of a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Numeric sensor
    Sensor,
    /// On/off sensor
    BinarySensor,
    /// Free text sensor
    TextSensor,
}

impl Component {
    /// Topic segment
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Sensor => "sensor",
            Component::BinarySensor => "binary_sensor",
            Component::TextSensor => "text_sensor",
        }
    }

    /// Home Assistant discovery component (text sensors are plain sensors there)
    pub fn discovery_component(&self) -> &'static str {
        match self {
            Component::Sensor | Component::TextSensor => "sensor",
            Component::BinarySensor => "binary_sensor",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State change of one entity on a sending node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Sending node name (snake_case)
    #[serde(rename = "n")]
    pub node: String,
    /// Entity type
    #[serde(rename = "c")]
    pub component: Component,
    /// Entity name (snake_case)
    #[serde(rename = "o")]
    pub object_id: String,
    /// Device class
    #[serde(rename = "dc", default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    /// State class
    #[serde(rename = "sc", default, skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    /// Unit of measurement
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Icon (e.g. `mdi:thermometer`)
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Formatted state
    #[serde(rename = "s")]
    pub state: String,
    /// Firmware version of the sender
    #[serde(rename = "sw", default)]
    pub sw_version: String,
    /// Board/model of the sender
    #[serde(rename = "m", default)]
    pub model: String,
}

impl SensorReading {
    /// Numeric sensor state formatted with `accuracy` decimals
    pub fn sensor(node: &str, name: &str, value: f32, accuracy: usize) -> Self {
        Self::with_state(node, Component::Sensor, name, format!("{:.*}", accuracy, value))
    }

    /// Binary sensor state (`ON`/`OFF`)
    pub fn binary_sensor(node: &str, name: &str, value: bool) -> Self {
        let state = if value { "ON" } else { "OFF" };
        Self::with_state(node, Component::BinarySensor, name, state.to_string())
    }

    /// Text sensor state, kept verbatim
    pub fn text_sensor(node: &str, name: &str, value: impl Into<String>) -> Self {
        Self::with_state(node, Component::TextSensor, name, value.into())
    }

    fn with_state(node: &str, component: Component, name: &str, state: String) -> Self {
        Self {
            node: snake_case(node),
            component,
            object_id: snake_case(name),
            device_class: None,
            state_class: None,
            unit: None,
            icon: None,
            state,
            sw_version: String::new(),
            model: String::new(),
        }
    }

    /// Set the device class
    pub fn device_class(mut self, class: impl Into<String>) -> Self {
        self.device_class = Some(class.into());
        self
    }

    /// Set the state class
    pub fn state_class(mut self, class: impl Into<String>) -> Self {
        self.state_class = Some(class.into());
        self
    }

    /// Set the unit of measurement
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set the icon
    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Set sender firmware and board
    pub fn firmware(mut self, sw_version: impl Into<String>, model: impl Into<String>) -> Self {
        self.sw_version = sw_version.into();
        self.model = model.into();
        self
    }
}

/// Lower-case, with every run of non-alphanumerics replaced by `_`
pub fn snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_sep = false;
    for c in s.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Non-empty and already in [`snake_case`] form
pub fn is_topic_identifier(s: &str) -> bool {
    !s.is_empty() && snake_case(s) == s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_layout() {
        let frame = Frame::data(Bytes::from_static(b"hi")).unwrap();
        let wire = frame.encode();
        assert_eq!(&wire[..], &[0x4E, 0x4D, 0x01, 0x00, 0x00, 0x02, b'h', b'i']);
        assert_eq!(Frame::decode(&wire).unwrap(), frame);
    }

    #[test]
    fn test_payload_limit() {
        assert!(Frame::data(vec![0u8; MAX_PAYLOAD_LEN]).is_ok());
        assert!(matches!(
            Frame::data(vec![0u8; MAX_PAYLOAD_LEN + 1]),
            Err(NowMqttError::PayloadTooLarge { size: 245, max: 244 })
        ));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let good = Frame::data(Bytes::from_static(b"abc")).unwrap().encode();

        // too short
        assert!(Frame::decode(&good[..4]).is_err());

        // bad magic
        let mut bad = good.to_vec();
        bad[0] = 0x00;
        assert!(Frame::decode(&bad).is_err());

        // unsupported version
        let mut bad = good.to_vec();
        bad[2] = 9;
        assert!(Frame::decode(&bad).is_err());

        // unknown kind
        let mut bad = good.to_vec();
        bad[3] = 7;
        assert!(Frame::decode(&bad).is_err());

        // truncated payload
        assert!(Frame::decode(&good[..good.len() - 1]).is_err());

        // trailing garbage
        let mut bad = good.to_vec();
        bad.push(0);
        assert!(Frame::decode(&bad).is_err());

        // oversized
        assert!(Frame::decode(&[0u8; 251]).is_err());
    }

    #[test]
    fn test_reading_frame() {
        let reading = SensorReading::sensor("Living Room", "Temperature", 21.456, 1)
            .device_class("temperature")
            .state_class("measurement")
            .unit("°C")
            .icon("mdi:thermometer")
            .firmware("2024.6.0", "esp32dev");
        assert_eq!(reading.node, "living_room");
        assert_eq!(reading.object_id, "temperature");
        assert_eq!(reading.state, "21.5");

        let frame = Frame::reading(&reading).unwrap();
        assert_eq!(frame.kind, FrameKind::Reading);
        assert!(frame.payload.len() <= MAX_PAYLOAD_LEN);

        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.as_reading().unwrap(), reading);
    }

    #[test]
    fn test_reading_garbage_is_malformed() {
        let frame = Frame {
            kind: FrameKind::Reading,
            payload: Bytes::from_static(b"\xff\x00garbage"),
        };
        assert!(matches!(
            frame.as_reading(),
            Err(NowMqttError::MalformedFrame(_))
        ));

        let data = Frame::data(Bytes::from_static(b"x")).unwrap();
        assert!(data.as_reading().is_err());
    }

    #[test]
    fn test_reading_identifiers_must_be_topic_safe() {
        let good = SensorReading::sensor("desk", "temperature", 20.0, 1);
        for (node, object_id) in [
            ("desk", "temp#"),
            ("desk", "temp/+"),
            ("desk/x", "temperature"),
            ("Desk", "temperature"),
            ("", "temperature"),
            ("desk", ""),
        ] {
            let reading = SensorReading {
                node: node.to_string(),
                object_id: object_id.to_string(),
                ..good.clone()
            };
            let frame = Frame::reading(&reading).unwrap();
            assert!(
                matches!(frame.as_reading(), Err(NowMqttError::MalformedFrame(_))),
                "{}/{} accepted",
                node,
                object_id
            );
        }

        let frame = Frame::reading(&good).unwrap();
        assert_eq!(frame.as_reading().unwrap(), good);
    }

    #[test]
    fn test_binary_and_text_states() {
        assert_eq!(SensorReading::binary_sensor("n", "Door", true).state, "ON");
        assert_eq!(SensorReading::binary_sensor("n", "Door", false).state, "OFF");
        let text = SensorReading::text_sensor("n", "Status Text", "all good");
        assert_eq!(text.state, "all good");
        assert_eq!(text.object_id, "status_text");
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("Living Room"), "living_room");
        assert_eq!(snake_case("  CO2 - Level "), "co2_level");
        assert_eq!(snake_case("already_snake"), "already_snake");
        assert!(is_topic_identifier("co2_level"));
        assert!(!is_topic_identifier("co2 level"));
        assert!(!is_topic_identifier("_co2"));
    }
}
