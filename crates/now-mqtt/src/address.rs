//! Radio addresses and send destinations
//!
//! ESP-NOW peers are identified by their 6-byte station MAC. The bridge keys
//! every MQTT topic on the lower-case hex form of that address, so the
//! mapping from device to topic is deterministic and collision-free.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{NowMqttError, Result};

/// 6-byte radio identifier of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// The broadcast address `FF:FF:FF:FF:FF:FF`
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    /// Create from raw bytes
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Random locally-administered unicast address
    pub fn random() -> Self {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        // locally administered, unicast
        bytes[0] = (bytes[0] | 0x02) & 0xFE;
        Self(bytes)
    }

    /// Read an address from the first 6 bytes of a slice
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let bytes: [u8; 6] = data
            .get(..6)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| NowMqttError::InvalidAddress(format!("{} bytes", data.len())))?;
        Ok(Self(bytes))
    }

    /// Raw bytes
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Check for the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Topic key: 12 lower-case hex digits, no separators
    pub fn topic_key(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for MacAddress {
    type Err = NowMqttError;

    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.chars().filter(|c| !matches!(c, ':' | '-')).collect();
        let bytes = hex::decode(&digits)
            .map_err(|e| NowMqttError::InvalidAddress(format!("{}: {}", s, e)))?;
        let bytes: [u8; 6] = bytes
            .try_into()
            .map_err(|_| NowMqttError::InvalidAddress(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a frame is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Every peer listening on the channel
    Broadcast,
    /// A single peer
    Unicast(MacAddress),
}

impl Destination {
    /// Address the radio should put on the air
    pub fn address(&self) -> MacAddress {
        match self {
            Destination::Broadcast => MacAddress::BROADCAST,
            Destination::Unicast(addr) => *addr,
        }
    }
}

impl From<MacAddress> for Destination {
    fn from(addr: MacAddress) -> Self {
        if addr.is_broadcast() {
            Destination::Broadcast
        } else {
            Destination::Unicast(addr)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Broadcast => write!(f, "broadcast"),
            Destination::Unicast(addr) => write!(f, "{}", addr),
        }
    }
}
