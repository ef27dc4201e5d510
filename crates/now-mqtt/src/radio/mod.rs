//! Radio driver abstraction
//!
//! The core never talks to a radio directly. It goes through
//! [`RadioDriver`], which covers the three things an ESP-NOW stack does:
//!
//! - set up the channel and PHY mode once ([`RadioDriver::init`])
//! - accept a frame for transmission without waiting for the air
//!   ([`RadioDriver::transmit`])
//! - report delivery outcomes and received frames as events
//!   ([`RadioDriver::next_event`])
//!
//! Delivery and receive callbacks that a real driver runs in interrupt
//! context are turned into [`RadioEvent`] values and consumed by a single
//! service task, so the send and peer tables never need locking.
//!
//! Implementations:
//!
//! - [`udp::UdpRadio`] - host emulation over UDP broadcast (requires `udp` feature)
//! - [`crate::test_utils::MockRadio`] - scripted driver for tests

#[cfg(feature = "udp")]
pub mod udp;

#[cfg(feature = "udp")]
pub use udp::UdpRadio;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use crate::address::{Destination, MacAddress};
use crate::channel::RadioChannel;
use crate::error::Result;
use crate::pipeline::SendId;

/// Driver-level delivery status of one transmitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Frame was acknowledged (unicast) or left the radio (broadcast)
    Success,
    /// Frame was not delivered
    Failure,
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Success => write!(f, "success"),
            DeliveryOutcome::Failure => write!(f, "failure"),
        }
    }
}

/// Delivery callback for one send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Correlation id given to [`RadioDriver::transmit`]
    pub id: SendId,
    /// Driver verdict
    pub outcome: DeliveryOutcome,
}

/// Raw frame heard on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reception {
    /// Sender radio address
    pub source: MacAddress,
    /// Frame bytes, still undecoded
    pub data: Bytes,
}

/// Something the radio reports asynchronously
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// Outcome of an earlier transmit
    Delivery(DeliveryReport),
    /// A frame was received
    Received(Reception),
}

/// Trait for ESP-NOW style radio drivers
#[async_trait]
pub trait RadioDriver: Send {
    /// Bring the radio up on the given channel
    ///
    /// Must fail with [`crate::NowMqttError::RadioInit`] if the channel
    /// cannot be applied.
    async fn init(&mut self, channel: &RadioChannel) -> Result<()>;

    /// Hand a frame to the radio
    ///
    /// Returns as soon as the frame is queued. The outcome arrives later as
    /// [`RadioEvent::Delivery`] with the same `id`. An `Err` means the frame
    /// was refused and no delivery event will follow.
    async fn transmit(&mut self, id: SendId, destination: Destination, frame: Bytes) -> Result<()>;

    /// Wait for the next radio event
    ///
    /// Returns `Ok(None)` once the driver has shut down.
    async fn next_event(&mut self) -> Result<Option<RadioEvent>>;

    /// Own radio address
    fn local_address(&self) -> MacAddress;

    /// Driver name (for logging)
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_display() {
        assert_eq!(DeliveryOutcome::Success.to_string(), "success");
        assert_eq!(DeliveryOutcome::Failure.to_string(), "failure");
    }
}
