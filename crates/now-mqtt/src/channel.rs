//! Radio channel resolution
//!
//! Both sides of the link have to sit on the same WiFi channel or every frame
//! is lost without any error. The channel is therefore resolved exactly once,
//! before the radio is initialised, and never changes afterwards:
//!
//! 1. an independent channel source (an active station/AP connection) wins;
//! 2. otherwise the locally configured `wifi_channel` is used;
//! 3. co-located transport and bridge without an independent source must
//!    agree, otherwise startup fails.

use std::fmt;
use tracing::{debug, info};

use crate::config::{NowMqttConfig, MAX_WIFI_CHANNEL, MIN_WIFI_CHANNEL};
use crate::error::{NowMqttError, Result};

/// Provider of a channel that overrides the configured one
pub trait ChannelSource: Send + Sync {
    /// Channel currently in use by an independent connection, if any
    fn current_channel(&self) -> Option<u8>;
}

/// No independent connection
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChannelSource;

impl ChannelSource for NoChannelSource {
    fn current_channel(&self) -> Option<u8> {
        None
    }
}

/// A channel known ahead of time (e.g. from the station configuration)
#[derive(Debug, Clone, Copy)]
pub struct FixedChannelSource(pub u8);

impl ChannelSource for FixedChannelSource {
    fn current_channel(&self) -> Option<u8> {
        Some(self.0)
    }
}

impl ChannelSource for Option<u8> {
    fn current_channel(&self) -> Option<u8> {
        *self
    }
}

/// Where the resolved channel came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    /// Taken from the independent channel source
    Independent,
    /// Locally configured fallback
    Configured,
}

/// Channel and PHY mode the radio runs on for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioChannel {
    channel: u8,
    long_range: bool,
    origin: ChannelOrigin,
}

impl RadioChannel {
    /// Create a channel from a configured value
    pub fn new(channel: u8, long_range: bool) -> Result<Self> {
        validate_channel(channel)?;
        Ok(Self {
            channel,
            long_range,
            origin: ChannelOrigin::Configured,
        })
    }

    /// Resolve a single component's channel against an independent source
    pub fn resolve(configured: u8, long_range: bool, source: &dyn ChannelSource) -> Result<Self> {
        validate_channel(configured)?;

        match source.current_channel() {
            Some(independent) => {
                validate_channel(independent)?;
                if independent != configured {
                    debug!(
                        configured,
                        independent, "Independent channel source overrides configured channel"
                    );
                }
                Ok(Self {
                    channel: independent,
                    long_range,
                    origin: ChannelOrigin::Independent,
                })
            }
            None => Ok(Self {
                channel: configured,
                long_range,
                origin: ChannelOrigin::Configured,
            }),
        }
    }

    /// Resolve the channel for a transport and a bridge running on one device
    pub fn reconcile(config: &NowMqttConfig, source: &dyn ChannelSource) -> Result<Self> {
        let transport = config.transport.wifi_channel;
        let bridge = config.bridge.wifi_channel;

        if source.current_channel().is_none() && transport != bridge {
            return Err(NowMqttError::ChannelMismatch { transport, bridge });
        }

        let resolved = Self::resolve(transport, config.transport.long_range_mode, source)?;
        info!(
            channel = resolved.channel,
            long_range = resolved.long_range,
            origin = ?resolved.origin,
            "Radio channel reconciled"
        );
        Ok(resolved)
    }

    /// Channel number (1..=14)
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Long range PHY enabled
    pub fn long_range(&self) -> bool {
        self.long_range
    }

    /// Where the channel number came from
    pub fn origin(&self) -> ChannelOrigin {
        self.origin
    }
}

impl fmt::Display for RadioChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "channel {}{}",
            self.channel,
            if self.long_range { " (long range)" } else { "" }
        )
    }
}

fn validate_channel(channel: u8) -> Result<()> {
    if (MIN_WIFI_CHANNEL..=MAX_WIFI_CHANNEL).contains(&channel) {
        Ok(())
    } else {
        Err(NowMqttError::InvalidChannel(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NowMqttConfigBuilder;

    #[test]
    fn test_configured_fallback() {
        let ch = RadioChannel::resolve(6, true, &NoChannelSource).unwrap();
        assert_eq!(ch.channel(), 6);
        assert!(ch.long_range());
        assert_eq!(ch.origin(), ChannelOrigin::Configured);
    }

    #[test]
    fn test_independent_source_overrides() {
        let ch = RadioChannel::resolve(12, false, &FixedChannelSource(3)).unwrap();
        assert_eq!(ch.channel(), 3);
        assert_eq!(ch.origin(), ChannelOrigin::Independent);
    }

    #[test]
    fn test_invalid_channels() {
        assert!(matches!(
            RadioChannel::new(0, false),
            Err(NowMqttError::InvalidChannel(0))
        ));
        assert!(matches!(
            RadioChannel::resolve(6, false, &Some(15u8)),
            Err(NowMqttError::InvalidChannel(15))
        ));
    }

    #[test]
    fn test_reconcile_mismatch_without_source() {
        let config = NowMqttConfigBuilder::new()
            .transport_channel(1)
            .bridge_channel(6)
            .build();
        assert!(matches!(
            RadioChannel::reconcile(&config, &NoChannelSource),
            Err(NowMqttError::ChannelMismatch {
                transport: 1,
                bridge: 6
            })
        ));
    }

    #[test]
    fn test_reconcile_mismatch_resolved_by_source() {
        let config = NowMqttConfigBuilder::new()
            .transport_channel(1)
            .bridge_channel(6)
            .build();
        let ch = RadioChannel::reconcile(&config, &FixedChannelSource(11)).unwrap();
        assert_eq!(ch.channel(), 11);
    }

    #[test]
    fn test_display() {
        let ch = RadioChannel::new(6, true).unwrap();
        assert_eq!(ch.to_string(), "channel 6 (long range)");
    }
}
