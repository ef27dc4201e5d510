//! UDP emulation of an ESP-NOW link
//!
//! Lets the transport and bridge run on ordinary hosts. Each WiFi channel is
//! a separate UDP port (`base_port + channel`), so two nodes configured on
//! different channels never hear each other, exactly like the real radio.
//!
//! Datagram layout:
//! - Bytes 0-5: source radio address
//! - Bytes 6-11: destination radio address (`FF:FF:FF:FF:FF:FF` = broadcast)
//! - Bytes 12+: frame
//!
//! # Requirements
//!
//! Enable the `udp` feature in Cargo.toml to use this driver.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use super::{DeliveryOutcome, DeliveryReport, RadioDriver, RadioEvent, Reception};
use crate::address::{Destination, MacAddress};
use crate::channel::RadioChannel;
use crate::config::{RadioConfig, ESPNOW_MAX_DATA_LEN};
use crate::error::{NowMqttError, Result};
use crate::pipeline::SendId;

/// Source + destination address prefix
const ADDRESS_HEADER_LEN: usize = 12;

/// Receive buffer: address header plus the largest frame, with slack
const RECV_BUFFER_SIZE: usize = 512;

/// Radio driver backed by UDP broadcast
pub struct UdpRadio {
    /// Local bind address
    bind: IpAddr,
    /// Broadcast destination
    broadcast: IpAddr,
    /// Port of channel 0
    base_port: u16,
    /// Own radio address
    address: MacAddress,
    /// Socket (after init)
    socket: Option<UdpSocket>,
    /// Port in use (after init)
    port: u16,
    /// Delivery reports not yet handed out
    deliveries: VecDeque<DeliveryReport>,
    /// Driver name for logging
    name: String,
}

impl UdpRadio {
    /// Create a driver from configuration
    pub fn from_config(config: &RadioConfig) -> Result<Self> {
        let bind: IpAddr = config
            .bind
            .parse()
            .map_err(|_| NowMqttError::InvalidConfig(format!("radio.bind '{}'", config.bind)))?;
        let broadcast: IpAddr = config.broadcast.parse().map_err(|_| {
            NowMqttError::InvalidConfig(format!("radio.broadcast '{}'", config.broadcast))
        })?;
        let address = config.address.unwrap_or_else(MacAddress::random);

        Ok(Self {
            bind,
            broadcast,
            base_port: config.base_port,
            address,
            socket: None,
            port: 0,
            deliveries: VecDeque::new(),
            name: format!("udp:{}", address),
        })
    }

    /// UDP port used by a channel
    pub fn port_for(&self, channel: u8) -> Option<u16> {
        self.base_port.checked_add(channel as u16)
    }

    fn open_socket(&self, port: u16) -> std::io::Result<UdpSocket> {
        let addr = SocketAddr::new(self.bind, port);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    }

    fn parse_datagram(&self, data: &[u8]) -> Option<Reception> {
        if data.len() < ADDRESS_HEADER_LEN {
            trace!(len = data.len(), "Ignoring runt datagram");
            return None;
        }
        let source = MacAddress::from_slice(&data[..6]).ok()?;
        let destination = MacAddress::from_slice(&data[6..12]).ok()?;

        if source == self.address {
            return None;
        }
        if !destination.is_broadcast() && destination != self.address {
            trace!(%destination, "Ignoring frame addressed to another peer");
            return None;
        }

        Some(Reception {
            source,
            data: Bytes::copy_from_slice(&data[ADDRESS_HEADER_LEN..]),
        })
    }
}

#[async_trait]
impl RadioDriver for UdpRadio {
    async fn init(&mut self, channel: &RadioChannel) -> Result<()> {
        let port = self.port_for(channel.channel()).ok_or_else(|| {
            NowMqttError::RadioInit(format!("no UDP port for {}", channel))
        })?;

        let socket = self
            .open_socket(port)
            .map_err(|e| NowMqttError::RadioInit(format!("bind {}:{}: {}", self.bind, port, e)))?;

        if channel.long_range() {
            debug!("Long range mode requested; UDP emulation has a single PHY");
        }

        info!(
            address = %self.address,
            port,
            "UDP radio up on {}",
            channel
        );
        self.socket = Some(socket);
        self.port = port;
        Ok(())
    }

    async fn transmit(&mut self, id: SendId, destination: Destination, frame: Bytes) -> Result<()> {
        if frame.len() > ESPNOW_MAX_DATA_LEN {
            return Err(NowMqttError::TransmitFailed(format!(
                "{} byte frame exceeds radio limit",
                frame.len()
            )));
        }
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| NowMqttError::TransmitFailed("radio not initialized".to_string()))?;

        let mut datagram = BytesMut::with_capacity(ADDRESS_HEADER_LEN + frame.len());
        datagram.put_slice(&self.address.octets());
        datagram.put_slice(&destination.address().octets());
        datagram.put_slice(&frame);

        let target = SocketAddr::new(self.broadcast, self.port);
        let outcome = match socket.send_to(&datagram, target).await {
            Ok(_) => DeliveryOutcome::Success,
            Err(e) => {
                warn!(%id, "UDP send failed: {}", e);
                DeliveryOutcome::Failure
            }
        };
        self.deliveries.push_back(DeliveryReport { id, outcome });
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<RadioEvent>> {
        if let Some(report) = self.deliveries.pop_front() {
            return Ok(Some(RadioEvent::Delivery(report)));
        }

        let Some(socket) = self.socket.as_ref() else {
            return Ok(None);
        };

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if let Some(reception) = self.parse_datagram(&buf[..len]) {
                trace!(%from, source = %reception.source, len, "Datagram received");
                return Ok(Some(RadioEvent::Received(reception)));
            }
        }
    }

    fn local_address(&self) -> MacAddress {
        self.address
    }

    fn name(&self) -> &str {
        &self.name
    }
}
