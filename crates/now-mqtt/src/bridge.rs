//! Bridge service: radio receptions to MQTT
//!
//! [`NowMqttBridge`] owns the radio driver, the [`BridgeTranslator`] and the
//! MQTT [`Outbox`]. One task runs the event loop:
//!
//! - receptions from the radio are translated and dispatched
//! - every `sweep_interval` the liveness sweep runs and `offline`
//!   publications are dispatched
//! - while the broker is unreachable, publications wait in the outbox and
//!   are retried in order
//! - control commands (stats, peers, shutdown) arrive through
//!   [`BridgeHandle`]
//!
//! Nothing in the loop is fatal. Broker outages, publish errors and
//! malformed frames are logged and counted.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::availability::PeerDevice;
use crate::channel::{ChannelSource, RadioChannel};
use crate::config::{BridgeConfig, NowMqttConfig};
use crate::error::{NowMqttError, Result};
use crate::mqtt::{MqttPublication, MqttPublisher, Outbox};
use crate::radio::{RadioDriver, RadioEvent};
use crate::translator::{BridgeTranslator, TranslatorStats};

/// How often a non-empty outbox is retried
const OUTBOX_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Commands that can be sent to the bridge
#[derive(Debug)]
pub enum BridgeCommand {
    /// Get bridge statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Get a snapshot of known peers
    Peers(oneshot::Sender<Vec<PeerDevice>>),
    /// Shutdown the bridge
    Shutdown,
}

/// Bridge statistics
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    /// Translation counters
    pub translator: TranslatorStats,
    /// Known peers
    pub peers: usize,
    /// Peers currently online
    pub peers_online: usize,
    /// Publications accepted by the MQTT client
    pub published: u64,
    /// Publish attempts rejected by the MQTT client
    pub publish_errors: u64,
    /// Publications dropped because the client can never accept them
    pub publish_rejected: u64,
    /// Publications waiting for the broker
    pub outbox_len: usize,
    /// Publications lost to outbox overflow
    pub outbox_dropped: u64,
    /// Errors reported by the radio driver
    pub radio_errors: u64,
}

/// Handle for controlling a running [`NowMqttBridge`]
#[derive(Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
    /// Get bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::GetStats(tx))
            .await
            .map_err(|_| NowMqttError::ChannelClosed)?;
        rx.await.map_err(|_| NowMqttError::ChannelClosed)
    }

    /// Get the known peers
    pub async fn peers(&self) -> Result<Vec<PeerDevice>> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::Peers(tx))
            .await
            .map_err(|_| NowMqttError::ChannelClosed)?;
        rx.await.map_err(|_| NowMqttError::ChannelClosed)
    }

    /// Shutdown the bridge
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| NowMqttError::ChannelClosed)
    }
}

/// Receiver-side service forwarding radio frames to MQTT
pub struct NowMqttBridge<R: RadioDriver, P: MqttPublisher> {
    /// Radio driver
    radio: R,
    /// MQTT client
    publisher: P,
    /// Frame translation and availability
    translator: BridgeTranslator,
    /// Publications waiting for the broker
    outbox: Outbox,
    /// Command receiver
    command_rx: mpsc::Receiver<BridgeCommand>,
    /// Bridge settings
    config: BridgeConfig,
    /// Long range PHY
    long_range: bool,
    /// Independent channel provider
    channel_source: Box<dyn ChannelSource>,
    /// Channel decided by the caller (co-located deployments)
    preset_channel: Option<RadioChannel>,
    /// Publications accepted
    published: u64,
    /// Publish errors
    publish_errors: u64,
    /// Publications dropped as permanently invalid
    publish_rejected: u64,
    /// Driver errors
    radio_errors: u64,
}

impl<R: RadioDriver + 'static, P: MqttPublisher + 'static> NowMqttBridge<R, P> {
    /// Create a new bridge
    pub fn new(
        radio: R,
        publisher: P,
        config: &NowMqttConfig,
        channel_source: Box<dyn ChannelSource>,
    ) -> (Self, BridgeHandle) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let handle = BridgeHandle { command_tx };

        let bridge = Self {
            radio,
            publisher,
            translator: BridgeTranslator::from_config(&config.bridge),
            outbox: Outbox::new(config.bridge.outbox_size),
            command_rx,
            config: config.bridge.clone(),
            long_range: config.transport.long_range_mode,
            channel_source,
            preset_channel: None,
            published: 0,
            publish_errors: 0,
            publish_rejected: 0,
            radio_errors: 0,
        };

        (bridge, handle)
    }

    /// Use a channel already reconciled with a co-located transport
    pub fn with_channel(mut self, channel: RadioChannel) -> Self {
        self.preset_channel = Some(channel);
        self
    }

    /// Run the bridge service
    ///
    /// Fails only if the channel cannot be resolved or the radio cannot be
    /// initialised.
    pub async fn run(mut self) -> Result<()> {
        let channel = match self.preset_channel {
            Some(channel) => channel,
            None => RadioChannel::resolve(
                self.config.wifi_channel,
                self.long_range,
                self.channel_source.as_ref(),
            )?,
        };

        if let Err(e) = self.radio.init(&channel).await {
            error!(radio = self.radio.name(), "Radio initialization failed: {}", e);
            return Err(match e {
                NowMqttError::RadioInit(_) => e,
                other => NowMqttError::RadioInit(other.to_string()),
            });
        }
        info!(
            radio = self.radio.name(),
            address = %self.radio.local_address(),
            prefix = %self.config.topic_prefix,
            "Bridge running on {}",
            channel
        );

        let now = Instant::now();
        for &address in &self.config.known_peers {
            self.translator.register_peer(address, now);
        }

        let sweep_every = self.config.sweep_interval;
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = tokio::time::interval(OUTBOX_RETRY_INTERVAL);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.radio.next_event() => {
                    match event {
                        Ok(Some(RadioEvent::Received(reception))) => {
                            let publications = self.translator.handle(&reception, Instant::now());
                            self.dispatch(publications).await;
                        }
                        Ok(Some(RadioEvent::Delivery(report))) => {
                            trace!(id = %report.id, "Ignoring delivery report");
                        }
                        Ok(None) => {
                            warn!("{}", NowMqttError::RadioClosed);
                            break;
                        }
                        Err(e) => {
                            warn!("Error reading from radio: {}", e);
                            self.radio_errors += 1;
                        }
                    }
                }

                _ = sweep.tick() => {
                    let publications = self.translator.sweep(Instant::now());
                    self.dispatch(publications).await;
                    let stats = self.translator.stats();
                    trace!(
                        "Bridge stats: frames={}, malformed={}, peers={}, outbox={}",
                        stats.frames_received,
                        stats.malformed_dropped,
                        self.translator.tracker().len(),
                        self.outbox.len()
                    );
                }

                _ = retry.tick(), if !self.outbox.is_empty() => {
                    self.flush().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        BridgeCommand::GetStats(tx) => {
                            let _ = tx.send(self.stats());
                        }
                        BridgeCommand::Peers(tx) => {
                            let _ = tx.send(self.translator.tracker().peers());
                        }
                        BridgeCommand::Shutdown => {
                            info!("Bridge shutdown requested");
                            break;
                        }
                    }
                }
            }
        }

        if !self.outbox.is_empty() {
            warn!(pending = self.outbox.len(), "Bridge stopped with unpublished messages");
        }
        info!("Bridge stopped");
        Ok(())
    }

    /// Queue publications behind anything already waiting, then flush
    async fn dispatch(&mut self, publications: Vec<MqttPublication>) {
        if publications.is_empty() {
            return;
        }
        for publication in publications {
            self.outbox.push(publication);
        }
        self.flush().await;
    }

    /// Publish queued messages in order until the client refuses one
    ///
    /// A publication the client can never accept is dropped so it does not
    /// hold back the rest of the queue.
    async fn flush(&mut self) {
        if !self.publisher.is_connected() {
            trace!(pending = self.outbox.len(), "MQTT offline, holding publications");
            return;
        }

        while let Some(publication) = self.outbox.pop() {
            match self.publisher.publish(&publication).await {
                Ok(()) => {
                    trace!("Published {}", publication);
                    self.published += 1;
                }
                Err(e) if e.is_retriable() => {
                    debug!(topic = %publication.topic, "Publish failed: {}", e);
                    self.publish_errors += 1;
                    self.outbox.requeue(publication);
                    break;
                }
                Err(e) => {
                    warn!(
                        topic = %publication.topic,
                        code = e.error_code(),
                        "Dropping publication: {}",
                        e
                    );
                    self.publish_errors += 1;
                    self.publish_rejected += 1;
                }
            }
        }
    }

    fn stats(&self) -> BridgeStats {
        let tracker = self.translator.tracker();
        BridgeStats {
            translator: self.translator.stats().clone(),
            peers: tracker.len(),
            peers_online: tracker.online_count(),
            published: self.published,
            publish_errors: self.publish_errors,
            publish_rejected: self.publish_rejected,
            outbox_len: self.outbox.len(),
            outbox_dropped: self.outbox.dropped(),
            radio_errors: self.radio_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MacAddress;
    use crate::availability::PeerState;
    use crate::channel::{FixedChannelSource, NoChannelSource};
    use crate::config::NowMqttConfigBuilder;
    use crate::frame::Frame;
    use crate::test_utils::{MockRadio, RecordingPublisher};
    use bytes::Bytes;

    const BRIDGE: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0xB0]);
    const PEER: MacAddress = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);

    fn data_frame(payload: &'static [u8]) -> Frame {
        Frame::data(Bytes::from_static(payload)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_data() {
        let (radio, ctl) = MockRadio::new(BRIDGE);
        let publisher = RecordingPublisher::new();
        let config = NowMqttConfigBuilder::new().build();
        let (bridge, handle) =
            NowMqttBridge::new(radio, publisher.clone(), &config, Box::new(NoChannelSource));
        tokio::spawn(bridge.run());

        ctl.receive_frame(PEER, &data_frame(b"hello"));
        let published = publisher.wait_for(2).await;
        assert_eq!(published[0].topic, "now_mqtt/aabbccddee01/status");
        assert_eq!(published[1].topic, "now_mqtt/aabbccddee01/data");

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.peers, 1);
        assert_eq!(stats.published, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbox_flushes_in_order_after_reconnect() {
        let (radio, ctl) = MockRadio::new(BRIDGE);
        let publisher = RecordingPublisher::new();
        publisher.set_connected(false);
        let config = NowMqttConfigBuilder::new().build();
        let (bridge, handle) =
            NowMqttBridge::new(radio, publisher.clone(), &config, Box::new(NoChannelSource));
        tokio::spawn(bridge.run());

        ctl.receive_frame(PEER, &data_frame(b"one"));
        ctl.receive_frame(PEER, &data_frame(b"two"));
        while handle.stats().await.unwrap().outbox_len < 3 {
            tokio::task::yield_now().await;
        }
        assert!(publisher.published().is_empty());

        publisher.set_connected(true);
        let published = publisher.wait_for(3).await;
        assert_eq!(published[0].payload_str(), Some("online"));
        assert_eq!(published[1].payload_str(), Some("one"));
        assert_eq!(published[2].payload_str(), Some("two"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_goes_offline_once() {
        let (radio, ctl) = MockRadio::new(BRIDGE);
        let publisher = RecordingPublisher::new();
        let config = NowMqttConfigBuilder::new().build();
        let (bridge, handle) =
            NowMqttBridge::new(radio, publisher.clone(), &config, Box::new(NoChannelSource));
        tokio::spawn(bridge.run());

        ctl.receive_frame(PEER, &data_frame(b"x"));
        publisher.wait_for(2).await;

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        handle.stats().await.unwrap();
        assert_eq!(
            publisher.payloads_on("now_mqtt/aabbccddee01/status"),
            vec!["online", "offline"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_channel_from_source() {
        let (radio, ctl) = MockRadio::new(BRIDGE);
        let config = NowMqttConfigBuilder::new().bridge_channel(12).build();
        let (bridge, handle) = NowMqttBridge::new(
            radio,
            RecordingPublisher::new(),
            &config,
            Box::new(FixedChannelSource(3)),
        );
        tokio::spawn(bridge.run());

        handle.peers().await.unwrap();
        assert_eq!(ctl.channel().map(|c| c.channel()), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_publication_does_not_block_outbox() {
        const OTHER: MacAddress = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]);
        let (radio, ctl) = MockRadio::new(BRIDGE);
        let publisher = RecordingPublisher::new();
        publisher.refuse_topic("now_mqtt/aabbccddee01/data");
        let config = NowMqttConfigBuilder::new().build();
        let (bridge, handle) =
            NowMqttBridge::new(radio, publisher.clone(), &config, Box::new(NoChannelSource));
        tokio::spawn(bridge.run());

        ctl.receive_frame(PEER, &data_frame(b"stuck"));
        for _ in 0..3 {
            ctl.receive_frame(OTHER, &data_frame(b"fine"));
        }
        publisher.wait_for(5).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.publish_rejected, 1);
        assert_eq!(stats.outbox_len, 0);
        assert_eq!(stats.published, 5);
        assert_eq!(publisher.payloads_on("now_mqtt/aabbccddee02/data").len(), 3);
        assert!(publisher.payloads_on("now_mqtt/aabbccddee01/data").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_peers_listed_before_first_frame() {
        let (radio, ctl) = MockRadio::new(BRIDGE);
        let publisher = RecordingPublisher::new();
        let config = NowMqttConfigBuilder::new().known_peer(PEER).build();
        let (bridge, handle) =
            NowMqttBridge::new(radio, publisher.clone(), &config, Box::new(NoChannelSource));
        tokio::spawn(bridge.run());

        let peers = handle.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].state, PeerState::Unknown);
        assert!(publisher.published().is_empty());

        ctl.receive_frame(PEER, &data_frame(b"x"));
        publisher.wait_for(2).await;
        assert_eq!(
            publisher.payloads_on("now_mqtt/aabbccddee01/status"),
            vec!["online"]
        );
    }
}
