//! Transport service: sends frames over the radio
//!
//! [`NowMqttTransport`] owns the radio driver and the [`SendPipeline`]. It
//! runs as one task; callers talk to it through a cloneable
//! [`TransportHandle`].
//!
//! ```text
//! caller ── submit ──► command queue ──► admit ──► radio.transmit
//!                                                       │
//!   hooks ◄── resolve ◄── delivery event / deadline ◄───┘
//! ```
//!
//! `submit` never waits: it validates the payload size, assigns an id from
//! an atomic counter and `try_send`s the request. Outcomes are reported only
//! through the [`SendHooks`].

use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::address::Destination;
use crate::channel::{ChannelSource, RadioChannel};
use crate::config::{NowMqttConfig, TransportConfig};
use crate::error::{NowMqttError, Result};
use crate::frame::{Frame, SensorReading};
use crate::hooks::SendHooks;
use crate::pipeline::{PipelineStats, SendId, SendPipeline, SendRequest};
use crate::radio::{RadioDriver, RadioEvent};

/// Commands accepted by the transport service
#[derive(Debug)]
pub enum TransportCommand {
    /// Transmit an encoded frame
    Send(SendRequest),
    /// Get transport statistics
    GetStats(oneshot::Sender<TransportStats>),
    /// Stop the service
    Shutdown,
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Send pipeline counters
    pub pipeline: PipelineStats,
    /// Requests currently waiting for an outcome
    pub in_flight: usize,
    /// Frames heard on the channel (the transport does not consume them)
    pub frames_ignored: u64,
    /// Errors reported by the radio driver
    pub radio_errors: u64,
}

/// Handle for submitting frames to a running [`NowMqttTransport`]
#[derive(Clone)]
pub struct TransportHandle {
    command_tx: mpsc::Sender<TransportCommand>,
    next_id: Arc<AtomicU32>,
}

impl TransportHandle {
    /// Submit an opaque payload
    ///
    /// Fails with [`NowMqttError::PayloadTooLarge`] if the payload does not
    /// fit one frame, and with [`NowMqttError::QueueFull`] if the service is
    /// backed up. Otherwise returns the id the hooks will report on.
    pub fn submit(
        &self,
        destination: impl Into<Destination>,
        payload: impl Into<Bytes>,
    ) -> Result<SendId> {
        let frame = Frame::data(payload)?;
        self.enqueue(destination.into(), &frame)
    }

    /// Broadcast a sensor reading
    pub fn submit_reading(&self, reading: &SensorReading) -> Result<SendId> {
        let frame = Frame::reading(reading)?;
        self.enqueue(Destination::Broadcast, &frame)
    }

    fn enqueue(&self, destination: Destination, frame: &Frame) -> Result<SendId> {
        let id = SendId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = SendRequest {
            id,
            destination,
            payload: frame.encode(),
            submitted_at: Instant::now(),
        };

        self.command_tx
            .try_send(TransportCommand::Send(request))
            .map_err(|e| match e {
                TrySendError::Full(_) => NowMqttError::QueueFull,
                TrySendError::Closed(_) => NowMqttError::ServiceNotRunning,
            })?;
        trace!(%id, %destination, "Frame queued");
        Ok(id)
    }

    /// Get transport statistics
    pub async fn stats(&self) -> Result<TransportStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(TransportCommand::GetStats(tx))
            .await
            .map_err(|_| NowMqttError::ChannelClosed)?;
        rx.await.map_err(|_| NowMqttError::ChannelClosed)
    }

    /// Stop the transport
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(TransportCommand::Shutdown)
            .await
            .map_err(|_| NowMqttError::ChannelClosed)
    }
}

/// Sender-side service
pub struct NowMqttTransport<R: RadioDriver> {
    /// Radio driver
    radio: R,
    /// Pending send table
    pipeline: SendPipeline,
    /// Command receiver
    command_rx: mpsc::Receiver<TransportCommand>,
    /// Configured channel and PHY mode
    config: TransportConfig,
    /// Independent channel provider
    channel_source: Box<dyn ChannelSource>,
    /// Channel decided by the caller (co-located deployments)
    preset_channel: Option<RadioChannel>,
    /// Frames heard but not consumed
    frames_ignored: u64,
    /// Driver errors
    radio_errors: u64,
}

impl<R: RadioDriver + 'static> NowMqttTransport<R> {
    /// Create a transport with the given radio and hooks
    pub fn new(
        radio: R,
        config: &NowMqttConfig,
        hooks: SendHooks,
        channel_source: Box<dyn ChannelSource>,
    ) -> (Self, TransportHandle) {
        let (command_tx, command_rx) = mpsc::channel(config.transport.queue_size.max(1));
        let handle = TransportHandle {
            command_tx,
            next_id: Arc::new(AtomicU32::new(1)),
        };

        let transport = Self {
            radio,
            pipeline: SendPipeline::from_config(&config.transport, hooks),
            command_rx,
            config: config.transport.clone(),
            channel_source,
            preset_channel: None,
            frames_ignored: 0,
            radio_errors: 0,
        };

        (transport, handle)
    }

    /// Use a channel already reconciled with a co-located bridge
    pub fn with_channel(mut self, channel: RadioChannel) -> Self {
        self.preset_channel = Some(channel);
        self
    }

    /// Run the transport service
    ///
    /// Fails only if the channel cannot be resolved or the radio cannot be
    /// initialised. Returns `Ok(())` after shutdown; anything still pending
    /// then is resolved as a failure.
    pub async fn run(mut self) -> Result<()> {
        let channel = match self.preset_channel {
            Some(channel) => channel,
            None => RadioChannel::resolve(
                self.config.wifi_channel,
                self.config.long_range_mode,
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
            "Transport running on {}",
            channel
        );

        loop {
            let deadline = self.pipeline.next_deadline();

            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(TransportCommand::Send(request)) => {
                            self.handle_send(request).await;
                        }
                        Some(TransportCommand::GetStats(tx)) => {
                            let _ = tx.send(self.stats());
                        }
                        Some(TransportCommand::Shutdown) => {
                            info!("Transport shutdown requested");
                            break;
                        }
                        None => {
                            debug!("All transport handles dropped");
                            break;
                        }
                    }
                }

                event = self.radio.next_event() => {
                    match event {
                        Ok(Some(event)) => self.handle_radio_event(event),
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

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.pipeline.expire(Instant::now());
                }
            }
        }

        let abandoned = self.pipeline.abandon_all(Instant::now());
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "Pending sends failed at shutdown");
        }
        info!("Transport stopped");
        Ok(())
    }

    async fn handle_send(&mut self, request: SendRequest) {
        let id = request.id;
        let destination = request.destination;
        let frame = request.payload.clone();

        if self.pipeline.admit(request, Instant::now()).is_some() {
            return;
        }

        if let Err(e) = self.radio.transmit(id, destination, frame).await {
            warn!(%id, "Radio refused frame: {}", e);
            self.pipeline.transmit_failed(id, Instant::now());
        }
    }

    fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Delivery(report) => {
                if let Err(e) = self.pipeline.on_delivery(report, Instant::now()) {
                    // duplicates are routine, unknown ids are not
                    match e {
                        NowMqttError::DuplicateCallback(_) => trace!("{}", e),
                        _ => debug!("{}", e),
                    }
                }
            }
            RadioEvent::Received(reception) => {
                trace!(source = %reception.source, len = reception.data.len(), "Ignoring inbound frame");
                self.frames_ignored += 1;
            }
        }
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            pipeline: self.pipeline.stats().clone(),
            in_flight: self.pipeline.in_flight(),
            frames_ignored: self.frames_ignored,
            radio_errors: self.radio_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MacAddress;
    use crate::channel::{FixedChannelSource, NoChannelSource};
    use crate::config::{NowMqttConfigBuilder, MAX_PAYLOAD_LEN};
    use crate::radio::DeliveryOutcome;
    use crate::test_utils::{HookEvent, HookRecorder, MockRadio};
    use std::time::Duration;

    fn config() -> NowMqttConfig {
        NowMqttConfigBuilder::new()
            .wifi_channel(6)
            .long_range_mode(true)
            .send_timeout(Duration::from_secs(1))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_40ms() {
        let (radio, mut ctl) = MockRadio::new(MacAddress::new([2, 0, 0, 0, 0, 1]));
        let recorder = HookRecorder::new();
        let (transport, handle) =
            NowMqttTransport::new(radio, &config(), recorder.hooks(), Box::new(NoChannelSource));
        tokio::spawn(transport.run());

        let id = handle.submit(Destination::Broadcast, vec![0x42; 200]).unwrap();
        let tx = ctl.next_transmit().await.unwrap();
        assert_eq!(tx.id, id);
        assert_eq!(ctl.channel().map(|c| c.channel()), Some(6));
        assert_eq!(ctl.channel().map(|c| c.long_range()), Some(true));

        tokio::time::sleep(Duration::from_millis(40)).await;
        ctl.deliver(id, DeliveryOutcome::Success);

        let events = recorder.wait_for(2).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], HookEvent::Sent(l) if (l - 0.04).abs() < 1e-3));
        assert_eq!(events[1], HookEvent::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_failure_once() {
        let (radio, mut ctl) = MockRadio::new(MacAddress::new([2, 0, 0, 0, 0, 1]));
        let recorder = HookRecorder::new();
        let (transport, handle) =
            NowMqttTransport::new(radio, &config(), recorder.hooks(), Box::new(NoChannelSource));
        tokio::spawn(transport.run());

        let id = handle.submit(Destination::Broadcast, &b"ping"[..]).unwrap();
        ctl.next_transmit().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        ctl.deliver(id, DeliveryOutcome::Success);

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.pipeline.timed_out, 1);
        let events = recorder.events();
        assert_eq!(recorder.count(HookEvent::Failure), 1);
        assert_eq!(recorder.count(HookEvent::Success), 0);
        assert!(matches!(events[0], HookEvent::Sent(l) if (l - 1.0).abs() < 1e-3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_too_large_is_synchronous() {
        let (radio, _ctl) = MockRadio::new(MacAddress::new([2, 0, 0, 0, 0, 1]));
        let recorder = HookRecorder::new();
        let (_transport, handle) =
            NowMqttTransport::new(radio, &config(), recorder.hooks(), Box::new(NoChannelSource));

        let result = handle.submit(Destination::Broadcast, vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(result, Err(NowMqttError::PayloadTooLarge { .. })));
        assert!(recorder.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full() {
        let (radio, _ctl) = MockRadio::new(MacAddress::new([2, 0, 0, 0, 0, 1]));
        let mut config = config();
        config.transport.queue_size = 1;
        let (_transport, handle) =
            NowMqttTransport::new(radio, &config, SendHooks::new(), Box::new(NoChannelSource));

        handle.submit(Destination::Broadcast, &b"a"[..]).unwrap();
        assert!(matches!(
            handle.submit(Destination::Broadcast, &b"b"[..]),
            Err(NowMqttError::QueueFull)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_transmit_fails_immediately() {
        let (radio, mut ctl) = MockRadio::new(MacAddress::new([2, 0, 0, 0, 0, 1]));
        ctl.set_refuse_transmit(true);
        let recorder = HookRecorder::new();
        let (transport, handle) =
            NowMqttTransport::new(radio, &config(), recorder.hooks(), Box::new(NoChannelSource));
        tokio::spawn(transport.run());

        handle.submit(Destination::Broadcast, &b"a"[..]).unwrap();
        let events = recorder.wait_for(2).await;
        assert_eq!(events[1], HookEvent::Failure);
        assert_eq!(handle.stats().await.unwrap().pipeline.refused, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_channel_wins() {
        let (radio, ctl) = MockRadio::new(MacAddress::new([2, 0, 0, 0, 0, 1]));
        let config = NowMqttConfigBuilder::new().wifi_channel(12).build();
        let (transport, handle) = NowMqttTransport::new(
            radio,
            &config,
            SendHooks::new(),
            Box::new(FixedChannelSource(3)),
        );
        tokio::spawn(transport.run());

        handle.stats().await.unwrap();
        assert_eq!(ctl.channel().map(|c| c.channel()), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_init_failure_is_fatal() {
        let (radio, _ctl) = MockRadio::failing(MacAddress::new([2, 0, 0, 0, 0, 1]));
        let (transport, _handle) =
            NowMqttTransport::new(radio, &config(), SendHooks::new(), Box::new(NoChannelSource));

        assert!(matches!(
            transport.run().await,
            Err(NowMqttError::RadioInit(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_pending() {
        let (radio, mut ctl) = MockRadio::new(MacAddress::new([2, 0, 0, 0, 0, 1]));
        let recorder = HookRecorder::new();
        let (transport, handle) =
            NowMqttTransport::new(radio, &config(), recorder.hooks(), Box::new(NoChannelSource));
        let task = tokio::spawn(transport.run());

        handle.submit(Destination::Broadcast, &b"a"[..]).unwrap();
        ctl.next_transmit().await.unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(recorder.count(HookEvent::Failure), 1);
        assert!(matches!(
            handle.submit(Destination::Broadcast, &b"b"[..]),
            Err(NowMqttError::ServiceNotRunning)
        ));
    }
}
