//! Test doubles for the radio, the hooks and the MQTT client
//!
//! - [`MockRadio`] is a [`RadioDriver`] driven from a
//!   [`MockRadioController`]: the test injects delivery reports and
//!   receptions and observes what was transmitted.
//! - [`HookRecorder`] builds [`SendHooks`] that log every call.
//! - [`RecordingPublisher`] is an [`MqttPublisher`] that keeps what it is
//!   given. It can be switched offline or told to refuse a topic, and it
//!   rejects topics a real client would.
//!
//! # Example
//!
//! ```rust,ignore
//! let (radio, mut ctl) = MockRadio::new(MacAddress::new([2, 0, 0, 0, 0, 1]));
//! let recorder = HookRecorder::new();
//! let (transport, handle) =
//!     NowMqttTransport::new(radio, &config, recorder.hooks(), Box::new(NoChannelSource));
//! tokio::spawn(transport.run());
//!
//! let id = handle.submit(Destination::Broadcast, &b"hello"[..])?;
//! let sent = ctl.next_transmit().await.unwrap();
//! ctl.deliver(sent.id, DeliveryOutcome::Success);
//! recorder.wait_for(2).await;
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::address::{Destination, MacAddress};
use crate::channel::RadioChannel;
use crate::error::{NowMqttError, Result};
use crate::frame::{Frame, SensorReading};
use crate::hooks::SendHooks;
use crate::mqtt::{validate_topic, MqttPublication, MqttPublisher};
use crate::pipeline::SendId;
use crate::radio::{DeliveryOutcome, DeliveryReport, RadioDriver, RadioEvent, Reception};

/// A frame handed to [`MockRadio::transmit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    /// Correlation id
    pub id: SendId,
    /// Target
    pub destination: Destination,
    /// Encoded frame
    pub frame: Bytes,
}

#[derive(Default)]
struct MockShared {
    channel: Mutex<Option<RadioChannel>>,
    refuse_transmit: AtomicBool,
    fail_init: bool,
}

/// Scripted radio driver
pub struct MockRadio {
    address: MacAddress,
    name: String,
    events_rx: mpsc::UnboundedReceiver<RadioEvent>,
    transmits_tx: mpsc::UnboundedSender<Transmission>,
    shared: Arc<MockShared>,
}

/// Test-side end of a [`MockRadio`]
pub struct MockRadioController {
    events_tx: mpsc::UnboundedSender<RadioEvent>,
    transmits_rx: mpsc::UnboundedReceiver<Transmission>,
    shared: Arc<MockShared>,
}

impl MockRadio {
    /// Create a mock radio and its controller
    pub fn new(address: MacAddress) -> (Self, MockRadioController) {
        Self::build(address, false)
    }

    /// Create a mock radio whose `init` always fails
    pub fn failing(address: MacAddress) -> (Self, MockRadioController) {
        Self::build(address, true)
    }

    fn build(address: MacAddress, fail_init: bool) -> (Self, MockRadioController) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (transmits_tx, transmits_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            fail_init,
            ..MockShared::default()
        });

        let radio = Self {
            address,
            name: format!("mock:{}", address),
            events_rx,
            transmits_tx,
            shared: shared.clone(),
        };
        let controller = MockRadioController {
            events_tx,
            transmits_rx,
            shared,
        };
        (radio, controller)
    }
}

#[async_trait]
impl RadioDriver for MockRadio {
    async fn init(&mut self, channel: &RadioChannel) -> Result<()> {
        if self.shared.fail_init {
            return Err(NowMqttError::RadioInit(format!(
                "simulated failure on {}",
                channel
            )));
        }
        *self.shared.channel.lock() = Some(*channel);
        Ok(())
    }

    async fn transmit(&mut self, id: SendId, destination: Destination, frame: Bytes) -> Result<()> {
        if self.shared.refuse_transmit.load(Ordering::SeqCst) {
            return Err(NowMqttError::TransmitFailed("simulated refusal".to_string()));
        }
        let _ = self.transmits_tx.send(Transmission {
            id,
            destination,
            frame,
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<RadioEvent>> {
        Ok(self.events_rx.recv().await)
    }

    fn local_address(&self) -> MacAddress {
        self.address
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl MockRadioController {
    /// Report a delivery outcome
    pub fn deliver(&self, id: SendId, outcome: DeliveryOutcome) {
        let _ = self
            .events_tx
            .send(RadioEvent::Delivery(DeliveryReport { id, outcome }));
    }

    /// Inject raw bytes as if heard from `source`
    pub fn receive(&self, source: MacAddress, data: impl Into<Bytes>) {
        let _ = self.events_tx.send(RadioEvent::Received(Reception {
            source,
            data: data.into(),
        }));
    }

    /// Inject an encoded frame
    pub fn receive_frame(&self, source: MacAddress, frame: &Frame) {
        self.receive(source, frame.encode());
    }

    /// Inject a sensor reading frame
    pub fn receive_reading(&self, source: MacAddress, reading: &SensorReading) -> Result<()> {
        let frame = Frame::reading(reading)?;
        self.receive_frame(source, &frame);
        Ok(())
    }

    /// Wait for the next transmitted frame
    pub async fn next_transmit(&mut self) -> Option<Transmission> {
        self.transmits_rx.recv().await
    }

    /// Next transmitted frame, if one is already waiting
    pub fn try_next_transmit(&mut self) -> Option<Transmission> {
        self.transmits_rx.try_recv().ok()
    }

    /// Make `transmit` fail until switched back
    pub fn set_refuse_transmit(&self, refuse: bool) {
        self.shared.refuse_transmit.store(refuse, Ordering::SeqCst);
    }

    /// Channel the radio was initialised with
    pub fn channel(&self) -> Option<RadioChannel> {
        *self.shared.channel.lock()
    }
}

/// One hook invocation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HookEvent {
    /// `on_sent(latency)`
    Sent(f32),
    /// `on_send_success()`
    Success,
    /// `on_send_failure()`
    Failure,
}

/// Records hook invocations in call order
#[derive(Clone, Default)]
pub struct HookRecorder {
    events: Arc<Mutex<Vec<HookEvent>>>,
    notify: Arc<Notify>,
}

impl HookRecorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks that write into this recorder
    pub fn hooks(&self) -> SendHooks {
        let (sent, success, failure) = (self.clone(), self.clone(), self.clone());
        SendHooks::new()
            .on_sent(move |latency| sent.record(HookEvent::Sent(latency)))
            .on_send_success(move || success.record(HookEvent::Success))
            .on_send_failure(move || failure.record(HookEvent::Failure))
    }

    fn record(&self, event: HookEvent) {
        self.events.lock().push(event);
        self.notify.notify_one();
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events of the same kind as `event`
    pub fn count(&self, event: HookEvent) -> usize {
        let kind = std::mem::discriminant(&event);
        self.events
            .lock()
            .iter()
            .filter(|e| std::mem::discriminant(*e) == kind)
            .count()
    }

    /// Wait until at least `n` events were recorded
    pub async fn wait_for(&self, n: usize) -> Vec<HookEvent> {
        loop {
            let notified = self.notify.notified();
            {
                let events = self.events.lock();
                if events.len() >= n {
                    return events.clone();
                }
            }
            notified.await;
        }
    }
}

/// MQTT publisher that keeps every publication
#[derive(Clone)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<MqttPublication>>>,
    refused: Arc<Mutex<HashSet<String>>>,
    connected: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPublisher {
    /// Create a connected publisher
    pub fn new() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            refused: Arc::new(Mutex::new(HashSet::new())),
            connected: Arc::new(AtomicBool::new(true)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Simulate a broker connection change
    pub fn set_connected(&self, connected: bool) {
        debug!(connected, "Recording publisher connection changed");
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Permanently refuse publications on `topic`
    pub fn refuse_topic(&self, topic: impl Into<String>) {
        self.refused.lock().insert(topic.into());
    }

    /// All publications in order
    pub fn published(&self) -> Vec<MqttPublication> {
        self.published.lock().clone()
    }

    /// Topics in publication order
    pub fn topics(&self) -> Vec<String> {
        self.published.lock().iter().map(|p| p.topic.clone()).collect()
    }

    /// Text payloads published to one topic
    pub fn payloads_on(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| String::from_utf8_lossy(&p.payload).into_owned())
            .collect()
    }

    /// Wait until at least `n` publications were made
    pub async fn wait_for(&self, n: usize) -> Vec<MqttPublication> {
        loop {
            let notified = self.notify.notified();
            {
                let published = self.published.lock();
                if published.len() >= n {
                    return published.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl MqttPublisher for RecordingPublisher {
    async fn publish(&self, publication: &MqttPublication) -> Result<()> {
        validate_topic(&publication.topic)?;
        if self.refused.lock().contains(&publication.topic) {
            return Err(NowMqttError::InvalidTopic(publication.topic.clone()));
        }
        if !self.is_connected() {
            return Err(NowMqttError::MqttDisconnected);
        }
        self.published.lock().push(publication.clone());
        self.notify.notify_one();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
