//! MQTT publishing side of the bridge
//!
//! The bridge only ever publishes. Everything it needs from a client is
//! captured by [`MqttPublisher`]; [`RumqttPublisher`] is the production
//! implementation on top of `rumqttc` (requires the `mqtt` feature).
//!
//! Publications produced while the broker is unreachable are parked in an
//! [`Outbox`] and replayed in order once the client reports a connection.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::error::{NowMqttError, Result};

/// Longest topic name an MQTT packet can carry
const MAX_TOPIC_LEN: usize = 65535;

#[cfg(feature = "mqtt")]
pub use self::client::RumqttPublisher;

/// Delivery guarantee requested from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    /// Fire and forget
    AtMostOnce,
    /// Acknowledged delivery
    AtLeastOnce,
    /// Assured delivery
    ExactlyOnce,
}

impl Qos {
    /// Numeric level (0-2)
    pub fn level(&self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// One message to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttPublication {
    /// Topic name
    pub topic: String,
    /// Message body
    pub payload: Bytes,
    /// Requested QoS
    pub qos: Qos,
    /// Broker keeps the last value
    pub retain: bool,
}

impl MqttPublication {
    /// Create a publication
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: Qos, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }

    /// Payload as text, when it is UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl fmt::Display for MqttPublication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes, qos {}{})",
            self.topic,
            self.payload.len(),
            self.qos.level(),
            if self.retain { ", retained" } else { "" }
        )
    }
}

/// Check a topic name before it is handed to a client
///
/// Publish topics must be non-empty, fit in a packet and contain no
/// wildcards or NUL characters.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN || topic.contains(['+', '#', '\0']) {
        return Err(NowMqttError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Trait for MQTT clients the bridge can publish through
#[async_trait]
pub trait MqttPublisher: Send + Sync {
    /// Hand a publication to the client
    ///
    /// Must not block on the network. Fails with
    /// [`NowMqttError::MqttDisconnected`] or [`NowMqttError::Mqtt`] if the
    /// client cannot take it now, and with [`NowMqttError::InvalidTopic`] if
    /// it never will.
    async fn publish(&self, publication: &MqttPublication) -> Result<()>;

    /// Check whether the broker connection is up
    fn is_connected(&self) -> bool;
}

/// Bounded queue of publications waiting for the broker
#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<MqttPublication>,
    capacity: usize,
    dropped: u64,
}

impl Outbox {
    /// Create an outbox holding at most `capacity` publications
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Queue a publication, evicting the oldest when full
    pub fn push(&mut self, publication: MqttPublication) {
        if self.queue.len() >= self.capacity {
            if let Some(evicted) = self.queue.pop_front() {
                self.dropped += 1;
                tracing::debug!(topic = %evicted.topic, "Outbox full, dropping oldest publication");
            }
        }
        self.queue.push_back(publication);
    }

    /// Put a publication back at the head after a failed flush
    pub fn requeue(&mut self, publication: MqttPublication) {
        if self.queue.len() >= self.capacity {
            self.dropped += 1;
            return;
        }
        self.queue.push_front(publication);
    }

    /// Take the oldest publication
    pub fn pop(&mut self) -> Option<MqttPublication> {
        self.queue.pop_front()
    }

    /// Number of queued publications
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Publications evicted so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(feature = "mqtt")]
mod client {
    use super::*;
    use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};

    use crate::config::MqttConfig;

    /// Requests buffered inside the rumqttc client
    const CLIENT_CAPACITY: usize = 64;

    /// Pause between reconnect attempts
    const RECONNECT_DELAY: Duration = Duration::from_secs(2);

    impl From<Qos> for QoS {
        fn from(qos: Qos) -> Self {
            match qos {
                Qos::AtMostOnce => QoS::AtMostOnce,
                Qos::AtLeastOnce => QoS::AtLeastOnce,
                Qos::ExactlyOnce => QoS::ExactlyOnce,
            }
        }
    }

    /// [`MqttPublisher`] backed by a `rumqttc` client
    ///
    /// The event loop runs on its own task and reconnects forever; the
    /// connection flag follows `ConnAck` and poll errors.
    pub struct RumqttPublisher {
        client: AsyncClient,
        connected: Arc<AtomicBool>,
        event_task: JoinHandle<()>,
    }

    impl RumqttPublisher {
        /// Create the client and start its event loop
        ///
        /// Must be called from within a tokio runtime.
        pub fn connect(config: &MqttConfig) -> Self {
            let client_id = config.client_id_or_generate();
            let mut options = MqttOptions::new(&client_id, &config.host, config.port);
            options.set_keep_alive(config.keep_alive);
            if let (Some(user), Some(pass)) = (&config.username, &config.password) {
                options.set_credentials(user, pass);
            }

            let (client, eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
            let connected = Arc::new(AtomicBool::new(false));
            let event_task = tokio::spawn(drive_eventloop(eventloop, connected.clone()));

            info!(
                host = %config.host,
                port = config.port,
                client_id = %client_id,
                "MQTT client started"
            );

            Self {
                client,
                connected,
                event_task,
            }
        }

        /// Disconnect from the broker and stop the event loop
        pub async fn disconnect(self) {
            if let Err(e) = self.client.disconnect().await {
                debug!("MQTT disconnect: {}", e);
            }
            self.event_task.abort();
        }
    }

    async fn drive_eventloop(mut eventloop: EventLoop, connected: Arc<AtomicBool>) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected.store(true, Ordering::SeqCst);
                    info!("MQTT connected");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    connected.store(false, Ordering::SeqCst);
                    warn!("MQTT broker closed the session");
                }
                Ok(_) => {}
                Err(e) => {
                    if connected.swap(false, Ordering::SeqCst) {
                        warn!("MQTT connection lost: {}", e);
                    } else {
                        debug!("MQTT connect failed: {}", e);
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    #[async_trait]
    impl MqttPublisher for RumqttPublisher {
        async fn publish(&self, publication: &MqttPublication) -> Result<()> {
            // rumqttc reports a bad topic like a full request queue
            validate_topic(&publication.topic)?;
            if !self.is_connected() {
                return Err(NowMqttError::MqttDisconnected);
            }
            self.client.try_publish(
                publication.topic.as_str(),
                publication.qos.into(),
                publication.retain,
                publication.payload.to_vec(),
            )?;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    impl Drop for RumqttPublisher {
        fn drop(&mut self) {
            self.event_task.abort();
        }
    }
}
