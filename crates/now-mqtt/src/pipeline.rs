//! Send pipeline: exactly one outcome per send
//!
//! The radio reports delivery asynchronously, may report it twice, may report
//! it late, or may never report it at all. [`SendPipeline`] keeps the table of
//! pending requests and turns that into exactly one resolution per request:
//!
//! - the first delivery callback for an id resolves it;
//! - later callbacks for the same id are recognised as duplicates through a
//!   bounded memory of resolved ids and discarded;
//! - callbacks for ids never issued are discarded as unknown;
//! - a request still pending after `send_timeout` is resolved as failure.
//!
//! Every resolution fires the [`SendHooks`] in order: `on_sent(latency)`,
//! then `on_send_success()` or `on_send_failure()`.
//!
//! The pipeline is plain synchronous state. It is owned by the transport
//! service task, which serializes submissions, callbacks and timeout checks,
//! so a late callback and a timeout can never both resolve the same request.

use bytes::Bytes;
use lru::LruCache;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::address::Destination;
use crate::config::TransportConfig;
use crate::error::{NowMqttError, Result};
use crate::hooks::SendHooks;
use crate::radio::{DeliveryOutcome, DeliveryReport};

/// How many resolved ids are remembered for duplicate detection
pub const RESOLVED_MEMORY: usize = 256;

/// Correlation token linking a delivery callback to its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendId(u32);

impl SendId {
    /// Wrap a raw id
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw id
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An outbound frame waiting for its outcome
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Correlation id
    pub id: SendId,
    /// Target peer or broadcast
    pub destination: Destination,
    /// Encoded frame
    pub payload: Bytes,
    /// When the caller submitted it
    pub submitted_at: Instant,
}

/// Why a send failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Driver reported a delivery failure
    Radio,
    /// No callback within the timeout
    Timeout,
    /// Driver refused the frame
    Refused,
    /// Pending table was full
    Busy,
    /// Service stopped before an outcome arrived
    Abandoned,
}

/// Final outcome of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered
    Success,
    /// Not delivered
    Failure(FailureReason),
}

impl SendOutcome {
    /// Check for success
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Success)
    }
}

/// A request that has just been resolved
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    /// Resolved request
    pub id: SendId,
    /// Outcome reported to the hooks
    pub outcome: SendOutcome,
    /// Time from submission to resolution
    pub latency: Duration,
}

/// Pipeline counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Requests admitted to the pending table
    pub submitted: u64,
    /// Resolved as success
    pub succeeded: u64,
    /// Resolved as failure (all reasons)
    pub failed: u64,
    /// Failures caused by the timeout
    pub timed_out: u64,
    /// Failures caused by a refusing driver
    pub refused: u64,
    /// Failures caused by a full pending table
    pub busy: u64,
    /// Callbacks discarded as duplicates
    pub duplicate_callbacks: u64,
    /// Callbacks discarded for unknown ids
    pub unknown_callbacks: u64,
}

/// Pending send table with exactly-once resolution
pub struct SendPipeline {
    /// Requests waiting for an outcome
    pending: HashMap<SendId, SendRequest>,
    /// Recently resolved ids
    resolved: LruCache<SendId, SendOutcome>,
    /// Automation callbacks
    hooks: SendHooks,
    /// Wait before a pending request fails
    send_timeout: Duration,
    /// Pending table capacity
    max_in_flight: usize,
    /// Counters
    stats: PipelineStats,
}

impl SendPipeline {
    /// Create from transport configuration
    pub fn from_config(config: &TransportConfig, hooks: SendHooks) -> Self {
        Self::with_limits(config.send_timeout, config.max_in_flight, hooks)
    }

    /// Create with explicit timeout and capacity
    pub fn with_limits(send_timeout: Duration, max_in_flight: usize, hooks: SendHooks) -> Self {
        let memory = NonZeroUsize::new(RESOLVED_MEMORY).unwrap_or(NonZeroUsize::MIN);
        Self {
            pending: HashMap::new(),
            resolved: LruCache::new(memory),
            hooks,
            send_timeout,
            max_in_flight: max_in_flight.max(1),
            stats: PipelineStats::default(),
        }
    }

    /// Admit a request into the pending table
    ///
    /// Returns `None` if the request should now be handed to the radio. If
    /// the table is full the request is resolved as a `Busy` failure on the
    /// spot and that resolution is returned instead.
    pub fn admit(&mut self, request: SendRequest, now: Instant) -> Option<Resolution> {
        if self.pending.len() >= self.max_in_flight {
            warn!(
                id = %request.id,
                in_flight = self.pending.len(),
                "Pending send table full"
            );
            let resolution = Resolution {
                id: request.id,
                outcome: SendOutcome::Failure(FailureReason::Busy),
                latency: now.saturating_duration_since(request.submitted_at),
            };
            self.finish(resolution);
            return Some(resolution);
        }

        trace!(
            id = %request.id,
            destination = %request.destination,
            len = request.payload.len(),
            "Send admitted"
        );
        self.stats.submitted += 1;
        self.pending.insert(request.id, request);
        None
    }

    /// The driver refused the frame outright
    pub fn transmit_failed(&mut self, id: SendId, now: Instant) -> Option<Resolution> {
        self.resolve(id, SendOutcome::Failure(FailureReason::Refused), now)
    }

    /// Apply a delivery callback from the driver
    ///
    /// Returns the resolution, or [`NowMqttError::DuplicateCallback`] /
    /// [`NowMqttError::UnknownSend`] when the callback must be discarded.
    pub fn on_delivery(&mut self, report: DeliveryReport, now: Instant) -> Result<Resolution> {
        let outcome = match report.outcome {
            DeliveryOutcome::Success => SendOutcome::Success,
            DeliveryOutcome::Failure => SendOutcome::Failure(FailureReason::Radio),
        };

        if let Some(resolution) = self.resolve(report.id, outcome, now) {
            return Ok(resolution);
        }

        if self.resolved.contains(&report.id) {
            self.stats.duplicate_callbacks += 1;
            Err(NowMqttError::DuplicateCallback(report.id))
        } else {
            self.stats.unknown_callbacks += 1;
            Err(NowMqttError::UnknownSend(report.id))
        }
    }

    /// Fail every request older than the timeout
    pub fn expire(&mut self, now: Instant) -> Vec<Resolution> {
        let timeout = self.send_timeout;
        let mut expired: Vec<SendId> = self
            .pending
            .values()
            .filter(|req| now.saturating_duration_since(req.submitted_at) >= timeout)
            .map(|req| req.id)
            .collect();
        expired.sort();

        expired
            .into_iter()
            .filter_map(|id| {
                warn!(
                    "{}",
                    NowMqttError::SendTimeout {
                        id,
                        duration_ms: timeout.as_millis() as u64,
                    }
                );
                self.resolve(id, SendOutcome::Failure(FailureReason::Timeout), now)
            })
            .collect()
    }

    /// Fail everything still pending, used when the service stops
    pub fn abandon_all(&mut self, now: Instant) -> Vec<Resolution> {
        let mut ids: Vec<SendId> = self.pending.keys().copied().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.resolve(id, SendOutcome::Failure(FailureReason::Abandoned), now))
            .collect()
    }

    /// Earliest moment a pending request times out
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|req| req.submitted_at + self.send_timeout)
            .min()
    }

    /// Number of pending requests
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Check whether a request is still waiting
    pub fn is_pending(&self, id: SendId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Counters
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    fn resolve(&mut self, id: SendId, outcome: SendOutcome, now: Instant) -> Option<Resolution> {
        let request = self.pending.remove(&id)?;
        let resolution = Resolution {
            id,
            outcome,
            latency: now.saturating_duration_since(request.submitted_at),
        };
        self.finish(resolution);
        Some(resolution)
    }

    fn finish(&mut self, resolution: Resolution) {
        match resolution.outcome {
            SendOutcome::Success => self.stats.succeeded += 1,
            SendOutcome::Failure(reason) => {
                self.stats.failed += 1;
                match reason {
                    FailureReason::Timeout => self.stats.timed_out += 1,
                    FailureReason::Refused => self.stats.refused += 1,
                    FailureReason::Busy => self.stats.busy += 1,
                    FailureReason::Radio | FailureReason::Abandoned => {}
                }
            }
        }
        self.resolved.put(resolution.id, resolution.outcome);
        debug!(
            id = %resolution.id,
            outcome = ?resolution.outcome,
            latency_ms = resolution.latency.as_millis() as u64,
            "Send resolved"
        );
        self.hooks.fire(
            resolution.latency.as_secs_f32(),
            resolution.outcome.is_success(),
        );
    }
}

impl fmt::Debug for SendPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendPipeline")
            .field("in_flight", &self.pending.len())
            .field("send_timeout", &self.send_timeout)
            .field("max_in_flight", &self.max_in_flight)
            .field("stats", &self.stats)
            .finish()
    }
}
