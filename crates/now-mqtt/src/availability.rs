//! Peer availability tracking
//!
//! Every radio address the bridge has heard from gets a [`PeerDevice`] with
//! a three-state lifecycle:
//!
//! ```text
//!   unknown ──frame──► online ──silence > liveness_timeout──► offline
//!                        ▲                                      │
//!                        └───────────────frame──────────────────┘
//! ```
//!
//! The tracker only reports *changes*. An `online` is never reported twice
//! without an `offline` in between, and a silent device goes `offline`
//! exactly once no matter how many sweeps run.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::address::MacAddress;
use crate::config::BridgeConfig;

/// Availability of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Never heard from
    Unknown,
    /// Heard from within the liveness timeout
    Online,
    /// Silent for longer than the liveness timeout
    Offline,
}

impl PeerState {
    /// Payload published on the availability topic
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Unknown => "unknown",
            PeerState::Online => "online",
            PeerState::Offline => "offline",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A radio peer seen by the bridge
#[derive(Debug, Clone, PartialEq)]
pub struct PeerDevice {
    /// Radio address
    pub address: MacAddress,
    /// Current availability
    pub state: PeerState,
    /// First frame, or registration
    pub first_seen: Instant,
    /// Latest frame, or registration while no frame has arrived
    pub last_seen: Instant,
    /// Frames received from this peer
    pub frames_received: u64,
    /// Device name announced in sensor readings
    pub name: Option<String>,
}

impl PeerDevice {
    fn new(address: MacAddress, now: Instant) -> Self {
        Self {
            address,
            state: PeerState::Unknown,
            first_seen: now,
            last_seen: now,
            frames_received: 0,
            name: None,
        }
    }
}

/// A state change to publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityTransition {
    /// Peer that changed
    pub address: MacAddress,
    /// Previous state
    pub from: PeerState,
    /// New state
    pub to: PeerState,
}

/// Per-peer availability state machine
#[derive(Debug)]
pub struct AvailabilityTracker {
    peers: HashMap<MacAddress, PeerDevice>,
    liveness_timeout: Duration,
    transitions: u64,
}

impl AvailabilityTracker {
    /// Create a tracker with the given liveness timeout
    pub fn new(liveness_timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            liveness_timeout,
            transitions: 0,
        }
    }

    /// Create from bridge configuration
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.liveness_timeout)
    }

    /// Register a peer ahead of its first frame
    ///
    /// The peer starts in [`PeerState::Unknown`] and no transition is
    /// reported. Returns `false` if the peer was already known.
    pub fn register(&mut self, address: MacAddress, now: Instant) -> bool {
        if self.peers.contains_key(&address) {
            return false;
        }
        debug!(%address, "Peer registered");
        self.peers.insert(address, PeerDevice::new(address, now));
        true
    }

    /// Record a frame from `address`
    ///
    /// Returns the transition to online if the peer was unknown or offline.
    pub fn observe(&mut self, address: MacAddress, now: Instant) -> Option<AvailabilityTransition> {
        let peer = self.peers.entry(address).or_insert_with(|| {
            debug!(%address, "New peer");
            PeerDevice::new(address, now)
        });

        peer.last_seen = now;
        peer.frames_received += 1;

        if peer.state == PeerState::Online {
            return None;
        }

        let from = peer.state;
        peer.state = PeerState::Online;
        self.transitions += 1;
        info!(%address, %from, "Peer online");
        Some(AvailabilityTransition {
            address,
            from,
            to: PeerState::Online,
        })
    }

    /// Remember the device name a peer announced
    pub fn set_name(&mut self, address: MacAddress, name: &str) {
        if let Some(peer) = self.peers.get_mut(&address) {
            if peer.name.as_deref() != Some(name) {
                peer.name = Some(name.to_string());
            }
        }
    }

    /// Mark peers offline whose last frame is older than the timeout
    pub fn sweep(&mut self, now: Instant) -> Vec<AvailabilityTransition> {
        let timeout = self.liveness_timeout;
        let mut changed: Vec<AvailabilityTransition> = self
            .peers
            .values_mut()
            .filter(|peer| {
                peer.state == PeerState::Online
                    && now.saturating_duration_since(peer.last_seen) > timeout
            })
            .map(|peer| {
                peer.state = PeerState::Offline;
                info!(
                    address = %peer.address,
                    silent_secs = now.saturating_duration_since(peer.last_seen).as_secs(),
                    "Peer offline"
                );
                AvailabilityTransition {
                    address: peer.address,
                    from: PeerState::Online,
                    to: PeerState::Offline,
                }
            })
            .collect();

        changed.sort_by_key(|t| t.address);
        self.transitions += changed.len() as u64;
        changed
    }

    /// Look up a peer
    pub fn get(&self, address: &MacAddress) -> Option<&PeerDevice> {
        self.peers.get(address)
    }

    /// Snapshot of all peers, ordered by address
    pub fn peers(&self) -> Vec<PeerDevice> {
        let mut peers: Vec<PeerDevice> = self.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.address);
        peers
    }

    /// Peers currently online
    pub fn online_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Online)
            .count()
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if no peer was seen yet
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Transitions reported so far
    pub fn transitions(&self) -> u64 {
        self.transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: MacAddress = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);

    #[test]
    fn test_online_once() {
        let mut tracker = AvailabilityTracker::new(Duration::from_secs(300));
        let t0 = Instant::now();

        let first = tracker.observe(PEER, t0).unwrap();
        assert_eq!(first.from, PeerState::Unknown);
        assert_eq!(first.to, PeerState::Online);

        for i in 1..10 {
            assert!(tracker.observe(PEER, t0 + Duration::from_secs(i)).is_none());
        }
        assert_eq!(tracker.get(&PEER).unwrap().frames_received, 10);
        assert_eq!(tracker.transitions(), 1);
    }

    #[test]
    fn test_offline_exactly_once() {
        let mut tracker = AvailabilityTracker::new(Duration::from_secs(300));
        let t0 = Instant::now();
        tracker.observe(PEER, t0);

        // at the timeout boundary the peer is still online
        assert!(tracker.sweep(t0 + Duration::from_secs(300)).is_empty());

        let mut offline = 0;
        for minute in 6..30 {
            offline += tracker.sweep(t0 + Duration::from_secs(60 * minute)).len();
        }
        assert_eq!(offline, 1);
        assert_eq!(tracker.get(&PEER).unwrap().state, PeerState::Offline);
    }

    #[test]
    fn test_back_online_after_offline() {
        let mut tracker = AvailabilityTracker::new(Duration::from_secs(10));
        let t0 = Instant::now();
        tracker.observe(PEER, t0);
        tracker.sweep(t0 + Duration::from_secs(11));

        let back = tracker.observe(PEER, t0 + Duration::from_secs(12)).unwrap();
        assert_eq!(back.from, PeerState::Offline);
        assert_eq!(tracker.online_count(), 1);
        assert_eq!(tracker.transitions(), 3);
    }

    #[test]
    fn test_names_and_snapshot() {
        let mut tracker = AvailabilityTracker::new(Duration::from_secs(10));
        let t0 = Instant::now();
        let other = MacAddress::new([0x02, 0, 0, 0, 0, 0x09]);
        tracker.observe(PEER, t0);
        tracker.observe(other, t0);
        tracker.set_name(PEER, "garden");

        let peers = tracker.peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].address, other);
        assert_eq!(peers[1].name.as_deref(), Some("garden"));

        // names of unknown peers are ignored
        tracker.set_name(MacAddress::new([0x02, 0, 0, 0, 0, 0x0A]), "ghost");
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_registered_peer_starts_unknown() {
        let mut tracker = AvailabilityTracker::new(Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(tracker.register(PEER, t0));
        assert!(!tracker.register(PEER, t0));
        let peer = tracker.get(&PEER).unwrap();
        assert_eq!(peer.state, PeerState::Unknown);
        assert_eq!(peer.frames_received, 0);
        assert_eq!(tracker.transitions(), 0);

        // silence never turns an unknown peer offline
        assert!(tracker.sweep(t0 + Duration::from_secs(60)).is_empty());

        let first = tracker.observe(PEER, t0 + Duration::from_secs(61)).unwrap();
        assert_eq!(first.from, PeerState::Unknown);
        assert_eq!(tracker.get(&PEER).unwrap().first_seen, t0);

        // registering a live peer changes nothing
        assert!(!tracker.register(PEER, t0 + Duration::from_secs(62)));
        assert_eq!(tracker.get(&PEER).unwrap().state, PeerState::Online);
    }
}
