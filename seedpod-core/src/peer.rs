//! Peer identity and health: failure counters, disable policy and the global postpone
//! deadline.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::config::EngineConfig;

/// Peer ID: 16 opaque bytes. Hosts with an identity layer derive it from a public key; others
/// use [`PeerId::random`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_16")] [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn random() -> Self {
        PeerId(uuid::Uuid::new_v4().into_bytes())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A peer as listed by the host's peer registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub endpoint: SocketAddr,
}

/// Kind of failure charged to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Timeout, refused connection, malformed reply, choke, not-found, short read.
    Communication,
    /// Served data did not match its hash.
    Integrity,
}

/// Thresholds applied to peer health, taken from [`EngineConfig`].
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub disable_threshold: u32,
    pub integrity_failure_weight: u32,
    pub disabled_probe_interval: Duration,
}

impl From<&EngineConfig> for HealthPolicy {
    fn from(c: &EngineConfig) -> Self {
        Self {
            disable_threshold: c.disable_threshold.max(1),
            integrity_failure_weight: c.integrity_failure_weight.max(1),
            disabled_probe_interval: c.disabled_probe_interval(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Health {
    last_success: Option<Instant>,
    last_fail: Option<Instant>,
    consecutive_failures: u32,
    disabled_since: Option<Instant>,
    postponed_until: Option<Instant>,
    successes: u64,
    failures: u64,
    integrity_failures: u64,
}

/// Counters exposed for status reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub consecutive_failures: u32,
    pub disabled: bool,
    pub successes: u64,
    pub failures: u64,
    pub integrity_failures: u64,
}

/// Health record of one peer. Owns its own lock; never held across another lock.
#[derive(Debug)]
pub struct PeerRecord {
    id: PeerId,
    endpoint: Mutex<SocketAddr>,
    health: Mutex<Health>,
}

impl PeerRecord {
    pub fn new(info: &PeerInfo) -> Self {
        Self {
            id: info.id,
            endpoint: Mutex::new(info.endpoint),
            health: Mutex::new(Health::default()),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        *self.endpoint.lock()
    }

    fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.endpoint.lock() = endpoint;
    }

    /// Any successful exchange clears the failure streak and re-enables the peer.
    pub fn record_success(&self, now: Instant) {
        let mut h = self.health.lock();
        h.last_success = Some(now);
        h.consecutive_failures = 0;
        h.successes += 1;
        if h.disabled_since.take().is_some() {
            tracing::info!(peer = %self.id, "peer re-enabled");
        }
    }

    pub fn record_failure(&self, now: Instant, kind: FaultKind, policy: &HealthPolicy) {
        let mut h = self.health.lock();
        let weight = match kind {
            FaultKind::Communication => 1,
            FaultKind::Integrity => {
                h.integrity_failures += 1;
                policy.integrity_failure_weight
            }
        };
        h.last_fail = Some(now);
        h.failures += 1;
        h.consecutive_failures = h.consecutive_failures.saturating_add(weight);
        if h.disabled_since.is_none() && h.consecutive_failures >= policy.disable_threshold {
            h.disabled_since = Some(now);
            tracing::warn!(
                peer = %self.id,
                failures = h.consecutive_failures,
                "peer disabled"
            );
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.health.lock().disabled_since.is_some()
    }

    /// Whether a status request may be sent: enabled peers always, disabled ones once the
    /// probe interval has passed since their last failure.
    pub fn can_probe(&self, now: Instant, policy: &HealthPolicy) -> bool {
        let h = self.health.lock();
        if h.disabled_since.is_none() {
            return true;
        }
        h.last_fail
            .map_or(true, |t| now.duration_since(t) >= policy.disabled_probe_interval)
    }

    pub fn postpone(&self, now: Instant, interval: Duration) {
        let mut h = self.health.lock();
        let until = now + interval;
        if h.postponed_until.map_or(true, |t| t < until) {
            h.postponed_until = Some(until);
        }
    }

    pub fn reset_postpone(&self) {
        self.health.lock().postponed_until = None;
    }

    pub fn is_postponed(&self, now: Instant) -> bool {
        clock::is_before(now, self.health.lock().postponed_until)
    }

    /// Usable for downloads: neither disabled nor postponed.
    pub fn is_eligible(&self, now: Instant) -> bool {
        let h = self.health.lock();
        h.disabled_since.is_none() && !clock::is_before(now, h.postponed_until)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let h = self.health.lock();
        HealthSnapshot {
            consecutive_failures: h.consecutive_failures,
            disabled: h.disabled_since.is_some(),
            successes: h.successes,
            failures: h.failures,
            integrity_failures: h.integrity_failures,
        }
    }
}

/// Health records of every peer the engine has talked to, keyed by id.
#[derive(Debug, Default)]
pub struct PeerBook {
    peers: Mutex<HashMap<PeerId, Arc<PeerRecord>>>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for `info`, created on first contact. A changed endpoint is updated in place.
    pub fn get_or_insert(&self, info: &PeerInfo) -> Arc<PeerRecord> {
        let mut peers = self.peers.lock();
        let record = peers
            .entry(info.id)
            .or_insert_with(|| Arc::new(PeerRecord::new(info)))
            .clone();
        drop(peers);
        if record.endpoint() != info.endpoint {
            record.set_endpoint(info.endpoint);
        }
        record
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<PeerRecord>> {
        self.peers.lock().get(id).cloned()
    }

    /// Drop records of peers the registry no longer lists.
    pub fn retain(&self, known: &[PeerId]) {
        self.peers.lock().retain(|id, _| known.contains(id));
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
