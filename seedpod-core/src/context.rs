//! Shared state handed to every engine component.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::contracts::{PeerRegistry, Storage, Transport};
use crate::peer::{HealthPolicy, PeerBook};
use crate::registry::LocalPackageRegistry;
use crate::slots::ConcurrencySlots;
use crate::wake::{self, WakeReceiver, WakeSender};

/// Engine-wide counters. Relaxed atomics: they are reported, never synchronized on.
#[derive(Debug, Default)]
pub struct EngineStats {
    attempts_started: AtomicU64,
    attempts_succeeded: AtomicU64,
    attempts_failed: AtomicU64,
    integrity_failures: AtomicU64,
    bytes_downloaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    status_requests: AtomicU64,
    status_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub attempts_started: u64,
    pub attempts_succeeded: u64,
    pub attempts_failed: u64,
    pub integrity_failures: u64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub status_requests: u64,
    pub status_failures: u64,
}

impl EngineStats {
    /// Counts a started attempt and returns its sequence number.
    pub(crate) fn attempt_started(&self) -> u64 {
        self.attempts_started.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn attempt_succeeded(&self, bytes: u64) {
        self.attempts_succeeded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn attempt_failed(&self, integrity: bool) {
        self.attempts_failed.fetch_add(1, Ordering::Relaxed);
        if integrity {
            self.integrity_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn uploaded(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn status_request(&self, ok: bool) {
        self.status_requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.status_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts_started: self.attempts_started.load(Ordering::Relaxed),
            attempts_succeeded: self.attempts_succeeded.load(Ordering::Relaxed),
            attempts_failed: self.attempts_failed.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            status_requests: self.status_requests.load(Ordering::Relaxed),
            status_failures: self.status_failures.load(Ordering::Relaxed),
        }
    }
}

/// Collaborators, configuration and the state every component shares.
pub struct EngineContext {
    pub config: EngineConfig,
    pub policy: HealthPolicy,
    pub clock: Arc<dyn Clock>,
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<dyn Storage>,
    pub peer_registry: Arc<dyn PeerRegistry>,
    pub packages: LocalPackageRegistry,
    pub peers: PeerBook,
    pub slots: ConcurrencySlots,
    pub stats: EngineStats,
    pub wake: WakeSender,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        peer_registry: Arc<dyn PeerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> (Arc<Self>, WakeReceiver) {
        let (wake, wakes) = wake::channel();
        let ctx = Self {
            policy: HealthPolicy::from(&config),
            slots: ConcurrencySlots::new(config.download_slots, config.upload_slots),
            config,
            clock,
            transport,
            storage,
            peer_registry,
            packages: LocalPackageRegistry::new(),
            peers: PeerBook::new(),
            stats: EngineStats::default(),
            wake,
        };
        (Arc::new(ctx), wakes)
    }
}
