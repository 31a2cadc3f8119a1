//! Engine tuning. Deserializable so hosts can embed it in their own config file
//! (e.g. an `[engine]` table); every field has a default.

use std::time::Duration;

use serde::Deserialize;

use crate::slots::{DEFAULT_DOWNLOAD_SLOTS, DEFAULT_UPLOAD_SLOTS};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Concurrent segment downloads across all packages.
    #[serde(default = "default_download_slots")]
    pub download_slots: usize,
    /// Concurrent segment uploads across all packages.
    #[serde(default = "default_upload_slots")]
    pub upload_slots: usize,
    /// Segments reserved and requested by one attempt.
    #[serde(default = "default_segments_per_request")]
    pub segments_per_request: usize,
    /// Period of the status refresh cycle.
    #[serde(default = "default_refresh_cycle_secs")]
    pub refresh_cycle_secs: u64,
    /// Status age after which a peer is polled again.
    #[serde(default = "default_regular_status_secs")]
    pub regular_status_secs: u64,
    /// Status age after which a peer in fast mode is polled again.
    #[serde(default = "default_fast_status_secs")]
    pub fast_status_secs: u64,
    /// Status requests in flight at once during one refresh cycle.
    #[serde(default = "default_status_concurrency")]
    pub status_concurrency: usize,
    /// Below this local progress a peer without matching segments is switched to fast refresh.
    #[serde(default = "default_fast_refresh_progress")]
    pub fast_refresh_progress: f64,
    /// Postpone of a (peer, package) pair after the peer had nothing we need.
    #[serde(default = "default_no_match_postpone_secs")]
    pub no_match_postpone_secs: u64,
    /// Global postpone of a peer after a failed transfer.
    #[serde(default = "default_failure_postpone_secs")]
    pub failure_postpone_secs: u64,
    /// Delay before rescheduling when no peer had anything to offer.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Minimum time between two persisted bitmaps of one package.
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
    /// Consecutive failures after which a peer is disabled.
    #[serde(default = "default_disable_threshold")]
    pub disable_threshold: u32,
    /// How many failures one hash mismatch counts for.
    #[serde(default = "default_integrity_failure_weight")]
    pub integrity_failure_weight: u32,
    /// A disabled peer is probed with a status request again after this long.
    #[serde(default = "default_disabled_probe_secs")]
    pub disabled_probe_secs: u64,
}

fn default_download_slots() -> usize {
    DEFAULT_DOWNLOAD_SLOTS
}
fn default_upload_slots() -> usize {
    DEFAULT_UPLOAD_SLOTS
}
fn default_segments_per_request() -> usize {
    4
}
fn default_refresh_cycle_secs() -> u64 {
    5
}
fn default_regular_status_secs() -> u64 {
    120
}
fn default_fast_status_secs() -> u64 {
    10
}
fn default_status_concurrency() -> usize {
    8
}
fn default_fast_refresh_progress() -> f64 {
    0.33
}
fn default_no_match_postpone_secs() -> u64 {
    20
}
fn default_failure_postpone_secs() -> u64 {
    60
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_persist_interval_secs() -> u64 {
    20
}
fn default_disable_threshold() -> u32 {
    3
}
fn default_integrity_failure_weight() -> u32 {
    2
}
fn default_disabled_probe_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_slots: default_download_slots(),
            upload_slots: default_upload_slots(),
            segments_per_request: default_segments_per_request(),
            refresh_cycle_secs: default_refresh_cycle_secs(),
            regular_status_secs: default_regular_status_secs(),
            fast_status_secs: default_fast_status_secs(),
            status_concurrency: default_status_concurrency(),
            fast_refresh_progress: default_fast_refresh_progress(),
            no_match_postpone_secs: default_no_match_postpone_secs(),
            failure_postpone_secs: default_failure_postpone_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            persist_interval_secs: default_persist_interval_secs(),
            disable_threshold: default_disable_threshold(),
            integrity_failure_weight: default_integrity_failure_weight(),
            disabled_probe_secs: default_disabled_probe_secs(),
        }
    }
}

impl EngineConfig {
    /// Never zero: the refresh loop ticks on it.
    pub fn refresh_cycle(&self) -> Duration {
        Duration::from_secs(self.refresh_cycle_secs.max(1))
    }
    pub fn regular_status_interval(&self) -> Duration {
        Duration::from_secs(self.regular_status_secs)
    }
    pub fn fast_status_interval(&self) -> Duration {
        Duration::from_secs(self.fast_status_secs)
    }
    pub fn no_match_postpone(&self) -> Duration {
        Duration::from_secs(self.no_match_postpone_secs)
    }
    pub fn failure_postpone(&self) -> Duration {
        Duration::from_secs(self.failure_postpone_secs)
    }
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }
    pub fn disabled_probe_interval(&self) -> Duration {
        Duration::from_secs(self.disabled_probe_secs)
    }
}
