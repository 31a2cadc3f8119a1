//! Download scheduling: which packages are downloading, and turning free download slots into
//! attempts against candidate peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use rand::Rng;
use tokio::sync::watch;

use crate::attempt::{AttemptReport, DownloadAttempt, StartOutcome};
use crate::context::EngineContext;
use crate::package::PackageId;
use crate::peer::PeerId;
use crate::registry::LocalPackage;
use crate::status::PackageStatusTracker;
use crate::wake::{Wake, WakeReceiver};

#[derive(Default)]
struct CoordinatorState {
    downloading: HashMap<PackageId, Arc<LocalPackage>>,
    active: HashMap<u64, (PackageId, PeerId)>,
}

pub struct DownloadCoordinator {
    ctx: Arc<EngineContext>,
    tracker: Arc<PackageStatusTracker>,
    state: Mutex<CoordinatorState>,
    retry_armed: AtomicBool,
}

impl DownloadCoordinator {
    pub fn new(ctx: Arc<EngineContext>, tracker: Arc<PackageStatusTracker>) -> Self {
        Self {
            ctx,
            tracker,
            state: Mutex::new(CoordinatorState::default()),
            retry_armed: AtomicBool::new(false),
        }
    }

    /// Begin downloading `package`. Returns false when it is already complete or already
    /// downloading.
    pub fn start_package(&self, package: Arc<LocalPackage>) -> bool {
        if package.state().is_downloaded() {
            return false;
        }
        let id = package.id();
        let split = package.split();
        package.state().set_downloading(true);
        let inserted = self
            .state
            .lock()
            .downloading
            .insert(id, package)
            .is_none();
        if inserted {
            self.tracker.start_tracking(id, split);
            tracing::info!(package = %id.short(), size = split.package_size(), "download started");
            self.ctx.wake.wake(Wake::PackageAdded);
        }
        inserted
    }

    /// Stop scheduling `id`. In-flight attempts run to completion. `completed` bumps the
    /// catalog version.
    pub fn stop_package(&self, id: &PackageId, completed: bool) -> bool {
        let Some(package) = self.state.lock().downloading.remove(id) else {
            return false;
        };
        package.state().set_downloading(false);
        self.tracker.stop_tracking(id);
        if completed {
            self.ctx.packages.bump_catalog_version();
        }
        tracing::debug!(package = %id.short(), completed, "download stopped");
        self.ctx.wake.wake(Wake::PackageRemoved);
        true
    }

    pub fn is_downloading(&self, id: &PackageId) -> bool {
        self.state.lock().downloading.contains_key(id)
    }

    pub fn active_attempts(&self) -> usize {
        self.state.lock().active.len()
    }

    /// One scheduling pass over a randomly picked package. Returns the attempts started.
    pub fn try_schedule_more(self: &Arc<Self>) -> usize {
        let slots = &self.ctx.slots.download;
        if !slots.has_free() {
            return 0;
        }
        let package = {
            let state = self.state.lock();
            match state
                .downloading
                .values()
                .choose(&mut rand::thread_rng())
            {
                Some(p) => p.clone(),
                None => return 0,
            }
        };
        let id = package.id();
        let mut candidates = self.tracker.candidate_peers(&id);
        let mut started = 0;
        while !candidates.is_empty() {
            let Some(permit) = slots.try_acquire() else {
                break;
            };
            let pick = rand::thread_rng().gen_range(0..candidates.len());
            let peer = candidates.swap_remove(pick);
            let peer_id = peer.id();
            let attempt_id = self.ctx.stats.attempt_started();
            // registered before the start so a fast finish finds its entry
            self.state.lock().active.insert(attempt_id, (id, peer_id));
            let attempt = DownloadAttempt::new(
                attempt_id,
                self.ctx.clone(),
                self.tracker.clone(),
                package.clone(),
                peer,
            );
            let this = self.clone();
            match attempt.try_start(permit, move |report| this.attempt_done(report)) {
                StartOutcome::Started(_) => started += 1,
                outcome => {
                    self.state.lock().active.remove(&attempt_id);
                    match outcome {
                        StartOutcome::NoMatchWithPeer => continue,
                        _ => break,
                    }
                }
            }
        }
        if started == 0 && slots.has_free() {
            self.arm_retry();
        }
        started
    }

    fn attempt_done(&self, report: AttemptReport) {
        self.state.lock().active.remove(&report.id);
        if report.completed_package {
            self.stop_package(&report.package, true);
        }
        self.ctx.wake.wake(Wake::SlotReleased);
    }

    /// At most one pending retry at a time.
    fn arm_retry(self: &Arc<Self>) {
        if self.retry_armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = self.clone();
        let delay = self.ctx.config.retry_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.retry_armed.store(false, Ordering::Release);
            this.ctx.wake.wake(Wake::RetryTimer);
        });
    }

    /// Schedule on every wake-up until shutdown. Wake-ups queued meanwhile are coalesced.
    pub async fn run(self: Arc<Self>, mut wakes: WakeReceiver, mut shutdown: watch::Receiver<bool>) {
        loop {
            let reason = tokio::select! {
                _ = shutdown.changed() => break,
                reason = wakes.recv() => match reason {
                    Some(reason) => reason,
                    None => break,
                },
            };
            tracing::trace!(?reason, "scheduler woken");
            while wakes.try_recv().is_ok() {}
            while self.try_schedule_more() > 0 {}
        }
        tracing::debug!("download coordinator stopped");
    }
}
