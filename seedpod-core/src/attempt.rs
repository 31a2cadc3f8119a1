//! One download attempt: a batch of reserved segments fetched from one peer, verified and
//! committed, or released on any failure.

use std::sync::Arc;

use futures::StreamExt;

use crate::context::EngineContext;
use crate::contracts::{StorageError, TransportFault};
use crate::package::PackageId;
use crate::peer::{FaultKind, PeerId, PeerRecord};
use crate::registry::{LocalPackage, SharedPackageGuard};
use crate::slots::SlotPermit;
use crate::status::PackageStatusTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Created,
    Reserving,
    Transferring,
    Committing,
    Aborting,
    Done,
}

impl AttemptState {
    fn can_move_to(self, next: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, next),
            (Created, Reserving)
                | (Reserving, Transferring)
                | (Reserving, Done)
                | (Transferring, Committing)
                | (Transferring, Aborting)
                | (Committing, Done)
                | (Aborting, Done)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportFault),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("stream ended after {received} of {expected} bytes")]
    ShortRead { expected: u64, received: u64 },
    #[error("peer sent more than the {expected} bytes requested")]
    Overflow { expected: u64 },
}

impl AttemptError {
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            AttemptError::Storage(StorageError::HashMismatch { .. }) => FaultKind::Integrity,
            _ => FaultKind::Communication,
        }
    }
}

/// Result of [`DownloadAttempt::try_start`].
#[derive(Debug)]
pub enum StartOutcome {
    Started(tokio::task::JoinHandle<()>),
    /// The package is being deleted; leave it alone.
    MarkedForDelete,
    /// Every missing byte is already reserved or the package is complete.
    NoMoreToDownload,
    /// This peer has nothing we can reserve right now.
    NoMatchWithPeer,
}

/// Delivered to the continuation once the attempt is done and its slot is free.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub id: u64,
    pub package: PackageId,
    pub peer: PeerId,
    pub segments: Vec<u32>,
    pub succeeded: bool,
    /// This attempt committed the last missing segment.
    pub completed_package: bool,
}

pub struct DownloadAttempt {
    id: u64,
    ctx: Arc<EngineContext>,
    tracker: Arc<PackageStatusTracker>,
    package: Arc<LocalPackage>,
    peer: Arc<PeerRecord>,
    segments: Vec<u32>,
    state: AttemptState,
}

impl DownloadAttempt {
    pub fn new(
        id: u64,
        ctx: Arc<EngineContext>,
        tracker: Arc<PackageStatusTracker>,
        package: Arc<LocalPackage>,
        peer: Arc<PeerRecord>,
    ) -> Self {
        Self {
            id,
            ctx,
            tracker,
            package,
            peer,
            segments: Vec::new(),
            state: AttemptState::Created,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    fn transition(&mut self, next: AttemptState) {
        debug_assert!(
            self.state.can_move_to(next),
            "attempt {} moved {:?} -> {:?}",
            self.id,
            self.state,
            next
        );
        self.state = next;
    }

    /// Reserve segments the peer has and spawn the transfer. `permit` is the download slot;
    /// it is freed before `on_done` runs, or right away when nothing starts.
    pub fn try_start<F>(mut self, permit: SlotPermit, on_done: F) -> StartOutcome
    where
        F: FnOnce(AttemptReport) + Send + 'static,
    {
        self.transition(AttemptState::Reserving);
        let Some(guard) = self.package.try_lock_shared() else {
            return StartOutcome::MarkedForDelete;
        };
        let state = self.package.state();
        if !state.has_more_to_download() {
            return StartOutcome::NoMoreToDownload;
        }

        let id = self.package.id();
        let peer = self.peer.id();
        let config = &self.ctx.config;
        let Some(remote) = self.tracker.remote_segments(&id, &peer) else {
            self.tracker.postpone(&peer, &id, config.no_match_postpone());
            return StartOutcome::NoMatchWithPeer;
        };
        let segments =
            state.reserve_segments_for_download(remote.bitmap(), config.segments_per_request.max(1));
        if segments.is_empty() {
            self.tracker.postpone(&peer, &id, config.no_match_postpone());
            if state.progress() < config.fast_refresh_progress {
                self.tracker.mark_fast_refresh(&peer, &id);
            }
            tracing::debug!(package = %id.short(), %peer, "no matching segments");
            return StartOutcome::NoMatchWithPeer;
        }

        tracing::debug!(
            attempt = self.id,
            package = %id.short(),
            %peer,
            ?segments,
            "download attempt started"
        );
        self.segments = segments;
        self.transition(AttemptState::Transferring);
        let handle = tokio::spawn(async move {
            let report = self.run(guard, permit).await;
            on_done(report);
        });
        StartOutcome::Started(handle)
    }

    /// Transfer body. Consumes the attempt so the shared lock and the slot are gone before the
    /// report is returned.
    async fn run(mut self, _guard: SharedPackageGuard, _permit: SlotPermit) -> AttemptReport {
        let result = self.transfer().await;
        let now = self.ctx.clock.now();
        let id = self.package.id();
        let mut completed_package = false;
        let succeeded = match result {
            Ok(bytes) => {
                self.transition(AttemptState::Committing);
                let outcome = self.package.state().release_segments(&self.segments, true);
                self.ctx.stats.attempt_succeeded(bytes);
                self.peer.record_success(now);
                self.tracker.reset_postpone(&self.peer.id());
                completed_package = outcome.completed;
                if outcome.completed
                    || self
                        .package
                        .claim_persist(now, self.ctx.config.persist_interval())
                {
                    self.persist().await;
                }
                if outcome.completed {
                    tracing::info!(package = %id.short(), "package download complete");
                }
                true
            }
            Err(e) => {
                self.transition(AttemptState::Aborting);
                self.package.state().release_segments(&self.segments, false);
                let kind = e.fault_kind();
                self.ctx.stats.attempt_failed(kind == FaultKind::Integrity);
                match kind {
                    FaultKind::Integrity => tracing::warn!(
                        package = %id.short(),
                        peer = %self.peer.id(),
                        error = %e,
                        "peer served corrupt data"
                    ),
                    FaultKind::Communication => tracing::debug!(
                        package = %id.short(),
                        peer = %self.peer.id(),
                        error = %e,
                        "download attempt failed"
                    ),
                }
                self.peer.record_failure(now, kind, &self.ctx.policy);
                self.tracker
                    .postpone_globally(&self.peer.id(), self.ctx.config.failure_postpone());
                false
            }
        };
        self.transition(AttemptState::Done);
        AttemptReport {
            id: self.id,
            package: id,
            peer: self.peer.id(),
            segments: std::mem::take(&mut self.segments),
            succeeded,
            completed_package,
        }
    }

    /// Fetch exactly the reserved segments and pipe them through the verified writer.
    async fn transfer(&self) -> Result<u64, AttemptError> {
        let id = self.package.id();
        let expected = self.package.split().segments_size(&self.segments);
        let mut stream = self
            .ctx
            .transport
            .fetch_segments(self.peer.endpoint(), id, self.segments.clone())
            .await?;
        let mut writer = self
            .ctx
            .storage
            .open_verified_write(id, self.segments.clone())
            .await?;
        let mut received = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(TransportFault::Communication)?;
            received += chunk.len() as u64;
            if received > expected {
                return Err(AttemptError::Overflow { expected });
            }
            writer.write(chunk).await?;
        }
        if received < expected {
            return Err(AttemptError::ShortRead { expected, received });
        }
        writer.finish().await?;
        Ok(received)
    }

    async fn persist(&self) {
        if let Err(e) = self.package.persist_status(self.ctx.storage.as_ref()).await {
            tracing::warn!(
                package = %self.package.id().short(),
                error = %e,
                "failed to persist download status"
            );
        }
    }
}
