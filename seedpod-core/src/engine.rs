//! Engine assembly: builds the components around one shared context and runs the scheduler
//! and the status refresh loop.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bitmap::{BitmapError, SegmentBitmap};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::context::{EngineContext, StatsSnapshot};
use crate::contracts::{PeerRegistry, Storage, Transport};
use crate::coordinator::DownloadCoordinator;
use crate::package::{PackageId, PackageSplitInfo};
use crate::registry::{LocalPackage, RegistryError};
use crate::slots::SlotSnapshot;
use crate::state::PackageDownloadState;
use crate::status::PackageStatusTracker;
use crate::upload::SegmentServer;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("persisted bitmap rejected: {0}")]
    Bitmap(#[from] BitmapError),
}

/// Progress of one local package.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackageProgress {
    pub bytes_downloaded: u64,
    pub package_size: u64,
    pub downloading: bool,
}

pub struct SyncEngine {
    ctx: Arc<EngineContext>,
    tracker: Arc<PackageStatusTracker>,
    coordinator: Arc<DownloadCoordinator>,
    server: SegmentServer,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build the engine and spawn its loops on the current tokio runtime.
    pub fn start(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        peers: Arc<dyn PeerRegistry>,
    ) -> Self {
        Self::start_with_clock(config, transport, storage, peers, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        peers: Arc<dyn PeerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (ctx, wakes) = EngineContext::new(config, transport, storage, peers, clock);
        let tracker = Arc::new(PackageStatusTracker::new(ctx.clone()));
        let coordinator = Arc::new(DownloadCoordinator::new(ctx.clone(), tracker.clone()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(coordinator.clone().run(wakes, shutdown_rx.clone())),
            tokio::spawn(tracker.clone().run(shutdown_rx)),
        ];
        tracing::info!(
            download_slots = ctx.config.download_slots,
            upload_slots = ctx.config.upload_slots,
            "sync engine started"
        );
        Self {
            server: SegmentServer::new(ctx.clone()),
            ctx,
            tracker,
            coordinator,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    /// Register a package whose every segment is already in storage.
    pub fn register_downloaded(
        &self,
        id: PackageId,
        split: PackageSplitInfo,
    ) -> Result<(), EngineError> {
        self.ctx
            .packages
            .register(LocalPackage::new(PackageDownloadState::downloaded(id, split)))?;
        tracing::info!(package = %id.short(), "package registered");
        Ok(())
    }

    /// Register a download target and start downloading it. `persisted` restores a bitmap
    /// saved by an earlier run; a complete bitmap registers the package as downloaded.
    pub fn start_download(
        &self,
        id: PackageId,
        split: PackageSplitInfo,
        persisted: Option<Vec<u8>>,
    ) -> Result<(), EngineError> {
        let local = persisted
            .map(|b| SegmentBitmap::from_bytes(b, split.segments_count()))
            .transpose()?;
        let state = PackageDownloadState::for_download(id, split, local)?;
        let package = self.ctx.packages.register(LocalPackage::new(state))?;
        self.coordinator.start_package(package);
        Ok(())
    }

    /// Stop downloading, wait for every transfer using the package to finish, then forget it.
    pub async fn delete_package(&self, id: &PackageId) -> Result<(), EngineError> {
        self.coordinator.stop_package(id, false);
        self.ctx.packages.delete(id).await?;
        Ok(())
    }

    pub fn catalog_version(&self) -> u64 {
        self.ctx.packages.catalog_version()
    }

    pub fn progress(&self, id: &PackageId) -> Option<PackageProgress> {
        let package = self.ctx.packages.get(id)?;
        let state = package.state();
        Some(PackageProgress {
            bytes_downloaded: state.bytes_downloaded(),
            package_size: package.split().package_size(),
            downloading: self.coordinator.is_downloading(id),
        })
    }

    pub fn server(&self) -> &SegmentServer {
        &self.server
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn slots(&self) -> SlotSnapshot {
        self.ctx.slots.snapshot()
    }

    /// Ask for a status refresh now instead of at the next cycle.
    pub fn refresh_now(&self) {
        self.tracker.request_refresh();
    }

    /// Stop both loops and wait for them. In-flight attempts are not awaited.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "engine task failed");
            }
        }
        tracing::info!("sync engine stopped");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
