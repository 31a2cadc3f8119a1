//! Serving side: status replies, segment offers and segment streams for remote peers.

use std::sync::Arc;

use futures::StreamExt;

use crate::bitmap::BitmapError;
use crate::context::EngineContext;
use crate::contracts::{PackageStatus, SegmentStream, StorageError};
use crate::package::PackageId;
use crate::registry::LocalPackage;

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("no free upload slot")]
    Choked,
    #[error("package {0} not available")]
    PackageNotFound(PackageId),
    #[error("requested segments are not available")]
    SegmentsNotFound,
    #[error("invalid bitmap: {0}")]
    InvalidBitmap(#[from] BitmapError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Clone)]
pub struct SegmentServer {
    ctx: Arc<EngineContext>,
}

impl SegmentServer {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    fn available(&self, id: &PackageId) -> Option<Arc<LocalPackage>> {
        self.ctx
            .packages
            .get(id)
            .filter(|p| !p.is_marked_for_delete())
    }

    /// One entry per requested id, in request order.
    pub fn local_status(&self, ids: &[PackageId]) -> Vec<PackageStatus> {
        ids.iter()
            .map(|id| match self.available(id) {
                None => PackageStatus::not_found(),
                Some(p) => PackageStatus {
                    found: true,
                    bytes_downloaded: p.state().bytes_downloaded(),
                    bitmap: p.state().bitmap_snapshot(),
                },
            })
            .collect()
    }

    /// Up to `max_count` segments we hold that the peer with bitmap `remote` lacks.
    pub fn offer(
        &self,
        id: &PackageId,
        remote: &[u8],
        max_count: usize,
    ) -> Result<Vec<u32>, ServeError> {
        let package = self
            .available(id)
            .ok_or(ServeError::PackageNotFound(*id))?;
        Ok(package.state().offer_segments_to_peer(remote, max_count)?)
    }

    /// Stream `segments` of `id` in request order. The upload slot and the package's shared
    /// lock are held until the stream is dropped.
    pub async fn serve_segments(
        &self,
        id: PackageId,
        segments: Vec<u32>,
    ) -> Result<SegmentStream, ServeError> {
        let permit = self
            .ctx
            .slots
            .upload
            .try_acquire()
            .ok_or(ServeError::Choked)?;
        let package = self
            .ctx
            .packages
            .get(&id)
            .ok_or(ServeError::PackageNotFound(id))?;
        let guard = package
            .try_lock_shared()
            .ok_or(ServeError::PackageNotFound(id))?;
        if segments.is_empty() || !package.state().contains_segments(&segments) {
            return Err(ServeError::SegmentsNotFound);
        }
        let stream = self.ctx.storage.read_segments(id, segments).await?;
        let ctx = self.ctx.clone();
        let held = (permit, guard);
        Ok(stream
            .map(move |chunk| {
                let _held = &held;
                if let Ok(bytes) = &chunk {
                    ctx.stats.uploaded(bytes.len() as u64);
                }
                chunk
            })
            .boxed())
    }
}
