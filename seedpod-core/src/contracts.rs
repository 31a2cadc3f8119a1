//! Collaborator contracts: the engine moves bytes and reads peer lists only through these.
//!
//! Async methods return boxed futures so the traits stay dyn-compatible
//! (`Arc<dyn Transport>` etc.).

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::package::PackageId;
use crate::peer::PeerInfo;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Segment bytes in request order, as a stream of chunks of any size.
pub type SegmentStream = BoxStream<'static, io::Result<Bytes>>;

/// Why a remote peer did not serve a request.
#[derive(Debug, thiserror::Error)]
pub enum TransportFault {
    #[error("peer has no free upload slot")]
    Choked,
    #[error("peer does not have the package")]
    PackageNotFound,
    #[error("peer does not have the requested segments")]
    SegmentsNotFound,
    #[error("communication failure: {0}")]
    Communication(#[from] io::Error),
}

/// What a peer reports about one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStatus {
    pub found: bool,
    pub bytes_downloaded: u64,
    /// `None` with `found` means the peer has every segment.
    pub bitmap: Option<Vec<u8>>,
}

impl PackageStatus {
    pub fn not_found() -> Self {
        Self {
            found: false,
            bytes_downloaded: 0,
            bitmap: None,
        }
    }
}

/// Request/response transport to other peers.
pub trait Transport: Send + Sync {
    /// Stream exactly the bytes of `segments` of `package`, in the given order.
    fn fetch_segments(
        &self,
        endpoint: SocketAddr,
        package: PackageId,
        segments: Vec<u32>,
    ) -> BoxFuture<'_, Result<SegmentStream, TransportFault>>;

    /// One status entry per requested package, in request order.
    fn fetch_remote_status(
        &self,
        endpoint: SocketAddr,
        packages: Vec<PackageId>,
    ) -> BoxFuture<'_, Result<Vec<PackageStatus>, TransportFault>>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("hash mismatch on segment {segment}")]
    HashMismatch { segment: u32 },
    #[error("package {0} not in storage")]
    PackageNotFound(PackageId),
    #[error("storage i/o: {0}")]
    Io(#[from] io::Error),
}

/// Write side of the verification pipeline for one request's segments.
///
/// Segments verified and written before a mismatch stay written; the caller decides what to
/// commit.
pub trait VerifiedWriter: Send {
    fn write(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Flush and check that every segment arrived and matched its hash.
    fn finish(self: Box<Self>) -> BoxFuture<'static, Result<(), StorageError>>;
}

/// Local package data.
pub trait Storage: Send + Sync {
    fn open_verified_write(
        &self,
        package: PackageId,
        segments: Vec<u32>,
    ) -> BoxFuture<'_, Result<Box<dyn VerifiedWriter>, StorageError>>;

    fn read_segments(
        &self,
        package: PackageId,
        segments: Vec<u32>,
    ) -> BoxFuture<'_, Result<SegmentStream, StorageError>>;

    /// Best effort. `None` records the package as complete.
    fn persist_download_status(
        &self,
        package: PackageId,
        bitmap: Option<Vec<u8>>,
    ) -> BoxFuture<'_, Result<(), StorageError>>;
}

/// A peer and the packages it advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownPeer {
    pub info: PeerInfo,
    /// `None` when the peer's catalog is unknown; it is then asked about every package.
    pub packages: Option<Vec<PackageId>>,
}

impl KnownPeer {
    pub fn advertises(&self, package: &PackageId) -> bool {
        self.packages.as_ref().map_or(true, |p| p.contains(package))
    }
}

/// Read-only view of the host's peer list. The engine never adds or removes peers.
pub trait PeerRegistry: Send + Sync {
    fn peers(&self) -> Vec<KnownPeer>;
}
