//! In-memory collaborators for engine tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::bitmap::{self, SegmentBitmap};
use crate::clock::ManualClock;
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::contracts::{
    BoxFuture, KnownPeer, PackageStatus, PeerRegistry, SegmentStream, Storage, StorageError,
    Transport, TransportFault, VerifiedWriter,
};
use crate::integrity::{self, SegmentVerifier, VerifyError};
use crate::package::{PackageId, PackageSplitInfo};
use crate::peer::{PeerId, PeerInfo};
use crate::registry::LocalPackage;
use crate::state::PackageDownloadState;
use crate::wake::{Wake, WakeReceiver};

/// Package content with its layout and hashes.
#[derive(Clone)]
pub struct TestPackage {
    pub id: PackageId,
    pub split: PackageSplitInfo,
    pub data: Arc<Vec<u8>>,
    pub hashes: Vec<[u8; 32]>,
}

impl TestPackage {
    pub fn new(size: u64, segment_length: u64, seed: u8) -> Self {
        let data: Vec<u8> = (0..size)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        let split = PackageSplitInfo::new(size, segment_length);
        let hashes = integrity::hash_segments(&data, segment_length as usize);
        Self {
            id: PackageId::from_segment_hashes(&hashes),
            split,
            data: Arc::new(data),
            hashes,
        }
    }

    /// 36 bytes in segments of 10, 10, 10 and 6.
    pub fn four_segments() -> Self {
        Self::new(36, 10, 1)
    }

    pub fn segment(&self, index: u32) -> &[u8] {
        let off = self.split.segment_offset(index) as usize;
        &self.data[off..off + self.split.segment_size(index) as usize]
    }

    /// Bitmap with `have` set; `None` for every segment.
    pub fn bitmap(&self, have: Option<&[u32]>) -> Option<Vec<u8>> {
        have.map(|indexes| {
            let mut b = SegmentBitmap::empty(self.split.segments_count());
            for &i in indexes {
                b.set(i);
            }
            b.into_bytes()
        })
    }
}

struct ServedPackage {
    data: Arc<Vec<u8>>,
    split: PackageSplitInfo,
    /// `None` when the peer has every segment.
    have: Option<Vec<u8>>,
    raw_bitmap: Option<Vec<u8>>,
}

impl ServedPackage {
    fn has(&self, index: u32) -> bool {
        index < self.split.segments_count()
            && self.have.as_ref().map_or(true, |b| bitmap::is_set(b, index))
    }

    fn bytes_downloaded(&self) -> u64 {
        let split = self.split;
        match &self.have {
            None => split.package_size(),
            Some(b) => (0..split.segments_count())
                .filter(|&i| bitmap::is_set(b, i))
                .map(|i| split.segment_size(i))
                .sum(),
        }
    }
}

#[derive(Default)]
struct RemotePeer {
    packages: HashMap<PackageId, ServedPackage>,
    choke: bool,
    fail_status: bool,
    corrupt: HashSet<u32>,
    truncate: bool,
}

/// Transport answering from in-memory peers. Segment fetches can be held until released.
pub struct MockTransport {
    peers: Mutex<HashMap<SocketAddr, RemotePeer>>,
    endpoints: Mutex<HashMap<PeerId, SocketAddr>>,
    open: watch::Sender<bool>,
    status_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(HashMap::new()),
            open: watch::channel(true).0,
            status_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn add_peer(&self, info: &PeerInfo, pkg: &TestPackage, have: Option<&[u32]>) {
        self.endpoints.lock().insert(info.id, info.endpoint);
        self.peers
            .lock()
            .entry(info.endpoint)
            .or_default()
            .packages
            .insert(
                pkg.id,
                ServedPackage {
                    data: pkg.data.clone(),
                    split: pkg.split,
                    have: pkg.bitmap(have),
                    raw_bitmap: None,
                },
            );
    }

    fn with_peer(&self, peer: &PeerId, f: impl FnOnce(&mut RemotePeer)) {
        let Some(endpoint) = self.endpoints.lock().get(peer).copied() else {
            return;
        };
        if let Some(p) = self.peers.lock().get_mut(&endpoint) {
            f(p);
        }
    }

    pub fn remove_package(&self, peer: &PeerId, id: &PackageId) {
        self.with_peer(peer, |p| {
            p.packages.remove(id);
        });
    }

    pub fn fail_status(&self, peer: &PeerId, fail: bool) {
        self.with_peer(peer, |p| p.fail_status = fail);
    }

    pub fn choke(&self, peer: &PeerId, choke: bool) {
        self.with_peer(peer, |p| p.choke = choke);
    }

    /// Serve a flipped byte in `segment`.
    pub fn corrupt(&self, peer: &PeerId, segment: u32) {
        self.with_peer(peer, |p| {
            p.corrupt.insert(segment);
        });
    }

    /// Drop the last byte of every reply.
    pub fn truncate(&self, peer: &PeerId) {
        self.with_peer(peer, |p| p.truncate = true);
    }

    pub fn set_raw_bitmap(&self, peer: &PeerId, id: &PackageId, raw: Vec<u8>) {
        self.with_peer(peer, |p| {
            if let Some(s) = p.packages.get_mut(id) {
                s.raw_bitmap = Some(raw);
            }
        });
    }

    /// Park segment fetches until [`Self::release`].
    pub fn hold(&self) {
        self.open.send_replace(false);
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn segment_chunks(
        &self,
        endpoint: SocketAddr,
        package: PackageId,
        segments: &[u32],
    ) -> Result<Vec<Bytes>, TransportFault> {
        let peers = self.peers.lock();
        let peer = peers.get(&endpoint).ok_or_else(|| {
            TransportFault::Communication(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "unknown peer",
            ))
        })?;
        if peer.choke {
            return Err(TransportFault::Choked);
        }
        let served = peer
            .packages
            .get(&package)
            .ok_or(TransportFault::PackageNotFound)?;
        if !segments.iter().all(|&i| served.has(i)) {
            return Err(TransportFault::SegmentsNotFound);
        }
        let split = served.split;
        let mut chunks: Vec<Vec<u8>> = segments
            .iter()
            .map(|&i| {
                let off = split.segment_offset(i) as usize;
                let mut seg = served.data[off..off + split.segment_size(i) as usize].to_vec();
                if peer.corrupt.contains(&i) {
                    seg[0] ^= 0xff;
                }
                seg
            })
            .collect();
        if peer.truncate {
            if let Some(last) = chunks.last_mut() {
                last.pop();
            }
        }
        Ok(chunks.into_iter().map(Bytes::from).collect())
    }
}

impl Transport for MockTransport {
    fn fetch_segments(
        &self,
        endpoint: SocketAddr,
        package: PackageId,
        segments: Vec<u32>,
    ) -> BoxFuture<'_, Result<SegmentStream, TransportFault>> {
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.subscribe();
            let _ = open.wait_for(|open| *open).await;
            let chunks = self.segment_chunks(endpoint, package, &segments)?;
            Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
        })
    }

    fn fetch_remote_status(
        &self,
        endpoint: SocketAddr,
        packages: Vec<PackageId>,
    ) -> BoxFuture<'_, Result<Vec<PackageStatus>, TransportFault>> {
        Box::pin(async move {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let peers = self.peers.lock();
            let Some(peer) = peers.get(&endpoint) else {
                return Err(TransportFault::Communication(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "unknown peer",
                )));
            };
            if peer.fail_status {
                return Err(TransportFault::Communication(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "status request timed out",
                )));
            }
            Ok(packages
                .iter()
                .map(|id| match peer.packages.get(id) {
                    None => PackageStatus::not_found(),
                    Some(s) => PackageStatus {
                        found: true,
                        bytes_downloaded: s.bytes_downloaded(),
                        bitmap: s.raw_bitmap.clone().or_else(|| s.have.clone()),
                    },
                })
                .collect())
        })
    }
}

struct StoredPackage {
    split: PackageSplitInfo,
    hashes: Vec<[u8; 32]>,
    data: Vec<u8>,
}

type StoredPackages = Arc<Mutex<HashMap<PackageId, StoredPackage>>>;

/// Storage holding package bytes in memory, verified with the real segment verifier.
/// Status writes can be held until released.
pub struct MockStorage {
    packages: StoredPackages,
    persisted: Mutex<Vec<(PackageId, Option<Vec<u8>>)>>,
    persist_calls: AtomicUsize,
    persist_open: watch::Sender<bool>,
}

impl Default for MockStorage {
    fn default() -> Self {
        Self {
            packages: StoredPackages::default(),
            persisted: Mutex::new(Vec::new()),
            persist_calls: AtomicUsize::new(0),
            persist_open: watch::channel(true).0,
        }
    }
}

impl MockStorage {
    /// Store `pkg` with only the `have` segments filled in (`None` = all of them).
    pub fn add_package(&self, pkg: &TestPackage, have: Option<&[u32]>) {
        let mut data = vec![0u8; pkg.data.len()];
        for i in 0..pkg.split.segments_count() {
            if have.map_or(true, |h| h.contains(&i)) {
                let off = pkg.split.segment_offset(i) as usize;
                let seg = pkg.segment(i);
                data[off..off + seg.len()].copy_from_slice(seg);
            }
        }
        self.packages.lock().insert(
            pkg.id,
            StoredPackage {
                split: pkg.split,
                hashes: pkg.hashes.clone(),
                data,
            },
        );
    }

    pub fn segment(&self, id: &PackageId, index: u32) -> Option<Vec<u8>> {
        let packages = self.packages.lock();
        let p = packages.get(id)?;
        let off = p.split.segment_offset(index) as usize;
        Some(p.data[off..off + p.split.segment_size(index) as usize].to_vec())
    }

    pub fn persisted(&self) -> Vec<(PackageId, Option<Vec<u8>>)> {
        self.persisted.lock().clone()
    }

    /// Status writes started so far, including held ones.
    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub fn hold_persists(&self) {
        self.persist_open.send_replace(false);
    }

    pub fn release_persists(&self) {
        self.persist_open.send_replace(true);
    }
}

struct MockWriter {
    package: PackageId,
    packages: StoredPackages,
    verifier: SegmentVerifier,
    pending: Vec<u8>,
}

impl VerifiedWriter for MockWriter {
    fn write(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            let completed = self.verifier.update(&chunk).map_err(|e| match e {
                VerifyError::Mismatch { segment } => StorageError::HashMismatch { segment },
                VerifyError::Overflow => {
                    StorageError::Io(io::Error::new(io::ErrorKind::InvalidData, e))
                }
            })?;
            self.pending.extend_from_slice(&chunk);
            let mut packages = self.packages.lock();
            let stored = packages
                .get_mut(&self.package)
                .ok_or(StorageError::PackageNotFound(self.package))?;
            for i in completed {
                let len = stored.split.segment_size(i) as usize;
                let off = stored.split.segment_offset(i) as usize;
                let seg: Vec<u8> = self.pending.drain(..len).collect();
                stored.data[off..off + len].copy_from_slice(&seg);
            }
            Ok(())
        })
    }

    fn finish(self: Box<Self>) -> BoxFuture<'static, Result<(), StorageError>> {
        let complete = self.verifier.is_complete();
        Box::pin(async move {
            if complete {
                Ok(())
            } else {
                Err(StorageError::Io(io::ErrorKind::UnexpectedEof.into()))
            }
        })
    }
}

impl Storage for MockStorage {
    fn open_verified_write(
        &self,
        package: PackageId,
        segments: Vec<u32>,
    ) -> BoxFuture<'_, Result<Box<dyn VerifiedWriter>, StorageError>> {
        Box::pin(async move {
            let expected = {
                let packages = self.packages.lock();
                let p = packages
                    .get(&package)
                    .ok_or(StorageError::PackageNotFound(package))?;
                segments
                    .iter()
                    .map(|&i| (i, p.split.segment_size(i), p.hashes[i as usize]))
                    .collect()
            };
            let writer: Box<dyn VerifiedWriter> = Box::new(MockWriter {
                package,
                packages: self.packages.clone(),
                verifier: SegmentVerifier::new(expected),
                pending: Vec::new(),
            });
            Ok(writer)
        })
    }

    fn read_segments(
        &self,
        package: PackageId,
        segments: Vec<u32>,
    ) -> BoxFuture<'_, Result<SegmentStream, StorageError>> {
        Box::pin(async move {
            let chunks: Vec<Bytes> = {
                let packages = self.packages.lock();
                let p = packages
                    .get(&package)
                    .ok_or(StorageError::PackageNotFound(package))?;
                segments
                    .iter()
                    .map(|&i| {
                        let off = p.split.segment_offset(i) as usize;
                        let len = p.split.segment_size(i) as usize;
                        Bytes::copy_from_slice(&p.data[off..off + len])
                    })
                    .collect()
            };
            Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
        })
    }

    fn persist_download_status(
        &self,
        package: PackageId,
        bitmap: Option<Vec<u8>>,
    ) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            self.persist_calls.fetch_add(1, Ordering::SeqCst);
            let mut open = self.persist_open.subscribe();
            let _ = open.wait_for(|open| *open).await;
            self.persisted.lock().push((package, bitmap));
            Ok(())
        })
    }
}

/// Peer registry whose list tests edit directly.
#[derive(Default)]
pub struct MockPeers {
    peers: Mutex<Vec<KnownPeer>>,
}

impl MockPeers {
    pub fn add(&self, peer: KnownPeer) {
        self.peers.lock().push(peer);
    }

    pub fn remove(&self, id: &PeerId) {
        self.peers.lock().retain(|p| p.info.id != *id);
    }
}

impl PeerRegistry for MockPeers {
    fn peers(&self) -> Vec<KnownPeer> {
        self.peers.lock().clone()
    }
}

/// An engine context wired to mocks and a manual clock.
pub struct Fixture {
    pub ctx: Arc<EngineContext>,
    pub wakes: WakeReceiver,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<MockTransport>,
    pub storage: Arc<MockStorage>,
    pub peer_registry: Arc<MockPeers>,
    next_port: AtomicU16,
}

impl Fixture {
    pub fn new(config: EngineConfig) -> Self {
        let clock = ManualClock::new();
        let transport = Arc::new(MockTransport::new());
        let storage = Arc::new(MockStorage::default());
        let peer_registry = Arc::new(MockPeers::default());
        let (ctx, wakes) = EngineContext::new(
            config,
            transport.clone(),
            storage.clone(),
            peer_registry.clone(),
            clock.clone(),
        );
        Self {
            ctx,
            wakes,
            clock,
            transport,
            storage,
            peer_registry,
            next_port: AtomicU16::new(4000),
        }
    }

    /// A remote peer advertising `pkg` and holding `have` of it (`None` = everything).
    pub fn add_peer(&self, pkg: &TestPackage, have: Option<&[u32]>) -> PeerId {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let info = PeerInfo {
            id: PeerId::random(),
            endpoint: SocketAddr::from(([127, 0, 0, 1], port)),
        };
        self.transport.add_peer(&info, pkg, have);
        self.peer_registry.add(KnownPeer {
            info: info.clone(),
            packages: Some(vec![pkg.id]),
        });
        info.id
    }

    /// Register `pkg` locally as a download target holding `have` of its segments.
    pub fn add_download(&self, pkg: &TestPackage, have: &[u32]) -> Arc<LocalPackage> {
        self.storage.add_package(pkg, Some(have));
        let local = pkg.bitmap(Some(have)).map(|b| {
            SegmentBitmap::from_bytes(b, pkg.split.segments_count()).expect("valid bitmap")
        });
        let state =
            PackageDownloadState::for_download(pkg.id, pkg.split, local).expect("valid bitmap");
        self.ctx
            .packages
            .register(LocalPackage::new(state))
            .expect("fresh package")
    }

    /// Register `pkg` locally as fully downloaded.
    pub fn add_downloaded(&self, pkg: &TestPackage) -> Arc<LocalPackage> {
        self.storage.add_package(pkg, None);
        self.ctx
            .packages
            .register(LocalPackage::new(PackageDownloadState::downloaded(
                pkg.id, pkg.split,
            )))
            .expect("fresh package")
    }

    /// Drain wake-ups sent so far.
    pub fn drain_wakes(&mut self) -> Vec<Wake> {
        let mut out = Vec::new();
        while let Ok(w) = self.wakes.try_recv() {
            out.push(w);
        }
        out
    }
}
