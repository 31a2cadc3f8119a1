//! Remote status cache: what each peer holds of each package we download, how fresh that
//! knowledge is, and the per-(peer, package) postpone deadlines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;

use crate::bitmap;
use crate::clock;
use crate::context::EngineContext;
use crate::contracts::{KnownPeer, PackageStatus, TransportFault};
use crate::package::{PackageId, PackageSplitInfo};
use crate::peer::{FaultKind, PeerId, PeerRecord};
use crate::wake::Wake;

/// Cached remote state of one package on one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSegments {
    Complete,
    Partial(Vec<u8>),
}

impl RemoteSegments {
    /// Bitmap to reserve against; `None` means every segment.
    pub fn bitmap(&self) -> Option<&[u8]> {
        match self {
            RemoteSegments::Complete => None,
            RemoteSegments::Partial(b) => Some(b),
        }
    }

    fn has_any(&self) -> bool {
        match self {
            RemoteSegments::Complete => true,
            RemoteSegments::Partial(b) => b.iter().any(|&byte| byte != 0),
        }
    }
}

#[derive(Debug, Default)]
struct PeerPackageStatus {
    /// `None` until the first successful refresh, and after a not-found reply.
    remote: Option<RemoteSegments>,
    bytes_downloaded: u64,
    last_refresh: Option<Instant>,
    fast_refresh: bool,
    postponed_until: Option<Instant>,
}

struct TrackedPackage {
    split: PackageSplitInfo,
    peers: HashMap<PeerId, PeerPackageStatus>,
}

/// What the tracker knows about one (peer, package) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatusView {
    pub remote: Option<RemoteSegments>,
    pub bytes_downloaded: u64,
    pub is_seeder: bool,
    pub fast_refresh: bool,
    pub refreshed: bool,
}

pub struct PackageStatusTracker {
    ctx: Arc<EngineContext>,
    packages: Mutex<HashMap<PackageId, TrackedPackage>>,
    refresh_now: Notify,
}

impl PackageStatusTracker {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            packages: Mutex::new(HashMap::new()),
            refresh_now: Notify::new(),
        }
    }

    /// Start polling peers that advertise `id`. The next refresh cycle runs immediately.
    pub fn start_tracking(&self, id: PackageId, split: PackageSplitInfo) {
        let known = self.ctx.peer_registry.peers();
        for peer in &known {
            self.ctx.peers.get_or_insert(&peer.info);
        }
        {
            let mut packages = self.packages.lock();
            let tracked = packages.entry(id).or_insert_with(|| TrackedPackage {
                split,
                peers: HashMap::new(),
            });
            for peer in known.iter().filter(|p| p.advertises(&id)) {
                tracked.peers.entry(peer.info.id).or_default();
            }
        }
        self.request_refresh();
    }

    /// Wake the refresh loop for an immediate cycle.
    pub fn request_refresh(&self) {
        self.refresh_now.notify_one();
    }

    pub fn stop_tracking(&self, id: &PackageId) {
        self.packages.lock().remove(id);
    }

    pub fn is_tracking(&self, id: &PackageId) -> bool {
        self.packages.lock().contains_key(id)
    }

    /// Peers that reported something of `id`, are not postponed for it, and are neither
    /// globally postponed nor disabled.
    pub fn candidate_peers(&self, id: &PackageId) -> Vec<Arc<PeerRecord>> {
        let now = self.ctx.clock.now();
        let ids: Vec<PeerId> = {
            let packages = self.packages.lock();
            let Some(tracked) = packages.get(id) else {
                return vec![];
            };
            tracked
                .peers
                .iter()
                .filter(|(_, s)| {
                    s.remote.as_ref().is_some_and(RemoteSegments::has_any)
                        && !clock::is_before(now, s.postponed_until)
                })
                .map(|(peer, _)| *peer)
                .collect()
        };
        ids.iter()
            .filter_map(|peer| self.ctx.peers.get(peer))
            .filter(|record| record.is_eligible(now))
            .collect()
    }

    pub fn remote_segments(&self, id: &PackageId, peer: &PeerId) -> Option<RemoteSegments> {
        self.packages
            .lock()
            .get(id)?
            .peers
            .get(peer)?
            .remote
            .clone()
    }

    pub fn peer_status(&self, id: &PackageId, peer: &PeerId) -> Option<PeerStatusView> {
        let packages = self.packages.lock();
        let s = packages.get(id)?.peers.get(peer)?;
        Some(PeerStatusView {
            remote: s.remote.clone(),
            bytes_downloaded: s.bytes_downloaded,
            is_seeder: matches!(s.remote, Some(RemoteSegments::Complete)),
            fast_refresh: s.fast_refresh,
            refreshed: s.last_refresh.is_some(),
        })
    }

    /// Skip `peer` for `id` until `interval` from now. Never shortens an existing postpone.
    pub fn postpone(&self, peer: &PeerId, id: &PackageId, interval: Duration) {
        let until = self.ctx.clock.now() + interval;
        let mut packages = self.packages.lock();
        if let Some(s) = packages.get_mut(id).and_then(|t| t.peers.get_mut(peer)) {
            if s.postponed_until.map_or(true, |t| t < until) {
                s.postponed_until = Some(until);
            }
        }
    }

    pub fn postpone_globally(&self, peer: &PeerId, interval: Duration) {
        if let Some(record) = self.ctx.peers.get(peer) {
            record.postpone(self.ctx.clock.now(), interval);
        }
    }

    /// Clear the global postpone of `peer` and every per-package one.
    pub fn reset_postpone(&self, peer: &PeerId) {
        if let Some(record) = self.ctx.peers.get(peer) {
            record.reset_postpone();
        }
        for tracked in self.packages.lock().values_mut() {
            if let Some(s) = tracked.peers.get_mut(peer) {
                s.postponed_until = None;
            }
        }
    }

    /// Poll `peer` about `id` on the fast interval until its next reply says otherwise.
    pub fn mark_fast_refresh(&self, peer: &PeerId, id: &PackageId) {
        let mut packages = self.packages.lock();
        if let Some(s) = packages.get_mut(id).and_then(|t| t.peers.get_mut(peer)) {
            s.fast_refresh = true;
        }
    }

    /// Syncs tracked peers with the peer registry and returns, per peer to poll, the packages
    /// whose status is due.
    fn due_requests(&self, now: Instant) -> Vec<(Arc<PeerRecord>, Vec<PackageId>)> {
        let known: HashMap<PeerId, KnownPeer> = self
            .ctx
            .peer_registry
            .peers()
            .into_iter()
            .map(|p| (p.info.id, p))
            .collect();
        let known_ids: Vec<PeerId> = known.keys().copied().collect();
        self.ctx.peers.retain(&known_ids);
        let records: HashMap<PeerId, Arc<PeerRecord>> = known
            .values()
            .map(|p| (p.info.id, self.ctx.peers.get_or_insert(&p.info)))
            .collect();

        let regular = self.ctx.config.regular_status_interval();
        let fast = self.ctx.config.fast_status_interval();
        let mut due: HashMap<PeerId, Vec<PackageId>> = HashMap::new();
        {
            let mut packages = self.packages.lock();
            for (id, tracked) in packages.iter_mut() {
                tracked
                    .peers
                    .retain(|peer, _| known.get(peer).is_some_and(|p| p.advertises(id)));
                for peer in known.values().filter(|p| p.advertises(id)) {
                    tracked.peers.entry(peer.info.id).or_default();
                }
                for (peer, s) in &tracked.peers {
                    let interval = if s.fast_refresh { fast } else { regular };
                    if s
                        .last_refresh
                        .map_or(true, |t| now.saturating_duration_since(t) >= interval)
                    {
                        due.entry(*peer).or_default().push(*id);
                    }
                }
            }
        }

        due.into_iter()
            .filter_map(|(peer, ids)| {
                let record = records.get(&peer)?;
                (!record.is_postponed(now) && record.can_probe(now, &self.ctx.policy))
                    .then(|| (record.clone(), ids))
            })
            .collect()
    }

    /// One pass: poll every due peer with bounded concurrency and apply the replies.
    /// Returns the number of peers that answered.
    pub async fn refresh_cycle(&self) -> usize {
        let requests = self.due_requests(self.ctx.clock.now());
        if requests.is_empty() {
            return 0;
        }
        tracing::debug!(peers = requests.len(), "refreshing remote status");
        let transport = &self.ctx.transport;
        let mut replies = futures::stream::iter(requests)
            .map(|(peer, ids)| async move {
                let result = transport
                    .fetch_remote_status(peer.endpoint(), ids.clone())
                    .await;
                (peer, ids, result)
            })
            .buffer_unordered(self.ctx.config.status_concurrency.max(1));

        let mut answered = 0;
        while let Some((peer, ids, result)) = replies.next().await {
            if self.apply_reply(&peer, &ids, result) {
                answered += 1;
            }
        }
        if answered > 0 {
            self.ctx.wake.wake(Wake::StatusRefreshed);
        }
        answered
    }

    fn apply_reply(
        &self,
        peer: &PeerRecord,
        ids: &[PackageId],
        result: Result<Vec<PackageStatus>, TransportFault>,
    ) -> bool {
        let now = self.ctx.clock.now();
        let statuses = match result {
            Ok(statuses) if statuses.len() == ids.len() => statuses,
            Ok(statuses) => {
                tracing::warn!(
                    peer = %peer.id(),
                    expected = ids.len(),
                    got = statuses.len(),
                    "malformed status reply"
                );
                self.status_failed(peer, ids, now);
                return false;
            }
            Err(e) => {
                tracing::debug!(peer = %peer.id(), error = %e, "status request failed");
                self.status_failed(peer, ids, now);
                return false;
            }
        };
        self.ctx.stats.status_request(true);
        peer.record_success(now);

        let mut packages = self.packages.lock();
        for (id, status) in ids.iter().zip(statuses) {
            // stopped while the request was in flight
            let Some(tracked) = packages.get_mut(id) else {
                continue;
            };
            let bytes_downloaded = status.bytes_downloaded;
            let remote = remote_from_status(status, tracked.split, peer, id);
            let s = tracked.peers.entry(peer.id()).or_default();
            s.last_refresh = Some(now);
            s.postponed_until = None;
            s.bytes_downloaded = bytes_downloaded;
            s.fast_refresh =
                bytes_downloaded == 0 && !matches!(remote, Some(RemoteSegments::Complete));
            s.remote = remote;
        }
        true
    }

    fn status_failed(&self, peer: &PeerRecord, ids: &[PackageId], now: Instant) {
        self.ctx.stats.status_request(false);
        peer.record_failure(now, FaultKind::Communication, &self.ctx.policy);
        let mut packages = self.packages.lock();
        for id in ids {
            if let Some(s) = packages.get_mut(id).and_then(|t| t.peers.get_mut(&peer.id())) {
                s.last_refresh = Some(now);
            }
        }
    }

    /// Refresh every `refresh_cycle`, or right away when a package starts being tracked.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ctx.config.refresh_cycle());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                _ = self.refresh_now.notified() => {}
            }
            self.refresh_cycle().await;
        }
        tracing::debug!("status refresh loop stopped");
    }
}

fn remote_from_status(
    status: PackageStatus,
    split: PackageSplitInfo,
    peer: &PeerRecord,
    id: &PackageId,
) -> Option<RemoteSegments> {
    if !status.found {
        return None;
    }
    match status.bitmap {
        None => Some(RemoteSegments::Complete),
        Some(b) => match bitmap::validate(&b, split.segments_count()) {
            Ok(()) => Some(RemoteSegments::Partial(b)),
            Err(e) => {
                tracing::warn!(
                    peer = %peer.id(),
                    package = %id.short(),
                    error = %e,
                    "peer sent an invalid bitmap"
                );
                None
            }
        },
    }
}
