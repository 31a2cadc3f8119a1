//! Per-package download state: which segments are local, which are reserved by an in-flight
//! attempt, and the byte counters derived from both.

use parking_lot::Mutex;
use rand::Rng;

use crate::bitmap::{self, BitmapError, SegmentBitmap};
use crate::package::{PackageId, PackageSplitInfo};

struct Inner {
    /// `None` once every segment is local.
    local: Option<SegmentBitmap>,
    in_progress: SegmentBitmap,
    bytes_downloaded: u64,
    bytes_reserved: u64,
    is_downloading: bool,
}

/// Outcome of [`PackageDownloadState::release_segments`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// The release committed the last missing segment.
    pub completed: bool,
}

/// Segment bookkeeping for one locally known package. All operations take one lock owned by
/// this instance; nothing here suspends.
pub struct PackageDownloadState {
    id: PackageId,
    split: PackageSplitInfo,
    inner: Mutex<Inner>,
}

impl PackageDownloadState {
    /// State for a package that is fully present locally (e.g. freshly built).
    pub fn downloaded(id: PackageId, split: PackageSplitInfo) -> Self {
        Self {
            id,
            split,
            inner: Mutex::new(Inner {
                local: None,
                in_progress: SegmentBitmap::empty(split.segments_count()),
                bytes_downloaded: split.package_size(),
                bytes_reserved: 0,
                is_downloading: false,
            }),
        }
    }

    /// State for a download target. `local` restores a persisted bitmap; `None` starts empty.
    pub fn for_download(
        id: PackageId,
        split: PackageSplitInfo,
        local: Option<SegmentBitmap>,
    ) -> Result<Self, BitmapError> {
        let count = split.segments_count();
        let local = match local {
            Some(b) => SegmentBitmap::from_bytes(b.into_bytes(), count)?,
            None => SegmentBitmap::empty(count),
        };
        let bytes_downloaded: u64 = local.iter_set().map(|i| split.segment_size(i)).sum();
        let complete = local.is_full();
        Ok(Self {
            id,
            split,
            inner: Mutex::new(Inner {
                local: (!complete).then_some(local),
                in_progress: SegmentBitmap::empty(count),
                bytes_downloaded,
                bytes_reserved: 0,
                is_downloading: !complete,
            }),
        })
    }

    pub fn id(&self) -> PackageId {
        self.id
    }

    pub fn split(&self) -> PackageSplitInfo {
        self.split
    }

    /// Reserve up to `max_count` segments that are missing locally, present on the remote
    /// (`None` = the remote has everything) and not already reserved.
    ///
    /// The scan starts at a uniformly random byte. Returned indexes are reserved before the
    /// lock is released; every one must be passed back to [`Self::release_segments`].
    pub fn reserve_segments_for_download(
        &self,
        remote: Option<&[u8]>,
        max_count: usize,
    ) -> Vec<u32> {
        let mut inner = self.inner.lock();
        let Inner {
            local,
            in_progress,
            bytes_reserved,
            ..
        } = &mut *inner;
        // Reachable when another attempt committed the last segment after the caller checked
        // `has_more_to_download`.
        let Some(local) = local.as_ref() else {
            return vec![];
        };
        let len = self.split.bitmap_len();
        if len == 0 {
            return vec![];
        }
        let start = rand::thread_rng().gen_range(0..len);
        let picked = bitmap::select_for_download(
            local.as_bytes(),
            in_progress.as_bytes(),
            remote,
            self.split.segments_count(),
            start,
            max_count,
        );
        for &i in &picked {
            in_progress.set(i);
            *bytes_reserved += self.split.segment_size(i);
        }
        picked
    }

    /// Return reserved segments. On success the segments become local; when that completes the
    /// package the bitmap is dropped and `is_downloading` cleared.
    ///
    /// Panics if any index is not currently reserved.
    pub fn release_segments(&self, indexes: &[u32], was_successful: bool) -> ReleaseOutcome {
        let mut inner = self.inner.lock();
        for &i in indexes {
            assert!(
                inner.in_progress.is_set(i),
                "segment {i} of package {} released without reservation",
                self.id.short()
            );
        }
        let mut completed = false;
        for &i in indexes {
            let size = self.split.segment_size(i);
            inner.in_progress.clear(i);
            inner.bytes_reserved -= size;
            if was_successful {
                if let Some(local) = inner.local.as_mut() {
                    local.set(i);
                }
                inner.bytes_downloaded += size;
            }
        }
        if was_successful
            && inner.local.is_some()
            && inner.bytes_downloaded == self.split.package_size()
        {
            inner.local = None;
            inner.is_downloading = false;
            completed = true;
        }
        ReleaseOutcome { completed }
    }

    /// Segments we can serve to a peer whose bitmap is `remote`: local and absent remotely.
    /// Nothing is reserved.
    pub fn offer_segments_to_peer(
        &self,
        remote: &[u8],
        max_count: usize,
    ) -> Result<Vec<u32>, BitmapError> {
        let count = self.split.segments_count();
        bitmap::validate(remote, count)?;
        let len = self.split.bitmap_len();
        if len == 0 {
            return Ok(vec![]);
        }
        let start = rand::thread_rng().gen_range(0..len);
        let inner = self.inner.lock();
        Ok(bitmap::select_for_offer(
            inner.local.as_ref().map(|b| b.as_bytes()),
            remote,
            count,
            start,
            max_count,
        ))
    }

    /// True while there are bytes neither downloaded nor reserved.
    pub fn has_more_to_download(&self) -> bool {
        let inner = self.inner.lock();
        inner.bytes_downloaded + inner.bytes_reserved < self.split.package_size()
    }

    /// True when every requested segment is local.
    pub fn contains_segments(&self, indexes: &[u32]) -> bool {
        let count = self.split.segments_count();
        let inner = self.inner.lock();
        indexes
            .iter()
            .all(|&i| i < count && inner.local.as_ref().map_or(true, |b| b.is_set(i)))
    }

    pub fn is_downloaded(&self) -> bool {
        self.inner.lock().local.is_none()
    }

    pub fn is_downloading(&self) -> bool {
        self.inner.lock().is_downloading
    }

    pub fn set_downloading(&self, downloading: bool) {
        let mut inner = self.inner.lock();
        inner.is_downloading = downloading && inner.local.is_some();
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.inner.lock().bytes_downloaded
    }

    pub fn bytes_reserved(&self) -> u64 {
        self.inner.lock().bytes_reserved
    }

    /// Downloaded fraction in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        let size = self.split.package_size();
        if size == 0 {
            return 1.0;
        }
        self.bytes_downloaded() as f64 / size as f64
    }

    /// Copy of the local bitmap for persistence or status replies; `None` when complete.
    pub fn bitmap_snapshot(&self) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .local
            .as_ref()
            .map(|b| b.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn four_segments() -> PackageDownloadState {
        // segment sizes 10, 10, 10, 6
        let split = PackageSplitInfo::new(36, 10);
        PackageDownloadState::for_download(PackageId::from_bytes([7; 32]), split, None).unwrap()
    }

    fn assert_conserved(state: &PackageDownloadState, in_flight: &[u32]) {
        let split = state.split();
        let neither: u64 = (0..split.segments_count())
            .filter(|i| !in_flight.contains(i) && !state.contains_segments(&[*i]))
            .map(|i| split.segment_size(i))
            .sum();
        assert_eq!(
            state.bytes_downloaded() + state.bytes_reserved() + neither,
            split.package_size()
        );
    }

    #[test]
    fn happy_path_full_remote() {
        let state = four_segments();
        let mut got = state.reserve_segments_for_download(None, 4);
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert!(!state.has_more_to_download());
        assert_eq!(state.bytes_reserved(), 36);

        let outcome = state.release_segments(&[0, 1, 2, 3], true);
        assert!(outcome.completed);
        assert!(!state.has_more_to_download());
        assert!(state.is_downloaded());
        assert!(!state.is_downloading());
        assert_eq!(state.bitmap_snapshot(), None);
        assert_eq!(state.bytes_downloaded(), 36);
        assert!(state.reserve_segments_for_download(None, 4).is_empty());
    }

    #[test]
    fn partial_remote_only_returns_advertised() {
        let state = four_segments();
        let remote = [0b0000_0101u8];
        let mut got = state.reserve_segments_for_download(Some(&remote), 4);
        got.sort();
        assert_eq!(got, vec![0, 2]);
        assert!(state.reserve_segments_for_download(Some(&remote), 4).is_empty());
    }

    #[test]
    fn failed_release_makes_segments_available_again() {
        let state = four_segments();
        let got = state.reserve_segments_for_download(None, 2);
        assert_eq!(got.len(), 2);
        assert_conserved(&state, &got);
        state.release_segments(&got, false);
        assert_eq!(state.bytes_reserved(), 0);
        assert_eq!(state.bytes_downloaded(), 0);
        assert_conserved(&state, &[]);
        let mut again = state.reserve_segments_for_download(None, 4);
        again.sort();
        assert_eq!(again, vec![0, 1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "released without reservation")]
    fn double_release_is_rejected() {
        let state = four_segments();
        let got = state.reserve_segments_for_download(None, 1);
        state.release_segments(&got, false);
        state.release_segments(&got, false);
    }

    #[test]
    #[should_panic(expected = "released without reservation")]
    fn release_of_unreserved_is_rejected() {
        four_segments().release_segments(&[1], true);
    }

    #[test]
    fn last_segment_size_used_only_for_last_index() {
        let state = four_segments();
        let remote = [0b0000_1000u8];
        assert_eq!(state.reserve_segments_for_download(Some(&remote), 4), vec![3]);
        assert_eq!(state.bytes_reserved(), 6);
        let remote = [0b0000_0001u8];
        assert_eq!(state.reserve_segments_for_download(Some(&remote), 4), vec![0]);
        assert_eq!(state.bytes_reserved(), 16);
        state.release_segments(&[0], true);
        assert_eq!(state.bytes_downloaded(), 10);
        assert_eq!(state.bytes_reserved(), 6);
    }

    #[test]
    fn offer_returns_local_minus_remote() {
        let split = PackageSplitInfo::new(36, 10);
        let id = PackageId::from_bytes([1; 32]);
        let mut local = SegmentBitmap::empty(4);
        local.set(0);
        local.set(1);
        let state = PackageDownloadState::for_download(id, split, Some(local)).unwrap();
        let mut got = state.offer_segments_to_peer(&[0b0000_0010], 4).unwrap();
        got.sort();
        assert_eq!(got, vec![0]);
        // offering reserves nothing
        assert_eq!(state.bytes_reserved(), 0);

        let seeder = PackageDownloadState::downloaded(id, split);
        let mut all = seeder.offer_segments_to_peer(&[0], 8).unwrap();
        all.sort();
        assert_eq!(all, vec![0, 1, 2, 3]);
    }

    #[test]
    fn offer_rejects_malformed_remote() {
        let state = four_segments();
        assert!(matches!(
            state.offer_segments_to_peer(&[0, 0], 4),
            Err(BitmapError::Length { .. })
        ));
        assert_eq!(
            state.offer_segments_to_peer(&[0b0001_0000], 4),
            Err(BitmapError::PaddingBits)
        );
    }

    #[test]
    fn restore_from_persisted_bitmap() {
        let split = PackageSplitInfo::new(36, 10);
        let mut local = SegmentBitmap::empty(4);
        local.set(3);
        let state =
            PackageDownloadState::for_download(PackageId::from_bytes([2; 32]), split, Some(local))
                .unwrap();
        assert_eq!(state.bytes_downloaded(), 6);
        assert!(state.is_downloading());
        assert!(state.contains_segments(&[3]));
        assert!(!state.contains_segments(&[0, 3]));
        assert!(!state.contains_segments(&[4]));

        let full = PackageDownloadState::for_download(
            PackageId::from_bytes([2; 32]),
            split,
            Some(SegmentBitmap::full(4)),
        )
        .unwrap();
        assert!(full.is_downloaded());
        assert!(!full.is_downloading());
        assert!(!full.has_more_to_download());
    }

    #[test]
    fn empty_package_is_complete() {
        let split = PackageSplitInfo::new(0, 10);
        let state =
            PackageDownloadState::for_download(PackageId::from_bytes([3; 32]), split, None).unwrap();
        assert!(state.is_downloaded());
        assert!(!state.has_more_to_download());
        assert!(state.reserve_segments_for_download(None, 4).is_empty());
    }

    #[test]
    fn concurrent_reservations_are_disjoint() {
        let split = PackageSplitInfo::new(1000 * 10, 10);
        let state = Arc::new(
            PackageDownloadState::for_download(PackageId::from_bytes([4; 32]), split, None).unwrap(),
        );
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    loop {
                        let got = state.reserve_segments_for_download(None, 7);
                        if got.is_empty() {
                            break;
                        }
                        mine.extend(got);
                    }
                    mine
                })
            })
            .collect();
        let mut all = HashSet::new();
        let mut total = 0;
        for h in handles {
            let mine = h.join().unwrap();
            total += mine.len();
            all.extend(mine);
        }
        assert_eq!(total, 1000);
        assert_eq!(all.len(), 1000);
        assert!(!state.has_more_to_download());
        assert_eq!(state.bytes_reserved(), split.package_size());
    }
}
