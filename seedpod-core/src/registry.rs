//! Local package registry: every package this node holds or is downloading, the shared lock
//! that keeps a package alive while transfers use it, and the catalog version.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::contracts::{Storage, StorageError};
use crate::package::{PackageId, PackageSplitInfo};
use crate::state::PackageDownloadState;

#[derive(Debug, Default)]
struct LockState {
    shared: usize,
    marked_for_delete: bool,
}

/// A locally registered package.
pub struct LocalPackage {
    state: PackageDownloadState,
    lock: Mutex<LockState>,
    released: Notify,
    last_persist: Mutex<Option<Instant>>,
    persisting: tokio::sync::Mutex<()>,
}

impl LocalPackage {
    pub fn new(state: PackageDownloadState) -> Self {
        Self {
            state,
            lock: Mutex::new(LockState::default()),
            released: Notify::new(),
            last_persist: Mutex::new(None),
            persisting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> PackageId {
        self.state.id()
    }

    pub fn split(&self) -> PackageSplitInfo {
        self.state.split()
    }

    pub fn state(&self) -> &PackageDownloadState {
        &self.state
    }

    /// Shared lock blocking deletion. `None` once the package is marked for delete.
    pub fn try_lock_shared(self: &Arc<Self>) -> Option<SharedPackageGuard> {
        let mut lock = self.lock.lock();
        if lock.marked_for_delete {
            return None;
        }
        lock.shared += 1;
        Some(SharedPackageGuard {
            package: self.clone(),
        })
    }

    pub fn is_marked_for_delete(&self) -> bool {
        self.lock.lock().marked_for_delete
    }

    pub fn shared_locks(&self) -> usize {
        self.lock.lock().shared
    }

    async fn wait_unlocked(&self) {
        loop {
            let notified = self.released.notified();
            if self.lock.lock().shared == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Claims the right to persist now if at least `interval` passed since the last time.
    pub fn claim_persist(&self, now: Instant, interval: Duration) -> bool {
        let mut last = self.last_persist.lock();
        match *last {
            Some(t) if now.duration_since(t) < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Write the current bitmap to `storage`. Writers queue here and each takes its snapshot
    /// only once it holds the slot, so the last write is always the newest state.
    pub async fn persist_status(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        let _writing = self.persisting.lock().await;
        let bitmap = self.state.bitmap_snapshot();
        storage.persist_download_status(self.id(), bitmap).await
    }
}

/// Held by every transfer touching a package; released on drop.
pub struct SharedPackageGuard {
    package: Arc<LocalPackage>,
}

impl Drop for SharedPackageGuard {
    fn drop(&mut self) {
        let mut lock = self.package.lock.lock();
        lock.shared -= 1;
        if lock.shared == 0 {
            self.package.released.notify_waiters();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("package {0} is already registered")]
    AlreadyRegistered(PackageId),
    #[error("package {0} is not registered")]
    NotFound(PackageId),
    #[error("package {0} is already being deleted")]
    AlreadyDeleting(PackageId),
}

/// Every package this node knows locally.
#[derive(Default)]
pub struct LocalPackageRegistry {
    packages: RwLock<HashMap<PackageId, Arc<LocalPackage>>>,
    catalog_version: AtomicU64,
}

impl LocalPackageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, package: LocalPackage) -> Result<Arc<LocalPackage>, RegistryError> {
        let id = package.id();
        let mut packages = self.packages.write();
        if packages.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        let package = Arc::new(package);
        packages.insert(id, package.clone());
        drop(packages);
        self.bump_catalog_version();
        Ok(package)
    }

    pub fn get(&self, id: &PackageId) -> Option<Arc<LocalPackage>> {
        self.packages.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<LocalPackage>> {
        self.packages.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.packages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the package for delete, wait for every shared lock to be released, then remove it.
    pub async fn delete(&self, id: &PackageId) -> Result<Arc<LocalPackage>, RegistryError> {
        let package = self.get(id).ok_or(RegistryError::NotFound(*id))?;
        {
            let mut lock = package.lock.lock();
            if lock.marked_for_delete {
                return Err(RegistryError::AlreadyDeleting(*id));
            }
            lock.marked_for_delete = true;
        }
        package.wait_unlocked().await;
        self.packages.write().remove(id);
        self.bump_catalog_version();
        tracing::info!(package = %id.short(), "package deleted");
        Ok(package)
    }

    pub fn catalog_version(&self) -> u64 {
        self.catalog_version.load(Ordering::Acquire)
    }

    pub fn bump_catalog_version(&self) -> u64 {
        self.catalog_version.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::{Fixture, TestPackage};

    fn package(byte: u8) -> LocalPackage {
        let split = PackageSplitInfo::new(36, 10);
        LocalPackage::new(PackageDownloadState::downloaded(
            PackageId::from_bytes([byte; 32]),
            split,
        ))
    }

    #[test]
    fn register_bumps_catalog_and_rejects_duplicates() {
        let reg = LocalPackageRegistry::new();
        assert_eq!(reg.catalog_version(), 0);
        reg.register(package(1)).unwrap();
        assert_eq!(reg.catalog_version(), 1);
        assert!(matches!(
            reg.register(package(1)),
            Err(RegistryError::AlreadyRegistered(_))
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn shared_lock_counts_and_refuses_after_mark() {
        let pkg = Arc::new(package(2));
        let a = pkg.try_lock_shared().unwrap();
        let b = pkg.try_lock_shared().unwrap();
        assert_eq!(pkg.shared_locks(), 2);
        drop(a);
        drop(b);
        assert_eq!(pkg.shared_locks(), 0);
        pkg.lock.lock().marked_for_delete = true;
        assert!(pkg.try_lock_shared().is_none());
        assert!(pkg.is_marked_for_delete());
    }

    #[tokio::test]
    async fn delete_waits_for_shared_locks() {
        let reg = Arc::new(LocalPackageRegistry::new());
        let pkg = reg.register(package(3)).unwrap();
        let id = pkg.id();
        let guard = pkg.try_lock_shared().unwrap();

        let deleting = tokio::spawn({
            let reg = reg.clone();
            async move { reg.delete(&id).await }
        });
        tokio::task::yield_now().await;
        assert!(!deleting.is_finished());
        assert!(pkg.try_lock_shared().is_none());
        assert!(reg.get(&id).is_some());

        drop(guard);
        deleting.await.unwrap().unwrap();
        assert!(reg.get(&id).is_none());
        assert_eq!(reg.catalog_version(), 2);
    }

    #[tokio::test]
    async fn delete_unknown_and_twice() {
        let reg = Arc::new(LocalPackageRegistry::new());
        assert!(matches!(
            reg.delete(&PackageId::from_bytes([9; 32])).await,
            Err(RegistryError::NotFound(_))
        ));
        let pkg = reg.register(package(4)).unwrap();
        let id = pkg.id();
        let guard = pkg.try_lock_shared().unwrap();
        let first = tokio::spawn({
            let reg = reg.clone();
            async move { reg.delete(&id).await }
        });
        tokio::task::yield_now().await;
        assert!(matches!(
            reg.delete(&id).await,
            Err(RegistryError::AlreadyDeleting(_))
        ));
        drop(guard);
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn status_writes_queue_and_snapshot_in_order() {
        let pkg = TestPackage::four_segments();
        let f = Fixture::new(EngineConfig::default());
        let local = f.add_download(&pkg, &[]);
        let persist = |local: Arc<LocalPackage>, storage: Arc<dyn Storage>| {
            tokio::spawn(async move { local.persist_status(storage.as_ref()).await })
        };
        f.storage.hold_persists();
        let partial = persist(local.clone(), f.ctx.storage.clone());
        tokio::task::yield_now().await;

        let all = local.state().reserve_segments_for_download(None, 4);
        assert!(local.state().release_segments(&all, true).completed);
        let complete = persist(local.clone(), f.ctx.storage.clone());
        tokio::task::yield_now().await;
        // the second writer waits for the first before taking its snapshot
        assert_eq!(f.storage.persist_calls(), 1);

        f.storage.release_persists();
        partial.await.unwrap().unwrap();
        complete.await.unwrap().unwrap();
        assert_eq!(
            f.storage.persisted(),
            vec![(pkg.id, Some(vec![0])), (pkg.id, None)]
        );
    }

    #[test]
    fn persist_claim_is_rate_limited() {
        let pkg = package(5);
        let t0 = Instant::now();
        let interval = Duration::from_secs(20);
        assert!(pkg.claim_persist(t0, interval));
        assert!(!pkg.claim_persist(t0 + Duration::from_secs(5), interval));
        assert!(pkg.claim_persist(t0 + interval, interval));
    }
}
