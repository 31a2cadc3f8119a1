//! Disk-backed package store: one directory per package under `<data_dir>/packages/<hex id>`
//! holding `package.meta`, `data.bin` and `status.bin`.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use seedpod_core::bitmap::SegmentBitmap;
use seedpod_core::integrity::{self, SegmentVerifier, VerifyError};
use seedpod_core::{
    BoxFuture, PackageId, PackageSplitInfo, SegmentStream, Storage, StorageError, VerifiedWriter,
};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

const META_FILE: &str = "package.meta";
const DATA_FILE: &str = "data.bin";
const STATUS_FILE: &str = "status.bin";

/// Everything needed to download and verify a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMeta {
    pub split: PackageSplitInfo,
    pub hashes: Vec<[u8; 32]>,
}

impl PackageMeta {
    pub fn id(&self) -> PackageId {
        PackageId::from_segment_hashes(&self.hashes)
    }

    fn check(&self) -> Result<(), DiskError> {
        if !self.split.is_valid() || self.hashes.len() != self.split.segments_count() as usize {
            return Err(DiskError::Corrupt("segment hashes do not match the layout"));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, DiskError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DiskError> {
        let meta: PackageMeta = bincode::deserialize(bytes)?;
        meta.check()?;
        Ok(meta)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("corrupt package store: {0}")]
    Corrupt(&'static str),
}

impl From<DiskError> for StorageError {
    fn from(e: DiskError) -> Self {
        match e {
            DiskError::Io(e) => StorageError::Io(e),
            other => StorageError::Io(io::Error::new(io::ErrorKind::InvalidData, other)),
        }
    }
}

/// A package found on disk at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPackage {
    pub id: PackageId,
    pub split: PackageSplitInfo,
    /// Persisted download bitmap; `None` when the package is complete.
    pub bitmap: Option<Vec<u8>>,
}

pub struct DiskStorage {
    root: PathBuf,
    metas: RwLock<HashMap<PackageId, Arc<PackageMeta>>>,
    status_writes: Mutex<()>,
    tmp_seq: AtomicU64,
}

impl DiskStorage {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("packages"),
            metas: RwLock::new(HashMap::new()),
            status_writes: Mutex::new(()),
            tmp_seq: AtomicU64::new(0),
        }
    }

    fn package_dir(&self, id: &PackageId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn meta_path(&self, id: &PackageId) -> PathBuf {
        self.package_dir(id).join(META_FILE)
    }

    /// Copy `path` into the store as a complete package.
    pub async fn import_file(
        &self,
        path: &Path,
        segment_length: u64,
    ) -> Result<PackageMeta, DiskError> {
        let data = fs::read(path).await?;
        let split = PackageSplitInfo::new(data.len() as u64, segment_length);
        let meta = PackageMeta {
            split,
            hashes: integrity::hash_segments(&data, split.segment_length() as usize),
        };
        let dir = self.package_dir(&meta.id());
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(DATA_FILE), &data).await?;
        fs::write(dir.join(META_FILE), meta.encode()?).await?;
        self.write_status(&dir, &None).await?;
        self.metas.write().await.insert(meta.id(), Arc::new(meta.clone()));
        Ok(meta)
    }

    /// Create an empty download target for `meta`.
    pub async fn add_target(&self, meta: PackageMeta) -> Result<PackageId, DiskError> {
        meta.check()?;
        let id = meta.id();
        let dir = self.package_dir(&id);
        if fs::try_exists(dir.join(META_FILE)).await? {
            return Ok(id);
        }
        fs::create_dir_all(&dir).await?;
        let data = File::create(dir.join(DATA_FILE)).await?;
        data.set_len(meta.split.data_file_length()).await?;
        fs::write(dir.join(META_FILE), meta.encode()?).await?;
        let empty = SegmentBitmap::empty(meta.split.segments_count()).into_bytes();
        self.write_status(&dir, &Some(empty)).await?;
        self.metas.write().await.insert(id, Arc::new(meta));
        Ok(id)
    }

    /// Every package under the store root. Unreadable directories are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<StoredPackage>, DiskError> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            match self.load_one(&dir).await {
                Ok(p) => out.push(p),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "skipping package directory")
                }
            }
        }
        Ok(out)
    }

    async fn load_one(&self, dir: &Path) -> Result<StoredPackage, DiskError> {
        let meta = PackageMeta::decode(&fs::read(dir.join(META_FILE)).await?)?;
        let id = meta.id();
        if dir.file_name().and_then(|n| n.to_str()) != Some(id.to_string().as_str()) {
            return Err(DiskError::Corrupt("directory name does not match package id"));
        }
        let bitmap = read_status(&dir.join(STATUS_FILE))
            .await?
            .unwrap_or_else(|| Some(SegmentBitmap::empty(meta.split.segments_count()).into_bytes()));
        let split = meta.split;
        self.metas.write().await.insert(id, Arc::new(meta));
        Ok(StoredPackage { id, split, bitmap })
    }

    async fn meta(&self, id: &PackageId) -> Result<Arc<PackageMeta>, StorageError> {
        if let Some(m) = self.metas.read().await.get(id) {
            return Ok(m.clone());
        }
        let bytes = match fs::read(self.package_dir(id).join(META_FILE)).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::PackageNotFound(*id))
            }
            Err(e) => return Err(e.into()),
        };
        let meta = Arc::new(PackageMeta::decode(&bytes)?);
        self.metas.write().await.insert(*id, meta.clone());
        Ok(meta)
    }

    /// Replace `status.bin` through a temp file. Writes are serialized, and a partial bitmap
    /// never replaces a status that already records the package as complete.
    async fn write_status(&self, dir: &Path, bitmap: &Option<Vec<u8>>) -> Result<(), DiskError> {
        let _writing = self.status_writes.lock().await;
        let path = dir.join(STATUS_FILE);
        if bitmap.is_some() && matches!(read_status(&path).await, Ok(Some(None))) {
            tracing::debug!(dir = %dir.display(), "package already complete, partial status dropped");
            return Ok(());
        }
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!("{STATUS_FILE}.{seq}.tmp"));
        fs::write(&tmp, bincode::serialize(bitmap)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// The stored status, or `None` when there is no status file.
async fn read_status(path: &Path) -> Result<Option<Option<Vec<u8>>>, DiskError> {
    match fs::read(path).await {
        Ok(b) => Ok(Some(bincode::deserialize(&b)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn storage_error(e: VerifyError) -> StorageError {
    match e {
        VerifyError::Mismatch { segment } => StorageError::HashMismatch { segment },
        VerifyError::Overflow => StorageError::Io(io::Error::new(io::ErrorKind::InvalidData, e)),
    }
}

fn check_indexes(split: &PackageSplitInfo, segments: &[u32]) -> Result<(), StorageError> {
    if segments.iter().all(|&i| i < split.segments_count()) {
        Ok(())
    } else {
        Err(StorageError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "segment index out of range",
        )))
    }
}

/// Writes each segment at its offset once its hash checked out.
struct DiskWriter {
    file: File,
    split: PackageSplitInfo,
    verifier: SegmentVerifier,
    pending: Vec<u8>,
}

impl VerifiedWriter for DiskWriter {
    /// Feeds the chunk one segment boundary at a time, so segments verified before a bad
    /// one in the same chunk are already on disk when the error comes back.
    fn write(&mut self, mut chunk: Bytes) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            while !chunk.is_empty() {
                let take = self
                    .verifier
                    .remaining_in_segment()
                    .map_or(chunk.len(), |n| chunk.len().min(n as usize));
                let piece = chunk.split_to(take);
                let completed = self.verifier.update(&piece).map_err(storage_error)?;
                self.pending.extend_from_slice(&piece);
                for index in completed {
                    let len = self.split.segment_size(index) as usize;
                    self.file
                        .seek(SeekFrom::Start(self.split.segment_offset(index)))
                        .await?;
                    self.file.write_all(&self.pending[..len]).await?;
                    self.pending.drain(..len);
                }
            }
            Ok(())
        })
    }

    fn finish(mut self: Box<Self>) -> BoxFuture<'static, Result<(), StorageError>> {
        Box::pin(async move {
            if !self.verifier.is_complete() {
                return Err(StorageError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            self.file.flush().await?;
            self.file.sync_data().await?;
            Ok(())
        })
    }
}

impl Storage for DiskStorage {
    fn open_verified_write(
        &self,
        package: PackageId,
        segments: Vec<u32>,
    ) -> BoxFuture<'_, Result<Box<dyn VerifiedWriter>, StorageError>> {
        Box::pin(async move {
            let meta = self.meta(&package).await?;
            check_indexes(&meta.split, &segments)?;
            let expected = segments
                .iter()
                .map(|&i| (i, meta.split.segment_size(i), meta.hashes[i as usize]))
                .collect();
            let file = OpenOptions::new()
                .write(true)
                .open(self.package_dir(&package).join(DATA_FILE))
                .await?;
            let writer: Box<dyn VerifiedWriter> = Box::new(DiskWriter {
                file,
                split: meta.split,
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
            let meta = self.meta(&package).await?;
            check_indexes(&meta.split, &segments)?;
            let file = File::open(self.package_dir(&package).join(DATA_FILE)).await?;
            let split = meta.split;
            let stream = futures::stream::try_unfold(
                (file, segments.into_iter()),
                move |(mut file, mut rest)| async move {
                    let Some(index) = rest.next() else {
                        return Ok::<_, io::Error>(None);
                    };
                    let mut buf = vec![0u8; split.segment_size(index) as usize];
                    file.seek(SeekFrom::Start(split.segment_offset(index)))
                        .await?;
                    file.read_exact(&mut buf).await?;
                    Ok(Some((Bytes::from(buf), (file, rest))))
                },
            );
            Ok(stream.boxed())
        })
    }

    fn persist_download_status(
        &self,
        package: PackageId,
        bitmap: Option<Vec<u8>>,
    ) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            self.write_status(&self.package_dir(&package), &bitmap).await?;
            Ok(())
        })
    }
}
