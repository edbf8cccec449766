//! Temporary storage for inbound payloads.
//!
//! Payloads are spooled to `<dir>/<session>.part` and renamed to
//! `<session>.blob` once complete. When the directory cannot be used the
//! spool falls back to an in-memory buffer for that session. Blobs stay
//! readable until [`Spool::purge_all`] runs, after which reads fail with
//! [`SpoolError::BlobPurged`].
//!
//! Recovery and purges only remove regular files named after a session id
//! with one of the spool's extensions. Anything else in the directory is
//! left alone.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::registry::SessionId;

/// Largest payload accepted on the in-memory path.
pub const DEFAULT_MEMORY_LIMIT: u64 = 256 * 1024 * 1024;

const PART_EXT: &str = "part";
const BLOB_EXT: &str = "blob";

/// Failures of the storage spool.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("no storage for {size} bytes: persistent spool unavailable and memory limit is {limit}")]
    AcquisitionFailed { size: u64, limit: u64 },
    #[error("spool write failed: {0}")]
    WriteFailure(#[source] io::Error),
    #[error("spool was purged and the blob data is gone")]
    BlobPurged,
    #[error("spool I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Where and how much the spool may store.
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    /// Directory for spooled payloads. `None` keeps everything in memory.
    pub dir: Option<PathBuf>,
    /// Largest payload held on the memory path.
    pub memory_limit: u64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self::memory_only()
    }
}

impl SpoolConfig {
    /// Spool to `dir`, falling back to memory when it is unusable.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }

    /// Keep every payload in memory.
    pub fn memory_only() -> Self {
        Self {
            dir: None,
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }

    pub fn with_memory_limit(mut self, limit: u64) -> Self {
        self.memory_limit = limit;
        self
    }
}

#[derive(Debug)]
struct SpoolInner {
    dir: Option<PathBuf>,
    memory_limit: u64,
    generation: AtomicU64,
}

impl SpoolInner {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Handle to the spool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Spool {
    inner: Arc<SpoolInner>,
}

impl Spool {
    /// Open the spool, clearing anything a previous run left behind.
    ///
    /// Never fails: a directory that cannot be prepared is logged and every
    /// session then takes the memory path.
    pub async fn open(config: SpoolConfig) -> Self {
        if let Some(dir) = &config.dir {
            match recover(dir).await {
                Ok(removed) => {
                    tracing::info!(dir = %dir.display(), removed, "spool opened");
                }
                Err(e) => {
                    tracing::warn!(
                        dir = %dir.display(),
                        error = %e,
                        "spool directory unusable, payloads will be held in memory"
                    );
                }
            }
        }

        Self {
            inner: Arc::new(SpoolInner {
                dir: config.dir,
                memory_limit: config.memory_limit,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// The configured spool directory, if any.
    pub fn dir(&self) -> Option<&Path> {
        self.inner.dir.as_deref()
    }

    /// Number of purges so far.
    pub fn generation(&self) -> u64 {
        self.inner.generation()
    }

    /// Get a write target for one inbound payload.
    ///
    /// Tries the spool directory once; on failure falls back to memory if
    /// `declared_size` fits under the memory limit.
    pub async fn acquire(
        &self,
        session: SessionId,
        declared_size: u64,
    ) -> Result<SpoolTarget, SpoolError> {
        if let Some(dir) = &self.inner.dir {
            match PersistentHandle::create(Arc::clone(&self.inner), dir, session).await {
                Ok(handle) => {
                    tracing::debug!(%session, path = %handle.part_path.display(), "spooling to disk");
                    return Ok(SpoolTarget::Persistent(handle));
                }
                Err(e) => {
                    tracing::warn!(
                        %session,
                        error = %e,
                        "persistent spool unavailable, falling back to memory"
                    );
                }
            }
        }

        if declared_size > self.inner.memory_limit {
            return Err(SpoolError::AcquisitionFailed {
                size: declared_size,
                limit: self.inner.memory_limit,
            });
        }
        tracing::debug!(%session, declared_size, "spooling to memory");
        Ok(SpoolTarget::Memory(MemoryBuffer::new(
            Arc::clone(&self.inner),
            declared_size,
        )))
    }

    /// Invalidate every blob and delete all spooled data.
    ///
    /// Returns the number of spool files removed.
    pub async fn purge_all(&self) -> Result<usize, SpoolError> {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let removed = match &self.inner.dir {
            Some(dir) => match clear_dir(dir).await {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            },
            None => 0,
        };
        tracing::info!(generation, removed, "spool purged");
        Ok(removed)
    }
}

async fn recover(dir: &Path) -> io::Result<usize> {
    fs::create_dir_all(dir).await?;
    clear_dir(dir).await
}

async fn clear_dir(dir: &Path) -> io::Result<usize> {
    let mut entries = fs::read_dir(dir).await?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() || !is_spool_file(&path) {
            tracing::debug!(path = %path.display(), "not a spool file, leaving it");
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// `<session>.part` or `<session>.blob`.
fn is_spool_file(path: &Path) -> bool {
    let ext = path.extension().and_then(|e| e.to_str());
    let stem = path.file_stem().and_then(|s| s.to_str());
    match (stem, ext) {
        (Some(stem), Some(PART_EXT | BLOB_EXT)) => SessionId::parse(stem).is_some(),
        _ => false,
    }
}

/// Where one inbound payload is being written.
#[derive(Debug)]
pub enum SpoolTarget {
    Persistent(PersistentHandle),
    Memory(MemoryBuffer),
}

impl SpoolTarget {
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent(_))
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        match self {
            Self::Persistent(h) => h.written,
            Self::Memory(m) => m.buf.len() as u64,
        }
    }

    /// Append a chunk of payload.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), SpoolError> {
        match self {
            Self::Persistent(h) => h.write(chunk).await,
            Self::Memory(m) => {
                m.buf.extend_from_slice(chunk);
                Ok(())
            }
        }
    }

    /// Seal the payload into a readable [`Blob`].
    ///
    /// Fails with [`SpoolError::BlobPurged`] if the spool was purged while
    /// the payload was being written.
    pub async fn finalize(self) -> Result<Blob, SpoolError> {
        match self {
            Self::Persistent(h) => h.finalize().await,
            Self::Memory(m) => m.finalize(),
        }
    }

    /// Throw away a partial payload.
    pub async fn discard(self) {
        match self {
            Self::Persistent(h) => h.discard().await,
            Self::Memory(_) => {}
        }
    }
}

/// Payload being written to a `.part` file.
#[derive(Debug)]
pub struct PersistentHandle {
    spool: Arc<SpoolInner>,
    generation: u64,
    part_path: PathBuf,
    blob_path: PathBuf,
    file: BufWriter<File>,
    written: u64,
}

impl PersistentHandle {
    async fn create(spool: Arc<SpoolInner>, dir: &Path, session: SessionId) -> io::Result<Self> {
        let part_path = dir.join(format!("{session}.{PART_EXT}"));
        let blob_path = dir.join(format!("{session}.{BLOB_EXT}"));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await?;
        let generation = spool.generation();
        Ok(Self {
            spool,
            generation,
            part_path,
            blob_path,
            file: BufWriter::new(file),
            written: 0,
        })
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), SpoolError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(SpoolError::WriteFailure)?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn finalize(mut self) -> Result<Blob, SpoolError> {
        if let Err(e) = self.seal().await {
            let _ = fs::remove_file(&self.part_path).await;
            return Err(e);
        }
        Ok(Blob {
            spool: self.spool,
            generation: self.generation,
            len: self.written,
            backing: Backing::File(self.blob_path),
        })
    }

    async fn seal(&mut self) -> Result<(), SpoolError> {
        self.file.flush().await.map_err(SpoolError::WriteFailure)?;
        self.file
            .get_mut()
            .sync_all()
            .await
            .map_err(SpoolError::WriteFailure)?;
        if self.spool.generation() != self.generation {
            return Err(SpoolError::BlobPurged);
        }
        fs::rename(&self.part_path, &self.blob_path)
            .await
            .map_err(SpoolError::WriteFailure)
    }

    async fn discard(self) {
        drop(self.file);
        match fs::remove_file(&self.part_path).await {
            Ok(()) => {
                tracing::debug!(path = %self.part_path.display(), "partial payload removed");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.part_path.display(),
                    error = %e,
                    "failed to remove partial payload"
                );
            }
        }
    }
}

/// Payload being collected in memory.
#[derive(Debug)]
pub struct MemoryBuffer {
    spool: Arc<SpoolInner>,
    generation: u64,
    buf: BytesMut,
}

impl MemoryBuffer {
    fn new(spool: Arc<SpoolInner>, declared_size: u64) -> Self {
        let generation = spool.generation();
        // The declared size is untrusted; cap the up-front reservation.
        let capacity = declared_size.min(drift_protocol::CHUNK_SIZE as u64 * 16) as usize;
        Self {
            spool,
            generation,
            buf: BytesMut::with_capacity(capacity),
        }
    }

    fn finalize(self) -> Result<Blob, SpoolError> {
        if self.spool.generation() != self.generation {
            return Err(SpoolError::BlobPurged);
        }
        let data = self.buf.freeze();
        Ok(Blob {
            spool: self.spool,
            generation: self.generation,
            len: data.len() as u64,
            backing: Backing::Memory(data),
        })
    }
}

#[derive(Debug, Clone)]
enum Backing {
    File(PathBuf),
    Memory(Bytes),
}

/// A completed payload. Reads fail once the spool has been purged.
#[derive(Debug, Clone)]
pub struct Blob {
    spool: Arc<SpoolInner>,
    generation: u64,
    len: u64,
    backing: Backing,
}

impl Blob {
    /// Payload length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.backing, Backing::File(_))
    }

    /// On-disk location, for persistent blobs.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File(path) => Some(path),
            Backing::Memory(_) => None,
        }
    }

    /// Whether the backing data has not been purged.
    pub fn is_available(&self) -> bool {
        self.spool.generation() == self.generation
    }

    /// The whole payload.
    pub async fn read_all(&self) -> Result<Bytes, SpoolError> {
        if !self.is_available() {
            return Err(SpoolError::BlobPurged);
        }
        match &self.backing {
            Backing::Memory(data) => Ok(data.clone()),
            Backing::File(path) => match fs::read(path).await {
                Ok(data) => Ok(Bytes::from(data)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SpoolError::BlobPurged),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Copy the blob to `dest`. Returns the number of bytes written.
    pub async fn export(&self, dest: &Path) -> Result<u64, SpoolError> {
        if !self.is_available() {
            return Err(SpoolError::BlobPurged);
        }
        match &self.backing {
            Backing::Memory(data) => {
                fs::write(dest, data).await?;
                Ok(data.len() as u64)
            }
            Backing::File(path) => match fs::copy(path, dest).await {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SpoolError::BlobPurged),
                Err(e) => Err(e.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn open_removes_leftovers() {
        let tmp = TempDir::new().unwrap();
        let stale = SessionId::new();
        let old = SessionId::new();
        std::fs::write(tmp.path().join(format!("{stale}.part")), b"half").unwrap();
        std::fs::write(tmp.path().join(format!("{old}.blob")), b"done").unwrap();

        let _spool = Spool::open(SpoolConfig::persistent(tmp.path())).await;
        assert!(files_in(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn open_and_purge_leave_foreign_files_alone() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("thesis.docx"), b"chapter one").unwrap();
        std::fs::write(tmp.path().join("notes.part"), b"not ours").unwrap();
        std::fs::create_dir(tmp.path().join("photos")).unwrap();
        std::fs::write(tmp.path().join("photos").join("a.jpg"), b"jpeg").unwrap();
        let dir_named_like_spool = format!("{}.blob", SessionId::new());
        std::fs::create_dir(tmp.path().join(&dir_named_like_spool)).unwrap();
        let mut expected = vec![
            dir_named_like_spool,
            "notes.part".to_string(),
            "photos".to_string(),
            "thesis.docx".to_string(),
        ];
        expected.sort();

        let spool = Spool::open(SpoolConfig::persistent(tmp.path())).await;
        assert_eq!(files_in(tmp.path()), expected);

        let mut target = spool.acquire(SessionId::new(), 3).await.unwrap();
        target.write(b"abc").await.unwrap();
        target.finalize().await.unwrap();

        assert_eq!(spool.purge_all().await.unwrap(), 1);
        assert_eq!(files_in(tmp.path()), expected);
        assert_eq!(
            std::fs::read(tmp.path().join("photos").join("a.jpg")).unwrap(),
            b"jpeg"
        );
    }

    #[tokio::test]
    async fn open_creates_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("nested").join("spool");
        let spool = Spool::open(SpoolConfig::persistent(&dir)).await;
        assert!(dir.is_dir());
        assert_eq!(spool.dir(), Some(dir.as_path()));
    }

    #[tokio::test]
    async fn persistent_write_and_finalize() {
        let tmp = TempDir::new().unwrap();
        let spool = Spool::open(SpoolConfig::persistent(tmp.path())).await;
        let session = SessionId::new();

        let mut target = spool.acquire(session, 11).await.unwrap();
        assert!(target.is_persistent());
        target.write(b"hello ").await.unwrap();
        target.write(b"world").await.unwrap();
        assert_eq!(target.written(), 11);
        assert_eq!(files_in(tmp.path()), vec![format!("{session}.part")]);

        let blob = target.finalize().await.unwrap();
        assert!(blob.is_persistent());
        assert_eq!(blob.len(), 11);
        assert_eq!(files_in(tmp.path()), vec![format!("{session}.blob")]);
        assert_eq!(&blob.read_all().await.unwrap()[..], b"hello world");
    }

    #[tokio::test]
    async fn falls_back_to_memory_when_dir_is_a_file() {
        let tmp = TempDir::new().unwrap();
        let not_a_dir = tmp.path().join("occupied");
        std::fs::write(&not_a_dir, b"x").unwrap();

        let spool = Spool::open(SpoolConfig::persistent(&not_a_dir)).await;
        let mut target = spool.acquire(SessionId::new(), 4).await.unwrap();
        assert!(!target.is_persistent());
        target.write(b"data").await.unwrap();

        let blob = target.finalize().await.unwrap();
        assert!(!blob.is_persistent());
        assert_eq!(&blob.read_all().await.unwrap()[..], b"data");
    }

    #[tokio::test]
    async fn memory_limit_is_enforced() {
        let spool = Spool::open(SpoolConfig::memory_only().with_memory_limit(8)).await;
        assert!(spool.acquire(SessionId::new(), 8).await.is_ok());
        let err = spool.acquire(SessionId::new(), 9).await.unwrap_err();
        assert!(matches!(
            err,
            SpoolError::AcquisitionFailed { size: 9, limit: 8 }
        ));
    }

    #[tokio::test]
    async fn discard_removes_partial_file() {
        let tmp = TempDir::new().unwrap();
        let spool = Spool::open(SpoolConfig::persistent(tmp.path())).await;
        let mut target = spool.acquire(SessionId::new(), 100).await.unwrap();
        target.write(&[7u8; 40]).await.unwrap();

        target.discard().await;
        assert!(files_in(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn purge_invalidates_blobs() {
        let tmp = TempDir::new().unwrap();
        let spool = Spool::open(SpoolConfig::persistent(tmp.path())).await;

        let mut target = spool.acquire(SessionId::new(), 3).await.unwrap();
        target.write(b"abc").await.unwrap();
        let blob = target.finalize().await.unwrap();
        assert!(blob.is_available());

        assert_eq!(spool.purge_all().await.unwrap(), 1);
        assert_eq!(spool.generation(), 1);
        assert!(!blob.is_available());
        assert!(matches!(
            blob.read_all().await,
            Err(SpoolError::BlobPurged)
        ));
        let dest = tmp.path().join("out.bin");
        assert!(matches!(
            blob.export(&dest).await,
            Err(SpoolError::BlobPurged)
        ));
    }

    #[tokio::test]
    async fn purge_during_write_fails_finalize() {
        let tmp = TempDir::new().unwrap();
        let spool = Spool::open(SpoolConfig::persistent(tmp.path())).await;

        let mut disk = spool.acquire(SessionId::new(), 3).await.unwrap();
        disk.write(b"abc").await.unwrap();
        let memory_spool = Spool::open(SpoolConfig::memory_only()).await;
        let mut memory = memory_spool.acquire(SessionId::new(), 3).await.unwrap();
        memory.write(b"abc").await.unwrap();

        spool.purge_all().await.unwrap();
        memory_spool.purge_all().await.unwrap();

        assert!(matches!(disk.finalize().await, Err(SpoolError::BlobPurged)));
        assert!(matches!(
            memory.finalize().await,
            Err(SpoolError::BlobPurged)
        ));
        assert!(files_in(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn export_copies_blob() {
        let tmp = TempDir::new().unwrap();
        let spool = Spool::open(SpoolConfig::memory_only()).await;
        let mut target = spool.acquire(SessionId::new(), 5).await.unwrap();
        target.write(b"12345").await.unwrap();
        let blob = target.finalize().await.unwrap();

        let dest = tmp.path().join("copy.bin");
        assert_eq!(blob.export(&dest).await.unwrap(), 5);
        assert_eq!(std::fs::read(&dest).unwrap(), b"12345");
    }

    #[tokio::test]
    async fn empty_payload_finalizes() {
        let tmp = TempDir::new().unwrap();
        let spool = Spool::open(SpoolConfig::persistent(tmp.path())).await;
        let blob = spool
            .acquire(SessionId::new(), 0)
            .await
            .unwrap()
            .finalize()
            .await
            .unwrap();
        assert!(blob.is_empty());
        assert!(blob.read_all().await.unwrap().is_empty());
    }
}
