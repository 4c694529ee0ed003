//! Write-back staging in front of a remote store.
//!
//! `put` writes land in a temp file in the staging directory. Closing the
//! writer renames it to `pending-<key>` and hands the key to a background
//! upload task, so the writer never waits on the remote store. Once the
//! upload is confirmed the file becomes `completed-<key>` and is kept in a
//! bounded LRU as a read cache. Pending files are never evicted; they are
//! picked up again after a restart.
//!
//! Every commit and delete bumps a per-key generation. An upload task only
//! promotes a pending file if the generation it uploaded is still current,
//! otherwise it uploads again, so an overwrite during an upload is never lost.

mod reader;
mod writer;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tempfile::TempPath;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::keys::{parse_staged_file_name, StagedState, TEMP_PREFIX};
use crate::upload::{spawn_upload, RetryPolicy, Settled};
use crate::{
    BlobError, BlobReader, BlobResult, BlobStore, BlobWriter, OpenFileCache, StagingConfig,
    StoreCapabilities,
};

use reader::StagedReader;
use writer::StagedWriter;

/// A staged copy may vanish between lookup and open; look it up this many times.
const LOCAL_ATTEMPTS: usize = 2;

/// Write-back uploader wrapping a [`BlobStore`]
#[derive(Clone)]
pub struct StagedBlobUploader {
    inner: Arc<StagingInner>,
}

pub(crate) struct StagingInner {
    pub(crate) dir: PathBuf,
    pub(crate) backing: Arc<dyn BlobStore>,
    pub(crate) permits: Semaphore,
    pub(crate) retry: RetryPolicy,
    /// Number of live upload tasks
    pub(crate) active: watch::Sender<usize>,
    pub(crate) shutdown: watch::Sender<bool>,
    files: OpenFileCache,
    max_completed: usize,
    state: Mutex<StagingState>,
}

struct StagingState {
    uploads: HashMap<String, UploadState>,
    completed: LruCache<String, ()>,
}

/// Per-key bookkeeping, kept while a pending file exists or a task runs
#[derive(Debug, Default)]
struct UploadState {
    generation: u64,
    pending: bool,
    running: bool,
}

impl StagedBlobUploader {
    /// Open an uploader over `backing`, resuming uploads of pending files
    /// left by a previous run.
    pub async fn open(backing: Arc<dyn BlobStore>, config: StagingConfig) -> BlobResult<Self> {
        tokio::fs::create_dir_all(&config.dir).await?;

        let completed = NonZeroUsize::new(config.max_completed.max(1)).unwrap_or(NonZeroUsize::MIN);
        let (active, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(StagingInner {
            dir: config.dir.clone(),
            backing,
            permits: Semaphore::new(config.max_active_uploads.max(1)),
            retry: config.retry,
            active,
            shutdown,
            files: OpenFileCache::new(config.max_open_files),
            max_completed: config.max_completed,
            state: Mutex::new(StagingState {
                uploads: HashMap::new(),
                completed: LruCache::new(completed),
            }),
        });

        let recovering = inner.clone();
        let (resumed, kept) = tokio::task::spawn_blocking(move || {
            scan_staging_dir(&recovering.dir).map(|found| recovering.recover(found))
        })
        .await
        .map_err(BlobError::backend)??;
        info!(
            "Staging area at {} recovered {} pending and {} completed blobs",
            inner.dir.display(),
            resumed.len(),
            kept
        );
        for key in resumed {
            spawn_upload(inner.clone(), key);
        }
        Ok(Self { inner })
    }

    /// Wait until no upload task is running.
    ///
    /// Uploads are retried forever, so this only returns once every staged
    /// write has reached the backing store (or after [`shutdown`](Self::shutdown)).
    pub async fn flush(&self) {
        let mut active = self.inner.active.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;
    }

    /// Stop background uploads and wait for their tasks to exit.
    ///
    /// Pending files stay on disk and are resumed by the next [`open`](Self::open).
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.flush().await;
        info!("Staging area at {} shut down", self.inner.dir.display());
    }

    /// Number of upload tasks still running
    pub fn pending_uploads(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Whether `key` currently has a completed local copy
    pub fn is_cached(&self, key: &str) -> bool {
        self.inner.state.lock().completed.contains(key)
    }

    /// The directory owned by this uploader
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }
}

impl StagingInner {
    /// Register the files found at startup; returns the keys to resume and
    /// the number of completed copies kept.
    fn recover(&self, found: StagedFiles) -> (Vec<String>, usize) {
        let mut state = self.state.lock();
        for key in &found.pending {
            state.uploads.insert(
                key.clone(),
                UploadState {
                    generation: 0,
                    pending: true,
                    running: true,
                },
            );
        }

        let mut kept = 0;
        for key in found.completed {
            // Superseded by a newer write before the crash, or not kept at all
            if state.uploads.contains_key(&key) || self.max_completed == 0 {
                self.remove_staged_file(&StagedState::Completed.path(&self.dir, &key));
                continue;
            }
            self.keep_completed(&mut state, &key);
            kept += 1;
        }
        (found.pending, kept)
    }

    /// Publish a fully written temp file as the pending copy of `key`.
    ///
    /// Returns true when the caller must start an upload task.
    pub(crate) fn commit(&self, key: &str, temp: TempPath) -> BlobResult<bool> {
        let pending = StagedState::Pending.path(&self.dir, key);
        let mut state = self.state.lock();

        temp.persist(&pending).map_err(|e| BlobError::from(e.error))?;
        self.files.remove(&pending);
        state.completed.pop(key);
        self.remove_staged_file(&StagedState::Completed.path(&self.dir, key));

        let stopped = *self.shutdown.borrow();
        let upload = state.uploads.entry(key.to_string()).or_default();
        upload.generation += 1;
        upload.pending = true;
        let start = !upload.running && !stopped;
        if start {
            upload.running = true;
        }
        Ok(start)
    }

    pub(crate) fn generation(&self, key: &str) -> u64 {
        self.state.lock().uploads.get(key).map_or(0, |u| u.generation)
    }

    /// Promote the pending copy uploaded at `generation` to completed.
    pub(crate) async fn finalize(self: Arc<Self>, key: &str, generation: u64) -> BlobResult<Settled> {
        let key = key.to_string();
        tokio::task::spawn_blocking(move || self.promote(&key, generation))
            .await
            .map_err(BlobError::backend)?
    }

    /// Rename under the state lock, so no commit can slip in between.
    fn promote(&self, key: &str, generation: u64) -> BlobResult<Settled> {
        let pending = StagedState::Pending.path(&self.dir, key);
        let mut state = self.state.lock();
        match state.uploads.get(key).map(|u| u.generation) {
            Some(current) if current == generation => {}
            Some(_) => return Ok(Settled::Superseded),
            None => return Ok(Settled::Done),
        }

        if self.max_completed == 0 {
            std::fs::remove_file(&pending)?;
        } else {
            std::fs::rename(&pending, StagedState::Completed.path(&self.dir, key))?;
        }
        self.files.remove(&pending);
        state.uploads.remove(key);
        if self.max_completed > 0 {
            self.keep_completed(&mut state, key);
        }
        Ok(Settled::Done)
    }

    /// The pending file of `key` is gone; stop unless a newer write arrived.
    pub(crate) fn settle_missing(&self, key: &str, generation: u64) -> Settled {
        let mut state = self.state.lock();
        if state.uploads.get(key).is_some_and(|u| u.generation != generation) {
            return Settled::Superseded;
        }
        state.uploads.remove(key);
        Settled::Done
    }

    /// Forget the task of `key`, which stopped without finishing.
    pub(crate) fn abandon(&self, key: &str) {
        let mut state = self.state.lock();
        let idle = match state.uploads.get_mut(key) {
            Some(upload) => {
                upload.running = false;
                !upload.pending
            }
            None => false,
        };
        if idle {
            state.uploads.remove(key);
        }
    }

    /// Current local copy of `key`, pending first.
    fn resolve(&self, key: &str) -> Option<PathBuf> {
        let mut state = self.state.lock();
        if state.uploads.get(key).is_some_and(|u| u.pending) {
            return Some(StagedState::Pending.path(&self.dir, key));
        }
        // `get` refreshes the completed copy's recency
        state
            .completed
            .get(key)
            .map(|_| StagedState::Completed.path(&self.dir, key))
    }

    /// Drop every local copy of `key`; true if there was one.
    fn forget(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let mut found = false;
        let idle = match state.uploads.get_mut(key) {
            Some(upload) => {
                upload.generation += 1;
                found |= upload.pending;
                upload.pending = false;
                !upload.running
            }
            None => false,
        };
        if idle {
            state.uploads.remove(key);
        }
        found |= state.completed.pop(key).is_some();

        found |= self.remove_staged_file(&StagedState::Pending.path(&self.dir, key));
        found |= self.remove_staged_file(&StagedState::Completed.path(&self.dir, key));
        found
    }

    fn staged_keys(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .uploads
            .iter()
            .filter(|(_, u)| u.pending)
            .map(|(k, _)| k.clone())
            .chain(state.completed.iter().map(|(k, _)| k.clone()))
            .collect()
    }

    fn keep_completed(&self, state: &mut StagingState, key: &str) {
        if let Some((old, ())) = state.completed.push(key.to_string(), ()) {
            if old != key {
                debug!("Evicting completed copy of {}", old);
                self.remove_staged_file(&StagedState::Completed.path(&self.dir, &old));
            }
        }
    }

    /// Detach and unlink a staged file; true if it existed.
    fn remove_staged_file(&self, path: &Path) -> bool {
        self.files.remove(path);
        match std::fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!("Unable to remove staged file {}: {}", path.display(), e);
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct StagedFiles {
    pending: Vec<String>,
    /// Oldest first
    completed: Vec<String>,
}

/// Classify the staging directory, deleting temp files of unfinished writes.
fn scan_staging_dir(dir: &Path) -> std::io::Result<StagedFiles> {
    let mut found = StagedFiles::default();
    let mut completed = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if name.starts_with(TEMP_PREFIX) {
            debug!("Deleting abandoned write {}", path.display());
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Unable to remove temp file {}: {}", path.display(), e);
            }
            continue;
        }
        match parse_staged_file_name(name) {
            Some((StagedState::Pending, key)) => found.pending.push(key),
            Some((StagedState::Completed, key)) => {
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                completed.push((mtime, key));
            }
            None => debug!("Ignoring foreign file {}", path.display()),
        }
    }
    completed.sort_by_key(|(mtime, _)| *mtime);
    found.completed = completed.into_iter().map(|(_, key)| key).collect();
    Ok(found)
}

#[async_trait]
impl BlobStore for StagedBlobUploader {
    async fn size(&self, key: &str) -> BlobResult<u64> {
        for _ in 0..LOCAL_ATTEMPTS {
            let Some(path) = self.inner.resolve(key) else { break };
            match tokio::fs::metadata(&path).await {
                Ok(meta) => return Ok(meta.len()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.inner.backing.size(key).await
    }

    async fn get(&self, key: &str) -> BlobResult<Box<dyn BlobReader>> {
        for attempt in 0..LOCAL_ATTEMPTS {
            let Some(path) = self.inner.resolve(key) else { break };
            let files = self.inner.files.clone();
            let opened = tokio::task::spawn_blocking(move || files.open(path))
                .await
                .map_err(BlobError::backend)?;
            match opened {
                Ok(handle) => return Ok(Box::new(StagedReader::new(handle)?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(key, attempt, "Staged copy moved before it could be opened");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.inner.backing.get(key).await
    }

    async fn put(&self, key: &str) -> BlobResult<Box<dyn BlobWriter>> {
        if *self.inner.shutdown.borrow() {
            return Err(BlobError::Shutdown);
        }
        let writer = StagedWriter::create(self.inner.clone(), key).await?;
        Ok(Box::new(writer))
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let inner = self.inner.clone();
        let forgotten = key.to_string();
        let local = tokio::task::spawn_blocking(move || inner.forget(&forgotten))
            .await
            .map_err(BlobError::backend)?;
        match self.inner.backing.delete(key).await {
            Err(e) if e.is_not_found() && local => Ok(()),
            result => result,
        }
    }

    async fn list(&self) -> BlobResult<Vec<String>> {
        let mut keys = self.inner.backing.list().await?;
        keys.extend(self.inner.staged_keys());
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.inner.backing.capabilities()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::store::{get_bytes, put_bytes};
    use crate::MemoryBlobStore;

    fn config(dir: &Path) -> StagingConfig {
        StagingConfig::new(dir).with_retry(RetryPolicy::new(Duration::from_millis(1), 2))
    }

    async fn setup() -> (tempfile::TempDir, Arc<MemoryBlobStore>, StagedBlobUploader) {
        let dir = tempfile::tempdir().unwrap();
        let backing = Arc::new(MemoryBlobStore::new());
        let uploader = StagedBlobUploader::open(backing.clone(), config(dir.path())).await.unwrap();
        (dir, backing, uploader)
    }

    #[tokio::test]
    async fn upload_promotes_pending_to_completed() {
        let (dir, backing, uploader) = setup().await;
        put_bytes(&uploader, "a/b", b"payload").await.unwrap();
        uploader.flush().await;

        assert_eq!(backing.peek("a/b").as_deref(), Some(&b"payload"[..]));
        assert!(!StagedState::Pending.path(dir.path(), "a/b").exists());
        assert!(StagedState::Completed.path(dir.path(), "a/b").exists());
        assert!(uploader.is_cached("a/b"));
        assert_eq!(uploader.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn reads_prefer_local_copies() {
        let (_dir, backing, uploader) = setup().await;
        put_bytes(&uploader, "k", b"local").await.unwrap();
        uploader.flush().await;

        let gets = backing.stats().gets();
        assert_eq!(get_bytes(&uploader, "k").await.unwrap(), b"local");
        assert_eq!(uploader.size("k").await.unwrap(), 5);
        assert_eq!(backing.stats().gets(), gets);
        assert_eq!(backing.stats().sizes(), 0);
    }

    #[tokio::test]
    async fn falls_back_to_backing_store() {
        let (_dir, backing, uploader) = setup().await;
        put_bytes(backing.as_ref(), "remote", b"only upstream").await.unwrap();

        assert_eq!(get_bytes(&uploader, "remote").await.unwrap(), b"only upstream");
        assert_eq!(uploader.size("remote").await.unwrap(), 13);
        assert!(uploader.get("missing").await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn commit_replaces_completed_copy() {
        let (dir, backing, uploader) = setup().await;
        put_bytes(&uploader, "k", b"v1").await.unwrap();
        uploader.flush().await;
        assert!(StagedState::Completed.path(dir.path(), "k").exists());

        backing.hold_commits(true);
        put_bytes(&uploader, "k", b"version two").await.unwrap();
        assert!(!StagedState::Completed.path(dir.path(), "k").exists());
        assert!(!uploader.is_cached("k"));
        assert_eq!(get_bytes(&uploader, "k").await.unwrap(), b"version two");

        backing.hold_commits(false);
        uploader.flush().await;
        let completed = StagedState::Completed.path(dir.path(), "k");
        assert_eq!(std::fs::read(completed).unwrap(), b"version two");
    }

    #[tokio::test]
    async fn completed_copies_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Arc::new(MemoryBlobStore::new());
        let uploader = StagedBlobUploader::open(backing.clone(), config(dir.path()).with_max_completed(2))
            .await
            .unwrap();

        for key in ["a", "b", "c"] {
            put_bytes(&uploader, key, key.as_bytes()).await.unwrap();
            uploader.flush().await;
        }

        assert!(!uploader.is_cached("a"));
        assert!(!StagedState::Completed.path(dir.path(), "a").exists());
        assert!(uploader.is_cached("b") && uploader.is_cached("c"));
        // Evicted copies are still readable upstream
        assert_eq!(get_bytes(&uploader, "a").await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn zero_completed_keeps_no_copies() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Arc::new(MemoryBlobStore::new());
        let uploader = StagedBlobUploader::open(backing.clone(), config(dir.path()).with_max_completed(0))
            .await
            .unwrap();

        put_bytes(&uploader, "k", b"v").await.unwrap();
        uploader.flush().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(backing.peek("k").as_deref(), Some(&b"v"[..]));
    }

    #[tokio::test]
    async fn zero_completed_recovery_drops_completed_copies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(StagedState::Completed.path(dir.path(), "k"), b"old").unwrap();

        let backing = Arc::new(MemoryBlobStore::new());
        let uploader = StagedBlobUploader::open(backing.clone(), config(dir.path()).with_max_completed(0))
            .await
            .unwrap();

        assert!(!uploader.is_cached("k"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Remote store whose writers blow up
    struct PanickingStore;

    #[async_trait]
    impl BlobStore for PanickingStore {
        async fn size(&self, key: &str) -> BlobResult<u64> {
            Err(BlobError::not_found(key))
        }

        async fn get(&self, key: &str) -> BlobResult<Box<dyn BlobReader>> {
            Err(BlobError::not_found(key))
        }

        async fn put(&self, _key: &str) -> BlobResult<Box<dyn BlobWriter>> {
            panic!("remote store crashed");
        }

        async fn delete(&self, key: &str) -> BlobResult<()> {
            Err(BlobError::not_found(key))
        }
    }

    #[tokio::test]
    async fn panicking_upload_does_not_wedge_flush() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = StagedBlobUploader::open(Arc::new(PanickingStore), config(dir.path()))
            .await
            .unwrap();

        put_bytes(&uploader, "k", b"kept locally").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), uploader.flush())
            .await
            .expect("flush hung after a task panic");

        assert_eq!(uploader.pending_uploads(), 0);
        assert_eq!(get_bytes(&uploader, "k").await.unwrap(), b"kept locally");
        assert!(StagedState::Pending.path(dir.path(), "k").exists());
    }

    #[tokio::test]
    async fn list_includes_staged_keys() {
        let (_dir, backing, uploader) = setup().await;
        put_bytes(backing.as_ref(), "upstream", b"1").await.unwrap();
        backing.hold_commits(true);
        put_bytes(&uploader, "staged", b"2").await.unwrap();

        assert_eq!(uploader.list().await.unwrap(), vec!["staged", "upstream"]);
        backing.hold_commits(false);
        uploader.flush().await;
        assert_eq!(uploader.list().await.unwrap(), vec!["staged", "upstream"]);
    }

    #[tokio::test]
    async fn put_after_shutdown_is_refused() {
        let (_dir, _backing, uploader) = setup().await;
        uploader.shutdown().await;
        assert!(matches!(uploader.put("k").await.err(), Some(BlobError::Shutdown)));
    }

    #[tokio::test]
    #[traced_test]
    async fn recovery_resumes_pending_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(StagedState::Pending.path(dir.path(), "k"), b"v").unwrap();
        std::fs::write(StagedState::Completed.path(dir.path(), "k"), b"stale").unwrap();

        let backing = Arc::new(MemoryBlobStore::new());
        let uploader = StagedBlobUploader::open(backing.clone(), config(dir.path())).await.unwrap();
        assert_eq!(get_bytes(&uploader, "k").await.unwrap(), b"v");
        uploader.flush().await;

        assert!(logs_contain("recovered 1 pending and 0 completed blobs"));
        assert_eq!(backing.peek("k").as_deref(), Some(&b"v"[..]));
        assert_eq!(std::fs::read(StagedState::Completed.path(dir.path(), "k")).unwrap(), b"v");
    }
}
