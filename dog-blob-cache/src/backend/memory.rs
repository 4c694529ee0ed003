use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::{BlobError, BlobReader, BlobResult, BlobStore, BlobWriter, StoreCapabilities};

/// In-memory blob store for testing and development.
///
/// Counts every call, can inject latency and failures, and can hold commits
/// in flight, so cache layers can be exercised against an "unreliable remote".
#[derive(Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Bytes>>>,
    stats: Arc<StoreStats>,
    faults: Arc<Faults>,
}

/// Per-operation call counters
#[derive(Debug, Default)]
pub struct StoreStats {
    pub sizes: AtomicU64,
    pub gets: AtomicU64,
    pub reads: AtomicU64,
    pub puts: AtomicU64,
    pub commits: AtomicU64,
    pub deletes: AtomicU64,
    pub lists: AtomicU64,
}

impl StoreStats {
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn sizes(&self) -> u64 {
        self.sizes.load(Ordering::SeqCst)
    }
}

struct Faults {
    latency: RwLock<Option<Duration>>,
    fail_commits: AtomicBool,
    fail_next_commits: AtomicUsize,
    truncated_reads: AtomicBool,
    hold_commits: watch::Sender<bool>,
    held: AtomicUsize,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        let (hold_commits, _) = watch::channel(false);
        Self {
            blobs: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(StoreStats::default()),
            faults: Arc::new(Faults {
                latency: RwLock::new(None),
                fail_commits: AtomicBool::new(false),
                fail_next_commits: AtomicUsize::new(0),
                truncated_reads: AtomicBool::new(false),
                hold_commits,
                held: AtomicUsize::new(0),
            }),
        }
    }

    /// Delay every operation (including each `read_at`) by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.faults.latency.write() = Some(latency);
        self
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Make every writer `close` fail until switched off
    pub fn set_fail_commits(&self, fail: bool) {
        self.faults.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` writer `close` calls fail
    pub fn fail_next_commits(&self, n: usize) {
        self.faults.fail_next_commits.store(n, Ordering::SeqCst);
    }

    /// Serve only the first half of every blob while still reporting its full size
    pub fn set_truncated_reads(&self, truncated: bool) {
        self.faults.truncated_reads.store(truncated, Ordering::SeqCst);
    }

    /// Park writer commits until released with `hold_commits(false)`
    pub fn hold_commits(&self, hold: bool) {
        self.faults.hold_commits.send_replace(hold);
    }

    /// Number of commits currently parked by `hold_commits`
    pub fn held_commits(&self) -> usize {
        self.faults.held.load(Ordering::SeqCst)
    }

    /// Snapshot of a stored blob, bypassing counters and faults
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        self.blobs.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn delay(&self) {
        let latency = *self.faults.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn size(&self, key: &str) -> BlobResult<u64> {
        self.stats.sizes.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.blobs
            .read()
            .get(key)
            .map(|b| b.len() as u64)
            .ok_or_else(|| BlobError::not_found(key))
    }

    async fn get(&self, key: &str) -> BlobResult<Box<dyn BlobReader>> {
        self.stats.gets.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let data = self
            .blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::not_found(key))?;
        Ok(Box::new(MemoryReader {
            store: self.clone(),
            data,
        }))
    }

    async fn put(&self, key: &str) -> BlobResult<Box<dyn BlobWriter>> {
        self.stats.puts.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        Ok(Box::new(MemoryWriter {
            store: self.clone(),
            key: key.to_string(),
            buf: Vec::new(),
        }))
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.stats.deletes.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.blobs
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BlobError::not_found(key))
    }

    async fn list(&self) -> BlobResult<Vec<String>> {
        self.stats.lists.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let mut keys: Vec<String> = self.blobs.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::basic().with_list()
    }
}

struct MemoryReader {
    store: MemoryBlobStore,
    data: Bytes,
}

#[async_trait]
impl BlobReader for MemoryReader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> BlobResult<usize> {
        self.store.stats.reads.fetch_add(1, Ordering::SeqCst);
        self.store.delay().await;

        let mut end = self.data.len();
        if self.store.faults.truncated_reads.load(Ordering::SeqCst) {
            end /= 2;
        }
        let start = (offset.min(end as u64)) as usize;
        let n = buf.len().min(end - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

struct MemoryWriter {
    store: MemoryBlobStore,
    key: String,
    buf: Vec<u8>,
}

#[async_trait]
impl BlobWriter for MemoryWriter {
    async fn write(&mut self, buf: &[u8]) -> BlobResult<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn close(self: Box<Self>) -> BlobResult<()> {
        let Self { store, key, buf } = *self;
        let faults = &store.faults;

        let mut hold = faults.hold_commits.subscribe();
        let held = *hold.borrow();
        if held {
            faults.held.fetch_add(1, Ordering::SeqCst);
            let _ = hold.wait_for(|held| !*held).await;
            faults.held.fetch_sub(1, Ordering::SeqCst);
        }
        store.delay().await;

        let scheduled_failure = faults
            .fail_next_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled_failure || faults.fail_commits.load(Ordering::SeqCst) {
            return Err(BlobError::backend(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                format!("injected commit failure for {}", key),
            )));
        }

        store.stats.commits.fetch_add(1, Ordering::SeqCst);
        store.blobs.write().insert(key, Bytes::from(buf));
        Ok(())
    }

    async fn cancel(self: Box<Self>) -> BlobResult<()> {
        Ok(())
    }
}
