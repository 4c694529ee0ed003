use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dog_blob_cache::keys::StagedState;
use dog_blob_cache::{
    get_bytes, put_bytes, BlobReader, BlobResult, BlobStore, BlobWriter, MemoryBlobStore, RetryPolicy,
    StagedBlobUploader, StagingConfig,
};

/// Test factory functions
fn test_config(dir: &Path) -> StagingConfig {
    StagingConfig::new(dir).with_retry(RetryPolicy::new(Duration::from_millis(2), 3))
}

async fn open_uploader(dir: &Path, backing: &Arc<MemoryBlobStore>) -> StagedBlobUploader {
    StagedBlobUploader::open(backing.clone(), test_config(dir)).await.unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timeout waiting for condition");
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// S1. Put then get round-trips, before and after the upload
#[tokio::test]
async fn test_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let backing = Arc::new(MemoryBlobStore::new());
    let uploader = open_uploader(dir.path(), &backing).await;

    let blobs = [
        ("empty", Vec::new()),
        ("small", payload(17, 1)),
        ("nested/key with spaces", payload(1000, 2)),
        ("large", payload(3 * 256 * 1024 + 5, 3)),
    ];
    for (key, data) in &blobs {
        put_bytes(&uploader, key, data).await.unwrap();
        assert_eq!(&get_bytes(&uploader, key).await.unwrap(), data);
    }

    uploader.flush().await;
    for (key, data) in &blobs {
        assert_eq!(backing.peek(key).unwrap().as_ref(), &data[..]);
        assert_eq!(&get_bytes(&uploader, key).await.unwrap(), data);
        assert_eq!(uploader.size(key).await.unwrap(), data.len() as u64);
    }
}

/// S2. Close returns while the remote upload is still outstanding
#[tokio::test]
async fn test_close_does_not_wait_for_upload() {
    let dir = tempfile::tempdir().unwrap();
    let backing = Arc::new(MemoryBlobStore::new());
    let uploader = open_uploader(dir.path(), &backing).await;

    backing.hold_commits(true);
    put_bytes(&uploader, "k", b"written locally").await.unwrap();
    wait_until(|| backing.held_commits() == 1).await;

    assert_eq!(uploader.pending_uploads(), 1);
    assert!(backing.peek("k").is_none());
    assert_eq!(get_bytes(&uploader, "k").await.unwrap(), b"written locally");

    backing.hold_commits(false);
    uploader.flush().await;
    assert_eq!(uploader.pending_uploads(), 0);
    assert_eq!(backing.peek("k").as_deref(), Some(&b"written locally"[..]));
}

/// S3. Pending writes survive a restart and are uploaded by the next instance
#[tokio::test]
async fn test_crash_recovery_resumes_upload() {
    let dir = tempfile::tempdir().unwrap();
    let backing = Arc::new(MemoryBlobStore::new());
    let data = payload(5000, 9);

    // Arrange: the remote refuses every upload, then the process goes away
    backing.set_fail_commits(true);
    {
        let uploader = open_uploader(dir.path(), &backing).await;
        put_bytes(&uploader, "k", &data).await.unwrap();
        assert_eq!(get_bytes(&uploader, "k").await.unwrap(), data);
        uploader.shutdown().await;
    }
    assert!(StagedState::Pending.path(dir.path(), "k").exists());
    assert!(backing.peek("k").is_none());
    std::fs::write(dir.path().join("temp-abandoned"), b"never committed").unwrap();

    // Act: restart against a healthy remote
    backing.set_fail_commits(false);
    let uploader = open_uploader(dir.path(), &backing).await;
    assert!(!dir.path().join("temp-abandoned").exists());
    assert_eq!(get_bytes(&uploader, "k").await.unwrap(), data);
    uploader.flush().await;

    // Assert: durable upstream and promoted locally
    assert_eq!(backing.peek("k").unwrap().as_ref(), &data[..]);
    assert!(!StagedState::Pending.path(dir.path(), "k").exists());
    assert!(StagedState::Completed.path(dir.path(), "k").exists());
    assert_eq!(get_bytes(&uploader, "k").await.unwrap(), data);
}

/// S4. A recovered pending file already upstream is not sent again
#[tokio::test]
async fn test_recovered_upload_skips_matching_remote() {
    let dir = tempfile::tempdir().unwrap();
    let backing = Arc::new(MemoryBlobStore::new());
    put_bytes(backing.as_ref(), "k", b"same bytes").await.unwrap();
    std::fs::write(StagedState::Pending.path(dir.path(), "k"), b"same bytes").unwrap();

    let uploader = open_uploader(dir.path(), &backing).await;
    uploader.flush().await;

    assert_eq!(backing.stats().commits(), 1);
    assert!(uploader.is_cached("k"));
}

/// S5. Failed uploads are retried until they succeed
#[tokio::test]
async fn test_failed_uploads_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let backing = Arc::new(MemoryBlobStore::new());
    let uploader = open_uploader(dir.path(), &backing).await;

    backing.fail_next_commits(3);
    put_bytes(&uploader, "k", b"eventually").await.unwrap();
    uploader.flush().await;

    assert_eq!(backing.peek("k").as_deref(), Some(&b"eventually"[..]));
    assert_eq!(backing.stats().commits(), 1);
}

/// S6. Overwriting a key mid-upload still leaves the newest bytes upstream
#[tokio::test]
async fn test_overwrite_during_upload_is_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let backing = Arc::new(MemoryBlobStore::new());
    let uploader = open_uploader(dir.path(), &backing).await;

    // Arrange: first upload is in flight and parked inside the remote commit
    backing.hold_commits(true);
    put_bytes(&uploader, "k", b"version one").await.unwrap();
    wait_until(|| backing.held_commits() == 1).await;

    // Act: overwrite while it is parked, then let it through
    put_bytes(&uploader, "k", b"version two, longer").await.unwrap();
    assert_eq!(get_bytes(&uploader, "k").await.unwrap(), b"version two, longer");
    backing.hold_commits(false);
    uploader.flush().await;

    // Assert: the stale snapshot was followed by the new content
    assert_eq!(backing.peek("k").as_deref(), Some(&b"version two, longer"[..]));
    assert_eq!(backing.stats().commits(), 2);
    assert_eq!(get_bytes(&uploader, "k").await.unwrap(), b"version two, longer");
}

/// S7. Deleting a key mid-upload does not let the upload resurrect it
#[tokio::test]
async fn test_delete_during_upload_removes_remote_copy() {
    let dir = tempfile::tempdir().unwrap();
    let backing = Arc::new(MemoryBlobStore::new());
    let uploader = open_uploader(dir.path(), &backing).await;

    backing.hold_commits(true);
    put_bytes(&uploader, "k", b"doomed").await.unwrap();
    wait_until(|| backing.held_commits() == 1).await;

    uploader.delete("k").await.unwrap();
    assert!(uploader.get("k").await.err().unwrap().is_not_found());

    backing.hold_commits(false);
    uploader.flush().await;
    assert!(backing.peek("k").is_none());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

/// S8. A cancelled write leaves no trace
#[tokio::test]
async fn test_cancel_leaves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let backing = Arc::new(MemoryBlobStore::new());
    let uploader = open_uploader(dir.path(), &backing).await;

    let mut writer = uploader.put("k").await.unwrap();
    writer.write(b"partial").await.unwrap();
    writer.cancel().await.unwrap();

    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    assert_eq!(uploader.pending_uploads(), 0);
    assert!(uploader.get("k").await.err().unwrap().is_not_found());
    assert!(backing.is_empty());
}

/// S9. Deleting twice never disturbs other keys
#[tokio::test]
async fn test_delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let backing = Arc::new(MemoryBlobStore::new());
    let uploader = open_uploader(dir.path(), &backing).await;
    put_bytes(&uploader, "a", b"aaa").await.unwrap();
    put_bytes(&uploader, "b", b"bbb").await.unwrap();
    uploader.flush().await;

    uploader.delete("a").await.unwrap();
    assert!(uploader.delete("a").await.unwrap_err().is_not_found());

    assert!(uploader.get("a").await.err().unwrap().is_not_found());
    assert_eq!(get_bytes(&uploader, "b").await.unwrap(), b"bbb");
    assert_eq!(uploader.list().await.unwrap(), vec!["b"]);
}

/// S10. Many writers upload through a small pool and all land upstream
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers() {
    let dir = tempfile::tempdir().unwrap();
    let backing = Arc::new(MemoryBlobStore::new().with_latency(Duration::from_millis(5)));
    let config = test_config(dir.path()).with_max_active_uploads(2).with_max_completed(4);
    let uploader = StagedBlobUploader::open(backing.clone(), config).await.unwrap();

    let writers: Vec<_> = (0..20u8)
        .map(|i| {
            let uploader = uploader.clone();
            tokio::spawn(async move {
                let key = format!("key-{i}");
                let data = payload(100 + i as usize, i);
                put_bytes(&uploader, &key, &data).await.unwrap();
                assert_eq!(get_bytes(&uploader, &key).await.unwrap(), data);
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }
    uploader.flush().await;

    for i in 0..20u8 {
        let key = format!("key-{i}");
        assert_eq!(backing.peek(&key).unwrap().as_ref(), &payload(100 + i as usize, i)[..]);
        assert_eq!(get_bytes(&uploader, &key).await.unwrap(), payload(100 + i as usize, i));
    }
    let completed = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(completed, 4);
}

/// Backing store that records how many commits run at once
#[derive(Default)]
struct CommitGauge {
    inner: MemoryBlobStore,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct GaugedWriter {
    inner: Box<dyn BlobWriter>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl BlobStore for CommitGauge {
    async fn size(&self, key: &str) -> BlobResult<u64> {
        self.inner.size(key).await
    }

    async fn get(&self, key: &str) -> BlobResult<Box<dyn BlobReader>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str) -> BlobResult<Box<dyn BlobWriter>> {
        Ok(Box::new(GaugedWriter {
            inner: self.inner.put(key).await?,
            running: self.running.clone(),
            peak: self.peak.clone(),
        }))
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.inner.delete(key).await
    }
}

#[async_trait]
impl BlobWriter for GaugedWriter {
    async fn write(&mut self, buf: &[u8]) -> BlobResult<()> {
        self.inner.write(buf).await
    }

    async fn close(self: Box<Self>) -> BlobResult<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = self.inner.close().await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn cancel(self: Box<Self>) -> BlobResult<()> {
        self.inner.cancel().await
    }
}

/// S11. No more than `max_active_uploads` commits reach the remote at once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upload_concurrency_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let backing = Arc::new(CommitGauge::default());
    let config = test_config(dir.path()).with_max_active_uploads(2);
    let uploader = StagedBlobUploader::open(backing.clone(), config).await.unwrap();

    for i in 0..12u8 {
        put_bytes(&uploader, &format!("key-{i}"), &payload(64, i)).await.unwrap();
    }
    uploader.flush().await;

    let peak = backing.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "{peak} commits ran at once");
    for i in 0..12u8 {
        assert_eq!(backing.inner.peek(&format!("key-{i}")).unwrap().as_ref(), &payload(64, i)[..]);
    }
}
