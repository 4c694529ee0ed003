//! Background upload of staged blobs.
//!
//! One task runs per key at a time. Each attempt holds a slot of the
//! uploader's semaphore; a failed attempt gives its slot back for the whole
//! backoff sleep. Tasks never give up on their own, only on shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::keys::StagedState;
use crate::staging::StagingInner;
use crate::store::COPY_CHUNK_BYTES;
use crate::BlobResult;

/// Capped, randomized exponential backoff.
///
/// Attempt `n` sleeps a uniformly random duration in `[0, base << min(n, max_exponent))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_exponent: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_exponent: 8, // 256s window
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max_exponent: u32) -> Self {
        Self { base, max_exponent }
    }

    /// Upper bound of the backoff window for `attempt` (0-based)
    pub fn window(&self, attempt: u32) -> Duration {
        let exp = attempt.min(self.max_exponent).min(31);
        self.base.saturating_mul(1u32 << exp)
    }

    /// Draw the sleep for `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let window = self.window(attempt).as_nanos().min(u64::MAX as u128) as u64;
        if window == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..window))
    }
}

/// How an upload round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settled {
    /// Nothing left to do for the key
    Done,
    /// A newer write or a delete arrived meanwhile; go around again
    Superseded,
}

enum Pushed {
    Uploaded,
    /// No pending file; the key was deleted
    Missing,
}

/// Start the upload task of `key`, whose state is already marked running.
pub(crate) fn spawn_upload(inner: Arc<StagingInner>, key: String) {
    let mut task = UploadTask::new(inner, key);
    tokio::spawn(async move {
        let settled = run_upload(&task.inner, &task.key).await;
        task.settled = settled;
    });
}

/// Counts a live upload task. Dropping it releases the key and the count,
/// also when the task panics or is dropped by the runtime.
struct UploadTask {
    inner: Arc<StagingInner>,
    key: String,
    settled: bool,
}

impl UploadTask {
    fn new(inner: Arc<StagingInner>, key: String) -> Self {
        inner.active.send_modify(|n| *n += 1);
        Self {
            inner,
            key,
            settled: false,
        }
    }
}

impl Drop for UploadTask {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.abandon(&self.key);
        }
        self.inner.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Upload `key` until it settles; false if stopped by shutdown first.
#[instrument(skip(inner))]
async fn run_upload(inner: &Arc<StagingInner>, key: &str) -> bool {
    let mut shutdown = inner.shutdown.subscribe();
    let mut attempt = 0u32;
    let mut uploaded = false;

    loop {
        let permit = tokio::select! {
            permit = inner.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
            _ = stopped(&mut shutdown) => return false,
        };

        let generation = inner.generation(key);
        let started = Instant::now();
        let round = async {
            match push_pending(inner, key, generation).await? {
                Pushed::Uploaded => {
                    uploaded = true;
                    inner.clone().finalize(key, generation).await
                }
                Pushed::Missing => {
                    if uploaded {
                        remove_orphan(inner, key).await?;
                    }
                    Ok(inner.settle_missing(key, generation))
                }
            }
        };
        let settled = tokio::select! {
            settled = round => settled,
            _ = stopped(&mut shutdown) => return false,
        };

        match settled {
            Ok(Settled::Done) => {
                info!("Upload settled in {:?}", started.elapsed());
                return true;
            }
            Ok(Settled::Superseded) => {
                debug!(generation, "Staged blob changed during upload, going again");
                attempt = 0;
            }
            Err(err) => {
                drop(permit);
                let delay = inner.retry.delay(attempt);
                warn!(attempt, "Upload failed: {}; retrying in {:?}", err, delay);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stopped(&mut shutdown) => return false,
                }
            }
        }
    }
}

/// Stream the current pending file of `key` into the backing store.
async fn push_pending(inner: &StagingInner, key: &str, generation: u64) -> BlobResult<Pushed> {
    let path = StagedState::Pending.path(&inner.dir, key);
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Pushed::Missing),
        Err(e) => return Err(e.into()),
    };
    let size = file.metadata().await?.len();

    // Only a file recovered at startup may already be upstream
    if generation == 0 {
        match inner.backing.size(key).await {
            Ok(remote) if remote == size => {
                debug!("Recovered blob already uploaded ({} bytes)", size);
                return Ok(Pushed::Uploaded);
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    let mut writer = inner.backing.put(key).await?;
    let mut buf = vec![0u8; COPY_CHUNK_BYTES];
    let mut sent = 0u64;
    loop {
        let n = match file.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                let _ = writer.cancel().await;
                return Err(e.into());
            }
        };
        if n == 0 {
            break;
        }
        if let Err(e) = writer.write(&buf[..n]).await {
            let _ = writer.cancel().await;
            return Err(e);
        }
        sent += n as u64;
    }
    writer.close().await?;
    debug!("Uploaded {} bytes", sent);
    Ok(Pushed::Uploaded)
}

/// Undo an upload that landed after its key was deleted.
async fn remove_orphan(inner: &StagingInner, key: &str) -> BlobResult<()> {
    match inner.backing.delete(key).await {
        Ok(()) => {
            debug!("Removed upload of a blob deleted mid-flight");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
