use std::path::PathBuf;
use std::time::Duration;

use crate::block_cache::BLOCK_SIZE;
use crate::upload::RetryPolicy;

/// Configuration for a [`BlockBlobCache`](crate::BlockBlobCache)
#[derive(Debug, Clone)]
pub struct BlockCacheConfig {
    /// Directory owned by the cache; block files live directly inside it
    pub dir: PathBuf,

    /// On-disk budget. The block index holds `cache_bytes / BLOCK_SIZE` entries.
    pub cache_bytes: u64,

    /// Upper bound on block files held open at once
    pub max_open_files: usize,
}

impl BlockCacheConfig {
    /// Create a config rooted at `dir` with defaults
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            cache_bytes: 1024 * 1024 * 1024, // 1GB
            max_open_files: 64,
        }
    }

    /// Set the on-disk byte budget
    pub fn with_cache_bytes(mut self, bytes: u64) -> Self {
        self.cache_bytes = bytes;
        self
    }

    /// Set the open file limit
    pub fn with_max_open_files(mut self, max: usize) -> Self {
        self.max_open_files = max;
        self
    }

    /// Number of blocks the index may hold (never zero)
    pub fn max_blocks(&self) -> usize {
        ((self.cache_bytes / BLOCK_SIZE) as usize).max(1)
    }

    /// Apply `<PREFIX>__CACHE_BYTES` and `<PREFIX>__MAX_OPEN_FILES` overrides.
    pub fn from_env<P: Into<PathBuf>>(dir: P, prefix: &str) -> Self {
        let mut config = Self::new(dir);
        if let Some(bytes) = env_value(prefix, "CACHE_BYTES") {
            config.cache_bytes = bytes;
        }
        if let Some(max) = env_value(prefix, "MAX_OPEN_FILES") {
            config.max_open_files = max;
        }
        config
    }
}

/// Configuration for a [`StagedBlobUploader`](crate::StagedBlobUploader)
#[derive(Debug, Clone)]
pub struct StagingConfig {
    /// Directory owned by the uploader
    pub dir: PathBuf,

    /// Background uploads allowed to run at once
    pub max_active_uploads: usize,

    /// Completed (already durable) copies retained as a read cache
    pub max_completed: usize,

    /// Upper bound on staged files held open at once
    pub max_open_files: usize,

    /// Backoff applied between failed upload attempts
    pub retry: RetryPolicy,
}

impl StagingConfig {
    /// Create a config rooted at `dir` with defaults
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        let max_active_uploads = 2;
        let max_completed = 10;
        Self {
            dir: dir.into(),
            max_active_uploads,
            max_completed,
            max_open_files: max_completed + max_active_uploads,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the upload concurrency limit
    pub fn with_max_active_uploads(mut self, max: usize) -> Self {
        self.max_active_uploads = max.max(1);
        self
    }

    /// Set how many completed copies are kept
    pub fn with_max_completed(mut self, max: usize) -> Self {
        self.max_completed = max;
        self
    }

    /// Set the open file limit
    pub fn with_max_open_files(mut self, max: usize) -> Self {
        self.max_open_files = max;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Apply `<PREFIX>__MAX_ACTIVE_UPLOADS`, `<PREFIX>__MAX_COMPLETED`,
    /// `<PREFIX>__MAX_OPEN_FILES` and `<PREFIX>__RETRY_BASE_MS` overrides.
    pub fn from_env<P: Into<PathBuf>>(dir: P, prefix: &str) -> Self {
        let mut config = Self::new(dir);
        if let Some(max) = env_value::<usize>(prefix, "MAX_ACTIVE_UPLOADS") {
            config.max_active_uploads = max.max(1);
        }
        if let Some(max) = env_value(prefix, "MAX_COMPLETED") {
            config.max_completed = max;
        }
        config.max_open_files = env_value(prefix, "MAX_OPEN_FILES")
            .unwrap_or(config.max_completed + config.max_active_uploads);
        if let Some(ms) = env_value(prefix, "RETRY_BASE_MS") {
            config.retry.base = Duration::from_millis(ms);
        }
        config
    }
}

fn env_value<T: std::str::FromStr>(prefix: &str, name: &str) -> Option<T> {
    let raw = std::env::var(format!("{}__{}", prefix, name)).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}__{}={}", prefix, name, raw);
            None
        }
    }
}
