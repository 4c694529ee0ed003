//! # dog-blob-cache: local caching and write-back for DogRS blob stores
//!
//! `dog-blob-cache` turns a remote, whole-object blob store (size/get/put/delete,
//! optionally list) into something fast to read from and safe to write to:
//!
//! - **Block read cache**: [`BlockBlobCache`] fetches 1 MiB blocks on demand,
//!   keeps them on local disk under an LRU byte budget, and never downloads
//!   the same block twice at once.
//! - **Write-back staging**: [`StagedBlobUploader`] commits writes to local
//!   disk and uploads them in the background with bounded concurrency,
//!   retrying forever and resuming after a crash.
//! - **Shared file handles**: [`OpenFileCache`] bounds open descriptors while
//!   many readers share one handle; an evicted file closes only once its
//!   last reader lets go.
//!
//! Every layer implements [`BlobStore`] itself, so they compose by wrapping.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use dog_blob_cache::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> BlobResult<()> {
//! # let tmp = tempfile::tempdir()?;
//! # let (blocks_dir, staging_dir) = (tmp.path().join("blocks"), tmp.path().join("staging"));
//! // 1. Pick a backing store
//! let remote: Arc<dyn BlobStore> = StoreFactory::with_defaults().open("mem://").await?;
//!
//! // 2. Read through a block cache, write through a staging area
//! let cache = BlockBlobCache::open(remote.clone(), BlockCacheConfig::new(blocks_dir)).await?;
//! let staged = StagedBlobUploader::open(Arc::new(cache), StagingConfig::new(staging_dir)).await?;
//!
//! // 3. Writes return as soon as they are on local disk
//! put_bytes(&staged, "videos/intro.mp4", b"not really a video").await?;
//! assert_eq!(get_bytes(&staged, "videos/intro.mp4").await?, b"not really a video");
//!
//! // 4. Wait for the background upload before exiting
//! staged.flush().await;
//! assert_eq!(remote.size("videos/intro.mp4").await?, 18);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  StagedBlobUploader  │  ← write-back, local read copies
//! ├──────────────────────┤
//! │    BlockBlobCache    │  ← on-demand block reads
//! ├──────────────────────┤
//! │  BlobStore (remote)  │  ← whole-object primitives
//! └──────────────────────┘
//!          both use OpenFileCache for local reads
//! ```
//!
//! Each layer exclusively owns its directory; two instances must never share one.

pub mod backend;
mod block_cache;
mod config;
mod error;
mod factory;
pub mod keys;
mod open_file_cache;
mod staging;
pub mod store;
mod upload;

// Re-export main types for clean API
pub use backend::{DirBlobStore, MemoryBlobStore, PrefixBlobStore, StoreStats};
pub use block_cache::{BlockBlobCache, BLOCK_SIZE};
pub use config::{BlockCacheConfig, StagingConfig};
pub use error::{BlobError, BlobResult};
pub use factory::StoreFactory;
pub use open_file_cache::{FileHandle, OpenFileCache};
pub use staging::StagedBlobUploader;
pub use store::{get_bytes, put_bytes, read_all, read_full, BlobReader, BlobStore, BlobWriter, StoreCapabilities};
pub use upload::RetryPolicy;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        get_bytes, put_bytes, read_all, BlobError, BlobReader, BlobResult, BlobStore, BlobWriter,
        BlockBlobCache, BlockCacheConfig, StagedBlobUploader, StagingConfig, StoreFactory,
    };
}
