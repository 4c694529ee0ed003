use async_trait::async_trait;

use crate::{BlobError, BlobResult};

/// Chunk size used when streaming between readers and writers.
pub(crate) const COPY_CHUNK_BYTES: usize = 256 * 1024;

/// Whole-object blob storage operations - the narrow contract every backend
/// implements and every cache layer re-exposes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Size in bytes of the blob stored under `key`
    async fn size(&self, key: &str) -> BlobResult<u64>;

    /// Open a blob for random-access reads
    async fn get(&self, key: &str) -> BlobResult<Box<dyn BlobReader>>;

    /// Start writing a blob. Nothing is visible until the writer is closed.
    async fn put(&self, key: &str) -> BlobResult<Box<dyn BlobWriter>>;

    /// Delete a blob. Deleting an absent key returns `NotFound`.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    /// List every key in the store (optional)
    async fn list(&self) -> BlobResult<Vec<String>> {
        Err(BlobError::unsupported("list"))
    }

    /// Get store capabilities
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::basic()
    }
}

/// Random-access view of a single blob.
///
/// `read_at` has no cursor, so one reader can serve many concurrent callers.
#[async_trait]
pub trait BlobReader: Send + Sync {
    /// Total size of the blob in bytes
    fn size(&self) -> u64;

    /// Read into `buf` starting at `offset`.
    ///
    /// Returns fewer than `buf.len()` bytes only when the end of the blob is
    /// reached; an offset at or past the end reads nothing.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> BlobResult<usize>;
}

/// Sequential writer for a new blob.
///
/// Dropping a writer without calling `close` discards what was written.
#[async_trait]
pub trait BlobWriter: Send {
    /// Append all of `buf`
    async fn write(&mut self, buf: &[u8]) -> BlobResult<()>;

    /// Commit the blob
    async fn close(self: Box<Self>) -> BlobResult<()>;

    /// Abort the write
    async fn cancel(self: Box<Self>) -> BlobResult<()>;
}

/// Store capabilities
#[derive(Debug, Clone, Default)]
pub struct StoreCapabilities {
    pub supports_list: bool,
}

impl StoreCapabilities {
    pub fn basic() -> Self {
        Self {
            supports_list: false,
        }
    }

    pub fn with_list(mut self) -> Self {
        self.supports_list = true;
        self
    }
}

/// Read from `reader` at `offset` until `buf` is full or the blob ends.
pub async fn read_full(reader: &dyn BlobReader, buf: &mut [u8], offset: u64) -> BlobResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read_at(&mut buf[filled..], offset + filled as u64).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read a whole blob into memory.
pub async fn read_all(reader: &dyn BlobReader) -> BlobResult<Vec<u8>> {
    let size = reader.size() as usize;
    let mut buf = vec![0u8; size];
    let n = read_full(reader, &mut buf, 0).await?;
    buf.truncate(n);
    Ok(buf)
}

/// Fetch a whole blob from `store`.
pub async fn get_bytes(store: &dyn BlobStore, key: &str) -> BlobResult<Vec<u8>> {
    let reader = store.get(key).await?;
    read_all(reader.as_ref()).await
}

/// Store `data` under `key` in one shot, cancelling the writer on failure.
pub async fn put_bytes(store: &dyn BlobStore, key: &str, data: &[u8]) -> BlobResult<()> {
    let mut writer = store.put(key).await?;
    for chunk in data.chunks(COPY_CHUNK_BYTES) {
        if let Err(e) = writer.write(chunk).await {
            let _ = writer.cancel().await;
            return Err(e);
        }
    }
    writer.close().await
}
