//! Block-granularity read cache.
//!
//! Remote blobs are read in fixed `BLOCK_SIZE` pieces, each persisted as its
//! own file in the cache directory. A block is fetched from the backing store
//! at most once at a time: the first reader inserts a slot into the block
//! index and downloads, everyone else waits on the slot's state channel.
//! A block file only appears under its canonical name after a complete temp
//! file is renamed over it.
//!
//! Each key has an epoch, bumped by every write or delete made through the
//! cache and recorded in block file names. A reader opened before a write
//! keeps its epoch; once that is stale it reads straight from its backing
//! reader and never touches the index or the directory.

use std::collections::HashMap;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, instrument, warn};

use crate::keys::{block_file_name, parse_block_file_name, TEMP_PREFIX};
use crate::store::read_full;
use crate::{
    BlobError, BlobReader, BlobResult, BlobStore, BlobWriter, BlockCacheConfig, OpenFileCache,
    StoreCapabilities,
};

/// Caching granularity
pub const BLOCK_SIZE: u64 = 1024 * 1024;

/// A reader may find its block evicted between download and open; it starts
/// over this many times before giving up.
const MAX_BLOCK_ATTEMPTS: usize = 8;

type SharedReader = Arc<dyn BlobReader>;
type ReaderCell = Arc<OnceCell<SharedReader>>;

/// Read-through block cache in front of a [`BlobStore`]
#[derive(Clone)]
pub struct BlockBlobCache {
    inner: Arc<BlockCacheInner>,
}

struct BlockCacheInner {
    dir: PathBuf,
    backing: Arc<dyn BlobStore>,
    files: OpenFileCache,
    index: Mutex<BlockIndex>,
    readers: Mutex<LruCache<String, ReaderCell>>,
}

struct BlockIndex {
    slots: LruCache<BlockId, Arc<BlockSlot>>,
    /// Keys never written or deleted through the cache are at epoch 0
    epochs: HashMap<String, u64>,
}

impl BlockIndex {
    fn epoch(&self, key: &str) -> u64 {
        self.epochs.get(key).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BlockId {
    key: String,
    epoch: u64,
    offset: u64,
}

struct BlockSlot {
    path: PathBuf,
    state: watch::Sender<BlockState>,
}

#[derive(Debug, Clone)]
enum BlockState {
    /// Download in flight. `evicted` asks the downloader to delete the file
    /// once it lands, since the index no longer tracks it.
    Downloading { evicted: bool },
    Ready,
    Failed(BlobError),
}

impl BlockSlot {
    fn new(path: PathBuf, state: BlockState) -> Arc<Self> {
        let (state, _) = watch::channel(state);
        Arc::new(Self { path, state })
    }
}

impl BlockBlobCache {
    /// Open a cache over `backing`, adopting any block files left in the
    /// cache directory by a previous run.
    pub async fn open(backing: Arc<dyn BlobStore>, config: BlockCacheConfig) -> BlobResult<Self> {
        tokio::fs::create_dir_all(&config.dir).await?;

        let capacity = NonZeroUsize::new(config.max_blocks()).unwrap_or(NonZeroUsize::MIN);
        let readers = NonZeroUsize::new(config.max_open_files.max(1)).unwrap_or(NonZeroUsize::MIN);
        let inner = Arc::new(BlockCacheInner {
            dir: config.dir.clone(),
            backing,
            files: OpenFileCache::new(config.max_open_files),
            index: Mutex::new(BlockIndex {
                slots: LruCache::new(capacity),
                epochs: HashMap::new(),
            }),
            readers: Mutex::new(LruCache::new(readers)),
        });

        inner.clone().populate().await?;
        Ok(Self { inner })
    }

    /// Number of blocks currently tracked by the index
    pub fn cached_blocks(&self) -> usize {
        self.inner.index.lock().slots.len()
    }

    /// Whether the current block of `key` at `offset` is tracked by the index
    pub fn contains_block(&self, key: &str, offset: u64) -> bool {
        let index = self.inner.index.lock();
        index.slots.contains(&BlockId {
            key: key.to_string(),
            epoch: index.epoch(key),
            offset: offset - offset % BLOCK_SIZE,
        })
    }

    /// The directory owned by this cache
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }
}

impl BlockCacheInner {
    /// Rebuild the block index from the cache directory.
    async fn populate(self: Arc<Self>) -> BlobResult<()> {
        let dir = self.dir.clone();
        let found = tokio::task::spawn_blocking(move || scan_block_dir(&dir))
            .await
            .map_err(BlobError::backend)??;

        let mut evicted = Vec::new();
        let adopted = found.len();
        {
            let mut index = self.index.lock();
            for (path, id) in found {
                if id.epoch > 0 {
                    index.epochs.insert(id.key.clone(), id.epoch);
                }
                let slot = BlockSlot::new(path, BlockState::Ready);
                if let Some((_, old)) = index.slots.push(id, slot) {
                    evicted.push(old);
                }
            }
        }
        for slot in evicted {
            self.discard(&slot);
        }
        info!("Block cache at {} adopted {} existing blocks", self.dir.display(), adopted);
        Ok(())
    }

    /// Shared backing reader for `key`, opened once and reused.
    async fn backing_reader(&self, key: &str) -> BlobResult<SharedReader> {
        let cell = {
            let mut readers = self.readers.lock();
            match readers.get(key) {
                Some(cell) => cell.clone(),
                None => {
                    let cell: ReaderCell = Arc::new(OnceCell::new());
                    readers.push(key.to_string(), cell.clone());
                    cell
                }
            }
        };

        let result = cell
            .get_or_try_init(|| async {
                let reader = self.backing.get(key).await?;
                Ok::<_, BlobError>(SharedReader::from(reader))
            })
            .await
            .cloned();

        if result.is_err() {
            let mut readers = self.readers.lock();
            if readers.peek(key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                readers.pop(key);
            }
        }
        result
    }

    /// Materialize the block of `key` starting at `offset` and open it.
    ///
    /// Returns `None` once `epoch` is stale; the caller then reads from its
    /// own backing reader.
    async fn open_block(
        self: &Arc<Self>,
        key: &str,
        epoch: u64,
        offset: u64,
        reader: &SharedReader,
    ) -> BlobResult<Option<crate::FileHandle>> {
        let id = BlockId {
            key: key.to_string(),
            epoch,
            offset,
        };

        for attempt in 0..MAX_BLOCK_ATTEMPTS {
            let (slot, owner, evicted) = {
                let mut index = self.index.lock();
                if index.epoch(key) != epoch {
                    return Ok(None);
                }
                match index.slots.get(&id) {
                    Some(slot) => (slot.clone(), false, None),
                    None => {
                        let path = self.dir.join(block_file_name(key, epoch, offset));
                        let slot = BlockSlot::new(path, BlockState::Downloading { evicted: false });
                        let evicted = index.slots.push(id.clone(), slot.clone()).map(|(_, old)| old);
                        (slot, true, evicted)
                    }
                }
            };
            if let Some(old) = evicted {
                self.discard(&old);
            }

            let state = if owner {
                let task = tokio::spawn(self.clone().download(id.clone(), slot.clone(), reader.clone()));
                match task.await {
                    Ok(state) => state,
                    Err(e) => {
                        let err = BlobError::backend(e);
                        self.fail(&id, &slot, err.clone());
                        BlockState::Failed(err)
                    }
                }
            } else {
                let mut rx = slot.state.subscribe();
                let state = rx
                    .wait_for(|s| !matches!(s, BlockState::Downloading { .. }))
                    .await
                    .map_err(BlobError::backend)?;
                state.clone()
            };

            match state {
                BlockState::Ready => match self.open_file(&slot.path).await? {
                    Ok(handle) => return Ok(Some(handle)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!(key, offset, attempt, "Block evicted before it could be opened, retrying");
                        // Drop the stale slot so the next attempt downloads afresh
                        let mut index = self.index.lock();
                        if index.slots.peek(&id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                            index.slots.pop(&id);
                        }
                    }
                    Err(e) => return Err(e.into()),
                },
                BlockState::Failed(err) => return Err(err),
                BlockState::Downloading { .. } => unreachable!("waited for download to finish"),
            }
        }

        Err(BlobError::Io {
            source: Arc::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("block {} of {} was evicted on every attempt", offset, key),
            )),
        })
    }

    /// Open a block file off the async workers; the outer error is the task's.
    async fn open_file(&self, path: &Path) -> BlobResult<std::io::Result<crate::FileHandle>> {
        let files = self.files.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || files.open(path))
            .await
            .map_err(BlobError::backend)
    }

    /// Fetch one block from the backing reader and commit it to disk.
    #[instrument(skip(self, slot, reader), fields(key = %id.key, epoch = id.epoch, offset = id.offset))]
    async fn download(self: Arc<Self>, id: BlockId, slot: Arc<BlockSlot>, reader: SharedReader) -> BlockState {
        match self.fetch_block(&id, &slot.path, reader.as_ref()).await {
            Ok(()) => {
                let mut evicted = false;
                slot.state.send_modify(|state| {
                    if let BlockState::Downloading { evicted: e } = state {
                        evicted = *e;
                    }
                    *state = BlockState::Ready;
                });
                if evicted {
                    debug!("Block was evicted while downloading, removing it");
                    self.remove_block_file(&slot.path);
                }
                BlockState::Ready
            }
            Err(err) => {
                warn!("Block download failed: {}", err);
                self.fail(&id, &slot, err.clone());
                BlockState::Failed(err)
            }
        }
    }

    async fn fetch_block(&self, id: &BlockId, path: &Path, reader: &dyn BlobReader) -> BlobResult<()> {
        let size = reader.size();
        if id.offset >= size {
            return Err(BlobError::invalid(format!(
                "block offset {} is past the end of {} ({} bytes)",
                id.offset, id.key, size
            )));
        }
        let expected = BLOCK_SIZE.min(size - id.offset);
        let mut buf = vec![0u8; expected as usize];
        let n = read_full(reader, &mut buf, id.offset).await?;
        if (n as u64) < expected {
            return Err(BlobError::truncated(&id.key, id.offset, expected, n as u64));
        }

        let dir = self.dir.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(&dir)?;
            tmp.write_all(&buf)?;
            tmp.as_file().sync_data()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(BlobError::backend)??;

        debug!("Cached {} bytes", expected);
        Ok(())
    }

    /// Publish a failed download and unlink its slot so the next reader retries.
    fn fail(&self, id: &BlockId, slot: &Arc<BlockSlot>, err: BlobError) {
        {
            let mut index = self.index.lock();
            if index.slots.peek(id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
                index.slots.pop(id);
            }
        }
        slot.state.send_replace(BlockState::Failed(err));
    }

    /// Dispose of a slot that left the index.
    fn discard(&self, slot: &Arc<BlockSlot>) {
        let mut in_flight = false;
        slot.state.send_if_modified(|state| {
            if let BlockState::Downloading { evicted } = state {
                *evicted = true;
                in_flight = true;
            }
            false
        });
        if !in_flight {
            self.remove_block_file(&slot.path);
        }
    }

    fn remove_block_file(&self, path: &Path) {
        debug!("Evicting block file {}", path.display());
        self.files.remove(path);
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Unable to remove block file {}: {}", path.display(), e);
            }
        }
    }

    /// Start a new epoch for `key`, dropping its cached reader and blocks.
    async fn purge(&self, key: &str) {
        // The reader goes first so a new epoch never pairs with an old reader
        self.readers.lock().pop(key);

        let (epoch, slots) = {
            let mut index = self.index.lock();
            let epoch = index.epochs.entry(key.to_string()).or_insert(0);
            *epoch += 1;
            let epoch = *epoch;
            let ids: Vec<BlockId> = index
                .slots
                .iter()
                .filter(|(id, _)| id.key == key)
                .map(|(id, _)| id.clone())
                .collect();
            let slots: Vec<Arc<BlockSlot>> = ids.iter().filter_map(|id| index.slots.pop(id)).collect();
            (epoch, slots)
        };
        for slot in &slots {
            self.discard(slot);
        }

        // Sweep files the index lost track of
        let dir = self.dir.clone();
        let key = key.to_string();
        let files = self.files.clone();
        let swept = tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
            let mut swept = 0;
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if parse_block_file_name(name).is_some_and(|(k, e, _)| k == key && e < epoch) {
                    files.remove(entry.path());
                    if std::fs::remove_file(entry.path()).is_ok() {
                        swept += 1;
                    }
                }
            }
            Ok(swept)
        })
        .await;
        match swept {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => debug!("Swept {} untracked block files", n),
            Ok(Err(e)) => warn!("Unable to sweep block cache directory: {}", e),
            Err(e) => warn!("Block sweep task failed: {}", e),
        }
    }
}

/// List adoptable block files, oldest first, deleting stale temp files and
/// blocks older than the newest epoch of their key.
fn scan_block_dir(dir: &Path) -> std::io::Result<Vec<(PathBuf, BlockId)>> {
    let mut found = Vec::new();
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
            debug!("Deleting stale temp file {}", path.display());
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Unable to remove temp file {}: {}", path.display(), e);
            }
            continue;
        }
        match parse_block_file_name(name) {
            Some((key, epoch, offset)) if offset % BLOCK_SIZE == 0 => {
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                found.push((mtime, path, BlockId { key, epoch, offset }));
            }
            _ => debug!("Ignoring foreign file {}", path.display()),
        }
    }

    let mut newest: HashMap<String, u64> = HashMap::new();
    for (_, _, id) in &found {
        let epoch = newest.entry(id.key.clone()).or_insert(id.epoch);
        *epoch = (*epoch).max(id.epoch);
    }
    found.retain(|(_, path, id)| {
        if newest.get(&id.key).is_some_and(|e| *e > id.epoch) {
            debug!("Deleting superseded block file {}", path.display());
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Unable to remove block file {}: {}", path.display(), e);
            }
            return false;
        }
        true
    });

    found.sort_by_key(|(mtime, ..)| *mtime);
    Ok(found.into_iter().map(|(_, path, id)| (path, id)).collect())
}

#[async_trait]
impl BlobStore for BlockBlobCache {
    async fn size(&self, key: &str) -> BlobResult<u64> {
        let cached = {
            let mut readers = self.inner.readers.lock();
            readers.get(key).and_then(|cell| cell.get().map(|r| r.size()))
        };
        match cached {
            Some(size) => Ok(size),
            None => self.inner.backing.size(key).await,
        }
    }

    async fn get(&self, key: &str) -> BlobResult<Box<dyn BlobReader>> {
        // Epoch before reader: a concurrent write can only leave this one stale
        let epoch = self.inner.index.lock().epoch(key);
        let backing = self.inner.backing_reader(key).await?;
        Ok(Box::new(BlockReader {
            cache: self.inner.clone(),
            key: key.to_string(),
            epoch,
            backing,
        }))
    }

    async fn put(&self, key: &str) -> BlobResult<Box<dyn BlobWriter>> {
        let writer = self.inner.backing.put(key).await?;
        Ok(Box::new(InvalidatingWriter {
            cache: self.inner.clone(),
            key: key.to_string(),
            writer,
        }))
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.inner.purge(key).await;
        self.inner.backing.delete(key).await
    }

    async fn list(&self) -> BlobResult<Vec<String>> {
        self.inner.backing.list().await
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.inner.backing.capabilities()
    }
}

/// Reader answering range reads from cached blocks
struct BlockReader {
    cache: Arc<BlockCacheInner>,
    key: String,
    epoch: u64,
    backing: SharedReader,
}

#[async_trait]
impl BlobReader for BlockReader {
    fn size(&self) -> u64 {
        self.backing.size()
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> BlobResult<usize> {
        let size = self.backing.size();
        let mut done = 0usize;
        let mut offset = offset;

        while done < buf.len() && offset < size {
            let block = offset - offset % BLOCK_SIZE;
            let within = offset - block;
            let block_len = BLOCK_SIZE.min(size - block);
            let want = ((block_len - within) as usize).min(buf.len() - done);

            let piece = &mut buf[done..done + want];
            let n = match self.cache.open_block(&self.key, self.epoch, block, &self.backing).await? {
                Some(handle) => {
                    let n = handle.read_at(piece, within)?;
                    handle.close();
                    n
                }
                None => read_full(self.backing.as_ref(), piece, offset).await?,
            };
            if n < want {
                return Err(BlobError::truncated(&self.key, offset, want as u64, n as u64));
            }

            done += n;
            offset += n as u64;
        }
        Ok(done)
    }
}

/// Backing writer that drops stale cached blocks once the new blob is committed
struct InvalidatingWriter {
    cache: Arc<BlockCacheInner>,
    key: String,
    writer: Box<dyn BlobWriter>,
}

#[async_trait]
impl BlobWriter for InvalidatingWriter {
    async fn write(&mut self, buf: &[u8]) -> BlobResult<()> {
        self.writer.write(buf).await
    }

    async fn close(self: Box<Self>) -> BlobResult<()> {
        let Self { cache, key, writer } = *self;
        writer.close().await?;
        cache.purge(&key).await;
        Ok(())
    }

    async fn cancel(self: Box<Self>) -> BlobResult<()> {
        self.writer.cancel().await
    }
}
