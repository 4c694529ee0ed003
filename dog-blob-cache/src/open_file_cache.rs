//! Bounded pool of shared, read-only local file handles.
//!
//! Every open path has one entry in an arena holding the file and an explicit
//! reference count. Evicting an entry (LRU overflow or [`OpenFileCache::remove`])
//! only marks it for close; the descriptor is dropped once the last
//! [`FileHandle`] referencing it is released, so a reader never sees its file
//! closed underneath it.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

type EntryId = u64;

/// LRU-bounded cache of open files, cheap to clone and share
#[derive(Clone)]
pub struct OpenFileCache {
    index: Arc<Mutex<HandleIndex>>,
}

struct HandleIndex {
    lru: LruCache<PathBuf, EntryId>,
    entries: HashMap<EntryId, HandleEntry>,
    next_id: EntryId,
}

struct HandleEntry {
    path: PathBuf,
    file: Arc<File>,
    refs: usize,
    evicted: bool,
}

impl HandleIndex {
    /// Take a reference on the live entry for `path`, if there is one.
    fn acquire(&mut self, path: &Path) -> Option<(EntryId, Arc<File>)> {
        let id = *self.lru.get(path)?;
        let entry = self.entries.get_mut(&id)?;
        entry.refs += 1;
        Some((id, entry.file.clone()))
    }

    /// Mark an entry evicted, dropping it right away if nobody holds it.
    fn retire(&mut self, id: EntryId, closing: &mut Vec<Arc<File>>) {
        let idle = match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.evicted = true;
                entry.refs == 0
            }
            None => false,
        };
        if idle {
            if let Some(entry) = self.entries.remove(&id) {
                debug!("Closing evicted file {}", entry.path.display());
                closing.push(entry.file);
            }
        } else {
            trace!("Deferring close of evicted entry {} until released", id);
        }
    }

    fn release(&mut self, id: EntryId) -> Option<Arc<File>> {
        let entry = match self.entries.get_mut(&id) {
            Some(entry) => entry,
            None => panic!("released file handle {} that is not in the cache", id),
        };
        entry.refs = match entry.refs.checked_sub(1) {
            Some(refs) => refs,
            None => panic!("file handle refcount underflow for {}", entry.path.display()),
        };
        if entry.refs == 0 && entry.evicted {
            let entry = self.entries.remove(&id)?;
            debug!("Closing released file {}", entry.path.display());
            return Some(entry.file);
        }
        None
    }
}

impl OpenFileCache {
    /// Create a cache holding at most `max_entries` indexed files
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            index: Arc::new(Mutex::new(HandleIndex {
                lru: LruCache::new(capacity),
                entries: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Open `path` read-only, sharing an already open descriptor when possible.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> io::Result<FileHandle> {
        let path = path.as_ref();
        if let Some((id, file)) = self.index.lock().acquire(path) {
            return Ok(self.handle(id, file));
        }

        // Open outside the lock; a racing opener may win the insert below.
        let file = Arc::new(File::open(path)?);

        let mut closing = Vec::new();
        let handle = {
            let mut index = self.index.lock();
            match index.acquire(path) {
                Some((id, existing)) => {
                    closing.push(file);
                    self.handle(id, existing)
                }
                None => {
                    let id = index.next_id;
                    index.next_id += 1;
                    index.entries.insert(
                        id,
                        HandleEntry {
                            path: path.to_path_buf(),
                            file: file.clone(),
                            refs: 1,
                            evicted: false,
                        },
                    );
                    if let Some((evicted_path, evicted_id)) = index.lru.push(path.to_path_buf(), id) {
                        trace!("Evicting {} from open file cache", evicted_path.display());
                        index.retire(evicted_id, &mut closing);
                    }
                    self.handle(id, file)
                }
            }
        };
        drop(closing);
        Ok(handle)
    }

    /// Forget `path`, e.g. because the file was deleted or replaced.
    ///
    /// Handles already returned for it stay readable until released.
    pub fn remove<P: AsRef<Path>>(&self, path: P) {
        let mut closing = Vec::new();
        {
            let mut index = self.index.lock();
            if let Some(id) = index.lru.pop(path.as_ref()) {
                index.retire(id, &mut closing);
            }
        }
        drop(closing);
    }

    /// Number of indexed (not evicted) paths
    pub fn len(&self) -> usize {
        self.index.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptors currently held open, including evicted entries still referenced
    pub fn open_handles(&self) -> usize {
        self.index.lock().entries.len()
    }

    fn handle(&self, id: EntryId, file: Arc<File>) -> FileHandle {
        FileHandle {
            index: self.index.clone(),
            id,
            file,
            released: false,
        }
    }
}

/// A counted reference to a cached open file.
///
/// Dropping the handle (or calling [`FileHandle::close`]) releases the
/// reference; it never closes the shared descriptor directly.
pub struct FileHandle {
    index: Arc<Mutex<HandleIndex>>,
    id: EntryId,
    file: Arc<File>,
    released: bool,
}

impl FileHandle {
    /// Positional read; fills `buf` unless end of file is reached first.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match pread(&self.file, &mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Current length of the underlying file
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Release this reference
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let closing = self.index.lock().release(self.id);
        drop(closing);
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle").field("id", &self.id).finish()
    }
}

#[cfg(unix)]
pub(crate) fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}
