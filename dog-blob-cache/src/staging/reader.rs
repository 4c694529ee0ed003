use async_trait::async_trait;

use crate::{BlobReader, BlobResult, FileHandle};

/// Reads a staged copy through a shared handle from the open-file cache.
///
/// The handle pins the file it was opened on, so a concurrent overwrite or
/// eviction never changes what an existing reader sees.
pub(super) struct StagedReader {
    handle: FileHandle,
    size: u64,
}

impl StagedReader {
    pub(super) fn new(handle: FileHandle) -> BlobResult<Self> {
        let size = handle.len()?;
        Ok(Self { handle, size })
    }
}

#[async_trait]
impl BlobReader for StagedReader {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> BlobResult<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let want = buf.len().min((self.size - offset) as usize);
        Ok(self.handle.read_at(&mut buf[..want], offset)?)
    }
}
