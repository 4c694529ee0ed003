use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::keys::{decode_key, encode_key};
use crate::open_file_cache::pread;
use crate::{BlobError, BlobReader, BlobResult, BlobStore, BlobWriter, StoreCapabilities};

const TEMP_FILE_PREFIX: &str = "t-";
const BLOB_PREFIX: &str = "b-";

/// Blob store backed by a local directory, one file per blob.
///
/// Writes land in a `t-` temp file which is synced and renamed to `b-<key>`
/// on close. Leftover temp files are not swept, since another process may be
/// writing into the same directory.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    dir: PathBuf,
}

impl DirBlobStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub async fn open<P: Into<PathBuf>>(dir: P) -> BlobResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", BLOB_PREFIX, encode_key(key)))
    }
}

#[async_trait]
impl BlobStore for DirBlobStore {
    async fn size(&self, key: &str) -> BlobResult<u64> {
        let meta = tokio::fs::metadata(self.blob_path(key))
            .await
            .map_err(|e| BlobError::io_for_key(e, key))?;
        Ok(meta.len())
    }

    async fn get(&self, key: &str) -> BlobResult<Box<dyn BlobReader>> {
        let path = self.blob_path(key);
        let file = tokio::task::spawn_blocking(move || File::open(path))
            .await
            .map_err(BlobError::backend)?
            .map_err(|e| BlobError::io_for_key(e, key))?;
        let size = file.metadata()?.len();
        Ok(Box::new(DirReader {
            file: Arc::new(file),
            size,
        }))
    }

    async fn put(&self, key: &str) -> BlobResult<Box<dyn BlobWriter>> {
        let dir = self.dir.clone();
        let tmp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(TEMP_FILE_PREFIX)
                .tempfile_in(dir)
        })
        .await
        .map_err(BlobError::backend)??;
        let (file, temp_path) = tmp.into_parts();
        Ok(Box::new(DirWriter {
            file: tokio::fs::File::from_std(file),
            temp_path,
            target: self.blob_path(key),
        }))
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        tokio::fs::remove_file(self.blob_path(key))
            .await
            .map_err(|e| BlobError::io_for_key(e, key))
    }

    async fn list(&self) -> BlobResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(encoded) = name.to_str().and_then(|n| n.strip_prefix(BLOB_PREFIX)) else {
                continue;
            };
            match decode_key(encoded) {
                Some(key) => keys.push(key),
                None => debug!("Skipping undecodable blob file {:?}", name),
            }
        }
        Ok(keys)
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::basic().with_list()
    }
}

struct DirReader {
    file: Arc<File>,
    size: u64,
}

#[async_trait]
impl BlobReader for DirReader {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> BlobResult<usize> {
        let file = self.file.clone();
        let len = buf.len();
        let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut data = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                let n = pread(&file, &mut data[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            data.truncate(filled);
            Ok(data)
        })
        .await
        .map_err(BlobError::backend)??;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

struct DirWriter {
    file: tokio::fs::File,
    temp_path: TempPath,
    target: PathBuf,
}

#[async_trait]
impl BlobWriter for DirWriter {
    async fn write(&mut self, buf: &[u8]) -> BlobResult<()> {
        self.file.write_all(buf).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> BlobResult<()> {
        let Self {
            mut file,
            temp_path,
            target,
        } = *self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::task::spawn_blocking(move || temp_path.persist(target))
            .await
            .map_err(BlobError::backend)?
            .map_err(|e| BlobError::from(e.error))
    }

    async fn cancel(self: Box<Self>) -> BlobResult<()> {
        // Dropping the temp path unlinks it
        drop(self);
        Ok(())
    }
}
