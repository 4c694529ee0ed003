use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::StagingInner;
use crate::keys::TEMP_PREFIX;
use crate::upload::spawn_upload;
use crate::{BlobError, BlobResult, BlobWriter};

/// Writer into a temp file of the staging directory.
///
/// Dropping it without `close` unlinks the temp file.
pub(super) struct StagedWriter {
    inner: Arc<StagingInner>,
    key: String,
    file: tokio::fs::File,
    temp: TempPath,
}

impl StagedWriter {
    pub(super) async fn create(inner: Arc<StagingInner>, key: &str) -> BlobResult<Self> {
        let dir = inner.dir.clone();
        let tmp = tokio::task::spawn_blocking(move || tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir))
            .await
            .map_err(BlobError::backend)??;
        let (file, temp) = tmp.into_parts();
        Ok(Self {
            inner,
            key: key.to_string(),
            file: tokio::fs::File::from_std(file),
            temp,
        })
    }
}

#[async_trait]
impl BlobWriter for StagedWriter {
    async fn write(&mut self, buf: &[u8]) -> BlobResult<()> {
        self.file.write_all(buf).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> BlobResult<()> {
        let Self {
            inner,
            key,
            mut file,
            temp,
        } = *self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let committer = inner.clone();
        let committed = key.clone();
        let start = tokio::task::spawn_blocking(move || committer.commit(&committed, temp))
            .await
            .map_err(BlobError::backend)??;
        debug!(key = %key, "Staged blob committed locally");
        if start {
            spawn_upload(inner, key);
        }
        Ok(())
    }

    async fn cancel(self: Box<Self>) -> BlobResult<()> {
        // Dropping the temp path unlinks it
        drop(self);
        Ok(())
    }
}
