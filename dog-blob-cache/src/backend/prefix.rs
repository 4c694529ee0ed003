use std::sync::Arc;

use async_trait::async_trait;

use crate::{BlobReader, BlobResult, BlobStore, BlobWriter, StoreCapabilities};

/// Qualifies every key with a fixed prefix before handing it to the inner store.
///
/// Lets several logical stores share one bucket or directory.
#[derive(Clone)]
pub struct PrefixBlobStore {
    inner: Arc<dyn BlobStore>,
    prefix: String,
}

impl PrefixBlobStore {
    pub fn new<S: Into<String>>(inner: Arc<dyn BlobStore>, prefix: S) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn qualify(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl BlobStore for PrefixBlobStore {
    async fn size(&self, key: &str) -> BlobResult<u64> {
        self.inner.size(&self.qualify(key)).await
    }

    async fn get(&self, key: &str) -> BlobResult<Box<dyn BlobReader>> {
        self.inner.get(&self.qualify(key)).await
    }

    async fn put(&self, key: &str) -> BlobResult<Box<dyn BlobWriter>> {
        self.inner.put(&self.qualify(key)).await
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.inner.delete(&self.qualify(key)).await
    }

    async fn list(&self) -> BlobResult<Vec<String>> {
        let keys = self.inner.list().await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(self.prefix.as_str()).map(str::to_string))
            .collect())
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.inner.capabilities()
    }
}
