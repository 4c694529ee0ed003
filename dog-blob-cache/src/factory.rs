use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::{BlobError, BlobResult, BlobStore, DirBlobStore, MemoryBlobStore};

type StoreConstructor = Arc<dyn Fn(String) -> BoxFuture<'static, BlobResult<Arc<dyn BlobStore>>> + Send + Sync>;

/// Resolves store URLs such as `mem://` or `file:///var/blobs` to stores.
///
/// An explicit object built at startup and passed to whoever needs to open
/// stores; there is no process-wide registration.
pub struct StoreFactory {
    schemes: HashMap<String, StoreConstructor>,
}

impl StoreFactory {
    /// A factory that knows no schemes
    pub fn new() -> Self {
        Self {
            schemes: HashMap::new(),
        }
    }

    /// A factory with the built-in `mem` and `file` schemes registered.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register("mem", |_location| async { Ok(Arc::new(MemoryBlobStore::new()) as Arc<dyn BlobStore>) });
        factory.register("file", |location| async move {
            if location.is_empty() {
                return Err(BlobError::invalid("file:// store needs a directory"));
            }
            let store = DirBlobStore::open(location).await?;
            Ok(Arc::new(store) as Arc<dyn BlobStore>)
        });
        factory
    }

    /// Register `constructor` for `scheme`, replacing any earlier one.
    ///
    /// The constructor receives everything after `scheme://`.
    pub fn register<S, F, Fut>(&mut self, scheme: S, constructor: F)
    where
        S: Into<String>,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = BlobResult<Arc<dyn BlobStore>>> + Send + 'static,
    {
        let constructor: StoreConstructor = Arc::new(move |location| constructor(location).boxed());
        self.schemes.insert(scheme.into(), constructor);
    }

    /// Whether `scheme` has a constructor
    pub fn supports(&self, scheme: &str) -> bool {
        self.schemes.contains_key(scheme)
    }

    /// Open the store named by `url` (`<scheme>://<location>`).
    pub async fn open(&self, url: &str) -> BlobResult<Arc<dyn BlobStore>> {
        let (scheme, location) = url
            .split_once("://")
            .ok_or_else(|| BlobError::invalid(format!("store URL {} has no scheme", url)))?;
        let constructor = self
            .schemes
            .get(scheme)
            .ok_or_else(|| BlobError::invalid(format!("no store registered for scheme {}", scheme)))?
            .clone();
        debug!("Opening {} store at {:?}", scheme, location);
        constructor(location.to_string()).await
    }
}

impl Default for StoreFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}
