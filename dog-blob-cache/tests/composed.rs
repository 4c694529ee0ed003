use std::sync::Arc;

use dog_blob_cache::prelude::*;
use dog_blob_cache::BLOCK_SIZE;

fn video(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 199) as u8).collect()
}

/// C1. Staging in front of a block cache in front of a directory store, across a restart
#[tokio::test]
async fn test_layers_compose_and_survive_restart() {
    let root = tempfile::tempdir().unwrap();
    let factory = StoreFactory::with_defaults();
    let remote_url = format!("file://{}", root.path().join("remote").display());
    let data = video(2 * BLOCK_SIZE + 123);

    {
        let remote = factory.open(&remote_url).await.unwrap();
        let cache = BlockBlobCache::open(remote, BlockCacheConfig::new(root.path().join("blocks")))
            .await
            .unwrap();
        let staged = StagedBlobUploader::open(Arc::new(cache), StagingConfig::new(root.path().join("staging")))
            .await
            .unwrap();

        put_bytes(&staged, "clips/intro", &data).await.unwrap();
        staged.flush().await;
        staged.shutdown().await;
    }

    let remote = factory.open(&remote_url).await.unwrap();
    assert_eq!(remote.size("clips/intro").await.unwrap(), data.len() as u64);

    // A fresh block cache reads the object back from the directory store
    let cache = BlockBlobCache::open(remote.clone(), BlockCacheConfig::new(root.path().join("blocks")))
        .await
        .unwrap();
    assert_eq!(get_bytes(&cache, "clips/intro").await.unwrap(), data);
    assert_eq!(cache.cached_blocks(), 3);

    let staged = StagedBlobUploader::open(Arc::new(cache), StagingConfig::new(root.path().join("staging")))
        .await
        .unwrap();
    assert!(staged.is_cached("clips/intro"));
    assert_eq!(staged.list().await.unwrap(), vec!["clips/intro"]);

    staged.delete("clips/intro").await.unwrap();
    assert!(remote.size("clips/intro").await.unwrap_err().is_not_found());
    assert!(staged.get("clips/intro").await.err().unwrap().is_not_found());
}
