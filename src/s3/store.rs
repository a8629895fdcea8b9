//! Object-store access. Production uses the configured S3 bucket; tests and
//! local runs point the same code at a `LocalFileSystem` root through
//! `JETS_LOCAL_STORE_ROOT`.

use std::sync::Arc;

use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};

use crate::config::JetsEnv;
use crate::config::model::FileKeyInfo;
use crate::error::PipeResult;

pub type StoreHandle = Arc<dyn ObjectStore>;

/// Build the store for this deployment: a local filesystem root when
/// `JETS_LOCAL_STORE_ROOT` is set (dev mode and tests), the S3 bucket
/// otherwise.
pub fn from_env(env: &JetsEnv) -> PipeResult<StoreHandle> {
    if let Ok(root) = std::env::var("JETS_LOCAL_STORE_ROOT") {
        return Ok(Arc::new(LocalFileSystem::new_with_prefix(root)?));
    }
    let store = AmazonS3Builder::from_env()
        .with_bucket_name(&env.bucket)
        .with_region(&env.region)
        .build()?;
    Ok(Arc::new(store))
}

/// Build a store for an explicitly named external bucket.
pub fn for_bucket(bucket: &str, region: &str) -> PipeResult<StoreHandle> {
    let store = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region(region)
        .build()?;
    Ok(Arc::new(store))
}

pub async fn fetch_object(store: &StoreHandle, key: &str) -> PipeResult<Vec<u8>> {
    let bytes = store.get(&ObjectPath::from(key)).await?.bytes().await?;
    Ok(bytes.to_vec())
}

pub async fn put_bytes(store: &StoreHandle, key: &str, bytes: Vec<u8>) -> PipeResult<()> {
    store
        .put(&ObjectPath::from(key), PutPayload::from(bytes))
        .await?;
    Ok(())
}

pub async fn put_local_file(
    store: &StoreHandle,
    key: &str,
    local_path: &std::path::Path,
) -> PipeResult<()> {
    let bytes = tokio::fs::read(local_path).await?;
    put_bytes(store, key, bytes).await
}

/// List the object keys under a prefix with their sizes. A missing prefix
/// is an empty listing, not an error (a partition may have received no
/// rows).
pub async fn list_file_keys(store: &StoreHandle, prefix: &str) -> PipeResult<Vec<FileKeyInfo>> {
    let prefix_path = ObjectPath::from(prefix);
    let listed: Result<Vec<FileKeyInfo>, object_store::Error> = store
        .list(Some(&prefix_path))
        .map_ok(|meta| FileKeyInfo {
            key: meta.location.to_string(),
            size: meta.size as i64,
        })
        .try_collect()
        .await;
    let mut keys = match listed {
        Ok(keys) => keys,
        Err(object_store::Error::NotFound { .. }) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    // deterministic assignment of keys to shards
    keys.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(keys)
}
