use bytes::Bytes;
use cache::CacheLayer;
use data_model::{FileId, Share, VaultError, VaultFile, VaultId};
use serde::{de::DeserializeOwned, Serialize};
use state_store::scanner::{FileListPage, FileListQuery, VaultReader};
use tracing::warn;

pub const LISTING_CACHE_PREFIX: &str = "files";
pub const FILE_CACHE_PREFIX: &str = "file";
pub const SHARE_CACHE_PREFIX: &str = "share";

/// Read-through cached listing. Query shapes the cache cannot represent
/// (search, trash view, cursors, range filters) go straight to the store.
pub async fn list_files(
    reader: &VaultReader,
    cache: &CacheLayer,
    query: &FileListQuery,
) -> Result<FileListPage, VaultError> {
    if !query.is_cacheable() {
        return reader.list_files(query);
    }
    let cache_key = query.cache_key(LISTING_CACHE_PREFIX);
    if let Some(cached) = cache.get(&cache_key).await {
        match serde_json::from_slice::<FileListPage>(&cached) {
            Ok(page) => return Ok(page),
            Err(e) => warn!("discarding undecodable cached listing: {:?}", e),
        }
    }
    let page = reader.list_files(query)?;
    match serde_json::to_vec(&page) {
        Ok(encoded) => cache.set(&cache_key, Bytes::from(encoded)).await,
        Err(e) => warn!("failed to encode listing for cache: {:?}", e),
    }
    Ok(page)
}

/// Drops every cached listing for the vault. Called after any file or
/// folder mutation.
pub async fn invalidate_vault_listings(cache: &CacheLayer, vault_id: &VaultId) {
    cache
        .delete_prefix(&format!("{}:{}:", LISTING_CACHE_PREFIX, vault_id))
        .await;
}

fn file_cache_key(vault_id: &VaultId, file_id: &FileId) -> String {
    format!("{}:{}:{}", FILE_CACHE_PREFIX, vault_id, file_id)
}

fn share_cache_key(short_code: &str) -> String {
    format!("{}:{}", SHARE_CACHE_PREFIX, short_code)
}

async fn cached<T: Serialize + DeserializeOwned>(
    cache: &CacheLayer,
    key: &str,
    load: impl FnOnce() -> Result<Option<T>, VaultError>,
) -> Result<Option<T>, VaultError> {
    if let Some(bytes) = cache.get(key).await {
        match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => return Ok(Some(value)),
            Err(e) => warn!(key, "discarding undecodable cached entity: {:?}", e),
        }
    }
    let value = load()?;
    if let Some(value) = &value {
        match serde_json::to_vec(value) {
            Ok(encoded) => cache.set(key, Bytes::from(encoded)).await,
            Err(e) => warn!(key, "failed to encode entity for cache: {:?}", e),
        }
    }
    Ok(value)
}

/// Read-through single-file lookup. Misses on purged files are not
/// cached; trash state rides along with the record.
pub async fn get_file(
    reader: &VaultReader,
    cache: &CacheLayer,
    vault_id: &VaultId,
    file_id: &FileId,
) -> Result<Option<VaultFile>, VaultError> {
    cached(cache, &file_cache_key(vault_id, file_id), || {
        reader.get_file(vault_id, file_id)
    })
    .await
}

/// Read-through share lookup by short code, for the public share paths.
pub async fn get_share(
    reader: &VaultReader,
    cache: &CacheLayer,
    short_code: &str,
) -> Result<Option<Share>, VaultError> {
    cached(cache, &share_cache_key(short_code), || {
        reader.get_share_by_code(short_code)
    })
    .await
}

pub async fn invalidate_file(cache: &CacheLayer, vault_id: &VaultId, file_id: &FileId) {
    cache.delete(&file_cache_key(vault_id, file_id)).await;
}

/// A share mutation invalidates only that share's own key; nothing else
/// depends on its counters.
pub async fn invalidate_share(cache: &CacheLayer, short_code: &str) {
    cache.delete(&share_cache_key(short_code)).await;
}
