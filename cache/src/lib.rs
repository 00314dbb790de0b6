//! Two-tier cache in front of listing queries: a moka in-process tier for
//! latency, and an optional shared tier so that every instance observes the
//! same invalidation. The shared tier is best-effort; any failure or
//! timeout degrades to a miss and is counted, never surfaced.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use metrics::cache_stats;
use moka::sync::Cache as MokaCache;
use tracing::warn;
use vault_utils::get_epoch_time_in_ms;

const ENCODING_RAW: u8 = 0;
const ENCODING_LZ4: u8 = 1;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Fixed namespace prepended to every key to avoid collisions with
    /// unrelated cached data.
    pub key_prefix: String,
    pub ttl: Duration,
    /// Values larger than this are LZ4-compressed before storage.
    pub compression_threshold_bytes: usize,
    pub local_max_entries: u64,
    /// Budget for one shared-tier operation before treating it as a miss.
    pub shared_op_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "vault".to_string(),
            ttl: Duration::from_secs(30),
            compression_threshold_bytes: 8 * 1024,
            local_max_entries: 10_000,
            shared_op_timeout: Duration::from_millis(250),
        }
    }
}

/// Distributed tier reachable by all instances. Implementations wrap an
/// external KV service; the in-memory one backs tests and single-node runs.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Deletes every key starting with `prefix`, returning the count.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

#[derive(Default)]
pub struct InMemorySharedCache {
    entries: Mutex<HashMap<String, (u64, Bytes)>>,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((expires_at, value)) if *expires_at > get_epoch_time_in_ms() => {
                Ok(Some(value.clone()))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let expires_at = get_epoch_time_in_ms() + ttl.as_millis() as u64;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (expires_at, value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }
}

pub struct CacheLayer {
    local: MokaCache<String, Bytes>,
    shared: Option<Arc<dyn SharedCache>>,
    config: CacheConfig,
    metrics: cache_stats::Metrics,
}

impl CacheLayer {
    pub fn new(config: CacheConfig, shared: Option<Arc<dyn SharedCache>>) -> Self {
        let local = MokaCache::builder()
            .max_capacity(config.local_max_entries)
            .time_to_live(config.ttl)
            .support_invalidation_closures()
            .build();
        Self {
            local,
            shared,
            config,
            metrics: cache_stats::Metrics::new(),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let key = self.namespaced(key);
        if let Some(value) = self.local.get(&key) {
            self.metrics.hits.add(1, &[]);
            return decode(&value)
                .inspect_err(|e| warn!("discarding undecodable cache entry {}: {:?}", key, e))
                .ok();
        }
        if let Some(shared) = &self.shared {
            match tokio::time::timeout(self.config.shared_op_timeout, shared.get(&key)).await {
                Ok(Ok(Some(value))) => {
                    self.local.insert(key.clone(), value.clone());
                    self.metrics.hits.add(1, &[]);
                    return decode(&value)
                        .inspect_err(|e| {
                            warn!("discarding undecodable cache entry {}: {:?}", key, e)
                        })
                        .ok();
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    self.metrics.errors.add(1, &[]);
                    warn!("shared cache get failed for {}: {:?}", key, e);
                }
                Err(_) => {
                    self.metrics.errors.add(1, &[]);
                    warn!("shared cache get timed out for {}", key);
                }
            }
        }
        self.metrics.misses.add(1, &[]);
        None
    }

    pub async fn set(&self, key: &str, value: Bytes) {
        let key = self.namespaced(key);
        let encoded = encode(&value, self.config.compression_threshold_bytes);
        self.local.insert(key.clone(), encoded.clone());
        if let Some(shared) = &self.shared {
            let result = tokio::time::timeout(
                self.config.shared_op_timeout,
                shared.set(&key, encoded, self.config.ttl),
            )
            .await;
            if !matches!(result, Ok(Ok(()))) {
                self.metrics.errors.add(1, &[]);
                warn!("shared cache set failed for {}, skipping", key);
            }
        }
    }

    pub async fn delete(&self, key: &str) {
        let key = self.namespaced(key);
        self.local.invalidate(&key);
        if let Some(shared) = &self.shared {
            let result =
                tokio::time::timeout(self.config.shared_op_timeout, shared.delete(&key)).await;
            if !matches!(result, Ok(Ok(()))) {
                self.metrics.errors.add(1, &[]);
                warn!("shared cache delete failed for {}, skipping invalidation", key);
            }
        }
    }

    /// Invalidates every key starting with `prefix` in both tiers.
    /// Returns the shared-tier count, which is what multi-instance
    /// coherency depends on.
    pub async fn delete_prefix(&self, prefix: &str) -> usize {
        let prefix = self.namespaced(prefix);
        let local_prefix = prefix.clone();
        if let Err(e) = self
            .local
            .invalidate_entries_if(move |k, _| k.starts_with(&local_prefix))
        {
            warn!("local cache pattern invalidation failed: {:?}", e);
        }
        if let Some(shared) = &self.shared {
            match tokio::time::timeout(self.config.shared_op_timeout, shared.delete_prefix(&prefix))
                .await
            {
                Ok(Ok(count)) => return count,
                _ => {
                    self.metrics.errors.add(1, &[]);
                    warn!("shared cache pattern invalidation failed for {}", prefix);
                }
            }
        }
        0
    }
}

fn encode(value: &Bytes, compression_threshold: usize) -> Bytes {
    let mut out;
    if value.len() > compression_threshold {
        let compressed = lz4_flex::compress_prepend_size(value);
        out = Vec::with_capacity(compressed.len() + 1);
        out.push(ENCODING_LZ4);
        out.extend_from_slice(&compressed);
    } else {
        out = Vec::with_capacity(value.len() + 1);
        out.push(ENCODING_RAW);
        out.extend_from_slice(value);
    }
    Bytes::from(out)
}

fn decode(value: &Bytes) -> Result<Bytes> {
    match value.split_first() {
        Some((&ENCODING_RAW, rest)) => Ok(Bytes::copy_from_slice(rest)),
        Some((&ENCODING_LZ4, rest)) => Ok(Bytes::from(lz4_flex::decompress_size_prepended(rest)?)),
        _ => Err(anyhow::anyhow!("empty or unknown cache encoding")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_layer(shared: Option<Arc<dyn SharedCache>>) -> CacheLayer {
        CacheLayer::new(
            CacheConfig {
                compression_threshold_bytes: 64,
                ..Default::default()
            },
            shared,
        )
    }

    #[tokio::test]
    async fn test_get_after_set_is_byte_identical() {
        let layer = test_layer(Some(Arc::new(InMemorySharedCache::new())));
        let value = Bytes::from(vec![7u8; 1024]);
        layer.set("files:v1:list", value.clone()).await;
        assert_eq!(layer.get("files:v1:list").await, Some(value));
    }

    #[tokio::test]
    async fn test_small_values_stay_uncompressed() {
        let small = Bytes::from_static(b"tiny");
        let encoded = encode(&small, 64);
        assert_eq!(encoded[0], ENCODING_RAW);
        assert_eq!(decode(&encoded).unwrap(), small);

        let big = Bytes::from(vec![0u8; 1024]);
        let encoded = encode(&big, 64);
        assert_eq!(encoded[0], ENCODING_LZ4);
        assert!(encoded.len() < big.len());
        assert_eq!(decode(&encoded).unwrap(), big);
    }

    #[tokio::test]
    async fn test_delete_prefix_hits_both_tiers() {
        let shared = Arc::new(InMemorySharedCache::new());
        let layer = test_layer(Some(shared.clone()));
        layer.set("files:v1:a", Bytes::from_static(b"1")).await;
        layer.set("files:v1:b", Bytes::from_static(b"2")).await;
        layer.set("files:v2:a", Bytes::from_static(b"3")).await;

        let count = layer.delete_prefix("files:v1:").await;
        assert_eq!(count, 2);
        assert_eq!(layer.get("files:v1:a").await, None);
        assert_eq!(layer.get("files:v1:b").await, None);
        assert_eq!(layer.get("files:v2:a").await, Some(Bytes::from_static(b"3")));
    }

    #[tokio::test]
    async fn test_shared_tier_failure_degrades_to_miss() {
        struct FailingShared;

        #[async_trait]
        impl SharedCache for FailingShared {
            async fn get(&self, _: &str) -> Result<Option<Bytes>> {
                Err(anyhow::anyhow!("backend down"))
            }
            async fn set(&self, _: &str, _: Bytes, _: Duration) -> Result<()> {
                Err(anyhow::anyhow!("backend down"))
            }
            async fn delete(&self, _: &str) -> Result<()> {
                Err(anyhow::anyhow!("backend down"))
            }
            async fn delete_prefix(&self, _: &str) -> Result<usize> {
                Err(anyhow::anyhow!("backend down"))
            }
        }

        let layer = test_layer(Some(Arc::new(FailingShared)));
        // set and delete must not error out
        layer.set("k", Bytes::from_static(b"v")).await;
        layer.delete("k").await;
        assert_eq!(layer.get("k").await, None);
    }

    #[tokio::test]
    async fn test_shared_tier_populates_local_on_hit() {
        let shared = Arc::new(InMemorySharedCache::new());
        let layer_a = test_layer(Some(shared.clone()));
        let layer_b = test_layer(Some(shared.clone()));

        layer_a.set("k", Bytes::from_static(b"v")).await;
        // other instance sees the write through the shared tier
        assert_eq!(layer_b.get("k").await, Some(Bytes::from_static(b"v")));
    }
}
