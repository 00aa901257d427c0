//! Fingerprinted cache of raw command output, stored in the shared KV
//! under its own key prefix. Only successful executions are ever cached.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::kv::{KvClient, KvError};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("kv operation failed: {0}")]
    Kv(#[from] KvError),
    #[error("cache entry could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Per-command disposition reported in `result.meta.cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    Hit,
    Miss,
    Refresh,
    Bypass,
}

/// One cached command output. Device and command are kept in the value so
/// the admin inspection endpoints can describe entries without reversing
/// the fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub device: String,
    pub command: String,
    pub raw_output: String,
    pub cached_at: i64,
    pub ttl_s: u64,
}

impl CacheEntry {
    pub fn age_seconds(&self) -> i64 {
        Utc::now().timestamp() - self.cached_at
    }

    fn is_fresh(&self) -> bool {
        self.age_seconds() < self.ttl_s as i64
    }
}

/// Request-scoped cache controls, already validated by the controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheControl {
    pub use_cache: bool,
    pub refresh: bool,
    pub ttl: Option<u64>,
}

/// Stable fingerprint of `(device, command)`, used as the cache key.
pub fn fingerprint(device: &str, command: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(device.as_bytes());
    hasher.update(b"\x00");
    hasher.update(command.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct ResponseCache {
    kv: Arc<dyn KvClient>,
    prefix: String,
    default_ttl: Duration,
    max_ttl: Duration,
}

impl ResponseCache {
    pub fn new(
        kv: Arc<dyn KvClient>,
        prefix: &str,
        default_ttl: Duration,
        max_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            prefix: prefix.to_owned(),
            default_ttl,
            max_ttl,
        }
    }

    fn entry_key(&self, fp: &str) -> String {
        format!("{}:cache:{}", self.prefix, fp)
    }

    fn device_index_key(&self, device: &str) -> String {
        format!("{}:cache-index:device:{}", self.prefix, device)
    }

    fn index_key(&self) -> String {
        format!("{}:cache-index:all", self.prefix)
    }

    /// TTLs above the server-side maximum are clamped, not rejected.
    pub fn clamp_ttl(&self, requested: Option<u64>) -> u64 {
        let ttl = requested.unwrap_or(self.default_ttl.as_secs());
        ttl.min(self.max_ttl.as_secs())
    }

    /// Fetch a fresh entry for `(device, command)`, or None on miss/expiry.
    pub async fn lookup(&self, device: &str, command: &str) -> Result<Option<CacheEntry>, CacheError> {
        let fp = fingerprint(device, command);
        let raw = match self.kv.get(self.entry_key(&fp)).await {
            Ok(raw) => raw,
            Err(KvError::NotFound) => {
                metrics::counter!("cache_misses_total").increment(1);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry = serde_json::from_str(&raw)?;
        if !entry.is_fresh() {
            // Belt and braces: the KV TTL should have evicted it already.
            self.kv.del(self.entry_key(&fp)).await?;
            metrics::counter!("cache_misses_total").increment(1);
            return Ok(None);
        }
        metrics::counter!("cache_hits_total").increment(1);
        Ok(Some(entry))
    }

    /// Store one successful command output, clamping the requested TTL.
    pub async fn store(
        &self,
        device: &str,
        command: &str,
        raw_output: &str,
        requested_ttl: Option<u64>,
    ) -> Result<(), CacheError> {
        let ttl = self.clamp_ttl(requested_ttl);
        let fp = fingerprint(device, command);
        let entry = CacheEntry {
            device: device.to_owned(),
            command: command.to_owned(),
            raw_output: raw_output.to_owned(),
            cached_at: Utc::now().timestamp(),
            ttl_s: ttl,
        };
        self.kv
            .setex(self.entry_key(&fp), serde_json::to_string(&entry)?, ttl)
            .await?;
        self.kv
            .sadd(self.device_index_key(device), fp.clone())
            .await?;
        self.kv.sadd(self.index_key(), fp).await?;
        Ok(())
    }

    /// All currently-fresh entries, for the inspection endpoint.
    pub async fn list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let fps = self.kv.smembers(self.index_key()).await?;
        let keys: Vec<String> = fps.iter().map(|fp| self.entry_key(fp)).collect();
        let values = self.kv.mget(keys).await?;

        let mut entries = Vec::new();
        for (fp, value) in fps.into_iter().zip(values) {
            match value {
                Some(raw) => {
                    let entry: CacheEntry = serde_json::from_str(&raw)?;
                    if entry.is_fresh() {
                        entries.push(entry);
                    }
                }
                // Evicted by TTL: drop the index crumbs.
                None => {
                    self.kv.srem(self.index_key(), fp).await?;
                }
            }
        }
        entries.sort_by(|a, b| (&a.device, &a.command).cmp(&(&b.device, &b.command)));
        Ok(entries)
    }

    pub async fn list_device(&self, device: &str) -> Result<Vec<CacheEntry>, CacheError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.device == device)
            .collect())
    }

    /// Drop every cached entry for one device. Returns how many were removed.
    pub async fn invalidate_device(&self, device: &str) -> Result<u64, CacheError> {
        let fps = self.kv.smembers(self.device_index_key(device)).await?;
        let count = fps.len() as u64;
        for fp in fps {
            self.kv.del(self.entry_key(&fp)).await?;
            self.kv.srem(self.index_key(), fp).await?;
        }
        self.kv.del(self.device_index_key(device)).await?;
        Ok(count)
    }

    /// Drop the whole cache. Returns how many entries were removed.
    pub async fn invalidate_all(&self) -> Result<u64, CacheError> {
        let fps = self.kv.smembers(self.index_key()).await?;
        let count = fps.len() as u64;
        for fp in &fps {
            self.kv.del(self.entry_key(fp)).await?;
        }
        self.kv.del(self.index_key()).await?;
        for key in self
            .kv
            .keys(format!("{}:cache-index:device:*", self.prefix))
            .await?
        {
            self.kv.del(key).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn cache() -> ResponseCache {
        ResponseCache::new(
            Arc::new(MemoryKv::new()),
            "sb",
            Duration::from_secs(300),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn fingerprints_are_stable_and_distinct() {
        assert_eq!(
            fingerprint("rtr1", "show version"),
            fingerprint("rtr1", "show version")
        );
        assert_ne!(
            fingerprint("rtr1", "show version"),
            fingerprint("rtr2", "show version")
        );
        // The separator prevents boundary collisions.
        assert_ne!(fingerprint("ab", "c"), fingerprint("a", "bc"));
    }

    #[test]
    fn requested_ttls_are_clamped_not_rejected() {
        let cache = cache();
        assert_eq!(cache.clamp_ttl(None), 300);
        assert_eq!(cache.clamp_ttl(Some(60)), 60);
        assert_eq!(cache.clamp_ttl(Some(86400)), 3600);
    }

    #[tokio::test]
    async fn store_then_lookup_hits() {
        let cache = cache();
        cache
            .store("rtr1", "show version", "IOS 15.2", None)
            .await
            .unwrap();

        let entry = cache
            .lookup("rtr1", "show version")
            .await
            .unwrap()
            .expect("entry should be fresh");
        assert_eq!(entry.raw_output, "IOS 15.2");
        assert_eq!(entry.ttl_s, 300);
        assert!(entry.age_seconds() >= 0);

        assert!(cache.lookup("rtr1", "show ip route").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_entries_read_as_misses() {
        let kv: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
        let cache = ResponseCache::new(
            kv.clone(),
            "sb",
            Duration::from_secs(300),
            Duration::from_secs(3600),
        );

        // Plant an entry whose logical TTL has already elapsed.
        let fp = fingerprint("rtr1", "show version");
        let entry = CacheEntry {
            device: "rtr1".to_string(),
            command: "show version".to_string(),
            raw_output: "old".to_string(),
            cached_at: Utc::now().timestamp() - 500,
            ttl_s: 60,
        };
        kv.set(
            format!("sb:cache:{}", fp),
            serde_json::to_string(&entry).unwrap(),
        )
        .await
        .unwrap();

        assert!(cache.lookup("rtr1", "show version").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_device_forces_misses() {
        let cache = cache();
        cache.store("rtr1", "a", "out-a", None).await.unwrap();
        cache.store("rtr1", "b", "out-b", None).await.unwrap();
        cache.store("rtr2", "a", "out-a2", None).await.unwrap();

        assert_eq!(cache.invalidate_device("rtr1").await.unwrap(), 2);
        assert!(cache.lookup("rtr1", "a").await.unwrap().is_none());
        assert!(cache.lookup("rtr1", "b").await.unwrap().is_none());
        assert!(cache.lookup("rtr2", "a").await.unwrap().is_some());

        assert_eq!(cache.invalidate_all().await.unwrap(), 1);
        assert!(cache.lookup("rtr2", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_describes_entries_per_device() {
        let cache = cache();
        cache.store("rtr1", "show version", "v", None).await.unwrap();
        cache.store("rtr2", "show clock", "c", None).await.unwrap();

        let all = cache.list().await.unwrap();
        assert_eq!(all.len(), 2);

        let rtr1 = cache.list_device("rtr1").await.unwrap();
        assert_eq!(rtr1.len(), 1);
        assert_eq!(rtr1[0].command, "show version");
    }
}
