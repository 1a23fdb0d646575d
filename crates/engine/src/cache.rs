use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use common::{CacheConfig, Result};

/// Default TTLs by key prefix, seconds.
const DEFAULT_TTLS: &[(&str, f64)] = &[
    ("stock_info", 3.0),
    ("orderbook", 2.0),
    ("daily_chart", 3600.0),
    ("cash_balance", 30.0),
    ("account_balance", 30.0),
    ("pending_orders", 5.0),
    ("filled_orders", 5.0),
    ("stock_list", 86_400.0),
];

const FALLBACK_TTL: f64 = 60.0;

/// Prefixes wiped whenever an order succeeds.
const ACCOUNT_PREFIXES: &[&str] = &[
    "cash_balance",
    "account_balance",
    "pending_orders",
    "filled_orders",
];

/// Long-lived data worth pushing to the shared and durable tiers.
const SLOW_TIER_PREFIXES: &[&str] = &["stock_info", "daily_chart", "stock_list"];

/// Slow tiers persist entries ten times longer than L1.
const SLOW_TIER_TTL_MULTIPLIER: f64 = 10.0;

/// Build a cache key from a prefix and its parameters.
pub fn cache_key(prefix: &str, parts: &[&str]) -> String {
    let mut key = String::from(prefix);
    for p in parts {
        key.push(':');
        key.push_str(p);
    }
    key
}

fn default_ttl(key: &str) -> f64 {
    DEFAULT_TTLS
        .iter()
        .find(|(prefix, _)| key.starts_with(prefix))
        .map(|(_, ttl)| *ttl)
        .unwrap_or(FALLBACK_TTL)
}

fn uses_slow_tiers(key: &str) -> bool {
    SLOW_TIER_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Optional shared key-value tier (L2). Network-backed in deployment; the
/// in-memory implementation below serves tests and single-node runs.
#[async_trait]
pub trait SharedKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;
    async fn len(&self) -> usize;
}

/// Process-local `SharedKv` with per-entry expiry.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

#[async_trait]
impl SharedKv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.inner.lock().await;
        match map.get(key) {
            Some((_, expires)) if *expires < Utc::now() => {
                map.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires =
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        self.inner
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut map = self.inner.lock().await;
        let keys: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let count = keys.len() as u64;
        for k in keys {
            map.remove(&k);
        }
        Ok(count)
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

struct L1Entry {
    value: Value,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl L1Entry {
    fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

#[derive(Default)]
struct CacheStatsInner {
    l1_hits: u64,
    l1_misses: u64,
    l2_hits: u64,
    l2_misses: u64,
    l3_hits: u64,
    invalidations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub l1_size: usize,
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l1_hit_rate_pct: f64,
    pub l2_available: bool,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l3_available: bool,
    pub l3_hits: u64,
    pub invalidations: u64,
}

/// Three-tier read-through / write-through TTL cache.
///
/// L1 is an in-process map behind one mutex; L2 is an optional shared KV;
/// L3 is an optional durable SQLite table. Expired entries are treated as
/// misses and removed lazily, and a background sweeper purges L1 and L3
/// periodically.
pub struct TieredCache {
    enabled: bool,
    max_size: usize,
    sweep_interval: Duration,
    l1: Mutex<HashMap<String, L1Entry>>,
    l2: Option<Arc<dyn SharedKv>>,
    l3: Option<SqlitePool>,
    stats: Mutex<CacheStatsInner>,
}

impl TieredCache {
    pub fn new(config: &CacheConfig) -> Self {
        info!(
            max_size = config.l1_max_size,
            enabled = config.enabled,
            "cache initialized"
        );
        Self {
            enabled: config.enabled,
            max_size: config.l1_max_size.max(1),
            sweep_interval: Duration::from_secs(config.sweep_interval_sec.max(1)),
            l1: Mutex::new(HashMap::new()),
            l2: None,
            l3: None,
            stats: Mutex::new(CacheStatsInner::default()),
        }
    }

    pub fn with_shared_kv(mut self, kv: Arc<dyn SharedKv>) -> Self {
        self.l2 = Some(kv);
        self
    }

    pub fn with_durable(mut self, pool: SqlitePool) -> Self {
        self.l3 = Some(pool);
        self
    }

    /// Read through the tiers. A hit on a slower tier is promoted upward
    /// at the key's default TTL.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }

        // L1
        {
            let mut l1 = self.l1.lock().await;
            match l1.get(key) {
                Some(entry) if entry.is_expired() => {
                    l1.remove(key);
                    self.stats.lock().await.l1_misses += 1;
                }
                Some(entry) => {
                    self.stats.lock().await.l1_hits += 1;
                    return Some(entry.value.clone());
                }
                None => {
                    self.stats.lock().await.l1_misses += 1;
                }
            }
        }

        // L2
        if uses_slow_tiers(key) {
            if let Some(kv) = &self.l2 {
                match kv.get(key).await {
                    Ok(Some(raw)) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                            self.stats.lock().await.l2_hits += 1;
                            self.set_l1(key, value.clone(), default_ttl(key)).await;
                            debug!(key, "cache L2 hit");
                            return Some(value);
                        }
                    }
                    Ok(None) => {
                        self.stats.lock().await.l2_misses += 1;
                    }
                    Err(e) => warn!(key, error = %e, "cache L2 read failed"),
                }
            }
        }

        // L3
        if uses_slow_tiers(key) {
            if let Some(pool) = &self.l3 {
                match self.get_l3(pool, key).await {
                    Ok(Some(value)) => {
                        self.stats.lock().await.l3_hits += 1;
                        let ttl = default_ttl(key);
                        self.set_l1(key, value.clone(), ttl).await;
                        if let Some(kv) = &self.l2 {
                            let raw = value.to_string();
                            let slow_ttl =
                                Duration::from_secs_f64(ttl * SLOW_TIER_TTL_MULTIPLIER);
                            if let Err(e) = kv.set(key, &raw, slow_ttl).await {
                                warn!(key, error = %e, "cache L2 promotion failed");
                            }
                        }
                        debug!(key, "cache L3 hit");
                        return Some(value);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(key, error = %e, "cache L3 read failed"),
                }
            }
        }

        None
    }

    /// Write through. L1 always; long-TTL prefixes also land in L2/L3 at
    /// ten times the TTL.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<f64>) {
        if !self.enabled {
            return;
        }
        let ttl = ttl.unwrap_or_else(|| default_ttl(key));
        self.set_l1(key, value.clone(), ttl).await;

        if uses_slow_tiers(key) {
            let slow_ttl = Duration::from_secs_f64(ttl * SLOW_TIER_TTL_MULTIPLIER);
            if let Some(kv) = &self.l2 {
                if let Err(e) = kv.set(key, &value.to_string(), slow_ttl).await {
                    warn!(key, error = %e, "cache L2 write failed");
                }
            }
            if let Some(pool) = &self.l3 {
                if let Err(e) = self.set_l3(pool, key, &value, slow_ttl).await {
                    warn!(key, error = %e, "cache L3 write failed");
                }
            }
        }
    }

    async fn set_l1(&self, key: &str, value: Value, ttl: f64) {
        let mut l1 = self.l1.lock().await;
        if l1.len() >= self.max_size && !l1.contains_key(key) {
            Self::evict(&mut l1, self.max_size);
        }
        let now = Utc::now();
        l1.insert(
            key.to_string(),
            L1Entry {
                value,
                expires_at: now + chrono::Duration::milliseconds((ttl * 1000.0) as i64),
                created_at: now,
            },
        );
    }

    /// Expired entries go first; if the map is still full, the oldest 20%
    /// by creation time are dropped.
    fn evict(l1: &mut HashMap<String, L1Entry>, max_size: usize) {
        let expired: Vec<String> = l1
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            l1.remove(&k);
        }

        if l1.len() >= max_size {
            let mut by_age: Vec<(String, DateTime<Utc>)> = l1
                .iter()
                .map(|(k, e)| (k.clone(), e.created_at))
                .collect();
            by_age.sort_by_key(|(_, created)| *created);
            let drop_count = (max_size / 5).max(1);
            for (k, _) in by_age.into_iter().take(drop_count) {
                l1.remove(&k);
            }
        }
    }

    async fn get_l3(&self, pool: &SqlitePool, key: &str) -> Result<Option<Value>> {
        let row: Option<(String, f64)> =
            sqlx::query_as("SELECT value, expires_at FROM cache_entries WHERE key = ?1")
                .bind(key)
                .fetch_optional(pool)
                .await?;
        match row {
            Some((raw, expires_at)) => {
                if expires_at < Utc::now().timestamp_millis() as f64 / 1000.0 {
                    sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
                        .bind(key)
                        .execute(pool)
                        .await?;
                    return Ok(None);
                }
                Ok(serde_json::from_str(&raw).ok())
            }
            None => Ok(None),
        }
    }

    async fn set_l3(&self, pool: &SqlitePool, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now().timestamp_millis() as f64 / 1000.0 + ttl.as_secs_f64();
        sqlx::query(
            "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
        )
        .bind(key)
        .bind(value.to_string())
        .bind(expires_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Remove one key from every tier.
    pub async fn delete(&self, key: &str) {
        self.l1.lock().await.remove(key);
        if let Some(kv) = &self.l2 {
            let _ = kv.delete(key).await;
        }
        if let Some(pool) = &self.l3 {
            let _ = sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
                .bind(key)
                .execute(pool)
                .await;
        }
    }

    /// Drop every account-class key across all tiers. Called after any
    /// successful order so balances are re-read from the upstream.
    pub async fn invalidate_account(&self) -> u64 {
        let mut invalidated = 0u64;

        {
            let mut l1 = self.l1.lock().await;
            let keys: Vec<String> = l1
                .keys()
                .filter(|k| ACCOUNT_PREFIXES.iter().any(|p| k.starts_with(p)))
                .cloned()
                .collect();
            invalidated += keys.len() as u64;
            for k in keys {
                l1.remove(&k);
            }
        }

        if let Some(kv) = &self.l2 {
            for prefix in ACCOUNT_PREFIXES {
                match kv.delete_prefix(prefix).await {
                    Ok(n) => invalidated += n,
                    Err(e) => warn!(prefix, error = %e, "cache L2 invalidation failed"),
                }
            }
        }

        if let Some(pool) = &self.l3 {
            for prefix in ACCOUNT_PREFIXES {
                let pattern = format!("{prefix}%");
                if let Ok(res) = sqlx::query("DELETE FROM cache_entries WHERE key LIKE ?1")
                    .bind(&pattern)
                    .execute(pool)
                    .await
                {
                    invalidated += res.rows_affected();
                }
            }
        }

        if invalidated > 0 {
            let mut stats = self.stats.lock().await;
            stats.invalidations += invalidated;
            info!(invalidated, "account cache invalidated");
        }
        invalidated
    }

    /// Purge expired entries from L1 and L3 once.
    pub async fn sweep(&self) -> u64 {
        let mut removed = 0u64;
        {
            let mut l1 = self.l1.lock().await;
            let expired: Vec<String> = l1
                .iter()
                .filter(|(_, e)| e.is_expired())
                .map(|(k, _)| k.clone())
                .collect();
            removed += expired.len() as u64;
            for k in expired {
                l1.remove(&k);
            }
        }
        if let Some(pool) = &self.l3 {
            let now = Utc::now().timestamp_millis() as f64 / 1000.0;
            if let Ok(res) = sqlx::query("DELETE FROM cache_entries WHERE expires_at < ?1")
                .bind(now)
                .execute(pool)
                .await
            {
                removed += res.rows_affected();
            }
        }
        removed
    }

    /// Spawn the periodic sweeper. The returned handle is aborted on
    /// coordinator shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = cache.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let removed = cache.sweep().await;
                if removed > 0 {
                    debug!(removed, "cache sweep");
                }
            }
        })
    }

    pub async fn clear(&self) {
        self.l1.lock().await.clear();
        if let Some(pool) = &self.l3 {
            let _ = sqlx::query("DELETE FROM cache_entries").execute(pool).await;
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.stats.lock().await;
        let l1_total = inner.l1_hits + inner.l1_misses;
        CacheStats {
            l1_size: self.l1.lock().await.len(),
            l1_hits: inner.l1_hits,
            l1_misses: inner.l1_misses,
            l1_hit_rate_pct: if l1_total > 0 {
                inner.l1_hits as f64 / l1_total as f64 * 100.0
            } else {
                0.0
            },
            l2_available: self.l2.is_some(),
            l2_hits: inner.l2_hits,
            l2_misses: inner.l2_misses,
            l3_available: self.l3.is_some(),
            l3_hits: inner.l3_hits,
            invalidations: inner.invalidations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> TieredCache {
        TieredCache::new(&CacheConfig {
            enabled: true,
            l1_max_size: 10,
            sweep_interval_sec: 300,
        })
    }

    #[test]
    fn key_builder_joins_with_colons() {
        assert_eq!(cache_key("stock_info", &["005930"]), "stock_info:005930");
        assert_eq!(
            cache_key("daily_chart", &["005930", "30"]),
            "daily_chart:005930:30"
        );
    }

    #[tokio::test]
    async fn expired_entries_read_as_misses() {
        let c = cache();
        c.set("stock_info:005930", json!({"price": 1}), Some(0.01)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(c.get("stock_info:005930").await.is_none());
    }

    #[tokio::test]
    async fn l2_hit_promotes_into_l1() {
        let kv = Arc::new(MemoryKv::default());
        let c = cache().with_shared_kv(kv.clone());
        kv.set(
            "stock_info:005930",
            &json!({"price": 70000}).to_string(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let hit = c.get("stock_info:005930").await.unwrap();
        assert_eq!(hit["price"], 70000);

        // Second read must be an L1 hit.
        let _ = c.get("stock_info:005930").await.unwrap();
        let stats = c.stats().await;
        assert_eq!(stats.l2_hits, 1);
        assert_eq!(stats.l1_hits, 1);
    }

    #[tokio::test]
    async fn short_lived_account_keys_stay_l1_only() {
        let kv = Arc::new(MemoryKv::default());
        let c = cache().with_shared_kv(kv.clone());
        c.set("cash_balance:main", json!({"cash": 1000}), None).await;
        assert_eq!(kv.len().await, 0);

        c.set("daily_chart:005930", json!([1, 2, 3]), None).await;
        assert_eq!(kv.len().await, 1);
    }

    #[tokio::test]
    async fn invalidate_account_removes_account_class_keys() {
        let c = cache();
        c.set("cash_balance:main", json!(1), None).await;
        c.set("pending_orders:main", json!(2), None).await;
        c.set("stock_info:005930", json!(3), None).await;

        let removed = c.invalidate_account().await;
        assert_eq!(removed, 2);
        assert!(c.get("cash_balance:main").await.is_none());
        assert!(c.get("pending_orders:main").await.is_none());
        assert!(c.get("stock_info:005930").await.is_some());
    }

    #[tokio::test]
    async fn eviction_drops_oldest_when_full() {
        let c = TieredCache::new(&CacheConfig {
            enabled: true,
            l1_max_size: 5,
            sweep_interval_sec: 300,
        });
        for i in 0..5 {
            c.set(&format!("stock_info:{i}"), json!(i), Some(60.0)).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        c.set("stock_info:new", json!("new"), Some(60.0)).await;

        // Oldest entry evicted, newest present.
        assert!(c.get("stock_info:0").await.is_none());
        assert!(c.get("stock_info:new").await.is_some());
    }

    #[tokio::test]
    async fn sweep_removes_expired_l1_entries() {
        let c = cache();
        c.set("orderbook:005930", json!(1), Some(0.01)).await;
        c.set("orderbook:000660", json!(2), Some(60.0)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let removed = c.sweep().await;
        assert_eq!(removed, 1);
    }
}
