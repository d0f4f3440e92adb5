//! Key-value store used for session entries, OAuth state and rate-limit
//! counters. Redis in production, an in-process map for local runs and tests.

use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::{Pool, Runtime};
use redis::AsyncCommands;
use tracing::{debug, info};

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    /// Returns whether a key was actually removed.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;
    /// Counts a hit in the fixed window stored at `key`, opening the window on
    /// the first hit. Returns the hit count and the seconds left in the window.
    async fn hit(&self, key: &str, window: Duration) -> anyhow::Result<(u64, u64)>;
}

#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .context("create redis pool")?;

        let mut conn = pool.get().await.context("connect to redis")?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis PING")?;
        info!(%pong, "connected to redis");

        Ok(Self { pool })
    }
}

#[async_trait]
impl KvCache for RedisCache {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await.context("redis connection")?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .with_context(|| format!("redis SETEX {key}"))?;
        debug!(key, ttl_secs = ttl.as_secs(), "cache set");
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.pool.get().await.context("redis connection")?;
        let value = conn
            .get::<_, Option<String>>(key)
            .await
            .with_context(|| format!("redis GET {key}"))?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.pool.get().await.context("redis connection")?;
        let removed = conn
            .del::<_, u64>(key)
            .await
            .with_context(|| format!("redis DEL {key}"))?;
        Ok(removed > 0)
    }

    async fn hit(&self, key: &str, window: Duration) -> anyhow::Result<(u64, u64)> {
        let mut conn = self.pool.get().await.context("redis connection")?;
        let (count, ttl): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("NX")
            .arg("EX")
            .arg(window.as_secs().max(1))
            .ignore()
            .incr(key, 1)
            .ttl(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis window hit {key}"))?;
        Ok((count, ttl.max(0) as u64))
    }
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Single-process store. Reads skip expired entries; a sweeper task drops
/// the ones nobody reads again.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, e| !e.is_live(now));
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_live(now) {
                true
            } else {
                removed += 1;
                false
            }
        });
        removed
    }

    /// Runs `cleanup_expired` every `period` until the cache is dropped.
    pub fn spawn_sweeper(cache: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                let removed = cache.cleanup_expired();
                if removed > 0 {
                    debug!(removed, remaining = cache.len(), "expired cache entries swept");
                }
            }
        })
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.live_value(key))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| e.is_live(now)))
    }

    async fn hit(&self, key: &str, window: Duration) -> anyhow::Result<(u64, u64)> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".into(),
            expires_at: now + window,
        });
        if !entry.is_live(now) {
            entry.value = "0".into();
            entry.expires_at = now + window;
        }
        let count = entry.value.parse::<u64>().unwrap_or(0) + 1;
        entry.value = count.to_string();
        let left = entry.expires_at.saturating_duration_since(now).as_secs();
        Ok((count, left))
    }
}
