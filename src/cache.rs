//! In-memory TTL cache.
//!
//! One instance per cached concern (state snapshots, form definitions,
//! credentials, user profiles), injected where needed so tests can seed it
//! directly. Uses tokio's clock, so paused-time tests control expiry.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, V)>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((expires, value)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh; the expiry restarts from now either way.
    pub async fn put(&self, key: impl Into<String>, value: V) {
        let mut entries = self.entries.lock().await;
        entries.insert(key.into(), (Instant::now() + self.ttl, value));
    }

    pub async fn remove(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    /// Cached value, or run `load` and cache its result.
    pub async fn get_or_try_load<F, Fut, E>(&self, key: &str, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let value = load().await?;
        self.put(key.to_string(), value.clone()).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_the_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put("k", 1u32).await;
        assert_eq!(cache.get("k").await, Some(1));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn put_refreshes_the_expiry() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put("k", 1u32).await;

        tokio::time::advance(Duration::from_secs(45)).await;
        cache.put("k", 2u32).await;

        tokio::time::advance(Duration::from_secs(45)).await;
        // 90s after first write, 45s after refresh
        assert_eq!(cache.get("k").await, Some(2));
    }

    #[tokio::test]
    async fn get_or_try_load_caches_the_loaded_value() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60));
        let loaded = cache
            .get_or_try_load("k", || async { Ok::<_, ()>(7) })
            .await
            .expect("load should succeed");
        assert_eq!(loaded, 7);

        // second lookup must not hit the loader
        let cached = cache
            .get_or_try_load("k", || async { Err(()) })
            .await
            .expect("cache hit expected");
        assert_eq!(cached, 7);
    }
}
