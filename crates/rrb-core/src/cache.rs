use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    ports::{PropertyStore, WindowCache},
    rate_limit::RateWindow,
    Result,
};

#[derive(Clone, Debug)]
struct CacheEntry {
    window: RateWindow,
    expires_at: Instant,
}

/// In-process TTL cache for rate windows.
///
/// Entries expire on read once their TTL lapses; there is no background sweep.
#[derive(Default)]
pub struct MemoryWindowCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryWindowCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowCache for MemoryWindowCache {
    async fn get(&self, key: &str) -> Result<Option<RateWindow>> {
        let now = Instant::now();
        let mut map = self.entries.lock().await;
        match map.get(key) {
            Some(e) if e.expires_at > now => Ok(Some(e.window.clone())),
            Some(_) => {
                map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, window: RateWindow, ttl: Duration) -> Result<()> {
        self.entries.lock().await.insert(
            key.to_string(),
            CacheEntry {
                window,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredWindow {
    window: RateWindow,
    expires_at_ms: i64,
}

/// Rate windows kept in a durable [`PropertyStore`], so short-lived processes
/// (one CLI invocation per message) share quota. Expiry is wall-clock based.
pub struct PropertyWindowCache {
    props: Arc<dyn PropertyStore>,
}

impl PropertyWindowCache {
    pub fn new(props: Arc<dyn PropertyStore>) -> Self {
        Self { props }
    }
}

#[async_trait]
impl WindowCache for PropertyWindowCache {
    async fn get(&self, key: &str) -> Result<Option<RateWindow>> {
        let Some(txt) = self.props.get(key).await? else {
            return Ok(None);
        };
        let stored: StoredWindow = serde_json::from_str(&txt)?;
        if stored.expires_at_ms <= Utc::now().timestamp_millis() {
            self.props.remove(key).await?;
            return Ok(None);
        }
        Ok(Some(stored.window))
    }

    async fn put(&self, key: &str, window: RateWindow, ttl: Duration) -> Result<()> {
        let stored = StoredWindow {
            window,
            expires_at_ms: Utc::now().timestamp_millis() + ttl.as_millis() as i64,
        };
        self.props.set(key, &serde_json::to_string(&stored)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Tier;

    fn window(count: u32) -> RateWindow {
        RateWindow {
            count,
            window_start_ms: 0,
            tier: Tier::Normal,
        }
    }

    #[tokio::test]
    async fn put_then_get_within_ttl() {
        let c = MemoryWindowCache::new();
        c.put("rate:a", window(3), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(c.get("rate:a").await.unwrap(), Some(window(3)));
        assert_eq!(c.get("rate:b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_ttl_entry_is_expired() {
        let c = MemoryWindowCache::new();
        c.put("rate:a", window(1), Duration::ZERO).await.unwrap();
        assert_eq!(c.get("rate:a").await.unwrap(), None);
        assert!(c.entries.lock().await.is_empty());
    }

    #[tokio::test]
    async fn property_cache_round_trips_and_expires() {
        let props = Arc::new(crate::correspondence::tests::MemoryProps::default());
        let c = PropertyWindowCache::new(props.clone());
        c.put("rate:a", window(2), Duration::from_secs(60))
            .await
            .unwrap();
        c.put("rate:b", window(2), Duration::ZERO).await.unwrap();
        assert!(props.contains("rate:b"));
        assert_eq!(c.get("rate:a").await.unwrap(), Some(window(2)));
        assert_eq!(c.get("rate:b").await.unwrap(), None);
        assert!(!props.contains("rate:b"), "expired window is dropped on read");
        assert!(props.contains("rate:a"));
        assert_eq!(c.get("rate:c").await.unwrap(), None);
    }
}
