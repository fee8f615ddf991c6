//! TTL key-value cache with typed accessors for prices, analyses and
//! sessions. Grounded in the source's `InMemoryCache`/`CacheManager` pair
//! (lazy expiry-on-read plus a periodic sweep), generalised into an
//! exclusive-lock map in the teacher's `parking_lot` idiom.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// A single exclusive-lock map. Mutations are O(1) and never held across an
/// await point, per the concurrency model's shared-resource policy.
pub struct Cache {
    data: Mutex<HashMap<String, Entry>>,
}

impl Cache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(HashMap::new()),
        })
    }

    pub fn get_raw(&self, key: &str) -> Option<String> {
        let mut data = self.data.lock();
        match data.get(key) {
            Some(entry) if entry.expires_at > Utc::now() => Some(entry.value.clone()),
            Some(_) => {
                data.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set_raw(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        self.data.lock().insert(
            key.into(),
            Entry {
                value: value.into(),
                expires_at,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.data.lock().remove(key).is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get_raw(key).is_some()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_raw(key)
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    pub fn set<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl: Duration) {
        if let Ok(raw) = serde_json::to_string(value) {
            self.set_raw(key, raw, ttl);
        }
    }

    /// Removes every expired entry. Run by the janitor on an interval; safe
    /// to call at any time since expiry is also checked lazily on read.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut data = self.data.lock();
        let before = data.len();
        data.retain(|_, entry| entry.expires_at > now);
        before - data.len()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns the background sweep loop. Returns a handle the caller can abort
/// on shutdown; the cache itself keeps working via lazy expiry if the
/// janitor is never stopped.
pub fn spawn_janitor(cache: Arc<Cache>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = cache.sweep_expired();
            if removed > 0 {
                info!(removed, "cache janitor swept expired entries");
            }
        }
    })
}

pub mod keys {
    pub fn gold_price() -> String {
        "gold_price:latest".to_string()
    }

    pub fn forex_price(pair: &str) -> String {
        format!("forex_price:{pair}")
    }

    pub fn analysis(user_id: i64, kind: &str, fingerprint: &str) -> String {
        format!("analysis:{user_id}:{kind}:{fingerprint}")
    }

    pub fn session(user_id: i64) -> String {
        format!("user:session:{user_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn set_then_get_round_trips() {
        let cache = Cache::new();
        cache.set_raw("k", "v", StdDuration::from_secs(60));
        assert_eq!(cache.get_raw("k").as_deref(), Some("v"));
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let cache = Cache::new();
        cache.set_raw("k", "v", StdDuration::from_millis(0));
        std::thread::sleep(StdDuration::from_millis(5));
        assert_eq!(cache.get_raw("k"), None);
        assert!(!cache.exists("k"));
    }

    #[test]
    fn typed_accessors_round_trip_serde() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Payload {
            a: i64,
        }
        let cache = Cache::new();
        cache.set("p", &Payload { a: 7 }, StdDuration::from_secs(60));
        assert_eq!(cache.get::<Payload>("p"), Some(Payload { a: 7 }));
    }

    #[test]
    fn sweep_expired_removes_only_stale_entries() {
        let cache = Cache::new();
        cache.set_raw("stale", "v", StdDuration::from_millis(0));
        cache.set_raw("fresh", "v", StdDuration::from_secs(60));
        std::thread::sleep(StdDuration::from_millis(5));
        let removed = cache.sweep_expired();
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
    }
}
