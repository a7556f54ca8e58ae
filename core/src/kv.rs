/// Process-wide key/value store scoped by `instance_id`, with TTL expiry
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default lifetime of an entry, and of the grace period after completion
pub const DEFAULT_TTL_SECS: i64 = 3600;

/// Upper bound on the sweep period
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 300;

/// Stored value of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvEntry {
    pub payload: Value,
    pub metadata: Value,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl KvEntry {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub struct ScopedKvStore {
    entries: DashMap<String, KvEntry>,
    default_ttl: Duration,
}

impl ScopedKvStore {
    pub fn new() -> Self {
        Self::with_default_ttl(Duration::seconds(DEFAULT_TTL_SECS))
    }

    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        ScopedKvStore {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Store (or replace) the entry of an instance, refreshing its TTL
    pub fn set(
        &self,
        instance_id: &str,
        payload: Value,
        metadata: Value,
        ttl: Option<Duration>,
    ) -> KvEntry {
        let now = Utc::now();
        let entry = KvEntry {
            payload,
            metadata,
            stored_at: now,
            expires_at: now + ttl.unwrap_or(self.default_ttl),
        };
        self.entries.insert(instance_id.to_string(), entry.clone());
        entry
    }

    /// Fetch a live entry; an expired one is removed on the way
    pub fn get(&self, instance_id: &str) -> Option<KvEntry> {
        self.get_at(instance_id, Utc::now())
    }

    fn get_at(&self, instance_id: &str, now: DateTime<Utc>) -> Option<KvEntry> {
        let entry = self.entries.get(instance_id)?.clone();
        if entry.is_expired_at(now) {
            self.entries
                .remove_if(instance_id, |_, e| e.is_expired_at(now));
            debug!("kv entry for {} expired", instance_id);
            return None;
        }
        Some(entry)
    }

    pub fn remove(&self, instance_id: &str) -> Option<KvEntry> {
        self.entries.remove(instance_id).map(|(_, e)| e)
    }

    /// Keep the entry for one default TTL counted from now
    pub fn extend_after_terminal(&self, instance_id: &str) -> bool {
        match self.entries.get_mut(instance_id) {
            Some(mut entry) => {
                entry.expires_at = Utc::now() + self.default_ttl;
                true
            }
            None => false,
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn the periodic sweep (interval capped at five minutes)
    pub fn spawn_sweeper(self: &Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        let interval = interval.min(std::time::Duration::from_secs(MAX_SWEEP_INTERVAL_SECS));
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else { break };
                let removed = store.sweep();
                if removed > 0 {
                    debug!("kv sweep removed {} expired entries", removed);
                }
            }
        })
    }
}

impl Default for ScopedKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get() {
        let kv = ScopedKvStore::new();
        kv.set("i-1", json!({"room": "101"}), json!({"node": "n1"}), None);

        let entry = kv.get("i-1").unwrap();
        assert_eq!(entry.payload["room"], "101");
        assert_eq!(entry.expires_at - entry.stored_at, Duration::seconds(3600));
        assert!(kv.get("i-2").is_none());
    }

    #[test]
    fn test_expired_entry_removed_lazily() {
        let kv = ScopedKvStore::new();
        kv.set("i-1", json!(1), json!({}), Some(Duration::seconds(10)));

        let later = Utc::now() + Duration::seconds(11);
        assert!(kv.get_at("i-1", later).is_none());
        assert!(kv.is_empty());
    }

    #[test]
    fn test_sweep_only_drops_expired() {
        let kv = ScopedKvStore::new();
        kv.set("short", json!(1), json!({}), Some(Duration::seconds(5)));
        kv.set("long", json!(2), json!({}), Some(Duration::seconds(500)));

        let removed = kv.sweep_at(Utc::now() + Duration::seconds(60));
        assert_eq!(removed, 1);
        assert!(kv.get("long").is_some());
    }

    #[test]
    fn test_extend_after_terminal() {
        let kv = ScopedKvStore::new();
        kv.set("i-1", json!(1), json!({}), Some(Duration::seconds(1)));
        assert!(kv.extend_after_terminal("i-1"));

        let entry = kv.get("i-1").unwrap();
        assert!(entry.expires_at > Utc::now() + Duration::seconds(3500));
        assert!(!kv.extend_after_terminal("missing"));
    }
}
