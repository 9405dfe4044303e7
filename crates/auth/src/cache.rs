use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use pulse_common::UserIdentity;

struct CacheEntry {
    identity: UserIdentity,
    expires_at: Instant,
}

/// TTL-bounded identity cache keyed by credential fingerprint.
///
/// Entries never outlive the credential's own expiry: the inserter passes a
/// TTL already capped at `exp - now`. The cache is process-local, so a
/// restart is an implicit flush.
pub struct IdentityCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl IdentityCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<UserIdentity> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(fingerprint)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.identity.clone())
    }

    pub fn insert(&self, fingerprint: String, identity: UserIdentity, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        if entries.len() >= self.max_entries
            && let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone())
        {
            entries.remove(&oldest_key);
        }
        entries.insert(fingerprint, CacheEntry {
            identity,
            expires_at: now + ttl,
        });
    }

    /// Drop every cached identity (admin flush).
    pub fn flush(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, pulse_common::Role, std::collections::BTreeSet};

    fn identity(user_id: u64) -> UserIdentity {
        UserIdentity {
            user_id,
            role: Role::Member,
            permissions: BTreeSet::new(),
            name: String::new(),
            email: String::new(),
            avatar: None,
        }
    }

    #[test]
    fn hit_within_ttl() {
        let cache = IdentityCache::new(10);
        cache.insert("fp".into(), identity(1), Duration::from_secs(30));
        assert_eq!(cache.get("fp").unwrap().user_id, 1);
    }

    #[test]
    fn expired_entry_misses() {
        let cache = IdentityCache::new(10);
        cache.insert("fp".into(), identity(1), Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("fp").is_none());
    }

    #[test]
    fn zero_ttl_never_caches() {
        let cache = IdentityCache::new(10);
        cache.insert("fp".into(), identity(1), Duration::ZERO);
        assert!(cache.get("fp").is_none());
    }

    #[test]
    fn capacity_evicts_soonest_expiring() {
        let cache = IdentityCache::new(2);
        cache.insert("a".into(), identity(1), Duration::from_secs(5));
        cache.insert("b".into(), identity(2), Duration::from_secs(60));
        cache.insert("c".into(), identity(3), Duration::from_secs(60));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn flush_clears() {
        let cache = IdentityCache::new(10);
        cache.insert("fp".into(), identity(1), Duration::from_secs(30));
        cache.flush();
        assert!(cache.is_empty());
    }
}
