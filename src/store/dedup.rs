//! TTL-bounded dedup cache.
//!
//! Transaction hash -> time it was first written to the transaction log. An
//! entry that expires before a true duplicate arrives lets that duplicate
//! through again; memory stays bounded by the TTL.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug)]
pub struct DedupCache {
    ttl: TimeDelta,
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl DedupCache {
    pub fn new(ttl: TimeDelta) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    pub fn get(&self, hash: &str) -> Option<DateTime<Utc>> {
        self.entries.read().get(&hash.to_lowercase()).copied()
    }

    pub fn insert(&self, hash: &str, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        self.entries.write().insert(hash.to_lowercase(), timestamp);
        timestamp
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop entries whose age reached the TTL
    pub fn evict(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, recorded| now - *recorded < self.ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_insert_then_get() {
        let cache = DedupCache::new(TimeDelta::minutes(30));
        cache.insert("0xabc", at(100));
        assert_eq!(cache.get("0xabc"), Some(at(100)));
    }

    #[test]
    fn test_get_missing() {
        let cache = DedupCache::new(TimeDelta::minutes(30));
        assert_eq!(cache.get("0xabc"), None);
    }

    #[test]
    fn test_keys_are_case_normalized() {
        let cache = DedupCache::new(TimeDelta::minutes(30));
        cache.insert("0xABC", at(100));
        assert_eq!(cache.get("0xabc"), Some(at(100)));
        assert_eq!(cache.get("0xAbC"), Some(at(100)));
    }

    #[test]
    fn test_insert_overwrites() {
        let cache = DedupCache::new(TimeDelta::minutes(30));
        cache.insert("0xabc", at(100));
        cache.insert("0xabc", at(200));
        assert_eq!(cache.get("0xabc"), Some(at(200)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_at_ttl_boundary() {
        let cache = DedupCache::new(TimeDelta::minutes(30));
        cache.insert("0xabc", at(0));

        assert_eq!(cache.evict(at(30 * 60 - 1)), 0);
        assert!(cache.get("0xabc").is_some());

        assert_eq!(cache.evict(at(30 * 60)), 1);
        assert!(cache.get("0xabc").is_none());
    }

    #[test]
    fn test_evict_keeps_fresh_entries() {
        let cache = DedupCache::new(TimeDelta::minutes(30));
        cache.insert("0xold", at(0));
        cache.insert("0xnew", at(29 * 60));

        assert_eq!(cache.evict(at(31 * 60)), 1);
        assert!(cache.get("0xnew").is_some());
        assert!(cache.get("0xold").is_none());
    }
}
