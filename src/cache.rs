//! Local IP address to host-group tag cache.
//!
//! The cache exists to suppress redundant console writes: a binding that
//! matches what we already believe costs zero remote calls. Eviction is
//! confirm-to-refresh — an entry ages from its `last_confirmed` stamp and is
//! surfaced by `sweep` once the identity source stops re-asserting it.
use std::collections::HashMap;

use chrono::Utc;

/// One cached binding. `last_confirmed` is epoch seconds and only moves
/// forward; it is the basis for staleness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub tag_id: String,
    pub last_confirmed: i64,
}

/// Mapping of IP address to its last-accepted tag. One entry per IP, always.
/// Single-writer; the subscribe loop owns it.
#[derive(Clone, Debug)]
pub struct IpTagCache {
    entries: HashMap<String, CacheEntry>,
    last_sweep: i64,
}

impl Default for IpTagCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IpTagCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            // no sweep until a full interval has elapsed from startup
            last_sweep: Utc::now().timestamp(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tag currently cached for `ip`, if any.
    pub fn lookup(&self, ip: &str) -> Option<String> {
        self.entries.get(ip).map(|entry| entry.tag_id.clone())
    }

    /// Insert or replace the tag for `ip`.
    ///
    /// Returns the displaced tag id only when the IP moved between tags; a
    /// fresh insert and a same-tag upsert both return `None`. A same-tag
    /// upsert does not refresh `last_confirmed` — only `confirm` does that,
    /// so folding an authoritative range list in does not count as the
    /// source re-asserting the binding.
    pub fn upsert(&mut self, ip: &str, tag_id: &str) -> Option<String> {
        match self.entries.get(ip) {
            Some(entry) if entry.tag_id == tag_id => None,
            Some(entry) => {
                let previous = entry.tag_id.clone();
                self.entries.insert(
                    ip.to_string(),
                    CacheEntry {
                        tag_id: tag_id.to_string(),
                        last_confirmed: Utc::now().timestamp(),
                    },
                );
                Some(previous)
            }
            None => {
                self.entries.insert(
                    ip.to_string(),
                    CacheEntry {
                        tag_id: tag_id.to_string(),
                        last_confirmed: Utc::now().timestamp(),
                    },
                );
                None
            }
        }
    }

    /// Refresh `last_confirmed` for a present entry, returning the new stamp.
    /// `None` means the entry is absent and must be (re)established with
    /// `upsert` instead.
    pub fn confirm(&mut self, ip: &str) -> Option<i64> {
        let entry = self.entries.get_mut(ip)?;
        let now = Utc::now().timestamp();
        entry.last_confirmed = entry.last_confirmed.max(now);
        Some(entry.last_confirmed)
    }

    /// Idempotent removal.
    pub fn delete(&mut self, ip: &str) {
        self.entries.remove(ip);
    }

    pub fn last_confirmed(&self, ip: &str) -> Option<i64> {
        self.entries.get(ip).map(|entry| entry.last_confirmed)
    }

    /// Fold an authoritative range list into the cache: every IP the console
    /// says belongs to `tag_id` is upserted.
    pub fn sync_from_tag(&mut self, tag_id: &str, ips: &[String]) {
        for ip in ips {
            self.upsert(ip, tag_id);
        }
    }

    /// Scan for entries whose confirmation is older than `stale_after`
    /// seconds. A no-op (empty result) unless `min_sweep_interval` seconds
    /// have elapsed since the previous sweep. Deletion is the caller's
    /// responsibility after acting on the result.
    pub fn sweep(&mut self, stale_after: i64, min_sweep_interval: i64) -> Vec<String> {
        let now = Utc::now().timestamp();
        if now - self.last_sweep <= min_sweep_interval {
            return Vec::new();
        }
        self.last_sweep = now;
        self.entries
            .iter()
            .filter(|(_, entry)| now - entry.last_confirmed > stale_after)
            .map(|(ip, _)| ip.clone())
            .collect()
    }
}
