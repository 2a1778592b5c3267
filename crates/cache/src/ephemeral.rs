//! Ephemeral resource URL cache.
//!
//! Maps `(tab, resource id)` to a URL that was observed passing through the
//! page, typically one carrying a time-limited signature. The layer never
//! builds these URLs itself. Pruning happens on `record` only, so lookups
//! stay cheap; lookups still refuse to return an expired entry.

use std::collections::HashMap;
use std::time::Duration;

use resilink_config::UrlCacheConfig;
use resilink_core::context::TabId;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct UrlEntry {
    url: String,
    created_at: Instant,
    /// Insertion order; breaks ties between equal timestamps
    seq: u64,
}

/// Bounded, TTL'd cache of captured resource URLs.
pub struct EphemeralUrlCache {
    entries: HashMap<(TabId, String), UrlEntry>,
    ttl: Duration,
    max_entries: usize,
    next_seq: u64,
}

impl EphemeralUrlCache {
    pub fn new(config: &UrlCacheConfig) -> Self {
        Self::with_limits(config.ttl(), config.max_entries)
    }

    pub fn with_limits(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries,
            next_seq: 0,
        }
    }

    /// Store or overwrite the URL for `(tab, resource_id)`, then prune.
    pub fn record(&mut self, tab: TabId, resource_id: &str, url: impl Into<String>) {
        self.next_seq += 1;
        let entry = UrlEntry {
            url: url.into(),
            created_at: Instant::now(),
            seq: self.next_seq,
        };
        self.entries.insert((tab, resource_id.to_string()), entry);
        debug!(tab_id = %tab, resource_id, "Resource URL recorded");
        self.prune();
    }

    /// Most recent URL for `(tab, resource_id)` unless it has expired.
    pub fn lookup(&self, tab: TabId, resource_id: &str) -> Option<&str> {
        let now = Instant::now();
        self.entries
            .get(&(tab, resource_id.to_string()))
            .filter(|e| now.duration_since(e.created_at) <= self.ttl)
            .map(|e| e.url.as_str())
    }

    /// Drop every entry belonging to `tab`. Returns how many were dropped.
    pub fn invalidate_tab(&mut self, tab: TabId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(t, _), _| *t != tab);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(tab_id = %tab, dropped, "Resource URLs invalidated");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.duration_since(e.created_at) <= ttl);

        if self.entries.len() > self.max_entries {
            let mut by_age: Vec<((TabId, String), Instant, u64)> = self
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.created_at, e.seq))
                .collect();
            by_age.sort_by_key(|(_, created_at, seq)| (*created_at, *seq));

            let excess = self.entries.len() - self.max_entries;
            for (key, _, _) in by_age.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }
    }
}

impl Default for EphemeralUrlCache {
    fn default() -> Self {
        Self::new(&UrlCacheConfig::default())
    }
}
