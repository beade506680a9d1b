//! TTL-windowed alert deduplication

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::DedupConfig;

/// Suppresses repeat emission of the same dedup key within a TTL.
///
/// Safe to share between polling tasks. Expired keys are removed by
/// [`sweep`](Self::sweep), which also runs whenever the map grows past
/// `max_entries`. If live keys alone exceed the bound, the oldest are evicted
/// down to 90% of it, so the forced sweep runs at most once per tenth of the
/// bound in new keys.
pub struct AlertDeduplicator {
    ttl: Duration,
    max_entries: usize,
    seen: DashMap<String, Instant>,
}

impl AlertDeduplicator {
    /// Create a deduplicator
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            seen: DashMap::new(),
        }
    }

    /// Create a deduplicator from settings
    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.ttl(), config.max_entries)
    }

    /// Suppression window
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether an alert with `key` should go out now. Records the emission
    /// when it returns `true`.
    pub fn should_emit(&self, key: &str) -> bool {
        self.should_emit_at(key, Instant::now())
    }

    /// [`should_emit`](Self::should_emit) against an explicit clock reading
    pub fn should_emit_at(&self, key: &str, now: Instant) -> bool {
        let emit = match self.seen.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.saturating_duration_since(*entry.get()) > self.ttl {
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        };

        if emit && self.max_entries > 0 && self.seen.len() > self.max_entries {
            self.sweep_at(now);
            self.evict_oldest();
        }
        emit
    }

    fn evict_oldest(&self) -> usize {
        if self.seen.len() <= self.max_entries {
            return 0;
        }

        let keep = self.max_entries - self.max_entries / 10;
        let mut entries: Vec<(String, Instant)> = self
            .seen
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        entries.sort_unstable_by_key(|(_, last)| *last);

        let excess = entries.len().saturating_sub(keep);
        let mut evicted = 0;
        for (key, last) in entries.into_iter().take(excess) {
            if self.seen.remove_if(&key, |_, current| *current == last).is_some() {
                evicted += 1;
            }
        }

        warn!(
            evicted,
            max_entries = self.max_entries,
            "Dedup keys over capacity, evicted oldest"
        );
        evicted
    }

    /// Forget a key so the next emission goes out
    pub fn forget(&self, key: &str) {
        self.seen.remove(key);
    }

    /// Forget every key starting with `prefix`
    pub fn forget_prefix(&self, prefix: &str) {
        self.seen.retain(|key, _| !key.starts_with(prefix));
    }

    /// Remove expired keys; returns how many were removed
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) against an explicit clock reading
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, last| now.saturating_duration_since(*last) <= self.ttl);
        let removed = before.saturating_sub(self.seen.len());
        if removed > 0 {
            debug!(removed, remaining = self.seen.len(), "Swept expired dedup keys");
        }
        removed
    }

    /// Keys currently tracked
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no keys are tracked
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for AlertDeduplicator {
    fn default() -> Self {
        Self::from_config(&DedupConfig::default())
    }
}
