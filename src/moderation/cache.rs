use std::num::NonZeroUsize;

use lru::LruCache;

use super::backend::ImageAudit;

/// Maximum number of remembered image verdicts.
pub const VERDICT_CACHE_CAPACITY: usize = 300;

/// Bounded hash -> verdict map with first-in-first-out eviction.
///
/// Lookups use `peek`, so reading an entry never refreshes its position and
/// the oldest inserted hash is always the next one evicted.
pub struct VerdictCache {
    entries: LruCache<String, ImageAudit>,
}

impl VerdictCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn get(&self, hash: &str) -> Option<&ImageAudit> {
        self.entries.peek(hash)
    }

    /// Insert a verdict for a hash not seen before. Existing entries are kept
    /// as-is so a re-audit never changes eviction order.
    pub fn insert(&mut self, hash: String, verdict: ImageAudit) {
        if self.entries.contains(&hash) {
            return;
        }
        if let Some((evicted, _)) = self.entries.push(hash, verdict) {
            tracing::debug!("Verdict cache full, evicted {}", evicted);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for VerdictCache {
    fn default() -> Self {
        Self::new(VERDICT_CACHE_CAPACITY)
    }
}
