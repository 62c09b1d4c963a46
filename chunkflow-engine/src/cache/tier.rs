//! One capacity-bounded cache pool
//!
//! Least-recently-used eviction bounded by both entry count and resident
//! bytes. All mutation (including recency updates on `get`) happens under
//! the pool's own lock, so concurrent worker completions can't corrupt the
//! byte accounting or the recency order.

use bytes::Bytes;
use chunkflow_common::{CacheKey, Tier, TrackId};
use lru::LruCache;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A computed chunk rendering resident in one tier
///
/// Immutable once written; promotion writes a new entry into the faster tier.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Bytes,
    pub tier: Tier,
    pub size_bytes: usize,
    /// When this entry was written into its tier
    pub last_accessed: Instant,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: Bytes, tier: Tier) -> Self {
        let size_bytes = payload.len();
        Self {
            key,
            payload,
            tier,
            size_bytes,
            last_accessed: Instant::now(),
        }
    }

    /// Copy of this entry for another tier (payload buffer is shared)
    pub fn for_tier(&self, tier: Tier) -> Self {
        Self::new(self.key.clone(), self.payload.clone(), tier)
    }
}

struct TierState {
    entries: LruCache<CacheKey, Arc<CacheEntry>>,
    bytes: usize,
}

/// Capacity-bounded LRU pool for one tier
pub struct TierPool {
    tier: Tier,
    max_entries: usize,
    max_bytes: usize,
    state: Mutex<TierState>,
}

impl TierPool {
    pub fn new(tier: Tier, max_entries: usize, max_bytes: usize) -> Self {
        Self {
            tier,
            max_entries: max_entries.max(1),
            max_bytes: max_bytes.max(1),
            state: Mutex::new(TierState {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Look up and mark as most recently used
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let mut state = self.state.lock().await;
        state.entries.get(key).cloned()
    }

    /// Look up without touching recency
    pub async fn peek(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let state = self.state.lock().await;
        state.entries.peek(key).cloned()
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().await.entries.contains(key)
    }

    /// Insert (or replace) an entry, evicting the coldest entries while over
    /// either bound. The inserted entry itself is never evicted by its own
    /// insertion, even if it alone exceeds the byte budget.
    ///
    /// Returns the evicted entries.
    pub async fn insert(&self, entry: Arc<CacheEntry>) -> Vec<Arc<CacheEntry>> {
        let mut state = self.state.lock().await;

        let size = entry.size_bytes;
        if let Some(replaced) = state.entries.put(entry.key.clone(), entry) {
            state.bytes -= replaced.size_bytes;
        }
        state.bytes += size;

        let mut evicted = Vec::new();
        while state.entries.len() > 1
            && (state.entries.len() > self.max_entries || state.bytes > self.max_bytes)
        {
            match state.entries.pop_lru() {
                Some((_, old)) => {
                    state.bytes -= old.size_bytes;
                    evicted.push(old);
                }
                None => break,
            }
        }
        evicted
    }

    pub async fn remove(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let mut state = self.state.lock().await;
        let removed = state.entries.pop(key)?;
        state.bytes -= removed.size_bytes;
        Some(removed)
    }

    /// Remove every entry belonging to a track
    pub async fn remove_track(&self, track_id: TrackId) -> usize {
        let mut state = self.state.lock().await;
        let keys: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(k, _)| k.track_id == track_id)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &keys {
            if let Some(removed) = state.entries.pop(key) {
                state.bytes -= removed.size_bytes;
            }
        }
        keys.len()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resident payload bytes
    pub async fn bytes(&self) -> usize {
        self.state.lock().await.bytes
    }
}
