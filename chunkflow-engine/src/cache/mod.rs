//! Multi-tier cache of computed chunk payloads
//!
//! Three ordered pools: hot (L1), warm (L2), cold (L3). Lookups walk
//! L1 → L2 → L3 and promote hits toward L1; the cold tier can be backed by a
//! persistent [`ColdStore`] consulted after an in-memory L3 miss.
//!
//! Each pool has its own lock. Multi-tier operations (promotion, track
//! invalidation) additionally coordinate through a sweep lock so an
//! invalidation can't interleave with a promotion and resurrect a dropped
//! entry. The same lock orders worker writes against epoch bumps.

pub mod cold_store;
pub mod stats;
pub mod tier;

pub use cold_store::{ColdStore, StoredChunk};
pub use stats::{CacheStats, CacheStatsSnapshot, TierSnapshot};
pub use tier::{CacheEntry, TierPool};

use crate::epoch::TrackEpochs;
use crate::error::Result;
use bytes::Bytes;
use chunkflow_common::config::CacheConfig;
use chunkflow_common::{CacheKey, PriorityClass, Tier, TrackId};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Result of a successful lookup
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// The entry as now resident in L1
    pub entry: Arc<CacheEntry>,
    /// Tier the lookup was satisfied from
    pub tier: Tier,
}

/// Tier a freshly computed payload is written into, by request urgency
pub fn target_tier(class: PriorityClass) -> Tier {
    match class {
        PriorityClass::Critical | PriorityClass::High => Tier::Hot,
        PriorityClass::Normal | PriorityClass::Background => Tier::Warm,
    }
}

/// Hot/warm/cold cache with promotion on hit
pub struct TieredCache {
    hot: TierPool,
    warm: TierPool,
    cold: TierPool,
    store: Option<ColdStore>,
    stats: CacheStats,
    /// Held shared by get/put, exclusively by invalidate
    sweep: RwLock<()>,
}

impl TieredCache {
    /// Memory-only cache sized from configuration
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            hot: TierPool::new(Tier::Hot, config.hot_entries, config.hot_max_bytes),
            warm: TierPool::new(Tier::Warm, config.warm_entries, config.warm_max_bytes),
            cold: TierPool::new(Tier::Cold, config.cold_entries, config.cold_max_bytes),
            store: None,
            stats: CacheStats::new(),
            sweep: RwLock::new(()),
        }
    }

    /// Cache with the persistent cold store opened if `cold_store_dir` is set
    pub async fn open(config: &CacheConfig) -> Result<Self> {
        let cache = Self::new(config);
        match &config.cold_store_dir {
            Some(dir) => Ok(cache.with_store(ColdStore::open(dir).await?)),
            None => Ok(cache),
        }
    }

    /// Attach a persistent store behind the cold tier
    pub fn with_store(mut self, store: ColdStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    fn pool(&self, tier: Tier) -> &TierPool {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }

    /// Look up a key, promoting hits toward L1
    ///
    /// L2 hits are copied into L1; L3 hits (memory or durable) into L2 and L1.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheHit> {
        let _sweep = self.sweep.read().await;

        if let Some(entry) = self.hot.get(key).await {
            self.stats.record_hit(Tier::Hot);
            return Some(CacheHit {
                entry,
                tier: Tier::Hot,
            });
        }

        if let Some(entry) = self.warm.get(key).await {
            self.stats.record_hit(Tier::Warm);
            let promoted = self.promote(&entry, &[Tier::Hot]).await;
            return Some(CacheHit {
                entry: promoted,
                tier: Tier::Warm,
            });
        }

        let cold_entry = match self.cold.get(key).await {
            Some(entry) => Some(entry),
            None => self.load_from_store(key).await,
        };

        match cold_entry {
            Some(entry) => {
                self.stats.record_hit(Tier::Cold);
                let promoted = self.promote(&entry, &[Tier::Warm, Tier::Hot]).await;
                Some(CacheHit {
                    entry: promoted,
                    tier: Tier::Cold,
                })
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Fastest tier holding `key`, without promotion or recency update
    ///
    /// Consults the durable index after an in-memory miss.
    pub async fn peek_tier(&self, key: &CacheKey) -> Option<Tier> {
        for tier in Tier::ALL {
            if self.pool(tier).contains(key).await {
                return Some(tier);
            }
        }

        match &self.store {
            Some(store) => match store.contains(key).await {
                Ok(true) => Some(Tier::Cold),
                Ok(false) => None,
                Err(e) => {
                    warn!("Cold store lookup failed for {}: {}", key, e);
                    None
                }
            },
            None => None,
        }
    }

    /// True if any in-memory tier holds `key`
    pub async fn contains(&self, key: &CacheKey) -> bool {
        for tier in Tier::ALL {
            if self.pool(tier).contains(key).await {
                return true;
            }
        }
        false
    }

    /// Insert a payload into one tier, evicting that tier's coldest entries
    /// if over capacity. Cold writes go through to the persistent store.
    pub async fn put(&self, key: CacheKey, payload: Bytes, tier: Tier) -> Arc<CacheEntry> {
        let _sweep = self.sweep.read().await;
        self.write_tier(key, payload, tier).await
    }

    /// Write a finished rendering into each of `tiers`, but only if `epoch`
    /// is still the track's current epoch
    ///
    /// The check and the writes happen under the sweep lock, which
    /// [`invalidate`](Self::invalidate) holds exclusively while it bumps the
    /// epoch, so a stale result can never land after the invalidation.
    /// Returns the entry written to the first tier, or `None` if stale.
    pub async fn put_current(
        &self,
        key: CacheKey,
        payload: Bytes,
        tiers: &[Tier],
        epochs: &TrackEpochs,
        epoch: u64,
    ) -> Option<Arc<CacheEntry>> {
        let _sweep = self.sweep.read().await;

        if !epochs.is_current(key.track_id, epoch).await {
            return None;
        }

        let mut first = None;
        for tier in tiers {
            let entry = self.write_tier(key.clone(), payload.clone(), *tier).await;
            first.get_or_insert(entry);
        }
        first
    }

    /// Retire a track's current version: bump its epoch and remove every
    /// entry for it from all tiers and the durable store
    ///
    /// Returns the new epoch and the number of in-memory entries plus
    /// durable rows removed.
    pub async fn invalidate(&self, track_id: TrackId, epochs: &TrackEpochs) -> (u64, usize) {
        let _sweep = self.sweep.write().await;
        let epoch = epochs.bump(track_id).await;

        let mut removed = 0;
        for tier in Tier::ALL {
            removed += self.pool(tier).remove_track(track_id).await;
        }
        if let Some(store) = &self.store {
            match store.remove_track(track_id).await {
                Ok(rows) => removed += rows,
                Err(e) => warn!("Cold store invalidation failed for track {}: {}", track_id, e),
            }
        }

        debug!(
            "Invalidated {} cached entries for track {} (now epoch {})",
            removed, track_id, epoch
        );
        (epoch, removed)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub async fn snapshot(&self) -> CacheStatsSnapshot {
        let mut tiers = Vec::with_capacity(3);
        for tier in Tier::ALL {
            let pool = self.pool(tier);
            tiers.push(TierSnapshot {
                tier,
                entries: pool.len().await,
                bytes: pool.bytes().await,
                hits: self.stats.hits(tier),
                evictions: self.stats.evictions(tier),
            });
        }

        CacheStatsSnapshot {
            tiers,
            misses: self.stats.misses(),
            promotions: self.stats.promotions(),
            hit_rate: self.stats.hit_rate(),
        }
    }

    /// Resident entries in one tier
    pub async fn tier_len(&self, tier: Tier) -> usize {
        self.pool(tier).len().await
    }

    /// Caller holds the sweep lock
    async fn write_tier(&self, key: CacheKey, payload: Bytes, tier: Tier) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry::new(key, payload, tier));
        self.insert_into(tier, Arc::clone(&entry)).await;

        if tier == Tier::Cold {
            if let Some(store) = &self.store {
                if let Err(e) = store.store(&entry.key, &entry.payload).await {
                    warn!("Cold store write failed for {}, keeping memory copy only: {}", entry.key, e);
                }
            }
        }

        entry
    }

    async fn insert_into(&self, tier: Tier, entry: Arc<CacheEntry>) {
        let evicted = self.pool(tier).insert(entry).await;
        self.stats.record_evictions(tier, evicted.len());
    }

    /// Copy `entry` into each faster tier; returns the L1 copy
    async fn promote(&self, entry: &Arc<CacheEntry>, tiers: &[Tier]) -> Arc<CacheEntry> {
        let mut latest = Arc::clone(entry);
        for tier in tiers {
            latest = Arc::new(entry.for_tier(*tier));
            self.insert_into(*tier, Arc::clone(&latest)).await;
        }
        self.stats.record_promotion();
        latest
    }

    async fn load_from_store(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let store = self.store.as_ref()?;
        match store.load(key).await {
            Ok(Some(stored)) => {
                let entry = Arc::new(CacheEntry::new(key.clone(), stored.payload, Tier::Cold));
                self.insert_into(Tier::Cold, Arc::clone(&entry)).await;
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Cold store read failed for {}, treating as miss: {}", key, e);
                None
            }
        }
    }
}
