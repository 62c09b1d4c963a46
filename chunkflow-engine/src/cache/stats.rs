//! Cache statistics for monitoring hit rates and tier churn

use chunkflow_common::Tier;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

fn tier_slot(tier: Tier) -> usize {
    match tier {
        Tier::Hot => 0,
        Tier::Warm => 1,
        Tier::Cold => 2,
    }
}

/// Lock-free counters shared by all tiers
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: [AtomicU64; 3],
    misses: AtomicU64,
    promotions: AtomicU64,
    evictions: [AtomicU64; 3],
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: Tier) {
        self.hits[tier_slot(tier)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, tier: Tier, count: usize) {
        if count > 0 {
            self.evictions[tier_slot(tier)].fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn hits(&self, tier: Tier) -> u64 {
        self.hits[tier_slot(tier)].load(Ordering::Relaxed)
    }

    pub fn total_hits(&self) -> u64 {
        Tier::ALL.iter().map(|t| self.hits(*t)).sum()
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn evictions(&self, tier: Tier) -> u64 {
        self.evictions[tier_slot(tier)].load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.total_hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Point-in-time view of one tier
#[derive(Debug, Clone, Serialize)]
pub struct TierSnapshot {
    pub tier: Tier,
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub evictions: u64,
}

/// Point-in-time view of the whole cache
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub tiers: Vec<TierSnapshot>,
    pub misses: u64,
    pub promotions: u64,
    pub hit_rate: f64,
}
