//! Integration tests for the persistent cold tier
//!
//! Uses real SQLite index files in temporary directories.

mod helpers;

use bytes::Bytes;
use chunkflow_common::config::CacheConfig;
use chunkflow_common::{CacheKey, EnhancementPreset, Priority, StreamEvent, Tier};
use chunkflow_engine::{ColdStore, Preload, StreamCoordinator, TieredCache, TrackEpochs};
use helpers::{next_event, test_config, FakeEnhancer, FakeSource};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn key(track: Uuid, chunk: u32) -> CacheKey {
    CacheKey::new(track, chunk, &EnhancementPreset::flat())
}

async fn cache_with_store(dir: &TempDir) -> TieredCache {
    let store = ColdStore::open(dir.path()).await.unwrap();
    TieredCache::new(&CacheConfig::default()).with_store(store)
}

#[tokio::test]
async fn test_cold_entries_survive_restart_and_promote() {
    let dir = TempDir::new().unwrap();
    let track = Uuid::new_v4();
    let payload = Bytes::from_static(b"expensive enhancement result");

    {
        let cache = cache_with_store(&dir).await;
        cache.put(key(track, 12), payload.clone(), Tier::Cold).await;
    }

    let cache = cache_with_store(&dir).await;
    assert_eq!(cache.tier_len(Tier::Cold).await, 0);
    assert_eq!(cache.peek_tier(&key(track, 12)).await, Some(Tier::Cold));

    let hit = cache.get(&key(track, 12)).await.unwrap();
    assert_eq!(hit.tier, Tier::Cold);
    assert_eq!(hit.entry.payload, payload);

    // Durable hit populated L3 and promoted through L2 to L1
    assert_eq!(cache.tier_len(Tier::Cold).await, 1);
    assert_eq!(cache.tier_len(Tier::Warm).await, 1);
    assert_eq!(cache.tier_len(Tier::Hot).await, 1);
}

#[tokio::test]
async fn test_invalidate_removes_durable_rows() {
    let dir = TempDir::new().unwrap();
    let track = Uuid::new_v4();
    let other = Uuid::new_v4();
    let cache = cache_with_store(&dir).await;

    cache.put(key(track, 0), Bytes::from_static(b"a"), Tier::Cold).await;
    cache.put(key(track, 1), Bytes::from_static(b"b"), Tier::Cold).await;
    cache.put(key(other, 0), Bytes::from_static(b"c"), Tier::Cold).await;

    cache.invalidate(track, &TrackEpochs::new()).await;

    let reopened = cache_with_store(&dir).await;
    assert!(reopened.get(&key(track, 0)).await.is_none());
    assert!(reopened.get(&key(track, 1)).await.is_none());
    assert!(reopened.get(&key(other, 0)).await.is_some());
}

#[tokio::test]
async fn test_missing_payload_file_is_a_miss() {
    let dir = TempDir::new().unwrap();
    let track = Uuid::new_v4();
    let store = ColdStore::open(dir.path()).await.unwrap();
    let payload_path = store.payload_path(&key(track, 3));
    store
        .store(&key(track, 3), &Bytes::from_static(b"gone soon"))
        .await
        .unwrap();

    std::fs::remove_file(&payload_path).unwrap();

    let cache = TieredCache::new(&CacheConfig::default()).with_store(store);
    assert!(cache.get(&key(track, 3)).await.is_none());
    assert_eq!(cache.stats().misses(), 1);
}

#[tokio::test]
async fn test_second_session_reuses_rendered_chunks() {
    let dir = TempDir::new().unwrap();
    let track = Uuid::new_v4();

    let first_source = Arc::new(FakeSource::new());
    {
        let coord = StreamCoordinator::with_cold_store(
            test_config(),
            first_source.clone(),
            Arc::new(FakeEnhancer::default()),
            ColdStore::open(dir.path()).await.unwrap(),
        );
        coord.set_track(track, 10).await;
        let mut events = coord.subscribe();
        coord.start().await;

        coord.preload(track, 7, Priority::BACKGROUND).await;
        next_event(&mut events, |e| matches!(e, StreamEvent::ChunkReady { chunk_index: 7, .. })).await;
        coord.shutdown().await;
    }
    assert_eq!(first_source.fetch_count(7), 1);

    let second_source = Arc::new(FakeSource::new());
    let coord = StreamCoordinator::with_cold_store(
        test_config(),
        second_source.clone(),
        Arc::new(FakeEnhancer::default()),
        ColdStore::open(dir.path()).await.unwrap(),
    );
    coord.set_track(track, 10).await;

    assert_eq!(
        coord.preload(track, 7, Priority::BACKGROUND).await,
        Preload::Resident(Tier::Cold)
    );
    assert!(coord.read_chunk(track, 7, &EnhancementPreset::flat()).await.is_some());
    assert_eq!(second_source.total_fetches(), 0);
}

#[tokio::test]
async fn test_deleted_track_is_not_repopulated_by_queued_work() {
    let dir = TempDir::new().unwrap();
    let track = Uuid::new_v4();
    let source = Arc::new(FakeSource::new());
    let coord = StreamCoordinator::with_cold_store(
        test_config(),
        source.clone(),
        Arc::new(FakeEnhancer::default()),
        ColdStore::open(dir.path()).await.unwrap(),
    );
    coord.set_track(track, 10).await;
    coord.start().await;

    coord.preload(track, 1, Priority::BACKGROUND).await;
    coord.on_track_deleted(track).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let flat = EnhancementPreset::flat();
    assert!(!coord.is_ready(track, 1, &flat).await);
    assert!(source.fetch_count(1) <= 1);
    coord.shutdown().await;

    let reopened = cache_with_store(&dir).await;
    assert!(reopened.get(&key(track, 1)).await.is_none());
}
