//! Test helpers for chunkflow-engine integration tests
//!
//! In-memory collaborators with scripted per-chunk behaviour and call
//! counters.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chunkflow_common::config::StreamConfig;
use chunkflow_common::{ChunkIndex, EnhancementPreset, TrackId};
use chunkflow_engine::ChunkError;
use chunkflow_engine::{ChunkSource, Enhancer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted behaviour for one chunk
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Succeed after a delay
    Ok(Duration),
    NotFound,
    Denied,
    /// DecodeFailure on the first fetch, success afterwards
    FailOnce,
    /// Never return
    Hang,
}

/// Chunk source returning `[chunk_index as u8; 32]` unless scripted otherwise
#[derive(Default)]
pub struct FakeSource {
    behaviors: Mutex<HashMap<ChunkIndex, Behavior>>,
    default_delay: Mutex<Duration>,
    fetches: Mutex<HashMap<ChunkIndex, usize>>,
    order: Mutex<Vec<ChunkIndex>>,
    total: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        let source = Self::default();
        *source.default_delay.lock().unwrap() = delay;
        source
    }

    pub fn script(&self, chunk: ChunkIndex, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(chunk, behavior);
    }

    pub fn fetch_count(&self, chunk: ChunkIndex) -> usize {
        self.fetches.lock().unwrap().get(&chunk).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Chunks in the order their fetches started
    pub fn fetch_order(&self) -> Vec<ChunkIndex> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkSource for FakeSource {
    async fn fetch(&self, _track_id: TrackId, chunk_index: ChunkIndex) -> Result<Bytes, ChunkError> {
        let attempt = {
            let mut fetches = self.fetches.lock().unwrap();
            let count = fetches.entry(chunk_index).or_insert(0);
            *count += 1;
            *count
        };
        self.order.lock().unwrap().push(chunk_index);
        self.total.fetch_add(1, Ordering::SeqCst);

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&chunk_index)
            .cloned()
            .unwrap_or_else(|| Behavior::Ok(*self.default_delay.lock().unwrap()));

        match behavior {
            Behavior::Ok(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(Bytes::from(vec![chunk_index as u8; 32]))
            }
            Behavior::NotFound => Err(ChunkError::SourceNotFound),
            Behavior::Denied => Err(ChunkError::PermissionDenied),
            Behavior::FailOnce if attempt == 1 => {
                Err(ChunkError::DecodeFailure("corrupt frame header".to_string()))
            }
            Behavior::FailOnce => Ok(Bytes::from(vec![chunk_index as u8; 32])),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Enhancer that appends the intensity percent, so renderings under
/// different presets differ
#[derive(Default)]
pub struct FakeEnhancer {
    calls: AtomicUsize,
}

impl FakeEnhancer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Enhancer for FakeEnhancer {
    async fn enhance(&self, raw: Bytes, preset: &EnhancementPreset) -> Result<Bytes, ChunkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = raw.to_vec();
        out.push(preset.intensity.percent());
        Ok(Bytes::from(out))
    }
}

/// Config with short seek waits suitable for paused-clock tests
pub fn test_config() -> StreamConfig {
    let mut config = StreamConfig::default();
    config.worker.pool_size = 2;
    config.coordinator.seek_wait_timeout_ms = 3000;
    config.coordinator.ready_check_interval_ms = 10;
    config
}

/// Expected payload for a chunk rendered by `FakeEnhancer`
pub fn rendered(chunk: ChunkIndex, preset: &EnhancementPreset) -> Bytes {
    let mut out = vec![chunk as u8; 32];
    out.push(preset.intensity.percent());
    Bytes::from(out)
}

/// Next event matching `pred`, panicking if none arrives within 30s
/// (virtual time under a paused clock)
pub async fn next_event<F>(
    events: &mut tokio::sync::broadcast::Receiver<chunkflow_common::StreamEvent>,
    mut pred: F,
) -> chunkflow_common::StreamEvent
where
    F: FnMut(&chunkflow_common::StreamEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {}", e),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .expect("timed out waiting for event")
}
