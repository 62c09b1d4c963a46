//! Stream coordinator
//!
//! Per-session façade composing the queue, cache, gate, worker pool and
//! track epochs. The player layer drives it with position updates, seeks,
//! preset changes and track lifecycle notifications; it answers readiness
//! queries and publishes [`StreamEvent`]s on a broadcast channel.
//!
//! A single consumer task drains the queue: it reserves a worker slot,
//! dequeues the most urgent request and hands it to the pool. It idles on
//! an empty queue until the next enqueue wakes it. Task failures are
//! reported as events and never stop the loop.

use crate::cache::{CacheEntry, CacheStatsSnapshot, ColdStore, TieredCache};
use crate::epoch::TrackEpochs;
use crate::error::{Error, Result};
use crate::gate::{InteractionGate, PositionUpdate, ThrottleDecision};
use crate::queue::{EnqueueOutcome, PriorityQueue};
use crate::worker::{ChunkSource, Enhancer, TaskOutcome, WorkerPool};
use bytes::Bytes;
use chunkflow_common::{
    CacheKey, CacheLookup, ChunkIndex, EnhancementPreset, Priority, StreamConfig, StreamEvent,
    Tier, TrackId,
};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Result of [`StreamCoordinator::preload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preload {
    /// Already cached; nothing queued
    Resident(Tier),
    Queued(EnqueueOutcome),
}

/// Result of [`StreamCoordinator::switch_enhancement_preset`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetSwitch {
    /// The preset took effect and this many chunks were queued under it
    Applied { rekeyed: usize },
    /// A later change arrived within the quiet window
    Superseded,
}

/// Queue and cache counters
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub pending: usize,
    pub in_flight: usize,
    pub cache: CacheStatsSnapshot,
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    track_id: Option<TrackId>,
    total_chunks: u32,
    current_chunk: ChunkIndex,
    preset: EnhancementPreset,
}

struct Inner {
    config: StreamConfig,
    queue: Mutex<PriorityQueue>,
    cache: Arc<TieredCache>,
    workers: WorkerPool,
    gate: InteractionGate,
    epochs: Arc<TrackEpochs>,
    events: broadcast::Sender<StreamEvent>,
    /// Signalled on every enqueue and on shutdown
    wake: Notify,
    stopping: AtomicBool,
    session: RwLock<SessionState>,
}

impl Inner {
    fn broadcast_event(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    /// Enqueue stamped with the track's current epoch
    ///
    /// Callers hold the queue lock, which `invalidate_track` also holds
    /// across the epoch bump, so a request is either dropped by the
    /// invalidation or stamped with the new epoch.
    async fn enqueue(&self, queue: &mut PriorityQueue, key: CacheKey, priority: Priority) -> EnqueueOutcome {
        let epoch = self.epochs.current(key.track_id).await;
        queue.enqueue(key, priority, epoch)
    }
}

/// Chunk loading coordinator for one player session
pub struct StreamCoordinator {
    inner: Arc<Inner>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl StreamCoordinator {
    /// Coordinator with a memory-only cache
    pub fn new(
        config: StreamConfig,
        source: Arc<dyn ChunkSource>,
        enhancer: Arc<dyn Enhancer>,
    ) -> Self {
        let cache = TieredCache::new(&config.cache);
        Self::build(config, source, enhancer, cache)
    }

    /// Coordinator whose cold tier is backed by `store`
    pub fn with_cold_store(
        config: StreamConfig,
        source: Arc<dyn ChunkSource>,
        enhancer: Arc<dyn Enhancer>,
        store: ColdStore,
    ) -> Self {
        let cache = TieredCache::new(&config.cache).with_store(store);
        Self::build(config, source, enhancer, cache)
    }

    /// Validate `config` and open the persistent cold tier if configured
    pub async fn open(
        config: StreamConfig,
        source: Arc<dyn ChunkSource>,
        enhancer: Arc<dyn Enhancer>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = TieredCache::open(&config.cache).await?;
        Ok(Self::build(config, source, enhancer, cache))
    }

    fn build(
        config: StreamConfig,
        source: Arc<dyn ChunkSource>,
        enhancer: Arc<dyn Enhancer>,
        cache: TieredCache,
    ) -> Self {
        let (events, _) = broadcast::channel(config.coordinator.event_capacity.max(1));
        let cache = Arc::new(cache);
        let epochs = Arc::new(TrackEpochs::new());
        let workers = WorkerPool::new(
            config.worker.clone(),
            source,
            enhancer,
            Arc::clone(&cache),
            Arc::clone(&epochs),
            events.clone(),
        );

        let inner = Inner {
            gate: InteractionGate::new(config.gate.clone()),
            config,
            queue: Mutex::new(PriorityQueue::new()),
            cache,
            workers,
            epochs,
            events,
            wake: Notify::new(),
            stopping: AtomicBool::new(false),
            session: RwLock::new(SessionState::default()),
        };

        Self {
            inner: Arc::new(inner),
            consumer: Mutex::new(None),
        }
    }

    /// Spawn the queue consumer (no-op if already running)
    pub async fn start(&self) {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return;
        }
        self.inner.stopping.store(false, Ordering::SeqCst);
        *consumer = Some(tokio::spawn(consume(Arc::clone(&self.inner))));
        info!(
            "Stream coordinator started ({} worker slots)",
            self.inner.config.worker.pool_size
        );
    }

    /// Stop the consumer and refuse further work
    ///
    /// Tasks already running finish and populate the cache normally.
    pub async fn shutdown(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.workers.close();
        self.inner.wake.notify_one();

        let handle = self.consumer.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Queue consumer ended abnormally: {}", e);
            }
        }
        info!("Stream coordinator stopped");
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.events.subscribe()
    }

    /// Make `track_id` the session's active track
    pub async fn set_track(&self, track_id: TrackId, total_chunks: u32) {
        let mut session = self.inner.session.write().await;
        session.track_id = Some(track_id);
        session.total_chunks = total_chunks;
        session.current_chunk = 0;
        info!("Active track {} ({} chunks)", track_id, total_chunks);
    }

    pub async fn active_track(&self) -> Option<TrackId> {
        self.inner.session.read().await.track_id
    }

    pub async fn current_preset(&self) -> EnhancementPreset {
        self.inner.session.read().await.preset.clone()
    }

    /// Queue a chunk under the current preset unless it is already cached
    pub async fn preload(
        &self,
        track_id: TrackId,
        chunk_index: ChunkIndex,
        priority: Priority,
    ) -> Preload {
        let preset = self.current_preset().await;
        let key = CacheKey::new(track_id, chunk_index, &preset);

        if let Some(tier) = self.inner.cache.peek_tier(&key).await {
            self.inner.broadcast_event(StreamEvent::ChunkMetrics {
                track_id,
                chunk_index,
                lookup: CacheLookup::Hit { tier },
                latency_ms: 0,
                timestamp: chrono::Utc::now(),
            });
            return Preload::Resident(tier);
        }

        let outcome = {
            let mut queue = self.inner.queue.lock().await;
            self.inner.enqueue(&mut queue, key, priority).await
        };
        self.inner.wake.notify_one();
        Preload::Queued(outcome)
    }

    /// Throttled playback position report
    ///
    /// Fires `on_playback_advance` at most once per throttle interval, or
    /// immediately when the update says the track changed.
    pub async fn on_position_update(&self, update: PositionUpdate) -> Result<ThrottleDecision> {
        let active = self.active_track().await.ok_or(Error::NoActiveTrack)?;
        if active != update.track_id {
            warn!(
                "Position update for track {} while {} is active; ignoring",
                update.track_id, active
            );
            return Ok(ThrottleDecision::Suppress);
        }

        let decision = self.inner.gate.throttle(&update).await;
        if decision == ThrottleDecision::Fire {
            self.on_playback_advance(update.chunk_index).await?;
        }
        Ok(decision)
    }

    /// Audible chunk moved: queue it at CRITICAL and the lookahead one
    /// level lower
    pub async fn on_playback_advance(&self, chunk_index: ChunkIndex) -> Result<()> {
        let (track_id, total_chunks, preset) = {
            let mut session = self.inner.session.write().await;
            let track_id = session.track_id.ok_or(Error::NoActiveTrack)?;
            if chunk_index >= session.total_chunks {
                return Err(chunkflow_common::Error::InvalidInput(format!(
                    "playback position {} beyond last chunk of {}",
                    chunk_index, track_id
                ))
                .into());
            }
            session.current_chunk = chunk_index;
            (track_id, session.total_chunks, session.preset.clone())
        };

        let lookahead = self.inner.config.coordinator.lookahead_chunks;
        let mut wanted = vec![(chunk_index, Priority::CRITICAL)];
        for offset in 1..=lookahead {
            match chunk_index.checked_add(offset) {
                Some(next) if next < total_chunks => {
                    wanted.push((next, Priority::CRITICAL.demoted()))
                }
                _ => break,
            }
        }

        // Farthest first so the nearest chunk is newest within its level
        for (chunk, priority) in wanted.into_iter().rev() {
            self.schedule(CacheKey::new(track_id, chunk, &preset), priority)
                .await;
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Jump to `target` and wait until its rendering is cached
    ///
    /// Pending work less urgent than HIGH is dropped, the target is queued
    /// at CRITICAL and its neighbours one level lower (skipped during rapid
    /// interaction). Fails only with [`Error::WaitTimeout`] once the
    /// configured wait elapses, whatever happened to the target's task.
    pub async fn seek(&self, target: ChunkIndex) -> Result<Arc<CacheEntry>> {
        let (track_id, total_chunks, preset) = {
            let mut session = self.inner.session.write().await;
            let track_id = session.track_id.ok_or(Error::NoActiveTrack)?;
            if target >= session.total_chunks {
                return Err(chunkflow_common::Error::InvalidInput(format!(
                    "seek target {} beyond last chunk of {}",
                    target, track_id
                ))
                .into());
            }
            session.current_chunk = target;
            (track_id, session.total_chunks, session.preset.clone())
        };

        // Subscribe before queueing so the ready event can't be missed
        let events = self.subscribe();

        self.inner.gate.record_interaction().await;
        let rapid = self.inner.gate.is_rapid().await;

        let key = CacheKey::new(track_id, target, &preset);
        {
            let mut queue = self.inner.queue.lock().await;
            let dropped = queue.clear_below(Priority::HIGH);
            if !dropped.is_empty() {
                debug!("Seek to {} dropped {} stale requests", target, dropped.len());
            }
            for request in dropped {
                self.inner.broadcast_event(StreamEvent::ChunkSuperseded {
                    track_id: request.key.track_id,
                    chunk_index: request.key.chunk_index,
                    preset_id: request.key.preset_id,
                    timestamp: chrono::Utc::now(),
                });
            }

            match rapid {
                Some(events_in_window) => {
                    debug!("Rapid interaction ({} events), skipping neighbour prefetch", events_in_window);
                    self.inner.broadcast_event(StreamEvent::RapidInteraction {
                        events_in_window,
                        window_ms: self.inner.config.gate.rapid_window_ms,
                        timestamp: chrono::Utc::now(),
                    });
                }
                None => {
                    let radius = self.inner.config.coordinator.neighbor_radius;
                    for chunk in neighbours(target, radius, total_chunks) {
                        let neighbour = key.with_chunk(chunk);
                        if !self.inner.cache.contains(&neighbour).await {
                            self.inner
                                .enqueue(&mut queue, neighbour, Priority::CRITICAL.demoted())
                                .await;
                        }
                    }
                }
            }

            if !self.inner.cache.contains(&key).await {
                self.inner
                    .enqueue(&mut queue, key.clone(), Priority::CRITICAL)
                    .await;
            }
        }
        self.inner.wake.notify_one();

        self.wait_until_ready(&key, events).await
    }

    /// Debounced preset change
    ///
    /// After the quiet period the current chunk and its neighbours are
    /// queued under the new preset at NORMAL priority.
    pub async fn switch_enhancement_preset(&self, preset: EnhancementPreset) -> Result<PresetSwitch> {
        self.active_track().await.ok_or(Error::NoActiveTrack)?;
        self.inner.gate.record_interaction().await;

        let Some(preset) = self.inner.gate.debounce(preset).await else {
            return Ok(PresetSwitch::Superseded);
        };

        let (track_id, total_chunks, current) = {
            let mut session = self.inner.session.write().await;
            let track_id = session.track_id.ok_or(Error::NoActiveTrack)?;
            session.preset = preset.clone();
            (track_id, session.total_chunks, session.current_chunk)
        };

        let radius = self.inner.config.coordinator.neighbor_radius;
        let mut working_set: Vec<ChunkIndex> = neighbours(current, radius, total_chunks).collect();
        working_set.push(current);

        let mut rekeyed = 0;
        for chunk in working_set {
            let key = CacheKey::new(track_id, chunk, &preset);
            if self.schedule(key, Priority::NORMAL).await.is_some() {
                rekeyed += 1;
            }
        }
        self.inner.wake.notify_one();

        info!(
            "Enhancement preset {} at {}% applied, {} chunks re-keyed",
            preset.preset_id,
            preset.intensity.percent(),
            rekeyed
        );
        self.inner.broadcast_event(StreamEvent::PresetApplied {
            preset_id: preset.preset_id.clone(),
            intensity: preset.intensity.percent(),
            rekeyed_chunks: rekeyed,
            timestamp: chrono::Utc::now(),
        });

        Ok(PresetSwitch::Applied { rekeyed })
    }

    /// Track removed from the library: drop everything tied to it
    ///
    /// Returns the track's new epoch.
    pub async fn on_track_deleted(&self, track_id: TrackId) -> u64 {
        let epoch = self.invalidate_track(track_id).await;

        let mut session = self.inner.session.write().await;
        if session.track_id == Some(track_id) {
            session.track_id = None;
            session.total_chunks = 0;
            session.current_chunk = 0;
        }
        info!("Track {} deleted (epoch {})", track_id, epoch);
        epoch
    }

    /// Track content changed: drop stale renderings and, if it is the
    /// active track, re-queue the audible window
    pub async fn on_track_modified(&self, track_id: TrackId, new_path: &Path) -> Result<u64> {
        let epoch = self.invalidate_track(track_id).await;
        info!(
            "Track {} modified, now at {} (epoch {})",
            track_id,
            new_path.display(),
            epoch
        );

        let current = {
            let session = self.inner.session.read().await;
            (session.track_id == Some(track_id)).then_some(session.current_chunk)
        };
        if let Some(chunk) = current {
            self.on_playback_advance(chunk).await?;
        }
        Ok(epoch)
    }

    /// True if the rendering is cached in any tier (no promotion)
    pub async fn is_ready(
        &self,
        track_id: TrackId,
        chunk_index: ChunkIndex,
        preset: &EnhancementPreset,
    ) -> bool {
        let key = CacheKey::new(track_id, chunk_index, preset);
        self.inner.cache.peek_tier(&key).await.is_some()
    }

    /// Cached payload for playback, promoting it toward L1
    pub async fn read_chunk(
        &self,
        track_id: TrackId,
        chunk_index: ChunkIndex,
        preset: &EnhancementPreset,
    ) -> Option<Bytes> {
        let started = Instant::now();
        let key = CacheKey::new(track_id, chunk_index, preset);
        let hit = self.inner.cache.get(&key).await;

        self.inner.broadcast_event(StreamEvent::ChunkMetrics {
            track_id,
            chunk_index,
            lookup: match &hit {
                Some(hit) => CacheLookup::Hit { tier: hit.tier },
                None => CacheLookup::Miss,
            },
            latency_ms: started.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now(),
        });

        hit.map(|hit| hit.entry.payload.clone())
    }

    pub async fn stats(&self) -> CoordinatorStats {
        let (pending, in_flight) = {
            let queue = self.inner.queue.lock().await;
            (queue.len(), queue.in_flight_len())
        };
        CoordinatorStats {
            pending,
            in_flight,
            cache: self.inner.cache.snapshot().await,
        }
    }

    /// Pending priority of a key, if queued
    pub async fn pending_priority(&self, key: &CacheKey) -> Option<Priority> {
        self.inner.queue.lock().await.pending_priority(key)
    }

    pub async fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.queue.lock().await.is_in_flight(key)
    }

    async fn invalidate_track(&self, track_id: TrackId) -> u64 {
        // Queue lock held throughout so no request slips in between the
        // epoch bump and dropping the track's pending work
        let (epoch, entries_removed, pending_dropped) = {
            let mut queue = self.inner.queue.lock().await;
            let (epoch, entries_removed) = self
                .inner
                .cache
                .invalidate(track_id, &self.inner.epochs)
                .await;
            let pending_dropped = queue.remove_track(track_id).len();
            (epoch, entries_removed, pending_dropped)
        };

        self.inner.broadcast_event(StreamEvent::TrackInvalidated {
            track_id,
            epoch,
            entries_removed,
            pending_dropped,
            timestamp: chrono::Utc::now(),
        });
        epoch
    }

    /// Enqueue unless already resident in memory
    async fn schedule(&self, key: CacheKey, priority: Priority) -> Option<EnqueueOutcome> {
        if self.inner.cache.contains(&key).await {
            return None;
        }
        let mut queue = self.inner.queue.lock().await;
        Some(self.inner.enqueue(&mut queue, key, priority).await)
    }

    /// Resolve once `key` is cached, woken by its ready event with a
    /// fixed-interval check as fallback
    async fn wait_until_ready(
        &self,
        key: &CacheKey,
        mut events: broadcast::Receiver<StreamEvent>,
    ) -> Result<Arc<CacheEntry>> {
        let coordinator = &self.inner.config.coordinator;
        let limit = Duration::from_millis(coordinator.seek_wait_timeout_ms);
        let check = Duration::from_millis(coordinator.ready_check_interval_ms.max(1));
        let mut ticker = tokio::time::interval(check);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let wait = async {
            loop {
                if self.inner.cache.contains(key).await {
                    if let Some(hit) = self.inner.cache.get(key).await {
                        return hit.entry;
                    }
                }

                tokio::select! {
                    event = events.recv() => match event {
                        Ok(StreamEvent::ChunkReady { track_id, chunk_index, .. })
                            if track_id == key.track_id && chunk_index == key.chunk_index => {}
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => tokio::time::sleep(check).await,
                    },
                    _ = ticker.tick() => {}
                }
            }
        };

        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| Error::WaitTimeout {
                waited_ms: limit.as_millis() as u64,
            })
    }
}

impl Drop for StreamCoordinator {
    fn drop(&mut self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.workers.close();
        if let Some(handle) = self.consumer.get_mut().take() {
            handle.abort();
        }
    }
}

/// Chunks within `radius` of `center` (excluding it) that exist
fn neighbours(center: ChunkIndex, radius: u32, total_chunks: u32) -> impl Iterator<Item = ChunkIndex> {
    let first = center.saturating_sub(radius);
    let last = center.saturating_add(radius);
    (first..=last).filter(move |chunk| *chunk != center && *chunk < total_chunks)
}

/// Single queue consumer
async fn consume(inner: Arc<Inner>) {
    debug!("Queue consumer running");

    loop {
        if inner.stopping.load(Ordering::SeqCst) {
            break;
        }

        let permit = match inner.workers.reserve_slot().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let next = inner.queue.lock().await.dequeue();
        let Some(request) = next else {
            drop(permit);
            inner.wake.notified().await;
            continue;
        };

        if inner.cache.contains(&request.key).await {
            inner.queue.lock().await.finish(&request.key, request.seq);
            continue;
        }

        let key = request.key.clone();
        let seq = request.seq;
        debug!(
            "Dispatching {} at {:?} (epoch {})",
            key, request.priority, request.epoch
        );

        let outcome = inner
            .workers
            .submit_with_slot(request, permit)
            .await
            .outcome();

        let watcher = Arc::clone(&inner);
        tokio::spawn(async move {
            let result = outcome.await;
            watcher.queue.lock().await.finish(&key, seq);
            if let TaskOutcome::Failed(e) = result {
                debug!("Consumer moving on after {} failed: {}", key, e);
            }
        });
    }

    debug!("Queue consumer exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbours_stay_inside_track() {
        assert_eq!(neighbours(0, 1, 10).collect::<Vec<_>>(), vec![1]);
        assert_eq!(neighbours(5, 2, 10).collect::<Vec<_>>(), vec![3, 4, 6, 7]);
        assert_eq!(neighbours(9, 1, 10).collect::<Vec<_>>(), vec![8]);
        assert_eq!(neighbours(u32::MAX, 1, u32::MAX).collect::<Vec<_>>(), vec![u32::MAX - 1]);
    }
}
