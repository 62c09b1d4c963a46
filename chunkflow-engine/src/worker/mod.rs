//! Bounded fetch+enhance worker pool
//!
//! Each task fetches a raw chunk from the [`ChunkSource`], runs it through
//! the [`Enhancer`] for the key's preset, and writes the result into the
//! cache. Concurrency is bounded by a semaphore of `pool_size` slots.
//!
//! **Per-key exclusivity:** the in-flight map is checked and updated under
//! one lock, so a second submit for a key already being computed attaches to
//! the running task's shared outcome instead of starting another.
//!
//! **Deadlines:** each task gets a deadline from its priority class. On
//! expiry the task resolves `Failed(Timeout)` and releases its slot and key
//! at once. The underlying fetch is not cancelled; it runs on detached and
//! its result is dropped.
//!
//! **Staleness:** tasks capture the track epoch at start. A result whose
//! track was invalidated meanwhile is discarded as superseded.

pub mod source;

pub use crate::error::ChunkError;
pub use source::{ChunkSource, Enhancer, Passthrough};

use crate::cache::{target_tier, TieredCache};
use crate::epoch::TrackEpochs;
use crate::error::{Error, Result};
use crate::queue::ChunkRequest;
use bytes::Bytes;
use chunkflow_common::config::WorkerConfig;
use chunkflow_common::{CacheKey, CacheLookup, Priority, StreamEvent, Tier};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// How a chunk task ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Payload written to the cache
    Completed {
        tier: Tier,
        size_bytes: usize,
        latency_ms: u64,
    },
    Failed(ChunkError),
    /// Track changed while the task ran; result discarded
    Superseded,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }
}

/// Outcome future shared by every submitter of one task
pub type SharedOutcome = Shared<BoxFuture<'static, TaskOutcome>>;

/// Result of submitting a request
#[derive(Clone)]
pub enum Submission {
    /// A new task was started
    Started(SharedOutcome),
    /// The key was already in flight; joined the running task
    Attached(SharedOutcome),
}

impl Submission {
    pub fn is_attached(&self) -> bool {
        matches!(self, Submission::Attached(_))
    }

    pub fn outcome(self) -> SharedOutcome {
        match self {
            Submission::Started(outcome) | Submission::Attached(outcome) => outcome,
        }
    }
}

/// Deadline per priority class
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    config: WorkerConfig,
}

impl TimeoutPolicy {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    pub fn deadline_for(&self, priority: Priority) -> Duration {
        self.config.timeout_for(priority.class())
    }
}

/// One executing unit of work
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub request: ChunkRequest,
    /// Track epoch when the task started
    pub epoch: u64,
    pub deadline: Duration,
    /// Zero-based attempt number
    pub attempt: u32,
}

/// In-flight identity: the same key under a newer epoch is a different task
type InFlightKey = (CacheKey, u64);

/// Bounded pool of concurrent chunk tasks
#[derive(Clone)]
pub struct WorkerPool {
    config: WorkerConfig,
    timeouts: TimeoutPolicy,
    source: Arc<dyn ChunkSource>,
    enhancer: Arc<dyn Enhancer>,
    cache: Arc<TieredCache>,
    epochs: Arc<TrackEpochs>,
    events: broadcast::Sender<StreamEvent>,
    slots: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<InFlightKey, SharedOutcome>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        source: Arc<dyn ChunkSource>,
        enhancer: Arc<dyn Enhancer>,
        cache: Arc<TieredCache>,
        epochs: Arc<TrackEpochs>,
        events: broadcast::Sender<StreamEvent>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.pool_size.max(1)));
        Self {
            timeouts: TimeoutPolicy::new(config.clone()),
            config,
            source,
            enhancer,
            cache,
            epochs,
            events,
            slots,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for a free task slot
    ///
    /// Fails only once the pool has been closed.
    pub async fn reserve_slot(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    /// Outcome of the running task for `key` at `epoch`, if any
    pub async fn attach(&self, key: &CacheKey, epoch: u64) -> Option<SharedOutcome> {
        self.in_flight
            .lock()
            .await
            .get(&(key.clone(), epoch))
            .cloned()
    }

    /// Submit a request, waiting for a slot if the pool is saturated
    pub async fn submit(&self, request: ChunkRequest) -> Result<Submission> {
        if let Some(outcome) = self.attach(&request.key, request.epoch).await {
            return Ok(Submission::Attached(outcome));
        }
        let permit = self.reserve_slot().await?;
        Ok(self.submit_with_slot(request, permit).await)
    }

    /// Submit using an already reserved slot
    ///
    /// If the key is already in flight the permit is released and the
    /// caller attaches to the existing task.
    pub async fn submit_with_slot(
        &self,
        request: ChunkRequest,
        permit: OwnedSemaphorePermit,
    ) -> Submission {
        let epoch = request.epoch;
        let id: InFlightKey = (request.key.clone(), epoch);

        let mut in_flight = self.in_flight.lock().await;
        if let Some(existing) = in_flight.get(&id) {
            debug!("Attaching to in-flight task for {}", request.key);
            return Submission::Attached(existing.clone());
        }

        let (tx, rx) = oneshot::channel();
        let outcome: SharedOutcome = rx
            .map(|received| received.unwrap_or(TaskOutcome::Failed(ChunkError::Cancelled)))
            .boxed()
            .shared();
        in_flight.insert(id.clone(), outcome.clone());
        drop(in_flight);

        let task = WorkerTask {
            deadline: self.timeouts.deadline_for(request.priority),
            request,
            epoch,
            attempt: 0,
        };

        let pool = self.clone();
        tokio::spawn(async move {
            let result = pool.run(task).await;

            // Release key and slot before waking waiters so they can resubmit
            pool.in_flight.lock().await.remove(&id);
            drop(permit);
            let _ = tx.send(result);
        });

        Submission::Started(outcome)
    }

    /// Number of tasks currently executing
    pub async fn in_flight_len(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Free slots right now
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Stop handing out slots; running tasks finish normally
    pub fn close(&self) {
        self.slots.close();
    }

    async fn run(&self, task: WorkerTask) -> TaskOutcome {
        let started = Instant::now();
        let key = task.request.key.clone();
        let deadline = task.deadline;

        let work = tokio::spawn(fetch_and_enhance(
            Arc::clone(&self.source),
            Arc::clone(&self.enhancer),
            task.clone(),
            self.config.decode_retries,
        ));

        // Dropping the JoinHandle on timeout detaches the fetch
        let result = match tokio::time::timeout(deadline, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_cancelled() => Err(ChunkError::Cancelled),
            Ok(Err(join_error)) => Err(ChunkError::DecodeFailure(format!(
                "chunk task panicked: {}",
                join_error
            ))),
            Err(_) => Err(ChunkError::Timeout {
                waited_ms: deadline.as_millis() as u64,
            }),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(payload) => self.store(&task, payload, latency_ms).await,
            Err(e) => {
                error!(
                    "Chunk task failed for {} ({:?}): {}",
                    key, task.request.priority, e
                );
                self.emit(StreamEvent::ChunkFailed {
                    kind: e.kind(),
                    track_id: key.track_id,
                    chunk_index: key.chunk_index,
                    preset_id: key.preset_id.clone(),
                    timestamp: chrono::Utc::now(),
                });
                TaskOutcome::Failed(e)
            }
        }
    }

    /// Write a finished payload unless its track epoch moved on
    async fn store(&self, task: &WorkerTask, payload: Bytes, latency_ms: u64) -> TaskOutcome {
        let key = &task.request.key;
        let tier = target_tier(task.request.priority.class());
        let size_bytes = payload.len();

        // L3 keeps the wide population so revisits skip recomputation
        let mut tiers = vec![tier];
        if tier != Tier::Cold {
            tiers.push(Tier::Cold);
        }

        let written = self
            .cache
            .put_current(key.clone(), payload, &tiers, &self.epochs, task.epoch)
            .await;
        if written.is_none() {
            return self.superseded(key);
        }

        debug!("Chunk {} ready in {} tier after {}ms", key, tier, latency_ms);
        self.emit(StreamEvent::ChunkReady {
            track_id: key.track_id,
            chunk_index: key.chunk_index,
            preset_id: key.preset_id.clone(),
            tier,
            timestamp: chrono::Utc::now(),
        });
        self.emit(StreamEvent::ChunkMetrics {
            track_id: key.track_id,
            chunk_index: key.chunk_index,
            lookup: CacheLookup::Miss,
            latency_ms,
            timestamp: chrono::Utc::now(),
        });

        TaskOutcome::Completed {
            tier,
            size_bytes,
            latency_ms,
        }
    }

    fn superseded(&self, key: &CacheKey) -> TaskOutcome {
        debug!("Discarding stale result for {}", key);
        self.emit(StreamEvent::ChunkSuperseded {
            track_id: key.track_id,
            chunk_index: key.chunk_index,
            preset_id: key.preset_id.clone(),
            timestamp: chrono::Utc::now(),
        });
        TaskOutcome::Superseded
    }

    fn emit(&self, event: StreamEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Fetch then enhance, retrying retryable failures up to `retries` times
async fn fetch_and_enhance(
    source: Arc<dyn ChunkSource>,
    enhancer: Arc<dyn Enhancer>,
    mut task: WorkerTask,
    retries: u32,
) -> std::result::Result<Bytes, ChunkError> {
    let key = task.request.key.clone();
    let preset = key.preset();

    loop {
        let result = match source.fetch(key.track_id, key.chunk_index).await {
            Ok(raw) => enhancer.enhance(raw, &preset).await,
            Err(e) => Err(e),
        };

        match result {
            Err(e) if e.is_retryable() && task.attempt < retries => {
                task.attempt += 1;
                warn!("Retrying {} (attempt {}): {}", key, task.attempt + 1, e);
            }
            other => return other,
        }
    }
}
