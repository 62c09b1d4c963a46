//! # chunkflow engine
//!
//! Chunk loading, caching and scheduling core for a streaming audio player.
//!
//! **Architecture:**
//! - `queue`: priority-ordered pending requests, one per cache key
//! - `cache`: hot/warm/cold LRU tiers with an optional SQLite-indexed
//!   persistent cold store
//! - `gate`: throttle, debounce and burst detection for player input
//! - `worker`: bounded fetch+enhance pool with tiered deadlines
//! - `epoch`: per-track version stamps for invalidation
//! - `coordinator`: per-session façade publishing [`StreamEvent`]s
//!
//! [`StreamEvent`]: chunkflow_common::StreamEvent

pub mod cache;
pub mod coordinator;
pub mod epoch;
pub mod error;
pub mod gate;
pub mod queue;
pub mod worker;

pub use cache::{CacheEntry, CacheHit, ColdStore, TieredCache};
pub use coordinator::{CoordinatorStats, Preload, PresetSwitch, StreamCoordinator};
pub use epoch::TrackEpochs;
pub use error::{ChunkError, Error, Result};
pub use gate::{InteractionGate, PositionUpdate, ThrottleDecision};
pub use queue::{ChunkRequest, EnqueueOutcome, PriorityQueue};
pub use worker::{ChunkSource, Enhancer, Passthrough, Submission, TaskOutcome, WorkerPool};
