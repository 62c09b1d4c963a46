//! # chunkflow common library
//!
//! Shared code for the chunkflow streaming core and the applications that
//! embed it:
//! - Identifier types (tracks, chunks, presets, cache keys)
//! - Priority and tier definitions
//! - Event types (StreamEvent enum)
//! - Configuration loading
//! - Tracing initialization

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod types;

pub use config::StreamConfig;
pub use error::{Error, Result};
pub use events::{CacheLookup, ChunkErrorKind, StreamEvent};
pub use types::{
    CacheKey, ChunkIndex, EnhancementPreset, Intensity, PresetId, Priority, PriorityClass, Tier,
    TrackId,
};
