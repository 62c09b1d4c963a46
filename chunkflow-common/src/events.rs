//! Event types published by a stream coordinator
//!
//! Events are serialized with an internal `type` tag so a UI layer can
//! forward them verbatim (e.g. over IPC) without an extra envelope.

use crate::types::{ChunkIndex, PresetId, Tier, TrackId};
use serde::{Deserialize, Serialize};

/// Classification of a failed chunk task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkErrorKind {
    /// Task exceeded its tiered deadline
    Timeout,
    /// Source range does not exist (non-retryable)
    SourceNotFound,
    /// Source exists but may not be read (non-retryable)
    PermissionDenied,
    /// Fetch or enhancement produced unusable data (retryable once)
    DecodeFailure,
    /// Work abandoned before completion (informational)
    Cancelled,
}

impl ChunkErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkErrorKind::Timeout => "timeout",
            ChunkErrorKind::SourceNotFound => "source_not_found",
            ChunkErrorKind::PermissionDenied => "permission_denied",
            ChunkErrorKind::DecodeFailure => "decode_failure",
            ChunkErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ChunkErrorKind::DecodeFailure)
    }
}

/// Where a lookup was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CacheLookup {
    Hit { tier: Tier },
    Miss,
}

/// Coordinator event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A rendering is now resident in the cache
    ChunkReady {
        track_id: TrackId,
        chunk_index: ChunkIndex,
        preset_id: PresetId,
        tier: Tier,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A chunk task failed; the queue consumer has moved on
    ChunkFailed {
        kind: ChunkErrorKind,
        track_id: TrackId,
        chunk_index: ChunkIndex,
        preset_id: PresetId,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Per-chunk lookup/latency measurement
    ChunkMetrics {
        track_id: TrackId,
        chunk_index: ChunkIndex,
        lookup: CacheLookup,
        latency_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A finished task's result was discarded because its track changed
    ChunkSuperseded {
        track_id: TrackId,
        chunk_index: ChunkIndex,
        preset_id: PresetId,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A debounced preset change took effect
    PresetApplied {
        preset_id: PresetId,
        intensity: u8,
        rekeyed_chunks: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Track deleted or modified; everything cached for it was dropped
    TrackInvalidated {
        track_id: TrackId,
        epoch: u64,
        entries_removed: usize,
        pending_dropped: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Burst of user input detected; expensive prefetch is being suppressed
    RapidInteraction {
        events_in_window: usize,
        window_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl StreamEvent {
    /// Event type name (matches the serialized `type` tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::ChunkReady { .. } => "ChunkReady",
            StreamEvent::ChunkFailed { .. } => "ChunkFailed",
            StreamEvent::ChunkMetrics { .. } => "ChunkMetrics",
            StreamEvent::ChunkSuperseded { .. } => "ChunkSuperseded",
            StreamEvent::PresetApplied { .. } => "PresetApplied",
            StreamEvent::TrackInvalidated { .. } => "TrackInvalidated",
            StreamEvent::RapidInteraction { .. } => "RapidInteraction",
        }
    }

    /// Serialize to a JSON string for forwarding
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
