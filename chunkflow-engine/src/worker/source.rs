//! Collaborator interfaces for the fetch and enhance steps
//!
//! The engine never reads audio or runs DSP itself. The embedding
//! application supplies a [`ChunkSource`] (raw range fetch) and an
//! [`Enhancer`] (post-processing for a preset).

use crate::error::ChunkError;
use async_trait::async_trait;
use bytes::Bytes;
use chunkflow_common::{ChunkIndex, EnhancementPreset, TrackId};

/// Fetches the raw source range for one chunk
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Missing ranges must report [`ChunkError::SourceNotFound`]; transient
    /// read problems [`ChunkError::DecodeFailure`].
    async fn fetch(&self, track_id: TrackId, chunk_index: ChunkIndex) -> Result<Bytes, ChunkError>;
}

/// Applies an enhancement preset to a raw chunk
#[async_trait]
pub trait Enhancer: Send + Sync {
    async fn enhance(&self, raw: Bytes, preset: &EnhancementPreset) -> Result<Bytes, ChunkError>;
}

/// Enhancer that returns the raw chunk unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

#[async_trait]
impl Enhancer for Passthrough {
    async fn enhance(&self, raw: Bytes, _preset: &EnhancementPreset) -> Result<Bytes, ChunkError> {
        Ok(raw)
    }
}
