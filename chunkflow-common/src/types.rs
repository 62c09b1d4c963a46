//! Identifier and ordering types shared across chunkflow
//!
//! A chunk is a fixed-duration slice of a track addressed by
//! `(track_id, chunk_index)`. A computed rendering of that chunk under an
//! enhancement preset is addressed by [`CacheKey`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Track identifier (owned by the library/metadata collaborator)
pub type TrackId = Uuid;

/// Zero-based chunk position within a track
pub type ChunkIndex = u32;

/// Name of an enhancement preset (e.g. "flat", "night-mode")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PresetId(String);

impl PresetId {
    /// Create a preset id, rejecting empty or whitespace-only names
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("preset id cannot be empty".to_string()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PresetId {
    type Error = Error;

    fn try_from(id: String) -> Result<Self> {
        Self::new(id)
    }
}

impl From<PresetId> for String {
    fn from(id: PresetId) -> Self {
        id.0
    }
}

impl fmt::Display for PresetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Enhancement strength as an integer percentage (0-100)
///
/// Integer rather than float so it can take part in hashed cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Intensity(u8);

impl Intensity {
    pub const MAX: Intensity = Intensity(100);

    pub fn new(percent: u8) -> Result<Self> {
        if percent > 100 {
            return Err(Error::InvalidInput(format!(
                "intensity must be 0-100, got {}",
                percent
            )));
        }
        Ok(Self(percent))
    }

    pub fn percent(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Intensity {
    type Error = Error;

    fn try_from(percent: u8) -> Result<Self> {
        Self::new(percent)
    }
}

impl From<Intensity> for u8 {
    fn from(intensity: Intensity) -> Self {
        intensity.0
    }
}

/// Preset plus intensity: the parameter handed to the enhancement step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnhancementPreset {
    pub preset_id: PresetId,
    pub intensity: Intensity,
}

impl EnhancementPreset {
    pub fn new(preset_id: PresetId, intensity: Intensity) -> Self {
        Self {
            preset_id,
            intensity,
        }
    }

    /// Preset that leaves audio untouched ("flat" at zero intensity)
    pub fn flat() -> Self {
        Self {
            preset_id: PresetId("flat".to_string()),
            intensity: Intensity(0),
        }
    }
}

impl Default for EnhancementPreset {
    fn default() -> Self {
        Self::flat()
    }
}

/// Uniquely identifies one computed rendering of a chunk
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub track_id: TrackId,
    pub chunk_index: ChunkIndex,
    pub preset_id: PresetId,
    pub intensity: Intensity,
}

impl CacheKey {
    pub fn new(track_id: TrackId, chunk_index: ChunkIndex, preset: &EnhancementPreset) -> Self {
        Self {
            track_id,
            chunk_index,
            preset_id: preset.preset_id.clone(),
            intensity: preset.intensity,
        }
    }

    /// The preset this key renders under
    pub fn preset(&self) -> EnhancementPreset {
        EnhancementPreset::new(self.preset_id.clone(), self.intensity)
    }

    /// Same rendering parameters, different chunk of the same track
    pub fn with_chunk(&self, chunk_index: ChunkIndex) -> Self {
        Self {
            chunk_index,
            ..self.clone()
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}@{}:{}",
            self.track_id,
            self.chunk_index,
            self.preset_id,
            self.intensity.percent()
        )
    }
}

/// Urgency of a chunk request (numerically lower = more urgent)
///
/// Total order over `u8`; the named levels below are what the coordinator
/// uses, but any value is accepted so deployments can add finer levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Audible chunk or seek target
    pub const CRITICAL: Priority = Priority(0);
    /// Next chunk, seek neighbours
    pub const HIGH: Priority = Priority(1);
    /// Preset re-key working set
    pub const NORMAL: Priority = Priority(2);
    /// Idle prefetch
    pub const BACKGROUND: Priority = Priority(3);

    /// The more urgent of two priorities
    pub fn most_urgent(self, other: Priority) -> Priority {
        self.min(other)
    }

    /// One level less urgent (saturating)
    pub fn demoted(self) -> Priority {
        Priority(self.0.saturating_add(1))
    }

    /// Priority class used for deadlines and target tier
    pub fn class(self) -> PriorityClass {
        match self.0 {
            0 => PriorityClass::Critical,
            1 => PriorityClass::High,
            2 => PriorityClass::Normal,
            _ => PriorityClass::Background,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::BACKGROUND
    }
}

/// Coarse urgency classes derived from [`Priority`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Critical,
    High,
    Normal,
    Background,
}

/// Cache pool a payload lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// L1: immediately audible window
    Hot,
    /// L2: recently touched window (recent seeks/presets)
    Warm,
    /// L3: large population, optionally persistent
    Cold,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
