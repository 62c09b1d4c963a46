//! Interaction shaping
//!
//! Tames noisy player input before it turns into queue traffic:
//! - **throttle**: at most one position-driven preload per interval; a track
//!   change always passes
//! - **debounce**: a burst of preset changes collapses into the last one,
//!   applied after a quiet period
//! - **rapid interaction**: flags input bursts so callers can skip
//!   expensive prefetch while the user is still scrubbing
//!
//! The gate only decides. Callers apply the decision.

use chunkflow_common::config::GateConfig;
use chunkflow_common::{ChunkIndex, TrackId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Interaction timestamps kept for burst detection
const HISTORY_LIMIT: usize = 256;

/// Playback position report from the player
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionUpdate {
    pub track_id: TrackId,
    pub chunk_index: ChunkIndex,
    /// The player moved to a different track since the last update
    pub track_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Fire,
    Suppress,
}

#[derive(Debug, Default)]
struct GateState {
    last_fired: Option<Instant>,
    interactions: VecDeque<Instant>,
}

/// Throttle / debounce / burst detector for one player session
#[derive(Debug)]
pub struct InteractionGate {
    config: GateConfig,
    state: Mutex<GateState>,
    /// Bumped by every debounce call; only the latest caller applies
    debounce_generation: AtomicU64,
}

impl InteractionGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GateState::default()),
            debounce_generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Decide whether a position update may trigger preload work
    pub async fn throttle(&self, update: &PositionUpdate) -> ThrottleDecision {
        let interval = Duration::from_millis(self.config.throttle_interval_ms);
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let window_elapsed = state
            .last_fired
            .map_or(true, |last| now.duration_since(last) >= interval);

        if update.track_changed || window_elapsed {
            state.last_fired = Some(now);
            ThrottleDecision::Fire
        } else {
            ThrottleDecision::Suppress
        }
    }

    /// Hold `change` for the quiet period; returns it only if no later
    /// change arrived meanwhile
    pub async fn debounce<T>(&self, change: T) -> Option<T> {
        let generation = self.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(self.config.debounce_quiet_ms)).await;

        if self.debounce_generation.load(Ordering::SeqCst) == generation {
            Some(change)
        } else {
            debug!("Debounced change {} superseded", generation);
            None
        }
    }

    /// Note one user interaction (seek, preset toggle) for burst detection
    pub async fn record_interaction(&self) {
        let mut state = self.state.lock().await;
        state.interactions.push_back(Instant::now());
        while state.interactions.len() > HISTORY_LIMIT {
            state.interactions.pop_front();
        }
    }

    /// Count of interactions within `window` if it meets the burst threshold
    pub async fn detect_rapid_interaction(&self, window: Duration) -> Option<usize> {
        let now = Instant::now();
        let state = self.state.lock().await;

        let count = state
            .interactions
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= window)
            .count();

        let required = (u128::from(self.config.rapid_threshold_per_sec) * window.as_millis() / 1000)
            .max(1);
        if count as u128 >= required {
            Some(count)
        } else {
            None
        }
    }

    /// Burst check over the configured window
    pub async fn is_rapid(&self) -> Option<usize> {
        self.detect_rapid_interaction(Duration::from_millis(self.config.rapid_window_ms))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn update(track: TrackId, chunk: u32, track_changed: bool) -> PositionUpdate {
        PositionUpdate {
            track_id: track,
            chunk_index: chunk,
            track_changed,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_fires_once_per_interval() {
        let gate = InteractionGate::new(GateConfig::default());
        let track = Uuid::new_v4();

        assert_eq!(gate.throttle(&update(track, 0, false)).await, ThrottleDecision::Fire);
        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(gate.throttle(&update(track, 1, false)).await, ThrottleDecision::Suppress);
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(gate.throttle(&update(track, 2, false)).await, ThrottleDecision::Fire);
    }

    #[tokio::test(start_paused = true)]
    async fn track_change_bypasses_throttle() {
        let gate = InteractionGate::new(GateConfig::default());

        assert_eq!(gate.throttle(&update(Uuid::new_v4(), 0, false)).await, ThrottleDecision::Fire);
        assert_eq!(gate.throttle(&update(Uuid::new_v4(), 0, true)).await, ThrottleDecision::Fire);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_applies_only_last_of_burst() {
        let gate = Arc::new(InteractionGate::new(GateConfig::default()));
        let start = Instant::now();

        let mut handles = Vec::new();
        for (at_ms, value) in [(0u64, "a"), (100, "b"), (200, "c"), (600, "d")] {
            tokio::time::sleep_until(start + Duration::from_millis(at_ms)).await;
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move { gate.debounce(value).await }));
        }

        let mut applied = Vec::new();
        for handle in handles {
            if let Some(value) = handle.await.unwrap() {
                applied.push(value);
            }
        }
        assert_eq!(applied, vec!["d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_interaction_needs_threshold_rate() {
        let gate = InteractionGate::new(GateConfig::default());
        let window = Duration::from_millis(1000);

        for _ in 0..9 {
            gate.record_interaction().await;
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        assert_eq!(gate.detect_rapid_interaction(window).await, None);

        gate.record_interaction().await;
        assert_eq!(gate.detect_rapid_interaction(window).await, Some(10));

        // Burst ages out of the window
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(gate.is_rapid().await, None);
    }
}
