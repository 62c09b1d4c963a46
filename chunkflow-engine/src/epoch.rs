//! Per-track version stamps
//!
//! A track's epoch is bumped whenever the collaborator that owns track
//! identity reports the track deleted or modified. Worker tasks capture the
//! epoch when they start and discard their result if it has moved on.

use chunkflow_common::TrackId;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Monotonic version per track (unknown tracks are at epoch 0)
#[derive(Debug, Default)]
pub struct TrackEpochs {
    epochs: RwLock<HashMap<TrackId, u64>>,
}

impl TrackEpochs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self, track_id: TrackId) -> u64 {
        self.epochs
            .read()
            .await
            .get(&track_id)
            .copied()
            .unwrap_or(0)
    }

    /// Advance the track's epoch, returning the new value
    pub async fn bump(&self, track_id: TrackId) -> u64 {
        let mut epochs = self.epochs.write().await;
        let epoch = epochs.entry(track_id).or_insert(0);
        *epoch += 1;
        *epoch
    }

    /// True if `epoch` is still the track's current epoch
    pub async fn is_current(&self, track_id: TrackId, epoch: u64) -> bool {
        self.current(track_id).await == epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn bump_is_per_track() {
        let epochs = TrackEpochs::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(epochs.current(a).await, 0);
        assert_eq!(epochs.bump(a).await, 1);
        assert_eq!(epochs.bump(a).await, 2);

        assert_eq!(epochs.current(b).await, 0);
        assert!(epochs.is_current(a, 2).await);
        assert!(!epochs.is_current(a, 1).await);
    }
}
