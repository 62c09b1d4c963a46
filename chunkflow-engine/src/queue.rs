//! Priority request queue
//!
//! Orders pending chunk requests by urgency, newest first within one
//! priority level. Holds at most one pending request per [`CacheKey`]:
//! re-enqueueing upgrades the existing request in place.
//!
//! The queue also remembers which keys it has handed out to the worker
//! pool (in flight) until the consumer reports them finished, so callers
//! can ask whether a key is pending or being computed.

use chunkflow_common::{CacheKey, Priority, TrackId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;
use tracing::debug;

/// A pending (or dequeued) request to populate the cache for a key
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub key: CacheKey,
    pub priority: Priority,
    pub enqueued_at: Instant,
    /// Monotonic enqueue sequence, newer is larger
    pub seq: u64,
    /// Track epoch the request was made under
    pub epoch: u64,
}

/// What `enqueue` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New pending request
    Inserted,
    /// Existing request moved to a more urgent level
    Upgraded { from: Priority },
    /// Existing request kept its (already equal or more urgent) level;
    /// its recency was refreshed
    Refreshed,
    /// Key is being computed right now; nothing queued
    InFlight,
}

/// Ordering key: lowest priority value first, then newest sequence first
type OrderKey = (Priority, Reverse<u64>);

/// Priority queue of chunk requests
#[derive(Debug, Default)]
pub struct PriorityQueue {
    order: BTreeMap<OrderKey, CacheKey>,
    pending: HashMap<CacheKey, ChunkRequest>,
    /// Dequeued keys awaiting completion -> sequence of the dequeued request
    in_flight: HashMap<CacheKey, u64>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request, or upgrade/refresh the existing one for `key`
    ///
    /// `epoch` is the track's epoch as seen by the caller; a refreshed
    /// request keeps the newer of the two.
    pub fn enqueue(&mut self, key: CacheKey, priority: Priority, epoch: u64) -> EnqueueOutcome {
        if self.in_flight.contains_key(&key) {
            return EnqueueOutcome::InFlight;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let now = Instant::now();

        if let Some(existing) = self.pending.get_mut(&key) {
            self.order.remove(&(existing.priority, Reverse(existing.seq)));

            let previous = existing.priority;
            existing.priority = previous.most_urgent(priority);
            existing.seq = seq;
            existing.enqueued_at = now;
            existing.epoch = existing.epoch.max(epoch);
            self.order
                .insert((existing.priority, Reverse(seq)), key.clone());

            return if existing.priority < previous {
                debug!("Upgraded {} from {:?} to {:?}", key, previous, existing.priority);
                EnqueueOutcome::Upgraded { from: previous }
            } else {
                EnqueueOutcome::Refreshed
            };
        }

        self.order.insert((priority, Reverse(seq)), key.clone());
        self.pending.insert(
            key.clone(),
            ChunkRequest {
                key,
                priority,
                enqueued_at: now,
                seq,
                epoch,
            },
        );
        EnqueueOutcome::Inserted
    }

    /// Remove the most urgent request and mark its key in flight
    pub fn dequeue(&mut self) -> Option<ChunkRequest> {
        let (_, key) = self.order.pop_first()?;
        let request = self.pending.remove(&key)?;
        self.in_flight.insert(key, request.seq);
        Some(request)
    }

    /// Drop every pending request less urgent than `threshold`
    ///
    /// Requests at `threshold` or more urgent are untouched. Returns the
    /// dropped (superseded) requests.
    pub fn clear_below(&mut self, threshold: Priority) -> Vec<ChunkRequest> {
        let Some(first_dropped) = threshold.0.checked_add(1) else {
            return Vec::new();
        };

        // Reverse(u64::MAX) sorts first within a priority level
        let dropped = self
            .order
            .split_off(&(Priority(first_dropped), Reverse(u64::MAX)));

        dropped
            .into_values()
            .filter_map(|key| self.pending.remove(&key))
            .collect()
    }

    /// Drop pending requests and in-flight markers for a track
    ///
    /// In-flight work is not cancelled; only the marker goes, so a fresh
    /// request for the same key can be queued under the new track epoch.
    pub fn remove_track(&mut self, track_id: TrackId) -> Vec<ChunkRequest> {
        let keys: Vec<CacheKey> = self
            .pending
            .keys()
            .filter(|k| k.track_id == track_id)
            .cloned()
            .collect();

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(request) = self.pending.remove(&key) {
                self.order.remove(&(request.priority, Reverse(request.seq)));
                removed.push(request);
            }
        }

        self.in_flight.retain(|k, _| k.track_id != track_id);
        removed
    }

    /// Release the in-flight marker for a finished request
    ///
    /// Only releases the marker if it still belongs to `seq`, so a stale
    /// completion can't clear a newer request for the same key.
    pub fn finish(&mut self, key: &CacheKey, seq: u64) -> bool {
        if self.in_flight.get(key) == Some(&seq) {
            self.in_flight.remove(key);
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Priority of the pending request for `key`, if any
    pub fn pending_priority(&self, key: &CacheKey) -> Option<Priority> {
        self.pending.get(key).map(|r| r.priority)
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkflow_common::EnhancementPreset;
    use uuid::Uuid;

    fn key(track: TrackId, chunk: u32) -> CacheKey {
        CacheKey::new(track, chunk, &EnhancementPreset::flat())
    }

    #[test]
    fn request_carries_epoch_from_enqueue() {
        let track = Uuid::new_v4();
        let mut queue = PriorityQueue::new();

        queue.enqueue(key(track, 2), Priority::BACKGROUND, 3);
        queue.enqueue(key(track, 2), Priority::HIGH, 2);

        let request = queue.dequeue().unwrap();
        assert_eq!(request.priority, Priority::HIGH);
        assert_eq!(request.epoch, 3);
    }

    #[test]
    fn repeated_enqueue_keeps_single_entry_at_most_urgent() {
        let track = Uuid::new_v4();
        let mut queue = PriorityQueue::new();

        assert_eq!(queue.enqueue(key(track, 5), Priority::BACKGROUND, 0), EnqueueOutcome::Inserted);
        assert_eq!(
            queue.enqueue(key(track, 5), Priority::CRITICAL, 0),
            EnqueueOutcome::Upgraded { from: Priority::BACKGROUND }
        );
        // Less urgent re-enqueue never downgrades
        assert_eq!(queue.enqueue(key(track, 5), Priority::NORMAL, 0), EnqueueOutcome::Refreshed);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_priority(&key(track, 5)), Some(Priority::CRITICAL));

        let request = queue.dequeue().unwrap();
        assert_eq!(request.key, key(track, 5));
        assert_eq!(request.priority, Priority::CRITICAL);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn dequeue_lowest_priority_then_newest() {
        let track = Uuid::new_v4();
        let mut queue = PriorityQueue::new();

        queue.enqueue(key(track, 1), Priority::BACKGROUND, 0);
        queue.enqueue(key(track, 2), Priority::HIGH, 0);
        queue.enqueue(key(track, 3), Priority::HIGH, 0);
        queue.enqueue(key(track, 4), Priority::CRITICAL, 0);
        queue.enqueue(key(track, 5), Priority::BACKGROUND, 0);

        let order: Vec<u32> = std::iter::from_fn(|| queue.dequeue())
            .map(|r| r.key.chunk_index)
            .collect();
        assert_eq!(order, vec![4, 3, 2, 5, 1]);
    }

    #[test]
    fn refresh_moves_request_ahead_of_its_level() {
        let track = Uuid::new_v4();
        let mut queue = PriorityQueue::new();

        queue.enqueue(key(track, 1), Priority::HIGH, 0);
        queue.enqueue(key(track, 2), Priority::HIGH, 0);
        queue.enqueue(key(track, 1), Priority::HIGH, 0);

        assert_eq!(queue.dequeue().unwrap().key.chunk_index, 1);
        assert_eq!(queue.dequeue().unwrap().key.chunk_index, 2);
    }

    #[test]
    fn clear_below_drops_only_less_urgent() {
        let track = Uuid::new_v4();
        let mut queue = PriorityQueue::new();

        queue.enqueue(key(track, 0), Priority::CRITICAL, 0);
        queue.enqueue(key(track, 1), Priority::HIGH, 0);
        queue.enqueue(key(track, 2), Priority::NORMAL, 0);
        queue.enqueue(key(track, 3), Priority::BACKGROUND, 0);
        queue.enqueue(key(track, 4), Priority(9), 0);

        let mut dropped: Vec<u32> = queue
            .clear_below(Priority::HIGH)
            .into_iter()
            .map(|r| r.key.chunk_index)
            .collect();
        dropped.sort();

        assert_eq!(dropped, vec![2, 3, 4]);
        assert!(queue.is_pending(&key(track, 0)));
        assert!(queue.is_pending(&key(track, 1)));
        assert_eq!(queue.len(), 2);

        // Ordering structure stays consistent after the split
        assert_eq!(queue.dequeue().unwrap().key.chunk_index, 0);
        assert_eq!(queue.dequeue().unwrap().key.chunk_index, 1);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn clear_below_max_priority_is_noop() {
        let track = Uuid::new_v4();
        let mut queue = PriorityQueue::new();
        queue.enqueue(key(track, 0), Priority(u8::MAX), 0);
        assert!(queue.clear_below(Priority(u8::MAX)).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn in_flight_keys_are_not_requeued() {
        let track = Uuid::new_v4();
        let mut queue = PriorityQueue::new();

        queue.enqueue(key(track, 7), Priority::HIGH, 0);
        let request = queue.dequeue().unwrap();
        assert!(queue.is_in_flight(&key(track, 7)));
        assert!(!queue.is_pending(&key(track, 7)));

        assert_eq!(queue.enqueue(key(track, 7), Priority::CRITICAL, 0), EnqueueOutcome::InFlight);
        assert!(queue.is_empty());

        assert!(queue.finish(&key(track, 7), request.seq));
        assert!(!queue.is_in_flight(&key(track, 7)));
        assert_eq!(queue.enqueue(key(track, 7), Priority::CRITICAL, 0), EnqueueOutcome::Inserted);
    }

    #[test]
    fn stale_finish_does_not_clear_newer_marker() {
        let track = Uuid::new_v4();
        let mut queue = PriorityQueue::new();

        queue.enqueue(key(track, 1), Priority::HIGH, 0);
        let old = queue.dequeue().unwrap();
        queue.remove_track(track);

        queue.enqueue(key(track, 1), Priority::HIGH, 0);
        let new = queue.dequeue().unwrap();
        assert_ne!(old.seq, new.seq);

        assert!(!queue.finish(&key(track, 1), old.seq));
        assert!(queue.is_in_flight(&key(track, 1)));
        assert!(queue.finish(&key(track, 1), new.seq));
    }

    #[test]
    fn remove_track_leaves_other_tracks() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut queue = PriorityQueue::new();

        queue.enqueue(key(a, 0), Priority::HIGH, 0);
        queue.enqueue(key(a, 1), Priority::BACKGROUND, 0);
        queue.enqueue(key(b, 0), Priority::BACKGROUND, 0);

        let removed = queue.remove_track(a);
        assert_eq!(removed.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().unwrap().key.track_id, b);
    }
}
