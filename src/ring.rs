// =============================================================================
// Event Ring — bounded, monotonically-sequenced in-memory event log
// =============================================================================
//
// Single writer, many readers. Every pushed event is assigned a dense
// sequence number starting at 1; the ring keeps the most recent `capacity`
// events and drops the oldest under pressure. Consumers poll with
// `list_since(cursor, max)` and treat anything older than the tail as
// normal backfill loss.
//
// `latest_seq` reads an atomic and never takes the lock, so the fan-out
// broadcaster can poll it without contending with the writer.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Default ring capacity (events retained for client replay).
pub const DEFAULT_RING_CAPACITY: usize = 5_000;

// ---------------------------------------------------------------------------
// Ring event
// ---------------------------------------------------------------------------

/// Kind discriminator for ring events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RingEventKind {
    Trade,
    Position,
}

/// One entry in the ring: a sequence number, a kind tag, and the payload
/// already shaped for the client protocol.
#[derive(Debug, Clone, Serialize)]
pub struct RingEvent {
    pub seq: u64,
    pub kind: RingEventKind,
    pub at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Ring
// ---------------------------------------------------------------------------

/// Bounded append-only event log with monotone sequence numbers.
pub struct EventRing {
    capacity: usize,
    /// Highest assigned sequence number. 0 means nothing pushed yet.
    head: AtomicU64,
    events: RwLock<VecDeque<RingEvent>>,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            head: AtomicU64::new(0),
            events: RwLock::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Append an event, assigning the next sequence number. Drops the oldest
    /// event when the ring is full. Returns the assigned sequence.
    pub fn push(&self, kind: RingEventKind, payload: serde_json::Value) -> u64 {
        let mut events = self.events.write();
        let seq = self.head.fetch_add(1, Ordering::SeqCst) + 1;
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(RingEvent {
            seq,
            kind,
            at: Utc::now(),
            payload,
        });
        seq
    }

    /// Highest assigned sequence number. Wait-free.
    pub fn latest_seq(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    /// Oldest sequence still held, or `None` when empty.
    pub fn tail_seq(&self) -> Option<u64> {
        self.events.read().front().map(|e| e.seq)
    }

    /// Up to `max` contiguous events with `seq > since`, oldest first. When
    /// `since` has already fallen off the tail, the result starts at the
    /// tail instead.
    pub fn list_since(&self, since: u64, max: usize) -> Vec<RingEvent> {
        let events = self.events.read();
        events
            .iter()
            .filter(|e| e.seq > since)
            .take(max)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn push_n(ring: &EventRing, n: u64) {
        for i in 0..n {
            ring.push(RingEventKind::Trade, serde_json::json!({ "i": i }));
        }
    }

    #[test]
    fn sequences_are_dense_from_one() {
        let ring = EventRing::new(10);
        assert_eq!(ring.push(RingEventKind::Trade, serde_json::json!({})), 1);
        assert_eq!(ring.push(RingEventKind::Position, serde_json::json!({})), 2);
        assert_eq!(ring.latest_seq(), 2);
        assert_eq!(ring.tail_seq(), Some(1));
    }

    #[test]
    fn seq_strictly_increases_in_production_order() {
        let ring = EventRing::new(8);
        push_n(&ring, 20);
        let events = ring.list_since(0, 100);
        for pair in events.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
        }
    }

    #[test]
    fn overflow_drops_oldest_and_continues() {
        let ring = EventRing::new(3);
        push_n(&ring, 5);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.latest_seq(), 5);
        assert_eq!(ring.tail_seq(), Some(3));

        let events = ring.list_since(0, 10);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn list_since_returns_exact_suffix() {
        let ring = EventRing::new(100);
        push_n(&ring, 10);
        let events = ring.list_since(7, 100);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[test]
    fn list_since_respects_max() {
        let ring = EventRing::new(100);
        push_n(&ring, 10);
        let events = ring.list_since(2, 3);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn list_since_ahead_of_head_is_empty() {
        let ring = EventRing::new(10);
        push_n(&ring, 4);
        assert!(ring.list_since(4, 10).is_empty());
        assert!(ring.list_since(99, 10).is_empty());
    }

    #[test]
    fn list_since_below_tail_backfills_from_tail() {
        let ring = EventRing::new(3);
        push_n(&ring, 10); // ring holds 8, 9, 10
        let events = ring.list_since(2, 10);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[test]
    fn empty_ring_reports_zero_head() {
        let ring = EventRing::new(5);
        assert_eq!(ring.latest_seq(), 0);
        assert_eq!(ring.tail_seq(), None);
        assert!(ring.is_empty());
        assert!(ring.list_since(0, 10).is_empty());
    }
}
