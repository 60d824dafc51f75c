//! In-flight transaction tracker
//!
//! A fixed-capacity circular buffer of transactions that have been received
//! from the upstream replication stream but not yet fully acknowledged by the
//! broker. Transactions are appended at the head strictly in upstream commit
//! order; the checkpointer drains them from the tail. Bounding the buffer
//! bounds memory and gives the supervisor a natural point to apply
//! backpressure at commit granularity, which matches the replication
//! protocol's own synchronisation boundary.

use crate::errors::{BridgeError, BridgeResult};
use crate::types::{Lsn, Xid};

/// Maximum number of transactions that may be in flight at once.
pub const MAX_IN_FLIGHT_TRANSACTIONS: usize = 1000;

/// One extra empty slot lets the circular buffer distinguish between empty
/// and full.
const RING_SLOTS: usize = MAX_IN_FLIGHT_TRANSACTIONS + 1;

/// Book-keeping for one upstream transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionInfo {
    /// Upstream transaction identifier (0 for the initial snapshot).
    pub xid: Xid,
    /// Row-level events received so far for this transaction.
    pub recvd_events: u64,
    /// Row-level events enqueued but not yet acknowledged by the broker.
    pub pending_events: u64,
    /// WAL position of the transaction's commit event (0 until it arrives).
    pub commit_lsn: Lsn,
}

/// Bounded ordered buffer of in-flight transactions.
///
/// `head` indexes the transaction currently being received; `tail` the oldest
/// transaction not yet checkpointed. The buffer starts out empty with the
/// tail one ahead of the head.
pub struct TransactionRing {
    slots: Box<[TransactionInfo]>,
    head: usize,
    tail: usize,
}

impl TransactionRing {
    pub fn new() -> Self {
        Self {
            slots: vec![TransactionInfo::default(); RING_SLOTS].into_boxed_slice(),
            head: RING_SLOTS - 1,
            tail: 0,
        }
    }

    /// Number of in-flight transactions, normalised for wraparound.
    pub fn len(&self) -> usize {
        (RING_SLOTS + self.head + 1 - self.tail) % RING_SLOTS
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == RING_SLOTS - 1
    }

    /// Opens a new transaction at the head of the ring.
    ///
    /// The caller must have drained the ring below capacity first (the
    /// supervisor drives backpressure while the ring is full). A snapshot
    /// transaction (xid 0) is only legal as the very first transaction.
    pub fn begin(&mut self, xid: Xid) -> BridgeResult<()> {
        if xid == 0 && !(self.tail == 0 && self.is_empty()) {
            return Err(BridgeError::protocol(
                "expected snapshot to be the first transaction",
            ));
        }
        if self.is_full() {
            return Err(BridgeError::protocol(
                "transaction ring is full; backpressure was not applied",
            ));
        }

        self.head = (self.head + 1) % RING_SLOTS;
        self.slots[self.head] = TransactionInfo {
            xid,
            recvd_events: 0,
            pending_events: 0,
            commit_lsn: 0,
        };
        Ok(())
    }

    /// Records the commit event for the transaction at the head.
    ///
    /// Begin/commit events arrive strictly paired from upstream; a mismatch
    /// means the decoder misbehaved and is fatal.
    pub fn commit(&mut self, xid: Xid, wal_pos: Lsn) -> BridgeResult<()> {
        if self.is_empty() || self.slots[self.head].xid != xid {
            return Err(BridgeError::protocol(format!(
                "mismatched begin/commit events (xid {} in flight, xid {} committed)",
                self.slots[self.head].xid, xid
            )));
        }
        self.slots[self.head].commit_lsn = wal_pos;
        Ok(())
    }

    /// Slot index of the transaction currently being received. Stored in the
    /// message envelope so delivery notifications find their transaction.
    pub fn head_index(&self) -> usize {
        self.head
    }

    pub fn head(&self) -> &TransactionInfo {
        &self.slots[self.head]
    }

    /// Counts one enqueued row event against the transaction at the head.
    pub fn record_enqueue(&mut self) {
        let head = &mut self.slots[self.head];
        head.recvd_events += 1;
        head.pending_events += 1;
    }

    /// Counts one broker acknowledgement against the given slot.
    pub fn record_ack(&mut self, slot: usize) {
        let xact = &mut self.slots[slot];
        if xact.pending_events == 0 {
            tracing::warn!(
                "delivery acknowledged for xid {} with no pending events",
                xact.xid
            );
            return;
        }
        xact.pending_events -= 1;
    }

    /// The oldest not-yet-checkpointed transaction, or `None` when the ring
    /// is empty.
    pub fn tail(&self) -> Option<&TransactionInfo> {
        if self.is_empty() {
            None
        } else {
            Some(&self.slots[self.tail])
        }
    }

    /// Retires the transaction at the tail. Must only be called while the
    /// ring is non-empty.
    pub fn advance_tail(&mut self) {
        debug_assert!(!self.is_empty());
        self.tail = (self.tail + 1) % RING_SLOTS;
    }
}

impl Default for TransactionRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ring_is_empty() {
        let ring = TransactionRing::new();
        assert_eq!(ring.len(), 0);
        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert!(ring.tail().is_none());
    }

    #[test]
    fn test_begin_appends_at_head() {
        let mut ring = TransactionRing::new();
        ring.begin(7).unwrap();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.head().xid, 7);
        assert_eq!(ring.head().commit_lsn, 0);
        assert_eq!(ring.tail().unwrap().xid, 7);
    }

    #[test]
    fn test_ring_full_at_capacity() {
        let mut ring = TransactionRing::new();
        for xid in 1..=MAX_IN_FLIGHT_TRANSACTIONS as Xid {
            assert!(!ring.is_full());
            ring.begin(xid).unwrap();
        }
        assert!(ring.is_full());
        assert!(ring.begin(9999).is_err());
    }

    #[test]
    fn test_length_formula_across_wraparound() {
        let mut ring = TransactionRing::new();
        // Push and drain repeatedly so the cursors wrap the sentinel slot.
        for round in 0..3 {
            for i in 0..MAX_IN_FLIGHT_TRANSACTIONS as Xid {
                ring.begin(round * 10_000 + i + 1).unwrap();
                assert_eq!(ring.len(), i as usize + 1);
            }
            for i in (0..MAX_IN_FLIGHT_TRANSACTIONS).rev() {
                ring.advance_tail();
                assert_eq!(ring.len(), i);
            }
            assert!(ring.is_empty());
        }
    }

    #[test]
    fn test_snapshot_must_be_first() {
        let mut ring = TransactionRing::new();
        ring.begin(5).unwrap();
        assert!(ring.begin(0).is_err());

        let mut ring = TransactionRing::new();
        ring.begin(0).unwrap();
        assert_eq!(ring.head().xid, 0);
    }

    #[test]
    fn test_commit_requires_matching_xid() {
        let mut ring = TransactionRing::new();
        ring.begin(7).unwrap();
        assert!(ring.commit(8, 0x110).is_err());
        ring.commit(7, 0x110).unwrap();
        assert_eq!(ring.head().commit_lsn, 0x110);
    }

    #[test]
    fn test_event_counters() {
        let mut ring = TransactionRing::new();
        ring.begin(7).unwrap();
        let slot = ring.head_index();
        ring.record_enqueue();
        ring.record_enqueue();
        assert_eq!(ring.head().recvd_events, 2);
        assert_eq!(ring.head().pending_events, 2);

        ring.record_ack(slot);
        assert_eq!(ring.head().recvd_events, 2);
        assert_eq!(ring.head().pending_events, 1);

        ring.record_ack(slot);
        // An extra ack must not underflow.
        ring.record_ack(slot);
        assert_eq!(ring.head().pending_events, 0);
    }
}
