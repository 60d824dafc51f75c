//! Durability checkpointer
//!
//! When a transaction has been durably written to Kafka (its commit event was
//! seen from PostgreSQL and the broker has acknowledged every one of its
//! messages), it is checkpointed: the replication stream's fsync LSN is
//! advanced so the upstream server can recycle WAL. The fsync LSN is sent
//! back to the server in standby status updates and becomes the restart
//! position if this client dies, so no data is lost, although messages may be
//! duplicated across restarts.
//!
//! Because the ring preserves upstream commit order and draining only happens
//! from the tail, the acknowledged position is always the largest prefix of
//! committed transactions whose rows were all accepted downstream.

use crate::tracker::TransactionRing;
use crate::types::{Lsn, format_lsn};
use tracing::{debug, info, warn};

/// Owns the upstream acknowledgement cursor and the snapshot-in-progress
/// flag.
pub struct Checkpointer {
    fsync_lsn: Lsn,
    taking_snapshot: bool,
}

impl Checkpointer {
    pub fn new(taking_snapshot: bool) -> Self {
        Self {
            fsync_lsn: 0,
            taking_snapshot,
        }
    }

    /// The WAL position up to which data has been durably written downstream.
    /// Strictly non-decreasing.
    pub fn fsync_lsn(&self) -> Lsn {
        self.fsync_lsn
    }

    /// True while the initial snapshot (transaction 0) has not completed.
    pub fn snapshot_in_progress(&self) -> bool {
        self.taking_snapshot
    }

    /// Drains fully-acknowledged committed transactions from the tail of the
    /// ring and advances the fsync LSN past them. Returns the number of
    /// transactions retired.
    ///
    /// A transaction leaves the ring only once its commit has been observed;
    /// this includes the snapshot sentinel, whose commit position is the only
    /// thing that lets it retire.
    pub fn drain(&mut self, ring: &mut TransactionRing) -> usize {
        let mut drained = 0;

        while let Some(xact) = ring.tail() {
            if xact.pending_events != 0 || xact.commit_lsn == 0 {
                break;
            }

            if self.fsync_lsn > xact.commit_lsn {
                // Commits not in WAL order; keep the cursor where it is.
                warn!(
                    "commits not in WAL order! checkpoint LSN is {}, commit LSN is {}",
                    format_lsn(self.fsync_lsn),
                    format_lsn(xact.commit_lsn)
                );
            } else if self.fsync_lsn < xact.commit_lsn {
                debug!(
                    "checkpointing {} events for xid {}, WAL position {}",
                    xact.recvd_events,
                    xact.xid,
                    format_lsn(xact.commit_lsn)
                );
                self.fsync_lsn = xact.commit_lsn;
            }

            if xact.xid == 0 && self.taking_snapshot {
                info!(
                    "snapshot complete, streaming changes from {}",
                    format_lsn(xact.commit_lsn)
                );
                self.taking_snapshot = false;
            }

            ring.advance_tail();
            drained += 1;
        }

        drained
    }

    /// Advances the cursor on an idle keepalive, when the ring is empty and
    /// the server's reported position is known to be safe. Never regresses.
    pub fn observe_idle(&mut self, wal_pos: Lsn) {
        if wal_pos > self.fsync_lsn {
            debug!("idle keepalive advances checkpoint to {}", format_lsn(wal_pos));
            self.fsync_lsn = wal_pos;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acked_transaction(ring: &mut TransactionRing, xid: u32, commit_lsn: Lsn) {
        ring.begin(xid).unwrap();
        let slot = ring.head_index();
        ring.record_enqueue();
        ring.commit(xid, commit_lsn).unwrap();
        ring.record_ack(slot);
    }

    #[test]
    fn test_drain_advances_in_commit_order() {
        let mut ring = TransactionRing::new();
        let mut checkpointer = Checkpointer::new(false);

        acked_transaction(&mut ring, 7, 0x110);
        acked_transaction(&mut ring, 8, 0x120);

        assert_eq!(checkpointer.drain(&mut ring), 2);
        assert_eq!(checkpointer.fsync_lsn(), 0x120);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_pending_events_block_drain() {
        let mut ring = TransactionRing::new();
        let mut checkpointer = Checkpointer::new(false);

        ring.begin(7).unwrap();
        let slot = ring.head_index();
        ring.record_enqueue();
        ring.commit(7, 0x110).unwrap();

        assert_eq!(checkpointer.drain(&mut ring), 0);
        assert_eq!(checkpointer.fsync_lsn(), 0);

        ring.record_ack(slot);
        assert_eq!(checkpointer.drain(&mut ring), 1);
        assert_eq!(checkpointer.fsync_lsn(), 0x110);
    }

    #[test]
    fn test_uncommitted_transaction_blocks_drain() {
        let mut ring = TransactionRing::new();
        let mut checkpointer = Checkpointer::new(false);

        // No rows yet, but commit has not arrived either.
        ring.begin(7).unwrap();
        assert_eq!(checkpointer.drain(&mut ring), 0);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_fsync_lsn_never_regresses() {
        let mut ring = TransactionRing::new();
        let mut checkpointer = Checkpointer::new(false);

        acked_transaction(&mut ring, 7, 0x200);
        checkpointer.drain(&mut ring);
        assert_eq!(checkpointer.fsync_lsn(), 0x200);

        // An out-of-order commit position must not move the cursor backwards,
        // but the transaction still retires.
        acked_transaction(&mut ring, 8, 0x150);
        assert_eq!(checkpointer.drain(&mut ring), 1);
        assert_eq!(checkpointer.fsync_lsn(), 0x200);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_snapshot_flag_clears_on_commit_drain() {
        let mut ring = TransactionRing::new();
        let mut checkpointer = Checkpointer::new(true);

        ring.begin(0).unwrap();
        let slot = ring.head_index();
        ring.record_enqueue();
        ring.record_ack(slot);

        // All rows acked but the snapshot commit has not arrived: the
        // sentinel must stay in the ring and the flag must stay set.
        assert_eq!(checkpointer.drain(&mut ring), 0);
        assert!(checkpointer.snapshot_in_progress());
        assert_eq!(ring.len(), 1);

        ring.commit(0, 0x300).unwrap();
        assert_eq!(checkpointer.drain(&mut ring), 1);
        assert!(!checkpointer.snapshot_in_progress());
        assert_eq!(checkpointer.fsync_lsn(), 0x300);
    }

    #[test]
    fn test_observe_idle_is_monotone() {
        let mut checkpointer = Checkpointer::new(false);
        checkpointer.observe_idle(0x100);
        assert_eq!(checkpointer.fsync_lsn(), 0x100);
        checkpointer.observe_idle(0x80);
        assert_eq!(checkpointer.fsync_lsn(), 0x100);
    }
}
