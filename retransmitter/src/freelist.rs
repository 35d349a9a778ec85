//! Slot allocator (freelist handler).
//!
//! Hands tracking-table slot ids to the controller through the free FIFO and
//! takes freed ids back through the recycle FIFO.
//!
//! Per tick, in priority order:
//! 1. a recycled id waiting in the recycle FIFO is moved to the free FIFO;
//! 2. otherwise, while the startup counter is below the capacity, the next
//!    fresh id is issued (`0, 1, 2, ...`);
//! 3. otherwise nothing happens until something is recycled.
//!
//! The free FIFO is as deep as the table, so every id can be parked there at
//! once.

use crate::fifo::{FifoRx, FifoTx};
use crate::process::{Process, Step};
use crate::types::SlotId;

#[derive(Debug)]
pub struct FreeList {
    /// Freed ids coming back from the controller.
    recycle_rx: FifoRx<SlotId>,
    /// Ids available to the controller.
    free_tx: FifoTx<SlotId>,
    /// Next fresh id to issue during startup.
    counter: usize,
    capacity: usize,
}

impl FreeList {
    pub fn new(capacity: usize, recycle_rx: FifoRx<SlotId>, free_tx: FifoTx<SlotId>) -> Self {
        Self {
            recycle_rx,
            free_tx,
            counter: 0,
            capacity,
        }
    }

    /// Ids that have never been issued.
    pub fn unissued(&self) -> usize {
        self.capacity - self.counter
    }

    /// Ids freed by the controller but not yet moved to the free FIFO.
    pub fn pending_recycle(&self) -> usize {
        self.recycle_rx.len()
    }
}

impl Process for FreeList {
    fn name(&self) -> &'static str {
        "freelist"
    }

    fn step(&mut self) -> Step {
        if self.free_tx.is_full() {
            return Step::Idle;
        }

        if let Some(id) = self.recycle_rx.read() {
            if let Err(e) = self.free_tx.write(id) {
                log::warn!("[freelist] dropped recycled slot {id}: {e}");
            }
            return Step::Progress;
        }

        if self.counter < self.capacity {
            // capacity <= u16::MAX + 1, so the counter always fits
            let id = self.counter as SlotId;
            if let Err(e) = self.free_tx.write(id) {
                log::warn!("[freelist] could not issue slot {id}: {e}");
                return Step::Idle;
            }
            self.counter += 1;
            return Step::Progress;
        }

        Step::Idle
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::fifo;

    fn setup(capacity: usize) -> (FreeList, FifoTx<SlotId>, FifoRx<SlotId>) {
        let (recycle_tx, recycle_rx) = fifo(2);
        let (free_tx, free_rx) = fifo(capacity);
        (FreeList::new(capacity, recycle_rx, free_tx), recycle_tx, free_rx)
    }

    #[test]
    fn issues_fresh_ids_in_order_then_stops() {
        let (mut fl, _recycle_tx, mut free_rx) = setup(3);

        for _ in 0..3 {
            assert_eq!(fl.step(), Step::Progress);
        }
        assert_eq!(fl.step(), Step::Idle);
        assert_eq!(fl.unissued(), 0);

        assert_eq!(free_rx.read(), Some(0));
        assert_eq!(free_rx.read(), Some(1));
        assert_eq!(free_rx.read(), Some(2));
        assert_eq!(free_rx.read(), None);

        // Exhausted: nothing more without a recycle.
        assert_eq!(fl.step(), Step::Idle);
        assert_eq!(free_rx.read(), None);
    }

    #[test]
    fn recycled_id_takes_priority_over_fresh() {
        let (mut fl, recycle_tx, mut free_rx) = setup(4);

        fl.step(); // issues 0
        assert_eq!(free_rx.read(), Some(0)); // controller takes 0

        recycle_tx.write(0).unwrap();
        assert_eq!(fl.pending_recycle(), 1);
        fl.step();
        assert_eq!(free_rx.read(), Some(0));
        assert_eq!(fl.unissued(), 3);
    }

    #[test]
    fn recycled_id_reissued_after_exhaustion() {
        let (mut fl, recycle_tx, mut free_rx) = setup(2);
        fl.step();
        fl.step();
        assert_eq!(free_rx.read(), Some(0));
        assert_eq!(free_rx.read(), Some(1));

        recycle_tx.write(1).unwrap();
        assert_eq!(fl.step(), Step::Progress);
        assert_eq!(free_rx.read(), Some(1));
        assert_eq!(fl.step(), Step::Idle);
    }

    #[test]
    fn recycled_id_is_consumed_when_free_fifo_is_closed() {
        let (mut fl, recycle_tx, free_rx) = setup(2);
        fl.step();
        drop(free_rx);

        recycle_tx.write(0).unwrap();
        assert_eq!(fl.step(), Step::Progress);
        assert_eq!(fl.pending_recycle(), 0);
    }
}
