//! Connection pointer table.
//!
//! Holds one [`PointerEntry`] (head slot, tail slot, valid) per QPN and
//! serialises access to it with a single exclusive lock.
//!
//! # Locking contract
//!
//! A lookup with `lock = true` takes the lock; an [`PointerUpdate`] for the
//! locked QPN releases it.  While the lock is held, one further locking
//! request is parked in a single waiting slot and served on the first tick
//! after the lock is released.  Nothing else is read from the request FIFO
//! while a request is parked.  Non-locking lookups are answered straight
//! away as long as nobody is waiting.
//!
//! One lock with one waiting slot is only enough because the controller is
//! the single requester and runs one operation at a time.  More than one
//! concurrent requester needs a real per-QPN lock or a request queue.
//!
//! Per tick, in priority order: apply an update; take a request; serve the
//! parked request once the lock is free.

use crate::fifo::{FifoRx, FifoTx};
use crate::process::{Process, Step};
use crate::types::{PointerEntry, Qpn};

/// Lookup of one QPN's entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerRequest {
    pub qpn: Qpn,
    pub lock: bool,
}

impl PointerRequest {
    pub fn lookup(qpn: Qpn) -> Self {
        Self { qpn, lock: false }
    }

    pub fn lock(qpn: Qpn) -> Self {
        Self { qpn, lock: true }
    }
}

/// Overwrite of one QPN's entry; releases the lock if it is held for `qpn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerUpdate {
    pub qpn: Qpn,
    pub entry: PointerEntry,
}

#[derive(Debug)]
pub struct PointerTable {
    entries: Vec<PointerEntry>,
    req_rx: FifoRx<PointerRequest>,
    upd_rx: FifoRx<PointerUpdate>,
    rsp_tx: FifoTx<PointerEntry>,
    /// QPN currently holding the lock.
    locked: Option<Qpn>,
    /// Locking request parked until the lock is released.
    waiting: Option<PointerRequest>,
}

impl PointerTable {
    pub fn new(
        max_qps: usize,
        req_rx: FifoRx<PointerRequest>,
        upd_rx: FifoRx<PointerUpdate>,
        rsp_tx: FifoTx<PointerEntry>,
    ) -> Self {
        Self {
            entries: vec![PointerEntry::default(); max_qps],
            req_rx,
            upd_rx,
            rsp_tx,
            locked: None,
            waiting: None,
        }
    }

    /// Current entry of `qpn`, or `None` when out of range.
    pub fn entry(&self, qpn: Qpn) -> Option<PointerEntry> {
        self.entries.get(qpn as usize).copied()
    }

    /// QPN holding the lock, if any.
    pub fn locked(&self) -> Option<Qpn> {
        self.locked
    }

    /// `true` while a locking request is parked.
    pub fn has_waiter(&self) -> bool {
        self.waiting.is_some()
    }

    fn read_entry(&self, qpn: Qpn) -> PointerEntry {
        match self.entries.get(qpn as usize) {
            Some(e) => *e,
            None => {
                log::warn!("[pointer] lookup of qpn {qpn} outside the table");
                PointerEntry::default()
            }
        }
    }

    fn respond(&mut self, req: PointerRequest) {
        let entry = self.read_entry(req.qpn);
        if let Err(e) = self.rsp_tx.write(entry) {
            log::warn!("[pointer] response for qpn {} lost: {e}", req.qpn);
            return;
        }
        if req.lock {
            log::trace!("[pointer] qpn {} locked", req.qpn);
            self.locked = Some(req.qpn);
        }
    }
}

impl Process for PointerTable {
    fn name(&self) -> &'static str {
        "pointer"
    }

    fn step(&mut self) -> Step {
        if let Some(upd) = self.upd_rx.read() {
            match self.entries.get_mut(upd.qpn as usize) {
                Some(slot) => *slot = upd.entry,
                None => log::warn!("[pointer] update of qpn {} outside the table", upd.qpn),
            }
            if self.locked == Some(upd.qpn) {
                log::trace!("[pointer] qpn {} unlocked", upd.qpn);
                self.locked = None;
            }
            return Step::Progress;
        }

        if self.waiting.is_none() {
            if let Some(&req) = self.req_rx.peek() {
                if req.lock && self.locked.is_some() {
                    self.req_rx.read();
                    log::trace!("[pointer] qpn {} waits for the lock", req.qpn);
                    self.waiting = Some(req);
                    return Step::Progress;
                }
                if self.rsp_tx.is_full() {
                    return Step::Idle;
                }
                self.req_rx.read();
                self.respond(req);
                return Step::Progress;
            }
            return Step::Idle;
        }

        if self.locked.is_none() && !self.rsp_tx.is_full() {
            if let Some(req) = self.waiting.take() {
                self.respond(req);
                return Step::Progress;
            }
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

    struct Harness {
        table: PointerTable,
        req_tx: FifoTx<PointerRequest>,
        upd_tx: FifoTx<PointerUpdate>,
        rsp_rx: FifoRx<PointerEntry>,
    }

    fn harness(max_qps: usize) -> Harness {
        let (req_tx, req_rx) = fifo(2);
        let (upd_tx, upd_rx) = fifo(2);
        let (rsp_tx, rsp_rx) = fifo(2);
        Harness {
            table: PointerTable::new(max_qps, req_rx, upd_rx, rsp_tx),
            req_tx,
            upd_tx,
            rsp_rx,
        }
    }

    fn valid(head: u16, tail: u16) -> PointerEntry {
        PointerEntry {
            head,
            tail,
            valid: true,
        }
    }

    #[test]
    fn lookup_returns_stored_entry() {
        let mut h = harness(4);
        h.upd_tx
            .write(PointerUpdate {
                qpn: 2,
                entry: valid(3, 5),
            })
            .unwrap();
        h.table.step();

        h.req_tx.write(PointerRequest::lookup(2)).unwrap();
        assert_eq!(h.table.step(), Step::Progress);
        assert_eq!(h.rsp_rx.read(), Some(valid(3, 5)));
        assert_eq!(h.table.locked(), None);
    }

    #[test]
    fn second_lock_waits_for_update() {
        let mut h = harness(4);

        h.req_tx.write(PointerRequest::lock(1)).unwrap();
        h.table.step();
        assert_eq!(h.table.locked(), Some(1));
        assert!(h.rsp_rx.read().is_some());

        h.req_tx.write(PointerRequest::lock(2)).unwrap();
        h.table.step();
        assert!(h.table.has_waiter());
        assert!(h.rsp_rx.read().is_none());

        // Nothing is served while the lock is held.
        assert_eq!(h.table.step(), Step::Idle);
        assert!(h.rsp_rx.read().is_none());

        h.upd_tx
            .write(PointerUpdate {
                qpn: 1,
                entry: valid(0, 0),
            })
            .unwrap();
        h.table.step(); // unlocks 1
        assert_eq!(h.table.locked(), None);

        h.table.step(); // serves the waiter
        assert_eq!(h.table.locked(), Some(2));
        assert!(!h.table.has_waiter());
        assert_eq!(h.rsp_rx.read(), Some(PointerEntry::default()));
    }

    #[test]
    fn update_for_other_qpn_keeps_lock() {
        let mut h = harness(4);
        h.req_tx.write(PointerRequest::lock(1)).unwrap();
        h.table.step();

        h.upd_tx
            .write(PointerUpdate {
                qpn: 3,
                entry: valid(1, 1),
            })
            .unwrap();
        h.table.step();
        assert_eq!(h.table.locked(), Some(1));
        assert_eq!(h.table.entry(3), Some(valid(1, 1)));
    }

    #[test]
    fn non_locking_lookup_served_while_locked() {
        let mut h = harness(4);
        h.req_tx.write(PointerRequest::lock(1)).unwrap();
        h.table.step();
        h.rsp_rx.read();

        h.req_tx.write(PointerRequest::lookup(2)).unwrap();
        assert_eq!(h.table.step(), Step::Progress);
        assert!(h.rsp_rx.read().is_some());
        assert_eq!(h.table.locked(), Some(1));
    }

    #[test]
    fn out_of_range_lookup_answers_invalid() {
        let mut h = harness(2);
        h.req_tx.write(PointerRequest::lookup(9)).unwrap();
        h.table.step();
        assert_eq!(h.rsp_rx.read(), Some(PointerEntry::default()));
        assert_eq!(h.table.entry(9), None);
    }

    #[test]
    fn full_response_fifo_defers_request() {
        let mut h = harness(4);
        h.req_tx.write(PointerRequest::lookup(0)).unwrap();
        h.table.step();
        h.req_tx.write(PointerRequest::lookup(1)).unwrap();
        h.table.step();
        // Response FIFO (depth 2) is now full.
        h.req_tx.write(PointerRequest::lookup(2)).unwrap();
        assert_eq!(h.table.step(), Step::Idle);

        h.rsp_rx.read();
        assert_eq!(h.table.step(), Step::Progress);
    }
}
