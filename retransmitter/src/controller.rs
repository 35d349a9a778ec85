//! Retransmission controller.
//!
//! The only process that talks to all the others.  It accepts the four
//! request kinds, drives the pointer and tracking tables through multi-step
//! protocols, returns freed slots to the freelist and emits
//! [`RetransmitEvent`]s.
//!
//! # State machine
//!
//! ```text
//!            ┌──────────── Insert0 ──▶ Insert1 ────────────┐
//!            │                                             │
//!   Main ────┼──── Release0 ──▶ Release1 ⟲ ───────────────┼──▶ Main
//!            │                                             │
//!            ├──── Retrans0 ──▶ Retrans1 ⟲ ──▶ Retrans2 ⟲ ─┤
//!            │                                             │
//!            └──── TimerRetrans0 ──▶ TimerRetrans1 ⟲ ──────┘
//! ```
//!
//! Exactly one operation is in flight; it runs to completion before `Main`
//! dispatches the next.  Dispatch priority at `Main`: release, insert (only
//! when a free slot is available), NAK retransmit, timer retransmit.
//!
//! Each state checks every FIFO it is going to touch before consuming
//! anything, so a step that cannot finish leaves the state machine exactly
//! where it was and is retried on the next tick.
//!
//! Insert and release take the pointer-table lock and release it with their
//! final pointer update on every exit path.  Retransmits use plain lookups.
//!
//! When an observer is attached with [`Controller::watch_stats`], the
//! counters are published each time an operation completes.

use tokio::sync::watch;

use crate::fifo::{FifoRx, FifoTx};
use crate::meta_table::MetaRequest;
use crate::pointer_table::{PointerRequest, PointerUpdate};
use crate::process::{Process, Step};
use crate::types::{
    InsertRequest, PointerEntry, Qpn, ReleaseRequest, RetransmitEvent, RxRetransmitRequest,
    SlotId, TimerRetransmitRequest, TrackedRequest,
};

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Every FIFO end the controller owns.
#[derive(Debug)]
pub struct ControllerPorts {
    pub release_rx: FifoRx<ReleaseRequest>,
    pub insert_rx: FifoRx<InsertRequest>,
    pub rx_retrans_rx: FifoRx<RxRetransmitRequest>,
    pub timer_retrans_rx: FifoRx<TimerRetransmitRequest>,

    pub ptr_req_tx: FifoTx<PointerRequest>,
    pub ptr_upd_tx: FifoTx<PointerUpdate>,
    pub ptr_rsp_rx: FifoRx<PointerEntry>,

    pub meta_req_tx: FifoTx<MetaRequest>,
    pub meta_rsp_rx: FifoRx<TrackedRequest>,

    pub free_rx: FifoRx<SlotId>,
    pub recycle_tx: FifoTx<SlotId>,

    pub event_tx: FifoTx<RetransmitEvent>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Controller state; continuation states carry the operation's context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Idle; dispatch the next request.
    Main,
    /// Waiting for the locked pointer entry; `slot` is already taken.
    Insert0 { req: InsertRequest, slot: SlotId },
    /// Old tail linked; write the new node and the new tail.
    Insert1 {
        req: InsertRequest,
        slot: SlotId,
        ptr: PointerEntry,
    },
    /// Waiting for the locked pointer entry.
    Release0 { req: ReleaseRequest },
    /// Walking the chain; `ptr.head` is the node whose read is outstanding.
    Release1 {
        req: ReleaseRequest,
        ptr: PointerEntry,
        freed: usize,
    },
    /// Waiting for the pointer entry.
    Retrans0 { req: RxRetransmitRequest },
    /// Searching the chain for the NAKed PSN.
    Retrans1 { req: RxRetransmitRequest },
    /// Re-emitting everything after the NAKed PSN.
    Retrans2 { qpn: Qpn },
    /// Waiting for the pointer entry.
    TimerRetrans0 { qpn: Qpn },
    /// Re-emitting the whole chain.
    TimerRetrans1 { qpn: Qpn },
}

/// Counters kept by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// Insert operations completed.
    pub inserts: u64,
    /// Release operations dispatched.
    pub releases: u64,
    /// Slots returned to the freelist.
    pub slots_freed: u64,
    /// NAK retransmit operations dispatched.
    pub rx_retransmits: u64,
    /// Timer retransmit operations dispatched.
    pub timer_retransmits: u64,
    /// Retransmit events emitted.
    pub events: u64,
    /// Releases for a connection with nothing tracked.
    pub stale_acks: u64,
    /// Releases that acknowledged less than the earliest tracked PSN.
    pub invalid_acks: u64,
    /// NAKs naming a PSN that is not tracked.
    pub unmatched_naks: u64,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Controller {
    id: u32,
    state: State,
    ports: ControllerPorts,
    stats: ControllerStats,
    observer: Option<watch::Sender<ControllerStats>>,
}

/// Write to a FIFO whose space was checked earlier in the same step.
fn push<T>(tx: &FifoTx<T>, value: T, id: u32, what: &str) {
    if let Err(e) = tx.write(value) {
        log::warn!("[retrans {id}] {what} dropped: {e}");
    }
}

impl Controller {
    pub fn new(id: u32, ports: ControllerPorts) -> Self {
        Self {
            id,
            state: State::Main,
            ports,
            stats: ControllerStats::default(),
            observer: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// `true` when no operation is in flight.
    pub fn is_idle(&self) -> bool {
        self.state == State::Main
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    /// Publish the counters to the returned receiver after every completed
    /// operation.  Replaces any earlier observer.
    pub fn watch_stats(&mut self) -> watch::Receiver<ControllerStats> {
        let (tx, rx) = watch::channel(self.stats);
        self.observer = Some(tx);
        rx
    }

    /// Free slots queued for the controller but not yet taken.
    pub fn queued_free_slots(&self) -> usize {
        self.ports.free_rx.len()
    }

    // -----------------------------------------------------------------------
    // Main: dispatch
    // -----------------------------------------------------------------------

    fn take_insert(&mut self) -> Option<(InsertRequest, SlotId)> {
        if self.ports.insert_rx.is_empty() || self.ports.free_rx.is_empty() {
            return None;
        }
        let req = self.ports.insert_rx.read()?;
        let slot = self.ports.free_rx.read()?;
        Some((req, slot))
    }

    fn dispatch(&mut self) -> Step {
        let id = self.id;
        if self.ports.ptr_req_tx.is_full() {
            return Step::Idle;
        }

        if let Some(req) = self.ports.release_rx.read() {
            log::debug!(
                "[retrans {id}] releasing qpn {} up to psn {:#x}",
                req.qpn,
                req.latest_acked
            );
            push(&self.ports.ptr_req_tx, PointerRequest::lock(req.qpn), id, "pointer lock");
            self.stats.releases += 1;
            self.state = State::Release0 { req };
            return Step::Progress;
        }

        if let Some((req, slot)) = self.take_insert() {
            log::debug!(
                "[retrans {id}] inserting qpn {} psn {:#x} into slot {slot}",
                req.qpn,
                req.psn
            );
            push(&self.ports.ptr_req_tx, PointerRequest::lock(req.qpn), id, "pointer lock");
            self.state = State::Insert0 { req, slot };
            return Step::Progress;
        }

        if let Some(req) = self.ports.rx_retrans_rx.read() {
            log::debug!(
                "[retrans {id}] NAK for qpn {} psn {:#x}",
                req.qpn,
                req.psn
            );
            push(&self.ports.ptr_req_tx, PointerRequest::lookup(req.qpn), id, "pointer lookup");
            self.stats.rx_retransmits += 1;
            self.state = State::Retrans0 { req };
            return Step::Progress;
        }

        if let Some(req) = self.ports.timer_retrans_rx.read() {
            log::debug!("[retrans {id}] timeout for qpn {}", req.qpn);
            push(&self.ports.ptr_req_tx, PointerRequest::lookup(req.qpn), id, "pointer lookup");
            self.stats.timer_retransmits += 1;
            self.state = State::TimerRetrans0 { qpn: req.qpn };
            return Step::Progress;
        }

        Step::Idle
    }

    // -----------------------------------------------------------------------
    // Insert
    // -----------------------------------------------------------------------

    fn insert_0(&mut self, req: InsertRequest, slot: SlotId) -> Step {
        let id = self.id;
        if self.ports.ptr_rsp_rx.is_empty()
            || self.ports.meta_req_tx.is_full()
            || self.ports.ptr_upd_tx.is_full()
        {
            return Step::Idle;
        }
        let Some(mut ptr) = self.ports.ptr_rsp_rx.read() else {
            return Step::Idle;
        };

        if !ptr.valid {
            // First outstanding request of this connection.
            ptr = PointerEntry {
                head: slot,
                tail: slot,
                valid: true,
            };
            let node = TrackedRequest::new_tail(&req);
            push(&self.ports.meta_req_tx, MetaRequest::write(slot, node), id, "node write");
            push(
                &self.ports.ptr_upd_tx,
                PointerUpdate { qpn: req.qpn, entry: ptr },
                id,
                "pointer update",
            );
            log::debug!("[retrans {id}] qpn {} starts a chain at slot {slot}", req.qpn);
            self.stats.inserts += 1;
            self.state = State::Main;
        } else {
            push(
                &self.ports.meta_req_tx,
                MetaRequest::append(ptr.tail, slot),
                id,
                "node append",
            );
            log::debug!(
                "[retrans {id}] qpn {} appends slot {slot} after slot {}",
                req.qpn,
                ptr.tail
            );
            ptr.tail = slot;
            self.state = State::Insert1 { req, slot, ptr };
        }
        Step::Progress
    }

    fn insert_1(&mut self, req: InsertRequest, slot: SlotId, ptr: PointerEntry) -> Step {
        let id = self.id;
        if self.ports.meta_req_tx.is_full() || self.ports.ptr_upd_tx.is_full() {
            return Step::Idle;
        }
        let node = TrackedRequest::new_tail(&req);
        push(&self.ports.meta_req_tx, MetaRequest::write(slot, node), id, "node write");
        push(
            &self.ports.ptr_upd_tx,
            PointerUpdate { qpn: req.qpn, entry: ptr },
            id,
            "pointer update",
        );
        self.stats.inserts += 1;
        self.state = State::Main;
        Step::Progress
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    fn release_0(&mut self, req: ReleaseRequest) -> Step {
        let id = self.id;
        if self.ports.ptr_rsp_rx.is_empty()
            || self.ports.meta_req_tx.is_full()
            || self.ports.ptr_upd_tx.is_full()
        {
            return Step::Idle;
        }
        let Some(ptr) = self.ports.ptr_rsp_rx.read() else {
            return Step::Idle;
        };

        if ptr.valid {
            push(&self.ports.meta_req_tx, MetaRequest::read(ptr.head), id, "node read");
            self.state = State::Release1 { req, ptr, freed: 0 };
        } else {
            log::warn!(
                "[retrans {id}] stale ACK psn {:#x}: qpn {} has nothing outstanding",
                req.latest_acked,
                req.qpn
            );
            self.stats.stale_acks += 1;
            // Unlock only.
            push(
                &self.ports.ptr_upd_tx,
                PointerUpdate { qpn: req.qpn, entry: ptr },
                id,
                "pointer update",
            );
            self.state = State::Main;
        }
        Step::Progress
    }

    fn release_1(&mut self, req: ReleaseRequest, mut ptr: PointerEntry, freed: usize) -> Step {
        let id = self.id;
        if self.ports.meta_rsp_rx.is_empty()
            || self.ports.meta_req_tx.is_full()
            || self.ports.ptr_upd_tx.is_full()
            || self.ports.recycle_tx.is_full()
        {
            return Step::Idle;
        }
        let Some(node) = self.ports.meta_rsp_rx.read() else {
            return Step::Idle;
        };
        let curr = ptr.head;
        let acked = req.latest_acked;

        if !node.valid || node.psn > acked {
            if freed == 0 {
                log::warn!(
                    "[retrans {id}] invalid state: ACK psn {acked:#x} for qpn {} precedes head psn {:#x}",
                    req.qpn,
                    node.psn
                );
                self.stats.invalid_acks += 1;
            } else {
                log::debug!(
                    "[retrans {id}] ACK psn {acked:#x} for qpn {} ends before psn {:#x}, head now slot {curr}",
                    req.qpn,
                    node.psn
                );
            }
            // `curr` was not freed; it stays the head.
            push(
                &self.ports.ptr_upd_tx,
                PointerUpdate { qpn: req.qpn, entry: ptr },
                id,
                "pointer update",
            );
            self.state = State::Main;
            return Step::Progress;
        }

        if node.psn == acked {
            ptr.head = node.next;
            ptr.valid = !node.is_tail;
            push(
                &self.ports.ptr_upd_tx,
                PointerUpdate { qpn: req.qpn, entry: ptr },
                id,
                "pointer update",
            );
            self.state = State::Main;
        } else if node.is_tail {
            // ACK is ahead of everything tracked.  `head` keeps the freed
            // slot but is never read while `valid` is false.
            ptr.valid = false;
            push(
                &self.ports.ptr_upd_tx,
                PointerUpdate { qpn: req.qpn, entry: ptr },
                id,
                "pointer update",
            );
            self.state = State::Main;
        } else {
            ptr.head = node.next;
            push(&self.ports.meta_req_tx, MetaRequest::read(node.next), id, "node read");
            self.state = State::Release1 {
                req,
                ptr,
                freed: freed + 1,
            };
        }

        push(&self.ports.recycle_tx, curr, id, "slot recycle");
        self.stats.slots_freed += 1;
        log::debug!(
            "[retrans {id}] released qpn {} psn {:#x}, freed slot {curr}",
            req.qpn,
            node.psn
        );
        Step::Progress
    }

    // -----------------------------------------------------------------------
    // Retransmit
    // -----------------------------------------------------------------------

    /// Shared first step of both retransmit kinds: read the head node.
    fn retrans_lookup(&mut self, qpn: Qpn, next: State) -> Step {
        let id = self.id;
        if self.ports.ptr_rsp_rx.is_empty() || self.ports.meta_req_tx.is_full() {
            return Step::Idle;
        }
        let Some(ptr) = self.ports.ptr_rsp_rx.read() else {
            return Step::Idle;
        };
        if ptr.valid {
            push(&self.ports.meta_req_tx, MetaRequest::read(ptr.head), id, "node read");
            self.state = next;
        } else {
            log::debug!("[retrans {id}] qpn {qpn} has nothing to retransmit");
            self.state = State::Main;
        }
        Step::Progress
    }

    fn emit(&mut self, qpn: Qpn, node: &TrackedRequest) {
        log::debug!("[retrans {}] retransmitting qpn {qpn} psn {:#x}", self.id, node.psn);
        push(&self.ports.event_tx, node.to_event(qpn), self.id, "retransmit event");
        self.stats.events += 1;
    }

    /// Read the next node response, prefetching its successor.
    ///
    /// Returns `None` (and leaves everything untouched) when the response or
    /// the FIFO space needed for this step is missing.
    fn next_node(&mut self) -> Option<TrackedRequest> {
        if self.ports.meta_rsp_rx.is_empty()
            || self.ports.meta_req_tx.is_full()
            || self.ports.event_tx.is_full()
        {
            return None;
        }
        let node = self.ports.meta_rsp_rx.read()?;
        if node.valid && !node.is_tail {
            push(&self.ports.meta_req_tx, MetaRequest::read(node.next), self.id, "node read");
        }
        Some(node)
    }

    fn retrans_search(&mut self, req: RxRetransmitRequest) -> Step {
        let id = self.id;
        let Some(node) = self.next_node() else {
            return Step::Idle;
        };
        log::trace!("[retrans {id}] NAK search qpn {} at psn {:#x}", req.qpn, node.psn);

        if !node.valid {
            log::warn!("[retrans {id}] invalid node in chain of qpn {}", req.qpn);
            self.state = State::Main;
        } else if node.psn == req.psn {
            self.emit(req.qpn, &node);
            self.state = if node.is_tail {
                State::Main
            } else {
                State::Retrans2 { qpn: req.qpn }
            };
        } else if node.is_tail {
            log::warn!(
                "[retrans {id}] NAK for qpn {} psn {:#x} which is not outstanding",
                req.qpn,
                req.psn
            );
            self.stats.unmatched_naks += 1;
            self.state = State::Main;
        }
        // Otherwise stay in Retrans1 with the successor already requested.
        Step::Progress
    }

    /// Emit the node just read and keep going until the tail.
    fn retrans_stream(&mut self, qpn: Qpn, again: State) -> Step {
        let Some(node) = self.next_node() else {
            return Step::Idle;
        };
        if !node.valid {
            log::warn!("[retrans {}] invalid node in chain of qpn {qpn}", self.id);
            self.state = State::Main;
            return Step::Progress;
        }
        self.emit(qpn, &node);
        self.state = if node.is_tail { State::Main } else { again };
        Step::Progress
    }
}

impl Process for Controller {
    fn name(&self) -> &'static str {
        "controller"
    }

    fn step(&mut self) -> Step {
        let step = match self.state {
            State::Main => self.dispatch(),
            State::Insert0 { req, slot } => self.insert_0(req, slot),
            State::Insert1 { req, slot, ptr } => self.insert_1(req, slot, ptr),
            State::Release0 { req } => self.release_0(req),
            State::Release1 { req, ptr, freed } => self.release_1(req, ptr, freed),
            State::Retrans0 { req } => self.retrans_lookup(req.qpn, State::Retrans1 { req }),
            State::Retrans1 { req } => self.retrans_search(req),
            State::Retrans2 { qpn } => self.retrans_stream(qpn, State::Retrans2 { qpn }),
            State::TimerRetrans0 { qpn } => {
                self.retrans_lookup(qpn, State::TimerRetrans1 { qpn })
            }
            State::TimerRetrans1 { qpn } => {
                self.retrans_stream(qpn, State::TimerRetrans1 { qpn })
            }
        };
        if step.is_progress() && self.is_idle() {
            if let Some(observer) = &self.observer {
                observer.send_replace(self.stats);
            }
        }
        step
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
