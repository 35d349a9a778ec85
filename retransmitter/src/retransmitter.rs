//! One retransmitter instance: four processes wired by FIFOs.
//!
//! ```text
//!   RequestSender                                  FifoRx<RetransmitEvent>
//!  ┌──────────────┐                                        ▲
//!  │ release      │─┐                                      │
//!  │ insert       │─┤      ┌────────────┐  ptr req/upd  ┌───┴──────────┐
//!  │ rx retrans   │─┼─────▶│ Controller │──────────────▶│ PointerTable │
//!  │ timer retrans│─┘      │            │◀──────────────│              │
//!  └──────────────┘        │            │   ptr rsp     └──────────────┘
//!                          │            │  meta req     ┌──────────────┐
//!                          │            │──────────────▶│  MetaTable   │
//!                          │            │◀──────────────│              │
//!                          └─┬────────▲─┘   meta rsp    └──────────────┘
//!                    recycle │        │ free
//!                          ┌─▼────────┴─┐
//!                          │  FreeList  │
//!                          └────────────┘
//! ```
//!
//! A [`Retransmitter`] can be driven two ways:
//!
//! **Ticked** — deterministic, used by tests and the `demo` command:
//! ```ignore
//! let mut rt = Retransmitter::new(RetransmitterConfig::default())?;
//! rt.requests().try_insert(req)?;
//! rt.run_until_idle(10_000);
//! let events = rt.drain_events();
//! ```
//!
//! **Spawned** — one tokio task per process:
//! ```ignore
//! let mut handle = Retransmitter::new(config)?.spawn();
//! handle.requests().insert(req).await?;
//! let ev = handle.next_event().await;
//! let rt = handle.shutdown().await?;
//! ```
//!
//! Multiple instances, each owning a disjoint set of connections, can run
//! side by side; routing requests to the right instance is up to the caller.

use std::collections::HashSet;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use crate::config::{ConfigError, RetransmitterConfig};
use crate::controller::{Controller, ControllerPorts, ControllerStats};
use crate::fifo::{fifo, FifoError, FifoRx, FifoTx};
use crate::freelist::FreeList;
use crate::meta_table::MetaTable;
use crate::pointer_table::PointerTable;
use crate::process::{self, Process};
use crate::types::{
    InsertRequest, PointerEntry, Qpn, ReleaseRequest, Request, RequestError, RetransmitEvent,
    RxRetransmitRequest, SlotId, TimerRetransmitRequest, TrackedRequest,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a request was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] RequestError),
    #[error("request fifo is full")]
    Full,
    #[error("retransmitter has shut down")]
    Closed,
}

impl<T> From<FifoError<T>> for SubmitError {
    fn from(e: FifoError<T>) -> Self {
        match e {
            FifoError::Full(_) => Self::Full,
            FifoError::Closed(_) => Self::Closed,
        }
    }
}

/// A broken table invariant found by [`Retransmitter::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("qpn {qpn}: chain does not reach a tail within {capacity} nodes")]
    Cycle { qpn: Qpn, capacity: usize },
    #[error("qpn {qpn}: slot {slot} in the chain holds no valid node")]
    InvalidNode { qpn: Qpn, slot: SlotId },
    #[error("qpn {qpn}: psn does not increase at slot {slot}")]
    NotIncreasing { qpn: Qpn, slot: SlotId },
    #[error("qpn {qpn}: chain ends at slot {found}, pointer says {expected}")]
    TailMismatch {
        qpn: Qpn,
        expected: SlotId,
        found: SlotId,
    },
    #[error("slot {slot} appears in more than one chain")]
    SharedSlot { slot: SlotId },
    #[error("{in_use} slots in use + {free} free != capacity {capacity}")]
    SlotAccounting {
        in_use: usize,
        free: usize,
        capacity: usize,
    },
}

// ---------------------------------------------------------------------------
// RequestSender
// ---------------------------------------------------------------------------

/// Producer side of the four request FIFOs.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct RequestSender {
    max_qps: usize,
    release_tx: FifoTx<ReleaseRequest>,
    insert_tx: FifoTx<InsertRequest>,
    rx_retrans_tx: FifoTx<RxRetransmitRequest>,
    timer_retrans_tx: FifoTx<TimerRetransmitRequest>,
}

impl RequestSender {
    fn check_qpn(&self, qpn: Qpn) -> Result<(), SubmitError> {
        if qpn as usize >= self.max_qps {
            return Err(RequestError::QpnOutOfRange {
                qpn,
                max_qps: self.max_qps,
            }
            .into());
        }
        Ok(())
    }

    pub fn try_insert(&self, req: InsertRequest) -> Result<(), SubmitError> {
        self.check_qpn(req.qpn)?;
        Ok(self.insert_tx.write(req)?)
    }

    pub fn try_release(&self, req: ReleaseRequest) -> Result<(), SubmitError> {
        self.check_qpn(req.qpn)?;
        Ok(self.release_tx.write(req)?)
    }

    pub fn try_rx_retransmit(&self, req: RxRetransmitRequest) -> Result<(), SubmitError> {
        self.check_qpn(req.qpn)?;
        Ok(self.rx_retrans_tx.write(req)?)
    }

    pub fn try_timer_retransmit(&self, req: TimerRetransmitRequest) -> Result<(), SubmitError> {
        self.check_qpn(req.qpn)?;
        Ok(self.timer_retrans_tx.write(req)?)
    }

    /// Route any request to its FIFO without waiting.
    pub fn try_submit(&self, req: Request) -> Result<(), SubmitError> {
        match req {
            Request::Insert(r) => self.try_insert(r),
            Request::Release(r) => self.try_release(r),
            Request::RxRetransmit(r) => self.try_rx_retransmit(r),
            Request::TimerRetransmit(r) => self.try_timer_retransmit(r),
        }
    }

    pub async fn insert(&self, req: InsertRequest) -> Result<(), SubmitError> {
        self.check_qpn(req.qpn)?;
        Ok(self.insert_tx.send(req).await?)
    }

    pub async fn release(&self, req: ReleaseRequest) -> Result<(), SubmitError> {
        self.check_qpn(req.qpn)?;
        Ok(self.release_tx.send(req).await?)
    }

    pub async fn rx_retransmit(&self, req: RxRetransmitRequest) -> Result<(), SubmitError> {
        self.check_qpn(req.qpn)?;
        Ok(self.rx_retrans_tx.send(req).await?)
    }

    pub async fn timer_retransmit(&self, req: TimerRetransmitRequest) -> Result<(), SubmitError> {
        self.check_qpn(req.qpn)?;
        Ok(self.timer_retrans_tx.send(req).await?)
    }

    /// Route any request to its FIFO, waiting for space.
    pub async fn submit(&self, req: Request) -> Result<(), SubmitError> {
        match req {
            Request::Insert(r) => self.insert(r).await,
            Request::Release(r) => self.release(r).await,
            Request::RxRetransmit(r) => self.rx_retransmit(r).await,
            Request::TimerRetransmit(r) => self.timer_retransmit(r).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Retransmitter
// ---------------------------------------------------------------------------

/// A complete retransmitter instance driven by explicit ticks.
#[derive(Debug)]
pub struct Retransmitter {
    config: RetransmitterConfig,
    freelist: FreeList,
    pointers: PointerTable,
    meta: MetaTable,
    controller: Controller,
    requests: RequestSender,
    events: FifoRx<RetransmitEvent>,
    ticks: u64,
}

impl Retransmitter {
    /// Build an instance and wire its FIFOs.
    ///
    /// Fails if the configuration is out of range (see
    /// [`RetransmitterConfig::validate`]).
    pub fn new(config: RetransmitterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let depth = config.fifo_depth;
        let io = config.io_depth;

        let (release_tx, release_rx) = fifo(io);
        let (insert_tx, insert_rx) = fifo(io);
        let (rx_retrans_tx, rx_retrans_rx) = fifo(io);
        let (timer_retrans_tx, timer_retrans_rx) = fifo(io);
        let (event_tx, events) = fifo(io);

        let (ptr_req_tx, ptr_req_rx) = fifo(depth);
        let (ptr_upd_tx, ptr_upd_rx) = fifo(depth);
        let (ptr_rsp_tx, ptr_rsp_rx) = fifo(depth);
        let (meta_req_tx, meta_req_rx) = fifo(depth);
        let (meta_rsp_tx, meta_rsp_rx) = fifo(depth);
        let (recycle_tx, recycle_rx) = fifo(depth);
        let (free_tx, free_rx) = fifo(config.capacity);

        let controller = Controller::new(
            config.instance_id,
            ControllerPorts {
                release_rx,
                insert_rx,
                rx_retrans_rx,
                timer_retrans_rx,
                ptr_req_tx,
                ptr_upd_tx,
                ptr_rsp_rx,
                meta_req_tx,
                meta_rsp_rx,
                free_rx,
                recycle_tx,
                event_tx,
            },
        );

        log::info!(
            "[retrans {}] instance up: {} slots, {} qps",
            config.instance_id,
            config.capacity,
            config.max_qps
        );

        Ok(Self {
            freelist: FreeList::new(config.capacity, recycle_rx, free_tx),
            pointers: PointerTable::new(config.max_qps, ptr_req_rx, ptr_upd_rx, ptr_rsp_tx),
            meta: MetaTable::new(config.capacity, meta_req_rx, meta_rsp_tx),
            controller,
            requests: RequestSender {
                max_qps: config.max_qps,
                release_tx,
                insert_tx,
                rx_retrans_tx,
                timer_retrans_tx,
            },
            events,
            ticks: 0,
            config,
        })
    }

    pub fn config(&self) -> &RetransmitterConfig {
        &self.config
    }

    /// A handle for submitting requests.
    pub fn requests(&self) -> RequestSender {
        self.requests.clone()
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Step every process once.  Returns `true` if any of them did work.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        let steps = [
            self.freelist.step(),
            self.pointers.step(),
            self.meta.step(),
            self.controller.step(),
        ];
        steps.iter().any(|s| s.is_progress())
    }

    /// Tick until a whole tick makes no progress, or `max_ticks` elapse.
    ///
    /// Returns the number of ticks run.  A full event FIFO stops progress, so
    /// drain events between calls when many retransmits are pending.
    pub fn run_until_idle(&mut self, max_ticks: usize) -> usize {
        let mut n = 0;
        while n < max_ticks {
            n += 1;
            if !self.tick() {
                break;
            }
        }
        n
    }

    /// Total ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn try_event(&mut self) -> Option<RetransmitEvent> {
        self.events.read()
    }

    pub fn drain_events(&mut self) -> Vec<RetransmitEvent> {
        std::iter::from_fn(|| self.events.read()).collect()
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn pointer(&self, qpn: Qpn) -> Option<PointerEntry> {
        self.pointers.entry(qpn)
    }

    pub fn node(&self, slot: SlotId) -> Option<TrackedRequest> {
        self.meta.node(slot).copied()
    }

    pub fn stats(&self) -> ControllerStats {
        self.controller.stats()
    }

    pub fn controller_idle(&self) -> bool {
        self.controller.is_idle()
    }

    /// Nodes of `qpn`'s chain from head to tail.
    ///
    /// Stops after `capacity` nodes, so a corrupted chain cannot loop.
    pub fn chain(&self, qpn: Qpn) -> Vec<(SlotId, TrackedRequest)> {
        let mut out = Vec::new();
        let Some(ptr) = self.pointer(qpn) else {
            return out;
        };
        if !ptr.valid {
            return out;
        }
        let mut slot = ptr.head;
        while out.len() < self.config.capacity {
            let Some(node) = self.node(slot) else {
                break;
            };
            out.push((slot, node));
            if node.is_tail || !node.valid {
                break;
            }
            slot = node.next;
        }
        out
    }

    /// Slots not held by any chain: never issued, queued for the
    /// controller, or waiting to be recycled.
    pub fn free_slots(&self) -> usize {
        self.freelist.unissued()
            + self.freelist.pending_recycle()
            + self.controller.queued_free_slots()
    }

    /// Slots held by connection chains.
    pub fn in_use_slots(&self) -> usize {
        (0..self.config.max_qps)
            .map(|q| self.chain(q as Qpn).len())
            .sum()
    }

    /// Verify the chain and slot-ownership invariants.
    ///
    /// Meaningful only when the instance is quiescent, i.e. right after
    /// [`run_until_idle`](Self::run_until_idle) returned early.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let capacity = self.config.capacity;
        let mut seen: HashSet<SlotId> = HashSet::new();

        for q in 0..self.config.max_qps {
            let qpn = q as Qpn;
            let Some(ptr) = self.pointer(qpn) else {
                continue;
            };
            if !ptr.valid {
                continue;
            }
            let chain = self.chain(qpn);
            let mut prev_psn = None;
            for &(slot, node) in &chain {
                if !node.valid {
                    return Err(InvariantViolation::InvalidNode { qpn, slot });
                }
                if prev_psn.is_some_and(|p| node.psn <= p) {
                    return Err(InvariantViolation::NotIncreasing { qpn, slot });
                }
                prev_psn = Some(node.psn);
                if !seen.insert(slot) {
                    return Err(InvariantViolation::SharedSlot { slot });
                }
            }
            match chain.last() {
                Some(&(slot, node)) if node.is_tail => {
                    if slot != ptr.tail {
                        return Err(InvariantViolation::TailMismatch {
                            qpn,
                            expected: ptr.tail,
                            found: slot,
                        });
                    }
                }
                _ => return Err(InvariantViolation::Cycle { qpn, capacity }),
            }
        }

        let in_use = seen.len();
        let free = self.free_slots();
        if self.controller.is_idle() && in_use + free != capacity {
            return Err(InvariantViolation::SlotAccounting {
                in_use,
                free,
                capacity,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Async mode
    // -----------------------------------------------------------------------

    /// Move every process onto its own tokio task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(mut self) -> RetransmitterHandle {
        let (shutdown, stop) = watch::channel(false);
        let stats = self.controller.watch_stats();
        let poll = self.config.idle_poll;
        log::debug!("[retrans {}] spawning processes", self.config.instance_id);
        RetransmitterHandle {
            freelist: process::spawn(self.freelist, stop.clone(), poll),
            pointers: process::spawn(self.pointers, stop.clone(), poll),
            meta: process::spawn(self.meta, stop.clone(), poll),
            controller: process::spawn(self.controller, stop, poll),
            shutdown,
            stats,
            requests: self.requests,
            events: self.events,
            config: self.config,
            ticks: self.ticks,
        }
    }
}

// ---------------------------------------------------------------------------
// RetransmitterHandle
// ---------------------------------------------------------------------------

/// A running instance whose processes live on tokio tasks.
pub struct RetransmitterHandle {
    freelist: JoinHandle<FreeList>,
    pointers: JoinHandle<PointerTable>,
    meta: JoinHandle<MetaTable>,
    controller: JoinHandle<Controller>,
    shutdown: watch::Sender<bool>,
    stats: watch::Receiver<ControllerStats>,
    requests: RequestSender,
    events: FifoRx<RetransmitEvent>,
    config: RetransmitterConfig,
    ticks: u64,
}

impl RetransmitterHandle {
    pub fn requests(&self) -> RequestSender {
        self.requests.clone()
    }

    /// Wait for the next retransmit event.
    pub async fn next_event(&mut self) -> Option<RetransmitEvent> {
        self.events.recv().await
    }

    pub fn try_event(&mut self) -> Option<RetransmitEvent> {
        self.events.read()
    }

    /// Controller counters as of its last completed operation.
    pub fn stats(&self) -> ControllerStats {
        *self.stats.borrow()
    }

    /// Stop every task and reassemble the ticked instance, tables intact.
    pub async fn shutdown(self) -> Result<Retransmitter, JoinError> {
        // Receivers only go away if a task already ended.
        let _ = self.shutdown.send(true);
        let freelist = self.freelist.await?;
        let pointers = self.pointers.await?;
        let meta = self.meta.await?;
        let controller = self.controller.await?;
        log::debug!("[retrans {}] processes stopped", self.config.instance_id);
        Ok(Retransmitter {
            config: self.config,
            freelist,
            pointers,
            meta,
            controller,
            requests: self.requests,
            events: self.events,
            ticks: self.ticks,
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
