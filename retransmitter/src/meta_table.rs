//! Tracking table: one [`TrackedRequest`] node per slot id.
//!
//! The table is an arena.  Each connection's outstanding requests form a
//! singly linked chain through the `next` field, addressed by slot id; the
//! head and tail of each chain live in the pointer table.
//!
//! One request is serviced per tick.  Only reads produce a response, and
//! the request is held back while the response FIFO is full.

use crate::fifo::{FifoRx, FifoTx};
use crate::process::{Process, Step};
use crate::types::{SlotId, TrackedRequest};

/// Operation on a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaOp {
    /// Replace the whole node.
    Write(TrackedRequest),
    /// Link the node to `next` and clear its tail flag; other fields kept.
    Append { next: SlotId },
    /// Return the node on the response FIFO.
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaRequest {
    pub slot: SlotId,
    pub op: MetaOp,
}

impl MetaRequest {
    pub fn read(slot: SlotId) -> Self {
        Self {
            slot,
            op: MetaOp::Read,
        }
    }

    pub fn append(slot: SlotId, next: SlotId) -> Self {
        Self {
            slot,
            op: MetaOp::Append { next },
        }
    }

    pub fn write(slot: SlotId, entry: TrackedRequest) -> Self {
        Self {
            slot,
            op: MetaOp::Write(entry),
        }
    }
}

#[derive(Debug)]
pub struct MetaTable {
    nodes: Vec<TrackedRequest>,
    req_rx: FifoRx<MetaRequest>,
    rsp_tx: FifoTx<TrackedRequest>,
}

impl MetaTable {
    pub fn new(
        capacity: usize,
        req_rx: FifoRx<MetaRequest>,
        rsp_tx: FifoTx<TrackedRequest>,
    ) -> Self {
        Self {
            nodes: vec![TrackedRequest::default(); capacity],
            req_rx,
            rsp_tx,
        }
    }

    /// Node stored at `slot`, or `None` when out of range.
    pub fn node(&self, slot: SlotId) -> Option<&TrackedRequest> {
        self.nodes.get(slot as usize)
    }
}

impl Process for MetaTable {
    fn name(&self) -> &'static str {
        "meta"
    }

    fn step(&mut self) -> Step {
        let Some(&req) = self.req_rx.peek() else {
            return Step::Idle;
        };
        if req.op == MetaOp::Read && self.rsp_tx.is_full() {
            return Step::Idle;
        }
        self.req_rx.read();

        let idx = req.slot as usize;
        if idx >= self.nodes.len() {
            log::warn!("[meta] {:?} on slot {} outside the table", req.op, req.slot);
            if req.op == MetaOp::Read {
                if let Err(e) = self.rsp_tx.write(TrackedRequest::default()) {
                    log::warn!("[meta] read of slot {} lost: {e}", req.slot);
                }
            }
            return Step::Progress;
        }

        match req.op {
            MetaOp::Write(entry) => self.nodes[idx] = entry,
            MetaOp::Append { next } => {
                let node = &mut self.nodes[idx];
                node.next = next;
                node.is_tail = false;
            }
            MetaOp::Read => {
                if let Err(e) = self.rsp_tx.write(self.nodes[idx]) {
                    log::warn!("[meta] read of slot {} lost: {e}", req.slot);
                }
            }
        }
        Step::Progress
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::fifo;
    use crate::types::{InsertRequest, OpCode};

    fn setup() -> (MetaTable, FifoTx<MetaRequest>, FifoRx<TrackedRequest>) {
        let (req_tx, req_rx) = fifo(2);
        let (rsp_tx, rsp_rx) = fifo(2);
        (MetaTable::new(8, req_rx, rsp_tx), req_tx, rsp_rx)
    }

    fn node(psn: u32) -> TrackedRequest {
        let req = InsertRequest::new(1, psn, OpCode::RC_SEND_ONLY, 0x100, 0x200, 16).unwrap();
        TrackedRequest::new_tail(&req)
    }

    #[test]
    fn write_then_read() {
        let (mut t, req_tx, mut rsp_rx) = setup();
        req_tx.write(MetaRequest::write(3, node(5))).unwrap();
        t.step();
        assert!(rsp_rx.read().is_none()); // writes do not answer

        req_tx.write(MetaRequest::read(3)).unwrap();
        t.step();
        assert_eq!(rsp_rx.read(), Some(node(5)));
    }

    #[test]
    fn append_only_touches_link_fields() {
        let (mut t, req_tx, _rsp_rx) = setup();
        req_tx.write(MetaRequest::write(0, node(5))).unwrap();
        t.step();
        req_tx.write(MetaRequest::append(0, 4)).unwrap();
        t.step();

        let n = t.node(0).unwrap();
        assert_eq!(n.next, 4);
        assert!(!n.is_tail);
        assert!(n.valid);
        assert_eq!(n.psn, 5);
        assert_eq!(n.length, 16);
    }

    #[test]
    fn read_waits_for_response_space() {
        let (mut t, req_tx, mut rsp_rx) = setup();
        req_tx.write(MetaRequest::read(0)).unwrap();
        t.step();
        req_tx.write(MetaRequest::read(1)).unwrap();
        t.step();

        req_tx.write(MetaRequest::read(2)).unwrap();
        assert_eq!(t.step(), Step::Idle);

        rsp_rx.read();
        assert_eq!(t.step(), Step::Progress);
    }

    #[test]
    fn out_of_range_read_answers_invalid_node() {
        let (mut t, req_tx, mut rsp_rx) = setup();
        req_tx.write(MetaRequest::read(100)).unwrap();
        t.step();
        let n = rsp_rx.read().unwrap();
        assert!(!n.valid);
    }

    #[test]
    fn lost_read_response_still_consumes_request() {
        let (mut t, req_tx, rsp_rx) = setup();
        drop(rsp_rx);

        req_tx.write(MetaRequest::read(100)).unwrap();
        req_tx.write(MetaRequest::read(1)).unwrap();
        assert_eq!(t.step(), Step::Progress);
        assert_eq!(t.step(), Step::Progress);
        assert_eq!(t.step(), Step::Idle);
    }
}
