//! Metadata types exchanged with the retransmitter.
//!
//! Nothing in this module touches a wire packet.  These are the descriptors
//! the send path hands over when it transmits a request, the acknowledgment
//! and NAK notifications produced by the receive path, and the
//! [`RetransmitEvent`]s handed back to the send path.
//!
//! # Field widths
//!
//! | Field          | Width   | Rust type |
//! |----------------|---------|-----------|
//! | QPN            | 16 bit  | [`Qpn`]   |
//! | PSN            | 24 bit  | [`Psn`]   |
//! | local address  | 48 bit  | `u64`     |
//! | remote address | 48 bit  | `u64`     |
//! | length         | 32 bit  | `u32`     |
//!
//! The `new` constructors reject values wider than the field they describe,
//! so anything that reaches a table already fits its slot.

use thiserror::Error;

/// Queue-pair number; identifies one connection.
pub type Qpn = u16;

/// Packet sequence number.  Only the low 24 bits are meaningful.
pub type Psn = u32;

/// Index of a slot in the tracking table.
pub type SlotId = u16;

/// Largest representable PSN.
pub const PSN_MAX: Psn = (1 << 24) - 1;

/// Largest representable virtual address.
pub const ADDR_MAX: u64 = (1 << 48) - 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A request carried a field that does not fit its width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("qpn {qpn} out of range (max_qps = {max_qps})")]
    QpnOutOfRange { qpn: Qpn, max_qps: usize },
    #[error("psn {0:#x} does not fit in 24 bits")]
    PsnOutOfRange(Psn),
    #[error("address {0:#x} does not fit in 48 bits")]
    AddressOutOfRange(u64),
    #[error("unknown opcode {0:#04x}")]
    UnknownOpCode(u8),
}

fn check_psn(psn: Psn) -> Result<Psn, RequestError> {
    if psn > PSN_MAX {
        return Err(RequestError::PsnOutOfRange(psn));
    }
    Ok(psn)
}

fn check_addr(addr: u64) -> Result<u64, RequestError> {
    if addr > ADDR_MAX {
        return Err(RequestError::AddressOutOfRange(addr));
    }
    Ok(addr)
}

// ---------------------------------------------------------------------------
// OpCode
// ---------------------------------------------------------------------------

/// InfiniBand reliable-connection opcodes seen by the retransmitter.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(non_camel_case_types)]
pub enum OpCode {
    RC_SEND_FIRST = 0x00,
    RC_SEND_MIDDLE = 0x01,
    RC_SEND_LAST = 0x02,
    RC_SEND_LAST_WITH_IMD = 0x03,
    #[default]
    RC_SEND_ONLY = 0x04,
    RC_SEND_ONLY_WITH_IMD = 0x05,
    RC_RDMA_WRITE_FIRST = 0x06,
    RC_RDMA_WRITE_MIDDLE = 0x07,
    RC_RDMA_WRITE_LAST = 0x08,
    RC_RDMA_WRITE_LAST_WITH_IMD = 0x09,
    RC_RDMA_WRITE_ONLY = 0x0A,
    RC_RDMA_WRITE_ONLY_WITH_IMD = 0x0B,
    RC_RDMA_READ_REQUEST = 0x0C,
    RC_RDMA_READ_RESP_FIRST = 0x0D,
    RC_RDMA_READ_RESP_MIDDLE = 0x0E,
    RC_RDMA_READ_RESP_LAST = 0x0F,
    RC_RDMA_READ_RESP_ONLY = 0x10,
    RC_ACK = 0x11,
}

impl OpCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = RequestError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use OpCode::*;
        Ok(match value {
            0x00 => RC_SEND_FIRST,
            0x01 => RC_SEND_MIDDLE,
            0x02 => RC_SEND_LAST,
            0x03 => RC_SEND_LAST_WITH_IMD,
            0x04 => RC_SEND_ONLY,
            0x05 => RC_SEND_ONLY_WITH_IMD,
            0x06 => RC_RDMA_WRITE_FIRST,
            0x07 => RC_RDMA_WRITE_MIDDLE,
            0x08 => RC_RDMA_WRITE_LAST,
            0x09 => RC_RDMA_WRITE_LAST_WITH_IMD,
            0x0A => RC_RDMA_WRITE_ONLY,
            0x0B => RC_RDMA_WRITE_ONLY_WITH_IMD,
            0x0C => RC_RDMA_READ_REQUEST,
            0x0D => RC_RDMA_READ_RESP_FIRST,
            0x0E => RC_RDMA_READ_RESP_MIDDLE,
            0x0F => RC_RDMA_READ_RESP_LAST,
            0x10 => RC_RDMA_READ_RESP_ONLY,
            0x11 => RC_ACK,
            other => return Err(RequestError::UnknownOpCode(other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Inbound requests
// ---------------------------------------------------------------------------

/// A request the send path just transmitted and wants tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertRequest {
    pub qpn: Qpn,
    pub psn: Psn,
    pub op_code: OpCode,
    pub local_addr: u64,
    pub remote_addr: u64,
    pub length: u32,
}

impl InsertRequest {
    pub fn new(
        qpn: Qpn,
        psn: Psn,
        op_code: OpCode,
        local_addr: u64,
        remote_addr: u64,
        length: u32,
    ) -> Result<Self, RequestError> {
        Ok(Self {
            qpn,
            psn: check_psn(psn)?,
            op_code,
            local_addr: check_addr(local_addr)?,
            remote_addr: check_addr(remote_addr)?,
            length,
        })
    }
}

/// Cumulative acknowledgment: everything up to and including
/// `latest_acked` was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub qpn: Qpn,
    pub latest_acked: Psn,
}

impl ReleaseRequest {
    pub fn new(qpn: Qpn, latest_acked: Psn) -> Result<Self, RequestError> {
        Ok(Self {
            qpn,
            latest_acked: check_psn(latest_acked)?,
        })
    }
}

/// Explicit NAK naming one lost PSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxRetransmitRequest {
    pub qpn: Qpn,
    pub psn: Psn,
}

impl RxRetransmitRequest {
    pub fn new(qpn: Qpn, psn: Psn) -> Result<Self, RequestError> {
        Ok(Self {
            qpn,
            psn: check_psn(psn)?,
        })
    }
}

/// Retransmit timeout for a connection: resend everything from head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRetransmitRequest {
    pub qpn: Qpn,
}

impl TimerRetransmitRequest {
    pub fn new(qpn: Qpn) -> Self {
        Self { qpn }
    }
}

/// Any request accepted by the retransmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Insert(InsertRequest),
    Release(ReleaseRequest),
    RxRetransmit(RxRetransmitRequest),
    TimerRetransmit(TimerRetransmitRequest),
}

impl Request {
    pub fn qpn(&self) -> Qpn {
        match self {
            Request::Insert(r) => r.qpn,
            Request::Release(r) => r.qpn,
            Request::RxRetransmit(r) => r.qpn,
            Request::TimerRetransmit(r) => r.qpn,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound event
// ---------------------------------------------------------------------------

/// Instructs the send path to emit one request again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitEvent {
    pub op_code: OpCode,
    pub qpn: Qpn,
    pub local_addr: u64,
    pub remote_addr: u64,
    pub length: u32,
    pub psn: Psn,
}

// ---------------------------------------------------------------------------
// Table entries
// ---------------------------------------------------------------------------

/// Head and tail of one connection's chain.
///
/// `head`/`tail` are meaningless while `valid` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerEntry {
    pub head: SlotId,
    pub tail: SlotId,
    pub valid: bool,
}

/// One node of a per-connection chain, stored at its slot id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackedRequest {
    pub psn: Psn,
    pub op_code: OpCode,
    pub local_addr: u64,
    pub remote_addr: u64,
    pub length: u32,
    pub next: SlotId,
    pub valid: bool,
    pub is_tail: bool,
}

impl TrackedRequest {
    /// A freshly inserted node: valid, and the tail of its chain.
    pub fn new_tail(req: &InsertRequest) -> Self {
        Self {
            psn: req.psn,
            op_code: req.op_code,
            local_addr: req.local_addr,
            remote_addr: req.remote_addr,
            length: req.length,
            next: 0,
            valid: true,
            is_tail: true,
        }
    }

    pub fn to_event(&self, qpn: Qpn) -> RetransmitEvent {
        RetransmitEvent {
            op_code: self.op_code,
            qpn,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            length: self.length,
            psn: self.psn,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_wide_psn() {
        let err = InsertRequest::new(1, PSN_MAX + 1, OpCode::RC_SEND_ONLY, 0, 0, 0).unwrap_err();
        assert_eq!(err, RequestError::PsnOutOfRange(PSN_MAX + 1));
    }

    #[test]
    fn insert_rejects_wide_address() {
        let err =
            InsertRequest::new(1, 0, OpCode::RC_SEND_ONLY, ADDR_MAX + 1, 0, 0).unwrap_err();
        assert_eq!(err, RequestError::AddressOutOfRange(ADDR_MAX + 1));

        let err =
            InsertRequest::new(1, 0, OpCode::RC_SEND_ONLY, 0, ADDR_MAX + 1, 0).unwrap_err();
        assert_eq!(err, RequestError::AddressOutOfRange(ADDR_MAX + 1));
    }

    #[test]
    fn insert_accepts_max_widths() {
        let req =
            InsertRequest::new(7, PSN_MAX, OpCode::RC_RDMA_WRITE_ONLY, ADDR_MAX, ADDR_MAX, u32::MAX)
                .unwrap();
        assert_eq!(req.psn, PSN_MAX);
        assert_eq!(req.local_addr, ADDR_MAX);
    }

    #[test]
    fn opcode_round_trips_through_u8() {
        for raw in 0x00..=0x11u8 {
            let op = OpCode::try_from(raw).unwrap();
            assert_eq!(op.as_u8(), raw);
        }
        assert_eq!(OpCode::try_from(0x12), Err(RequestError::UnknownOpCode(0x12)));
    }

    #[test]
    fn new_tail_copies_request_fields() {
        let req = InsertRequest::new(3, 42, OpCode::RC_RDMA_READ_REQUEST, 0x1000, 0x2000, 64)
            .unwrap();
        let node = TrackedRequest::new_tail(&req);
        assert!(node.valid);
        assert!(node.is_tail);

        let ev = node.to_event(3);
        assert_eq!(ev.psn, 42);
        assert_eq!(ev.qpn, 3);
        assert_eq!(ev.op_code, OpCode::RC_RDMA_READ_REQUEST);
        assert_eq!(ev.local_addr, 0x1000);
        assert_eq!(ev.remote_addr, 0x2000);
        assert_eq!(ev.length, 64);
    }
}
