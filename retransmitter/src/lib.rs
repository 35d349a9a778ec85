//! `rdma-retransmitter` — retransmission tracking for a reliable RDMA-style
//! transport.
//!
//! For every queue pair (QPN) the retransmitter remembers, in order, which
//! requests are still unacknowledged.  It re-emits them on a NAK or a
//! timeout and returns their tracking slots once a cumulative ACK covers
//! them.  It never builds or parses packets; it only handles the metadata
//! describing in-flight requests.
//!
//! # Architecture
//!
//! ```text
//!   send path ──insert──┐                      ┌──▶ RetransmitEvent ──▶ send path
//!   recv path ──ACK─────┤   ┌──────────────┐   │
//!   recv path ──NAK─────┼──▶│  Controller  │───┘
//!   timer ──────timeout─┘   └──┬────┬────┬─┘
//!                              │    │    │  request / response FIFOs
//!                  ┌───────────▼┐ ┌─▼────▼───┐ ┌──────────┐
//!                  │PointerTable│ │MetaTable │ │ FreeList │
//!                  │ head/tail  │ │ arena of │ │ slot ids │
//!                  │ per QPN    │ │ nodes    │ │          │
//!                  └────────────┘ └──────────┘ └──────────┘
//! ```
//!
//! Each table is owned by exactly one process and reached only through
//! bounded FIFOs.  The controller runs one operation at a time, which keeps
//! the single pointer-table lock and the per-QPN chains consistent.
//!
//! Each module has a single responsibility:
//! - [`types`]          — request, event and table-entry types
//! - [`config`]         — sizing constants and per-instance configuration
//! - [`fifo`]           — bounded non-blocking point-to-point FIFOs
//! - [`process`]        — the one-step-per-tick process model and task driver
//! - [`freelist`]       — slot allocator
//! - [`pointer_table`]  — per-QPN head/tail with the exclusive lock
//! - [`meta_table`]     — linked-list-in-array tracking table
//! - [`controller`]     — the orchestrating state machine
//! - [`retransmitter`]  — wiring, tick harness, inspection, async spawn
//! - [`simulator`]      — randomised traffic driver checked against a model

pub mod config;
pub mod controller;
pub mod fifo;
pub mod freelist;
pub mod meta_table;
pub mod pointer_table;
pub mod process;
pub mod retransmitter;
pub mod simulator;
pub mod types;

pub use config::{ConfigError, RetransmitterConfig};
pub use controller::ControllerStats;
pub use retransmitter::{
    InvariantViolation, RequestSender, Retransmitter, RetransmitterHandle, SubmitError,
};
pub use types::{
    InsertRequest, OpCode, PointerEntry, Psn, Qpn, ReleaseRequest, Request, RequestError,
    RetransmitEvent, RxRetransmitRequest, SlotId, TimerRetransmitRequest, TrackedRequest,
};
