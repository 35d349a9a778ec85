//! Randomised traffic driver for a spawned instance.
//!
//! A [`Simulator`] plays the send path, the receive path and the retransmit
//! timer of a set of queue pairs at once.  Per step it picks one queue pair
//! and one of:
//!
//! | Request        | When                                               |
//! |----------------|----------------------------------------------------|
//! | Insert         | window not full, with probability 0.6              |
//! | RX retransmit  | a random outstanding PSN is lost (`loss`)          |
//! | Timer          | the retransmit timer fires (`timeout`)             |
//! | Release        | otherwise: a cumulative ACK for 1..=all outstanding |
//!
//! A queue-pair model tracks which PSNs should still be outstanding.  At the
//! end the tasks are stopped, the instance is ticked until quiet and its
//! chains are compared with the model.
//!
//! Releases outrank inserts at dispatch, so an ACK submitted while the insert
//! it covers is still queued would overtake it.  The driver therefore waits
//! until the controller has completed every submitted insert before it sends
//! an ACK or a NAK.

use std::collections::VecDeque;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::task::JoinError;
use tokio::time::Instant;

use crate::config::{ConfigError, RetransmitterConfig};
use crate::controller::ControllerStats;
use crate::retransmitter::{InvariantViolation, Retransmitter, RetransmitterHandle, SubmitError};
use crate::types::{
    InsertRequest, OpCode, Qpn, ReleaseRequest, Request, RequestError, RxRetransmitRequest,
    TimerRetransmitRequest,
};

/// Traffic parameters.
///
/// `loss` and `timeout` are probabilities in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Queue pairs carrying traffic, `0..qps`.
    pub qps: u16,
    /// Requests to generate.
    pub requests: usize,
    /// Probability that an outstanding request is reported lost.
    pub loss: f64,
    /// Probability of a retransmit timeout per step.
    pub timeout: f64,
    /// Most requests outstanding per queue pair.
    pub window: usize,
    pub seed: u64,
    /// Longest wait for the instance to catch up before giving up.
    pub stall_limit: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            qps: 8,
            requests: 10_000,
            loss: 0.05,
            timeout: 0.01,
            window: 64,
            seed: 0,
            stall_limit: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid traffic parameters: {0}")]
    Params(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("retransmitter task failed: {0}")]
    Join(#[from] JoinError),
    #[error("table invariant broken: {0}")]
    Invariant(#[from] InvariantViolation),
    #[error("no progress for {0:?} while waiting for {1} inserts")]
    Stalled(Duration, u64),
    #[error("retransmitter tracks {tracked} requests, model expects {expected}")]
    Mismatch { tracked: usize, expected: usize },
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub seed: u64,
    /// Retransmit events received.
    pub events: u64,
    /// Requests the model still considers outstanding.
    pub outstanding: usize,
    pub in_use_slots: usize,
    pub stats: ControllerStats,
}

/// Send-side view of one queue pair.
#[derive(Debug, Default)]
struct QpModel {
    next_psn: u32,
    outstanding: VecDeque<u32>,
}

pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    model: Vec<QpModel>,
    /// Inserts handed to the instance so far.
    submitted_inserts: u64,
    events: u64,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let model = (0..config.qps).map(|_| QpModel::default()).collect();
        Self {
            config,
            rng,
            model,
            submitted_inserts: 0,
            events: 0,
        }
    }

    fn check(&self, retrans: &RetransmitterConfig) -> Result<(), SimulationError> {
        let c = &self.config;
        if !(0.0..=1.0).contains(&c.loss) || !(0.0..=1.0).contains(&c.timeout) {
            return Err(SimulationError::Params("loss and timeout must be in [0, 1]"));
        }
        if c.qps == 0 || c.qps as usize > retrans.max_qps {
            return Err(SimulationError::Params("qps must be in 1..=max_qps"));
        }
        if c.window == 0 || c.qps as usize * c.window > retrans.capacity {
            return Err(SimulationError::Params("qps x window must fit the tracking slots"));
        }
        Ok(())
    }

    /// Drive `requests` steps through a freshly spawned instance.
    pub async fn run(
        mut self,
        retrans: RetransmitterConfig,
    ) -> Result<SimulationReport, SimulationError> {
        self.check(&retrans)?;
        log::info!(
            "simulate: {} qps, {} requests, loss {}, seed {}",
            self.config.qps,
            self.config.requests,
            self.config.loss,
            self.config.seed
        );

        let mut handle = Retransmitter::new(retrans)?.spawn();
        for _ in 0..self.config.requests {
            let Some(req) = self.next_request()? else {
                continue;
            };
            if !matches!(req, Request::Insert(_) | Request::TimerRetransmit(_)) {
                self.wait_for_inserts(&mut handle).await?;
            }
            self.submit(&mut handle, req).await?;
            self.drain(&mut handle);
        }
        self.wait_for_inserts(&mut handle).await?;

        let mut rt = handle.shutdown().await?;
        loop {
            rt.run_until_idle(1_000_000);
            let drained = rt.drain_events();
            if drained.is_empty() {
                break;
            }
            self.events += drained.len() as u64;
        }
        rt.check_invariants()?;

        let outstanding: usize = self.model.iter().map(|q| q.outstanding.len()).sum();
        if rt.in_use_slots() != outstanding {
            return Err(SimulationError::Mismatch {
                tracked: rt.in_use_slots(),
                expected: outstanding,
            });
        }
        Ok(SimulationReport {
            seed: self.config.seed,
            events: self.events,
            outstanding,
            in_use_slots: rt.in_use_slots(),
            stats: rt.stats(),
        })
    }

    /// Pick the next request and apply it to the model.
    fn next_request(&mut self) -> Result<Option<Request>, SimulationError> {
        let qpn: Qpn = self.rng.random_range(0..self.config.qps);
        let window = self.config.window;
        let (loss, timeout) = (self.config.loss, self.config.timeout);
        let rng = &mut self.rng;
        let qp = &mut self.model[qpn as usize];

        let req = if qp.outstanding.len() < window && rng.random_bool(0.6) {
            let psn = qp.next_psn;
            qp.next_psn += 1;
            qp.outstanding.push_back(psn);
            let op = if rng.random_bool(0.5) {
                OpCode::RC_SEND_ONLY
            } else {
                OpCode::RC_RDMA_WRITE_ONLY
            };
            let len = rng.random_range(1..=4096);
            let local = rng.random_range(0..1u64 << 40);
            self.submitted_inserts += 1;
            Request::Insert(InsertRequest::new(qpn, psn, op, local, 0, len)?)
        } else if qp.outstanding.is_empty() {
            return Ok(None);
        } else if rng.random_bool(loss) {
            let idx = rng.random_range(0..qp.outstanding.len());
            Request::RxRetransmit(RxRetransmitRequest::new(qpn, qp.outstanding[idx])?)
        } else if rng.random_bool(timeout) {
            Request::TimerRetransmit(TimerRetransmitRequest::new(qpn))
        } else {
            let k = rng.random_range(1..=qp.outstanding.len());
            let acked = qp.outstanding.drain(..k).last().unwrap_or_default();
            Request::Release(ReleaseRequest::new(qpn, acked)?)
        };
        Ok(Some(req))
    }

    fn drain(&mut self, handle: &mut RetransmitterHandle) {
        while handle.try_event().is_some() {
            self.events += 1;
        }
    }

    async fn submit(
        &mut self,
        handle: &mut RetransmitterHandle,
        req: Request,
    ) -> Result<(), SimulationError> {
        let tx = handle.requests();
        let since = Instant::now();
        loop {
            match tx.try_submit(req) {
                Ok(()) => return Ok(()),
                Err(SubmitError::Full) => {
                    // The controller may be blocked on a full event FIFO.
                    self.drain(handle);
                    self.check_stall(since)?;
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Block until the controller has completed every submitted insert.
    async fn wait_for_inserts(
        &mut self,
        handle: &mut RetransmitterHandle,
    ) -> Result<(), SimulationError> {
        let since = Instant::now();
        while handle.stats().inserts < self.submitted_inserts {
            self.drain(handle);
            self.check_stall(since)?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn check_stall(&self, since: Instant) -> Result<(), SimulationError> {
        let waited = since.elapsed();
        if waited >= self.config.stall_limit {
            return Err(SimulationError::Stalled(waited, self.submitted_inserts));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
