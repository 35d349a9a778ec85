//! Entry point for `retransmitter`.
//!
//! Parses CLI arguments and dispatches into `demo` or `simulate` mode.  All
//! retransmission logic lives in the library; `main.rs` owns only process
//! setup (logging, argument parsing) and printing.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;

use rdma_retransmitter::simulator::{Simulator, SimulatorConfig};
use rdma_retransmitter::{
    InsertRequest, OpCode, ReleaseRequest, Retransmitter, RetransmitterConfig,
    RxRetransmitRequest, TimerRetransmitRequest,
};

/// Retransmission tracking for an RDMA-style reliable transport.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Walk through insert, cumulative ACK, NAK and timeout on one queue pair.
    Demo,
    /// Drive random traffic through a spawned instance and report counters.
    Simulate {
        /// Number of queue pairs carrying traffic.
        #[arg(long, default_value_t = 8)]
        qps: u16,
        /// Number of requests to generate.
        #[arg(long, default_value_t = 10_000)]
        requests: usize,
        /// Probability that an outstanding request is reported lost (NAK).
        #[arg(long, default_value_t = 0.05)]
        loss: f64,
        /// Probability of a retransmit timeout per generated request.
        #[arg(long, default_value_t = 0.01)]
        timeout: f64,
        /// Most requests outstanding per queue pair.
        #[arg(long, default_value_t = 64)]
        window: usize,
        /// RNG seed; random when omitted.
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Demo => demo(),
        Mode::Simulate {
            qps,
            requests,
            loss,
            timeout,
            window,
            seed,
        } => {
            let seed = seed.unwrap_or_else(|| rand::rng().random());
            simulate(SimulatorConfig {
                qps,
                requests,
                loss,
                timeout,
                window,
                seed,
                ..SimulatorConfig::default()
            })
            .await
        }
    }
}

// ---------------------------------------------------------------------------
// demo
// ---------------------------------------------------------------------------

fn demo() -> Result<()> {
    let mut rt = Retransmitter::new(RetransmitterConfig::default())?;
    let tx = rt.requests();
    let qpn = 1;

    for psn in 5..=7 {
        let local = 0x1000 * psn as u64;
        let req = InsertRequest::new(qpn, psn, OpCode::RC_RDMA_WRITE_ONLY, local, 0x8000, 512)?;
        tx.try_insert(req)?;
    }
    settle(&mut rt);
    println!("after inserting psn 5..=7: {:?}", rt.pointer(qpn));

    tx.try_timer_retransmit(TimerRetransmitRequest::new(qpn))?;
    settle(&mut rt);
    for ev in rt.drain_events() {
        println!(
            "  timeout -> retransmit psn {} ({:?}, {} bytes)",
            ev.psn, ev.op_code, ev.length
        );
    }

    tx.try_release(ReleaseRequest::new(qpn, 6)?)?;
    settle(&mut rt);
    println!("after ACK psn 6: {:?}", rt.pointer(qpn));

    tx.try_rx_retransmit(RxRetransmitRequest::new(qpn, 7)?)?;
    settle(&mut rt);
    for ev in rt.drain_events() {
        println!(
            "  NAK 7 -> retransmit psn {} ({:?}, {} bytes)",
            ev.psn, ev.op_code, ev.length
        );
    }

    tx.try_release(ReleaseRequest::new(2, 100)?)?;
    settle(&mut rt);
    println!("stale ACK on qpn 2: {:?}", rt.pointer(2));

    rt.check_invariants().context("table invariants")?;
    println!("{:#?}", rt.stats());
    Ok(())
}

fn settle(rt: &mut Retransmitter) {
    rt.run_until_idle(100_000);
}

// ---------------------------------------------------------------------------
// simulate
// ---------------------------------------------------------------------------

async fn simulate(config: SimulatorConfig) -> Result<()> {
    let report = Simulator::new(config)
        .run(RetransmitterConfig::default())
        .await
        .context("simulation")?;
    println!("seed            {}", report.seed);
    println!("events          {}", report.events);
    println!(
        "slots in use    {} (model: {})",
        report.in_use_slots, report.outstanding
    );
    println!("{:#?}", report.stats);
    Ok(())
}
