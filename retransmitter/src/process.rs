//! Cooperative process model.
//!
//! Each component of a retransmitter instance is a [`Process`]: it privately
//! owns its state and talks to its neighbours only through FIFOs.  One call
//! to [`Process::step`] is one scheduling tick.  The step polls its inputs,
//! and if the data it needs is there (and every FIFO it must write has
//! room) it performs exactly one unit of work.  Otherwise it reports
//! [`Step::Idle`] and leaves everything untouched.
//!
//! Two drivers exist:
//! - the synchronous tick loop in [`crate::retransmitter::Retransmitter`],
//!   which steps every process once per tick and is fully deterministic;
//! - [`spawn`], which moves a process onto its own tokio task.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The process did one unit of work.
    Progress,
    /// Nothing to do (no input, or an output had no room).
    Idle,
}

impl Step {
    pub fn is_progress(self) -> bool {
        self == Step::Progress
    }
}

/// A component that advances one atomic step per tick.
pub trait Process {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Perform at most one unit of work.  Never blocks.
    fn step(&mut self) -> Step;
}

/// Idle steps a spawned process yields through before it starts sleeping.
pub const IDLE_SPINS: u32 = 64;

/// Run `process` on its own tokio task until `shutdown` flips to `true`.
///
/// After a productive step the task yields so sibling processes on the same
/// runtime get their tick.  Idle steps also yield, up to [`IDLE_SPINS`] in a
/// row, so a reply from a sibling is picked up without a timer round trip;
/// after that the task sleeps for `idle_poll` between steps.
/// The process is handed back when the task finishes.
pub fn spawn<P>(
    mut process: P,
    mut shutdown: watch::Receiver<bool>,
    idle_poll: Duration,
) -> JoinHandle<P>
where
    P: Process + Send + 'static,
{
    tokio::spawn(async move {
        log::trace!("[{}] task started", process.name());
        let mut idle = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match process.step() {
                Step::Progress => {
                    idle = 0;
                    tokio::task::yield_now().await;
                }
                Step::Idle if idle < IDLE_SPINS => {
                    idle += 1;
                    tokio::task::yield_now().await;
                }
                Step::Idle => {
                    tokio::select! {
                        _ = tokio::time::sleep(idle_poll) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        log::trace!("[{}] task stopped", process.name());
        process
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        remaining: u32,
        steps: u32,
    }

    impl Process for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn step(&mut self) -> Step {
            if self.remaining == 0 {
                return Step::Idle;
            }
            self.remaining -= 1;
            self.steps += 1;
            Step::Progress
        }
    }

    #[tokio::test]
    async fn spawned_process_runs_until_shutdown() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn(
            Counter {
                remaining: 10,
                steps: 0,
            },
            stop_rx,
            Duration::from_millis(1),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).unwrap();

        let counter = handle.await.unwrap();
        assert_eq!(counter.steps, 10);
        assert_eq!(counter.remaining, 0);
    }

    #[tokio::test]
    async fn dropped_shutdown_sender_stops_task() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn(
            Counter {
                remaining: 0,
                steps: 0,
            },
            stop_rx,
            Duration::from_millis(1),
        );
        drop(stop_tx);
        let counter = handle.await.unwrap();
        assert_eq!(counter.steps, 0);
    }
}
