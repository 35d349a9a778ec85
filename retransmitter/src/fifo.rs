//! Bounded point-to-point FIFOs between processes.
//!
//! Every connection between two processes is a [`fifo`]: a bounded
//! `tokio::sync::mpsc` channel whose ends expose the non-blocking checks a
//! process needs to take one atomic step:
//!
//! - [`FifoRx::is_empty`] / [`FifoRx::peek`] look at the next item without
//!   consuming it, so a step can decide whether it is able to proceed before
//!   it commits to anything.
//! - [`FifoTx::is_full`] tells a producer whether a `write` would succeed.
//!
//! A process that writes to several FIFOs in one step checks all of them with
//! `is_full` first and only then writes.  Each FIFO has exactly one consumer,
//! so space seen by the producer cannot disappear before the write.
//!
//! The receive end holds one peeked item outside the channel, so a FIFO of
//! depth `d` can hold `d + 1` items while something is being peeked.

use std::fmt;

use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Why a write did not happen.  The rejected item is handed back.
#[derive(PartialEq, Eq)]
pub enum FifoError<T> {
    /// No space left; retry on a later tick.
    Full(T),
    /// The consumer is gone.
    Closed(T),
}

impl<T> FifoError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(v) | Self::Closed(v) => v,
        }
    }
}

impl<T> fmt::Debug for FifoError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for FifoError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "fifo is full"),
            Self::Closed(_) => write!(f, "fifo consumer closed"),
        }
    }
}

impl<T> std::error::Error for FifoError<T> {}

impl<T> From<TrySendError<T>> for FifoError<T> {
    fn from(e: TrySendError<T>) -> Self {
        match e {
            TrySendError::Full(v) => Self::Full(v),
            TrySendError::Closed(v) => Self::Closed(v),
        }
    }
}

// ---------------------------------------------------------------------------
// Constructor
// ---------------------------------------------------------------------------

/// Create a FIFO holding up to `depth` items.
///
/// # Panics
///
/// Panics if `depth` is zero.
pub fn fifo<T>(depth: usize) -> (FifoTx<T>, FifoRx<T>) {
    let (tx, rx) = mpsc::channel(depth);
    (FifoTx { inner: tx }, FifoRx { inner: rx, head: None })
}

// ---------------------------------------------------------------------------
// Producer end
// ---------------------------------------------------------------------------

/// Producer end of a FIFO.
#[derive(Debug)]
pub struct FifoTx<T> {
    inner: mpsc::Sender<T>,
}

impl<T> Clone for FifoTx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> FifoTx<T> {
    /// `true` when a `write` would be rejected for lack of space.
    pub fn is_full(&self) -> bool {
        self.inner.capacity() == 0
    }

    /// `true` when the consumer end has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Non-blocking write.
    pub fn write(&self, value: T) -> Result<(), FifoError<T>> {
        self.inner.try_send(value).map_err(FifoError::from)
    }

    /// Wait for space, then write.
    pub async fn send(&self, value: T) -> Result<(), FifoError<T>> {
        self.inner
            .send(value)
            .await
            .map_err(|mpsc::error::SendError(v)| FifoError::Closed(v))
    }
}

// ---------------------------------------------------------------------------
// Consumer end
// ---------------------------------------------------------------------------

/// Consumer end of a FIFO.
#[derive(Debug)]
pub struct FifoRx<T> {
    inner: mpsc::Receiver<T>,
    /// Item pulled out of the channel by `peek`/`is_empty` but not yet read.
    head: Option<T>,
}

impl<T> FifoRx<T> {
    fn fill(&mut self) {
        if self.head.is_none() {
            match self.inner.try_recv() {
                Ok(v) => self.head = Some(v),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
        }
    }

    /// `true` when there is nothing to read this tick.
    pub fn is_empty(&mut self) -> bool {
        self.fill();
        self.head.is_none()
    }

    /// Look at the next item without consuming it.
    pub fn peek(&mut self) -> Option<&T> {
        self.fill();
        self.head.as_ref()
    }

    /// Non-blocking read.
    pub fn read(&mut self) -> Option<T> {
        self.fill();
        self.head.take()
    }

    /// Wait for the next item.  Returns `None` once every producer is gone
    /// and the FIFO is drained.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(v) = self.head.take() {
            return Some(v);
        }
        self.inner.recv().await
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.inner.len() + usize::from(self.head.is_some())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
