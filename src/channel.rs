//! Pool-owned input lines
//!
//! Each worker reads from a private [`Line`]. The pool creates every line
//! and is the only party that closes one; workers only hold the receiving
//! end and, for [`Worker::enqueue`](crate::worker::Worker::enqueue), a
//! shared handle to the same line.

use crate::context::Context;
use crate::error::{Error, Result};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache line size for padding (typically 64 bytes on x86-64)
const CACHE_LINE_SIZE: usize = 64;

/// Handoff counters for one line
#[repr(align(64))]
#[derive(Debug)]
pub struct LineStats {
    /// Items handed off to the receiver
    pub handed_off: AtomicU64,

    /// Sends that failed because the line was closed or the send was cancelled
    pub dropped: AtomicU64,

    _padding: [u8; CACHE_LINE_SIZE - 16],
}

impl Default for LineStats {
    fn default() -> Self {
        Self {
            handed_off: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            _padding: [0; CACHE_LINE_SIZE - 16],
        }
    }
}

impl LineStats {
    /// Number of items handed off
    pub fn handed_off(&self) -> u64 {
        self.handed_off.load(Ordering::Relaxed)
    }

    /// Number of items that never reached the receiver
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A closable single-consumer line
///
/// A zero-capacity line is a rendezvous: a send completes only when the
/// consumer takes the item, which is what gives a saturated worker its
/// backpressure.
pub struct Line<T> {
    tx: RwLock<Option<Sender<T>>>,
    rx: Receiver<T>,
    stats: LineStats,
}

impl<T> Line<T> {
    /// Create a rendezvous line
    pub fn rendezvous() -> Self {
        Self::with_capacity(0)
    }

    /// Create a line buffering up to `capacity` items
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self {
            tx: RwLock::new(Some(tx)),
            rx,
            stats: LineStats::default(),
        }
    }

    /// The receiving end
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }

    // The sender is cloned out so a blocked send never holds the lock that
    // `close` needs.
    fn sender(&self) -> Result<Sender<T>> {
        self.tx.read().as_ref().cloned().ok_or(Error::LineClosed)
    }

    /// Blocking send
    ///
    /// Fails with [`Error::LineClosed`] if the line was closed before the
    /// item could be handed off.
    pub fn send(&self, item: T) -> Result<()> {
        let res = self.sender().and_then(|tx| tx.send(item).map_err(Error::from));
        self.record(res)
    }

    /// Blocking send raced against cancellation of `ctx`
    pub fn send_cancellable(&self, ctx: &Context, item: T) -> Result<()> {
        let res = self.sender().and_then(|tx| {
            crossbeam::select! {
                send(tx, item) -> res => res.map_err(Error::from),
                recv(ctx.done()) -> _ => Err(ctx.err().unwrap_or(Error::Canceled)),
            }
        });
        self.record(res)
    }

    fn record(&self, res: Result<()>) -> Result<()> {
        match &res {
            Ok(()) => self.stats.handed_off.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.dropped.fetch_add(1, Ordering::Relaxed),
        };
        res
    }

    /// Close the line
    ///
    /// The receiver observes disconnection once every in-progress send has
    /// finished. Returns `false` if the line was already closed.
    pub fn close(&self) -> bool {
        self.tx.write().take().is_some()
    }

    /// True once [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }

    /// Handoff counters
    pub fn stats(&self) -> &LineStats {
        &self.stats
    }
}
