//! Cancellable execution contexts
//!
//! A [`Context`] is threaded through pool → worker → runner. Cancelling it
//! makes every receive loop that selects on [`Context::done`] exit, and
//! every derived context is cancelled with it.
//!
//! ```text
//! background ──with_cancel──> run ctx ──with_timeout──> per-query ctx
//!                  │                          │
//!             CancelGuard               CancelGuard (dropped on return)
//! ```

use crate::error::Error;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Cancellable, optionally deadline-bound execution context
///
/// Cloning is cheap and every clone observes the same cancellation.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    deadline: Option<Instant>,
    state: Mutex<State>,
    /// Disconnected exactly when the context is cancelled
    done_rx: Receiver<()>,
}

struct State {
    reason: Option<Error>,
    done_tx: Option<Sender<()>>,
    children: Vec<Weak<Inner>>,
}

impl Inner {
    fn new(deadline: Option<Instant>) -> Arc<Self> {
        let (done_tx, done_rx) = channel::bounded(0);
        Arc::new(Self {
            deadline,
            state: Mutex::new(State {
                reason: None,
                done_tx: Some(done_tx),
                children: Vec::new(),
            }),
            done_rx,
        })
    }

    fn cancel(&self, reason: Error) {
        let children = {
            let mut state = self.state.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason.clone());
            state.done_tx = None;
            std::mem::take(&mut state.children)
        };

        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason.clone());
        }
    }

    fn err(&self) -> Option<Error> {
        if let Some(reason) = self.state.lock().reason.clone() {
            return Some(reason);
        }
        // Covers a deadline whose timer thread could not be spawned.
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.cancel(Error::DeadlineExceeded);
                self.state.lock().reason.clone()
            }
            _ => None,
        }
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self {
            inner: Inner::new(None),
        }
    }

    /// Derive a child that is cancelled when the guard is dropped
    pub fn with_cancel(parent: &Context) -> (Self, CancelGuard) {
        Self::derive(parent, None)
    }

    /// Derive a child that is cancelled after `timeout`
    pub fn with_timeout(parent: &Context, timeout: Duration) -> (Self, CancelGuard) {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(parent, deadline),
            None => Self::derive(parent, None),
        }
    }

    /// Derive a child that is cancelled at `deadline`
    ///
    /// The effective deadline is the earlier of `deadline` and the
    /// parent's own deadline. Each such context owns a timer thread until it
    /// is cancelled or its deadline fires.
    pub fn with_deadline(parent: &Context, deadline: Instant) -> (Self, CancelGuard) {
        Self::derive(parent, Some(deadline))
    }

    fn derive(parent: &Context, deadline: Option<Instant>) -> (Self, CancelGuard) {
        let deadline = match (parent.inner.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let child = Inner::new(deadline);

        let mut state = parent.inner.state.lock();
        if let Some(reason) = state.reason.clone() {
            drop(state);
            child.cancel(reason);
        } else {
            state.children.retain(|c| c.strong_count() > 0);
            state.children.push(Arc::downgrade(&child));
            drop(state);

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    child.cancel(Error::DeadlineExceeded);
                } else {
                    spawn_deadline_timer(&child, deadline);
                }
            }
        }

        let guard = CancelGuard {
            inner: Arc::clone(&child),
        };
        (Self { inner: child }, guard)
    }

    /// Receiver that becomes ready (disconnected) once the context is cancelled
    ///
    /// Meant for `crossbeam::select!`; no value is ever sent on it.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }

    /// `None` while live, otherwise why the context was cancelled
    pub fn err(&self) -> Option<Error> {
        self.inner.err()
    }

    /// True once the context is cancelled
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The effective deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Block for `duration` unless the context is cancelled first
    pub fn sleep(&self, duration: Duration) -> Result<(), Error> {
        crossbeam::select! {
            recv(self.done()) -> _ => Err(self.err().unwrap_or(Error::Canceled)),
            recv(channel::after(duration)) -> _ => Ok(()),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

/// Cancels its context when dropped
///
/// Bind it to a named variable (`_cancel`), not `_`, or the context is
/// cancelled immediately.
#[must_use = "dropping the guard cancels the context"]
pub struct CancelGuard {
    inner: Arc<Inner>,
}

impl CancelGuard {
    /// Cancel now instead of on drop
    pub fn cancel(&self) {
        self.inner.cancel(Error::Canceled);
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.inner.cancel(Error::Canceled);
    }
}

impl fmt::Debug for CancelGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelGuard").finish_non_exhaustive()
    }
}

/// The timer exits as soon as the context is cancelled for any reason.
fn spawn_deadline_timer(inner: &Arc<Inner>, deadline: Instant) {
    let weak = Arc::downgrade(inner);
    let released = inner.done_rx.clone();

    let spawned = thread::Builder::new()
        .name("context-deadline".to_string())
        .spawn(move || {
            crossbeam::select! {
                recv(channel::at(deadline)) -> _ => {
                    if let Some(inner) = weak.upgrade() {
                        inner.cancel(Error::DeadlineExceeded);
                    }
                }
                recv(released) -> _ => {}
            }
        });

    if let Err(err) = spawned {
        tracing::debug!(error = %err, "deadline timer not spawned, deadline checked lazily");
    }
}
