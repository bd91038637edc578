//! Query workers
//!
//! A worker pulls queries from its private input line and executes each one
//! on its own thread, so several queries can be in flight per worker while
//! intake stays single-threaded. Results go to the output line shared by
//! every worker of a pool.
//!
//! Executions are unbounded unless `max_in_flight` is set. Each one costs a
//! thread, plus a deadline timer thread when queries run under a timeout.

use crate::channel::Line;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::query::{QueryRef, QueryResult, Runner};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Identifier of a worker: its position in the pool's worker list
pub type WorkerId = usize;

/// How often a drain re-checks its context while waiting
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Worker configuration
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Worker name, used for thread names (defaults to `worker-<id>`)
    pub name: Option<String>,

    /// Upper bound on concurrently executing queries (None = unbounded)
    pub max_in_flight: Option<usize>,
}

impl WorkerConfig {
    /// Create a new worker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bound the number of concurrently executing queries
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max);
        self
    }
}

/// Worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed, receive loop not running
    Idle,

    /// Receive loop running
    Running,

    /// Stopped and drained; terminal
    Stopped,
}

/// A consumer of one input line
pub trait Worker: Send + Sync {
    /// Stable identity, the worker's index in its pool
    fn id(&self) -> WorkerId;

    /// Run the receive loop until the input line closes, the worker is
    /// stopped, or `ctx` is cancelled (the last one returns the context's
    /// error)
    fn start(&self, ctx: &Context) -> Result<()>;

    /// Blocking send onto the worker's input line
    ///
    /// Does not observe `ctx`; callers needing a cancellable handoff race
    /// the send themselves.
    fn enqueue(&self, ctx: &Context, query: QueryRef) -> Result<()>;

    /// Signal shutdown and wait until every launched execution finished
    ///
    /// Calling it more than once is harmless.
    fn stop(&self, ctx: &Context) -> Result<()>;
}

/// Counts executions between launch and completion
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    pub(crate) fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock() += 1;
        InFlightGuard(Arc::clone(self))
    }

    pub(crate) fn len(&self) -> usize {
        *self.count.lock()
    }

    /// Block until the count reaches zero or `ctx` is cancelled
    pub(crate) fn wait_idle(&self, ctx: &Context) -> Result<()> {
        let mut count = self.count.lock();
        while *count > 0 {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            self.idle.wait_for(&mut count, DRAIN_POLL);
        }
        Ok(())
    }
}

pub(crate) struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Slot in a bounded worker; returned when dropped
struct Permit(Receiver<()>);

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.0.try_recv();
    }
}

/// The standard [`Worker`]
pub struct DefaultWorker {
    id: WorkerId,
    config: WorkerConfig,
    runner: Runner,
    input: Arc<Line<QueryRef>>,
    output: Mutex<Option<flume::Sender<QueryResult>>>,
    state: Mutex<WorkerState>,
    state_changed: Condvar,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    in_flight: Arc<InFlight>,
    permits: Option<(Sender<()>, Receiver<()>)>,
}

impl DefaultWorker {
    /// Create a worker reading from `input` and emitting into `output`
    pub fn new(
        id: WorkerId,
        runner: Runner,
        input: Arc<Line<QueryRef>>,
        output: flume::Sender<QueryResult>,
    ) -> Self {
        Self::with_config(id, runner, input, output, WorkerConfig::default())
    }

    /// Create a worker with an explicit configuration
    pub fn with_config(
        id: WorkerId,
        runner: Runner,
        input: Arc<Line<QueryRef>>,
        output: flume::Sender<QueryResult>,
        config: WorkerConfig,
    ) -> Self {
        let (done_tx, done_rx) = channel::bounded(0);
        let permits = config.max_in_flight.map(|max| channel::bounded(max.max(1)));

        Self {
            id,
            config,
            runner,
            input,
            output: Mutex::new(Some(output)),
            state: Mutex::new(WorkerState::Idle),
            state_changed: Condvar::new(),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            in_flight: Arc::new(InFlight::default()),
            permits,
        }
    }

    /// Current state
    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Number of executions launched and not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// The worker's input line
    pub fn input(&self) -> &Arc<Line<QueryRef>> {
        &self.input
    }

    fn wait_loop_exit(&self, ctx: &Context) -> Result<()> {
        let mut state = self.state.lock();
        while *state == WorkerState::Running {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            self.state_changed.wait_for(&mut state, DRAIN_POLL);
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.config
            .name
            .clone()
            .unwrap_or_else(|| format!("worker-{}", self.id))
    }

    // A full worker blocks here, stalling its intake. Only cancellation
    // ends the wait: a stop still drains queries already taken off the line.
    // A query given up on here never reaches the runner, so it is reported
    // as a failed result but leaves no stats sample.
    fn acquire_permit(&self, ctx: &Context) -> Result<Option<Permit>> {
        let Some((tx, rx)) = self.permits.as_ref() else {
            return Ok(None);
        };
        crossbeam::select! {
            send(tx, ()) -> res => {
                res?;
                Ok(Some(Permit(rx.clone())))
            }
            recv(ctx.done()) -> _ => Err(ctx.err().unwrap_or(Error::Canceled)),
        }
    }

    fn launch(&self, ctx: &Context, query: QueryRef) {
        let guard = self.in_flight.enter();
        let permit = match self.acquire_permit(ctx) {
            Ok(permit) => permit,
            Err(err) => {
                tracing::debug!(worker = self.id, entity = query.entity_id(), %err, "query dropped while waiting for a slot");
                if let Some(output) = self.output.lock().as_ref() {
                    let _ = output.send(QueryResult::failed(err).for_entity(query.entity_id()));
                }
                return;
            }
        };

        let Some(output) = self.output.lock().clone() else {
            tracing::debug!(worker = self.id, entity = query.entity_id(), "worker stopped, query dropped");
            return;
        };
        let fallback = output.clone();

        tracing::trace!(worker = self.id, entity = query.entity_id(), "executing query");

        let runner = Arc::clone(&self.runner);
        let ctx = ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-query", self.name()))
            .spawn(move || {
                let _guard = guard;
                let _permit = permit;
                for result in runner(&ctx, query.as_ref()) {
                    if output.send(result).is_err() {
                        break;
                    }
                }
                drop(output);
            });

        if let Err(err) = spawned {
            let _ = fallback.send(QueryResult::failed(Error::Spawn(err.to_string())));
        }
    }
}

impl Worker for DefaultWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn start(&self, ctx: &Context) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                WorkerState::Running => return Err(Error::AlreadyRunning),
                WorkerState::Stopped => return Ok(()),
                WorkerState::Idle => *state = WorkerState::Running,
            }
        }

        let res = loop {
            crossbeam::select! {
                recv(self.done_rx) -> _ => break Ok(()),
                recv(ctx.done()) -> _ => break Err(ctx.err().unwrap_or(Error::Canceled)),
                recv(self.input.receiver()) -> msg => match msg {
                    Ok(query) => self.launch(ctx, query),
                    Err(_) => break Ok(()),
                },
            }
        };

        {
            let mut state = self.state.lock();
            if *state == WorkerState::Running {
                *state = WorkerState::Idle;
            }
            self.state_changed.notify_all();
        }

        tracing::debug!(worker = self.id, ok = res.is_ok(), "worker loop exited");
        res
    }

    fn enqueue(&self, _ctx: &Context, query: QueryRef) -> Result<()> {
        self.input.send(query)
    }

    fn stop(&self, ctx: &Context) -> Result<()> {
        self.done_tx.lock().take();

        // Everything the loop launched is counted once it has exited.
        let res = self
            .wait_loop_exit(ctx)
            .and_then(|()| self.in_flight.wait_idle(ctx));

        *self.state.lock() = WorkerState::Stopped;
        self.output.lock().take();

        tracing::debug!(worker = self.id, drained = res.is_ok(), "worker stopped");
        res
    }
}
