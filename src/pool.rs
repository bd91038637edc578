//! Sharded worker pool
//!
//! The pool is the single intake point. It resolves each query's worker
//! from the entity identifier (cached after first sighting) and hands the
//! query to that worker's private line, so every row of one entity goes
//! through the same worker.
//!
//! ```text
//!                        ┌──> line 0 ──> worker 0 ──┐
//! input ──> pool intake ─┼──> line 1 ──> worker 1 ──┼──> output
//!          (assign+cache)└──> line N ──> worker N ──┘
//! ```
//!
//! Each worker has its own dispatch queue drained by a handoff thread, so
//! intake never blocks on a saturated worker and queries reach a worker's
//! line in the order they were accepted.
//!
//! The assignment cache grows with every distinct entity and is never
//! evicted. That is fine for finite benchmark inputs.

use crate::channel::Line;
use crate::context::Context;
use crate::error::{ConfigErrors, Error, Result};
use crate::partition::{Fnv1aAssigner, WorkerAssigner};
use crate::query::{QueryRef, QueryResult, Runner};
use crate::worker::{DefaultWorker, InFlight, InFlightGuard, Worker, WorkerConfig, WorkerId};
use ahash::AHashMap;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often a drain re-checks its context while waiting
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// A query accepted by intake, counted until its handoff completes
type Pending = (QueryRef, InFlightGuard);

/// Something that can be started and stopped with a context
pub trait WorkerPool: Send + Sync {
    /// Run the intake loop until the input closes, the pool is stopped, or
    /// `ctx` is cancelled
    fn start(&self, ctx: &Context) -> Result<()>;

    /// Drain and stop every worker, then close their input lines
    fn stop(&self, ctx: &Context) -> Result<()>;
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers in the pool
    pub num_workers: usize,

    /// Configuration template for workers
    pub worker_config: WorkerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 5,
            worker_config: WorkerConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers
    pub fn with_num_workers(mut self, num: usize) -> Self {
        self.num_workers = num;
        self
    }

    /// Set the worker configuration template
    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }
}

/// A [`WorkerPool`] that shards queries by entity
pub struct ShardedWorkerPool {
    input: Receiver<QueryRef>,
    workers: Vec<Arc<dyn Worker>>,
    lines: Vec<Arc<Line<QueryRef>>>,
    assigner: Arc<dyn WorkerAssigner>,
    assignments: Mutex<AHashMap<String, WorkerId>>,
    handoffs: Arc<InFlight>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    started: AtomicBool,
    intake_running: Mutex<bool>,
    intake_exited: Condvar,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    worker_loops: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl ShardedWorkerPool {
    /// Create a pool of [`DefaultWorker`]s sharded with FNV-1a
    pub fn new(
        runner: Runner,
        num_workers: usize,
        input: Receiver<QueryRef>,
        output: flume::Sender<QueryResult>,
    ) -> Result<Self> {
        Self::with_assigner(
            runner,
            PoolConfig::new().with_num_workers(num_workers),
            Arc::new(Fnv1aAssigner::new()),
            input,
            output,
        )
    }

    /// Create a pool of [`DefaultWorker`]s with a custom assigner
    pub fn with_assigner(
        runner: Runner,
        config: PoolConfig,
        assigner: Arc<dyn WorkerAssigner>,
        input: Receiver<QueryRef>,
        output: flume::Sender<QueryResult>,
    ) -> Result<Self> {
        if config.num_workers == 0 {
            return Err(Error::InvalidConfig(invalid_worker_count()));
        }

        // One line per worker; a shared line would fan out instead of shard.
        let lines: Vec<Arc<Line<QueryRef>>> = (0..config.num_workers)
            .map(|_| Arc::new(Line::rendezvous()))
            .collect();

        let workers = lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let mut worker_config = config.worker_config.clone();
                if worker_config.name.is_none() {
                    worker_config.name = Some(format!("pool-worker-{i}"));
                }
                Arc::new(DefaultWorker::with_config(
                    i,
                    Arc::clone(&runner),
                    Arc::clone(line),
                    output.clone(),
                    worker_config,
                )) as Arc<dyn Worker>
            })
            .collect();

        Self::from_parts(workers, lines, assigner, input)
    }

    /// Assemble a pool from pre-built workers and the lines they read from
    ///
    /// `workers[i]` must read from `lines[i]` and report `id() == i`. The
    /// pool takes ownership of closing the lines.
    pub fn from_parts(
        workers: Vec<Arc<dyn Worker>>,
        lines: Vec<Arc<Line<QueryRef>>>,
        assigner: Arc<dyn WorkerAssigner>,
        input: Receiver<QueryRef>,
    ) -> Result<Self> {
        if workers.is_empty() {
            return Err(Error::InvalidConfig(invalid_worker_count()));
        }
        if workers.len() != lines.len() {
            let mut errs = ConfigErrors::new();
            errs.push(format!(
                "{} workers but {} input lines",
                workers.len(),
                lines.len()
            ));
            return Err(Error::InvalidConfig(errs));
        }

        let (done_tx, done_rx) = channel::bounded(0);
        Ok(Self {
            input,
            workers,
            lines,
            assigner,
            assignments: Mutex::new(AHashMap::new()),
            handoffs: Arc::new(InFlight::default()),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            started: AtomicBool::new(false),
            intake_running: Mutex::new(false),
            intake_exited: Condvar::new(),
            dispatchers: Mutex::new(Vec::new()),
            worker_loops: Mutex::new(Vec::new()),
        })
    }

    /// Number of workers
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// The workers, indexed by [`WorkerId`]
    pub fn workers(&self) -> &[Arc<dyn Worker>] {
        &self.workers
    }

    /// Number of distinct entities seen so far
    pub fn assigned_entities(&self) -> usize {
        self.assignments.lock().len()
    }

    /// Worker for `entity_id`, computed on first sighting and cached after
    pub fn assign_worker(&self, entity_id: &str) -> WorkerId {
        let mut assignments = self.assignments.lock();
        if let Some(&worker) = assignments.get(entity_id) {
            return worker;
        }

        let n = self.workers.len();
        // An out-of-range answer from a custom assigner is folded back in.
        let worker = self.assigner.assign(entity_id, n) % n;
        assignments.insert(entity_id.to_string(), worker);
        tracing::debug!(host = entity_id, worker, "worker assignment");
        worker
    }

    /// Spawn every worker's receive loop
    ///
    /// On a failed spawn the loops already running are kept so that `stop`
    /// can wind them down, and the error is returned.
    fn start_workers<F>(&self, ctx: &Context, mut spawn: F) -> Result<()>
    where
        F: FnMut(Arc<dyn Worker>, Context) -> io::Result<JoinHandle<Result<()>>>,
    {
        let mut loops = self.worker_loops.lock();
        for worker in &self.workers {
            let id = worker.id();
            let handle = spawn(Arc::clone(worker), ctx.clone())
                .map_err(|e| Error::Spawn(format!("worker {id} loop: {e}")))?;
            loops.push(handle);
        }
        Ok(())
    }

    /// One unbounded queue per worker, drained in order by its own thread
    fn spawn_dispatchers(&self, ctx: &Context) -> Result<Vec<Sender<Pending>>> {
        let mut queues = Vec::with_capacity(self.lines.len());
        let mut dispatchers = self.dispatchers.lock();

        for (worker, line) in self.lines.iter().enumerate() {
            let (tx, rx) = channel::unbounded::<Pending>();
            let line = Arc::clone(line);
            let ctx = ctx.clone();
            let handle = thread::Builder::new()
                .name(format!("pool-dispatch-{worker}"))
                .spawn(move || {
                    for (query, _guard) in rx.iter() {
                        hand_off(&line, &ctx, query, worker);
                    }
                })
                .map_err(|e| Error::Spawn(e.to_string()))?;
            dispatchers.push(handle);
            queues.push(tx);
        }

        Ok(queues)
    }

    fn dispatch(&self, queues: &[Sender<Pending>], query: QueryRef) {
        let worker = self.assign_worker(query.entity_id());
        tracing::trace!(worker, entity = query.entity_id(), "dispatching query");

        let guard = self.handoffs.enter();
        if let Err(channel::SendError((query, _guard))) = queues[worker].send((query, guard)) {
            tracing::debug!(worker, entity = query.entity_id(), "dispatch queue gone, query dropped");
        }
    }

    fn wait_intake_exit(&self, ctx: &Context) -> Result<()> {
        let mut running = self.intake_running.lock();
        while *running {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            self.intake_exited.wait_for(&mut running, DRAIN_POLL);
        }
        Ok(())
    }

    fn run_intake<F>(&self, ctx: &Context, spawn: F) -> Result<()>
    where
        F: FnMut(Arc<dyn Worker>, Context) -> io::Result<JoinHandle<Result<()>>>,
    {
        *self.intake_running.lock() = true;

        // The queues drop on every exit path, which lets each dispatcher
        // finish its backlog and exit.
        let res = self.spawn_dispatchers(ctx).and_then(|queues| {
            self.start_workers(ctx, spawn)?;
            loop {
                crossbeam::select! {
                    recv(self.done_rx) -> _ => break Ok(()),
                    recv(ctx.done()) -> _ => break Err(ctx.err().unwrap_or(Error::Canceled)),
                    recv(self.input) -> msg => match msg {
                        Ok(query) => self.dispatch(&queues, query),
                        Err(_) => break Ok(()),
                    },
                }
            }
        });

        *self.intake_running.lock() = false;
        self.intake_exited.notify_all();

        tracing::debug!(ok = res.is_ok(), entities = self.assigned_entities(), "pool intake exited");
        res
    }
}

impl WorkerPool for ShardedWorkerPool {
    fn start(&self, ctx: &Context) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }
        self.run_intake(ctx, spawn_worker_loop)
    }

    fn stop(&self, ctx: &Context) -> Result<()> {
        // No more intake; then wait for accepted queries to reach their lines.
        self.done_tx.lock().take();
        let handed_off = self
            .wait_intake_exit(ctx)
            .and_then(|()| self.handoffs.wait_idle(ctx));

        // Every worker gets its stop call even if an earlier one fails.
        let stopped: Vec<Result<()>> = thread::scope(|s| {
            let handles: Vec<_> = self
                .workers
                .iter()
                .map(|worker| s.spawn(move || worker.stop(ctx)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(Error::WorkerPanicked("stop panicked".to_string())))
                })
                .collect()
        });

        // The pool created the lines, so it closes them.
        for line in &self.lines {
            line.close();
        }

        // Threads are only joined once drained; after a failed drain one may
        // still be blocked on a send and is detached instead.
        if handed_off.is_ok() {
            join_all("dispatch", &self.dispatchers, |_| Ok(()));
        } else {
            detach("dispatch", &self.dispatchers);
        }
        if stopped.iter().all(Result::is_ok) {
            join_all("worker loop", &self.worker_loops, |res| res);
        } else {
            detach("worker loop", &self.worker_loops);
        }

        tracing::debug!(
            handed_off = self.lines.iter().map(|l| l.stats().handed_off()).sum::<u64>(),
            "pool stopped"
        );

        handed_off?;
        stopped.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }
}

fn join_all<T>(what: &str, handles: &Mutex<Vec<JoinHandle<T>>>, outcome: impl Fn(T) -> Result<()>) {
    for handle in std::mem::take(&mut *handles.lock()) {
        match handle.join().map(&outcome) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(error = %err, "{what} thread ended with error"),
            Err(_) => tracing::debug!("{what} thread panicked"),
        }
    }
}

fn detach<T>(what: &str, handles: &Mutex<Vec<JoinHandle<T>>>) {
    let detached = std::mem::take(&mut *handles.lock()).len();
    if detached > 0 {
        tracing::debug!(detached, "{what} threads left running after a failed drain");
    }
}

fn spawn_worker_loop(worker: Arc<dyn Worker>, ctx: Context) -> io::Result<JoinHandle<Result<()>>> {
    thread::Builder::new()
        .name(format!("pool-worker-{}", worker.id()))
        .spawn(move || worker.start(&ctx))
}

fn hand_off(line: &Line<QueryRef>, ctx: &Context, query: QueryRef, worker: WorkerId) {
    if let Err(err) = line.send_cancellable(ctx, query) {
        tracing::debug!(worker, error = %err, "query not handed off");
    }
}

fn invalid_worker_count() -> ConfigErrors {
    let mut errs = ConfigErrors::new();
    errs.push("NumWorkers should be 1 or greater");
    errs
}
