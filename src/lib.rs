//! # Sharded Query Benchmarker
//!
//! Executes a stream of queries against a database at a controlled level of
//! concurrency and measures how long they take.
//!
//! ## Key Features
//!
//! - **Stable sharding**: every query for an entity lands on the same worker
//! - **Concurrent execution**: a worker can have several queries in flight
//! - **Cancellation**: one context threads through pool, workers and queries
//! - **Latency statistics**: min, median, average, max, std deviation and p95
//!
//! ## Architecture
//!
//! ```text
//!                   ┌──────────────────┐
//!   queries ──────> │ ShardedWorkerPool│  entity ─ FNV-1a ─> worker index
//!                   └──────────────────┘
//!                     │      │       │     one private line per worker
//!                     ▼      ▼       ▼
//!                ┌────────┐┌────────┐┌────────┐
//!                │Worker 0││Worker 1││Worker 2│  stats(timeout(base))
//!                └────────┘└────────┘└────────┘
//!                     │      │       │
//!                     ▼      ▼       ▼
//!                   shared result line ──────> report
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use shard_bench::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let (tx, rx) = crossbeam::channel::unbounded();
//! let (out_tx, out_rx) = flume::unbounded();
//!
//! let base = runner(|_ctx, query| {
//!     vec![QueryResult::row(query.entity_id(), chrono::Utc::now(), 1.0, 0.0)]
//! });
//! let bench = Benchmarker::new(BenchmarkerConfig::new("postgres://localhost/db"), base, rx, out_tx)?;
//!
//! let queries = parse_csv("hostname,start_time,end_time\n".as_bytes())?;
//! let ctx = Context::background();
//! let _feeder = spawn_feeder(&ctx, queries, tx)?;
//!
//! bench.start(&ctx)?;
//! let collector = bench.stop(&ctx)?;
//!
//! let mut report = Report::new();
//! for result in out_rx.iter() {
//!     report.add(result)?;
//! }
//! let stats = collector.stats().ok();
//! report.render(&mut std::io::stdout(), OutputFormat::Human, stats.as_ref())?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, rust_2018_idioms)]

pub mod benchmarker;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod partition;
pub mod pool;
pub mod query;
pub mod report;
pub mod source;
pub mod stats;
pub mod timescale;
pub mod worker;

// Re-exports
pub use benchmarker::Benchmarker;
pub use channel::{Line, LineStats};
pub use config::{BenchmarkerConfig, OutputFormat};
pub use context::{CancelGuard, Context};
pub use error::{ConfigErrors, Error, Result};
pub use partition::{CustomAssigner, Fnv1aAssigner, WorkerAssigner};
pub use pool::{PoolConfig, ShardedWorkerPool, WorkerPool};
pub use query::{runner, with_stats, with_timeout, Query, QueryRef, QueryResult, Runner};
pub use report::Report;
pub use stats::{DefaultStatsCollector, Stats, StatsCollector};
pub use timescale::{db_runner, BucketQuery, BucketRow, Database};
pub use worker::{DefaultWorker, Worker, WorkerConfig, WorkerId, WorkerState};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::benchmarker::Benchmarker;
    pub use crate::config::{BenchmarkerConfig, OutputFormat};
    pub use crate::context::Context;
    pub use crate::error::{Error, Result};
    pub use crate::query::{runner, Query, QueryRef, QueryResult, Runner};
    pub use crate::report::Report;
    pub use crate::source::{parse_csv, spawn_feeder};
    pub use crate::stats::{Stats, StatsCollector};
    pub use crate::timescale::BucketQuery;
}
