//! Queries, results and the runner chain that executes them
//!
//! A [`Runner`] turns one query into zero or more result rows. Workers
//! use a decorated runner, `with_stats(with_timeout(base))`, where `base`
//! comes from the database adapter.

use crate::context::Context;
use crate::error::Error;
use crate::stats::StatsCollector;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "serialization")]
use serde::Serialize;

/// A unit of work for the pool
///
/// `Display` is the rendering used for execution and diagnostics.
pub trait Query: fmt::Display + fmt::Debug + Send + Sync {
    /// Identifier of the entity the query is about, used for sharding
    fn entity_id(&self) -> &str;
}

/// Shared handle to a query travelling through the pool
pub type QueryRef = Arc<dyn Query>;

/// One row produced by an executed query
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(Serialize))]
pub struct QueryResult {
    /// Entity the row belongs to
    pub entity_id: String,

    /// Bucket timestamp
    pub ts: DateTime<Utc>,

    /// Highest observed value in the bucket
    pub max: f64,

    /// Lowest observed value in the bucket
    pub min: f64,

    /// Set when the execution failed; the other fields are then meaningless
    #[cfg_attr(feature = "serialization", serde(serialize_with = "serialize_error"))]
    pub err: Option<Error>,
}

impl QueryResult {
    /// A successful row
    pub fn row(entity_id: impl Into<String>, ts: DateTime<Utc>, max: f64, min: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            ts,
            max,
            min,
            err: None,
        }
    }

    /// A result carrying only an error
    pub fn failed(err: Error) -> Self {
        Self {
            entity_id: String::new(),
            ts: DateTime::<Utc>::UNIX_EPOCH,
            max: 0.0,
            min: 0.0,
            err: Some(err),
        }
    }

    /// Attribute the result to `entity_id`
    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = entity_id.into();
        self
    }

    /// True if the result carries an error
    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }
}

#[cfg(feature = "serialization")]
fn serialize_error<S: serde::Serializer>(err: &Option<Error>, s: S) -> Result<S::Ok, S::Error> {
    match err {
        Some(err) => s.serialize_some(&err.to_string()),
        None => s.serialize_none(),
    }
}

/// Executes one query under a context
///
/// Execution errors are returned inside a [`QueryResult`], never raised.
pub type Runner = Arc<dyn Fn(&Context, &dyn Query) -> Vec<QueryResult> + Send + Sync>;

/// Wrap a closure as a [`Runner`]
pub fn runner<F>(f: F) -> Runner
where
    F: Fn(&Context, &dyn Query) -> Vec<QueryResult> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Record one (start, finish) sample per invocation, whatever the outcome
pub fn with_stats(inner: Runner, collector: Arc<dyn StatsCollector>) -> Runner {
    Arc::new(move |ctx: &Context, query: &dyn Query| {
        let started_at = Utc::now();
        let results = inner(ctx, query);
        collector.add(started_at, Utc::now());
        results
    })
}

/// Bound every invocation with a deadline derived from the caller's context
///
/// The wrapped runner is expected to observe the deadline and report it in
/// its results; this decorator only imposes the bound and releases it on
/// return.
///
/// Every invocation arms its own deadline timer thread, on top of the
/// worker's execution thread. Under heavy load bound the executions with
/// [`WorkerConfig::with_max_in_flight`](crate::worker::WorkerConfig::with_max_in_flight).
pub fn with_timeout(inner: Runner, max_duration: Duration) -> Runner {
    Arc::new(move |ctx: &Context, query: &dyn Query| {
        let (ctx, _cancel) = Context::with_timeout(ctx, max_duration);
        inner(&ctx, query)
    })
}
