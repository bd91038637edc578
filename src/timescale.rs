//! Time-bucket aggregation queries for a time-series database
//!
//! [`BucketQuery`] renders to the SQL that is executed, and [`db_runner`]
//! turns any [`Database`] into the base runner the pool decorates.

use crate::context::Context;
use crate::error::Result;
use crate::query::{Query, QueryResult, Runner};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Timestamp layout used in rendered SQL and in query sources
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Max/min of one column per time bucket, for a single entity and period
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketQuery {
    /// Bucket width as a database interval literal, e.g. `1 minute`
    pub bucket_interval: String,
    /// Timestamp column bucketed and bounded by the period
    pub bucket_ts_column: String,
    /// Entity the query is about
    pub entity_id_value: String,
    /// Column holding the entity identifier
    pub entity_id_column: String,
    /// Column aggregated into max/min
    pub benchmark_column: String,
    /// Source table
    pub table: String,
    /// Inclusive start of the period
    pub period_from: NaiveDateTime,
    /// Inclusive end of the period
    pub period_to: NaiveDateTime,
}

impl BucketQuery {
    /// Per-minute max/min `usage` of `host` in the `cpu_usage` table
    pub fn cpu_usage(host: impl Into<String>, from: NaiveDateTime, to: NaiveDateTime) -> Self {
        Self {
            bucket_interval: "1 minute".to_string(),
            bucket_ts_column: "ts".to_string(),
            entity_id_value: host.into(),
            entity_id_column: "host".to_string(),
            benchmark_column: "usage".to_string(),
            table: "cpu_usage".to_string(),
            period_from: from,
            period_to: to,
        }
    }
}

impl fmt::Display for BucketQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SELECT time_bucket('{interval}', {ts}) as bucket, max({col}), min({col}) \
             FROM {table} WHERE {entity_col} = '{entity}' AND {ts} BETWEEN '{from}' AND '{to}' \
             GROUP BY bucket, {entity_col} ORDER BY bucket ASC;",
            interval = self.bucket_interval,
            ts = self.bucket_ts_column,
            col = self.benchmark_column,
            table = self.table,
            entity_col = self.entity_id_column,
            entity = self.entity_id_value,
            from = self.period_from.format(TIMESTAMP_FORMAT),
            to = self.period_to.format(TIMESTAMP_FORMAT),
        )
    }
}

impl Query for BucketQuery {
    fn entity_id(&self) -> &str {
        &self.entity_id_value
    }
}

/// One aggregated bucket as returned by the database
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketRow {
    /// Bucket start
    pub ts: DateTime<Utc>,
    /// Highest value in the bucket
    pub max: f64,
    /// Lowest value in the bucket
    pub min: f64,
}

/// Minimal database surface needed to execute rendered queries
///
/// Implementations are expected to abort when `ctx` is done and report the
/// context's error.
pub trait Database: Send + Sync {
    /// Execute `sql` and return its rows in order
    fn query(&self, ctx: &Context, sql: &str) -> Result<Vec<BucketRow>>;
}

/// Base runner executing each query's rendering against `db`
///
/// Rows are tagged with the query's entity. A database error becomes a
/// single failed result.
pub fn db_runner(db: Arc<dyn Database>) -> Runner {
    Arc::new(move |ctx: &Context, query: &dyn Query| {
        let sql = query.to_string();
        tracing::trace!(entity = query.entity_id(), %sql, "executing");

        match db.query(ctx, &sql) {
            Ok(rows) => rows
                .into_iter()
                .map(|row| QueryResult::row(query.entity_id(), row.ts, row.max, row.min))
                .collect(),
            Err(err) => vec![QueryResult::failed(err)],
        }
    })
}
