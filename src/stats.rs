//! Latency statistics over query executions
//!
//! Samples arrive from many execution threads at once. One mutex covers
//! both the append path and the aggregation, which sorts in place.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Duration;

#[cfg(feature = "serialization")]
use serde::Serialize;

/// Summary of every recorded query execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize))]
pub struct Stats {
    /// Number of executed queries
    pub total_queries: usize,

    /// From the earliest start to the latest finish, across all queries
    pub time_across_all_queries: Duration,

    /// Fastest execution
    pub min_time: Duration,

    /// Upper-middle order statistic (`durations[n / 2]`)
    pub median_time: Duration,

    /// Sum of durations divided by the count, truncated to whole nanoseconds
    pub avg_time: Duration,

    /// Slowest execution
    pub max_time: Duration,

    /// Population standard deviation of the durations
    pub std_deviation: Duration,

    /// Nearest-rank 95th percentile
    pub percentile_95th: Duration,
}

/// Sink for (start, finish) samples
pub trait StatsCollector: Send + Sync {
    /// Record one execution
    ///
    /// A `finished_at` earlier than `started_at` (a wall clock stepping
    /// back) is kept as a zero-length sample: it still counts as a query and
    /// still weighs on the average.
    fn add(&self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>);

    /// Aggregate everything recorded so far
    ///
    /// Fails with [`Error::EmptySampleSet`] when nothing was recorded.
    fn stats(&self) -> Result<Stats>;
}

#[derive(Debug, Default)]
struct Samples {
    started_ats: Vec<DateTime<Utc>>,
    finished_ats: Vec<DateTime<Utc>>,
    /// Nanoseconds; a finish before its start counts as zero
    durations: Vec<u64>,
}

/// Mutex-guarded [`StatsCollector`]
///
/// `add` returns only after the sample is committed, so `stats` sees every
/// `add` that returned before it was called.
#[derive(Debug, Default)]
pub struct DefaultStatsCollector {
    samples: Mutex<Samples>,
}

impl DefaultStatsCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of samples recorded so far
    pub fn len(&self) -> usize {
        self.samples.lock().durations.len()
    }

    /// True if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StatsCollector for DefaultStatsCollector {
    fn add(&self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) {
        // Negative spans clamp to zero.
        let nanos = (finished_at - started_at)
            .to_std()
            .map(duration_nanos)
            .unwrap_or(0);

        let mut samples = self.samples.lock();
        samples.started_ats.push(started_at);
        samples.finished_ats.push(finished_at);
        samples.durations.push(nanos);
    }

    fn stats(&self) -> Result<Stats> {
        let mut samples = self.samples.lock();
        let n = samples.durations.len();
        if n == 0 {
            return Err(Error::EmptySampleSet);
        }

        samples.started_ats.sort_unstable();
        samples.finished_ats.sort_unstable();
        let time_across_all_queries = (samples.finished_ats[n - 1] - samples.started_ats[0])
            .to_std()
            .unwrap_or(Duration::ZERO);

        let durations = &mut samples.durations;
        durations.sort_unstable();

        let sum: u128 = durations.iter().map(|&d| u128::from(d)).sum();
        let avg = sum / n as u128;

        let mean = sum as f64 / n as f64;
        let variance = durations
            .iter()
            .map(|&d| {
                let delta = d as f64 - mean;
                delta * delta
            })
            .sum::<f64>()
            / n as f64;

        // Nearest rank: the ceil(0.95 * n)-th smallest value.
        let rank = (n * 95).div_ceil(100);

        Ok(Stats {
            total_queries: n,
            time_across_all_queries,
            min_time: Duration::from_nanos(durations[0]),
            median_time: Duration::from_nanos(durations[n / 2]),
            avg_time: Duration::from_nanos(u64::try_from(avg).unwrap_or(u64::MAX)),
            max_time: Duration::from_nanos(durations[n - 1]),
            std_deviation: Duration::from_nanos(variance.sqrt().round() as u64),
            percentile_95th: Duration::from_nanos(durations[rank.max(1) - 1]),
        })
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
