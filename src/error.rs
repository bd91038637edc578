//! Error types for the benchmarker

use std::fmt;

/// Result type alias for benchmarker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while dispatching and measuring queries
///
/// Errors are `Clone` because per-query failures travel as data inside
/// [`QueryResult`](crate::query::QueryResult) values.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The execution context was cancelled
    #[error("context canceled")]
    Canceled,

    /// The execution context reached its deadline
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Worker or pool loop was started twice
    #[error("already running")]
    AlreadyRunning,

    /// The input line was closed by its owner
    #[error("input line closed")]
    LineClosed,

    /// A thread could not be spawned
    #[error("failed to spawn thread: {0}")]
    Spawn(String),

    /// A worker thread panicked
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    /// Invalid configuration
    #[error("{0}")]
    InvalidConfig(ConfigErrors),

    /// Statistics were requested before any sample was recorded
    #[error("no samples recorded: statistics need at least one query execution")]
    EmptySampleSet,

    /// A query failed inside the database adapter
    #[error("query failed: {0}")]
    Query(String),

    /// Malformed input row
    #[error("invalid row {line}: {reason}")]
    InvalidRow {
        /// 1-based line number in the source
        line: u64,
        /// What was wrong with the row
        reason: String,
    },

    /// CSV reader or writer error
    #[error("csv error: {0}")]
    Csv(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    /// True for the two context errors
    pub fn is_context(&self) -> bool {
        matches!(self, Error::Canceled | Error::DeadlineExceeded)
    }
}

/// Every violation found while validating a configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigErrors(Vec<String>);

impl ConfigErrors {
    /// Create an empty set of violations
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one violation
    pub fn push(&mut self, violation: impl Into<String>) {
        self.0.push(violation.into());
    }

    /// The recorded violations in order
    pub fn violations(&self) -> &[String] {
        &self.0
    }

    /// True if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Ok(())` when empty, otherwise all violations as one error
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig(self))
        }
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("\n"))
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Csv(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::LineClosed
    }
}
