//! Benchmark CSV-described queries against a synthetic latency model
//!
//! ```text
//! cargo run --example synthetic -- --file queries.csv --workers 8 --output-format md
//! cargo run --example synthetic -- < queries.csv
//! ```
//!
//! The CSV holds `hostname,start_time,end_time` rows with a header. Each
//! query "executes" by sleeping for a latency derived from its SQL, so runs
//! are reproducible without a database.

use clap::Parser;
use shard_bench::partition::fnv1a_32;
use shard_bench::prelude::*;
use std::fs::File;
use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "synthetic")]
#[command(about = "Benchmark query throughput across sharded workers", long_about = None)]
struct Cli {
    /// Path to a CSV file of hostname,start_time,end_time rows (default: stdin)
    #[arg(short, long, env = "SHARD_BENCH_FILE")]
    file: Option<PathBuf>,

    /// Database connection URI, recorded but not dialled by the synthetic runner
    #[arg(long, env = "SHARD_BENCH_DB_URI", default_value = "postgres://localhost:5432/synthetic")]
    db_uri: String,

    /// Number of workers executing queries concurrently
    #[arg(short, long, env = "SHARD_BENCH_WORKERS", default_value_t = 5)]
    workers: usize,

    /// Per-query timeout in milliseconds (0 disables it)
    #[arg(short, long, env = "SHARD_BENCH_TIMEOUT_MS", default_value_t = 100)]
    timeout_ms: u64,

    /// Enable debug logs
    #[arg(short, long, env = "SHARD_BENCH_DEBUG")]
    debug: bool,

    /// Output format: human, csv, tsv, md or html
    #[arg(long, env = "SHARD_BENCH_OUTPUT_FORMAT", default_value = "human")]
    output_format: OutputFormat,

    /// Bound on concurrently executing queries per worker (0 = unbounded)
    ///
    /// Every execution holds a thread and, with a timeout, a timer thread.
    #[arg(long, env = "SHARD_BENCH_MAX_IN_FLIGHT", default_value_t = 64)]
    max_in_flight: usize,

    /// Upper bound of the synthetic latency in milliseconds
    #[arg(long, default_value_t = 40)]
    max_latency_ms: u64,
}

impl Cli {
    fn config(&self) -> BenchmarkerConfig {
        let mut config = BenchmarkerConfig::new(self.db_uri.clone())
            .with_num_workers(self.workers)
            .with_query_timeout(Duration::from_millis(self.timeout_ms))
            .with_debug(self.debug)
            .with_output_format(self.output_format);
        if self.max_in_flight > 0 {
            config = config.with_max_in_flight_per_worker(self.max_in_flight);
        }
        config
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = cli.config();

    tracing_subscriber::fmt()
        .with_max_level(config.log_level())
        .with_writer(io::stderr)
        .init();

    match run(&cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "benchmark failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, config: BenchmarkerConfig) -> Result<()> {
    let queries = parse_csv(open_input(cli.file.as_ref())?)?;
    info!(queries = queries.len(), workers = config.num_workers, "starting benchmark");

    let (query_tx, query_rx) = crossbeam::channel::unbounded();
    let (result_tx, result_rx) = flume::unbounded();
    let format = config.output_format;
    let bench = Benchmarker::new(config, synthetic_runner(cli.max_latency_ms), query_rx, result_tx)?;

    let collector = thread::Builder::new()
        .name("result-collector".to_string())
        .spawn(move || -> Result<Report> {
            let mut report = Report::new();
            for result in result_rx.iter() {
                if let Err(err) = report.add(result) {
                    if matches!(err, Error::DeadlineExceeded) {
                        error!("timeout reached, consider a greater --timeout-ms");
                    }
                    return Err(err);
                }
            }
            Ok(report)
        })
        .map_err(|e| Error::Spawn(e.to_string()))?;

    let ctx = Context::background();
    let feeder = spawn_feeder(&ctx, queries, query_tx)?;

    bench.start(&ctx)?;
    let stats = bench.stop(&ctx)?;
    let fed = feeder
        .join()
        .map_err(|_| Error::WorkerPanicked("query-source".to_string()))?;
    let report = collector
        .join()
        .map_err(|_| Error::WorkerPanicked("result-collector".to_string()))??;

    info!(fed, rows = report.len(), "benchmark finished");

    let stats = match stats.stats() {
        Ok(stats) => Some(stats),
        Err(Error::EmptySampleSet) => None,
        Err(err) => return Err(err),
    };
    report.render(&mut io::stdout().lock(), format, stats.as_ref())
}

fn open_input(path: Option<&PathBuf>) -> Result<Box<dyn Read>> {
    match path {
        Some(path) => Ok(Box::new(File::open(path)?)),
        None if io::stdin().is_terminal() => Err(Error::Io(
            "stdin is only supported through a pipe, e.g. `synthetic < queries.csv`".to_string(),
        )),
        None => Ok(Box::new(io::stdin())),
    }
}

/// Sleeps for a latency derived from the query text, then emits one row
fn synthetic_runner(max_latency_ms: u64) -> Runner {
    let spread = max_latency_ms.max(1);
    runner(move |ctx, query| {
        let hash = fnv1a_32(query.to_string().as_bytes());
        let latency = Duration::from_millis(u64::from(hash) % spread);

        if let Err(err) = ctx.sleep(latency) {
            return vec![QueryResult::failed(err)];
        }

        let max = f64::from(hash % 10_000) / 100.0;
        let min = max * f64::from(hash % 97) / 100.0;
        vec![QueryResult::row(query.entity_id(), chrono::Utc::now(), max, min)]
    })
}
