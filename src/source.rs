//! CSV query source
//!
//! Rows are `hostname,start_time,end_time` with a header line. The whole
//! input is parsed before anything is fed, so a malformed row fails the run
//! before any query executes.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::query::QueryRef;
use crate::timescale::{BucketQuery, TIMESTAMP_FORMAT};
use chrono::NaiveDateTime;
use crossbeam::channel::Sender;
use crossbeam::select;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Parse every row of `reader` into a per-host CPU usage query
pub fn parse_csv<R: io::Read>(reader: R) -> Result<Vec<BucketQuery>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::Fields)
        .from_reader(reader);

    let mut queries = Vec::new();
    let mut record = csv::StringRecord::new();
    while reader.read_record(&mut record)? {
        let line = record.position().map_or(0, |p| p.line());
        queries.push(parse_row(&record, line)?);
    }

    Ok(queries)
}

fn parse_row(record: &csv::StringRecord, line: u64) -> Result<BucketQuery> {
    let invalid = |reason: String| Error::InvalidRow { line, reason };

    if record.len() < 3 {
        return Err(invalid(
            "CSV row should contain 3 values: hostname,start_time,end_time".to_string(),
        ));
    }

    let hostname = &record[0];
    if hostname.is_empty() {
        return Err(invalid("hostname should be present on each CSV row".to_string()));
    }

    let parse_ts = |field: &str| {
        NaiveDateTime::parse_from_str(field, TIMESTAMP_FORMAT)
            .map_err(|e| invalid(format!("bad timestamp {field:?}: {e}")))
    };
    let from = parse_ts(&record[1])?;
    let to = parse_ts(&record[2])?;

    Ok(BucketQuery::cpu_usage(hostname, from, to))
}

/// Feed `queries` in order into `dest` from a background thread
///
/// The sender is dropped once every query is handed over, which closes the
/// line for the consumer. Feeding stops early if `ctx` is done or the
/// receiving side disconnects; the thread returns how many queries it sent.
pub fn spawn_feeder(
    ctx: &Context,
    queries: Vec<BucketQuery>,
    dest: Sender<QueryRef>,
) -> Result<JoinHandle<usize>> {
    let ctx = ctx.clone();
    thread::Builder::new()
        .name("query-source".to_string())
        .spawn(move || {
            let mut sent = 0;
            for query in queries {
                let query: QueryRef = Arc::new(query);
                select! {
                    send(dest, query) -> res => {
                        if res.is_err() {
                            tracing::debug!(sent, "query source receiver gone");
                            break;
                        }
                        sent += 1;
                    }
                    recv(ctx.done()) -> _ => {
                        tracing::debug!(sent, "query source cancelled");
                        break;
                    }
                }
            }
            drop(dest);
            sent
        })
        .map_err(|e| Error::Spawn(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    const SAMPLE: &str = "\
hostname,start_time,end_time
host_000008,2017-01-01 08:59:22,2017-01-01 09:59:22
host_000001,2017-01-02 13:02:02,2017-01-02 14:02:02
";

    #[test]
    fn test_parse_rows_in_order() {
        let queries = parse_csv(SAMPLE.as_bytes()).unwrap();

        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].entity_id_value, "host_000008");
        assert_eq!(queries[1].entity_id_value, "host_000001");
        assert_eq!(
            queries[0].period_from.format(TIMESTAMP_FORMAT).to_string(),
            "2017-01-01 08:59:22"
        );
        assert_eq!(queries[0].table, "cpu_usage");
    }

    #[test]
    fn test_header_only_yields_nothing() {
        assert!(parse_csv("hostname,start_time,end_time\n".as_bytes())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_short_row_is_rejected() {
        let input = "hostname,start_time,end_time\nhost_a,2017-01-01 08:59:22\n";
        match parse_csv(input.as_bytes()) {
            Err(Error::InvalidRow { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_empty_hostname_is_rejected() {
        let input = "hostname,start_time,end_time\n,2017-01-01 08:59:22,2017-01-01 09:59:22\n";
        let err = parse_csv(input.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("hostname should be present"));
    }

    #[test]
    fn test_bad_timestamp_is_rejected() {
        let input = "hostname,start_time,end_time\nhost_a,yesterday,2017-01-01 09:59:22\n";
        let err = parse_csv(input.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::InvalidRow { line: 2, .. }));
    }

    #[test]
    fn test_feeder_sends_all_then_closes() {
        let queries = parse_csv(SAMPLE.as_bytes()).unwrap();
        let (tx, rx) = channel::unbounded();

        let handle = spawn_feeder(&Context::background(), queries, tx).unwrap();
        let received: Vec<String> = rx.iter().map(|q| q.entity_id().to_string()).collect();

        assert_eq!(handle.join().unwrap(), 2);
        assert_eq!(received, vec!["host_000008", "host_000001"]);
    }

    #[test]
    fn test_feeder_stops_on_cancel() {
        let queries = parse_csv(SAMPLE.as_bytes()).unwrap();
        let (tx, rx) = channel::bounded(0);
        let (ctx, cancel) = Context::with_cancel(&Context::background());

        let handle = spawn_feeder(&ctx, queries, tx).unwrap();
        cancel.cancel();

        assert_eq!(handle.join().unwrap(), 0);
        assert!(rx.recv().is_err());
    }
}
