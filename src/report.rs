//! Result table and statistics footer rendering

use crate::config::OutputFormat;
use crate::error::Result;
use crate::query::QueryResult;
use crate::stats::Stats;
use std::io::Write;

const HEADER: [&str; 4] = ["TS", "HOST", "MAX CPU USAGE", "MIN CPU USAGE"];

type Cells = [String; 4];

/// Accumulates result rows for a single rendering at the end of a run
#[derive(Debug, Default)]
pub struct Report {
    rows: Vec<QueryResult>,
}

impl Report {
    /// Create an empty report
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a successful row; an errored result hands its error back
    pub fn add(&mut self, result: QueryResult) -> Result<()> {
        match result.err {
            Some(err) => Err(err),
            None => {
                self.rows.push(result);
                Ok(())
            }
        }
    }

    /// Number of rows kept
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if no row was kept
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write the table sorted by timestamp then entity
    ///
    /// The statistics footer is omitted when `stats` is `None`.
    pub fn render<W: Write>(&self, out: &mut W, format: OutputFormat, stats: Option<&Stats>) -> Result<()> {
        let header = HEADER.map(str::to_string);
        let rows = self.sorted_cells();
        let footer = stats.map(footer_cells).unwrap_or_default();

        match format {
            OutputFormat::Human => render_human(out, &header, &rows, &footer),
            OutputFormat::Csv => render_delimited(out, b',', &header, &rows, &footer),
            OutputFormat::Tsv => render_delimited(out, b'\t', &header, &rows, &footer),
            OutputFormat::Markdown => render_markdown(out, &header, &rows, &footer),
            OutputFormat::Html => render_html(out, &header, &rows, &footer),
        }
    }

    fn sorted_cells(&self) -> Vec<Cells> {
        let mut rows: Vec<&QueryResult> = self.rows.iter().collect();
        rows.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.entity_id.cmp(&b.entity_id)));
        rows.into_iter()
            .map(|r| [r.ts.to_string(), r.entity_id.clone(), r.max.to_string(), r.min.to_string()])
            .collect()
    }
}

fn footer_cells(stats: &Stats) -> Vec<Cells> {
    let entry = |label: &str, value: String| [String::new(), String::new(), label.to_string(), value];
    vec![
        entry("# Queries", stats.total_queries.to_string()),
        entry(
            "Total Query time (across all queries)",
            format!("{:?}", stats.time_across_all_queries),
        ),
        entry("Min query time", format!("{:?}", stats.min_time)),
        entry("Median query time", format!("{:?}", stats.median_time)),
        entry("Average query time", format!("{:?}", stats.avg_time)),
        entry("Max query time", format!("{:?}", stats.max_time)),
        entry("Std deviation", format!("{:?}", stats.std_deviation)),
        entry("95th percentile query time", format!("{:?}", stats.percentile_95th)),
    ]
}

fn render_human<W: Write>(out: &mut W, header: &Cells, rows: &[Cells], footer: &[Cells]) -> Result<()> {
    let mut widths = header.clone().map(|h| h.chars().count());
    for cells in rows.iter().chain(footer) {
        for (w, cell) in widths.iter_mut().zip(cells) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let rule: String = widths
        .iter()
        .fold(String::from("+"), |acc, w| acc + &"-".repeat(w + 2) + "+");
    let line = |out: &mut W, cells: &Cells| -> std::io::Result<()> {
        write!(out, "|")?;
        for (cell, w) in cells.iter().zip(widths) {
            write!(out, " {cell:<w$} |")?;
        }
        writeln!(out)
    };

    writeln!(out, "{rule}")?;
    line(out, header)?;
    writeln!(out, "{rule}")?;
    for cells in rows {
        line(out, cells)?;
    }
    writeln!(out, "{rule}")?;
    if !footer.is_empty() {
        for cells in footer {
            line(out, cells)?;
        }
        writeln!(out, "{rule}")?;
    }
    Ok(())
}

fn render_delimited<W: Write>(
    out: &mut W,
    delimiter: u8,
    header: &Cells,
    rows: &[Cells],
    footer: &[Cells],
) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(out);

    writer.write_record(header)?;
    for cells in rows.iter().chain(footer) {
        writer.write_record(cells)?;
    }
    writer.flush()?;
    Ok(())
}

fn render_markdown<W: Write>(out: &mut W, header: &Cells, rows: &[Cells], footer: &[Cells]) -> Result<()> {
    let line = |out: &mut W, cells: &Cells| -> std::io::Result<()> {
        let escaped: Vec<String> = cells.iter().map(|c| c.replace('|', "\\|")).collect();
        writeln!(out, "| {} |", escaped.join(" | "))
    };

    line(out, header)?;
    writeln!(out, "| --- | --- | ---: | ---: |")?;
    for cells in rows.iter().chain(footer) {
        line(out, cells)?;
    }
    Ok(())
}

fn render_html<W: Write>(out: &mut W, header: &Cells, rows: &[Cells], footer: &[Cells]) -> Result<()> {
    let section = |out: &mut W, tag: &str, cell: &str, lines: &[Cells]| -> std::io::Result<()> {
        writeln!(out, "  <{tag}>")?;
        for cells in lines {
            write!(out, "  <tr>")?;
            for c in cells {
                write!(out, "<{cell}>{}</{cell}>", escape_html(c))?;
            }
            writeln!(out, "</tr>")?;
        }
        writeln!(out, "  </{tag}>")
    };

    writeln!(out, "<table>")?;
    section(out, "thead", "th", std::slice::from_ref(header))?;
    section(out, "tbody", "td", rows)?;
    if !footer.is_empty() {
        section(out, "tfoot", "td", footer)?;
    }
    writeln!(out, "</table>")?;
    Ok(())
}

fn escape_html(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn report() -> Report {
        let t0 = Utc.with_ymd_and_hms(2017, 1, 1, 8, 59, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2017, 1, 1, 9, 0, 0).unwrap();
        let mut report = Report::new();
        for result in [
            QueryResult::row("host_b", t1, 90.5, 10.0),
            QueryResult::row("host_b", t0, 80.0, 5.25),
            QueryResult::row("host_a", t1, 70.0, 1.0),
        ] {
            report.add(result).unwrap();
        }
        report
    }

    fn stats() -> Stats {
        let s = Duration::from_secs;
        Stats {
            total_queries: 3,
            time_across_all_queries: s(6),
            min_time: s(1),
            median_time: s(2),
            avg_time: s(2),
            max_time: s(3),
            std_deviation: Duration::from_millis(816),
            percentile_95th: s(3),
        }
    }

    fn rendered(format: OutputFormat, stats: Option<&Stats>) -> String {
        let mut buf = Vec::new();
        report().render(&mut buf, format, stats).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_errored_result_is_handed_back() {
        let mut report = Report::new();
        let err = report
            .add(QueryResult::failed(Error::DeadlineExceeded))
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(report.is_empty());
    }

    #[test]
    fn test_csv_is_sorted_with_footer() {
        let out = rendered(OutputFormat::Csv, Some(&stats()));
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines[0], "TS,HOST,MAX CPU USAGE,MIN CPU USAGE");
        assert_eq!(lines[1], "2017-01-01 08:59:00 UTC,host_b,80,5.25");
        assert_eq!(lines[2], "2017-01-01 09:00:00 UTC,host_a,70,1");
        assert_eq!(lines[3], "2017-01-01 09:00:00 UTC,host_b,90.5,10");
        assert_eq!(lines[4], ",,# Queries,3");
        assert_eq!(lines[5], ",,Total Query time (across all queries),6s");
        assert_eq!(lines.len(), 12);
    }

    #[test]
    fn test_tsv_without_stats() {
        let out = rendered(OutputFormat::Tsv, None);
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "2017-01-01 08:59:00 UTC\thost_b\t80\t5.25");
    }

    #[test]
    fn test_human_table_is_aligned() {
        let out = rendered(OutputFormat::Human, Some(&stats()));
        let lines: Vec<&str> = out.lines().collect();

        let width = lines[0].len();
        assert!(lines.iter().all(|l| l.len() == width), "{out}");
        assert!(lines[1].starts_with("| TS "));
        assert!(out.contains("| Std deviation "));
        assert_eq!(lines.iter().filter(|l| l.starts_with('+')).count(), 4);
    }

    #[test]
    fn test_markdown() {
        let out = rendered(OutputFormat::Markdown, None);
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines[0], "| TS | HOST | MAX CPU USAGE | MIN CPU USAGE |");
        assert_eq!(lines[1], "| --- | --- | ---: | ---: |");
        assert_eq!(lines[2], "| 2017-01-01 08:59:00 UTC | host_b | 80 | 5.25 |");
    }

    #[test]
    fn test_html_escapes_cells() {
        let mut report = Report::new();
        report
            .add(QueryResult::row("<host&1>", Utc::now(), 1.0, 0.0))
            .unwrap();
        let mut buf = Vec::new();
        report.render(&mut buf, OutputFormat::Html, Some(&stats())).unwrap();
        let out = String::from_utf8(buf).unwrap();

        assert!(out.starts_with("<table>\n  <thead>\n  <tr><th>TS</th>"));
        assert!(out.contains("<td>&lt;host&amp;1&gt;</td>"));
        assert!(out.contains("<tfoot>"));
        assert!(out.trim_end().ends_with("</table>"));
    }
}
