//! Tables of written records.
//!
//! [`RecordTable`] renders [`OutputRecord`]s, as read back by
//! [`delimited::read_records`](crate::writers::delimited::read_records) or
//! [`array::read_records`](crate::writers::array::read_records), using the
//! `tabled` crate.
//!
//! # Feature Flag
//!
//! This module requires the `table` feature:
//!
//! ```toml
//! [dependencies]
//! perfdump = { version = "0.1", features = ["table"] }
//! ```
//!
//! # Examples
//!
//! ## Standard format (one row per record)
//!
//! ```rust,ignore
//! use perfdump::report::{RecordTable, TableStyle};
//! use perfdump::writers::delimited::read_records;
//!
//! let records = read_records("perf_dump.csv")?;
//! println!("{}", RecordTable::new().with_style(TableStyle::Rounded).render(&records));
//! // ╭──────┬────────┬─────────┬───────────╮
//! // │ Rank │ Region │ Metric  │ Value     │
//! // ├──────┼────────┼─────────┼───────────┤
//! // │ 0    │ solve  │ MINFLT  │ 120       │
//! // │ 0    │ solve  │ Runtime │ 0.8000000 │
//! // ╰──────┴────────┴─────────┴───────────╯
//! ```
//!
//! ## Summary format (one row per region and metric)
//!
//! ```rust,ignore
//! println!("{}", RecordTable::new().summary(true).render(&records));
//! // ╭────────┬─────────┬─────────┬─────┬─────┬───────╮
//! // │ Region │ Metric  │ Records │ Min │ Max │ Total │
//! // ...
//! ```

use tabled::{builder::Builder, settings::Style, Table, Tabled};

use crate::counters::MetricValue;
use crate::snapshot::OutputRecord;

/// Available table styles for rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TableStyle {
    /// ASCII table with simple characters: +, -, |
    Ascii,
    /// Modern rounded corners (default)
    #[default]
    Rounded,
    /// Sharp corners with box-drawing characters
    Sharp,
    /// GitHub-flavored Markdown table
    Markdown,
    /// No borders, just spacing
    Blank,
}

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Rank")]
    rank: usize,
    #[tabled(rename = "Region")]
    region: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: String,
}

/// Per region and metric aggregate of the summary format.
#[derive(Debug, Clone, PartialEq)]
struct Aggregate<'a> {
    region: &'a str,
    metric: &'a str,
    records: usize,
    min: MetricValue,
    max: MetricValue,
    total: MetricValue,
}

fn sum(a: MetricValue, b: MetricValue) -> MetricValue {
    match (a, b) {
        (MetricValue::Count(a), MetricValue::Count(b)) => MetricValue::Count(a.wrapping_add(b)),
        (MetricValue::Seconds(a), MetricValue::Seconds(b)) => MetricValue::Seconds(a + b),
        // Kinds never mix within one metric.
        (a, _) => a,
    }
}

/// Renders records as a table.
#[derive(Debug, Clone)]
pub struct RecordTable {
    style: TableStyle,
    show_header: bool,
    title: Option<String>,
    summary: bool,
}

impl Default for RecordTable {
    fn default() -> Self {
        Self {
            style: TableStyle::default(),
            show_header: true,
            title: None,
            summary: false,
        }
    }
}

impl RecordTable {
    /// Creates a table renderer with a header and the rounded style.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the table style.
    pub fn with_style(mut self, style: TableStyle) -> Self {
        self.style = style;
        self
    }

    /// Sets whether to show the header row.
    pub fn with_header(mut self, show: bool) -> Self {
        self.show_header = show;
        self
    }

    /// Sets a title printed above the table.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Aggregates per region and metric instead of listing every record.
    pub fn summary(mut self, enabled: bool) -> Self {
        self.summary = enabled;
        self
    }

    fn apply_style(&self, table: &mut Table) {
        match self.style {
            TableStyle::Ascii => {
                table.with(Style::ascii());
            }
            TableStyle::Rounded => {
                table.with(Style::rounded());
            }
            TableStyle::Sharp => {
                table.with(Style::sharp());
            }
            TableStyle::Markdown => {
                table.with(Style::markdown());
            }
            TableStyle::Blank => {
                table.with(Style::blank());
            }
        }
    }

    fn finish(&self, mut table: Table) -> String {
        self.apply_style(&mut table);
        if !self.show_header {
            table.with(tabled::settings::Remove::row(
                tabled::settings::object::Rows::first(),
            ));
        }
        match &self.title {
            Some(title) => format!("{}\n{}", title, table),
            None => table.to_string(),
        }
    }

    fn render_standard(&self, records: &[OutputRecord]) -> String {
        let rows: Vec<RecordRow> = records
            .iter()
            .map(|r| RecordRow {
                rank: r.rank,
                region: r.region.clone(),
                metric: r.metric.clone(),
                value: r.value.to_string(),
            })
            .collect();
        self.finish(Table::new(&rows))
    }

    fn render_summary(&self, records: &[OutputRecord]) -> String {
        let mut builder = Builder::default();
        builder.push_record(["Region", "Metric", "Records", "Min", "Max", "Total"].map(String::from));
        for agg in aggregate(records) {
            builder.push_record([
                agg.region.to_string(),
                agg.metric.to_string(),
                agg.records.to_string(),
                agg.min.to_string(),
                agg.max.to_string(),
                agg.total.to_string(),
            ]);
        }
        self.finish(builder.build())
    }

    /// Renders `records` as a table string.
    pub fn render(&self, records: &[OutputRecord]) -> String {
        if self.summary {
            self.render_summary(records)
        } else {
            self.render_standard(records)
        }
    }
}

/// Groups records by region and metric, in order of first appearance.
fn aggregate(records: &[OutputRecord]) -> Vec<Aggregate<'_>> {
    let mut out: Vec<Aggregate<'_>> = Vec::new();
    for record in records {
        let existing = out
            .iter_mut()
            .find(|a| a.region == record.region && a.metric == record.metric);
        match existing {
            Some(agg) => {
                agg.records += 1;
                if record.value < agg.min {
                    agg.min = record.value;
                }
                if record.value > agg.max {
                    agg.max = record.value;
                }
                agg.total = sum(agg.total, record.value);
            }
            None => out.push(Aggregate {
                region: &record.region,
                metric: &record.metric,
                records: 1,
                min: record.value,
                max: record.value,
                total: record.value,
            }),
        }
    }
    out
}
