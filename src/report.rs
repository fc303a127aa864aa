use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, io::Write, time::Duration};

use crate::aggregate::AggregateEntry;

/// Label of the roll-up row computed over every label.
pub const TOTAL_LABEL: &str = "Aggregated";

/// Derived statistics for one label.
///
/// Reports are pure data: built from an [`AggregateEntry`] and free of I/O. All
/// latencies are in milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelReport {
    pub label: String,
    pub count: u64,
    pub fail_count: u64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub total_bytes: u64,
    pub requests_per_second: f64,
    pub error_breakdown: BTreeMap<String, u64>,
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl LabelReport {
    pub fn from_entry(label: impl Into<String>, entry: &AggregateEntry, elapsed: Duration) -> Self {
        let pcts = entry.latency_samples.percentiles(&[0.50, 0.95, 0.99]);
        let avg_latency_ms = if entry.count == 0 {
            0.0
        } else {
            as_ms(entry.sum_latency) / entry.count as f64
        };
        let requests_per_second = if elapsed.is_zero() {
            0.0
        } else {
            entry.count as f64 / elapsed.as_secs_f64()
        };
        Self {
            label: label.into(),
            count: entry.count,
            fail_count: entry.fail_count,
            p50: as_ms(pcts[0]),
            p95: as_ms(pcts[1]),
            p99: as_ms(pcts[2]),
            avg_latency_ms,
            min_latency_ms: entry.min_latency.map(as_ms).unwrap_or(0.0),
            max_latency_ms: as_ms(entry.max_latency),
            total_bytes: entry.total_bytes,
            requests_per_second,
            error_breakdown: entry.errors.clone(),
        }
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.fail_count as f64 / self.count as f64
        }
    }
}

/// Point-in-time copy of every label's statistics.
///
/// Labels are sorted, so two snapshots of the same aggregator state are equal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub elapsed_secs: f64,
    pub labels: Vec<LabelReport>,
    /// Roll-up over all labels; `None` until something was recorded.
    pub total: Option<LabelReport>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            elapsed_secs: 0.0,
            labels: Vec::new(),
            total: None,
        }
    }

    /// Build a snapshot from `(label, entry)` pairs, sorted by label.
    pub fn from_entries(mut entries: Vec<(String, AggregateEntry)>, elapsed: Duration) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let total = (!entries.is_empty()).then(|| {
            let mut all = AggregateEntry::new();
            entries.iter().for_each(|(_, e)| all.merge(e));
            LabelReport::from_entry(TOTAL_LABEL, &all, elapsed)
        });
        Self {
            elapsed_secs: elapsed.as_secs_f64(),
            labels: entries
                .iter()
                .map(|(label, e)| LabelReport::from_entry(label.as_str(), e, elapsed))
                .collect(),
            total,
        }
    }

    pub fn label(&self, label: &str) -> Option<&LabelReport> {
        self.labels.iter().find(|r| r.label == label)
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// One-line summary for periodic logging.
    pub fn summary(&self) -> String {
        match &self.total {
            Some(t) => format!(
                "{} requests, {} failed, {:.1} req/s, p50 {:.1}ms, p95 {:.1}ms",
                t.count, t.fail_count, t.requests_per_second, t.p50, t.p95
            ),
            None => "no requests recorded".to_string(),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<40} {:>9} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9}",
            "Name", "# reqs", "# fails", "Avg", "p50", "p95", "p99", "req/s"
        )?;
        writeln!(f, "{}", "-".repeat(110))?;
        for r in self.labels.iter().chain(self.total.iter()) {
            writeln!(
                f,
                "{:<40} {:>9} {:>8} {:>9.1} {:>9.1} {:>9.1} {:>9.1} {:>9.2}",
                r.label,
                r.count,
                r.fail_count,
                r.avg_latency_ms,
                r.p50,
                r.p95,
                r.p99,
                r.requests_per_second
            )?;
        }
        let errors: Vec<_> = self
            .labels
            .iter()
            .flat_map(|r| r.error_breakdown.iter().map(move |(e, n)| (&r.label, e, n)))
            .collect();
        if !errors.is_empty() {
            writeln!(f, "\nErrors")?;
            for (label, detail, n) in errors {
                writeln!(f, "{n:>9}  {label}: {detail}")?;
            }
        }
        Ok(())
    }
}

/// A [`Reporter`] consumes a [`Snapshot`] and performs side effects: displaying it,
/// sending it to a service, or persisting it somewhere.
///
/// Reporters are the I/O boundary; snapshots stay pure data.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(
        &self,
        snapshot: &Snapshot,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Prints the snapshot as a table.
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    async fn report(
        &self,
        snapshot: &Snapshot,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut out = std::io::stdout().lock();
        write!(out, "{snapshot}")?;
        out.flush()?;
        Ok(())
    }
}

/// Prints the snapshot as one JSON document.
#[derive(Default)]
pub struct JsonReporter {
    pub pretty: bool,
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn report(
        &self,
        snapshot: &Snapshot,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let value = if self.pretty {
            serde_json::to_string_pretty(snapshot)?
        } else {
            serde_json::to_string(snapshot)?
        };
        println!("{value}");
        Ok(())
    }
}
