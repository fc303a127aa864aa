//! Stats Aggregator: concurrent accumulation of [`RequestOutcome`]s per label.
//!
//! Every virtual user records straight into the aggregator. The label map sits behind
//! a read-write lock that is only taken for writing the first time a label shows up;
//! each [`AggregateEntry`] then has its own mutex, so users hitting different labels
//! never contend and users hitting the same label serialize on that entry alone.
//! Entries are created lazily and only removed by [`StatsAggregator::reset`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::{aggregate::AggregateEntry, metric::RequestOutcome, report::Snapshot};

/// Wall-clock window the statistics cover; `end` is set once the run stops.
#[derive(Debug, Clone, Copy)]
struct Window {
    start: Instant,
    end: Option<Instant>,
}

impl Window {
    fn open() -> Self {
        Self {
            start: Instant::now(),
            end: None,
        }
    }

    fn elapsed(&self) -> Duration {
        self.end
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.start)
    }
}

pub struct StatsAggregator {
    entries: RwLock<HashMap<String, Arc<Mutex<AggregateEntry>>>>,
    window: Mutex<Window>,
    reservoir_capacity: usize,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::with_reservoir(crate::aggregate::RESERVOIR_CAPACITY)
    }

    pub fn with_reservoir(reservoir_capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            window: Mutex::new(Window::open()),
            reservoir_capacity,
        }
    }

    /// Record one outcome. Safe to call from any number of tasks at once.
    pub fn record(&self, outcome: RequestOutcome) {
        let entry = self.entry(&outcome.label);
        entry.lock().consume(&outcome, &mut rand::rng());
    }

    fn entry(&self, label: &str) -> Arc<Mutex<AggregateEntry>> {
        if let Some(entry) = self.entries.read().get(label) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write();
        // another recorder may have created it between the two locks
        Arc::clone(entries.entry(label.to_owned()).or_insert_with(|| {
            Arc::new(Mutex::new(AggregateEntry::with_capacity(
                self.reservoir_capacity,
            )))
        }))
    }

    /// Immutable copy of every entry plus derived percentiles.
    pub fn snapshot(&self) -> Snapshot {
        let elapsed = self.window.lock().elapsed();
        let entries: Vec<(String, AggregateEntry)> = self
            .entries
            .read()
            .iter()
            .map(|(label, entry)| (label.clone(), entry.lock().clone()))
            .collect();
        Snapshot::from_entries(entries, elapsed)
    }

    /// Raw entry for one label, if anything was recorded under it.
    pub fn entry_for(&self, label: &str) -> Option<AggregateEntry> {
        self.entries
            .read()
            .get(label)
            .map(|entry| entry.lock().clone())
    }

    /// Drop every entry and restart the measurement window.
    ///
    /// The run controller only calls this while the run is idle or stopped.
    pub fn reset(&self) {
        self.entries.write().clear();
        *self.window.lock() = Window::open();
    }

    /// Restart the measurement window without touching recorded data.
    pub(crate) fn open_window(&self) {
        *self.window.lock() = Window::open();
    }

    /// Freeze the measurement window so later snapshots stay identical.
    pub(crate) fn close_window(&self) {
        let mut window = self.window.lock();
        if window.end.is_none() {
            window.end = Some(Instant::now());
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
