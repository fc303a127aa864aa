use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The result of one logical request, produced once and never mutated.
///
/// The `label` is the aggregation key: outcomes sharing a label are merged into
/// the same [`AggregateEntry`](crate::aggregate::AggregateEntry) no matter which task
/// produced them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub label: String,
    pub success: bool,
    pub latency: Duration,
    /// Response body length; zero when no response arrived.
    pub bytes: usize,
    pub error: Option<String>,
}

impl RequestOutcome {
    pub fn success(label: impl Into<String>, latency: Duration, bytes: usize) -> Self {
        Self {
            label: label.into(),
            success: true,
            latency,
            bytes,
            error: None,
        }
    }

    pub fn failure(
        label: impl Into<String>,
        latency: Duration,
        bytes: usize,
        error: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            success: false,
            latency,
            bytes,
            error: Some(error.into()),
        }
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}
