use std::{collections::BTreeMap, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::metric::RequestOutcome;

/// Latency samples kept per label.
pub const RESERVOIR_CAPACITY: usize = 1000;
/// Distinct error messages tracked per label before folding into [`OTHER_ERRORS`].
pub const MAX_DISTINCT_ERRORS: usize = 64;
/// Bucket collecting failures whose message did not fit in the breakdown.
pub const OTHER_ERRORS: &str = "<other errors>";

/// Bounded uniform sample of latencies (reservoir sampling, algorithm R).
///
/// The first `capacity` values are kept verbatim. Afterwards the n-th value replaces
/// a random slot with probability `capacity / n`, so every value seen so far has the
/// same chance of being in the sample and percentile estimates stay representative
/// while memory stays flat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reservoir {
    capacity: usize,
    seen: u64,
    samples: Vec<Duration>,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: 0,
            samples: Vec::with_capacity(capacity.min(64)),
        }
    }

    pub fn offer<R: Rng + ?Sized>(&mut self, value: Duration, rng: &mut R) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
            return;
        }
        let slot = rng.random_range(0..self.seen);
        if (slot as usize) < self.capacity {
            self.samples[slot as usize] = value;
        }
    }

    /// Union with another reservoir, ignoring capacity.
    ///
    /// Only used for report-time roll-ups so the result stays deterministic.
    pub fn absorb(&mut self, other: &Reservoir) {
        self.seen += other.seen;
        self.samples.extend_from_slice(&other.samples);
        self.capacity = self.capacity.max(self.samples.len());
    }

    pub fn samples(&self) -> &[Duration] {
        &self.samples
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Nearest-rank percentiles for each quantile in `qs`, in order.
    pub fn percentiles(&self, qs: &[f64]) -> Vec<Duration> {
        if self.samples.is_empty() {
            return vec![Duration::ZERO; qs.len()];
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        qs.iter()
            .map(|q| {
                let rank = (q.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
                sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
            })
            .collect()
    }
}

impl Default for Reservoir {
    fn default() -> Self {
        Self::new(RESERVOIR_CAPACITY)
    }
}

/// Per-label accumulated statistics.
///
/// An entry only holds raw, mergeable data. Averages and percentiles are derived
/// when a [`LabelReport`](crate::report::LabelReport) is built from it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub count: u64,
    pub fail_count: u64,
    pub sum_latency: Duration,
    pub min_latency: Option<Duration>,
    pub max_latency: Duration,
    pub total_bytes: u64,
    pub latency_samples: Reservoir,
    /// error detail -> occurrences, at most `MAX_DISTINCT_ERRORS + 1` keys
    pub errors: BTreeMap<String, u64>,
}

impl AggregateEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(reservoir: usize) -> Self {
        Self {
            latency_samples: Reservoir::new(reservoir),
            ..Self::default()
        }
    }

    /// Incorporate a single outcome.
    pub fn consume<R: Rng + ?Sized>(&mut self, outcome: &RequestOutcome, rng: &mut R) {
        self.count += 1;
        self.sum_latency += outcome.latency;
        self.min_latency = Some(match self.min_latency {
            Some(min) => min.min(outcome.latency),
            None => outcome.latency,
        });
        self.max_latency = self.max_latency.max(outcome.latency);
        self.total_bytes += outcome.bytes as u64;
        self.latency_samples.offer(outcome.latency, rng);

        if !outcome.success {
            self.fail_count += 1;
            self.note_error(outcome.error.as_deref().unwrap_or("failure"));
        }
    }

    /// Incorporate a batch of outcomes.
    pub fn aggregate<R: Rng + ?Sized>(&mut self, outcomes: &[RequestOutcome], rng: &mut R) {
        outcomes.iter().for_each(|o| self.consume(o, rng));
    }

    /// Combine another entry into this one. Associative and commutative on every
    /// counter; samples are unioned (see [`Reservoir::absorb`]).
    pub fn merge(&mut self, other: &AggregateEntry) {
        self.count += other.count;
        self.fail_count += other.fail_count;
        self.sum_latency += other.sum_latency;
        self.min_latency = match (self.min_latency, other.min_latency) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_latency = self.max_latency.max(other.max_latency);
        self.total_bytes += other.total_bytes;
        self.latency_samples.absorb(&other.latency_samples);
        for (detail, n) in &other.errors {
            *self.errors.entry(detail.clone()).or_insert(0) += n;
        }
    }

    fn note_error(&mut self, detail: &str) {
        if let Some(n) = self.errors.get_mut(detail) {
            *n += 1;
            return;
        }
        let distinct = self.errors.len() - usize::from(self.errors.contains_key(OTHER_ERRORS));
        let key = if distinct < MAX_DISTINCT_ERRORS {
            detail
        } else {
            OTHER_ERRORS
        };
        *self.errors.entry(key.to_owned()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn consume_tracks_counts_bytes_and_extremes() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut entry = AggregateEntry::new();
        entry.aggregate(
            &[
                RequestOutcome::success("GET /api/products", ms(20), 100),
                RequestOutcome::success("GET /api/products", ms(10), 50),
                RequestOutcome::failure("GET /api/products", ms(40), 0, "HTTP 500"),
            ],
            &mut rng,
        );

        assert_eq!(entry.count, 3);
        assert_eq!(entry.fail_count, 1);
        assert_eq!(entry.total_bytes, 150);
        assert_eq!(entry.sum_latency, ms(70));
        assert_eq!(entry.min_latency, Some(ms(10)));
        assert_eq!(entry.max_latency, ms(40));
        assert_eq!(entry.errors.get("HTTP 500"), Some(&1));
    }

    #[test]
    fn reservoir_stays_bounded() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut reservoir = Reservoir::new(100);
        for i in 0..10_000 {
            reservoir.offer(ms(i), &mut rng);
        }
        assert_eq!(reservoir.samples().len(), 100);
        assert_eq!(reservoir.seen(), 10_000);
    }

    #[test]
    fn reservoir_sample_is_representative() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut reservoir = Reservoir::new(1000);
        for i in 0..100_000u64 {
            reservoir.offer(ms(i % 1000), &mut rng);
        }
        let p50 = reservoir.percentiles(&[0.5])[0];
        // uniform 0..1000ms, so the median should sit near 500ms
        assert!((400..600).contains(&p50.as_millis()), "p50 = {p50:?}");
    }

    #[test]
    fn nearest_rank_percentiles() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut reservoir = Reservoir::new(1000);
        for i in 1..=100 {
            reservoir.offer(ms(i), &mut rng);
        }
        let p = reservoir.percentiles(&[0.5, 0.95, 0.99, 1.0]);
        assert_eq!(p, vec![ms(50), ms(95), ms(99), ms(100)]);
        assert_eq!(Reservoir::new(10).percentiles(&[0.5]), vec![Duration::ZERO]);
    }

    #[test]
    fn error_breakdown_is_capped_without_losing_failures() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut entry = AggregateEntry::new();
        let total = MAX_DISTINCT_ERRORS as u64 + 36;
        for i in 0..total {
            entry.consume(
                &RequestOutcome::failure("POST /api/users", ms(1), 0, format!("boom #{i}")),
                &mut rng,
            );
        }

        assert_eq!(entry.fail_count, total);
        assert_eq!(entry.errors.len(), MAX_DISTINCT_ERRORS + 1);
        assert_eq!(entry.errors.get(OTHER_ERRORS), Some(&36));
        assert_eq!(entry.errors.values().sum::<u64>(), total);
        // already-known messages keep counting under their own key
        entry.consume(
            &RequestOutcome::failure("POST /api/users", ms(1), 0, "boom #0"),
            &mut rng,
        );
        assert_eq!(entry.errors.get("boom #0"), Some(&2));
    }

    #[test]
    fn merge_is_order_independent_on_counters() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut a = AggregateEntry::new();
        let mut b = AggregateEntry::new();
        a.consume(&RequestOutcome::success("x", ms(5), 10), &mut rng);
        b.consume(&RequestOutcome::failure("x", ms(15), 0, "HTTP 404"), &mut rng);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab.count, ba.count);
        assert_eq!(ab.fail_count, ba.fail_count);
        assert_eq!(ab.min_latency, Some(ms(5)));
        assert_eq!(ba.max_latency, ms(15));
        assert_eq!(ab.errors, ba.errors);
        assert_eq!(ab.latency_samples.samples().len(), 2);
    }
}
