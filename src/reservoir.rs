//! Exponentially decaying sample reservoir
//!
//! Keeps a bounded, statistically representative sample of recent call
//! durations. Samples are weighted with forward decay (Cormode et al.,
//! "Forward Decay: A Practical Time Decay Model for Streaming Systems", 2009)
//! so that old bursts age out of the distribution while the reservoir never
//! grows past its configured size.
//!
//! Percentiles are never maintained incrementally. [`DecayingReservoir::snapshot`]
//! copies the current sample into a sorted [`Snapshot`] and every query is
//! answered from that copy, so repeated percentile queries against one
//! snapshot always agree with each other.

use parking_lot::Mutex;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Default number of samples retained (roughly 99.9% confidence, 5% margin)
pub const DEFAULT_SIZE: usize = 1028;

/// Default decay factor; biases the sample towards the last five minutes
pub const DEFAULT_ALPHA: f64 = 0.015;

/// Landmark rescale period, keeps the exponential weights inside f64 range
const RESCALE_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// Priority key with a total order so it can live in a `BTreeMap`
#[derive(Debug, Clone, Copy)]
struct Priority(f64);

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct WeightedSample {
    value: i64,
    weight: f64,
}

#[derive(Debug)]
struct ReservoirState {
    samples: BTreeMap<Priority, WeightedSample>,
    landmark: Instant,
    next_rescale: Instant,
}

/// Bounded, time-decayed sample of observations
#[derive(Debug)]
pub struct DecayingReservoir {
    size: usize,
    alpha: f64,
    state: Mutex<ReservoirState>,
}

impl Default for DecayingReservoir {
    fn default() -> Self {
        Self::new(DEFAULT_SIZE, DEFAULT_ALPHA)
    }
}

impl DecayingReservoir {
    /// Create a reservoir holding at most `size` samples
    ///
    /// # Panics
    ///
    /// Panics if `size` is 0.
    pub fn new(size: usize, alpha: f64) -> Self {
        assert!(size > 0, "Reservoir size must be > 0");

        let now = Instant::now();
        Self {
            size,
            alpha,
            state: Mutex::new(ReservoirState {
                samples: BTreeMap::new(),
                landmark: now,
                next_rescale: now + RESCALE_THRESHOLD,
            }),
        }
    }

    /// Number of samples currently retained (never more than the size bound)
    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the reservoir
    pub fn size(&self) -> usize {
        self.size
    }

    /// Add one observation
    pub fn update(&self, value: i64) {
        self.update_at(value, Instant::now());
    }

    pub(crate) fn update_at(&self, value: i64, now: Instant) {
        let mut state = self.state.lock();
        self.rescale_if_needed(&mut state, now);

        let weight = self.weight(now.saturating_duration_since(state.landmark));
        // 1 - [0, 1) keeps the divisor strictly positive
        let random: f64 = 1.0 - rand::thread_rng().gen::<f64>();
        let priority = Priority(weight / random);
        let sample = WeightedSample { value, weight };

        if state.samples.len() < self.size {
            state.samples.insert(priority, sample);
            return;
        }

        let lowest = match state.samples.keys().next() {
            Some(first) => *first,
            None => return,
        };
        if lowest < priority && !state.samples.contains_key(&priority) {
            state.samples.insert(priority, sample);
            state.samples.pop_first();
        }
    }

    /// Copy the current sample into an immutable, sorted snapshot
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        let weighted = state
            .samples
            .values()
            .map(|sample| (sample.value, sample.weight))
            .collect();
        drop(state);
        Snapshot::from_weighted(weighted)
    }

    fn weight(&self, age: Duration) -> f64 {
        (self.alpha * age.as_secs_f64()).exp()
    }

    /// Move the landmark forward so weights stay finite, scaling every
    /// existing priority and weight by the same factor
    fn rescale_if_needed(&self, state: &mut ReservoirState, now: Instant) {
        if now < state.next_rescale {
            return;
        }

        let old_landmark = state.landmark;
        state.landmark = now;
        state.next_rescale = now + RESCALE_THRESHOLD;

        let factor = (-self.alpha * now.saturating_duration_since(old_landmark).as_secs_f64()).exp();
        let old = std::mem::take(&mut state.samples);
        for (priority, sample) in old {
            let weight = sample.weight * factor;
            if weight == 0.0 {
                continue;
            }
            state.samples.insert(
                Priority(priority.0 * factor),
                WeightedSample {
                    value: sample.value,
                    weight,
                },
            );
        }
    }
}

/// Immutable view of a reservoir at query time
///
/// Values are nanoseconds for the timers in this crate, but the snapshot
/// itself is unit-agnostic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    values: Vec<i64>,
    norm_weights: Vec<f64>,
    quantiles: Vec<f64>,
}

impl Snapshot {
    /// Build a snapshot from `(value, weight)` pairs
    pub fn from_weighted(mut samples: Vec<(i64, f64)>) -> Self {
        samples.sort_by_key(|(value, _)| *value);

        let total_weight: f64 = samples.iter().map(|(_, weight)| weight).sum();
        let mut values = Vec::with_capacity(samples.len());
        let mut norm_weights = Vec::with_capacity(samples.len());
        let mut quantiles = Vec::with_capacity(samples.len());

        let mut cumulative = 0.0;
        for (value, weight) in samples {
            let norm = if total_weight > 0.0 {
                weight / total_weight
            } else {
                0.0
            };
            values.push(value);
            norm_weights.push(norm);
            quantiles.push(cumulative);
            cumulative += norm;
        }

        Self {
            values,
            norm_weights,
            quantiles,
        }
    }

    /// Build an evenly weighted snapshot
    pub fn from_values(values: Vec<i64>) -> Self {
        Self::from_weighted(values.into_iter().map(|value| (value, 1.0)).collect())
    }

    /// Value at `quantile` (0.0..=1.0, clamped)
    pub fn value(&self, quantile: f64) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let quantile = if quantile.is_nan() {
            0.0
        } else {
            quantile.clamp(0.0, 1.0)
        };

        let pos = match self
            .quantiles
            .binary_search_by(|q| q.total_cmp(&quantile))
        {
            Ok(index) => index,
            Err(0) => 0,
            Err(insertion) => insertion - 1,
        };
        self.values[pos.min(self.values.len() - 1)] as f64
    }

    /// Value at `percentile` (0.0..=100.0)
    pub fn percentile(&self, percentile: f64) -> f64 {
        self.value(percentile / 100.0)
    }

    pub fn median(&self) -> f64 {
        self.value(0.5)
    }

    pub fn p75(&self) -> f64 {
        self.value(0.75)
    }

    pub fn p95(&self) -> f64 {
        self.value(0.95)
    }

    pub fn p98(&self) -> f64 {
        self.value(0.98)
    }

    pub fn p99(&self) -> f64 {
        self.value(0.99)
    }

    pub fn p999(&self) -> f64 {
        self.value(0.999)
    }

    pub fn min(&self) -> i64 {
        self.values.first().copied().unwrap_or(0)
    }

    pub fn max(&self) -> i64 {
        self.values.last().copied().unwrap_or(0)
    }

    /// Weighted mean
    pub fn mean(&self) -> f64 {
        self.values
            .iter()
            .zip(&self.norm_weights)
            .map(|(value, weight)| *value as f64 * weight)
            .sum()
    }

    /// Weighted standard deviation (0 for fewer than two samples)
    pub fn std_dev(&self) -> f64 {
        if self.values.len() <= 1 {
            return 0.0;
        }

        let mean = self.mean();
        let variance: f64 = self
            .values
            .iter()
            .zip(&self.norm_weights)
            .map(|(value, weight)| {
                let diff = *value as f64 - mean;
                weight * diff * diff
            })
            .sum();
        variance.sqrt()
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    /// Sorted sample values
    pub fn values(&self) -> &[i64] {
        &self.values
    }
}
