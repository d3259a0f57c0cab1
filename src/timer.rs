//! Elapsed-time timer: call rates plus a decaying duration distribution
//!
//! An [`ElapsedTimer`] combines a [`Meter`] (throughput), a
//! [`DecayingReservoir`] (recent duration distribution) and an exact lifetime
//! total. The lifetime total makes `count` and the derived load exact and
//! monotonic even though the reservoir forgets old samples.

use crate::meter::Meter;
use crate::reservoir::{DecayingReservoir, Snapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Rolling statistics for one stream of call durations (nanoseconds)
#[derive(Debug, Default)]
pub struct ElapsedTimer {
    meter: Meter,
    reservoir: DecayingReservoir,
    total_nanos: AtomicU64,
}

impl ElapsedTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call duration
    pub fn record(&self, elapsed: Duration) {
        self.record_nanos(i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX));
    }

    /// Record one call duration given in nanoseconds
    ///
    /// Negative values come from a broken timing source and are dropped
    /// without touching any aggregate.
    pub fn record_nanos(&self, nanos: i64) {
        if nanos < 0 {
            debug!(nanos, "ignoring negative duration");
            return;
        }

        let nanos_u64 = nanos as u64;
        self.reservoir.update(nanos);
        let _ = self
            .total_nanos
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                Some(total.saturating_add(nanos_u64))
            });
        self.meter.mark(1);
    }

    /// Open a timing handle; stop it with [`TimingHandle::stop`]
    pub fn time(&self) -> TimingHandle {
        TimingHandle::start()
    }

    /// Lifetime number of recorded calls
    pub fn count(&self) -> u64 {
        self.meter.count()
    }

    /// Lifetime sum of recorded durations
    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_nanos())
    }

    pub fn total_nanos(&self) -> u64 {
        self.total_nanos.load(Ordering::Relaxed)
    }

    /// Lifetime mean duration (zero before the first call)
    pub fn mean_duration(&self) -> Duration {
        match self.count() {
            0 => Duration::ZERO,
            count => Duration::from_nanos(self.total_nanos() / count),
        }
    }

    pub fn mean_rate(&self) -> f64 {
        self.meter.mean_rate()
    }

    pub fn one_minute_rate(&self) -> f64 {
        self.meter.one_minute_rate()
    }

    pub fn five_minute_rate(&self) -> f64 {
        self.meter.five_minute_rate()
    }

    pub fn fifteen_minute_rate(&self) -> f64 {
        self.meter.fifteen_minute_rate()
    }

    /// Distribution of recent durations, taken now
    pub fn snapshot(&self) -> Snapshot {
        self.reservoir.snapshot()
    }
}

/// An open measurement; consumed when stopped so it is recorded at most once
#[derive(Debug)]
#[must_use = "an unstopped timing handle records nothing"]
pub struct TimingHandle {
    started: Instant,
}

impl TimingHandle {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Stop the measurement, record it into `timer` and return it
    pub fn stop(self, timer: &ElapsedTimer) -> Duration {
        let elapsed = self.started.elapsed();
        timer.record(elapsed);
        elapsed
    }
}
