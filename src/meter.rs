//! Call-rate counters
//!
//! Exponentially weighted moving averages over 1, 5 and 15 minutes, the same
//! load-average style smoothing used by Unix `uptime`. Rates are advanced in
//! fixed 5 second ticks, claimed lazily by whichever thread marks or reads
//! the meter first after a tick boundary, so rates lag by up to one tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Interval between EWMA ticks
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

const SECONDS_PER_MINUTE: f64 = 60.0;

/// Exponentially weighted moving average of an event rate
#[derive(Debug)]
pub struct Ewma {
    alpha: f64,
    interval_secs: f64,
    uncounted: AtomicU64,
    rate_bits: AtomicU64,
    initialized: AtomicBool,
}

impl Ewma {
    /// Create an EWMA with an explicit smoothing factor
    pub fn new(alpha: f64, interval: Duration) -> Self {
        Self {
            alpha,
            interval_secs: interval.as_secs_f64(),
            uncounted: AtomicU64::new(0),
            rate_bits: AtomicU64::new(0f64.to_bits()),
            initialized: AtomicBool::new(false),
        }
    }

    /// EWMA equivalent to a load average over `minutes`
    pub fn over_minutes(minutes: f64) -> Self {
        let ticks_per_window = minutes * SECONDS_PER_MINUTE / TICK_INTERVAL.as_secs_f64();
        Self::new(1.0 - (-1.0 / ticks_per_window).exp(), TICK_INTERVAL)
    }

    /// Count `n` new events towards the next tick
    pub fn update(&self, n: u64) {
        self.uncounted.fetch_add(n, Ordering::Relaxed);
    }

    /// Fold the events counted since the last tick into the rate
    ///
    /// Callers must ensure a single tick runs at a time; [`Meter`] does this
    /// by claiming tick boundaries with a compare-exchange.
    pub fn tick(&self) {
        let count = self.uncounted.swap(0, Ordering::Relaxed);
        let instant_rate = count as f64 / self.interval_secs;

        if self.initialized.load(Ordering::Relaxed) {
            let rate = f64::from_bits(self.rate_bits.load(Ordering::Relaxed));
            let updated = rate + self.alpha * (instant_rate - rate);
            self.rate_bits.store(updated.to_bits(), Ordering::Relaxed);
        } else {
            self.rate_bits
                .store(instant_rate.to_bits(), Ordering::Relaxed);
            self.initialized.store(true, Ordering::Relaxed);
        }
    }

    /// Current rate in events per second
    pub fn rate_per_second(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }
}

/// Lifetime event count plus mean and moving-average rates
#[derive(Debug)]
pub struct Meter {
    count: AtomicU64,
    start: Instant,
    /// Nanoseconds since `start` of the last claimed tick boundary
    last_tick: AtomicU64,
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

impl Meter {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            start: Instant::now(),
            last_tick: AtomicU64::new(0),
            m1: Ewma::over_minutes(1.0),
            m5: Ewma::over_minutes(5.0),
            m15: Ewma::over_minutes(15.0),
        }
    }

    /// Record `n` events
    pub fn mark(&self, n: u64) {
        self.mark_at(n, self.now_nanos());
    }

    pub(crate) fn mark_at(&self, n: u64, now_nanos: u64) {
        self.tick_if_necessary(now_nanos);
        self.count.fetch_add(n, Ordering::Relaxed);
        self.m1.update(n);
        self.m5.update(n);
        self.m15.update(n);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Events per second over the meter's whole lifetime
    pub fn mean_rate(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        count as f64 / elapsed
    }

    pub fn one_minute_rate(&self) -> f64 {
        self.tick_if_necessary(self.now_nanos());
        self.m1.rate_per_second()
    }

    pub fn five_minute_rate(&self) -> f64 {
        self.tick_if_necessary(self.now_nanos());
        self.m5.rate_per_second()
    }

    pub fn fifteen_minute_rate(&self) -> f64 {
        self.tick_if_necessary(self.now_nanos());
        self.m15.rate_per_second()
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    pub(crate) fn tick_if_necessary(&self, now_nanos: u64) {
        let interval = TICK_INTERVAL.as_nanos() as u64;
        let old_tick = self.last_tick.load(Ordering::Relaxed);
        let age = now_nanos.saturating_sub(old_tick);
        if age <= interval {
            return;
        }

        let new_tick = now_nanos - age % interval;
        if self
            .last_tick
            .compare_exchange(old_tick, new_tick, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Another thread claimed this boundary
            return;
        }

        for _ in 0..age / interval {
            self.m1.tick();
            self.m5.tick();
            self.m15.tick();
        }
    }
}
