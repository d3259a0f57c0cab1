//! Load ranking and share computation

use crate::statistic::MethodStatistic;
use std::sync::Arc;

/// A statistic's position in one ranking pass
#[derive(Debug, Clone)]
pub struct RankedStatistic {
    pub statistic: Arc<MethodStatistic>,
    /// Load observed when the pass ran, in nanoseconds
    pub load_nanos: u64,
    /// Integer percentage of the pass's total load (0..=100)
    pub share: u8,
}

impl RankedStatistic {
    pub fn name(&self) -> &str {
        self.statistic.name()
    }
}

/// Floored percentage of `load` over `total`; zero when `total` is zero
pub fn share_of(load: u64, total: u128) -> u8 {
    if total == 0 {
        return 0;
    }
    let share = u128::from(load) * 100 / total;
    share.min(100) as u8
}

/// Rank statistics by descending load and compute their shares
///
/// Each load is read once, so a statistic updated concurrently by a worker
/// cannot be ordered with one value and shared with another. The sort is
/// stable: equal loads keep the order of the source iterator.
pub fn rank<I>(statistics: I) -> Vec<RankedStatistic>
where
    I: IntoIterator<Item = Arc<MethodStatistic>>,
{
    let mut ranked: Vec<RankedStatistic> = statistics
        .into_iter()
        .map(|statistic| RankedStatistic {
            load_nanos: statistic.load_nanos(),
            statistic,
            share: 0,
        })
        .collect();

    ranked.sort_by(|a, b| b.load_nanos.cmp(&a.load_nanos));

    let total: u128 = ranked.iter().map(|r| u128::from(r.load_nanos)).sum();
    for entry in &mut ranked {
        entry.share = share_of(entry.load_nanos, total);
    }
    ranked
}
