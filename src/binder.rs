//! Bounded publish slots tracking the current top-K of a ranking
//!
//! A [`RankBinder`] owns up to `bound` slots for one [`Scope`]. Slot `i`
//! publishes whichever statistic holds rank `i` in the latest ranking pass.
//! Slots are created lazily: raising the bound only allows more slots, and a
//! slot is materialized (and announced to the publisher) the first time a
//! ranking pass has an entry for it.

use crate::publisher::{PublishError, Publisher, Scope};
use crate::ranking::RankedStatistic;
use crate::reservoir::Snapshot;
use crate::statistic::MethodStatistic;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Stable handle given to the publisher for one slot
///
/// The handle outlives rebinds: when a different statistic moves into the
/// slot the handle is updated in place and the publisher is told about it.
/// All accessors are read-only.
#[derive(Debug)]
pub struct PublishedStatistic {
    scope: Scope,
    rank: usize,
    statistic: RwLock<Arc<MethodStatistic>>,
    share: AtomicU8,
}

impl PublishedStatistic {
    pub fn new(scope: Scope, rank: usize, statistic: Arc<MethodStatistic>, share: u8) -> Self {
        Self {
            scope,
            rank,
            statistic: RwLock::new(statistic),
            share: AtomicU8::new(share),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Statistic currently bound to this slot
    pub fn statistic(&self) -> Arc<MethodStatistic> {
        Arc::clone(&self.statistic.read())
    }

    pub fn name(&self) -> Arc<str> {
        self.statistic.read().name_arc()
    }

    pub fn count(&self) -> u64 {
        self.statistic.read().count()
    }

    pub fn mean_rate(&self) -> f64 {
        self.statistic.read().timer().mean_rate()
    }

    pub fn one_minute_rate(&self) -> f64 {
        self.statistic.read().timer().one_minute_rate()
    }

    pub fn five_minute_rate(&self) -> f64 {
        self.statistic.read().timer().five_minute_rate()
    }

    pub fn fifteen_minute_rate(&self) -> f64 {
        self.statistic.read().timer().fifteen_minute_rate()
    }

    /// Duration distribution (min/max/mean/stddev/percentiles, nanoseconds)
    pub fn snapshot(&self) -> Snapshot {
        self.statistic.read().timer().snapshot()
    }

    pub fn load(&self) -> Duration {
        self.statistic.read().load()
    }

    /// Share of load computed by the last ranking pass that touched this slot
    pub fn share(&self) -> u8 {
        self.share.load(Ordering::Relaxed)
    }

    fn holds(&self, statistic: &Arc<MethodStatistic>) -> bool {
        Arc::ptr_eq(&self.statistic.read(), statistic)
    }

    fn rebind(&self, statistic: Arc<MethodStatistic>) {
        *self.statistic.write() = statistic;
    }

    fn set_share(&self, share: u8) {
        self.share.store(share, Ordering::Relaxed);
    }
}

/// Top-K publish slots for one scope
pub struct RankBinder {
    scope: Scope,
    bound: usize,
    slots: Vec<Arc<PublishedStatistic>>,
    publisher: Arc<dyn Publisher>,
}

impl std::fmt::Debug for RankBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankBinder")
            .field("scope", &self.scope)
            .field("bound", &self.bound)
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl RankBinder {
    pub fn new(scope: Scope, bound: usize, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            scope,
            bound,
            slots: Vec::with_capacity(bound),
            publisher,
        }
    }

    /// Configured maximum number of slots
    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Number of materialized slots (never more than `bound`)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, rank: usize) -> Option<&Arc<PublishedStatistic>> {
        self.slots.get(rank)
    }

    /// Names bound to slots, in rank order
    pub fn bound_names(&self) -> Vec<Arc<str>> {
        self.slots.iter().map(|slot| slot.name()).collect()
    }

    /// Change the bound; excess slots are released from the tail
    ///
    /// Slots below the new bound keep their statistics.
    pub fn resize(&mut self, bound: usize) {
        self.truncate(bound);
        self.bound = bound;
    }

    /// Bind slot `i` to entry `i` of `ranked` for every rank both have
    pub fn apply_ranking(&mut self, ranked: &[RankedStatistic]) {
        if ranked.len() < self.slots.len() {
            self.truncate(ranked.len());
        }

        let filled = self.bound.min(ranked.len());
        for (rank, entry) in ranked.iter().enumerate().take(filled) {
            match self.slots.get(rank) {
                Some(slot) => {
                    slot.set_share(entry.share);
                    if !slot.holds(&entry.statistic) {
                        slot.rebind(Arc::clone(&entry.statistic));
                        let slot = Arc::clone(slot);
                        self.notify_bound(rank, &slot);
                    }
                }
                None => {
                    let slot = Arc::new(PublishedStatistic::new(
                        self.scope.clone(),
                        rank,
                        Arc::clone(&entry.statistic),
                        entry.share,
                    ));
                    self.slots.push(Arc::clone(&slot));
                    self.notify_bound(rank, &slot);
                }
            }
        }
    }

    /// Release every slot; the bound is kept for the next pass
    pub fn release_all(&mut self) {
        self.truncate(0);
    }

    fn truncate(&mut self, len: usize) {
        while self.slots.len() > len {
            self.slots.pop();
            let rank = self.slots.len();
            let result = self.publisher.on_rank_released(&self.scope, rank);
            self.log_failure(result, rank, "release");
        }
    }

    fn notify_bound(&self, rank: usize, slot: &Arc<PublishedStatistic>) {
        let result = self.publisher.on_rank_bound(&self.scope, rank, slot);
        self.log_failure(result, rank, "bind");
    }

    fn log_failure(&self, result: Result<(), PublishError>, rank: usize, action: &str) {
        if let Err(err) = result {
            warn!(scope = %self.scope, rank, action, error = %err, "publisher failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{InMemoryPublisher, PublishEvent};
    use crate::ranking::rank;

    fn statistic(name: &str, ms: u64) -> Arc<MethodStatistic> {
        let statistic = Arc::new(MethodStatistic::new(Arc::from(name), true));
        statistic.record(Duration::from_millis(ms));
        statistic
    }

    fn binder(bound: usize) -> (RankBinder, Arc<InMemoryPublisher>) {
        let publisher = Arc::new(InMemoryPublisher::new());
        let binder = RankBinder::new(Scope::Global, bound, publisher.clone());
        (binder, publisher)
    }

    #[test]
    fn test_apply_ranking_fills_up_to_bound() {
        let (mut binder, publisher) = binder(2);
        let ranked = rank(vec![statistic("a", 1), statistic("b", 3), statistic("c", 2)]);

        binder.apply_ranking(&ranked);

        assert_eq!(binder.len(), 2);
        let names: Vec<String> = binder.bound_names().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(publisher.scope_len(&Scope::Global), 2);
        assert_eq!(binder.slot(0).unwrap().share(), 50);
    }

    #[test]
    fn test_resize_up_is_lazy() {
        let (mut binder, publisher) = binder(1);
        binder.apply_ranking(&rank(vec![statistic("a", 2), statistic("b", 1)]));
        assert_eq!(binder.len(), 1);

        binder.resize(5);
        assert_eq!(binder.bound(), 5);
        assert_eq!(binder.len(), 1);
        assert_eq!(publisher.len(), 1);
    }

    #[test]
    fn test_resize_down_releases_tail() {
        let (mut binder, publisher) = binder(3);
        binder.apply_ranking(&rank(vec![
            statistic("a", 3),
            statistic("b", 2),
            statistic("c", 1),
        ]));

        binder.resize(1);
        assert_eq!(binder.len(), 1);
        assert_eq!(binder.bound_names()[0].as_ref(), "a");

        let released: Vec<usize> = publisher
            .events()
            .into_iter()
            .filter_map(|event| match event {
                PublishEvent::Released { rank, .. } => Some(rank),
                PublishEvent::Bound { .. } => None,
            })
            .collect();
        assert_eq!(released, vec![2, 1]);
    }

    #[test]
    fn test_shorter_ranking_shrinks_slots_but_keeps_bound() {
        let (mut binder, _publisher) = binder(3);
        let (a, b, c) = (statistic("a", 3), statistic("b", 2), statistic("c", 1));
        binder.apply_ranking(&rank(vec![a.clone(), b.clone(), c.clone()]));
        assert_eq!(binder.len(), 3);

        binder.apply_ranking(&rank(vec![a.clone()]));
        assert_eq!(binder.len(), 1);
        assert_eq!(binder.bound(), 3);

        binder.apply_ranking(&rank(vec![a, b, c]));
        assert_eq!(binder.len(), 3);
    }

    #[test]
    fn test_rebind_same_statistic_is_silent() {
        let (mut binder, publisher) = binder(2);
        let ranked = rank(vec![statistic("a", 2), statistic("b", 1)]);

        binder.apply_ranking(&ranked);
        binder.apply_ranking(&ranked);

        assert_eq!(publisher.events().len(), 2);
    }

    #[test]
    fn test_rank_change_rebinds_slot_handle() {
        let (mut binder, publisher) = binder(2);
        let a = statistic("a", 2);
        let b = statistic("b", 1);
        binder.apply_ranking(&rank(vec![a.clone(), b.clone()]));
        let handle = Arc::clone(binder.slot(0).unwrap());

        // b overtakes a
        b.record(Duration::from_millis(10));
        binder.apply_ranking(&rank(vec![a, b]));

        assert_eq!(handle.name().as_ref(), "b");
        assert_eq!(binder.bound_names()[1].as_ref(), "a");
        // Two initial binds plus two rebinds, no release
        assert_eq!(publisher.events().len(), 4);
        assert_eq!(publisher.released_count(&Scope::Global), 0);
    }

    #[test]
    fn test_release_all() {
        let (mut binder, publisher) = binder(2);
        binder.apply_ranking(&rank(vec![statistic("a", 2), statistic("b", 1)]));

        binder.release_all();
        assert!(binder.is_empty());
        assert!(publisher.is_empty());
        assert_eq!(binder.bound(), 2);

        // Releasing again is a no-op
        binder.release_all();
        assert_eq!(publisher.released_count(&Scope::Global), 2);
    }

    #[test]
    fn test_zero_bound_never_binds() {
        let (mut binder, publisher) = binder(0);
        binder.apply_ranking(&rank(vec![statistic("a", 1)]));
        assert!(binder.is_empty());
        assert!(publisher.is_empty());
    }

    #[test]
    fn test_publisher_failure_does_not_change_slots() {
        struct FailingPublisher;
        impl Publisher for FailingPublisher {
            fn on_rank_bound(
                &self,
                scope: &Scope,
                rank: usize,
                _statistic: &Arc<PublishedStatistic>,
            ) -> Result<(), PublishError> {
                Err(PublishError::Rejected {
                    scope: scope.to_string(),
                    rank,
                    reason: "nope".to_string(),
                })
            }

            fn on_rank_released(&self, _scope: &Scope, _rank: usize) -> Result<(), PublishError> {
                Err(PublishError::Unavailable("down".to_string()))
            }
        }

        let mut binder = RankBinder::new(Scope::Global, 2, Arc::new(FailingPublisher));
        binder.apply_ranking(&rank(vec![statistic("a", 1)]));
        assert_eq!(binder.len(), 1);
        binder.release_all();
        assert!(binder.is_empty());
    }
}
