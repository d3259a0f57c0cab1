//! Per-thread profiles
//!
//! Each worker thread that calls into an engine gets two halves:
//!
//! - a shared [`ThreadProfile`] (per-thread statistics registry, publish
//!   slots, liveness flag) that the engine's housekeeping pass reads
//!   concurrently, and
//! - a thread-local [`ThreadContext`] that owns the [`CallStack`]. It never
//!   leaves its thread, so `enter`/`exit` touch the stack without locks.
//!
//! When the thread exits, its thread-local storage is destroyed, the context
//! drops and flips the profile's liveness flag. Housekeeping then reaps the
//! profile on its next pass.

use crate::binder::RankBinder;
use crate::call_stack::{CallRecord, CallStack, Unwind};
use crate::publisher::{Publisher, Scope};
use crate::ranking::{rank, RankedStatistic};
use crate::statistic::{MethodStatistic, StatisticRegistry};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;
use tracing::{debug, warn};

/// Consecutive orphaned exits after which a thread's stack is reset
pub const ORPHAN_RESET_THRESHOLD: u32 = 3;

/// Shared, housekeeping-visible half of a worker thread's state
#[derive(Debug)]
pub struct ThreadProfile {
    id: ThreadId,
    scope: Scope,
    statistics: StatisticRegistry,
    binder: Mutex<RankBinder>,
    alive: AtomicBool,
    destroyed: AtomicBool,
}

impl ThreadProfile {
    /// Profile for the calling thread
    pub(crate) fn new(top_k: usize, publisher: Arc<dyn Publisher>) -> Self {
        let scope = Scope::current_thread();
        Self {
            id: std::thread::current().id(),
            binder: Mutex::new(RankBinder::new(scope.clone(), top_k, publisher)),
            scope,
            statistics: StatisticRegistry::new(),
            alive: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// False once the owning thread has terminated
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// True once [`ThreadProfile::destroy`] has run
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_terminated(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn statistic(&self, name: &str) -> Option<Arc<MethodStatistic>> {
        self.statistics.get(name)
    }

    pub(crate) fn statistic_or_insert<F>(&self, name: &str, enabled: F) -> Arc<MethodStatistic>
    where
        F: FnOnce() -> bool,
    {
        self.statistics.get_or_insert(name, enabled)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        self.statistics.set_enabled(name, enabled)
    }

    /// Forget the per-thread statistic for a withdrawn operation
    pub fn withdraw(&self, name: &str) -> bool {
        self.statistics.remove(name).is_some()
    }

    /// Current ranking of this thread's statistics
    pub fn ranking(&self) -> Vec<RankedStatistic> {
        rank(self.statistics.snapshot())
    }

    /// Recompute this thread's top-K and publish it
    pub fn rank_and_publish(&self) {
        if self.is_destroyed() {
            return;
        }
        let ranked = self.ranking();
        self.binder.lock().apply_ranking(&ranked);
    }

    pub fn resize(&self, top_k: usize) {
        self.binder.lock().resize(top_k);
    }

    /// Number of materialized publish slots
    pub fn published_len(&self) -> usize {
        self.binder.lock().len()
    }

    /// Release publish slots, keeping statistics
    pub fn release_slots(&self) {
        self.binder.lock().release_all();
    }

    /// Release every publish slot and detach the profile; idempotent
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.binder.lock().release_all();
        debug!(scope = %self.scope, "thread profile destroyed");
    }
}

/// Thread-local half: the call stack plus a handle on the shared profile
#[derive(Debug)]
pub struct ThreadContext {
    engine_id: u64,
    profile: Arc<ThreadProfile>,
    stack: CallStack,
    orphaned_exits: u32,
}

impl ThreadContext {
    pub fn new(engine_id: u64, profile: Arc<ThreadProfile>) -> Self {
        Self {
            engine_id,
            profile,
            stack: CallStack::new(),
            orphaned_exits: 0,
        }
    }

    pub fn profile(&self) -> &Arc<ThreadProfile> {
        &self.profile
    }

    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    /// Start timing `name` on this thread
    ///
    /// Returns true if a call record was pushed.
    pub fn enter<F>(&mut self, name: &str, force_active: bool, enabled_by_default: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let statistic = self.profile.statistic_or_insert(name, enabled_by_default);
        if !(force_active || statistic.is_enabled()) {
            return false;
        }
        self.stack.push(CallRecord::open(statistic));
        true
    }

    /// Stop timing `name` on this thread, applying the exit-unwind rule
    ///
    /// Returns the authoritative duration of the exiting call, or `None`
    /// when it was not timed or had no matching enter. An open record for
    /// `name` is always closed, whatever the operation's current enabled
    /// state; only an exit with nothing to close for a disabled operation
    /// is skipped quietly.
    pub fn exit(&mut self, name: &str, force_active: bool) -> Option<Duration> {
        if !force_active && !self.stack.contains(name) {
            let disabled = self
                .profile
                .statistic(name)
                .is_some_and(|statistic| !statistic.is_enabled());
            if disabled {
                return None;
            }
        }

        match self.stack.unwind(name) {
            Unwind::Matched { elapsed, skipped } => {
                if skipped > 0 {
                    debug!(operation = %name, skipped, "closed frames skipped by unwinding");
                }
                self.orphaned_exits = 0;
                Some(elapsed)
            }
            Unwind::Exhausted { closed } => {
                self.orphaned_exits += 1;
                warn!(
                    operation = %name,
                    closed,
                    scope = %self.profile.scope(),
                    "exit without matching enter"
                );
                if self.orphaned_exits >= ORPHAN_RESET_THRESHOLD {
                    warn!(
                        scope = %self.profile.scope(),
                        orphaned = self.orphaned_exits,
                        "resetting call stack after repeated orphaned exits"
                    );
                    self.stack.reset();
                    self.orphaned_exits = 0;
                }
                None
            }
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.profile.mark_terminated();
    }
}

thread_local! {
    static CONTEXTS: RefCell<Vec<ThreadContext>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` on this thread's context for `engine_id`, creating it with
/// `attach` when missing or stale
///
/// Returns `None` when thread-local storage is being torn down, when called
/// re-entrantly, or when `attach` declines.
pub(crate) fn with_context<A, F, R>(engine_id: u64, attach: A, f: F) -> Option<R>
where
    A: FnOnce() -> Option<Arc<ThreadProfile>>,
    F: FnOnce(&mut ThreadContext) -> R,
{
    CONTEXTS
        .try_with(|cell| {
            let mut contexts = cell.try_borrow_mut().ok()?;
            let index = match live_index(&contexts, engine_id) {
                Some(index) => index,
                None => {
                    // Drop contexts whose profiles were destroyed (engine shut
                    // down) before attaching a fresh one
                    contexts.retain(|context| !context.profile.is_destroyed());
                    let profile = attach()?;
                    contexts.push(ThreadContext::new(engine_id, profile));
                    contexts.len() - 1
                }
            };
            Some(f(&mut contexts[index]))
        })
        .ok()
        .flatten()
}

/// Like [`with_context`] but never attaches a new context
pub(crate) fn with_existing_context<F, R>(engine_id: u64, f: F) -> Option<R>
where
    F: FnOnce(&mut ThreadContext) -> R,
{
    CONTEXTS
        .try_with(|cell| {
            let mut contexts = cell.try_borrow_mut().ok()?;
            let index = live_index(&contexts, engine_id)?;
            Some(f(&mut contexts[index]))
        })
        .ok()
        .flatten()
}

fn live_index(contexts: &[ThreadContext], engine_id: u64) -> Option<usize> {
    contexts
        .iter()
        .position(|context| context.engine_id == engine_id && !context.profile.is_destroyed())
}
