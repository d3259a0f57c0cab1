//! Engine context: registries, lifecycle and housekeeping
//!
//! An [`Engine`] is constructed explicitly by the instrumentation layer and
//! shared (typically in an `Arc`) with every instrumented call site. Worker
//! threads call [`Engine::enter`] and [`Engine::exit`]; everything else is
//! lifecycle and maintenance.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --initialize--> Initialized --start--> Running
//!                                    ^                    |
//!                                    |                  stop
//!                                    |                    v
//!                                    +------start------ Stopped
//!
//! any state --shut_down--> ShutDown
//! ```
//!
//! # Housekeeping
//!
//! A background driver thread only raises a dirty flag every
//! `housekeeping_interval`. The next `exit` on any worker thread consumes
//! the flag and runs one pass: reap profiles of terminated threads, re-rank
//! the global registry into the global publish slots, and re-rank every live
//! thread profile. A pass never blocks `enter`/`exit` on other threads.

use crate::binder::RankBinder;
use crate::config::EngineConfig;
use crate::publisher::{NoopPublisher, Publisher, Scope};
use crate::ranking::{rank, RankedStatistic};
use crate::statistic::{MethodStatistic, StatisticRegistry};
use crate::thread_profile::{self, ThreadProfile};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Errors from engine lifecycle and configuration calls
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn housekeeping driver: {0}")]
    DriverSpawn(#[from] std::io::Error),

    #[error("engine has been shut down")]
    ShutDown,
}

/// Engine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    Initialized = 1,
    Running = 2,
    Stopped = 3,
    ShutDown = 4,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Uninitialized,
            1 => LifecycleState::Initialized,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopped,
            _ => LifecycleState::ShutDown,
        }
    }

    /// Whether enter/exit calls are recorded in this state
    pub fn is_collecting(self) -> bool {
        matches!(
            self,
            LifecycleState::Initialized | LifecycleState::Running | LifecycleState::Stopped
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
            LifecycleState::ShutDown => "shut down",
        };
        f.write_str(name)
    }
}

/// Outcome of one housekeeping pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// Thread profiles destroyed because their thread terminated
    pub reaped: usize,
    /// Statistics in the global ranking
    pub global_ranked: usize,
    /// Live thread profiles re-ranked
    pub threads_ranked: usize,
    /// Steps that panicked and were skipped
    pub failures: usize,
}

/// Background thread raising the dirty flag on a fixed interval
struct HousekeepingDriver {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl HousekeepingDriver {
    fn spawn(interval: Duration, dirty: Arc<AtomicBool>) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("callrank-housekeeping".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => dirty.store(true, Ordering::Release),
                    // Stop requested or engine dropped
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self { stop_tx, handle })
    }

    fn halt(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("housekeeping driver panicked");
        }
    }
}

/// Root context of the instrumentation engine
pub struct Engine {
    id: u64,
    state: AtomicU8,
    publisher: Arc<dyn Publisher>,
    enabled_by_default: AtomicBool,
    thread_top_k: AtomicUsize,
    interval_ms: AtomicU64,
    global: StatisticRegistry,
    global_binder: Mutex<RankBinder>,
    threads: DashMap<ThreadId, Arc<ThreadProfile>, FnvBuildHasher>,
    enabled_overrides: DashMap<Arc<str>, bool, FnvBuildHasher>,
    dirty: Arc<AtomicBool>,
    driver: Mutex<Option<HousekeepingDriver>>,
    pass_lock: Mutex<()>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("operations", &self.global.len())
            .field("threads", &self.threads.len())
            .finish()
    }
}

impl Engine {
    /// Build an engine in the `Uninitialized` state
    pub fn new(config: EngineConfig, publisher: Arc<dyn Publisher>) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|err| EngineError::InvalidConfig(format!("{:#}", err)))?;
        Ok(Self::build(&config, publisher))
    }

    /// Engine with default configuration that publishes nowhere
    pub fn with_defaults() -> Self {
        Self::build(&EngineConfig::default(), Arc::new(NoopPublisher))
    }

    fn build(config: &EngineConfig, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(LifecycleState::Uninitialized as u8),
            global_binder: Mutex::new(RankBinder::new(
                Scope::Global,
                config.global_top_k,
                Arc::clone(&publisher),
            )),
            publisher,
            enabled_by_default: AtomicBool::new(config.enabled_by_default),
            thread_top_k: AtomicUsize::new(config.thread_top_k),
            interval_ms: AtomicU64::new(config.housekeeping_interval_ms),
            global: StatisticRegistry::new(),
            threads: DashMap::default(),
            enabled_overrides: DashMap::default(),
            dirty: Arc::new(AtomicBool::new(false)),
            driver: Mutex::new(None),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move from `Uninitialized` to `Initialized`; only the first call does
    /// anything
    pub fn initialize(&self) -> bool {
        if !self.transition(LifecycleState::Uninitialized, LifecycleState::Initialized) {
            return false;
        }
        info!(engine = self.id, "engine initialized");
        true
    }

    /// Start the housekeeping tick
    ///
    /// No-op (returns `Ok(false)`) unless the engine is `Initialized` or
    /// `Stopped`.
    pub fn start(&self) -> Result<bool, EngineError> {
        let mut driver = self.driver.lock();
        let state = self.state();
        if !matches!(state, LifecycleState::Initialized | LifecycleState::Stopped) {
            debug!(engine = self.id, state = %state, "start ignored");
            return Ok(false);
        }

        let interval = self.housekeeping_interval();
        *driver = Some(HousekeepingDriver::spawn(interval, Arc::clone(&self.dirty))?);
        self.state
            .store(LifecycleState::Running as u8, Ordering::Release);
        info!(engine = self.id, interval_ms = interval.as_millis() as u64, "engine started");
        Ok(true)
    }

    /// Halt the tick and release every publish slot; statistics are kept
    pub fn stop(&self) -> bool {
        let mut driver = self.driver.lock();
        if !self.transition(LifecycleState::Running, LifecycleState::Stopped) {
            return false;
        }
        if let Some(running) = driver.take() {
            running.halt();
        }
        drop(driver);

        // Wait out an in-flight pass so it cannot rebind after the release
        let _pass = self.pass_lock.lock();
        self.global_binder.lock().release_all();
        for profile in self.thread_profiles() {
            profile.release_slots();
        }
        self.dirty.store(false, Ordering::Release);
        info!(engine = self.id, "engine stopped");
        true
    }

    /// Stop, then destroy all thread profiles and clear every registry
    pub fn shut_down(&self) {
        // Held across the swap so a concurrent start cannot revive the driver
        let mut driver = self.driver.lock();
        let previous = self
            .state
            .swap(LifecycleState::ShutDown as u8, Ordering::AcqRel);
        if previous == LifecycleState::ShutDown as u8 {
            return;
        }
        if let Some(running) = driver.take() {
            running.halt();
        }
        drop(driver);

        let _pass = self.pass_lock.lock();
        self.global_binder.lock().release_all();
        for profile in self.thread_profiles() {
            profile.destroy();
        }
        self.threads.clear();
        self.global.clear();
        self.enabled_overrides.clear();
        self.dirty.store(false, Ordering::Release);
        info!(engine = self.id, "engine shut down");
    }

    /// Record entry into `name` on the calling thread
    ///
    /// Returns true if the call is being timed.
    pub fn enter(&self, name: &str, force_active: bool) -> bool {
        if !self.state().is_collecting() {
            return false;
        }

        self.global
            .get_or_insert(name, || self.default_enabled_for(name));
        thread_profile::with_context(
            self.id,
            || self.attach_current_thread(),
            |context| context.enter(name, force_active, || self.default_enabled_for(name)),
        )
        .unwrap_or(false)
    }

    /// Record exit from `name` on the calling thread
    ///
    /// The returned duration has been recorded into both the calling
    /// thread's and the global statistic for `name`. `None` means the call
    /// was not timed or had no matching enter.
    pub fn exit(&self, name: &str, force_active: bool) -> Option<Duration> {
        if !self.state().is_collecting() {
            return None;
        }

        let elapsed = match thread_profile::with_existing_context(self.id, |context| {
            context.exit(name, force_active)
        }) {
            Some(elapsed) => elapsed,
            None => {
                warn!(operation = %name, "exit without matching enter");
                None
            }
        };

        if let Some(elapsed) = elapsed {
            if let Some(global) = self.global.get(name) {
                global.record(elapsed);
            }
        }

        self.run_pending_housekeeping();
        elapsed
    }

    /// Run `f` between `enter` and `exit` of `name`
    ///
    /// A panic inside `f` skips the exit; the next exit of an enclosing
    /// operation unwinds past it.
    pub fn instrument<F, R>(&self, name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.enter(name, false);
        let result = f();
        self.exit(name, false);
        result
    }

    fn attach_current_thread(&self) -> Option<Arc<ThreadProfile>> {
        if !self.state().is_collecting() {
            return None;
        }

        let id = thread::current().id();
        let top_k = self.thread_top_k.load(Ordering::Relaxed);
        let profile = match self.threads.entry(id) {
            Entry::Occupied(entry) if !entry.get().is_destroyed() => Arc::clone(entry.get()),
            Entry::Occupied(mut entry) => {
                let fresh = Arc::new(ThreadProfile::new(top_k, Arc::clone(&self.publisher)));
                entry.insert(Arc::clone(&fresh));
                fresh
            }
            Entry::Vacant(entry) => {
                let fresh = Arc::new(ThreadProfile::new(top_k, Arc::clone(&self.publisher)));
                Arc::clone(entry.insert(fresh).value())
            }
        };
        debug!(engine = self.id, scope = %profile.scope(), "thread attached");
        Some(profile)
    }

    fn default_enabled_for(&self, name: &str) -> bool {
        match self.enabled_overrides.get(name) {
            Some(enabled) => *enabled.value(),
            None => self.enabled_by_default.load(Ordering::Relaxed),
        }
    }

    /// Enable or disable timing of `name` everywhere, including statistics
    /// created later
    pub fn set_enabled(&self, name: &str, enabled: bool) {
        self.enabled_overrides.insert(Arc::from(name), enabled);
        self.global.set_enabled(name, enabled);
        for profile in self.thread_profiles() {
            profile.set_enabled(name, enabled);
        }
        debug!(operation = %name, enabled, "operation toggled");
    }

    /// Forget every statistic for `name` after its instrumentation is removed
    pub fn withdraw(&self, name: &str) {
        self.enabled_overrides.remove(name);
        self.global.remove(name);
        for profile in self.thread_profiles() {
            profile.withdraw(name);
        }
        debug!(operation = %name, "operation withdrawn");
    }

    /// Apply new settings; slots below the new bounds keep their statistics
    pub fn apply_config(&self, config: &EngineConfig) -> Result<(), EngineError> {
        if self.state() == LifecycleState::ShutDown {
            return Err(EngineError::ShutDown);
        }
        config
            .validate()
            .map_err(|err| EngineError::InvalidConfig(format!("{:#}", err)))?;

        self.enabled_by_default
            .store(config.enabled_by_default, Ordering::Relaxed);
        self.thread_top_k
            .store(config.thread_top_k, Ordering::Relaxed);
        self.global_binder.lock().resize(config.global_top_k);
        for profile in self.thread_profiles() {
            profile.resize(config.thread_top_k);
        }

        let previous = self
            .interval_ms
            .swap(config.housekeeping_interval_ms, Ordering::Relaxed);
        if previous != config.housekeeping_interval_ms {
            let mut driver = self.driver.lock();
            if let Some(running) = driver.take() {
                running.halt();
                *driver = Some(HousekeepingDriver::spawn(
                    config.housekeeping_interval(),
                    Arc::clone(&self.dirty),
                )?);
            }
        }
        Ok(())
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    /// Mark a housekeeping pass as due, as the driver does on every tick
    pub fn request_housekeeping(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_housekeeping_due(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Consume the dirty flag and run a pass if one is due
    pub fn run_pending_housekeeping(&self) -> Option<HousekeepingReport> {
        if !self.dirty.load(Ordering::Relaxed) {
            return None;
        }
        if self
            .dirty
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        self.housekeep()
    }

    /// Run one housekeeping pass now
    ///
    /// Returns `None` when another pass is in progress or the engine is not
    /// `Initialized`/`Running`.
    pub fn housekeep(&self) -> Option<HousekeepingReport> {
        if !matches!(
            self.state(),
            LifecycleState::Initialized | LifecycleState::Running
        ) {
            return None;
        }
        let _pass = self.pass_lock.try_lock()?;
        let mut report = HousekeepingReport::default();

        for profile in self.thread_profiles() {
            if profile.is_alive() {
                continue;
            }
            let reaped = guarded("reap thread profile", || {
                profile.destroy();
                self.threads
                    .remove_if(&profile.id(), |_, current| Arc::ptr_eq(current, &profile));
            });
            if reaped {
                report.reaped += 1;
            } else {
                report.failures += 1;
            }
        }

        let ranked_global = guarded("rank global statistics", || {
            let ranked = rank(self.global.snapshot());
            self.global_binder.lock().apply_ranking(&ranked);
            report.global_ranked = ranked.len();
        });
        if !ranked_global {
            report.failures += 1;
        }

        for profile in self.thread_profiles() {
            if guarded("rank thread statistics", || profile.rank_and_publish()) {
                report.threads_ranked += 1;
            } else {
                report.failures += 1;
            }
        }

        debug!(
            engine = self.id,
            reaped = report.reaped,
            global_ranked = report.global_ranked,
            threads_ranked = report.threads_ranked,
            failures = report.failures,
            "housekeeping pass complete"
        );
        Some(report)
    }

    fn thread_profiles(&self) -> Vec<Arc<ThreadProfile>> {
        self.threads
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn global_statistic(&self, name: &str) -> Option<Arc<MethodStatistic>> {
        self.global.get(name)
    }

    pub fn global_statistics(&self) -> Vec<Arc<MethodStatistic>> {
        self.global.snapshot()
    }

    /// Fresh ranking of every live thread profile
    pub fn thread_rankings(&self) -> Vec<(Scope, Vec<RankedStatistic>)> {
        self.thread_profiles()
            .into_iter()
            .map(|profile| (profile.scope().clone(), profile.ranking()))
            .collect()
    }

    pub fn thread_profile(&self, id: ThreadId) -> Option<Arc<ThreadProfile>> {
        self.threads.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of thread profiles not yet reaped
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Names currently bound to global publish slots, in rank order
    pub fn global_published(&self) -> Vec<Arc<str>> {
        self.global_binder.lock().bound_names()
    }

    /// Open calls on the calling thread's stack
    pub fn call_depth(&self) -> usize {
        thread_profile::with_existing_context(self.id, |context| context.depth()).unwrap_or(0)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shut_down();
    }
}

/// Run one housekeeping step, containing any panic
fn guarded<F: FnOnce()>(step: &str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            error!(step, panic = %panic_message(payload.as_ref()), "housekeeping step failed");
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::InMemoryPublisher;

    fn engine_with(config: EngineConfig) -> (Engine, Arc<InMemoryPublisher>) {
        let publisher = Arc::new(InMemoryPublisher::new());
        let engine = Engine::new(config, publisher.clone()).unwrap();
        engine.initialize();
        (engine, publisher)
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let engine = Engine::with_defaults();
        assert_eq!(engine.state(), LifecycleState::Uninitialized);
        assert!(engine.initialize());
        assert!(!engine.initialize());
        assert_eq!(engine.state(), LifecycleState::Initialized);
    }

    #[test]
    fn test_calls_ignored_before_initialize() {
        let engine = Engine::with_defaults();
        assert!(!engine.enter("a", false));
        assert_eq!(engine.exit("a", false), None);
        assert!(engine.global_statistic("a").is_none());
    }

    #[test]
    fn test_start_requires_initialize() {
        let engine = Engine::with_defaults();
        assert!(!engine.start().unwrap());
        assert_eq!(engine.state(), LifecycleState::Uninitialized);

        engine.initialize();
        assert!(engine.start().unwrap());
        assert_eq!(engine.state(), LifecycleState::Running);
        assert!(!engine.start().unwrap());

        assert!(engine.stop());
        assert!(!engine.stop());
        assert_eq!(engine.state(), LifecycleState::Stopped);

        // A stopped engine can be restarted
        assert!(engine.start().unwrap());
        engine.shut_down();
        assert_eq!(engine.state(), LifecycleState::ShutDown);
        assert!(!engine.start().unwrap());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            housekeeping_interval_ms: 0,
            ..EngineConfig::default()
        };
        let result = Engine::new(config, Arc::new(NoopPublisher));
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_enter_exit_feeds_global_and_thread() {
        let (engine, _) = engine_with(EngineConfig::default());
        assert!(engine.enter("svc.a", false));
        let elapsed = engine.exit("svc.a", false).unwrap();

        let global = engine.global_statistic("svc.a").unwrap();
        assert_eq!(global.count(), 1);
        assert_eq!(global.load(), elapsed);

        let profile = engine.thread_profile(thread::current().id()).unwrap();
        assert_eq!(profile.statistic("svc.a").unwrap().load(), elapsed);
    }

    #[test]
    fn test_disabled_by_default() {
        let (engine, _) = engine_with(EngineConfig::default().with_enabled_by_default(false));
        assert!(!engine.enter("a", false));
        assert_eq!(engine.exit("a", false), None);
        assert!(engine.enter("a", true));
        assert!(engine.exit("a", true).is_some());
        assert_eq!(engine.global_statistic("a").unwrap().count(), 1);
    }

    #[test]
    fn test_set_enabled_propagates() {
        let (engine, _) = engine_with(EngineConfig::default());
        engine.instrument("a", || ());
        engine.set_enabled("a", false);

        assert!(!engine.global_statistic("a").unwrap().is_enabled());
        let profile = engine.thread_profile(thread::current().id()).unwrap();
        assert!(!profile.statistic("a").unwrap().is_enabled());

        // Remembered for statistics created afterwards
        engine.set_enabled("b", false);
        assert!(!engine.enter("b", false));
        assert!(!engine.global_statistic("b").unwrap().is_enabled());
    }

    #[test]
    fn test_withdraw_removes_everywhere() {
        let (engine, _) = engine_with(EngineConfig::default());
        engine.instrument("a", || ());
        engine.withdraw("a");

        assert!(engine.global_statistic("a").is_none());
        let profile = engine.thread_profile(thread::current().id()).unwrap();
        assert!(profile.statistic("a").is_none());
    }

    #[test]
    fn test_dirty_flag_triggers_pass_on_exit() {
        let (engine, publisher) = engine_with(EngineConfig::default());
        engine.instrument("a", || ());
        assert!(publisher.is_empty());

        engine.request_housekeeping();
        assert!(engine.is_housekeeping_due());
        engine.instrument("a", || ());

        assert!(!engine.is_housekeeping_due());
        assert_eq!(engine.global_published()[0].as_ref(), "a");
        assert_eq!(publisher.scope_len(&Scope::Global), 1);
    }

    #[test]
    fn test_housekeep_report() {
        let (engine, _) = engine_with(EngineConfig::default());
        engine.instrument("a", || ());
        engine.instrument("b", || ());

        let report = engine.housekeep().unwrap();
        assert_eq!(report.global_ranked, 2);
        assert_eq!(report.threads_ranked, 1);
        assert_eq!(report.reaped, 0);
        assert_eq!(report.failures, 0);
    }

    #[test]
    fn test_stop_releases_slots_keeps_statistics() {
        let (engine, publisher) = engine_with(EngineConfig::default());
        engine.start().unwrap();
        engine.instrument("a", || ());
        engine.housekeep().unwrap();
        assert_eq!(publisher.len(), 2);

        engine.stop();
        assert!(publisher.is_empty());
        assert_eq!(engine.global_statistic("a").unwrap().count(), 1);
        // No passes while stopped
        assert!(engine.housekeep().is_none());
    }

    #[test]
    fn test_shut_down_clears_registries() {
        let (engine, publisher) = engine_with(EngineConfig::default());
        engine.instrument("a", || ());
        engine.housekeep().unwrap();

        engine.shut_down();
        engine.shut_down();
        assert!(publisher.is_empty());
        assert!(engine.global_statistics().is_empty());
        assert_eq!(engine.thread_count(), 0);
        assert!(!engine.enter("a", false));
        assert!(matches!(
            engine.apply_config(&EngineConfig::default()),
            Err(EngineError::ShutDown)
        ));
    }

    #[test]
    fn test_apply_config_resizes() {
        let (engine, publisher) = engine_with(EngineConfig::default().with_top_k(3, 3));
        for name in ["a", "b", "c"] {
            engine.instrument(name, || ());
        }
        engine.housekeep().unwrap();
        assert_eq!(publisher.scope_len(&Scope::Global), 3);

        let before = engine.global_published();
        engine
            .apply_config(&EngineConfig::default().with_top_k(1, 1))
            .unwrap();
        assert_eq!(publisher.scope_len(&Scope::Global), 1);
        assert_eq!(engine.global_published(), before[..1].to_vec());
    }

    #[test]
    fn test_guarded_contains_panics() {
        assert!(guarded("ok", || ()));
        assert!(!guarded("boom", || panic!("boom")));
        assert_eq!(panic_message(&"static"), "static");
    }

    #[test]
    fn test_forced_enter_closed_by_plain_exit() {
        let (engine, _) = engine_with(EngineConfig::default().with_enabled_by_default(false));
        assert!(engine.enter("a", true));
        assert_eq!(engine.call_depth(), 1);

        assert!(engine.exit("a", false).is_some());
        assert_eq!(engine.call_depth(), 0);
        assert_eq!(engine.global_statistic("a").unwrap().count(), 1);
    }

    #[test]
    fn test_disable_between_enter_and_exit() {
        let (engine, _) = engine_with(EngineConfig::default());
        assert!(engine.enter("outer", false));
        assert!(engine.enter("a", false));
        engine.set_enabled("a", false);
        engine.set_enabled("outer", false);

        assert!(engine.exit("a", false).is_some());
        assert!(engine.exit("outer", false).is_some());
        assert_eq!(engine.call_depth(), 0);
        assert_eq!(engine.global_statistic("a").unwrap().count(), 1);
        assert_eq!(engine.global_statistic("outer").unwrap().count(), 1);
    }

    #[test]
    fn test_exit_from_unattached_thread() {
        let (engine, _) = engine_with(EngineConfig::default());
        engine.instrument("a", || ());

        thread::scope(|scope| {
            scope.spawn(|| {
                assert_eq!(engine.exit("a", false), None);
                assert_eq!(engine.call_depth(), 0);
            });
        });
        assert_eq!(engine.thread_count(), 1);
        assert_eq!(engine.global_statistic("a").unwrap().count(), 1);
    }

    #[test]
    fn test_shut_down_from_running_halts_driver() {
        let (engine, publisher) = engine_with(EngineConfig::default());
        engine.start().unwrap();
        engine.instrument("a", || ());
        engine.housekeep().unwrap();

        engine.shut_down();
        assert_eq!(engine.state(), LifecycleState::ShutDown);
        assert!(engine.driver.lock().is_none());
        assert!(!engine.is_housekeeping_due());
        assert!(publisher.is_empty());
        assert!(!engine.start().unwrap());
        assert!(engine.driver.lock().is_none());
    }
}
