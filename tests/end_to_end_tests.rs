//! End-to-end scenarios: instrumented calls through to published rankings
//!
//! # Test Coverage
//!
//! - Elapsed time, call count, mean and load of a timed operation
//! - Global ranking and shares after a pass
//! - Exit-unwind through frames that never saw their exit
//! - Orphaned exits
//! - Top-K bound and resize through configuration
//! - Enable/disable arriving while a call is open, with mixed forcing

use callrank::{Engine, EngineConfig, InMemoryPublisher, Scope};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn engine_with(config: EngineConfig) -> (Engine, Arc<InMemoryPublisher>) {
    let publisher = Arc::new(InMemoryPublisher::new());
    let engine = Engine::new(config, publisher.clone()).unwrap();
    engine.initialize();
    (engine, publisher)
}

fn timed(engine: &Engine, name: &str, ms: u64) {
    engine.instrument(name, || thread::sleep(Duration::from_millis(ms)));
}

#[test]
fn test_single_operation_statistics() {
    let (engine, publisher) = engine_with(EngineConfig::default());
    timed(&engine, "svc.a", 10);
    timed(&engine, "svc.a", 30);

    let statistic = engine.global_statistic("svc.a").unwrap();
    assert_eq!(statistic.count(), 2);
    assert!(statistic.mean_duration() >= Duration::from_millis(20));
    assert!(statistic.mean_duration() < Duration::from_millis(200));
    assert!(statistic.load() >= Duration::from_millis(40));

    let snapshot = statistic.timer().snapshot();
    assert_eq!(snapshot.size(), 2);
    assert!(snapshot.min() >= 10_000_000);
    assert!(snapshot.max() >= 30_000_000);

    engine.housekeep().unwrap();
    let slot = publisher.get(&Scope::Global, 0).unwrap();
    assert_eq!(slot.name().as_ref(), "svc.a");
    assert_eq!(slot.share(), 100);
    assert_eq!(slot.count(), 2);
}

#[test]
fn test_global_ranking_by_load() {
    let (engine, publisher) = engine_with(EngineConfig::default());
    timed(&engine, "light", 1);
    timed(&engine, "heavy", 40);
    timed(&engine, "medium", 10);
    timed(&engine, "medium", 10);

    engine.housekeep().unwrap();
    let names: Vec<String> = engine
        .global_published()
        .iter()
        .map(|name| name.to_string())
        .collect();
    assert_eq!(names, vec!["heavy", "medium", "light"]);

    let shares: u32 = (0..3)
        .map(|rank| u32::from(publisher.get(&Scope::Global, rank).unwrap().share()))
        .sum();
    assert!(shares <= 100);
    assert!(shares >= 97);
}

#[test]
fn test_ranking_reorders_slots_in_place() {
    let (engine, publisher) = engine_with(EngineConfig::default());
    timed(&engine, "a", 10);
    timed(&engine, "b", 1);
    engine.housekeep().unwrap();
    let first_slot = publisher.get(&Scope::Global, 0).unwrap();
    assert_eq!(first_slot.name().as_ref(), "a");

    timed(&engine, "b", 20);
    engine.housekeep().unwrap();

    // The slot handle is stable; only the statistic behind it changed
    assert_eq!(first_slot.name().as_ref(), "b");
    assert!(Arc::ptr_eq(
        &first_slot,
        &publisher.get(&Scope::Global, 0).unwrap()
    ));
}

#[test]
fn test_exit_unwinds_unexited_frames() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.enter("a", false);
    engine.enter("b", false);
    engine.enter("c", false);

    let elapsed = engine.exit("a", false).unwrap();
    let global_a = engine.global_statistic("a").unwrap();
    assert_eq!(global_a.count(), 1);
    assert_eq!(global_a.load(), elapsed);

    // Skipped frames close on this thread only
    assert_eq!(engine.global_statistic("b").unwrap().count(), 0);
    let profile = engine.thread_profile(thread::current().id()).unwrap();
    assert_eq!(profile.statistic("b").unwrap().count(), 1);
    assert_eq!(profile.statistic("c").unwrap().count(), 1);

    // The stack is empty again: a fresh pair works normally
    engine.enter("d", false);
    assert!(engine.exit("d", false).is_some());
}

#[test]
fn test_orphaned_exit() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.instrument("known", || ());

    assert_eq!(engine.exit("known", false), None);
    assert_eq!(engine.exit("never.entered", false), None);
    assert_eq!(engine.global_statistic("known").unwrap().count(), 1);
}

#[test]
fn test_top_k_bound_and_resize() {
    let (engine, publisher) = engine_with(EngineConfig::default().with_top_k(2, 1));
    for (name, ms) in [("a", 8), ("b", 4), ("c", 2), ("d", 1)] {
        timed(&engine, name, ms);
    }

    engine.housekeep().unwrap();
    assert_eq!(publisher.scope_len(&Scope::Global), 2);
    assert_eq!(publisher.len(), 3);

    engine
        .apply_config(&EngineConfig::default().with_top_k(4, 1))
        .unwrap();
    // Growing the bound fills nothing until the next pass
    assert_eq!(publisher.scope_len(&Scope::Global), 2);
    engine.housekeep().unwrap();
    assert_eq!(publisher.scope_len(&Scope::Global), 4);

    engine
        .apply_config(&EngineConfig::default().with_top_k(0, 0))
        .unwrap();
    assert!(publisher.is_empty());
    engine.housekeep().unwrap();
    assert!(publisher.is_empty());
}

#[test]
fn test_disabled_operation_not_timed_globally() {
    let (engine, publisher) = engine_with(EngineConfig::default());
    timed(&engine, "noisy", 2);
    engine.set_enabled("noisy", false);
    timed(&engine, "noisy", 2);

    assert_eq!(engine.global_statistic("noisy").unwrap().count(), 1);

    engine.withdraw("noisy");
    engine.housekeep().unwrap();
    assert!(publisher.is_empty());
}

#[test]
fn test_disable_arrives_mid_call() {
    let (engine, publisher) = engine_with(EngineConfig::default());
    engine.enter("svc.outer", false);
    engine.enter("svc.inner", false);
    thread::sleep(Duration::from_millis(2));
    engine.set_enabled("svc.inner", false);
    engine.set_enabled("svc.outer", false);

    assert!(engine.exit("svc.inner", false).is_some());
    assert_eq!(engine.call_depth(), 1);
    assert!(engine.exit("svc.outer", false).is_some());
    assert_eq!(engine.call_depth(), 0);

    // Calls made after the signal are not timed, and exit cleanly
    assert!(!engine.enter("svc.outer", false));
    assert_eq!(engine.exit("svc.outer", false), None);
    assert_eq!(engine.call_depth(), 0);

    assert_eq!(engine.global_statistic("svc.outer").unwrap().count(), 1);
    assert_eq!(engine.global_statistic("svc.inner").unwrap().count(), 1);
    engine.housekeep().unwrap();
    assert_eq!(publisher.scope_len(&Scope::Global), 2);
}

#[test]
fn test_enable_arrives_mid_call() {
    let (engine, _) = engine_with(EngineConfig::default().with_enabled_by_default(false));
    assert!(!engine.enter("svc.a", false));
    engine.set_enabled("svc.a", true);

    // Nothing was pushed, so the exit has no frame to close
    assert_eq!(engine.exit("svc.a", false), None);
    assert_eq!(engine.call_depth(), 0);

    assert!(engine.enter("svc.a", false));
    assert!(engine.exit("svc.a", false).is_some());
    assert_eq!(engine.global_statistic("svc.a").unwrap().count(), 1);
}

#[test]
fn test_mixed_forcing_on_disabled_operations() {
    let (engine, _) = engine_with(EngineConfig::default().with_enabled_by_default(false));
    assert!(engine.enter("svc.root", true));
    assert!(!engine.enter("svc.skipped", false));
    assert!(engine.enter("svc.leaf", true));

    // Plain exits close forced frames
    assert!(engine.exit("svc.leaf", false).is_some());
    assert_eq!(engine.exit("svc.skipped", false), None);
    assert_eq!(engine.call_depth(), 1);
    assert!(engine.exit("svc.root", false).is_some());
    assert_eq!(engine.call_depth(), 0);

    assert_eq!(engine.global_statistic("svc.root").unwrap().count(), 1);
    assert_eq!(engine.global_statistic("svc.leaf").unwrap().count(), 1);
    assert_eq!(engine.global_statistic("svc.skipped").unwrap().count(), 0);
}

#[test]
fn test_orphaned_exit_on_fresh_thread() {
    let (engine, _) = engine_with(EngineConfig::default());
    timed(&engine, "svc.a", 1);

    thread::scope(|scope| {
        scope.spawn(|| {
            assert_eq!(engine.exit("svc.a", false), None);
            assert_eq!(engine.exit("svc.a", true), None);
        });
    });
    assert_eq!(engine.global_statistic("svc.a").unwrap().count(), 1);
}
