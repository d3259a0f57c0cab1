//! Callrank - concurrent method-call timing and load ranking
//!
//! Instrumented code brackets each operation with [`Engine::enter`] and
//! [`Engine::exit`]. The engine times every call per thread and globally,
//! keeps a decaying sample of elapsed times plus call rates, and periodically
//! ranks operations by load (total time spent) into a bounded set of publish
//! slots that a [`Publisher`] exposes to the outside world.
//!
//! ```
//! use callrank::{Engine, EngineConfig, InMemoryPublisher};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), callrank::EngineError> {
//! let publisher = Arc::new(InMemoryPublisher::new());
//! let engine = Engine::new(EngineConfig::default(), publisher.clone())?;
//! engine.initialize();
//!
//! engine.instrument("svc.handle", || std::thread::yield_now());
//! engine.housekeep();
//!
//! assert_eq!(engine.global_published()[0].as_ref(), "svc.handle");
//! # Ok(())
//! # }
//! ```

pub mod binder;
pub mod call_stack;
pub mod config;
pub mod engine;
pub mod logging;
pub mod meter;
pub mod publisher;
pub mod ranking;
pub mod reservoir;
pub mod statistic;
pub mod thread_profile;
pub mod timer;

pub use binder::{PublishedStatistic, RankBinder};
pub use config::EngineConfig;
pub use engine::{Engine, EngineError, HousekeepingReport, LifecycleState};
pub use publisher::{
    InMemoryPublisher, NoopPublisher, PublishError, PublishEvent, Publisher, Scope,
};
pub use ranking::RankedStatistic;
pub use statistic::MethodStatistic;
