//! Boundary to the external publishing layer
//!
//! The engine never exposes statistics itself. Whenever a publish slot is
//! filled, rebound or released it calls a [`Publisher`]; what the publisher
//! does with the handle (management beans, HTTP endpoint, metrics registry) is its
//! own business. Publisher failures are logged by the caller and never change
//! engine state.

use crate::binder::PublishedStatistic;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;
use thiserror::Error;

/// Which sibling set a ranking belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Aggregated over all threads
    Global,
    /// One worker thread
    Thread { id: ThreadId, name: Arc<str> },
}

impl Scope {
    /// Scope for the calling thread
    pub fn current_thread() -> Self {
        let thread = std::thread::current();
        let name: Arc<str> = match thread.name() {
            Some(name) => Arc::from(name),
            None => Arc::from(format!("{:?}", thread.id())),
        };
        Scope::Thread {
            id: thread.id(),
            name,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Scope::Global)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Thread { name, .. } => write!(f, "thread:{}", name),
        }
    }
}

/// Errors a publisher can report back
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("publisher rejected rank {rank} in {scope}: {reason}")]
    Rejected {
        scope: String,
        rank: usize,
        reason: String,
    },

    #[error("publisher unavailable: {0}")]
    Unavailable(String),
}

/// Receiver of publish-slot lifecycle events
pub trait Publisher: Send + Sync {
    /// A slot was filled for the first time, or now tracks a different statistic
    fn on_rank_bound(
        &self,
        scope: &Scope,
        rank: usize,
        statistic: &Arc<PublishedStatistic>,
    ) -> Result<(), PublishError>;

    /// A slot was destroyed
    fn on_rank_released(&self, scope: &Scope, rank: usize) -> Result<(), PublishError>;
}

/// Publisher that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl Publisher for NoopPublisher {
    fn on_rank_bound(
        &self,
        _scope: &Scope,
        _rank: usize,
        _statistic: &Arc<PublishedStatistic>,
    ) -> Result<(), PublishError> {
        Ok(())
    }

    fn on_rank_released(&self, _scope: &Scope, _rank: usize) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Event recorded by [`InMemoryPublisher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishEvent {
    Bound {
        scope: Scope,
        rank: usize,
        operation: Arc<str>,
    },
    Released {
        scope: Scope,
        rank: usize,
    },
}

#[derive(Debug, Default)]
struct InMemoryState {
    slots: Vec<(Scope, usize, Arc<PublishedStatistic>)>,
    events: Vec<PublishEvent>,
}

/// Publisher that keeps the current slot table and an event log in memory
///
/// Useful for embedding hosts that poll rankings and for tests.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    state: Mutex<InMemoryState>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle currently published at `rank` in `scope`
    pub fn get(&self, scope: &Scope, rank: usize) -> Option<Arc<PublishedStatistic>> {
        self.state
            .lock()
            .slots
            .iter()
            .find(|(s, r, _)| s == scope && *r == rank)
            .map(|(_, _, handle)| Arc::clone(handle))
    }

    /// Number of published slots in `scope`
    pub fn scope_len(&self, scope: &Scope) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|(s, _, _)| s == scope)
            .count()
    }

    /// Total number of published slots across scopes
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every event received so far, in order
    pub fn events(&self) -> Vec<PublishEvent> {
        self.state.lock().events.clone()
    }

    /// Number of release events received for `scope`
    pub fn released_count(&self, scope: &Scope) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|event| matches!(event, PublishEvent::Released { scope: s, .. } if s == scope))
            .count()
    }
}

impl Publisher for InMemoryPublisher {
    fn on_rank_bound(
        &self,
        scope: &Scope,
        rank: usize,
        statistic: &Arc<PublishedStatistic>,
    ) -> Result<(), PublishError> {
        let mut state = self.state.lock();
        state.slots.retain(|(s, r, _)| !(s == scope && *r == rank));
        state
            .slots
            .push((scope.clone(), rank, Arc::clone(statistic)));
        state.events.push(PublishEvent::Bound {
            scope: scope.clone(),
            rank,
            operation: statistic.name(),
        });
        Ok(())
    }

    fn on_rank_released(&self, scope: &Scope, rank: usize) -> Result<(), PublishError> {
        let mut state = self.state.lock();
        let before = state.slots.len();
        state.slots.retain(|(s, r, _)| !(s == scope && *r == rank));
        if state.slots.len() == before {
            return Err(PublishError::Rejected {
                scope: scope.to_string(),
                rank,
                reason: "slot was never bound".to_string(),
            });
        }
        state.events.push(PublishEvent::Released {
            scope: scope.clone(),
            rank,
        });
        Ok(())
    }
}
