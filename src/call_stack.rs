//! Per-thread stack of in-flight calls
//!
//! A [`CallStack`] is owned by exactly one thread. The type is neither `Send`
//! nor `Sync`, so the compiler enforces that only the owning thread pushes and
//! pops, and no synchronization is needed on the hot path.
//!
//! # Exit-unwind rule
//!
//! An exception (panic, early return through instrumented frames) can skip
//! several exits at once. [`CallStack::unwind`] therefore pops until it finds
//! the record for the exiting operation, stopping every record it passes so
//! each open call is closed exactly once. If the stack runs dry without a
//! match the exit was orphaned and no duration is reported.

use crate::statistic::MethodStatistic;
use crate::timer::TimingHandle;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Initial capacity of a fresh stack
pub const DEFAULT_CAPACITY: usize = 16;

/// One open call: the statistic it reports to and its running timer
#[derive(Debug)]
pub struct CallRecord {
    statistic: Arc<MethodStatistic>,
    handle: TimingHandle,
}

impl CallRecord {
    /// Start timing a call to `statistic`
    pub fn open(statistic: Arc<MethodStatistic>) -> Self {
        Self {
            handle: statistic.timer().time(),
            statistic,
        }
    }

    pub fn name(&self) -> &str {
        self.statistic.name()
    }

    /// Stop the timer, recording into the record's statistic
    pub fn close(self) -> Duration {
        self.handle.stop(self.statistic.timer())
    }
}

/// Outcome of unwinding the stack for one exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwind {
    /// The matching record was found; `skipped` intermediate records were closed
    Matched { elapsed: Duration, skipped: usize },
    /// No matching record; `closed` records were closed and the stack is empty
    Exhausted { closed: usize },
}

/// Growable array-backed stack of open calls, bound to its thread
#[derive(Debug)]
pub struct CallStack {
    frames: Vec<CallRecord>,
    initial_capacity: usize,
    // *const () makes the stack !Send + !Sync
    _thread_bound: PhantomData<*const ()>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Vec::with_capacity(capacity),
            initial_capacity: capacity,
            _thread_bound: PhantomData,
        }
    }

    /// Push a record, doubling capacity when full
    pub fn push(&mut self, record: CallRecord) {
        if self.frames.len() == self.frames.capacity() {
            let grow_by = self.frames.capacity().max(1);
            self.frames.reserve_exact(grow_by);
        }
        self.frames.push(record);
    }

    /// Pop the top record
    ///
    /// # Panics
    ///
    /// Panics on an empty stack. More pops than pushes is a bug in the
    /// caller and must not be papered over.
    pub fn pop(&mut self) -> CallRecord {
        match self.frames.pop() {
            Some(record) => record,
            None => panic!("pop on empty call stack: exit issued without a matching enter"),
        }
    }

    /// Whether an open record for `name` is anywhere on the stack
    pub fn contains(&self, name: &str) -> bool {
        self.frames.iter().any(|record| record.name() == name)
    }

    /// Close records until the one for `name` is found or the stack is empty
    pub fn unwind(&mut self, name: &str) -> Unwind {
        let mut closed = 0;
        while !self.is_empty() {
            let record = self.pop();
            let matched = record.name() == name;
            let elapsed = record.close();
            if matched {
                return Unwind::Matched {
                    elapsed,
                    skipped: closed,
                };
            }
            closed += 1;
        }
        Unwind::Exhausted { closed }
    }

    /// Drop every open record without recording and return to the initial
    /// capacity
    pub fn reset(&mut self) {
        self.frames = Vec::with_capacity(self.initial_capacity);
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
