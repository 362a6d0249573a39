//! Worker selection policies.
//!
//! A strategy maps `(current, max)` to the next worker index, where `max` is
//! the last valid zero-based index of the live pool. The dispatcher only ever
//! calls it with `max >= 0`; an empty pool is rejected before selection.

use std::fmt;
use std::sync::Arc;

use rand::Rng;

type StrategyFn = dyn Fn(usize, usize) -> usize + Send + Sync;

/// Pluggable worker selection policy.
#[derive(Clone)]
pub struct CyclingStrategy {
    name: &'static str,
    next: Arc<StrategyFn>,
}

impl CyclingStrategy {
    /// Wrap a custom policy.
    pub fn new<F>(name: &'static str, next: F) -> Self
    where
        F: Fn(usize, usize) -> usize + Send + Sync + 'static,
    {
        Self {
            name,
            next: Arc::new(next),
        }
    }

    pub fn round_robin() -> Self {
        Self::new("round_robin", round_robin)
    }

    /// Uniformly random selection. Not deterministic.
    pub fn random() -> Self {
        Self::new("random", random)
    }

    /// Always select the first worker.
    pub fn first() -> Self {
        Self::new("first", |_, _| 0)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Compute the next index.
    pub fn next(&self, current: usize, max: usize) -> usize {
        (self.next)(current, max)
    }
}

impl Default for CyclingStrategy {
    fn default() -> Self {
        Self::round_robin()
    }
}

impl fmt::Debug for CyclingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CyclingStrategy").field(&self.name).finish()
    }
}

/// `current + 1`, wrapping to `0` past `max`.
pub fn round_robin(current: usize, max: usize) -> usize {
    if current < max {
        current + 1
    } else {
        0
    }
}

pub fn random(_current: usize, max: usize) -> usize {
    rand::thread_rng().gen_range(0..=max)
}
