//! Pool configuration and validation.

use std::num::NonZeroUsize;
use thiserror::Error;

/// Policy for assigning a new socket to one reactor in the pool.
///
/// A socket stays on its assigned reactor for its entire lifetime; there is
/// no atomic cross-context kernel operation that would make migration safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentPolicy {
    /// Cycle through reactors in registration order.
    #[default]
    RoundRobin,
    /// Hash the descriptor, so a given fd value always lands on the same
    /// reactor. Useful for reproducing load distributions in tests.
    FdHash,
}

/// Configuration for a [`MuxPool`](crate::pool::MuxPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of reactor instances (and wait-loop threads).
    pub reactors: usize,
    /// Maximum readiness notifications collected per wait call.
    pub events_capacity: usize,
    /// Socket-to-reactor assignment policy.
    pub assignment: AssignmentPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let reactors = std::thread::available_parallelism()
            .map_or(2, NonZeroUsize::get)
            .min(8);
        Self {
            reactors,
            events_capacity: 256,
            assignment: AssignmentPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Validates the configuration for basic sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reactors == 0 {
            return Err(ConfigError::NoReactors);
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::ZeroEventsCapacity);
        }
        Ok(())
    }
}

/// Configuration validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The pool needs at least one reactor.
    #[error("pool must have at least one reactor")]
    NoReactors,
    /// A wait call must be able to return at least one event.
    #[error("events capacity must be at least 1")]
    ZeroEventsCapacity,
}
