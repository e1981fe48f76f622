//! Circuit-broken background loops, keyed by string.
//!
//! The breaker core in [`breaker`] is pure; [`pool`] wraps it with tokio
//! tasks, interval ticks and a capacity-1 force-trigger channel per key.

mod breaker;
mod pool;

pub use breaker::{Breaker, BreakerState};
pub use pool::{LoopSpec, RoutinePool, RoutineSnapshot};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoutineError {
    /// The breaker refused the call. Observable but non-fatal: the loop
    /// keeps scheduling and the breaker decides when to probe again.
    #[error("circuit open")]
    CircuitOpen,
    /// The wrapped operation ran and failed; counted against the breaker.
    #[error("routine operation failed: {0}")]
    OperationFailed(#[source] anyhow::Error),
}
