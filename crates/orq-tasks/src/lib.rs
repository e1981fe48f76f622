//! Chain-of-tasks executor with pluggable hooks.

mod alerts;
mod context;
mod engine;
mod hooks;
mod validate;

pub use alerts::{Alert, AlertSink};
pub use context::ChainContext;
pub use engine::{
    ChainOutcome, ChainStatus, ModelRunner, ResolveModel, TaskEngine, MAX_STEPS,
};
pub use hooks::{
    Hook, HookRegistry, MessageStore, NoopMessageStore, NoopSearcher, VectorSearcher, LABEL_OK,
};
pub use validate::validate_chain;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid chain: {0}")]
    Validation(String),
    #[error("unknown hook: {0}")]
    UnknownHook(String),
    #[error("task {task_id} produced label {label} with no matching transition")]
    NoTransition { task_id: String, label: String },
    #[error("chain aborted at task {task_id}")]
    Aborted {
        task_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("chain {chain_id} exceeded its step budget ({steps})")]
    StepBudgetExceeded { chain_id: String, steps: u32 },
}
