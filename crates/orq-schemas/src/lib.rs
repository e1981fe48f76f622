//! Shared domain and wire types.
//!
//! Everything here is plain serde data: no IO, no clocks, no SQL. The store
//! crates (`orq-db`, `orq-queue`, `orq-events`) own persistence; the daemon
//! re-uses these shapes directly as its JSON contracts. Timestamps serialize
//! as RFC 3339 (chrono's serde default), field casing is `snake_case`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Kind of inference backend behind a [`Backend`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    Ollama,
    Openai,
    Gemini,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Ollama => "ollama",
            BackendType::Openai => "openai",
            BackendType::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ollama" => Some(BackendType::Ollama),
            "openai" => Some(BackendType::Openai),
            "gemini" => Some(BackendType::Gemini),
            _ => None,
        }
    }
}

/// An addressable inference endpoint. Created on admin write; its observed
/// attributes (model lists, dial errors) live in the runtime view, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: Uuid,
    pub name: String,
    pub base_url: String,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Models & pools
// ---------------------------------------------------------------------------

/// A logical model name (e.g. `"nomic-embed-text:latest"`).
///
/// `immutable` marks models that admin deletes must refuse (the configured
/// embed model); everything else is operator-managed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: Uuid,
    pub name: String,
    pub immutable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An affinity group: a labelled compatibility class of backends and models.
/// When any pools exist, the router only pairs a model with a backend that
/// shares at least one pool with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: Uuid,
    pub name: String,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// One row of the durable job queue.
///
/// `leaser == None` means pending; a set leaser plus `lease_expiry` means the
/// job is in progress under a time-bounded lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_type: String,
    pub payload: Value,
    pub scheduled_for: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub retry_count: i32,
    pub leaser: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A domain event in the partitioned append-only store.
///
/// `partition_key` is always `YYYYMMDD` of `created_at` (UTC); `nid` is
/// monotonic within a partition. Events are immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub nid: i64,
    pub created_at: DateTime<Utc>,
    pub event_type: String,
    pub event_source: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: i32,
    pub data: Option<Value>,
    pub metadata: Option<Value>,
    pub partition_key: String,
}

/// An inbound HTTP-like envelope captured before mapping to domain events.
/// Headers are stored as a JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: Uuid,
    pub nid: i64,
    pub received_at: DateTime<Utc>,
    pub path: String,
    pub headers: Value,
    pub payload: Option<Value>,
    pub partition_key: String,
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// External provider families that can be configured with an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Openai,
    Gemini,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Openai => "openai",
            ProviderType::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ProviderType::Openai),
            "gemini" => Some(ProviderType::Gemini),
            _ => None,
        }
    }
}

/// Stored provider configuration. The API key is secret material: every
/// surface that renders one of these must mask `api_key` first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_type: ProviderType,
    pub api_key: String,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// The capability a caller requests from the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Prompt,
    Embed,
    Stream,
}

/// What a concrete provider can do, plus its context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_chat: bool,
    pub can_prompt: bool,
    pub can_embed: bool,
    pub can_stream: bool,
    pub context_length: i32,
}

impl Capabilities {
    pub fn supports(&self, cap: Capability) -> bool {
        match cap {
            Capability::Chat => self.can_chat,
            Capability::Prompt => self.can_prompt,
            Capability::Embed => self.can_embed,
            Capability::Stream => self.can_stream,
        }
    }
}

// ---------------------------------------------------------------------------
// Task chains
// ---------------------------------------------------------------------------

/// Terminal transition target: the chain ends successfully.
pub const TERM_END: &str = "end";
/// Terminal transition target: the chain ends as failed (handled error path).
pub const TERM_ERROR_END: &str = "error-end";
/// Transition label matched when a task fails.
pub const ON_ERROR: &str = "error";

/// What a single task does when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Invoke a named hook from the registry.
    Hook,
    /// Resolve a model and run the rendered prompt through it.
    Model,
    /// Pass-through; useful as a join point.
    Noop,
    /// Unconditionally fail; exercises error transitions.
    RaiseError,
}

/// Labelled edge out of a task. `next` is another task id or one of the
/// terminals [`TERM_END`] / [`TERM_ERROR_END`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub on: String,
    pub next: String,
}

/// One task inside a chain definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub id: String,
    pub kind: TaskKind,
    /// Name of the context slot this task reads as its input.
    #[serde(default)]
    pub input: Option<String>,
    /// Hook name, required when `kind == Hook`.
    #[serde(default)]
    pub hook: Option<String>,
    /// Prompt template, required when `kind == Model`. `{{input}}` is
    /// substituted with the input slot rendered as text.
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// Requested capability for `Model` tasks (defaults to prompt).
    #[serde(default)]
    pub capability: Option<Capability>,
    /// Candidate model names for `Model` tasks; empty means any.
    #[serde(default)]
    pub model_names: Vec<String>,
    pub transitions: Vec<Transition>,
}

/// A named DAG of tasks executed by the task engine. Execution starts at
/// `tasks[0]` and follows transition labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<TaskDef>,
}
