//! Request/response DTOs for the HTTP surface. Domain shapes come straight
//! from `orq-schemas`; this module only holds the envelopes that differ
//! from the stored form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use orq_schemas::{Backend, BackendType, Job, Model, Pool};

// ---------------------------------------------------------------------------
// Health & status
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct RoutineStatus {
    pub key: String,
    pub state: String,
    pub failure_count: u32,
    pub threshold: u32,
    pub loop_active: bool,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub config_hash: String,
    pub routines: Vec<RoutineStatus>,
}

// ---------------------------------------------------------------------------
// Jobs & leases
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub task_type: String,
    pub payload: Value,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct AssignLeaseRequest {
    pub leaser_id: String,
    pub lease_duration_secs: i64,
    pub job_types: Vec<String>,
}

#[derive(Deserialize)]
pub struct LeaserBody {
    pub leaser_id: String,
}

#[derive(Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    /// Pass as `cursor` to fetch the next page.
    pub next_cursor: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct CursorQuery {
    #[serde(default)]
    pub cursor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Admin CRUD
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct BackendBody {
    pub name: String,
    pub base_url: String,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
}

#[derive(Serialize)]
pub struct BackendListResponse {
    pub backends: Vec<Backend>,
}

#[derive(Deserialize)]
pub struct ModelBody {
    pub name: String,
}

#[derive(Serialize)]
pub struct ModelListResponse {
    pub models: Vec<Model>,
}

#[derive(Deserialize)]
pub struct PoolBody {
    pub name: String,
    #[serde(default)]
    pub purpose: String,
}

#[derive(Serialize)]
pub struct PoolListResponse {
    pub pools: Vec<Pool>,
}

#[derive(Serialize)]
pub struct PoolDetailResponse {
    pub pool: Pool,
    pub backends: Vec<Backend>,
    pub models: Vec<Model>,
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ConfigureProviderRequest {
    pub api_key: String,
    #[serde(default)]
    pub upsert: bool,
}

#[derive(Serialize)]
pub struct ProviderStatusResponse {
    pub provider_type: String,
    pub configured: bool,
    /// Always masked.
    pub api_key: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ExecuteRequest {
    /// Either a stored chain id…
    #[serde(default)]
    pub chain_id: Option<String>,
    /// …or an inline definition.
    #[serde(default)]
    pub chain: Option<orq_schemas::ChainDefinition>,
    #[serde(default)]
    pub input: Value,
}

#[derive(Serialize)]
pub struct ExecuteResponse {
    pub chain_id: String,
    pub request_id: Uuid,
    pub status: String,
    pub steps: u32,
    pub output: Value,
}

#[derive(Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct EventsQuery {
    pub event_type: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default)]
    pub limit: Option<i64>,
}
