//! Axum router and all HTTP handlers for orq-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches the observability middleware. The token gate is part of the
//! router itself so the in-process scenario tests exercise it too. All
//! handlers are `pub(crate)` and thin: parse, call the service, map the
//! error through `ApiError`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, patch, post},
    Extension, Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;
use uuid::Uuid;

use orq_dispatch::{Claims, RequestCtx};
use orq_schemas::ProviderType;
use orq_state::BusMsg;
use orq_tasks::{ChainContext, ChainStatus};

use crate::api_types::*;
use crate::auth;
use crate::error::ApiError;
use crate::state::{uptime_secs, AppState};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Tracing/CORS layers are attached by `main.rs`; the token gate lives
/// here so tests cover it.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        // Jobs & leases
        .route("/v1/jobs", post(create_job))
        .route("/v1/leases", post(assign_lease))
        .route("/v1/jobs/:id/done", patch(job_done))
        .route("/v1/jobs/:id/failed", patch(job_failed))
        .route("/v1/jobs/:id/cancel", post(job_cancel))
        .route("/v1/jobs/pending", get(jobs_pending))
        .route("/v1/jobs/in-progress", get(jobs_in_progress))
        // Chains
        .route("/v1/chains", post(create_chain).get(list_chains))
        .route(
            "/v1/chains/:id",
            get(get_chain).put(update_chain).delete(delete_chain),
        )
        .route("/v1/execute", post(execute_chain))
        // Backends
        .route("/v1/backends", post(create_backend).get(list_backends))
        .route(
            "/v1/backends/:id",
            get(get_backend).put(update_backend).delete(delete_backend),
        )
        // Models
        .route("/v1/models", post(create_model).get(list_models))
        .route("/v1/models/:id", axum::routing::delete(delete_model))
        // Pools
        .route("/v1/pools", post(create_pool).get(list_pools))
        .route("/v1/pools/:id", get(get_pool).delete(delete_pool))
        .route(
            "/v1/pools/:id/backends/:backend_id",
            post(assign_pool_backend).delete(remove_pool_backend),
        )
        .route(
            "/v1/pools/:id/models/:model_id",
            post(assign_pool_model).delete(remove_pool_model),
        )
        // Providers
        .route("/v1/providers/:type/configure", post(configure_provider))
        .route("/v1/providers/:type/status", get(provider_status))
        // Runtime state & cycles
        .route("/v1/state", get(runtime_state))
        .route("/v1/cycles/trigger", post(trigger_cycles))
        // Operator surfaces
        .route("/v1/activity", get(activity_recent))
        .route("/v1/alerts", get(alerts_recent))
        .route("/v1/events", get(events_query))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_token,
        ))
        .with_state(state)
}

fn request_ctx(claims: &Claims) -> RequestCtx {
    RequestCtx::new(claims.clone())
}

// ---------------------------------------------------------------------------
// Health, status, stream
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

pub(crate) async fn status_handler(
    State(st): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let config_hash = st
        .config
        .config_hash()
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let routines = st
        .routines
        .snapshot_all()
        .into_iter()
        .map(|r| RoutineStatus {
            key: r.key,
            state: format!("{:?}", r.state),
            failure_count: r.failure_count,
            threshold: r.threshold,
            loop_active: r.loop_active,
        })
        .collect();

    Ok(Json(StatusResponse {
        service: st.build.service,
        version: st.build.version,
        uptime_secs: uptime_secs(),
        config_hash,
        routines,
    }))
}

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: tokio::sync::broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(m.subject()).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}

// ---------------------------------------------------------------------------
// Jobs & leases
// ---------------------------------------------------------------------------

pub(crate) async fn create_job(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_ctx(&claims);
    let job = st
        .dispatch
        .create_job(
            &ctx,
            &orq_queue::NewJob {
                id: None,
                task_type: body.task_type,
                payload: body.payload,
                scheduled_for: body.scheduled_for,
                valid_until: body.valid_until,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub(crate) async fn assign_lease(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<AssignLeaseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.lease_duration_secs <= 0 {
        return Err(ApiError::invalid("lease_duration_secs must be positive"));
    }
    let ctx = request_ctx(&claims);
    let types: Vec<&str> = body.job_types.iter().map(|s| s.as_str()).collect();
    let job = st
        .dispatch
        .assign_pending_job(
            &ctx,
            &body.leaser_id,
            chrono::Duration::seconds(body.lease_duration_secs),
            &types,
        )
        .await?;
    Ok(Json(job))
}

pub(crate) async fn job_done(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(body): Json<LeaserBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_ctx(&claims);
    st.dispatch.mark_job_done(&ctx, id, &body.leaser_id).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub(crate) async fn job_failed(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(body): Json<LeaserBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_ctx(&claims);
    st.dispatch
        .mark_job_failed(&ctx, id, &body.leaser_id)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

pub(crate) async fn job_cancel(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    orq_queue::cancel_pending_job(&st.pool, id).await?;
    st.bus.publish(BusMsg::QueueCancel { job_id: id });
    Ok(Json(OkResponse { ok: true }))
}

pub(crate) async fn jobs_pending(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Query(q): Query<CursorQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_ctx(&claims);
    let jobs = st
        .dispatch
        .pending_jobs(&ctx, q.cursor, q.limit.unwrap_or(100))
        .await?;
    let next_cursor = jobs.last().map(|j| j.created_at);
    Ok(Json(JobListResponse { jobs, next_cursor }))
}

pub(crate) async fn jobs_in_progress(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Query(q): Query<CursorQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_ctx(&claims);
    let jobs = st
        .dispatch
        .in_progress_jobs(&ctx, q.cursor, q.limit.unwrap_or(100))
        .await?;
    let next_cursor = jobs.last().map(|j| j.created_at);
    Ok(Json(JobListResponse { jobs, next_cursor }))
}

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

pub(crate) async fn create_chain(
    State(st): State<Arc<AppState>>,
    Json(def): Json<orq_schemas::ChainDefinition>,
) -> Result<impl IntoResponse, ApiError> {
    orq_tasks::validate_chain(&def)?;
    orq_db::set_chain(&st.pool, &def).await?;
    info!(chain_id = %def.id, "chain created");
    Ok((StatusCode::CREATED, Json(def)))
}

pub(crate) async fn update_chain(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut def): Json<orq_schemas::ChainDefinition>,
) -> Result<impl IntoResponse, ApiError> {
    def.id = id;
    orq_tasks::validate_chain(&def)?;
    orq_db::update_chain(&st.pool, &def).await?;
    Ok(Json(def))
}

pub(crate) async fn get_chain(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let def = orq_db::get_chain(&st.pool, &id).await?;
    Ok(Json(def))
}

pub(crate) async fn list_chains(
    State(st): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let chains = orq_db::list_chains(&st.pool).await?;
    Ok(Json(json!({ "chains": chains })))
}

pub(crate) async fn delete_chain(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    orq_db::delete_chain(&st.pool, &id).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub(crate) async fn execute_chain(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !claims.authorized {
        return Err(ApiError::unauthorized());
    }
    if !st.execute_limiter.allow() {
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "execute rate limit exceeded",
        ));
    }

    let def = match (&body.chain, &body.chain_id) {
        (Some(def), _) => def.clone(),
        (None, Some(id)) => orq_db::get_chain(&st.pool, id).await?,
        (None, None) => {
            return Err(ApiError::invalid("either chain or chain_id is required"));
        }
    };

    let request_id = Uuid::new_v4();
    let ctx = ChainContext::with_input(request_id, &def.id, body.input.clone());
    let outcome = st.engine.execute(&def, ctx).await?;

    let output = outcome
        .slots
        .get("output")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    Ok(Json(ExecuteResponse {
        chain_id: outcome.chain_id,
        request_id,
        status: match outcome.status {
            ChainStatus::Completed => "completed".to_string(),
            ChainStatus::Failed => "failed".to_string(),
        },
        steps: outcome.steps,
        output,
    }))
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

pub(crate) async fn create_backend(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<BackendBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_ctx(&claims);
    let span = st.tracker.start(ctx.request_id, "create_backend", "backend");
    let result = orq_db::create_backend(
        &st.pool,
        &orq_db::NewBackend {
            name: body.name,
            base_url: body.base_url,
            backend_type: body.backend_type,
        },
    )
    .await;

    match result {
        Ok(backend) => {
            span.succeeded(
                &backend.id.to_string(),
                json!({"name": backend.name, "base_url": backend.base_url}),
            );
            Ok((StatusCode::CREATED, Json(backend)))
        }
        Err(e) => {
            span.failed(&e);
            Err(e.into())
        }
    }
}

pub(crate) async fn get_backend(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(orq_db::get_backend(&st.pool, id).await?))
}

pub(crate) async fn list_backends(
    State(st): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let backends = orq_db::list_backends(&st.pool).await?;
    Ok(Json(BackendListResponse { backends }))
}

pub(crate) async fn update_backend(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<BackendBody>,
) -> Result<impl IntoResponse, ApiError> {
    let backend = orq_db::update_backend(
        &st.pool,
        id,
        &orq_db::NewBackend {
            name: body.name,
            base_url: body.base_url,
            backend_type: body.backend_type,
        },
    )
    .await?;
    Ok(Json(backend))
}

pub(crate) async fn delete_backend(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_ctx(&claims);
    let span = st.tracker.start(ctx.request_id, "delete_backend", "backend");
    match orq_db::delete_backend(&st.pool, id).await {
        Ok(()) => {
            span.succeeded(&id.to_string(), json!({}));
            Ok(Json(OkResponse { ok: true }))
        }
        Err(e) => {
            span.failed(&e);
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

pub(crate) async fn create_model(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ModelBody>,
) -> Result<impl IntoResponse, ApiError> {
    let model = orq_db::create_model(
        &st.pool,
        &orq_db::NewModel {
            name: body.name,
            immutable: false,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(model)))
}

pub(crate) async fn list_models(
    State(st): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let models = orq_db::list_models(&st.pool).await?;
    Ok(Json(ModelListResponse { models }))
}

pub(crate) async fn delete_model(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    orq_db::delete_model(&st.pool, id).await?;
    Ok(Json(OkResponse { ok: true }))
}

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

pub(crate) async fn create_pool(
    State(st): State<Arc<AppState>>,
    Json(body): Json<PoolBody>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = orq_db::create_pool(
        &st.pool,
        &orq_db::NewPool {
            name: body.name,
            purpose: body.purpose,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(pool)))
}

pub(crate) async fn list_pools(
    State(st): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let pools = orq_db::list_pools(&st.pool).await?;
    Ok(Json(PoolListResponse { pools }))
}

pub(crate) async fn get_pool(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = orq_db::get_pool(&st.pool, id).await?;
    let backends = orq_db::list_backends_for_pool(&st.pool, id).await?;
    let models = orq_db::list_models_for_pool(&st.pool, id).await?;
    Ok(Json(PoolDetailResponse {
        pool,
        backends,
        models,
    }))
}

pub(crate) async fn delete_pool(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    orq_db::delete_pool(&st.pool, id).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub(crate) async fn assign_pool_backend(
    State(st): State<Arc<AppState>>,
    Path((id, backend_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    orq_db::assign_backend_to_pool(&st.pool, id, backend_id).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub(crate) async fn remove_pool_backend(
    State(st): State<Arc<AppState>>,
    Path((id, backend_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    orq_db::remove_backend_from_pool(&st.pool, id, backend_id).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub(crate) async fn assign_pool_model(
    State(st): State<Arc<AppState>>,
    Path((id, model_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    orq_db::assign_model_to_pool(&st.pool, id, model_id).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub(crate) async fn remove_pool_model(
    State(st): State<Arc<AppState>>,
    Path((id, model_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    orq_db::remove_model_from_pool(&st.pool, id, model_id).await?;
    Ok(Json(OkResponse { ok: true }))
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

fn parse_provider(raw: &str) -> Result<ProviderType, ApiError> {
    ProviderType::parse(raw)
        .ok_or_else(|| ApiError::invalid(format!("unknown provider type: {raw}")))
}

pub(crate) async fn configure_provider(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(provider): Path<String>,
    Json(body): Json<ConfigureProviderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let provider = parse_provider(&provider)?;
    let ctx = request_ctx(&claims);
    let span = st
        .tracker
        .start(ctx.request_id, "configure_provider", "provider");

    match orq_db::configure_provider(&st.pool, provider, &body.api_key, body.upsert).await {
        Ok(cfg) => {
            // The tracker masks api_key before any sink sees it.
            span.succeeded(
                provider.as_str(),
                json!({"api_key": body.api_key, "upsert": body.upsert}),
            );
            Ok(Json(ProviderStatusResponse {
                provider_type: cfg.provider_type.as_str().to_string(),
                configured: true,
                api_key: Some(orq_activity::MASK.to_string()),
                updated_at: Some(cfg.updated_at),
            }))
        }
        Err(e) => {
            span.failed(&e);
            Err(e.into())
        }
    }
}

pub(crate) async fn provider_status(
    State(st): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let provider = parse_provider(&provider)?;
    match orq_db::get_provider_config(&st.pool, provider).await {
        Ok(cfg) => Ok(Json(ProviderStatusResponse {
            provider_type: cfg.provider_type.as_str().to_string(),
            configured: true,
            api_key: Some(orq_activity::MASK.to_string()),
            updated_at: Some(cfg.updated_at),
        })),
        Err(orq_db::StoreError::NotFound(_)) => Ok(Json(ProviderStatusResponse {
            provider_type: provider.as_str().to_string(),
            configured: false,
            api_key: None,
            updated_at: None,
        })),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Runtime state, cycles, operator surfaces
// ---------------------------------------------------------------------------

pub(crate) async fn runtime_state(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = st.runtime.snapshot().await;
    Json(json!({ "backends": snapshot }))
}

pub(crate) async fn trigger_cycles(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    st.bus.publish(BusMsg::TriggerCycle);
    info!("cycle trigger requested");
    Json(OkResponse { ok: true })
}

pub(crate) async fn activity_recent(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "activity": st.activity_ring.recent() }))
}

pub(crate) async fn alerts_recent(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "alerts": st.alerts.recent() }))
}

pub(crate) async fn events_query(
    State(st): State<Arc<AppState>>,
    Query(q): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let events = orq_events::get_events_by_type(
        &st.pool,
        &q.event_type,
        q.from,
        q.to,
        q.limit.unwrap_or(100),
    )
    .await?;
    Ok(Json(json!({ "events": events })))
}
