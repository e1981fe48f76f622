//! Shared daemon state and the runtime adapters behind the task engine.
//!
//! Handlers receive `State<Arc<AppState>>`. Construction uses a lazy DB
//! pool so the scenario tests can build the full state without a reachable
//! Postgres; only routes that query will then fail.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::warn;

use orq_activity::{ActivityRecord, ChannelSink, RingSink, Sink, Tracker};
use orq_config::Config;
use orq_dispatch::Dispatch;
use orq_queue::RetryCaps;
use orq_resolver::{
    providers_from_views, AffinityIndex, CapabilityCatalog, Resolver, ResolveError,
    ResolveRequest, Selection,
};
use orq_routines::RoutinePool;
use orq_state::{Bus, RuntimeState};
use orq_tasks::{
    AlertSink, HookRegistry, MessageStore, ModelRunner, ResolveModel, TaskEngine, VectorSearcher,
};

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub bus: Bus,
    pub runtime: RuntimeState,
    pub routines: RoutinePool,
    pub tracker: Tracker,
    pub activity_ring: Arc<RingSink>,
    pub alerts: Arc<AlertSink>,
    pub dispatch: Arc<dyn Dispatch>,
    pub engine: Arc<TaskEngine>,
    pub execute_limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
    pub build: BuildInfo,
}

impl AppState {
    /// Build the full state graph from config. Does not touch the network:
    /// the pool is lazy and all background loops are registered separately.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let pool = orq_db::connect_lazy(&config.database_url)?;
        let bus = Bus::default();
        let runtime = RuntimeState::new();
        let routines = RoutinePool::new();

        let activity_ring = RingSink::new(256);
        let (activity_tx, activity_rx) = tokio::sync::mpsc::unbounded_channel();
        let tracker = Tracker::new(vec![
            Arc::new(orq_activity::LogSink) as Arc<dyn Sink>,
            activity_ring.clone() as Arc<dyn Sink>,
            Arc::new(ChannelSink::new(activity_tx)) as Arc<dyn Sink>,
        ]);
        spawn_activity_writer(pool.clone(), activity_rx);

        let caps = RetryCaps::default();
        let dispatch = orq_dispatch::build_dispatch(pool.clone(), caps, tracker.clone());

        let alerts = AlertSink::new(128);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.backend_dial_timeout_secs))
            .build()
            .context("build daemon http client")?;

        let resolver = Arc::new(StateResolver {
            pool: pool.clone(),
            runtime: runtime.clone(),
            resolver: Resolver::new(),
            catalog: catalog_from_config(&config),
        });
        let runner = Arc::new(NativePromptRunner { http: http.clone() });
        let hooks = HookRegistry::with_builtins(
            Arc::new(EventMessageStore { pool: pool.clone() }),
            Arc::new(StubSearcher),
            http,
        );
        let engine = Arc::new(TaskEngine::new(
            hooks,
            resolver,
            runner,
            tracker.clone(),
            Arc::clone(&alerts),
        ));

        Ok(Arc::new(Self {
            pool,
            bus,
            runtime,
            routines,
            tracker,
            activity_ring,
            alerts,
            dispatch,
            engine,
            execute_limiter: Arc::new(RateLimiter::new(60, Duration::from_secs(60))),
            config: Arc::new(config),
            build: BuildInfo {
                service: "orq-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }))
    }
}

/// Seed the capability catalog with the configured special models.
fn catalog_from_config(config: &Config) -> CapabilityCatalog {
    let mut catalog = CapabilityCatalog::default();
    if !config.embed_model.is_empty() {
        catalog.insert(
            &config.embed_model,
            orq_schemas::Capabilities {
                can_chat: false,
                can_prompt: false,
                can_embed: true,
                can_stream: false,
                context_length: 8_192,
            },
        );
    }
    catalog
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Fixed-window request limiter for the expensive endpoints.
pub struct RateLimiter {
    max_per_window: u32,
    window: std::time::Duration,
    inner: std::sync::Mutex<(std::time::Instant, u32)>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window: std::time::Duration) -> Self {
        Self {
            max_per_window,
            window,
            inner: std::sync::Mutex::new((std::time::Instant::now(), 0)),
        }
    }

    /// `true` when the call is admitted; `false` short-circuits to 429.
    pub fn allow(&self) -> bool {
        let now = std::time::Instant::now();
        let mut slot = self.inner.lock().expect("rate limiter mutex poisoned");
        if now.duration_since(slot.0) >= self.window {
            *slot = (now, 0);
        }
        if slot.1 >= self.max_per_window {
            return false;
        }
        slot.1 += 1;
        true
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Engine adapters
// ---------------------------------------------------------------------------

/// Resolver over the live cluster view plus pool associations.
struct StateResolver {
    pool: PgPool,
    runtime: RuntimeState,
    resolver: Resolver,
    catalog: CapabilityCatalog,
}

#[async_trait]
impl ResolveModel for StateResolver {
    async fn resolve(&self, req: &ResolveRequest) -> Result<Selection, ResolveError> {
        let views = self.runtime.snapshot().await;
        let providers = providers_from_views(&views, &self.catalog, false);

        let affinity = match orq_db::pools_exist(&self.pool).await {
            Ok(true) => match orq_db::model_backend_associations(&self.pool).await {
                Ok(pairs) => AffinityIndex::from_associations(&pairs),
                Err(err) => {
                    warn!(error = %err, "affinity load failed; routing unconstrained");
                    AffinityIndex::inactive()
                }
            },
            Ok(false) => AffinityIndex::inactive(),
            Err(err) => {
                warn!(error = %err, "pool existence check failed; routing unconstrained");
                AffinityIndex::inactive()
            }
        };

        self.resolver.resolve(&providers, &affinity, req)
    }
}

/// Prompt execution over the backend's native generate endpoint.
struct NativePromptRunner {
    http: reqwest::Client,
}

#[async_trait]
impl ModelRunner for NativePromptRunner {
    async fn run_prompt(&self, selection: &Selection, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/api/generate",
            selection.backend_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .post(&url)
            .json(&json!({
                "model": selection.provider.model_name,
                "prompt": prompt,
                "stream": false,
            }))
            .send()
            .await
            .with_context(|| format!("dial {url}"))?;

        if !resp.status().is_success() {
            return Err(anyhow!("{url} returned {}", resp.status()));
        }

        let body: Value = resp.json().await.context("decode generate response")?;
        body.get("response")
            .and_then(|r| r.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("generate response missing response field"))
    }
}

/// Conversation persistence into the event store.
struct EventMessageStore {
    pool: PgPool,
}

#[async_trait]
impl MessageStore for EventMessageStore {
    async fn persist(&self, chain_id: &str, request_id: &str, messages: &Value) -> Result<()> {
        orq_events::append_event(
            &self.pool,
            orq_events::NewEvent {
                id: None,
                created_at: None,
                event_type: "chat_messages".to_string(),
                event_source: "task-engine".to_string(),
                aggregate_id: request_id.to_string(),
                aggregate_type: "chain".to_string(),
                version: 0,
                data: Some(messages.clone()),
                metadata: Some(json!({"chain_id": chain_id})),
            },
        )
        .await?;
        Ok(())
    }
}

/// The vector store is an external collaborator; until one is wired this
/// stub keeps knowledge-search chains executable with empty results.
struct StubSearcher;

#[async_trait]
impl VectorSearcher for StubSearcher {
    async fn search(&self, _query: &str, _top_k: usize) -> Result<Value> {
        Ok(json!([]))
    }
}

/// Owns the event-store append for activity records so tracker sinks stay
/// synchronous.
fn spawn_activity_writer(
    pool: PgPool,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<ActivityRecord>,
) {
    tokio::spawn(async move {
        while let Some(rec) = rx.recv().await {
            let res = orq_events::append_event(
                &pool,
                orq_events::NewEvent {
                    id: None,
                    created_at: Some(rec.ts),
                    event_type: "activity".to_string(),
                    event_source: "activity-tracker".to_string(),
                    aggregate_id: rec.request_id.to_string(),
                    aggregate_type: rec.subject.clone(),
                    version: 0,
                    data: serde_json::to_value(&rec).ok(),
                    metadata: None,
                },
            )
            .await;
            if let Err(err) = res {
                warn!(error = %err, "activity event append failed");
            }
        }
    });
}

