//! Shared helpers for scenario tests.
//!
//! DB-backed scenarios read `ORQ_DATABASE_URL`; when it is unset the test
//! prints a skip note and returns early instead of failing, so the pure
//! parts of the suite stay green on machines without Postgres.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{extract::State, routing::get, routing::post, Json, Router};
use sqlx::PgPool;
use uuid::Uuid;

/// Connect + migrate using `ORQ_DATABASE_URL`, or `None` (with a note on
/// stderr) when the env var is absent.
pub async fn maybe_db_pool() -> anyhow::Result<Option<PgPool>> {
    if std::env::var(orq_db::ENV_DB_URL).is_err() {
        eprintln!("skipping: {} not set", orq_db::ENV_DB_URL);
        return Ok(None);
    }
    let pool = orq_db::testkit_db_pool().await?;
    Ok(Some(pool))
}

/// Unique name for test fixtures so runs never collide on unique columns.
pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Fake inference backend
// ---------------------------------------------------------------------------

/// In-process stand-in for a native inference backend.
///
/// Serves `/api/tags` from a mutable model list and records `/api/pull`
/// requests; pulled models become visible on the next `/api/tags` call.
#[derive(Clone, Default)]
pub struct FakeBackend {
    inner: Arc<Mutex<FakeBackendState>>,
}

#[derive(Default)]
struct FakeBackendState {
    models: Vec<String>,
    pulls: Vec<String>,
}

impl FakeBackend {
    pub fn with_models(models: &[&str]) -> Self {
        let fake = Self::default();
        {
            let mut st = fake.inner.lock().expect("fake backend mutex poisoned");
            st.models = models.iter().map(|m| m.to_string()).collect();
        }
        fake
    }

    pub fn models(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("fake backend mutex poisoned")
            .models
            .clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("fake backend mutex poisoned")
            .pulls
            .clone()
    }

    /// Bind on an ephemeral localhost port and serve until the handle drops.
    /// Returns the base URL to dial.
    pub async fn serve(&self) -> anyhow::Result<(String, tokio::task::JoinHandle<()>)> {
        let app = Router::new()
            .route("/api/tags", get(tags))
            .route("/api/pull", post(pull))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok((format!("http://{addr}"), handle))
    }
}

async fn tags(State(fake): State<FakeBackend>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = fake
        .models()
        .into_iter()
        .map(|name| serde_json::json!({ "name": name }))
        .collect();
    Json(serde_json::json!({ "models": models }))
}

async fn pull(
    State(fake): State<FakeBackend>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let name = body["name"].as_str().unwrap_or_default().to_string();
    {
        let mut st = fake.inner.lock().expect("fake backend mutex poisoned");
        st.pulls.push(name.clone());
        if !st.models.contains(&name) {
            st.models.push(name);
        }
    }
    Json(serde_json::json!({ "status": "success" }))
}
