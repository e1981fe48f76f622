//! Reconciliation scenarios against the in-process fake backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use orq_reconcile::{
    backend_sync_once, download_enqueue_once, download_work_once, BackendClient, CycleDeps,
    HttpBackendClient,
};
use orq_schemas::BackendType;
use orq_state::{Bus, RuntimeState};
use orq_testkit::FakeBackend;

#[tokio::test]
async fn http_client_lists_and_pulls_against_the_native_protocol() -> Result<()> {
    let fake = FakeBackend::with_models(&["llama3:8b"]);
    let (base_url, _server) = fake.serve().await?;

    let client = HttpBackendClient::new(Duration::from_secs(10))?;
    let models = client.list_models(&base_url).await?;
    assert_eq!(models, vec!["llama3:8b"]);

    client.pull_model(&base_url, "nomic-embed-text:latest").await?;
    assert_eq!(fake.pulls(), vec!["nomic-embed-text:latest"]);

    let models = client.list_models(&base_url).await?;
    assert!(models.contains(&"nomic-embed-text:latest".to_string()));
    Ok(())
}

#[tokio::test]
async fn declared_model_is_downloaded_and_reported_pulled() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    // Backend under reconciliation: a fake server with no models yet.
    let fake = FakeBackend::with_models(&[]);
    let (base_url, _server) = fake.serve().await?;

    let backend = orq_db::create_backend(
        &pool,
        &orq_db::NewBackend {
            name: orq_testkit::unique("recon-backend"),
            base_url: base_url.clone(),
            backend_type: BackendType::Ollama,
        },
    )
    .await?;

    // Declare the embed model through a shared pool.
    let model_name = format!("nomic-embed-{}", uuid::Uuid::new_v4().simple());
    let model = orq_db::create_model(
        &pool,
        &orq_db::NewModel {
            name: model_name.clone(),
            immutable: false,
        },
    )
    .await?;
    let pool_row = orq_db::create_pool(
        &pool,
        &orq_db::NewPool {
            name: orq_testkit::unique("recon-pool"),
            purpose: "embeddings".to_string(),
        },
    )
    .await?;
    orq_db::assign_backend_to_pool(&pool, pool_row.id, backend.id).await?;
    orq_db::assign_model_to_pool(&pool, pool_row.id, model.id).await?;

    let deps = CycleDeps {
        pool: pool.clone(),
        state: RuntimeState::new(),
        bus: Bus::default(),
        client: Arc::new(HttpBackendClient::new(Duration::from_secs(10))?),
        caps: orq_queue::RetryCaps::default(),
    };

    // Cycle passes in dependency order: observe, enqueue, drain.
    backend_sync_once(&deps).await?;
    let view = deps.state.get(backend.id).await.expect("view exists");
    assert!(view.pulled_models.is_empty());
    assert!(view.error.is_none());

    download_enqueue_once(&deps).await?;
    download_work_once(&deps).await?;

    let view = deps.state.get(backend.id).await.expect("view exists");
    assert!(
        view.pulled_models.contains(&model_name),
        "downloaded model must appear pulled; got {:?}",
        view.pulled_models
    );
    assert_eq!(fake.pulls(), vec![model_name.clone()]);

    // The next sync confirms from the backend itself.
    backend_sync_once(&deps).await?;
    let view = deps.state.get(backend.id).await.expect("view exists");
    assert!(view.pulled_models.contains(&model_name));

    orq_db::delete_backend(&pool, backend.id).await?;
    Ok(())
}

#[tokio::test]
async fn dial_failure_marks_error_but_keeps_last_models() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let fake = FakeBackend::with_models(&["llama3:8b"]);
    let (base_url, server) = fake.serve().await?;

    let backend = orq_db::create_backend(
        &pool,
        &orq_db::NewBackend {
            name: orq_testkit::unique("flaky-backend"),
            base_url,
            backend_type: BackendType::Ollama,
        },
    )
    .await?;

    let deps = CycleDeps {
        pool: pool.clone(),
        state: RuntimeState::new(),
        bus: Bus::default(),
        client: Arc::new(HttpBackendClient::new(Duration::from_secs(2))?),
        caps: orq_queue::RetryCaps::default(),
    };

    backend_sync_once(&deps).await?;
    let view = deps.state.get(backend.id).await.expect("view exists");
    assert_eq!(view.pulled_models, vec!["llama3:8b"]);

    // Kill the server; the next poll fails but the model list survives.
    server.abort();
    tokio::time::sleep(Duration::from_millis(50)).await;

    backend_sync_once(&deps).await?;
    let view = deps.state.get(backend.id).await.expect("view exists");
    assert!(view.error.is_some(), "dial failure must be marked");
    assert_eq!(
        view.pulled_models,
        vec!["llama3:8b"],
        "stale-but-marked beats silently empty"
    );

    orq_db::delete_backend(&pool, backend.id).await?;
    Ok(())
}
