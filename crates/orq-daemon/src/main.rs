//! orq-daemon entry point.
//!
//! Intentionally thin: tracing, config, DB bootstrap, background loop
//! registration, HTTP serve. Route handlers live in `routes.rs`, shared
//! state in `state.rs`, background wiring in `wiring.rs`.
//!
//! Exit is zero on clean shutdown and non-zero on any init failure
//! (config, DB, bind).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use orq_daemon::{routes, state::AppState, wiring};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file
    // does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = orq_config::Config::from_env().context("load config")?;
    let bind_addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_addr()))?;

    let shared = AppState::new(config)?;

    // First real DB contact: connectivity problems fail startup here.
    orq_db::migrate(&shared.pool).await?;

    // The configured embed model always exists and is undeletable.
    if !shared.config.embed_model.is_empty() {
        orq_db::ensure_model(
            &shared.pool,
            &orq_db::NewModel {
                name: shared.config.embed_model.clone(),
                immutable: true,
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!("ensure embed model: {e}"))?;
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    wiring::register_background(&shared, shutdown_rx)?;

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive());

    info!("orq-daemon listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
