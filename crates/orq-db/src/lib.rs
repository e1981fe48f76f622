use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};
use thiserror::Error;

pub const ENV_DB_URL: &str = "ORQ_DATABASE_URL";

pub mod backends;
pub mod chains;
pub mod models;
pub mod pools;
pub mod providers;
pub mod watermarks;

pub use backends::{create_backend, delete_backend, get_backend, list_backends, update_backend, NewBackend};
pub use chains::{delete_chain, get_chain, list_chains, set_chain, update_chain};
pub use models::{create_model, delete_model, ensure_model, get_model_by_name, list_models, NewModel};
pub use pools::{
    assign_backend_to_pool, assign_model_to_pool, create_pool, declared_models_for_backend,
    delete_pool, get_pool, list_backends_for_pool, list_models_for_pool, list_pools,
    model_backend_associations, pools_exist, remove_backend_from_pool, remove_model_from_pool,
    NewPool,
};
pub use providers::{configure_provider, get_provider_config, list_provider_configs};
pub use watermarks::{load_watermark, store_watermark, Watermark};

/// Errors the admin store surfaces to callers that need to map them
/// (HTTP layer, services). Plumbing failures stay as `sqlx::Error`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("immutable: {0}")]
    Immutable(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Connect to Postgres using ORQ_DATABASE_URL or an explicit URL.
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Lazy pool: defers the first connection until a query runs. Used by tests
/// and wiring paths that must construct state without touching the network.
pub fn connect_lazy(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect_lazy(url)
        .context("failed to build lazy Postgres pool")?;
    Ok(pool)
}

/// Test helper used by integration tests:
/// - Connect using ORQ_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='llm_backends'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_schema: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_schema: bool,
}

/// Detect a Postgres unique-violation (SQLSTATE 23505).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
