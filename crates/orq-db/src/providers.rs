//! Provider configuration (API-keyed external providers).
//!
//! Configuring a provider also upserts its backend row so the router can see
//! it; both writes happen in one transaction.

use orq_schemas::{ProviderConfig, ProviderType};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{StoreError, StoreResult};

fn default_base_url(provider: ProviderType) -> &'static str {
    match provider {
        ProviderType::Openai => "https://api.openai.com/v1",
        ProviderType::Gemini => "https://generativelanguage.googleapis.com/v1beta",
    }
}

/// Store (or update, with `upsert = true`) a provider's API key.
///
/// Without `upsert`, re-configuring an existing provider is a conflict.
/// The provider's backend row is created alongside so the config and the
/// routable endpoint can never drift apart.
pub async fn configure_provider(
    pool: &PgPool,
    provider: ProviderType,
    api_key: &str,
    upsert: bool,
) -> StoreResult<ProviderConfig> {
    if api_key.trim().is_empty() {
        return Err(StoreError::Invalid {
            field: "api_key",
            reason: "must not be empty".to_string(),
        });
    }

    let mut tx = pool.begin().await?;

    let row = if upsert {
        sqlx::query(
            r#"
            insert into provider_configs (provider_type, api_key, updated_at)
            values ($1, $2, now())
            on conflict (provider_type) do update
                set api_key = excluded.api_key,
                    updated_at = excluded.updated_at
            returning provider_type, api_key, updated_at
            "#,
        )
        .bind(provider.as_str())
        .bind(api_key)
        .fetch_one(&mut *tx)
        .await?
    } else {
        sqlx::query(
            r#"
            insert into provider_configs (provider_type, api_key, updated_at)
            values ($1, $2, now())
            on conflict (provider_type) do nothing
            returning provider_type, api_key, updated_at
            "#,
        )
        .bind(provider.as_str())
        .bind(api_key)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            StoreError::Conflict(format!(
                "provider {} already configured; pass upsert to replace",
                provider.as_str()
            ))
        })?
    };

    // Backend upsert in the same transaction: the provider is routable the
    // instant its key is stored.
    let backend_id = Uuid::new_v5(&Uuid::NAMESPACE_URL, provider.as_str().as_bytes());
    sqlx::query(
        r#"
        insert into llm_backends (id, name, base_url, backend_type)
        values ($1, $2, $3, $2)
        on conflict (name) do update
            set updated_at = now()
        "#,
    )
    .bind(backend_id)
    .bind(provider.as_str())
    .bind(default_base_url(provider))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    config_from_row(&row)
}

pub async fn get_provider_config(
    pool: &PgPool,
    provider: ProviderType,
) -> StoreResult<ProviderConfig> {
    let row = sqlx::query(
        r#"
        select provider_type, api_key, updated_at
        from provider_configs
        where provider_type = $1
        "#,
    )
    .bind(provider.as_str())
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound("provider config"))?;

    config_from_row(&row)
}

pub async fn list_provider_configs(pool: &PgPool) -> StoreResult<Vec<ProviderConfig>> {
    let rows = sqlx::query(
        "select provider_type, api_key, updated_at from provider_configs order by provider_type",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(config_from_row).collect()
}

fn config_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<ProviderConfig> {
    let raw: String = row.try_get("provider_type")?;
    let provider_type = ProviderType::parse(&raw).ok_or(StoreError::Invalid {
        field: "provider_type",
        reason: format!("unknown provider type: {raw}"),
    })?;
    Ok(ProviderConfig {
        provider_type,
        api_key: row.try_get("api_key")?,
        updated_at: row.try_get("updated_at")?,
    })
}
