//! Admin CRUD for logical model names.
//!
//! The configured embed model is stored with `immutable = true`; deleting it
//! is refused so embedding never silently loses its model.

use orq_schemas::Model;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{is_unique_violation, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct NewModel {
    pub name: String,
    pub immutable: bool,
}

pub(crate) fn model_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<Model> {
    Ok(Model {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        immutable: row.try_get("immutable")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn create_model(pool: &PgPool, req: &NewModel) -> StoreResult<Model> {
    if req.name.trim().is_empty() {
        return Err(StoreError::Invalid {
            field: "name",
            reason: "must not be empty".to_string(),
        });
    }

    let row = sqlx::query(
        r#"
        insert into ollama_models (id, name, immutable)
        values ($1, $2, $3)
        returning id, name, immutable, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&req.name)
    .bind(req.immutable)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(format!("model already exists: {}", req.name))
        } else {
            StoreError::Db(e)
        }
    })?;

    model_from_row(&row)
}

/// Insert the model if absent; returns the stored row either way. Used at
/// startup to guarantee the configured embed model exists and is immutable.
pub async fn ensure_model(pool: &PgPool, req: &NewModel) -> StoreResult<Model> {
    let row = sqlx::query(
        r#"
        insert into ollama_models (id, name, immutable)
        values ($1, $2, $3)
        on conflict (name) do update
            set immutable = ollama_models.immutable or excluded.immutable,
                updated_at = now()
        returning id, name, immutable, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&req.name)
    .bind(req.immutable)
    .fetch_one(pool)
    .await?;

    model_from_row(&row)
}

pub async fn get_model_by_name(pool: &PgPool, name: &str) -> StoreResult<Model> {
    let row = sqlx::query(
        r#"
        select id, name, immutable, created_at, updated_at
        from ollama_models
        where name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound("model"))?;

    model_from_row(&row)
}

pub async fn list_models(pool: &PgPool) -> StoreResult<Vec<Model>> {
    let rows = sqlx::query(
        r#"
        select id, name, immutable, created_at, updated_at
        from ollama_models
        order by name asc
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(model_from_row).collect()
}

/// Delete a model by id. Refuses immutable models.
pub async fn delete_model(pool: &PgPool, id: Uuid) -> StoreResult<()> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query("select name, immutable from ollama_models where id = $1 for update")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("model"))?;

    let name: String = row.try_get("name")?;
    let immutable: bool = row.try_get("immutable")?;
    if immutable {
        return Err(StoreError::Immutable(format!(
            "model {name} is immutable and cannot be deleted"
        )));
    }

    sqlx::query("delete from ollama_models where id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}
