//! Admin CRUD for inference backends.
//!
//! Backends are created and deleted by operators; their observed attributes
//! (model lists, dial errors) never live here; the reconciliation cycles
//! own those in the runtime view.

use orq_schemas::{Backend, BackendType};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{is_unique_violation, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct NewBackend {
    pub name: String,
    pub base_url: String,
    pub backend_type: BackendType,
}

pub(crate) fn backend_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<Backend> {
    let raw_type: String = row.try_get("backend_type")?;
    let backend_type = BackendType::parse(&raw_type).ok_or(StoreError::Invalid {
        field: "backend_type",
        reason: format!("unknown backend type: {raw_type}"),
    })?;
    Ok(Backend {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        base_url: row.try_get("base_url")?,
        backend_type,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn create_backend(pool: &PgPool, req: &NewBackend) -> StoreResult<Backend> {
    if req.name.trim().is_empty() {
        return Err(StoreError::Invalid {
            field: "name",
            reason: "must not be empty".to_string(),
        });
    }
    if req.base_url.trim().is_empty() {
        return Err(StoreError::Invalid {
            field: "base_url",
            reason: "must not be empty".to_string(),
        });
    }

    let id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        insert into llm_backends (id, name, base_url, backend_type)
        values ($1, $2, $3, $4)
        returning id, name, base_url, backend_type, created_at, updated_at
        "#,
    )
    .bind(id)
    .bind(&req.name)
    .bind(&req.base_url)
    .bind(req.backend_type.as_str())
    .fetch_one(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(format!("backend name already exists: {}", req.name))
        } else {
            StoreError::Db(e)
        }
    })?;

    backend_from_row(&row)
}

pub async fn get_backend(pool: &PgPool, id: Uuid) -> StoreResult<Backend> {
    let row = sqlx::query(
        r#"
        select id, name, base_url, backend_type, created_at, updated_at
        from llm_backends
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound("backend"))?;

    backend_from_row(&row)
}

pub async fn list_backends(pool: &PgPool) -> StoreResult<Vec<Backend>> {
    let rows = sqlx::query(
        r#"
        select id, name, base_url, backend_type, created_at, updated_at
        from llm_backends
        order by name asc
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(backend_from_row).collect()
}

pub async fn update_backend(pool: &PgPool, id: Uuid, req: &NewBackend) -> StoreResult<Backend> {
    let row = sqlx::query(
        r#"
        update llm_backends
           set name = $2,
               base_url = $3,
               backend_type = $4,
               updated_at = now()
         where id = $1
        returning id, name, base_url, backend_type, created_at, updated_at
        "#,
    )
    .bind(id)
    .bind(&req.name)
    .bind(&req.base_url)
    .bind(req.backend_type.as_str())
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(format!("backend name already exists: {}", req.name))
        } else {
            StoreError::Db(e)
        }
    })?
    .ok_or(StoreError::NotFound("backend"))?;

    backend_from_row(&row)
}

pub async fn delete_backend(pool: &PgPool, id: Uuid) -> StoreResult<()> {
    let res = sqlx::query("delete from llm_backends where id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound("backend"));
    }
    Ok(())
}
