//! Affinity pools: many-to-many associations between backends and models.
//!
//! When at least one pool exists, routing only pairs a model with a backend
//! that shares a pool with it; resources assigned to no pool are invisible
//! to the router.

use orq_schemas::{Backend, Model, Pool};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{is_unique_violation, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct NewPool {
    pub name: String,
    pub purpose: String,
}

fn pool_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<Pool> {
    Ok(Pool {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        purpose: row.try_get("purpose")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn create_pool(pg: &PgPool, req: &NewPool) -> StoreResult<Pool> {
    if req.name.trim().is_empty() {
        return Err(StoreError::Invalid {
            field: "name",
            reason: "must not be empty".to_string(),
        });
    }

    let row = sqlx::query(
        r#"
        insert into pools (id, name, purpose)
        values ($1, $2, $3)
        returning id, name, purpose, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&req.name)
    .bind(&req.purpose)
    .fetch_one(pg)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(format!("pool name already exists: {}", req.name))
        } else {
            StoreError::Db(e)
        }
    })?;

    pool_from_row(&row)
}

pub async fn get_pool(pg: &PgPool, id: Uuid) -> StoreResult<Pool> {
    let row = sqlx::query(
        "select id, name, purpose, created_at, updated_at from pools where id = $1",
    )
    .bind(id)
    .fetch_optional(pg)
    .await?
    .ok_or(StoreError::NotFound("pool"))?;
    pool_from_row(&row)
}

pub async fn list_pools(pg: &PgPool) -> StoreResult<Vec<Pool>> {
    let rows =
        sqlx::query("select id, name, purpose, created_at, updated_at from pools order by name")
            .fetch_all(pg)
            .await?;
    rows.iter().map(pool_from_row).collect()
}

/// Delete a pool. Refused when the pool still contains an immutable model:
/// dropping it would make the embed model unroutable.
pub async fn delete_pool(pg: &PgPool, id: Uuid) -> StoreResult<()> {
    let mut tx = pg.begin().await?;

    let guarded: Option<(String,)> = sqlx::query_as(
        r#"
        select m.name
        from pool_models pm
        join ollama_models m on m.id = pm.model_id
        where pm.pool_id = $1 and m.immutable
        limit 1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some((name,)) = guarded {
        return Err(StoreError::Immutable(format!(
            "pool contains immutable model {name}; unassign is refused, so the pool cannot be deleted"
        )));
    }

    let res = sqlx::query("delete from pools where id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound("pool"));
    }

    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Associations
// ---------------------------------------------------------------------------

pub async fn assign_backend_to_pool(pg: &PgPool, pool_id: Uuid, backend_id: Uuid) -> StoreResult<()> {
    sqlx::query(
        r#"
        insert into pool_backends (pool_id, backend_id)
        values ($1, $2)
        on conflict do nothing
        "#,
    )
    .bind(pool_id)
    .bind(backend_id)
    .execute(pg)
    .await
    .map_err(map_fk_violation)?;
    Ok(())
}

pub async fn remove_backend_from_pool(pg: &PgPool, pool_id: Uuid, backend_id: Uuid) -> StoreResult<()> {
    let res = sqlx::query("delete from pool_backends where pool_id = $1 and backend_id = $2")
        .bind(pool_id)
        .bind(backend_id)
        .execute(pg)
        .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound("pool backend association"));
    }
    Ok(())
}

pub async fn assign_model_to_pool(pg: &PgPool, pool_id: Uuid, model_id: Uuid) -> StoreResult<()> {
    sqlx::query(
        r#"
        insert into pool_models (pool_id, model_id)
        values ($1, $2)
        on conflict do nothing
        "#,
    )
    .bind(pool_id)
    .bind(model_id)
    .execute(pg)
    .await
    .map_err(map_fk_violation)?;
    Ok(())
}

/// Unassign a model from a pool. Immutable models are pinned to their pools.
pub async fn remove_model_from_pool(pg: &PgPool, pool_id: Uuid, model_id: Uuid) -> StoreResult<()> {
    let mut tx = pg.begin().await?;

    let row = sqlx::query("select name, immutable from ollama_models where id = $1")
        .bind(model_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("model"))?;
    let name: String = row.try_get("name")?;
    let immutable: bool = row.try_get("immutable")?;
    if immutable {
        return Err(StoreError::Immutable(format!(
            "model {name} is immutable and stays assigned"
        )));
    }

    let res = sqlx::query("delete from pool_models where pool_id = $1 and model_id = $2")
        .bind(pool_id)
        .bind(model_id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound("pool model association"));
    }

    tx.commit().await?;
    Ok(())
}

pub async fn list_backends_for_pool(pg: &PgPool, pool_id: Uuid) -> StoreResult<Vec<Backend>> {
    let rows = sqlx::query(
        r#"
        select b.id, b.name, b.base_url, b.backend_type, b.created_at, b.updated_at
        from pool_backends pb
        join llm_backends b on b.id = pb.backend_id
        where pb.pool_id = $1
        order by b.name
        "#,
    )
    .bind(pool_id)
    .fetch_all(pg)
    .await?;

    rows.iter().map(crate::backends::backend_from_row).collect()
}

pub async fn list_models_for_pool(pg: &PgPool, pool_id: Uuid) -> StoreResult<Vec<Model>> {
    let rows = sqlx::query(
        r#"
        select m.id, m.name, m.immutable, m.created_at, m.updated_at
        from pool_models pm
        join ollama_models m on m.id = pm.model_id
        where pm.pool_id = $1
        order by m.name
        "#,
    )
    .bind(pool_id)
    .fetch_all(pg)
    .await?;

    rows.iter().map(crate::models::model_from_row).collect()
}

/// Declared models for a backend: every model sharing at least one pool
/// with it. The backend-sync cycle diffs this against what the backend
/// actually serves.
pub async fn declared_models_for_backend(pg: &PgPool, backend_id: Uuid) -> StoreResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        select distinct m.name
        from pool_backends pb
        join pool_models pm on pm.pool_id = pb.pool_id
        join ollama_models m on m.id = pm.model_id
        where pb.backend_id = $1
        order by m.name
        "#,
    )
    .bind(backend_id)
    .fetch_all(pg)
    .await?;

    Ok(rows.into_iter().map(|(n,)| n).collect())
}

/// Every (model name, backend id) pair that shares a pool. The resolver
/// builds its affinity index from this.
pub async fn model_backend_associations(pg: &PgPool) -> StoreResult<Vec<(String, Uuid)>> {
    let rows: Vec<(String, Uuid)> = sqlx::query_as(
        r#"
        select distinct m.name, pb.backend_id
        from pool_models pm
        join ollama_models m on m.id = pm.model_id
        join pool_backends pb on pb.pool_id = pm.pool_id
        "#,
    )
    .fetch_all(pg)
    .await?;
    Ok(rows)
}

/// Whether any pool exists at all; routing is pool-constrained only then.
pub async fn pools_exist(pg: &PgPool) -> StoreResult<bool> {
    let (n,): (i64,) = sqlx::query_as("select count(*)::bigint from pools")
        .fetch_one(pg)
        .await?;
    Ok(n > 0)
}

fn map_fk_violation(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = e {
        if db.code().as_deref() == Some("23503") {
            return StoreError::NotFound("pool or member");
        }
    }
    StoreError::Db(e)
}
