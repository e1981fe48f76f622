//! Persistence for task-chain definitions.
//!
//! Structural validation (transition resolution, cycle gating) happens in
//! the task engine before anything reaches this module; here we only refuse
//! rows that could not be addressed at all.

use orq_schemas::ChainDefinition;
use sqlx::{PgPool, Row};

use crate::{StoreError, StoreResult};

pub async fn set_chain(pool: &PgPool, def: &ChainDefinition) -> StoreResult<()> {
    if def.id.trim().is_empty() {
        return Err(StoreError::Invalid {
            field: "id",
            reason: "must not be empty".to_string(),
        });
    }

    let body = serde_json::to_value(def).map_err(|e| StoreError::Invalid {
        field: "definition",
        reason: e.to_string(),
    })?;

    let res = sqlx::query(
        r#"
        insert into task_chains (id, definition)
        values ($1, $2)
        on conflict (id) do nothing
        "#,
    )
    .bind(&def.id)
    .bind(&body)
    .execute(pool)
    .await?;

    if res.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "chain already exists: {}",
            def.id
        )));
    }
    Ok(())
}

pub async fn update_chain(pool: &PgPool, def: &ChainDefinition) -> StoreResult<()> {
    let body = serde_json::to_value(def).map_err(|e| StoreError::Invalid {
        field: "definition",
        reason: e.to_string(),
    })?;

    let res = sqlx::query(
        r#"
        update task_chains
           set definition = $2,
               updated_at = now()
         where id = $1
        "#,
    )
    .bind(&def.id)
    .bind(&body)
    .execute(pool)
    .await?;

    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound("chain"));
    }
    Ok(())
}

pub async fn get_chain(pool: &PgPool, id: &str) -> StoreResult<ChainDefinition> {
    let row = sqlx::query("select definition from task_chains where id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound("chain"))?;

    let body: serde_json::Value = row.try_get("definition")?;
    serde_json::from_value(body).map_err(|e| StoreError::Invalid {
        field: "definition",
        reason: e.to_string(),
    })
}

pub async fn list_chains(pool: &PgPool) -> StoreResult<Vec<ChainDefinition>> {
    let rows = sqlx::query("select definition from task_chains order by id")
        .fetch_all(pool)
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let body: serde_json::Value = row.try_get("definition")?;
        out.push(
            serde_json::from_value(body).map_err(|e| StoreError::Invalid {
                field: "definition",
                reason: e.to_string(),
            })?,
        );
    }
    Ok(out)
}

pub async fn delete_chain(pool: &PgPool, id: &str) -> StoreResult<()> {
    let res = sqlx::query("delete from task_chains where id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound("chain"));
    }
    Ok(())
}
