//! Per-worker progress watermarks (singleton rows keyed by worker id).
//!
//! Pull-style workers persist the last timestamp they synced; queue-style
//! pollers persist a numeric offset. Restarts resume from the stored value
//! instead of re-ingesting history.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::StoreResult;

#[derive(Debug, Clone, Default)]
pub struct Watermark {
    pub watermark: Option<DateTime<Utc>>,
    pub offset_value: Option<i64>,
}

pub async fn load_watermark(pool: &PgPool, worker_id: &str) -> StoreResult<Watermark> {
    let row: Option<(Option<DateTime<Utc>>, Option<i64>)> = sqlx::query_as(
        r#"
        select watermark, offset_value
        from sys_worker_watermark
        where worker_id = $1
        "#,
    )
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some((watermark, offset_value)) => Watermark {
            watermark,
            offset_value,
        },
        None => Watermark::default(),
    })
}

pub async fn store_watermark(pool: &PgPool, worker_id: &str, wm: &Watermark) -> StoreResult<()> {
    sqlx::query(
        r#"
        insert into sys_worker_watermark (worker_id, watermark, offset_value, updated_at)
        values ($1, $2, $3, now())
        on conflict (worker_id) do update
            set watermark    = excluded.watermark,
                offset_value = excluded.offset_value,
                updated_at   = excluded.updated_at
        "#,
    )
    .bind(worker_id)
    .bind(wm.watermark)
    .bind(wm.offset_value)
    .execute(pool)
    .await?;
    Ok(())
}
