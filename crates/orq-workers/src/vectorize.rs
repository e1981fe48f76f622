//! Vectorization producer.
//!
//! Files land in the system as `file_created` domain events (the upload
//! surface is an external collaborator). This producer turns each such
//! event into a `vectorize` job, keyed by the file id so re-scans of the
//! same window cannot double-enqueue.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

pub const TASK_TYPE_VECTORIZE: &str = "vectorize";
pub const EVENT_TYPE_FILE_CREATED: &str = "file_created";

const WATERMARK_KEY: &str = "vectorize-producer";

pub fn vectorize_job_id(file_id: &str) -> Uuid {
    let seed = format!("vectorize|{file_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes())
}

/// Scan `file_created` events since the watermark and enqueue vectorize
/// jobs. Returns how many jobs were enqueued.
pub async fn produce_tick(pool: &PgPool) -> Result<u64> {
    let wm = orq_db::load_watermark(pool, WATERMARK_KEY).await?;
    let from = wm.watermark.unwrap_or_else(|| Utc::now() - Duration::days(1));
    let to = Utc::now();

    let events =
        orq_events::get_events_by_type(pool, EVENT_TYPE_FILE_CREATED, from, to, 1_000).await?;

    let mut enqueued = 0u64;
    let mut newest = from;
    for event in &events {
        if event.created_at > newest {
            newest = event.created_at;
        }

        let job = orq_queue::NewJob {
            id: Some(vectorize_job_id(&event.aggregate_id)),
            task_type: TASK_TYPE_VECTORIZE.to_string(),
            payload: json!({
                "file_id": event.aggregate_id,
                "event_id": event.id,
            }),
            scheduled_for: None,
            valid_until: None,
        };
        if orq_queue::create_job_if_absent(pool, &job).await? {
            enqueued += 1;
        }
    }

    orq_db::store_watermark(
        pool,
        WATERMARK_KEY,
        &orq_db::Watermark {
            watermark: Some(newest),
            offset_value: None,
        },
    )
    .await?;

    Ok(enqueued)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_stable_per_file() {
        assert_eq!(vectorize_job_id("f-1"), vectorize_job_id("f-1"));
        assert_ne!(vectorize_job_id("f-1"), vectorize_job_id("f-2"));
    }
}
