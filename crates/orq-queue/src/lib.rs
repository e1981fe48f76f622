//! Durable typed job queue with time-bounded leases.
//!
//! One table, `job_queue_v2`. A row with `leaser IS NULL` is pending;
//! a set leaser with a live `lease_expiry` is in progress. Completion
//! deletes the row; failure requeues with `retry_count + 1` until the
//! task-type cap, then the row moves under the reserved dead-letter type.
//!
//! Delivery is at-least-once: consumers must be idempotent keyed by job id.
//! Lease acquisition and reclamation both go through `FOR UPDATE SKIP
//! LOCKED`, so concurrent workers never double-claim a row.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use orq_schemas::Job;

/// Reserved task type that holds exhausted jobs.
pub const DEAD_LETTER_TASK_TYPE: &str = "x-dead-letter";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no pending job for the requested types")]
    NoJob,
    #[error("lease stolen: job {job_id} is not held by {leaser}")]
    LeaseStolen { job_id: Uuid, leaser: String },
    #[error("job not found")]
    NotFound,
    #[error("job already exists")]
    AlreadyExists,
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Per-task-type retry caps before dead-lettering.
#[derive(Debug, Clone)]
pub struct RetryCaps {
    default_cap: i32,
    per_type: HashMap<String, i32>,
}

impl Default for RetryCaps {
    fn default() -> Self {
        let mut per_type = HashMap::new();
        per_type.insert("telegram-message".to_string(), 5);
        Self {
            default_cap: 3,
            per_type,
        }
    }
}

impl RetryCaps {
    pub fn new(default_cap: i32) -> Self {
        Self {
            default_cap,
            per_type: HashMap::new(),
        }
    }

    pub fn with_cap(mut self, task_type: &str, cap: i32) -> Self {
        self.per_type.insert(task_type.to_string(), cap);
        self
    }

    pub fn cap_for(&self, task_type: &str) -> i32 {
        self.per_type
            .get(task_type)
            .copied()
            .unwrap_or(self.default_cap)
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewJob {
    /// Explicit id for deterministic dedup (e.g. download jobs); `None`
    /// generates a fresh UUIDv4.
    pub id: Option<Uuid>,
    pub task_type: String,
    pub payload: Value,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

pub async fn create_job(pool: &PgPool, req: &NewJob) -> QueueResult<Job> {
    validate_new_job(req)?;
    let id = req.id.unwrap_or_else(Uuid::new_v4);

    let row = sqlx::query(
        r#"
        insert into job_queue_v2 (id, task_type, payload, scheduled_for, valid_until)
        values ($1, $2, $3, coalesce($4, now()), $5)
        returning id, task_type, payload, scheduled_for, valid_until,
                  created_at, retry_count, leaser, lease_expiry
        "#,
    )
    .bind(id)
    .bind(&req.task_type)
    .bind(&req.payload)
    .bind(req.scheduled_for)
    .bind(req.valid_until)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        if orq_db::is_unique_violation(&e) {
            QueueError::AlreadyExists
        } else {
            QueueError::Db(e)
        }
    })?;

    job_from_row(&row)
}

/// Insert only when the id is absent. Returns `true` when inserted; the
/// download cycle uses this with v5-derived ids so repeated enqueues of the
/// same (backend, model) pair collapse into one job.
pub async fn create_job_if_absent(pool: &PgPool, req: &NewJob) -> QueueResult<bool> {
    validate_new_job(req)?;
    let id = req.id.ok_or(QueueError::Invalid {
        field: "id",
        reason: "deduplicated creation requires an explicit id".to_string(),
    })?;

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        insert into job_queue_v2 (id, task_type, payload, scheduled_for, valid_until)
        values ($1, $2, $3, coalesce($4, now()), $5)
        on conflict (id) do nothing
        returning id
        "#,
    )
    .bind(id)
    .bind(&req.task_type)
    .bind(&req.payload)
    .bind(req.scheduled_for)
    .bind(req.valid_until)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

fn validate_new_job(req: &NewJob) -> QueueResult<()> {
    if req.task_type.trim().is_empty() {
        return Err(QueueError::Invalid {
            field: "task_type",
            reason: "must not be empty".to_string(),
        });
    }
    if req.task_type == DEAD_LETTER_TASK_TYPE {
        return Err(QueueError::Invalid {
            field: "task_type",
            reason: format!("{DEAD_LETTER_TASK_TYPE} is reserved"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lease lifecycle
// ---------------------------------------------------------------------------

/// Atomically lease the oldest runnable pending job of any admissible type.
///
/// `FOR UPDATE SKIP LOCKED` keeps concurrent workers from colliding: each
/// pop either gets a distinct row or [`QueueError::NoJob`].
pub async fn assign_pending_job(
    pool: &PgPool,
    leaser_id: &str,
    lease_duration: Duration,
    job_types: &[&str],
) -> QueueResult<Job> {
    if leaser_id.trim().is_empty() {
        return Err(QueueError::Invalid {
            field: "leaser_id",
            reason: "must not be empty".to_string(),
        });
    }
    if job_types.is_empty() {
        return Err(QueueError::Invalid {
            field: "job_types",
            reason: "at least one task type is required".to_string(),
        });
    }

    let types: Vec<String> = job_types.iter().map(|t| t.to_string()).collect();
    let lease_expiry = Utc::now() + lease_duration;

    let row = sqlx::query(
        r#"
        with next_job as (
            select id
            from job_queue_v2
            where task_type = any($1)
              and leaser is null
              and scheduled_for <= now()
              and (valid_until is null or valid_until > now())
            order by created_at asc
            limit 1
            for update skip locked
        )
        update job_queue_v2 j
           set leaser = $2,
               lease_expiry = $3
          from next_job
         where j.id = next_job.id
        returning j.id, j.task_type, j.payload, j.scheduled_for, j.valid_until,
                  j.created_at, j.retry_count, j.leaser, j.lease_expiry
        "#,
    )
    .bind(&types)
    .bind(leaser_id)
    .bind(lease_expiry)
    .fetch_optional(pool)
    .await?
    .ok_or(QueueError::NoJob)?;

    job_from_row(&row)
}

/// Complete a job. Succeeds only while `leaser_id` still holds the lease.
pub async fn mark_job_done(pool: &PgPool, job_id: Uuid, leaser_id: &str) -> QueueResult<()> {
    let res = sqlx::query("delete from job_queue_v2 where id = $1 and leaser = $2")
        .bind(job_id)
        .bind(leaser_id)
        .execute(pool)
        .await?;

    if res.rows_affected() == 1 {
        return Ok(());
    }
    lease_guard_failure(pool, job_id, leaser_id).await
}

/// Fail a job. Same lease guard as completion; the row requeues with an
/// incremented retry count, or dead-letters past the task-type cap.
pub async fn mark_job_failed(
    pool: &PgPool,
    job_id: Uuid,
    leaser_id: &str,
    caps: &RetryCaps,
) -> QueueResult<()> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        select task_type, payload, retry_count, leaser
        from job_queue_v2
        where id = $1
        for update
        "#,
    )
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(QueueError::NotFound)?;

    let held_by: Option<String> = row.try_get("leaser")?;
    if held_by.as_deref() != Some(leaser_id) {
        return Err(QueueError::LeaseStolen {
            job_id,
            leaser: leaser_id.to_string(),
        });
    }

    let task_type: String = row.try_get("task_type")?;
    let payload: Value = row.try_get("payload")?;
    let retry_count: i32 = row.try_get("retry_count")?;

    requeue_or_dead_letter(&mut tx, job_id, &task_type, payload, retry_count, caps).await?;

    tx.commit().await?;
    Ok(())
}

/// Return expired in-progress jobs to pending (or dead-letter past cap).
/// Runs as a background cycle; cadence must stay at or below the minimum
/// lease duration. Returns the number of reclaimed leases.
pub async fn reclaim_expired_leases(pool: &PgPool, caps: &RetryCaps) -> QueueResult<u64> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        select id, task_type, payload, retry_count
        from job_queue_v2
        where leaser is not null
          and lease_expiry < now()
        order by lease_expiry asc
        limit 100
        for update skip locked
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut reclaimed = 0u64;
    for row in rows {
        let id: Uuid = row.try_get("id")?;
        let task_type: String = row.try_get("task_type")?;
        let payload: Value = row.try_get("payload")?;
        let retry_count: i32 = row.try_get("retry_count")?;

        requeue_or_dead_letter(&mut tx, id, &task_type, payload, retry_count, caps).await?;
        reclaimed += 1;
    }

    tx.commit().await?;
    Ok(reclaimed)
}

/// Shared failure path: requeue with `retry_count + 1`, or move the row
/// under the reserved dead-letter type once the cap is exceeded. The
/// original type and payload survive inside the dead-letter envelope.
async fn requeue_or_dead_letter(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    task_type: &str,
    payload: Value,
    retry_count: i32,
    caps: &RetryCaps,
) -> QueueResult<()> {
    let next_retry = retry_count + 1;
    if task_type != DEAD_LETTER_TASK_TYPE && next_retry > caps.cap_for(task_type) {
        warn!(job_id = %job_id, task_type = %task_type, retries = next_retry, "job dead-lettered");
        let envelope = serde_json::json!({
            "task_type": task_type,
            "payload": payload,
        });
        sqlx::query(
            r#"
            update job_queue_v2
               set task_type = $2,
                   payload = $3,
                   retry_count = $4,
                   leaser = null,
                   lease_expiry = null
             where id = $1
            "#,
        )
        .bind(job_id)
        .bind(DEAD_LETTER_TASK_TYPE)
        .bind(&envelope)
        .bind(next_retry)
        .execute(&mut **tx)
        .await?;
    } else {
        sqlx::query(
            r#"
            update job_queue_v2
               set retry_count = $2,
                   leaser = null,
                   lease_expiry = null
             where id = $1
            "#,
        )
        .bind(job_id)
        .bind(next_retry)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Cancel a job that has not been leased yet. A leased job cannot be
/// cancelled out from under its worker; callers see `LeaseStolen` and can
/// retry after the lease lapses.
pub async fn cancel_pending_job(pool: &PgPool, job_id: Uuid) -> QueueResult<()> {
    let res = sqlx::query("delete from job_queue_v2 where id = $1 and leaser is null")
        .bind(job_id)
        .execute(pool)
        .await?;

    if res.rows_affected() == 1 {
        return Ok(());
    }
    lease_guard_failure(pool, job_id, "cancel").await
}

/// Distinguish "job gone" from "job held by someone else" after a guarded
/// mutation matched zero rows.
async fn lease_guard_failure(pool: &PgPool, job_id: Uuid, leaser_id: &str) -> QueueResult<()> {
    let exists: Option<(Option<String>,)> =
        sqlx::query_as("select leaser from job_queue_v2 where id = $1")
            .bind(job_id)
            .fetch_optional(pool)
            .await?;

    match exists {
        None => Err(QueueError::NotFound),
        Some(_) => Err(QueueError::LeaseStolen {
            job_id,
            leaser: leaser_id.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

/// Pending jobs ordered by creation; `cursor` is the last-seen `created_at`.
pub async fn pending_jobs(
    pool: &PgPool,
    cursor: Option<DateTime<Utc>>,
    limit: i64,
) -> QueueResult<Vec<Job>> {
    list_jobs(pool, false, cursor, limit).await
}

/// In-progress (leased) jobs ordered by creation.
pub async fn in_progress_jobs(
    pool: &PgPool,
    cursor: Option<DateTime<Utc>>,
    limit: i64,
) -> QueueResult<Vec<Job>> {
    list_jobs(pool, true, cursor, limit).await
}

async fn list_jobs(
    pool: &PgPool,
    leased: bool,
    cursor: Option<DateTime<Utc>>,
    limit: i64,
) -> QueueResult<Vec<Job>> {
    let rows = sqlx::query(
        r#"
        select id, task_type, payload, scheduled_for, valid_until,
               created_at, retry_count, leaser, lease_expiry
        from job_queue_v2
        where (leaser is not null) = $1
          and ($2::timestamptz is null or created_at > $2)
        order by created_at asc
        limit $3
        "#,
    )
    .bind(leased)
    .bind(cursor)
    .bind(limit.clamp(1, 1_000))
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> QueueResult<Job> {
    Ok(Job {
        id: row.try_get("id")?,
        task_type: row.try_get("task_type")?,
        payload: row.try_get("payload")?,
        scheduled_for: row.try_get("scheduled_for")?,
        valid_until: row.try_get("valid_until")?,
        created_at: row.try_get("created_at")?,
        retry_count: row.try_get("retry_count")?,
        leaser: row.try_get("leaser")?,
        lease_expiry: row.try_get("lease_expiry")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_default_and_overrides() {
        let caps = RetryCaps::default();
        assert_eq!(caps.cap_for("github-comment-llm"), 3);
        assert_eq!(caps.cap_for("telegram-message"), 5);

        let caps = RetryCaps::new(2).with_cap("vectorize", 7);
        assert_eq!(caps.cap_for("vectorize"), 7);
        assert_eq!(caps.cap_for("anything-else"), 2);
    }

    #[test]
    fn reserved_task_type_is_refused_on_create() {
        let req = NewJob {
            id: None,
            task_type: DEAD_LETTER_TASK_TYPE.to_string(),
            payload: serde_json::json!({}),
            scheduled_for: None,
            valid_until: None,
        };
        assert!(matches!(
            validate_new_job(&req),
            Err(QueueError::Invalid { field: "task_type", .. })
        ));
    }
}
