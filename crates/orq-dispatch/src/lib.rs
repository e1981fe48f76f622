//! Lease service API on top of the job queue.
//!
//! One trait, three layers, composed in a fixed order:
//! authorization → activity tracking → Postgres core. Handlers and worker
//! loops both talk to `Arc<dyn Dispatch>`; workers synthesise a fresh
//! request context per tick so their calls correlate in the logs exactly
//! like user requests do.
//!
//! The dispatcher mutates only on explicit client calls and on lease-expiry
//! reclamation, never on its own.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use orq_activity::Tracker;
use orq_queue::{NewJob, QueueError, RetryCaps};
use orq_schemas::Job;

// ---------------------------------------------------------------------------
// Request context & claims
// ---------------------------------------------------------------------------

/// Claims carried by the call context. The transport layer normalises
/// token sources (Authorization header vs cookie) into this before any
/// service sees the request.
#[derive(Debug, Clone)]
pub struct Claims {
    pub subject: String,
    pub authorized: bool,
}

impl Claims {
    pub fn authorized(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            authorized: true,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            subject: "anonymous".to_string(),
            authorized: false,
        }
    }
}

/// Per-call context: request id for correlation plus claims.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    pub request_id: Uuid,
    pub claims: Claims,
}

impl RequestCtx {
    pub fn new(claims: Claims) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            claims,
        }
    }

    /// Fresh context for a background tick, named after the worker.
    pub fn for_worker(worker_id: &str) -> Self {
        Self::new(Claims::authorized(worker_id))
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn create_job(&self, ctx: &RequestCtx, req: &NewJob) -> DispatchResult<Job>;

    async fn assign_pending_job(
        &self,
        ctx: &RequestCtx,
        leaser_id: &str,
        lease_duration: Duration,
        job_types: &[&str],
    ) -> DispatchResult<Job>;

    async fn mark_job_done(&self, ctx: &RequestCtx, job_id: Uuid, leaser_id: &str)
        -> DispatchResult<()>;

    async fn mark_job_failed(
        &self,
        ctx: &RequestCtx,
        job_id: Uuid,
        leaser_id: &str,
    ) -> DispatchResult<()>;

    async fn pending_jobs(
        &self,
        ctx: &RequestCtx,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DispatchResult<Vec<Job>>;

    async fn in_progress_jobs(
        &self,
        ctx: &RequestCtx,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DispatchResult<Vec<Job>>;
}

/// The standard composition: auth → activity → core.
pub fn build_dispatch(pool: PgPool, caps: RetryCaps, tracker: Tracker) -> Arc<dyn Dispatch> {
    Arc::new(AuthDispatch::new(TrackedDispatch::new(
        PgDispatch::new(pool, caps),
        tracker,
    )))
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

pub struct PgDispatch {
    pool: PgPool,
    caps: RetryCaps,
}

impl PgDispatch {
    pub fn new(pool: PgPool, caps: RetryCaps) -> Self {
        Self { pool, caps }
    }
}

#[async_trait]
impl Dispatch for PgDispatch {
    async fn create_job(&self, _ctx: &RequestCtx, req: &NewJob) -> DispatchResult<Job> {
        Ok(orq_queue::create_job(&self.pool, req).await?)
    }

    async fn assign_pending_job(
        &self,
        _ctx: &RequestCtx,
        leaser_id: &str,
        lease_duration: Duration,
        job_types: &[&str],
    ) -> DispatchResult<Job> {
        Ok(orq_queue::assign_pending_job(&self.pool, leaser_id, lease_duration, job_types).await?)
    }

    async fn mark_job_done(
        &self,
        _ctx: &RequestCtx,
        job_id: Uuid,
        leaser_id: &str,
    ) -> DispatchResult<()> {
        Ok(orq_queue::mark_job_done(&self.pool, job_id, leaser_id).await?)
    }

    async fn mark_job_failed(
        &self,
        _ctx: &RequestCtx,
        job_id: Uuid,
        leaser_id: &str,
    ) -> DispatchResult<()> {
        Ok(orq_queue::mark_job_failed(&self.pool, job_id, leaser_id, &self.caps).await?)
    }

    async fn pending_jobs(
        &self,
        _ctx: &RequestCtx,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DispatchResult<Vec<Job>> {
        Ok(orq_queue::pending_jobs(&self.pool, cursor, limit).await?)
    }

    async fn in_progress_jobs(
        &self,
        _ctx: &RequestCtx,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DispatchResult<Vec<Job>> {
        Ok(orq_queue::in_progress_jobs(&self.pool, cursor, limit).await?)
    }
}

// ---------------------------------------------------------------------------
// Activity decorator
// ---------------------------------------------------------------------------

pub struct TrackedDispatch<D> {
    inner: D,
    tracker: Tracker,
}

impl<D> TrackedDispatch<D> {
    pub fn new(inner: D, tracker: Tracker) -> Self {
        Self { inner, tracker }
    }
}

#[async_trait]
impl<D: Dispatch> Dispatch for TrackedDispatch<D> {
    async fn create_job(&self, ctx: &RequestCtx, req: &NewJob) -> DispatchResult<Job> {
        let span = self.tracker.start(ctx.request_id, "create_job", "job");
        match self.inner.create_job(ctx, req).await {
            Ok(job) => {
                span.succeeded(
                    &job.id.to_string(),
                    serde_json::json!({"task_type": job.task_type}),
                );
                Ok(job)
            }
            Err(e) => {
                span.failed(&e);
                Err(e)
            }
        }
    }

    async fn assign_pending_job(
        &self,
        ctx: &RequestCtx,
        leaser_id: &str,
        lease_duration: Duration,
        job_types: &[&str],
    ) -> DispatchResult<Job> {
        let span = self.tracker.start(ctx.request_id, "assign_pending_job", "job");
        match self
            .inner
            .assign_pending_job(ctx, leaser_id, lease_duration, job_types)
            .await
        {
            Ok(job) => {
                span.succeeded(
                    &job.id.to_string(),
                    serde_json::json!({"leaser": leaser_id, "task_type": job.task_type}),
                );
                Ok(job)
            }
            Err(e) => {
                // An empty queue is routine, not an incident; still recorded.
                span.failed(&e);
                Err(e)
            }
        }
    }

    async fn mark_job_done(
        &self,
        ctx: &RequestCtx,
        job_id: Uuid,
        leaser_id: &str,
    ) -> DispatchResult<()> {
        let span = self.tracker.start(ctx.request_id, "mark_job_done", "job");
        match self.inner.mark_job_done(ctx, job_id, leaser_id).await {
            Ok(()) => {
                span.succeeded(&job_id.to_string(), serde_json::json!({"leaser": leaser_id}));
                Ok(())
            }
            Err(e) => {
                span.failed(&e);
                Err(e)
            }
        }
    }

    async fn mark_job_failed(
        &self,
        ctx: &RequestCtx,
        job_id: Uuid,
        leaser_id: &str,
    ) -> DispatchResult<()> {
        let span = self.tracker.start(ctx.request_id, "mark_job_failed", "job");
        match self.inner.mark_job_failed(ctx, job_id, leaser_id).await {
            Ok(()) => {
                span.succeeded(&job_id.to_string(), serde_json::json!({"leaser": leaser_id}));
                Ok(())
            }
            Err(e) => {
                span.failed(&e);
                Err(e)
            }
        }
    }

    async fn pending_jobs(
        &self,
        ctx: &RequestCtx,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DispatchResult<Vec<Job>> {
        // Read path: not tracked, reads are not activity.
        self.inner.pending_jobs(ctx, cursor, limit).await
    }

    async fn in_progress_jobs(
        &self,
        ctx: &RequestCtx,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DispatchResult<Vec<Job>> {
        self.inner.in_progress_jobs(ctx, cursor, limit).await
    }
}

// ---------------------------------------------------------------------------
// Authorization decorator
// ---------------------------------------------------------------------------

/// Outermost layer: refuses unauthorized claims before anything runs.
/// Authorization failures are never retried downstream.
pub struct AuthDispatch<D> {
    inner: D,
}

impl<D> AuthDispatch<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }
}

fn authorize(ctx: &RequestCtx) -> DispatchResult<()> {
    if ctx.claims.authorized {
        Ok(())
    } else {
        Err(DispatchError::Unauthorized)
    }
}

#[async_trait]
impl<D: Dispatch> Dispatch for AuthDispatch<D> {
    async fn create_job(&self, ctx: &RequestCtx, req: &NewJob) -> DispatchResult<Job> {
        authorize(ctx)?;
        self.inner.create_job(ctx, req).await
    }

    async fn assign_pending_job(
        &self,
        ctx: &RequestCtx,
        leaser_id: &str,
        lease_duration: Duration,
        job_types: &[&str],
    ) -> DispatchResult<Job> {
        authorize(ctx)?;
        self.inner
            .assign_pending_job(ctx, leaser_id, lease_duration, job_types)
            .await
    }

    async fn mark_job_done(
        &self,
        ctx: &RequestCtx,
        job_id: Uuid,
        leaser_id: &str,
    ) -> DispatchResult<()> {
        authorize(ctx)?;
        self.inner.mark_job_done(ctx, job_id, leaser_id).await
    }

    async fn mark_job_failed(
        &self,
        ctx: &RequestCtx,
        job_id: Uuid,
        leaser_id: &str,
    ) -> DispatchResult<()> {
        authorize(ctx)?;
        self.inner.mark_job_failed(ctx, job_id, leaser_id).await
    }

    async fn pending_jobs(
        &self,
        ctx: &RequestCtx,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DispatchResult<Vec<Job>> {
        authorize(ctx)?;
        self.inner.pending_jobs(ctx, cursor, limit).await
    }

    async fn in_progress_jobs(
        &self,
        ctx: &RequestCtx,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DispatchResult<Vec<Job>> {
        authorize(ctx)?;
        self.inner.in_progress_jobs(ctx, cursor, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanicDispatch;

    #[async_trait]
    impl Dispatch for PanicDispatch {
        async fn create_job(&self, _ctx: &RequestCtx, _req: &NewJob) -> DispatchResult<Job> {
            panic!("must not be reached");
        }
        async fn assign_pending_job(
            &self,
            _ctx: &RequestCtx,
            _leaser_id: &str,
            _lease_duration: Duration,
            _job_types: &[&str],
        ) -> DispatchResult<Job> {
            panic!("must not be reached");
        }
        async fn mark_job_done(
            &self,
            _ctx: &RequestCtx,
            _job_id: Uuid,
            _leaser_id: &str,
        ) -> DispatchResult<()> {
            panic!("must not be reached");
        }
        async fn mark_job_failed(
            &self,
            _ctx: &RequestCtx,
            _job_id: Uuid,
            _leaser_id: &str,
        ) -> DispatchResult<()> {
            panic!("must not be reached");
        }
        async fn pending_jobs(
            &self,
            _ctx: &RequestCtx,
            _cursor: Option<DateTime<Utc>>,
            _limit: i64,
        ) -> DispatchResult<Vec<Job>> {
            panic!("must not be reached");
        }
        async fn in_progress_jobs(
            &self,
            _ctx: &RequestCtx,
            _cursor: Option<DateTime<Utc>>,
            _limit: i64,
        ) -> DispatchResult<Vec<Job>> {
            panic!("must not be reached");
        }
    }

    #[tokio::test]
    async fn unauthorized_claims_never_reach_the_core() {
        let d = AuthDispatch::new(PanicDispatch);
        let ctx = RequestCtx::new(Claims::anonymous());

        let err = d
            .create_job(
                &ctx,
                &NewJob {
                    id: None,
                    task_type: "t".to_string(),
                    payload: serde_json::json!({}),
                    scheduled_for: None,
                    valid_until: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unauthorized));

        let err = d.pending_jobs(&ctx, None, 10).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unauthorized));
    }
}
