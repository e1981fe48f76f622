//! The two reconciliation cycles and the download worker.
//!
//! - backend sync: poll every registered backend, diff declared vs observed
//!   models, refresh the runtime view.
//! - download: enqueue a `model_download` job for every declared-but-absent
//!   (backend, model) pair, deduplicated by a derived job id.
//! - download worker: drains those jobs, drives the pull, and publishes
//!   progress onto the bus.
//!
//! A `trigger_cycle` bus message force-triggers both cycles.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use orq_queue::RetryCaps;
use orq_routines::{LoopSpec, RoutinePool};
use orq_state::{Bus, BusMsg, DownloadStatus, RuntimeState};

use crate::client::BackendClient;

pub const ROUTINE_BACKEND_SYNC: &str = "backend_sync";
pub const ROUTINE_DOWNLOAD: &str = "model_download";
pub const ROUTINE_DOWNLOAD_WORKER: &str = "model_download_worker";
pub const TASK_TYPE_MODEL_DOWNLOAD: &str = "model_download";

const DOWNLOAD_LEASER: &str = "model-download-worker";

/// Namespace for deriving deterministic download-job ids.
const DOWNLOAD_JOB_NS: Uuid = Uuid::NAMESPACE_OID;

/// One job per (backend, model) pair: repeated enqueues derive the same id
/// and collapse on the primary key.
pub fn download_job_id(backend_id: Uuid, model: &str) -> Uuid {
    let seed = format!("model-download|{backend_id}|{model}");
    Uuid::new_v5(&DOWNLOAD_JOB_NS, seed.as_bytes())
}

#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub interval: Duration,
    pub threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            threshold: 3,
            reset_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared dependencies of both cycles.
#[derive(Clone)]
pub struct CycleDeps {
    pub pool: PgPool,
    pub state: RuntimeState,
    pub bus: Bus,
    pub client: Arc<dyn BackendClient>,
    pub caps: RetryCaps,
}

// ---------------------------------------------------------------------------
// Backend sync
// ---------------------------------------------------------------------------

/// One pass of the backend cycle. A backend that fails to dial gets its
/// error recorded in the view without losing previously observed models;
/// only store failures count against the cycle's breaker.
pub async fn backend_sync_once(deps: &CycleDeps) -> Result<()> {
    let backends = orq_db::list_backends(&deps.pool)
        .await
        .context("list backends")?;

    let known: Vec<Uuid> = backends.iter().map(|b| b.id).collect();
    deps.state.retain_backends(&known).await;

    for backend in backends {
        match deps.client.list_models(&backend.base_url).await {
            Ok(models) => {
                deps.state.record_poll(backend, models).await;
            }
            Err(err) => {
                warn!(backend = %backend.name, error = %err, "backend dial failed");
                deps.state
                    .record_poll_error(backend, format!("{err:#}"))
                    .await;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Download enqueue
// ---------------------------------------------------------------------------

/// One pass of the download cycle: enqueue a download job for every
/// declared model absent from its backend, skipping pairs already queued
/// or pulling.
pub async fn download_enqueue_once(deps: &CycleDeps) -> Result<()> {
    let views = deps.state.snapshot().await;

    for view in views.values() {
        if view.error.is_some() {
            // An unreachable backend cannot pull anything right now.
            continue;
        }

        let declared = orq_db::declared_models_for_backend(&deps.pool, view.backend.id)
            .await
            .context("declared models")?;

        for model in declared {
            if view.pulled_models.contains(&model) || view.pulling_models.contains(&model) {
                continue;
            }

            let job = orq_queue::NewJob {
                id: Some(download_job_id(view.backend.id, &model)),
                task_type: TASK_TYPE_MODEL_DOWNLOAD.to_string(),
                payload: serde_json::json!({
                    "backend_id": view.backend.id,
                    "backend_url": view.backend.base_url,
                    "model": model,
                }),
                scheduled_for: None,
                valid_until: None,
            };

            if orq_queue::create_job_if_absent(&deps.pool, &job)
                .await
                .context("enqueue model download")?
            {
                info!(backend = %view.backend.name, model = %model, "model download queued");
                deps.bus.publish(BusMsg::DownloadProgress {
                    backend_id: view.backend.id,
                    model: model.clone(),
                    status: DownloadStatus::Started,
                });
                deps.state
                    .record_download_progress(view.backend.id, &model, DownloadStatus::Started)
                    .await;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Download worker
// ---------------------------------------------------------------------------

/// Drain one download job, if any. The pull itself is long; the lease is
/// sized accordingly and the job requeues through normal retry handling on
/// failure.
pub async fn download_work_once(deps: &CycleDeps) -> Result<()> {
    let job = match orq_queue::assign_pending_job(
        &deps.pool,
        DOWNLOAD_LEASER,
        chrono::Duration::hours(2),
        &[TASK_TYPE_MODEL_DOWNLOAD],
    )
    .await
    {
        Ok(job) => job,
        Err(orq_queue::QueueError::NoJob) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let backend_id: Uuid = serde_json::from_value(job.payload["backend_id"].clone())
        .context("download payload backend_id")?;
    let backend_url = job.payload["backend_url"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let model = job.payload["model"].as_str().unwrap_or_default().to_string();

    deps.bus.publish(BusMsg::DownloadProgress {
        backend_id,
        model: model.clone(),
        status: DownloadStatus::InProgress,
    });

    match deps.client.pull_model(&backend_url, &model).await {
        Ok(()) => {
            info!(backend_id = %backend_id, model = %model, "model download completed");
            deps.state
                .record_download_progress(backend_id, &model, DownloadStatus::Completed)
                .await;
            deps.bus.publish(BusMsg::DownloadProgress {
                backend_id,
                model,
                status: DownloadStatus::Completed,
            });
            orq_queue::mark_job_done(&deps.pool, job.id, DOWNLOAD_LEASER).await?;
        }
        Err(err) => {
            warn!(backend_id = %backend_id, model = %model, error = %err, "model download failed");
            deps.state
                .record_download_progress(backend_id, &model, DownloadStatus::Failed)
                .await;
            deps.bus.publish(BusMsg::DownloadProgress {
                backend_id,
                model,
                status: DownloadStatus::Failed,
            });
            orq_queue::mark_job_failed(&deps.pool, job.id, DOWNLOAD_LEASER, &deps.caps).await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Start both cycles and the download worker on the routine pool, plus the
/// bus listener that force-triggers the cycles on `trigger_cycle`.
pub fn register_cycles(
    routines: &RoutinePool,
    shutdown: watch::Receiver<bool>,
    deps: CycleDeps,
    cfg: CycleConfig,
) {
    let spec = |key: &str| LoopSpec {
        key: key.to_string(),
        threshold: cfg.threshold,
        reset_timeout: cfg.reset_timeout,
        interval: cfg.interval,
    };

    {
        let deps = deps.clone();
        routines.start_loop(shutdown.clone(), spec(ROUTINE_BACKEND_SYNC), move || {
            let deps = deps.clone();
            async move { backend_sync_once(&deps).await }
        });
    }
    {
        let deps = deps.clone();
        routines.start_loop(shutdown.clone(), spec(ROUTINE_DOWNLOAD), move || {
            let deps = deps.clone();
            async move { download_enqueue_once(&deps).await }
        });
    }
    {
        let deps = deps.clone();
        routines.start_loop(shutdown.clone(), spec(ROUTINE_DOWNLOAD_WORKER), move || {
            let deps = deps.clone();
            async move { download_work_once(&deps).await }
        });
    }

    spawn_trigger_listener(routines.clone(), deps.bus, shutdown);
}

/// Force both cycles whenever `trigger_cycle` appears on the bus.
fn spawn_trigger_listener(routines: RoutinePool, bus: Bus, mut shutdown: watch::Receiver<bool>) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        Ok(BusMsg::TriggerCycle) => {
                            routines.force_update(ROUTINE_BACKEND_SYNC);
                            routines.force_update(ROUTINE_DOWNLOAD);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    });
}
