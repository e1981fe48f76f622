//! Worker drivers hosted on the routine pool: pull-style (GitHub),
//! queue-style (Telegram), and the vectorization producer.

pub mod github;
pub mod telegram;
pub mod vectorize;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;

use orq_dispatch::Dispatch;
use orq_routines::{LoopSpec, RoutinePool};
use orq_tasks::TaskEngine;

pub use github::{GithubConfig, GithubWatcher, RepoRef, TASK_TYPE_GITHUB_COMMENT};
pub use telegram::{TelegramPoller, TASK_TYPE_TELEGRAM_MESSAGE};
pub use vectorize::TASK_TYPE_VECTORIZE;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            threshold: 3,
            reset_timeout: Duration::from_secs(10),
        }
    }
}

fn spec(cfg: &WorkerConfig, key: &str) -> LoopSpec {
    LoopSpec {
        key: key.to_string(),
        threshold: cfg.threshold,
        reset_timeout: cfg.reset_timeout,
        interval: cfg.poll_interval,
    }
}

/// Register the GitHub receive and process loops.
pub fn register_github(
    routines: &RoutinePool,
    shutdown: watch::Receiver<bool>,
    cfg: &WorkerConfig,
    watcher: Arc<GithubWatcher>,
    pool: PgPool,
    dispatch: Arc<dyn Dispatch>,
    engine: Arc<TaskEngine>,
) {
    {
        let watcher = Arc::clone(&watcher);
        let pool = pool.clone();
        routines.start_loop(shutdown.clone(), spec(cfg, "github_receive"), move || {
            let watcher = Arc::clone(&watcher);
            let pool = pool.clone();
            async move {
                watcher.receive_tick(&pool).await?;
                Ok(())
            }
        });
    }
    routines.start_loop(shutdown, spec(cfg, "github_process"), move || {
        let pool = pool.clone();
        let dispatch = Arc::clone(&dispatch);
        let engine = Arc::clone(&engine);
        async move {
            // Drain the backlog within one tick.
            while github::process_tick(&pool, dispatch.as_ref(), &engine).await? {}
            Ok(())
        }
    });
}

/// Register the Telegram poll and worker loops.
pub fn register_telegram(
    routines: &RoutinePool,
    shutdown: watch::Receiver<bool>,
    cfg: &WorkerConfig,
    poller: Arc<TelegramPoller>,
    pool: PgPool,
    dispatch: Arc<dyn Dispatch>,
    engine: Arc<TaskEngine>,
) {
    {
        let poller = Arc::clone(&poller);
        let pool = pool.clone();
        routines.start_loop(shutdown.clone(), spec(cfg, "telegram_poll"), move || {
            let poller = Arc::clone(&poller);
            let pool = pool.clone();
            async move {
                poller.poll_tick(&pool).await?;
                Ok(())
            }
        });
    }
    routines.start_loop(shutdown, spec(cfg, "telegram_worker"), move || {
        let pool = pool.clone();
        let dispatch = Arc::clone(&dispatch);
        let engine = Arc::clone(&engine);
        let poller = Arc::clone(&poller);
        async move {
            while telegram::worker_tick(&pool, dispatch.as_ref(), &engine, &poller).await? {}
            Ok(())
        }
    });
}

/// Register the vectorization producer loop.
pub fn register_vectorize(
    routines: &RoutinePool,
    shutdown: watch::Receiver<bool>,
    cfg: &WorkerConfig,
    pool: PgPool,
) {
    routines.start_loop(shutdown, spec(cfg, "vectorize_produce"), move || {
        let pool = pool.clone();
        async move {
            vectorize::produce_tick(&pool).await?;
            Ok(())
        }
    });
}
