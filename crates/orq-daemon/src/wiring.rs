//! Background wiring: reconciliation cycles, lease reclamation and worker
//! drivers, all registered on the daemon's routine pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use orq_queue::RetryCaps;
use orq_reconcile::{CycleConfig, CycleDeps, HttpBackendClient};
use orq_routines::LoopSpec;
use orq_workers::{GithubConfig, GithubWatcher, RepoRef, TelegramPoller, WorkerConfig};

use crate::state::AppState;

pub const ROUTINE_LEASE_RECLAIM: &str = "lease_reclaim";

/// Register every background loop. Idempotent per key by construction of
/// the routine pool.
pub fn register_background(st: &Arc<AppState>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let cycle_interval = Duration::from_secs(st.config.cycle_interval_secs);

    // Reconciliation cycles + download worker.
    let client = Arc::new(
        HttpBackendClient::new(Duration::from_secs(st.config.backend_dial_timeout_secs))
            .context("build backend client")?,
    );
    orq_reconcile::register_cycles(
        &st.routines,
        shutdown.clone(),
        CycleDeps {
            pool: st.pool.clone(),
            state: st.runtime.clone(),
            bus: st.bus.clone(),
            client,
            caps: RetryCaps::default(),
        },
        CycleConfig {
            interval: cycle_interval,
            ..CycleConfig::default()
        },
    );

    // Lease-expiry reclamation. Cadence stays at or below the minimum
    // lease duration handed out anywhere in the system.
    {
        let pool = st.pool.clone();
        let caps = RetryCaps::default();
        st.routines.start_loop(
            shutdown.clone(),
            LoopSpec {
                key: ROUTINE_LEASE_RECLAIM.to_string(),
                threshold: 3,
                reset_timeout: Duration::from_secs(10),
                interval: Duration::from_secs(st.config.lease_reclaim_secs),
            },
            move || {
                let pool = pool.clone();
                let caps = caps.clone();
                async move {
                    orq_queue::reclaim_expired_leases(&pool, &caps).await?;
                    Ok(())
                }
            },
        );
    }

    let worker_cfg = WorkerConfig {
        poll_interval: cycle_interval,
        ..WorkerConfig::default()
    };

    // Vectorization producer is always on; the GitHub and Telegram drivers
    // start only when configured.
    orq_workers::register_vectorize(
        &st.routines,
        shutdown.clone(),
        &worker_cfg,
        st.pool.clone(),
    );

    if let Some(github) = github_config_from_env() {
        info!(repos = github.repos.len(), "github worker enabled");
        let watcher = Arc::new(GithubWatcher::new(reqwest::Client::new(), github));
        orq_workers::register_github(
            &st.routines,
            shutdown.clone(),
            &worker_cfg,
            watcher,
            st.pool.clone(),
            Arc::clone(&st.dispatch),
            Arc::clone(&st.engine),
        );
    }

    if let Ok(bot_token) = std::env::var("telegram_bot_token") {
        if !bot_token.is_empty() {
            info!("telegram worker enabled");
            let poller = Arc::new(TelegramPoller::new(reqwest::Client::new(), bot_token));
            orq_workers::register_telegram(
                &st.routines,
                shutdown,
                &worker_cfg,
                poller,
                st.pool.clone(),
                Arc::clone(&st.dispatch),
                Arc::clone(&st.engine),
            );
        }
    }

    Ok(())
}

/// `github_repos=owner/repo,owner/other` plus optional `github_token`.
fn github_config_from_env() -> Option<GithubConfig> {
    let raw = std::env::var("github_repos").ok()?;
    let repos: Vec<RepoRef> = raw
        .split(',')
        .filter_map(|pair| {
            let (owner, repo) = pair.trim().split_once('/')?;
            Some(RepoRef {
                owner: owner.to_string(),
                repo: repo.to_string(),
            })
        })
        .collect();
    if repos.is_empty() {
        return None;
    }
    Some(GithubConfig::new(repos, std::env::var("github_token").ok()))
}
