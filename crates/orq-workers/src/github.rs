//! Pull-style GitHub driver.
//!
//! `receive_tick` polls configured repositories for issue/PR comments past
//! the persisted watermark, captures each as a raw event, and enqueues a
//! `github-comment-llm` job with a derived id so re-polled comments do not
//! duplicate. `process_tick` drains those jobs through the task engine.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use orq_dispatch::{Dispatch, RequestCtx};
use orq_schemas::{Capability, ChainDefinition, TaskDef, TaskKind, Transition, TERM_END, TERM_ERROR_END};
use orq_tasks::{ChainContext, ChainStatus, TaskEngine};

pub const TASK_TYPE_GITHUB_COMMENT: &str = "github-comment-llm";
pub const GITHUB_WORKER_ID: &str = "github-comment-worker";
pub const GITHUB_CHAIN_ID: &str = "github-comment";

const WATERMARK_KEY: &str = "github-comments";

#[derive(Debug, Clone)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone)]
pub struct GithubConfig {
    pub api_base: String,
    pub repos: Vec<RepoRef>,
    pub token: Option<String>,
}

impl GithubConfig {
    pub fn new(repos: Vec<RepoRef>, token: Option<String>) -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            repos,
            token,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub id: i64,
    #[serde(default)]
    pub body: String,
    pub user: CommentUser,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentUser {
    pub login: String,
}

/// Deterministic job id per (repo, comment, revision): an edited comment is
/// a new revision and re-enqueues; an unchanged one collapses.
pub fn comment_job_id(repo: &RepoRef, comment: &Comment) -> Uuid {
    let seed = format!(
        "github-comment|{}/{}|{}|{}",
        repo.owner,
        repo.repo,
        comment.id,
        comment.updated_at.timestamp_millis()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes())
}

/// Payload shape handed to the processing side.
pub fn comment_job_payload(repo: &RepoRef, comment: &Comment) -> serde_json::Value {
    json!({
        "owner": repo.owner,
        "repo": repo.repo,
        "comment_id": comment.id,
        "author": comment.user.login,
        "body": comment.body,
        "html_url": comment.html_url,
    })
}

pub struct GithubWatcher {
    http: reqwest::Client,
    cfg: GithubConfig,
}

impl GithubWatcher {
    pub fn new(http: reqwest::Client, cfg: GithubConfig) -> Self {
        Self { http, cfg }
    }

    /// Poll all repos for comments newer than the watermark; returns how
    /// many jobs were enqueued.
    pub async fn receive_tick(&self, pool: &PgPool) -> Result<u64> {
        let wm = orq_db::load_watermark(pool, WATERMARK_KEY).await?;
        let since = wm.watermark.unwrap_or_else(|| Utc::now() - chrono::Duration::hours(1));
        let mut newest = since;
        let mut enqueued = 0u64;

        for repo in &self.cfg.repos {
            let comments = self.fetch_comments(repo, since).await?;
            for comment in comments {
                if comment.updated_at > newest {
                    newest = comment.updated_at;
                }

                orq_events::append_raw_event(
                    pool,
                    orq_events::NewRawEvent {
                        path: format!("/repos/{}/{}/comments", repo.owner, repo.repo),
                        headers: json!({"x-orq-source": "github-poll"}),
                        payload: Some(comment_job_payload(repo, &comment)),
                    },
                )
                .await?;

                let job = orq_queue::NewJob {
                    id: Some(comment_job_id(repo, &comment)),
                    task_type: TASK_TYPE_GITHUB_COMMENT.to_string(),
                    payload: comment_job_payload(repo, &comment),
                    scheduled_for: None,
                    valid_until: None,
                };
                if orq_queue::create_job_if_absent(pool, &job).await? {
                    enqueued += 1;
                }
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

        if enqueued > 0 {
            info!(enqueued, "github comments enqueued");
        }
        Ok(enqueued)
    }

    async fn fetch_comments(&self, repo: &RepoRef, since: DateTime<Utc>) -> Result<Vec<Comment>> {
        let url = format!(
            "{}/repos/{}/{}/issues/comments",
            self.cfg.api_base, repo.owner, repo.repo
        );
        let mut req = self
            .http
            .get(&url)
            .header("User-Agent", "orq-daemon")
            .header("Accept", "application/vnd.github+json")
            .query(&[("since", since.to_rfc3339()), ("per_page", "100".to_string())]);
        if let Some(token) = &self.cfg.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.with_context(|| format!("dial {url}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("{url} returned {}", resp.status());
        }
        resp.json().await.with_context(|| format!("decode {url}"))
    }
}

/// Drain one `github-comment-llm` job through the task engine.
pub async fn process_tick(
    pool: &PgPool,
    dispatch: &dyn Dispatch,
    engine: &TaskEngine,
) -> Result<bool> {
    let ctx = RequestCtx::for_worker(GITHUB_WORKER_ID);
    let job = match dispatch
        .assign_pending_job(
            &ctx,
            GITHUB_WORKER_ID,
            chrono::Duration::minutes(5),
            &[TASK_TYPE_GITHUB_COMMENT],
        )
        .await
    {
        Ok(job) => job,
        Err(orq_dispatch::DispatchError::Queue(orq_queue::QueueError::NoJob)) => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let chain = match orq_db::get_chain(pool, GITHUB_CHAIN_ID).await {
        Ok(def) => def,
        Err(orq_db::StoreError::NotFound(_)) => default_comment_chain(),
        Err(e) => return Err(e.into()),
    };

    let body = job.payload["body"].as_str().unwrap_or_default().to_string();
    let mut chain_ctx = ChainContext::with_input(ctx.request_id, &chain.id, json!(body));
    chain_ctx.set("github", job.payload.clone());

    match engine.execute(&chain, chain_ctx).await {
        Ok(outcome) if outcome.status == ChainStatus::Completed => {
            dispatch.mark_job_done(&ctx, job.id, GITHUB_WORKER_ID).await?;
        }
        Ok(_) | Err(_) => {
            warn!(job_id = %job.id, "github comment chain failed; job requeued");
            dispatch
                .mark_job_failed(&ctx, job.id, GITHUB_WORKER_ID)
                .await?;
        }
    }
    Ok(true)
}

/// Fallback chain when no `github-comment` chain has been configured:
/// answer the comment with the task model, degrade to echo on error.
pub fn default_comment_chain() -> ChainDefinition {
    ChainDefinition {
        id: GITHUB_CHAIN_ID.to_string(),
        description: "answer repository comments".to_string(),
        tasks: vec![
            TaskDef {
                id: "answer".to_string(),
                kind: TaskKind::Model,
                input: None,
                hook: None,
                prompt_template: Some(
                    "You are a repository assistant. Reply to this comment:\n{{input}}".to_string(),
                ),
                capability: Some(Capability::Chat),
                model_names: vec![],
                transitions: vec![
                    Transition {
                        on: "ok".to_string(),
                        next: TERM_END.to_string(),
                    },
                    Transition {
                        on: "error".to_string(),
                        next: "fallback".to_string(),
                    },
                ],
            },
            TaskDef {
                id: "fallback".to_string(),
                kind: TaskKind::Hook,
                input: None,
                hook: Some("echo".to_string()),
                prompt_template: None,
                capability: None,
                model_names: vec![],
                transitions: vec![Transition {
                    on: "ok".to_string(),
                    next: TERM_ERROR_END.to_string(),
                }],
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(id: i64, updated_ms: i64) -> Comment {
        Comment {
            id,
            body: "ship it".to_string(),
            user: CommentUser {
                login: "octocat".to_string(),
            },
            html_url: "https://github.com/o/r/issues/1#issuecomment-1".to_string(),
            created_at: Utc::now(),
            updated_at: DateTime::from_timestamp_millis(updated_ms).unwrap_or_else(Utc::now),
        }
    }

    #[test]
    fn job_ids_dedupe_unedited_comments_and_split_revisions() {
        let repo = RepoRef {
            owner: "o".to_string(),
            repo: "r".to_string(),
        };
        let a = comment_job_id(&repo, &comment(1, 1_700_000_000_000));
        let b = comment_job_id(&repo, &comment(1, 1_700_000_000_000));
        let edited = comment_job_id(&repo, &comment(1, 1_700_000_999_000));

        assert_eq!(a, b);
        assert_ne!(a, edited, "an edited comment is a new revision");
    }

    #[test]
    fn default_chain_validates() {
        orq_tasks::validate_chain(&default_comment_chain()).expect("builtin chain is valid");
    }

    #[test]
    fn payload_carries_author_and_body() {
        let repo = RepoRef {
            owner: "o".to_string(),
            repo: "r".to_string(),
        };
        let p = comment_job_payload(&repo, &comment(7, 0));
        assert_eq!(p["comment_id"], json!(7));
        assert_eq!(p["author"], json!("octocat"));
        assert_eq!(p["body"], json!("ship it"));
    }
}
