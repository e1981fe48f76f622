//! Queue-style Telegram driver.
//!
//! The poller fetches `getUpdates` deltas past the stored offset and
//! enqueues one `telegram-message` job per message; the worker leases jobs,
//! runs the chat chain, and sends the reply. Failed jobs requeue through
//! the queue's retry handling (cap 5 for this task type).

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use orq_dispatch::{Dispatch, RequestCtx};
use orq_schemas::{Capability, ChainDefinition, TaskDef, TaskKind, Transition, TERM_END};
use orq_tasks::{ChainContext, ChainStatus, TaskEngine};

pub const TASK_TYPE_TELEGRAM_MESSAGE: &str = "telegram-message";
pub const TELEGRAM_WORKER_ID: &str = "telegram-worker";
pub const TELEGRAM_CHAIN_ID: &str = "telegram-chat";

const WATERMARK_KEY: &str = "telegram-updates";

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

/// Next `getUpdates` offset after a batch: one past the highest update id,
/// or the current offset when the batch is empty.
pub fn next_offset(current: Option<i64>, updates: &[Update]) -> Option<i64> {
    updates
        .iter()
        .map(|u| u.update_id + 1)
        .max()
        .or(current)
}

/// Derived job id per update: Telegram redelivers un-acked updates, the id
/// collapses those into one job.
pub fn update_job_id(update_id: i64) -> Uuid {
    let seed = format!("telegram-update|{update_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes())
}

pub struct TelegramPoller {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramPoller {
    pub fn new(http: reqwest::Client, bot_token: String) -> Self {
        Self {
            http,
            api_base: "https://api.telegram.org".to_string(),
            bot_token,
        }
    }

    /// Override the API host (tests point this at a local stub).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.to_string();
        self
    }

    /// Fetch pending updates and enqueue text messages as jobs.
    pub async fn poll_tick(&self, pool: &PgPool) -> Result<u64> {
        let wm = orq_db::load_watermark(pool, WATERMARK_KEY).await?;
        let updates = self.fetch_updates(wm.offset_value).await?;

        let mut enqueued = 0u64;
        for update in &updates {
            let Some(message) = &update.message else {
                continue;
            };
            let Some(text) = &message.text else {
                continue;
            };

            let job = orq_queue::NewJob {
                id: Some(update_job_id(update.update_id)),
                task_type: TASK_TYPE_TELEGRAM_MESSAGE.to_string(),
                payload: json!({
                    "chat_id": message.chat.id,
                    "text": text,
                    "update_id": update.update_id,
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
                watermark: None,
                offset_value: next_offset(wm.offset_value, &updates),
            },
        )
        .await?;

        Ok(enqueued)
    }

    async fn fetch_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        let url = format!("{}/bot{}/getUpdates", self.api_base, self.bot_token);
        let mut req = self.http.get(&url).query(&[("timeout", "0")]);
        if let Some(offset) = offset {
            req = req.query(&[("offset", offset.to_string())]);
        }

        let resp = req.send().await.context("dial telegram getUpdates")?;
        if !resp.status().is_success() {
            anyhow::bail!("telegram getUpdates returned {}", resp.status());
        }
        let body: UpdatesResponse = resp.json().await.context("decode getUpdates")?;
        if !body.ok {
            anyhow::bail!("telegram getUpdates reported ok=false");
        }
        Ok(body.result)
    }

    /// Send the chain's answer back into the chat.
    pub async fn send_reply(&self, chat_id: i64, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let resp = self
            .http
            .post(&url)
            .json(&json!({"chat_id": chat_id, "text": text}))
            .send()
            .await
            .context("dial telegram sendMessage")?;
        if !resp.status().is_success() {
            anyhow::bail!("telegram sendMessage returned {}", resp.status());
        }
        Ok(())
    }
}

/// Drain one `telegram-message` job: run the chat chain, reply, complete.
pub async fn worker_tick(
    pool: &PgPool,
    dispatch: &dyn Dispatch,
    engine: &TaskEngine,
    poller: &TelegramPoller,
) -> Result<bool> {
    let ctx = RequestCtx::for_worker(TELEGRAM_WORKER_ID);
    let job = match dispatch
        .assign_pending_job(
            &ctx,
            TELEGRAM_WORKER_ID,
            chrono::Duration::minutes(2),
            &[TASK_TYPE_TELEGRAM_MESSAGE],
        )
        .await
    {
        Ok(job) => job,
        Err(orq_dispatch::DispatchError::Queue(orq_queue::QueueError::NoJob)) => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let chain = match orq_db::get_chain(pool, TELEGRAM_CHAIN_ID).await {
        Ok(def) => def,
        Err(orq_db::StoreError::NotFound(_)) => default_chat_chain(),
        Err(e) => return Err(e.into()),
    };

    let text = job.payload["text"].as_str().unwrap_or_default().to_string();
    let chat_id = job.payload["chat_id"].as_i64().unwrap_or_default();
    let chain_ctx = ChainContext::with_input(ctx.request_id, &chain.id, json!(text));

    let completed = match engine.execute(&chain, chain_ctx).await {
        Ok(outcome) if outcome.status == ChainStatus::Completed => {
            let answer = outcome
                .slots
                .get("output")
                .and_then(|v| v.as_str())
                .unwrap_or("(no answer)")
                .to_string();
            poller.send_reply(chat_id, &answer).await.is_ok()
        }
        Ok(_) => false,
        Err(err) => {
            warn!(job_id = %job.id, error = %err, "telegram chain failed");
            false
        }
    };

    if completed {
        dispatch
            .mark_job_done(&ctx, job.id, TELEGRAM_WORKER_ID)
            .await?;
    } else {
        dispatch
            .mark_job_failed(&ctx, job.id, TELEGRAM_WORKER_ID)
            .await?;
    }
    Ok(true)
}

/// Fallback chat chain: record the user message, answer with the chat
/// model, persist the exchange.
pub fn default_chat_chain() -> ChainDefinition {
    let transition = |on: &str, next: &str| Transition {
        on: on.to_string(),
        next: next.to_string(),
    };

    ChainDefinition {
        id: TELEGRAM_CHAIN_ID.to_string(),
        description: "answer chat messages".to_string(),
        tasks: vec![
            TaskDef {
                id: "append".to_string(),
                kind: TaskKind::Hook,
                input: None,
                hook: Some("append_user_message".to_string()),
                prompt_template: None,
                capability: None,
                model_names: vec![],
                transitions: vec![transition("ok", "answer")],
            },
            TaskDef {
                id: "answer".to_string(),
                kind: TaskKind::Model,
                input: None,
                hook: None,
                prompt_template: Some("{{input}}".to_string()),
                capability: Some(Capability::Chat),
                model_names: vec![],
                transitions: vec![transition("ok", "persist")],
            },
            TaskDef {
                id: "persist".to_string(),
                kind: TaskKind::Hook,
                input: None,
                hook: Some("persist_messages".to_string()),
                prompt_template: None,
                capability: None,
                model_names: vec![],
                transitions: vec![transition("ok", TERM_END)],
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: i64, text: Option<&str>) -> Update {
        Update {
            update_id: id,
            message: Some(Message {
                chat: Chat { id: 42 },
                text: text.map(|t| t.to_string()),
            }),
        }
    }

    #[test]
    fn offset_advances_past_the_highest_update() {
        assert_eq!(next_offset(None, &[]), None);
        assert_eq!(next_offset(Some(10), &[]), Some(10));
        assert_eq!(
            next_offset(Some(10), &[update(11, Some("a")), update(13, Some("b"))]),
            Some(14)
        );
    }

    #[test]
    fn redelivered_updates_share_a_job_id() {
        assert_eq!(update_job_id(5), update_job_id(5));
        assert_ne!(update_job_id(5), update_job_id(6));
    }

    #[test]
    fn default_chain_validates() {
        orq_tasks::validate_chain(&default_chat_chain()).expect("builtin chain is valid");
    }
}
