//! Hook registry and built-in hooks.
//!
//! A hook is a named extension invoked from a task: it reads and writes
//! context slots and returns the transition label for the engine to follow.
//! Registration is by plain string name so deployments can add hooks
//! without touching the engine.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::context::ChainContext;

pub const LABEL_OK: &str = "ok";

#[async_trait]
pub trait Hook: Send + Sync {
    /// Run against the chain context; returns the transition label.
    async fn call(&self, ctx: &mut ChainContext) -> Result<String>;
}

/// Persists conversation history somewhere durable. The daemon backs this
/// with the event store; tests use a no-op.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn persist(&self, chain_id: &str, request_id: &str, messages: &Value) -> Result<()>;
}

/// Vector-store lookup seam. The store itself is an external collaborator;
/// hooks only need "query in, ranked results out".
#[async_trait]
pub trait VectorSearcher: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, hook: Arc<dyn Hook>) {
        self.hooks.insert(name.to_string(), hook);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Hook>> {
        self.hooks.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hooks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registry with every built-in hook wired against the given seams.
    pub fn with_builtins(
        messages: Arc<dyn MessageStore>,
        searcher: Arc<dyn VectorSearcher>,
        http: reqwest::Client,
    ) -> Self {
        let mut reg = Self::new();
        reg.register("echo", Arc::new(EchoHook));
        reg.register("print", Arc::new(PrintHook));
        reg.register("help", Arc::new(HelpHook));
        reg.register("append_user_message", Arc::new(AppendUserMessageHook));
        reg.register(
            "convert_openai_to_history",
            Arc::new(ConvertOpenaiToHistoryHook),
        );
        reg.register(
            "persist_messages",
            Arc::new(PersistMessagesHook { store: messages }),
        );
        reg.register(
            "vector_search",
            Arc::new(VectorSearchHook {
                searcher: Arc::clone(&searcher),
                as_text: false,
            }),
        );
        reg.register(
            "search_knowledge",
            Arc::new(VectorSearchHook {
                searcher,
                as_text: true,
            }),
        );
        reg.register("webhook", Arc::new(WebhookHook { http }));
        reg
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

/// Copies the input slot into the output slot.
pub struct EchoHook;

#[async_trait]
impl Hook for EchoHook {
    async fn call(&self, ctx: &mut ChainContext) -> Result<String> {
        let input = ctx.get("input").cloned().unwrap_or(Value::Null);
        ctx.set("output", input);
        Ok(LABEL_OK.to_string())
    }
}

/// Logs the input slot.
pub struct PrintHook;

#[async_trait]
impl Hook for PrintHook {
    async fn call(&self, ctx: &mut ChainContext) -> Result<String> {
        let input = ctx.get("input").cloned().unwrap_or(Value::Null);
        info!(chain_id = %ctx.chain_id, input = %input, "print hook");
        Ok(LABEL_OK.to_string())
    }
}

/// Writes the registry's usage summary into the output slot.
pub struct HelpHook;

#[async_trait]
impl Hook for HelpHook {
    async fn call(&self, ctx: &mut ChainContext) -> Result<String> {
        ctx.set(
            "output",
            json!(
                "commands: echo <text>, help, search <query>; \
                 anything else is answered by the configured chat model"
            ),
        );
        Ok(LABEL_OK.to_string())
    }
}

/// Appends the input text to the conversation history slot.
pub struct AppendUserMessageHook;

#[async_trait]
impl Hook for AppendUserMessageHook {
    async fn call(&self, ctx: &mut ChainContext) -> Result<String> {
        let text = ctx
            .get("input")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("append_user_message requires a text input slot"))?
            .to_string();

        let mut history = match ctx.get("history") {
            Some(Value::Array(arr)) => arr.clone(),
            _ => Vec::new(),
        };
        history.push(json!({"role": "user", "content": text}));
        ctx.set("history", Value::Array(history));
        Ok(LABEL_OK.to_string())
    }
}

/// Converts an OpenAI-style request body (`{"messages": [...]}`) in the
/// `openai_request` slot into the engine's history slot.
pub struct ConvertOpenaiToHistoryHook;

#[async_trait]
impl Hook for ConvertOpenaiToHistoryHook {
    async fn call(&self, ctx: &mut ChainContext) -> Result<String> {
        let req = ctx
            .get("openai_request")
            .cloned()
            .ok_or_else(|| anyhow!("convert_openai_to_history requires the openai_request slot"))?;

        let messages = req
            .get("messages")
            .and_then(|m| m.as_array())
            .ok_or_else(|| anyhow!("openai_request has no messages array"))?;

        let history: Vec<Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.get("role").cloned().unwrap_or(json!("user")),
                    "content": m.get("content").cloned().unwrap_or(json!("")),
                })
            })
            .collect();

        ctx.set("history", Value::Array(history));
        Ok(LABEL_OK.to_string())
    }
}

/// Persists the history slot through the [`MessageStore`] seam.
pub struct PersistMessagesHook {
    pub store: Arc<dyn MessageStore>,
}

#[async_trait]
impl Hook for PersistMessagesHook {
    async fn call(&self, ctx: &mut ChainContext) -> Result<String> {
        let history = ctx.get("history").cloned().unwrap_or(json!([]));
        self.store
            .persist(&ctx.chain_id, &ctx.request_id.to_string(), &history)
            .await
            .context("persist_messages failed")?;
        Ok(LABEL_OK.to_string())
    }
}

/// Vector search over the input slot. With `as_text`, formats the ranked
/// chunks into a plain-text block usable as model context.
pub struct VectorSearchHook {
    pub searcher: Arc<dyn VectorSearcher>,
    pub as_text: bool,
}

#[async_trait]
impl Hook for VectorSearchHook {
    async fn call(&self, ctx: &mut ChainContext) -> Result<String> {
        let query = ctx
            .get("input")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("vector search requires a text input slot"))?
            .to_string();
        let top_k = ctx
            .get("top_k")
            .and_then(|v| v.as_u64())
            .unwrap_or(5) as usize;

        let results = self.searcher.search(&query, top_k).await?;

        if self.as_text {
            let text = results
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|r| r.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n---\n")
                })
                .unwrap_or_default();
            ctx.set("knowledge", json!(text));
        } else {
            ctx.set("search_results", results);
        }
        Ok(LABEL_OK.to_string())
    }
}

/// POSTs the output slot to the URL in the `webhook_url` slot.
pub struct WebhookHook {
    pub http: reqwest::Client,
}

#[async_trait]
impl Hook for WebhookHook {
    async fn call(&self, ctx: &mut ChainContext) -> Result<String> {
        let url = ctx
            .get("webhook_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("webhook requires the webhook_url slot"))?
            .to_string();
        let body = ctx.get("output").cloned().unwrap_or(Value::Null);

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("webhook POST {url} failed"))?;

        if !resp.status().is_success() {
            return Err(anyhow!("webhook {url} returned {}", resp.status()));
        }
        Ok(LABEL_OK.to_string())
    }
}

// ---------------------------------------------------------------------------
// Test/no-op seams
// ---------------------------------------------------------------------------

/// MessageStore that drops everything; for tests and chains that never
/// persist.
pub struct NoopMessageStore;

#[async_trait]
impl MessageStore for NoopMessageStore {
    async fn persist(&self, _chain_id: &str, _request_id: &str, _messages: &Value) -> Result<()> {
        Ok(())
    }
}

/// Searcher that returns no hits.
pub struct NoopSearcher;

#[async_trait]
impl VectorSearcher for NoopSearcher {
    async fn search(&self, _query: &str, _top_k: usize) -> Result<Value> {
        Ok(json!([]))
    }
}
