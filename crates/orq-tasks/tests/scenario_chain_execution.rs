//! Chain execution scenarios against fake resolver/runner seams.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use orq_activity::Tracker;
use orq_resolver::{Provider, ResolveError, ResolveRequest, Selection};
use orq_schemas::{
    Capabilities, Capability, ChainDefinition, TaskDef, TaskKind, Transition, TERM_END,
    TERM_ERROR_END,
};
use orq_tasks::{
    AlertSink, ChainContext, ChainError, ChainStatus, HookRegistry, ModelRunner, NoopMessageStore,
    NoopSearcher, ResolveModel, TaskEngine,
};
use serde_json::json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FixedResolver;

#[async_trait]
impl ResolveModel for FixedResolver {
    async fn resolve(&self, req: &ResolveRequest) -> Result<Selection, ResolveError> {
        if req.capability == Capability::Embed {
            return Err(ResolveError::NoSatisfyingModel {
                capability: req.capability,
                context_length: req.context_length,
            });
        }
        let provider = Provider {
            model_name: "llama3:8b".to_string(),
            backend_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, b"b1"),
            backend_urls: vec!["http://b1:11434".to_string()],
            capabilities: Capabilities {
                can_chat: true,
                can_prompt: true,
                can_embed: false,
                can_stream: true,
                context_length: 8_192,
            },
        };
        Ok(Selection {
            backend_url: provider.backend_urls[0].clone(),
            provider,
        })
    }
}

struct EchoRunner;

#[async_trait]
impl ModelRunner for EchoRunner {
    async fn run_prompt(&self, _selection: &Selection, prompt: &str) -> Result<String> {
        Ok(format!("model says: {prompt}"))
    }
}

struct FailingRunner;

#[async_trait]
impl ModelRunner for FailingRunner {
    async fn run_prompt(&self, _selection: &Selection, _prompt: &str) -> Result<String> {
        Err(anyhow!("backend returned 500"))
    }
}

fn engine_with(runner: Arc<dyn ModelRunner>) -> (TaskEngine, Arc<AlertSink>) {
    let hooks = HookRegistry::with_builtins(
        Arc::new(NoopMessageStore),
        Arc::new(NoopSearcher),
        reqwest::Client::new(),
    );
    let alerts = AlertSink::new(16);
    let engine = TaskEngine::new(
        hooks,
        Arc::new(FixedResolver),
        runner,
        Tracker::default(),
        Arc::clone(&alerts),
    );
    (engine, alerts)
}

fn task(id: &str, kind: TaskKind, transitions: &[(&str, &str)]) -> TaskDef {
    TaskDef {
        id: id.to_string(),
        kind,
        input: None,
        hook: None,
        prompt_template: None,
        capability: None,
        model_names: vec![],
        transitions: transitions
            .iter()
            .map(|(on, next)| Transition {
                on: on.to_string(),
                next: next.to_string(),
            })
            .collect(),
    }
}

fn chain(id: &str, tasks: Vec<TaskDef>) -> ChainDefinition {
    ChainDefinition {
        id: id.to_string(),
        description: String::new(),
        tasks,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hook_then_model_chain_completes_in_order() {
    let (engine, _alerts) = engine_with(Arc::new(EchoRunner));

    let mut append = task("append", TaskKind::Hook, &[("ok", "answer")]);
    append.hook = Some("append_user_message".to_string());

    let mut answer = task("answer", TaskKind::Model, &[("ok", TERM_END)]);
    answer.prompt_template = Some("Answer: {{input}}".to_string());
    answer.capability = Some(Capability::Chat);

    let def = chain("chat", vec![append, answer]);
    let ctx = ChainContext::with_input(Uuid::new_v4(), "chat", json!("what is a lease?"));

    let outcome = engine.execute(&def, ctx).await.expect("chain completes");
    assert_eq!(outcome.status, ChainStatus::Completed);
    assert_eq!(outcome.steps, 2);
    assert_eq!(
        outcome.slots["output"],
        json!("model says: Answer: what is a lease?")
    );
    assert_eq!(outcome.slots["history"][0]["content"], json!("what is a lease?"));
    assert_eq!(outcome.slots["resolved_model"], json!("llama3:8b"));
}

#[tokio::test]
async fn task_failure_routes_through_error_transition() {
    let (engine, _alerts) = engine_with(Arc::new(FailingRunner));

    let mut ask = task(
        "ask",
        TaskKind::Model,
        &[("ok", TERM_END), ("error", "fallback")],
    );
    ask.prompt_template = Some("{{input}}".to_string());

    let mut fallback = task("fallback", TaskKind::Hook, &[("ok", TERM_ERROR_END)]);
    fallback.hook = Some("echo".to_string());

    let def = chain("degraded", vec![ask, fallback]);
    let ctx = ChainContext::with_input(Uuid::new_v4(), "degraded", json!("hi"));

    let outcome = engine.execute(&def, ctx).await.expect("handled failure");
    assert_eq!(outcome.status, ChainStatus::Failed);
    assert_eq!(outcome.slots["output"], json!("hi"), "fallback echoed input");
}

#[tokio::test]
async fn unhandled_failure_aborts_and_publishes_alert() {
    let (engine, alerts) = engine_with(Arc::new(EchoRunner));

    let def = chain(
        "fragile",
        vec![task("boom", TaskKind::RaiseError, &[("ok", TERM_END)])],
    );
    let ctx = ChainContext::new(Uuid::new_v4(), "fragile");

    let err = engine.execute(&def, ctx).await.unwrap_err();
    assert!(matches!(err, ChainError::Aborted { .. }));

    let recent = alerts.recent();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].chain_id, "fragile");
    assert_eq!(recent[0].task_id, "boom");
}

#[tokio::test]
async fn unknown_hook_is_rejected_before_any_task_runs() {
    let (engine, _alerts) = engine_with(Arc::new(EchoRunner));

    let mut first = task("first", TaskKind::Hook, &[("ok", "second")]);
    first.hook = Some("echo".to_string());
    let mut second = task("second", TaskKind::Hook, &[("ok", TERM_END)]);
    second.hook = Some("does-not-exist".to_string());

    let def = chain("broken", vec![first, second]);
    let ctx = ChainContext::new(Uuid::new_v4(), "broken");

    let err = engine.execute(&def, ctx).await.unwrap_err();
    assert!(matches!(err, ChainError::UnknownHook(name) if name == "does-not-exist"));
}

#[tokio::test]
async fn gated_cycle_is_bounded_by_the_step_budget() {
    let (engine, alerts) = engine_with(Arc::new(EchoRunner));

    // Valid per structural rules (the exit edge exists) but the label that
    // takes it never fires at runtime: echo always returns "ok".
    let mut looping = task(
        "loop",
        TaskKind::Hook,
        &[("ok", "loop"), ("done", TERM_END)],
    );
    looping.hook = Some("echo".to_string());

    let def = chain("livelock", vec![looping]);
    let ctx = ChainContext::with_input(Uuid::new_v4(), "livelock", json!("x"));

    let err = engine.execute(&def, ctx).await.unwrap_err();
    assert!(matches!(err, ChainError::StepBudgetExceeded { .. }));
    assert!(!alerts.recent().is_empty());
}

#[tokio::test]
async fn input_staging_copies_the_declared_slot() {
    let (engine, _alerts) = engine_with(Arc::new(EchoRunner));

    let mut echo = task("echo", TaskKind::Hook, &[("ok", TERM_END)]);
    echo.hook = Some("echo".to_string());
    echo.input = Some("question".to_string());

    let def = chain("staged", vec![echo]);
    let mut ctx = ChainContext::new(Uuid::new_v4(), "staged");
    ctx.set("question", json!("from a named slot"));

    let outcome = engine.execute(&def, ctx).await.expect("completes");
    assert_eq!(outcome.slots["output"], json!("from a named slot"));
}

#[tokio::test]
async fn convert_openai_request_then_persist() {
    let (engine, _alerts) = engine_with(Arc::new(EchoRunner));

    let mut convert = task("convert", TaskKind::Hook, &[("ok", "persist")]);
    convert.hook = Some("convert_openai_to_history".to_string());
    let mut persist = task("persist", TaskKind::Hook, &[("ok", TERM_END)]);
    persist.hook = Some("persist_messages".to_string());

    let def = chain("openai-bridge", vec![convert, persist]);
    let mut ctx = ChainContext::new(Uuid::new_v4(), "openai-bridge");
    ctx.set(
        "openai_request",
        json!({"messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hello"}
        ]}),
    );

    let outcome = engine.execute(&def, ctx).await.expect("completes");
    assert_eq!(outcome.slots["history"][1]["content"], json!("hello"));
}
