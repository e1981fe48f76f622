//! Chain executor.
//!
//! Tasks run in the order induced by transition labels from `tasks[0]`.
//! A task failure routes through its `error` transition when one exists;
//! otherwise the chain aborts, the error surfaces to the caller, and an
//! alert is published. Per-task activity events carry the chain id, task
//! id and elapsed time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use orq_activity::Tracker;
use orq_resolver::{ResolveError, ResolveRequest, Selection, SelectionPolicy};
use orq_schemas::{Capability, ChainDefinition, TaskDef, TaskKind, ON_ERROR, TERM_END, TERM_ERROR_END};

use crate::alerts::AlertSink;
use crate::context::ChainContext;
use crate::hooks::HookRegistry;
use crate::validate::validate_chain;
use crate::ChainError;

/// Runtime guard against gated cycles that never take their exit edge.
pub const MAX_STEPS: u32 = 256;

/// Resolver seam: the engine asks for a model, the daemon answers from the
/// live cluster view.
#[async_trait]
pub trait ResolveModel: Send + Sync {
    async fn resolve(&self, req: &ResolveRequest) -> Result<Selection, ResolveError>;
}

/// Client seam for prompt execution against the selected backend.
#[async_trait]
pub trait ModelRunner: Send + Sync {
    async fn run_prompt(&self, selection: &Selection, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// Reached the `end` terminal.
    Completed,
    /// Reached the `error-end` terminal via a handled error path.
    Failed,
}

#[derive(Debug)]
pub struct ChainOutcome {
    pub chain_id: String,
    pub status: ChainStatus,
    pub steps: u32,
    pub slots: HashMap<String, Value>,
}

pub struct TaskEngine {
    hooks: HookRegistry,
    resolver: Arc<dyn ResolveModel>,
    runner: Arc<dyn ModelRunner>,
    tracker: Tracker,
    alerts: Arc<AlertSink>,
}

impl TaskEngine {
    pub fn new(
        hooks: HookRegistry,
        resolver: Arc<dyn ResolveModel>,
        runner: Arc<dyn ModelRunner>,
        tracker: Tracker,
        alerts: Arc<AlertSink>,
    ) -> Self {
        Self {
            hooks,
            resolver,
            runner,
            tracker,
            alerts,
        }
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub async fn execute(
        &self,
        def: &ChainDefinition,
        mut ctx: ChainContext,
    ) -> Result<ChainOutcome, ChainError> {
        validate_chain(def)?;

        // Hook names must resolve before the first task runs; failing at
        // step N with a half-executed chain would be worse.
        for task in &def.tasks {
            if task.kind == TaskKind::Hook {
                let name = task.hook.as_deref().unwrap_or_default();
                if self.hooks.get(name).is_none() {
                    return Err(ChainError::UnknownHook(name.to_string()));
                }
            }
        }

        let by_id: HashMap<&str, &TaskDef> =
            def.tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        let mut current: &TaskDef = &def.tasks[0];
        let mut steps: u32 = 0;

        loop {
            steps += 1;
            if steps > MAX_STEPS {
                let msg = format!("chain exceeded {MAX_STEPS} steps at task {}", current.id);
                self.alerts.publish(&def.id, &current.id, msg.clone());
                return Err(ChainError::StepBudgetExceeded {
                    chain_id: def.id.clone(),
                    steps,
                });
            }

            let started = Instant::now();
            let span = self
                .tracker
                .start(ctx.request_id, &format!("chain:{}:{}", def.id, current.id), "chain_task");

            // Stage the task's declared input slot under the well-known name.
            if let Some(src) = &current.input {
                if src != "input" {
                    let staged = ctx.get(src).cloned().unwrap_or(Value::Null);
                    ctx.set("input", staged);
                }
            }

            let next = match self.run_task(current, &mut ctx).await {
                Ok(label) => {
                    debug!(chain_id = %def.id, task_id = %current.id, label = %label, "task succeeded");
                    span.succeeded(
                        &current.id,
                        json!({
                            "label": label,
                            "elapsed_ms": started.elapsed().as_millis() as i64,
                        }),
                    );
                    match find_transition(current, &label) {
                        Some(next) => next,
                        None => {
                            let msg =
                                format!("task {} produced unroutable label {label}", current.id);
                            self.alerts.publish(&def.id, &current.id, msg);
                            return Err(ChainError::NoTransition {
                                task_id: current.id.clone(),
                                label,
                            });
                        }
                    }
                }
                Err(err) => {
                    span.failed(&err);
                    match find_transition(current, ON_ERROR) {
                        Some(next) => next,
                        None => {
                            self.alerts
                                .publish(&def.id, &current.id, format!("chain aborted: {err:#}"));
                            return Err(ChainError::Aborted {
                                task_id: current.id.clone(),
                                source: err,
                            });
                        }
                    }
                }
            };

            match next {
                TERM_END => {
                    return Ok(ChainOutcome {
                        chain_id: def.id.clone(),
                        status: ChainStatus::Completed,
                        steps,
                        slots: ctx.into_slots(),
                    });
                }
                TERM_ERROR_END => {
                    return Ok(ChainOutcome {
                        chain_id: def.id.clone(),
                        status: ChainStatus::Failed,
                        steps,
                        slots: ctx.into_slots(),
                    });
                }
                other => {
                    // Validation guarantees resolution.
                    current = by_id[other];
                }
            }
        }
    }

    async fn run_task(&self, task: &TaskDef, ctx: &mut ChainContext) -> Result<String> {
        match task.kind {
            TaskKind::Noop => Ok("ok".to_string()),
            TaskKind::RaiseError => Err(anyhow!("task {} raised an error", task.id)),
            TaskKind::Hook => {
                let name = task.hook.as_deref().unwrap_or_default();
                let hook = self
                    .hooks
                    .get(name)
                    .ok_or_else(|| anyhow!("unknown hook {name}"))?;
                hook.call(ctx).await
            }
            TaskKind::Model => {
                let req = ResolveRequest {
                    model_names: task.model_names.clone(),
                    capability: task.capability.unwrap_or(Capability::Prompt),
                    context_length: None,
                    policy: SelectionPolicy::Random,
                };
                let selection = self.resolver.resolve(&req).await?;

                let template = task
                    .prompt_template
                    .as_deref()
                    .ok_or_else(|| anyhow!("model task {} has no prompt template", task.id))?;
                let prompt = render_template(template, ctx);

                let output = self.runner.run_prompt(&selection, &prompt).await?;
                ctx.set("output", json!(output));
                ctx.set(&format!("task_output:{}", task.id), json!(output));
                ctx.set("resolved_model", json!(selection.provider.model_name));
                Ok("ok".to_string())
            }
        }
    }
}

fn find_transition<'a>(task: &'a TaskDef, label: &str) -> Option<&'a str> {
    task.transitions
        .iter()
        .find(|t| t.on == label)
        .map(|t| t.next.as_str())
}

/// Substitute `{{slot}}` placeholders with the slot's text rendering.
fn render_template(template: &str, ctx: &ChainContext) -> String {
    let mut out = template.to_string();
    for (slot, _) in ctx.slots() {
        let placeholder = format!("{{{{{slot}}}}}");
        if out.contains(&placeholder) {
            let text = ctx.text(slot).unwrap_or_default();
            out = out.replace(&placeholder, &text);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_renders_known_slots_and_leaves_unknown() {
        let mut ctx = ChainContext::new(uuid::Uuid::new_v4(), "c");
        ctx.set("input", json!("hello"));
        ctx.set("knowledge", json!("ctx block"));

        let out = render_template("Q: {{input}}\nK: {{knowledge}}\nX: {{missing}}", &ctx);
        assert_eq!(out, "Q: hello\nK: ctx block\nX: {{missing}}");
    }
}
