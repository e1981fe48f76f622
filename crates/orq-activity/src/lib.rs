//! Uniform activity tracking for mutating service calls.
//!
//! Shape: `tracker.start(operation, subject)` hands back a span; the caller
//! reports either an error or a change map, and the span always ends (Drop
//! emits the terminal record if the caller forgot). Sinks decide where the
//! records go: structured logs, an in-memory ring for operators, or the
//! event store via a writer channel. The tracker itself fans out to every
//! sink, so composing trackers is just composing sink lists.
//!
//! Sensitive values (tokens, API keys) are masked before any sink sees
//! them, so sinks never receive secret material.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

pub const MASK: &str = "***";

/// Key substrings that mark a value as secret.
const SENSITIVE_KEYS: &[&str] = &["token", "api_key", "apikey", "secret", "password"];

/// Replace the values of sensitive keys (recursively) with [`MASK`].
pub fn mask_sensitive(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, val) in map {
                let lowered = k.to_lowercase();
                if SENSITIVE_KEYS.iter().any(|s| lowered.contains(s)) {
                    out.insert(k.clone(), Value::String(MASK.to_string()));
                } else {
                    out.insert(k.clone(), mask_sensitive(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(mask_sensitive).collect()),
        _ => v.clone(),
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Started,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub request_id: Uuid,
    pub ts: DateTime<Utc>,
    pub operation: String,
    pub subject: String,
    pub outcome: Outcome,
    /// Subject instance the change applied to (id, name, …), if any.
    pub subject_id: Option<String>,
    /// Masked change map on success; error text on failure.
    pub detail: Option<Value>,
    pub elapsed_ms: Option<i64>,
}

/// Where activity records land.
pub trait Sink: Send + Sync {
    fn record(&self, rec: &ActivityRecord);
}

// ---------------------------------------------------------------------------
// Tracker & span
// ---------------------------------------------------------------------------

/// Fans every record out to its sinks. Cheap to clone.
#[derive(Clone, Default)]
pub struct Tracker {
    sinks: Vec<Arc<dyn Sink>>,
}

impl Tracker {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    /// Tracker that only logs; the minimal useful default.
    pub fn log_only() -> Self {
        Self::new(vec![Arc::new(LogSink)])
    }

    /// Open a span for one mutating call.
    pub fn start(&self, request_id: Uuid, operation: &str, subject: &str) -> ActivitySpan {
        let rec = ActivityRecord {
            request_id,
            ts: Utc::now(),
            operation: operation.to_string(),
            subject: subject.to_string(),
            outcome: Outcome::Started,
            subject_id: None,
            detail: None,
            elapsed_ms: None,
        };
        self.emit(&rec);

        ActivitySpan {
            tracker: self.clone(),
            request_id,
            operation: operation.to_string(),
            subject: subject.to_string(),
            started: Instant::now(),
            finished: false,
        }
    }

    fn emit(&self, rec: &ActivityRecord) {
        for sink in &self.sinks {
            sink.record(rec);
        }
    }
}

/// Open span over one call. Exactly one of `succeeded` / `failed` should be
/// called; Drop emits a failure record if neither was.
pub struct ActivitySpan {
    tracker: Tracker,
    request_id: Uuid,
    operation: String,
    subject: String,
    started: Instant,
    finished: bool,
}

impl ActivitySpan {
    /// Report the change this call made. `changes` is masked here.
    pub fn succeeded(mut self, subject_id: &str, changes: Value) {
        self.finished = true;
        let rec = self.terminal(Outcome::Succeeded, Some(subject_id), Some(mask_sensitive(&changes)));
        self.tracker.emit(&rec);
    }

    pub fn failed(mut self, err: &dyn std::fmt::Display) {
        self.finished = true;
        let rec = self.terminal(
            Outcome::Failed,
            None,
            Some(Value::String(err.to_string())),
        );
        self.tracker.emit(&rec);
    }

    fn terminal(&self, outcome: Outcome, subject_id: Option<&str>, detail: Option<Value>) -> ActivityRecord {
        ActivityRecord {
            request_id: self.request_id,
            ts: Utc::now(),
            operation: self.operation.clone(),
            subject: self.subject.clone(),
            outcome,
            subject_id: subject_id.map(|s| s.to_string()),
            detail,
            elapsed_ms: Some(self.started.elapsed().as_millis() as i64),
        }
    }
}

impl Drop for ActivitySpan {
    fn drop(&mut self) {
        if !self.finished {
            let rec = self.terminal(
                Outcome::Failed,
                None,
                Some(Value::String("span dropped without a report".to_string())),
            );
            self.tracker.emit(&rec);
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Structured-log sink.
pub struct LogSink;

impl Sink for LogSink {
    fn record(&self, rec: &ActivityRecord) {
        match rec.outcome {
            Outcome::Failed => error!(
                request_id = %rec.request_id,
                operation = %rec.operation,
                subject = %rec.subject,
                detail = ?rec.detail,
                "activity failed"
            ),
            _ => info!(
                request_id = %rec.request_id,
                operation = %rec.operation,
                subject = %rec.subject,
                outcome = ?rec.outcome,
                "activity"
            ),
        }
    }
}

/// Fixed-capacity in-memory ring of recent records, drained over HTTP.
pub struct RingSink {
    inner: Mutex<VecDeque<ActivityRecord>>,
    capacity: usize,
}

impl RingSink {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        })
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<ActivityRecord> {
        let ring = self.inner.lock().expect("ring mutex poisoned");
        ring.iter().rev().cloned().collect()
    }
}

impl Sink for RingSink {
    fn record(&self, rec: &ActivityRecord) {
        let mut ring = self.inner.lock().expect("ring mutex poisoned");
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(rec.clone());
    }
}

/// Forwards records onto a channel; a writer task owns the event-store
/// append so sinks stay synchronous and non-blocking.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<ActivityRecord>,
}

impl ChannelSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<ActivityRecord>) -> Self {
        Self { tx }
    }
}

impl Sink for ChannelSink {
    fn record(&self, rec: &ActivityRecord) {
        // A closed receiver means shutdown is underway; dropping the record
        // is the correct behavior then.
        let _ = self.tx.send(rec.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masking_replaces_sensitive_values_recursively() {
        let v = json!({
            "name": "telegram-bot",
            "bot_token": "123456:ABCDEF",
            "nested": { "api_key": "sk-live", "note": "ok" },
            "items": [{ "password": "hunter2" }]
        });
        let masked = mask_sensitive(&v);
        assert_eq!(masked["bot_token"], json!(MASK));
        assert_eq!(masked["nested"]["api_key"], json!(MASK));
        assert_eq!(masked["items"][0]["password"], json!(MASK));
        assert_eq!(masked["name"], json!("telegram-bot"));
        assert_eq!(masked["nested"]["note"], json!("ok"));
    }

    #[test]
    fn ring_keeps_only_the_newest_records() {
        let ring = RingSink::new(2);
        let tracker = Tracker::new(vec![ring.clone() as Arc<dyn Sink>]);

        for i in 0..3 {
            let span = tracker.start(Uuid::new_v4(), &format!("op-{i}"), "job");
            span.succeeded("id", json!({}));
        }

        let recent = ring.recent();
        // 3 ops × (started + succeeded) = 6 records, ring holds the last 2.
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].operation, "op-2");
    }

    #[test]
    fn success_report_masks_changes() {
        let ring = RingSink::new(8);
        let tracker = Tracker::new(vec![ring.clone() as Arc<dyn Sink>]);

        let span = tracker.start(Uuid::new_v4(), "configure", "provider");
        span.succeeded("openai", json!({"api_key": "sk-live", "upsert": true}));

        let recent = ring.recent();
        let done = &recent[0];
        assert_eq!(done.outcome, Outcome::Succeeded);
        assert_eq!(done.detail.as_ref().unwrap()["api_key"], json!(MASK));
        assert_eq!(done.detail.as_ref().unwrap()["upsert"], json!(true));
    }

    #[test]
    fn dropped_span_emits_failure() {
        let ring = RingSink::new(8);
        let tracker = Tracker::new(vec![ring.clone() as Arc<dyn Sink>]);

        {
            let _span = tracker.start(Uuid::new_v4(), "forgotten", "job");
        }

        let recent = ring.recent();
        assert_eq!(recent[0].outcome, Outcome::Failed);
    }
}
