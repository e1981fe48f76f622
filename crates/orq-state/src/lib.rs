//! Process-wide observed cluster state and the internal event bus.
//!
//! The runtime view is a snapshot map `backend id → BackendView`, mutated
//! only by the reconciliation cycles; everyone else reads copies. A failed
//! dial records the error string without evicting the previously observed
//! model lists. Stale-but-marked beats silently empty.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use orq_schemas::Backend;

// ---------------------------------------------------------------------------
// BackendView
// ---------------------------------------------------------------------------

/// Most recent observation of one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendView {
    pub backend: Backend,
    pub pulled_models: Vec<String>,
    pub pulling_models: Vec<String>,
    /// When the last successful poll completed.
    pub last_seen: Option<DateTime<Utc>>,
    /// Dial/listing error from the most recent poll, if it failed.
    pub error: Option<String>,
}

impl BackendView {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            pulled_models: Vec::new(),
            pulling_models: Vec::new(),
            last_seen: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RuntimeState
// ---------------------------------------------------------------------------

/// Shared handle to the observed cluster state. Cheap to clone.
#[derive(Clone, Default)]
pub struct RuntimeState {
    inner: Arc<RwLock<HashMap<Uuid, BackendView>>>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy of the whole view map.
    pub async fn snapshot(&self) -> HashMap<Uuid, BackendView> {
        self.inner.read().await.clone()
    }

    pub async fn get(&self, backend_id: Uuid) -> Option<BackendView> {
        self.inner.read().await.get(&backend_id).cloned()
    }

    /// Record a successful poll: fresh model list, error cleared.
    pub async fn record_poll(&self, backend: Backend, pulled_models: Vec<String>) {
        let mut map = self.inner.write().await;
        let entry = map
            .entry(backend.id)
            .or_insert_with(|| BackendView::new(backend.clone()));
        entry.backend = backend;
        entry.pulled_models = pulled_models;
        let pulled = entry.pulled_models.clone();
        entry.pulling_models.retain(|m| !pulled.contains(m));
        entry.last_seen = Some(Utc::now());
        entry.error = None;
    }

    /// Record a failed poll. Pre-existing model lists stay in place; only
    /// the error marker changes.
    pub async fn record_poll_error(&self, backend: Backend, error: String) {
        let mut map = self.inner.write().await;
        let entry = map
            .entry(backend.id)
            .or_insert_with(|| BackendView::new(backend.clone()));
        entry.backend = backend;
        entry.error = Some(error);
    }

    /// Fold a download progress message into the pulling list.
    pub async fn record_download_progress(
        &self,
        backend_id: Uuid,
        model: &str,
        status: DownloadStatus,
    ) {
        let mut map = self.inner.write().await;
        let Some(entry) = map.get_mut(&backend_id) else {
            return;
        };
        match status {
            DownloadStatus::Started | DownloadStatus::InProgress => {
                if !entry.pulling_models.iter().any(|m| m == model) {
                    entry.pulling_models.push(model.to_string());
                }
            }
            DownloadStatus::Completed => {
                entry.pulling_models.retain(|m| m != model);
                if !entry.pulled_models.iter().any(|m| m == model) {
                    entry.pulled_models.push(model.to_string());
                }
            }
            DownloadStatus::Failed => {
                entry.pulling_models.retain(|m| m != model);
            }
        }
    }

    /// Drop views for backends that no longer exist in the store.
    pub async fn retain_backends(&self, known: &[Uuid]) {
        let mut map = self.inner.write().await;
        map.retain(|id, _| known.contains(id));
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Started,
    InProgress,
    Completed,
    Failed,
}

/// Messages broadcast over the internal bus and surfaced as SSE events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    /// Force both reconciliation cycles immediately.
    TriggerCycle,
    DownloadProgress {
        backend_id: Uuid,
        model: String,
        status: DownloadStatus,
    },
    QueueCancel {
        job_id: Uuid,
    },
    LogLine {
        level: String,
        msg: String,
    },
}

impl BusMsg {
    /// Stable subject name used by the SSE layer.
    pub fn subject(&self) -> &'static str {
        match self {
            BusMsg::TriggerCycle => "trigger_cycle",
            BusMsg::DownloadProgress { .. } => "model_download",
            BusMsg::QueueCancel { .. } => "queue_cancel",
            BusMsg::LogLine { .. } => "log",
        }
    }
}

/// In-process broadcast bus. Cheap to clone; receivers see messages sent
/// after they subscribed.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<BusMsg>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget publish; a bus with no subscribers is fine.
    pub fn publish(&self, msg: BusMsg) {
        let _ = self.tx.send(msg);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMsg> {
        self.tx.subscribe()
    }
}
