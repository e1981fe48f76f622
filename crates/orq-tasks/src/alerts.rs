//! Operator alerts from fatal chain paths.
//!
//! A fixed-capacity ring: fatal chain aborts land here and the daemon
//! surfaces them over HTTP. Not a log replacement: only conditions that
//! need an operator's eyes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub ts: DateTime<Utc>,
    pub chain_id: String,
    pub task_id: String,
    pub message: String,
}

pub struct AlertSink {
    inner: Mutex<VecDeque<Alert>>,
    capacity: usize,
}

impl AlertSink {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        })
    }

    pub fn publish(&self, chain_id: &str, task_id: &str, message: String) {
        let mut ring = self.inner.lock().expect("alert ring mutex poisoned");
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(Alert {
            ts: Utc::now(),
            chain_id: chain_id.to_string(),
            task_id: task_id.to_string(),
            message,
        });
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<Alert> {
        let ring = self.inner.lock().expect("alert ring mutex poisoned");
        ring.iter().rev().cloned().collect()
    }
}
