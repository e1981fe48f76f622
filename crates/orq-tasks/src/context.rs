//! The typed context map shared across a chain's tasks.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

/// Named JSON slots threaded through one chain execution. Tasks and hooks
/// read and write slots by name; the engine records per-task outputs under
/// `task_output:<task id>` in addition to the shared `output` slot.
#[derive(Debug, Clone)]
pub struct ChainContext {
    pub request_id: Uuid,
    pub chain_id: String,
    slots: HashMap<String, Value>,
}

impl ChainContext {
    pub fn new(request_id: Uuid, chain_id: &str) -> Self {
        Self {
            request_id,
            chain_id: chain_id.to_string(),
            slots: HashMap::new(),
        }
    }

    /// Context seeded with an `input` slot, the common entry shape.
    pub fn with_input(request_id: Uuid, chain_id: &str, input: Value) -> Self {
        let mut ctx = Self::new(request_id, chain_id);
        ctx.set("input", input);
        ctx
    }

    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.slots.get(slot)
    }

    pub fn set(&mut self, slot: &str, value: Value) {
        self.slots.insert(slot.to_string(), value);
    }

    pub fn remove(&mut self, slot: &str) -> Option<Value> {
        self.slots.remove(slot)
    }

    /// Slot rendered as plain text: strings verbatim, other values as JSON.
    pub fn text(&self, slot: &str) -> Option<String> {
        self.slots.get(slot).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn into_slots(self) -> HashMap<String, Value> {
        self.slots
    }

    pub fn slots(&self) -> &HashMap<String, Value> {
        &self.slots
    }
}
