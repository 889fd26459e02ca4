// SPDX-License-Identifier: MIT

//! Draft state and its persistence engine
//!
//! This module provides:
//! - `Draft` - step id to step payload mapping, the in-progress work
//! - `DraftStore` - owner of the draft; optimistic updates, rollback, saves
//! - `AutosaveScheduler` - debounced, cancellable save trigger

mod autosave;
mod store;

pub use autosave::AutosaveScheduler;
pub use store::{DraftStore, SaveOutcome, StoreDeps, SyncStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Identifier of a wizard step, e.g. `"basic-details"`
pub type StepId = String;

/// The working onboarding data for one property
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Draft {
    steps: BTreeMap<StepId, Value>,
}

impl Draft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload of a step
    pub fn step(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id)
    }

    /// Value of one field inside a step payload
    pub fn field(&self, step_id: &str, field: &str) -> Option<&Value> {
        self.steps.get(step_id)?.get(field)
    }

    /// Replace a whole step payload
    pub fn set_step(&mut self, step_id: impl Into<StepId>, payload: Value) {
        self.steps.insert(step_id.into(), payload);
    }

    /// Set one field, creating the step object if needed
    ///
    /// A non-object payload is replaced by an object holding only this field.
    pub fn set_field(&mut self, step_id: &str, field: &str, value: Value) {
        let payload = self
            .steps
            .entry(step_id.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !payload.is_object() {
            *payload = Value::Object(Map::new());
        }
        if let Value::Object(obj) = payload {
            obj.insert(field.to_string(), value);
        }
    }

    /// Step ids with a payload
    pub fn step_ids(&self) -> impl Iterator<Item = &StepId> {
        self.steps.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Copy every step of `other` over this draft
    pub fn merge_steps(&mut self, other: &Draft) {
        for (id, payload) in &other.steps {
            self.steps.insert(id.clone(), payload.clone());
        }
    }

    /// Whether every step of `self` is present with the same payload in `other`
    pub fn is_contained_in(&self, other: &Draft) -> bool {
        self.steps
            .iter()
            .all(|(id, payload)| other.steps.get(id) == Some(payload))
    }

    /// SHA-256 over the canonical JSON form (object keys sorted)
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_vec(&self.steps).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        format!("{:x}", digest)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.steps).unwrap_or(Value::Null)
    }
}

impl From<BTreeMap<StepId, Value>> for Draft {
    fn from(steps: BTreeMap<StepId, Value>) -> Self {
        Self { steps }
    }
}

/// A field change not yet confirmed by a successful save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub seq: u64,
    pub step_id: StepId,
    pub field: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// Draft record written to the durable cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedDraft {
    pub session_id: Option<String>,
    pub draft: Draft,
    pub content_hash: String,
    /// Server version this draft was based on
    pub version: Option<u64>,
    pub saved_at: DateTime<Utc>,
    /// Whether the remote acknowledged exactly this content
    pub confirmed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_field_creates_step() {
        let mut draft = Draft::new();
        draft.set_field("basic-details", "name", json!("Grand Plaza"));
        draft.set_field("basic-details", "hotelType", json!("HOTEL"));

        assert_eq!(
            draft.step("basic-details"),
            Some(&json!({"name": "Grand Plaza", "hotelType": "HOTEL"}))
        );
        assert_eq!(draft.field("basic-details", "name"), Some(&json!("Grand Plaza")));
        assert!(draft.field("location", "city").is_none());
    }

    #[test]
    fn test_set_field_replaces_scalar_payload() {
        let mut draft = Draft::new();
        draft.set_step("notes", json!("free text"));
        draft.set_field("notes", "body", json!("x"));
        assert_eq!(draft.step("notes"), Some(&json!({"body": "x"})));
    }

    #[test]
    fn test_content_hash_is_order_independent() {
        let mut a = Draft::new();
        a.set_field("s", "x", json!(1));
        a.set_field("s", "y", json!(2));

        let mut b = Draft::new();
        b.set_field("s", "y", json!(2));
        b.set_field("s", "x", json!(1));

        assert_eq!(a.content_hash(), b.content_hash());

        b.set_field("s", "x", json!(3));
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_edit_then_revert_restores_hash() {
        let mut draft = Draft::new();
        draft.set_field("s", "name", json!("A"));
        let before = draft.content_hash();

        draft.set_field("s", "name", json!("B"));
        draft.set_field("s", "name", json!("A"));
        assert_eq!(draft.content_hash(), before);
    }

    #[test]
    fn test_containment() {
        let mut local = Draft::new();
        local.set_field("a", "f", json!(1));

        let mut remote = local.clone();
        remote.set_field("b", "g", json!(2));

        assert!(local.is_contained_in(&remote));
        assert!(!remote.is_contained_in(&local));
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let mut draft = Draft::new();
        draft.set_field("a", "f", json!(1));
        assert_eq!(serde_json::to_value(&draft).unwrap(), json!({"a": {"f": 1}}));
    }
}
