// SPDX-License-Identifier: MIT

//! Offline sync queue
//!
//! This module provides:
//! - `QueueEntry` - a mutation the server has not confirmed yet
//! - `OfflineQueue` - durable FIFO of entries with ordered replay
//! - `ReplayReport` - what a replay pass did

mod queue;

pub use queue::{OfflineQueue, ReplayFailure, ReplayReport, ReplayedDraft};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::draft::Draft;

/// Kind of queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Full draft snapshot for `save_draft`
    Draft,
    /// `{"stepId": ...}` for `complete_step`
    StepCompletion,
    /// Upload descriptor for `upload_image`
    ImageUpload,
}

/// One unconfirmed mutation, persisted in the draft cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: Uuid,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub payload: Value,
    /// Server draft version the payload was derived from
    #[serde(default)]
    pub base_version: Option<u64>,
    pub enqueued_at: DateTime<Utc>,
    /// Last time the payload changed (coalescing moves it forward)
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueueEntry {
    fn new(session_id: &str, kind: EntryKind, payload: Value, base_version: Option<u64>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            kind,
            payload,
            base_version,
            enqueued_at: now,
            updated_at: now,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn draft(session_id: &str, draft: &Draft, base_version: Option<u64>) -> Self {
        Self::new(session_id, EntryKind::Draft, draft.to_json(), base_version)
    }

    pub fn step_completion(session_id: &str, step_id: &str) -> Self {
        Self::new(
            session_id,
            EntryKind::StepCompletion,
            json!({ "stepId": step_id }),
            None,
        )
    }

    pub fn image_upload(session_id: &str, payload: Value) -> Self {
        Self::new(session_id, EntryKind::ImageUpload, payload, None)
    }

    /// Age measured from the last payload change
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.updated_at).to_std().unwrap_or_default()
    }
}
