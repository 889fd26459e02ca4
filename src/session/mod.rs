// SPDX-License-Identifier: MIT

//! Session client - the remote onboarding authority
//!
//! This module provides the `SessionClient` and `RemoteValidator` traits the
//! engine consumes, the wire types they exchange, error classification with
//! retry backoff, and a reqwest-based HTTP implementation:
//! - [http] - JSON-over-HTTP client

pub mod http;
mod retry;

pub use http::HttpSessionClient;
pub use retry::{Backoff, ErrorClass};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::draft::{Draft, StepId};
use crate::error::SessionError;

/// Server-side record of one onboarding attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub property_id: Option<String>,
    #[serde(default)]
    pub current_step: usize,
    #[serde(default)]
    pub completed_steps: BTreeSet<StepId>,
    #[serde(default)]
    pub quality_score: Option<f64>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Draft as stored on the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDraft {
    #[serde(default)]
    pub steps: Draft,
    /// Monotonic per-session version, bumped on every accepted write
    #[serde(default)]
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Acknowledgement of an accepted `save_draft`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReceipt {
    pub version: u64,
    pub saved_at: DateTime<Utc>,
}

/// Result of the server-side validation tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteVerdict {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Remote session API
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Start a new onboarding attempt
    async fn create_session(&self, property_id: Option<&str>) -> Result<Session, SessionError>;

    /// Current progress of a session
    async fn get_status(&self, session_id: &str) -> Result<Session, SessionError>;

    /// Write the given steps; steps not present in `draft` are left untouched
    async fn save_draft(
        &self,
        session_id: &str,
        draft: &Draft,
        base_version: Option<u64>,
    ) -> Result<SaveReceipt, SessionError>;

    /// Read the server copy of the draft
    async fn load_draft(&self, session_id: &str) -> Result<RemoteDraft, SessionError>;

    /// Record that a step was finished
    async fn complete_step(&self, session_id: &str, step_id: &str)
        -> Result<Session, SessionError>;

    /// Hand an image upload descriptor to the server
    async fn upload_image(&self, session_id: &str, payload: &Value) -> Result<(), SessionError>;

    /// Finalize the session; returns the created property id
    async fn complete_session(&self, session_id: &str) -> Result<String, SessionError>;
}

/// Server-side validation for rules that need server knowledge
#[async_trait]
pub trait RemoteValidator: Send + Sync {
    async fn validate_step(
        &self,
        session_id: &str,
        step_id: &str,
        payload: &Value,
    ) -> Result<RemoteVerdict, SessionError>;
}
