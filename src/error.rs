// SPDX-License-Identifier: MIT

//! Typed error handling for onboard-sync
//!
//! Low-level failures (`SessionError`, `CacheError`) are classified and handled
//! inside the autosave and offline paths. Only validation rejections and fatal
//! session errors reach the wizard layer, through `SaveError` and
//! `OnboardingError`.

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for onboard-sync
#[derive(Debug, Error)]
pub enum OnboardingError {
    /// The remote session could not be created; the store keeps working locally
    #[error("Session initialization failed: {0}")]
    SessionInit(#[source] SessionError),

    /// The session is gone on the server and must be re-initialized
    #[error("Session '{session_id}' expired or was not found")]
    SessionExpired { session_id: String },

    /// An operation that needs a remote session was called without one
    #[error("No active session")]
    NoSession,

    /// Remote call errors that are not classified further by the caller
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Durable cache errors
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Save failures surfaced to the caller
    #[error(transparent)]
    Save(#[from] SaveError),

    /// Wizard navigation errors
    #[error(transparent)]
    Wizard(#[from] WizardError),

    /// Configuration errors (missing env vars, invalid config)
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors returned by a `SessionClient` or `RemoteValidator`
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// No response at all (connection refused, DNS, timeout)
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        /// Server-suggested delay from a `Retry-After` header
        retry_after: Option<Duration>,
        /// Per-step messages of a semantic rejection
        step_errors: BTreeMap<String, Vec<String>>,
    },

    /// The response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),
}

impl SessionError {
    /// Create a status error without retry hints or step errors
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
            retry_after: None,
            step_errors: BTreeMap::new(),
        }
    }

    /// Create a 429 response carrying an optional `Retry-After`
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::Status {
            status: 429,
            message: "Too Many Requests".to_string(),
            retry_after,
            step_errors: BTreeMap::new(),
        }
    }

    /// Create a semantic rejection with per-step messages
    pub fn rejected(status: u16, step_errors: BTreeMap<String, Vec<String>>) -> Self {
        Self::Status {
            status,
            message: "Validation rejected".to_string(),
            retry_after: None,
            step_errors,
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::Decode(err.to_string());
        }
        match err.status() {
            Some(status) => Self::status(status.as_u16(), err.to_string()),
            None => Self::Network(err.to_string()),
        }
    }
}

/// Errors of the durable draft cache
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The value does not fit in the configured byte budget
    #[error("Cache quota exceeded: {size} bytes > {limit} bytes for key '{key}'")]
    QuotaExceeded { key: String, size: usize, limit: usize },

    /// Storage is disabled or broken
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded
    #[error("Corrupt cache record '{key}': {message}")]
    Corrupt { key: String, message: String },
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Save failures returned by `DraftStore::save_now`
///
/// Transient conditions never show up here: they resolve to
/// `SaveOutcome::SavedLocally` or `SaveOutcome::Retrying`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SaveError {
    /// The server rejected the draft content
    #[error("Draft rejected: {message}")]
    Rejected {
        message: String,
        step_errors: BTreeMap<String, Vec<String>>,
    },

    /// The session expired; the draft is preserved for re-submission
    #[error("Session '{session_id}' expired")]
    SessionExpired { session_id: String },

    /// The same content already failed the configured number of times
    #[error("Save suppressed after {failures} failures of unchanged content")]
    RepeatedFailure { failures: u32 },

    /// Neither the cache nor the remote accepted the draft
    #[error("Draft could not be persisted anywhere: {0}")]
    Unpersisted(String),
}

/// Wizard navigation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WizardError {
    /// `Next`/`Complete` blocked by the current step's verdict
    #[error("Step '{step}' is invalid: {errors:?}")]
    StepInvalid { step: String, errors: Vec<String> },

    /// `JumpTo` targeted a step beyond the completed range
    #[error("Step {index} is locked until earlier steps are completed")]
    StepLocked { index: usize },

    /// Index out of range
    #[error("Unknown step index {0}")]
    UnknownStep(usize),

    /// `Complete` requested away from the last step
    #[error("Completion is only allowed from the last step")]
    NotLastStep,

    /// Navigation after the wizard finished
    #[error("Wizard already completed")]
    AlreadyCompleted,

    /// The pre-transition save failed
    #[error("Could not save before leaving step: {0}")]
    SaveFailed(SaveError),
}

impl OnboardingError {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_helpers() {
        match SessionError::rate_limited(Some(Duration::from_secs(3))) {
            SessionError::Status {
                status,
                retry_after,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
            }
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_error_messages() {
        let err = SessionError::status(503, "unavailable");
        assert_eq!(err.to_string(), "HTTP 503: unavailable");

        let err = CacheError::QuotaExceeded {
            key: "k".to_string(),
            size: 10,
            limit: 5,
        };
        assert!(err.to_string().contains("10 bytes > 5 bytes"));

        let err = OnboardingError::SessionInit(SessionError::network("refused"));
        assert_eq!(
            err.to_string(),
            "Session initialization failed: Network error: refused"
        );
    }
}
