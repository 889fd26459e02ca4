// SPDX-License-Identifier: MIT

//! Engine configuration
//!
//! Loaded from YAML (every field has a default) and overlaid with environment
//! variables. The binary calls `dotenv()` before `SyncConfig::from_env`.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::OnboardingError;

/// Tunables for autosave, offline replay and the HTTP client
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the onboarding API
    pub api_base_url: String,
    /// Per-request timeout for the HTTP client
    pub request_timeout_ms: u64,
    /// Quiet period before an autosave fires
    pub debounce_ms: u64,
    /// Queue entries older than this are cross-checked against the server
    pub stale_after_secs: u64,
    /// First retry delay for transient and rate-limited failures
    pub backoff_base_ms: u64,
    /// Upper bound for any retry delay
    pub backoff_max_ms: u64,
    /// Failures of identical content after which saves stop retrying
    pub max_identical_failures: u32,
    /// Directory of the file-backed draft cache
    pub cache_dir: Option<PathBuf>,
    /// Byte budget per cached value
    pub cache_quota_bytes: usize,
    /// Key prefix for everything this engine stores
    pub cache_namespace: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080/api/onboarding/".to_string(),
            request_timeout_ms: 10_000,
            debounce_ms: 1_500,
            stale_after_secs: 300,
            backoff_base_ms: 5_000,
            backoff_max_ms: 30_000,
            max_identical_failures: 2,
            cache_dir: None,
            cache_quota_bytes: 5 * 1024 * 1024,
            cache_namespace: "onboarding".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, OnboardingError> {
        let content = fs::read_to_string(path)?;
        Self::parse_yaml(&content)
    }

    /// Parse a configuration from a YAML string
    pub fn parse_yaml(content: &str) -> Result<Self, OnboardingError> {
        let config: SyncConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration overlaid with `ONBOARDING_*` environment variables
    pub fn from_env() -> Result<Self, OnboardingError> {
        Self::default().with_env_overrides()
    }

    /// Overlay `ONBOARDING_API_URL`, `ONBOARDING_CACHE_DIR` and `ONBOARDING_DEBOUNCE_MS`
    pub fn with_env_overrides(mut self) -> Result<Self, OnboardingError> {
        if let Ok(url) = env::var("ONBOARDING_API_URL") {
            self.api_base_url = url;
        }
        if let Ok(dir) = env::var("ONBOARDING_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Ok(ms) = env::var("ONBOARDING_DEBOUNCE_MS") {
            self.debounce_ms = ms.parse().map_err(|_| {
                OnboardingError::config(format!("ONBOARDING_DEBOUNCE_MS is not a number: {}", ms))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), OnboardingError> {
        if self.debounce_ms == 0 {
            return Err(OnboardingError::config("debounce_ms must be positive"));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(OnboardingError::config(
                "backoff_base_ms must not exceed backoff_max_ms",
            ));
        }
        if self.max_identical_failures == 0 {
            return Err(OnboardingError::config(
                "max_identical_failures must be at least 1",
            ));
        }
        url::Url::parse(&self.api_base_url).map_err(|e| {
            OnboardingError::config(format!("invalid api_base_url '{}': {}", self.api_base_url, e))
        })?;
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce(), Duration::from_millis(1_500));
        assert_eq!(config.stale_after(), Duration::from_secs(300));
        assert_eq!(config.max_identical_failures, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
debounce_ms: 800
cache_dir: /tmp/onboarding
"#;
        let config = SyncConfig::parse_yaml(yaml).unwrap();
        assert_eq!(config.debounce_ms, 800);
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/onboarding")));
        assert_eq!(config.backoff_max_ms, 30_000);
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let yaml = r#"
backoff_base_ms: 40000
backoff_max_ms: 30000
"#;
        assert!(SyncConfig::parse_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let yaml = "api_base_url: not a url";
        let err = SyncConfig::parse_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("api_base_url"));
    }
}
