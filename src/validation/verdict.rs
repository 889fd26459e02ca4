// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};

use crate::session::RemoteVerdict;

/// Outcome of validating one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Verdict {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
        }
    }

    /// Build a verdict whose validity follows from the error list
    pub fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Remote errors are authoritative; warnings from both tiers are kept
    pub fn combine(local: &Verdict, remote: &RemoteVerdict) -> Self {
        let mut warnings = local.warnings.clone();
        for w in &remote.warnings {
            if !warnings.contains(w) {
                warnings.push(w.clone());
            }
        }
        Self::from_parts(remote.errors.clone(), warnings)
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Add errors reported by the server for this step
    pub fn with_errors(mut self, errors: &[String]) -> Self {
        for e in errors {
            if !self.errors.contains(e) {
                self.errors.push(e.clone());
            }
        }
        self.is_valid = self.errors.is_empty();
        self
    }
}

/// Errors and warnings for a single field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl FieldReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}
