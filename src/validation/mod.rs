// SPDX-License-Identifier: MIT

//! Validation pipeline
//!
//! This module provides:
//! - `StepValidator` - black-box per-step schema check
//! - `StepSchema` - declarative, YAML-loadable `StepValidator`
//! - `Verdict` / `FieldReport` - validation outcomes
//! - `ValidationPipeline` - local tier first, remote tier only when local passes

mod pipeline;
mod schema;
mod verdict;

pub use pipeline::ValidationPipeline;
pub use schema::{FieldRule, FieldType, StepSchema};
pub use verdict::{FieldReport, Verdict};

use serde_json::Value;

/// Structural validator for one step
pub trait StepValidator: Send + Sync {
    /// Validate a whole step payload
    fn validate(&self, payload: &Value) -> Verdict;

    /// Validate one field in isolation, for as-you-type feedback
    fn validate_field(&self, field: &str, value: Option<&Value>) -> FieldReport;
}
