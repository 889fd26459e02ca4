// SPDX-License-Identifier: MIT

//! Wizard definition and step navigation
//!
//! This module provides:
//! - `WizardDefinition` / `StepDefinition` - ordered steps with optional schemas
//! - `WizardLoader` - YAML loading
//! - `WizardController` - step state machine gated on verdicts

mod controller;
mod loader;

pub use controller::{WizardController, WizardState};
pub use loader::WizardLoader;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::draft::StepId;
use crate::validation::{StepSchema, ValidationPipeline};

/// Top-level wizard definition
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WizardDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Steps in display order
    pub steps: Vec<StepDefinition>,
}

/// One wizard step
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StepDefinition {
    pub id: StepId,
    pub title: String,
    /// Optional steps never block `next`
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub schema: Option<StepSchema>,
}

impl WizardDefinition {
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Validation pipeline with every step schema registered
    pub fn pipeline(&self) -> ValidationPipeline {
        let mut pipeline = ValidationPipeline::new();
        for step in &self.steps {
            if let Some(schema) = &step.schema {
                pipeline.register(step.id.clone(), Arc::new(schema.clone()));
            }
        }
        pipeline
    }
}
