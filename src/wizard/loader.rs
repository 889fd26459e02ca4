// SPDX-License-Identifier: MIT

//! Wizard loader - YAML file loading and parsing

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use super::WizardDefinition;
use crate::error::OnboardingError;

/// Loads wizard definitions from YAML files
pub struct WizardLoader;

impl WizardLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a wizard definition from a YAML file
    pub fn load_wizard<P: AsRef<Path>>(&self, path: P) -> Result<WizardDefinition, OnboardingError> {
        let content = fs::read_to_string(path)?;
        Self::parse_yaml(&content)
    }

    /// Parse and check a wizard definition from a YAML string
    pub fn parse_yaml(content: &str) -> Result<WizardDefinition, OnboardingError> {
        let def: WizardDefinition = serde_yaml::from_str(content)?;
        if def.steps.is_empty() {
            return Err(OnboardingError::config(format!(
                "Wizard '{}' has no steps",
                def.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &def.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(OnboardingError::config(format!(
                    "Duplicate step id '{}'",
                    step.id
                )));
            }
            if let Some(schema) = &step.schema {
                if let Some((field, err)) = schema.pattern_errors().into_iter().next() {
                    return Err(OnboardingError::config(format!(
                        "Invalid pattern for '{}.{}': {}",
                        step.id, field, err
                    )));
                }
            }
        }

        log::debug!("Loaded wizard '{}' with {} steps", def.name, def.steps.len());
        Ok(def)
    }
}

impl Default for WizardLoader {
    fn default() -> Self {
        Self::new()
    }
}
