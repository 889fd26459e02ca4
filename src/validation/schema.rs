// SPDX-License-Identifier: MIT

//! Declarative step schemas
//!
//! A schema maps field names to rules. It only covers structural checks
//! (types, presence, ranges, lengths, formats, enumerations); business rules
//! live on the server.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::verdict::{FieldReport, Verdict};
use super::StepValidator;

/// Schema for one step's payload
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StepSchema {
    /// Field rules
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldRule>,
}

/// Rules for a single field
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FieldRule {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Human-readable name used in messages
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub required: bool,
    /// Missing value produces a warning instead of an error
    #[serde(default)]
    pub recommended: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Characters for strings, items for arrays
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Regex a string value must match
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub one_of: Option<Vec<Value>>,
    #[serde(skip)]
    compiled: OnceCell<Option<Regex>>,
}

/// Supported field types
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            FieldType::String => "text",
            FieldType::Number => "a number",
            FieldType::Integer => "a whole number",
            FieldType::Boolean => "yes or no",
            FieldType::Array => "a list",
            FieldType::Object => "a group of values",
        }
    }
}

impl FieldRule {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            label: None,
            required: false,
            recommended: false,
            min: None,
            max: None,
            min_length: None,
            max_length: None,
            pattern: None,
            one_of: None,
            compiled: OnceCell::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn recommended(mut self) -> Self {
        self.recommended = true;
        self
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(pattern.to_string());
        self.compiled = OnceCell::new();
        self
    }

    pub fn one_of(mut self, values: Vec<Value>) -> Self {
        self.one_of = Some(values);
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    fn regex(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| {
                let pattern = self.pattern.as_ref()?;
                match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        log::warn!("Ignoring invalid pattern '{}': {}", pattern, e);
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Check one value against this rule
    pub fn check(&self, name: &str, value: Option<&Value>) -> FieldReport {
        let label = self.label.as_deref().unwrap_or(name);
        let mut report = FieldReport::default();

        let value = match value {
            Some(v) if !is_blank(v) => v,
            _ => {
                if self.required {
                    report.errors.push(format!("{} is required", label));
                } else if self.recommended {
                    report
                        .warnings
                        .push(format!("{} is recommended", label));
                }
                return report;
            }
        };

        if !self.field_type.matches(value) {
            report
                .errors
                .push(format!("{} must be {}", label, self.field_type.describe()));
            return report;
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    report
                        .errors
                        .push(format!("{} must be at least {}", label, min));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    report
                        .errors
                        .push(format!("{} must be at most {}", label, max));
                }
            }
        }

        let length = match value {
            Value::String(s) => Some((s.chars().count(), "characters")),
            Value::Array(a) => Some((a.len(), "items")),
            _ => None,
        };
        if let Some((len, unit)) = length {
            if let Some(min) = self.min_length {
                if len < min {
                    report
                        .errors
                        .push(format!("{} needs at least {} {}", label, min, unit));
                }
            }
            if let Some(max) = self.max_length {
                if len > max {
                    report
                        .errors
                        .push(format!("{} allows at most {} {}", label, max, unit));
                }
            }
        }

        if let (Some(re), Some(s)) = (self.regex(), value.as_str()) {
            if !re.is_match(s) {
                report.errors.push(format!("{} has an invalid format", label));
            }
        }

        if let Some(allowed) = &self.one_of {
            if !allowed.contains(value) {
                let options: Vec<String> = allowed
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                report.errors.push(format!(
                    "{} must be one of: {}",
                    label,
                    options.join(", ")
                ));
            }
        }

        report
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

impl StepSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, rule: FieldRule) -> Self {
        self.fields.insert(name.to_string(), rule);
        self
    }

    /// Invalid regex patterns, as `(field, error)` pairs
    pub fn pattern_errors(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .filter_map(|(name, rule)| {
                let pattern = rule.pattern.as_ref()?;
                Regex::new(pattern)
                    .err()
                    .map(|e| (name.clone(), e.to_string()))
            })
            .collect()
    }
}

impl StepValidator for StepSchema {
    fn validate(&self, payload: &Value) -> Verdict {
        let obj = match payload {
            Value::Object(obj) => Some(obj),
            Value::Null => None,
            _ => return Verdict::from_parts(vec!["Step data must be an object".to_string()], vec![]),
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for (name, rule) in &self.fields {
            let report = rule.check(name, obj.and_then(|o| o.get(name)));
            errors.extend(report.errors);
            warnings.extend(report.warnings);
        }
        Verdict::from_parts(errors, warnings)
    }

    fn validate_field(&self, field: &str, value: Option<&Value>) -> FieldReport {
        match self.fields.get(field) {
            Some(rule) => rule.check(field, value),
            None => FieldReport::default(),
        }
    }
}
