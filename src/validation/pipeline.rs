// SPDX-License-Identifier: MIT

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{FieldReport, StepValidator, Verdict};
use crate::draft::{Draft, StepId};
use crate::session::{Backoff, ErrorClass, RemoteValidator, RemoteVerdict};

const REMOTE_BUSY_WARNING: &str = "Server checks are busy; showing local checks only";

/// Two-tier validation: local schema first, remote authority second
#[derive(Clone, Default)]
pub struct ValidationPipeline {
    validators: HashMap<StepId, Arc<dyn StepValidator>>,
    remote: Option<Arc<dyn RemoteValidator>>,
    backoff: Backoff,
}

impl ValidationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the schema for a step
    pub fn register(&mut self, step_id: impl Into<StepId>, validator: Arc<dyn StepValidator>) {
        self.validators.insert(step_id.into(), validator);
    }

    /// Attach the remote tier; `backoff` bounds the rate-limit retry delay
    pub fn with_remote(mut self, remote: Arc<dyn RemoteValidator>, backoff: Backoff) -> Self {
        self.remote = Some(remote);
        self.backoff = backoff;
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Local structural check; steps without a schema are valid
    pub fn validate_local(&self, step_id: &str, payload: Option<&Value>) -> Verdict {
        match self.validators.get(step_id) {
            Some(v) => v.validate(payload.unwrap_or(&Value::Null)),
            None => Verdict::valid(),
        }
    }

    /// Narrowed local check of one field
    pub fn validate_field(&self, step_id: &str, field: &str, value: Option<&Value>) -> FieldReport {
        match self.validators.get(step_id) {
            Some(v) => v.validate_field(field, value),
            None => FieldReport::default(),
        }
    }

    /// Local verdicts for every step with a schema
    pub fn validate_all(&self, draft: &Draft) -> BTreeMap<StepId, Verdict> {
        self.validators
            .keys()
            .map(|id| (id.clone(), self.validate_local(id, draft.step(id))))
            .collect()
    }

    /// Full check: remote runs only when local passes and a session exists
    ///
    /// Remote failures degrade to the local verdict. A first 429 is retried
    /// once after the suggested delay without surfacing anything.
    pub async fn validate(
        &self,
        session_id: Option<&str>,
        step_id: &str,
        payload: Option<&Value>,
    ) -> Verdict {
        let local = self.validate_local(step_id, payload);
        if !local.is_valid {
            return local;
        }

        let (remote, session_id) = match (&self.remote, session_id) {
            (Some(remote), Some(id)) => (remote, id),
            _ => return local,
        };

        let payload = payload.cloned().unwrap_or(Value::Null);
        let mut attempt = 0;
        loop {
            match remote.validate_step(session_id, step_id, &payload).await {
                Ok(verdict) => return Verdict::combine(&local, &verdict),
                Err(e) => match e.classify() {
                    ErrorClass::RateLimited { retry_after } if attempt == 0 => {
                        let delay = self.backoff.after_hint(retry_after, attempt);
                        log::info!(
                            "Remote validation of '{}' rate limited, retrying in {:?}",
                            step_id,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    ErrorClass::RateLimited { .. } => {
                        log::warn!("Remote validation of '{}' rate limited twice", step_id);
                        return local.with_warning(REMOTE_BUSY_WARNING);
                    }
                    ErrorClass::Rejected {
                        message,
                        step_errors,
                    } => {
                        let errors = step_errors
                            .get(step_id)
                            .cloned()
                            .unwrap_or_else(|| vec![message]);
                        return Verdict::combine(
                            &local,
                            &RemoteVerdict {
                                errors,
                                warnings: vec![],
                            },
                        );
                    }
                    ErrorClass::Transient | ErrorClass::SessionExpired => {
                        log::warn!(
                            "Remote validation of '{}' unavailable ({}), using local verdict",
                            step_id,
                            e
                        );
                        return local;
                    }
                },
            }
        }
    }
}
