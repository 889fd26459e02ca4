// SPDX-License-Identifier: MIT

//! Step state machine
//!
//! `Step(i)` states plus a terminal `Completed`. Leaving a step forward
//! requires a passing verdict (unless the step is optional) and a save.

use std::collections::BTreeSet;

use super::StepDefinition;
use crate::draft::DraftStore;
use crate::error::{OnboardingError, WizardError};
use crate::session::Session;
use crate::validation::Verdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardState {
    Step(usize),
    Completed,
}

pub struct WizardController {
    store: DraftStore,
    steps: Vec<StepDefinition>,
    state: WizardState,
    completed: BTreeSet<usize>,
}

impl WizardController {
    /// Start at the first step
    pub fn new(store: DraftStore, steps: Vec<StepDefinition>) -> Self {
        Self {
            store,
            steps,
            state: WizardState::Step(0),
            completed: BTreeSet::new(),
        }
    }

    /// Continue where `session` left off
    pub fn resume(store: DraftStore, steps: Vec<StepDefinition>, session: &Session) -> Self {
        let last = steps.len().saturating_sub(1);
        let completed = steps
            .iter()
            .enumerate()
            .filter(|(_, s)| session.completed_steps.contains(&s.id))
            .map(|(i, _)| i)
            .collect();
        Self {
            store,
            state: WizardState::Step(session.current_step.min(last)),
            steps,
            completed,
        }
    }

    pub fn state(&self) -> WizardState {
        self.state
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn store(&self) -> &DraftStore {
        &self.store
    }

    pub fn current_step(&self) -> Option<&StepDefinition> {
        match self.state {
            WizardState::Step(i) => self.steps.get(i),
            WizardState::Completed => None,
        }
    }

    pub fn is_completed(&self, index: usize) -> bool {
        self.completed.contains(&index)
    }

    pub fn highest_completed(&self) -> Option<usize> {
        self.completed.iter().next_back().copied()
    }

    /// Cached verdict of the current step, computed locally when missing
    pub fn current_verdict(&self) -> Option<Verdict> {
        let step = self.current_step()?;
        Some(
            self.store
                .verdict(&step.id)
                .unwrap_or_else(|| self.store.validate_step(&step.id)),
        )
    }

    /// Whether `next`/`complete` would pass the verdict gate
    pub fn can_advance(&self) -> bool {
        match self.current_step() {
            Some(step) => step.optional || self.current_verdict().is_some_and(|v| v.is_valid),
            None => false,
        }
    }

    pub fn can_jump_to(&self, index: usize) -> bool {
        match self.state {
            WizardState::Step(current) if index < self.steps.len() => {
                index == current
                    || self.completed.contains(&index)
                    || self.highest_completed().is_some_and(|h| index <= h)
            }
            _ => false,
        }
    }

    fn current_index(&self) -> Result<usize, WizardError> {
        match self.state {
            WizardState::Step(i) => Ok(i),
            WizardState::Completed => Err(WizardError::AlreadyCompleted),
        }
    }

    /// Validate, save and mark the step at `index` before leaving it
    async fn leave_step(&mut self, index: usize) -> Result<(), WizardError> {
        let step = &self.steps[index];
        let verdict = self.store.validate_step_remote(&step.id).await;
        if !verdict.is_valid && !step.optional {
            log::debug!("Step '{}' blocked: {:?}", step.id, verdict.errors);
            return Err(WizardError::StepInvalid {
                step: step.id.clone(),
                errors: verdict.errors,
            });
        }

        self.store
            .save_now()
            .await
            .map_err(WizardError::SaveFailed)?;

        if let Err(e) = self.store.mark_step_completed(&step.id).await {
            log::warn!("Could not record completion of '{}': {}", step.id, e);
        }
        self.completed.insert(index);
        Ok(())
    }

    /// Move forward one step
    pub async fn next(&mut self) -> Result<WizardState, WizardError> {
        let index = self.current_index()?;
        if index + 1 >= self.steps.len() {
            return Err(WizardError::UnknownStep(index + 1));
        }
        self.leave_step(index).await?;
        self.state = WizardState::Step(index + 1);
        log::info!("Wizard moved to step {} ({})", index + 1, self.steps[index + 1].id);
        Ok(self.state)
    }

    /// Move back one step; a no-op at the first step
    pub fn previous(&mut self) -> WizardState {
        if let WizardState::Step(i) = self.state {
            self.state = WizardState::Step(i.saturating_sub(1));
        }
        self.state
    }

    pub fn jump_to(&mut self, index: usize) -> Result<WizardState, WizardError> {
        self.current_index()?;
        if index >= self.steps.len() {
            return Err(WizardError::UnknownStep(index));
        }
        if !self.can_jump_to(index) {
            return Err(WizardError::StepLocked { index });
        }
        self.state = WizardState::Step(index);
        Ok(self.state)
    }

    /// Finish the wizard from the last step; returns the property id
    pub async fn complete(&mut self) -> Result<String, OnboardingError> {
        let index = self.current_index()?;
        if index + 1 != self.steps.len() {
            return Err(WizardError::NotLastStep.into());
        }
        self.leave_step(index).await?;
        let property_id = self.store.complete_session().await?;
        self.state = WizardState::Completed;
        log::info!("Wizard completed, property {}", property_id);
        Ok(property_id)
    }
}
