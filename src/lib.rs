// SPDX-License-Identifier: MIT

//! onboard-sync
//!
//! Draft synchronization and optimistic-update engine for a multi-step
//! property onboarding wizard:
//! - [draft] - the draft, its store and the autosave timer
//! - [offline] - durable queue of unconfirmed mutations
//! - [validation] - local schemas and the remote validation tier
//! - [session] - the remote session API and its HTTP client
//! - [wizard] - step definitions and navigation
//! - [cache], [network], [config], [error] - supporting pieces

pub mod cache;
pub mod config;
pub mod draft;
pub mod error;
pub mod network;
pub mod offline;
pub mod session;
pub mod validation;
pub mod wizard;

pub use config::SyncConfig;
pub use draft::{Draft, DraftStore, SaveOutcome, StoreDeps, SyncStatus};
pub use error::{OnboardingError, SaveError, WizardError};
