// SPDX-License-Identifier: MIT

//! Draft store: optimistic updates, rollback and save orchestration
//!
//! The store owns the draft. Edits apply immediately and are validated
//! locally; persistence happens later through the autosave timer, with the
//! durable cache written first and the remote session second. Anything the
//! remote does not confirm ends up in the offline queue.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::{AutosaveScheduler, CachedDraft, Draft, PendingMutation, StepId};
use crate::cache::{read_json, write_json, CacheKeys, DraftCache};
use crate::config::SyncConfig;
use crate::error::{OnboardingError, SaveError, SessionError};
use crate::network::NetworkMonitor;
use crate::offline::{OfflineQueue, QueueEntry, ReplayFailure, ReplayReport, ReplayedDraft};
use crate::session::{Backoff, ErrorClass, SaveReceipt, Session, SessionClient};
use crate::validation::{FieldReport, ValidationPipeline, Verdict};

/// Collaborators handed to a `DraftStore`
pub struct StoreDeps {
    pub client: Arc<dyn SessionClient>,
    pub cache: Arc<dyn DraftCache>,
    pub pipeline: ValidationPipeline,
    pub network: NetworkMonitor,
}

/// Result of a save attempt
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// The remote accepted the draft
    Saved {
        version: u64,
        saved_at: DateTime<Utc>,
    },
    /// Content equals the last persisted draft; nothing was sent
    Unchanged,
    /// Kept in the cache, and in the offline queue when `queued`
    SavedLocally { queued: bool },
    /// Rate limited; a retry is scheduled
    Retrying { after: Duration },
    /// The store was reset while the save was running
    Discarded,
}

/// Persistence state shown to the user
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SyncStatus {
    #[default]
    Idle,
    Saving,
    Saved,
    SavedLocally,
    Retrying,
    Failed(String),
    SessionExpired,
    /// Queued offline edits lost to newer server state; see `superseded_draft`
    Superseded,
    Completed,
}

#[derive(Clone, Copy)]
enum RetryAction {
    Save,
    Replay,
}

struct FailureRecord {
    hash: String,
    count: u32,
}

struct SaveJob {
    epoch: u64,
    /// `StoreState::rollbacks` when the job was prepared
    rollbacks: u64,
    draft: Draft,
    hash: String,
    /// First mutation sequence number not included in `draft`
    through_seq: u64,
    session_id: Option<String>,
    version: Option<u64>,
}

#[derive(Default)]
struct StoreState {
    epoch: u64,
    /// Bumped by every rollback; in-flight content from before it was discarded
    rollbacks: u64,
    session: Option<Session>,
    local_only: bool,
    draft: Draft,
    snapshot: Option<Draft>,
    pending: Vec<PendingMutation>,
    next_seq: u64,
    verdicts: HashMap<StepId, Verdict>,
    field_errors: HashMap<(StepId, String), FieldReport>,
    remote_errors: HashMap<StepId, Vec<String>>,
    version: Option<u64>,
    last_saved_hash: Option<String>,
    last_saved_at: Option<DateTime<Utc>>,
    failures: Option<FailureRecord>,
    queued_hash: Option<String>,
    queued_through: Option<u64>,
    retry_attempt: u32,
    saving: bool,
    dirty: bool,
    status: SyncStatus,
}

impl StoreState {
    /// Take `draft` as the confirmed server state
    fn adopt(&mut self, pipeline: &ValidationPipeline, draft: Draft, version: Option<u64>) {
        self.last_saved_hash = Some(draft.content_hash());
        self.draft = draft;
        self.version = version;
        self.snapshot = None;
        self.pending.clear();
        self.failures = None;
        self.queued_hash = None;
        self.queued_through = None;
        self.remote_errors.clear();
        self.field_errors.clear();
        self.dirty = false;
        self.refresh_verdicts(pipeline);
    }

    fn refresh_verdicts(&mut self, pipeline: &ValidationPipeline) {
        self.verdicts = pipeline.validate_all(&self.draft).into_iter().collect();
    }

    fn apply_remote_errors(
        &mut self,
        pipeline: &ValidationPipeline,
        step_errors: &BTreeMap<String, Vec<String>>,
    ) {
        for (step, errors) in step_errors {
            self.remote_errors.insert(step.clone(), errors.clone());
            let verdict = pipeline
                .validate_local(step, self.draft.step(step))
                .with_errors(errors);
            self.verdicts.insert(step.clone(), verdict);
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.id.clone())
    }
}

struct StoreInner {
    client: Arc<dyn SessionClient>,
    cache: Arc<dyn DraftCache>,
    pipeline: ValidationPipeline,
    network: NetworkMonitor,
    keys: CacheKeys,
    backoff: Backoff,
    max_identical_failures: u32,
    queue: OfflineQueue,
    autosave: AutosaveScheduler,
    retry: AutosaveScheduler,
    state: Mutex<StoreState>,
    save_gate: tokio::sync::Mutex<()>,
    init_gate: tokio::sync::Mutex<()>,
}

/// Owner of the in-progress draft and its persistence
///
/// Cloning is cheap and every clone drives the same store. Methods that
/// schedule background work must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct DraftStore {
    inner: Arc<StoreInner>,
}

impl DraftStore {
    pub fn new(deps: StoreDeps, config: &SyncConfig) -> Self {
        let keys = CacheKeys::new(config.cache_namespace.clone());
        let queue = OfflineQueue::load(deps.cache.clone(), keys.queue(), config.stale_after());
        Self {
            inner: Arc::new(StoreInner {
                client: deps.client,
                cache: deps.cache,
                pipeline: deps.pipeline,
                network: deps.network,
                keys,
                backoff: Backoff::new(config.backoff_base(), config.backoff_max()),
                max_identical_failures: config.max_identical_failures.max(1),
                queue,
                autosave: AutosaveScheduler::new(config.debounce()),
                retry: AutosaveScheduler::new(config.debounce()),
                state: Mutex::new(StoreState::default()),
                save_gate: tokio::sync::Mutex::new(()),
                init_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn upgrade(weak: &Weak<StoreInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ---- session lifecycle ----

    /// Create the remote session, once
    ///
    /// On failure the store keeps working in local-only mode and the call
    /// can be repeated later.
    pub async fn init_session(&self, property_id: Option<&str>) -> Result<Session, OnboardingError> {
        if let Some(session) = self.session() {
            return Ok(session);
        }
        let _gate = self.inner.init_gate.lock().await;
        if let Some(session) = self.session() {
            return Ok(session);
        }

        let epoch = self.state().epoch;
        match self.inner.client.create_session(property_id).await {
            Ok(session) => {
                log::info!("Created onboarding session {}", session.id);
                let needs_save = {
                    let mut st = self.state();
                    if st.epoch != epoch {
                        log::debug!("Store reset during session init, not adopting {}", session.id);
                        return Ok(session);
                    }
                    st.session = Some(session.clone());
                    st.local_only = false;
                    st.version = None;
                    self.hydrate_local(&mut st);
                    st.dirty
                };
                self.remember_session(&session.id);
                if needs_save {
                    self.schedule_autosave();
                }
                Ok(session)
            }
            Err(e) => {
                log::warn!("Session init failed, continuing local-only: {}", e);
                self.state().local_only = true;
                Err(OnboardingError::SessionInit(e))
            }
        }
    }

    /// Adopt a draft written before any session existed
    fn hydrate_local(&self, st: &mut StoreState) {
        if !st.draft.is_empty() {
            return;
        }
        let key = self.inner.keys.draft(None);
        match read_json::<CachedDraft>(self.inner.cache.as_ref(), &key) {
            Ok(Some(record)) if !record.draft.is_empty() => {
                log::info!("Adopting local draft with {} steps", record.draft.len());
                st.snapshot.get_or_insert_with(Draft::new);
                st.draft = record.draft;
                st.dirty = true;
                st.refresh_verdicts(&self.inner.pipeline);
            }
            Ok(_) => {}
            Err(e) => log::warn!("Local draft unreadable: {}", e),
        }
    }

    /// Continue an existing session, reconciling the server and cached drafts
    pub async fn resume_session(&self, session_id: &str) -> Result<Session, OnboardingError> {
        let _gate = self.inner.init_gate.lock().await;
        let epoch = self.state().epoch;

        let session = self
            .inner
            .client
            .get_status(session_id)
            .await
            .map_err(|e| session_failure(session_id, e))?;
        if session.is_expired(Utc::now()) {
            log::error!("Session {} expired at {}", session_id, session.expires_at);
            return Err(OnboardingError::SessionExpired {
                session_id: session_id.to_string(),
            });
        }
        let remote = self
            .inner
            .client
            .load_draft(session_id)
            .await
            .map_err(|e| session_failure(session_id, e))?;

        let cached = match read_json::<CachedDraft>(
            self.inner.cache.as_ref(),
            &self.inner.keys.draft(Some(session_id)),
        ) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Cached draft for {} unreadable: {}", session_id, e);
                None
            }
        };

        let needs_save = {
            let mut st = self.state();
            if st.epoch != epoch {
                return Ok(session);
            }
            st.session = Some(session.clone());
            st.local_only = false;
            let remote_hash = remote.steps.content_hash();
            st.adopt(&self.inner.pipeline, remote.steps.clone(), Some(remote.version));

            let local = cached.filter(|record| {
                !record.confirmed
                    && record.content_hash != remote_hash
                    && remote.updated_at.map_or(true, |at| record.saved_at > at)
            });
            match local {
                Some(record) => {
                    log::info!(
                        "Cached draft for {} is newer than server version {}",
                        session_id,
                        remote.version
                    );
                    st.snapshot = Some(remote.steps);
                    st.draft = record.draft;
                    st.dirty = true;
                    st.refresh_verdicts(&self.inner.pipeline);
                    true
                }
                None => false,
            }
        };

        self.remember_session(session_id);
        if needs_save {
            self.schedule_autosave();
        }
        log::info!("Resumed session {} at step {}", session.id, session.current_step);
        Ok(session)
    }

    /// Replace an expired session and resubmit the preserved draft
    pub async fn reinit_session(&self) -> Result<Session, OnboardingError> {
        let (old_id, property_id, epoch) = {
            let st = self.state();
            (
                st.session_id(),
                st.session.as_ref().and_then(|s| s.property_id.clone()),
                st.epoch,
            )
        };

        let session = {
            let _gate = self.inner.init_gate.lock().await;
            self.inner
                .client
                .create_session(property_id.as_deref())
                .await
                .map_err(OnboardingError::SessionInit)?
        };
        log::info!(
            "Re-initialized session {} (was {})",
            session.id,
            old_id.as_deref().unwrap_or("none")
        );

        {
            let mut st = self.state();
            if st.epoch != epoch {
                return Ok(session);
            }
            st.session = Some(session.clone());
            st.local_only = false;
            st.version = None;
            st.last_saved_hash = None;
            st.failures = None;
            st.queued_hash = None;
            st.queued_through = None;
            st.dirty = !st.draft.is_empty();
            st.status = SyncStatus::Idle;
        }
        if let Some(old_id) = old_id {
            self.inner.queue.rebind_session(&old_id, &session.id);
            if let Err(e) = self.inner.cache.remove(&self.inner.keys.draft(Some(&old_id))) {
                log::warn!("Could not drop cached draft of {}: {}", old_id, e);
            }
        }
        self.remember_session(&session.id);

        let outcome = self.save_now().await?;
        log::debug!("Resubmitted draft after re-init: {:?}", outcome);
        Ok(session)
    }

    fn remember_session(&self, session_id: &str) {
        if let Err(e) = self
            .inner
            .cache
            .set(&self.inner.keys.active_session(), session_id)
        {
            log::warn!("Could not record active session: {}", e);
        }
    }

    /// Session id recorded by the last init or resume, if the cache has one
    pub fn last_active_session(&self) -> Option<String> {
        self.inner
            .cache
            .get(&self.inner.keys.active_session())
            .unwrap_or_else(|e| {
                log::warn!("Active session unreadable: {}", e);
                None
            })
    }

    // ---- edits and validation ----

    /// Apply one field change immediately and arm the autosave
    pub fn update_field(&self, step_id: &str, field: &str, value: Value) {
        {
            let mut guard = self.state();
            let st = &mut *guard;
            if st.snapshot.is_none() {
                st.snapshot = Some(st.draft.clone());
            }
            st.draft.set_field(step_id, field, value.clone());

            let seq = st.next_seq;
            st.next_seq += 1;
            st.pending.push(PendingMutation {
                seq,
                step_id: step_id.to_string(),
                field: field.to_string(),
                value,
                timestamp: Utc::now(),
            });

            st.remote_errors.remove(step_id);
            let report = self
                .inner
                .pipeline
                .validate_field(step_id, field, st.draft.field(step_id, field));
            let key = (step_id.to_string(), field.to_string());
            if report.is_clean() {
                st.field_errors.remove(&key);
            } else {
                st.field_errors.insert(key, report);
            }
            let verdict = self
                .inner
                .pipeline
                .validate_local(step_id, st.draft.step(step_id));
            st.verdicts.insert(step_id.to_string(), verdict);
            st.dirty = true;
        }
        self.schedule_autosave();
    }

    /// Local verdict for a step, merged with errors the server reported
    pub fn validate_step(&self, step_id: &str) -> Verdict {
        let mut guard = self.state();
        let st = &mut *guard;
        let local = self
            .inner
            .pipeline
            .validate_local(step_id, st.draft.step(step_id));
        let verdict = match st.remote_errors.get(step_id) {
            Some(errors) => local.with_errors(errors),
            None => local,
        };
        st.verdicts.insert(step_id.to_string(), verdict.clone());
        verdict
    }

    /// Both validation tiers; the verdict is cached unless the step changed meanwhile
    pub async fn validate_step_remote(&self, step_id: &str) -> Verdict {
        let (session_id, payload) = {
            let st = self.state();
            (st.session_id(), st.draft.step(step_id).cloned())
        };
        let verdict = self
            .inner
            .pipeline
            .validate(session_id.as_deref(), step_id, payload.as_ref())
            .await;
        let mut st = self.state();
        if st.draft.step(step_id) == payload.as_ref() {
            st.verdicts.insert(step_id.to_string(), verdict.clone());
        }
        verdict
    }

    /// Restore the last confirmed draft, dropping unconfirmed edits
    pub fn rollback(&self) -> bool {
        let restored = {
            let mut guard = self.state();
            let st = &mut *guard;
            let snapshot = match st.snapshot.take() {
                Some(snapshot) => snapshot,
                None => return false,
            };
            let dropped = st.pending.len();
            let affected: BTreeSet<(StepId, String)> = st
                .pending
                .drain(..)
                .map(|m| (m.step_id, m.field))
                .collect();
            st.draft = snapshot;

            for key in &affected {
                st.field_errors.remove(key);
            }
            let steps: BTreeSet<&StepId> = affected.iter().map(|(step, _)| step).collect();
            for step in steps {
                st.remote_errors.remove(step);
                let verdict = self.inner.pipeline.validate_local(step, st.draft.step(step));
                st.verdicts.insert(step.clone(), verdict);
            }
            st.dirty = false;
            st.queued_hash = None;
            st.queued_through = None;
            st.rollbacks += 1;
            log::info!("Rolled back {} unconfirmed edits", dropped);

            let confirmed = st.last_saved_hash.as_deref() == Some(st.draft.content_hash().as_str());
            (st.session_id(), st.draft.clone(), st.version, confirmed)
        };
        self.inner.autosave.cancel();

        let (session_id, draft, version, confirmed) = restored;
        self.write_record(session_id.as_deref(), &draft, version, confirmed);
        if let Some(session_id) = session_id {
            // Queued drafts hold the discarded edits; the restored draft replaces them in order
            if self.inner.queue.has_pending(&session_id) {
                self.inner.queue.enqueue_draft(&session_id, &draft, version);
            }
        }
        true
    }

    // ---- persistence ----

    fn schedule_autosave(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.autosave.schedule_debounced(move || async move {
            if let Some(store) = DraftStore::upgrade(&weak) {
                store.autosave().await;
            }
        });
    }

    fn schedule_retry(&self, delay: Duration, action: RetryAction) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.retry.schedule(delay, move || async move {
            if let Some(store) = DraftStore::upgrade(&weak) {
                match action {
                    RetryAction::Save => store.autosave().await,
                    RetryAction::Replay => {
                        store.reconnect().await;
                    }
                }
            }
        });
    }

    fn schedule_replay_backoff(&self, retry_after: Option<Duration>) {
        let attempt = {
            let mut st = self.state();
            st.retry_attempt += 1;
            st.retry_attempt
        };
        let delay = self.inner.backoff.after_hint(retry_after, attempt - 1);
        log::info!("Offline replay retry {} in {:?}", attempt, delay);
        self.schedule_retry(delay, RetryAction::Replay);
    }

    /// Start a replay now unless one is due on the backoff timer
    fn kick_replay(&self) {
        if !self.inner.network.is_reachable()
            || self.inner.queue.is_replaying()
            || self.inner.retry.is_pending()
        {
            return;
        }
        let store = self.clone();
        tokio::spawn(async move {
            store.reconnect().await;
        });
    }

    async fn autosave(&self) {
        if let Err(e) = self.persist().await {
            log::warn!("Autosave failed: {}", e);
        }
    }

    /// Persist immediately, dropping the pending debounce timer
    pub async fn save_now(&self) -> Result<SaveOutcome, SaveError> {
        self.inner.autosave.cancel();
        self.persist().await
    }

    async fn persist(&self) -> Result<SaveOutcome, SaveError> {
        let _gate = self.inner.save_gate.lock().await;
        let job = match self.prepare_save()? {
            Some(job) => job,
            None => return Ok(SaveOutcome::Unchanged),
        };

        let cached = self.write_record(job.session_id.as_deref(), &job.draft, job.version, false);
        let session_id = match job.session_id.clone() {
            Some(id) => id,
            None => return self.finish_local(&job, cached),
        };
        if !self.inner.network.is_reachable() || self.inner.queue.has_pending(&session_id) {
            return Ok(self.queue_draft(&job, &session_id));
        }

        log::debug!(
            "Saving draft {} for session {} (base {:?})",
            &job.hash[..12],
            session_id,
            job.version
        );
        match self
            .inner
            .client
            .save_draft(&session_id, &job.draft, job.version)
            .await
        {
            Ok(receipt) => Ok(self.commit(&job, receipt)),
            Err(e) => self.handle_save_failure(&job, &session_id, e),
        }
    }

    fn prepare_save(&self) -> Result<Option<SaveJob>, SaveError> {
        let mut st = self.state();
        let hash = st.draft.content_hash();
        let confirmed = st.last_saved_hash.as_deref() == Some(hash.as_str());
        let queued_other = st
            .queued_hash
            .as_deref()
            .is_some_and(|queued| queued != hash);
        if !st.dirty || (confirmed && !queued_other) {
            if confirmed && !queued_other {
                // Edits reverted to the confirmed content
                st.pending.clear();
                st.snapshot = None;
            }
            st.dirty = false;
            return Ok(None);
        }
        if let Some(failure) = &st.failures {
            if failure.hash == hash && failure.count >= self.inner.max_identical_failures {
                log::debug!("Skipping save of content that failed {} times", failure.count);
                return Err(SaveError::RepeatedFailure {
                    failures: failure.count,
                });
            }
        }
        if st.queued_hash.as_deref() == Some(hash.as_str())
            && st.session_id().is_some_and(|id| self.inner.queue.has_pending(&id))
        {
            return Ok(None);
        }

        st.saving = true;
        st.status = SyncStatus::Saving;
        Ok(Some(SaveJob {
            epoch: st.epoch,
            rollbacks: st.rollbacks,
            draft: st.draft.clone(),
            hash,
            through_seq: st.next_seq,
            session_id: st.session_id(),
            version: st.version,
        }))
    }

    /// Full-record replace of the cached draft; false when the cache refused it
    fn write_record(
        &self,
        session_id: Option<&str>,
        draft: &Draft,
        version: Option<u64>,
        confirmed: bool,
    ) -> bool {
        let record = CachedDraft {
            session_id: session_id.map(str::to_string),
            draft: draft.clone(),
            content_hash: draft.content_hash(),
            version,
            saved_at: Utc::now(),
            confirmed,
        };
        match write_json(
            self.inner.cache.as_ref(),
            &self.inner.keys.draft(session_id),
            &record,
        ) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Draft cache unavailable, continuing remote-only: {}", e);
                false
            }
        }
    }

    fn finish_local(&self, job: &SaveJob, cached: bool) -> Result<SaveOutcome, SaveError> {
        let mut st = self.state();
        if st.epoch != job.epoch {
            return Ok(SaveOutcome::Discarded);
        }
        st.saving = false;
        if cached {
            log::debug!("No session, draft kept in the local cache");
            st.status = SyncStatus::SavedLocally;
            Ok(SaveOutcome::SavedLocally { queued: false })
        } else {
            let message = "no session and the draft cache is unavailable".to_string();
            st.status = SyncStatus::Failed(message.clone());
            Err(SaveError::Unpersisted(message))
        }
    }

    fn queue_draft(&self, job: &SaveJob, session_id: &str) -> SaveOutcome {
        self.inner
            .queue
            .enqueue_draft(session_id, &job.draft, job.version);
        {
            let mut st = self.state();
            if st.epoch == job.epoch {
                st.saving = false;
                st.status = SyncStatus::SavedLocally;
                st.queued_hash = Some(job.hash.clone());
                st.queued_through = Some(job.through_seq);
            }
        }
        self.kick_replay();
        SaveOutcome::SavedLocally { queued: true }
    }

    fn commit(&self, job: &SaveJob, receipt: SaveReceipt) -> SaveOutcome {
        let settled = {
            let mut st = self.state();
            if st.epoch != job.epoch {
                log::debug!("Ignoring save result from before reset");
                return SaveOutcome::Discarded;
            }
            st.saving = false;
            st.version = Some(receipt.version);
            st.last_saved_hash = Some(job.hash.clone());
            st.last_saved_at = Some(receipt.saved_at);
            st.failures = None;
            st.status = SyncStatus::Saved;
            st.pending.retain(|m| m.seq >= job.through_seq);
            if st.draft.content_hash() == job.hash {
                st.snapshot = None;
                st.dirty = false;
                true
            } else {
                if st.rollbacks == job.rollbacks {
                    // Edits made during the save stay unconfirmed on top of it
                    st.snapshot = Some(job.draft.clone());
                } else {
                    log::info!("Saved content was rolled back, restoring it on the server");
                }
                st.dirty = true;
                false
            }
        };

        if settled {
            self.write_record(job.session_id.as_deref(), &job.draft, Some(receipt.version), true);
            if let Err(e) = self.inner.cache.remove(&self.inner.keys.draft(None)) {
                log::warn!("Could not drop local draft record: {}", e);
            }
        } else {
            self.schedule_autosave();
        }
        log::debug!("Draft saved at version {}", receipt.version);
        SaveOutcome::Saved {
            version: receipt.version,
            saved_at: receipt.saved_at,
        }
    }

    fn handle_save_failure(
        &self,
        job: &SaveJob,
        session_id: &str,
        error: SessionError,
    ) -> Result<SaveOutcome, SaveError> {
        let class = error.classify();
        let mut guard = self.state();
        let st = &mut *guard;
        if st.epoch != job.epoch {
            return Ok(SaveOutcome::Discarded);
        }
        st.saving = false;
        let failures = match &st.failures {
            Some(f) if f.hash == job.hash => f.count + 1,
            _ => 1,
        };
        st.failures = Some(FailureRecord {
            hash: job.hash.clone(),
            count: failures,
        });

        match class {
            ErrorClass::RateLimited { retry_after } => {
                if failures >= self.inner.max_identical_failures {
                    log::warn!("Save rate limited {} times, giving up", failures);
                    st.status = SyncStatus::Failed(error.to_string());
                    return Err(SaveError::RepeatedFailure { failures });
                }
                let delay = self.inner.backoff.after_hint(retry_after, failures - 1);
                st.status = SyncStatus::Retrying;
                drop(guard);
                log::info!("Save rate limited, retrying in {:?}", delay);
                self.schedule_retry(delay, RetryAction::Save);
                Ok(SaveOutcome::Retrying { after: delay })
            }
            ErrorClass::Transient => {
                drop(guard);
                log::warn!("Save failed, keeping draft offline: {}", error);
                self.inner
                    .queue
                    .enqueue_draft(session_id, &job.draft, job.version);
                {
                    let mut st = self.state();
                    st.status = SyncStatus::SavedLocally;
                    st.queued_hash = Some(job.hash.clone());
                    st.queued_through = Some(job.through_seq);
                }
                self.schedule_replay_backoff(None);
                Ok(SaveOutcome::SavedLocally { queued: true })
            }
            ErrorClass::Rejected {
                message,
                step_errors,
            } => {
                log::warn!("Draft rejected by server: {}", message);
                st.apply_remote_errors(&self.inner.pipeline, &step_errors);
                st.status = SyncStatus::Failed(message.clone());
                Err(SaveError::Rejected {
                    message,
                    step_errors,
                })
            }
            ErrorClass::SessionExpired => {
                log::error!("Session {} expired while saving", session_id);
                st.status = SyncStatus::SessionExpired;
                Err(SaveError::SessionExpired {
                    session_id: session_id.to_string(),
                })
            }
        }
    }

    // ---- offline replay ----

    /// Run one replay pass of the offline queue
    pub async fn reconnect(&self) -> ReplayReport {
        if !self.inner.network.is_reachable() {
            log::debug!("Network unreachable, replay skipped");
            return ReplayReport {
                remaining: self.inner.queue.len(),
                ..ReplayReport::default()
            };
        }
        let (epoch, rollbacks) = {
            let st = self.state();
            (st.epoch, st.rollbacks)
        };
        let report = self.inner.queue.replay(self.inner.client.as_ref()).await;
        if report.coalesced {
            return report;
        }

        if let Some(replayed) = &report.last_draft {
            self.confirm_replayed(epoch, rollbacks, replayed);
        } else if !report.superseded.is_empty() {
            self.adopt_server_draft(epoch).await;
        }

        match &report.failure {
            Some(failure) => self.handle_replay_failure(epoch, failure),
            None => {
                let mut st = self.state();
                if st.epoch == epoch {
                    st.retry_attempt = 0;
                }
            }
        }
        report
    }

    fn confirm_replayed(&self, epoch: u64, rollbacks: u64, replayed: &ReplayedDraft) {
        let settled = {
            let mut st = self.state();
            if st.epoch != epoch || st.session_id().as_deref() != Some(replayed.session_id.as_str()) {
                return;
            }
            let hash = replayed.draft.content_hash();
            st.version = Some(replayed.version);
            st.last_saved_hash = Some(hash.clone());
            st.last_saved_at = Some(Utc::now());
            st.failures = None;
            if st.queued_hash.as_deref() == Some(hash.as_str()) {
                st.queued_hash = None;
                if let Some(through) = st.queued_through.take() {
                    st.pending.retain(|m| m.seq >= through);
                }
            }
            if st.draft.content_hash() == hash {
                st.snapshot = None;
                st.pending.clear();
                st.dirty = false;
                st.status = SyncStatus::Saved;
                true
            } else {
                if st.rollbacks == rollbacks {
                    st.snapshot = Some(replayed.draft.clone());
                }
                st.dirty = true;
                false
            }
        };
        if settled {
            self.write_record(
                Some(&replayed.session_id),
                &replayed.draft,
                Some(replayed.version),
                true,
            );
        } else {
            self.schedule_autosave();
        }
    }

    /// The server kept newer state than the queued draft; take it unless the user edited since
    async fn adopt_server_draft(&self, epoch: u64) {
        let session_id = match self.state().session_id() {
            Some(id) => id,
            None => return,
        };
        let remote = match self.inner.client.load_draft(&session_id).await {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("Could not load server draft after superseded replay: {}", e);
                return;
            }
        };
        let discarded = {
            let mut st = self.state();
            if st.epoch != epoch {
                return;
            }
            let current = st.draft.content_hash();
            if st.queued_hash.as_deref() != Some(current.as_str()) {
                st.version = Some(remote.version);
                return;
            }
            log::warn!("Local draft superseded by server version {}", remote.version);
            let discarded = st.draft.clone();
            st.adopt(&self.inner.pipeline, remote.steps.clone(), Some(remote.version));
            st.status = SyncStatus::Superseded;
            discarded
        };

        self.write_record(Some(&session_id), &remote.steps, Some(remote.version), true);
        let record = CachedDraft {
            session_id: Some(session_id.clone()),
            content_hash: discarded.content_hash(),
            draft: discarded,
            version: Some(remote.version),
            saved_at: Utc::now(),
            confirmed: false,
        };
        if let Err(e) = write_json(
            self.inner.cache.as_ref(),
            &self.inner.keys.superseded(&session_id),
            &record,
        ) {
            log::error!("Superseded draft for {} could not be kept: {}", session_id, e);
        }
    }

    /// Local draft that lost to newer server state, if one was kept
    pub fn superseded_draft(&self) -> Option<Draft> {
        let session_id = self.state().session_id()?;
        match read_json::<CachedDraft>(
            self.inner.cache.as_ref(),
            &self.inner.keys.superseded(&session_id),
        ) {
            Ok(record) => record.map(|r| r.draft),
            Err(e) => {
                log::warn!("Superseded draft unreadable: {}", e);
                None
            }
        }
    }

    /// Re-apply the superseded draft on top of the server state as new edits
    pub fn restore_superseded(&self) -> bool {
        let draft = match self.superseded_draft() {
            Some(draft) => draft,
            None => return false,
        };
        let current = self.draft();
        let mut restored = 0;
        for step_id in draft.step_ids() {
            let fields = match draft.step(step_id).and_then(Value::as_object) {
                Some(fields) => fields,
                None => continue,
            };
            for (field, value) in fields {
                if current.field(step_id, field) != Some(value) {
                    self.update_field(step_id, field, value.clone());
                    restored += 1;
                }
            }
        }
        log::info!("Restored {} superseded fields", restored);
        self.discard_superseded();
        true
    }

    /// Drop the kept superseded draft
    pub fn discard_superseded(&self) {
        let session_id = match self.state().session_id() {
            Some(id) => id,
            None => return,
        };
        if let Err(e) = self.inner.cache.remove(&self.inner.keys.superseded(&session_id)) {
            log::warn!("Could not drop superseded draft: {}", e);
        }
        let mut st = self.state();
        if st.status == SyncStatus::Superseded {
            st.status = SyncStatus::Saved;
        }
    }

    fn handle_replay_failure(&self, epoch: u64, failure: &ReplayFailure) {
        {
            let mut guard = self.state();
            let st = &mut *guard;
            if st.epoch != epoch {
                return;
            }
            match &failure.class {
                ErrorClass::Transient | ErrorClass::RateLimited { .. } => {
                    st.status = SyncStatus::SavedLocally;
                }
                ErrorClass::Rejected {
                    message,
                    step_errors,
                } => {
                    log::warn!("Queued entry {} rejected: {}", failure.entry_id, message);
                    st.apply_remote_errors(&self.inner.pipeline, step_errors);
                    st.status = SyncStatus::Failed(message.clone());
                    return;
                }
                ErrorClass::SessionExpired => {
                    log::error!("Session expired during replay of {}", failure.entry_id);
                    st.status = SyncStatus::SessionExpired;
                    return;
                }
            }
        }
        let retry_after = match &failure.class {
            ErrorClass::RateLimited { retry_after } => *retry_after,
            _ => None,
        };
        self.schedule_replay_backoff(retry_after);
    }

    /// Replay the queue on every transition back to reachable
    pub fn spawn_network_observer(&self) -> JoinHandle<()> {
        let mut states = self.inner.network.stream();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            // The first item is the state at subscription time
            let _ = states.next().await;
            while let Some(state) = states.next().await {
                if !state.is_reachable() {
                    continue;
                }
                match DraftStore::upgrade(&weak) {
                    Some(store) => {
                        log::info!("Network reachable again, replaying offline queue");
                        store.reconnect().await;
                    }
                    None => break,
                }
            }
        })
    }

    // ---- step progress ----

    /// Record step completion remotely, or queue it behind pending entries
    ///
    /// Returns whether the server confirmed it right away.
    pub async fn mark_step_completed(&self, step_id: &str) -> Result<bool, OnboardingError> {
        let (session_id, epoch) = {
            let mut st = self.state();
            let epoch = st.epoch;
            match st.session.as_mut() {
                Some(session) => {
                    session.completed_steps.insert(step_id.to_string());
                    (session.id.clone(), epoch)
                }
                None => {
                    log::debug!("No session, completion of '{}' kept locally", step_id);
                    return Ok(false);
                }
            }
        };

        if !self.inner.network.is_reachable() || self.inner.queue.has_pending(&session_id) {
            self.inner
                .queue
                .enqueue(QueueEntry::step_completion(&session_id, step_id));
            self.kick_replay();
            return Ok(false);
        }

        match self.inner.client.complete_step(&session_id, step_id).await {
            Ok(session) => {
                let mut st = self.state();
                if st.epoch == epoch {
                    st.session = Some(session);
                }
                Ok(true)
            }
            Err(e) => match e.classify() {
                ErrorClass::Transient | ErrorClass::RateLimited { .. } => {
                    log::warn!("Step completion of '{}' queued: {}", step_id, e);
                    self.inner
                        .queue
                        .enqueue(QueueEntry::step_completion(&session_id, step_id));
                    self.schedule_replay_backoff(None);
                    Ok(false)
                }
                ErrorClass::SessionExpired => {
                    self.state().status = SyncStatus::SessionExpired;
                    Err(OnboardingError::SessionExpired { session_id })
                }
                ErrorClass::Rejected { .. } => Err(OnboardingError::Session(e)),
            },
        }
    }

    /// Record an image upload descriptor for ordered replay
    pub fn queue_image_upload(&self, step_id: &str, payload: Value) -> Result<Uuid, OnboardingError> {
        let session_id = self.state().session_id().ok_or(OnboardingError::NoSession)?;
        let payload = match payload {
            Value::Object(mut map) => {
                map.entry("stepId").or_insert_with(|| json!(step_id));
                Value::Object(map)
            }
            other => json!({ "stepId": step_id, "image": other }),
        };
        let id = self
            .inner
            .queue
            .enqueue(QueueEntry::image_upload(&session_id, payload));
        self.kick_replay();
        Ok(id)
    }

    /// Final save, then finalize the session; returns the property id
    pub async fn complete_session(&self) -> Result<String, OnboardingError> {
        let session_id = self.state().session_id().ok_or(OnboardingError::NoSession)?;
        if self.save_now().await? == SaveOutcome::Discarded {
            return Err(OnboardingError::NoSession);
        }
        if self.inner.queue.has_pending(&session_id) {
            let report = self.reconnect().await;
            if self.inner.queue.has_pending(&session_id) {
                return Err(OnboardingError::Session(SessionError::network(format!(
                    "{} offline entries are still waiting for the server",
                    report.remaining
                ))));
            }
        }

        let epoch = self.state().epoch;
        let property_id = self
            .inner
            .client
            .complete_session(&session_id)
            .await
            .map_err(|e| session_failure(&session_id, e))?;

        self.inner.autosave.cancel();
        self.inner.retry.cancel();
        for key in [
            self.inner.keys.draft(Some(&session_id)),
            self.inner.keys.superseded(&session_id),
            self.inner.keys.active_session(),
        ] {
            if let Err(e) = self.inner.cache.remove(&key) {
                log::warn!("Could not clear '{}': {}", key, e);
            }
        }
        {
            let mut st = self.state();
            if st.epoch == epoch {
                st.snapshot = None;
                st.pending.clear();
                st.dirty = false;
                st.status = SyncStatus::Completed;
                if let Some(session) = st.session.as_mut() {
                    session.property_id = Some(property_id.clone());
                }
            }
        }
        log::info!("Session {} completed as property {}", session_id, property_id);
        Ok(property_id)
    }

    /// Drop all in-memory state; late results from before the reset are ignored
    pub fn reset(&self) {
        self.inner.autosave.cancel();
        self.inner.retry.cancel();
        let mut st = self.state();
        let epoch = st.epoch + 1;
        *st = StoreState {
            epoch,
            ..StoreState::default()
        };
        log::info!("Draft store reset");
    }

    // ---- read accessors ----

    pub fn draft(&self) -> Draft {
        self.state().draft.clone()
    }

    pub fn verdict(&self, step_id: &str) -> Option<Verdict> {
        self.state().verdicts.get(step_id).cloned()
    }

    pub fn field_errors(&self, step_id: &str, field: &str) -> FieldReport {
        self.state()
            .field_errors
            .get(&(step_id.to_string(), field.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_saving(&self) -> bool {
        self.state().saving
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.state().last_saved_at
    }

    /// Field changes not yet confirmed by the server
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Entries waiting in the offline queue
    pub fn queued_count(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn status(&self) -> SyncStatus {
        self.state().status.clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.state().session.clone()
    }

    pub fn is_local_only(&self) -> bool {
        self.state().local_only
    }

    pub fn has_snapshot(&self) -> bool {
        self.state().snapshot.is_some()
    }

    /// Last server draft version known to the store
    pub fn version(&self) -> Option<u64> {
        self.state().version
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.inner.queue
    }

    pub fn pipeline(&self) -> &ValidationPipeline {
        &self.inner.pipeline
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }
}

fn session_failure(session_id: &str, error: SessionError) -> OnboardingError {
    match error.classify() {
        ErrorClass::SessionExpired => OnboardingError::SessionExpired {
            session_id: session_id.to_string(),
        },
        _ => OnboardingError::Session(error),
    }
}
