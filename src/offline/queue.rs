// SPDX-License-Identifier: MIT

//! Durable FIFO queue and its replay loop

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use super::{EntryKind, QueueEntry};
use crate::cache::{read_json, write_json, DraftCache};
use crate::draft::Draft;
use crate::error::SessionError;
use crate::session::{ErrorClass, SessionClient};

/// Summary of one replay pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    /// Another pass was already running; nothing was done
    pub coalesced: bool,
    /// Entries written to the server
    pub applied: usize,
    /// Stale entries whose content the server already had
    pub already_synced: usize,
    /// Stale entries dropped because the server holds newer state
    pub superseded: Vec<Uuid>,
    /// The entry that stopped the pass
    pub failure: Option<ReplayFailure>,
    /// Latest draft payload written in this pass
    pub last_draft: Option<ReplayedDraft>,
    /// Entries still queued after the pass
    pub remaining: usize,
}

impl ReplayReport {
    pub fn coalesced() -> Self {
        Self {
            coalesced: true,
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        !self.coalesced && self.failure.is_none() && self.remaining == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayFailure {
    pub entry_id: Uuid,
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedDraft {
    pub session_id: String,
    pub draft: Draft,
    pub version: u64,
}

enum EntryOutcome {
    Applied { version: Option<u64> },
    AlreadySynced,
    Superseded { remote_version: u64 },
}

struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    in_flight: Option<Uuid>,
}

/// FIFO of unconfirmed mutations, mirrored to the draft cache on every change
pub struct OfflineQueue {
    cache: Arc<dyn DraftCache>,
    key: String,
    stale_after: Duration,
    state: Mutex<QueueState>,
    replaying: AtomicBool,
}

impl OfflineQueue {
    /// Load (or start) the queue stored under `key`
    pub fn load(cache: Arc<dyn DraftCache>, key: impl Into<String>, stale_after: Duration) -> Self {
        let key = key.into();
        let entries: VecDeque<QueueEntry> = match read_json::<Vec<QueueEntry>>(cache.as_ref(), &key)
        {
            Ok(Some(entries)) => entries.into(),
            Ok(None) => VecDeque::new(),
            Err(e) => {
                log::error!("Offline queue '{}' unreadable: {}", key, e);
                // Keep the raw record around instead of overwriting it
                if let Ok(Some(raw)) = cache.get(&key) {
                    let _ = cache.set(&format!("{}:corrupt", key), &raw);
                }
                VecDeque::new()
            }
        };
        if !entries.is_empty() {
            log::info!("Loaded {} pending offline entries", entries.len());
        }
        Self {
            cache,
            key,
            stale_after,
            state: Mutex::new(QueueState {
                entries,
                in_flight: None,
            }),
            replaying: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &QueueState) {
        let entries: Vec<&QueueEntry> = state.entries.iter().collect();
        let result = if entries.is_empty() {
            self.cache.remove(&self.key)
        } else {
            write_json(self.cache.as_ref(), &self.key, &entries)
        };
        if let Err(e) = result {
            log::warn!("Offline queue kept in memory only: {}", e);
        }
    }

    /// Append an entry and persist the queue
    pub fn enqueue(&self, entry: QueueEntry) -> Uuid {
        let id = entry.id;
        let mut state = self.lock();
        log::info!(
            "Queued {:?} entry {} for session {}",
            entry.kind,
            id,
            entry.session_id
        );
        state.entries.push_back(entry);
        self.persist(&state);
        id
    }

    /// Queue a full-draft snapshot, folding it into the tail draft entry
    ///
    /// A newer full draft supersedes an older one, so consecutive draft
    /// entries of one session collapse into a single write. Entries that are
    /// being replayed are never modified.
    pub fn enqueue_draft(&self, session_id: &str, draft: &Draft, base_version: Option<u64>) -> Uuid {
        let mut state = self.lock();
        let in_flight = state.in_flight;
        if let Some(tail) = state.entries.back_mut() {
            if tail.kind == EntryKind::Draft
                && tail.session_id == session_id
                && Some(tail.id) != in_flight
            {
                tail.payload = draft.to_json();
                tail.updated_at = Utc::now();
                if tail.base_version.is_none() {
                    tail.base_version = base_version;
                }
                let id = tail.id;
                log::debug!("Coalesced draft into queued entry {}", id);
                self.persist(&state);
                return id;
            }
        }
        drop(state);
        self.enqueue(QueueEntry::draft(session_id, draft, base_version))
    }

    /// Move entries of `old` to `new`; the new session has its own versions
    pub fn rebind_session(&self, old: &str, new: &str) -> usize {
        let mut state = self.lock();
        let mut moved = 0;
        for entry in state.entries.iter_mut().filter(|e| e.session_id == old) {
            entry.session_id = new.to_string();
            entry.base_version = None;
            moved += 1;
        }
        if moved > 0 {
            log::info!("Rebound {} queued entries from {} to {}", moved, old, new);
            self.persist(&state);
        }
        moved
    }

    pub fn entries(&self) -> Vec<QueueEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether entries for `session_id` are waiting
    pub fn has_pending(&self, session_id: &str) -> bool {
        self.lock()
            .entries
            .iter()
            .any(|e| e.session_id == session_id)
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }

    fn take_front(&self) -> Option<QueueEntry> {
        let mut state = self.lock();
        let front = state.entries.front().cloned();
        state.in_flight = front.as_ref().map(|e| e.id);
        front
    }

    fn finish(&self, id: Uuid, error: Option<&SessionError>) {
        let mut state = self.lock();
        state.in_flight = None;
        match error {
            None => state.entries.retain(|e| e.id != id),
            Some(err) => {
                if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
                    entry.retry_count += 1;
                    entry.last_error = Some(err.to_string());
                }
            }
        }
        self.persist(&state);
    }

    /// Replay entries oldest first, stopping at the first failure
    ///
    /// A call made while another pass is running returns immediately with
    /// `ReplayReport::coalesced()`.
    pub async fn replay(&self, client: &dyn SessionClient) -> ReplayReport {
        if self.replaying.swap(true, Ordering::SeqCst) {
            log::debug!("Replay already running, coalescing trigger");
            return ReplayReport::coalesced();
        }
        let _guard = ReplayGuard(&self.replaying);

        let mut report = ReplayReport::default();
        let mut written_versions: HashMap<String, u64> = HashMap::new();

        while let Some(entry) = self.take_front() {
            match self.replay_entry(client, &entry, &mut written_versions).await {
                Ok(outcome) => {
                    self.finish(entry.id, None);
                    match outcome {
                        EntryOutcome::Applied { version } => {
                            report.applied += 1;
                            if let (EntryKind::Draft, Some(version)) = (entry.kind, version) {
                                if let Ok(draft) = serde_json::from_value(entry.payload.clone()) {
                                    report.last_draft = Some(ReplayedDraft {
                                        session_id: entry.session_id.clone(),
                                        draft,
                                        version,
                                    });
                                }
                            }
                        }
                        EntryOutcome::AlreadySynced => report.already_synced += 1,
                        EntryOutcome::Superseded { remote_version } => {
                            log::warn!(
                                "Dropping stale entry {}: server is at version {}",
                                entry.id,
                                remote_version
                            );
                            report.superseded.push(entry.id);
                        }
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Replay of entry {} failed (attempt {}): {}",
                        entry.id,
                        entry.retry_count + 1,
                        e
                    );
                    self.finish(entry.id, Some(&e));
                    report.failure = Some(ReplayFailure {
                        entry_id: entry.id,
                        class: e.classify(),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        report.remaining = self.len();
        log::info!(
            "Replay finished: {} applied, {} already synced, {} superseded, {} remaining",
            report.applied,
            report.already_synced,
            report.superseded.len(),
            report.remaining
        );
        report
    }

    async fn replay_entry(
        &self,
        client: &dyn SessionClient,
        entry: &QueueEntry,
        written_versions: &mut HashMap<String, u64>,
    ) -> Result<EntryOutcome, SessionError> {
        match entry.kind {
            EntryKind::Draft => {
                let draft: Draft = serde_json::from_value(entry.payload.clone())
                    .map_err(|e| SessionError::Decode(format!("queued draft: {}", e)))?;
                let base = match (entry.base_version, written_versions.get(&entry.session_id)) {
                    (Some(a), Some(b)) => Some(a.max(*b)),
                    (a, b) => a.or(b.copied()),
                };

                if entry.age(Utc::now()) > self.stale_after {
                    let remote = client.load_draft(&entry.session_id).await?;
                    if draft.is_contained_in(&remote.steps) {
                        return Ok(EntryOutcome::AlreadySynced);
                    }
                    let newer = match base {
                        Some(base) => remote.version > base,
                        None => remote.updated_at.is_some_and(|at| at > entry.updated_at),
                    };
                    if newer {
                        return Ok(EntryOutcome::Superseded {
                            remote_version: remote.version,
                        });
                    }
                }

                let receipt = client.save_draft(&entry.session_id, &draft, base).await?;
                written_versions.insert(entry.session_id.clone(), receipt.version);
                Ok(EntryOutcome::Applied {
                    version: Some(receipt.version),
                })
            }
            EntryKind::StepCompletion => {
                let step_id = entry
                    .payload
                    .get("stepId")
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| SessionError::Decode("queued completion without stepId".into()))?;
                client.complete_step(&entry.session_id, step_id).await?;
                Ok(EntryOutcome::Applied { version: None })
            }
            EntryKind::ImageUpload => {
                client
                    .upload_image(&entry.session_id, &entry.payload)
                    .await?;
                Ok(EntryOutcome::Applied { version: None })
            }
        }
    }
}
