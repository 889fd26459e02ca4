//! Integration tests for draft synchronization
//!
//! These tests drive the real `HttpSessionClient` against an in-process
//! axum mock of the onboarding API.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use onboard_sync::cache::{DraftCache, FileDraftCache, MemoryDraftCache};
use onboard_sync::draft::{Draft, DraftStore, SaveOutcome, StoreDeps, SyncStatus};
use onboard_sync::error::{SaveError, WizardError};
use onboard_sync::network::NetworkMonitor;
use onboard_sync::offline::EntryKind;
use onboard_sync::session::{
    Backoff, HttpSessionClient, RemoteDraft, SaveReceipt, Session, SessionClient,
};
use onboard_sync::wizard::{WizardController, WizardLoader, WizardState};
use onboard_sync::SyncConfig;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Mock onboarding API
// ============================================================================

#[derive(Default)]
struct ApiState {
    next_id: u32,
    sessions: HashMap<String, Session>,
    drafts: HashMap<String, RemoteDraft>,
    /// Bodies of accepted draft writes
    saves: Vec<(String, Value)>,
    calls: Vec<String>,
    rate_limit_saves: u32,
    down: bool,
    expired: HashSet<String>,
}

#[derive(Clone, Default)]
struct MockApi {
    state: Arc<Mutex<ApiState>>,
}

impl MockApi {
    fn with<R>(&self, f: impl FnOnce(&mut ApiState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn saves(&self) -> Vec<(String, Value)> {
        self.with(|s| s.saves.clone())
    }

    fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }
}

fn error(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

async fn create_session(State(api): State<MockApi>, Json(body): Json<Value>) -> Response {
    api.with(|s| {
        s.next_id += 1;
        let id = format!("s{}", s.next_id);
        let session = Session {
            id: id.clone(),
            property_id: body["propertyId"].as_str().map(str::to_string),
            current_step: 0,
            completed_steps: BTreeSet::new(),
            quality_score: None,
            expires_at: Utc::now() + chrono::Duration::days(1),
        };
        s.sessions.insert(id.clone(), session.clone());
        s.drafts.insert(id, RemoteDraft::default());
        s.calls.push("create".to_string());
        Json(session).into_response()
    })
}

async fn get_session(State(api): State<MockApi>, Path(id): Path<String>) -> Response {
    api.with(|s| match s.sessions.get(&id) {
        Some(session) if !s.expired.contains(&id) => Json(session.clone()).into_response(),
        _ => error(StatusCode::NOT_FOUND, json!({"message": "no such session"})),
    })
}

async fn save_draft(
    State(api): State<MockApi>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    api.with(|s| {
        if s.down {
            return error(StatusCode::SERVICE_UNAVAILABLE, json!({"message": "maintenance"}));
        }
        if s.expired.contains(&id) {
            return error(StatusCode::GONE, json!({"message": "session expired"}));
        }
        if s.rate_limit_saves > 0 {
            s.rate_limit_saves -= 1;
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, "1")],
                Json(json!({"message": "slow down"})),
            )
                .into_response();
        }
        if body["steps"]["basic-details"]["name"] == json!("Bad Words Inn") {
            return error(
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({
                    "message": "Validation failed",
                    "errors": {"basic-details": ["Name violates listing policy"]}
                }),
            );
        }

        let steps: Draft = match serde_json::from_value(body["steps"].clone()) {
            Ok(steps) => steps,
            Err(_) => return error(StatusCode::BAD_REQUEST, json!({"message": "bad steps"})),
        };
        let draft = s.drafts.entry(id.clone()).or_default();
        draft.steps.merge_steps(&steps);
        draft.version += 1;
        draft.updated_at = Some(Utc::now());
        let receipt = SaveReceipt {
            version: draft.version,
            saved_at: Utc::now(),
        };
        s.saves.push((id, body["steps"].clone()));
        s.calls.push("save".to_string());
        Json(receipt).into_response()
    })
}

async fn load_draft(State(api): State<MockApi>, Path(id): Path<String>) -> Response {
    api.with(|s| match s.drafts.get(&id) {
        Some(draft) => Json(draft.clone()).into_response(),
        None => error(StatusCode::NOT_FOUND, json!({"message": "no such session"})),
    })
}

async fn complete_step(
    State(api): State<MockApi>,
    Path((id, step)): Path<(String, String)>,
) -> Response {
    api.with(|s| {
        s.calls.push(format!("complete:{}", step));
        match s.sessions.get_mut(&id) {
            Some(session) => {
                session.completed_steps.insert(step);
                session.current_step = session.completed_steps.len();
                Json(session.clone()).into_response()
            }
            None => error(StatusCode::NOT_FOUND, json!({"message": "no such session"})),
        }
    })
}

async fn validate_step(
    State(api): State<MockApi>,
    Path((_id, step)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    api.with(|s| s.calls.push(format!("validate:{}", step)));
    if body["data"]["name"] == json!("Grand Plaza") {
        return Json(json!({"errors": ["Name already registered"], "warnings": []})).into_response();
    }
    Json(json!({"errors": [], "warnings": ["Add photos to rank higher"]})).into_response()
}

async fn upload_image(State(api): State<MockApi>, Json(body): Json<Value>) -> Response {
    api.with(|s| {
        s.calls
            .push(format!("image:{}", body["stepId"].as_str().unwrap_or_default()))
    });
    StatusCode::NO_CONTENT.into_response()
}

async fn complete_session(State(api): State<MockApi>, Path(id): Path<String>) -> Response {
    api.with(|s| {
        s.calls.push("finish".to_string());
        Json(json!({"propertyId": format!("prop-{}", id)})).into_response()
    })
}

async fn spawn_api() -> (MockApi, String) {
    let api = MockApi::default();
    let app = Router::new()
        .route("/api/onboarding/sessions", post(create_session))
        .route("/api/onboarding/sessions/{id}", get(get_session))
        .route(
            "/api/onboarding/sessions/{id}/draft",
            put(save_draft).get(load_draft),
        )
        .route(
            "/api/onboarding/sessions/{id}/steps/{step}/complete",
            post(complete_step),
        )
        .route(
            "/api/onboarding/sessions/{id}/steps/{step}/validate",
            post(validate_step),
        )
        .route("/api/onboarding/sessions/{id}/images", post(upload_image))
        .route("/api/onboarding/sessions/{id}/complete", post(complete_session))
        .with_state(api.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (api, format!("http://{}/api/onboarding", addr))
}

// ============================================================================
// Harness
// ============================================================================

const WIZARD: &str = r#"
name: Hotel onboarding
steps:
  - id: basic-details
    title: Basic details
    schema:
      name: { type: string, required: true, min_length: 3 }
      hotelType: { type: string, one_of: [HOTEL, HOSTEL, RESORT] }
  - id: photos
    title: Photos
    optional: true
  - id: pricing
    title: Pricing
    schema:
      rate: { type: number, required: true, min: 1 }
"#;

struct Harness {
    api: MockApi,
    client: Arc<HttpSessionClient>,
    store: DraftStore,
    network: NetworkMonitor,
    base_url: String,
}

fn config(base_url: &str) -> SyncConfig {
    SyncConfig {
        api_base_url: base_url.to_string(),
        debounce_ms: 150,
        backoff_base_ms: 200,
        backoff_max_ms: 2_000,
        ..SyncConfig::default()
    }
}

fn build_store(
    base_url: &str,
    cache: Arc<dyn DraftCache>,
) -> (Arc<HttpSessionClient>, DraftStore, NetworkMonitor) {
    let config = config(base_url);
    let client = Arc::new(HttpSessionClient::from_config(&config).unwrap());
    let def = WizardLoader::parse_yaml(WIZARD).unwrap();
    let network = NetworkMonitor::default();
    let store = DraftStore::new(
        StoreDeps {
            client: client.clone(),
            cache,
            pipeline: def.pipeline().with_remote(
                client.clone(),
                Backoff::new(config.backoff_base(), config.backoff_max()),
            ),
            network: network.clone(),
        },
        &config,
    );
    (client, store, network)
}

async fn harness() -> Harness {
    harness_with(Arc::new(MemoryDraftCache::new())).await
}

async fn harness_with(cache: Arc<dyn DraftCache>) -> Harness {
    let (api, base_url) = spawn_api().await;
    let (client, store, network) = build_store(&base_url, cache);
    Harness {
        api,
        client,
        store,
        network,
        base_url,
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// Draft persistence
// ============================================================================

#[tokio::test]
async fn test_offline_edits_sync_once_on_reconnect() {
    let h = harness().await;
    h.store.init_session(None).await.unwrap();
    let observer = h.store.spawn_network_observer();

    h.network.set_reachable(false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    for (field, value) in [
        ("name", json!("Seaside Inn")),
        ("hotelType", json!("HOTEL")),
        ("name", json!("Seaside Inn & Spa")),
    ] {
        h.store.update_field("basic-details", field, value);
        assert_eq!(
            h.store.save_now().await,
            Ok(SaveOutcome::SavedLocally { queued: true })
        );
    }
    assert_eq!(h.store.queued_count(), 1);
    assert!(h.api.saves().is_empty());

    h.network.set_reachable(true);
    eventually("replayed draft", || h.api.saves().len() == 1).await;
    eventually("store confirmed", || !h.store.is_dirty()).await;

    let (session_id, steps) = &h.api.saves()[0];
    assert_eq!(session_id, "s1");
    assert_eq!(
        steps,
        &json!({"basic-details": {"name": "Seaside Inn & Spa", "hotelType": "HOTEL"}})
    );
    assert_eq!(h.store.queued_count(), 0);
    assert_eq!(h.store.status(), SyncStatus::Saved);
    observer.abort();
}

#[tokio::test]
async fn test_debounced_autosave_sends_final_state() {
    let h = harness().await;
    h.store.init_session(None).await.unwrap();

    for name in ["Gr", "Gran", "Grand", "Grand P", "Grand Palace"] {
        h.store.update_field("basic-details", "name", json!(name));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(h.api.saves().is_empty());

    eventually("debounced save", || h.api.saves().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let saves = h.api.saves();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].1["basic-details"]["name"], json!("Grand Palace"));
    assert!(h.store.last_saved_at().is_some());
}

#[tokio::test]
async fn test_rate_limited_save_honors_retry_after() {
    let h = harness().await;
    h.store.init_session(None).await.unwrap();
    h.api.with(|s| s.rate_limit_saves = 1);

    h.store.update_field("basic-details", "name", json!("Seaside Inn"));
    assert_eq!(
        h.store.save_now().await,
        Ok(SaveOutcome::Retrying {
            after: Duration::from_secs(1)
        })
    );
    assert_eq!(h.store.status(), SyncStatus::Retrying);

    eventually("retried save", || h.api.saves().len() == 1).await;
    eventually("saved status", || h.store.status() == SyncStatus::Saved).await;
    assert!(!h.store.is_dirty());
}

#[tokio::test]
async fn test_server_outage_recovers_through_queue() {
    let h = harness().await;
    h.store.init_session(None).await.unwrap();
    h.api.with(|s| s.down = true);

    h.store.update_field("basic-details", "name", json!("Seaside Inn"));
    assert_eq!(
        h.store.save_now().await,
        Ok(SaveOutcome::SavedLocally { queued: true })
    );
    assert_eq!(h.store.queued_count(), 1);

    h.api.with(|s| s.down = false);
    eventually("queue drained", || h.store.queued_count() == 0).await;
    assert_eq!(h.api.saves().len(), 1);
    eventually("store confirmed", || !h.store.is_dirty()).await;
}

#[tokio::test]
async fn test_rejected_save_rolls_back_to_server_state() {
    let h = harness().await;
    h.store.init_session(None).await.unwrap();
    h.store.update_field("basic-details", "name", json!("Seaside Inn"));
    h.store.save_now().await.unwrap();

    h.store.update_field("basic-details", "name", json!("Bad Words Inn"));
    match h.store.save_now().await {
        Err(SaveError::Rejected { step_errors, .. }) => {
            assert_eq!(step_errors["basic-details"], vec!["Name violates listing policy"]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        h.store.verdict("basic-details").unwrap().errors,
        vec!["Name violates listing policy"]
    );

    assert!(h.store.rollback());
    let server = h.client.load_draft("s1").await.unwrap();
    assert_eq!(h.store.draft(), server.steps);
    assert!(h.store.verdict("basic-details").unwrap().is_valid);
}

#[tokio::test]
async fn test_offline_mutations_replay_in_order() {
    let h = harness().await;
    h.store.init_session(None).await.unwrap();
    h.network.set_reachable(false);

    h.store.update_field("basic-details", "name", json!("Seaside Inn"));
    h.store.save_now().await.unwrap();
    h.store.mark_step_completed("basic-details").await.unwrap();
    h.store
        .queue_image_upload("photos", json!({"fileName": "lobby.jpg", "size": 20480}))
        .unwrap();
    h.store.update_field("pricing", "rate", json!(95));
    h.store.save_now().await.unwrap();

    let kinds: Vec<EntryKind> = h.store.queue().entries().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EntryKind::Draft,
            EntryKind::StepCompletion,
            EntryKind::ImageUpload,
            EntryKind::Draft
        ]
    );

    h.network.set_reachable(true);
    let report = h.store.reconnect().await;
    assert!(report.is_clean());
    assert_eq!(
        h.api.calls(),
        vec![
            "create",
            "save",
            "complete:basic-details",
            "image:photos",
            "save"
        ]
    );
    assert!(!h.store.is_dirty());

    let status = h.client.get_status("s1").await.unwrap();
    assert!(status.completed_steps.contains("basic-details"));
}

#[tokio::test]
async fn test_expired_session_is_replaced() {
    let h = harness().await;
    h.store.init_session(None).await.unwrap();
    h.api.with(|s| {
        s.expired.insert("s1".to_string());
    });

    h.store.update_field("basic-details", "name", json!("Seaside Inn"));
    assert_eq!(
        h.store.save_now().await,
        Err(SaveError::SessionExpired {
            session_id: "s1".to_string()
        })
    );

    let session = h.store.reinit_session().await.unwrap();
    assert_eq!(session.id, "s2");
    let remote = h.client.load_draft("s2").await.unwrap();
    assert_eq!(remote.steps, h.store.draft());
}

#[tokio::test]
async fn test_resume_after_reload_uses_file_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache: Arc<dyn DraftCache> =
        Arc::new(FileDraftCache::open(dir.path(), 1 << 20).unwrap());
    let h = harness_with(cache).await;
    let session = h.store.init_session(None).await.unwrap();
    h.store.update_field("basic-details", "name", json!("Seaside Inn"));
    h.store.save_now().await.unwrap();

    // Offline edit that never reached the server
    h.network.set_reachable(false);
    h.store.update_field("basic-details", "hotelType", json!("RESORT"));
    h.store.save_now().await.unwrap();
    let local = h.store.draft();
    drop(h.store);

    let reopened: Arc<dyn DraftCache> =
        Arc::new(FileDraftCache::open(dir.path(), 1 << 20).unwrap());
    let (_client, store, _network) = build_store(&h.base_url, reopened);
    assert_eq!(store.last_active_session().as_deref(), Some(session.id.as_str()));
    assert_eq!(store.queued_count(), 1);

    store.resume_session(&session.id).await.unwrap();
    assert_eq!(store.draft(), local);
    assert!(store.is_dirty());

    let report = store.reconnect().await;
    assert_eq!(report.applied, 1);
    assert_eq!(h.api.saves().len(), 2);
    assert_eq!(h.client.load_draft(&session.id).await.unwrap().steps, local);
}

// ============================================================================
// Wizard
// ============================================================================

#[tokio::test]
async fn test_wizard_runs_to_completion() {
    let h = harness().await;
    let session = h.store.init_session(None).await.unwrap();
    let steps = WizardLoader::parse_yaml(WIZARD).unwrap().steps;
    let mut wizard = WizardController::resume(h.store.clone(), steps, &session);
    assert_eq!(wizard.state(), WizardState::Step(0));

    // Local tier blocks before the server is asked
    h.store.update_field("basic-details", "name", json!("GP"));
    assert!(!wizard.can_advance());
    assert!(matches!(
        wizard.next().await,
        Err(WizardError::StepInvalid { .. })
    ));

    // Server tier rejects a taken name
    h.store.update_field("basic-details", "name", json!("Grand Plaza"));
    match wizard.next().await {
        Err(WizardError::StepInvalid { errors, .. }) => {
            assert_eq!(errors, vec!["Name already registered"])
        }
        other => panic!("unexpected {:?}", other),
    }

    h.store.update_field("basic-details", "name", json!("Seaside Inn"));
    assert_eq!(wizard.next().await.unwrap(), WizardState::Step(1));
    assert_eq!(
        h.store.verdict("basic-details").unwrap().warnings,
        vec!["Add photos to rank higher"]
    );
    assert_eq!(wizard.next().await.unwrap(), WizardState::Step(2));
    assert_eq!(wizard.jump_to(0), Ok(WizardState::Step(0)));
    assert_eq!(wizard.jump_to(2), Err(WizardError::StepLocked { index: 2 }));
    wizard.jump_to(1).unwrap();
    wizard.next().await.unwrap();

    h.store.update_field("pricing", "rate", json!(120));
    let property_id = wizard.complete().await.unwrap();
    assert_eq!(property_id, "prop-s1");
    assert_eq!(wizard.state(), WizardState::Completed);
    assert_eq!(h.store.status(), SyncStatus::Completed);

    let calls = h.api.calls();
    assert_eq!(calls.last().map(String::as_str), Some("finish"));
    assert!(calls.contains(&"complete:pricing".to_string()));
    let remote = h.client.load_draft("s1").await.unwrap();
    assert_eq!(remote.steps.field("pricing", "rate"), Some(&json!(120)));
}
