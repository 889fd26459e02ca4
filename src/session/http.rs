// SPDX-License-Identifier: MIT

//! HTTP Session Client - JSON over HTTP against the onboarding API

use super::{RemoteDraft, RemoteValidator, RemoteVerdict, SaveReceipt, Session, SessionClient};
use crate::config::SyncConfig;
use crate::draft::Draft;
use crate::error::{OnboardingError, SessionError};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// reqwest-backed `SessionClient` and `RemoteValidator`
pub struct HttpSessionClient {
    client: Client,
    base_url: Url,
}

impl HttpSessionClient {
    /// Create a client for the API rooted at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OnboardingError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| OnboardingError::config(format!("invalid base url: {}", e)))?;
        // Url::join drops the last segment unless the path ends with a slash
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OnboardingError::config(format!("http client: {}", e)))?;
        Ok(Self { client, base_url })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, OnboardingError> {
        Self::new(&config.api_base_url, config.request_timeout())
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, SessionError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| SessionError::Decode(format!("bad request path '{}': {}", path, e)))?;
        Ok(self.client.request(method, url))
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, SessionError> {
        let resp = builder.send().await?;
        let resp = check_status(resp).await?;
        let text = resp.text().await?;
        log::debug!("Onboarding API response: {}", text);
        serde_json::from_str(&text).map_err(|e| SessionError::Decode(e.to_string()))
    }
}

/// Turn a non-success response into a `SessionError::Status`
async fn check_status(resp: Response) -> Result<Response, SessionError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let text = resp.text().await.unwrap_or_default();
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
    let message = body
        .get("message")
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| text.clone());
    let step_errors = parse_step_errors(&body);

    log::warn!("Onboarding API error {}: {}", status.as_u16(), message);

    Err(SessionError::Status {
        status: status.as_u16(),
        message,
        retry_after,
        step_errors,
    })
}

/// Parse `{"errors": {"<step>": ["msg", ...]}}` from an error body
pub fn parse_step_errors(body: &Value) -> BTreeMap<String, Vec<String>> {
    body.get("errors")
        .and_then(|e| e.as_object())
        .map(|obj| {
            obj.iter()
                .map(|(step, msgs)| {
                    let list = msgs
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|m| m.as_str().map(|s| s.to_string()))
                                .collect()
                        })
                        .unwrap_or_default();
                    (step.clone(), list)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SessionClient for HttpSessionClient {
    async fn create_session(&self, property_id: Option<&str>) -> Result<Session, SessionError> {
        let body = json!({ "propertyId": property_id });
        self.send(self.request(Method::POST, "sessions")?.json(&body))
            .await
    }

    async fn get_status(&self, session_id: &str) -> Result<Session, SessionError> {
        self.send(self.request(Method::GET, &format!("sessions/{}", session_id))?)
            .await
    }

    async fn save_draft(
        &self,
        session_id: &str,
        draft: &Draft,
        base_version: Option<u64>,
    ) -> Result<SaveReceipt, SessionError> {
        let body = json!({ "steps": draft, "baseVersion": base_version });
        self.send(
            self.request(Method::PUT, &format!("sessions/{}/draft", session_id))?
                .json(&body),
        )
        .await
    }

    async fn load_draft(&self, session_id: &str) -> Result<RemoteDraft, SessionError> {
        self.send(self.request(Method::GET, &format!("sessions/{}/draft", session_id))?)
            .await
    }

    async fn complete_step(
        &self,
        session_id: &str,
        step_id: &str,
    ) -> Result<Session, SessionError> {
        self.send(self.request(
            Method::POST,
            &format!("sessions/{}/steps/{}/complete", session_id, step_id),
        )?)
        .await
    }

    async fn upload_image(&self, session_id: &str, payload: &Value) -> Result<(), SessionError> {
        let resp = self
            .request(Method::POST, &format!("sessions/{}/images", session_id))?
            .json(payload)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn complete_session(&self, session_id: &str) -> Result<String, SessionError> {
        let resp: Value = self
            .send(self.request(Method::POST, &format!("sessions/{}/complete", session_id))?)
            .await?;
        resp.get("propertyId")
            .and_then(|p| p.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| SessionError::Decode("missing propertyId in completion".to_string()))
    }
}

#[async_trait]
impl RemoteValidator for HttpSessionClient {
    async fn validate_step(
        &self,
        session_id: &str,
        step_id: &str,
        payload: &Value,
    ) -> Result<RemoteVerdict, SessionError> {
        self.send(
            self.request(
                Method::POST,
                &format!("sessions/{}/steps/{}/validate", session_id, step_id),
            )?
            .json(&json!({ "data": payload })),
        )
        .await
    }
}
