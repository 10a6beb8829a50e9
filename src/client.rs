//! HTTP client for the session server's REST endpoints.
//!
//! [`SessionApi`] is the seam the rest of the crate talks to; [`HttpSessionApi`]
//! is the `reqwest`-backed implementation. Polling snapshots, authoritative
//! step lists after undo/delete, and command delivery while the channel is
//! down all go through here.
//!
//! ## Endpoints
//!
//! | Method | Path                                              | Used by                     |
//! |--------|---------------------------------------------------|-----------------------------|
//! | POST   | `/api/sessions`                                   | create                      |
//! | GET    | `/api/sessions/{id}`                              | polling snapshot            |
//! | GET    | `/api/sessions/{id}/steps`                        | re-sync after undo/delete   |
//! | GET    | `/api/sessions/{id}/plan`                         | plan fetch on `plan_ready`  |
//! | POST   | `/api/sessions/{id}/plan/approve`                 | start                       |
//! | POST   | `/api/sessions/{id}/continue`                     | continuation                |
//! | POST   | `/api/sessions/{id}/reset`                        | reset                       |
//! | POST   | `/api/sessions/{id}/stop`                         | stop                        |
//! | POST   | `/api/sessions/{id}/undo`                         | undo/replay (long timeout)  |
//! | DELETE | `/api/sessions/{id}/steps/{n}`                    | single-step delete          |
//! | PATCH  | `/api/sessions/{id}/steps/{n}/actions/{i}`        | action enable/disable       |
//! | POST   | `/api/sessions/{id}/commands`                     | commands while polling      |
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for an `error` (or `detail`) field in the JSON
//! body. If parsing fails, the raw response body is returned as the message.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Config;
use crate::error::ClientError;
use crate::protocol::{ClientCommand, Plan, SessionRecord, SessionState, Step, UndoResponse};

/// Body of `POST /api/sessions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateSession {
    pub instruction: String,
    pub headless: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// REST operations the session core depends on.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(&self, request: &CreateSession) -> Result<SessionRecord, ClientError>;
    async fn get_session_state(&self, session_id: &str) -> Result<SessionState, ClientError>;
    async fn list_steps(&self, session_id: &str) -> Result<Vec<Step>, ClientError>;
    /// `Ok(None)` when the session has no plan yet.
    async fn get_plan(&self, session_id: &str) -> Result<Option<Plan>, ClientError>;
    async fn approve_plan(&self, session_id: &str) -> Result<(), ClientError>;
    async fn continue_session(
        &self,
        session_id: &str,
        instruction: &str,
    ) -> Result<SessionRecord, ClientError>;
    async fn reset_session(&self, session_id: &str) -> Result<SessionRecord, ClientError>;
    async fn stop_session(&self, session_id: &str) -> Result<(), ClientError>;
    async fn undo_to_step(
        &self,
        session_id: &str,
        target_step_number: u32,
    ) -> Result<UndoResponse, ClientError>;
    async fn delete_step(&self, session_id: &str, step_number: u32) -> Result<(), ClientError>;
    async fn set_action_enabled(
        &self,
        session_id: &str,
        step_number: u32,
        action_index: usize,
        enabled: bool,
    ) -> Result<(), ClientError>;
    async fn post_command(
        &self,
        session_id: &str,
        command: &ClientCommand,
    ) -> Result<(), ClientError>;
}

/// `reqwest`-backed [`SessionApi`].
#[derive(Clone)]
pub struct HttpSessionApi {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    replay_timeout: Duration,
}

impl HttpSessionApi {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        request_timeout: Duration,
        replay_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(
            reqwest::header::HeaderName::from_static("x-runpilot-client"),
            reqwest::header::HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()?;
        // Strip trailing slash for consistent URL construction
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            replay_timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        Self::new(
            &config.server.base_url,
            config.server.api_key.clone(),
            config.timeouts.request_timeout(),
            config.timeouts.replay_timeout(),
        )
    }

    /// The server's base URL (without trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/sessions{}", self.base_url, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Read the body, failing with the server's message on non-2xx.
    async fn read_body(resp: reqwest::Response) -> Result<String, ClientError> {
        let status = resp.status();
        let body = resp.text().await?;
        if status.is_success() {
            return Ok(body);
        }
        // Try to extract error message from JSON body
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v["error"]
                    .as_str()
                    .or_else(|| v["detail"].as_str())
                    .map(String::from)
            })
            .unwrap_or(body);
        Err(ClientError::Server {
            status: status.as_u16(),
            message,
        })
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
        let body = Self::read_body(resp).await?;
        serde_json::from_str(&body)
            .map_err(|e| ClientError::Protocol(format!("Invalid JSON from server: {e}")))
    }

    async fn expect_success(resp: reqwest::Response) -> Result<(), ClientError> {
        Self::read_body(resp).await.map(|_| ())
    }
}

/// `GET .../steps` may answer with a bare list or `{"steps": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum StepList {
    Bare(Vec<Step>),
    Wrapped { steps: Vec<Step> },
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(&self, request: &CreateSession) -> Result<SessionRecord, ClientError> {
        let resp = self
            .authed(self.http.post(self.url("")))
            .json(request)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn get_session_state(&self, session_id: &str) -> Result<SessionState, ClientError> {
        let resp = self
            .authed(self.http.get(self.url(&format!("/{session_id}"))))
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn list_steps(&self, session_id: &str) -> Result<Vec<Step>, ClientError> {
        let resp = self
            .authed(self.http.get(self.url(&format!("/{session_id}/steps"))))
            .send()
            .await?;
        let list: StepList = Self::decode(resp).await?;
        Ok(match list {
            StepList::Bare(steps) | StepList::Wrapped { steps } => steps,
        })
    }

    async fn get_plan(&self, session_id: &str) -> Result<Option<Plan>, ClientError> {
        let resp = self
            .authed(self.http.get(self.url(&format!("/{session_id}/plan"))))
            .send()
            .await?;
        match Self::decode(resp).await {
            Ok(plan) => Ok(Some(plan)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn approve_plan(&self, session_id: &str) -> Result<(), ClientError> {
        let resp = self
            .authed(
                self.http
                    .post(self.url(&format!("/{session_id}/plan/approve"))),
            )
            .send()
            .await?;
        Self::expect_success(resp).await
    }

    async fn continue_session(
        &self,
        session_id: &str,
        instruction: &str,
    ) -> Result<SessionRecord, ClientError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/{session_id}/continue"))))
            .json(&json!({ "instruction": instruction }))
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn reset_session(&self, session_id: &str) -> Result<SessionRecord, ClientError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/{session_id}/reset"))))
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn stop_session(&self, session_id: &str) -> Result<(), ClientError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/{session_id}/stop"))))
            .send()
            .await?;
        Self::expect_success(resp).await
    }

    async fn undo_to_step(
        &self,
        session_id: &str,
        target_step_number: u32,
    ) -> Result<UndoResponse, ClientError> {
        // Replay runs against a live browser: replay timeout, not request timeout.
        let resp = self
            .authed(self.http.post(self.url(&format!("/{session_id}/undo"))))
            .timeout(self.replay_timeout)
            .json(&json!({ "target_step_number": target_step_number }))
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn delete_step(&self, session_id: &str, step_number: u32) -> Result<(), ClientError> {
        let resp = self
            .authed(
                self.http
                    .delete(self.url(&format!("/{session_id}/steps/{step_number}"))),
            )
            .send()
            .await?;
        Self::expect_success(resp).await
    }

    async fn set_action_enabled(
        &self,
        session_id: &str,
        step_number: u32,
        action_index: usize,
        enabled: bool,
    ) -> Result<(), ClientError> {
        let resp = self
            .authed(self.http.patch(self.url(&format!(
                "/{session_id}/steps/{step_number}/actions/{action_index}"
            ))))
            .json(&json!({ "enabled": enabled }))
            .send()
            .await?;
        Self::expect_success(resp).await
    }

    async fn post_command(
        &self,
        session_id: &str,
        command: &ClientCommand,
    ) -> Result<(), ClientError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/{session_id}/commands"))))
            .json(command)
            .send()
            .await?;
        Self::expect_success(resp).await
    }
}
