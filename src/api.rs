//! HTTP client for the migration service.
//!
//! Every request carries the JSON content type and the session's bearer
//! token. Registered [`ResponseHook`]s observe each response before the
//! caller does, which is how a 401 anywhere expires the session everywhere.

use crate::model::{
    ConsoleConfig, ConversionResult, ConvertRequest, StartResponse, StatusResponse, TaskId,
    TokenResponse,
};
use crate::session::Session;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("unauthorized (401): session expired")]
    Unauthorized,
    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("service reported an error: {0}")]
    Backend(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid client setup: {0}")]
    Setup(String),
}

impl HttpError {
    /// Build an error for a response the client refuses to treat as success.
    pub fn status(status: StatusCode, body: impl Into<String>) -> Self {
        HttpError::Status {
            status,
            body: body.into(),
        }
    }
}

/// Observer invoked after every response, independent of the call site.
pub trait ResponseHook: Send + Sync {
    fn on_response(&self, method: &Method, path: &str, status: StatusCode);
}

/// The calls the console makes against the migration service.
#[async_trait]
pub trait MigrationService: Send + Sync {
    async fn start_migration(&self) -> Result<TaskId, HttpError>;
    async fn migration_status(&self, task_id: &TaskId) -> Result<StatusResponse, HttpError>;
    async fn convert_sql(&self, sql: &str) -> Result<ConversionResult, HttpError>;
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    hooks: Vec<Arc<dyn ResponseHook>>,
}

impl ApiClient {
    /// Build a client for `cfg.base_url`, authenticated with the token the
    /// session holds right now. The session is registered as a response hook.
    pub fn new(cfg: &ConsoleConfig, session: Arc<Session>) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match session.bearer_token() {
            Some(token) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| HttpError::Setup(format!("bearer token: {e}")))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            None => warn!("no stored token; requests will be sent unauthenticated"),
        }

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            hooks: vec![session as Arc<dyn ResponseHook>],
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn notify(&self, method: &Method, path: &str, status: StatusCode) {
        for hook in &self.hooks {
            hook.on_response(method, path, status);
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, HttpError> {
        let res = req.send().await?;
        let status = res.status();
        debug!(%method, path, %status, "response received");
        self.notify(&method, path, status);

        if status == StatusCode::UNAUTHORIZED {
            return Err(HttpError::Unauthorized);
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(HttpError::status(status, body));
        }
        Ok(res)
    }

    /// Issue a request and decode the body as JSON. An empty body yields `Null`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, HttpError> {
        let mut req = self.client.request(method.clone(), self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        let res = self.send(method, path, req).await?;
        let bytes = res.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Exchange credentials for a bearer token at `/api/auth/token`.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, HttpError> {
        let path = "/api/auth/token";
        let req = self
            .client
            .post(self.url(path))
            .form(&[("username", username), ("password", password)]);
        let res = self.send(Method::POST, path, req).await?;
        let token: TokenResponse = serde_json::from_slice(&res.bytes().await?)?;
        if let Some(kind) = token.token_type.as_deref() {
            if !kind.eq_ignore_ascii_case("bearer") {
                warn!(token_type = kind, "unexpected token type");
            }
        }
        Ok(token.access_token)
    }

    /// Service liveness probe at `/health`.
    pub async fn health(&self) -> Result<Value, HttpError> {
        self.request(Method::GET, "/health", None).await
    }
}

#[async_trait]
impl MigrationService for ApiClient {
    async fn start_migration(&self) -> Result<TaskId, HttpError> {
        let body = self
            .request(Method::POST, "/api/migration/start", None)
            .await?;
        let started: StartResponse = serde_json::from_value(body)?;
        Ok(started.task_id)
    }

    async fn migration_status(&self, task_id: &TaskId) -> Result<StatusResponse, HttpError> {
        let path = format!(
            "/api/migration/status/{}",
            urlencoding::encode(task_id.as_str())
        );
        let body = self.request(Method::GET, &path, None).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn convert_sql(&self, sql: &str) -> Result<ConversionResult, HttpError> {
        let payload = serde_json::to_value(ConvertRequest { sql })?;
        let body = self
            .request(Method::POST, "/api/convert", Some(&payload))
            .await?;
        // The service answers conversion errors with 200 and an `error` field.
        if let Some(msg) = body.get("error").and_then(Value::as_str) {
            return Err(HttpError::Backend(msg.to_string()));
        }
        Ok(serde_json::from_value(body)?)
    }
}
