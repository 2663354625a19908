mod agents;
mod analysis;
mod auth;
mod executions;
mod files;
mod users;

pub(crate) use files::{display_name, mime_of};

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::core::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Session rejected by the server (HTTP {0})")]
    Unauthorized(u16),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Server returned an empty body")]
    EmptyBody,

    #[error("Request canceled")]
    Canceled,

    #[error("Could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ApiError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::NotAuthenticated | ApiError::Unauthorized(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status: 404, .. })
    }

    /// The backend never gave a verdict; the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::EmptyBody => true,
            ApiError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The backend refused the request itself. Replaying it will not help.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ApiError::Status { status: 400..=499, .. })
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP client for the primary REST API, the execution store and the fraud
/// analysis endpoint. Never touches local state.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    api_url: String,
    executions_url: String,
    analysis_url: String,
    token: Arc<RwLock<Option<String>>>,
}

pub(crate) fn seg(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

impl ApiClient {
    pub fn new(config: &Config) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            executions_url: config.executions_url.trim_end_matches('/').to_string(),
            analysis_url: config.analysis_url.clone(),
            token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    pub fn has_token(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn store_url(&self, path: &str) -> String {
        format!("{}{}", self.executions_url, path)
    }

    fn authed(&self, req: RequestBuilder) -> ApiResult<RequestBuilder> {
        let token = self
            .token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ApiError::NotAuthenticated)?;
        Ok(req.bearer_auth(token))
    }

    /// Attach the bearer token when one exists.
    fn maybe_authed(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> ApiResult<Response> {
        let res = req.send().await?;
        check_status(res).await
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        debug!("GET {}", path);
        let req = self.authed(self.http.get(self.url(path)))?;
        read_json(self.send(req).await?).await
    }

    pub(crate) async fn get_optional_json<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> ApiResult<Option<T>> {
        debug!("GET {}", path);
        let req = self.authed(self.http.get(self.url(path)))?;
        read_optional_json(self.send(req).await?).await
    }

    pub(crate) async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        debug!("POST {}", path);
        let req = self.authed(self.http.post(self.url(path)).json(body))?;
        read_json(self.send(req).await?).await
    }

    pub(crate) async fn put_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        debug!("PUT {}", path);
        let req = self.authed(self.http.put(self.url(path)).json(body))?;
        read_json(self.send(req).await?).await
    }

    /// PUT whose response body, if any, is not needed.
    pub(crate) async fn put_unit<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ApiResult<()> {
        debug!("PUT {}", path);
        let req = self.authed(self.http.put(self.url(path)).json(body))?;
        self.send(req).await?;
        Ok(())
    }

    pub(crate) async fn delete(&self, path: &str) -> ApiResult<()> {
        debug!("DELETE {}", path);
        let req = self.authed(self.http.delete(self.url(path)))?;
        self.send(req).await?;
        Ok(())
    }
}

async fn check_status(res: Response) -> ApiResult<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ApiError::Unauthorized(status.as_u16()));
    }
    let body = res.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        message: error_message(&body, status),
    })
}

/// Prefer the JSON body's `message` (or `error`) field, then the raw text.
fn error_message(body: &str, status: StatusCode) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error"] {
            if let Some(msg) = value.get(key).and_then(|v| v.as_str()) {
                return msg.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed.to_string()
    }
}

async fn read_json<T: DeserializeOwned>(res: Response) -> ApiResult<T> {
    read_optional_json(res).await?.ok_or(ApiError::EmptyBody)
}

async fn read_optional_json<T: DeserializeOwned>(res: Response) -> ApiResult<Option<T>> {
    let body = res.text().await?;
    if body.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|e| ApiError::Decode(e.to_string()))
}
