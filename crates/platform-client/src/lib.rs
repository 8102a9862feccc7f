use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_RUN_URL: &str = "https://prod1.datalayer.run";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub struct PlatformClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl PlatformClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = non_empty_string(token);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PlatformClient {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform_base_url_missing")]
    BaseUrlMissing,
    #[error("platform_invalid_path")]
    InvalidPath,
    #[error("platform_request_failed:{message}")]
    Request { message: String },
    #[error("platform_read_failed:{message}")]
    Read { message: String },
    #[error("platform_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
    #[error("platform_json_decode_failed:{message}")]
    Decode { message: String },
    #[error("platform_rejected:{message}")]
    Rejected { message: String },
}

/// A running compute runtime (kernel host) visible to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    pub uid: String,
    pub pod_name: String,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub environment_name: String,
    #[serde(default)]
    pub environment_title: Option<String>,
    #[serde(default)]
    pub ingress: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub burning_rate: f64,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub expired_at: Option<DateTime<Utc>>,
}

impl Runtime {
    /// Time left before expiry. `None` when the platform reported no expiry.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expired_at.map(|expired_at| expired_at - now)
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now)
            .is_some_and(|remaining| remaining <= chrono::Duration::zero())
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.given_name.trim().is_empty() {
            self.pod_name.as_str()
        } else {
            self.given_name.as_str()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRuntimeRequest {
    pub environment_name: String,
    #[serde(rename = "type")]
    pub runtime_type: String,
    pub given_name: String,
    pub credits_limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_snapshot: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeListResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub runtimes: Vec<Runtime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub runtime: Option<Runtime>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Credits {
    #[serde(default)]
    pub credits: f64,
    #[serde(default)]
    pub quota: Option<f64>,
    #[serde(default)]
    pub available: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditsResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub credits: Credits,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuntimeSnapshot {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotListResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub snapshots: Vec<RuntimeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Secret {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretListResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub secrets: Vec<Secret>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Datasource {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub database: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasourceListResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub datasources: Vec<Datasource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AckResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl PlatformClient {
    pub fn new(config: PlatformClientConfig) -> Result<Self, PlatformError> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            base_url,
            token: config.token,
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            request_attempts: config.request_attempts.max(1),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn runtimes_path() -> &'static str {
        "/api/runtimes/v1/runtimes"
    }

    #[must_use]
    pub fn runtime_path(pod_name: &str) -> String {
        format!("/api/runtimes/v1/runtimes/{}", pod_name.trim())
    }

    #[must_use]
    pub fn snapshots_path() -> &'static str {
        "/api/runtimes/v1/runtime-snapshots"
    }

    #[must_use]
    pub fn credits_path() -> &'static str {
        "/api/iam/v1/usage/credits"
    }

    #[must_use]
    pub fn secrets_path() -> &'static str {
        "/api/iam/v1/secrets"
    }

    #[must_use]
    pub fn datasources_path() -> &'static str {
        "/api/iam/v1/datasources"
    }

    pub async fn list_runtimes(&self) -> Result<Vec<Runtime>, PlatformError> {
        let response: RuntimeListResponse = self.get_json(Self::runtimes_path()).await?;
        ensure_success(response.success, &response.message)?;
        Ok(response.runtimes)
    }

    pub async fn create_runtime(
        &self,
        request: &CreateRuntimeRequest,
    ) -> Result<Runtime, PlatformError> {
        let response: RuntimeResponse = self.post_json(Self::runtimes_path(), request).await?;
        ensure_success(response.success, &response.message)?;
        response.runtime.ok_or_else(|| PlatformError::Decode {
            message: "runtime missing from create response".to_string(),
        })
    }

    pub async fn delete_runtime(&self, pod_name: &str) -> Result<(), PlatformError> {
        let response: AckResponse = self
            .delete_json(Self::runtime_path(pod_name).as_str())
            .await?;
        ensure_success(response.success, &response.message)
    }

    pub async fn get_credits(&self) -> Result<Credits, PlatformError> {
        let response: CreditsResponse = self.get_json(Self::credits_path()).await?;
        ensure_success(response.success, &response.message)?;
        Ok(response.credits)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<RuntimeSnapshot>, PlatformError> {
        let response: SnapshotListResponse = self.get_json(Self::snapshots_path()).await?;
        ensure_success(response.success, &response.message)?;
        Ok(response.snapshots)
    }

    pub async fn list_secrets(&self) -> Result<Vec<Secret>, PlatformError> {
        let response: SecretListResponse = self.get_json(Self::secrets_path()).await?;
        ensure_success(response.success, &response.message)?;
        Ok(response.secrets)
    }

    pub async fn list_datasources(&self) -> Result<Vec<Datasource>, PlatformError> {
        let response: DatasourceListResponse = self.get_json(Self::datasources_path()).await?;
        ensure_success(response.success, &response.message)?;
        Ok(response.datasources)
    }

    pub async fn get_json<T>(&self, path: &str) -> Result<T, PlatformError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let response = self.send(reqwest::Method::GET, path, None).await?;
        decode_json_response(response).await
    }

    pub async fn delete_json<T>(&self, path: &str) -> Result<T, PlatformError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let response = self.send(reqwest::Method::DELETE, path, None).await?;
        decode_json_response(response).await
    }

    pub async fn post_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res, PlatformError>
    where
        Req: Serialize + ?Sized,
        Res: for<'de> serde::Deserialize<'de>,
    {
        let body = serde_json::to_value(payload).map_err(|error| PlatformError::Decode {
            message: error.to_string(),
        })?;
        let response = self.send(reqwest::Method::POST, path, Some(&body)).await?;
        decode_json_response(response).await
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, PlatformError> {
        let url = self.endpoint(path).ok_or(PlatformError::InvalidPath)?;
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let mut request = self
                .http
                .request(method.clone(), url.as_str())
                .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
                .timeout(self.timeout);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    tracing::debug!(%url, attempt, "platform request failed: {}", error);
                    last_error = Some(error.to_string());
                    if attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(PlatformError::Request {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> PlatformError {
    let body = non_empty_string(String::from_utf8_lossy(body).to_string())
        .unwrap_or_else(|| "<empty>".to_string());
    PlatformError::Http { status, body }
}

fn ensure_success(success: bool, message: &str) -> Result<(), PlatformError> {
    if success {
        Ok(())
    } else {
        Err(PlatformError::Rejected {
            message: non_empty_string(message.to_string())
                .unwrap_or_else(|| "<no message>".to_string()),
        })
    }
}

fn default_success() -> bool {
    true
}

fn normalize_base_url(base_url: &str) -> Result<String, PlatformError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(PlatformError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, PlatformError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| PlatformError::Read {
            message: error.to_string(),
        })?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| PlatformError::Decode {
        message: error.to_string(),
    })
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Timestamps arrive as RFC 3339 strings or as epoch seconds (number or
/// numeric string, possibly fractional).
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let parsed = match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(number)) => number.as_f64().and_then(epoch_seconds),
        Some(serde_json::Value::String(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else if let Ok(seconds) = trimmed.parse::<f64>() {
                epoch_seconds(seconds)
            } else {
                let parsed = DateTime::parse_from_rfc3339(trimmed)
                    .map_err(|error| serde::de::Error::custom(error.to_string()))?;
                Some(parsed.with_timezone(&Utc))
            }
        }
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "unsupported timestamp value: {other}"
            )));
        }
    };
    Ok(parsed)
}

fn epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let millis = (seconds * 1_000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}
