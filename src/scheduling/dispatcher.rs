use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::models::{Endpoint, HttpMethod, RunStatus};
use crate::secrets::HeaderMap;

pub const MIN_TIMEOUT_MS: i64 = 1000;
pub const DEFAULT_TIMEOUT_MS: i64 = 30_000;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),
}

/// Result of one endpoint call. Failures are data, not errors: the worker
/// records them on the run row and moves on.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub status: RunStatus,
    pub duration_ms: i64,
    pub status_code: Option<i32>,
    pub response_body: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl DispatchOutcome {
    pub fn failed(duration_ms: i64, message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            duration_ms,
            status_code: None,
            response_body: None,
            error_message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Executes one HTTP call for the endpoint. Headers arrive already
    /// decrypted; the dispatcher never sees stored ciphertext.
    async fn execute(&self, endpoint: &Endpoint, headers: Option<&HeaderMap>) -> DispatchOutcome;
}

/// Timeout applied to a dispatch: clamped to at least one second,
/// defaulting to thirty.
pub fn clamp_timeout_ms(requested: Option<i64>) -> i64 {
    requested.unwrap_or(DEFAULT_TIMEOUT_MS).max(MIN_TIMEOUT_MS)
}

/// Content-Type gate for response capture, ignoring parameters such as
/// `; charset=utf-8`.
pub fn is_json_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|media| media.trim().to_ascii_lowercase())
        .is_some_and(|media| media.starts_with("application/json"))
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

/// Reqwest-backed dispatcher. One reusable client per instance; per-call
/// timeouts come from the endpoint.
pub struct HttpDispatcher {
    client: Client,
}

impl HttpDispatcher {
    pub fn new() -> Result<Self, DispatchError> {
        let client = Client::builder().build()?;
        Ok(Self { client })
    }

    /// Reads the body up to `cap` bytes and parses it as JSON. Oversized
    /// or unparsable bodies are dropped without failing the run.
    async fn capture_body(
        response: &mut reqwest::Response,
        cap: usize,
    ) -> Option<serde_json::Value> {
        if let Some(length) = response.content_length() {
            if length as usize > cap {
                return None;
            }
        }

        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.ok()? {
            if bytes.len() + chunk.len() > cap {
                return None;
            }
            bytes.extend_from_slice(&chunk);
        }

        serde_json::from_slice(&bytes).ok()
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn execute(&self, endpoint: &Endpoint, headers: Option<&HeaderMap>) -> DispatchOutcome {
        if endpoint.url.trim().is_empty() {
            return DispatchOutcome::failed(0, "endpoint has no URL configured");
        }
        if let Err(e) = Url::parse(&endpoint.url) {
            return DispatchOutcome::failed(0, format!("invalid URL '{}': {e}", endpoint.url));
        }

        let timeout_ms = clamp_timeout_ms(endpoint.timeout_ms);
        let started = Instant::now();

        let mut request = self
            .client
            .request(to_reqwest_method(endpoint.method), &endpoint.url)
            .timeout(Duration::from_millis(timeout_ms as u64));

        let mut has_content_type = false;
        if let Some(headers) = headers {
            for (name, value) in headers {
                let Ok(header_name) = HeaderName::from_str(name) else {
                    warn!(endpoint_id = %endpoint.id, header = %name, "Skipping invalid header name");
                    continue;
                };
                let Ok(header_value) = HeaderValue::from_str(value) else {
                    warn!(endpoint_id = %endpoint.id, header = %name, "Skipping invalid header value");
                    continue;
                };
                if header_name == CONTENT_TYPE {
                    has_content_type = true;
                }
                request = request.header(header_name, header_value);
            }
        }

        if endpoint.method.allows_body() {
            if let Some(body) = &endpoint.body_json {
                match serde_json::to_vec(body) {
                    Ok(bytes) => {
                        if !has_content_type {
                            request = request.header(CONTENT_TYPE, "application/json");
                        }
                        request = request.body(bytes);
                    }
                    Err(e) => {
                        return DispatchOutcome::failed(
                            started.elapsed().as_millis() as i64,
                            format!("failed to serialize request body: {e}"),
                        )
                    }
                }
            }
        }

        let mut response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let duration_ms = started.elapsed().as_millis() as i64;
                let message = if e.is_timeout() {
                    format!("request timed out after {timeout_ms}ms")
                } else {
                    format!("request failed: {e}")
                };
                return DispatchOutcome::failed(duration_ms, message);
            }
        };

        let status_code = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(is_json_content_type);

        let response_body = if is_json {
            Self::capture_body(&mut response, endpoint.response_cap_bytes()).await
        } else {
            None
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        debug!(
            endpoint_id = %endpoint.id,
            status = %status_code,
            duration_ms,
            "Dispatched endpoint"
        );

        if status_code.is_success() {
            DispatchOutcome {
                status: RunStatus::Success,
                duration_ms,
                status_code: Some(status_code.as_u16() as i32),
                response_body,
                error_message: None,
            }
        } else {
            DispatchOutcome {
                status: RunStatus::Failed,
                duration_ms,
                status_code: Some(status_code.as_u16() as i32),
                response_body,
                error_message: Some(format!(
                    "HTTP {} {}",
                    status_code.as_u16(),
                    status_code.canonical_reason().unwrap_or("Unknown")
                )),
            }
        }
    }
}

/// Scripted dispatcher for worker tests: pops queued outcomes and records
/// what it was asked to call.
pub struct MockDispatcher {
    outcomes: std::sync::Mutex<std::collections::VecDeque<DispatchOutcome>>,
    pub calls: std::sync::Mutex<Vec<(uuid::Uuid, Option<HeaderMap>)>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self {
            outcomes: std::sync::Mutex::new(std::collections::VecDeque::new()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self, outcome: DispatchOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn queue_success(&self, duration_ms: i64) {
        self.queue(DispatchOutcome {
            status: RunStatus::Success,
            duration_ms,
            status_code: Some(200),
            response_body: None,
            error_message: None,
        });
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn execute(&self, endpoint: &Endpoint, headers: Option<&HeaderMap>) -> DispatchOutcome {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.id, headers.cloned()));

        self.outcomes.lock().unwrap().pop_front().unwrap_or(DispatchOutcome {
            status: RunStatus::Success,
            duration_ms: 5,
            status_code: Some(200),
            response_body: None,
            error_message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_clamp_has_floor_and_default() {
        assert_eq!(clamp_timeout_ms(None), DEFAULT_TIMEOUT_MS);
        assert_eq!(clamp_timeout_ms(Some(10)), MIN_TIMEOUT_MS);
        assert_eq!(clamp_timeout_ms(Some(1000)), 1000);
        assert_eq!(clamp_timeout_ms(Some(120_000)), 120_000);
    }

    #[test]
    fn json_content_type_detection_ignores_parameters() {
        assert!(is_json_content_type("application/json"));
        assert!(is_json_content_type("application/json; charset=utf-8"));
        assert!(is_json_content_type("Application/JSON"));
        assert!(is_json_content_type("application/json-patch+json"));
        assert!(!is_json_content_type("text/html"));
        assert!(!is_json_content_type("application/xml"));
    }

    #[test]
    fn body_is_reserved_for_non_get_methods() {
        assert!(!HttpMethod::Get.allows_body());
        assert!(HttpMethod::Post.allows_body());
        assert!(HttpMethod::Put.allows_body());
        assert!(HttpMethod::Patch.allows_body());
        assert!(HttpMethod::Delete.allows_body());
    }
}
