//! HTTP client for the opencode service, with retry and envelope unwrapping.

mod retry;

pub use retry::{retry, RetryPolicy};

use std::time::Duration;

use reqwest::{Method, Url};
use serde_json::Value;
use shared::error_codes;

/// Errors surfaced by downstream calls.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The service answered with an error envelope.
    #[error("{message}")]
    Downstream { message: String },

    #[error("request failed ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid service url {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

impl ClientError {
    /// Protocol error code, when the failure carries one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Downstream { .. } | Self::InvalidUrl { .. } => None,
            Self::Status { .. } => Some(error_codes::HTTP_ERROR),
            Self::Transport { source, .. } if source.is_timeout() => Some(error_codes::TIMEOUT),
            Self::Transport { source, .. } if source.is_connect() => {
                Some(error_codes::CONNECTION_ERROR)
            }
            Self::Transport { .. } => None,
        }
    }
}

/// Unwrap a `{data}` / `{error}` envelope.
///
/// An `error` wins over `data`. Values that are neither are returned as-is,
/// since not every endpoint is enveloped.
pub fn unwrap_envelope(body: Value) -> Result<Value, ClientError> {
    let Value::Object(mut map) = body else {
        return Ok(body);
    };
    if let Some(error) = map.get("error").filter(|e| !e.is_null()) {
        return Err(ClientError::Downstream {
            message: envelope_error_message(error),
        });
    }
    match map.remove("data") {
        Some(data) => Ok(data),
        None => Ok(Value::Object(map)),
    }
}

/// `error.data.message`, then `error.name`, then the serialized error.
fn envelope_error_message(error: &Value) -> String {
    let non_empty = |v: Option<&Value>| {
        v.and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    non_empty(error.pointer("/data/message"))
        .or_else(|| non_empty(error.get("name")))
        .or_else(|| match error {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::String(_) => None,
            other => serde_json::to_string(other).ok(),
        })
        .unwrap_or_else(|| "Unknown error".to_string())
}

/// One downstream request, described independently of any base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new<I, S>(method: Method, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            method,
            segments: segments.into_iter().map(Into::into).collect(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get<I: IntoIterator<Item = S>, S: Into<String>>(segments: I) -> Self {
        Self::new(Method::GET, segments)
    }

    pub fn post<I: IntoIterator<Item = S>, S: Into<String>>(segments: I, body: Value) -> Self {
        Self::new(Method::POST, segments).with_body(body)
    }

    pub fn delete<I: IntoIterator<Item = S>, S: Into<String>>(segments: I) -> Self {
        Self::new(Method::DELETE, segments)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// Scope the request to a project directory, if one is known.
    pub fn with_directory(self, directory: Option<&str>) -> Self {
        match directory {
            Some(dir) => self.with_query("directory", dir),
            None => self,
        }
    }

    /// `GET /session/abc`, for logs.
    pub fn label(&self) -> String {
        format!("{} /{}", self.method, self.segments.join("/"))
    }
}

/// Raw HTTP access to the service. Each exchange is turned into an envelope:
/// 2xx bodies become `{data}`, JSON error bodies become `{error}`.
#[derive(Debug, Clone)]
pub struct OpencodeApi {
    http: reqwest::Client,
    base_url: String,
}

impl OpencodeApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, request: &ApiRequest) -> Result<Url, ClientError> {
        let invalid = |message: String| ClientError::InvalidUrl {
            url: self.base_url.clone(),
            message,
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(&request.segments);
        Ok(url)
    }

    pub async fn send(&self, request: &ApiRequest) -> Result<Value, ClientError> {
        let url = self.url_for(request)?;
        let url_str = url.to_string();
        let mut builder = self.http.request(request.method.clone(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let res = builder.send().await.map_err(|source| ClientError::Transport {
            url: url_str.clone(),
            source,
        })?;
        let status = res.status();
        let text = res.text().await.map_err(|source| ClientError::Transport {
            url: url_str.clone(),
            source,
        })?;
        tracing::trace!(url = %url_str, status = status.as_u16(), bytes = text.len(), "service response");

        if status.is_success() {
            let data = if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };
            return Ok(serde_json::json!({ "data": data }));
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(error) if !error.is_null() => Ok(serde_json::json!({ "error": error })),
            _ => Err(ClientError::Status {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            }),
        }
    }
}

/// Sends requests through [`OpencodeApi`] inside a retry loop and unwraps
/// the resulting envelope.
#[derive(Debug, Clone)]
pub struct RetryingClient {
    api: OpencodeApi,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(api: OpencodeApi, policy: RetryPolicy) -> Self {
        Self { api, policy }
    }

    pub fn base_url(&self) -> &str {
        self.api.base_url()
    }

    pub async fn call(&self, request: ApiRequest) -> Result<Value, ClientError> {
        self.call_with(&self.policy, request).await
    }

    /// Like [`call`](Self::call) but with a call-site specific policy.
    pub async fn call_with(
        &self,
        policy: &RetryPolicy,
        request: ApiRequest,
    ) -> Result<Value, ClientError> {
        let label = request.label();
        let api = &self.api;
        let request = &request;
        retry(policy, &label, || async move {
            let envelope = api.send(request).await?;
            unwrap_envelope(envelope)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_service, HitCounter};
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            multiplier: 1.0,
        }
    }

    fn client(base_url: &str) -> RetryingClient {
        let api = OpencodeApi::new(base_url, Duration::from_secs(5)).unwrap();
        RetryingClient::new(api, quick_policy())
    }

    #[test]
    fn unwrap_prefers_data_message() {
        let err = unwrap_envelope(json!({"error": {"data": {"message": "bad key"}}})).unwrap_err();
        assert_eq!(err.to_string(), "bad key");
        assert_eq!(err.code(), None);
    }

    #[test]
    fn unwrap_falls_back_to_error_name() {
        let err = unwrap_envelope(json!({"error": {"name": "AuthError"}})).unwrap_err();
        assert_eq!(err.to_string(), "AuthError");
    }

    #[test]
    fn unwrap_falls_back_to_serialized_error() {
        let err = unwrap_envelope(json!({"error": {"status": 500}})).unwrap_err();
        assert_eq!(err.to_string(), r#"{"status":500}"#);
        let err = unwrap_envelope(json!({"error": ""})).unwrap_err();
        assert_eq!(err.to_string(), "Unknown error");
    }

    #[test]
    fn unwrap_returns_data() {
        assert_eq!(unwrap_envelope(json!({"data": {"x": 1}})).unwrap(), json!({"x": 1}));
        assert_eq!(unwrap_envelope(json!({"data": null, "error": null})).unwrap(), Value::Null);
    }

    #[test]
    fn unwrap_passes_through_bare_values() {
        assert_eq!(unwrap_envelope(json!({"healthy": true})).unwrap(), json!({"healthy": true}));
        assert_eq!(unwrap_envelope(json!([1, 2])).unwrap(), json!([1, 2]));
        assert_eq!(unwrap_envelope(json!(true)).unwrap(), json!(true));
    }

    #[test]
    fn request_label_and_directory() {
        let req = ApiRequest::get(["session", "ses_1"]).with_directory(Some("/w"));
        assert_eq!(req.label(), "GET /session/ses_1");
        assert_eq!(req.query, vec![("directory".to_string(), "/w".to_string())]);
        assert!(ApiRequest::get(["session"]).with_directory(None).query.is_empty());
    }

    #[tokio::test]
    async fn call_retries_until_success() {
        async fn flaky(State(hits): State<HitCounter>) -> (StatusCode, Json<Value>) {
            if hits.hit() <= 2 {
                (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"name": "Starting"})))
            } else {
                (StatusCode::OK, Json(json!({"healthy": true, "version": "1.0.0"})))
            }
        }
        let hits = HitCounter::default();
        let router = Router::new()
            .route("/global/health", get(flaky))
            .with_state(hits.clone());
        let base = fake_service(router).await;

        let data = client(&base)
            .call(ApiRequest::get(["global", "health"]))
            .await
            .unwrap();
        assert_eq!(data["healthy"], true);
        assert_eq!(hits.count(), 3);
    }

    #[tokio::test]
    async fn call_gives_up_after_all_attempts() {
        async fn broken(State(hits): State<HitCounter>) -> (StatusCode, &'static str) {
            hits.hit();
            (StatusCode::INTERNAL_SERVER_ERROR, "boom")
        }
        let hits = HitCounter::default();
        let router = Router::new()
            .route("/config", get(broken))
            .with_state(hits.clone());
        let base = fake_service(router).await;

        let err = client(&base).call(ApiRequest::get(["config"])).await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 500, .. }));
        assert_eq!(err.code(), Some(error_codes::HTTP_ERROR));
        assert_eq!(hits.count(), 4);
    }

    #[tokio::test]
    async fn error_body_surfaces_envelope_message() {
        async fn rejected() -> (StatusCode, Json<Value>) {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"name": "ProviderAuthError", "data": {"message": "bad key"}})),
            )
        }
        let router = Router::new().route("/provider/auth", get(rejected));
        let base = fake_service(router).await;

        let err = client(&base)
            .call_with(&RetryPolicy::single_attempt(), ApiRequest::get(["provider", "auth"]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "bad key");
    }

    #[tokio::test]
    async fn unreachable_service_is_a_connection_error() {
        let err = client("http://127.0.0.1:9")
            .call_with(&RetryPolicy::single_attempt(), ApiRequest::get(["global", "health"]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(error_codes::CONNECTION_ERROR));
    }
}
