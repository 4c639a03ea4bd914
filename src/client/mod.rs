//! HTTP client with timeouts and retry with exponential backoff.

mod error;
mod retry;

pub use error::ApiError;
pub use retry::RetryPolicy;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::http::{HttpRequest, HttpResponse, Transport, TransportError};

/// Options for a single logical request.
#[derive(Debug, Clone)]
pub struct RequestConfig {
  pub method: Method,
  pub headers: BTreeMap<String, String>,
  /// Sent as JSON for anything but GET
  pub body: Option<Value>,
  /// Per-attempt timeout; the client default when unset
  pub timeout: Option<Duration>,
  /// Retry budget; the client default when unset
  pub retries: Option<u32>,
  /// Substituted into `:name` path segments, the rest become query parameters
  pub params: BTreeMap<String, String>,
}

impl Default for RequestConfig {
  fn default() -> Self {
    Self {
      method: Method::GET,
      headers: BTreeMap::new(),
      body: None,
      timeout: None,
      retries: None,
      params: BTreeMap::new(),
    }
  }
}

impl RequestConfig {
  pub fn new(method: Method) -> Self {
    Self {
      method,
      ..Self::default()
    }
  }

  pub fn header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_string(), value.to_string());
    self
  }

  pub fn json(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn retries(mut self, retries: u32) -> Self {
    self.retries = Some(retries);
    self
  }

  pub fn param(mut self, name: &str, value: impl ToString) -> Self {
    self.params.insert(name.to_string(), value.to_string());
    self
  }
}

/// Parsed response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
  Json(Value),
  Text(String),
}

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: ResponseBody,
}

fn is_json(response: &HttpResponse) -> bool {
  response
    .content_type()
    .is_some_and(|ct| ct.contains("application/json"))
}

impl ApiResponse {
  fn from_http(response: HttpResponse) -> Result<Self, ApiError> {
    let body = if is_json(&response) {
      if response.body.is_empty() {
        ResponseBody::Json(Value::Null)
      } else {
        let value = serde_json::from_slice(&response.body)
          .map_err(|e| ApiError::Decode(e.to_string()))?;
        ResponseBody::Json(value)
      }
    } else {
      ResponseBody::Text(response.text())
    };

    Ok(Self {
      status: response.status,
      headers: response.headers,
      body,
    })
  }

  /// Deserialize the body into `T`.
  pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
    let result = match &self.body {
      ResponseBody::Json(value) => serde_json::from_value(value.clone()),
      ResponseBody::Text(text) => serde_json::from_str(text),
    };
    result.map_err(|e| ApiError::Decode(e.to_string()))
  }

  pub fn text(&self) -> String {
    match &self.body {
      ResponseBody::Json(value) => value.to_string(),
      ResponseBody::Text(text) => text.clone(),
    }
  }
}

/// Build the error for a non-success response, keeping `message` and `code`
/// from a JSON error body when there is one.
fn http_error(response: &HttpResponse) -> ApiError {
  let details: Option<Value> = if is_json(response) {
    serde_json::from_slice(&response.body).ok()
  } else {
    None
  };
  let field = |name: &str| {
    details
      .as_ref()
      .and_then(|d| d.get(name))
      .and_then(Value::as_str)
      .map(str::to_string)
  };

  let message = field("message").unwrap_or_else(|| {
    let reason = StatusCode::from_u16(response.status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or("Unknown");
    format!("HTTP {}: {}", response.status, reason)
  });

  ApiError::Http {
    status: response.status,
    message,
    code: field("code"),
    details,
  }
}

/// Client for the application's REST API.
///
/// Every request gets a per-attempt timeout. Retryable failures (see
/// [`ApiError::is_retryable`]) are retried sequentially with exponential
/// backoff; when the budget runs out the last error is returned unchanged.
pub struct ResilientClient {
  transport: Arc<dyn Transport>,
  base_url: Url,
  timeout: Duration,
  retry: RetryPolicy,
  default_headers: RwLock<BTreeMap<String, String>>,
}

impl ResilientClient {
  pub fn new(config: &ClientConfig, transport: Arc<dyn Transport>) -> Result<Self, ApiError> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| ApiError::InvalidRequest(format!("base URL '{}': {}", config.base_url, e)))?;

    let mut headers = BTreeMap::new();
    headers.insert("Accept".to_string(), "application/json".to_string());
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.insert("User-Agent".to_string(), config.user_agent.clone());
    headers.insert("X-Requested-With".to_string(), "XMLHttpRequest".to_string());

    Ok(Self {
      transport,
      base_url,
      timeout: Duration::from_millis(config.timeout_ms),
      retry: RetryPolicy::from(config),
      default_headers: RwLock::new(headers),
    })
  }

  pub fn retry_policy(&self) -> &RetryPolicy {
    &self.retry
  }

  /// Send `Authorization: Bearer <token>` with every request, or stop
  /// sending it with `None`.
  pub fn set_bearer_token(&self, token: Option<&str>) {
    let mut headers = self
      .default_headers
      .write()
      .unwrap_or_else(|e| e.into_inner());
    match token {
      Some(token) => {
        headers.insert("Authorization".to_string(), format!("Bearer {}", token));
      }
      None => {
        headers.remove("Authorization");
      }
    }
  }

  fn headers(&self) -> BTreeMap<String, String> {
    self
      .default_headers
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Join `endpoint` onto the base URL. `:name` segments are replaced by the
  /// matching parameter (percent-encoded); leftover parameters are appended
  /// as a query string.
  pub fn build_url(&self, endpoint: &str, params: &BTreeMap<String, String>) -> Result<Url, ApiError> {
    let (path, query) = match endpoint.split_once('?') {
      Some((path, query)) => (path, Some(query)),
      None => (endpoint, None),
    };

    let mut url = self.base_url.clone();
    let mut remaining = params.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| ApiError::InvalidRequest(format!("base URL {} cannot take a path", self.base_url)))?;
      segments.pop_if_empty();
      for segment in path.split('/').filter(|s| !s.is_empty()) {
        let substituted = segment
          .strip_prefix(':')
          .and_then(|name| remaining.remove(name));
        match substituted {
          Some(value) => segments.push(&value),
          None => segments.push(segment),
        };
      }
    }

    url.set_query(query);
    if !remaining.is_empty() {
      url.query_pairs_mut().extend_pairs(remaining.iter());
    }
    Ok(url)
  }

  /// Perform a request, retrying retryable failures.
  pub async fn request(&self, endpoint: &str, config: RequestConfig) -> Result<ApiResponse, ApiError> {
    let url = self.build_url(endpoint, &config.params)?;
    let mut headers = self.headers();
    headers.extend(config.headers);

    let body = match config.body {
      Some(body) if config.method != Method::GET => Some(
        serde_json::to_vec(&body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?,
      ),
      _ => None,
    };
    let timeout = config.timeout.unwrap_or(self.timeout);
    let retry = match config.retries {
      Some(retries) => self.retry.with_retries(retries),
      None => self.retry,
    };

    let mut attempt = 0;
    loop {
      let request = HttpRequest {
        method: config.method.clone(),
        url: url.clone(),
        headers: headers.clone(),
        body: body.clone(),
        timeout: Some(timeout),
      };
      debug!("{} {} (attempt {}/{})", config.method, url, attempt + 1, retry.max_attempts());

      match self.attempt(request, timeout).await {
        Ok(response) => return Ok(response),
        Err(e) if e.is_retryable() && attempt < retry.retries => {
          let delay = retry.delay_for(attempt);
          warn!(
            "{} {} failed: {}; retrying in {:?} ({}/{})",
            config.method,
            url,
            e,
            delay,
            attempt + 1,
            retry.retries
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) => {
          debug!("{} {} failed after {} attempts: {}", config.method, url, attempt + 1, e);
          return Err(e);
        }
      }
    }
  }

  async fn attempt(&self, request: HttpRequest, timeout: Duration) -> Result<ApiResponse, ApiError> {
    let response = match tokio::time::timeout(timeout, self.transport.send(request)).await {
      Ok(result) => result?,
      Err(_) => return Err(TransportError::Timeout.into()),
    };

    if !response.is_success() {
      return Err(http_error(&response));
    }
    ApiResponse::from_http(response)
  }

  pub async fn get(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<ApiResponse, ApiError> {
    let config = params
      .iter()
      .fold(RequestConfig::new(Method::GET), |config, (name, value)| {
        config.param(name, value)
      });
    self.request(endpoint, config).await
  }

  pub async fn post(&self, endpoint: &str, body: Value) -> Result<ApiResponse, ApiError> {
    self
      .request(endpoint, RequestConfig::new(Method::POST).json(body))
      .await
  }

  pub async fn put(&self, endpoint: &str, body: Value) -> Result<ApiResponse, ApiError> {
    self
      .request(endpoint, RequestConfig::new(Method::PUT).json(body))
      .await
  }

  pub async fn patch(&self, endpoint: &str, body: Value) -> Result<ApiResponse, ApiError> {
    self
      .request(endpoint, RequestConfig::new(Method::PATCH).json(body))
      .await
  }

  pub async fn delete(&self, endpoint: &str) -> Result<ApiResponse, ApiError> {
    self.request(endpoint, RequestConfig::new(Method::DELETE)).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::FakeTransport;
  use async_trait::async_trait;
  use serde_json::json;
  use tokio::time::Instant;

  const FEED: &str = "http://localhost:8000/api/feed";

  fn client(transport: Arc<dyn Transport>) -> ResilientClient {
    ResilientClient::new(&ClientConfig::default(), transport).unwrap()
  }

  fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn test_build_url_substitutes_and_appends() {
    let client = client(Arc::new(FakeTransport::new()));

    let url = client
      .build_url("/articles/:slug", &params(&[("slug", "tank build"), ("page", "2")]))
      .unwrap();
    assert_eq!(url.as_str(), "http://localhost:8000/api/articles/tank%20build?page=2");

    let plain = client.build_url("feed", &BTreeMap::new()).unwrap();
    assert_eq!(plain.as_str(), FEED);

    let with_query = client
      .build_url("/feed?sort=new", &params(&[("page", "1")]))
      .unwrap();
    assert_eq!(with_query.as_str(), "http://localhost:8000/api/feed?sort=new&page=1");
  }

  #[tokio::test]
  async fn test_success_parses_json_and_sends_default_headers() {
    let transport = Arc::new(FakeTransport::new());
    transport.route(FEED, HttpResponse::json(200, &json!({"items": [1, 2]})));
    let client = client(transport.clone());
    client.set_bearer_token(Some("abc"));

    let response = client.get("/feed", &[]).await.unwrap();
    assert_eq!(response.body, ResponseBody::Json(json!({"items": [1, 2]})));

    let sent = &transport.calls()[0];
    assert_eq!(sent.headers["Accept"], "application/json");
    assert_eq!(sent.headers["X-Requested-With"], "XMLHttpRequest");
    assert_eq!(sent.headers["Authorization"], "Bearer abc");

    client.set_bearer_token(None);
    client.get("/feed", &[]).await.unwrap();
    assert!(!transport.calls()[1].headers.contains_key("Authorization"));
  }

  #[tokio::test]
  async fn test_text_body_when_not_json() {
    let transport = Arc::new(FakeTransport::new());
    transport.route(FEED, HttpResponse::new(200, "plain").with_header("Content-Type", "text/plain"));
    let response = client(transport).get("/feed", &[]).await.unwrap();
    assert_eq!(response.body, ResponseBody::Text("plain".to_string()));
  }

  #[tokio::test]
  async fn test_get_never_sends_body() {
    let transport = Arc::new(FakeTransport::new());
    transport.route(FEED, HttpResponse::new(200, ""));
    let client = client(transport.clone());

    let config = RequestConfig::new(Method::GET).json(json!({"ignored": true}));
    client.request("/feed", config).await.unwrap();
    assert!(transport.calls()[0].body.is_none());

    transport.route(FEED, HttpResponse::json(201, &json!({"id": 7})));
    let created = client.post("/feed", json!({"title": "Hi"})).await.unwrap();
    assert_eq!(created.json::<Value>().unwrap()["id"], 7);
    assert_eq!(transport.calls()[1].body.as_deref(), Some(br#"{"title":"Hi"}"#.as_slice()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_errors_exhaust_budget_with_backoff() {
    let transport = Arc::new(FakeTransport::new());
    transport.route(FEED, HttpResponse::new(503, "busy"));
    let client = client(transport.clone());

    let start = Instant::now();
    let err = client.get("/feed", &[]).await.unwrap_err();

    assert_eq!(err.status(), Some(503));
    assert_eq!(transport.call_count(), 4);
    // 1s + 2s + 4s
    assert_eq!(start.elapsed(), Duration::from_secs(7));
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovers_after_transient_failures() {
    let transport = Arc::new(FakeTransport::new());
    transport.push(Err(TransportError::Network("reset".into())));
    transport.push(Ok(HttpResponse::new(429, "slow down")));
    transport.route(FEED, HttpResponse::new(200, "ok"));
    let client = client(transport.clone());

    let response = client.get("/feed", &[]).await.unwrap();
    assert_eq!(response.text(), "ok");
    assert_eq!(transport.call_count(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_client_errors_fail_immediately() {
    let transport = Arc::new(FakeTransport::new());
    transport.route(
      FEED,
      HttpResponse::json(404, &json!({"message": "No such feed", "code": "FEED_NOT_FOUND"})),
    );
    let client = client(transport.clone());

    let err = client.get("/feed", &[]).await.unwrap_err();
    assert_eq!(transport.call_count(), 1);
    match err {
      ApiError::Http {
        status,
        message,
        code,
        ..
      } => {
        assert_eq!(status, 404);
        assert_eq!(message, "No such feed");
        assert_eq!(code.as_deref(), Some("FEED_NOT_FOUND"));
      }
      other => panic!("unexpected error {:?}", other),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_budget_override() {
    let transport = Arc::new(FakeTransport::new());
    transport.set_offline(true);
    let client = client(transport.clone());

    let err = client
      .request("/feed", RequestConfig::new(Method::GET).retries(1))
      .await
      .unwrap_err();
    assert_eq!(err, ApiError::Transport(TransportError::Network("offline".into())));
    assert_eq!(transport.call_count(), 2);
  }

  struct HangingTransport;

  #[async_trait]
  impl Transport for HangingTransport {
    async fn send(&self, _: HttpRequest) -> Result<HttpResponse, TransportError> {
      futures::future::pending().await
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_counts_as_retryable_failure() {
    let client = client(Arc::new(HangingTransport));

    let start = Instant::now();
    let err = client
      .request(
        "/feed",
        RequestConfig::new(Method::GET)
          .timeout(Duration::from_secs(2))
          .retries(1),
      )
      .await
      .unwrap_err();

    assert_eq!(err, ApiError::Transport(TransportError::Timeout));
    // Two timed-out attempts plus one backoff
    assert_eq!(start.elapsed(), Duration::from_secs(5));
  }
}
