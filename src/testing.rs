//! Fakes shared by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::http::{HttpRequest, HttpResponse, Transport, TransportError};

/// In-memory [`Transport`].
///
/// Scripted outcomes are consumed first, in order. After that the transport
/// answers from its route table, failing every call while offline and
/// returning 404 for unknown URLs.
#[derive(Default)]
pub struct FakeTransport {
  script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
  routes: Mutex<HashMap<String, HttpResponse>>,
  offline: AtomicBool,
  calls: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(&self, url: &str, response: HttpResponse) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn push(&self, outcome: Result<HttpResponse, TransportError>) {
    self.script.lock().unwrap().push_back(outcome);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<HttpRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn urls(&self) -> Vec<String> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .map(|r| r.url.to_string())
      .collect()
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(request);

    if let Some(outcome) = self.script.lock().unwrap().pop_front() {
      return outcome;
    }
    if self.offline.load(Ordering::SeqCst) {
      return Err(TransportError::Network("offline".to_string()));
    }
    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&url)
        .cloned()
        .unwrap_or_else(|| HttpResponse::new(404, "not found")),
    )
  }
}
