//! Cached response records and their request identity.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

use crate::http::HttpResponse;

/// Normalized identity of a cacheable request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_uppercase(),
      url: url.to_string(),
    }
  }

  /// Identity of a GET for `url`.
  pub fn get(url: &Url) -> Self {
    Self::new(&Method::GET, url)
  }

  /// Rebuild a key from its stored parts.
  pub(crate) fn from_parts(method: String, url: String) -> Self {
    Self { method, url }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 of the identity, used as a fixed-length storage key.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A stored response. Entries are never patched, only replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: RequestKey,
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub payload: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn from_response(key: RequestKey, response: &HttpResponse, stored_at: DateTime<Utc>) -> Self {
    Self {
      key,
      status: response.status,
      headers: response.headers.clone(),
      payload: response.body.clone(),
      stored_at,
    }
  }

  /// Rebuild the response this entry was stored from.
  pub fn to_response(&self) -> HttpResponse {
    HttpResponse {
      status: self.status,
      headers: self.headers.clone(),
      body: self.payload.clone(),
    }
  }

  pub fn size(&self) -> u64 {
    self.payload.len() as u64
  }

  pub fn meta(&self) -> EntryMeta {
    EntryMeta {
      key: self.key.clone(),
      stored_at: self.stored_at,
      size: self.size(),
    }
  }
}

/// What sweeps need to know about an entry, without its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
  pub key: RequestKey,
  pub stored_at: DateTime<Utc>,
  pub size: u64,
}
