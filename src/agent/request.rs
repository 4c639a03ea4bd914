use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use super::clients::ClientId;
use crate::cache::RequestKey;
use crate::http::HttpRequest;

/// What kind of resource a request is for, as reported by the issuing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Image,
  Style,
  Script,
  Font,
  /// Fetch/XHR and anything unclassified
  #[default]
  Empty,
}

/// A request seen by the interception agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: BTreeMap<String, String>,
  /// Context that issued the request, if known
  pub client: Option<ClientId>,
}

impl AgentRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      destination: Destination::Empty,
      headers: BTreeMap::new(),
      client: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn from_client(mut self, client: ClientId) -> Self {
    self.client = Some(client);
    self
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }

  /// The request as it goes out to the network.
  pub fn to_http(&self) -> HttpRequest {
    HttpRequest {
      method: self.method.clone(),
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: None,
      timeout: None,
    }
  }
}
