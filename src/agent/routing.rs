//! Classification of intercepted requests into serving strategies.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use reqwest::Method;
use std::collections::HashSet;

use super::request::{AgentRequest, Destination};
use crate::config::AgentConfig;

/// Asset classes served cache-first with a background refill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetClass {
  Image,
  Style,
  Script,
}

/// Strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Exact static path: cache-first, root document falls back to the offline page
  Static,
  /// API pattern: network-first with write-through
  Api,
  /// Image, style or script: cache-first, refilled in the background
  Asset(AssetClass),
  /// Not intercepted
  PassThrough,
}

/// Fixed routing table, built once per agent.
#[derive(Debug, Clone)]
pub struct Router {
  static_paths: HashSet<String>,
  api_patterns: Vec<Regex>,
}

impl Router {
  pub fn new(static_paths: &[String], api_patterns: &[String]) -> Result<Self> {
    let api_patterns = api_patterns
      .iter()
      .map(|p| Regex::new(p).map_err(|e| eyre!("Invalid API pattern '{}': {}", p, e)))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      static_paths: static_paths.iter().cloned().collect(),
      api_patterns,
    })
  }

  pub fn from_config(config: &AgentConfig) -> Result<Self> {
    Self::new(&config.manifest(), &config.api_patterns)
  }

  /// Pick the strategy for `request`. Precedence: static path, API pattern,
  /// asset destination. Anything that is not a GET passes through.
  pub fn classify(&self, request: &AgentRequest) -> Route {
    if request.method != Method::GET {
      return Route::PassThrough;
    }

    let path = request.url.path();
    if self.static_paths.contains(path) {
      return Route::Static;
    }
    if self.api_patterns.iter().any(|p| p.is_match(path)) {
      return Route::Api;
    }

    match request.destination {
      Destination::Image => Route::Asset(AssetClass::Image),
      Destination::Style => Route::Asset(AssetClass::Style),
      Destination::Script => Route::Asset(AssetClass::Script),
      _ => Route::PassThrough,
    }
  }
}
