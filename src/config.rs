use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration. Every section has defaults, so an empty file
/// (or no file at all) yields a working setup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub agent: AgentConfig,
  pub eviction: EvictionConfig,
  pub client: ClientConfig,
  pub result_cache: ResultCacheConfig,
  pub push: PushConfig,
  pub control: ControlConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
  /// Generation label embedded in every partition name
  pub version: String,
  /// Prefix shared by all partitions this agent manages
  pub cache_prefix: String,
  /// Origin that relative manifest paths resolve against
  pub origin: String,
  /// Paths pre-cached on install and served cache-first
  pub static_manifest: Vec<String>,
  /// Path of the root document, which falls back to the offline page
  pub root_path: String,
  /// Path of the offline page (always part of the manifest)
  pub offline_page: String,
  /// Regular expressions matched against request paths
  pub api_patterns: Vec<String>,
  /// Message carried in the synthesized offline API response
  pub offline_message: String,
  /// Activate right after install instead of waiting for old clients
  pub skip_waiting: bool,
}

impl Default for AgentConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      cache_prefix: "offgrid".to_string(),
      origin: "http://localhost:3000".to_string(),
      static_manifest: vec![
        "/".to_string(),
        "/offline.html".to_string(),
        "/manifest.json".to_string(),
        "/icon-192.png".to_string(),
        "/icon-512.png".to_string(),
      ],
      root_path: "/".to_string(),
      offline_page: "/offline.html".to_string(),
      api_patterns: vec!["^/api/feed".to_string(), "^/api/articles".to_string()],
      offline_message: "No internet connection".to_string(),
      skip_waiting: true,
    }
  }
}

impl AgentConfig {
  /// The static manifest with the offline page guaranteed to be present.
  pub fn manifest(&self) -> Vec<String> {
    let mut manifest = self.static_manifest.clone();
    if !manifest.contains(&self.offline_page) {
      manifest.push(self.offline_page.clone());
    }
    manifest
  }
}

/// Upper bound for configured ages and TTLs, about a century.
pub const MAX_LIFETIME_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// `secs` as a chrono duration, `None` when it does not fit.
fn lifetime(secs: u64) -> Option<chrono::Duration> {
  i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
}

fn check_lifetime(name: &str, secs: u64) -> Result<()> {
  if secs == 0 || secs > MAX_LIFETIME_SECS || lifetime(secs).is_none() {
    return Err(eyre!(
      "{} must be between 1 and {}, got {}",
      name,
      MAX_LIFETIME_SECS,
      secs
    ));
  }
  Ok(())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
  pub max_age_secs: u64,
  pub max_bytes: u64,
  pub sweep_interval_secs: u64,
}

impl Default for EvictionConfig {
  fn default() -> Self {
    Self {
      max_age_secs: 24 * 60 * 60,
      max_bytes: 50 * 1024 * 1024,
      sweep_interval_secs: 24 * 60 * 60,
    }
  }
}

impl EvictionConfig {
  /// Saturates for values [`Config::validate`] would reject.
  pub fn max_age(&self) -> chrono::Duration {
    lifetime(self.max_age_secs).unwrap_or(chrono::Duration::MAX)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
  /// Base URL endpoints are appended to
  pub base_url: String,
  pub timeout_ms: u64,
  /// Retries after the first attempt
  pub retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub backoff_factor: f64,
  pub user_agent: String,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8000/api".to_string(),
      timeout_ms: 10_000,
      retries: 3,
      base_delay_ms: 1_000,
      max_delay_ms: 10_000,
      backoff_factor: 2.0,
      user_agent: concat!("offgrid/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResultCacheConfig {
  pub ttl_secs: u64,
  pub max_entries: usize,
}

impl ResultCacheConfig {
  /// Saturates for values [`Config::validate`] would reject.
  pub fn ttl(&self) -> chrono::Duration {
    lifetime(self.ttl_secs).unwrap_or(chrono::Duration::MAX)
  }
}

impl Default for ResultCacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 5 * 60,
      max_entries: 50,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
  /// Title used when a push payload has none
  pub app_name: String,
  pub default_body: String,
  pub default_tag: String,
  pub icon: String,
  pub badge: Option<String>,
  pub default_url: String,
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      app_name: "Offgrid".to_string(),
      default_body: "New item".to_string(),
      default_tag: "default".to_string(),
      icon: "/icon-192.png".to_string(),
      badge: None,
      default_url: "/".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
  /// How long callers wait for a reply before giving up
  pub reply_timeout_ms: u64,
  /// Queued messages before senders wait
  pub buffer: usize,
}

impl Default for ControlConfig {
  fn default() -> Self {
    Self {
      reply_timeout_ms: 5_000,
      buffer: 32,
    }
  }
}

impl ControlConfig {
  pub fn reply_timeout(&self) -> Duration {
    Duration::from_millis(self.reply_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive, overridden by OFFGRID_LOG
  pub level: String,
  /// Write logs to daily files in this directory instead of stderr
  pub directory: Option<PathBuf>,
  pub file_prefix: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
      file_prefix: "offgrid.log".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offgrid/config.yaml
  ///
  /// Without an explicit path and no file found, defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offgrid").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to load config file {}: {}", path.display(), e))
  }

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty document deserializes as null
    let config: Config = if contents.trim().is_empty() {
      Config::default()
    } else {
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?
    };

    config.validate()?;
    Ok(config)
  }

  /// Reject values the components cannot work with.
  pub fn validate(&self) -> Result<()> {
    if self.agent.version.trim().is_empty() {
      return Err(eyre!("agent.version must not be empty"));
    }
    if self.agent.cache_prefix.trim().is_empty() {
      return Err(eyre!("agent.cache_prefix must not be empty"));
    }
    url::Url::parse(&self.agent.origin)
      .map_err(|e| eyre!("agent.origin '{}' is not a URL: {}", self.agent.origin, e))?;
    url::Url::parse(&self.client.base_url)
      .map_err(|e| eyre!("client.base_url '{}' is not a URL: {}", self.client.base_url, e))?;
    if self.client.backoff_factor < 1.0 {
      return Err(eyre!(
        "client.backoff_factor must be at least 1.0, got {}",
        self.client.backoff_factor
      ));
    }
    if self.client.max_delay_ms < self.client.base_delay_ms {
      return Err(eyre!("client.max_delay_ms must not be below client.base_delay_ms"));
    }
    if self.result_cache.max_entries == 0 {
      return Err(eyre!("result_cache.max_entries must be positive"));
    }
    check_lifetime("eviction.max_age_secs", self.eviction.max_age_secs)?;
    check_lifetime("result_cache.ttl_secs", self.result_cache.ttl_secs)?;
    if self.eviction.sweep_interval_secs == 0 {
      return Err(eyre!("eviction.sweep_interval_secs must be positive"));
    }
    if self.control.buffer == 0 {
      return Err(eyre!("control.buffer must be positive"));
    }
    Ok(())
  }
}
