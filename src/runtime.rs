//! Composition root: builds every component from one [`Config`] and keeps the
//! background tasks alive.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::agent::{control, AgentState, ClientRegistry, ControlHandle, InterceptionAgent};
use crate::cache::{CacheStore, EvictionPolicy, EvictionScheduler, ResultCache, SqliteStore};
use crate::client::ResilientClient;
use crate::config::Config;
use crate::http::{ReqwestTransport, Transport};
use crate::push::PushBridge;

/// A running instance.
///
/// Dropping it stops the eviction schedule; [`Offgrid::shutdown`] also stops
/// the control loop.
pub struct Offgrid {
  config: Config,
  agent: Arc<InterceptionAgent>,
  clients: Arc<ClientRegistry>,
  control: ControlHandle,
  control_task: JoinHandle<()>,
  push: PushBridge,
  client: ResilientClient,
  _scheduler: EvictionScheduler,
}

impl Offgrid {
  /// Start with the on-disk store and a real HTTP transport.
  pub async fn start(config: Config) -> Result<Self> {
    let store = Arc::new(SqliteStore::open()?);
    let transport = Arc::new(ReqwestTransport::new()?);
    Self::start_with(config, store, transport).await
  }

  /// Start with the given store and transport, install the agent and spawn
  /// the control loop and eviction schedule.
  pub async fn start_with(
    config: Config,
    store: Arc<dyn CacheStore>,
    transport: Arc<dyn Transport>,
  ) -> Result<Self> {
    config.validate()?;

    let clients = Arc::new(ClientRegistry::new());
    let agent = InterceptionAgent::builder(
      config.agent.clone(),
      store,
      transport.clone(),
      clients.clone(),
    )
    .eviction(EvictionPolicy::from(&config.eviction))
    .build()?;
    let agent = Arc::new(agent);

    let state = agent.install().await;
    info!("Agent {} installed, now {}", agent.version(), state);

    let (control, rx) = control::channel(config.control.buffer, config.control.reply_timeout());
    let control_task = control::serve(agent.clone(), rx);
    let scheduler =
      EvictionScheduler::spawn(agent.eviction().clone(), config.eviction.sweep_interval());

    let push = PushBridge::new(config.push.clone(), clients.clone());
    let client = ResilientClient::new(&config.client, transport)
      .map_err(|e| eyre!("Failed to create API client: {}", e))?;

    Ok(Self {
      config,
      agent,
      clients,
      control,
      control_task,
      push,
      client,
      _scheduler: scheduler,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn agent(&self) -> &Arc<InterceptionAgent> {
    &self.agent
  }

  pub fn state(&self) -> AgentState {
    self.agent.state()
  }

  pub fn clients(&self) -> &Arc<ClientRegistry> {
    &self.clients
  }

  pub fn control(&self) -> ControlHandle {
    self.control.clone()
  }

  pub fn push(&self) -> &PushBridge {
    &self.push
  }

  pub fn client(&self) -> &ResilientClient {
    &self.client
  }

  /// A result cache sized by the `result_cache` section.
  pub fn result_cache<T: Clone>(&self) -> ResultCache<T> {
    ResultCache::from_config(&self.config.result_cache)
  }

  /// Stop background work.
  pub async fn shutdown(self) {
    drop(self.control);
    self.control_task.abort();
    // A cancelled task is the expected outcome here
    let _ = self.control_task.await;
    info!("Shut down agent {}", self.agent.version());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::AgentRequest;
  use crate::http::HttpResponse;
  use crate::testing::FakeTransport;
  use serde_json::json;
  use url::Url;

  async fn offgrid(transport: Arc<FakeTransport>) -> Offgrid {
    Offgrid::start_with(
      Config::default(),
      Arc::new(SqliteStore::open_in_memory().unwrap()),
      transport,
    )
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn test_start_installs_and_wires_components() {
    let transport = Arc::new(FakeTransport::new());
    transport.route(
      "http://localhost:3000/api/feed",
      HttpResponse::json(200, &json!({"items": []})),
    );
    transport.route(
      "http://localhost:8000/api/feed",
      HttpResponse::json(200, &json!({"items": [1]})),
    );
    let offgrid = offgrid(transport.clone()).await;
    assert_eq!(offgrid.state(), AgentState::Active);

    let feed = Url::parse("http://localhost:3000/api/feed").unwrap();
    let served = offgrid.agent().intercept(AgentRequest::get(feed)).await;
    assert_eq!(served.response().unwrap().status, 200);

    assert_eq!(offgrid.control().cache_size().await.unwrap(), 12);

    let response = offgrid.client().get("/feed", &[]).await.unwrap();
    assert_eq!(response.json::<serde_json::Value>().unwrap()["items"][0], 1);

    let notification = offgrid.push().on_push(br#"{"title":"Hello"}"#);
    assert_eq!(notification.title, "Hello");

    let cache = offgrid.result_cache::<String>();
    cache.store("Tank", vec!["tank build".to_string()]);
    assert_eq!(cache.lookup(" tank "), Some(vec!["tank build".to_string()]));

    offgrid.shutdown().await;
  }

  #[tokio::test]
  async fn test_invalid_config_is_rejected() {
    let mut config = Config::default();
    config.agent.api_patterns = vec!["(".to_string()];
    let result = Offgrid::start_with(
      config,
      Arc::new(SqliteStore::open_in_memory().unwrap()),
      Arc::new(FakeTransport::new()),
    )
    .await;
    assert!(result.is_err());
  }
}
