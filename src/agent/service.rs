//! The interception agent: lifecycle driver and per-request strategy.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use super::clients::ClientContexts;
use super::lifecycle::{
  transition, ActiveVersion, AgentState, Effect, LifecycleEvent, LifecyclePolicy,
};
use super::partitions::PartitionNames;
use super::request::AgentRequest;
use super::responses;
use super::routing::{AssetClass, Route, Router};
use crate::cache::{
  CacheLayer, CacheResult, CacheStore, EvictionEngine, EvictionPolicy, LastWriteWins, Partition,
  Refill, RequestKey, WritePolicy,
};
use crate::clock::{Clock, SystemClock};
use crate::config::AgentConfig;
use crate::http::{HttpRequest, HttpResponse, Transport};

/// Outcome of offering a request to the agent.
#[derive(Debug, Clone)]
pub enum Interception {
  /// Not handled; the caller goes to the network itself
  PassThrough,
  /// Answered by the agent
  Respond(CacheResult<HttpResponse>),
  /// The issuing context closed before an answer was ready
  Cancelled,
}

impl Interception {
  pub fn response(&self) -> Option<&HttpResponse> {
    match self {
      Interception::Respond(result) => Some(&result.data),
      _ => None,
    }
  }
}

/// Collects the collaborators of an [`InterceptionAgent`].
pub struct AgentBuilder {
  config: AgentConfig,
  store: Arc<dyn CacheStore>,
  transport: Arc<dyn Transport>,
  clients: Arc<dyn ClientContexts>,
  writes: Arc<dyn WritePolicy>,
  clock: Arc<dyn Clock>,
  eviction: EvictionPolicy,
  active: ActiveVersion,
}

impl AgentBuilder {
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn write_policy(mut self, writes: Arc<dyn WritePolicy>) -> Self {
    self.writes = writes;
    self
  }

  pub fn eviction(mut self, policy: EvictionPolicy) -> Self {
    self.eviction = policy;
    self
  }

  /// Share the active-version cell with other agents of the same origin.
  pub fn active_version(mut self, active: ActiveVersion) -> Self {
    self.active = active;
    self
  }

  pub fn build(self) -> Result<InterceptionAgent> {
    let origin = Url::parse(&self.config.origin)
      .map_err(|e| eyre!("Invalid agent origin '{}': {}", self.config.origin, e))?;
    let router = Router::from_config(&self.config)?;
    let names = PartitionNames::from_config(&self.config);
    let layer = CacheLayer::new(
      self.store.clone(),
      self.transport,
      self.writes,
      self.clock.clone(),
    );
    let eviction = EvictionEngine::new(self.store, self.eviction, self.clock);
    let policy = LifecyclePolicy {
      skip_waiting: self.config.skip_waiting,
    };
    let (snapshot, _) = watch::channel(AgentState::Parsed);
    self.active.register(names.version());

    Ok(InterceptionAgent {
      config: self.config,
      origin,
      names,
      router,
      layer,
      eviction,
      clients: self.clients,
      active: self.active,
      policy,
      transitions: Mutex::new(AgentState::Parsed),
      snapshot,
    })
  }
}

/// Intercepts requests for one origin and serves them from cache, network or
/// a synthesized fallback depending on the route.
///
/// Build one per origin and share it behind an `Arc`. Interceptions run
/// concurrently; lifecycle transitions are serialized.
pub struct InterceptionAgent {
  config: AgentConfig,
  origin: Url,
  names: PartitionNames,
  router: Router,
  layer: CacheLayer,
  eviction: EvictionEngine,
  clients: Arc<dyn ClientContexts>,
  active: ActiveVersion,
  policy: LifecyclePolicy,
  transitions: Mutex<AgentState>,
  snapshot: watch::Sender<AgentState>,
}

impl InterceptionAgent {
  pub fn builder(
    config: AgentConfig,
    store: Arc<dyn CacheStore>,
    transport: Arc<dyn Transport>,
    clients: Arc<dyn ClientContexts>,
  ) -> AgentBuilder {
    AgentBuilder {
      config,
      store,
      transport,
      clients,
      writes: Arc::new(LastWriteWins),
      clock: Arc::new(SystemClock),
      eviction: EvictionPolicy::default(),
      active: ActiveVersion::new(),
    }
  }

  pub fn version(&self) -> &str {
    self.names.version()
  }

  pub fn partitions(&self) -> &PartitionNames {
    &self.names
  }

  pub fn eviction(&self) -> &EvictionEngine {
    &self.eviction
  }

  fn store(&self) -> &Arc<dyn CacheStore> {
    self.layer.store()
  }

  /// Current lifecycle state. An agent that reached `Active` but is no longer
  /// the published active version reports `Redundant`.
  pub fn state(&self) -> AgentState {
    let state = *self.snapshot.borrow();
    if state == AgentState::Active && self.active.current().as_deref() != Some(self.version()) {
      return AgentState::Redundant;
    }
    state
  }

  /// Start the lifecycle: pre-cache the manifest, then wait or activate.
  pub async fn install(&self) -> AgentState {
    self.dispatch(LifecycleEvent::Install).await
  }

  /// Activate now instead of waiting for older clients to go away.
  pub async fn skip_waiting(&self) -> AgentState {
    self.dispatch(LifecycleEvent::SkipWaiting).await
  }

  /// Re-check open contexts; activates a waiting agent once no context is
  /// controlled by another version.
  pub async fn clients_changed(&self) -> AgentState {
    if self.older_clients_gone().await {
      self.dispatch(LifecycleEvent::ClientsReleased).await
    } else {
      self.state()
    }
  }

  /// Mark this agent as replaced by a newer version.
  pub async fn supersede(&self) -> AgentState {
    self.dispatch(LifecycleEvent::Superseded).await
  }

  /// Feed an event into the lifecycle and run effects until the machine
  /// settles. Events the current state does not accept are dropped.
  async fn dispatch(&self, event: LifecycleEvent) -> AgentState {
    let mut state = self.transitions.lock().await;
    let mut queue = VecDeque::from([event]);

    while let Some(event) = queue.pop_front() {
      let Some(step) = transition(*state, event, self.policy) else {
        debug!(
          "Agent {} ignoring {:?} while {}",
          self.version(),
          event,
          *state
        );
        continue;
      };

      info!(
        "Agent {}: {} -> {} ({:?})",
        self.version(),
        *state,
        step.next,
        event
      );
      *state = step.next;
      self.snapshot.send_replace(step.next);

      // Held until this step's effects have run, so one version's cleanup
      // never interleaves with another's activation.
      let activation = match step.next {
        AgentState::Activating => Some(self.active.lock_activation().await),
        _ => None,
      };
      let effects = if activation.is_some() && self.active.outranks(self.version()) {
        info!(
          "Agent {} lost activation to {:?}",
          self.version(),
          self.active.current()
        );
        self.delete_own_partitions().await;
        vec![Effect::Emit(LifecycleEvent::Superseded)]
      } else {
        step.effects
      };

      for effect in effects {
        let follow_up = match effect {
          Effect::Emit(next) => Some(next),
          other => self.run_effect(other).await,
        };
        if let Some(next) = follow_up {
          queue.push_back(next);
        }
      }
    }

    drop(state);
    self.state()
  }

  async fn run_effect(&self, effect: Effect) -> Option<LifecycleEvent> {
    match effect {
      Effect::PrecacheManifest => {
        self.precache_manifest().await;
        None
      }
      Effect::CheckClients => self
        .older_clients_gone()
        .await
        .then_some(LifecycleEvent::ClientsReleased),
      Effect::DeleteStalePartitions => {
        self.delete_stale_partitions().await;
        None
      }
      Effect::SweepExpired => {
        let report = self.eviction.age_sweep().await;
        debug!("Activation sweep: {:?}", report);
        None
      }
      Effect::ClaimClients => {
        let claimed = self.clients.claim(self.version()).await;
        debug!("Agent {} claimed {} clients", self.version(), claimed);
        None
      }
      Effect::PublishActive => {
        if self.active.publish(self.version()) {
          None
        } else {
          Some(LifecycleEvent::Superseded)
        }
      }
      Effect::Emit(next) => Some(next),
    }
  }

  async fn older_clients_gone(&self) -> bool {
    let version = self.version();
    !self
      .clients
      .list()
      .await
      .iter()
      .any(|c| c.controller.as_deref().is_some_and(|v| v != version))
  }

  fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Cannot resolve '{}' against {}: {}", path, self.origin, e))
  }

  async fn precache_manifest(&self) {
    let mut partition = None;
    for name in self.names.all() {
      match Partition::open(self.store().clone(), name).await {
        Ok(opened) if name == self.names.static_assets => partition = Some(opened),
        Ok(_) => {}
        Err(e) => warn!("Failed to open partition {}: {}", name, e),
      }
    }

    let mut cached = 0;
    let manifest = self.config.manifest();
    for path in &manifest {
      let url = match self.resolve(path) {
        Ok(url) => url,
        Err(e) => {
          warn!("Skipping manifest entry: {}", e);
          continue;
        }
      };

      match self.layer.fetch(HttpRequest::get(url.clone())).await {
        Ok(response) if response.status == 200 => {
          self
            .layer
            .store_response(&self.names.static_assets, RequestKey::get(&url), &response)
            .await;
          cached += 1;
        }
        Ok(response) => warn!("Manifest entry {} returned {}", url, response.status),
        Err(e) => warn!("Failed to pre-cache {}: {}", url, e),
      }
    }

    let bytes = match &partition {
      Some(partition) => partition.bytes().await.unwrap_or_default(),
      None => 0,
    };
    info!(
      "Pre-cached {}/{} manifest entries ({} bytes)",
      cached,
      manifest.len(),
      bytes
    );
    self.eviction.size_sweep().await;
  }

  async fn delete_stale_partitions(&self) {
    let partitions = match self.store().list_partitions().await {
      Ok(partitions) => partitions,
      Err(e) => {
        warn!("Could not list partitions for cleanup: {}", e);
        return;
      }
    };

    for name in partitions {
      if !self.names.is_managed(&name) || self.names.is_current(&name) {
        continue;
      }
      if let Some(version) = self.names.version_of(&name) {
        if self.active.is_newer(version, self.version()) {
          debug!("Keeping {} of newer version {}", name, version);
          continue;
        }
      }
      match self.store().delete_partition(&name).await {
        Ok(_) => info!("Deleted stale partition {}", name),
        Err(e) => warn!("Failed to delete stale partition {}: {}", name, e),
      }
    }
  }

  async fn delete_own_partitions(&self) {
    for name in self.names.all() {
      match self.store().delete_partition(name).await {
        Ok(true) => debug!("Deleted abandoned partition {}", name),
        Ok(false) => {}
        Err(e) => warn!("Failed to delete abandoned partition {}: {}", name, e),
      }
    }
  }

  /// Offer a request to the agent.
  ///
  /// Only an active agent intercepts. When the issuing context closes first,
  /// the in-flight work is dropped and `Cancelled` is returned.
  pub async fn intercept(&self, request: AgentRequest) -> Interception {
    if self.state() != AgentState::Active {
      return Interception::PassThrough;
    }

    let route = self.router.classify(&request);
    if route == Route::PassThrough {
      return Interception::PassThrough;
    }

    let closed = match request.client {
      Some(id) => match self.clients.closed(id) {
        Some(token) => Some(token),
        None => {
          debug!("Client {} already gone, dropping {}", id, request.url);
          return Interception::Cancelled;
        }
      },
      None => None,
    };

    let serve = self.serve(route, &request);
    match closed {
      Some(token) => tokio::select! {
        biased;
        _ = token.cancelled() => {
          debug!("Client closed during {}", request.url);
          Interception::Cancelled
        }
        result = serve => Interception::Respond(result),
      },
      None => Interception::Respond(serve.await),
    }
  }

  async fn serve(&self, route: Route, request: &AgentRequest) -> CacheResult<HttpResponse> {
    match route {
      Route::Static => self.serve_static(request).await,
      Route::Api => self.serve_api(request).await,
      Route::Asset(class) => self.serve_asset(class, request).await,
      Route::PassThrough => CacheResult::fallback(responses::unavailable()),
    }
  }

  async fn serve_static(&self, request: &AgentRequest) -> CacheResult<HttpResponse> {
    let partition = &self.names.static_assets;
    match self
      .layer
      .cache_first(partition, request.to_http(), Refill::Never)
      .await
    {
      Ok(result) => result,
      Err(e) => {
        warn!("Static fetch failed for {}: {}", request.url, e);
        if request.url.path() != self.config.root_path {
          return CacheResult::fallback(responses::offline_text());
        }

        let offline_page = match self.resolve(&self.config.offline_page) {
          Ok(url) => self.layer.lookup(partition, &RequestKey::get(&url)).await,
          Err(e) => {
            warn!("{}", e);
            None
          }
        };
        match offline_page {
          Some(entry) => CacheResult::offline(entry.to_response(), entry.stored_at),
          None => CacheResult::fallback(responses::offline_text()),
        }
      }
    }
  }

  async fn serve_api(&self, request: &AgentRequest) -> CacheResult<HttpResponse> {
    match self
      .layer
      .network_first(&self.names.api_responses, request.to_http())
      .await
    {
      Ok(result) => result,
      Err(e) => {
        warn!("API request {} failed with nothing cached: {}", request.url, e);
        CacheResult::fallback(responses::offline_api(&self.config.offline_message))
      }
    }
  }

  async fn serve_asset(&self, class: AssetClass, request: &AgentRequest) -> CacheResult<HttpResponse> {
    let partition = match class {
      AssetClass::Image => &self.names.image_assets,
      AssetClass::Style | AssetClass::Script => &self.names.static_assets,
    };
    match self
      .layer
      .cache_first(partition, request.to_http(), Refill::Background)
      .await
    {
      Ok(result) => result,
      Err(e) => {
        debug!("Asset {} unavailable: {}", request.url, e);
        match class {
          AssetClass::Image => CacheResult::fallback(responses::image_placeholder()),
          _ => CacheResult::fallback(responses::unavailable()),
        }
      }
    }
  }

  /// Fetch each URL and store successful responses in the API partition.
  /// Returns `(cached, failed)`.
  pub async fn cache_urls(&self, urls: &[String]) -> (usize, usize) {
    let partition = &self.names.api_responses;
    let outcomes = join_all(urls.iter().map(|raw| async move {
      let url = match self.resolve(raw) {
        Ok(url) => url,
        Err(e) => {
          warn!("Not caching: {}", e);
          return false;
        }
      };
      match self.layer.fetch(HttpRequest::get(url.clone())).await {
        Ok(response) if response.status == 200 => {
          self
            .layer
            .store_response(partition, RequestKey::get(&url), &response)
            .await;
          true
        }
        Ok(response) => {
          warn!("Not caching {}: status {}", url, response.status);
          false
        }
        Err(e) => {
          warn!("Not caching {}: {}", url, e);
          false
        }
      }
    }))
    .await;

    let cached = outcomes.iter().filter(|ok| **ok).count();
    self.eviction.size_sweep().await;
    (cached, outcomes.len() - cached)
  }

  /// Delete every partition under this agent's prefix, any version.
  pub async fn clear_cache(&self) -> usize {
    let partitions = match self.store().list_partitions().await {
      Ok(partitions) => partitions,
      Err(e) => {
        warn!("Could not list partitions to clear: {}", e);
        return 0;
      }
    };

    let mut cleared = 0;
    for name in partitions.iter().filter(|n| self.names.is_managed(n)) {
      match self.store().delete_partition(name).await {
        Ok(true) => cleared += 1,
        Ok(false) => {}
        Err(e) => warn!("Failed to clear partition {}: {}", name, e),
      }
    }
    info!("Cleared {} partitions", cleared);
    cleared
  }

  /// Total payload bytes held by the store.
  pub async fn cache_size(&self) -> Result<u64> {
    self.store().total_bytes().await
  }
}
