//! Cache layer that orchestrates caching logic with network fetching.

use std::sync::Arc;
use tracing::{debug, warn};

use super::entry::{CacheEntry, RequestKey};
use super::traits::{CacheResult, CacheStore};
use super::writes::WritePolicy;
use crate::clock::Clock;
use crate::http::{HttpRequest, HttpResponse, Transport, TransportError};

/// What to do with a network response fetched after a cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refill {
  /// Serve it without storing
  Never,
  /// Store a 200 response without making the caller wait for the write
  Background,
}

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the interception agent and the transport. Storage
/// failures never surface from here: a failed read is a miss and a failed
/// write is logged.
#[derive(Clone)]
pub struct CacheLayer {
  store: Arc<dyn CacheStore>,
  transport: Arc<dyn Transport>,
  writes: Arc<dyn WritePolicy>,
  clock: Arc<dyn Clock>,
}

impl CacheLayer {
  pub fn new(
    store: Arc<dyn CacheStore>,
    transport: Arc<dyn Transport>,
    writes: Arc<dyn WritePolicy>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      store,
      transport,
      writes,
      clock,
    }
  }

  pub fn store(&self) -> &Arc<dyn CacheStore> {
    &self.store
  }

  /// Read an entry, treating storage errors as a miss.
  pub async fn lookup(&self, partition: &str, key: &RequestKey) -> Option<CacheEntry> {
    match self.store.get(partition, key).await {
      Ok(entry) => entry,
      Err(e) => {
        warn!("Cache read failed for {} in {}: {}", key, partition, e);
        None
      }
    }
  }

  /// Perform a request against the network.
  pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    self.transport.send(request).await
  }

  /// Store `response` under `key`, stamped with the current time.
  pub async fn store_response(&self, partition: &str, key: RequestKey, response: &HttpResponse) {
    let entry = CacheEntry::from_response(key, response, self.clock.now());
    let description = entry.key.to_string();
    match self.writes.write(self.store.as_ref(), partition, entry).await {
      Ok(()) => debug!("Cached {} in {}", description, partition),
      Err(e) => warn!("Cache write failed for {} in {}: {}", description, partition, e),
    }
  }

  fn store_in_background(&self, partition: &str, key: RequestKey, response: HttpResponse) {
    let layer = self.clone();
    let partition = partition.to_string();
    tokio::spawn(async move {
      layer.store_response(&partition, key, &response).await;
    });
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if present, return it without touching the network
  /// 2. On a miss, fetch from network
  /// 3. Optionally store a 200 response according to `refill`
  ///
  /// A network failure on a miss is returned to the caller, which decides
  /// on a fallback.
  pub async fn cache_first(
    &self,
    partition: &str,
    request: HttpRequest,
    refill: Refill,
  ) -> Result<CacheResult<HttpResponse>, TransportError> {
    let key = RequestKey::new(&request.method, &request.url);

    // Check cache first
    if let Some(entry) = self.lookup(partition, &key).await {
      debug!("Serving {} from {}", key, partition);
      return Ok(CacheResult::from_cache(entry.to_response(), entry.stored_at));
    }

    let response = self.fetch(request).await?;
    if refill == Refill::Background && response.status == 200 {
      self.store_in_background(partition, key, response.clone());
    }
    Ok(CacheResult::from_network(response))
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Fetch from network; a 200 is written through before returning
  /// 2. On network failure, return the cached copy for the exact key
  /// 3. With nothing cached, return the network error
  pub async fn network_first(
    &self,
    partition: &str,
    request: HttpRequest,
  ) -> Result<CacheResult<HttpResponse>, TransportError> {
    let key = RequestKey::new(&request.method, &request.url);

    match self.fetch(request).await {
      Ok(response) => {
        if response.status == 200 {
          self.store_response(partition, key, &response).await;
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        // Network failed, return stale cache (offline mode)
        match self.lookup(partition, &key).await {
          Some(entry) => {
            debug!("Network failed for {} ({}), serving cached copy", key, e);
            Ok(CacheResult::offline(entry.to_response(), entry.stored_at))
          }
          None => Err(e),
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, LastWriteWins, SqliteStore};
  use crate::clock::ManualClock;
  use crate::testing::FakeTransport;
  use url::Url;

  fn layer(transport: Arc<FakeTransport>) -> (CacheLayer, Arc<dyn CacheStore>) {
    let store: Arc<dyn CacheStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let layer = CacheLayer::new(
      store.clone(),
      transport,
      Arc::new(LastWriteWins),
      Arc::new(ManualClock::starting_now()),
    );
    (layer, store)
  }

  fn get(url: &str) -> HttpRequest {
    HttpRequest::get(Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let transport = Arc::new(FakeTransport::new());
    let (layer, _) = layer(transport.clone());
    let url = "https://news.example/manifest.json";
    layer
      .store_response(
        "static",
        RequestKey::get(&Url::parse(url).unwrap()),
        &HttpResponse::new(200, "{}"),
      )
      .await;

    let result = layer.cache_first("static", get(url), Refill::Never).await.unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(transport.call_count(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_without_refill_does_not_store() {
    let transport = Arc::new(FakeTransport::new());
    transport.route("https://news.example/", HttpResponse::new(200, "<html>"));
    let (layer, store) = layer(transport.clone());

    let result = layer
      .cache_first("static", get("https://news.example/"), Refill::Never)
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert!(store.keys("static").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_cache_first_background_refill_stores_success_only() {
    let transport = Arc::new(FakeTransport::new());
    transport.route("https://news.example/a.png", HttpResponse::new(200, "png"));
    transport.route("https://news.example/b.png", HttpResponse::new(500, "boom"));
    let (layer, store) = layer(transport.clone());

    layer
      .cache_first("images", get("https://news.example/a.png"), Refill::Background)
      .await
      .unwrap();
    layer
      .cache_first("images", get("https://news.example/b.png"), Refill::Background)
      .await
      .unwrap();

    for _ in 0..10 {
      tokio::task::yield_now().await;
    }
    let keys = store.keys("images").await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].url(), "https://news.example/a.png");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cached_copy() {
    let transport = Arc::new(FakeTransport::new());
    let url = "https://news.example/api/feed";
    transport.route(url, HttpResponse::new(200, "fresh"));
    let (layer, _) = layer(transport.clone());

    let first = layer.network_first("api", get(url)).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    transport.set_offline(true);
    let second = layer.network_first("api", get(url)).await.unwrap();
    assert_eq!(second.source, CacheSource::Offline);
    assert_eq!(second.data.body, b"fresh".to_vec());
  }

  #[tokio::test]
  async fn test_network_first_without_cache_returns_error() {
    let transport = Arc::new(FakeTransport::new());
    transport.set_offline(true);
    let (layer, _) = layer(transport);

    let result = layer
      .network_first("api", get("https://news.example/api/feed"))
      .await;
    assert!(matches!(result, Err(TransportError::Network(_))));
  }
}
