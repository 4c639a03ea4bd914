//! Application contexts (open windows/tabs) the agent can see and control.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type ClientId = u64;

/// Snapshot of one open context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
  pub id: ClientId,
  pub url: String,
  pub focused: bool,
  /// Agent version controlling this context, if any
  pub controller: Option<String>,
}

/// Host-side view of the open application contexts.
#[async_trait]
pub trait ClientContexts: Send + Sync {
  async fn list(&self) -> Vec<ClientContext>;

  /// Bring a context to the foreground. Returns false if it is gone.
  async fn focus(&self, id: ClientId) -> bool;

  /// Open a new context at `url`.
  async fn open(&self, url: &str) -> ClientId;

  /// Make `version` the controller of every open context. Returns how many
  /// changed hands.
  async fn claim(&self, version: &str) -> usize;

  /// Token cancelled when the context closes. `None` if it is already gone.
  fn closed(&self, id: ClientId) -> Option<CancellationToken>;
}

struct Slot {
  context: ClientContext,
  closed: CancellationToken,
}

/// In-process [`ClientContexts`] implementation.
pub struct ClientRegistry {
  slots: Mutex<BTreeMap<ClientId, Slot>>,
  next_id: AtomicU64,
}

impl Default for ClientRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self {
      slots: Mutex::new(BTreeMap::new()),
      next_id: AtomicU64::new(1),
    }
  }

  fn slots(&self) -> std::sync::MutexGuard<'_, BTreeMap<ClientId, Slot>> {
    self.slots.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Track a newly opened context. It starts uncontrolled and unfocused.
  pub fn register(&self, url: &str) -> ClientId {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let slot = Slot {
      context: ClientContext {
        id,
        url: url.to_string(),
        focused: false,
        controller: None,
      },
      closed: CancellationToken::new(),
    };
    self.slots().insert(id, slot);
    id
  }

  pub fn navigate(&self, id: ClientId, url: &str) -> bool {
    match self.slots().get_mut(&id) {
      Some(slot) => {
        slot.context.url = url.to_string();
        true
      }
      None => false,
    }
  }

  pub fn set_controller(&self, id: ClientId, version: &str) -> bool {
    match self.slots().get_mut(&id) {
      Some(slot) => {
        slot.context.controller = Some(version.to_string());
        true
      }
      None => false,
    }
  }

  /// Forget a context and cancel anything still waiting on it.
  pub fn close(&self, id: ClientId) -> bool {
    match self.slots().remove(&id) {
      Some(slot) => {
        slot.closed.cancel();
        debug!("Client {} closed", id);
        true
      }
      None => false,
    }
  }

  pub fn get(&self, id: ClientId) -> Option<ClientContext> {
    self.slots().get(&id).map(|slot| slot.context.clone())
  }
}

#[async_trait]
impl ClientContexts for ClientRegistry {
  async fn list(&self) -> Vec<ClientContext> {
    self.slots().values().map(|slot| slot.context.clone()).collect()
  }

  async fn focus(&self, id: ClientId) -> bool {
    let mut slots = self.slots();
    if !slots.contains_key(&id) {
      return false;
    }
    for (slot_id, slot) in slots.iter_mut() {
      slot.context.focused = *slot_id == id;
    }
    true
  }

  async fn open(&self, url: &str) -> ClientId {
    let id = self.register(url);
    self.focus(id).await;
    id
  }

  async fn claim(&self, version: &str) -> usize {
    let mut claimed = 0;
    for slot in self.slots().values_mut() {
      if slot.context.controller.as_deref() != Some(version) {
        slot.context.controller = Some(version.to_string());
        claimed += 1;
      }
    }
    claimed
  }

  fn closed(&self, id: ClientId) -> Option<CancellationToken> {
    self.slots().get(&id).map(|slot| slot.closed.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_open_focuses_new_context_only() {
    let registry = ClientRegistry::new();
    let first = registry.open("/").await;
    let second = registry.open("/news/42").await;

    assert!(!registry.get(first).unwrap().focused);
    assert!(registry.get(second).unwrap().focused);
  }

  #[tokio::test]
  async fn test_claim_counts_changed_contexts() {
    let registry = ClientRegistry::new();
    let a = registry.register("/");
    registry.register("/about");
    registry.set_controller(a, "v2");

    assert_eq!(registry.claim("v2").await, 1);
    assert_eq!(registry.claim("v2").await, 0);
    assert!(registry
      .list()
      .await
      .iter()
      .all(|c| c.controller.as_deref() == Some("v2")));
  }

  #[tokio::test]
  async fn test_close_cancels_token() {
    let registry = ClientRegistry::new();
    let id = registry.register("/");
    let token = registry.closed(id).unwrap();
    assert!(!token.is_cancelled());

    assert!(registry.close(id));
    assert!(token.is_cancelled());
    assert!(registry.closed(id).is_none());
    assert!(!registry.focus(id).await);
  }
}
