//! Turns push payloads into user notifications and routes clicks back into
//! the application.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::{Position, Url};

use crate::agent::{ClientContexts, ClientId};
use crate::config::PushConfig;

/// Action button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

impl NotificationAction {
  pub const OPEN: &'static str = "open";
  pub const DISMISS: &'static str = "dismiss";

  fn defaults() -> Vec<Self> {
    vec![
      Self {
        action: Self::OPEN.to_string(),
        title: "Open".to_string(),
      },
      Self {
        action: Self::DISMISS.to_string(),
        title: "Dismiss".to_string(),
      },
    ]
  }
}

/// Push payload as sent by the server. Every field is optional, and a field
/// of the wrong type counts as missing.
#[derive(Debug, Clone, Default)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  badge: Option<String>,
  tag: Option<String>,
  require_interaction: Option<bool>,
  actions: Option<Vec<NotificationAction>>,
  url: Option<String>,
}

impl PushPayload {
  fn from_fields(fields: &Map<String, Value>) -> Self {
    let string = |name: &str| match fields.get(name) {
      Some(Value::String(value)) => Some(value.clone()),
      Some(other) => {
        debug!("Ignoring push field {}: not a string ({})", name, other);
        None
      }
      None => None,
    };
    let actions = fields.get("actions").and_then(|value| {
      serde_json::from_value::<Vec<NotificationAction>>(value.clone())
        .map_err(|e| debug!("Ignoring push field actions: {}", e))
        .ok()
    });

    Self {
      title: string("title"),
      body: string("body"),
      icon: string("icon"),
      badge: string("badge"),
      tag: string("tag"),
      require_interaction: fields.get("requireInteraction").and_then(Value::as_bool),
      actions,
      url: string("url"),
    }
  }

  fn text(raw: &[u8]) -> Self {
    let text = String::from_utf8_lossy(raw).trim().to_string();
    Self {
      body: (!text.is_empty()).then_some(text),
      ..Self::default()
    }
  }
}

/// A notification ready to be shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: Option<String>,
  /// Notifications sharing a tag replace each other
  pub tag: String,
  pub require_interaction: bool,
  pub actions: Vec<NotificationAction>,
  /// Deep link opened on click
  pub url: String,
}

impl Notification {
  /// Build a notification from a raw push payload. A payload that is not a
  /// JSON object becomes the body of a notification with default fields.
  pub fn from_payload(raw: &[u8], config: &PushConfig) -> Self {
    let payload = match serde_json::from_slice::<Value>(raw) {
      Ok(Value::Object(fields)) => PushPayload::from_fields(&fields),
      Ok(_) => {
        debug!("Push payload is JSON but not an object, showing it as text");
        PushPayload::text(raw)
      }
      Err(e) => {
        debug!("Push payload is not JSON ({}), showing it as text", e);
        PushPayload::text(raw)
      }
    };

    Self {
      title: payload.title.unwrap_or_else(|| config.app_name.clone()),
      body: payload.body.unwrap_or_else(|| config.default_body.clone()),
      icon: payload.icon.unwrap_or_else(|| config.icon.clone()),
      badge: payload.badge.or_else(|| config.badge.clone()),
      tag: payload.tag.unwrap_or_else(|| config.default_tag.clone()),
      require_interaction: payload.require_interaction.unwrap_or(false),
      actions: payload
        .actions
        .filter(|actions| !actions.is_empty())
        .unwrap_or_else(NotificationAction::defaults),
      url: payload.url.unwrap_or_else(|| config.default_url.clone()),
    }
  }
}

/// Notifications currently on screen, at most one per tag.
#[derive(Debug, Default)]
pub struct NotificationTray {
  shown: Mutex<Vec<Notification>>,
}

impl NotificationTray {
  pub fn new() -> Self {
    Self::default()
  }

  fn shown(&self) -> std::sync::MutexGuard<'_, Vec<Notification>> {
    self.shown.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Show `notification`, replacing one with the same tag. Returns whether a
  /// replacement happened.
  pub fn show(&self, notification: Notification) -> bool {
    let mut shown = self.shown();
    let before = shown.len();
    shown.retain(|n| n.tag != notification.tag);
    let replaced = shown.len() != before;
    shown.push(notification);
    replaced
  }

  pub fn close(&self, tag: &str) -> Option<Notification> {
    let mut shown = self.shown();
    let index = shown.iter().position(|n| n.tag == tag)?;
    Some(shown.remove(index))
  }

  pub fn get(&self, tag: &str) -> Option<Notification> {
    self.shown().iter().find(|n| n.tag == tag).cloned()
  }

  pub fn list(&self) -> Vec<Notification> {
    self.shown().clone()
  }

  pub fn len(&self) -> usize {
    self.shown().len()
  }

  pub fn is_empty(&self) -> bool {
    self.shown().is_empty()
  }
}

/// User interaction with a shown notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
  /// Body click (`action: None`) or an action button
  Click { tag: String, action: Option<String> },
  /// Closed without clicking
  Close { tag: String },
}

/// What the bridge did in response to an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionOutcome {
  /// An open context already showed the deep link and was focused
  Focused(ClientId),
  /// A new context was opened at the deep link
  Opened(ClientId),
  Dismissed,
  /// Nothing to do
  Ignored,
}

/// Whether a context at `current` is showing `link`. Links are usually
/// origin-relative, contexts report absolute URLs.
fn shows(current: &str, link: &str) -> bool {
  if current == link {
    return true;
  }
  match Url::parse(current) {
    Ok(url) => &url[Position::BeforePath..] == link,
    Err(_) => false,
  }
}

/// Receives push payloads and handles notification interactions.
pub struct PushBridge {
  config: PushConfig,
  tray: NotificationTray,
  clients: Arc<dyn ClientContexts>,
}

impl PushBridge {
  pub fn new(config: PushConfig, clients: Arc<dyn ClientContexts>) -> Self {
    Self {
      config,
      tray: NotificationTray::new(),
      clients,
    }
  }

  pub fn tray(&self) -> &NotificationTray {
    &self.tray
  }

  /// Handle an incoming push and show the resulting notification.
  pub fn on_push(&self, raw: &[u8]) -> Notification {
    let notification = Notification::from_payload(raw, &self.config);
    if self.tray.show(notification.clone()) {
      debug!("Replaced notification with tag {}", notification.tag);
    }
    info!("Showing notification '{}' ({})", notification.title, notification.tag);
    notification
  }

  pub async fn on_interaction(&self, interaction: Interaction) -> InteractionOutcome {
    match interaction {
      Interaction::Close { tag } => {
        self.tray.close(&tag);
        debug!("Notification {} closed without interaction", tag);
        InteractionOutcome::Ignored
      }
      Interaction::Click { tag, action } => {
        let notification = self.tray.close(&tag);
        match action.as_deref() {
          None | Some(NotificationAction::OPEN) => {
            let url = notification
              .map(|n| n.url)
              .unwrap_or_else(|| self.config.default_url.clone());
            self.open_or_focus(&url).await
          }
          Some(NotificationAction::DISMISS) => InteractionOutcome::Dismissed,
          Some(other) => {
            warn!("Unknown notification action '{}' on {}", other, tag);
            InteractionOutcome::Ignored
          }
        }
      }
    }
  }

  async fn open_or_focus(&self, url: &str) -> InteractionOutcome {
    let existing = self
      .clients
      .list()
      .await
      .into_iter()
      .find(|c| shows(&c.url, url));

    if let Some(context) = existing {
      if self.clients.focus(context.id).await {
        debug!("Focused client {} at {}", context.id, url);
        return InteractionOutcome::Focused(context.id);
      }
    }

    let id = self.clients.open(url).await;
    debug!("Opened client {} at {}", id, url);
    InteractionOutcome::Opened(id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::ClientRegistry;

  fn bridge() -> (PushBridge, Arc<ClientRegistry>) {
    let clients = Arc::new(ClientRegistry::new());
    (PushBridge::new(PushConfig::default(), clients.clone()), clients)
  }

  #[test]
  fn test_payload_fields_are_used() {
    let (bridge, _) = bridge();
    let shown = bridge.on_push(
      br#"{"title":"Update","body":"New article","tag":"update-1","url":"/news/42"}"#,
    );
    assert_eq!(shown.title, "Update");
    assert_eq!(shown.body, "New article");
    assert_eq!(shown.tag, "update-1");
    assert_eq!(shown.url, "/news/42");
    assert_eq!(shown.actions, NotificationAction::defaults());
    assert_eq!(bridge.tray().get("update-1"), Some(shown));
  }

  #[test]
  fn test_same_tag_replaces() {
    let (bridge, _) = bridge();
    bridge.on_push(br#"{"title":"Update","body":"New article","tag":"update-1","url":"/news/42"}"#);
    bridge.on_push(br#"{"title":"Update","body":"Newer article","tag":"update-1","url":"/news/43"}"#);
    bridge.on_push(br#"{"title":"Other","tag":"digest"}"#);

    assert_eq!(bridge.tray().len(), 2);
    assert_eq!(bridge.tray().get("update-1").unwrap().body, "Newer article");
  }

  #[test]
  fn test_missing_fields_use_defaults() {
    let (bridge, _) = bridge();
    let shown = bridge.on_push(br#"{"requireInteraction": true}"#);
    assert_eq!(shown.title, "Offgrid");
    assert_eq!(shown.body, "New item");
    assert_eq!(shown.tag, "default");
    assert_eq!(shown.icon, "/icon-192.png");
    assert_eq!(shown.url, "/");
    assert!(shown.require_interaction);
  }

  #[test]
  fn test_unparseable_payload_becomes_text() {
    let (bridge, _) = bridge();
    let shown = bridge.on_push(b"Server restarting at noon");
    assert_eq!(shown.title, "Offgrid");
    assert_eq!(shown.body, "Server restarting at noon");

    let empty = bridge.on_push(b"");
    assert_eq!(empty.body, "New item");
  }

  #[test]
  fn test_mistyped_field_keeps_the_rest() {
    let (bridge, _) = bridge();
    let shown = bridge.on_push(
      br#"{"title":"X","requireInteraction":"yes","tag":"t","url":"/news/7","body":3}"#,
    );
    assert_eq!(shown.title, "X");
    assert_eq!(shown.tag, "t");
    assert_eq!(shown.url, "/news/7");
    assert_eq!(shown.body, "New item");
    assert!(!shown.require_interaction);

    let bad_actions = bridge.on_push(br#"{"title":"Y","actions":[{"action":1}]}"#);
    assert_eq!(bad_actions.title, "Y");
    assert_eq!(bad_actions.actions, NotificationAction::defaults());
  }

  #[tokio::test]
  async fn test_click_focuses_context_showing_link() {
    let (bridge, clients) = bridge();
    clients.register("http://localhost:3000/");
    let article = clients.register("http://localhost:3000/news/42");
    bridge.on_push(br#"{"tag":"update-1","url":"/news/42"}"#);

    let outcome = bridge
      .on_interaction(Interaction::Click {
        tag: "update-1".to_string(),
        action: None,
      })
      .await;
    assert_eq!(outcome, InteractionOutcome::Focused(article));
    assert!(clients.get(article).unwrap().focused);
    assert!(bridge.tray().is_empty());
  }

  #[tokio::test]
  async fn test_open_action_opens_new_context() {
    let (bridge, clients) = bridge();
    clients.register("http://localhost:3000/");
    bridge.on_push(br#"{"tag":"update-1","url":"/news/42"}"#);

    let outcome = bridge
      .on_interaction(Interaction::Click {
        tag: "update-1".to_string(),
        action: Some("open".to_string()),
      })
      .await;
    let InteractionOutcome::Opened(id) = outcome else {
      panic!("expected a new context, got {:?}", outcome);
    };
    assert_eq!(clients.get(id).unwrap().url, "/news/42");
  }

  #[tokio::test]
  async fn test_dismiss_and_close_do_not_touch_clients() {
    let (bridge, clients) = bridge();
    bridge.on_push(br#"{"tag":"a"}"#);
    bridge.on_push(br#"{"tag":"b"}"#);

    let dismissed = bridge
      .on_interaction(Interaction::Click {
        tag: "a".to_string(),
        action: Some("dismiss".to_string()),
      })
      .await;
    let closed = bridge
      .on_interaction(Interaction::Close {
        tag: "b".to_string(),
      })
      .await;

    assert_eq!(dismissed, InteractionOutcome::Dismissed);
    assert_eq!(closed, InteractionOutcome::Ignored);
    assert!(clients.list().await.is_empty());
    assert!(bridge.tray().is_empty());
  }
}
