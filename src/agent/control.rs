//! Request/reply messaging between application contexts and the agent.
//!
//! Messages travel over an mpsc channel as [`Envelope`]s. Each envelope has a
//! correlation id and optionally a oneshot port; the agent answers each port
//! at most once, and callers stop waiting after a timeout.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::service::InterceptionAgent;

/// Messages accepted by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  SkipWaiting,
  CacheUrls { urls: Vec<String> },
  ClearCache,
  GetCacheSize,
}

impl ControlMessage {
  /// Messages that are pure queries and mean nothing without a reply port.
  pub fn requires_port(&self) -> bool {
    matches!(self, ControlMessage::ClearCache | ControlMessage::GetCacheSize)
  }
}

/// Replies sent back over a request's port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
  CacheSize { size: u64 },
  CacheCleared { partitions: usize },
  UrlsCached { cached: usize, failed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
  #[error("control channel closed")]
  Closed,
  #[error("no reply within {0:?}")]
  Timeout(Duration),
  #[error("agent dropped the reply port without answering")]
  NoReply,
  #[error("unexpected reply: {0:?}")]
  UnexpectedReply(ControlReply),
}

/// One message in flight.
#[derive(Debug)]
pub struct Envelope {
  pub id: u64,
  pub message: ControlMessage,
  pub reply: Option<oneshot::Sender<ControlReply>>,
}

/// Create a connected handle and receiver.
pub fn channel(buffer: usize, reply_timeout: Duration) -> (ControlHandle, mpsc::Receiver<Envelope>) {
  let (tx, rx) = mpsc::channel(buffer);
  let handle = ControlHandle {
    tx,
    next_id: Arc::new(AtomicU64::new(1)),
    reply_timeout,
  };
  (handle, rx)
}

/// Caller side of the control channel.
#[derive(Clone)]
pub struct ControlHandle {
  tx: mpsc::Sender<Envelope>,
  next_id: Arc<AtomicU64>,
  reply_timeout: Duration,
}

impl ControlHandle {
  fn next_id(&self) -> u64 {
    self.next_id.fetch_add(1, Ordering::Relaxed)
  }

  /// Send without a reply port.
  pub async fn post(&self, message: ControlMessage) -> Result<u64, ControlError> {
    let id = self.next_id();
    self
      .tx
      .send(Envelope {
        id,
        message,
        reply: None,
      })
      .await
      .map_err(|_| ControlError::Closed)?;
    Ok(id)
  }

  /// Send with a reply port and wait for the answer.
  pub async fn request(&self, message: ControlMessage) -> Result<ControlReply, ControlError> {
    let id = self.next_id();
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .tx
      .send(Envelope {
        id,
        message,
        reply: Some(reply_tx),
      })
      .await
      .map_err(|_| ControlError::Closed)?;

    match tokio::time::timeout(self.reply_timeout, reply_rx).await {
      Ok(Ok(reply)) => Ok(reply),
      Ok(Err(_)) => Err(ControlError::NoReply),
      Err(_) => {
        debug!("Control request {} timed out", id);
        Err(ControlError::Timeout(self.reply_timeout))
      }
    }
  }

  pub async fn skip_waiting(&self) -> Result<(), ControlError> {
    self.post(ControlMessage::SkipWaiting).await.map(|_| ())
  }

  pub async fn cache_size(&self) -> Result<u64, ControlError> {
    match self.request(ControlMessage::GetCacheSize).await? {
      ControlReply::CacheSize { size } => Ok(size),
      other => Err(ControlError::UnexpectedReply(other)),
    }
  }

  pub async fn clear_cache(&self) -> Result<usize, ControlError> {
    match self.request(ControlMessage::ClearCache).await? {
      ControlReply::CacheCleared { partitions } => Ok(partitions),
      other => Err(ControlError::UnexpectedReply(other)),
    }
  }

  /// Returns `(cached, failed)`.
  pub async fn cache_urls(&self, urls: Vec<String>) -> Result<(usize, usize), ControlError> {
    match self.request(ControlMessage::CacheUrls { urls }).await? {
      ControlReply::UrlsCached { cached, failed } => Ok((cached, failed)),
      other => Err(ControlError::UnexpectedReply(other)),
    }
  }
}

/// Handle one message and produce its reply, if it has one. A cache size
/// that cannot be measured gets no reply, so the caller sees
/// [`ControlError::NoReply`] rather than a size of zero.
pub async fn handle_control(agent: &InterceptionAgent, message: ControlMessage) -> Option<ControlReply> {
  match message {
    ControlMessage::SkipWaiting => {
      agent.skip_waiting().await;
      None
    }
    ControlMessage::CacheUrls { urls } => {
      let (cached, failed) = agent.cache_urls(&urls).await;
      Some(ControlReply::UrlsCached { cached, failed })
    }
    ControlMessage::ClearCache => {
      let partitions = agent.clear_cache().await;
      Some(ControlReply::CacheCleared { partitions })
    }
    ControlMessage::GetCacheSize => {
      match agent.cache_size().await {
        Ok(size) => Some(ControlReply::CacheSize { size }),
        Err(e) => {
          warn!("Could not measure cache size: {}", e);
          None
        }
      }
    }
  }
}

/// Parse a raw wire message. Malformed input is logged and dropped.
pub fn parse_message(raw: &str) -> Option<ControlMessage> {
  match serde_json::from_str(raw) {
    Ok(message) => Some(message),
    Err(e) => {
      warn!("Ignoring malformed control message: {}", e);
      None
    }
  }
}

async fn handle_envelope(agent: &InterceptionAgent, envelope: Envelope) {
  let Envelope { id, message, reply } = envelope;

  if message.requires_port() && reply.is_none() {
    warn!("Ignoring control message {} ({:?}) without a reply port", id, message);
    return;
  }

  debug!("Handling control message {}: {:?}", id, message);
  let answer = handle_control(agent, message).await;
  if let (Some(port), Some(answer)) = (reply, answer) {
    if port.send(answer).is_err() {
      debug!("Caller of control message {} stopped waiting", id);
    }
  }
}

/// Serve messages until every handle is dropped. Messages are handled one at
/// a time, in arrival order.
pub fn serve(agent: Arc<InterceptionAgent>, mut rx: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
  tokio::spawn(async move {
    while let Some(envelope) = rx.recv().await {
      handle_envelope(&agent, envelope).await;
    }
    debug!("Control channel closed");
  })
}
