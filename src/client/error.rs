use serde_json::Value;

use crate::http::TransportError;

/// Failure of a resilient client request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
  /// The server answered with a non-success status
  #[error("HTTP {status}: {message}")]
  Http {
    status: u16,
    message: String,
    code: Option<String>,
    details: Option<Value>,
  },
  /// No response arrived
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  #[error("failed to decode response: {0}")]
  Decode(String),
}

impl ApiError {
  pub fn status(&self) -> Option<u16> {
    match self {
      ApiError::Http { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// Server errors, rate limiting, network failures and timeouts are worth
  /// another attempt. Everything else fails immediately.
  pub fn is_retryable(&self) -> bool {
    match self {
      ApiError::Http { status, .. } => *status >= 500 || *status == 429,
      ApiError::Transport(TransportError::Network(_) | TransportError::Timeout) => true,
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn http(status: u16) -> ApiError {
    ApiError::Http {
      status,
      message: "x".to_string(),
      code: None,
      details: None,
    }
  }

  #[test]
  fn test_retryable_classification() {
    assert!(http(500).is_retryable());
    assert!(http(503).is_retryable());
    assert!(http(429).is_retryable());
    assert!(!http(404).is_retryable());
    assert!(!http(401).is_retryable());
    assert!(ApiError::from(TransportError::Timeout).is_retryable());
    assert!(ApiError::from(TransportError::Network("reset".into())).is_retryable());
    assert!(!ApiError::from(TransportError::InvalidRequest("bad".into())).is_retryable());
    assert!(!ApiError::Decode("eof".into()).is_retryable());
  }
}
