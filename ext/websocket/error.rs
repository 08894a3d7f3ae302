// Copyright 2026 the Cinder authors. MIT license.

use cinder_core::CancelKind;
use cinder_core::CoreError;
use cinder_fetch::FetchError;
use cinder_http::Headers;
use cinder_http::HttpError;

/// Terminal WebSocket state reported to the user: the close code and the
/// peer's reason, if any arrived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionClosed {
  pub code: u16,
  pub reason: Option<String>,
}

impl std::fmt::Display for ConnectionClosed {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.reason {
      Some(reason) => {
        write!(f, "connection closed: {} {:?}", self.code, reason)
      }
      None => write!(f, "connection closed: {}", self.code),
    }
  }
}

/// Error type of the WebSocket layer.
#[derive(Clone, Debug, thiserror::Error)]
pub enum WebSocketError {
  /// Frame or state machine violation of RFC 6455.
  #[error("websocket protocol error: {0}")]
  Protocol(String),
  #[error("{0}")]
  ConnectionClosed(ConnectionClosed),
  /// The opening handshake failed on a malformed or mismatched exchange.
  #[error("invalid handshake: {0}")]
  InvalidHandshake(String),
  /// The upgrade headers were missing or wrong (server answers 426).
  #[error("invalid upgrade: {0}")]
  InvalidUpgrade(String),
  /// The origin was not allowed (server answers 403).
  #[error("invalid origin: {0}")]
  InvalidOrigin(String),
  /// User code vetoed the handshake with a ready-made HTTP response.
  #[error("handshake aborted with status {status}")]
  AbortHandshake {
    status: u16,
    headers: Headers,
    body: String,
  },
  #[error("invalid utf-8 in text message")]
  Utf8,
  #[error(transparent)]
  Http(HttpError),
  #[error(transparent)]
  Fetch(FetchError),
  #[error("operation cancelled")]
  Cancelled,
  #[error("operation timed out")]
  TimedOut,
}

impl WebSocketError {
  pub fn protocol(message: impl Into<String>) -> WebSocketError {
    WebSocketError::Protocol(message.into())
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, WebSocketError::Cancelled)
  }

  pub fn is_timed_out(&self) -> bool {
    matches!(self, WebSocketError::TimedOut)
  }
}

impl From<CancelKind> for WebSocketError {
  fn from(kind: CancelKind) -> Self {
    match kind {
      CancelKind::Cancelled => WebSocketError::Cancelled,
      CancelKind::TimedOut => WebSocketError::TimedOut,
    }
  }
}

impl From<ConnectionClosed> for WebSocketError {
  fn from(closed: ConnectionClosed) -> Self {
    WebSocketError::ConnectionClosed(closed)
  }
}

impl From<HttpError> for WebSocketError {
  fn from(error: HttpError) -> Self {
    match error {
      HttpError::Cancelled => WebSocketError::Cancelled,
      HttpError::TimedOut => WebSocketError::TimedOut,
      other => WebSocketError::Http(other),
    }
  }
}

impl From<FetchError> for WebSocketError {
  fn from(error: FetchError) -> Self {
    match error {
      FetchError::Cancelled => WebSocketError::Cancelled,
      FetchError::TimedOut => WebSocketError::TimedOut,
      other => WebSocketError::Fetch(other),
    }
  }
}

impl From<CoreError> for WebSocketError {
  fn from(error: CoreError) -> Self {
    match error {
      CoreError::Cancelled => WebSocketError::Cancelled,
      CoreError::TimedOut => WebSocketError::TimedOut,
      other => WebSocketError::Http(HttpError::from(other)),
    }
  }
}
