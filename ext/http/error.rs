// Copyright 2026 the Cinder authors. MIT license.

use bytes::Bytes;
use cinder_core::CancelKind;
use cinder_core::CoreError;

pub(crate) const CONNECTION_ERROR_EOF_NO_HTTP_HEADER: &str =
  "stream closed before any data was received";

pub(crate) const PAYLOAD_ERROR_EOF_AT_HTTP_HEADER: &str =
  "EOF received while reading HTTP headers";

/// Error type of the HTTP wire layer. Cloneable so the protocol can replay
/// a stored failure to every reader that touches it afterwards.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HttpError {
  /// Wire-format violation in HTTP, chunked or multipart framing.
  #[error("payload error: {0}")]
  Payload(String),
  /// EOF before the required bytes arrived; carries the partial buffer.
  #[error("unexpected EOF after {} bytes", .0.len())]
  Eof(Bytes),
  /// Unsupported or undecodable content coding.
  #[error("content encoding error: {0}")]
  ContentEncoding(String),
  /// Transport-level failure observed by the protocol.
  #[error("connection error: {0}")]
  Connection(String),
  #[error(transparent)]
  Core(CoreError),
  #[error("operation cancelled")]
  Cancelled,
  #[error("operation timed out")]
  TimedOut,
}

impl HttpError {
  pub fn payload(message: impl Into<String>) -> HttpError {
    HttpError::Payload(message.into())
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, HttpError::Cancelled)
  }

  pub fn is_timed_out(&self) -> bool {
    matches!(self, HttpError::TimedOut)
  }
}

impl From<CancelKind> for HttpError {
  fn from(kind: CancelKind) -> Self {
    match kind {
      CancelKind::Cancelled => HttpError::Cancelled,
      CancelKind::TimedOut => HttpError::TimedOut,
    }
  }
}

impl From<CoreError> for HttpError {
  fn from(error: CoreError) -> Self {
    match error {
      CoreError::Cancelled => HttpError::Cancelled,
      CoreError::TimedOut => HttpError::TimedOut,
      other => HttpError::Core(other),
    }
  }
}
