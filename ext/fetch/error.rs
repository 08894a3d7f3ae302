// Copyright 2026 the Cinder authors. MIT license.

use cinder_core::CancelKind;
use cinder_core::CoreError;
use cinder_http::HttpError;
use cinder_url::UrlError;

/// Error type of the HTTP client layer.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FetchError {
  /// Transport failure, tagged with the connection key it happened on.
  #[error("connection to {key} failed: {message}")]
  Connection { key: String, message: String },
  #[error("proxy refused the tunnel with {status} {reason}")]
  Proxy { status: u16, reason: String },
  #[error("redirect limit exceeded")]
  TooManyRedirects,
  #[error("redirect without a Location header")]
  RedirectWithoutLocation,
  #[error("invalid url: {0}")]
  InvalidUrl(String),
  #[error("TLS certificate does not match the pinned fingerprint")]
  FingerprintMismatch,
  #[error("response is not {expected}: got {got:?}")]
  UnexpectedMimeType { expected: String, got: String },
  #[error(transparent)]
  Http(HttpError),
  #[error(transparent)]
  Core(CoreError),
  #[error("operation cancelled")]
  Cancelled,
  #[error("operation timed out")]
  TimedOut,
}

impl FetchError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, FetchError::Cancelled)
  }

  pub fn is_timed_out(&self) -> bool {
    matches!(self, FetchError::TimedOut)
  }
}

impl From<CancelKind> for FetchError {
  fn from(kind: CancelKind) -> Self {
    match kind {
      CancelKind::Cancelled => FetchError::Cancelled,
      CancelKind::TimedOut => FetchError::TimedOut,
    }
  }
}

impl From<HttpError> for FetchError {
  fn from(error: HttpError) -> Self {
    match error {
      HttpError::Cancelled => FetchError::Cancelled,
      HttpError::TimedOut => FetchError::TimedOut,
      other => FetchError::Http(other),
    }
  }
}

impl From<CoreError> for FetchError {
  fn from(error: CoreError) -> Self {
    match error {
      CoreError::Cancelled => FetchError::Cancelled,
      CoreError::TimedOut => FetchError::TimedOut,
      other => FetchError::Core(other),
    }
  }
}

impl From<UrlError> for FetchError {
  fn from(error: UrlError) -> Self {
    FetchError::InvalidUrl(error.to_string())
  }
}
