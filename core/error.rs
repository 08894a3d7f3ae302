// Copyright 2026 the Cinder authors. MIT license.

use std::io;
use std::sync::Arc;

/// How a task or promise was cancelled. A timeout is deliberately a
/// different kind than a user cancellation so callers can swallow one
/// without masking the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelKind {
  Cancelled,
  TimedOut,
}

/// Error type of the runtime layer. Every error enum that flows through a
/// [`crate::Promise`] implements `From<CancelKind>`, which is how
/// cancellation surfaces at a suspension point.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CoreError {
  #[error("operation cancelled")]
  Cancelled,
  #[error("operation timed out")]
  TimedOut,
  #[error("event loop closed")]
  LoopClosed,
  #[error("connection reset: {0}")]
  ConnectionReset(String),
  #[error(transparent)]
  Io(Arc<io::Error>),
}

impl CoreError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, CoreError::Cancelled)
  }

  pub fn is_timed_out(&self) -> bool {
    matches!(self, CoreError::TimedOut)
  }
}

impl From<CancelKind> for CoreError {
  fn from(kind: CancelKind) -> Self {
    match kind {
      CancelKind::Cancelled => CoreError::Cancelled,
      CancelKind::TimedOut => CoreError::TimedOut,
    }
  }
}

impl From<io::Error> for CoreError {
  fn from(error: io::Error) -> Self {
    CoreError::Io(Arc::new(error))
  }
}
