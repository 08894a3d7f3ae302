// Copyright 2026 the Cinder authors. MIT license.

use std::rc::Rc;

use crate::error::WebSocketError;
use crate::frame::WebSocketFrame;

/// One negotiated WebSocket extension. Decoding runs over the chain in
/// reverse negotiation order, encoding in forward order; an extension may
/// claim reserved header bits for its own framing.
pub trait WebSocketExtension {
  fn name(&self) -> &str;

  /// Parameters advertised in `Sec-WebSocket-Extensions`; `None` values
  /// are bare keys.
  fn request_params(&self) -> Vec<(String, Option<String>)>;

  /// Whether the peer's response parameters are acceptable, given the
  /// extensions accepted so far.
  fn are_valid_params(
    &self,
    params: &[(String, Option<String>)],
    accepted: &[Rc<dyn WebSocketExtension>],
  ) -> bool;

  fn decode(
    &self,
    frame: WebSocketFrame,
    max_size: Option<usize>,
  ) -> Result<WebSocketFrame, WebSocketError>;

  fn encode(
    &self,
    frame: WebSocketFrame,
  ) -> Result<WebSocketFrame, WebSocketError>;

  /// RSV bits this extension is allowed to set.
  fn claimed_rsv_bits(&self) -> u8 {
    0
  }
}
