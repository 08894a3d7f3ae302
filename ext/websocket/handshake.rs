// Copyright 2026 the Cinder authors. MIT license.

//! Handshake header grammar: the accept-key computation and the parsers
//! and builders for `Connection`, `Upgrade`, `Sec-WebSocket-Extensions`
//! and `Sec-WebSocket-Protocol` values.

use base64::Engine;
use sha1::Digest;

use crate::error::WebSocketError;

/// Key constant of RFC 6455 §1.3.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` for a `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
  let mut hasher = sha1::Sha1::new();
  hasher.update(key.as_bytes());
  hasher.update(WEBSOCKET_GUID.as_bytes());
  base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Fresh random key for a client handshake: base64 of 16 random bytes.
pub fn generate_key() -> String {
  let mut raw = [0u8; 16];
  rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut raw);
  base64::engine::general_purpose::STANDARD.encode(raw)
}

fn is_token(text: &str) -> bool {
  !text.is_empty()
    && text.bytes().all(|byte| {
      matches!(byte,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-'
        | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
    })
}

fn is_protocol_token(text: &str) -> bool {
  match text.split_once('/') {
    Some((left, right)) => is_token(left) && is_token(right),
    None => is_token(text),
  }
}

/// Parses a `Connection` or `Sec-WebSocket-Protocol` style token list.
pub fn parse_tokens(header: &str) -> Result<Vec<String>, WebSocketError> {
  let mut tokens = Vec::new();
  for item in header.split(',') {
    let item = item.trim();
    if item.is_empty() {
      continue;
    }
    if !is_token(item) {
      return Err(WebSocketError::InvalidHandshake(format!(
        "invalid token in header: {item:?}"
      )));
    }
    tokens.push(item.to_string());
  }
  Ok(tokens)
}

/// Parses an `Upgrade` header; `protocol/version` forms are allowed.
pub fn parse_upgrades(header: &str) -> Result<Vec<String>, WebSocketError> {
  let mut upgrades = Vec::new();
  for item in header.split(',') {
    let item = item.trim();
    if item.is_empty() {
      continue;
    }
    if !is_protocol_token(item) {
      return Err(WebSocketError::InvalidHandshake(format!(
        "invalid upgrade token: {item:?}"
      )));
    }
    upgrades.push(item.to_string());
  }
  Ok(upgrades)
}

pub type ExtensionParams = Vec<(String, Option<String>)>;

/// Parses a `Sec-WebSocket-Extensions` value into `(name, parameters)`
/// pairs; parameter values lose surrounding quotes.
pub fn parse_extensions(
  header: &str,
) -> Result<Vec<(String, ExtensionParams)>, WebSocketError> {
  let mut extensions = Vec::new();
  for item in header.split(',') {
    let item = item.trim();
    if item.is_empty() {
      continue;
    }
    let mut pieces = item.split(';');
    let name = pieces.next().unwrap_or("").trim();
    if !is_token(name) {
      return Err(WebSocketError::InvalidHandshake(format!(
        "invalid extension name: {name:?}"
      )));
    }
    let mut params: ExtensionParams = Vec::new();
    for piece in pieces {
      let piece = piece.trim();
      if piece.is_empty() {
        return Err(WebSocketError::InvalidHandshake(
          "empty extension parameter".into(),
        ));
      }
      match piece.split_once('=') {
        Some((key, value)) => {
          let key = key.trim();
          let value = value.trim().trim_matches('"');
          if !is_token(key) || !is_token(value) {
            return Err(WebSocketError::InvalidHandshake(format!(
              "invalid extension parameter: {piece:?}"
            )));
          }
          params.push((key.to_string(), Some(value.to_string())));
        }
        None => {
          if !is_token(piece) {
            return Err(WebSocketError::InvalidHandshake(format!(
              "invalid extension parameter: {piece:?}"
            )));
          }
          params.push((piece.to_string(), None));
        }
      }
    }
    extensions.push((name.to_string(), params));
  }
  Ok(extensions)
}

/// Serializes extension descriptors into a header value.
pub fn build_extensions(
  extensions: &[(String, ExtensionParams)],
) -> String {
  extensions
    .iter()
    .map(|(name, params)| {
      let mut parts = vec![name.clone()];
      for (key, value) in params {
        match value {
          Some(value) => parts.push(format!("{key}={value}")),
          None => parts.push(key.clone()),
        }
      }
      parts.join("; ")
    })
    .collect::<Vec<_>>()
    .join(", ")
}

pub fn build_subprotocols(subprotocols: &[String]) -> String {
  subprotocols.join(", ")
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn accept_key_matches_the_rfc_example() {
    // The worked example of RFC 6455 §1.3.
    assert_eq!(
      accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
      "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
  }

  #[test]
  fn generated_keys_decode_to_16_bytes() {
    let key = generate_key();
    let raw = base64::engine::general_purpose::STANDARD
      .decode(key)
      .unwrap();
    assert_eq!(raw.len(), 16);
  }

  #[test]
  fn token_lists() {
    assert_eq!(
      parse_tokens("keep-alive, Upgrade").unwrap(),
      vec!["keep-alive".to_string(), "Upgrade".to_string()]
    );
    assert!(parse_tokens("bad token(here)").is_err());
  }

  #[test]
  fn extension_grammar_round_trip() {
    let parsed = parse_extensions(
      "permessage-deflate; client_max_window_bits=10; server_no_context_takeover, other",
    )
    .unwrap();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].0, "permessage-deflate");
    assert_eq!(
      parsed[0].1,
      vec![
        (
          "client_max_window_bits".to_string(),
          Some("10".to_string())
        ),
        ("server_no_context_takeover".to_string(), None),
      ]
    );
    assert_eq!(parsed[1].0, "other");

    let rebuilt = build_extensions(&parsed);
    assert_eq!(
      rebuilt,
      "permessage-deflate; client_max_window_bits=10; \
server_no_context_takeover, other"
    );
  }

  #[test]
  fn upgrade_tokens_allow_versioned_protocols() {
    assert_eq!(
      parse_upgrades("HTTP/2.0, websocket").unwrap(),
      vec!["HTTP/2.0".to_string(), "websocket".to_string()]
    );
  }
}
