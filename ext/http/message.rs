// Copyright 2026 the Cinder authors. MIT license.

use std::cell::Cell;

use crate::headers::Headers;
use crate::names;

/// HTTP protocol version, ordered so `version <= HttpVersion::V10` reads
/// naturally in keep-alive decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HttpVersion {
  pub major: u8,
  pub minor: u8,
}

impl HttpVersion {
  pub const V10: HttpVersion = HttpVersion { major: 1, minor: 0 };
  pub const V11: HttpVersion = HttpVersion { major: 1, minor: 1 };
}

impl std::fmt::Display for HttpVersion {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "HTTP/{}.{}", self.major, self.minor)
  }
}

fn headers_upgraded(headers: &Headers) -> bool {
  headers
    .get(names::CONNECTION)
    .map(|value| value.eq_ignore_ascii_case("upgrade"))
    .unwrap_or(false)
}

fn headers_chunked(headers: &Headers) -> bool {
  headers
    .get(names::TRANSFER_ENCODING)
    .map(|value| value.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

fn headers_encoding(headers: &Headers) -> Option<String> {
  headers
    .get(names::CONTENT_ENCODING)
    .map(|value| value.to_ascii_lowercase())
}

/// Raw response head: status line plus headers, body untouched.
#[derive(Clone, Debug)]
pub struct RawResponseMessage {
  pub version: HttpVersion,
  pub status: u16,
  /// Reason phrase as received; may be empty.
  pub reason: Option<String>,
  pub headers: Headers,
  upgraded: Cell<Option<bool>>,
}

impl RawResponseMessage {
  pub fn new(
    version: HttpVersion,
    status: u16,
    reason: Option<String>,
    headers: Headers,
  ) -> RawResponseMessage {
    RawResponseMessage {
      version,
      status,
      reason,
      headers,
      upgraded: Cell::new(None),
    }
  }

  /// Whether the connection switches protocols after this message. Detected
  /// from the headers once, then cached; an upgrade decided elsewhere (a
  /// CONNECT tunnel) is recorded with [`RawResponseMessage::set_upgraded`].
  pub fn upgraded(&self) -> bool {
    match self.upgraded.get() {
      Some(value) => value,
      None => {
        let value = headers_upgraded(&self.headers);
        self.upgraded.set(Some(value));
        value
      }
    }
  }

  pub fn set_upgraded(&self, value: bool) {
    self.upgraded.set(Some(value));
  }

  pub fn chunked(&self) -> bool {
    headers_chunked(&self.headers)
  }

  pub fn encoding(&self) -> Option<String> {
    headers_encoding(&self.headers)
  }

  /// Keep-alive default: explicit `Connection` header wins, otherwise
  /// HTTP/1.1 keeps the connection and HTTP/1.0 closes it.
  pub fn keep_alive(&self) -> bool {
    match self.headers.get(names::CONNECTION) {
      Some(value) => !value.eq_ignore_ascii_case("close"),
      None => self.version > HttpVersion::V10,
    }
  }
}

/// Raw request head: request line plus headers.
#[derive(Clone, Debug)]
pub struct RawRequestMessage {
  pub version: HttpVersion,
  pub method: String,
  pub path: String,
  pub headers: Headers,
  upgraded: Cell<Option<bool>>,
}

impl RawRequestMessage {
  pub fn new(
    version: HttpVersion,
    method: String,
    path: String,
    headers: Headers,
  ) -> RawRequestMessage {
    RawRequestMessage {
      version,
      method,
      path,
      headers,
      upgraded: Cell::new(None),
    }
  }

  pub fn upgraded(&self) -> bool {
    match self.upgraded.get() {
      Some(value) => value,
      None => {
        let value = headers_upgraded(&self.headers);
        self.upgraded.set(Some(value));
        value
      }
    }
  }

  pub fn set_upgraded(&self, value: bool) {
    self.upgraded.set(Some(value));
  }

  pub fn chunked(&self) -> bool {
    headers_chunked(&self.headers)
  }

  pub fn encoding(&self) -> Option<String> {
    headers_encoding(&self.headers)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn headers(pairs: &[(&str, &str)]) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in pairs {
      headers.append(*name, *value);
    }
    headers
  }

  #[test]
  fn upgrade_detection_is_cached() {
    let message = RawResponseMessage::new(
      HttpVersion::V11,
      101,
      Some("Switching Protocols".into()),
      headers(&[("Connection", "Upgrade")]),
    );
    assert!(message.upgraded());
    message.set_upgraded(false);
    assert!(!message.upgraded());
  }

  #[test]
  fn chunked_and_encoding() {
    let message = RawResponseMessage::new(
      HttpVersion::V11,
      200,
      None,
      headers(&[
        ("Transfer-Encoding", "Chunked"),
        ("Content-Encoding", "GZIP"),
      ]),
    );
    assert!(message.chunked());
    assert_eq!(message.encoding().as_deref(), Some("gzip"));
  }

  #[test]
  fn keep_alive_rules() {
    let http10 = RawResponseMessage::new(
      HttpVersion::V10,
      200,
      None,
      Headers::new(),
    );
    assert!(!http10.keep_alive());

    let http11 = RawResponseMessage::new(
      HttpVersion::V11,
      200,
      None,
      Headers::new(),
    );
    assert!(http11.keep_alive());

    let closed = RawResponseMessage::new(
      HttpVersion::V11,
      200,
      None,
      headers(&[("Connection", "close")]),
    );
    assert!(!closed.keep_alive());
  }
}
