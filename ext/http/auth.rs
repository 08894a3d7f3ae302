// Copyright 2026 the Cinder authors. MIT license.

use base64::Engine;

use crate::error::HttpError;

/// `Authorization: Basic …` credentials. The encoding decides how the
/// `user:password` pair maps to bytes; it defaults to utf-8.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicAuth {
  pub user: String,
  pub password: String,
  pub encoding: &'static encoding_rs::Encoding,
}

impl BasicAuth {
  pub fn new(
    user: impl Into<String>,
    password: impl Into<String>,
  ) -> BasicAuth {
    BasicAuth {
      user: user.into(),
      password: password.into(),
      encoding: encoding_rs::UTF_8,
    }
  }

  pub fn with_encoding(
    user: impl Into<String>,
    password: impl Into<String>,
    encoding: &'static encoding_rs::Encoding,
  ) -> BasicAuth {
    BasicAuth {
      user: user.into(),
      password: password.into(),
      encoding,
    }
  }

  /// Header value: `Basic base64(user ':' password)`.
  pub fn encode(&self) -> String {
    let credentials = format!("{}:{}", self.user, self.password);
    let (bytes, _, _) = self.encoding.encode(&credentials);
    format!(
      "Basic {}",
      base64::engine::general_purpose::STANDARD.encode(bytes)
    )
  }

  /// Parses a `Basic …` header value back into credentials.
  pub fn decode(header: &str) -> Result<BasicAuth, HttpError> {
    Self::decode_with_encoding(header, encoding_rs::UTF_8)
  }

  pub fn decode_with_encoding(
    header: &str,
    encoding: &'static encoding_rs::Encoding,
  ) -> Result<BasicAuth, HttpError> {
    let mut parts = header.trim().splitn(2, ' ');
    let scheme = parts.next().unwrap_or("");
    if !scheme.eq_ignore_ascii_case("basic") {
      return Err(HttpError::payload(format!(
        "unknown authorization scheme: {scheme:?}"
      )));
    }
    let payload = parts.next().ok_or_else(|| {
      HttpError::payload("missing credentials in Basic authorization")
    })?;
    let raw = base64::engine::general_purpose::STANDARD
      .decode(payload.trim())
      .map_err(|_| {
        HttpError::payload("invalid base64 in Basic authorization")
      })?;
    let (decoded, _, _) = encoding.decode(&raw);
    let (user, password) = decoded.split_once(':').ok_or_else(|| {
      HttpError::payload("Basic authorization lacks the ':' separator")
    })?;
    Ok(BasicAuth {
      user: user.to_string(),
      password: password.to_string(),
      encoding,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encode_decode_round_trip() {
    let auth = BasicAuth::new("user", "s3cr3t");
    let encoded = auth.encode();
    assert_eq!(encoded, "Basic dXNlcjpzM2NyM3Q=");
    let decoded = BasicAuth::decode(&encoded).unwrap();
    assert_eq!(decoded.user, "user");
    assert_eq!(decoded.password, "s3cr3t");
  }

  #[test]
  fn password_may_contain_colons() {
    let auth = BasicAuth::new("u", "a:b:c");
    let decoded = BasicAuth::decode(&auth.encode()).unwrap();
    assert_eq!(decoded.password, "a:b:c");
  }

  #[test]
  fn rejects_other_schemes() {
    assert!(BasicAuth::decode("Bearer abc").is_err());
    assert!(BasicAuth::decode("Basic !!!not-base64!!!").is_err());
  }
}
