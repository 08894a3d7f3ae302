// Copyright 2026 the Cinder authors. MIT license.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use cinder_core::EventLoop;
use cinder_http::names;
use cinder_http::BasicAuth;
use cinder_http::FormData;
use cinder_http::GeneratedForm;
use cinder_http::Headers;
use cinder_http::HttpStreamWriter;
use cinder_http::HttpVersion;
use cinder_http::MultipartWriter;
use cinder_url::Url;

use crate::connection::Connection;
use crate::error::FetchError;
use crate::fingerprint::SslFingerprint;
use crate::response::ClientResponse;

/// How the client should treat TLS for a request.
#[derive(Clone, Default)]
pub enum SslMode {
  /// Verify against the bundled roots.
  #[default]
  Default,
  /// Skip certificate verification entirely.
  Unverified,
  /// Use a caller-provided rustls configuration.
  Config(Arc<rustls::ClientConfig>),
  /// Skip chain verification, pin the certificate digest instead.
  Fingerprint(SslFingerprint),
}

impl fmt::Debug for SslMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SslMode::Default => write!(f, "SslMode::Default"),
      SslMode::Unverified => write!(f, "SslMode::Unverified"),
      SslMode::Config(_) => write!(f, "SslMode::Config(..)"),
      SslMode::Fingerprint(_) => write!(f, "SslMode::Fingerprint(..)"),
    }
  }
}

/// Request body shapes accepted by the client.
#[derive(Clone, Debug, Default)]
pub enum RequestBody {
  #[default]
  Empty,
  Bytes(Bytes),
  Text(String),
  Json(serde_json::Value),
  Form(FormData),
}

/// Options of a single request.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
  pub headers: Headers,
  pub params: Vec<(String, String)>,
  pub body: RequestBody,
  pub auth: Option<BasicAuth>,
  pub proxy: Option<Url>,
  pub proxy_auth: Option<BasicAuth>,
  pub ssl: SslMode,
  /// Per-request compression of the outgoing body (`gzip`, `deflate`,
  /// `br`); forces chunked framing.
  pub compression: Option<String>,
  pub max_redirects: Option<usize>,
}

/// Identity of a reusable pooled connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
  pub host: String,
  pub port: u16,
  pub is_ssl: bool,
  pub proxy: Option<String>,
  pub proxy_auth: Option<String>,
  pub fingerprint: Option<Vec<u8>>,
}

impl fmt::Display for ConnectionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_ssl {
      write!(f, "https://{}:{}", self.host, self.port)?;
    } else {
      write!(f, "http://{}:{}", self.host, self.port)?;
    }
    if let Some(proxy) = &self.proxy {
      write!(f, " via {proxy}")?;
    }
    Ok(())
  }
}

enum PreparedBody {
  Empty,
  Bytes(Bytes),
  Multipart(Box<MultipartWriter>),
}

/// A request in wire-ready form: resolved target, final headers and a
/// prepared body.
pub struct ClientRequest {
  event_loop: EventLoop,
  pub method: String,
  pub url: Url,
  pub original_url: Url,
  pub headers: Headers,
  body: PreparedBody,
  chunked: bool,
  compression: Option<String>,
  pub proxy_url: Option<Url>,
  pub proxy_auth: Option<BasicAuth>,
  pub ssl: SslMode,
  pub version: HttpVersion,
  /// Plain-HTTP proxying uses the absolute URL on the request line.
  pub via_plain_proxy: bool,
}

impl ClientRequest {
  pub fn new(
    event_loop: &EventLoop,
    method: &str,
    url: Url,
    options: &RequestOptions,
  ) -> Result<ClientRequest, FetchError> {
    let original_url = url.clone();
    let mut url = if options.params.is_empty() {
      url
    } else {
      url.extend_query(options.params.iter().cloned())
    };

    let mut headers = options.headers.clone();

    // Credentials: an explicit auth option wins, URL userinfo is the
    // fallback; either way they travel as a header, not in the URL.
    let auth = match &options.auth {
      Some(auth) => Some(auth.clone()),
      None => url.user().map(|user| {
        BasicAuth::new(user, url.password().unwrap_or_default())
      }),
    };
    if url.user().is_some() {
      url = url.without_userinfo();
    }
    if let Some(auth) = &auth {
      headers.setdefault(names::AUTHORIZATION, auth.encode());
    }

    if let Some(host_header) = url.host_header() {
      headers.setdefault(names::HOST, host_header);
    }
    headers.setdefault("Accept", "*/*");

    let mut compression = options.compression.clone();
    if let Some(compression) = &compression {
      headers.setdefault(names::CONTENT_ENCODING, compression.clone());
    }

    // Body preparation decides between Content-Length and chunked framing.
    let mut chunked = compression.is_some();
    let body = match &options.body {
      RequestBody::Empty => PreparedBody::Empty,
      RequestBody::Bytes(bytes) => PreparedBody::Bytes(bytes.clone()),
      RequestBody::Text(text) => {
        headers.setdefault(
          names::CONTENT_TYPE,
          "text/plain; charset=utf-8",
        );
        PreparedBody::Bytes(Bytes::copy_from_slice(text.as_bytes()))
      }
      RequestBody::Json(value) => {
        headers.setdefault(names::CONTENT_TYPE, "application/json");
        PreparedBody::Bytes(Bytes::from(value.to_string().into_bytes()))
      }
      RequestBody::Form(form) => match form.generate_form()? {
        GeneratedForm::UrlEncoded { body, content_type } => {
          headers.setdefault(names::CONTENT_TYPE, content_type);
          PreparedBody::Bytes(body)
        }
        GeneratedForm::Multipart(writer) => {
          headers.setdefault(names::CONTENT_TYPE, writer.content_type());
          PreparedBody::Multipart(Box::new(writer))
        }
      },
    };
    match &body {
      PreparedBody::Empty => {
        compression = None;
        chunked = false;
      }
      PreparedBody::Bytes(bytes) => {
        if chunked {
          headers.setdefault(names::TRANSFER_ENCODING, "chunked");
        } else {
          headers
            .setdefault(names::CONTENT_LENGTH, bytes.len().to_string());
        }
      }
      PreparedBody::Multipart(writer) => {
        if chunked {
          headers.setdefault(names::TRANSFER_ENCODING, "chunked");
        } else {
          headers
            .setdefault(names::CONTENT_LENGTH, writer.size().to_string());
        }
      }
    }

    Ok(ClientRequest {
      event_loop: event_loop.clone(),
      method: method.to_ascii_uppercase(),
      url,
      original_url,
      headers,
      body,
      chunked,
      compression,
      proxy_url: options.proxy.clone(),
      proxy_auth: options.proxy_auth.clone(),
      ssl: options.ssl.clone(),
      version: HttpVersion::V11,
      via_plain_proxy: false,
    })
  }

  pub fn event_loop(&self) -> &EventLoop {
    &self.event_loop
  }

  pub fn is_ssl(&self) -> bool {
    self.url.is_secure()
  }

  pub fn host(&self) -> String {
    self.url.raw_host().unwrap_or_default().to_string()
  }

  pub fn port(&self) -> u16 {
    self.url.port().unwrap_or(if self.is_ssl() { 443 } else { 80 })
  }

  pub fn fingerprint(&self) -> Option<&SslFingerprint> {
    match &self.ssl {
      SslMode::Fingerprint(fingerprint) => Some(fingerprint),
      _ => None,
    }
  }

  pub fn connection_key(&self) -> ConnectionKey {
    ConnectionKey {
      host: self.url.host().unwrap_or_default().to_string(),
      port: self.port(),
      is_ssl: self.is_ssl(),
      proxy: self.proxy_url.as_ref().map(Url::to_string),
      proxy_auth: self.proxy_auth.as_ref().map(BasicAuth::encode),
      fingerprint: self
        .fingerprint()
        .map(|fingerprint| fingerprint.digest().to_vec()),
    }
  }

  fn request_target(&self) -> String {
    if self.method == names::METHOD_CONNECT {
      return format!("{}:{}", self.host(), self.port());
    }
    if self.via_plain_proxy {
      return self.url.to_string();
    }
    let encoded = Url::encode_path(self.url.path());
    match self.url.request_target().split_once('?') {
      Some((_, query)) => format!("{encoded}?{query}"),
      None => encoded,
    }
  }

  /// Writes the request head and spawns the body writer task, producing
  /// the response shell that `start` completes.
  pub fn send(
    &self,
    connection: &Connection,
  ) -> Result<ClientResponse, FetchError> {
    let protocol = connection.protocol().ok_or_else(|| {
      FetchError::Connection {
        key: self.connection_key().to_string(),
        message: "connection already detached".into(),
      }
    })?;
    protocol.write_http_request(
      &self.method,
      &self.request_target(),
      &self.headers,
      self.version,
    )?;

    let writer = match &self.body {
      PreparedBody::Empty => None,
      PreparedBody::Bytes(bytes) => {
        let bytes = bytes.clone();
        let mut stream_writer = HttpStreamWriter::new(
          protocol.clone(),
          self.compression.as_deref(),
          self.chunked,
        )?;
        Some(self.event_loop.spawn::<(), FetchError, _>(async move {
          stream_writer.write(&bytes).await?;
          stream_writer.write_eof(b"").await?;
          Ok(())
        }))
      }
      PreparedBody::Multipart(writer) => {
        let serialized = writer.serialize();
        let mut stream_writer = HttpStreamWriter::new(
          protocol.clone(),
          self.compression.as_deref(),
          self.chunked,
        )?;
        Some(self.event_loop.spawn::<(), FetchError, _>(async move {
          stream_writer.write(&serialized).await?;
          stream_writer.write_eof(b"").await?;
          Ok(())
        }))
      }
    };

    Ok(ClientResponse::new(
      &self.event_loop,
      self.method.clone(),
      self.original_url.clone(),
      connection.clone(),
      writer,
    ))
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn event_loop() -> EventLoop {
    EventLoop::new().unwrap()
  }

  #[test]
  fn host_and_auth_headers_are_derived() {
    let request = ClientRequest::new(
      &event_loop(),
      "get",
      Url::parse("http://user:pw@example.com:8080/x").unwrap(),
      &RequestOptions::default(),
    )
    .unwrap();
    assert_eq!(request.method, "GET");
    assert_eq!(request.headers.get(names::HOST), Some("example.com:8080"));
    assert_eq!(
      request.headers.get(names::AUTHORIZATION),
      Some(BasicAuth::new("user", "pw").encode().as_str())
    );
    assert!(request.url.user().is_none());
  }

  #[test]
  fn params_merge_into_the_query() {
    let options = RequestOptions {
      params: vec![("b".to_string(), "2".to_string())],
      ..Default::default()
    };
    let request = ClientRequest::new(
      &event_loop(),
      "GET",
      Url::parse("http://example.com/path?a=1").unwrap(),
      &options,
    )
    .unwrap();
    assert_eq!(request.request_target(), "/path?a=1&b=2");
  }

  #[test]
  fn body_controls_framing_headers() {
    let options = RequestOptions {
      body: RequestBody::Text("hello".into()),
      ..Default::default()
    };
    let request = ClientRequest::new(
      &event_loop(),
      "POST",
      Url::parse("http://example.com/").unwrap(),
      &options,
    )
    .unwrap();
    assert_eq!(request.headers.get(names::CONTENT_LENGTH), Some("5"));

    let options = RequestOptions {
      body: RequestBody::Text("hello".into()),
      compression: Some("gzip".to_string()),
      ..Default::default()
    };
    let request = ClientRequest::new(
      &event_loop(),
      "POST",
      Url::parse("http://example.com/").unwrap(),
      &options,
    )
    .unwrap();
    assert_eq!(request.headers.get(names::TRANSFER_ENCODING), Some("chunked"));
    assert_eq!(request.headers.get(names::CONTENT_ENCODING), Some("gzip"));
    assert!(request.headers.get(names::CONTENT_LENGTH).is_none());
  }

  #[test]
  fn connection_keys_separate_ssl_and_proxy() {
    let plain = ClientRequest::new(
      &event_loop(),
      "GET",
      Url::parse("http://example.com/").unwrap(),
      &RequestOptions::default(),
    )
    .unwrap()
    .connection_key();
    let tls = ClientRequest::new(
      &event_loop(),
      "GET",
      Url::parse("https://example.com/").unwrap(),
      &RequestOptions::default(),
    )
    .unwrap()
    .connection_key();
    assert_ne!(plain, tls);
    assert_eq!(plain.port, 80);
    assert_eq!(tls.port, 443);
  }
}
