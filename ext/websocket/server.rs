// Copyright 2026 the Cinder authors. MIT license.

//! Server side: accepts raw TCP (or TLS) connections, performs the opening
//! handshake with origin, extension and subprotocol negotiation, then runs
//! the user handler over the established WebSocket.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::time::SystemTime;

use cinder_core::EventLoop;
use cinder_core::TcpServer;
use cinder_core::TcpTransport;
use cinder_core::Transport;
use cinder_http::names;
use cinder_http::Headers;
use cinder_http::HttpProtocol;
use cinder_http::HttpVersion;
use cinder_http::RawRequestMessage;
use cinder_tls::start_tls_server;
use cinder_tls::TlsTransport;

use crate::error::WebSocketError;
use crate::extension::WebSocketExtension;
use crate::handshake;
use crate::handshake::accept_key;
use crate::protocol::WebSocket;
use crate::protocol::DEFAULT_CLOSE_TIMEOUT;
use crate::protocol::DEFAULT_MAX_SIZE;

/// Early-response hook: inspect the request path and headers before the
/// upgrade; returning a `(status, headers, body)` triple aborts the
/// handshake with that response.
pub type RequestProcessor =
  Rc<dyn Fn(&str, &Headers) -> Option<(u16, Headers, String)>>;

/// User hook picking the subprotocol from `(client list, server list)`.
pub type SubprotocolSelector =
  Rc<dyn Fn(&[String], &[String]) -> Option<String>>;

type HandlerFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Per-connection user handler.
pub type Handler = Rc<dyn Fn(WebSocket) -> HandlerFuture>;

/// Options of a WebSocket server.
#[derive(Clone, Default)]
pub struct ServerOptions {
  /// Allowed `Origin` values; `None` disables the check.
  pub allowed_origins: Option<Vec<String>>,
  pub available_extensions: Vec<Rc<dyn WebSocketExtension>>,
  pub available_subprotocols: Vec<String>,
  pub extra_response_headers: Headers,
  pub request_processor: Option<RequestProcessor>,
  pub subprotocol_selector: Option<SubprotocolSelector>,
  pub close_timeout: Option<f64>,
  pub max_size: Option<usize>,
  pub max_queue: Option<usize>,
  pub tls: Option<Arc<rustls::ServerConfig>>,
}

struct ServerInner {
  event_loop: EventLoop,
  tcp: RefCell<Option<Rc<TcpServer>>>,
  handler: Handler,
  options: ServerOptions,
  serving: Cell<bool>,
  connections: RefCell<HashMap<usize, WebSocket>>,
  connection_seq: Cell<usize>,
}

/// A listening WebSocket server.
#[derive(Clone)]
pub struct WebSocketServer {
  inner: Rc<ServerInner>,
}

impl WebSocketServer {
  pub fn bind(
    event_loop: &EventLoop,
    address: SocketAddr,
    handler: Handler,
    options: ServerOptions,
  ) -> Result<WebSocketServer, WebSocketError> {
    let server = WebSocketServer {
      inner: Rc::new(ServerInner {
        event_loop: event_loop.clone(),
        tcp: RefCell::new(None),
        handler,
        options,
        serving: Cell::new(true),
        connections: RefCell::new(HashMap::new()),
        connection_seq: Cell::new(0),
      }),
    };

    let accept_server = server.clone();
    let tcp = TcpServer::bind(event_loop, address, move |_, transport| {
      accept_server.on_accept(transport);
    })
    .map_err(|error| {
      WebSocketError::InvalidHandshake(format!(
        "failed to bind websocket server: {error}"
      ))
    })?;
    *server.inner.tcp.borrow_mut() = Some(tcp);
    Ok(server)
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.inner.tcp.borrow().as_ref().map(|tcp| tcp.local_addr())
  }

  pub fn is_serving(&self) -> bool {
    self.inner.serving.get()
  }

  /// Stops accepting and marks the server as shutting down; connections
  /// arriving after this point are answered with 503.
  pub fn close(&self) {
    self.inner.serving.set(false);
    if let Some(tcp) = self.inner.tcp.borrow_mut().take() {
      tcp.close();
    }
  }

  /// Closes the listener and fails every live connection with 1001.
  pub fn shutdown(&self) {
    self.close();
    let connections: Vec<WebSocket> =
      self.inner.connections.borrow().values().cloned().collect();
    for websocket in connections {
      websocket.fail_connection(1001, "server shutting down");
    }
  }

  fn on_accept(&self, transport: Rc<TcpTransport>) {
    let server = self.clone();
    self.inner.event_loop.spawn::<(), WebSocketError, _>(async move {
      server.serve_connection(transport).await
    });
  }

  async fn serve_connection(
    &self,
    transport: Rc<TcpTransport>,
  ) -> Result<(), WebSocketError> {
    let event_loop = &self.inner.event_loop;
    let peer = transport.extra_info().peer_addr;
    let (host, port) = match peer {
      Some(address) => (address.ip().to_string(), address.port()),
      None => (String::new(), 0),
    };

    let http = HttpProtocol::new(event_loop);
    let websocket = WebSocket::new(
      event_loop,
      http,
      false,
      host,
      port,
      self.inner.options.tls.is_some(),
      self.inner.options.close_timeout.unwrap_or(DEFAULT_CLOSE_TIMEOUT),
      self.inner.options.max_size.unwrap_or(DEFAULT_MAX_SIZE),
      self.inner.options.max_queue,
    );

    match &self.inner.options.tls {
      Some(config) => {
        let (tls, handshake) =
          start_tls_server(event_loop, transport, config.clone())?;
        handshake.await?;
        TlsTransport::attach(&tls, Rc::new(websocket.clone()));
      }
      None => {
        TcpTransport::attach(&transport, Rc::new(websocket.clone()));
      }
    }

    let key = self.inner.connection_seq.get();
    self.inner.connection_seq.set(key + 1);
    self
      .inner
      .connections
      .borrow_mut()
      .insert(key, websocket.clone());

    let result = self.run_lifetime(&websocket).await;
    self.inner.connections.borrow_mut().remove(&key);
    result
  }

  async fn run_lifetime(
    &self,
    websocket: &WebSocket,
  ) -> Result<(), WebSocketError> {
    if !self.handshake(websocket).await? {
      return Ok(());
    }
    (self.inner.handler)(websocket.clone()).await;
    websocket.close(1000, "").await
  }

  /// The opening handshake; `Ok(false)` means an error response was
  /// already written and the connection is being torn down.
  async fn handshake(
    &self,
    websocket: &WebSocket,
  ) -> Result<bool, WebSocketError> {
    let http = websocket.http().clone();
    let reader = http.clone();
    let request = http
      .set_payload_reader(async move { reader.read_http_request().await })
      .await;
    let request = match request {
      Ok(request) => request,
      Err(error) => {
        // Could not even read a request; no response can help.
        log::debug!("websocket handshake failed before parsing: {error}");
        websocket.fail_connection(1002, "");
        return Ok(false);
      }
    };

    match self.negotiate(websocket, &request) {
      Ok(response_headers) => {
        http.write_http_response(
          101,
          &response_headers,
          HttpVersion::V11,
          None,
        )?;
        websocket.connection_open();
        Ok(true)
      }
      Err(error) => {
        let (status, mut headers, body) = match &error {
          WebSocketError::AbortHandshake {
            status,
            headers,
            body,
          } => (*status, headers.clone(), body.clone()),
          WebSocketError::InvalidOrigin(origin) => (
            403,
            Headers::new(),
            format!("Failed to open a WebSocket connection: {origin}.\n"),
          ),
          WebSocketError::InvalidUpgrade(message) => {
            let mut headers = Headers::new();
            headers.append(names::UPGRADE, "websocket");
            (
              426,
              headers,
              format!(
                "Failed to open a WebSocket connection: {message}.\n\n\
You cannot access a WebSocket server directly with a browser. You need \
a WebSocket client.\n"
              ),
            )
          }
          WebSocketError::InvalidHandshake(message) => (
            400,
            Headers::new(),
            format!("Failed to open a WebSocket connection: {message}.\n"),
          ),
          WebSocketError::Http(error) => (
            400,
            Headers::new(),
            format!("Invalid request: {error}.\n"),
          ),
          _ => (
            500,
            Headers::new(),
            "Failed to open a WebSocket connection.\n".to_string(),
          ),
        };
        headers.setdefault(names::DATE, http_date_now());
        headers.setdefault(names::SERVER, "cinder");
        headers.setdefault(names::CONTENT_LENGTH, body.len().to_string());
        headers.setdefault(names::CONTENT_TYPE, "text/plain");
        headers.setdefault(names::CONNECTION, "close");
        let _ = http.write_http_response(
          status,
          &headers,
          HttpVersion::V11,
          Some(body.as_bytes()),
        );
        websocket.fail_connection(1006, "");
        Ok(false)
      }
    }
  }

  /// Validates the upgrade request and builds the 101 response headers.
  fn negotiate(
    &self,
    websocket: &WebSocket,
    request: &RawRequestMessage,
  ) -> Result<Headers, WebSocketError> {
    let request_headers = &request.headers;

    if !self.inner.serving.get() {
      return Err(WebSocketError::AbortHandshake {
        status: 503,
        headers: Headers::new(),
        body: "Server is shutting down.\n".to_string(),
      });
    }
    if let Some(processor) = &self.inner.options.request_processor {
      if let Some((status, headers, body)) =
        processor(&request.path, request_headers)
      {
        return Err(WebSocketError::AbortHandshake {
          status,
          headers,
          body,
        });
      }
    }

    let mut connection_tokens = Vec::new();
    for value in request_headers.get_all(names::CONNECTION) {
      connection_tokens.extend(handshake::parse_tokens(value)?);
    }
    if !connection_tokens
      .iter()
      .any(|token| token.eq_ignore_ascii_case("upgrade"))
    {
      return Err(WebSocketError::InvalidUpgrade(format!(
        "no upgrade in the Connection header, got {connection_tokens:?}"
      )));
    }
    let mut upgrades = Vec::new();
    for value in request_headers.get_all(names::UPGRADE) {
      upgrades.extend(handshake::parse_upgrades(value)?);
    }
    if upgrades.len() != 1 || !upgrades[0].eq_ignore_ascii_case("websocket")
    {
      return Err(WebSocketError::InvalidUpgrade(format!(
        "expected exactly one 'websocket' Upgrade token, got {upgrades:?}"
      )));
    }

    let keys = request_headers.get_all(names::SEC_WEBSOCKET_KEY);
    let key = match keys.len() {
      0 => {
        return Err(WebSocketError::InvalidHandshake(
          "missing Sec-WebSocket-Key header".into(),
        ));
      }
      1 => keys[0],
      _ => {
        return Err(WebSocketError::InvalidHandshake(
          "multiple Sec-WebSocket-Key headers".into(),
        ));
      }
    };
    use base64::Engine as _;
    let raw_key = base64::engine::general_purpose::STANDARD
      .decode(key.trim())
      .map_err(|_| {
        WebSocketError::InvalidHandshake(format!(
          "invalid Sec-WebSocket-Key: {key:?}"
        ))
      })?;
    if raw_key.len() != 16 {
      return Err(WebSocketError::InvalidHandshake(format!(
        "Sec-WebSocket-Key must decode to 16 bytes, got {}",
        raw_key.len()
      )));
    }

    let versions = request_headers.get_all(names::SEC_WEBSOCKET_VERSION);
    match versions.len() {
      0 => {
        return Err(WebSocketError::InvalidHandshake(
          "missing Sec-WebSocket-Version header".into(),
        ));
      }
      1 => {
        if versions[0] != "13" {
          return Err(WebSocketError::InvalidHandshake(format!(
            "unsupported Sec-WebSocket-Version: {:?}",
            versions[0]
          )));
        }
      }
      _ => {
        return Err(WebSocketError::InvalidHandshake(
          "multiple Sec-WebSocket-Version headers".into(),
        ));
      }
    }

    if let Some(allowed) = &self.inner.options.allowed_origins {
      let origins = request_headers.get_all(names::ORIGIN);
      let origin = match origins.len() {
        0 => {
          return Err(WebSocketError::InvalidOrigin(
            "no Origin header".into(),
          ));
        }
        1 => origins[0],
        _ => {
          return Err(WebSocketError::InvalidOrigin(
            "more than one Origin header".into(),
          ));
        }
      };
      if !allowed.iter().any(|candidate| candidate == origin) {
        return Err(WebSocketError::InvalidOrigin(origin.to_string()));
      }
    }

    // Extensions: greedy selection in the client's order against the
    // server's available set.
    let mut accepted_extensions: Vec<Rc<dyn WebSocketExtension>> =
      Vec::new();
    let mut confirmed: Vec<(String, handshake::ExtensionParams)> =
      Vec::new();
    if !self.inner.options.available_extensions.is_empty() {
      let mut offered = Vec::new();
      for value in request_headers.get_all(names::SEC_WEBSOCKET_EXTENSIONS)
      {
        offered.extend(handshake::parse_extensions(value)?);
      }
      for (name, params) in offered {
        for extension in &self.inner.options.available_extensions {
          if extension.name() == name
            && extension.are_valid_params(&params, &accepted_extensions)
          {
            accepted_extensions.push(extension.clone());
            confirmed.push((name.clone(), params.clone()));
            break;
          }
        }
        // An extension nobody recognizes is simply declined.
      }
    }
    websocket.set_extensions(accepted_extensions);

    // Subprotocol: the user hook wins; the default picks the lowest
    // combined client + server rank.
    let mut selected_subprotocol = None;
    if !self.inner.options.available_subprotocols.is_empty() {
      let mut offered = Vec::new();
      for value in request_headers.get_all(names::SEC_WEBSOCKET_PROTOCOL) {
        offered.extend(handshake::parse_tokens(value)?);
      }
      if !offered.is_empty() {
        let available = &self.inner.options.available_subprotocols;
        selected_subprotocol =
          match &self.inner.options.subprotocol_selector {
            Some(selector) => selector(&offered, available),
            None => {
              let mut best: Option<(usize, &String)> = None;
              for candidate in &offered {
                if let Some(server_rank) =
                  available.iter().position(|entry| entry == candidate)
                {
                  let client_rank = offered
                    .iter()
                    .position(|entry| entry == candidate)
                    .unwrap_or(offered.len());
                  let rank = client_rank + server_rank;
                  if best
                    .as_ref()
                    .map(|(best_rank, _)| rank < *best_rank)
                    .unwrap_or(true)
                  {
                    best = Some((rank, candidate));
                  }
                }
              }
              best.map(|(_, candidate)| candidate.clone())
            }
          };
      }
    }
    websocket.set_subprotocol(selected_subprotocol.clone());

    let mut response_headers = Headers::new();
    response_headers.append(names::UPGRADE, "websocket");
    response_headers.append(names::CONNECTION, "Upgrade");
    response_headers
      .append(names::SEC_WEBSOCKET_ACCEPT, accept_key(key));
    if !confirmed.is_empty() {
      response_headers.append(
        names::SEC_WEBSOCKET_EXTENSIONS,
        handshake::build_extensions(&confirmed),
      );
    }
    if let Some(subprotocol) = selected_subprotocol {
      response_headers
        .append(names::SEC_WEBSOCKET_PROTOCOL, subprotocol);
    }
    for (name, value) in self.inner.options.extra_response_headers.iter() {
      response_headers.append(name, value);
    }
    response_headers.setdefault(names::DATE, http_date_now());
    response_headers.setdefault(names::SERVER, "cinder");
    Ok(response_headers)
  }
}

const DAY_NAMES: [&str; 7] =
  ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTH_NAMES: [&str; 12] = [
  "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct",
  "Nov", "Dec",
];

/// IMF-fixdate for the `Date` header, derived from the system clock with
/// the classic days-to-civil conversion.
fn http_date_now() -> String {
  let seconds = SystemTime::now()
    .duration_since(SystemTime::UNIX_EPOCH)
    .map(|duration| duration.as_secs())
    .unwrap_or(0);
  let days = (seconds / 86400) as i64;
  let second_of_day = seconds % 86400;
  let weekday = ((days + 4) % 7) as usize; // epoch was a Thursday

  // Howard Hinnant's civil_from_days.
  let z = days + 719468;
  let era = z.div_euclid(146097);
  let doe = z.rem_euclid(146097);
  let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
  let year = yoe + era * 400;
  let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
  let mp = (5 * doy + 2) / 153;
  let day = doy - (153 * mp + 2) / 5 + 1;
  let month = if mp < 10 { mp + 3 } else { mp - 9 };
  let year = if month <= 2 { year + 1 } else { year };

  format!(
    "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
    DAY_NAMES[weekday],
    day,
    MONTH_NAMES[(month - 1) as usize],
    year,
    second_of_day / 3600,
    (second_of_day / 60) % 60,
    second_of_day % 60,
  )
}

#[cfg(test)]
mod tests {
  use cinder_core::sleep;
  use cinder_fetch::HttpClient;
  use cinder_url::Url;
  use pretty_assertions::assert_eq;

  use super::*;
  use crate::client::connect;
  use crate::client::ConnectOptions;
  use crate::protocol::Message;

  #[test]
  fn http_date_is_well_formed() {
    let date = http_date_now();
    assert!(date.ends_with(" GMT"));
    assert_eq!(date.split(' ').count(), 6);
    assert!(DAY_NAMES.iter().any(|day| date.starts_with(day)));
  }

  fn fast_connect_options() -> ConnectOptions {
    ConnectOptions {
      close_timeout: Some(0.05),
      ..Default::default()
    }
  }

  fn echo_server(
    event_loop: &EventLoop,
    mut options: ServerOptions,
  ) -> (WebSocketServer, Url) {
    // Short close patience keeps the teardown paths fast under test.
    options.close_timeout = Some(options.close_timeout.unwrap_or(0.05));
    let handler: Handler = Rc::new(|websocket: WebSocket| {
      Box::pin(async move {
        while let Ok(message) = websocket.receive().await {
          if websocket.send(message).await.is_err() {
            break;
          }
        }
      })
    });
    let server = WebSocketServer::bind(
      event_loop,
      "127.0.0.1:0".parse().unwrap(),
      handler,
      options,
    )
    .unwrap();
    let address = server.local_addr().unwrap();
    let url = Url::parse(&format!("ws://127.0.0.1:{}/", address.port()))
      .unwrap();
    (server, url)
  }

  #[test]
  fn client_server_echo_and_close() {
    let event_loop = EventLoop::new().unwrap();
    let (server, url) = echo_server(&event_loop, ServerOptions::default());
    let client = HttpClient::new(&event_loop);

    let lp = event_loop.clone();
    event_loop
      .run_until(async move {
        let websocket =
          connect(&client, url, fast_connect_options()).await?;

        websocket
          .send(Message::Text("hello over websocket".into()))
          .await?;
        let echoed = websocket.receive().await?;
        assert_eq!(
          echoed,
          Message::Text("hello over websocket".into())
        );

        websocket
          .send(Message::Binary(bytes::Bytes::from_static(b"\x00\x01")))
          .await?;
        let echoed = websocket.receive().await?;
        assert_eq!(
          echoed,
          Message::Binary(bytes::Bytes::from_static(b"\x00\x01"))
        );

        websocket.close(1000, "done").await?;
        // The peer echoed the close frame; the code and reason stuck.
        assert_eq!(websocket.close_code(), 1000);
        assert_eq!(websocket.close_reason().as_deref(), Some("done"));
        match websocket.receive().await {
          Err(WebSocketError::ConnectionClosed(closed)) => {
            assert_eq!(closed.code, 1000);
          }
          other => panic!("expected ConnectionClosed, got {other:?}"),
        }
        sleep::<WebSocketError>(&lp, 0.02).await?;
        Ok::<(), WebSocketError>(())
      })
      .unwrap();
    server.close();
  }

  #[test]
  fn subprotocol_is_negotiated_by_rank() {
    let event_loop = EventLoop::new().unwrap();
    let options = ServerOptions {
      available_subprotocols: vec!["chat.v2".to_string(), "chat".to_string()],
      ..Default::default()
    };
    let (server, url) = echo_server(&event_loop, options);
    let client = HttpClient::new(&event_loop);

    event_loop
      .run_until(async move {
        let connect_options = ConnectOptions {
          available_subprotocols: vec![
            "chat".to_string(),
            "chat.v2".to_string(),
          ],
          ..Default::default()
        };
        let websocket = connect(&client, url, connect_options).await?;
        // chat: 0 + 1 = 1; chat.v2: 1 + 0 = 1; the first best match wins.
        assert_eq!(websocket.subprotocol().as_deref(), Some("chat"));
        websocket.close(1000, "").await?;
        Ok::<(), WebSocketError>(())
      })
      .unwrap();
    server.close();
  }

  #[test]
  fn ping_round_trip_over_tcp() {
    let event_loop = EventLoop::new().unwrap();
    let (server, url) = echo_server(&event_loop, ServerOptions::default());
    let client = HttpClient::new(&event_loop);

    event_loop
      .run_until(async move {
        let websocket =
          connect(&client, url, fast_connect_options()).await?;
        websocket.ping(None).await?;
        websocket.close(1000, "").await?;
        Ok::<(), WebSocketError>(())
      })
      .unwrap();
    server.close();
  }

  #[test]
  fn plain_http_request_is_answered_with_426() {
    let event_loop = EventLoop::new().unwrap();
    let (server, url) = echo_server(&event_loop, ServerOptions::default());
    let client = HttpClient::new(&event_loop);

    let (status, upgrade_header) = event_loop
      .run_until(async move {
        let response = client.get(url.clone()).await?;
        let status = response.status();
        let upgrade = response.headers().get(names::UPGRADE).map(str::to_string);
        response.read().await?;
        Ok::<_, cinder_fetch::FetchError>((status, upgrade))
      })
      .unwrap();
    assert_eq!(status, 426);
    assert_eq!(upgrade_header.as_deref(), Some("websocket"));
    server.close();
  }

  #[test]
  fn disallowed_origin_is_answered_with_403() {
    let event_loop = EventLoop::new().unwrap();
    let options = ServerOptions {
      allowed_origins: Some(vec!["https://allowed.example".to_string()]),
      ..Default::default()
    };
    let (server, url) = echo_server(&event_loop, options);
    let client = HttpClient::new(&event_loop);

    let result = event_loop.run_until({
      let client = client.clone();
      async move {
        let connect_options = ConnectOptions {
          origin: Some("https://evil.example".to_string()),
          ..Default::default()
        };
        connect(&client, url, connect_options).await.map(|_| ())
      }
    });
    match result {
      Err(WebSocketError::InvalidHandshake(message)) => {
        assert!(message.contains("403"), "unexpected message: {message}");
      }
      other => panic!("expected a refused handshake, got {other:?}"),
    }
    server.close();
  }
}
