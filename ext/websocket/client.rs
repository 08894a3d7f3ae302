// Copyright 2026 the Cinder authors. MIT license.

//! Client-side opening handshake, riding on the HTTP client: the request
//! carries the upgrade headers, the 101 response is validated, then the
//! pooled connection detaches and the transport switches to the WebSocket
//! protocol in place.

use std::rc::Rc;

use cinder_core::Transport;
use cinder_fetch::HttpClient;
use cinder_fetch::RequestOptions;
use cinder_http::names;
use cinder_http::Headers;
use cinder_http::HttpVersion;
use cinder_url::Url;

use crate::error::WebSocketError;
use crate::extension::WebSocketExtension;
use crate::handshake;
use crate::handshake::accept_key;
use crate::protocol::WebSocket;
use crate::protocol::DEFAULT_CLOSE_TIMEOUT;
use crate::protocol::DEFAULT_MAX_SIZE;

/// Options of a client connect.
#[derive(Clone, Default)]
pub struct ConnectOptions {
  pub origin: Option<String>,
  pub available_extensions: Vec<Rc<dyn WebSocketExtension>>,
  pub available_subprotocols: Vec<String>,
  pub headers: Headers,
  pub close_timeout: Option<f64>,
  pub max_size: Option<usize>,
  pub max_queue: Option<usize>,
}

fn single_header_value<'h>(
  headers: &'h Headers,
  name: &str,
) -> Result<&'h str, WebSocketError> {
  let values = headers.get_all(name);
  match values.len() {
    0 => Err(WebSocketError::InvalidHandshake(format!(
      "missing {name} header"
    ))),
    1 => Ok(values[0]),
    _ => Err(WebSocketError::InvalidHandshake(format!(
      "multiple {name} headers"
    ))),
  }
}

/// Connects a WebSocket to `url` (`ws://` or `wss://`).
pub async fn connect(
  client: &HttpClient,
  url: Url,
  options: ConnectOptions,
) -> Result<WebSocket, WebSocketError> {
  let event_loop = client.event_loop().clone();
  let is_ssl = url.is_secure();
  let host = url.raw_host().unwrap_or_default().to_string();
  let port = url.port().unwrap_or(if is_ssl { 443 } else { 80 });

  let sec_key = handshake::generate_key();
  let mut request_headers = Headers::new();
  request_headers.append(names::UPGRADE, "websocket");
  request_headers.append(names::CONNECTION, "Upgrade");
  request_headers.append(names::SEC_WEBSOCKET_KEY, sec_key.clone());
  request_headers.append(names::SEC_WEBSOCKET_VERSION, "13");
  if let Some(origin) = &options.origin {
    request_headers.append(names::ORIGIN, origin.clone());
  }
  if !options.available_extensions.is_empty() {
    let descriptors: Vec<(String, handshake::ExtensionParams)> = options
      .available_extensions
      .iter()
      .map(|extension| {
        (extension.name().to_string(), extension.request_params())
      })
      .collect();
    request_headers.append(
      names::SEC_WEBSOCKET_EXTENSIONS,
      handshake::build_extensions(&descriptors),
    );
  }
  if !options.available_subprotocols.is_empty() {
    request_headers.append(
      names::SEC_WEBSOCKET_PROTOCOL,
      handshake::build_subprotocols(&options.available_subprotocols),
    );
  }
  for (name, value) in options.headers.iter() {
    request_headers.append(name, value);
  }

  let request_options = RequestOptions {
    headers: request_headers,
    ..Default::default()
  };
  let response = client
    .request(names::METHOD_GET, url, request_options)
    .await?;

  let message = response.message().ok_or_else(|| {
    WebSocketError::InvalidHandshake("response head missing".into())
  })?;
  if message.version != HttpVersion::V11 {
    response.close();
    return Err(WebSocketError::InvalidHandshake(format!(
      "unsupported HTTP version: {}",
      message.version
    )));
  }
  if message.status != 101 {
    response.close();
    return Err(WebSocketError::InvalidHandshake(format!(
      "invalid status code: {}",
      message.status
    )));
  }
  let response_headers = &message.headers;

  let mut connection_tokens = Vec::new();
  for value in response_headers.get_all(names::CONNECTION) {
    connection_tokens.extend(handshake::parse_tokens(value)?);
  }
  if !connection_tokens
    .iter()
    .any(|token| token.eq_ignore_ascii_case("upgrade"))
  {
    response.close();
    return Err(WebSocketError::InvalidHandshake(format!(
      "no upgrade in the Connection header, got {connection_tokens:?}"
    )));
  }

  let mut upgrades = Vec::new();
  for value in response_headers.get_all(names::UPGRADE) {
    upgrades.extend(handshake::parse_upgrades(value)?);
  }
  if upgrades.len() != 1 || !upgrades[0].eq_ignore_ascii_case("websocket") {
    response.close();
    return Err(WebSocketError::InvalidHandshake(format!(
      "expected exactly one 'websocket' Upgrade token, got {upgrades:?}"
    )));
  }

  let received_accept =
    single_header_value(response_headers, names::SEC_WEBSOCKET_ACCEPT)
      .map_err(|error| {
        response.close();
        error
      })?;
  let expected_accept = accept_key(&sec_key);
  if received_accept != expected_accept {
    response.close();
    return Err(WebSocketError::InvalidHandshake(format!(
      "Sec-WebSocket-Accept mismatch: expected {expected_accept:?}, got \
{received_accept:?}"
    )));
  }

  // Negotiated extensions must be a subset of the advertised set, in the
  // order the server confirmed them.
  let mut accepted_extensions: Vec<Rc<dyn WebSocketExtension>> = Vec::new();
  let received_extensions =
    response_headers.get_all(names::SEC_WEBSOCKET_EXTENSIONS);
  if !received_extensions.is_empty() {
    if options.available_extensions.is_empty() {
      response.close();
      return Err(WebSocketError::InvalidHandshake(
        "no extensions supported, but the server negotiated some".into(),
      ));
    }
    let mut negotiated = Vec::new();
    for value in received_extensions {
      negotiated.extend(handshake::parse_extensions(value)?);
    }
    'negotiated: for (name, params) in negotiated {
      for extension in &options.available_extensions {
        if extension.name() == name
          && extension.are_valid_params(&params, &accepted_extensions)
        {
          accepted_extensions.push(extension.clone());
          continue 'negotiated;
        }
      }
      response.close();
      return Err(WebSocketError::InvalidHandshake(format!(
        "unsupported extension: {name:?} with params {params:?}"
      )));
    }
  }

  let mut subprotocol = None;
  let received_subprotocols =
    response_headers.get_all(names::SEC_WEBSOCKET_PROTOCOL);
  if !received_subprotocols.is_empty() {
    if options.available_subprotocols.is_empty() {
      response.close();
      return Err(WebSocketError::InvalidHandshake(
        "no subprotocols supported, but the server selected one".into(),
      ));
    }
    let mut parsed = Vec::new();
    for value in received_subprotocols {
      parsed.extend(handshake::parse_tokens(value)?);
    }
    if parsed.len() > 1 {
      response.close();
      return Err(WebSocketError::InvalidHandshake(format!(
        "multiple subprotocols selected: {parsed:?}"
      )));
    }
    let selected = parsed.remove(0);
    if !options.available_subprotocols.contains(&selected) {
      response.close();
      return Err(WebSocketError::InvalidHandshake(format!(
        "unsupported subprotocol: {selected:?}"
      )));
    }
    subprotocol = Some(selected);
  }

  // Take the connection out of the pool and re-point its transport at the
  // WebSocket protocol; the buffered HTTP state moves along untouched.
  let connection = response.connection().ok_or_else(|| {
    WebSocketError::InvalidHandshake(
      "upgrade response lost its connection".into(),
    )
  })?;
  let protocol = connection.detach().ok_or_else(|| {
    WebSocketError::InvalidHandshake(
      "upgrade connection already detached".into(),
    )
  })?;
  let transport = protocol.transport().ok_or_else(|| {
    WebSocketError::InvalidHandshake(
      "upgrade connection has no transport".into(),
    )
  })?;

  let websocket = WebSocket::new(
    &event_loop,
    protocol,
    true,
    host,
    port,
    is_ssl,
    options.close_timeout.unwrap_or(DEFAULT_CLOSE_TIMEOUT),
    options.max_size.unwrap_or(DEFAULT_MAX_SIZE),
    options.max_queue,
  );
  websocket.set_extensions(accepted_extensions);
  websocket.set_subprotocol(subprotocol);
  transport.set_protocol(Rc::new(websocket.clone()));
  websocket.connection_open();
  Ok(websocket)
}
