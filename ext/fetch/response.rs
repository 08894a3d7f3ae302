// Copyright 2026 the Cinder authors. MIT license.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use cinder_core::EventLoop;
use cinder_core::Promise;
use cinder_core::TaskHandle;
use cinder_http::names;
use cinder_http::HttpError;
use cinder_http::MimeType;
use cinder_http::RawResponseMessage;
use cinder_url::Url;

use crate::connection::Connection;
use crate::cookies::Cookie;
use crate::error::FetchError;

struct ResponseState {
  closed: bool,
  released: bool,
  connection: Option<Connection>,
  message: Option<Rc<RawResponseMessage>>,
  payload_waiter: Option<Promise<Bytes, HttpError>>,
  body: Option<Bytes>,
  cookies: Vec<Cookie>,
  history: Vec<ClientResponse>,
  writer: Option<TaskHandle<(), FetchError>>,
}

/// A response in flight. `start` reads the head; the body is drained
/// lazily through `read`/`text`/`json`. Once the body completes, the
/// underlying connection is released back to the pool (or closed, when
/// the message forbids reuse).
#[derive(Clone)]
pub struct ClientResponse {
  event_loop: EventLoop,
  method: String,
  url: Url,
  state: Rc<RefCell<ResponseState>>,
}

impl ClientResponse {
  pub(crate) fn new(
    event_loop: &EventLoop,
    method: String,
    url: Url,
    connection: Connection,
    writer: Option<TaskHandle<(), FetchError>>,
  ) -> ClientResponse {
    ClientResponse {
      event_loop: event_loop.clone(),
      method,
      url,
      state: Rc::new(RefCell::new(ResponseState {
        closed: false,
        released: false,
        connection: Some(connection),
        message: None,
        payload_waiter: None,
        body: None,
        cookies: Vec::new(),
        history: Vec::new(),
        writer,
      })),
    }
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn status(&self) -> u16 {
    self
      .state
      .borrow()
      .message
      .as_ref()
      .map(|message| message.status)
      .unwrap_or(0)
  }

  pub fn reason(&self) -> Option<String> {
    self
      .state
      .borrow()
      .message
      .as_ref()
      .and_then(|message| message.reason.clone())
  }

  pub fn message(&self) -> Option<Rc<RawResponseMessage>> {
    self.state.borrow().message.clone()
  }

  pub fn headers(&self) -> cinder_http::Headers {
    self
      .state
      .borrow()
      .message
      .as_ref()
      .map(|message| message.headers.clone())
      .unwrap_or_default()
  }

  pub fn cookies(&self) -> Vec<Cookie> {
    self.state.borrow().cookies.clone()
  }

  pub fn history(&self) -> Vec<ClientResponse> {
    self.state.borrow().history.clone()
  }

  pub(crate) fn set_history(&self, history: Vec<ClientResponse>) {
    self.state.borrow_mut().history = history;
  }

  pub fn connection(&self) -> Option<Connection> {
    self.state.borrow().connection.clone()
  }

  /// Reads the response head and installs the body reader. HEAD responses
  /// never get one.
  pub async fn start(&self) -> Result<(), FetchError> {
    let result = self.start_inner().await;
    if result.is_err() {
      self.close();
    }
    result
  }

  async fn start_inner(&self) -> Result<(), FetchError> {
    let connection = self.connection().ok_or_else(|| {
      FetchError::Connection {
        key: String::new(),
        message: "response has no connection".into(),
      }
    })?;
    let protocol =
      connection.protocol().ok_or_else(|| FetchError::Connection {
        key: connection.key().to_string(),
        message: "connection already detached".into(),
      })?;

    let head_protocol = protocol.clone();
    let message = protocol
      .set_payload_reader(async move {
        head_protocol.read_http_response().await
      })
      .await?;
    let message = Rc::new(message);

    let payload_waiter = if self.method == names::METHOD_HEAD {
      None
    } else {
      protocol.install_response_body_reader(&message)?
    };

    {
      let mut state = self.state.borrow_mut();
      for header in message.headers.get_all(names::SET_COOKIE) {
        if let Some(cookie) = Cookie::parse(header) {
          state.cookies.push(cookie);
        }
      }
      state.message = Some(message);
      state.payload_waiter = payload_waiter.clone();
    }

    match payload_waiter {
      Some(waiter) => {
        let this = self.clone();
        waiter.add_done_callback(move |_| this.response_eof());
      }
      None => self.response_eof(),
    }
    Ok(())
  }

  /// Runs when the body reader completes (or was never needed): releases
  /// the connection, unless the message upgraded the transport to another
  /// protocol's ownership.
  fn response_eof(&self) {
    let mut state = self.state.borrow_mut();
    if state.closed {
      return;
    }
    state.payload_waiter = None;
    let upgraded = state
      .message
      .as_ref()
      .map(|message| message.upgraded())
      .unwrap_or(false);
    if let Some(connection) = &state.connection {
      if upgraded && connection.protocol().is_some() {
        // WebSocket or tunnel takeover: the transport now belongs to the
        // upgraded protocol; nothing to release.
        return;
      }
    }
    let connection = state.connection.take();
    let keep_alive = state
      .message
      .as_ref()
      .map(|message| message.keep_alive())
      .unwrap_or(false);
    state.closed = true;
    let writer = state.writer.take();
    drop(state);

    if let Some(connection) = connection {
      if keep_alive {
        connection.release();
      } else {
        connection.close();
      }
    }
    if let Some(writer) = writer {
      writer.cancel();
    }
  }

  /// Reads the whole body. Subsequent calls return the cached bytes.
  pub async fn read(&self) -> Result<Bytes, FetchError> {
    let waiter = self.state.borrow_mut().payload_waiter.take();
    match waiter {
      Some(waiter) => {
        let body = waiter.await?;
        self.state.borrow_mut().body = Some(body.clone());
        Ok(body)
      }
      None => Ok(self.state.borrow().body.clone().unwrap_or_default()),
    }
  }

  /// Charset resolved from the headers: a valid Content-Type `charset`
  /// parameter, or utf-8 for JSON mime types.
  fn encoding_from_headers(
    &self,
  ) -> Option<&'static encoding_rs::Encoding> {
    let headers = self.headers();
    let mime =
      MimeType::parse(headers.get(names::CONTENT_TYPE).unwrap_or(""));
    if let Some(label) = mime.parameter("charset") {
      if let Some(encoding) =
        encoding_rs::Encoding::for_label(label.as_bytes())
      {
        return Some(encoding);
      }
    }
    if mime.type_ == "application"
      && (mime.sub_type == "json" || mime.suffix == "json")
    {
      return Some(encoding_rs::UTF_8);
    }
    None
  }

  /// Charset for `text`: header charset, then utf-8.
  pub fn encoding(&self) -> &'static encoding_rs::Encoding {
    self.encoding_from_headers().unwrap_or(encoding_rs::UTF_8)
  }

  /// Decodes the body: explicit encoding, header charset, JSON default,
  /// BOM sniff, utf-8 — in that order.
  pub async fn text(
    &self,
    encoding: Option<&'static encoding_rs::Encoding>,
  ) -> Result<String, FetchError> {
    let body = self.read().await?;
    let encoding = encoding
      .or_else(|| self.encoding_from_headers())
      .or_else(|| {
        encoding_rs::Encoding::for_bom(&body).map(|(encoding, _)| encoding)
      })
      .unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = encoding.decode(&body);
    Ok(text.into_owned())
  }

  /// Decodes the body as JSON. With `check_content_type`, a mime type
  /// that is not `application/json`-shaped is rejected first.
  pub async fn json(
    &self,
    check_content_type: bool,
  ) -> Result<serde_json::Value, FetchError> {
    if check_content_type {
      let headers = self.headers();
      let mime =
        MimeType::parse(headers.get(names::CONTENT_TYPE).unwrap_or(""));
      let json_shaped = mime.type_ == "application"
        && (mime.sub_type == "json" || mime.suffix == "json");
      if !json_shaped {
        return Err(FetchError::UnexpectedMimeType {
          expected: "application/json".into(),
          got: headers.get(names::CONTENT_TYPE).unwrap_or("").into(),
        });
      }
    }
    let text = self.text(None).await?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
      return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(trimmed).map_err(|error| {
      FetchError::Http(HttpError::payload(format!(
        "invalid JSON body: {error}"
      )))
    })
  }

  /// Marks the response broken and closes its connection. Idempotent.
  pub fn close(&self) {
    let mut state = self.state.borrow_mut();
    if !state.released {
      state.released = true;
      if state.payload_waiter.is_some() {
        if let Some(connection) = &state.connection {
          if let Some(protocol) = connection.protocol() {
            protocol.set_exception(HttpError::Connection(
              "response closed while reading the body".into(),
            ));
          }
        }
      }
    }
    if state.closed {
      return;
    }
    state.closed = true;
    let connection = state.connection.take();
    let writer = state.writer.take();
    drop(state);
    if let Some(connection) = connection {
      connection.close();
    }
    if let Some(writer) = writer {
      writer.cancel();
    }
  }

  /// Marks the response done and returns the connection for reuse.
  /// Idempotent.
  pub fn release(&self) {
    let mut state = self.state.borrow_mut();
    if !state.released {
      state.released = true;
      if state.payload_waiter.is_some() {
        if let Some(connection) = &state.connection {
          if let Some(protocol) = connection.protocol() {
            protocol.set_exception(HttpError::Connection(
              "response released while reading the body".into(),
            ));
          }
        }
      }
    }
    if state.closed {
      return;
    }
    state.closed = true;
    let connection = state.connection.take();
    let keep_alive = state
      .message
      .as_ref()
      .map(|message| message.keep_alive())
      .unwrap_or(false);
    let writer = state.writer.take();
    drop(state);
    if let Some(connection) = connection {
      if keep_alive {
        connection.release();
      } else {
        connection.close();
      }
    }
    if let Some(writer) = writer {
      writer.cancel();
    }
  }
}
