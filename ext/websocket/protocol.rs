// Copyright 2026 the Cinder authors. MIT license.

//! The shared WebSocket state machine: open/close lifecycle, control frame
//! routing, FIFO ping/pong correlation, fragmented message reassembly and
//! the close handshake ordering. Both the client and the server side embed
//! this type; it layers over the HTTP protocol so a connection upgrades in
//! place.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use bytes::BytesMut;
use cinder_core::AsyncLock;
use cinder_core::AsyncQueue;
use cinder_core::CoreError;
use cinder_core::EventLoop;
use cinder_core::Promise;
use cinder_core::Protocol;
use cinder_core::TaskHandle;
use cinder_core::Transport;
use cinder_http::HttpError;
use cinder_http::HttpProtocol;

use crate::error::ConnectionClosed;
use crate::error::WebSocketError;
use crate::extension::WebSocketExtension;
use crate::frame;
use crate::frame::WebSocketFrame;
use crate::frame::OP_BINARY;
use crate::frame::OP_CLOSE;
use crate::frame::OP_CONTINUOUS;
use crate::frame::OP_PING;
use crate::frame::OP_PONG;
use crate::frame::OP_TEXT;

/// Default cap on a received payload, in bytes.
pub const DEFAULT_MAX_SIZE: usize = 1 << 26;

/// Default close handshake patience, in seconds.
pub const DEFAULT_CLOSE_TIMEOUT: f64 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WsState {
  Connecting,
  Open,
  Closing,
  Closed,
}

fn is_valid_close_code(code: u16) -> bool {
  matches!(
    code,
    1000 | 1001 | 1002 | 1003 | 1007 | 1008 | 1009 | 1010 | 1011 | 1013
  ) || (3000..5000).contains(&code)
}

/// A complete, reassembled message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
  Text(String),
  Binary(Bytes),
}

impl Message {
  pub fn len(&self) -> usize {
    match self {
      Message::Text(text) => text.len(),
      Message::Binary(data) => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

struct WsInner {
  event_loop: EventLoop,
  http: HttpProtocol,
  is_client: bool,
  is_ssl: bool,
  host: String,
  port: u16,
  close_timeout: f64,
  max_size: usize,
  drain_lock: AsyncLock,
  state: Cell<WsState>,
  extensions: RefCell<Vec<Rc<dyn WebSocketExtension>>>,
  subprotocol: RefCell<Option<String>>,
  close_code: Cell<u16>,
  close_reason: RefCell<Option<String>>,
  connection_lost_waiter: Promise<(), WebSocketError>,
  messages: AsyncQueue<Message, WebSocketError>,
  pings: RefCell<VecDeque<(Bytes, Promise<(), WebSocketError>)>>,
  transfer_data_task: RefCell<Option<TaskHandle<(), WebSocketError>>>,
  transfer_data_error: RefCell<Option<ConnectionClosed>>,
  close_connection_task: RefCell<Option<TaskHandle<(), WebSocketError>>>,
}

/// A WebSocket connection. Cheap to clone; all clones share one state
/// machine.
#[derive(Clone)]
pub struct WebSocket {
  inner: Rc<WsInner>,
}

impl WebSocket {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    event_loop: &EventLoop,
    http: HttpProtocol,
    is_client: bool,
    host: String,
    port: u16,
    is_ssl: bool,
    close_timeout: f64,
    max_size: usize,
    max_queue: Option<usize>,
  ) -> WebSocket {
    WebSocket {
      inner: Rc::new(WsInner {
        event_loop: event_loop.clone(),
        http,
        is_client,
        is_ssl,
        host,
        port,
        close_timeout,
        max_size,
        drain_lock: AsyncLock::new(),
        state: Cell::new(WsState::Connecting),
        extensions: RefCell::new(Vec::new()),
        subprotocol: RefCell::new(None),
        close_code: Cell::new(0),
        close_reason: RefCell::new(None),
        connection_lost_waiter: event_loop.promise(),
        messages: AsyncQueue::new(max_queue),
        pings: RefCell::new(VecDeque::new()),
        transfer_data_task: RefCell::new(None),
        transfer_data_error: RefCell::new(None),
        close_connection_task: RefCell::new(None),
      }),
    }
  }

  pub fn event_loop(&self) -> &EventLoop {
    &self.inner.event_loop
  }

  pub fn http(&self) -> &HttpProtocol {
    &self.inner.http
  }

  pub fn is_client(&self) -> bool {
    self.inner.is_client
  }

  pub fn host(&self) -> &str {
    &self.inner.host
  }

  pub fn port(&self) -> u16 {
    self.inner.port
  }

  pub fn close_code(&self) -> u16 {
    self.inner.close_code.get()
  }

  pub fn close_reason(&self) -> Option<String> {
    self.inner.close_reason.borrow().clone()
  }

  pub fn subprotocol(&self) -> Option<String> {
    self.inner.subprotocol.borrow().clone()
  }

  pub fn set_subprotocol(&self, subprotocol: Option<String>) {
    *self.inner.subprotocol.borrow_mut() = subprotocol;
  }

  pub fn set_extensions(
    &self,
    extensions: Vec<Rc<dyn WebSocketExtension>>,
  ) {
    *self.inner.extensions.borrow_mut() = extensions;
  }

  pub fn is_open(&self) -> bool {
    if self.inner.state.get() != WsState::Open {
      return false;
    }
    match self.inner.transfer_data_task.borrow().as_ref() {
      Some(task) => !task.is_done(),
      None => false,
    }
  }

  pub fn is_closed(&self) -> bool {
    self.inner.state.get() == WsState::Closed
  }

  /// Marks the handshake complete and starts the transfer and close
  /// bookkeeping tasks.
  pub fn connection_open(&self) {
    self.inner.state.set(WsState::Open);
    let transfer = self.clone();
    *self.inner.transfer_data_task.borrow_mut() = Some(
      self
        .inner
        .event_loop
        .spawn(async move { transfer.transfer_data().await }),
    );
    let closer = self.clone();
    *self.inner.close_connection_task.borrow_mut() = Some(
      self
        .inner
        .event_loop
        .spawn(async move { closer.close_connection().await }),
    );
  }

  fn closed_error(&self) -> WebSocketError {
    if let Some(closed) = self.inner.transfer_data_error.borrow().as_ref() {
      return WebSocketError::ConnectionClosed(closed.clone());
    }
    let code = self.inner.close_code.get();
    WebSocketError::ConnectionClosed(ConnectionClosed {
      code: if code == 0 { 1006 } else { code },
      reason: self.inner.close_reason.borrow().clone(),
    })
  }

  /// Receives the next message; after the connection closes, every call
  /// reports the terminal [`ConnectionClosed`].
  pub async fn receive(&self) -> Result<Message, WebSocketError> {
    self.inner.messages.get().await
  }

  /// Non-blocking receive.
  pub fn receive_no_wait(
    &self,
  ) -> Result<Option<Message>, WebSocketError> {
    self.inner.messages.try_get()
  }

  pub async fn send(
    &self,
    message: Message,
  ) -> Result<(), WebSocketError> {
    self.ensure_open().await?;
    match message {
      Message::Text(text) => {
        self
          .write_frame(OP_TEXT, Bytes::from(text.into_bytes()), WsState::Open)
          .await
      }
      Message::Binary(data) => {
        self.write_frame(OP_BINARY, data, WsState::Open).await
      }
    }
  }

  /// Sends a ping and waits for the matching pong. A payload colliding
  /// with an outstanding ping is regenerated until free.
  pub async fn ping(
    &self,
    data: Option<Bytes>,
  ) -> Result<(), WebSocketError> {
    self.ensure_open().await?;
    let mut data = data.unwrap_or_else(random_ping_payload);
    {
      let pings = self.inner.pings.borrow();
      while pings.iter().any(|(payload, _)| payload == &data) {
        data = random_ping_payload();
      }
    }
    let waiter: Promise<(), WebSocketError> =
      self.inner.event_loop.promise();
    self
      .inner
      .pings
      .borrow_mut()
      .push_back((data.clone(), waiter.clone()));
    self.write_frame(OP_PING, data, WsState::Open).await?;
    waiter.await
  }

  pub async fn pong(
    &self,
    data: Option<Bytes>,
  ) -> Result<(), WebSocketError> {
    let data = data.unwrap_or_else(random_ping_payload);
    let state = self.inner.state.get();
    // A pong answering a ping that arrived during the close handshake is
    // still legal.
    let expected = if state == WsState::Closing {
      WsState::Closing
    } else {
      self.ensure_open().await?;
      WsState::Open
    };
    self.write_frame(OP_PONG, data, expected).await
  }

  /// Raises the terminal error when the connection is not usable.
  pub async fn ensure_open(&self) -> Result<(), WebSocketError> {
    match self.inner.state.get() {
      WsState::Open => {
        let finished = self
          .inner
          .transfer_data_task
          .borrow()
          .as_ref()
          .map(|task| task.is_done())
          .unwrap_or(true);
        if finished {
          self.wait_close_connection_done().await?;
          return Err(self.closed_error());
        }
        Ok(())
      }
      WsState::Closed => Err(self.closed_error()),
      WsState::Closing => {
        if self.inner.close_code.get() == 0 {
          // This side started the closing handshake; wait for it.
          self.wait_close_connection_done().await?;
        }
        Err(self.closed_error())
      }
      WsState::Connecting => Err(WebSocketError::protocol(
        "websocket connection is not established yet",
      )),
    }
  }

  async fn wait_close_connection_done(
    &self,
  ) -> Result<(), WebSocketError> {
    let task = self.inner.close_connection_task.borrow().clone();
    if let Some(task) = task {
      task.promise().wait_done::<WebSocketError>().await?;
    }
    Ok(())
  }

  // -- receiving ------------------------------------------------------------

  async fn transfer_data(self) -> Result<(), WebSocketError> {
    let result: Result<(), WebSocketError> = async {
      loop {
        match self.read_message().await? {
          Some(message) => self.inner.messages.push(message),
          // A close frame ends the message stream.
          None => return Ok(()),
        }
      }
    }
    .await;

    let closed = match &result {
      Ok(()) => {
        // Clean close: a client that saw the peer's close frame has no
        // reason to wait for the TCP teardown.
        if self.inner.is_client {
          self
            .inner
            .connection_lost_waiter
            .set_result_if_pending(());
        }
        let code = self.inner.close_code.get();
        ConnectionClosed {
          code: if code == 0 { 1000 } else { code },
          reason: self.inner.close_reason.borrow().clone(),
        }
      }
      Err(WebSocketError::Cancelled) => {
        // Graceful abort: whoever cancelled already drives the teardown.
        let code = self.inner.close_code.get();
        ConnectionClosed {
          code: if code == 0 { 1000 } else { code },
          reason: self.inner.close_reason.borrow().clone(),
        }
      }
      Err(WebSocketError::ConnectionClosed(closed)) => closed.clone(),
      Err(WebSocketError::Protocol(_))
      | Err(WebSocketError::InvalidHandshake(_)) => {
        self.fail_connection(1002, "");
        ConnectionClosed {
          code: 1002,
          reason: None,
        }
      }
      Err(WebSocketError::Utf8) => {
        self.fail_connection(1007, "");
        ConnectionClosed {
          code: 1007,
          reason: None,
        }
      }
      Err(WebSocketError::Http(HttpError::Payload(_))) => {
        self.fail_connection(1009, "");
        ConnectionClosed {
          code: 1009,
          reason: None,
        }
      }
      Err(WebSocketError::TimedOut)
      | Err(WebSocketError::Http(_))
      | Err(WebSocketError::Fetch(_)) => {
        self.fail_connection(1006, "");
        ConnectionClosed {
          code: 1006,
          reason: None,
        }
      }
      Err(other) => {
        self.inner.event_loop.report_exception(&format!(
          "unexpected error in the websocket transfer task: {other:?}"
        ));
        self.fail_connection(1011, "");
        ConnectionClosed {
          code: 1011,
          reason: None,
        }
      }
    };

    if self.inner.transfer_data_error.borrow().is_none() {
      *self.inner.transfer_data_error.borrow_mut() = Some(closed.clone());
      self
        .inner
        .messages
        .set_error(WebSocketError::ConnectionClosed(closed));
    }

    match result {
      Err(WebSocketError::Cancelled) => Err(WebSocketError::Cancelled),
      _ => Ok(()),
    }
  }

  /// Reads and reassembles one message; `None` after a close frame.
  async fn read_message(&self) -> Result<Option<Message>, WebSocketError> {
    let Some(first) = self.read_data_frame(Some(self.inner.max_size)).await?
    else {
      return Ok(None);
    };
    let is_text = match first.opcode() {
      OP_TEXT => true,
      OP_BINARY => false,
      opcode => {
        return Err(WebSocketError::Protocol(format!(
          "unexpected opcode {opcode}, expected text or binary"
        )));
      }
    };

    if first.is_final() {
      return Ok(Some(if is_text {
        Message::Text(
          String::from_utf8(first.data.to_vec())
            .map_err(|_| WebSocketError::Utf8)?,
        )
      } else {
        Message::Binary(first.data)
      }));
    }

    // Fragmented: stream fragments through an incremental UTF-8 decoder
    // so partial code points crossing fragment borders survive.
    let mut remaining = self.inner.max_size;
    let mut decoder = encoding_rs::UTF_8.new_decoder();
    let mut text_output = String::new();
    let mut binary_output = BytesMut::new();
    let mut frame = first;
    loop {
      remaining = remaining.saturating_sub(frame.data.len());
      let is_final = frame.is_final();
      if is_text {
        decode_utf8_chunk(
          &mut decoder,
          &frame.data,
          is_final,
          &mut text_output,
        )?;
      } else {
        binary_output.extend_from_slice(&frame.data);
      }
      if is_final {
        break;
      }
      frame = self
        .read_data_frame(Some(remaining))
        .await?
        .ok_or_else(|| {
          WebSocketError::protocol("incomplete fragmented message")
        })?;
      if frame.opcode() != OP_CONTINUOUS {
        return Err(WebSocketError::Protocol(format!(
          "unexpected opcode {}, expected a continuation",
          frame.opcode()
        )));
      }
    }

    Ok(Some(if is_text {
      Message::Text(text_output)
    } else {
      Message::Binary(binary_output.freeze())
    }))
  }

  /// Reads frames until a data frame arrives, handling control frames
  /// internally; `None` after a close frame.
  async fn read_data_frame(
    &self,
    max_size: Option<usize>,
  ) -> Result<Option<WebSocketFrame>, WebSocketError> {
    loop {
      let http = self.inner.http.clone();
      let is_client = self.inner.is_client;
      let waiter = self.inner.http.set_payload_reader(async move {
        Ok(frame::read_frame(&http, is_client, max_size).await)
      });
      let mut frame = waiter.await??;

      let extensions = self.inner.extensions.borrow().clone();
      let mut claimed_rsv = 0u8;
      for extension in extensions.iter().rev() {
        frame = extension.decode(frame, max_size)?;
      }
      for extension in extensions.iter() {
        claimed_rsv |= extension.claimed_rsv_bits();
      }
      frame.check_with_claimed_rsv(claimed_rsv)?;

      if matches!(frame.opcode(), OP_CONTINUOUS | OP_TEXT | OP_BINARY) {
        return Ok(Some(frame));
      }
      if !self.process_control_frame(frame).await? {
        return Ok(None);
      }
    }
  }

  /// Routes one control frame; `false` after a close frame.
  async fn process_control_frame(
    &self,
    frame: WebSocketFrame,
  ) -> Result<bool, WebSocketError> {
    match frame.opcode() {
      OP_CLOSE => {
        let data = &frame.data;
        match data.len() {
          0 => self.inner.close_code.set(1005),
          1 => {
            return Err(WebSocketError::protocol("close frame too short"));
          }
          _ => {
            let code = u16::from_be_bytes([data[0], data[1]]);
            if !is_valid_close_code(code) {
              return Err(WebSocketError::Protocol(format!(
                "invalid close code {code}"
              )));
            }
            let reason = String::from_utf8(data[2..].to_vec())
              .map_err(|_| WebSocketError::Utf8)?;
            self.inner.close_code.set(code);
            *self.inner.close_reason.borrow_mut() = Some(reason);
          }
        }
        self.write_close_frame(frame.data.clone()).await?;
        Ok(false)
      }
      OP_PING => {
        // Answer with the same payload.
        self.pong(Some(frame.data.clone())).await?;
        Ok(true)
      }
      _ => {
        // PONG: resolve every pending ping up to and including the FIFO
        // match; an unsolicited pong is ignored.
        let has_match = self
          .inner
          .pings
          .borrow()
          .iter()
          .any(|(payload, _)| payload == &frame.data);
        if has_match {
          loop {
            let Some((payload, waiter)) =
              self.inner.pings.borrow_mut().pop_front()
            else {
              break;
            };
            waiter.set_result_if_pending(());
            if payload == frame.data {
              break;
            }
          }
        }
        Ok(true)
      }
    }
  }

  // -- sending --------------------------------------------------------------

  async fn write_frame(
    &self,
    opcode: u8,
    data: Bytes,
    expected_state: WsState,
  ) -> Result<(), WebSocketError> {
    if self.inner.state.get() != expected_state {
      return Err(WebSocketError::Protocol(format!(
        "cannot write to a websocket in the {:?} state",
        self.inner.state.get()
      )));
    }

    // One frame at a time; the guard also spans the drain.
    let guard = self.inner.drain_lock.acquire::<WebSocketError>().await?;
    let result: Result<(), WebSocketError> = async {
      let mut frame = WebSocketFrame::new(true, opcode, data);
      let extensions = self.inner.extensions.borrow().clone();
      if !extensions.is_empty() {
        let mut claimed_rsv = 0u8;
        for extension in extensions.iter() {
          frame = extension.encode(frame)?;
          claimed_rsv |= extension.claimed_rsv_bits();
        }
        frame.check_with_claimed_rsv(claimed_rsv)?;
      }
      frame::write_frame(&self.inner.http, &frame, self.inner.is_client)?;
      self.inner.http.drain().await?;
      Ok(())
    }
    .await;
    drop(guard);

    match result {
      Ok(()) => Ok(()),
      Err(
        WebSocketError::Http(HttpError::Connection(_))
        | WebSocketError::Http(HttpError::Core(_)),
      ) => {
        self.fail_connection(1006, "");
        Err(self.closed_error())
      }
      Err(error) => Err(error),
    }
  }

  /// Writes the close frame once, moving OPEN to CLOSING.
  async fn write_close_frame(
    &self,
    data: Bytes,
  ) -> Result<(), WebSocketError> {
    if self.inner.state.get() == WsState::Open {
      self.inner.state.set(WsState::Closing);
      self.write_frame(OP_CLOSE, data, WsState::Closing).await?;
    }
    Ok(())
  }

  fn serialize_close(
    code: u16,
    reason: &str,
  ) -> Result<Bytes, WebSocketError> {
    if !is_valid_close_code(code) {
      return Err(WebSocketError::Protocol(format!(
        "close code must be in the registered set or [3000, 5000), got {code}"
      )));
    }
    let mut data = Vec::with_capacity(2 + reason.len());
    data.extend_from_slice(&code.to_be_bytes());
    data.extend_from_slice(reason.as_bytes());
    Ok(Bytes::from(data))
  }

  /// The closing handshake: write the close frame (fail the connection on
  /// timeout), wait for the peer's echo via the transfer task, then wait
  /// for the connection teardown.
  pub async fn close(
    &self,
    code: u16,
    reason: &str,
  ) -> Result<(), WebSocketError> {
    let close_message = Self::serialize_close(code, reason)?;

    let writer = self.clone();
    let write_task = self.inner.event_loop.spawn(async move {
      writer.write_close_frame(close_message).await
    });
    write_task.apply_timeout(self.inner.close_timeout);
    match write_task.await {
      Ok(()) => {}
      Err(WebSocketError::TimedOut) => {
        self.fail_connection(1006, "");
      }
      Err(WebSocketError::ConnectionClosed(_)) => {}
      Err(error) => return Err(error),
    }

    // Bound the wait for the peer's close echo.
    let transfer = self.inner.transfer_data_task.borrow().clone();
    if let Some(transfer) = transfer {
      transfer.apply_timeout(self.inner.close_timeout);
      let _ = transfer.promise().wait_done::<WebSocketError>().await;
    }

    self.wait_close_connection_done().await
  }

  /// Emergency teardown. Cancels the transfer task, writes a close frame
  /// only when the state is OPEN and the code is a real wire code (1006
  /// never hits the wire), and makes sure a close-connection task runs.
  pub fn fail_connection(&self, code: u16, reason: &str) {
    if let Some(task) = self.inner.transfer_data_task.borrow().as_ref() {
      task.cancel_with(cinder_core::CancelKind::TimedOut);
    }

    if code != 1006 && self.inner.state.get() == WsState::Open {
      if let Ok(data) = Self::serialize_close(code, reason) {
        self.inner.state.set(WsState::Closing);
        let mut frame = WebSocketFrame::new(true, OP_CLOSE, data);
        let extensions = self.inner.extensions.borrow().clone();
        let mut valid = true;
        for extension in extensions.iter() {
          match extension.encode(frame.clone()) {
            Ok(encoded) => frame = encoded,
            Err(_) => {
              valid = false;
              break;
            }
          }
        }
        if valid {
          let _ =
            frame::write_frame(&self.inner.http, &frame, self.inner.is_client);
        }
      }
    }

    if self.inner.close_connection_task.borrow().is_none() {
      let closer = self.clone();
      *self.inner.close_connection_task.borrow_mut() = Some(
        self
          .inner
          .event_loop
          .spawn(async move { closer.close_connection().await }),
      );
    }
  }

  /// Teardown ordering: wait for the transfer task, cancel outstanding
  /// pings, let a client wait for the server's TCP close, half-close when
  /// the transport supports it, then close and finally abort.
  async fn close_connection(self) -> Result<(), WebSocketError> {
    let transfer = self.inner.transfer_data_task.borrow().clone();
    if let Some(transfer) = transfer {
      let _ = transfer.promise().wait_done::<WebSocketError>().await;
    }

    let pending_pings: Vec<(Bytes, Promise<(), WebSocketError>)> =
      self.inner.pings.borrow_mut().drain(..).collect();
    for (_, waiter) in pending_pings {
      waiter.cancel();
    }

    if self.inner.is_client
      && self.inner.transfer_data_task.borrow().is_some()
      && self.wait_for_connection_lost().await
    {
      return Ok(());
    }

    let transport = self.inner.http.transport();
    if let Some(transport) = &transport {
      if transport.can_write_eof() {
        transport.write_eof();
        if self.wait_for_connection_lost().await {
          return Ok(());
        }
      }
    }

    if self.inner.connection_lost_waiter.is_done() && !self.inner.is_ssl {
      return Ok(());
    }
    if let Some(transport) = transport {
      transport.close();
      if self.wait_for_connection_lost().await {
        return Ok(());
      }
      transport.abort();
    }
    self.wait_for_connection_lost().await;
    Ok(())
  }

  /// Waits up to `close_timeout` for the transport to report loss.
  async fn wait_for_connection_lost(&self) -> bool {
    if !self.inner.connection_lost_waiter.is_done() {
      let signal: Promise<bool, WebSocketError> =
        self.inner.event_loop.promise();
      let on_lost = signal.clone();
      self
        .inner
        .connection_lost_waiter
        .add_done_callback(move |_| {
          on_lost.set_result_if_pending(true);
        });
      let on_timeout = signal.clone();
      let timer = self
        .inner
        .event_loop
        .call_later(self.inner.close_timeout, move |_| {
          on_timeout.set_result_if_pending(false);
        });
      let lost = signal.await.unwrap_or(false);
      timer.cancel();
      if lost {
        return true;
      }
    }
    // Re-check: the loss may have landed between the timeout firing and
    // this task resuming.
    self.inner.connection_lost_waiter.is_done()
  }
}

fn random_ping_payload() -> Bytes {
  let mut raw = [0u8; 4];
  rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut raw);
  Bytes::copy_from_slice(&raw)
}

fn decode_utf8_chunk(
  decoder: &mut encoding_rs::Decoder,
  input: &[u8],
  last: bool,
  output: &mut String,
) -> Result<(), WebSocketError> {
  output.reserve(
    decoder
      .max_utf8_buffer_length(input.len())
      .unwrap_or(input.len() + 4),
  );
  let (result, _read, had_errors) =
    decoder.decode_to_string(input, output, last);
  if had_errors || result != encoding_rs::CoderResult::InputEmpty {
    return Err(WebSocketError::Utf8);
  }
  Ok(())
}

impl Protocol for WebSocket {
  fn connection_made(&self, transport: Rc<dyn Transport>) {
    self.inner.http.connection_made(transport);
  }

  fn connection_lost(&self, error: Option<CoreError>) {
    self.inner.state.set(WsState::Closed);
    if self.inner.close_code.get() == 0 {
      self.inner.close_code.set(1006);
    }
    self.inner.connection_lost_waiter.set_result_if_pending(());
    self.inner.http.connection_lost(error);
  }

  fn data_received(&self, data: Bytes) {
    self.inner.http.data_received(data);
  }

  fn eof_received(&self) -> bool {
    self.inner.http.eof_received();
    // A TLS transport tears itself down; a plain one stays open so the
    // close handshake can finish writing.
    !self.inner.is_ssl
  }

  fn pause_writing(&self) {
    self.inner.http.pause_writing();
  }

  fn resume_writing(&self) {
    self.inner.http.resume_writing();
  }
}

#[cfg(test)]
mod tests {
  use cinder_core::sleep;
  use cinder_core::ExtraInfo;
  use pretty_assertions::assert_eq;

  use super::*;

  struct MockTransport {
    written: RefCell<Vec<u8>>,
    closed: Cell<bool>,
    aborted: Cell<bool>,
  }

  impl MockTransport {
    fn new() -> Rc<MockTransport> {
      Rc::new(MockTransport {
        written: RefCell::new(Vec::new()),
        closed: Cell::new(false),
        aborted: Cell::new(false),
      })
    }

    fn take_written(&self) -> Vec<u8> {
      std::mem::take(&mut *self.written.borrow_mut())
    }
  }

  impl Transport for MockTransport {
    fn write(&self, data: &[u8]) {
      self.written.borrow_mut().extend_from_slice(data);
    }

    fn close(&self) {
      self.closed.set(true);
    }

    fn abort(&self) {
      self.aborted.set(true);
    }

    fn is_closing(&self) -> bool {
      self.closed.get()
    }

    fn can_write_eof(&self) -> bool {
      false
    }

    fn write_eof(&self) {}

    fn set_protocol(&self, _protocol: Rc<dyn Protocol>) {}

    fn extra_info(&self) -> ExtraInfo {
      ExtraInfo::default()
    }
  }

  fn open_websocket(
    event_loop: &EventLoop,
    is_client: bool,
  ) -> (WebSocket, Rc<MockTransport>) {
    let http = HttpProtocol::new(event_loop);
    let websocket = WebSocket::new(
      event_loop,
      http,
      is_client,
      "example.com".to_string(),
      80,
      false,
      0.05,
      DEFAULT_MAX_SIZE,
      None,
    );
    let transport = MockTransport::new();
    websocket.connection_made(transport.clone());
    websocket.connection_open();
    (websocket, transport)
  }

  fn feed_frame(
    websocket: &WebSocket,
    frame: &WebSocketFrame,
    from_client: bool,
  ) {
    let wire = frame::encode_frame(frame, from_client);
    websocket.data_received(Bytes::from(wire));
  }

  #[test]
  fn fragmented_text_message_is_reassembled() {
    let event_loop = EventLoop::new().unwrap();
    // Client receives from the server: unmasked frames.
    let (websocket, _transport) = open_websocket(&event_loop, true);

    feed_frame(
      &websocket,
      &WebSocketFrame::new(false, OP_TEXT, Bytes::from_static(b"he")),
      false,
    );
    feed_frame(
      &websocket,
      &WebSocketFrame::new(true, OP_CONTINUOUS, Bytes::from_static(b"llo")),
      false,
    );

    let receiver = websocket.clone();
    let message = event_loop
      .run_until(async move { receiver.receive().await })
      .unwrap();
    assert_eq!(message, Message::Text("hello".to_string()));
  }

  #[test]
  fn utf8_split_across_fragments_survives() {
    let event_loop = EventLoop::new().unwrap();
    let (websocket, _transport) = open_websocket(&event_loop, true);

    // "é" is 0xC3 0xA9; split between the fragments.
    feed_frame(
      &websocket,
      &WebSocketFrame::new(false, OP_TEXT, Bytes::from_static(b"caf\xc3")),
      false,
    );
    feed_frame(
      &websocket,
      &WebSocketFrame::new(true, OP_CONTINUOUS, Bytes::from_static(b"\xa9")),
      false,
    );

    let receiver = websocket.clone();
    let message = event_loop
      .run_until(async move { receiver.receive().await })
      .unwrap();
    assert_eq!(message, Message::Text("café".to_string()));
  }

  #[test]
  fn ping_pong_resolves_fifo_up_to_match() {
    let event_loop = EventLoop::new().unwrap();
    // Server side: outgoing frames unmasked, incoming masked.
    let (websocket, _transport) = open_websocket(&event_loop, false);

    let lp = event_loop.clone();
    let ws = websocket.clone();
    event_loop
      .run_until(async move {
        let ping_a = {
          let ws = ws.clone();
          lp.spawn(async move {
            ws.ping(Some(Bytes::from_static(b"a"))).await
          })
        };
        let ping_b = {
          let ws = ws.clone();
          lp.spawn(async move {
            ws.ping(Some(Bytes::from_static(b"b"))).await
          })
        };
        let ping_c = {
          let ws = ws.clone();
          lp.spawn(async move {
            ws.ping(Some(Bytes::from_static(b"c"))).await
          })
        };
        sleep::<WebSocketError>(&lp, 0.01).await?;

        // A pong for "b" resolves "a" and "b", leaves "c" pending.
        feed_frame(
          &ws,
          &WebSocketFrame::new(true, OP_PONG, Bytes::from_static(b"b")),
          true,
        );
        sleep::<WebSocketError>(&lp, 0.02).await?;
        assert!(ping_a.is_done());
        assert!(ping_b.is_done());
        assert!(!ping_c.is_done());
        ping_a.take_result();
        ping_b.take_result();
        ping_c.cancel();
        Ok::<(), WebSocketError>(())
      })
      .unwrap();
  }

  #[test]
  fn incoming_ping_is_answered_with_matching_pong() {
    let event_loop = EventLoop::new().unwrap();
    let (websocket, transport) = open_websocket(&event_loop, false);

    let lp = event_loop.clone();
    let ws = websocket.clone();
    event_loop
      .run_until(async move {
        feed_frame(
          &ws,
          &WebSocketFrame::new(true, OP_PING, Bytes::from_static(b"tag")),
          true,
        );
        sleep::<WebSocketError>(&lp, 0.02).await?;
        Ok::<(), WebSocketError>(())
      })
      .unwrap();

    let written = transport.take_written();
    // Server to client pong: FIN + opcode 0xA, unmasked, 3-byte payload.
    assert_eq!(written[0], 0x8A);
    assert_eq!(written[1], 3);
    assert_eq!(&written[2..5], b"tag");
  }

  #[test]
  fn close_round_trip_wire_and_states() {
    let event_loop = EventLoop::new().unwrap();
    let (websocket, transport) = open_websocket(&event_loop, false);

    let lp = event_loop.clone();
    let ws = websocket.clone();
    let ws_for_echo = websocket.clone();
    event_loop
      .run_until(async move {
        let closer = ws.clone();
        let close_task = lp.spawn(async move {
          closer.close(1000, "bye").await
        });
        sleep::<WebSocketError>(&lp, 0.01).await?;

        // The close frame must be on the wire: opcode 0x8, code 1000.
        let written = transport.take_written();
        assert_eq!(written[0], 0x88);
        assert_eq!(written[1], 5);
        assert_eq!(&written[2..4], &[0x03, 0xE8]);
        assert_eq!(&written[4..7], b"bye");

        // Echo the close frame from the peer and drop the transport.
        feed_frame(
          &ws_for_echo,
          &WebSocketFrame::new(
            true,
            OP_CLOSE,
            Bytes::from_static(b"\x03\xe8bye"),
          ),
          true,
        );
        sleep::<WebSocketError>(&lp, 0.02).await?;
        ws_for_echo.connection_lost(None);

        close_task.await?;
        assert!(ws.is_closed());
        assert_eq!(ws.close_code(), 1000);
        assert_eq!(ws.close_reason().as_deref(), Some("bye"));

        match ws.receive().await {
          Err(WebSocketError::ConnectionClosed(closed)) => {
            assert_eq!(closed.code, 1000);
            assert_eq!(closed.reason.as_deref(), Some("bye"));
          }
          other => panic!("expected ConnectionClosed, got {other:?}"),
        }
        Ok::<(), WebSocketError>(())
      })
      .unwrap();
  }

  #[test]
  fn one_byte_close_frame_fails_with_1002() {
    let event_loop = EventLoop::new().unwrap();
    let (websocket, _transport) = open_websocket(&event_loop, false);

    let lp = event_loop.clone();
    let ws = websocket.clone();
    event_loop
      .run_until(async move {
        feed_frame(
          &ws,
          &WebSocketFrame::new(true, OP_CLOSE, Bytes::from_static(b"\x03")),
          true,
        );
        sleep::<WebSocketError>(&lp, 0.02).await?;
        match ws.receive().await {
          Err(WebSocketError::ConnectionClosed(closed)) => {
            assert_eq!(closed.code, 1002);
          }
          other => panic!("expected 1002 close, got {other:?}"),
        }
        Ok::<(), WebSocketError>(())
      })
      .unwrap();
  }

  #[test]
  fn closed_state_is_terminal() {
    let event_loop = EventLoop::new().unwrap();
    let (websocket, _transport) = open_websocket(&event_loop, false);
    websocket.connection_lost(None);
    assert!(websocket.is_closed());
    assert_eq!(websocket.close_code(), 1006);
    // A later loss report cannot resurrect or mutate the terminal state.
    websocket.connection_lost(None);
    assert!(websocket.is_closed());
    assert_eq!(websocket.close_code(), 1006);
  }

  #[test]
  fn oversized_message_fails_with_1009() {
    let event_loop = EventLoop::new().unwrap();
    let http = HttpProtocol::new(&event_loop);
    let websocket = WebSocket::new(
      &event_loop,
      http,
      false,
      "example.com".to_string(),
      80,
      false,
      0.05,
      8,
      None,
    );
    let transport = MockTransport::new();
    websocket.connection_made(transport);
    websocket.connection_open();

    let lp = event_loop.clone();
    let ws = websocket.clone();
    event_loop
      .run_until(async move {
        feed_frame(
          &ws,
          &WebSocketFrame::new(
            true,
            OP_BINARY,
            Bytes::from_static(b"way too long for the limit"),
          ),
          true,
        );
        sleep::<WebSocketError>(&lp, 0.02).await?;
        match ws.receive().await {
          Err(WebSocketError::ConnectionClosed(closed)) => {
            assert_eq!(closed.code, 1009);
          }
          other => panic!("expected 1009 close, got {other:?}"),
        }
        Ok::<(), WebSocketError>(())
      })
      .unwrap();
  }
}
