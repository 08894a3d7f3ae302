// Copyright 2026 the Cinder authors. MIT license.

//! The buffered read protocol and the HTTP message parser on top of it.
//!
//! Incoming chunks queue in a deque; a byte offset tracks how much of the
//! leading chunk is consumed so nothing is reallocated on the hot path.
//! Payload readers are async functions over this state: between chunks they
//! park on a data waiter completed by `data_received` / `eof_received`.
//! Exactly one payload reader may be active at a time.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;

use bytes::Bytes;
use bytes::BytesMut;
use cinder_core::CoreError;
use cinder_core::EventLoop;
use cinder_core::Promise;
use cinder_core::Protocol;
use cinder_core::Transport;
use memchr::memmem;

use crate::compression::ContentDecoder;
use crate::error::HttpError;
use crate::error::CONNECTION_ERROR_EOF_NO_HTTP_HEADER;
use crate::error::PAYLOAD_ERROR_EOF_AT_HTTP_HEADER;
use crate::headers::Headers;
use crate::message::HttpVersion;
use crate::message::RawRequestMessage;
use crate::message::RawResponseMessage;
use crate::names;

/// Longest accepted header or chunk-size line, CRLF excluded.
pub const MAX_LINE_LENGTH: usize = 8190;

/// Read-side buffering ceiling; above it the transport is asked to pause
/// reading until the readers catch up.
const READ_HIGH_WATER_MARK: usize = crate::writer::BIG_CHUNK_LIMIT * 4;
const READ_LOW_WATER_MARK: usize = crate::writer::BIG_CHUNK_LIMIT;

struct ProtocolState {
  transport: Option<Rc<dyn Transport>>,
  chunks: VecDeque<Bytes>,
  offset: usize,
  buffered: usize,
  at_eof: bool,
  exception: Option<HttpError>,
  data_waiter: Option<Promise<(), HttpError>>,
  payload_active: bool,
  drain_waiters: Vec<Promise<(), HttpError>>,
  writing_paused: bool,
  reading_paused: bool,
  connection_lost: bool,
}

/// HTTP read/write protocol handle. Cheap to clone; every clone shares the
/// same buffer and transport.
pub struct HttpProtocol {
  inner: Rc<RefCell<ProtocolState>>,
  event_loop: EventLoop,
}

impl Clone for HttpProtocol {
  fn clone(&self) -> Self {
    HttpProtocol {
      inner: self.inner.clone(),
      event_loop: self.event_loop.clone(),
    }
  }
}

impl HttpProtocol {
  pub fn new(event_loop: &EventLoop) -> HttpProtocol {
    HttpProtocol {
      inner: Rc::new(RefCell::new(ProtocolState {
        transport: None,
        chunks: VecDeque::new(),
        offset: 0,
        buffered: 0,
        at_eof: false,
        exception: None,
        data_waiter: None,
        payload_active: false,
        drain_waiters: Vec::new(),
        writing_paused: false,
        reading_paused: false,
        connection_lost: false,
      })),
      event_loop: event_loop.clone(),
    }
  }

  pub fn event_loop(&self) -> &EventLoop {
    &self.event_loop
  }

  /// Stable identity of the shared protocol state; clones of the same
  /// protocol compare equal. Used as a pool bookkeeping key.
  pub fn id(&self) -> usize {
    Rc::as_ptr(&self.inner) as *const () as usize
  }

  pub fn transport(&self) -> Option<Rc<dyn Transport>> {
    self.inner.borrow().transport.clone()
  }

  pub fn is_at_eof(&self) -> bool {
    self.inner.borrow().at_eof
  }

  pub fn is_connection_lost(&self) -> bool {
    self.inner.borrow().connection_lost
  }

  pub fn exception(&self) -> Option<HttpError> {
    self.inner.borrow().exception.clone()
  }

  /// Stores a failure and delivers it to the parked reader, if any.
  pub fn set_exception(&self, error: HttpError) {
    let waiter = {
      let mut state = self.inner.borrow_mut();
      if state.exception.is_none() {
        state.exception = Some(error.clone());
      }
      state.data_waiter.take()
    };
    if let Some(waiter) = waiter {
      waiter.set_error_if_pending(error);
    }
  }

  /// Whether this connection is unfit for reuse: a reader is mid-flight,
  /// a failure is stored, or unread bytes linger in the buffer.
  pub fn should_close(&self) -> bool {
    let state = self.inner.borrow();
    state.payload_active
      || state.exception.is_some()
      || (!state.at_eof && (state.offset != 0 || !state.chunks.is_empty()))
  }

  pub fn close_transport(&self, force: bool) {
    let transport = self.inner.borrow_mut().transport.take();
    if let Some(transport) = transport {
      if force {
        transport.abort();
      } else {
        transport.close();
      }
    }
  }

  // -- write half -----------------------------------------------------------

  pub fn write(&self, data: &[u8]) -> Result<(), HttpError> {
    let state = self.inner.borrow();
    match &state.transport {
      Some(transport) => {
        transport.write(data);
        Ok(())
      }
      None => Err(HttpError::Connection(
        "protocol has no attached transport".into(),
      )),
    }
  }

  /// Writes a request head: request line and headers in insertion order,
  /// closed by the empty line.
  pub fn write_http_request(
    &self,
    method: &str,
    path: &str,
    headers: &Headers,
    version: HttpVersion,
  ) -> Result<(), HttpError> {
    let mut out = String::with_capacity(128);
    out.push_str(method);
    out.push(' ');
    out.push_str(path);
    out.push(' ');
    out.push_str(&version.to_string());
    out.push_str("\r\n");
    for (name, value) in headers.iter() {
      out.push_str(name);
      out.push_str(": ");
      out.push_str(value);
      out.push_str("\r\n");
    }
    out.push_str("\r\n");
    self.write(out.as_bytes())
  }

  /// Writes a response head and an optional body.
  pub fn write_http_response(
    &self,
    status: u16,
    headers: &Headers,
    version: HttpVersion,
    body: Option<&[u8]>,
  ) -> Result<(), HttpError> {
    let mut out = String::with_capacity(128);
    out.push_str(&version.to_string());
    out.push(' ');
    out.push_str(&status.to_string());
    out.push(' ');
    out.push_str(crate::writer::status_phrase(status));
    out.push_str("\r\n");
    for (name, value) in headers.iter() {
      out.push_str(name);
      out.push_str(": ");
      out.push_str(value);
      out.push_str("\r\n");
    }
    out.push_str("\r\n");
    self.write(out.as_bytes())?;
    if let Some(body) = body {
      if !body.is_empty() {
        self.write(body)?;
      }
    }
    Ok(())
  }

  /// Parks until the transport's write buffer drains, when writing is
  /// currently paused by backpressure.
  pub async fn drain(&self) -> Result<(), HttpError> {
    let waiter = {
      let mut state = self.inner.borrow_mut();
      if !state.writing_paused {
        return Ok(());
      }
      let waiter: Promise<(), HttpError> = self.event_loop.promise();
      state.drain_waiters.push(waiter.clone());
      waiter
    };
    waiter.await
  }

  // -- read half ------------------------------------------------------------

  fn wait_for_data(&self) -> Promise<(), HttpError> {
    let mut state = self.inner.borrow_mut();
    let waiter: Promise<(), HttpError> = self.event_loop.promise();
    if let Some(error) = &state.exception {
      waiter.set_error(error.clone());
    } else if !state.chunks.is_empty() || state.at_eof {
      waiter.set_result(());
    } else {
      assert!(
        state.data_waiter.is_none(),
        "two readers are waiting on the same protocol"
      );
      state.data_waiter = Some(waiter.clone());
    }
    waiter
  }

  fn stored_error(&self) -> Option<HttpError> {
    self.inner.borrow().exception.clone()
  }

  fn consumed(&self, state: &mut ProtocolState, count: usize) {
    state.buffered -= count;
    if state.reading_paused && state.buffered <= READ_LOW_WATER_MARK {
      state.reading_paused = false;
      if let Some(transport) = state.transport.clone() {
        // Deferred: resuming synchronously would re-enter `data_received`
        // while the state is still borrowed.
        self.event_loop.call_soon(move |_| transport.resume_reading());
      }
    }
  }

  /// Takes up to `limit` bytes from the front of the buffer without
  /// waiting. `None` when the buffer is empty.
  fn pop_front_slice(&self, limit: usize) -> Option<Bytes> {
    let mut state = self.inner.borrow_mut();
    let piece = {
      let front = state.chunks.front()?;
      let available = front.len() - state.offset;
      if available > limit {
        front.slice(state.offset..state.offset + limit)
      } else {
        front.slice(state.offset..)
      }
    };
    if state.offset + piece.len()
      == state.chunks.front().map(Bytes::len).unwrap_or(0)
    {
      state.chunks.pop_front();
      state.offset = 0;
    } else {
      state.offset += piece.len();
    }
    self.consumed(&mut state, piece.len());
    Some(piece)
  }

  /// Reads exactly `n` bytes. EOF first is an [`HttpError::Eof`] carrying
  /// the bytes that did arrive. The single-chunk fast path hands back a
  /// zero-copy slice.
  pub async fn read_exactly(&self, n: usize) -> Result<Bytes, HttpError> {
    if n == 0 {
      return Ok(Bytes::new());
    }
    let mut collected: Option<BytesMut> = None;
    let mut needed = n;
    loop {
      if let Some(error) = self.stored_error() {
        return Err(error);
      }
      while needed > 0 {
        match self.pop_front_slice(needed) {
          Some(piece) => {
            needed -= piece.len();
            if collected.is_none() && needed == 0 {
              // The whole read fit in one chunk: zero-copy slice.
              return Ok(piece);
            }
            collected
              .get_or_insert_with(|| BytesMut::with_capacity(n))
              .extend_from_slice(&piece);
          }
          None => break,
        }
      }
      if needed == 0 {
        if let Some(buffer) = collected {
          return Ok(buffer.freeze());
        }
        return Ok(Bytes::new());
      }
      if self.inner.borrow().at_eof {
        let partial =
          collected.map(BytesMut::freeze).unwrap_or_else(Bytes::new);
        return Err(HttpError::Eof(partial));
      }
      self.wait_for_data().await?;
    }
  }

  /// Reads a line terminated by CRLF; the terminator is consumed but not
  /// returned. Lines longer than [`MAX_LINE_LENGTH`] are payload errors.
  pub async fn read_until_crlf(&self) -> Result<Bytes, HttpError> {
    let mut collected: Vec<u8> = Vec::new();
    let mut pending_cr = false;
    loop {
      if let Some(error) = self.stored_error() {
        return Err(error);
      }
      loop {
        let data = {
          let state = self.inner.borrow();
          match state.chunks.front() {
            Some(front) => front.slice(state.offset..),
            None => break,
          }
        };
        if pending_cr {
          if data[0] == b'\n' {
            self.advance(1);
            return Ok(Bytes::from(collected));
          }
          // The held CR belonged to the line after all.
          collected.push(b'\r');
          pending_cr = false;
        }
        match memmem::find(&data, b"\r\n") {
          Some(position) => {
            collected.extend_from_slice(&data[..position]);
            self.advance(position + 2);
            if collected.len() > MAX_LINE_LENGTH {
              return Err(HttpError::payload(format!(
                "line exceeds the maximum length of {MAX_LINE_LENGTH}"
              )));
            }
            return Ok(Bytes::from(collected));
          }
          None => {
            if data.last() == Some(&b'\r') {
              collected.extend_from_slice(&data[..data.len() - 1]);
              pending_cr = true;
            } else {
              collected.extend_from_slice(&data);
            }
            self.advance(data.len());
            if collected.len() > MAX_LINE_LENGTH {
              return Err(HttpError::payload(format!(
                "line exceeds the maximum length of {MAX_LINE_LENGTH}"
              )));
            }
          }
        }
      }
      if self.inner.borrow().at_eof {
        if pending_cr {
          collected.push(b'\r');
        }
        return Err(HttpError::Eof(Bytes::from(collected)));
      }
      self.wait_for_data().await?;
    }
  }

  /// Consumes and drops `count` bytes from the front of the buffer.
  fn advance(&self, count: usize) {
    let mut state = self.inner.borrow_mut();
    let mut remaining = count;
    while remaining > 0 {
      let front_len = match state.chunks.front() {
        Some(front) => front.len(),
        None => break,
      };
      let available = front_len - state.offset;
      if available > remaining {
        state.offset += remaining;
        remaining = 0;
      } else {
        state.chunks.pop_front();
        state.offset = 0;
        remaining -= available;
      }
    }
    self.consumed(&mut state, count - remaining);
  }

  /// Reads until `separator`, consuming it; returns the bytes before it.
  pub async fn read_until(
    &self,
    separator: &[u8],
  ) -> Result<Bytes, HttpError> {
    assert!(!separator.is_empty(), "empty separator");
    let mut collected: Vec<u8> = Vec::new();
    let mut searched = 0usize;
    loop {
      if let Some(error) = self.stored_error() {
        return Err(error);
      }
      // Move everything buffered into the scan window.
      loop {
        match self.pop_front_slice(usize::MAX) {
          Some(piece) => collected.extend_from_slice(&piece),
          None => break,
        }
      }
      if let Some(position) = memmem::find(&collected[searched..], separator)
      {
        let absolute = searched + position;
        let leftover = collected.split_off(absolute + separator.len());
        collected.truncate(absolute);
        if !leftover.is_empty() {
          let mut state = self.inner.borrow_mut();
          state.buffered += leftover.len();
          state.chunks.push_front(Bytes::from(leftover));
          debug_assert_eq!(state.offset, 0);
        }
        return Ok(Bytes::from(collected));
      }
      searched = collected.len().saturating_sub(separator.len() - 1);
      if self.inner.borrow().at_eof {
        return Err(HttpError::Eof(Bytes::from(collected)));
      }
      self.wait_for_data().await?;
    }
  }

  /// Collects everything until EOF.
  pub async fn read_until_eof(&self) -> Result<Bytes, HttpError> {
    let mut collected = BytesMut::new();
    loop {
      if let Some(error) = self.stored_error() {
        return Err(error);
      }
      loop {
        match self.pop_front_slice(usize::MAX) {
          Some(piece) => collected.extend_from_slice(&piece),
          None => break,
        }
      }
      if self.inner.borrow().at_eof {
        return Ok(collected.freeze());
      }
      self.wait_for_data().await?;
    }
  }

  /// Installs `reader` as the active payload reader, running it as a task;
  /// the returned promise resolves with the reader's result. Cancelling or
  /// abandoning the promise does not stop the reader.
  ///
  /// Installing a second reader while one is active is a programming
  /// error.
  pub fn set_payload_reader<T: 'static>(
    &self,
    reader: impl Future<Output = Result<T, HttpError>> + 'static,
  ) -> Promise<T, HttpError> {
    {
      let mut state = self.inner.borrow_mut();
      assert!(!state.payload_active, "a payload reader is already active");
      state.payload_active = true;
    }
    let waiter: Promise<T, HttpError> = self.event_loop.promise();
    let completion = waiter.clone();
    let protocol = self.clone();
    self.event_loop.spawn::<(), HttpError, _>(async move {
      let result = reader.await;
      protocol.inner.borrow_mut().payload_active = false;
      completion.complete_if_pending(result);
      Ok(())
    });
    waiter
  }

  // -- HTTP parsing ---------------------------------------------------------

  /// Tries to parse one full `...\r\n` line out of the current chunk
  /// without copying. `None` when the chunk does not cover the line.
  fn try_parse_line_in_chunk<T>(
    &self,
    parse: impl Fn(&[u8]) -> Option<T>,
  ) -> Option<T> {
    let (parsed, consume) = {
      let state = self.inner.borrow();
      let front = state.chunks.front()?;
      let data = &front[state.offset..];
      let position = memmem::find(data, b"\r\n")?;
      (parse(&data[..position])?, position + 2)
    };
    self.advance(consume);
    Some(parsed)
  }

  /// Reads a response head: status line plus headers.
  pub async fn read_http_response(
    &self,
  ) -> Result<RawResponseMessage, HttpError> {
    // EOF before the very first byte is a connection error, not a payload
    // error: nothing of the message existed yet.
    if self.inner.borrow().chunks.is_empty() {
      match self.wait_for_data().await {
        Ok(()) => {
          let state = self.inner.borrow();
          if state.chunks.is_empty() && state.at_eof {
            return Err(HttpError::Connection(
              CONNECTION_ERROR_EOF_NO_HTTP_HEADER.into(),
            ));
          }
        }
        Err(error) => return Err(error),
      }
    }

    let fast = self.try_parse_line_in_chunk(parse_status_line);
    let (version, status, reason) = match fast {
      Some(parsed) => parsed,
      None => {
        let line = self.read_until_crlf().await.map_err(header_eof)?;
        match parse_status_line(&line) {
          Some(parsed) => parsed,
          None => {
            return Err(HttpError::payload(format!(
              "invalid status line: {:?}",
              String::from_utf8_lossy(&line)
            )));
          }
        }
      }
    };
    let headers = self.read_http_headers().await?;
    Ok(RawResponseMessage::new(version, status, reason, headers))
  }

  /// Reads a request head: request line plus headers.
  pub async fn read_http_request(
    &self,
  ) -> Result<RawRequestMessage, HttpError> {
    if self.inner.borrow().chunks.is_empty() {
      self.wait_for_data().await?;
      let state = self.inner.borrow();
      if state.chunks.is_empty() && state.at_eof {
        return Err(HttpError::Connection(
          CONNECTION_ERROR_EOF_NO_HTTP_HEADER.into(),
        ));
      }
    }

    let fast = self.try_parse_line_in_chunk(parse_request_line);
    let (method, path, version) = match fast {
      Some(parsed) => parsed,
      None => {
        let line = self.read_until_crlf().await.map_err(header_eof)?;
        match parse_request_line(&line) {
          Some(parsed) => parsed,
          None => {
            return Err(HttpError::payload(format!(
              "invalid request line: {:?}",
              String::from_utf8_lossy(&line)
            )));
          }
        }
      }
    };
    let headers = self.read_http_headers().await?;
    Ok(RawRequestMessage::new(version, method, path, headers))
  }

  /// Reads header lines until the empty line, folding SP/TAB continuation
  /// lines into the previous value.
  pub async fn read_http_headers(&self) -> Result<Headers, HttpError> {
    let mut headers = Headers::new();
    let mut have_header = false;
    loop {
      let line = self.read_until_crlf().await.map_err(header_eof)?;
      if line.is_empty() {
        return Ok(headers);
      }
      if line[0] == b' ' || line[0] == b'\t' {
        if !have_header {
          return Err(HttpError::payload(
            "continuation line before any header",
          ));
        }
        let extra = trim_ascii(&line);
        if !extra.is_empty() {
          headers.extend_last_value(&decode_header_text(extra));
        }
        continue;
      }
      let colon = match memchr::memchr(b':', &line) {
        Some(0) | None => {
          return Err(HttpError::payload(format!(
            "invalid header line: {:?}",
            String::from_utf8_lossy(&line)
          )));
        }
        Some(colon) => colon,
      };
      let name = trim_ascii(&line[..colon]);
      let value = trim_ascii(&line[colon + 1..]);
      headers.append(decode_header_text(name), decode_header_text(value));
      have_header = true;
    }
  }

  // -- body readers ---------------------------------------------------------

  fn exactly_reader(
    &self,
    length: usize,
    mut decoder: Option<ContentDecoder>,
  ) -> impl Future<Output = Result<Bytes, HttpError>> + 'static {
    let protocol = self.clone();
    async move {
      let raw = protocol.read_exactly(length).await?;
      match decoder.as_mut() {
        Some(decoder) => {
          let mut body = decoder.decompress(&raw)?;
          body.extend(decoder.finish()?);
          Ok(Bytes::from(body))
        }
        None => Ok(raw),
      }
    }
  }

  fn chunked_reader(
    &self,
    mut decoder: Option<ContentDecoder>,
  ) -> impl Future<Output = Result<Bytes, HttpError>> + 'static {
    let protocol = self.clone();
    async move {
      let mut collected = BytesMut::new();
      loop {
        let size_line = protocol.read_until_crlf().await?;
        // Chunk extensions are tolerated and dropped.
        let size_text = match memchr::memchr(b';', &size_line) {
          Some(position) => &size_line[..position],
          None => &size_line[..],
        };
        let size_text = trim_ascii(size_text);
        let size = parse_hex(size_text).ok_or_else(|| {
          HttpError::payload(format!(
            "not a hexadecimal chunk size: {:?}",
            String::from_utf8_lossy(size_text)
          ))
        })?;
        if size == 0 {
          let terminator = protocol.read_exactly(2).await?;
          if &terminator[..] != b"\r\n" {
            return Err(HttpError::payload(
              "chunked terminator does not end with CRLF",
            ));
          }
          break;
        }
        let chunk = protocol.read_exactly(size).await?;
        let terminator = protocol.read_exactly(2).await?;
        if &terminator[..] != b"\r\n" {
          return Err(HttpError::payload("chunk does not end with CRLF"));
        }
        match decoder.as_mut() {
          Some(decoder) => {
            collected.extend_from_slice(&decoder.decompress(&chunk)?);
          }
          None => collected.extend_from_slice(&chunk),
        }
      }
      if let Some(decoder) = decoder.as_mut() {
        collected.extend_from_slice(&decoder.finish()?);
      }
      Ok(collected.freeze())
    }
  }

  fn until_eof_reader(
    &self,
  ) -> impl Future<Output = Result<Bytes, HttpError>> + 'static {
    let protocol = self.clone();
    async move { protocol.read_until_eof().await }
  }

  /// Selects and installs the body reader for a response head, following
  /// the framing headers. `None` means the message has no body (or the
  /// connection was upgraded and the bytes now belong to someone else).
  pub fn install_response_body_reader(
    &self,
    message: &RawResponseMessage,
  ) -> Result<Option<Promise<Bytes, HttpError>>, HttpError> {
    let length = content_length(&message.headers)?;
    if !message.upgraded() {
      if message.status == 204 {
        return Ok(None);
      }
      if message.chunked() {
        let decoder =
          ContentDecoder::for_encoding(message.encoding().as_deref())?;
        return Ok(Some(self.set_payload_reader(self.chunked_reader(decoder))));
      }
      if let Some(length) = length {
        if length > 0 {
          let decoder =
            ContentDecoder::for_encoding(message.encoding().as_deref())?;
          return Ok(Some(
            self.set_payload_reader(self.exactly_reader(length, decoder)),
          ));
        }
        return Ok(None);
      }
      if message.status >= 200 {
        return Ok(Some(self.set_payload_reader(self.until_eof_reader())));
      }
    }
    Ok(None)
  }

  /// Body reader selection for a request head. A CONNECT request upgrades
  /// the connection and consumes the rest of the stream.
  pub fn install_request_body_reader(
    &self,
    message: &RawRequestMessage,
  ) -> Result<Option<Promise<Bytes, HttpError>>, HttpError> {
    let length = content_length(&message.headers)?;
    if !message.upgraded() {
      if message.chunked() {
        let decoder =
          ContentDecoder::for_encoding(message.encoding().as_deref())?;
        return Ok(Some(self.set_payload_reader(self.chunked_reader(decoder))));
      }
      if let Some(length) = length {
        if length > 0 {
          let decoder =
            ContentDecoder::for_encoding(message.encoding().as_deref())?;
          return Ok(Some(
            self.set_payload_reader(self.exactly_reader(length, decoder)),
          ));
        }
        return Ok(None);
      }
    }
    if message.method == names::METHOD_CONNECT {
      message.set_upgraded(true);
      return Ok(Some(self.set_payload_reader(self.until_eof_reader())));
    }
    Ok(None)
  }
}

fn header_eof(error: HttpError) -> HttpError {
  match error {
    HttpError::Eof(_) => {
      HttpError::payload(PAYLOAD_ERROR_EOF_AT_HTTP_HEADER)
    }
    other => other,
  }
}

fn trim_ascii(data: &[u8]) -> &[u8] {
  let start = data
    .iter()
    .position(|byte| !byte.is_ascii_whitespace())
    .unwrap_or(data.len());
  let end = data
    .iter()
    .rposition(|byte| !byte.is_ascii_whitespace())
    .map(|index| index + 1)
    .unwrap_or(start);
  &data[start..end]
}

fn decode_header_text(data: &[u8]) -> String {
  String::from_utf8_lossy(data).into_owned()
}

fn parse_hex(text: &[u8]) -> Option<usize> {
  if text.is_empty() {
    return None;
  }
  let text = std::str::from_utf8(text).ok()?;
  usize::from_str_radix(text, 16).ok()
}

pub(crate) fn content_length(
  headers: &Headers,
) -> Result<Option<usize>, HttpError> {
  match headers.get(names::CONTENT_LENGTH) {
    None => Ok(None),
    Some(value) => {
      let trimmed = value.trim();
      if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HttpError::payload(format!(
          "Content-Length must be a non-negative integer, got {value:?}"
        )));
      }
      trimmed.parse::<usize>().map(Some).map_err(|_| {
        HttpError::payload(format!("Content-Length out of range: {value:?}"))
      })
    }
  }
}

/// `HTTP/<d>.<d> <3-digit status> <reason?>`
fn parse_status_line(
  line: &[u8],
) -> Option<(HttpVersion, u16, Option<String>)> {
  let rest = line.strip_prefix(b"HTTP/")?;
  if rest.len() < 3 || rest[1] != b'.' {
    return None;
  }
  let major = (rest[0] as char).to_digit(10)? as u8;
  let minor = (rest[2] as char).to_digit(10)? as u8;
  let rest = &rest[3..];
  let rest = rest.strip_prefix(b" ")?;
  if rest.len() < 3 {
    return None;
  }
  let (status_text, reason_text) = rest.split_at(3);
  if !status_text.iter().all(u8::is_ascii_digit) {
    return None;
  }
  let status = std::str::from_utf8(status_text).ok()?.parse::<u16>().ok()?;
  let reason = match reason_text.strip_prefix(b" ") {
    Some(reason) => Some(String::from_utf8_lossy(reason).into_owned()),
    None if reason_text.is_empty() => None,
    None => return None,
  };
  Some((HttpVersion { major, minor }, status, reason))
}

/// `<method> <path> HTTP/<d>.<d>`
fn parse_request_line(
  line: &[u8],
) -> Option<(String, String, HttpVersion)> {
  let first_space = memchr::memchr(b' ', line)?;
  let method = &line[..first_space];
  let rest = &line[first_space + 1..];
  let second_space = memchr::memchr(b' ', rest)?;
  let path = &rest[..second_space];
  let version = &rest[second_space + 1..];
  if method.is_empty() || path.is_empty() {
    return None;
  }
  let version = version.strip_prefix(b"HTTP/")?;
  if version.len() != 3 || version[1] != b'.' {
    return None;
  }
  let major = (version[0] as char).to_digit(10)? as u8;
  let minor = (version[2] as char).to_digit(10)? as u8;
  Some((
    String::from_utf8_lossy(method).to_ascii_uppercase(),
    String::from_utf8_lossy(path).into_owned(),
    HttpVersion { major, minor },
  ))
}

impl Protocol for HttpProtocol {
  fn connection_made(&self, transport: Rc<dyn Transport>) {
    self.inner.borrow_mut().transport = Some(transport);
  }

  fn connection_lost(&self, error: Option<CoreError>) {
    let (data_waiter, drain_waiters, mapped) = {
      let mut state = self.inner.borrow_mut();
      state.connection_lost = true;
      state.at_eof = true;
      state.transport = None;
      let mapped = error.map(|error| {
        let mapped = HttpError::Connection(error.to_string());
        if state.exception.is_none() {
          state.exception = Some(mapped.clone());
        }
        mapped
      });
      (
        state.data_waiter.take(),
        std::mem::take(&mut state.drain_waiters),
        mapped,
      )
    };
    if let Some(waiter) = data_waiter {
      match &mapped {
        Some(error) => {
          waiter.set_error_if_pending(error.clone());
        }
        None => {
          waiter.set_result_if_pending(());
        }
      }
    }
    for waiter in drain_waiters {
      match &mapped {
        Some(error) => {
          waiter.set_error_if_pending(error.clone());
        }
        None => {
          waiter.set_result_if_pending(());
        }
      }
    }
  }

  fn data_received(&self, data: Bytes) {
    if data.is_empty() {
      return;
    }
    log::trace!("http protocol buffered {} bytes", data.len());
    let waiter = {
      let mut state = self.inner.borrow_mut();
      state.buffered += data.len();
      state.chunks.push_back(data);
      if !state.reading_paused && state.buffered > READ_HIGH_WATER_MARK {
        state.reading_paused = true;
        if let Some(transport) = &state.transport {
          transport.pause_reading();
        }
      }
      state.data_waiter.take()
    };
    if let Some(waiter) = waiter {
      waiter.set_result_if_pending(());
    }
  }

  fn eof_received(&self) -> bool {
    let waiter = {
      let mut state = self.inner.borrow_mut();
      state.at_eof = true;
      state.data_waiter.take()
    };
    if let Some(waiter) = waiter {
      waiter.set_result_if_pending(());
    }
    false
  }

  fn pause_writing(&self) {
    self.inner.borrow_mut().writing_paused = true;
  }

  fn resume_writing(&self) {
    let waiters = {
      let mut state = self.inner.borrow_mut();
      state.writing_paused = false;
      std::mem::take(&mut state.drain_waiters)
    };
    for waiter in waiters {
      waiter.set_result_if_pending(());
    }
  }
}

#[cfg(test)]
mod tests {
  use cinder_core::EventLoop;
  use pretty_assertions::assert_eq;

  use super::*;

  fn feed(protocol: &HttpProtocol, data: &[u8]) {
    protocol.data_received(Bytes::copy_from_slice(data));
  }

  fn feed_split(protocol: &HttpProtocol, data: &[u8], piece: usize) {
    for chunk in data.chunks(piece.max(1)) {
      feed(protocol, chunk);
    }
  }

  const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
X-Folded: first\r\n\
 second\r\n\
Content-Length: 5\r\n\
\r\n\
hello";

  #[test]
  fn parse_is_split_invariant() {
    for piece in [1, 2, 3, 7, RESPONSE.len()] {
      let event_loop = EventLoop::new().unwrap();
      let protocol = HttpProtocol::new(&event_loop);
      feed_split(&protocol, RESPONSE, piece);
      protocol.eof_received();

      let reader = protocol.clone();
      let message = event_loop
        .run_until(async move { reader.read_http_response().await })
        .unwrap();
      assert_eq!(message.status, 200);
      assert_eq!(message.version, HttpVersion::V11);
      assert_eq!(message.reason.as_deref(), Some("OK"));
      assert_eq!(message.headers.get("content-type"), Some("text/plain"));
      assert_eq!(message.headers.get("x-folded"), Some("first second"));

      let body_reader = protocol.clone();
      let body = event_loop
        .run_until(async move { body_reader.read_exactly(5).await })
        .unwrap();
      assert_eq!(&body[..], b"hello");
    }
  }

  #[test]
  fn chunked_body_round_trip() {
    let event_loop = EventLoop::new().unwrap();
    let protocol = HttpProtocol::new(&event_loop);
    feed(
      &protocol,
      b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    );

    let reader = protocol.clone();
    let body = event_loop
      .run_until(async move {
        let message = reader.read_http_response().await?;
        assert!(message.chunked());
        let waiter = reader.install_response_body_reader(&message)?;
        waiter.expect("chunked response must have a body reader").await
      })
      .unwrap();
    assert_eq!(&body[..], b"hello world");
  }

  #[test]
  fn chunked_with_non_hex_size_is_payload_error() {
    let event_loop = EventLoop::new().unwrap();
    let protocol = HttpProtocol::new(&event_loop);
    feed(&protocol, b"zz\r\ndata\r\n");

    let reader = protocol.clone();
    let result = event_loop.run_until(async move {
      reader
        .set_payload_reader(reader.chunked_reader(None))
        .await
    });
    assert!(matches!(result, Err(HttpError::Payload(_))));
  }

  #[test]
  fn chunk_without_crlf_is_payload_error() {
    let event_loop = EventLoop::new().unwrap();
    let protocol = HttpProtocol::new(&event_loop);
    feed(&protocol, b"5\r\nhelloXX0\r\n\r\n");

    let reader = protocol.clone();
    let result = event_loop.run_until(async move {
      reader
        .set_payload_reader(reader.chunked_reader(None))
        .await
    });
    assert!(matches!(result, Err(HttpError::Payload(_))));
  }

  #[test]
  fn read_exactly_eof_carries_partial() {
    let event_loop = EventLoop::new().unwrap();
    let protocol = HttpProtocol::new(&event_loop);
    feed(&protocol, b"abc");
    protocol.eof_received();

    let reader = protocol.clone();
    let result =
      event_loop.run_until(async move { reader.read_exactly(10).await });
    match result {
      Err(HttpError::Eof(partial)) => assert_eq!(&partial[..], b"abc"),
      other => panic!("expected EOF error, got {other:?}"),
    }
  }

  #[test]
  fn status_line_without_reason() {
    assert_eq!(
      parse_status_line(b"HTTP/1.0 204"),
      Some((HttpVersion::V10, 204, None))
    );
    assert_eq!(parse_status_line(b"HTTP/1.1 abc"), None);
    assert_eq!(parse_status_line(b"FTP/1.1 200 OK"), None);
  }

  #[test]
  fn request_line_parses_and_uppercases_method() {
    let (method, path, version) =
      parse_request_line(b"get /a/b?x=1 HTTP/1.1").unwrap();
    assert_eq!(method, "GET");
    assert_eq!(path, "/a/b?x=1");
    assert_eq!(version, HttpVersion::V11);
  }

  #[test]
  fn header_line_without_colon_is_payload_error() {
    let event_loop = EventLoop::new().unwrap();
    let protocol = HttpProtocol::new(&event_loop);
    feed(&protocol, b"HTTP/1.1 200 OK\r\nbroken header\r\n\r\n");

    let reader = protocol.clone();
    let result = event_loop
      .run_until(async move { reader.read_http_response().await });
    assert!(matches!(result, Err(HttpError::Payload(_))));
  }

  #[test]
  fn eof_before_any_data_is_connection_error() {
    let event_loop = EventLoop::new().unwrap();
    let protocol = HttpProtocol::new(&event_loop);
    protocol.eof_received();

    let reader = protocol.clone();
    let result = event_loop
      .run_until(async move { reader.read_http_response().await });
    assert!(matches!(result, Err(HttpError::Connection(_))));
  }

  #[test]
  fn eof_inside_headers_is_payload_error() {
    let event_loop = EventLoop::new().unwrap();
    let protocol = HttpProtocol::new(&event_loop);
    feed(&protocol, b"HTTP/1.1 200 OK\r\nContent-Ty");
    protocol.eof_received();

    let reader = protocol.clone();
    let result = event_loop
      .run_until(async move { reader.read_http_response().await });
    assert!(matches!(result, Err(HttpError::Payload(_))));
  }

  #[test]
  fn read_until_pushes_back_the_tail() {
    let event_loop = EventLoop::new().unwrap();
    let protocol = HttpProtocol::new(&event_loop);
    feed(&protocol, b"alpha--SEP--beta");

    let reader = protocol.clone();
    let (before, after) = event_loop
      .run_until(async move {
        let before = reader.read_until(b"--SEP--").await?;
        let after = reader.read_exactly(4).await?;
        Ok::<_, HttpError>((before, after))
      })
      .unwrap();
    assert_eq!(&before[..], b"alpha");
    assert_eq!(&after[..], b"beta");
  }

  struct CaptureTransport {
    written: RefCell<Vec<u8>>,
  }

  impl cinder_core::Transport for CaptureTransport {
    fn write(&self, data: &[u8]) {
      self.written.borrow_mut().extend_from_slice(data);
    }

    fn close(&self) {}

    fn abort(&self) {}

    fn is_closing(&self) -> bool {
      false
    }

    fn can_write_eof(&self) -> bool {
      false
    }

    fn write_eof(&self) {}

    fn set_protocol(&self, _protocol: Rc<dyn Protocol>) {}

    fn extra_info(&self) -> cinder_core::ExtraInfo {
      cinder_core::ExtraInfo::default()
    }
  }

  #[test]
  fn request_write_parse_round_trip() {
    let event_loop = EventLoop::new().unwrap();
    let writer_protocol = HttpProtocol::new(&event_loop);
    let capture = Rc::new(CaptureTransport {
      written: RefCell::new(Vec::new()),
    });
    writer_protocol.connection_made(capture.clone());

    let mut headers = Headers::new();
    headers.append("Host", "example.com");
    headers.append("Accept", "*/*");
    headers.append("Accept", "text/plain");
    writer_protocol
      .write_http_request("POST", "/submit?x=1", &headers, HttpVersion::V11)
      .unwrap();
    let body = b"request body";
    writer_protocol.write(body).unwrap();

    let reader_protocol = HttpProtocol::new(&event_loop);
    reader_protocol
      .data_received(Bytes::from(capture.written.borrow().clone()));
    reader_protocol.eof_received();

    let reader = reader_protocol.clone();
    let (message, parsed_body) = event_loop
      .run_until(async move {
        let message = reader.read_http_request().await?;
        let body = reader.read_until_eof().await?;
        Ok::<_, HttpError>((message, body))
      })
      .unwrap();
    assert_eq!(message.method, "POST");
    assert_eq!(message.path, "/submit?x=1");
    assert_eq!(message.version, HttpVersion::V11);
    assert_eq!(message.headers.get("host"), Some("example.com"));
    assert_eq!(
      message.headers.get_all("accept"),
      vec!["*/*", "text/plain"]
    );
    assert_eq!(&parsed_body[..], body);
  }

  #[test]
  fn response_204_has_no_body_reader() {
    let event_loop = EventLoop::new().unwrap();
    let protocol = HttpProtocol::new(&event_loop);
    feed(&protocol, b"HTTP/1.1 204 No Content\r\n\r\n");

    let reader = protocol.clone();
    let has_reader = event_loop
      .run_until(async move {
        let message = reader.read_http_response().await?;
        Ok::<_, HttpError>(
          reader.install_response_body_reader(&message)?.is_some(),
        )
      })
      .unwrap();
    assert!(!has_reader);
  }

  #[test]
  fn response_without_length_reads_until_eof() {
    let event_loop = EventLoop::new().unwrap();
    let protocol = HttpProtocol::new(&event_loop);
    feed(&protocol, b"HTTP/1.0 200 OK\r\n\r\nabcdef");

    let reader = protocol.clone();
    let eof_protocol = protocol.clone();
    let body = event_loop
      .run_until(async move {
        let message = reader.read_http_response().await?;
        let waiter = reader
          .install_response_body_reader(&message)?
          .expect("till-eof response must have a body reader");
        eof_protocol.eof_received();
        waiter.await
      })
      .unwrap();
    assert_eq!(&body[..], b"abcdef");
    assert!(!protocol.should_close());
  }
}
