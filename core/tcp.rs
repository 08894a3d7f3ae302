// Copyright 2026 the Cinder authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::rc::Rc;
use std::rc::Weak;

use bytes::Bytes;
use mio::Interest;

use crate::error::CoreError;
use crate::event_loop::EventLoop;
use crate::future::Promise;
use crate::transport::ExtraInfo;
use crate::transport::Protocol;
use crate::transport::Transport;

const READ_BUFFER_SIZE: usize = 16 * 1024;
const HIGH_WATER_MARK: usize = 64 * 1024;
const LOW_WATER_MARK: usize = 16 * 1024;

/// A non-blocking TCP transport driven by the loop's selector. The selector
/// is edge-triggered, so reads and writes always run to `WouldBlock`.
pub struct TcpTransport {
  event_loop: EventLoop,
  this: RefCell<Weak<TcpTransport>>,
  stream: RefCell<mio::net::TcpStream>,
  token: Cell<usize>,
  protocol: RefCell<Option<Rc<dyn Protocol>>>,
  write_buffer: RefCell<VecDeque<Bytes>>,
  buffered: Cell<usize>,
  connect_waiter: RefCell<Option<Promise<Rc<TcpTransport>, CoreError>>>,
  closing: Cell<bool>,
  closed: Cell<bool>,
  eof_pending: Cell<bool>,
  eof_written: Cell<bool>,
  protocol_paused: Cell<bool>,
  reading_paused: Cell<bool>,
  peer_addr: RefCell<Option<SocketAddr>>,
  local_addr: RefCell<Option<SocketAddr>>,
}

impl TcpTransport {
  fn register(
    event_loop: &EventLoop,
    stream: mio::net::TcpStream,
    connecting: bool,
  ) -> io::Result<Rc<TcpTransport>> {
    let transport = Rc::new(TcpTransport {
      event_loop: event_loop.clone(),
      this: RefCell::new(Weak::new()),
      stream: RefCell::new(stream),
      token: Cell::new(usize::MAX),
      protocol: RefCell::new(None),
      write_buffer: RefCell::new(VecDeque::new()),
      buffered: Cell::new(0),
      connect_waiter: RefCell::new(None),
      closing: Cell::new(false),
      closed: Cell::new(false),
      eof_pending: Cell::new(false),
      eof_written: Cell::new(false),
      protocol_paused: Cell::new(false),
      reading_paused: Cell::new(false),
      peer_addr: RefCell::new(None),
      local_addr: RefCell::new(None),
    });
    *transport.this.borrow_mut() = Rc::downgrade(&transport);

    let token = {
      let mut stream = transport.stream.borrow_mut();
      event_loop
        .register_io(&mut *stream, Interest::READABLE | Interest::WRITABLE)?
    };
    transport.token.set(token);

    if !connecting {
      transport.cache_addresses();
    }

    let read_weak: Weak<TcpTransport> = Rc::downgrade(&transport);
    let write_weak: Weak<TcpTransport> = Rc::downgrade(&transport);
    event_loop.set_io_callbacks(
      token,
      Some(Rc::new(move |_| {
        if let Some(transport) = read_weak.upgrade() {
          transport.on_readable();
        }
      })),
      Some(Rc::new(move |_| {
        if let Some(transport) = write_weak.upgrade() {
          transport.on_writable();
        }
      })),
    );
    Ok(transport)
  }

  /// Starts a non-blocking connect; the promise resolves with the
  /// connected transport, with no protocol attached yet.
  pub fn connect(
    event_loop: &EventLoop,
    address: SocketAddr,
  ) -> Promise<Rc<TcpTransport>, CoreError> {
    let waiter: Promise<Rc<TcpTransport>, CoreError> = event_loop.promise();
    let stream = match mio::net::TcpStream::connect(address) {
      Ok(stream) => stream,
      Err(error) => {
        waiter.set_error(error.into());
        return waiter;
      }
    };
    match TcpTransport::register(event_loop, stream, true) {
      Ok(transport) => {
        *transport.connect_waiter.borrow_mut() = Some(waiter.clone());
        // The done-callback keeps the transport alive until the connect
        // resolves; afterwards the caller owns the strong reference.
        let keep_alive = transport.clone();
        waiter.add_done_callback(move |_| drop(keep_alive));
      }
      Err(error) => waiter.set_error(error.into()),
    }
    waiter
  }

  /// Wraps an already-connected stream, e.g. one produced by `accept`.
  pub fn from_stream(
    event_loop: &EventLoop,
    stream: mio::net::TcpStream,
  ) -> io::Result<Rc<TcpTransport>> {
    TcpTransport::register(event_loop, stream, false)
  }

  fn cache_addresses(&self) {
    let stream = self.stream.borrow();
    *self.peer_addr.borrow_mut() = stream.peer_addr().ok();
    *self.local_addr.borrow_mut() = stream.local_addr().ok();
  }

  /// Attaches the protocol and kicks the first read. Part of every
  /// connection setup; also used when a connection changes hands.
  pub fn attach(this: &Rc<TcpTransport>, protocol: Rc<dyn Protocol>) {
    *this.protocol.borrow_mut() = Some(protocol.clone());
    protocol.connection_made(this.clone() as Rc<dyn Transport>);
    let weak = Rc::downgrade(this);
    this.event_loop.call_soon(move |_| {
      if let Some(transport) = weak.upgrade() {
        transport.on_readable();
      }
    });
  }

  fn current_protocol(&self) -> Option<Rc<dyn Protocol>> {
    self.protocol.borrow().clone()
  }

  fn on_readable(&self) {
    if self.closed.get() || self.reading_paused.get() {
      return;
    }
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
      let result = self.stream.borrow_mut().read(&mut buffer);
      match result {
        Ok(0) => {
          let keep_open = match self.current_protocol() {
            Some(protocol) => protocol.eof_received(),
            None => false,
          };
          if !keep_open {
            self.close();
          }
          return;
        }
        Ok(count) => {
          if let Some(protocol) = self.current_protocol() {
            protocol.data_received(Bytes::copy_from_slice(&buffer[..count]));
          }
        }
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
        Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
        Err(error) => {
          self.fatal(error);
          return;
        }
      }
      if self.closed.get() || self.reading_paused.get() {
        return;
      }
    }
  }

  fn on_writable(&self) {
    if self.closed.get() {
      return;
    }
    if self.connect_waiter.borrow().is_some() {
      self.finish_connect();
      return;
    }
    self.try_flush();
  }

  fn finish_connect(&self) {
    let error = {
      let stream = self.stream.borrow();
      match stream.take_error() {
        Ok(Some(error)) => Some(error),
        Ok(None) => match stream.peer_addr() {
          Ok(_) => None,
          Err(error)
            if error.kind() == io::ErrorKind::NotConnected
              || error.raw_os_error() == Some(libc_einprogress()) =>
          {
            // Still connecting; keep waiting for the next writable event.
            return;
          }
          Err(error) => Some(error),
        },
        Err(error) => Some(error),
      }
    };
    let Some(waiter) = self.connect_waiter.borrow_mut().take() else {
      return;
    };
    match error {
      Some(error) => {
        waiter.set_error_if_pending(error.into());
        self.finish_close(None);
      }
      None => {
        self.cache_addresses();
        if let Some(transport) = self.this.borrow().upgrade() {
          waiter.set_result_if_pending(transport);
        }
      }
    }
  }

  fn try_flush(&self) {
    if self.closed.get() || self.connect_waiter.borrow().is_some() {
      return;
    }
    let mut fatal_error = None;
    {
      let mut stream = self.stream.borrow_mut();
      let mut write_buffer = self.write_buffer.borrow_mut();
      while let Some(front) = write_buffer.front_mut() {
        match stream.write(front) {
          Ok(count) => {
            self.buffered.set(self.buffered.get() - count);
            if count == front.len() {
              write_buffer.pop_front();
            } else {
              let rest = front.slice(count..);
              *front = rest;
            }
          }
          Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
          Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
          Err(error) => {
            fatal_error = Some(error);
            break;
          }
        }
      }
    }
    if let Some(error) = fatal_error {
      self.fatal(error);
      return;
    }
    if self.write_buffer.borrow().is_empty() {
      if self.eof_pending.get() && !self.eof_written.get() {
        self.eof_written.set(true);
        let _ = self.stream.borrow().shutdown(Shutdown::Write);
      }
      if self.closing.get() {
        self.finish_close(None);
        return;
      }
    }
    self.maybe_resume_protocol();
  }

  fn maybe_pause_protocol(&self) {
    if self.buffered.get() > HIGH_WATER_MARK && !self.protocol_paused.get() {
      self.protocol_paused.set(true);
      if let Some(protocol) = self.current_protocol() {
        protocol.pause_writing();
      }
    }
  }

  fn maybe_resume_protocol(&self) {
    if self.protocol_paused.get() && self.buffered.get() <= LOW_WATER_MARK {
      self.protocol_paused.set(false);
      if let Some(protocol) = self.current_protocol() {
        protocol.resume_writing();
      }
    }
  }

  fn fatal(&self, error: io::Error) {
    if self.closed.get() {
      return;
    }
    self.write_buffer.borrow_mut().clear();
    self.buffered.set(0);
    self.finish_close(Some(CoreError::from(error)));
  }

  fn finish_close(&self, error: Option<CoreError>) {
    if self.closed.get() {
      return;
    }
    self.closed.set(true);
    self.closing.set(true);
    {
      let mut stream = self.stream.borrow_mut();
      self.event_loop.deregister_io(&mut *stream, self.token.get());
      let _ = stream.shutdown(Shutdown::Both);
    }
    if let Some(waiter) = self.connect_waiter.borrow_mut().take() {
      waiter.set_error_if_pending(CoreError::ConnectionReset(
        "connection closed before the connect finished".into(),
      ));
    }
    let protocol = self.protocol.borrow_mut().take();
    if let Some(protocol) = protocol {
      protocol.connection_lost(error);
    }
  }
}

fn libc_einprogress() -> i32 {
  115 // EINPROGRESS on Linux; macOS uses 36, handled by NotConnected above.
}

impl Drop for TcpTransport {
  fn drop(&mut self) {
    if !self.closed.get() {
      let mut stream = self.stream.borrow_mut();
      self.event_loop.deregister_io(&mut *stream, self.token.get());
      let _ = stream.shutdown(Shutdown::Both);
    }
  }
}

impl Transport for TcpTransport {
  fn write(&self, data: &[u8]) {
    if data.is_empty() {
      return;
    }
    if self.closed.get() || self.closing.get() || self.eof_written.get() {
      log::warn!("write on a closing TCP transport; {} bytes dropped", data.len());
      return;
    }
    self
      .write_buffer
      .borrow_mut()
      .push_back(Bytes::copy_from_slice(data));
    self.buffered.set(self.buffered.get() + data.len());
    self.try_flush();
    self.maybe_pause_protocol();
  }

  fn close(&self) {
    if self.closed.get() || self.closing.get() {
      return;
    }
    self.closing.set(true);
    if self.write_buffer.borrow().is_empty() {
      self.finish_close(None);
    }
  }

  fn abort(&self) {
    self.write_buffer.borrow_mut().clear();
    self.buffered.set(0);
    self.finish_close(None);
  }

  fn is_closing(&self) -> bool {
    self.closing.get() || self.closed.get()
  }

  fn can_write_eof(&self) -> bool {
    true
  }

  fn write_eof(&self) {
    if self.eof_written.get() || self.closed.get() {
      return;
    }
    if self.write_buffer.borrow().is_empty() {
      self.eof_written.set(true);
      let _ = self.stream.borrow().shutdown(Shutdown::Write);
    } else {
      self.eof_pending.set(true);
    }
  }

  fn set_protocol(&self, protocol: Rc<dyn Protocol>) {
    *self.protocol.borrow_mut() = Some(protocol);
    // Kernel data may already be buffered with no further edge event
    // coming; poke the read path so the new protocol sees it.
    if let Some(this) = self.this.borrow().upgrade() {
      self.event_loop.call_soon(move |_| this.on_readable());
    }
  }

  fn extra_info(&self) -> ExtraInfo {
    ExtraInfo {
      peer_addr: *self.peer_addr.borrow(),
      local_addr: *self.local_addr.borrow(),
      is_tls: false,
      server_host_name: None,
      peer_certificate: None,
    }
  }

  fn pause_reading(&self) {
    self.reading_paused.set(true);
  }

  fn resume_reading(&self) {
    if !self.reading_paused.get() {
      return;
    }
    self.reading_paused.set(false);
    // Edge-triggered selector: data may already be buffered in the kernel
    // with no further event coming, so poke the read path manually.
    self.on_readable();
  }
}

type AcceptCallback = Rc<dyn Fn(&EventLoop, Rc<TcpTransport>)>;

/// A listening socket that accepts connections into fresh transports.
pub struct TcpServer {
  event_loop: EventLoop,
  listener: RefCell<mio::net::TcpListener>,
  token: Cell<usize>,
  on_accept: RefCell<Option<AcceptCallback>>,
  closed: Cell<bool>,
  local_addr: SocketAddr,
}

impl TcpServer {
  pub fn bind(
    event_loop: &EventLoop,
    address: SocketAddr,
    on_accept: impl Fn(&EventLoop, Rc<TcpTransport>) + 'static,
  ) -> io::Result<Rc<TcpServer>> {
    let listener = mio::net::TcpListener::bind(address)?;
    let local_addr = listener.local_addr()?;
    let server = Rc::new(TcpServer {
      event_loop: event_loop.clone(),
      listener: RefCell::new(listener),
      token: Cell::new(usize::MAX),
      on_accept: RefCell::new(Some(Rc::new(on_accept))),
      closed: Cell::new(false),
      local_addr,
    });
    let token = {
      let mut listener = server.listener.borrow_mut();
      event_loop.register_io(&mut *listener, Interest::READABLE)?
    };
    server.token.set(token);

    let weak = Rc::downgrade(&server);
    event_loop.set_io_callbacks(
      token,
      Some(Rc::new(move |event_loop| {
        if let Some(server) = weak.upgrade() {
          server.on_acceptable(event_loop);
        }
      })),
      None,
    );
    Ok(server)
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  fn on_acceptable(&self, event_loop: &EventLoop) {
    if self.closed.get() {
      return;
    }
    loop {
      let accepted = self.listener.borrow().accept();
      match accepted {
        Ok((stream, _peer)) => {
          match TcpTransport::from_stream(event_loop, stream) {
            Ok(transport) => {
              if let Some(on_accept) = self.on_accept.borrow().clone() {
                on_accept(event_loop, transport);
              }
            }
            Err(error) => {
              log::warn!("failed to register accepted connection: {error}");
            }
          }
        }
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
        Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
        Err(error) => {
          log::warn!("accept failed: {error}");
          return;
        }
      }
    }
  }

  pub fn close(&self) {
    if self.closed.get() {
      return;
    }
    self.closed.set(true);
    let mut listener = self.listener.borrow_mut();
    self.event_loop.deregister_io(&mut *listener, self.token.get());
    *self.on_accept.borrow_mut() = None;
  }
}

impl EventLoop {
  /// Resolves `host:port`, connects to the first reachable candidate and
  /// attaches the protocol produced by `factory`.
  pub async fn create_connection_to<P, F>(
    &self,
    factory: F,
    host: &str,
    port: u16,
  ) -> Result<(Rc<TcpTransport>, Rc<P>), CoreError>
  where
    P: Protocol + 'static,
    F: FnOnce() -> Rc<P>,
  {
    let addresses = self.get_address_info(host, port).await?;
    let mut factory = Some(factory);
    let mut last_error: Option<CoreError> = None;
    for address in addresses {
      match TcpTransport::connect(self, address).await {
        Ok(transport) => {
          if let Some(make_protocol) = factory.take() {
            let protocol = make_protocol();
            TcpTransport::attach(&transport, protocol.clone());
            return Ok((transport, protocol));
          }
        }
        Err(error) => last_error = Some(error),
      }
    }
    Err(
      last_error.unwrap_or_else(|| {
        CoreError::ConnectionReset("no address candidates".into())
      }),
    )
  }

  /// Binds a listener that attaches a fresh protocol from `factory` to
  /// every accepted connection.
  pub fn create_server_to(
    &self,
    factory: impl Fn(&EventLoop) -> Rc<dyn Protocol> + 'static,
    address: SocketAddr,
  ) -> io::Result<Rc<TcpServer>> {
    TcpServer::bind(self, address, move |event_loop, transport| {
      TcpTransport::attach(&transport, factory(event_loop));
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::future_ops::sleep;

  struct EchoProtocol {
    transport: RefCell<Option<Rc<dyn Transport>>>,
  }

  impl Protocol for EchoProtocol {
    fn connection_made(&self, transport: Rc<dyn Transport>) {
      *self.transport.borrow_mut() = Some(transport);
    }

    fn connection_lost(&self, _error: Option<CoreError>) {
      *self.transport.borrow_mut() = None;
    }

    fn data_received(&self, data: Bytes) {
      if let Some(transport) = self.transport.borrow().as_ref() {
        transport.write(&data);
      }
    }
  }

  struct CollectProtocol {
    received: Rc<RefCell<Vec<u8>>>,
  }

  impl Protocol for CollectProtocol {
    fn connection_made(&self, _transport: Rc<dyn Transport>) {}

    fn connection_lost(&self, _error: Option<CoreError>) {}

    fn data_received(&self, data: Bytes) {
      self.received.borrow_mut().extend_from_slice(&data);
    }
  }

  #[test]
  fn tcp_echo_round_trip() {
    let event_loop = EventLoop::new().unwrap();
    let lp = event_loop.clone();
    let server = event_loop
      .create_server_to(
        |_| {
          Rc::new(EchoProtocol {
            transport: RefCell::new(None),
          }) as Rc<dyn Protocol>
        },
        "127.0.0.1:0".parse().unwrap(),
      )
      .unwrap();
    let address = server.local_addr();

    let result: Result<Vec<u8>, CoreError> =
      event_loop.run_until(async move {
        let received = Rc::new(RefCell::new(Vec::new()));
        let protocol = Rc::new(CollectProtocol {
          received: received.clone(),
        });
        let transport = TcpTransport::connect(&lp, address).await?;
        TcpTransport::attach(&transport, protocol);
        transport.write(b"ping pong");
        for _ in 0..200 {
          if received.borrow().len() >= 9 {
            break;
          }
          sleep::<CoreError>(&lp, 0.005).await?;
        }
        transport.close();
        let collected = received.borrow().clone();
        Ok(collected)
      });
    assert_eq!(result.unwrap(), b"ping pong".to_vec());
    server.close();
  }
}
