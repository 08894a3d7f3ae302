// Copyright 2026 the Cinder authors. MIT license.

use std::cell::RefCell;
use std::rc::Rc;

use cinder_http::HttpProtocol;

use crate::connector::Connector;
use crate::request::ConnectionKey;

struct ConnectionState {
  connector: Connector,
  key: ConnectionKey,
  protocol: Option<HttpProtocol>,
}

impl Drop for ConnectionState {
  fn drop(&mut self) {
    // An abandoned connection flows back into the pool; the protocol
    // reference moves, it is never aliased past this point.
    if let Some(protocol) = self.protocol.take() {
      self.connector.release(&self.key, protocol, false);
    }
  }
}

/// Guard over an acquired pooled connection. Dropping it releases the
/// protocol back to the pool; `close` discards it; `detach` moves the
/// protocol out for an in-place protocol switch.
#[derive(Clone)]
pub struct Connection {
  state: Rc<RefCell<ConnectionState>>,
}

impl Connection {
  pub(crate) fn new(
    connector: Connector,
    key: ConnectionKey,
    protocol: HttpProtocol,
  ) -> Connection {
    Connection {
      state: Rc::new(RefCell::new(ConnectionState {
        connector,
        key,
        protocol: Some(protocol),
      })),
    }
  }

  pub fn key(&self) -> ConnectionKey {
    self.state.borrow().key.clone()
  }

  pub fn protocol(&self) -> Option<HttpProtocol> {
    self.state.borrow().protocol.clone()
  }

  /// Returns the connection to the pool for reuse.
  pub fn release(&self) {
    let mut state = self.state.borrow_mut();
    if let Some(protocol) = state.protocol.take() {
      let connector = state.connector.clone();
      let key = state.key.clone();
      drop(state);
      connector.release(&key, protocol, false);
    }
  }

  /// Closes the underlying transport instead of pooling it.
  pub fn close(&self) {
    let mut state = self.state.borrow_mut();
    if let Some(protocol) = state.protocol.take() {
      let connector = state.connector.clone();
      let key = state.key.clone();
      drop(state);
      connector.release(&key, protocol, true);
    }
  }

  /// Takes the protocol out of the pool's bookkeeping entirely, e.g. when
  /// the connection upgrades to WebSocket.
  pub fn detach(&self) -> Option<HttpProtocol> {
    let mut state = self.state.borrow_mut();
    let protocol = state.protocol.take();
    if let Some(protocol) = &protocol {
      let connector = state.connector.clone();
      let key = state.key.clone();
      drop(state);
      connector.forget_acquired(&key, protocol);
    }
    protocol
  }
}
