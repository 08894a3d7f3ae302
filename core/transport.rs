// Copyright 2026 the Cinder authors. MIT license.

use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;

use crate::error::CoreError;

/// Facts a transport can expose about its connection. TLS layers fill in
/// the certificate fields.
#[derive(Clone, Debug, Default)]
pub struct ExtraInfo {
  pub peer_addr: Option<SocketAddr>,
  pub local_addr: Option<SocketAddr>,
  pub is_tls: bool,
  pub server_host_name: Option<String>,
  /// DER encoding of the peer's leaf certificate, when TLS is involved.
  pub peer_certificate: Option<Vec<u8>>,
}

/// Callback half of a connection. Implementations use interior mutability;
/// the loop only ever calls them from its owning thread.
pub trait Protocol {
  fn connection_made(&self, transport: Rc<dyn Transport>);

  /// Called once when the transport goes away. `error` is `None` for a
  /// clean close (including one following EOF).
  fn connection_lost(&self, error: Option<CoreError>);

  fn data_received(&self, data: Bytes);

  /// EOF from the peer. Returning `true` keeps the transport open for
  /// further writes; `false` lets the transport close itself.
  fn eof_received(&self) -> bool {
    false
  }

  /// The transport's write buffer crossed the high-water mark.
  fn pause_writing(&self) {}

  /// The write buffer drained below the low-water mark.
  fn resume_writing(&self) {}
}

/// Byte-stream half of a connection.
pub trait Transport {
  fn write(&self, data: &[u8]);

  fn writelines(&self, chunks: &[&[u8]]) {
    for chunk in chunks {
      self.write(chunk);
    }
  }

  /// Flushes buffered data, then closes. Further writes are dropped.
  fn close(&self);

  /// Tears the connection down immediately, discarding buffered data.
  fn abort(&self);

  fn is_closing(&self) -> bool;

  fn can_write_eof(&self) -> bool;

  fn write_eof(&self);

  /// Swaps the protocol receiving this transport's events; used when a
  /// connection is upgraded in place.
  fn set_protocol(&self, protocol: Rc<dyn Protocol>);

  fn extra_info(&self) -> ExtraInfo;

  /// Stops delivering `data_received` until reading is resumed.
  fn pause_reading(&self) {}

  fn resume_reading(&self) {}
}
