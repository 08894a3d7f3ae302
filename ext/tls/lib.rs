// Copyright 2026 the Cinder authors. MIT license.

//! TLS layered over any Cinder transport, sans-IO style: ciphertext flows
//! through the inner transport, plaintext reaches the outer protocol. The
//! same machinery serves direct connections, `start_tls` over CONNECT
//! tunnels, and server-side acceptors.

use std::cell::Cell;
use std::cell::RefCell;
use std::io;
use std::io::Read;
use std::io::Write;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;

use bytes::Bytes;
use cinder_core::CoreError;
use cinder_core::EventLoop;
use cinder_core::ExtraInfo;
use cinder_core::Promise;
use cinder_core::Protocol;
use cinder_core::Transport;
use rustls::pki_types::ServerName;

fn tls_io_error(error: rustls::Error) -> CoreError {
  CoreError::from(io::Error::new(io::ErrorKind::InvalidData, error))
}

/// Client configuration trusting the bundled webpki roots.
pub fn default_client_config() -> Arc<rustls::ClientConfig> {
  let mut roots = rustls::RootCertStore::empty();
  roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
  Arc::new(
    rustls::ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth(),
  )
}

/// Client configuration that skips certificate verification. Meant for
/// fingerprint-pinned connections, where trust comes from comparing the
/// peer certificate digest instead of the chain.
pub fn unverified_client_config() -> Arc<rustls::ClientConfig> {
  Arc::new(
    rustls::ClientConfig::builder()
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
      .with_no_client_auth(),
  )
}

/// Server configuration from PEM-encoded certificate chain and key.
pub fn server_config_from_pem(
  cert_pem: &[u8],
  key_pem: &[u8],
) -> Result<Arc<rustls::ServerConfig>, CoreError> {
  let certs = rustls_pemfile::certs(&mut &cert_pem[..])
    .collect::<Result<Vec<_>, _>>()
    .map_err(CoreError::from)?;
  let key = rustls_pemfile::private_key(&mut &key_pem[..])
    .map_err(CoreError::from)?
    .ok_or_else(|| {
      CoreError::from(io::Error::new(
        io::ErrorKind::InvalidData,
        "no private key found in PEM input",
      ))
    })?;
  let config = rustls::ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(tls_io_error)?;
  Ok(Arc::new(config))
}

#[derive(Debug)]
struct NoVerification {
  provider: Arc<rustls::crypto::CryptoProvider>,
}

impl NoVerification {
  fn new() -> NoVerification {
    NoVerification {
      provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
    }
  }
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls::pki_types::CertificateDer<'_>,
    _intermediates: &[rustls::pki_types::CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: rustls::pki_types::UnixTime,
  ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::danger::ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &rustls::pki_types::CertificateDer<'_>,
    dss: &rustls::DigitallySignedStruct,
  ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
  {
    rustls::crypto::verify_tls12_signature(
      message,
      cert,
      dss,
      &self.provider.signature_verification_algorithms,
    )
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &rustls::pki_types::CertificateDer<'_>,
    dss: &rustls::DigitallySignedStruct,
  ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
  {
    rustls::crypto::verify_tls13_signature(
      message,
      cert,
      dss,
      &self.provider.signature_verification_algorithms,
    )
  }

  fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
    self
      .provider
      .signature_verification_algorithms
      .supported_schemes()
  }
}

/// TLS session over an inner transport. Implements [`Transport`] for the
/// plaintext side; a private bridge protocol receives the ciphertext from
/// the inner transport.
pub struct TlsTransport {
  event_loop: EventLoop,
  this: RefCell<Weak<TlsTransport>>,
  inner: Rc<dyn Transport>,
  session: RefCell<rustls::Connection>,
  protocol: RefCell<Option<Rc<dyn Protocol>>>,
  handshake_waiter: RefCell<Option<Promise<(), CoreError>>>,
  server_host_name: Option<String>,
  peer_certificate: RefCell<Option<Vec<u8>>>,
  closing: Cell<bool>,
}

struct TlsBridge {
  transport: Weak<TlsTransport>,
}

impl Protocol for TlsBridge {
  fn connection_made(&self, _transport: Rc<dyn Transport>) {}

  fn connection_lost(&self, error: Option<CoreError>) {
    if let Some(transport) = self.transport.upgrade() {
      transport.on_connection_lost(error);
    }
  }

  fn data_received(&self, data: Bytes) {
    if let Some(transport) = self.transport.upgrade() {
      transport.on_ciphertext(&data);
    }
  }

  fn eof_received(&self) -> bool {
    if let Some(transport) = self.transport.upgrade() {
      transport.on_eof();
    }
    false
  }

  fn pause_writing(&self) {
    if let Some(transport) = self.transport.upgrade() {
      if let Some(protocol) = transport.protocol.borrow().clone() {
        protocol.pause_writing();
      }
    }
  }

  fn resume_writing(&self) {
    if let Some(transport) = self.transport.upgrade() {
      if let Some(protocol) = transport.protocol.borrow().clone() {
        protocol.resume_writing();
      }
    }
  }
}

impl TlsTransport {
  fn new(
    event_loop: &EventLoop,
    inner: Rc<dyn Transport>,
    session: rustls::Connection,
    server_host_name: Option<String>,
  ) -> Rc<TlsTransport> {
    let transport = Rc::new(TlsTransport {
      event_loop: event_loop.clone(),
      this: RefCell::new(Weak::new()),
      inner,
      session: RefCell::new(session),
      protocol: RefCell::new(None),
      handshake_waiter: RefCell::new(None),
      server_host_name,
      peer_certificate: RefCell::new(None),
      closing: Cell::new(false),
    });
    *transport.this.borrow_mut() = Rc::downgrade(&transport);
    transport.inner.set_protocol(Rc::new(TlsBridge {
      transport: Rc::downgrade(&transport),
    }));
    transport
  }

  /// Attaches the application protocol and delivers any plaintext that
  /// arrived alongside the handshake tail.
  pub fn attach(this: &Rc<TlsTransport>, protocol: Rc<dyn Protocol>) {
    *this.protocol.borrow_mut() = Some(protocol.clone());
    protocol.connection_made(this.clone() as Rc<dyn Transport>);
    this.deliver_plaintext();
  }

  fn current_protocol(&self) -> Option<Rc<dyn Protocol>> {
    self.protocol.borrow().clone()
  }

  fn flush_ciphertext(&self) {
    loop {
      let chunk = {
        let mut session = self.session.borrow_mut();
        if !session.wants_write() {
          break;
        }
        let mut buffer = Vec::new();
        match session.write_tls(&mut buffer) {
          Ok(0) => break,
          Ok(_) => buffer,
          Err(error) => {
            log::warn!("TLS write failed: {error}");
            break;
          }
        }
      };
      self.inner.write(&chunk);
    }
  }

  fn fail(&self, error: CoreError) {
    // A pending alert still deserves a flush before the teardown.
    self.flush_ciphertext();
    if let Some(waiter) = self.handshake_waiter.borrow_mut().take() {
      waiter.set_error_if_pending(error.clone());
    }
    self.closing.set(true);
    self.inner.abort();
    if let Some(protocol) = self.protocol.borrow_mut().take() {
      protocol.connection_lost(Some(error));
    }
  }

  fn on_ciphertext(&self, data: &[u8]) {
    {
      let mut session = self.session.borrow_mut();
      let mut cursor = data;
      while !cursor.is_empty() {
        match session.read_tls(&mut cursor) {
          Ok(0) => break,
          Ok(_) => {}
          Err(error) => {
            drop(session);
            self.fail(CoreError::from(error));
            return;
          }
        }
        if let Err(error) = session.process_new_packets() {
          drop(session);
          self.fail(tls_io_error(error));
          return;
        }
      }
    }
    self.flush_ciphertext();
    self.after_progress();
  }

  fn after_progress(&self) {
    let handshake_done = {
      let session = self.session.borrow();
      !session.is_handshaking()
    };
    if handshake_done {
      if self.peer_certificate.borrow().is_none() {
        let session = self.session.borrow();
        if let Some(certificates) = session.peer_certificates() {
          if let Some(leaf) = certificates.first() {
            *self.peer_certificate.borrow_mut() =
              Some(leaf.as_ref().to_vec());
          }
        }
      }
      if let Some(waiter) = self.handshake_waiter.borrow_mut().take() {
        waiter.set_result_if_pending(());
      }
    }
    self.deliver_plaintext();
  }

  fn deliver_plaintext(&self) {
    let Some(protocol) = self.current_protocol() else {
      return;
    };
    loop {
      let mut buffer = [0u8; 16 * 1024];
      let read = {
        let mut session = self.session.borrow_mut();
        let mut reader = session.reader();
        reader.read(&mut buffer)
      };
      match read {
        Ok(0) => {
          // Clean TLS close from the peer.
          if !protocol.eof_received() {
            self.close();
          }
          return;
        }
        Ok(count) => {
          protocol.data_received(Bytes::copy_from_slice(&buffer[..count]));
        }
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
        Err(error) => {
          self.fail(CoreError::from(error));
          return;
        }
      }
    }
  }

  fn on_eof(&self) {
    let waiter = self.handshake_waiter.borrow_mut().take();
    if let Some(waiter) = waiter {
      waiter.set_error_if_pending(CoreError::ConnectionReset(
        "connection closed during the TLS handshake".into(),
      ));
    }
    if let Some(protocol) = self.current_protocol() {
      protocol.eof_received();
    }
  }

  fn on_connection_lost(&self, error: Option<CoreError>) {
    if let Some(waiter) = self.handshake_waiter.borrow_mut().take() {
      waiter.set_error_if_pending(error.clone().unwrap_or_else(|| {
        CoreError::ConnectionReset(
          "connection lost during the TLS handshake".into(),
        )
      }));
    }
    if let Some(protocol) = self.protocol.borrow_mut().take() {
      protocol.connection_lost(error);
    }
  }
}

impl Transport for TlsTransport {
  fn write(&self, data: &[u8]) {
    if self.closing.get() {
      return;
    }
    {
      let mut session = self.session.borrow_mut();
      if let Err(error) = session.writer().write_all(data) {
        log::warn!("TLS plaintext buffering failed: {error}");
        return;
      }
    }
    self.flush_ciphertext();
  }

  fn close(&self) {
    if self.closing.get() {
      return;
    }
    self.closing.set(true);
    {
      let mut session = self.session.borrow_mut();
      session.send_close_notify();
    }
    self.flush_ciphertext();
    self.inner.close();
  }

  fn abort(&self) {
    self.closing.set(true);
    self.inner.abort();
  }

  fn is_closing(&self) -> bool {
    self.closing.get() || self.inner.is_closing()
  }

  /// Half-closes are not expressible under TLS; `close` sends the
  /// close_notify alert instead.
  fn can_write_eof(&self) -> bool {
    false
  }

  fn write_eof(&self) {}

  fn set_protocol(&self, protocol: Rc<dyn Protocol>) {
    *self.protocol.borrow_mut() = Some(protocol);
    if let Some(this) = self.this.borrow().upgrade() {
      self.event_loop.call_soon(move |_| this.deliver_plaintext());
    }
  }

  fn extra_info(&self) -> ExtraInfo {
    let mut info = self.inner.extra_info();
    info.is_tls = true;
    info.server_host_name = self.server_host_name.clone();
    info.peer_certificate = self.peer_certificate.borrow().clone();
    info
  }

  fn pause_reading(&self) {
    self.inner.pause_reading();
  }

  fn resume_reading(&self) {
    self.inner.resume_reading();
  }
}

/// Starts a client TLS session over an established transport. Returns the
/// TLS transport and a promise resolving when the handshake finishes.
pub fn start_tls_client(
  event_loop: &EventLoop,
  inner: Rc<dyn Transport>,
  config: Arc<rustls::ClientConfig>,
  server_name: &str,
) -> Result<(Rc<TlsTransport>, Promise<(), CoreError>), CoreError> {
  let name: ServerName<'static> = server_name
    .to_string()
    .try_into()
    .map_err(|_| {
      CoreError::from(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid TLS server name: {server_name:?}"),
      ))
    })?;
  let session =
    rustls::ClientConnection::new(config, name).map_err(tls_io_error)?;
  let transport = TlsTransport::new(
    event_loop,
    inner,
    rustls::Connection::Client(session),
    Some(server_name.to_string()),
  );
  let waiter: Promise<(), CoreError> = event_loop.promise();
  *transport.handshake_waiter.borrow_mut() = Some(waiter.clone());
  // First flight: the client hello is pending from the moment the session
  // exists.
  transport.flush_ciphertext();
  Ok((transport, waiter))
}

/// Starts a server TLS session over an accepted transport.
pub fn start_tls_server(
  event_loop: &EventLoop,
  inner: Rc<dyn Transport>,
  config: Arc<rustls::ServerConfig>,
) -> Result<(Rc<TlsTransport>, Promise<(), CoreError>), CoreError> {
  let session =
    rustls::ServerConnection::new(config).map_err(tls_io_error)?;
  let transport = TlsTransport::new(
    event_loop,
    inner,
    rustls::Connection::Server(session),
    None,
  );
  let waiter: Promise<(), CoreError> = event_loop.promise();
  *transport.handshake_waiter.borrow_mut() = Some(waiter.clone());
  Ok((transport, waiter))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn client_configs_build() {
    let verified = default_client_config();
    assert!(verified.alpn_protocols.is_empty());
    let unverified = unverified_client_config();
    assert!(unverified.alpn_protocols.is_empty());
  }

  #[test]
  fn pem_without_key_is_rejected() {
    let result = server_config_from_pem(b"", b"");
    assert!(result.is_err());
  }
}
