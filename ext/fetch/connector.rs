// Copyright 2026 the Cinder authors. MIT license.

//! The connection pool and its DNS cache.
//!
//! Idle protocols are pooled per connection key for up to
//! [`KEEP_ALIVE_TIMEOUT`] seconds and cleaned up by a weak timer, so an
//! abandoned connector never keeps itself alive through its own cleanup
//! callback. Host resolution is cached for [`DNS_CACHE_TIMEOUT`] seconds
//! with round-robin rotation; an expired entry serves its stale addresses
//! while a shielded refresh runs in the background.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::rc::Rc;

use cinder_core::loop_time;
use cinder_core::shield;
use cinder_core::AsyncEvent;
use cinder_core::EventLoop;
use cinder_core::TcpTransport;
use cinder_core::TimerWeakHandle;
use cinder_core::Transport;
use cinder_http::names;
use cinder_http::Headers;
use cinder_http::HttpProtocol;
use cinder_tls::start_tls_client;
use cinder_tls::TlsTransport;
use cinder_url::is_ip_address;
use cinder_url::Url;

use crate::connection::Connection;
use crate::cookies::CookieJar;
use crate::error::FetchError;
use crate::request::ClientRequest;
use crate::request::ConnectionKey;
use crate::request::RequestOptions;
use crate::request::SslMode;

/// Idle ceiling of a pooled connection, in seconds.
pub const KEEP_ALIVE_TIMEOUT: f64 = 15.0;

/// Lifetime of a cached host resolution, in seconds.
pub const DNS_CACHE_TIMEOUT: f64 = 10.0;

/// Resolved addresses of one host, rotated round-robin across uses.
struct HostInfoContainer {
  addresses: Vec<SocketAddr>,
  rotation_index: Cell<usize>,
  timestamp: f64,
}

impl HostInfoContainer {
  fn new(addresses: Vec<SocketAddr>) -> HostInfoContainer {
    HostInfoContainer {
      addresses,
      rotation_index: Cell::new(0),
      timestamp: loop_time(),
    }
  }

  fn expired(&self) -> bool {
    loop_time() - self.timestamp > DNS_CACHE_TIMEOUT
  }

  fn next_addresses(&self) -> Vec<SocketAddr> {
    let length = self.addresses.len();
    if length == 0 {
      return Vec::new();
    }
    let start = self.rotation_index.get() % length;
    self.rotation_index.set((start + 1) % length);
    let mut rotated = Vec::with_capacity(length);
    for offset in 0..length {
      rotated.push(self.addresses[(start + offset) % length]);
    }
    rotated
  }
}

type DnsKey = (String, u16);
type DnsOutcome = Result<Rc<HostInfoContainer>, FetchError>;

struct DnsEvent {
  done: AsyncEvent,
  result: Rc<RefCell<Option<DnsOutcome>>>,
}

pub(crate) struct ConnectorInner {
  event_loop: EventLoop,
  closed: Cell<bool>,
  force_close: bool,
  default_ssl: RefCell<SslMode>,
  alive_by_host:
    RefCell<HashMap<ConnectionKey, Vec<(HttpProtocol, f64)>>>,
  acquired: RefCell<HashMap<usize, HttpProtocol>>,
  acquired_by_host: RefCell<HashMap<ConnectionKey, HashSet<usize>>>,
  cleanup_handle: RefCell<Option<TimerWeakHandle>>,
  cookies: RefCell<CookieJar>,
  dns_cache: RefCell<HashMap<DnsKey, Rc<HostInfoContainer>>>,
  dns_events: RefCell<HashMap<DnsKey, Rc<DnsEvent>>>,
}

/// TCP connector with keep-alive pooling, proxy support and a DNS cache.
#[derive(Clone)]
pub struct Connector {
  inner: Rc<ConnectorInner>,
}

impl Connector {
  pub fn new(event_loop: &EventLoop) -> Connector {
    Connector::with_options(event_loop, SslMode::Default, false)
  }

  pub fn with_options(
    event_loop: &EventLoop,
    default_ssl: SslMode,
    force_close: bool,
  ) -> Connector {
    Connector {
      inner: Rc::new(ConnectorInner {
        event_loop: event_loop.clone(),
        closed: Cell::new(false),
        force_close,
        default_ssl: RefCell::new(default_ssl),
        alive_by_host: RefCell::new(HashMap::new()),
        acquired: RefCell::new(HashMap::new()),
        acquired_by_host: RefCell::new(HashMap::new()),
        cleanup_handle: RefCell::new(None),
        cookies: RefCell::new(CookieJar::new()),
        dns_cache: RefCell::new(HashMap::new()),
        dns_events: RefCell::new(HashMap::new()),
      }),
    }
  }

  pub fn event_loop(&self) -> &EventLoop {
    &self.inner.event_loop
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closed.get()
  }

  // -- cookies --------------------------------------------------------------

  pub fn cookie_header_for(&self, url: &Url) -> Option<String> {
    self.inner.cookies.borrow().cookie_header_for(url)
  }

  pub fn update_cookies(&self, url: &Url, set_cookie_headers: &[&str]) {
    self.inner.cookies.borrow_mut().update(url, set_cookie_headers);
  }

  // -- pool -----------------------------------------------------------------

  /// Gets a pooled connection or dials a new one.
  pub async fn connect(
    &self,
    request: &mut ClientRequest,
  ) -> Result<Connection, FetchError> {
    let key = request.connection_key();
    let protocol = match self.pooled_protocol(&key) {
      Some(protocol) => {
        log::debug!("reusing pooled connection to {key}");
        protocol
      }
      None => {
        let protocol = self.create_connection(request).await?;
        if self.inner.closed.get() {
          protocol.close_transport(true);
          return Err(FetchError::Connection {
            key: key.to_string(),
            message: "connector is closed".into(),
          });
        }
        protocol
      }
    };

    self.inner.acquired.borrow_mut().insert(protocol.id(), protocol.clone());
    self
      .inner
      .acquired_by_host
      .borrow_mut()
      .entry(key.clone())
      .or_default()
      .insert(protocol.id());
    Ok(Connection::new(self.clone(), key, protocol))
  }

  /// First healthy idle protocol for the key; expired entries are closed
  /// along the way.
  fn pooled_protocol(&self, key: &ConnectionKey) -> Option<HttpProtocol> {
    let mut alive_by_host = self.inner.alive_by_host.borrow_mut();
    let entries = alive_by_host.get_mut(key)?;
    let now = loop_time();
    let mut found = None;
    while let Some((protocol, last_used)) = entries.pop() {
      if protocol.transport().is_none() {
        continue;
      }
      if now - last_used > KEEP_ALIVE_TIMEOUT {
        protocol.close_transport(key.is_ssl);
        continue;
      }
      found = Some(protocol);
      break;
    }
    if entries.is_empty() {
      alive_by_host.remove(key);
    }
    found
  }

  /// Releases an acquired protocol: closes it, or returns it to the idle
  /// pool and arms the cleanup timer.
  pub fn release(
    &self,
    key: &ConnectionKey,
    protocol: HttpProtocol,
    should_close: bool,
  ) {
    if self.inner.closed.get() {
      return;
    }
    self.forget_acquired(key, &protocol);

    if should_close || self.inner.force_close || protocol.should_close() {
      protocol.close_transport(key.is_ssl);
      return;
    }
    self
      .inner
      .alive_by_host
      .borrow_mut()
      .entry(key.clone())
      .or_default()
      .push((protocol, loop_time()));
    self.ensure_cleanup_scheduled();
  }

  /// Drops an acquired protocol from the bookkeeping without touching its
  /// transport; the WebSocket upgrade path takes ownership this way.
  pub(crate) fn forget_acquired(
    &self,
    key: &ConnectionKey,
    protocol: &HttpProtocol,
  ) {
    self.inner.acquired.borrow_mut().remove(&protocol.id());
    let mut acquired_by_host = self.inner.acquired_by_host.borrow_mut();
    if let Some(set) = acquired_by_host.get_mut(key) {
      set.remove(&protocol.id());
      if set.is_empty() {
        acquired_by_host.remove(key);
      }
    }
  }

  fn ensure_cleanup_scheduled(&self) {
    let mut handle = self.inner.cleanup_handle.borrow_mut();
    if handle.is_some() {
      return;
    }
    *handle = Some(self.inner.event_loop.call_later_weak(
      KEEP_ALIVE_TIMEOUT,
      &self.inner,
      |_, inner| {
        Connector {
          inner: inner.clone(),
        }
        .cleanup();
      },
    ));
  }

  /// Walks the idle lists, closes expired entries and re-arms itself while
  /// anything idle remains.
  fn cleanup(&self) {
    if let Some(handle) = self.inner.cleanup_handle.borrow_mut().take() {
      handle.cancel();
    }
    let now = loop_time();
    {
      let mut alive_by_host = self.inner.alive_by_host.borrow_mut();
      alive_by_host.retain(|key, entries| {
        entries.retain(|(protocol, last_used)| {
          if protocol.transport().is_none() {
            return false;
          }
          if now - last_used > KEEP_ALIVE_TIMEOUT {
            protocol.close_transport(key.is_ssl);
            return false;
          }
          true
        });
        !entries.is_empty()
      });
    }
    if !self.inner.alive_by_host.borrow().is_empty() {
      self.ensure_cleanup_scheduled();
    }
  }

  /// Closes the connector, its idle pool and its acquired protocols.
  pub fn close(&self) {
    if self.inner.closed.get() {
      return;
    }
    self.inner.closed.set(true);
    if let Some(handle) = self.inner.cleanup_handle.borrow_mut().take() {
      handle.cancel();
    }
    let alive: Vec<(ConnectionKey, Vec<(HttpProtocol, f64)>)> =
      self.inner.alive_by_host.borrow_mut().drain().collect();
    for (key, entries) in alive {
      for (protocol, _) in entries {
        protocol.close_transport(key.is_ssl);
      }
    }
    let acquired: Vec<HttpProtocol> =
      self.inner.acquired.borrow_mut().drain().map(|(_, p)| p).collect();
    for protocol in acquired {
      protocol.close_transport(false);
    }
    self.inner.acquired_by_host.borrow_mut().clear();
  }

  /// Pool accounting snapshot: `(idle, acquired)` protocol counts.
  pub fn pool_counts(&self) -> (usize, usize) {
    let idle = self
      .inner
      .alive_by_host
      .borrow()
      .values()
      .map(Vec::len)
      .sum();
    let acquired = self.inner.acquired.borrow().len();
    (idle, acquired)
  }

  // -- DNS ------------------------------------------------------------------

  /// Starts (or joins) the shared resolution of `host:port`, registering
  /// its event synchronously. The lookup itself runs shielded so a
  /// cancelled requester cannot strand the other waiters. Successful
  /// containers are cached; errors are delivered to every waiter and then
  /// forgotten — failures are never negative-cached.
  fn start_resolution(
    &self,
    host: String,
    port: u16,
    key: ConnectionKey,
  ) -> Rc<DnsEvent> {
    let dns_key: DnsKey = (host.clone(), port);
    if let Some(event) = self.inner.dns_events.borrow().get(&dns_key) {
      return event.clone();
    }

    let event = Rc::new(DnsEvent {
      done: AsyncEvent::new(),
      result: Rc::new(RefCell::new(None)),
    });
    self
      .inner
      .dns_events
      .borrow_mut()
      .insert(dns_key.clone(), event.clone());

    let connector = self.clone();
    let completion = event.clone();
    shield(&self.inner.event_loop, async move {
      let outcome = connector
        .inner
        .event_loop
        .get_address_info(&host, port)
        .await;
      let result: DnsOutcome = match outcome {
        Ok(addresses) => {
          let container = Rc::new(HostInfoContainer::new(addresses));
          connector
            .inner
            .dns_cache
            .borrow_mut()
            .insert((host.clone(), port), container.clone());
          Ok(container)
        }
        Err(error) => Err(FetchError::Connection {
          key: key.to_string(),
          message: error.to_string(),
        }),
      };
      connector.inner.dns_events.borrow_mut().remove(&(host, port));
      *completion.result.borrow_mut() = Some(result);
      completion.done.set();
      Ok::<(), FetchError>(())
    });
    event
  }

  async fn await_resolution(
    &self,
    event: Rc<DnsEvent>,
    key: &ConnectionKey,
  ) -> DnsOutcome {
    event.done.wait::<FetchError>().await?;
    let result = event.result.borrow().clone();
    result.unwrap_or_else(|| {
      Err(FetchError::Connection {
        key: key.to_string(),
        message: "host resolution produced no result".into(),
      })
    })
  }

  /// Address candidates for a request: `(first batch, pending refresh)`.
  /// The refresh handle is set when stale cached addresses were returned
  /// while a background re-resolution is in flight.
  async fn host_candidates(
    &self,
    request: &ClientRequest,
    target: &Url,
  ) -> Result<(Vec<SocketAddr>, Option<Rc<DnsEvent>>), FetchError> {
    let host = target.raw_host().unwrap_or_default().to_string();
    let port = target
      .port()
      .unwrap_or(if target.is_secure() { 443 } else { 80 });

    if is_ip_address(&host) {
      let stripped = host
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(&host);
      let address: IpAddr = stripped.parse().map_err(|_| {
        FetchError::InvalidUrl(format!("invalid ip literal: {host:?}"))
      })?;
      return Ok((vec![SocketAddr::new(address, port)], None));
    }

    let dns_key: DnsKey = (host.to_ascii_lowercase(), port);
    let cached = self.inner.dns_cache.borrow().get(&dns_key).cloned();
    if let Some(container) = cached {
      if !container.expired() {
        return Ok((container.next_addresses(), None));
      }
      // Serve stale addresses now, refresh in the background.
      let stale = container.next_addresses();
      let event = self.start_resolution(
        dns_key.0.clone(),
        port,
        request.connection_key(),
      );
      return Ok((stale, Some(event)));
    }

    let key = request.connection_key();
    let event = self.start_resolution(dns_key.0.clone(), port, key.clone());
    let container = self.await_resolution(event, &key).await?;
    Ok((container.next_addresses(), None))
  }

  // -- dialing --------------------------------------------------------------

  fn ssl_config_for(
    &self,
    request: &ClientRequest,
  ) -> Option<std::sync::Arc<rustls::ClientConfig>> {
    if !request.is_ssl() {
      return None;
    }
    let mode = match &request.ssl {
      SslMode::Default => self.inner.default_ssl.borrow().clone(),
      explicit => explicit.clone(),
    };
    Some(match mode {
      SslMode::Default => cinder_tls::default_client_config(),
      SslMode::Unverified | SslMode::Fingerprint(_) => {
        cinder_tls::unverified_client_config()
      }
      SslMode::Config(config) => config,
    })
  }

  async fn create_connection(
    &self,
    request: &mut ClientRequest,
  ) -> Result<HttpProtocol, FetchError> {
    if request.proxy_url.is_some() {
      self.create_proxy_connection(request).await
    } else {
      self.create_direct_connection(request).await
    }
  }

  async fn dial_candidates(
    &self,
    request: &ClientRequest,
    target: &Url,
    server_host_name: &str,
  ) -> Result<HttpProtocol, FetchError> {
    let key = request.connection_key();
    let ssl_config = self.ssl_config_for(request);
    let fingerprint = request.fingerprint().cloned();

    let (first_batch, refresh) =
      self.host_candidates(request, target).await?;
    let mut refresh = refresh;
    let mut last_error: Option<FetchError> = None;
    let mut tried: Vec<SocketAddr> = Vec::new();

    let mut batches: Vec<Vec<SocketAddr>> = vec![first_batch];
    loop {
      let Some(batch) = batches.pop() else {
        // Stale candidates are exhausted; if a refresh is in flight, wait
        // for it and try the addresses the cache did not already hand out.
        let Some(event) = refresh.take() else {
          break;
        };
        match self.await_resolution(event, &key).await {
          Ok(container) => {
            let complement: Vec<SocketAddr> = container
              .next_addresses()
              .into_iter()
              .filter(|address| !tried.contains(address))
              .collect();
            if complement.is_empty() {
              break;
            }
            batches.push(complement);
            continue;
          }
          Err(error) => {
            last_error = Some(error);
            break;
          }
        }
      };

      for address in batch {
        if tried.contains(&address) {
          continue;
        }
        tried.push(address);
        let transport = match TcpTransport::connect(
          &self.inner.event_loop,
          address,
        )
        .await
        {
          Ok(transport) => transport,
          Err(error) => {
            log::debug!("connect to {address} failed: {error}");
            last_error = Some(FetchError::Connection {
              key: key.to_string(),
              message: error.to_string(),
            });
            continue;
          }
        };

        let protocol = HttpProtocol::new(&self.inner.event_loop);
        if let Some(config) = &ssl_config {
          // A TLS failure aborts the whole dial: it is a handshake
          // problem with this host, not a reachability problem.
          let (tls, handshake) = start_tls_client(
            &self.inner.event_loop,
            transport as Rc<dyn Transport>,
            config.clone(),
            server_host_name,
          )
          .map_err(|error| FetchError::Connection {
            key: key.to_string(),
            message: error.to_string(),
          })?;
          handshake.await.map_err(|error| FetchError::Connection {
            key: key.to_string(),
            message: error.to_string(),
          })?;
          TlsTransport::attach(&tls, Rc::new(protocol.clone()));
          if let Some(fingerprint) = &fingerprint {
            if let Err(error) = fingerprint.check(&tls.extra_info()) {
              protocol.close_transport(true);
              last_error = Some(error);
              continue;
            }
          }
        } else {
          cinder_core::TcpTransport::attach(
            &transport,
            Rc::new(protocol.clone()),
          );
        }
        return Ok(protocol);
      }
    }

    Err(last_error.unwrap_or_else(|| FetchError::Connection {
      key: key.to_string(),
      message: "no address candidates".into(),
    }))
  }

  async fn create_direct_connection(
    &self,
    request: &ClientRequest,
  ) -> Result<HttpProtocol, FetchError> {
    let target = request.url.clone();
    let server_host_name = request.host();
    self.dial_candidates(request, &target, &server_host_name).await
  }

  /// Connects through an HTTP proxy. Plain-HTTP targets keep talking to
  /// the proxy (with `Proxy-Authorization` and absolute-form targets);
  /// HTTPS targets tunnel via CONNECT and then start TLS in place with
  /// the origin's server name.
  async fn create_proxy_connection(
    &self,
    request: &mut ClientRequest,
  ) -> Result<HttpProtocol, FetchError> {
    let proxy_url = match &request.proxy_url {
      Some(url) => url.clone(),
      None => {
        return Err(FetchError::InvalidUrl("missing proxy url".into()));
      }
    };
    let key = request.connection_key();

    let proxy_options = RequestOptions {
      auth: request.proxy_auth.clone(),
      ..Default::default()
    };
    let proxy_request = ClientRequest::new(
      &self.inner.event_loop,
      names::METHOD_GET,
      proxy_url.clone(),
      &proxy_options,
    )?;
    let proxy_host = proxy_request.host();
    let protocol = self
      .dial_candidates(&proxy_request, &proxy_url, &proxy_host)
      .await?;

    let proxy_authorization =
      request.proxy_auth.as_ref().map(|auth| auth.encode());

    if !request.is_ssl() {
      if let Some(value) = proxy_authorization {
        request.headers.setdefault(names::PROXY_AUTHORIZATION, value);
      }
      request.via_plain_proxy = true;
      return Ok(protocol);
    }

    // CONNECT tunnel for HTTPS targets.
    let mut connect_headers = Headers::new();
    let authority = format!("{}:{}", request.host(), request.port());
    connect_headers.append(names::HOST, authority.clone());
    if let Some(value) = proxy_authorization {
      connect_headers.append(names::PROXY_AUTHORIZATION, value);
    }
    protocol.write_http_request(
      names::METHOD_CONNECT,
      &authority,
      &connect_headers,
      cinder_http::HttpVersion::V11,
    )?;
    let response_protocol = protocol.clone();
    let message = protocol
      .set_payload_reader(async move {
        response_protocol.read_http_response().await
      })
      .await?;
    if message.status != 200 {
      protocol.close_transport(true);
      return Err(FetchError::Proxy {
        status: message.status,
        reason: message.reason.clone().unwrap_or_default(),
      });
    }

    let transport =
      protocol.transport().ok_or_else(|| FetchError::Connection {
        key: key.to_string(),
        message: "proxy transport vanished before the TLS start".into(),
      })?;
    let ssl_config = self.ssl_config_for(request).unwrap_or_else(
      cinder_tls::default_client_config,
    );
    let (tls, handshake) = start_tls_client(
      &self.inner.event_loop,
      transport,
      ssl_config,
      &request.host(),
    )
    .map_err(|error| FetchError::Connection {
      key: key.to_string(),
      message: error.to_string(),
    })?;
    handshake.await.map_err(|error| FetchError::Connection {
      key: key.to_string(),
      message: error.to_string(),
    })?;
    let tunneled = HttpProtocol::new(&self.inner.event_loop);
    TlsTransport::attach(&tls, Rc::new(tunneled.clone()));
    if let Some(fingerprint) = request.fingerprint() {
      if let Err(error) = fingerprint.check(&tls.extra_info()) {
        tunneled.close_transport(true);
        return Err(error);
      }
    }
    Ok(tunneled)
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn connector() -> (EventLoop, Connector) {
    let event_loop = EventLoop::new().unwrap();
    let connector = Connector::new(&event_loop);
    (event_loop, connector)
  }

  fn key(host: &str) -> ConnectionKey {
    ConnectionKey {
      host: host.to_string(),
      port: 80,
      is_ssl: false,
      proxy: None,
      proxy_auth: None,
      fingerprint: None,
    }
  }

  #[test]
  fn rotation_is_round_robin() {
    let addresses: Vec<SocketAddr> = vec![
      "10.0.0.1:80".parse().unwrap(),
      "10.0.0.2:80".parse().unwrap(),
      "10.0.0.3:80".parse().unwrap(),
    ];
    let container = HostInfoContainer::new(addresses.clone());
    let first = container.next_addresses();
    let second = container.next_addresses();
    assert_eq!(first[0], addresses[0]);
    assert_eq!(second[0], addresses[1]);
    assert_eq!(second[2], addresses[0]);
    let third = container.next_addresses();
    assert_eq!(third[0], addresses[2]);
  }

  #[test]
  fn container_expiry_follows_timestamp() {
    let container =
      HostInfoContainer::new(vec!["10.0.0.1:80".parse().unwrap()]);
    assert!(!container.expired());
    let aged = HostInfoContainer {
      addresses: container.addresses.clone(),
      rotation_index: Cell::new(0),
      timestamp: loop_time() - DNS_CACHE_TIMEOUT - 1.0,
    };
    assert!(aged.expired());
  }

  #[test]
  fn release_moves_between_acquired_and_idle() {
    let (event_loop, connector) = connector();
    let protocol = HttpProtocol::new(&event_loop);
    let key = key("example.com");

    connector
      .inner
      .acquired
      .borrow_mut()
      .insert(protocol.id(), protocol.clone());
    assert_eq!(connector.pool_counts(), (0, 1));

    // A transport-less protocol reports `should_close`-free state only
    // when pristine; this one is pristine, so it pools.
    connector.release(&key, protocol.clone(), false);
    assert_eq!(connector.pool_counts(), (1, 0));
  }

  #[test]
  fn release_with_close_discards() {
    let (event_loop, connector) = connector();
    let protocol = HttpProtocol::new(&event_loop);
    let key = key("example.com");
    connector
      .inner
      .acquired
      .borrow_mut()
      .insert(protocol.id(), protocol.clone());
    connector.release(&key, protocol, true);
    assert_eq!(connector.pool_counts(), (0, 0));
  }
}
