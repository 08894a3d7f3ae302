// Copyright 2026 the Cinder authors. MIT license.

use cinder_core::EventLoop;
use cinder_http::names;
use cinder_url::Url;

use crate::connector::Connector;
use crate::error::FetchError;
use crate::request::ClientRequest;
use crate::request::RequestBody;
use crate::request::RequestOptions;
use crate::response::ClientResponse;

const DEFAULT_MAX_REDIRECTS: usize = 10;

const REDIRECT_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];

/// High-level HTTP client over a pooled connector.
#[derive(Clone)]
pub struct HttpClient {
  event_loop: EventLoop,
  connector: Connector,
  max_redirects: usize,
  /// RFC-strict redirects keep the method on 301/302; the lax default
  /// downgrades POST to GET the way browsers do.
  strict_redirects: bool,
}

impl HttpClient {
  pub fn new(event_loop: &EventLoop) -> HttpClient {
    HttpClient::with_connector(event_loop, Connector::new(event_loop))
  }

  pub fn with_connector(
    event_loop: &EventLoop,
    connector: Connector,
  ) -> HttpClient {
    HttpClient {
      event_loop: event_loop.clone(),
      connector,
      max_redirects: DEFAULT_MAX_REDIRECTS,
      strict_redirects: false,
    }
  }

  pub fn event_loop(&self) -> &EventLoop {
    &self.event_loop
  }

  pub fn connector(&self) -> &Connector {
    &self.connector
  }

  pub fn set_strict_redirects(&mut self, strict: bool) {
    self.strict_redirects = strict;
  }

  pub fn set_max_redirects(&mut self, max_redirects: usize) {
    self.max_redirects = max_redirects;
  }

  pub fn close(&self) {
    self.connector.close();
  }

  /// Performs a request, following redirects up to the configured limit.
  /// The returned response has its head read; the body is drained by the
  /// caller.
  pub async fn request(
    &self,
    method: &str,
    url: Url,
    options: RequestOptions,
  ) -> Result<ClientResponse, FetchError> {
    let mut method = method.to_ascii_uppercase();
    let mut url = url;
    let mut options = options;
    let max_redirects =
      options.max_redirects.unwrap_or(self.max_redirects);
    let mut history: Vec<ClientResponse> = Vec::new();

    loop {
      let mut request =
        ClientRequest::new(&self.event_loop, &method, url.clone(), &options)?;
      if let Some(cookie_header) =
        self.connector.cookie_header_for(&request.url)
      {
        request.headers.setdefault(names::COOKIE, cookie_header);
      }

      let connection = self.connector.connect(&mut request).await?;
      let response = request.send(&connection)?;
      response.start().await?;

      let response_headers = response.headers();
      self.connector.update_cookies(
        &url,
        &response_headers.get_all(names::SET_COOKIE),
      );

      let status = response.status();
      if !REDIRECT_STATUSES.contains(&status) {
        response.set_history(history);
        return Ok(response);
      }
      if history.len() >= max_redirects {
        response.close();
        return Err(FetchError::TooManyRedirects);
      }

      let Some(location) = response_headers.get(names::LOCATION) else {
        // A redirect status without a target is handed to the caller.
        response.set_history(history);
        return Ok(response);
      };
      let next_url = url.join(location)?;
      if !matches!(next_url.scheme(), "http" | "https" | "ws" | "wss") {
        response.close();
        return Err(FetchError::InvalidUrl(format!(
          "redirected to unsupported scheme: {next_url}"
        )));
      }
      log::debug!("redirect {status}: {url} -> {next_url}");

      let downgrade = status == 303
        || (!self.strict_redirects
          && matches!(status, 301 | 302)
          && method == names::METHOD_POST);
      if downgrade && method != names::METHOD_HEAD {
        method = names::METHOD_GET.to_string();
        options.body = RequestBody::Empty;
        options.compression = None;
        options.headers.pop_all(names::CONTENT_LENGTH);
        options.headers.pop_all(names::CONTENT_TYPE);
        options.headers.pop_all(names::TRANSFER_ENCODING);
        options.headers.pop_all(names::CONTENT_ENCODING);
      }
      // The Host header of the previous hop must not leak along.
      options.headers.pop_all(names::HOST);

      response.release();
      history.push(response);
      url = next_url;
    }
  }

  pub async fn get(&self, url: Url) -> Result<ClientResponse, FetchError> {
    self
      .request(names::METHOD_GET, url, RequestOptions::default())
      .await
  }

  pub async fn post(
    &self,
    url: Url,
    body: RequestBody,
  ) -> Result<ClientResponse, FetchError> {
    let options = RequestOptions {
      body,
      ..Default::default()
    };
    self.request(names::METHOD_POST, url, options).await
  }
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;
  use std::cell::RefCell;
  use std::rc::Rc;

  use bytes::Bytes;
  use cinder_core::CoreError;
  use cinder_core::Protocol;
  use cinder_core::TcpServer;
  use cinder_core::Transport;
  use pretty_assertions::assert_eq;

  use super::*;

  type Router = Rc<dyn Fn(&str) -> (Vec<u8>, bool)>;

  fn path_of(head: &str) -> &str {
    head
      .lines()
      .next()
      .and_then(|line| line.split(' ').nth(1))
      .unwrap_or("/")
  }

  struct TestServerProtocol {
    transport: RefCell<Option<Rc<dyn Transport>>>,
    buffer: RefCell<Vec<u8>>,
    router: Router,
  }

  impl Protocol for TestServerProtocol {
    fn connection_made(&self, transport: Rc<dyn Transport>) {
      *self.transport.borrow_mut() = Some(transport);
    }

    fn connection_lost(&self, _error: Option<CoreError>) {
      *self.transport.borrow_mut() = None;
    }

    fn data_received(&self, data: Bytes) {
      let mut buffer = self.buffer.borrow_mut();
      buffer.extend_from_slice(&data);
      loop {
        let Some(head_end) = memchr::memmem::find(&buffer, b"\r\n\r\n")
        else {
          return;
        };
        let head =
          String::from_utf8_lossy(&buffer[..head_end]).into_owned();
        // Consume the body too, or it would masquerade as the next
        // request's head on a reused connection.
        let body_length = head
          .lines()
          .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name
              .trim()
              .eq_ignore_ascii_case("content-length")
              .then(|| value.trim().parse::<usize>().ok())?
          })
          .unwrap_or(0);
        let total = head_end + 4 + body_length;
        if buffer.len() < total {
          return;
        }
        buffer.drain(..total);

        let (response, close_after) = (self.router)(&head);
        if let Some(transport) = self.transport.borrow().as_ref() {
          transport.write(&response);
          if close_after {
            transport.close();
            return;
          }
        }
      }
    }
  }

  fn spawn_server(
    event_loop: &EventLoop,
    router: Router,
  ) -> (Rc<TcpServer>, Rc<Cell<usize>>, Url) {
    let accepts = Rc::new(Cell::new(0usize));
    let accepts_in_factory = accepts.clone();
    let server = event_loop
      .create_server_to(
        move |_| {
          accepts_in_factory.set(accepts_in_factory.get() + 1);
          Rc::new(TestServerProtocol {
            transport: RefCell::new(None),
            buffer: RefCell::new(Vec::new()),
            router: router.clone(),
          }) as Rc<dyn Protocol>
        },
        "127.0.0.1:0".parse().unwrap(),
      )
      .unwrap();
    let url =
      Url::parse(&format!("http://127.0.0.1:{}/", server.local_addr().port()))
        .unwrap();
    (server, accepts, url)
  }

  #[test]
  fn chunked_get_reads_body_and_pools_connection() {
    let event_loop = EventLoop::new().unwrap();
    let router: Router = Rc::new(|_head| {
      (
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
          .to_vec(),
        false,
      )
    });
    let (server, _accepts, url) = spawn_server(&event_loop, router);
    let client = HttpClient::new(&event_loop);

    let lp = event_loop.clone();
    let inner_client = client.clone();
    let body = event_loop
      .run_until(async move {
        let response = inner_client.get(url).await?;
        assert_eq!(response.status(), 200);
        let body = response.read().await?;
        // Give the release callback a tick to run.
        cinder_core::sleep::<FetchError>(&lp, 0.01).await?;
        Ok::<_, FetchError>(body)
      })
      .unwrap();
    assert_eq!(&body[..], b"hello world");
    assert_eq!(client.connector().pool_counts(), (1, 0));
    server.close();
  }

  #[test]
  fn http10_body_until_eof_closes_connection() {
    let event_loop = EventLoop::new().unwrap();
    let router: Router = Rc::new(|_head| {
      (b"HTTP/1.0 200 OK\r\n\r\nabcdef".to_vec(), true)
    });
    let (server, _accepts, url) = spawn_server(&event_loop, router);
    let client = HttpClient::new(&event_loop);

    let lp = event_loop.clone();
    let inner_client = client.clone();
    let body = event_loop
      .run_until(async move {
        let response = inner_client.get(url).await?;
        let body = response.read().await?;
        cinder_core::sleep::<FetchError>(&lp, 0.01).await?;
        Ok::<_, FetchError>(body)
      })
      .unwrap();
    assert_eq!(&body[..], b"abcdef");
    // HTTP/1.0 without keep-alive must not be pooled.
    assert_eq!(client.connector().pool_counts(), (0, 0));
    server.close();
  }

  #[test]
  fn sequential_requests_reuse_one_connection() {
    let event_loop = EventLoop::new().unwrap();
    let router: Router = Rc::new(|_head| {
      (
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec(),
        false,
      )
    });
    let (server, accepts, url) = spawn_server(&event_loop, router);
    let client = HttpClient::new(&event_loop);

    let lp = event_loop.clone();
    let inner_client = client.clone();
    event_loop
      .run_until(async move {
        for _ in 0..2 {
          let response = inner_client.get(url.clone()).await?;
          let body = response.read().await?;
          assert_eq!(&body[..], b"ok");
          cinder_core::sleep::<FetchError>(&lp, 0.01).await?;
        }
        Ok::<_, FetchError>(())
      })
      .unwrap();
    assert_eq!(accepts.get(), 1);
    server.close();
  }

  #[test]
  fn redirects_are_followed_with_history() {
    let event_loop = EventLoop::new().unwrap();
    let router: Router = Rc::new(|head| match path_of(head) {
      "/" => (
        b"HTTP/1.1 302 Found\r\nLocation: /next\r\nContent-Length: 0\r\n\r\n"
          .to_vec(),
        false,
      ),
      _ => (
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nfinal".to_vec(),
        false,
      ),
    });
    let (server, _accepts, url) = spawn_server(&event_loop, router);
    let client = HttpClient::new(&event_loop);

    let inner_client = client.clone();
    let (status, body, history_len) = event_loop
      .run_until(async move {
        let response = inner_client.get(url).await?;
        let body = response.read().await?;
        Ok::<_, FetchError>((
          response.status(),
          body,
          response.history().len(),
        ))
      })
      .unwrap();
    assert_eq!(status, 200);
    assert_eq!(&body[..], b"final");
    assert_eq!(history_len, 1);
    server.close();
  }

  #[test]
  fn post_downgrades_to_get_on_303() {
    let event_loop = EventLoop::new().unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in_router = seen.clone();
    let router: Router = Rc::new(move |head| {
      let path = path_of(head);
      seen_in_router.borrow_mut().push(path.to_string());
      match path {
        "/submit" => (
          b"HTTP/1.1 303 See Other\r\nLocation: /done\r\nContent-Length: 0\r\n\r\n"
            .to_vec(),
          false,
        ),
        _ => (
          b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone".to_vec(),
          false,
        ),
      }
    });
    let (server, _accepts, base) = spawn_server(&event_loop, router);
    let client = HttpClient::new(&event_loop);

    let target = base.join("/submit").unwrap();
    let inner_client = client.clone();
    let status = event_loop
      .run_until(async move {
        let response = inner_client
          .post(target, RequestBody::Text("payload".into()))
          .await?;
        Ok::<_, FetchError>(response.status())
      })
      .unwrap();
    assert_eq!(status, 200);
    assert_eq!(*seen.borrow(), vec!["/submit", "/done"]);
    server.close();
  }

  #[test]
  fn cookies_flow_back_on_matching_origin() {
    let event_loop = EventLoop::new().unwrap();
    let cookie_seen = Rc::new(RefCell::new(String::new()));
    let router: Router = Rc::new(|head| match path_of(head) {
      "/set" => (
        b"HTTP/1.1 200 OK\r\nSet-Cookie: sid=xyz; Path=/\r\nContent-Length: 0\r\n\r\n"
          .to_vec(),
        false,
      ),
      _ => (
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
        false,
      ),
    });
    let (server, _accepts, base) = spawn_server(&event_loop, router);
    let client = HttpClient::new(&event_loop);

    let inner_client = client.clone();
    let set_url = base.join("/set").unwrap();
    let data_url = base.join("/data").unwrap();
    event_loop
      .run_until(async move {
        let response = inner_client.get(set_url).await?;
        response.read().await?;
        assert_eq!(response.cookies().len(), 1);
        let response = inner_client.get(data_url).await?;
        response.read().await?;
        Ok::<_, FetchError>(())
      })
      .unwrap();
    assert_eq!(
      client.connector().cookie_header_for(&base),
      Some("sid=xyz".to_string())
    );
    drop(cookie_seen);
    server.close();
  }

  #[test]
  fn plain_http_via_proxy_uses_absolute_form() {
    let event_loop = EventLoop::new().unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in_router = seen.clone();
    let router: Router = Rc::new(move |head| {
      seen_in_router.borrow_mut().push(head.to_string());
      (
        b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nproxied!".to_vec(),
        false,
      )
    });
    let (server, _accepts, proxy_url) = spawn_server(&event_loop, router);
    let client = HttpClient::new(&event_loop);

    let options = RequestOptions {
      proxy: Some(proxy_url),
      proxy_auth: Some(cinder_http::BasicAuth::new("squid", "pw")),
      ..Default::default()
    };
    let inner_client = client.clone();
    let body = event_loop
      .run_until(async move {
        let response = inner_client
          .request(
            "GET",
            Url::parse("http://backend.test/data").unwrap(),
            options,
          )
          .await?;
        let body = response.read().await?;
        Ok::<_, FetchError>(body)
      })
      .unwrap();
    assert_eq!(&body[..], b"proxied!");

    let heads = seen.borrow();
    assert_eq!(heads.len(), 1);
    // Absolute-form target and the proxy credentials on the request line.
    assert!(heads[0].starts_with("GET http://backend.test/data HTTP/1.1"));
    assert!(heads[0].contains("Proxy-Authorization: Basic "));
    server.close();
  }

  #[test]
  fn refused_connect_tunnel_surfaces_proxy_error() {
    let event_loop = EventLoop::new().unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in_router = seen.clone();
    let router: Router = Rc::new(move |head| {
      seen_in_router.borrow_mut().push(head.to_string());
      (
        b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n".to_vec(),
        false,
      )
    });
    let (server, _accepts, proxy_url) = spawn_server(&event_loop, router);
    let client = HttpClient::new(&event_loop);

    let options = RequestOptions {
      proxy: Some(proxy_url),
      ..Default::default()
    };
    let inner_client = client.clone();
    let result = event_loop.run_until(async move {
      inner_client
        .request(
          "GET",
          Url::parse("https://api.example/").unwrap(),
          options,
        )
        .await
        .map(|_| ())
    });
    match result {
      Err(FetchError::Proxy { status, .. }) => assert_eq!(status, 403),
      other => panic!("expected a proxy error, got {other:?}"),
    }

    let heads = seen.borrow();
    assert_eq!(heads.len(), 1);
    assert!(heads[0].starts_with("CONNECT api.example:443 HTTP/1.1"));
    assert!(heads[0].contains("Host: api.example:443"));
    server.close();
  }
}
