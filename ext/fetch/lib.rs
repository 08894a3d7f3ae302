// Copyright 2026 the Cinder authors. MIT license.

//! The Cinder HTTP client: request preparation, the response lifecycle,
//! a keep-alive connection pool with a rotating DNS cache, cookies, proxy
//! tunneling and TLS fingerprint pinning.

mod client;
mod connection;
mod connector;
mod cookies;
mod error;
mod fingerprint;
mod request;
mod response;

pub use crate::client::HttpClient;
pub use crate::connection::Connection;
pub use crate::connector::Connector;
pub use crate::connector::DNS_CACHE_TIMEOUT;
pub use crate::connector::KEEP_ALIVE_TIMEOUT;
pub use crate::cookies::Cookie;
pub use crate::cookies::CookieJar;
pub use crate::error::FetchError;
pub use crate::fingerprint::SslFingerprint;
pub use crate::request::ClientRequest;
pub use crate::request::ConnectionKey;
pub use crate::request::RequestBody;
pub use crate::request::RequestOptions;
pub use crate::request::SslMode;
pub use crate::response::ClientResponse;
