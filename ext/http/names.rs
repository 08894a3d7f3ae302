// Copyright 2026 the Cinder authors. MIT license.

//! Header names and methods used across the HTTP, WebSocket and client
//! layers. Kept as plain string constants; the header map compares names
//! case-insensitively anyway.

pub const AUTHORIZATION: &str = "Authorization";
pub const CONNECTION: &str = "Connection";
pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
pub const CONTENT_ENCODING: &str = "Content-Encoding";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const COOKIE: &str = "Cookie";
pub const DATE: &str = "Date";
pub const HOST: &str = "Host";
pub const LOCATION: &str = "Location";
pub const ORIGIN: &str = "Origin";
pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";
pub const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
pub const SEC_WEBSOCKET_EXTENSIONS: &str = "Sec-WebSocket-Extensions";
pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
pub const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";
pub const SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";
pub const SERVER: &str = "Server";
pub const SET_COOKIE: &str = "Set-Cookie";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const UPGRADE: &str = "Upgrade";

pub const METHOD_CONNECT: &str = "CONNECT";
pub const METHOD_DELETE: &str = "DELETE";
pub const METHOD_GET: &str = "GET";
pub const METHOD_HEAD: &str = "HEAD";
pub const METHOD_OPTIONS: &str = "OPTIONS";
pub const METHOD_PATCH: &str = "PATCH";
pub const METHOD_POST: &str = "POST";
pub const METHOD_PUT: &str = "PUT";
