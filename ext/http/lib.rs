// Copyright 2026 the Cinder authors. MIT license.

//! HTTP/1.1 wire protocol for Cinder: a buffered read protocol with
//! resumable payload readers, a hand-rolled message parser/writer, content
//! codings, multipart and form-data payloads, and the header multimap
//! shared by the client and the WebSocket layers.

mod auth;
mod compression;
mod content_disposition;
mod error;
mod form_data;
mod headers;
mod message;
mod mime;
mod multipart;
pub mod names;
mod protocol;
mod writer;

pub use crate::auth::BasicAuth;
pub use crate::compression::ContentDecoder;
pub use crate::compression::ContentEncoder;
pub use crate::content_disposition::build_content_disposition_header;
pub use crate::error::HttpError;
pub use crate::form_data::FormData;
pub use crate::form_data::FormValue;
pub use crate::form_data::GeneratedForm;
pub use crate::headers::Headers;
pub use crate::message::HttpVersion;
pub use crate::message::RawRequestMessage;
pub use crate::message::RawResponseMessage;
pub use crate::mime::MimeType;
pub use crate::multipart::MultipartReader;
pub use crate::multipart::MultipartWriter;
pub use crate::multipart::Payload;
pub use crate::protocol::HttpProtocol;
pub use crate::protocol::MAX_LINE_LENGTH;
pub use crate::writer::status_phrase;
pub use crate::writer::HttpStreamWriter;
pub use crate::writer::BIG_CHUNK_LIMIT;
pub use crate::writer::WRITE_CHUNK_LIMIT;
