// Copyright 2026 the Cinder authors. MIT license.

//! Multipart bodies: a part-by-part reader over the buffered protocol and
//! a writer that composes labeled payloads under a shared boundary.

use base64::Engine;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::compression::ContentDecoder;
use crate::compression::ContentEncoder;
use crate::content_disposition::build_content_disposition_header;
use crate::error::HttpError;
use crate::headers::Headers;
use crate::mime::MimeType;
use crate::names;
use crate::protocol::content_length;
use crate::protocol::HttpProtocol;
use crate::writer::HttpStreamWriter;

const ACCEPTED_CONTENT_ENCODINGS: [&str; 5] =
  ["", "identity", "deflate", "gzip", "br"];
const ACCEPTED_TRANSFER_ENCODINGS: [&str; 4] =
  ["", "base64", "quoted-printable", "binary"];

/// Decodes a quoted-printable body; soft line breaks vanish, `=XX` escapes
/// become bytes, anything malformed passes through literally.
pub(crate) fn quoted_printable_decode(data: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(data.len());
  let mut index = 0;
  while index < data.len() {
    let byte = data[index];
    if byte != b'=' {
      out.push(byte);
      index += 1;
      continue;
    }
    if data[index + 1..].starts_with(b"\r\n") {
      index += 3;
      continue;
    }
    if let Some(hex) = data.get(index + 1..index + 3) {
      if let Ok(text) = std::str::from_utf8(hex) {
        if let Ok(value) = u8::from_str_radix(text, 16) {
          out.push(value);
          index += 3;
          continue;
        }
      }
    }
    out.push(byte);
    index += 1;
  }
  out
}

/// Encodes a body as quoted-printable with soft breaks around column 75.
pub(crate) fn quoted_printable_encode(data: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(data.len());
  let mut column = 0;
  for &byte in data {
    let encoded_len =
      if byte == b'=' || !(0x20..0x7f).contains(&byte) { 3 } else { 1 };
    if column + encoded_len > 75 {
      out.extend_from_slice(b"=\r\n");
      column = 0;
    }
    if encoded_len == 3 {
      out.extend_from_slice(format!("={byte:02X}").as_bytes());
    } else {
      out.push(byte);
    }
    column += encoded_len;
  }
  out
}

fn decode_part_body(
  headers: &Headers,
  data: Bytes,
) -> Result<Vec<u8>, HttpError> {
  let mut body: Vec<u8> = match headers.get(names::CONTENT_TRANSFER_ENCODING)
  {
    None => data.to_vec(),
    Some(encoding) => match encoding.to_ascii_lowercase().as_str() {
      "base64" => {
        let compact: Vec<u8> = data
          .iter()
          .copied()
          .filter(|byte| !byte.is_ascii_whitespace())
          .collect();
        base64::engine::general_purpose::STANDARD
          .decode(compact)
          .map_err(|_| {
            HttpError::payload("invalid base64 in multipart body")
          })?
      }
      "quoted-printable" => quoted_printable_decode(&data),
      "binary" | "7bit" | "8bit" => data.to_vec(),
      other => {
        return Err(HttpError::payload(format!(
          "unknown transfer encoding: {other:?}"
        )));
      }
    },
  };
  if let Some(encoding) = headers.get(names::CONTENT_ENCODING) {
    let encoding = encoding.to_ascii_lowercase();
    if let Some(mut decoder) =
      ContentDecoder::for_encoding(Some(encoding.as_str()))?
    {
      let mut decoded = decoder
        .decompress(&body)
        .map_err(|_| HttpError::payload("cannot decompress data"))?;
      decoded.extend(
        decoder
          .finish()
          .map_err(|_| HttpError::payload("cannot decompress data"))?,
      );
      body = decoded;
    }
  }
  Ok(body)
}

async fn read_part(
  protocol: HttpProtocol,
  boundary: Vec<u8>,
  is_first: bool,
) -> Result<(bool, Option<Headers>, Option<Bytes>), HttpError> {
  if is_first {
    let mut lead = b"--".to_vec();
    lead.extend_from_slice(&boundary);
    protocol.read_until(&lead).await?;
    let first = match protocol.read_exactly(2).await {
      Ok(first) => first,
      Err(HttpError::Eof(_)) => return Ok((false, None, None)),
      Err(error) => return Err(error),
    };
    if &first[..] == b"--" {
      let second = match protocol.read_exactly(2).await {
        Ok(second) => second,
        Err(HttpError::Eof(_)) => return Ok((false, None, None)),
        Err(error) => return Err(error),
      };
      if &second[..] == b"\r\n" {
        return Ok((false, None, None));
      }
      return Err(HttpError::payload(
        "multipart boundary not closed with '--' + CRLF",
      ));
    }
    if &first[..] != b"\r\n" {
      return Err(HttpError::payload(
        "multipart boundary not followed by CRLF or '--'",
      ));
    }
  }

  let headers = protocol.read_http_headers().await?;

  let part = match content_length(&headers)? {
    Some(length) => {
      let part = protocol.read_exactly(length).await?;
      let mut closing = b"\r\n--".to_vec();
      closing.extend_from_slice(&boundary);
      let trailer = match protocol.read_exactly(closing.len()).await {
        Ok(trailer) => trailer,
        Err(HttpError::Eof(_)) => {
          return Ok((false, Some(headers), Some(part)));
        }
        Err(error) => return Err(error),
      };
      if trailer[..] != closing[..] {
        return Err(HttpError::payload(
          "multipart part not terminated by its boundary",
        ));
      }
      part
    }
    None => {
      let mut closing = b"\r\n--".to_vec();
      closing.extend_from_slice(&boundary);
      protocol.read_until(&closing).await?
    }
  };

  let first = match protocol.read_exactly(2).await {
    Ok(first) => first,
    Err(HttpError::Eof(_)) => return Ok((false, Some(headers), Some(part))),
    Err(error) => return Err(error),
  };
  if &first[..] == b"\r\n" {
    return Ok((true, Some(headers), Some(part)));
  }
  if &first[..] == b"--" {
    let second = match protocol.read_exactly(2).await {
      Ok(second) => second,
      Err(HttpError::Eof(_)) => {
        return Ok((false, Some(headers), Some(part)));
      }
      Err(error) => return Err(error),
    };
    if &second[..] == b"\r\n" {
      return Ok((false, Some(headers), Some(part)));
    }
    return Err(HttpError::payload(
      "multipart boundary not closed with '--' + CRLF",
    ));
  }
  Err(HttpError::payload(
    "multipart boundary not followed by CRLF or '--'",
  ))
}

/// Streams the parts of a multipart body, decoding per-part transfer and
/// content encodings.
pub struct MultipartReader {
  protocol: HttpProtocol,
  boundary: Vec<u8>,
  is_first: bool,
  done: bool,
}

impl MultipartReader {
  pub fn new(
    protocol: HttpProtocol,
    headers: &Headers,
  ) -> Result<MultipartReader, HttpError> {
    let content_type = headers.get(names::CONTENT_TYPE).ok_or_else(|| {
      HttpError::payload("multipart body without a Content-Type header")
    })?;
    let mime = MimeType::parse(content_type);
    let boundary = mime.parameter("boundary").ok_or_else(|| {
      HttpError::payload("multipart Content-Type without a boundary")
    })?;
    Ok(MultipartReader {
      protocol,
      boundary: boundary.as_bytes().to_vec(),
      is_first: true,
      done: false,
    })
  }

  /// Next `(headers, body)` pair, or `None` after the closing boundary.
  pub async fn next_part(
    &mut self,
  ) -> Result<Option<(Headers, Vec<u8>)>, HttpError> {
    loop {
      if self.done {
        return Ok(None);
      }
      let reader = read_part(
        self.protocol.clone(),
        self.boundary.clone(),
        self.is_first,
      );
      let (is_more, headers, data) =
        self.protocol.set_payload_reader(reader).await?;
      self.is_first = false;
      if !is_more {
        self.done = true;
      }
      if let (Some(headers), Some(data)) = (headers, data) {
        let body = decode_part_body(&headers, data)?;
        return Ok(Some((headers, body)));
      }
    }
  }
}

/// One labeled body inside a multipart message.
#[derive(Clone, Debug)]
pub struct Payload {
  pub data: Bytes,
  pub content_type: String,
  pub headers: Headers,
}

impl Payload {
  pub fn bytes(data: impl Into<Bytes>) -> Payload {
    Payload {
      data: data.into(),
      content_type: "application/octet-stream".to_string(),
      headers: Headers::new(),
    }
  }

  pub fn text(text: impl AsRef<str>) -> Payload {
    Payload {
      data: Bytes::copy_from_slice(text.as_ref().as_bytes()),
      content_type: "text/plain; charset=utf-8".to_string(),
      headers: Headers::new(),
    }
  }

  pub fn json(value: &serde_json::Value) -> Payload {
    Payload {
      data: Bytes::from(value.to_string().into_bytes()),
      content_type: "application/json".to_string(),
      headers: Headers::new(),
    }
  }

  pub fn with_content_type(mut self, content_type: impl Into<String>) -> Payload {
    self.content_type = content_type.into();
    self
  }

  /// Attaches a `Content-Disposition` header built from the parameters.
  pub fn set_content_disposition(
    &mut self,
    disposition_type: &str,
    parameters: &[(String, String)],
    quote_fields: bool,
  ) -> Result<(), HttpError> {
    let header = build_content_disposition_header(
      disposition_type,
      parameters,
      quote_fields,
    )?;
    self.headers.replace(names::CONTENT_DISPOSITION, header);
    Ok(())
  }
}

fn random_boundary() -> String {
  let suffix: String = rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(16)
    .map(char::from)
    .collect();
  format!("----------{suffix}")
}

/// Composes multiple payload parts into one `multipart/<subtype>` stream.
pub struct MultipartWriter {
  boundary: String,
  sub_type: String,
  parts: Vec<(Headers, Bytes)>,
}

impl MultipartWriter {
  pub fn new(sub_type: &str, boundary: Option<String>) -> MultipartWriter {
    MultipartWriter {
      boundary: boundary.unwrap_or_else(random_boundary),
      sub_type: sub_type.to_string(),
      parts: Vec::new(),
    }
  }

  pub fn boundary(&self) -> &str {
    &self.boundary
  }

  /// The value for the enclosing message's `Content-Type` header.
  pub fn content_type(&self) -> String {
    format!("multipart/{}; boundary={}", self.sub_type, self.boundary)
  }

  /// Appends a payload, applying and validating its encodings. Unknown
  /// `Content-Encoding` or `Content-Transfer-Encoding` values are errors;
  /// when neither alters the size, the part gets a `Content-Length`.
  pub fn append(&mut self, payload: Payload) -> Result<(), HttpError> {
    let mut headers = payload.headers;
    headers.setdefault(names::CONTENT_TYPE, payload.content_type.clone());

    let content_encoding = headers
      .get(names::CONTENT_ENCODING)
      .map(|value| value.to_ascii_lowercase())
      .unwrap_or_default();
    if !ACCEPTED_CONTENT_ENCODINGS.contains(&content_encoding.as_str()) {
      return Err(HttpError::ContentEncoding(format!(
        "unsupported content encoding: {content_encoding:?}"
      )));
    }
    let transfer_encoding = headers
      .get(names::CONTENT_TRANSFER_ENCODING)
      .map(|value| value.to_ascii_lowercase())
      .unwrap_or_default();
    if !ACCEPTED_TRANSFER_ENCODINGS.contains(&transfer_encoding.as_str()) {
      return Err(HttpError::payload(format!(
        "unsupported content transfer encoding: {transfer_encoding:?}"
      )));
    }

    let mut body: Vec<u8> = payload.data.to_vec();
    let mut size_known = true;
    if let Some(mut encoder) =
      ContentEncoder::for_encoding(Some(content_encoding.as_str()))?
    {
      let mut encoded = encoder.compress(&body)?;
      encoded.extend(encoder.finish()?);
      body = encoded;
      size_known = false;
    }
    match transfer_encoding.as_str() {
      "base64" => {
        body = base64::engine::general_purpose::STANDARD
          .encode(&body)
          .into_bytes();
        size_known = false;
      }
      "quoted-printable" => {
        body = quoted_printable_encode(&body);
        size_known = false;
      }
      _ => {}
    }
    if size_known {
      headers.replace(names::CONTENT_LENGTH, body.len().to_string());
    }

    self.parts.push((headers, Bytes::from(body)));
    Ok(())
  }

  /// Total size of the serialized form.
  pub fn size(&self) -> usize {
    self.serialize().len()
  }

  /// The exact wire form: each part as `--boundary CRLF headers CRLF body
  /// CRLF`, closed by `--boundary-- CRLF`.
  pub fn serialize(&self) -> Vec<u8> {
    let mut out = Vec::new();
    for (headers, body) in &self.parts {
      out.extend_from_slice(b"--");
      out.extend_from_slice(self.boundary.as_bytes());
      out.extend_from_slice(b"\r\n");
      for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
      }
      out.extend_from_slice(b"\r\n");
      out.extend_from_slice(body);
      out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"--");
    out.extend_from_slice(self.boundary.as_bytes());
    out.extend_from_slice(b"--\r\n");
    out
  }

  pub async fn write(
    &self,
    writer: &mut HttpStreamWriter,
  ) -> Result<(), HttpError> {
    writer.write(&self.serialize()).await
  }
}

#[cfg(test)]
mod tests {
  use cinder_core::EventLoop;
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn quoted_printable_round_trip() {
    let original = b"plain =, \xff binary";
    let encoded = quoted_printable_encode(original);
    assert_eq!(quoted_printable_decode(&encoded), original.to_vec());
  }

  #[test]
  fn writer_produces_expected_wire_form() {
    let mut writer =
      MultipartWriter::new("form-data", Some("XBOUND".to_string()));
    let mut part = Payload::text("value-1");
    part
      .set_content_disposition(
        "form-data",
        &[("name".to_string(), "field".to_string())],
        true,
      )
      .unwrap();
    writer.append(part).unwrap();

    let wire = writer.serialize();
    let text = String::from_utf8(wire).unwrap();
    assert_eq!(
      text,
      "--XBOUND\r\n\
Content-Disposition: form-data; name=\"field\"\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 7\r\n\
\r\n\
value-1\r\n\
--XBOUND--\r\n"
    );
  }

  #[test]
  fn writer_rejects_unknown_encodings() {
    let mut writer = MultipartWriter::new("form-data", None);
    let mut payload = Payload::text("x");
    payload.headers.append(names::CONTENT_ENCODING, "zstd");
    assert!(writer.append(payload).is_err());

    let mut payload = Payload::text("x");
    payload
      .headers
      .append(names::CONTENT_TRANSFER_ENCODING, "uuencode");
    assert!(writer.append(payload).is_err());
  }

  #[test]
  fn reader_walks_written_parts() {
    let mut writer =
      MultipartWriter::new("form-data", Some("SPLIT".to_string()));
    let mut first = Payload::text("alpha");
    first
      .set_content_disposition(
        "form-data",
        &[("name".to_string(), "a".to_string())],
        true,
      )
      .unwrap();
    writer.append(first).unwrap();
    let mut second = Payload::bytes(&b"beta-bytes"[..]);
    second
      .headers
      .append(names::CONTENT_TRANSFER_ENCODING, "base64");
    writer.append(second).unwrap();
    let wire = writer.serialize();

    let event_loop = EventLoop::new().unwrap();
    let protocol = HttpProtocol::new(&event_loop);
    use cinder_core::Protocol as _;
    protocol.data_received(Bytes::from(wire));
    protocol.eof_received();

    let mut enclosing = Headers::new();
    enclosing.append(
      names::CONTENT_TYPE,
      "multipart/form-data; boundary=SPLIT",
    );
    let mut reader =
      MultipartReader::new(protocol.clone(), &enclosing).unwrap();

    let parts = event_loop
      .run_until(async move {
        let mut parts = Vec::new();
        while let Some((headers, body)) = reader.next_part().await? {
          parts.push((headers, body));
        }
        Ok::<_, HttpError>(parts)
      })
      .unwrap();

    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].1, b"alpha".to_vec());
    assert_eq!(
      parts[0].0.get(names::CONTENT_DISPOSITION),
      Some("form-data; name=\"a\"")
    );
    assert_eq!(parts[1].1, b"beta-bytes".to_vec());
  }
}
