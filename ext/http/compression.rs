// Copyright 2026 the Cinder authors. MIT license.

//! Content-coding support. gzip and deflate stream through flate2's write
//! decoders chunk by chunk; brotli buffers and runs once at `finish`, which
//! keeps the error mapping identical while avoiding brotli's streaming
//! state machine.

use std::io::Write;

use flate2::write::GzDecoder;
use flate2::write::GzEncoder;
use flate2::write::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::HttpError;

const BROTLI_QUALITY: i32 = 5;
const BROTLI_LG_WINDOW: i32 = 22;

fn payload_error(stage: &str) -> HttpError {
  HttpError::payload(format!("cannot decompress {stage}"))
}

/// Incremental decoder for a response or part body.
#[derive(Debug)]
pub enum ContentDecoder {
  Gzip(GzDecoder<Vec<u8>>),
  Deflate(ZlibDecoder<Vec<u8>>),
  Brotli(Vec<u8>),
}

impl ContentDecoder {
  /// Decoder for a `Content-Encoding` value. `identity`, the empty string
  /// and an absent header need no decoder; anything else outside the
  /// accepted set is a [`HttpError::ContentEncoding`].
  pub fn for_encoding(
    encoding: Option<&str>,
  ) -> Result<Option<ContentDecoder>, HttpError> {
    match encoding {
      None | Some("") | Some("identity") => Ok(None),
      Some("gzip") => Ok(Some(ContentDecoder::Gzip(GzDecoder::new(Vec::new())))),
      Some("deflate") => {
        Ok(Some(ContentDecoder::Deflate(ZlibDecoder::new(Vec::new()))))
      }
      Some("br") => Ok(Some(ContentDecoder::Brotli(Vec::new()))),
      Some(other) => Err(HttpError::ContentEncoding(format!(
        "unsupported content encoding: {other:?}"
      ))),
    }
  }

  pub fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, HttpError> {
    match self {
      ContentDecoder::Gzip(decoder) => {
        decoder.write_all(data).map_err(|_| payload_error("chunk"))?;
        decoder.flush().map_err(|_| payload_error("chunk"))?;
        Ok(std::mem::take(decoder.get_mut()))
      }
      ContentDecoder::Deflate(decoder) => {
        decoder.write_all(data).map_err(|_| payload_error("chunk"))?;
        decoder.flush().map_err(|_| payload_error("chunk"))?;
        Ok(std::mem::take(decoder.get_mut()))
      }
      ContentDecoder::Brotli(buffer) => {
        buffer.extend_from_slice(data);
        Ok(Vec::new())
      }
    }
  }

  /// Flushes whatever the coder still holds. Truncated streams surface
  /// here as payload errors.
  pub fn finish(&mut self) -> Result<Vec<u8>, HttpError> {
    match self {
      ContentDecoder::Gzip(decoder) => {
        decoder.try_finish().map_err(|_| payload_error("stream tail"))?;
        Ok(std::mem::take(decoder.get_mut()))
      }
      ContentDecoder::Deflate(decoder) => {
        decoder.try_finish().map_err(|_| payload_error("stream tail"))?;
        Ok(std::mem::take(decoder.get_mut()))
      }
      ContentDecoder::Brotli(buffer) => {
        let input = std::mem::take(buffer);
        let mut output = Vec::new();
        brotli::BrotliDecompress(&mut input.as_slice(), &mut output)
          .map_err(|_| payload_error("brotli stream"))?;
        Ok(output)
      }
    }
  }
}

/// Incremental encoder for an outgoing body.
pub enum ContentEncoder {
  Gzip(GzEncoder<Vec<u8>>),
  Deflate(ZlibEncoder<Vec<u8>>),
  Brotli(Vec<u8>),
}

impl ContentEncoder {
  /// Encoder for a compression name; `None` when the name needs no coder.
  /// Unknown names are rejected the same way the decoder side rejects
  /// them.
  pub fn for_encoding(
    encoding: Option<&str>,
  ) -> Result<Option<ContentEncoder>, HttpError> {
    match encoding {
      None | Some("") | Some("identity") => Ok(None),
      Some("gzip") => Ok(Some(ContentEncoder::Gzip(GzEncoder::new(
        Vec::new(),
        Compression::default(),
      )))),
      Some("deflate") => Ok(Some(ContentEncoder::Deflate(ZlibEncoder::new(
        Vec::new(),
        Compression::default(),
      )))),
      Some("br") => Ok(Some(ContentEncoder::Brotli(Vec::new()))),
      Some(other) => Err(HttpError::ContentEncoding(format!(
        "unsupported content encoding: {other:?}"
      ))),
    }
  }

  pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>, HttpError> {
    match self {
      ContentEncoder::Gzip(encoder) => {
        encoder
          .write_all(data)
          .map_err(|_| payload_error("outgoing chunk"))?;
        encoder.flush().map_err(|_| payload_error("outgoing chunk"))?;
        Ok(std::mem::take(encoder.get_mut()))
      }
      ContentEncoder::Deflate(encoder) => {
        encoder
          .write_all(data)
          .map_err(|_| payload_error("outgoing chunk"))?;
        encoder.flush().map_err(|_| payload_error("outgoing chunk"))?;
        Ok(std::mem::take(encoder.get_mut()))
      }
      ContentEncoder::Brotli(buffer) => {
        buffer.extend_from_slice(data);
        Ok(Vec::new())
      }
    }
  }

  pub fn finish(&mut self) -> Result<Vec<u8>, HttpError> {
    match self {
      ContentEncoder::Gzip(encoder) => {
        encoder
          .try_finish()
          .map_err(|_| payload_error("outgoing tail"))?;
        Ok(std::mem::take(encoder.get_mut()))
      }
      ContentEncoder::Deflate(encoder) => {
        encoder
          .try_finish()
          .map_err(|_| payload_error("outgoing tail"))?;
        Ok(std::mem::take(encoder.get_mut()))
      }
      ContentEncoder::Brotli(buffer) => {
        let input = std::mem::take(buffer);
        let mut output = Vec::new();
        let mut params = brotli::enc::BrotliEncoderParams::default();
        params.quality = BROTLI_QUALITY;
        params.lgwin = BROTLI_LG_WINDOW;
        brotli::BrotliCompress(&mut input.as_slice(), &mut output, &params)
          .map_err(|_| payload_error("outgoing brotli stream"))?;
        Ok(output)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_encoding_is_rejected() {
    match ContentDecoder::for_encoding(Some("zstd")) {
      Err(HttpError::ContentEncoding(_)) => {}
      other => panic!("expected content encoding error, got {other:?}"),
    }
  }

  #[test]
  fn identity_needs_no_decoder() {
    assert!(ContentDecoder::for_encoding(None).unwrap().is_none());
    assert!(ContentDecoder::for_encoding(Some("")).unwrap().is_none());
    assert!(
      ContentDecoder::for_encoding(Some("identity")).unwrap().is_none()
    );
  }

  #[test]
  fn gzip_round_trip_in_pieces() {
    let mut encoder =
      ContentEncoder::for_encoding(Some("gzip")).unwrap().unwrap();
    let mut wire = Vec::new();
    wire.extend(encoder.compress(b"hello ").unwrap());
    wire.extend(encoder.compress(b"world").unwrap());
    wire.extend(encoder.finish().unwrap());

    let mut decoder =
      ContentDecoder::for_encoding(Some("gzip")).unwrap().unwrap();
    let mut decoded = Vec::new();
    // Feed one byte at a time to exercise resumability.
    for byte in wire {
      decoded.extend(decoder.decompress(&[byte]).unwrap());
    }
    decoded.extend(decoder.finish().unwrap());
    assert_eq!(decoded, b"hello world");
  }

  #[test]
  fn deflate_round_trip() {
    let mut encoder =
      ContentEncoder::for_encoding(Some("deflate")).unwrap().unwrap();
    let mut wire = Vec::new();
    wire.extend(encoder.compress(b"abc").unwrap());
    wire.extend(encoder.finish().unwrap());

    let mut decoder =
      ContentDecoder::for_encoding(Some("deflate")).unwrap().unwrap();
    let mut decoded = decoder.decompress(&wire).unwrap();
    decoded.extend(decoder.finish().unwrap());
    assert_eq!(decoded, b"abc");
  }

  #[test]
  fn brotli_round_trip() {
    let mut encoder =
      ContentEncoder::for_encoding(Some("br")).unwrap().unwrap();
    assert!(encoder.compress(b"brotli body").unwrap().is_empty());
    let wire = encoder.finish().unwrap();

    let mut decoder =
      ContentDecoder::for_encoding(Some("br")).unwrap().unwrap();
    decoder.decompress(&wire).unwrap();
    assert_eq!(decoder.finish().unwrap(), b"brotli body");
  }

  #[test]
  fn garbage_fails_as_payload_error() {
    let mut decoder =
      ContentDecoder::for_encoding(Some("gzip")).unwrap().unwrap();
    let mut failed = decoder.decompress(b"definitely not gzip").is_err();
    failed |= decoder.finish().is_err();
    assert!(failed);
  }
}
