// Copyright 2026 the Cinder authors. MIT license.

use crate::compression::ContentEncoder;
use crate::error::HttpError;
use crate::protocol::HttpProtocol;

/// After this many written bytes the stream writer waits for a drain.
pub const WRITE_CHUNK_LIMIT: usize = 65536;

/// Chunks above this size are split before compression or framing.
pub const BIG_CHUNK_LIMIT: usize = 65536;

/// Reason phrases for the statuses this stack emits or tests against.
pub fn status_phrase(status: u16) -> &'static str {
  match status {
    100 => "Continue",
    101 => "Switching Protocols",
    200 => "OK",
    201 => "Created",
    202 => "Accepted",
    204 => "No Content",
    206 => "Partial Content",
    301 => "Moved Permanently",
    302 => "Found",
    303 => "See Other",
    304 => "Not Modified",
    307 => "Temporary Redirect",
    308 => "Permanent Redirect",
    400 => "Bad Request",
    401 => "Unauthorized",
    403 => "Forbidden",
    404 => "Not Found",
    405 => "Method Not Allowed",
    408 => "Request Timeout",
    413 => "Payload Too Large",
    426 => "Upgrade Required",
    429 => "Too Many Requests",
    500 => "Internal Server Error",
    502 => "Bad Gateway",
    503 => "Service Unavailable",
    504 => "Gateway Timeout",
    _ => "",
  }
}

fn chunk_frame(payload: &[u8]) -> Vec<u8> {
  let mut framed = Vec::with_capacity(payload.len() + 16);
  framed.extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
  framed.extend_from_slice(payload);
  framed.extend_from_slice(b"\r\n");
  framed
}

/// Streaming writer for an outgoing body: compresses when configured,
/// wraps in chunked framing when the message is chunked, and waits for the
/// transport to drain every [`WRITE_CHUNK_LIMIT`] bytes.
pub struct HttpStreamWriter {
  protocol: HttpProtocol,
  compressor: Option<ContentEncoder>,
  chunked: bool,
  size: usize,
  at_eof: bool,
}

impl HttpStreamWriter {
  pub fn new(
    protocol: HttpProtocol,
    compression: Option<&str>,
    chunked: bool,
  ) -> Result<HttpStreamWriter, HttpError> {
    let compressor = ContentEncoder::for_encoding(compression)?;
    Ok(HttpStreamWriter {
      protocol,
      compressor,
      chunked,
      size: 0,
      at_eof: false,
    })
  }

  fn write_raw(&mut self, chunk: &[u8]) -> Result<(), HttpError> {
    self.size += chunk.len();
    match self.protocol.transport() {
      Some(transport) if !transport.is_closing() => {
        transport.write(chunk);
        Ok(())
      }
      _ => Err(HttpError::Connection(
        "cannot write to a closing transport".into(),
      )),
    }
  }

  /// Writes one body chunk, compressing and chunk-framing as configured.
  pub async fn write(&mut self, chunk: &[u8]) -> Result<(), HttpError> {
    let chunk = match self.compressor.as_mut() {
      Some(compressor) => compressor.compress(chunk)?,
      None => chunk.to_vec(),
    };
    if chunk.is_empty() {
      return Ok(());
    }
    if self.chunked {
      self.write_raw(&chunk_frame(&chunk))?;
    } else {
      self.write_raw(&chunk)?;
    }
    if self.size > WRITE_CHUNK_LIMIT {
      self.size = 0;
      self.drain().await?;
    }
    Ok(())
  }

  /// Flushes the compressor, writes the final chunk and the chunked
  /// terminator, then drains. Idempotent.
  pub async fn write_eof(&mut self, chunk: &[u8]) -> Result<(), HttpError> {
    if self.at_eof {
      return Ok(());
    }
    let mut tail = match self.compressor.as_mut() {
      Some(compressor) => {
        let mut tail = compressor.compress(chunk)?;
        tail.extend(compressor.finish()?);
        tail
      }
      None => chunk.to_vec(),
    };
    if self.chunked {
      if tail.is_empty() {
        tail = b"0\r\n\r\n".to_vec();
      } else {
        let mut framed = chunk_frame(&tail);
        framed.extend_from_slice(b"0\r\n\r\n");
        tail = framed;
      }
    }
    if !tail.is_empty() {
      self.write_raw(&tail)?;
    }
    self.drain().await?;
    self.at_eof = true;
    Ok(())
  }

  pub async fn drain(&mut self) -> Result<(), HttpError> {
    self.protocol.drain().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chunk_frames_use_hex_lengths() {
    let framed = chunk_frame(b"hello world, this is a long chunk");
    assert!(framed.starts_with(b"21\r\n"));
    assert!(framed.ends_with(b"\r\n"));
  }

  #[test]
  fn known_phrases() {
    assert_eq!(status_phrase(200), "OK");
    assert_eq!(status_phrase(101), "Switching Protocols");
    assert_eq!(status_phrase(418), "");
  }
}
