// Copyright 2026 the Cinder authors. MIT license.

//! The RFC 6455 frame codec: bit-packed head byte, masking, the wire
//! reader over the buffered protocol and the writer.

use bytes::Bytes;
use cinder_http::HttpError;
use cinder_http::HttpProtocol;
use rand::RngCore;

use crate::error::WebSocketError;

pub const OP_CONTINUOUS: u8 = 0;
pub const OP_TEXT: u8 = 1;
pub const OP_BINARY: u8 = 2;
pub const OP_CLOSE: u8 = 8;
pub const OP_PING: u8 = 9;
pub const OP_PONG: u8 = 10;

const FIN_BIT: u8 = 0b1000_0000;
const RSV_BITS: u8 = 0b0111_0000;
const OPCODE_BITS: u8 = 0b0000_1111;

/// XORs `data` with the 4-byte mask, cycling; applying the same mask twice
/// restores the input.
pub fn apply_mask(mask: [u8; 4], data: &[u8]) -> Vec<u8> {
  let mut output = data.to_vec();
  for (index, byte) in output.iter_mut().enumerate() {
    *byte ^= mask[index & 3];
  }
  output
}

/// One WebSocket frame: the head byte packs FIN, the three reserved bits
/// and the opcode; the payload is already unmasked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebSocketFrame {
  pub head: u8,
  pub data: Bytes,
}

impl WebSocketFrame {
  pub fn new(is_final: bool, opcode: u8, data: Bytes) -> WebSocketFrame {
    WebSocketFrame {
      head: ((is_final as u8) << 7) | (opcode & OPCODE_BITS),
      data,
    }
  }

  pub fn from_head(head: u8, data: Bytes) -> WebSocketFrame {
    WebSocketFrame { head, data }
  }

  pub fn is_final(&self) -> bool {
    self.head & FIN_BIT != 0
  }

  pub fn rsv1(&self) -> bool {
    self.head & 0b0100_0000 != 0
  }

  pub fn rsv2(&self) -> bool {
    self.head & 0b0010_0000 != 0
  }

  pub fn rsv3(&self) -> bool {
    self.head & 0b0001_0000 != 0
  }

  pub fn opcode(&self) -> u8 {
    self.head & OPCODE_BITS
  }

  pub fn is_control(&self) -> bool {
    self.opcode() >= OP_CLOSE
  }

  /// Validates the frame invariants: reserved bits clear (unless an
  /// extension claimed them), control frames final and short, opcode
  /// defined.
  pub fn check(&self) -> Result<(), WebSocketError> {
    self.check_with_claimed_rsv(0)
  }

  pub fn check_with_claimed_rsv(
    &self,
    claimed_rsv: u8,
  ) -> Result<(), WebSocketError> {
    if self.head & RSV_BITS & !claimed_rsv != 0 {
      return Err(WebSocketError::protocol("reserved bits must be zero"));
    }
    match self.opcode() {
      OP_CONTINUOUS | OP_TEXT | OP_BINARY => Ok(()),
      OP_CLOSE | OP_PING | OP_PONG => {
        if self.data.len() > 125 {
          return Err(WebSocketError::protocol("control frame too long"));
        }
        if !self.is_final() {
          return Err(WebSocketError::protocol(
            "fragmented control frame",
          ));
        }
        Ok(())
      }
      opcode => Err(WebSocketError::Protocol(format!(
        "invalid opcode: {opcode}"
      ))),
    }
  }
}

/// Reads one frame off the wire. `is_client` decides the masking
/// direction: servers must mask nothing, clients must mask everything,
/// and a violation is a protocol error. Payloads longer than `max_size`
/// are rejected before they are read.
pub async fn read_frame(
  protocol: &HttpProtocol,
  is_client: bool,
  max_size: Option<usize>,
) -> Result<WebSocketFrame, WebSocketError> {
  let head = protocol.read_exactly(2).await?;
  let head_byte = head[0];
  let second = head[1];

  let masked = second & 0b1000_0000 != 0;
  if masked == is_client {
    return Err(WebSocketError::protocol("Incorrect masking"));
  }

  let short_length = (second & 0b0111_1111) as usize;
  let length = match short_length {
    126 => {
      let extended = protocol.read_exactly(2).await?;
      u16::from_be_bytes([extended[0], extended[1]]) as usize
    }
    127 => {
      let extended = protocol.read_exactly(8).await?;
      let mut bytes = [0u8; 8];
      bytes.copy_from_slice(&extended);
      let length = u64::from_be_bytes(bytes);
      usize::try_from(length).map_err(|_| {
        WebSocketError::Http(HttpError::payload(
          "frame length does not fit the address space",
        ))
      })?
    }
    length => length,
  };

  if let Some(max_size) = max_size {
    if length > max_size {
      return Err(WebSocketError::Http(HttpError::payload(format!(
        "payload length exceeds size limit ({length} > {max_size} bytes)"
      ))));
    }
  }

  let data = if masked {
    let mask = protocol.read_exactly(4).await?;
    let mut mask_bytes = [0u8; 4];
    mask_bytes.copy_from_slice(&mask);
    let payload = protocol.read_exactly(length).await?;
    Bytes::from(apply_mask(mask_bytes, &payload))
  } else {
    protocol.read_exactly(length).await?
  };

  Ok(WebSocketFrame::from_head(head_byte, data))
}

/// Serializes a frame for the wire. The client side masks with a fresh
/// random key; the server side never masks.
pub fn encode_frame(frame: &WebSocketFrame, is_client: bool) -> Vec<u8> {
  let mask_bit: u8 = (is_client as u8) << 7;
  let length = frame.data.len();
  let mut wire = Vec::with_capacity(length + 14);
  wire.push(frame.head);
  if length < 126 {
    wire.push(mask_bit | length as u8);
  } else if length < 65536 {
    wire.push(mask_bit | 126);
    wire.extend_from_slice(&(length as u16).to_be_bytes());
  } else {
    wire.push(mask_bit | 127);
    wire.extend_from_slice(&(length as u64).to_be_bytes());
  }
  if is_client {
    let mut mask = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut mask);
    wire.extend_from_slice(&mask);
    wire.extend_from_slice(&apply_mask(mask, &frame.data));
  } else {
    wire.extend_from_slice(&frame.data);
  }
  wire
}

/// Writes a frame through the protocol's transport.
pub fn write_frame(
  protocol: &HttpProtocol,
  frame: &WebSocketFrame,
  is_client: bool,
) -> Result<(), WebSocketError> {
  protocol.write(&encode_frame(frame, is_client))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use cinder_core::EventLoop;
  use cinder_core::Protocol as _;
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn mask_is_an_involution() {
    let mask = [0x12, 0x34, 0x56, 0x78];
    let data = b"some partly long masked payload".to_vec();
    let masked = apply_mask(mask, &data);
    assert_ne!(masked, data);
    assert_eq!(apply_mask(mask, &masked), data);
  }

  #[test]
  fn check_rules_for_control_frames() {
    let ping =
      WebSocketFrame::new(true, OP_PING, Bytes::from(vec![0u8; 125]));
    ping.check().unwrap();

    let too_long =
      WebSocketFrame::new(true, OP_PING, Bytes::from(vec![0u8; 126]));
    assert!(too_long.check().is_err());

    let fragmented = WebSocketFrame::new(false, OP_CLOSE, Bytes::new());
    assert!(fragmented.check().is_err());

    let bad_opcode = WebSocketFrame::new(true, 5, Bytes::new());
    assert!(bad_opcode.check().is_err());

    let mut reserved = WebSocketFrame::new(true, OP_TEXT, Bytes::new());
    reserved.head |= 0b0100_0000;
    assert!(reserved.check().is_err());
    reserved.check_with_claimed_rsv(0b0100_0000).unwrap();
  }

  fn decode_via_protocol(
    wire: &[u8],
    is_client: bool,
  ) -> Result<WebSocketFrame, WebSocketError> {
    let event_loop = EventLoop::new().unwrap();
    let protocol = HttpProtocol::new(&event_loop);
    protocol.data_received(Bytes::copy_from_slice(wire));
    protocol.eof_received();
    let reader = protocol.clone();
    event_loop.run_until(async move {
      read_frame(&reader, is_client, Some(1 << 26)).await
    })
  }

  #[test]
  fn encode_decode_round_trip_unmasked() {
    // Server to client: unmasked; the receiving side is the client.
    for payload_len in [0usize, 5, 126, 70000] {
      let frame = WebSocketFrame::new(
        true,
        OP_BINARY,
        Bytes::from(vec![0xAB; payload_len]),
      );
      let wire = encode_frame(&frame, false);
      let decoded = decode_via_protocol(&wire, true).unwrap();
      assert_eq!(decoded, frame);
    }
  }

  #[test]
  fn encode_decode_round_trip_masked() {
    // Client to server: masked on the wire, unmasked after decode.
    let frame =
      WebSocketFrame::new(true, OP_TEXT, Bytes::from_static(b"hello"));
    let wire = encode_frame(&frame, true);
    assert_ne!(&wire[6..], b"hello");
    let decoded = decode_via_protocol(&wire, false).unwrap();
    assert_eq!(decoded, frame);
  }

  #[test]
  fn masking_direction_is_enforced() {
    let frame =
      WebSocketFrame::new(true, OP_TEXT, Bytes::from_static(b"x"));
    // An unmasked frame arriving at a server is a protocol error.
    let wire = encode_frame(&frame, false);
    assert!(matches!(
      decode_via_protocol(&wire, false),
      Err(WebSocketError::Protocol(_))
    ));
    // A masked frame arriving at a client is a protocol error.
    let wire = encode_frame(&frame, true);
    assert!(matches!(
      decode_via_protocol(&wire, true),
      Err(WebSocketError::Protocol(_))
    ));
  }

  #[test]
  fn oversized_payload_is_rejected_before_reading() {
    let frame =
      WebSocketFrame::new(true, OP_BINARY, Bytes::from(vec![0u8; 200]));
    let wire = encode_frame(&frame, false);
    let result = {
      let event_loop = EventLoop::new().unwrap();
      let protocol = HttpProtocol::new(&event_loop);
      protocol.data_received(Bytes::copy_from_slice(&wire));
      let reader = protocol.clone();
      event_loop.run_until(async move {
        read_frame(&reader, true, Some(100)).await
      })
    };
    assert!(matches!(
      result,
      Err(WebSocketError::Http(HttpError::Payload(_)))
    ));
  }
}
