//! WebSocket frame codec (RFC 6455).
//!
//! Frames are decoded incrementally out of a [`BytesMut`] read buffer:
//! [`Frame::decode`] returns `Ok(None)` until a complete frame is
//! buffered, then consumes exactly that frame's bytes. Encoding always
//! produces a single complete frame.

use bytes::{Buf, BytesMut};

/// Largest payload a single frame may carry. Connections sending more
/// are closed with a protocol error.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame-level protocol violations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown websocket opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("websocket frame of {0} bytes exceeds limit")]
    Oversized(usize),
}

/// WebSocket opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte & 0x0F {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Close, ping and pong are control frames; they are never fragmented.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A single WebSocket frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create an unmasked text frame.
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            mask: None,
            payload: data.into().into_bytes(),
        }
    }

    /// Create an unmasked binary frame.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            mask: None,
            payload: data.into(),
        }
    }

    /// Create a ping frame.
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Ping,
            mask: None,
            payload: data.into(),
        }
    }

    /// Create a pong frame.
    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            mask: None,
            payload: data.into(),
        }
    }

    /// Create a close frame with a status code and reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());

        Self {
            fin: true,
            opcode: Opcode::Close,
            mask: None,
            payload,
        }
    }

    /// Apply a client masking key. Clients must mask every frame they
    /// send; servers never do.
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Status code carried by a close frame, if any.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode == Opcode::Close && self.payload.len() >= 2 {
            Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
        } else {
            None
        }
    }

    /// Encode the frame to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut buf = Vec::with_capacity(len + 14);

        // First byte: FIN + opcode
        let first_byte = if self.fin { 0x80 } else { 0x00 } | (self.opcode as u8);
        buf.push(first_byte);

        // Second byte: MASK bit + payload length
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };

        if len < 126 {
            buf.push(mask_bit | (len as u8));
        } else if len < 65536 {
            buf.push(mask_bit | 126);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            buf.push(mask_bit | 127);
            buf.extend_from_slice(&(len as u64).to_be_bytes());
        }

        if let Some(mask) = self.mask {
            buf.extend_from_slice(&mask);
            for (i, byte) in self.payload.iter().enumerate() {
                buf.push(byte ^ mask[i % 4]);
            }
        } else {
            buf.extend_from_slice(&self.payload);
        }

        buf
    }

    /// Decode one frame from the front of `buf`, consuming its bytes.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; the buffer is left untouched so more bytes can be read.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        let data = &buf[..];
        if data.len() < 2 {
            return Ok(None);
        }

        let fin = (data[0] & 0x80) != 0;
        let opcode =
            Opcode::from_u8(data[0]).ok_or_else(|| FrameError::UnknownOpcode(data[0] & 0x0F))?;
        let masked = (data[1] & 0x80) != 0;
        let mut payload_len = (data[1] & 0x7F) as usize;
        let mut offset = 2;

        // Extended payload length
        if payload_len == 126 {
            if data.len() < 4 {
                return Ok(None);
            }
            payload_len = u16::from_be_bytes([data[2], data[3]]) as usize;
            offset = 4;
        } else if payload_len == 127 {
            if data.len() < 10 {
                return Ok(None);
            }
            payload_len = u64::from_be_bytes([
                data[2], data[3], data[4], data[5], data[6], data[7], data[8], data[9],
            ]) as usize;
            offset = 10;
        }

        // Reject before buffering the payload, not after.
        if payload_len > MAX_FRAME_SIZE {
            return Err(FrameError::Oversized(payload_len));
        }

        let mask = if masked {
            if data.len() < offset + 4 {
                return Ok(None);
            }
            let mask = [
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ];
            offset += 4;
            Some(mask)
        } else {
            None
        };

        if data.len() < offset + payload_len {
            return Ok(None);
        }

        let mut payload = data[offset..offset + payload_len].to_vec();
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        buf.advance(offset + payload_len);

        Ok(Some(Frame {
            fin,
            opcode,
            mask,
            payload,
        }))
    }
}
