//! WebSocket frame codec
//!
//! Implements RFC 6455 frame parsing and serialization: an incremental
//! decoder that retains its buffer position across partial reads, and an
//! encoder that masks on the client send path.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::mask::apply_mask;
use crate::{MEDIUM_PAYLOAD_THRESHOLD, SMALL_PAYLOAD_THRESHOLD};

/// RSV1 bit as it appears in the first header byte
pub const RSV1: u8 = 0x40;
/// RSV2 bit as it appears in the first header byte
pub const RSV2: u8 = 0x20;
/// RSV3 bit as it appears in the first header byte
pub const RSV3: u8 = 0x10;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse an opcode nibble. The reserved ranges (0x3-0x7, 0xB-0xF) are
    /// rejected.
    #[inline]
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::UnknownOpCode(other)),
        }
    }

    /// Check if this is a control opcode
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data opcode
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1 (claimed by permessage-deflate when negotiated)
    pub rsv1: bool,
    /// RSV2
    pub rsv2: bool,
    /// RSV3
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag (set iff sent by a client)
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (when masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Reserved bits packed as they appear in the first header byte.
    #[inline]
    pub fn rsv_bits(&self) -> u8 {
        let mut bits = 0;
        if self.rsv1 {
            bits |= RSV1;
        }
        if self.rsv2 {
            bits |= RSV2;
        }
        if self.rsv3 {
            bits |= RSV3;
        }
        bits
    }
}

/// A complete WebSocket frame with an unmasked payload
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (already unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            header: FrameHeader {
                fin,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode,
                masked: false,
                payload_len: payload.len() as u64,
                mask: None,
            },
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data.into(), true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data.into(), true)
    }

    /// Create a close frame with code and reason
    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Create a close frame with a verbatim payload
    #[inline]
    pub fn close_raw(payload: Bytes) -> Self {
        Self::new(OpCode::Close, payload, true)
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Replace the payload, keeping the header flags consistent.
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.header.payload_len = payload.len() as u64;
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for a complete header
    Header,
    /// Header parsed, waiting for the payload
    Payload,
}

/// Incremental frame decoder
///
/// Feeds on a `BytesMut` the caller keeps appending transport bytes to.
/// `decode` consumes exactly one frame's worth of bytes per `Some` result
/// and leaves the buffer untouched when the frame is still incomplete.
pub struct FrameDecoder {
    state: DecodeState,
    /// Header of the frame currently being received
    header: Option<FrameHeader>,
    /// Maximum accepted payload length per frame
    max_frame_size: usize,
    /// Whether inbound frames must be masked (true when decoding as server)
    expect_masked: bool,
    /// Reserved bits claimed by negotiated extensions (RSV1|RSV2|RSV3 set)
    allowed_rsv: u8,
}

impl FrameDecoder {
    /// Create a decoder. `expect_masked` is true for the server role.
    pub fn new(max_frame_size: usize, expect_masked: bool) -> Self {
        Self {
            state: DecodeState::Header,
            header: None,
            max_frame_size,
            expect_masked,
            allowed_rsv: 0,
        }
    }

    /// Declare the reserved bits covered by negotiated extensions.
    pub fn set_allowed_rsv(&mut self, bits: u8) {
        self.allowed_rsv = bits & (RSV1 | RSV2 | RSV3);
    }

    /// Decode one frame from `buf`.
    ///
    /// Returns `Ok(Some(frame))` when a complete frame was consumed,
    /// `Ok(None)` when more bytes are needed (the buffer is retained), and
    /// an error on any framing violation.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }

                    let b0 = buf[0];
                    let b1 = buf[1];

                    let rsv = b0 & (RSV1 | RSV2 | RSV3);
                    if rsv & !self.allowed_rsv != 0 {
                        return Err(Error::InvalidReservedBits);
                    }

                    let fin = b0 & 0x80 != 0;
                    let opcode = OpCode::from_u8(b0 & 0x0F)?;

                    if opcode.is_control() && !fin {
                        return Err(Error::ControlFrameShouldNotBeFragmented);
                    }

                    let masked = b1 & 0x80 != 0;
                    if self.expect_masked && !masked {
                        return Err(Error::Protocol("client frames must be masked"));
                    }
                    if !self.expect_masked && masked {
                        return Err(Error::Protocol("server frames must not be masked"));
                    }

                    let len_byte = b1 & 0x7F;
                    let len_len = match len_byte {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_len = 2 + len_len + if masked { 4 } else { 0 };
                    if buf.len() < header_len {
                        return Ok(None);
                    }

                    let payload_len = match len_byte {
                        126 => {
                            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                            if len < 126 {
                                return Err(Error::Protocol("payload length not minimal"));
                            }
                            len
                        }
                        127 => {
                            let len = u64::from_be_bytes([
                                buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                            ]);
                            if len <= u16::MAX as u64 {
                                return Err(Error::Protocol("payload length not minimal"));
                            }
                            if len >> 63 != 0 {
                                return Err(Error::Protocol("payload length MSB must be 0"));
                            }
                            len
                        }
                        n => n as u64,
                    };

                    if opcode.is_control() && payload_len > 125 {
                        return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
                    }
                    if payload_len > self.max_frame_size as u64 {
                        return Err(Error::MessageTooLarge);
                    }

                    let mask = if masked {
                        let at = 2 + len_len;
                        Some([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
                    } else {
                        None
                    };

                    buf.advance(header_len);
                    self.header = Some(FrameHeader {
                        fin,
                        rsv1: rsv & RSV1 != 0,
                        rsv2: rsv & RSV2 != 0,
                        rsv3: rsv & RSV3 != 0,
                        opcode,
                        masked,
                        payload_len,
                        mask,
                    });
                    self.state = DecodeState::Payload;
                }

                DecodeState::Payload => {
                    let header = self.header.as_ref().ok_or(Error::Protocol("decoder state"))?;
                    let payload_len = header.payload_len as usize;

                    if buf.len() < payload_len {
                        return Ok(None);
                    }

                    let mut payload = buf.split_to(payload_len);
                    if let Some(mask) = header.mask {
                        apply_mask(&mut payload, mask);
                    }

                    let frame = Frame {
                        header: self.header.take().ok_or(Error::Protocol("decoder state"))?,
                        payload: payload.freeze(),
                    };

                    self.state = DecodeState::Header;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

/// Encode a frame into `buf`.
///
/// The header length form is minimal for the payload size. When `mask` is
/// given (client role) the payload is copied into the buffer and XOR-masked
/// in place; servers pass `None` and the payload is copied verbatim.
pub fn encode_frame(buf: &mut BytesMut, frame: &Frame, mask: Option<[u8; 4]>) {
    let payload = &frame.payload;
    let payload_len = payload.len();

    let header_size = 2
        + if payload_len > MEDIUM_PAYLOAD_THRESHOLD {
            8
        } else if payload_len > SMALL_PAYLOAD_THRESHOLD {
            2
        } else {
            0
        }
        + if mask.is_some() { 4 } else { 0 };
    buf.reserve(header_size + payload_len);

    let mut b0 = frame.header.opcode as u8;
    if frame.header.fin {
        b0 |= 0x80;
    }
    b0 |= frame.header.rsv_bits();
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload_len <= SMALL_PAYLOAD_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_PAYLOAD_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(key) = mask {
        buf.put_slice(&key);
        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], key);
    } else {
        buf.put_slice(payload);
    }
}
