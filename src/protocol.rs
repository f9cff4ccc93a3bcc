//! WebSocket protocol state machine
//!
//! Assembles parsed frames into messages, runs negotiated extensions in
//! reverse order on the receive path and forward on the send path, enforces
//! fragmentation invariants and drives the closing handshake.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::error::{CloseReason, Error, Result};
use crate::extension::{compose_rsv_bits, Extension};
use crate::frame::{encode_frame, Frame, FrameDecoder, OpCode};
use crate::mask::generate_mask;
use crate::utf8::validate_utf8;
use crate::Config;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (masks outbound frames)
    Client,
    /// Server (must not mask outbound frames)
    Server,
}

/// A complete WebSocket message, possibly assembled from fragments
#[derive(Debug, Clone)]
pub enum Message {
    /// Text message (UTF-8 validated at delivery)
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
    /// Ping payload
    Ping(Bytes),
    /// Pong payload
    Pong(Bytes),
    /// Close, with the parsed code and reason when present
    Close(Option<CloseReason>),
}

impl Message {
    /// Create a text message
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Check if this is a close message
    #[inline]
    pub fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }

    /// Borrow the payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b,
            Message::Close(_) => &[],
        }
    }

    /// Borrow a text message as `&str`
    ///
    /// Text payloads were UTF-8 validated when the message was assembled.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            // Validated at delivery time
            Message::Text(b) => Some(unsafe { std::str::from_utf8_unchecked(b) }),
            _ => None,
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(Bytes::from(s))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Handshake committed, traffic flows
    Open,
    /// We emitted a close frame, waiting for the peer's
    CloseSent,
    /// The peer's close frame arrived, our echo not yet emitted
    CloseReceived,
    /// Closing handshake finished or connection torn down
    Closed,
}

/// Accumulates the payloads of a fragmented message
struct FragmentBuffer {
    /// Opcode of the first frame
    opcode: OpCode,
    /// Extension indices active for this message, from the first frame's
    /// reserved bits
    active_extensions: Vec<usize>,
    /// Accumulated (already decoded) payload
    buf: BytesMut,
    /// Frames consumed so far
    frames: usize,
}

/// WebSocket protocol handler for one connection
///
/// Owns the frame decoder, the active extension sessions, the fragment
/// buffer and the connection state. All methods are synchronous; the caller
/// feeds transport bytes in and drains encoded bytes out.
pub struct Protocol {
    role: Role,
    state: State,
    decoder: FrameDecoder,
    extensions: Vec<Box<dyn Extension>>,
    fragment: Option<FragmentBuffer>,
    min_non_final_fragment_size: usize,
    max_accumulated_frame_count: usize,
    max_accumulated_frame_size: usize,
    max_frame_size: usize,
    /// Payload of the peer's close frame, echoed back verbatim
    pending_close_echo: Option<Bytes>,
}

impl Protocol {
    /// Create a protocol handler with the given negotiated extensions.
    ///
    /// Fails when the extensions claim overlapping reserved bits.
    pub fn new(role: Role, config: &Config, extensions: Vec<Box<dyn Extension>>) -> Result<Self> {
        let mut decoder = FrameDecoder::new(config.max_frame_size, role == Role::Server);
        decoder.set_allowed_rsv(compose_rsv_bits(&extensions)?);

        Ok(Self {
            role,
            state: State::Open,
            decoder,
            extensions,
            fragment: None,
            min_non_final_fragment_size: config.min_non_final_fragment_size,
            max_accumulated_frame_count: config.max_accumulated_frame_count,
            max_accumulated_frame_size: config.max_accumulated_frame_size,
            max_frame_size: config.max_frame_size,
            pending_close_echo: None,
        })
    }

    /// The endpoint role
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the connection is fully closed
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Whether the closing handshake is in progress
    #[inline]
    pub fn is_closing(&self) -> bool {
        matches!(self.state, State::CloseSent | State::CloseReceived)
    }

    /// Whether the connection accepts data sends
    #[inline]
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Mark the connection closed without a handshake (transport loss or a
    /// fatal protocol violation).
    pub fn abort(&mut self) {
        self.state = State::Closed;
        self.fragment = None;
    }

    /// Process buffered transport bytes into complete messages.
    pub fn process(&mut self, buf: &mut BytesMut) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        self.process_into(buf, &mut messages)?;
        Ok(messages)
    }

    /// Process buffered transport bytes into a reusable message vector.
    pub fn process_into(&mut self, buf: &mut BytesMut, messages: &mut Vec<Message>) -> Result<()> {
        while !buf.is_empty() {
            match self.decoder.decode(buf)? {
                Some(frame) => {
                    if let Some(msg) = self.handle_frame(frame)? {
                        messages.push(msg);
                    }
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Handle one parsed frame.
    fn handle_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        trace!(
            opcode = ?frame.header.opcode,
            fin = frame.header.fin,
            len = frame.payload.len(),
            "inbound frame"
        );

        // Extensions only mark the first frame of a message; control frames
        // never carry reserved bits.
        let rsv = frame.header.rsv_bits();
        if rsv != 0 && (frame.header.opcode.is_control() || frame.header.opcode == OpCode::Continuation)
        {
            return Err(Error::InvalidReservedBits);
        }

        match frame.header.opcode {
            OpCode::Text | OpCode::Binary => self.handle_data(frame),
            OpCode::Continuation => self.handle_continuation(frame),
            OpCode::Ping => Ok(Some(Message::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Message::Pong(frame.payload))),
            OpCode::Close => self.handle_close(frame),
        }
    }

    /// Extensions whose reserved bits appear on this first frame.
    fn match_extensions(&self, rsv: u8) -> Vec<usize> {
        self.extensions
            .iter()
            .enumerate()
            .filter(|(_, ext)| ext.rsv_bits() & rsv != 0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Run the matched extensions over one frame, in reverse negotiation
    /// order.
    fn decode_through(&mut self, active: &[usize], mut frame: Frame) -> Result<Frame> {
        for &i in active.iter().rev() {
            frame = self.extensions[i].decode(frame)?;
        }
        Ok(frame)
    }

    fn handle_data(&mut self, frame: Frame) -> Result<Option<Message>> {
        if self.fragment.is_some() {
            return Err(Error::ReceivedNewFrameWithoutFinishingPreviousOne);
        }

        let active = self.match_extensions(frame.header.rsv_bits());
        let opcode = frame.header.opcode;
        let fin = frame.header.fin;

        if !fin && frame.payload.len() < self.min_non_final_fragment_size {
            return Err(Error::NonFinalFragmentSizeIsTooSmall);
        }

        let decoded = self.decode_through(&active, frame)?;

        if fin {
            return self.deliver(opcode, decoded.payload).map(Some);
        }

        if decoded.payload.len() > self.max_accumulated_frame_size {
            return Err(Error::AccumulatedFrameSizeIsTooLarge);
        }

        let mut buf = BytesMut::with_capacity(decoded.payload.len());
        buf.extend_from_slice(&decoded.payload);
        self.fragment = Some(FragmentBuffer {
            opcode,
            active_extensions: active,
            buf,
            frames: 1,
        });
        Ok(None)
    }

    fn handle_continuation(&mut self, frame: Frame) -> Result<Option<Message>> {
        if self.fragment.is_none() {
            return Err(Error::ReceivedContinuationFrameWithoutPreviousFragmentFrame);
        }

        let fin = frame.header.fin;
        if !fin && frame.payload.len() < self.min_non_final_fragment_size {
            return Err(Error::NonFinalFragmentSizeIsTooSmall);
        }

        let active = self
            .fragment
            .as_ref()
            .map(|f| f.active_extensions.clone())
            .unwrap_or_default();
        let decoded = self.decode_through(&active, frame)?;

        let fragment = self
            .fragment
            .as_mut()
            .ok_or(Error::ReceivedContinuationFrameWithoutPreviousFragmentFrame)?;

        fragment.frames += 1;
        if fragment.frames > self.max_accumulated_frame_count {
            self.fragment = None;
            return Err(Error::TooManyFrameFragments);
        }
        if fragment.buf.len() + decoded.payload.len() > self.max_accumulated_frame_size {
            self.fragment = None;
            return Err(Error::AccumulatedFrameSizeIsTooLarge);
        }

        fragment.buf.extend_from_slice(&decoded.payload);

        if fin {
            let fragment = self
                .fragment
                .take()
                .ok_or(Error::ReceivedContinuationFrameWithoutPreviousFragmentFrame)?;
            return self
                .deliver(fragment.opcode, fragment.buf.freeze())
                .map(Some);
        }
        Ok(None)
    }

    /// Deliver a complete message, validating UTF-8 for text.
    fn deliver(&mut self, opcode: OpCode, payload: Bytes) -> Result<Message> {
        match opcode {
            OpCode::Text => {
                if !validate_utf8(&payload) {
                    return Err(Error::InvalidUtf8);
                }
                Ok(Message::Text(payload))
            }
            OpCode::Binary => Ok(Message::Binary(payload)),
            _ => Err(Error::Protocol("unexpected fragment opcode")),
        }
    }

    fn handle_close(&mut self, frame: Frame) -> Result<Option<Message>> {
        let reason = parse_close_payload(&frame.payload)?;

        match self.state {
            State::Open => {
                self.state = State::CloseReceived;
                self.pending_close_echo = Some(frame.payload);
            }
            State::CloseSent => {
                self.state = State::Closed;
            }
            _ => {}
        }

        Ok(Some(Message::Close(reason)))
    }

    fn mask(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(generate_mask()),
            Role::Server => None,
        }
    }

    /// Encode a whole message. Data payloads larger than the frame limit are
    /// fragmented; control payloads bypass extensions.
    pub fn encode_message(&mut self, msg: &Message, out: &mut BytesMut) -> Result<()> {
        match msg {
            Message::Text(b) => self.encode_data(OpCode::Text, b.clone(), out),
            Message::Binary(b) => self.encode_data(OpCode::Binary, b.clone(), out),
            Message::Ping(b) => self.encode_control(Frame::ping(b.clone()), out),
            Message::Pong(b) => self.encode_control(Frame::pong(b.clone()), out),
            Message::Close(reason) => {
                let (code, reason_text) = match reason {
                    Some(r) => (r.code, r.reason.as_str()),
                    None => (CloseReason::NORMAL, ""),
                };
                self.encode_close(code, reason_text, out)
            }
        }
    }

    /// Encode one data frame as issued by the user (manual fragmentation).
    pub fn encode_data_frame(
        &mut self,
        opcode: OpCode,
        payload: Bytes,
        fin: bool,
        out: &mut BytesMut,
    ) -> Result<()> {
        if !self.is_open() {
            return Err(Error::WebSocketNotConnected);
        }
        if !opcode.is_data() {
            return Err(Error::Protocol("expected a data opcode"));
        }

        let mut frame = Frame::new(opcode, payload, fin);
        for ext in self.extensions.iter_mut() {
            frame = ext.encode(frame)?;
        }
        encode_frame(out, &frame, self.mask());
        Ok(())
    }

    /// Encode a data message, splitting payloads above the frame limit.
    fn encode_data(&mut self, opcode: OpCode, payload: Bytes, out: &mut BytesMut) -> Result<()> {
        if payload.len() <= self.max_frame_size {
            return self.encode_data_frame(opcode, payload, true, out);
        }

        let mut offset = 0;
        let mut first = true;
        while offset < payload.len() {
            let end = usize::min(offset + self.max_frame_size, payload.len());
            let chunk = payload.slice(offset..end);
            let fin = end == payload.len();
            let chunk_opcode = if first { opcode } else { OpCode::Continuation };
            self.encode_data_frame(chunk_opcode, chunk, fin, out)?;
            first = false;
            offset = end;
        }
        Ok(())
    }

    /// Encode an outbound control frame. Control frames skip extensions.
    fn encode_control(&mut self, frame: Frame, out: &mut BytesMut) -> Result<()> {
        if !self.is_open() {
            return Err(Error::WebSocketNotConnected);
        }
        if frame.payload.len() > 125 {
            return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
        }
        encode_frame(out, &frame, self.mask());
        Ok(())
    }

    /// Encode a locally initiated close frame.
    ///
    /// 1005/1006 are rewritten to 1000; the reason must fit in 123 bytes.
    /// Allowed from OPEN and, for the echo path, from CLOSING.
    pub fn encode_close(&mut self, code: u16, reason: &str, out: &mut BytesMut) -> Result<()> {
        if matches!(self.state, State::CloseSent | State::Closed) {
            return Err(Error::WebSocketNotConnected);
        }
        if reason.len() > CloseReason::MAX_REASON_LEN {
            return Err(Error::CloseReasonTooLong);
        }
        let code = CloseReason::wire_code(code);
        if !CloseReason::is_valid_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }

        encode_frame(out, &Frame::close(code, reason), self.mask());
        self.state = match self.state {
            State::CloseReceived => State::Closed,
            _ => State::CloseSent,
        };
        Ok(())
    }

    /// Echo the peer's close frame back with its original payload and
    /// finish the closing handshake.
    pub fn encode_close_echo(&mut self, out: &mut BytesMut) -> Result<()> {
        let payload = self.pending_close_echo.take().unwrap_or_default();
        encode_frame(out, &Frame::close_raw(payload), self.mask());
        if self.state == State::CloseReceived {
            self.state = State::Closed;
        }
        Ok(())
    }

    /// Encode the automatic pong answer for an inbound ping.
    pub fn encode_pong(&mut self, ping_payload: &[u8], out: &mut BytesMut) -> Result<()> {
        // Pong answers are still emitted while the close handshake runs
        if self.state == State::Closed {
            return Err(Error::WebSocketNotConnected);
        }
        encode_frame(
            out,
            &Frame::pong(Bytes::copy_from_slice(ping_payload)),
            self.mask(),
        );
        Ok(())
    }
}

/// Parse a close frame payload into its code and reason.
fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(Error::Protocol("close payload of a single byte")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseReason::is_valid_code(code) {
                return Err(Error::InvalidCloseCode(code));
            }
            let reason = &payload[2..];
            if !validate_utf8(reason) {
                return Err(Error::InvalidUtf8);
            }
            // Validated above
            let reason = unsafe { std::str::from_utf8_unchecked(reason) };
            Ok(Some(CloseReason::new(code, reason)))
        }
    }
}
