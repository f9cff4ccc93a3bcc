//! permessage-deflate (RFC 7692)
//!
//! Stateful per-direction DEFLATE transform. The compressor is bound to the
//! local side's negotiated window, the decompressor to the remote side's.
//! Frames stream through one at a time so fragmented messages share a single
//! DEFLATE stream; rsv1 marks the first frame of a compressed message.

use bytes::{Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};
use crate::extension::{Extension, NegotiatedDeflate, PERMESSAGE_DEFLATE};
use crate::frame::{Frame, OpCode, RSV1};
use crate::protocol::Role;

/// Tail emitted by a sync flush; stripped after compression of a final
/// frame and restored before decompression
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Upper bound on compress/decompress loop iterations
const MAX_ITERATIONS: u32 = 100_000;

/// zlib cannot run raw DEFLATE with a 256-byte window; a negotiated value of
/// 8 is widened to 9. Inflating with a wider window than the peer compressed
/// with is always valid.
fn effective_window_bits(bits: u8) -> u8 {
    bits.max(9)
}

struct DeflateEncoder {
    compress: Compress,
    reset_on_message_end: bool,
}

impl DeflateEncoder {
    fn new(window_bits: u8, reset_on_message_end: bool) -> Self {
        let compress = Compress::new_with_window_bits(
            Compression::default(),
            false,
            effective_window_bits(window_bits),
        );
        Self {
            compress,
            reset_on_message_end,
        }
    }

    /// Compress one frame payload with a sync flush. For the final frame of
    /// a message the four tail bytes are stripped and the context is reset
    /// when no-context-takeover applies to this side.
    fn compress(&mut self, data: &[u8], fin: bool) -> Result<Bytes> {
        let mut output = BytesMut::with_capacity(data.len() / 2 + 16);
        let mut total_in: usize = 0;
        let mut iterations = 0u32;

        loop {
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                return Err(Error::Compression("compression did not converge".into()));
            }

            if output.capacity() - output.len() == 0 {
                output.reserve(4096);
            }

            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();

            let out_start = output.len();
            let spare = output.spare_capacity_mut();
            // SAFETY: compress() reports how many bytes it wrote; only those
            // are accounted into the length below.
            let spare_slice = unsafe {
                std::slice::from_raw_parts_mut(spare.as_mut_ptr() as *mut u8, spare.len())
            };

            let status = self
                .compress
                .compress(&data[total_in..], spare_slice, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate error: {}", e)))?;

            total_in += (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;
            let had_space = spare_slice.len() > 0;

            // SAFETY: exactly `produced` bytes were initialised by compress().
            unsafe {
                output.set_len(out_start + produced);
            }

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    // The flush is complete once all input is consumed and a
                    // call with free output space produces nothing further.
                    if total_in >= data.len() && produced == 0 && had_space {
                        break;
                    }
                }
            }
        }

        if fin {
            if output.len() >= 4 && output.ends_with(&DEFLATE_TAIL) {
                output.truncate(output.len() - 4);
            }
            // An empty DEFLATE block so the frame carries at least one byte
            if output.is_empty() {
                output.extend_from_slice(&[0x00]);
            }
            if self.reset_on_message_end {
                self.compress.reset();
            }
        }

        Ok(output.freeze())
    }
}

struct DeflateDecoder {
    decompress: Decompress,
    reset_on_message_end: bool,
    /// Cap on the inflated size of one message
    max_size: usize,
    /// Inflated bytes produced for the message in progress
    message_out: usize,
}

impl DeflateDecoder {
    fn new(window_bits: u8, reset_on_message_end: bool, max_size: usize) -> Self {
        let decompress = Decompress::new_with_window_bits(false, effective_window_bits(window_bits));
        Self {
            decompress,
            reset_on_message_end,
            max_size,
            message_out: 0,
        }
    }

    /// Inflate one frame payload. For the final frame of a message the four
    /// tail bytes are restored first and the context is reset afterwards
    /// when no-context-takeover applies to the remote side.
    fn decompress(&mut self, data: &[u8], fin: bool) -> Result<Bytes> {
        let mut input = BytesMut::with_capacity(data.len() + 4);
        input.extend_from_slice(data);
        if fin {
            input.extend_from_slice(&DEFLATE_TAIL);
        }

        let mut output = BytesMut::with_capacity(std::cmp::max(1024, data.len() * 4));
        let mut total_in: usize = 0;
        let mut iterations = 0u32;

        loop {
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                return Err(Error::Compression("decompression did not converge".into()));
            }

            if self.message_out + output.len() > self.max_size {
                return Err(Error::LimitExceeded);
            }

            if output.capacity() - output.len() == 0 {
                let additional = std::cmp::max(output.capacity(), 4096);
                output.reserve(additional);
            }

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();

            let out_start = output.len();
            let spare = output.spare_capacity_mut();
            // SAFETY: decompress() reports how many bytes it wrote; only
            // those are accounted into the length below.
            let spare_slice = unsafe {
                std::slice::from_raw_parts_mut(spare.as_mut_ptr() as *mut u8, spare.len())
            };

            let status = self
                .decompress
                .decompress(&input[total_in..], spare_slice, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(format!("inflate error: {}", e)))?;

            total_in += (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            let had_space = spare_slice.len() > 0;

            // SAFETY: exactly `produced` bytes were initialised by decompress().
            unsafe {
                output.set_len(out_start + produced);
            }

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if total_in >= input.len() && produced == 0 && had_space {
                        break;
                    }
                }
            }
        }

        if self.message_out + output.len() > self.max_size {
            return Err(Error::LimitExceeded);
        }

        if fin {
            self.message_out = 0;
            if self.reset_on_message_end {
                self.decompress.reset(false);
            }
        } else {
            self.message_out += output.len();
        }

        Ok(output.freeze())
    }
}

/// Per-connection permessage-deflate session
pub struct DeflateExtension {
    encoder: DeflateEncoder,
    decoder: DeflateDecoder,
}

impl DeflateExtension {
    /// Build the session from the negotiated parameter set. The local role
    /// decides which direction each negotiated side applies to.
    pub fn new(role: Role, negotiated: &NegotiatedDeflate) -> Self {
        let (local_bits, local_reset, remote_bits, remote_reset) = match role {
            Role::Client => (
                negotiated.client_max_window_bits,
                negotiated.client_no_context_takeover,
                negotiated.server_max_window_bits,
                negotiated.server_no_context_takeover,
            ),
            Role::Server => (
                negotiated.server_max_window_bits,
                negotiated.server_no_context_takeover,
                negotiated.client_max_window_bits,
                negotiated.client_no_context_takeover,
            ),
        };

        Self {
            encoder: DeflateEncoder::new(local_bits, local_reset),
            decoder: DeflateDecoder::new(
                remote_bits,
                remote_reset,
                negotiated.max_decompression_size,
            ),
        }
    }
}

impl Extension for DeflateExtension {
    fn name(&self) -> &'static str {
        PERMESSAGE_DEFLATE
    }

    fn rsv_bits(&self) -> u8 {
        RSV1
    }

    fn encode(&mut self, frame: Frame) -> Result<Frame> {
        if frame.is_control() {
            return Ok(frame);
        }

        let fin = frame.header.fin;
        let first = frame.header.opcode != OpCode::Continuation;
        let compressed = self.encoder.compress(&frame.payload, fin)?;

        let mut out = frame.with_payload(compressed);
        out.header.rsv1 = first;
        Ok(out)
    }

    fn decode(&mut self, frame: Frame) -> Result<Frame> {
        if frame.is_control() {
            return Ok(frame);
        }

        let fin = frame.header.fin;
        let inflated = self.decoder.decompress(&frame.payload, fin)?;

        let mut out = frame.with_payload(inflated);
        out.header.rsv1 = false;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{negotiate_server, DeflateOptions};

    fn session_pair(local: DeflateOptions, offer: &str) -> (DeflateExtension, DeflateExtension) {
        let negotiated = negotiate_server(&local, &[offer]).unwrap().unwrap();
        (
            DeflateExtension::new(Role::Client, &negotiated),
            DeflateExtension::new(Role::Server, &negotiated),
        )
    }

    fn default_pair() -> (DeflateExtension, DeflateExtension) {
        session_pair(DeflateOptions::default(), "permessage-deflate")
    }

    #[test]
    fn test_roundtrip_single_frame() {
        let (mut client, mut server) = default_pair();

        let payload = b"Hello, World! Hello, World! Hello, World!".to_vec();
        let encoded = client.encode(Frame::text(payload.clone())).unwrap();
        assert!(encoded.header.rsv1);
        assert!(encoded.payload.len() < payload.len());

        let decoded = server.decode(encoded).unwrap();
        assert!(!decoded.header.rsv1);
        assert_eq!(decoded.payload.as_ref(), &payload[..]);
    }

    #[test]
    fn test_roundtrip_parameter_grid() {
        let offers = [
            "permessage-deflate",
            "permessage-deflate; server_no_context_takeover",
            "permessage-deflate; client_no_context_takeover",
            "permessage-deflate; server_no_context_takeover; client_no_context_takeover",
            "permessage-deflate; client_max_window_bits=8",
            "permessage-deflate; client_max_window_bits=11",
        ];
        let locals = [
            DeflateOptions::default(),
            DeflateOptions {
                server_max_window_bits: Some(9),
                ..Default::default()
            },
            DeflateOptions {
                server_max_window_bits: Some(12),
                client_no_context_takeover: true,
                ..Default::default()
            },
        ];

        let message: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();

        for local in &locals {
            for offer in &offers {
                let (mut client, mut server) = session_pair(local.clone(), offer);
                for _ in 0..3 {
                    let encoded = client.encode(Frame::binary(message.clone())).unwrap();
                    let decoded = server.decode(encoded).unwrap();
                    assert_eq!(decoded.payload.as_ref(), &message[..], "offer {:?}", offer);

                    let encoded = server.encode(Frame::binary(message.clone())).unwrap();
                    let decoded = client.decode(encoded).unwrap();
                    assert_eq!(decoded.payload.as_ref(), &message[..], "offer {:?}", offer);
                }
            }
        }
    }

    #[test]
    fn test_fragmented_message_shares_stream() {
        let (mut client, mut server) = default_pair();

        let first = client
            .encode(Frame::new(OpCode::Text, Bytes::from_static(b"Hello, "), false))
            .unwrap();
        let last = client
            .encode(Frame::new(
                OpCode::Continuation,
                Bytes::from_static(b"fragment!"),
                true,
            ))
            .unwrap();

        // rsv1 only on the first frame of the message
        assert!(first.header.rsv1);
        assert!(!last.header.rsv1);

        let mut assembled = Vec::new();
        assembled.extend_from_slice(&server.decode(first).unwrap().payload);
        assembled.extend_from_slice(&server.decode(last).unwrap().payload);
        assert_eq!(&assembled, b"Hello, fragment!");
    }

    #[test]
    fn test_context_takeover_shrinks_repeats() {
        let (mut client, mut server) = default_pair();

        let message = vec![b'A'; 512];
        let first = client.encode(Frame::text(message.clone())).unwrap();
        let second = client.encode(Frame::text(message.clone())).unwrap();
        // The second message references the retained window
        assert!(second.payload.len() <= first.payload.len());

        assert_eq!(server.decode(first).unwrap().payload.as_ref(), &message[..]);
        assert_eq!(server.decode(second).unwrap().payload.as_ref(), &message[..]);
    }

    #[test]
    fn test_no_context_takeover_resets_stream() {
        let (mut client, mut server) = session_pair(
            DeflateOptions::default(),
            "permessage-deflate; client_no_context_takeover",
        );

        let message = vec![b'B'; 512];
        let first = client.encode(Frame::text(message.clone())).unwrap();
        let second = client.encode(Frame::text(message.clone())).unwrap();
        assert_eq!(first.payload.len(), second.payload.len());

        assert_eq!(server.decode(first).unwrap().payload.as_ref(), &message[..]);
        assert_eq!(server.decode(second).unwrap().payload.as_ref(), &message[..]);
    }

    #[test]
    fn test_empty_message() {
        let (mut client, mut server) = default_pair();
        let encoded = client.encode(Frame::text("")).unwrap();
        assert!(!encoded.payload.is_empty());
        let decoded = server.decode(encoded).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_control_frames_pass_through() {
        let (mut client, _) = default_pair();

        let ping = client.encode(Frame::ping(Bytes::from_static(b"probe"))).unwrap();
        assert!(!ping.header.rsv1);
        assert_eq!(ping.payload.as_ref(), b"probe");

        let close = client.encode(Frame::close(1000, "bye")).unwrap();
        assert_eq!(close.header.opcode, OpCode::Close);
        assert_eq!(&close.payload[2..], b"bye");
    }

    #[test]
    fn test_decompression_limit() {
        let local = DeflateOptions {
            max_decompression_size: 1024,
            ..Default::default()
        };
        let negotiated = negotiate_server(&local, &["permessage-deflate"])
            .unwrap()
            .unwrap();
        let mut client = DeflateExtension::new(Role::Client, &negotiated);
        let mut server = DeflateExtension::new(Role::Server, &negotiated);

        // Highly compressible payload inflating past the limit
        let bomb = vec![0u8; 64 * 1024];
        let encoded = client.encode(Frame::binary(bomb)).unwrap();
        assert!(matches!(server.decode(encoded), Err(Error::LimitExceeded)));
    }

    #[test]
    fn test_fin_preserved() {
        let (mut client, _) = default_pair();
        let non_final = client
            .encode(Frame::new(OpCode::Binary, Bytes::from_static(b"abc"), false))
            .unwrap();
        assert!(!non_final.header.fin);

        let final_frame = client
            .encode(Frame::new(OpCode::Continuation, Bytes::from_static(b"def"), true))
            .unwrap();
        assert!(final_frame.header.fin);
    }
}
