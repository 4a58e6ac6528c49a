//! Turns arbitrarily chunked stream bytes back into frames.

use bytes::{Buf, BytesMut};

use crate::rpc::envelope::{Envelope, Frame, ENVELOPE_LEN};
use crate::rpc::error::{Result, RpcError};

pub struct Reassembler {
    pending: BytesMut,
    bytes_still_needed: usize,
    max_frame_len: u32,
}

impl Reassembler {
    pub fn new(max_frame_len: u32) -> Self {
        Reassembler {
            pending: BytesMut::new(),
            bytes_still_needed: 0,
            max_frame_len,
        }
    }

    /// Bytes required before the frame currently being accumulated can
    /// complete. While the envelope itself is incomplete this counts only
    /// the missing envelope bytes.
    pub fn bytes_still_needed(&self) -> usize {
        self.bytes_still_needed
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Feeds one transport chunk and hands every frame it completes to
    /// `on_frame`, in stream order.
    ///
    /// A declared length below the envelope size (or above the configured
    /// maximum) is a protocol violation. Frames completed earlier in the
    /// same chunk have already been delivered when the error is returned.
    pub fn push<F>(&mut self, chunk: impl Into<BytesMut>, mut on_frame: F) -> Result<()>
    where
        F: FnMut(Frame),
    {
        let chunk = chunk.into();
        let len = chunk.len();
        if len == 0 {
            return Ok(());
        }

        // Frames are split off `pending` without copying, so an empty buffer
        // can simply be replaced by the incoming chunk.
        if self.pending.is_empty() {
            self.pending = chunk;
        } else {
            self.pending.unsplit(chunk);
        }
        if self.bytes_still_needed > len {
            self.bytes_still_needed -= len;
            return Ok(());
        }
        self.bytes_still_needed = 0;

        while !self.pending.is_empty() {
            let available = self.pending.len();
            let envelope = match Envelope::from_bytes(&self.pending) {
                Some(envelope) => envelope,
                None => {
                    self.bytes_still_needed = ENVELOPE_LEN - available;
                    break;
                }
            };

            self.check_len(envelope.total_len)?;

            let total = envelope.total_len as usize;
            if total > available {
                self.bytes_still_needed = total - available;
                break;
            }

            let mut raw = self.pending.split_to(total);
            raw.advance(ENVELOPE_LEN);
            on_frame(Frame {
                call_id: envelope.call_id,
                payload: raw.freeze(),
            });
        }

        Ok(())
    }

    fn check_len(&self, total_len: u32) -> Result<()> {
        if (total_len as usize) < ENVELOPE_LEN {
            return Err(RpcError::ProtocolViolation(format!(
                "declared frame length {} is smaller than the {}-byte envelope",
                total_len, ENVELOPE_LEN
            )));
        }
        if total_len > self.max_frame_len {
            return Err(RpcError::ProtocolViolation(format!(
                "declared frame length {} exceeds limit {}",
                total_len, self.max_frame_len
            )));
        }
        Ok(())
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Reassembler::new(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::envelope::encode;

    fn feed(reassembler: &mut Reassembler, chunks: &[&[u8]]) -> Vec<Frame> {
        let mut frames = Vec::new();
        for chunk in chunks {
            reassembler
                .push(*chunk, |frame| frames.push(frame))
                .expect("push failed");
        }
        frames
    }

    #[test]
    fn split_at_every_offset_yields_one_frame() {
        for payload in [&b""[..], &b"x"[..], &b"hello, world"[..]] {
            let wire = encode(7, payload).unwrap();
            for cut in 0..=wire.len() {
                let mut reassembler = Reassembler::default();
                let frames = feed(&mut reassembler, &[&wire[..cut], &wire[cut..]]);
                assert_eq!(frames.len(), 1, "cut at {}", cut);
                assert_eq!(frames[0].call_id, 7);
                assert_eq!(&frames[0].payload[..], payload);
                assert_eq!(reassembler.buffered(), 0);
            }
        }
    }

    #[test]
    fn one_byte_at_a_time() {
        let wire = encode(3, b"drip fed payload").unwrap();
        let chunks: Vec<&[u8]> = wire.chunks(1).collect();
        let mut reassembler = Reassembler::default();
        let frames = feed(&mut reassembler, &chunks);
        assert_eq!(frames, vec![Frame::new(3, &b"drip fed payload"[..])]);
    }

    #[test]
    fn many_frames_in_one_chunk_keep_order() {
        let mut wire = Vec::new();
        for (id, payload) in [(1u32, &b"a"[..]), (2, &b""[..]), (3, &b"ccc"[..]), (4, &b"dd"[..])] {
            wire.extend_from_slice(&encode(id, payload).unwrap());
        }
        let mut reassembler = Reassembler::default();
        let frames = feed(&mut reassembler, &[&wire[..]]);
        let ids: Vec<u32> = frames.iter().map(|f| f.call_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(&frames[2].payload[..], b"ccc");
    }

    #[test]
    fn trailing_partial_frame_waits_for_rest() {
        let first = encode(1, b"one").unwrap();
        let second = encode(3, b"second frame").unwrap();
        let mut chunk = first.to_vec();
        chunk.extend_from_slice(&second[..10]);

        let mut reassembler = Reassembler::default();
        let frames = feed(&mut reassembler, &[&chunk[..]]);
        assert_eq!(frames.len(), 1);
        assert_eq!(reassembler.bytes_still_needed(), second.len() - 10);

        let frames = feed(&mut reassembler, &[&second[10..]]);
        assert_eq!(frames, vec![Frame::new(3, &b"second frame"[..])]);
        assert_eq!(reassembler.bytes_still_needed(), 0);
    }

    #[test]
    fn split_five_and_seven() {
        let wire = encode(1, b"PONG").unwrap();
        let mut reassembler = Reassembler::default();
        assert!(feed(&mut reassembler, &[&wire[..5]]).is_empty());
        let frames = feed(&mut reassembler, &[&wire[5..]]);
        assert_eq!(frames, vec![Frame::new(1, &b"PONG"[..])]);
    }

    #[test]
    fn owned_chunk_frames_share_its_buffer() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode(1, b"first").unwrap());
        wire.extend_from_slice(&encode(3, b"second").unwrap());
        let start = wire.as_ptr() as usize;

        let mut reassembler = Reassembler::default();
        let mut frames = Vec::new();
        reassembler.push(wire, |frame| frames.push(frame)).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload.as_ptr() as usize, start + ENVELOPE_LEN);
        assert_eq!(&frames[1].payload[..], b"second");
    }

    #[test]
    fn empty_chunk_is_a_no_op() {
        let mut reassembler = Reassembler::default();
        assert!(feed(&mut reassembler, &[&b""[..]]).is_empty());
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn undersized_length_is_a_protocol_violation() {
        let mut wire = encode(1, b"ok").unwrap().to_vec();
        wire.extend_from_slice(&[5, 0, 0, 0, 4, 0, 0, 0]);

        let mut reassembler = Reassembler::default();
        let mut frames = Vec::new();
        let res = reassembler.push(&wire[..], |frame| frames.push(frame));
        assert!(matches!(res, Err(RpcError::ProtocolViolation(_))));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn oversized_length_is_a_protocol_violation() {
        let wire = encode(1, &[0u8; 32]).unwrap();
        let mut reassembler = Reassembler::new(16);
        let res = reassembler.push(&wire[..], |_| {});
        assert!(matches!(res, Err(RpcError::ProtocolViolation(_))));
    }
}
