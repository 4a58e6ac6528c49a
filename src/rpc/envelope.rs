//! Wire envelope: `callID` and `totalLength`, both little-endian `u32`,
//! followed by `totalLength - 8` payload bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::rpc::error::{Result, RpcError};

/// Size of the envelope prefixed onto every frame.
pub const ENVELOPE_LEN: usize = 8;

/// Call IDs wrap back to the role's first ID before reaching this value.
pub const CALL_ID_WRAP: u32 = 1 << 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub call_id: u32,
    pub total_len: u32,
}

impl Envelope {
    /// Fails with [`RpcError::PayloadTooLarge`] when `totalLength` would not
    /// fit in a `u32`.
    pub fn for_payload(call_id: u32, payload_len: usize) -> Result<Self> {
        let total_len = payload_len
            .checked_add(ENVELOPE_LEN)
            .and_then(|total| u32::try_from(total).ok())
            .ok_or(RpcError::PayloadTooLarge(payload_len))?;
        Ok(Envelope { call_id, total_len })
    }

    pub fn to_bytes(&self) -> [u8; ENVELOPE_LEN] {
        let mut buf = [0u8; ENVELOPE_LEN];
        buf[0..4].copy_from_slice(&self.call_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.total_len.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw = bytes.get(0..ENVELOPE_LEN)?;
        Some(Envelope {
            call_id: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            total_len: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }

    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(ENVELOPE_LEN)
    }
}

/// One reassembled frame.
///
/// Peer-initiated calls reach the listener as a `Frame`, so the listener can
/// read the payload directly and still rebuild the envelope-prefixed bytes
/// with [`Frame::to_bytes`] when it needs the raw framing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub call_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(call_id: u32, payload: impl Into<Bytes>) -> Self {
        Frame {
            call_id,
            payload: payload.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        encode(self.call_id, &self.payload)
    }
}

/// Frames `payload` under `call_id`.
pub fn encode(call_id: u32, payload: &[u8]) -> Result<Bytes> {
    let envelope = Envelope::for_payload(call_id, payload.len())?;
    let mut buf = BytesMut::with_capacity(ENVELOPE_LEN + payload.len());
    buf.put_slice(&envelope.to_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}
