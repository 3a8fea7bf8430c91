//! Frame layout
//!
//! A frame is a fixed `PackHead` followed by `size` payload bytes. Both
//! ends live on the same device, so the header uses native byte order.
//! Payload records are bincode-encoded.

use bytemuck::{Pod, Zeroable};
use bytes::{BufMut, Bytes, BytesMut};
use contracts::MessageId;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TransportError};

/// Fixed frame header
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PackHead {
    pub msg_id: u32,
    pub size: u32,
}

/// Header length in bytes
pub const HEADER_SIZE: usize = std::mem::size_of::<PackHead>();

impl PackHead {
    /// Read a header from the front of `buf`
    ///
    /// Returns `None` when fewer than `HEADER_SIZE` bytes are available.
    pub fn peek(buf: &[u8]) -> Option<Self> {
        let head = buf.get(..HEADER_SIZE)?;
        Some(bytemuck::pod_read_unaligned(head))
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetPacket {
    msg_id: u32,
    payload: Bytes,
}

impl NetPacket {
    pub fn new(msg_id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self::from_raw(msg_id.as_u32(), payload)
    }

    /// Build from a raw header id, as read off the wire
    pub fn from_raw(msg_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_id,
            payload: payload.into(),
        }
    }

    /// Encode a record as the payload
    pub fn encode<T: Serialize>(msg_id: MessageId, record: &T) -> Result<Self> {
        let payload = bincode::serialize(record)
            .map_err(|e| TransportError::codec(msg_id.as_u32(), format!("bincode error: {e}")))?;
        Ok(Self::new(msg_id, payload))
    }

    /// Decode the payload as a record
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.payload)
            .map_err(|e| TransportError::codec(self.msg_id, format!("bincode error: {e}")))
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    /// Typed message id; unknown ids are an error
    pub fn message_id(&self) -> Result<MessageId> {
        Ok(MessageId::try_from(self.msg_id)?)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Header plus payload length
    pub fn packet_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize header and payload into one contiguous buffer
    pub fn to_frame(&self, max_packet_size: u32) -> Result<Bytes> {
        let size = u32::try_from(self.payload.len())
            .ok()
            .filter(|size| *size <= max_packet_size)
            .ok_or(TransportError::PayloadTooLarge {
                size: self.payload.len(),
                max: max_packet_size,
            })?;

        let head = PackHead {
            msg_id: self.msg_id,
            size,
        };
        let mut frame = BytesMut::with_capacity(self.packet_len());
        frame.put_slice(bytemuck::bytes_of(&head));
        frame.put_slice(&self.payload);
        Ok(frame.freeze())
    }
}
