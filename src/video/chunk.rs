//! Video packet layout.
//!
//! ```text
//! offset  size  field
//!      0     4  frame_id     (u32 LE)
//!      4     2  chunk_index  (u16 LE)
//!      6     2  chunk_count  (u16 LE)
//!      8   ..   JPEG payload (at most chunk_size bytes)
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ChunkError;

/// Size of the chunk header.
pub const HEADER_LEN: usize = 8;

/// Payload bytes per packet; keeps datagrams under a 1500-byte MTU.
pub const DEFAULT_CHUNK_SIZE: usize = 1400;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub frame_id: u32,
    pub chunk_index: u16,
    pub chunk_count: u16,
}

impl ChunkHeader {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.frame_id);
        buf.put_u16_le(self.chunk_index);
        buf.put_u16_le(self.chunk_count);
    }
}

/// One received piece of an encoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameChunk {
    pub header: ChunkHeader,
    pub payload: Bytes,
}

impl FrameChunk {
    /// Parse a packet. The payload is a zero-copy slice of `packet`.
    pub fn decode(packet: Bytes) -> Result<Self, ChunkError> {
        if packet.len() <= HEADER_LEN {
            return Err(ChunkError::Truncated(packet.len()));
        }
        let header = ChunkHeader {
            frame_id: u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]),
            chunk_index: u16::from_le_bytes([packet[4], packet[5]]),
            chunk_count: u16::from_le_bytes([packet[6], packet[7]]),
        };
        if header.chunk_count == 0 {
            return Err(ChunkError::EmptyFrame);
        }
        if header.chunk_index >= header.chunk_count {
            return Err(ChunkError::IndexOutOfRange {
                index: header.chunk_index,
                count: header.chunk_count,
            });
        }
        Ok(FrameChunk {
            header,
            payload: packet.slice(HEADER_LEN..),
        })
    }
}

/// Split an encoded frame into ready-to-send packets.
///
/// An empty frame yields no packets.
pub fn split_frame(frame_id: u32, data: &[u8], chunk_size: usize) -> Result<Vec<Bytes>, ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::ZeroChunkSize);
    }
    let count = data.len().div_ceil(chunk_size);
    let chunk_count = u16::try_from(count).map_err(|_| ChunkError::TooManyChunks(data.len()))?;

    Ok(data
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, piece)| {
            let mut buf = BytesMut::with_capacity(HEADER_LEN + piece.len());
            ChunkHeader {
                frame_id,
                chunk_index: i as u16,
                chunk_count,
            }
            .put(&mut buf);
            buf.put_slice(piece);
            buf.freeze()
        })
        .collect())
}
