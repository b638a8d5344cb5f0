//! Receiver-side frame reassembly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::chunk::FrameChunk;

/// How long an incomplete frame may wait for its missing chunks.
pub const DEFAULT_MAX_FRAME_AGE: Duration = Duration::from_secs(2);

struct PartialFrame {
    slots: Vec<Option<Bytes>>,
    filled: usize,
    first_seen: Instant,
}

/// Collects chunks per `frame_id` until every slot is filled.
///
/// Frames are sized by the `chunk_count` of the first chunk seen; later
/// chunks that disagree are dropped. Frames that stop making progress are
/// evicted after `max_age` so lost packets cannot grow the map without bound.
pub struct FrameAssembler {
    partial: HashMap<u32, PartialFrame>,
    max_age: Duration,
    evicted: u64,
}

impl FrameAssembler {
    pub fn new(max_age: Duration) -> Self {
        Self {
            partial: HashMap::new(),
            max_age,
            evicted: 0,
        }
    }

    /// Store a chunk. Returns the complete encoded frame once its last slot
    /// is filled, at which point the frame's entry is removed.
    pub fn push(&mut self, chunk: FrameChunk, now: Instant) -> Option<Vec<u8>> {
        self.evict_stale(now);

        let header = chunk.header;
        if header.chunk_count == 0 || header.chunk_index >= header.chunk_count {
            tracing::debug!(
                "Frame {}: chunk {} of {} out of range, dropping",
                header.frame_id,
                header.chunk_index,
                header.chunk_count
            );
            return None;
        }
        let count = header.chunk_count as usize;
        let entry = self
            .partial
            .entry(header.frame_id)
            .or_insert_with(|| PartialFrame {
                slots: vec![None; count],
                filled: 0,
                first_seen: now,
            });

        if entry.slots.len() != count {
            tracing::debug!(
                "Frame {}: chunk_count {} disagrees with {}, dropping chunk",
                header.frame_id,
                count,
                entry.slots.len()
            );
            return None;
        }

        let slot = &mut entry.slots[header.chunk_index as usize];
        if slot.is_none() {
            entry.filled += 1;
        }
        *slot = Some(chunk.payload);

        if entry.filled < count {
            return None;
        }

        let frame = self.partial.remove(&header.frame_id)?;
        let mut data = Vec::with_capacity(frame.slots.iter().flatten().map(Bytes::len).sum());
        for piece in frame.slots.into_iter().flatten() {
            data.extend_from_slice(&piece);
        }
        Some(data)
    }

    /// Drop incomplete frames older than `max_age`.
    pub fn evict_stale(&mut self, now: Instant) {
        let max_age = self.max_age;
        let before = self.partial.len();
        self.partial
            .retain(|_, f| now.saturating_duration_since(f.first_seen) <= max_age);
        let dropped = before - self.partial.len();
        if dropped > 0 {
            self.evicted += dropped as u64;
            tracing::debug!("Evicted {} incomplete frame(s)", dropped);
        }
    }

    /// Frames currently waiting for chunks.
    pub fn pending_frames(&self) -> usize {
        self.partial.len()
    }

    /// Total incomplete frames dropped so far.
    pub fn evicted_frames(&self) -> u64 {
        self.evicted
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_AGE)
    }
}
