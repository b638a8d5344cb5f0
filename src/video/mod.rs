//! Video relay: JPEG frames fragmented over UDP.
//!
//! The rover captures, encodes and splits each frame into
//! [`chunk::DEFAULT_CHUNK_SIZE`] pieces ([`streamer`]); the operator side
//! reassembles and decodes them ([`assembler`], [`receiver`]). Packets may
//! arrive in any order or not at all.

pub mod assembler;
pub mod chunk;
pub mod receiver;
pub mod source;
pub mod streamer;

pub use assembler::FrameAssembler;
pub use chunk::{split_frame, ChunkHeader, FrameChunk, DEFAULT_CHUNK_SIZE, HEADER_LEN};
pub use receiver::{DecodedFrame, VideoReceiver};
pub use source::{FrameSource, TestPattern};
pub use streamer::{VideoControl, VideoStreamer};

/// Operator request to change the streamed resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionStep {
    /// Smaller frames (`x`).
    Down,
    /// Larger frames (`c`).
    Up,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Available resolutions, largest first. Index 0 is the power-up default.
pub const RESOLUTIONS: [Resolution; 5] = [
    Resolution { width: 640, height: 480 },
    Resolution { width: 352, height: 288 },
    Resolution { width: 320, height: 240 },
    Resolution { width: 176, height: 144 },
    Resolution { width: 160, height: 120 },
];
