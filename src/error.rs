//! Error types for the command protocol and the wire codecs.

use thiserror::Error;

/// Errors raised while decoding or applying an operator command.
///
/// None of these are fatal: the offending line is dropped and processing
/// continues with the next input.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Single-character command with no mapping.
    #[error("unknown command key {0:?}")]
    UnknownKey(char),

    /// Line that matches none of the structured prefixes.
    #[error("unrecognized line: {0:?}")]
    UnknownLine(String),

    /// Numeric payload of a structured line did not parse.
    #[error("invalid {field} payload: {payload:?}")]
    InvalidNumber {
        field: &'static str,
        payload: String,
    },

    /// Direction outside 0..=6.
    #[error("direction out of range: {0}")]
    InvalidDirection(i64),

    /// Servo command outside 0..=4.
    #[error("servo command out of range: {0}")]
    InvalidServo(i64),

    /// Speed outside 10..=100.
    #[error("speed out of range: {0}")]
    InvalidSpeed(i64),

    /// Resolution change requested but no video streamer is attached.
    #[error("video streamer not attached")]
    NoVideo,

    /// Malformed `char:speed:duration_ms` script record.
    #[error("invalid script record: {0:?}")]
    InvalidScriptRecord(String),

    /// Scripts cannot start other scripts.
    #[error("nested scripts are not supported")]
    NestedScript,

    /// `FILE:` upload larger than the accepted maximum.
    #[error("script upload of {0} bytes exceeds the limit")]
    ScriptTooLarge(usize),

    /// Command-channel input with no newline in sight.
    #[error("line exceeds {0} bytes without a newline")]
    LineTooLong(usize),

    /// Failed to persist a script body before running it.
    #[error("failed to stage script: {0}")]
    ScriptIo(#[from] std::io::Error),
}

/// Errors decoding a 5-byte actuator frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("actuator frame must be 5 bytes, got {0}")]
    Length(usize),

    #[error("non-digit byte {0:#04x} in actuator frame")]
    NotDigit(u8),

    #[error("actuator frame {0} out of range")]
    OutOfRange(&'static str),
}

/// Errors encoding or decoding a video chunk packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("packet of {0} bytes is shorter than the chunk header")]
    Truncated(usize),

    #[error("chunk count is zero")]
    EmptyFrame,

    #[error("chunk index {index} out of range for count {count}")]
    IndexOutOfRange { index: u16, count: u16 },

    #[error("frame of {0} bytes needs more than 65535 chunks")]
    TooManyChunks(usize),

    #[error("chunk size must be non-zero")]
    ZeroChunkSize,
}
