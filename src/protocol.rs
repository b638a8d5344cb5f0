//! Command channel framing.
//!
//! The channel is newline-delimited text, except that a `FILE:<n>` line
//! switches it to binary mode for exactly `n` bytes of script body:
//!
//! ```text
//! w\n
//! SPD:70\n
//! FILE:18\n
//! w:50:1000\na:50:500      <- 18 raw bytes, no terminator required
//! n\n
//! ```

use bytes::{Buf, BytesMut};

use crate::error::CommandError;

/// Largest accepted `FILE:` upload.
pub const MAX_SCRIPT_BYTES: usize = 1 << 20;

/// Longest line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// A complete unit of command-channel input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// One text line, without its `\n`.
    Line(String),
    /// Body of a `FILE:` upload.
    Script(Vec<u8>),
}

struct Upload {
    expected: usize,
    body: Vec<u8>,
    /// Oversized uploads are consumed but not kept.
    discard: bool,
}

impl Upload {
    fn received(&self) -> usize {
        self.body.len()
    }
}

/// Incremental decoder for the command channel.
#[derive(Default)]
pub struct CommandDecoder {
    buf: BytesMut,
    upload: Option<Upload>,
    discarded: usize,
}

impl CommandDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a `FILE:` body is being received.
    pub fn is_receiving_file(&self) -> bool {
        self.upload.is_some()
    }

    /// Feed bytes read from the socket and return everything they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<Inbound, CommandError>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            if let Some(upload) = self.upload.as_mut() {
                let remaining = upload.expected - upload.received() - self.discarded;
                let take = remaining.min(self.buf.len());
                if upload.discard {
                    self.buf.advance(take);
                    self.discarded += take;
                } else {
                    upload.body.extend_from_slice(&self.buf.split_to(take));
                }
                if take < remaining {
                    break;
                }

                if let Some(done) = self.upload.take() {
                    self.discarded = 0;
                    if !done.discard {
                        tracing::info!("Script received, {} bytes", done.expected);
                        out.push(Ok(Inbound::Script(done.body)));
                    }
                }
                continue;
            }

            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > MAX_LINE_BYTES {
                    out.push(Err(CommandError::LineTooLong(MAX_LINE_BYTES)));
                    self.buf.clear();
                }
                break;
            };
            let raw = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw[..pos]).into_owned();

            match line.strip_prefix("FILE:") {
                Some(size) => self.begin_upload(size, &mut out),
                None => out.push(Ok(Inbound::Line(line))),
            }
        }
        out
    }

    fn begin_upload(&mut self, size: &str, out: &mut Vec<Result<Inbound, CommandError>>) {
        let expected = match size.trim().parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                out.push(Err(CommandError::InvalidNumber {
                    field: "file size",
                    payload: size.to_string(),
                }));
                return;
            }
        };

        let discard = expected > MAX_SCRIPT_BYTES;
        if discard {
            out.push(Err(CommandError::ScriptTooLarge(expected)));
        } else {
            tracing::info!("Receiving script, {} bytes", expected);
        }
        self.upload = Some(Upload {
            expected,
            body: Vec::with_capacity(if discard { 0 } else { expected }),
            discard,
        });
    }
}
