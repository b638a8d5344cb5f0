//! Sensor relay.
//!
//! The motor controller reports on the receive side of its UART, one line
//! per reading: four obstacle flags then a 3-digit heading, e.g. `0100273`.
//! Valid lines are timestamped into `sensors.log` and fanned out to the
//! operator's sensor socket. Anything else is noise and is dropped.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::transition_log::{now, TIMESTAMP_FORMAT};

/// Digits in a sensor line.
pub const SENSOR_LINE_LEN: usize = 7;

const CHANNEL_CAPACITY: usize = 64;

/// One decoded sensor line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SensorReading {
    /// Front, right, back, left.
    pub obstacles: [bool; 4],
    /// Degrees, `0..360`.
    pub heading: u16,
}

impl SensorReading {
    /// Parse exactly seven ASCII digits. Returns `None` for anything else.
    pub fn parse(line: &str) -> Option<Self> {
        let bytes = line.as_bytes();
        if bytes.len() != SENSOR_LINE_LEN || !bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }

        let mut obstacles = [false; 4];
        for (flag, &b) in obstacles.iter_mut().zip(&bytes[..4]) {
            *flag = match b {
                b'0' => false,
                b'1' => true,
                _ => return None,
            };
        }
        let heading = line[4..].parse::<u16>().ok().filter(|h| *h < 360)?;
        Some(Self { obstacles, heading })
    }

    /// Wire form, without the newline.
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(SENSOR_LINE_LEN);
        for flag in self.obstacles {
            line.push(if flag { '1' } else { '0' });
        }
        line.push_str(&format!("{:03}", self.heading));
        line
    }
}

/// Fan-out point between the UART reader and the current sensor socket.
#[derive(Clone)]
pub struct SensorFeed {
    tx: broadcast::Sender<SensorReading>,
}

impl Default for SensorFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SensorReading> {
        self.tx.subscribe()
    }

    /// Hand a reading to whoever is listening. No listener is not an error.
    pub fn publish(&self, reading: SensorReading) {
        let _ = self.tx.send(reading);
    }

    /// Read sensor lines from `reader` on a dedicated thread until EOF, a
    /// hard read error, or `stop` is set. Readers are expected to time out
    /// periodically so `stop` is noticed.
    pub fn start_reader<R>(
        &self,
        reader: R,
        log_path: PathBuf,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>>
    where
        R: Read + Send + 'static,
    {
        let feed = self.clone();
        std::thread::Builder::new()
            .name("sensor-reader".into())
            .spawn(move || feed.read_loop(reader, log_path, &stop))
            .context("failed to spawn sensor reader thread")
    }

    fn read_loop<R: Read>(&self, mut reader: R, log_path: PathBuf, stop: &AtomicBool) {
        let mut log = match open_sensor_log(&log_path) {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::warn!("Sensor log disabled: {}", e);
                None
            }
        };

        let mut pending = Vec::new();
        let mut buf = [0u8; 256];
        while !stop.load(Ordering::Relaxed) {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    tracing::error!("Sensor read error: {}", e);
                    break;
                }
            };
            pending.extend_from_slice(&buf[..n]);

            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&raw[..pos]);
                let line = text.trim_end_matches('\r');

                let Some(reading) = SensorReading::parse(line) else {
                    tracing::trace!("Dropping sensor line {:?}", line);
                    continue;
                };
                if let Some(file) = log.as_mut() {
                    let stamped = format!("{} {}\n", now().format(TIMESTAMP_FORMAT), line);
                    if let Err(e) = file.write_all(stamped.as_bytes()).and_then(|_| file.flush())
                    {
                        tracing::warn!("Sensor log write failed: {}", e);
                    }
                }
                self.publish(reading);
            }
            // A controller spewing garbage without newlines must not grow this.
            if pending.len() > 1024 {
                pending.clear();
            }
        }
        tracing::info!("Sensor reader stopped");
    }
}

fn open_sensor_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open sensor log {}", path.display()))
}

/// Write every reading to the operator's sensor socket until `cancel`
/// fires or the feed closes. A write error means the operator is gone.
pub async fn forward_to_operator<W>(
    mut rx: broadcast::Receiver<SensorReading>,
    mut writer: W,
    cancel: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let reading = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = rx.recv() => r,
        };
        match reading {
            Ok(reading) => {
                let line = format!("{}\n", reading.to_line());
                writer.write_all(line.as_bytes()).await?;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Sensor relay skipped {} readings", n);
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
