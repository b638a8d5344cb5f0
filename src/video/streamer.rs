//! Rover-side capture loop.
//!
//! Runs on a dedicated thread: capture, encode, split, send. `frame_id`
//! counts captured frames, so it keeps advancing while sending is disabled
//! and the receiver sees a gap rather than a reused id after a reconnect.
//!
//! Every captured frame can also be archived to disk as
//! `frame_<frame_id:08>.jpg`, independent of whether anyone is watching.

use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use super::chunk::split_frame;
use super::source::FrameSource;
use super::{Resolution, ResolutionStep, RESOLUTIONS};

/// Gap between datagrams of one frame, to avoid bursting the Wi-Fi link.
const CHUNK_PACING: Duration = Duration::from_micros(100);

/// Back-off after a failed capture.
const CAPTURE_RETRY: Duration = Duration::from_millis(10);

/// Shared switches of a running streamer.
///
/// Held by the session orchestrator (target and enable) and the command
/// processor (resolution).
#[derive(Debug, Default)]
pub struct VideoControl {
    sending: AtomicBool,
    target: Mutex<Option<SocketAddr>>,
    resolution: AtomicUsize,
    frame_id: AtomicU32,
}

impl VideoControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sending_enabled(&self, enabled: bool) {
        self.sending.store(enabled, Ordering::Relaxed);
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Relaxed)
    }

    /// Point the stream at the operator's video port.
    pub fn set_operator(&self, addr: SocketAddr) {
        *self.target.lock() = Some(addr);
        tracing::info!("Video target set to {}", addr);
    }

    pub fn clear_operator(&self) {
        *self.target.lock() = None;
    }

    pub fn operator(&self) -> Option<SocketAddr> {
        *self.target.lock()
    }

    pub fn resolution(&self) -> Resolution {
        RESOLUTIONS[self.resolution.load(Ordering::Relaxed)]
    }

    /// Move one rung along the resolution ladder. Returns the new resolution,
    /// or `None` when already at that end of the ladder.
    pub fn step_resolution(&self, step: ResolutionStep) -> Option<Resolution> {
        let update = self
            .resolution
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| match step {
                ResolutionStep::Down if i + 1 < RESOLUTIONS.len() => Some(i + 1),
                ResolutionStep::Up if i > 0 => Some(i - 1),
                _ => None,
            });
        match update {
            Ok(old) => {
                let new = match step {
                    ResolutionStep::Down => old + 1,
                    ResolutionStep::Up => old - 1,
                };
                tracing::info!("Resolution changed to {}", RESOLUTIONS[new]);
                Some(RESOLUTIONS[new])
            }
            Err(_) => {
                tracing::info!("Resolution already at {}", self.resolution());
                None
            }
        }
    }

    /// Number of frames captured so far (the next frame's id).
    pub fn frames_captured(&self) -> u32 {
        self.frame_id.load(Ordering::Relaxed)
    }

    fn next_frame_id(&self) -> u32 {
        self.frame_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Owns the capture thread.
pub struct VideoStreamer {
    control: Arc<VideoControl>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl VideoStreamer {
    /// Start capturing from `source`, sending over `socket` when enabled.
    /// With `archive_dir`, every captured frame is also written there.
    pub fn start(
        source: Box<dyn FrameSource>,
        socket: UdpSocket,
        jpeg_quality: u8,
        chunk_size: usize,
        archive_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let control = Arc::new(VideoControl::new());
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let control = control.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name("video-capture".into())
                .spawn(move || {
                    let archive = archive_dir.map(FrameArchive::new);
                    let settings = CaptureSettings {
                        quality: jpeg_quality,
                        chunk_size,
                    };
                    capture_loop(source, socket, archive, &control, &running, settings)
                })
                .context("failed to spawn video capture thread")?
        };

        Ok(Self {
            control,
            running,
            worker: Some(worker),
        })
    }

    pub fn control(&self) -> Arc<VideoControl> {
        self.control.clone()
    }

    /// Stop capturing and join the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Video capture thread panicked");
            }
        }
    }
}

impl Drop for VideoStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// On-disk copy of every captured frame.
struct FrameArchive {
    dir: PathBuf,
    failing: bool,
}

impl FrameArchive {
    fn new(dir: PathBuf) -> Self {
        tracing::info!("Archiving video frames to {}", dir.display());
        Self { dir, failing: false }
    }

    fn frame_path(dir: &Path, frame_id: u32) -> PathBuf {
        dir.join(format!("frame_{:08}.jpg", frame_id))
    }

    /// Write one frame. Failures are logged once per run of failures and
    /// never stop capture.
    fn store(&mut self, frame_id: u32, jpeg: &[u8]) {
        let path = Self::frame_path(&self.dir, frame_id);
        match std::fs::write(&path, jpeg) {
            Ok(()) => {
                if self.failing {
                    tracing::info!("Video archive writable again");
                    self.failing = false;
                }
            }
            Err(e) if !self.failing => {
                tracing::warn!("Failed to archive {}: {}", path.display(), e);
                self.failing = true;
            }
            Err(e) => tracing::debug!("Failed to archive {}: {}", path.display(), e),
        }
    }
}

#[derive(Clone, Copy)]
struct CaptureSettings {
    quality: u8,
    chunk_size: usize,
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    socket: UdpSocket,
    mut archive: Option<FrameArchive>,
    control: &VideoControl,
    running: &AtomicBool,
    settings: CaptureSettings,
) {
    let CaptureSettings {
        quality,
        chunk_size,
    } = settings;
    while running.load(Ordering::Relaxed) {
        let jpeg = match source.capture_jpeg(control.resolution(), quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::debug!("Capture failed: {}", e);
                std::thread::sleep(CAPTURE_RETRY);
                continue;
            }
        };
        let frame_id = control.next_frame_id();
        if let Some(archive) = archive.as_mut() {
            archive.store(frame_id, &jpeg);
        }

        if !control.is_sending() {
            continue;
        }
        let Some(target) = control.operator() else {
            continue;
        };

        let packets = match split_frame(frame_id, &jpeg, chunk_size) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Frame {} not sent: {}", frame_id, e);
                continue;
            }
        };
        for packet in packets {
            if let Err(e) = socket.send_to(&packet, target) {
                tracing::debug!("Video send to {} failed: {}", target, e);
                break;
            }
            std::thread::sleep(CHUNK_PACING);
        }
    }
    tracing::info!("Video capture stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::assembler::FrameAssembler;
    use crate::video::chunk::FrameChunk;
    use crate::video::source::TestPattern;
    use bytes::Bytes;
    use std::time::Instant;

    #[test]
    fn test_resolution_ladder_saturates() {
        let control = VideoControl::new();
        assert_eq!(control.resolution(), RESOLUTIONS[0]);
        assert_eq!(control.step_resolution(ResolutionStep::Up), None);

        for expected in &RESOLUTIONS[1..] {
            assert_eq!(control.step_resolution(ResolutionStep::Down), Some(*expected));
        }
        assert_eq!(control.step_resolution(ResolutionStep::Down), None);
        assert_eq!(control.resolution(), RESOLUTIONS[4]);
        assert_eq!(control.step_resolution(ResolutionStep::Up), Some(RESOLUTIONS[3]));
    }

    #[test]
    fn test_frame_ids_advance_while_disabled() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut streamer =
            VideoStreamer::start(Box::new(TestPattern::new(64, 48, 200)), socket, 60, 1400, None)
                .unwrap();
        let control = streamer.control();

        let deadline = Instant::now() + Duration::from_secs(5);
        while control.frames_captured() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        streamer.stop();
        assert!(control.frames_captured() >= 3);
    }

    #[test]
    fn test_streams_to_operator() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut streamer =
            VideoStreamer::start(Box::new(TestPattern::new(320, 240, 100)), socket, 60, 256, None)
                .unwrap();
        let control = streamer.control();
        control.set_operator(receiver.local_addr().unwrap());
        control.set_sending_enabled(true);

        let mut asm = FrameAssembler::default();
        let mut buf = [0u8; 2048];
        let frame = loop {
            let n = receiver.recv(&mut buf).unwrap();
            let chunk = FrameChunk::decode(Bytes::copy_from_slice(&buf[..n])).unwrap();
            if let Some(frame) = asm.push(chunk, Instant::now()) {
                break frame;
            }
        };
        streamer.stop();

        let img = image::load_from_memory(&frame).unwrap();
        assert_eq!((img.width(), img.height()), (320, 240));
    }

    #[test]
    fn test_archives_every_captured_frame() {
        let dir = tempfile::tempdir().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut streamer = VideoStreamer::start(
            Box::new(TestPattern::new(64, 48, 200)),
            socket,
            60,
            1400,
            Some(dir.path().to_path_buf()),
        )
        .unwrap();
        let control = streamer.control();

        let deadline = Instant::now() + Duration::from_secs(5);
        while control.frames_captured() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        streamer.stop();

        let captured = control.frames_captured();
        assert!(captured >= 3);
        for id in 0..captured {
            let path = dir.path().join(format!("frame_{:08}.jpg", id));
            let img = image::load_from_memory(&std::fs::read(&path).unwrap()).unwrap();
            assert_eq!((img.width(), img.height()), (64, 48));
        }
        assert!(dir.path().join("frame_00000000.jpg").is_file());
    }

    #[test]
    fn test_archive_failure_does_not_stop_capture() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-created");
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut streamer = VideoStreamer::start(
            Box::new(TestPattern::new(64, 48, 200)),
            socket,
            60,
            1400,
            Some(missing.clone()),
        )
        .unwrap();
        let control = streamer.control();

        let deadline = Instant::now() + Duration::from_secs(5);
        while control.frames_captured() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        streamer.stop();
        assert!(control.frames_captured() >= 3);
        assert!(!missing.exists());
    }
}
