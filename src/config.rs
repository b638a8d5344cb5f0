//! Controller configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::heartbeat::HeartbeatConfig;
use crate::video::DEFAULT_CHUNK_SIZE;

pub const DEFAULT_CONTROL_PORT: u16 = 5000;
pub const DEFAULT_COMMAND_PORT: u16 = 7000;
pub const DEFAULT_SENSOR_PORT: u16 = 8000;
pub const DEFAULT_VIDEO_PORT: u16 = 6000;

const TRANSITION_LOG_FILE: &str = "commands.log";
const SENSOR_LOG_FILE: &str = "sensors.log";
const SESSION_FILE: &str = "current_session.txt";
const SCRIPT_DIR: &str = "scripts";
const VIDEO_BUFFER_DIR: &str = "video_buffer";

/// Everything the controller needs to know at startup.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Directory holding the transition log, sensor log and session file.
    pub base_dir: PathBuf,
    pub serial_device: String,
    pub baud_rate: u32,
    /// Address the TCP listeners bind to.
    pub bind_host: String,
    /// Heartbeat channel; the first connection of a session.
    pub control_port: u16,
    pub command_port: u16,
    pub sensor_port: u16,
    /// UDP port on the operator's host that receives video.
    pub video_port: u16,
    pub camera_index: u32,
    pub jpeg_quality: u8,
    pub chunk_size: usize,
    /// Keep every captured frame under `video_buffer/`.
    pub archive_video: bool,
    pub heartbeat_timeout: Duration,
    pub heartbeat_poll: Duration,
    /// How long a lost operator has to come back before rollback starts.
    pub grace_window: Duration,
    pub grace_poll: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            serial_device: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            bind_host: "0.0.0.0".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            command_port: DEFAULT_COMMAND_PORT,
            sensor_port: DEFAULT_SENSOR_PORT,
            video_port: DEFAULT_VIDEO_PORT,
            camera_index: 0,
            jpeg_quality: 60,
            chunk_size: DEFAULT_CHUNK_SIZE,
            archive_video: true,
            heartbeat_timeout: Duration::from_secs(3),
            heartbeat_poll: Duration::from_millis(100),
            grace_window: Duration::from_secs(10),
            grace_poll: Duration::from_secs(1),
        }
    }
}

/// `$HOME/MVP_log`, or `./MVP_log` when there is no home directory.
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("MVP_log")
}

impl ControllerConfig {
    /// Defaults rooted at `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn transition_log_path(&self) -> PathBuf {
        self.base_dir.join(TRANSITION_LOG_FILE)
    }

    pub fn sensor_log_path(&self) -> PathBuf {
        self.base_dir.join(SENSOR_LOG_FILE)
    }

    pub fn session_file_path(&self) -> PathBuf {
        self.base_dir.join(SESSION_FILE)
    }

    /// Where staged scripts are written before they run.
    pub fn script_dir(&self) -> PathBuf {
        self.base_dir.join(SCRIPT_DIR)
    }

    /// Captured frames are archived here as `frame_<id>.jpg`.
    pub fn video_buffer_dir(&self) -> PathBuf {
        self.base_dir.join(VIDEO_BUFFER_DIR)
    }

    /// Archive directory, if archiving is enabled.
    pub fn video_archive(&self) -> Option<PathBuf> {
        self.archive_video.then(|| self.video_buffer_dir())
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            timeout: self.heartbeat_timeout,
            poll_interval: self.heartbeat_poll,
        }
    }

    /// Create the base and script directories, and the video archive when
    /// enabled.
    pub fn prepare_dirs(&self) -> Result<()> {
        create_dir(&self.base_dir)?;
        create_dir(&self.script_dir())?;
        if let Some(dir) = self.video_archive() {
            create_dir(&dir)?;
        }
        Ok(())
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))
}
