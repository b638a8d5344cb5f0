//! Rover-side controller.
//!
//! Usage: roverlink-server [OPTIONS]
//!
//! Examples:
//!   roverlink-server                                  # defaults: /dev/ttyACM0, ports 5000/7000/8000
//!   roverlink-server --serial /dev/ttyUSB0 --grace-secs 20
//!   roverlink-server --test-pattern --base-dir /tmp/rover
//!   roverlink-server --list-ports

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use roverlink::actuator::{ActuatorLink, NullActuator};
use roverlink::config::{
    default_base_dir, ControllerConfig, DEFAULT_COMMAND_PORT, DEFAULT_CONTROL_PORT,
    DEFAULT_SENSOR_PORT, DEFAULT_VIDEO_PORT,
};
use roverlink::video::{FrameSource, TestPattern, VideoStreamer, RESOLUTIONS};
use roverlink::{CommandProcessor, Listeners, Orchestrator, SensorFeed, TransitionLog};

#[derive(Parser, Debug)]
#[command(name = "roverlink-server", version, about = "Raspberry Pi rover teleoperation controller")]
struct Args {
    /// Directory for commands.log, sensors.log and current_session.txt [default: ~/MVP_log]
    #[arg(long, env = "ROVERLINK_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Motor controller UART
    #[arg(long, env = "ROVERLINK_SERIAL", default_value = "/dev/ttyACM0")]
    serial: String,

    #[arg(long, env = "ROVERLINK_BAUD", default_value_t = 115_200)]
    baud: u32,

    /// Run without a motor controller (frames are dropped)
    #[arg(long)]
    no_serial: bool,

    /// Address the TCP listeners bind to
    #[arg(long, env = "ROVERLINK_BIND", default_value = "0.0.0.0")]
    bind: String,

    #[arg(long, env = "ROVERLINK_CONTROL_PORT", default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,

    #[arg(long, env = "ROVERLINK_COMMAND_PORT", default_value_t = DEFAULT_COMMAND_PORT)]
    command_port: u16,

    #[arg(long, env = "ROVERLINK_SENSOR_PORT", default_value_t = DEFAULT_SENSOR_PORT)]
    sensor_port: u16,

    /// UDP port on the operator's host that receives video
    #[arg(long, env = "ROVERLINK_VIDEO_PORT", default_value_t = DEFAULT_VIDEO_PORT)]
    video_port: u16,

    /// V4L2 camera index (/dev/videoN)
    #[arg(long, env = "ROVERLINK_CAMERA", default_value_t = 0)]
    camera: u32,

    #[arg(long, env = "ROVERLINK_JPEG_QUALITY", default_value_t = 60,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: u8,

    /// Stream a synthetic pattern instead of the camera
    #[arg(long)]
    test_pattern: bool,

    /// Disable the video stream entirely
    #[arg(long)]
    no_video: bool,

    /// Do not keep captured frames under <base-dir>/video_buffer
    #[arg(long, env = "ROVERLINK_NO_VIDEO_ARCHIVE")]
    no_video_archive: bool,

    /// Seconds a lost operator has to reconnect before rollback starts
    #[arg(long, env = "ROVERLINK_GRACE_SECS", default_value_t = 10)]
    grace_secs: u64,

    /// Seconds without a heartbeat ping before the operator is considered lost
    #[arg(long, env = "ROVERLINK_HEARTBEAT_TIMEOUT_SECS", default_value_t = 3)]
    heartbeat_timeout_secs: u64,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

impl Args {
    fn to_config(&self) -> ControllerConfig {
        ControllerConfig {
            base_dir: self.base_dir.clone().unwrap_or_else(default_base_dir),
            serial_device: self.serial.clone(),
            baud_rate: self.baud,
            bind_host: self.bind.clone(),
            control_port: self.control_port,
            command_port: self.command_port,
            sensor_port: self.sensor_port,
            video_port: self.video_port,
            camera_index: self.camera,
            jpeg_quality: self.jpeg_quality,
            archive_video: !self.no_video_archive,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            grace_window: Duration::from_secs(self.grace_secs),
            ..ControllerConfig::default()
        }
    }
}

#[cfg(feature = "serial")]
fn print_ports() -> Result<()> {
    let ports = roverlink::list_ports()?;
    if ports.is_empty() {
        println!("  (none found)");
    }
    for port in ports {
        println!("  {} - {}", port.name, port.description);
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
fn print_ports() -> Result<()> {
    println!("Built without the `serial` feature; no ports to list.");
    Ok(())
}

/// Open the UART and start the sensor reader on its receive side.
#[cfg(feature = "serial")]
fn open_actuator(
    config: &ControllerConfig,
    enabled: bool,
    sensors: &SensorFeed,
    stop: Arc<AtomicBool>,
) -> (Box<dyn ActuatorLink>, Option<std::thread::JoinHandle<()>>) {
    if enabled {
        match roverlink::SerialActuator::open(&config.serial_device, config.baud_rate) {
            Ok((link, reader)) => {
                let handle = match sensors.start_reader(reader, config.sensor_log_path(), stop) {
                    Ok(h) => Some(h),
                    Err(e) => {
                        tracing::warn!("Sensor relay disabled: {:#}", e);
                        None
                    }
                };
                return (Box::new(link), handle);
            }
            Err(e) => tracing::error!("{:#}", e),
        }
    }
    tracing::warn!("No motor controller attached; frames will be dropped");
    (Box::new(NullActuator), None)
}

#[cfg(not(feature = "serial"))]
fn open_actuator(
    _config: &ControllerConfig,
    _enabled: bool,
    _sensors: &SensorFeed,
    _stop: Arc<AtomicBool>,
) -> (Box<dyn ActuatorLink>, Option<std::thread::JoinHandle<()>>) {
    tracing::warn!("Built without the `serial` feature; frames will be dropped");
    (Box::new(NullActuator), None)
}

fn test_pattern() -> Box<dyn FrameSource> {
    let max = RESOLUTIONS[0];
    Box::new(TestPattern::new(max.width, max.height, 30))
}

#[cfg(feature = "camera")]
fn open_camera(config: &ControllerConfig, use_test_pattern: bool) -> Option<Box<dyn FrameSource>> {
    if use_test_pattern {
        return Some(test_pattern());
    }
    let max = RESOLUTIONS[0];
    match roverlink::video::source::V4lCamera::open(config.camera_index, max.width, max.height) {
        Ok(camera) => Some(Box::new(camera)),
        Err(e) => {
            tracing::error!("Camera {} unavailable, video disabled: {:#}", config.camera_index, e);
            None
        }
    }
}

#[cfg(not(feature = "camera"))]
fn open_camera(_config: &ControllerConfig, _use_test_pattern: bool) -> Option<Box<dyn FrameSource>> {
    tracing::info!("Built without the `camera` feature; streaming a test pattern");
    Some(test_pattern())
}

fn start_video(config: &ControllerConfig, args: &Args) -> Option<VideoStreamer> {
    if args.no_video {
        return None;
    }
    let source = open_camera(config, args.test_pattern)?;
    let socket = match std::net::UdpSocket::bind("0.0.0.0:0") {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to open video socket, video disabled: {}", e);
            return None;
        }
    };
    match VideoStreamer::start(
        source,
        socket,
        config.jpeg_quality,
        config.chunk_size,
        config.video_archive(),
    ) {
        Ok(streamer) => Some(streamer),
        Err(e) => {
            tracing::error!("Video disabled: {:#}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("roverlink=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let args = Args::parse();
    if args.list_ports {
        println!("Available ports:");
        return print_ports();
    }

    let config = args.to_config();
    config.prepare_dirs()?;
    let log = TransitionLog::open(config.transition_log_path())?;

    let sensors = SensorFeed::new();
    let stop_reader = Arc::new(AtomicBool::new(false));
    let (link, reader) = open_actuator(&config, !args.no_serial, &sensors, stop_reader.clone());

    let mut streamer = start_video(&config, &args);
    let video = streamer.as_ref().map(VideoStreamer::control);

    let mut processor = CommandProcessor::new(link, log, config.script_dir());
    if let Some(video) = &video {
        processor = processor.with_video(video.clone());
    }
    let processor = Arc::new(processor);

    let listeners = Listeners::bind(&config).await?;

    tracing::info!("Controller started");
    tracing::info!("Log directory: {}", config.base_dir.display());
    tracing::info!(
        "Ports: control {} / command {} / sensor {} / video {} (udp)",
        config.control_port,
        config.command_port,
        config.sensor_port,
        config.video_port
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Ctrl-C received"),
                Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
            }
            shutdown.cancel();
        }
    });

    let orchestrator = Arc::new(Orchestrator::new(config, processor, sensors, video));
    orchestrator.run(listeners, shutdown).await?;

    stop_reader.store(true, Ordering::Relaxed);
    if let Some(reader) = reader {
        if tokio::task::spawn_blocking(move || reader.join()).await.is_err() {
            tracing::error!("Sensor reader did not shut down cleanly");
        }
    }
    if let Some(streamer) = streamer.as_mut() {
        streamer.stop();
    }
    Ok(())
}
