//! Operator-side video receiver.
//!
//! Reassembles the rover's chunked JPEG stream and keeps the newest frame
//! on disk, which any image viewer that reloads on change can display.
//!
//! Usage: video-receiver [--listen 0.0.0.0:6000] [--output latest.jpg]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use roverlink::video::{DecodedFrame, VideoReceiver};

#[derive(Parser, Debug)]
#[command(name = "video-receiver", version, about = "Receive the rover's UDP video stream")]
struct Args {
    /// Local address to receive video on
    #[arg(long, env = "ROVERLINK_VIDEO_LISTEN", default_value = "0.0.0.0:6000")]
    listen: SocketAddr,

    /// Where the newest frame is written
    #[arg(long, default_value = "latest.jpg")]
    output: PathBuf,

    /// Drop incomplete frames older than this (milliseconds)
    #[arg(long, default_value_t = 2000)]
    max_frame_age_ms: u64,
}

/// Write via a temp file so readers never see a half-written JPEG.
fn write_frame(output: &Path, frame: &DecodedFrame) -> Result<()> {
    let tmp = output.with_extension("jpg.part");
    std::fs::write(&tmp, &frame.jpeg).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, output).with_context(|| format!("replacing {}", output.display()))?;
    Ok(())
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
    let receiver =
        VideoReceiver::bind(args.listen, Duration::from_millis(args.max_frame_age_ms)).await?;

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(8);
    let recv_task = tokio::spawn(receiver.run(tx, cancel.clone()));

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received");
            }
            cancel.cancel();
        }
    });

    tracing::info!("Writing frames to {}", args.output.display());
    let mut frames = 0u32;
    let mut window_start = Instant::now();

    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&args.output, &frame) {
            tracing::warn!("{:#}", e);
        }
        frames += 1;
        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            tracing::info!(
                "{:.1} fps, {}x{}, frame {}, {} bytes",
                frames as f64 / elapsed.as_secs_f64(),
                frame.width,
                frame.height,
                frame.frame_id,
                frame.jpeg.len()
            );
            frames = 0;
            window_start = Instant::now();
        }
    }

    recv_task.await??;
    Ok(())
}
