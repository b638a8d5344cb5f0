//! Operator liveness over the control channel.
//!
//! The operator sends `PING` periodically; every ping is answered with
//! `PONG` and refreshes `last_seen`. The session is dead once no ping has
//! arrived for longer than the timeout, or immediately when the peer
//! closes the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Token the operator sends.
pub const PING: &[u8; 4] = b"PING";
/// Token sent back for every ping.
pub const ACK: &[u8; 4] = b"PONG";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Why the monitor ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeathCause {
    Timeout,
    PeerClosed,
    LinkError,
    /// Stopped by its owner.
    Stopped,
}

/// Handle to a running heartbeat monitor.
pub struct Heartbeat {
    alive: Arc<AtomicBool>,
    dead: CancellationToken,
    stop: CancellationToken,
    task: Option<JoinHandle<DeathCause>>,
}

impl Heartbeat {
    /// Start monitoring `stream`, which the monitor owns from now on.
    pub fn start<S>(stream: S, config: HeartbeatConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let dead = CancellationToken::new();
        let stop = CancellationToken::new();

        let task = tokio::spawn({
            let alive = alive.clone();
            let dead = dead.clone();
            let stop = stop.clone();
            async move {
                let cause = monitor(stream, config, &stop).await;
                alive.store(false, Ordering::SeqCst);
                dead.cancel();
                cause
            }
        });

        Self {
            alive,
            dead,
            stop,
            task: Some(task),
        }
    }

    /// Lock-free liveness check.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Resolves once the session is dead (or the monitor was stopped).
    pub async fn dead(&self) {
        self.dead.cancelled().await
    }

    /// Stop the monitor and return why it ended. `None` if already stopped.
    pub async fn stop(&mut self) -> Option<DeathCause> {
        self.stop.cancel();
        let task = self.task.take()?;
        match task.await {
            Ok(cause) => Some(cause),
            Err(e) => {
                tracing::error!("Heartbeat task failed: {}", e);
                None
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Count complete pings in `pending`, keeping a possible partial one.
fn take_pings(pending: &mut Vec<u8>) -> usize {
    let mut count = 0;
    while let Some(pos) = pending.windows(PING.len()).position(|w| w == PING) {
        pending.drain(..pos + PING.len());
        count += 1;
    }
    let keep = PING.len() - 1;
    if pending.len() > keep {
        pending.drain(..pending.len() - keep);
    }
    count
}

async fn monitor<S>(mut stream: S, config: HeartbeatConfig, stop: &CancellationToken) -> DeathCause
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut last_seen = Instant::now();
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = [0u8; 64];
    let mut pending = Vec::new();

    let cause = loop {
        tokio::select! {
            _ = stop.cancelled() => break DeathCause::Stopped,
            _ = ticker.tick() => {
                if last_seen.elapsed() > config.timeout {
                    tracing::warn!("Operator heartbeat timeout");
                    break DeathCause::Timeout;
                }
            }
            r = stream.read(&mut buf) => match r {
                Ok(0) => {
                    tracing::info!("Operator disconnected (control channel closed)");
                    break DeathCause::PeerClosed;
                }
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let pings = take_pings(&mut pending);
                    if pings == 0 {
                        continue;
                    }
                    last_seen = Instant::now();
                    tracing::trace!("Heartbeat ping x{}", pings);
                    let mut failed = false;
                    for _ in 0..pings {
                        if let Err(e) = stream.write_all(ACK).await {
                            tracing::warn!("Heartbeat reply failed: {}", e);
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        break DeathCause::LinkError;
                    }
                }
                Err(e) => {
                    tracing::warn!("Heartbeat read failed: {}", e);
                    break DeathCause::LinkError;
                }
            }
        }
    };
    tracing::debug!("Heartbeat monitor ended: {:?}", cause);
    cause
}
