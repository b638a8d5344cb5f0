//! Session orchestrator: the controller's top-level state machine.
//!
//! ```text
//!   WaitingForOperator ──connect──▶ Connected ──heartbeat dead──▶ Lost
//!          ▲                          ▲   │                        │
//!          │                          │   └──new control conn──┐   │ grace elapsed
//!          │                          └────reconnect───────────┴── ▼
//!          └──────────────── rollback done / cancelled ──── RollingBack
//! ```
//!
//! An operator session is three TCP connections, accepted in order:
//! control (heartbeat), command, sensor. Losing any of them ends the
//! session. Only one session is active at a time; a new control connection
//! supersedes the current session.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::command::{sleep_unless_cancelled, CommandProcessor};
use crate::config::ControllerConfig;
use crate::error::CommandError;
use crate::heartbeat::Heartbeat;
use crate::protocol::{CommandDecoder, Inbound};
use crate::rollback::execute_rollback;
use crate::sensor::{forward_to_operator, SensorFeed};
use crate::transition_log::SystemEvent;
use crate::video::VideoControl;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    WaitingForOperator,
    Connected,
    /// Operator gone, grace window running.
    Lost,
    RollingBack,
}

/// The three listening sockets. Failing to bind any of them is fatal.
pub struct Listeners {
    control: TcpListener,
    command: TcpListener,
    sensor: TcpListener,
}

impl Listeners {
    pub async fn bind(config: &ControllerConfig) -> Result<Self> {
        let bind = |port: u16, name: &'static str| {
            let host = config.bind_host.clone();
            async move {
                let listener = TcpListener::bind((host.as_str(), port))
                    .await
                    .with_context(|| {
                        format!("failed to bind {} listener on {}:{}", name, host, port)
                    })?;
                tracing::info!("{} server listening on {}", name, listener.local_addr()?);
                anyhow::Ok(listener)
            }
        };
        Ok(Self {
            control: bind(config.control_port, "Control").await?,
            command: bind(config.command_port, "Command").await?,
            sensor: bind(config.sensor_port, "Sensor").await?,
        })
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.control.local_addr()?)
    }

    pub fn command_addr(&self) -> Result<SocketAddr> {
        Ok(self.command.local_addr()?)
    }

    pub fn sensor_addr(&self) -> Result<SocketAddr> {
        Ok(self.sensor.local_addr()?)
    }
}

enum SessionEnd {
    Lost,
    Superseded(TcpStream, SocketAddr),
    Shutdown,
}

/// Grace timer, and the rollback it may turn into.
struct GraceTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl GraceTask {
    async fn cancel_and_join(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!("Grace/rollback task failed: {}", e);
        }
    }
}

pub struct Orchestrator {
    config: ControllerConfig,
    processor: Arc<CommandProcessor>,
    sensors: SensorFeed,
    video: Option<Arc<VideoControl>>,
    state: watch::Sender<SessionState>,
}

impl Orchestrator {
    pub fn new(
        config: ControllerConfig,
        processor: Arc<CommandProcessor>,
        sensors: SensorFeed,
        video: Option<Arc<VideoControl>>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::WaitingForOperator);
        Self {
            config,
            processor,
            sensors,
            video,
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        let old = self.state.send_replace(state);
        if old != state {
            tracing::info!("Session state: {:?} -> {:?}", old, state);
        }
    }

    /// Serve operator sessions until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        listeners: Listeners,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut grace: Option<GraceTask> = None;
        let mut next: Option<(TcpStream, SocketAddr)> = None;

        loop {
            let (control, peer) = match next.take() {
                Some(conn) => conn,
                None => {
                    tracing::info!("Waiting for operator connection...");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        r = listeners.control.accept() => match r {
                            Ok(conn) => conn,
                            Err(e) => {
                                tracing::warn!("Control accept failed: {}", e);
                                continue;
                            }
                        },
                    }
                }
            };

            // At most one driver of the motion state: stop any rollback first.
            if let Some(task) = grace.take() {
                tracing::info!("Operator reconnected, cancelling grace/rollback");
                task.cancel_and_join().await;
            }
            tracing::info!("Operator connected from {}", peer);
            self.set_state(SessionState::Connected);
            self.write_session_file(peer);

            let mut heartbeat = Heartbeat::start(control, self.config.heartbeat());
            self.processor.log_system_event(SystemEvent::OperatorConnected);
            if let Some(video) = &self.video {
                video.set_operator(SocketAddr::new(peer.ip(), self.config.video_port));
                video.set_sending_enabled(true);
            }

            let end = self.serve(&listeners, &heartbeat, &shutdown).await;

            let cause = heartbeat.stop().await;
            tracing::info!("Operator session ended ({:?})", cause);
            self.processor.interrupt_script().await;
            self.processor.stop_all();
            self.processor.log_system_event(SystemEvent::OperatorLost);
            if let Some(video) = &self.video {
                video.set_sending_enabled(false);
                video.clear_operator();
            }

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Superseded(stream, addr) => {
                    tracing::info!("New operator connection from {}, replacing session", addr);
                    next = Some((stream, addr));
                }
                SessionEnd::Lost => {
                    self.set_state(SessionState::Lost);
                    grace = Some(self.spawn_grace());
                }
            }
        }

        tracing::info!("Shutting down");
        if let Some(task) = grace.take() {
            task.cancel_and_join().await;
        }
        self.processor.shutdown().await;
        self.set_state(SessionState::WaitingForOperator);
        Ok(())
    }

    /// Run one connected session until it is lost, superseded or shut down.
    async fn serve(
        &self,
        listeners: &Listeners,
        heartbeat: &Heartbeat,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        tracing::info!("Waiting for command connection...");
        let mut command = match self
            .accept_channel(&listeners.command, "Command", listeners, heartbeat, shutdown)
            .await
        {
            Ok(s) => s,
            Err(end) => return end,
        };
        tracing::info!("Waiting for sensor connection...");
        let sensor = match self
            .accept_channel(&listeners.sensor, "Sensor", listeners, heartbeat, shutdown)
            .await
        {
            Ok(s) => s,
            Err(end) => return end,
        };

        let relay_cancel = CancellationToken::new();
        let relay_failed = CancellationToken::new();
        let relay = tokio::spawn({
            let rx = self.sensors.subscribe();
            let cancel = relay_cancel.clone();
            let failed = relay_failed.clone();
            async move {
                if let Err(e) = forward_to_operator(rx, sensor, cancel).await {
                    tracing::warn!("Sensor channel write failed: {}", e);
                    failed.cancel();
                }
            }
        });

        let mut decoder = CommandDecoder::new();
        let mut buf = [0u8; 1024];
        let end = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                _ = heartbeat.dead() => break SessionEnd::Lost,
                _ = relay_failed.cancelled() => break SessionEnd::Lost,
                r = listeners.control.accept() => match r {
                    Ok((stream, addr)) => break SessionEnd::Superseded(stream, addr),
                    Err(e) => tracing::warn!("Control accept failed: {}", e),
                },
                r = command.read(&mut buf) => match r {
                    Ok(0) => {
                        tracing::info!("Command channel closed by operator");
                        break SessionEnd::Lost;
                    }
                    Ok(n) => {
                        for item in decoder.push(&buf[..n]) {
                            self.dispatch(item).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Command channel read failed: {}", e);
                        break SessionEnd::Lost;
                    }
                },
            }
        };

        relay_cancel.cancel();
        if let Err(e) = relay.await {
            tracing::error!("Sensor relay task failed: {}", e);
        }
        end
    }

    async fn accept_channel(
        &self,
        listener: &TcpListener,
        name: &str,
        listeners: &Listeners,
        heartbeat: &Heartbeat,
        shutdown: &CancellationToken,
    ) -> Result<TcpStream, SessionEnd> {
        tokio::select! {
            _ = shutdown.cancelled() => Err(SessionEnd::Shutdown),
            _ = heartbeat.dead() => Err(SessionEnd::Lost),
            r = listeners.control.accept() => match r {
                Ok((stream, addr)) => Err(SessionEnd::Superseded(stream, addr)),
                Err(e) => {
                    tracing::warn!("Control accept failed: {}", e);
                    Err(SessionEnd::Lost)
                }
            },
            r = listener.accept() => match r {
                Ok((stream, addr)) => {
                    tracing::info!("{} client connected from {}", name, addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("set_nodelay failed: {}", e);
                    }
                    Ok(stream)
                }
                Err(e) => {
                    tracing::warn!("{} accept failed: {}", name, e);
                    Err(SessionEnd::Lost)
                }
            },
        }
    }

    /// Operator input always takes control back from a running script.
    async fn dispatch(&self, item: Result<Inbound, CommandError>) {
        let p = &self.processor;
        match item {
            Ok(Inbound::Line(line)) => {
                p.interrupt_script().await;
                if let Err(e) = p.handle_line(&line).await {
                    tracing::warn!("Command {:?} rejected: {}", line, e);
                }
            }
            Ok(Inbound::Script(body)) => {
                if let Err(e) = p.run_script_bytes(&body).await {
                    tracing::warn!("Script upload rejected: {}", e);
                }
            }
            Err(e) => tracing::warn!("Command channel: {}", e),
        }
    }

    fn write_session_file(&self, peer: SocketAddr) {
        let path = self.config.session_file_path();
        let body = format!(
            "operator_ip={}\noperator_port={}\nconnect_time={}\n",
            peer.ip(),
            peer.port(),
            Local::now().format("%H:%M:%S %d-%m-%Y")
        );
        if let Err(e) = std::fs::write(&path, body) {
            tracing::warn!("Failed to write {}: {}", path.display(), e);
        }
    }

    fn spawn_grace(self: &Arc<Self>) -> GraceTask {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.clone().grace_then_rollback(cancel.clone()));
        GraceTask { cancel, handle }
    }

    async fn grace_then_rollback(self: Arc<Self>, cancel: CancellationToken) {
        let lost_at = Instant::now();
        loop {
            if !sleep_unless_cancelled(self.config.grace_poll, &cancel).await {
                tracing::info!("Operator back within grace window, no rollback");
                return;
            }
            let waited = lost_at.elapsed();
            tracing::info!("Without operator for {} s", waited.as_secs());
            if waited >= self.config.grace_window {
                break;
            }
        }

        self.set_state(SessionState::RollingBack);
        let log_path = self.config.transition_log_path();
        match execute_rollback(self.processor.clone(), &log_path, &cancel).await {
            Ok(report) => tracing::info!("Rollback report: {:?}", report),
            Err(e) => tracing::warn!("Rollback aborted, cannot read {}: {}", log_path.display(), e),
        }
        if !cancel.is_cancelled() {
            self.set_state(SessionState::WaitingForOperator);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::RecordingActuator;
    use crate::heartbeat::{ACK, PING};
    use crate::motion::Direction;
    use crate::sensor::SensorReading;
    use crate::transition_log::{read_records, TransitionLog};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        processor: Arc<CommandProcessor>,
        actuator: RecordingActuator,
        sensors: SensorFeed,
        control: SocketAddr,
        command: SocketAddr,
        sensor: SocketAddr,
        shutdown: CancellationToken,
        task: JoinHandle<Result<()>>,
        config: ControllerConfig,
        _dir: TempDir,
    }

    struct Operator {
        control: TcpStream,
        command: TcpStream,
        sensor: TcpStream,
    }

    async fn start(grace_window: Duration) -> Harness {
        let dir = tempdir().unwrap();
        let mut config = ControllerConfig::with_base_dir(dir.path());
        config.bind_host = "127.0.0.1".into();
        config.control_port = 0;
        config.command_port = 0;
        config.sensor_port = 0;
        config.heartbeat_timeout = Duration::from_secs(5);
        config.heartbeat_poll = Duration::from_millis(20);
        config.grace_window = grace_window;
        config.grace_poll = Duration::from_millis(50);
        config.prepare_dirs().unwrap();

        let actuator = RecordingActuator::new();
        let log = TransitionLog::open(config.transition_log_path()).unwrap();
        let processor = Arc::new(CommandProcessor::new(
            Box::new(actuator.clone()),
            log,
            config.script_dir(),
        ));
        let sensors = SensorFeed::new();
        let listeners = Listeners::bind(&config).await.unwrap();
        let (control, command, sensor) = (
            listeners.control_addr().unwrap(),
            listeners.command_addr().unwrap(),
            listeners.sensor_addr().unwrap(),
        );

        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            processor.clone(),
            sensors.clone(),
            None,
        ));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(orchestrator.clone().run(listeners, shutdown.clone()));

        Harness {
            orchestrator,
            processor,
            actuator,
            sensors,
            control,
            command,
            sensor,
            shutdown,
            task,
            config,
            _dir: dir,
        }
    }

    impl Harness {
        async fn connect(&self) -> Operator {
            let control = TcpStream::connect(self.control).await.unwrap();
            let command = TcpStream::connect(self.command).await.unwrap();
            let sensor = TcpStream::connect(self.sensor).await.unwrap();
            Operator {
                control,
                command,
                sensor,
            }
        }

        fn log(&self) -> Vec<String> {
            read_records(self.config.transition_log_path())
                .unwrap()
                .iter()
                .map(|r| r.body.to_string())
                .collect()
        }

        async fn wait_state(&self, state: SessionState) {
            let mut rx = self.orchestrator.subscribe_state();
            tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
                .await
                .expect("state not reached")
                .unwrap();
        }

        async fn finish(self) {
            self.shutdown.cancel();
            self.task.await.unwrap().unwrap();
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_connected_session_routes_all_channels() {
        let h = start(Duration::from_secs(10)).await;
        let mut op = h.connect().await;
        h.wait_state(SessionState::Connected).await;

        op.command.write_all(b"w\nSPD:bogus\n+\n").await.unwrap();
        wait_until(|| h.actuator.last().map(|f| f.to_string()) == Some("10600".into())).await;

        op.control.write_all(PING).await.unwrap();
        let mut reply = [0u8; 4];
        op.control.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, ACK);

        // Give the relay time to subscribe before publishing.
        let mut lines = BufReader::new(&mut op.sensor).lines();
        let reading = SensorReading::parse("0010180").unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                h.sensors.publish(reading);
                tokio::select! {
                    l = lines.next_line() => break l,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(line.as_deref(), Some("0010180"));

        let session = std::fs::read_to_string(h.config.session_file_path()).unwrap();
        assert!(session.starts_with("operator_ip=127.0.0.1\n"));

        let processor = h.processor.clone();
        let actuator = h.actuator.clone();
        h.finish().await;
        assert_eq!(processor.state().direction, Direction::Stop);
        assert_eq!(actuator.last().unwrap().to_string(), "00600");
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_skips_rollback() {
        let h = start(Duration::from_millis(800)).await;
        let mut op = h.connect().await;
        h.wait_state(SessionState::Connected).await;
        op.command.write_all(b"w\n").await.unwrap();
        wait_until(|| h.processor.state().direction == Direction::Forward).await;

        drop(op);
        h.wait_state(SessionState::Lost).await;
        assert_eq!(h.processor.state().direction, Direction::Stop);

        let _op = h.connect().await;
        h.wait_state(SessionState::Connected).await;
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let log = h.log();
        assert!(!log.iter().any(|l| l.starts_with("RB:") || l.contains("ROLLBACK")));
        assert_eq!(
            log.iter().filter(|l| *l == "SYS:OPERATOR_CONNECTED").count(),
            2
        );
        assert_eq!(h.orchestrator.state(), SessionState::Connected);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_grace_elapses_into_rollback() {
        let h = start(Duration::from_millis(200)).await;
        let mut op = h.connect().await;
        h.wait_state(SessionState::Connected).await;
        op.command.write_all(b"w\n").await.unwrap();
        wait_until(|| h.processor.state().direction == Direction::Forward).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        drop(op);
        h.wait_state(SessionState::RollingBack).await;
        h.wait_state(SessionState::WaitingForOperator).await;

        let log = h.log();
        let lost = log.iter().position(|l| l == "SYS:OPERATOR_LOST").unwrap();
        assert_eq!(
            log[lost + 1..],
            [
                "SYS:ROLLBACK_STARTED",
                "RB:DIR:0->2(BACKWARD)",
                "RB:DIR:2->0(STOP)",
                "SYS:ROLLBACK_FINISHED"
            ]
        );
        assert_eq!(h.actuator.last().unwrap().to_string(), "00500");
        h.finish().await;
    }

    #[tokio::test]
    async fn test_reconnect_cancels_running_rollback() {
        let h = start(Duration::from_millis(100)).await;
        let mut op = h.connect().await;
        h.wait_state(SessionState::Connected).await;
        op.command.write_all(b"a\n").await.unwrap();
        wait_until(|| h.processor.state().direction == Direction::Left).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        drop(op);
        h.wait_state(SessionState::RollingBack).await;
        wait_until(|| h.processor.state().direction == Direction::Right).await;

        let _op = h.connect().await;
        h.wait_state(SessionState::Connected).await;
        assert_eq!(h.processor.state().direction, Direction::Stop);
        assert!(!h.processor.is_rollback_mode());
        assert!(h.log().contains(&"SYS:ROLLBACK_CANCELLED".to_string()));
        h.finish().await;
    }

    #[tokio::test]
    async fn test_new_operator_supersedes_session() {
        let h = start(Duration::from_secs(10)).await;
        let mut first = h.connect().await;
        h.wait_state(SessionState::Connected).await;
        first.command.write_all(b"e\n").await.unwrap();
        wait_until(|| h.processor.state().direction == Direction::TurnRight).await;

        let mut second = h.connect().await;
        wait_until(|| {
            h.log()
                .iter()
                .filter(|l| *l == "SYS:OPERATOR_CONNECTED")
                .count()
                == 2
        })
        .await;
        assert_eq!(h.orchestrator.state(), SessionState::Connected);

        second.command.write_all(b"q\n").await.unwrap();
        wait_until(|| h.processor.state().direction == Direction::TurnLeft).await;
        second.control.write_all(PING).await.unwrap();
        let mut reply = [0u8; 4];
        second.control.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, ACK);
        h.finish().await;
    }
}
