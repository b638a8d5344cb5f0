//! Operator commands and the processor that applies them.
//!
//! [`CommandProcessor`] is the only writer of the motion state. Every
//! transition runs inside one critical section: validate, mutate, append
//! to the transition log, encode the frame and write it to the link. The
//! operator's socket, the script runner and the rollback executor can
//! therefore drive the rover concurrently without ever emitting a frame
//! that mixes two half-applied updates.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actuator::ActuatorLink;
use crate::error::CommandError;
use crate::motion::{Direction, MotionState, ServoCommand, Speed};
use crate::transition_log::{LogBody, SystemEvent, Transition, TransitionLog};
use crate::video::{Resolution, ResolutionStep, VideoControl};

/// Pause between script records, after the stop frame.
pub const SCRIPT_STEP_GAP: Duration = Duration::from_millis(50);

/// One decoded operator input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Drive(Direction),
    Servo(ServoCommand),
    SpeedUp,
    SpeedDown,
    Resolution(ResolutionStep),
    /// `SPD:<n>`
    SetSpeed(i64),
    /// `DIR:<n>`
    SetDirection(i64),
    /// `SERVO:<n>`
    SetServo(i64),
    /// `SCRIPT:<body>`
    Script(String),
}

impl Command {
    /// Map a single-key command.
    pub fn from_key(key: char) -> Result<Self, CommandError> {
        let cmd = match key {
            'w' => Command::Drive(Direction::Forward),
            's' => Command::Drive(Direction::Backward),
            'd' => Command::Drive(Direction::Right),
            'a' => Command::Drive(Direction::Left),
            'e' => Command::Drive(Direction::TurnRight),
            'q' => Command::Drive(Direction::TurnLeft),
            'n' | ' ' | '0' => Command::Drive(Direction::Stop),
            'l' => Command::Servo(ServoCommand::Right),
            'i' => Command::Servo(ServoCommand::Up),
            'k' => Command::Servo(ServoCommand::Down),
            'j' => Command::Servo(ServoCommand::Left),
            'u' => Command::Servo(ServoCommand::Stop),
            '+' | '=' => Command::SpeedUp,
            '-' | '_' => Command::SpeedDown,
            'x' => Command::Resolution(ResolutionStep::Down),
            'c' => Command::Resolution(ResolutionStep::Up),
            other => return Err(CommandError::UnknownKey(other)),
        };
        Ok(cmd)
    }

    /// Parse one line of the command channel (without its `\n`).
    pub fn parse_line(line: &str) -> Result<Self, CommandError> {
        // Only the line ending is stripped: a lone space is the stop key.
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(rest) = line.strip_prefix("SPD:") {
            return parse_number("speed", rest).map(Command::SetSpeed);
        }
        if let Some(rest) = line.strip_prefix("DIR:") {
            return parse_number("direction", rest).map(Command::SetDirection);
        }
        if let Some(rest) = line.strip_prefix("SERVO:") {
            return parse_number("servo", rest).map(Command::SetServo);
        }
        if let Some(rest) = line.strip_prefix("SCRIPT:") {
            return Ok(Command::Script(rest.to_string()));
        }

        let mut chars = line.chars();
        match (chars.next(), chars.next()) {
            (Some(key), None) => Command::from_key(key),
            _ => Err(CommandError::UnknownLine(line.to_string())),
        }
    }
}

fn parse_number(field: &'static str, payload: &str) -> Result<i64, CommandError> {
    payload
        .trim()
        .parse()
        .map_err(|_| CommandError::InvalidNumber {
            field,
            payload: payload.to_string(),
        })
}

/// One `char:speed:duration_ms` script record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScriptStep {
    pub key: char,
    pub speed: Speed,
    pub duration: Duration,
}

impl ScriptStep {
    pub fn parse(record: &str) -> Result<Self, CommandError> {
        let record = record.strip_suffix('\r').unwrap_or(record);
        let bad = || CommandError::InvalidScriptRecord(record.to_string());

        let mut parts = record.splitn(3, ':');
        let (Some(key), Some(speed), Some(duration)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };

        let mut key_chars = key.chars();
        let key = match (key_chars.next(), key_chars.next()) {
            (Some(k), None) => k,
            _ => return Err(bad()),
        };
        let speed: i64 = speed.trim().parse().map_err(|_| bad())?;
        let speed = Speed::new(speed).ok_or(CommandError::InvalidSpeed(speed))?;
        let duration_ms: u64 = duration.trim().parse().map_err(|_| bad())?;

        Ok(ScriptStep {
            key,
            speed,
            duration: Duration::from_millis(duration_ms),
        })
    }
}

/// Split a script body into records. Records are separated by newlines, or
/// by `;` so a single `SCRIPT:` line can carry several. Blank records are
/// skipped.
pub fn script_records(body: &str) -> impl Iterator<Item = &str> {
    body.split(['\n', ';'])
        .filter(|r| !r.trim().is_empty())
}

/// Sleep for `duration` unless `cancel` fires first. Returns `true` if the
/// full duration elapsed.
pub async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

struct Inner {
    state: MotionState,
    log: TransitionLog,
    link: Box<dyn ActuatorLink>,
}

impl Inner {
    fn record(&mut self, body: LogBody) {
        if let Err(e) = self.log.append(body) {
            tracing::warn!("Failed to append to {}: {}", self.log.path().display(), e);
        }
    }

    fn record_transition(&mut self, transition: Transition, rollback: bool) {
        tracing::debug!("{}{}", if rollback { "RB:" } else { "" }, transition);
        self.record(LogBody::Transition {
            transition,
            rollback,
        });
    }

    fn emit(&mut self) {
        let frame = self.state.frame();
        tracing::debug!("Frame -> actuator: {}", frame);
        if let Err(e) = self.link.write_frame(&frame) {
            tracing::warn!("Actuator write failed for {}: {}", frame, e);
        }
    }
}

struct ScriptTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Applies commands to the motion state and drives the actuator link.
pub struct CommandProcessor {
    inner: Mutex<Inner>,
    rollback_mode: AtomicBool,
    script_running: AtomicBool,
    script: tokio::sync::Mutex<Option<ScriptTask>>,
    script_dir: PathBuf,
    video: Option<Arc<VideoControl>>,
}

impl CommandProcessor {
    /// Create a processor at rest (stopped, default speed, servo idle).
    /// Staged scripts are written to `script_dir`.
    pub fn new(
        link: Box<dyn ActuatorLink>,
        log: TransitionLog,
        script_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: MotionState::default(),
                log,
                link,
            }),
            rollback_mode: AtomicBool::new(false),
            script_running: AtomicBool::new(false),
            script: tokio::sync::Mutex::new(None),
            script_dir: script_dir.into(),
            video: None,
        }
    }

    /// Let `x` / `c` change the resolution of this streamer.
    pub fn with_video(mut self, video: Arc<VideoControl>) -> Self {
        self.video = Some(video);
        self
    }

    pub fn state(&self) -> MotionState {
        self.inner.lock().state
    }

    /// Tag subsequent transitions as issued by a rollback.
    pub fn set_rollback_mode(&self, enabled: bool) {
        self.rollback_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn is_rollback_mode(&self) -> bool {
        self.rollback_mode.load(Ordering::SeqCst)
    }

    pub fn is_script_running(&self) -> bool {
        self.script_running.load(Ordering::SeqCst)
    }

    /// Set the drive direction and send the frame. Same-direction requests
    /// re-send the frame but are not logged.
    pub fn drive(&self, direction: Direction) {
        let mut inner = self.inner.lock();
        let from = inner.state.direction;
        inner.state.direction = direction;
        if from != direction {
            let rollback = self.is_rollback_mode();
            inner.record_transition(Transition::Direction { from, to: direction }, rollback);
        }
        inner.emit();
    }

    pub fn set_servo(&self, servo: ServoCommand) {
        let mut inner = self.inner.lock();
        let from = inner.state.servo;
        inner.state.servo = servo;
        if from != servo {
            let rollback = self.is_rollback_mode();
            inner.record_transition(Transition::Servo { from, to: servo }, rollback);
        }
        inner.emit();
    }

    /// Set the speed. The frame is only re-sent while moving.
    pub fn set_speed(&self, speed: Speed) {
        self.update_speed(|_| speed);
    }

    pub fn speed_up(&self) {
        self.update_speed(Speed::step_up);
    }

    pub fn speed_down(&self) {
        self.update_speed(Speed::step_down);
    }

    fn update_speed(&self, f: impl FnOnce(Speed) -> Speed) {
        let mut inner = self.inner.lock();
        let from = inner.state.speed;
        let to = f(from);
        inner.state.speed = to;
        if from != to {
            inner.record_transition(Transition::Speed { from, to }, self.is_rollback_mode());
        }
        if inner.state.is_moving() {
            inner.emit();
        }
    }

    /// `DIR:<n>`. Out-of-range codes leave the state untouched.
    pub fn set_direction_code(&self, code: i64) -> Result<(), CommandError> {
        let direction = Direction::from_code(code).ok_or(CommandError::InvalidDirection(code))?;
        self.drive(direction);
        Ok(())
    }

    /// `SERVO:<n>`.
    pub fn set_servo_code(&self, code: i64) -> Result<(), CommandError> {
        let servo = ServoCommand::from_code(code).ok_or(CommandError::InvalidServo(code))?;
        self.set_servo(servo);
        Ok(())
    }

    /// `SPD:<n>`.
    pub fn set_speed_percent(&self, percent: i64) -> Result<(), CommandError> {
        let speed = Speed::new(percent).ok_or(CommandError::InvalidSpeed(percent))?;
        self.set_speed(speed);
        Ok(())
    }

    /// Step the video resolution. `Ok(None)` when already at that end of
    /// the ladder, in which case nothing is logged.
    pub fn step_resolution(
        &self,
        step: ResolutionStep,
    ) -> Result<Option<Resolution>, CommandError> {
        let video = self.video.as_ref().ok_or(CommandError::NoVideo)?;
        let mut inner = self.inner.lock();
        let changed = video.step_resolution(step);
        if changed.is_some() {
            inner.record_transition(Transition::Resolution(step), self.is_rollback_mode());
        }
        Ok(changed)
    }

    /// Stop the drive unless it is already stopped. Returns `true` if a
    /// stop frame was sent.
    pub fn halt_if_moving(&self) -> bool {
        let mut inner = self.inner.lock();
        let from = inner.state.direction;
        if from == Direction::Stop {
            return false;
        }
        inner.state.direction = Direction::Stop;
        let rollback = self.is_rollback_mode();
        inner.record_transition(
            Transition::Direction {
                from,
                to: Direction::Stop,
            },
            rollback,
        );
        inner.emit();
        true
    }

    /// Stop both the drive and the servo with a single frame.
    pub fn stop_all(&self) {
        let mut inner = self.inner.lock();
        let rollback = self.is_rollback_mode();
        let MotionState { direction, servo, .. } = inner.state;
        inner.state.direction = Direction::Stop;
        inner.state.servo = ServoCommand::Stop;
        if direction != Direction::Stop {
            inner.record_transition(
                Transition::Direction {
                    from: direction,
                    to: Direction::Stop,
                },
                rollback,
            );
        }
        if servo != ServoCommand::Stop {
            inner.record_transition(
                Transition::Servo {
                    from: servo,
                    to: ServoCommand::Stop,
                },
                rollback,
            );
        }
        inner.emit();
    }

    pub fn log_system_event(&self, event: SystemEvent) {
        tracing::info!("SYS:{}", event.as_str());
        self.inner.lock().record(LogBody::System(event));
    }

    /// Apply any command that takes effect immediately. Scripts need the
    /// async [`CommandProcessor::apply`].
    pub fn apply_immediate(&self, command: &Command) -> Result<(), CommandError> {
        match *command {
            Command::Drive(direction) => self.drive(direction),
            Command::Servo(servo) => self.set_servo(servo),
            Command::SpeedUp => self.speed_up(),
            Command::SpeedDown => self.speed_down(),
            Command::Resolution(step) => {
                self.step_resolution(step)?;
            }
            Command::SetSpeed(n) => self.set_speed_percent(n)?,
            Command::SetDirection(n) => self.set_direction_code(n)?,
            Command::SetServo(n) => self.set_servo_code(n)?,
            Command::Script(_) => return Err(CommandError::NestedScript),
        }
        Ok(())
    }

    /// Apply a command, starting a script run for `SCRIPT:`.
    pub async fn apply(self: &Arc<Self>, command: Command) -> Result<(), CommandError> {
        match command {
            Command::Script(body) => self.run_script_bytes(body.as_bytes()).await,
            other => self.apply_immediate(&other),
        }
    }

    /// Parse and apply one command-channel line.
    pub async fn handle_line(self: &Arc<Self>, line: &str) -> Result<(), CommandError> {
        let command = Command::parse_line(line)?;
        self.apply(command).await
    }

    /// Persist a script body to a fresh file under the script directory.
    pub fn stage_script(&self, body: &[u8]) -> Result<PathBuf, CommandError> {
        let mut file = tempfile::Builder::new()
            .prefix("robot_script_")
            .suffix(".txt")
            .tempfile_in(&self.script_dir)?;
        file.write_all(body)?;
        file.flush()?;
        let path = file.into_temp_path().keep().map_err(|e| e.error)?;
        Ok(path)
    }

    /// Stage `body` and run it, replacing any running script.
    pub async fn run_script_bytes(self: &Arc<Self>, body: &[u8]) -> Result<(), CommandError> {
        let path = self.stage_script(body)?;
        self.start_script_file(path).await;
        Ok(())
    }

    /// Run the script at `path`, cancelling and joining the current one
    /// first. The file is removed when the run ends.
    pub async fn start_script_file(self: &Arc<Self>, path: PathBuf) {
        let mut slot = self.script.lock().await;
        if let Some(previous) = slot.take() {
            self.finish_script(previous).await;
        }

        let cancel = CancellationToken::new();
        self.script_running.store(true, Ordering::SeqCst);
        tracing::info!("Starting script {}", path.display());
        let handle = tokio::spawn(run_script(self.clone(), path, cancel.clone()));
        *slot = Some(ScriptTask { cancel, handle });
    }

    /// Cancel and join the running script, if any. Motion is stopped when
    /// a script was actually interrupted.
    pub async fn interrupt_script(&self) {
        let task = self.script.lock().await.take();
        if let Some(task) = task {
            self.finish_script(task).await;
        }
    }

    async fn finish_script(&self, task: ScriptTask) {
        let was_running = !task.handle.is_finished();
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            tracing::error!("Script task failed: {}", e);
        }
        self.script_running.store(false, Ordering::SeqCst);
        if was_running {
            tracing::info!("Script interrupted");
            self.halt_if_moving();
        }
    }

    /// Stop any script and bring the rover to rest.
    pub async fn shutdown(&self) {
        self.interrupt_script().await;
        self.stop_all();
    }
}

async fn run_script(processor: Arc<CommandProcessor>, path: PathBuf, cancel: CancellationToken) {
    match std::fs::read_to_string(&path) {
        Ok(body) => play_script(&processor, &body, &cancel).await,
        Err(e) => tracing::warn!("Failed to read script {}: {}", path.display(), e),
    }
    remove_script(&path);
    processor.script_running.store(false, Ordering::SeqCst);
}

async fn play_script(processor: &CommandProcessor, body: &str, cancel: &CancellationToken) {
    for record in script_records(body) {
        if cancel.is_cancelled() {
            return;
        }
        let step = match ScriptStep::parse(record) {
            Ok(step) => step,
            Err(e) => {
                tracing::warn!("Skipping script record: {}", e);
                continue;
            }
        };
        let command = match Command::from_key(step.key) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Skipping script record {:?}: {}", record, e);
                continue;
            }
        };

        tracing::debug!("Script step {:?}", step);
        processor.set_speed(step.speed);
        if let Err(e) = processor.apply_immediate(&command) {
            tracing::warn!("Script command {:?} failed: {}", step.key, e);
        }
        let completed = sleep_unless_cancelled(step.duration, cancel).await;
        // Same as the `n` key: the servo keeps whatever the operator set.
        processor.drive(Direction::Stop);
        if !completed || !sleep_unless_cancelled(SCRIPT_STEP_GAP, cancel).await {
            return;
        }
    }
    tracing::info!("Script finished");
}

fn remove_script(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!("Failed to remove script {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::RecordingActuator;
    use crate::transition_log::read_records;
    use tempfile::{tempdir, TempDir};
    use tokio::time::Instant;

    fn processor() -> (Arc<CommandProcessor>, RecordingActuator, TempDir) {
        let dir = tempdir().unwrap();
        let rec = RecordingActuator::new();
        let log = TransitionLog::open(dir.path().join("commands.log")).unwrap();
        let p = CommandProcessor::new(Box::new(rec.clone()), log, dir.path());
        (Arc::new(p), rec, dir)
    }

    fn log_lines(dir: &TempDir) -> Vec<String> {
        read_records(dir.path().join("commands.log"))
            .unwrap()
            .iter()
            .map(|r| r.body.to_string())
            .collect()
    }

    async fn wait_for_script(p: &CommandProcessor) {
        while p.is_script_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_key_mapping() {
        let keys = [
            ('w', Direction::Forward),
            ('s', Direction::Backward),
            ('d', Direction::Right),
            ('a', Direction::Left),
            ('e', Direction::TurnRight),
            ('q', Direction::TurnLeft),
            ('n', Direction::Stop),
            (' ', Direction::Stop),
            ('0', Direction::Stop),
        ];
        for (key, dir) in keys {
            assert_eq!(Command::from_key(key).unwrap(), Command::Drive(dir));
        }
        for d in Direction::ALL {
            assert_eq!(Command::from_key(d.key()).unwrap(), Command::Drive(d));
        }
        assert_eq!(Command::from_key('i').unwrap(), Command::Servo(ServoCommand::Up));
        assert_eq!(Command::from_key('l').unwrap(), Command::Servo(ServoCommand::Right));
        assert_eq!(Command::from_key('u').unwrap(), Command::Servo(ServoCommand::Stop));
        assert_eq!(Command::from_key('=').unwrap(), Command::SpeedUp);
        assert_eq!(Command::from_key('_').unwrap(), Command::SpeedDown);
        assert_eq!(
            Command::from_key('x').unwrap(),
            Command::Resolution(ResolutionStep::Down)
        );
        assert!(matches!(Command::from_key('z'), Err(CommandError::UnknownKey('z'))));
    }

    #[test]
    fn test_parse_lines() {
        assert_eq!(Command::parse_line("SPD:70").unwrap(), Command::SetSpeed(70));
        assert_eq!(Command::parse_line("DIR: 3\r").unwrap(), Command::SetDirection(3));
        assert_eq!(Command::parse_line("SERVO:2").unwrap(), Command::SetServo(2));
        assert_eq!(
            Command::parse_line("SCRIPT:w:50:100").unwrap(),
            Command::Script("w:50:100".into())
        );
        assert_eq!(Command::parse_line("w\r").unwrap(), Command::Drive(Direction::Forward));
        assert_eq!(Command::parse_line(" ").unwrap(), Command::Drive(Direction::Stop));

        assert!(matches!(
            Command::parse_line("SPD:fast"),
            Err(CommandError::InvalidNumber { field: "speed", .. })
        ));
        assert!(matches!(
            Command::parse_line("hello"),
            Err(CommandError::UnknownLine(_))
        ));
        assert!(matches!(Command::parse_line(""), Err(CommandError::UnknownLine(_))));
    }

    #[test]
    fn test_script_step_parse() {
        let step = ScriptStep::parse("w:60:1500\r").unwrap();
        assert_eq!(step.key, 'w');
        assert_eq!(step.speed.percent(), 60);
        assert_eq!(step.duration, Duration::from_millis(1500));

        assert_eq!(ScriptStep::parse(" :50:10").unwrap().key, ' ');
        assert!(matches!(
            ScriptStep::parse("w:5:100"),
            Err(CommandError::InvalidSpeed(5))
        ));
        assert!(ScriptStep::parse("w:50").is_err());
        assert!(ScriptStep::parse("ww:50:10").is_err());
        assert!(ScriptStep::parse("w:50:-1").is_err());

        let records: Vec<_> = script_records("w:50:10\n\n  \na:50:10;d:50:10\n").collect();
        assert_eq!(records, vec!["w:50:10", "a:50:10", "d:50:10"]);
    }

    #[test]
    fn test_transitions_emit_frames_and_log_changes() {
        let (p, rec, dir) = processor();
        p.drive(Direction::Forward);
        p.drive(Direction::Forward);
        p.set_servo(ServoCommand::Up);

        assert_eq!(rec.frame_strings(), vec!["10500", "10500", "10502"]);
        assert_eq!(log_lines(&dir), vec!["DIR:0->1(FORWARD)", "SERVO:0->2(SERVO_UP)"]);
        assert!(p.state().is_moving());
    }

    #[test]
    fn test_out_of_domain_leaves_state_untouched() {
        let (p, rec, dir) = processor();
        let before = p.state();

        assert!(matches!(p.set_direction_code(7), Err(CommandError::InvalidDirection(7))));
        assert!(matches!(p.set_servo_code(-1), Err(CommandError::InvalidServo(-1))));
        assert!(matches!(p.set_speed_percent(101), Err(CommandError::InvalidSpeed(101))));
        assert!(matches!(p.set_speed_percent(0), Err(CommandError::InvalidSpeed(0))));

        assert_eq!(p.state(), before);
        assert!(rec.frames().is_empty());
        assert!(log_lines(&dir).is_empty());
    }

    #[test]
    fn test_speed_step_reemits_only_while_moving() {
        let (p, rec, dir) = processor();
        p.speed_up();
        assert!(rec.frames().is_empty());
        assert_eq!(p.state().speed.percent(), 60);

        p.drive(Direction::Left);
        p.speed_down();
        p.set_speed(Speed::MAX);
        p.speed_up();

        assert_eq!(rec.frame_strings(), vec!["40600", "40500", "41000", "41000"]);
        assert_eq!(
            log_lines(&dir),
            vec!["SPD:50->60", "DIR:0->4(LEFT)", "SPD:60->50", "SPD:50->100"]
        );
    }

    #[test]
    fn test_rollback_mode_tags_records() {
        let (p, _rec, dir) = processor();
        p.set_rollback_mode(true);
        p.drive(Direction::Backward);
        p.set_rollback_mode(false);
        p.drive(Direction::Stop);
        p.log_system_event(SystemEvent::RollbackFinished);

        assert_eq!(
            log_lines(&dir),
            vec!["RB:DIR:0->2(BACKWARD)", "DIR:2->0(STOP)", "SYS:ROLLBACK_FINISHED"]
        );
    }

    #[test]
    fn test_link_failure_is_not_fatal() {
        let (p, rec, dir) = processor();
        rec.set_failing(true);
        p.drive(Direction::TurnRight);
        assert_eq!(p.state().direction, Direction::TurnRight);
        assert_eq!(log_lines(&dir), vec!["DIR:0->5(TURN_RIGHT)"]);

        rec.set_failing(false);
        p.stop_all();
        assert_eq!(rec.frame_strings(), vec!["00500"]);
    }

    #[test]
    fn test_resolution_steps() {
        let (p, _rec, dir) = processor();
        assert!(matches!(
            p.step_resolution(ResolutionStep::Down),
            Err(CommandError::NoVideo)
        ));

        let dir_path = dir.path().to_path_buf();
        let log = TransitionLog::open(dir_path.join("commands.log")).unwrap();
        let p = CommandProcessor::new(Box::new(RecordingActuator::new()), log, &dir_path)
            .with_video(Arc::new(VideoControl::new()));

        assert_eq!(p.step_resolution(ResolutionStep::Up).unwrap(), None);
        assert_eq!(
            p.step_resolution(ResolutionStep::Down).unwrap(),
            Some(Resolution {
                width: 352,
                height: 288
            })
        );
        assert_eq!(log_lines(&dir), vec!["VIDEO:RES_DOWN"]);
    }

    #[test]
    fn test_stop_all_single_frame() {
        let (p, rec, dir) = processor();
        p.drive(Direction::Forward);
        p.set_servo(ServoCommand::Left);
        p.stop_all();

        assert_eq!(rec.last().unwrap().to_string(), "00500");
        assert_eq!(rec.frames().len(), 3);
        assert_eq!(
            log_lines(&dir)[2..],
            ["DIR:1->0(STOP)", "SERVO:4->0(SERVO_STOP)"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_script_plays_records_in_order() {
        let (p, rec, dir) = processor();
        let start = Instant::now();
        p.handle_line("SCRIPT:w:60:1000;bogus;d:70:500").await.unwrap();
        assert!(p.is_script_running());
        wait_for_script(&p).await;

        assert_eq!(rec.frame_strings(), vec!["10600", "00600", "30700", "00700"]);
        assert!(start.elapsed() >= Duration::from_millis(1600));

        // Staged file is cleaned up; only the log remains.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("robot_script_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_script_stops_motion() {
        let (p, rec, _dir) = processor();
        p.run_script_bytes(b"w:50:10000\n").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(p.state().direction, Direction::Forward);

        let start = Instant::now();
        p.interrupt_script().await;
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(!p.is_script_running());
        assert_eq!(p.state().direction, Direction::Stop);
        // One stop frame, from the runner itself.
        assert_eq!(rec.frame_strings(), vec!["10500", "00500"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_script_keeps_operator_servo() {
        let (p, rec, dir) = processor();
        p.set_servo(ServoCommand::Right);
        p.run_script_bytes(b"w:50:100").await.unwrap();
        wait_for_script(&p).await;

        assert_eq!(rec.frame_strings(), vec!["00501", "10501", "00501"]);
        assert_eq!(p.state().servo, ServoCommand::Right);
        assert!(!log_lines(&dir).iter().any(|l| l.starts_with("SERVO:1->0")));
    }

    #[test]
    fn test_halt_if_moving() {
        let (p, rec, dir) = processor();
        assert!(!p.halt_if_moving());
        assert!(rec.frames().is_empty());

        p.drive(Direction::Backward);
        assert!(p.halt_if_moving());
        assert!(!p.halt_if_moving());
        assert_eq!(rec.frame_strings(), vec!["20500", "00500"]);
        assert_eq!(log_lines(&dir), vec!["DIR:0->2(BACKWARD)", "DIR:2->0(STOP)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_script_supersedes_running_one() {
        let (p, rec, _dir) = processor();
        p.run_script_bytes(b"w:50:10000").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        p.run_script_bytes(b"a:50:100").await.unwrap();
        wait_for_script(&p).await;

        assert_eq!(
            rec.frame_strings(),
            vec!["10500", "00500", "40500", "00500"]
        );
    }

    #[test]
    fn test_nested_script_rejected() {
        let (p, _rec, _dir) = processor();
        assert!(matches!(
            p.apply_immediate(&Command::Script("w:50:10".into())),
            Err(CommandError::NestedScript)
        ));
    }
}
