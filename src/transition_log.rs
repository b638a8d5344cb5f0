//! Append-only transition log.
//!
//! One text record per line, flushed as soon as it is written:
//!
//! ```text
//! [16.10.2026][14:03:11.482] SYS:OPERATOR_CONNECTED
//! [16.10.2026][14:03:12.010] DIR:0->1(FORWARD)
//! [16.10.2026][14:03:13.220] SPD:50->60
//! [16.10.2026][14:03:17.010] DIR:1->0(STOP)
//! [16.10.2026][14:03:29.900] RB:DIR:0->2(BACKWARD)
//! ```
//!
//! `RB:` marks transitions issued while a rollback was driving the rover.
//! The rollback executor is the only reader; it never rewrites the file.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};

use crate::motion::{Direction, ServoCommand, Speed};
use crate::video::ResolutionStep;

/// `strftime` layout of the record timestamp.
pub const TIMESTAMP_FORMAT: &str = "[%d.%m.%Y][%H:%M:%S%.3f]";

const ROLLBACK_TAG: &str = "RB:";

/// Local wall-clock time, as written into log records.
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Lifecycle markers written by the session orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemEvent {
    OperatorConnected,
    OperatorLost,
    RollbackStarted,
    RollbackFinished,
    RollbackCancelled,
}

impl SystemEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemEvent::OperatorConnected => "OPERATOR_CONNECTED",
            SystemEvent::OperatorLost => "OPERATOR_LOST",
            SystemEvent::RollbackStarted => "ROLLBACK_STARTED",
            SystemEvent::RollbackFinished => "ROLLBACK_FINISHED",
            SystemEvent::RollbackCancelled => "ROLLBACK_CANCELLED",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "OPERATOR_CONNECTED" => SystemEvent::OperatorConnected,
            "OPERATOR_LOST" => SystemEvent::OperatorLost,
            "ROLLBACK_STARTED" => SystemEvent::RollbackStarted,
            "ROLLBACK_FINISHED" => SystemEvent::RollbackFinished,
            "ROLLBACK_CANCELLED" => SystemEvent::RollbackCancelled,
            _ => return None,
        })
    }
}

/// A single accepted change to the motion state (or video settings).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Direction { from: Direction, to: Direction },
    Servo { from: ServoCommand, to: ServoCommand },
    Speed { from: Speed, to: Speed },
    Resolution(ResolutionStep),
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Direction { from, to } => {
                write!(f, "DIR:{}->{}({})", from.code(), to.code(), to.name())
            }
            Transition::Servo { from, to } => {
                write!(f, "SERVO:{}->{}({})", from.code(), to.code(), to.name())
            }
            Transition::Speed { from, to } => write!(f, "SPD:{}->{}", from, to),
            Transition::Resolution(ResolutionStep::Down) => f.write_str("VIDEO:RES_DOWN"),
            Transition::Resolution(ResolutionStep::Up) => f.write_str("VIDEO:RES_UP"),
        }
    }
}

/// Parse `<old>-><new>` optionally followed by `(NAME)`.
fn parse_change(s: &str) -> Option<(i64, i64)> {
    let (from, rest) = s.split_once("->")?;
    let to = rest.split('(').next()?;
    Some((from.trim().parse().ok()?, to.trim().parse().ok()?))
}

impl Transition {
    fn parse(body: &str) -> Option<Self> {
        if let Some(rest) = body.strip_prefix("DIR:") {
            let (from, to) = parse_change(rest)?;
            return Some(Transition::Direction {
                from: Direction::from_code(from)?,
                to: Direction::from_code(to)?,
            });
        }
        if let Some(rest) = body.strip_prefix("SERVO:") {
            let (from, to) = parse_change(rest)?;
            return Some(Transition::Servo {
                from: ServoCommand::from_code(from)?,
                to: ServoCommand::from_code(to)?,
            });
        }
        if let Some(rest) = body.strip_prefix("SPD:") {
            let (from, to) = parse_change(rest)?;
            return Some(Transition::Speed {
                from: Speed::new(from)?,
                to: Speed::new(to)?,
            });
        }
        match body {
            "VIDEO:RES_DOWN" => Some(Transition::Resolution(ResolutionStep::Down)),
            "VIDEO:RES_UP" => Some(Transition::Resolution(ResolutionStep::Up)),
            _ => None,
        }
    }
}

/// What a record says, without its timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogBody {
    Transition {
        transition: Transition,
        /// Issued by the rollback executor rather than the operator or a script.
        rollback: bool,
    },
    System(SystemEvent),
}

impl fmt::Display for LogBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogBody::Transition {
                transition,
                rollback,
            } => {
                if *rollback {
                    f.write_str(ROLLBACK_TAG)?;
                }
                write!(f, "{}", transition)
            }
            LogBody::System(event) => write!(f, "SYS:{}", event.as_str()),
        }
    }
}

impl LogBody {
    fn parse(body: &str) -> Option<Self> {
        if let Some(event) = body.strip_prefix("SYS:") {
            return SystemEvent::parse(event.trim()).map(LogBody::System);
        }
        let (rollback, body) = match body.strip_prefix(ROLLBACK_TAG) {
            Some(rest) => (true, rest),
            None => (false, body),
        };
        Transition::parse(body.trim()).map(|transition| LogBody::Transition {
            transition,
            rollback,
        })
    }
}

/// One timestamped line of the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: NaiveDateTime,
    pub body: LogBody,
}

impl LogRecord {
    /// Parse a log line. Returns `None` for lines this version does not understand.
    pub fn parse(line: &str) -> Option<Self> {
        let (timestamp, rest) = NaiveDateTime::parse_and_remainder(line, TIMESTAMP_FORMAT).ok()?;
        let body = LogBody::parse(rest.trim())?;
        Some(LogRecord { timestamp, body })
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp.format(TIMESTAMP_FORMAT), self.body)
    }
}

/// Writer half of the transition log. Owned by the command processor.
pub struct TransitionLog {
    path: PathBuf,
    file: File,
}

impl TransitionLog {
    /// Open (or create) the log for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open transition log {}", path.display()))?;
        tracing::info!("Transition log opened: {}", path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record stamped with the current time and flush it.
    pub fn append(&mut self, body: LogBody) -> io::Result<LogRecord> {
        let record = LogRecord {
            timestamp: now(),
            body,
        };
        self.file.write_all(format!("{}\n", record).as_bytes())?;
        self.file.flush()?;
        Ok(record)
    }
}

/// Read every record the log holds, skipping lines that do not parse.
pub fn read_records(path: impl AsRef<Path>) -> io::Result<Vec<LogRecord>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text.lines().filter_map(LogRecord::parse).collect())
}

/// Records of the most recent operator session: everything from the last
/// `OPERATOR_CONNECTED` marker onward. Without any marker the whole log is
/// one session.
pub fn last_session(records: &[LogRecord]) -> &[LogRecord] {
    let start = records
        .iter()
        .rposition(|r| r.body == LogBody::System(SystemEvent::OperatorConnected))
        .unwrap_or(0);
    &records[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn ts(h: u32, m: u32, s: u32, ms: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 16)
            .unwrap()
            .and_hms_milli_opt(h, m, s, ms)
            .unwrap()
    }

    #[test]
    fn test_record_text_format() {
        let record = LogRecord {
            timestamp: ts(14, 3, 12, 10),
            body: LogBody::Transition {
                transition: Transition::Direction {
                    from: Direction::Stop,
                    to: Direction::Forward,
                },
                rollback: false,
            },
        };
        assert_eq!(record.to_string(), "[16.10.2026][14:03:12.010] DIR:0->1(FORWARD)");

        let rb = LogRecord {
            timestamp: ts(9, 0, 0, 5),
            body: LogBody::Transition {
                transition: Transition::Servo {
                    from: ServoCommand::Stop,
                    to: ServoCommand::Up,
                },
                rollback: true,
            },
        };
        assert_eq!(rb.to_string(), "[16.10.2026][09:00:00.005] RB:SERVO:0->2(SERVO_UP)");
    }

    #[test]
    fn test_parse_lines() {
        let r = LogRecord::parse("[16.10.2026][14:03:13.220] SPD:50->60").unwrap();
        assert_eq!(r.timestamp, ts(14, 3, 13, 220));
        assert_eq!(
            r.body,
            LogBody::Transition {
                transition: Transition::Speed {
                    from: Speed::new(50).unwrap(),
                    to: Speed::new(60).unwrap()
                },
                rollback: false
            }
        );

        let r = LogRecord::parse("[16.10.2026][14:03:29.900] RB:DIR:0->2(BACKWARD)").unwrap();
        assert!(matches!(
            r.body,
            LogBody::Transition {
                transition: Transition::Direction {
                    to: Direction::Backward,
                    ..
                },
                rollback: true
            }
        ));

        let r = LogRecord::parse("[16.10.2026][14:03:11.482] SYS:OPERATOR_CONNECTED").unwrap();
        assert_eq!(r.body, LogBody::System(SystemEvent::OperatorConnected));

        let r = LogRecord::parse("[16.10.2026][14:03:11.482] VIDEO:RES_UP").unwrap();
        assert_eq!(
            r.body,
            LogBody::Transition {
                transition: Transition::Resolution(ResolutionStep::Up),
                rollback: false
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(LogRecord::parse("").is_none());
        assert!(LogRecord::parse("DIR:0->1(FORWARD)").is_none());
        assert!(LogRecord::parse("[16.10.2026][14:03:11.482] DIR:0->9(BOGUS)").is_none());
        assert!(LogRecord::parse("[16.10.2026][14:03:11.482] SYS:REBOOTED").is_none());
        assert!(LogRecord::parse("[16.10.2026][14:03:11.482] SPD:abc->60").is_none());
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.log");

        let mut log = TransitionLog::open(&path).unwrap();
        log.append(LogBody::System(SystemEvent::OperatorConnected))
            .unwrap();
        let written = log
            .append(LogBody::Transition {
                transition: Transition::Direction {
                    from: Direction::Stop,
                    to: Direction::Left,
                },
                rollback: false,
            })
            .unwrap();
        drop(log);

        // Reopening appends rather than truncating.
        let mut log = TransitionLog::open(&path).unwrap();
        log.append(LogBody::System(SystemEvent::OperatorLost)).unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].body, written.body);
        // Millisecond precision survives the round trip.
        assert_eq!(records[1].to_string(), written.to_string());
        assert_eq!(records[2].body, LogBody::System(SystemEvent::OperatorLost));
    }

    #[test]
    fn test_last_session_segmentation() {
        let text = "\
[16.10.2026][10:00:00.000] SYS:OPERATOR_CONNECTED
[16.10.2026][10:00:01.000] DIR:0->1(FORWARD)
[16.10.2026][10:00:02.000] DIR:1->0(STOP)
[16.10.2026][10:05:00.000] SYS:OPERATOR_CONNECTED
[16.10.2026][10:05:01.000] DIR:0->3(RIGHT)
";
        let records: Vec<_> = text.lines().filter_map(LogRecord::parse).collect();
        let session = last_session(&records);
        assert_eq!(session.len(), 2);
        assert_eq!(session[0].body, LogBody::System(SystemEvent::OperatorConnected));
        assert_eq!(session[0].timestamp, ts(10, 5, 0, 0));

        let unmarked: Vec<_> = records[1..3].to_vec();
        assert_eq!(last_session(&unmarked).len(), 2);
    }
}
