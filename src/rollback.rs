//! Autonomous rollback after operator loss.
//!
//! The transition log is cut to the last operator session and turned into
//! a list of timed moves. The moves are then replayed newest first with the
//! inverse direction, at the speed they were driven with, so the rover
//! retraces its path back toward where the operator last had it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio_util::sync::CancellationToken;

use crate::command::{sleep_unless_cancelled, CommandProcessor};
use crate::motion::{Direction, Speed};
use crate::transition_log::{self, last_session, LogBody, LogRecord, SystemEvent, Transition};

/// Wait after changing speed, before the move starts.
pub const SPEED_SETTLE: Duration = Duration::from_millis(100);
/// Wait after each stop, before the next move.
pub const STOP_SETTLE: Duration = Duration::from_millis(200);

/// A period of motion in one direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Move {
    pub direction: Direction,
    pub speed: Speed,
    pub start: NaiveDateTime,
    pub duration: Duration,
}

/// Rebuild the moves of the most recent session.
///
/// Rollback-tagged records are ignored, so a rollback that was interrupted
/// is never itself rolled back. A move still open at the end of the log is
/// closed against `now`.
pub fn reconstruct_moves(records: &[LogRecord], now: NaiveDateTime) -> Vec<Move> {
    let mut moves = Vec::new();
    let mut speed = Speed::default();
    let mut open: Option<(Direction, Speed, NaiveDateTime)> = None;

    let mut close = |open: Option<(Direction, Speed, NaiveDateTime)>, end: NaiveDateTime| {
        let Some((direction, speed, start)) = open else {
            return;
        };
        match (end - start).to_std() {
            Ok(duration) if !duration.is_zero() => moves.push(Move {
                direction,
                speed,
                start,
                duration,
            }),
            _ => tracing::debug!("Skipping {} move with no duration", direction.name()),
        }
    };

    for record in last_session(records) {
        let LogBody::Transition {
            transition,
            rollback: false,
        } = record.body
        else {
            continue;
        };
        match transition {
            Transition::Speed { to, .. } => speed = to,
            Transition::Direction { to, .. } => {
                close(open.take(), record.timestamp);
                if to.is_moving() {
                    open = Some((to, speed, record.timestamp));
                }
            }
            _ => {}
        }
    }
    close(open, now);
    moves
}

/// Outcome of one rollback run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub planned: usize,
    pub executed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

/// Replays the transition log in reverse through the command processor.
///
/// Holds no state between runs. The orchestrator guarantees at most one
/// run at a time.
pub struct RollbackExecutor {
    processor: Arc<CommandProcessor>,
    log_path: PathBuf,
}

impl RollbackExecutor {
    pub fn new(processor: Arc<CommandProcessor>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            processor,
            log_path: log_path.into(),
        }
    }

    /// Read the log and reconstruct the moves to undo.
    pub fn plan(&self) -> std::io::Result<Vec<Move>> {
        let records = transition_log::read_records(&self.log_path)?;
        Ok(reconstruct_moves(&records, transition_log::now()))
    }

    /// Run the rollback. Returns early, with the rover stopped, once
    /// `cancel` fires.
    pub async fn execute(&self, cancel: &CancellationToken) -> std::io::Result<RollbackReport> {
        tracing::info!("Parsing {} for rollback", self.log_path.display());
        let moves = self.plan()?;
        let mut report = RollbackReport {
            planned: moves.len(),
            ..Default::default()
        };
        if moves.is_empty() {
            tracing::info!("No movements to roll back");
            return Ok(report);
        }
        for (i, mv) in moves.iter().enumerate() {
            tracing::debug!(
                "  [{}] {} at {}% for {:?}",
                i,
                mv.direction.name(),
                mv.speed,
                mv.duration
            );
        }

        let p = &self.processor;
        p.set_rollback_mode(true);
        p.log_system_event(SystemEvent::RollbackStarted);

        let mut last_speed = None;
        for mv in moves.iter().rev() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let Some(inverse) = mv.direction.inverse() else {
                tracing::warn!("No inverse for {}, skipping move", mv.direction.name());
                report.skipped += 1;
                continue;
            };

            if last_speed != Some(mv.speed) {
                p.set_speed(mv.speed);
                last_speed = Some(mv.speed);
                if !sleep_unless_cancelled(SPEED_SETTLE, cancel).await {
                    report.cancelled = true;
                    break;
                }
            }

            tracing::info!(
                "Rollback: {} at {}% for {:?}",
                inverse.name(),
                mv.speed,
                mv.duration
            );
            p.drive(inverse);
            let completed = sleep_unless_cancelled(mv.duration, cancel).await;
            p.drive(Direction::Stop);
            report.executed += 1;

            if !completed || !sleep_unless_cancelled(STOP_SETTLE, cancel).await {
                report.cancelled = true;
                break;
            }
        }

        if report.cancelled {
            // Whatever was in flight, the rover ends at rest.
            p.halt_if_moving();
            tracing::info!("Rollback cancelled after {} move(s)", report.executed);
        } else {
            tracing::info!("Rollback finished, {} move(s) replayed", report.executed);
        }
        p.set_rollback_mode(false);
        p.log_system_event(if report.cancelled {
            SystemEvent::RollbackCancelled
        } else {
            SystemEvent::RollbackFinished
        });
        Ok(report)
    }
}

/// Roll back the last session recorded in `log_path`.
pub async fn execute_rollback(
    processor: Arc<CommandProcessor>,
    log_path: &Path,
    cancel: &CancellationToken,
) -> std::io::Result<RollbackReport> {
    RollbackExecutor::new(processor, log_path)
        .execute(cancel)
        .await
}
