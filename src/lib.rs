//! roverlink - teleoperation control plane for a Raspberry Pi rover.
//!
//! The operator drives the rover over three TCP channels (heartbeat,
//! commands, sensors) and watches it over a chunked JPEG stream on UDP.
//! Every motion change is written to a transition log; when the operator
//! disappears for longer than a grace window, the controller replays the
//! last session backwards to bring the rover home.
//!
//! # Features
//!
//! - `serial`: drive the motor controller over a UART (`serialport`)
//! - `camera`: capture from a V4L2 camera (`v4l`)
//!
//! Without them the controller runs against a null actuator and a
//! synthetic camera, which is enough to exercise the whole control plane.

pub mod actuator;
pub mod command;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod motion;
pub mod protocol;
pub mod rollback;
pub mod sensor;
pub mod session;
pub mod transition_log;
pub mod video;

pub use actuator::{ActuatorLink, NullActuator, RecordingActuator};
pub use command::{Command, CommandProcessor};
pub use config::ControllerConfig;
pub use error::{ChunkError, CommandError, FrameError};
pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use motion::{encode_frame, ActuatorFrame, Direction, MotionState, ServoCommand, Speed};
pub use rollback::{execute_rollback, RollbackExecutor};
pub use sensor::{SensorFeed, SensorReading};
pub use session::{Listeners, Orchestrator, SessionState};
pub use transition_log::TransitionLog;

#[cfg(feature = "serial")]
pub use actuator::serial::{list_ports, SerialActuator};
