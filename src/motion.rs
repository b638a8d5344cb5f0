//! Motion state and the fixed-width actuator frame.
//!
//! The motor controller consumes 5 ASCII digits per command:
//!
//! ```text
//! [direction:1][speed:3][servo:1]     e.g. "10500" = forward, 50 %, servo idle
//! ```
//!
//! No separator and no terminator. Every accepted transition re-sends the
//! full frame, so the controller never has to track partial updates.

use std::fmt;

use crate::error::FrameError;

/// Number of bytes in an actuator frame.
pub const FRAME_LEN: usize = 5;

/// Lowest accepted speed (percent).
pub const MIN_SPEED: u8 = 10;
/// Highest accepted speed (percent).
pub const MAX_SPEED: u8 = 100;
/// Increment applied by the `+` / `-` keys.
pub const SPEED_STEP: u8 = 10;
/// Speed at power-up.
pub const DEFAULT_SPEED: u8 = 50;

/// Drive direction. Discriminants are the wire codes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    #[default]
    Stop = 0,
    Forward = 1,
    Backward = 2,
    Right = 3,
    Left = 4,
    TurnRight = 5,
    TurnLeft = 6,
}

impl Direction {
    pub const ALL: [Direction; 7] = [
        Direction::Stop,
        Direction::Forward,
        Direction::Backward,
        Direction::Right,
        Direction::Left,
        Direction::TurnRight,
        Direction::TurnLeft,
    ];

    /// Look up a direction by wire code. `None` if outside 0..=6.
    pub fn from_code(code: i64) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_moving(self) -> bool {
        self != Direction::Stop
    }

    /// The direction that undoes this one. Stop has no inverse.
    pub fn inverse(self) -> Option<Direction> {
        match self {
            Direction::Stop => None,
            Direction::Forward => Some(Direction::Backward),
            Direction::Backward => Some(Direction::Forward),
            Direction::Right => Some(Direction::Left),
            Direction::Left => Some(Direction::Right),
            Direction::TurnRight => Some(Direction::TurnLeft),
            Direction::TurnLeft => Some(Direction::TurnRight),
        }
    }

    /// Operator key that selects this direction.
    pub fn key(self) -> char {
        match self {
            Direction::Stop => 'n',
            Direction::Forward => 'w',
            Direction::Backward => 's',
            Direction::Right => 'd',
            Direction::Left => 'a',
            Direction::TurnRight => 'e',
            Direction::TurnLeft => 'q',
        }
    }

    /// Name used in transition log records.
    pub fn name(self) -> &'static str {
        match self {
            Direction::Stop => "STOP",
            Direction::Forward => "FORWARD",
            Direction::Backward => "BACKWARD",
            Direction::Right => "RIGHT",
            Direction::Left => "LEFT",
            Direction::TurnRight => "TURN_RIGHT",
            Direction::TurnLeft => "TURN_LEFT",
        }
    }
}

/// Camera servo command. Discriminants are the wire codes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServoCommand {
    #[default]
    Stop = 0,
    Right = 1,
    Up = 2,
    Down = 3,
    Left = 4,
}

impl ServoCommand {
    pub const ALL: [ServoCommand; 5] = [
        ServoCommand::Stop,
        ServoCommand::Right,
        ServoCommand::Up,
        ServoCommand::Down,
        ServoCommand::Left,
    ];

    /// Look up a servo command by wire code. `None` if outside 0..=4.
    pub fn from_code(code: i64) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            ServoCommand::Stop => "SERVO_STOP",
            ServoCommand::Right => "SERVO_RIGHT",
            ServoCommand::Up => "SERVO_UP",
            ServoCommand::Down => "SERVO_DOWN",
            ServoCommand::Left => "SERVO_LEFT",
        }
    }
}

/// Drive speed in percent, always within `MIN_SPEED..=MAX_SPEED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Speed(u8);

impl Speed {
    pub const MIN: Speed = Speed(MIN_SPEED);
    pub const MAX: Speed = Speed(MAX_SPEED);

    /// Validate a percentage. Out-of-range values are rejected, not clamped.
    pub fn new(percent: i64) -> Option<Self> {
        if (MIN_SPEED as i64..=MAX_SPEED as i64).contains(&percent) {
            Some(Speed(percent as u8))
        } else {
            None
        }
    }

    pub fn percent(self) -> u8 {
        self.0
    }

    /// One step faster, saturating at 100.
    pub fn step_up(self) -> Self {
        Speed(self.0.saturating_add(SPEED_STEP).min(MAX_SPEED))
    }

    /// One step slower, saturating at 10.
    pub fn step_down(self) -> Self {
        Speed(self.0.saturating_sub(SPEED_STEP).max(MIN_SPEED))
    }
}

impl Default for Speed {
    fn default() -> Self {
        Speed(DEFAULT_SPEED)
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current direction, speed and servo command of the rover.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MotionState {
    pub direction: Direction,
    pub speed: Speed,
    pub servo: ServoCommand,
}

impl MotionState {
    /// True iff the drive direction is not Stop.
    pub fn is_moving(&self) -> bool {
        self.direction.is_moving()
    }

    /// Frame describing this state.
    pub fn frame(&self) -> ActuatorFrame {
        encode_frame(self.direction, self.speed, self.servo)
    }
}

/// Encoded 5-byte actuator command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ActuatorFrame([u8; FRAME_LEN]);

/// Encode a motion triple as `[direction:1][speed:3][servo:1]`.
pub fn encode_frame(direction: Direction, speed: Speed, servo: ServoCommand) -> ActuatorFrame {
    let spd = speed.percent().clamp(MIN_SPEED, MAX_SPEED);
    ActuatorFrame([
        b'0' + direction.code(),
        b'0' + spd / 100,
        b'0' + (spd / 10) % 10,
        b'0' + spd % 10,
        b'0' + servo.code(),
    ])
}

impl ActuatorFrame {
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    /// Decode a frame back into its motion triple.
    pub fn decode(bytes: &[u8]) -> Result<(Direction, Speed, ServoCommand), FrameError> {
        if bytes.len() != FRAME_LEN {
            return Err(FrameError::Length(bytes.len()));
        }
        let mut digits = [0i64; FRAME_LEN];
        for (digit, &b) in digits.iter_mut().zip(bytes) {
            if !b.is_ascii_digit() {
                return Err(FrameError::NotDigit(b));
            }
            *digit = (b - b'0') as i64;
        }

        let direction = Direction::from_code(digits[0]).ok_or(FrameError::OutOfRange("direction"))?;
        let speed = Speed::new(digits[1] * 100 + digits[2] * 10 + digits[3])
            .ok_or(FrameError::OutOfRange("speed"))?;
        let servo = ServoCommand::from_code(digits[4]).ok_or(FrameError::OutOfRange("servo"))?;
        Ok((direction, speed, servo))
    }
}

impl fmt::Display for ActuatorFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Always ASCII digits.
        f.write_str(std::str::from_utf8(&self.0).unwrap_or("?????"))
    }
}
