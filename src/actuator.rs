//! Link to the motor controller.
//!
//! The controller sits on a UART (an Arduino-class board on `/dev/ttyACM0`
//! in the reference build). Frames go out as 5 raw bytes; sensor lines come
//! back on the same port and are handed to [`crate::sensor`].
//!
//! Write failures are reported to the caller, which logs them. There is no
//! retry: the link is either there for the whole run or not at all.
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "serial")]
//! # fn example() -> anyhow::Result<()> {
//! use roverlink::actuator::{serial::SerialActuator, ActuatorLink};
//! use roverlink::motion::MotionState;
//!
//! let (mut link, _sensor_reader) = SerialActuator::open("/dev/ttyACM0", 115200)?;
//! link.write_frame(&MotionState::default().frame())?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::motion::ActuatorFrame;

/// Anything that can carry actuator frames to the motor controller.
pub trait ActuatorLink: Send {
    /// Write one frame verbatim.
    fn write_frame(&mut self, frame: &ActuatorFrame) -> Result<()>;
}

/// Link used when no motor controller is attached. Frames are dropped.
#[derive(Debug, Default)]
pub struct NullActuator;

impl ActuatorLink for NullActuator {
    fn write_frame(&mut self, frame: &ActuatorFrame) -> Result<()> {
        tracing::trace!("No actuator attached, dropping frame {}", frame);
        Ok(())
    }
}

/// In-memory link that keeps every frame it is given.
///
/// Clones share the same buffer, so a test can hand one clone to the
/// processor and inspect the other.
#[derive(Clone, Debug, Default)]
pub struct RecordingActuator {
    frames: Arc<Mutex<Vec<ActuatorFrame>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every frame written so far, oldest first.
    pub fn frames(&self) -> Vec<ActuatorFrame> {
        self.frames.lock().clone()
    }

    pub fn last(&self) -> Option<ActuatorFrame> {
        self.frames.lock().last().copied()
    }

    /// Frames rendered as their 5-character ASCII form.
    pub fn frame_strings(&self) -> Vec<String> {
        self.frames.lock().iter().map(|f| f.to_string()).collect()
    }

    /// Make subsequent writes fail, as a dead UART would.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

impl ActuatorLink for RecordingActuator {
    fn write_frame(&mut self, frame: &ActuatorFrame) -> Result<()> {
        if *self.failing.lock() {
            anyhow::bail!("link write failed");
        }
        self.frames.lock().push(*frame);
        Ok(())
    }
}

/// UART backend built on `serialport`.
#[cfg(feature = "serial")]
pub mod serial {
    use std::io::{Read, Write};
    use std::time::Duration;

    use anyhow::{Context, Result};
    use serialport::{DataBits, FlowControl, Parity, StopBits};

    use super::ActuatorLink;
    use crate::motion::{ActuatorFrame, FRAME_LEN};

    /// Read timeout of the sensor side, so the reader thread can notice shutdown.
    const READ_TIMEOUT: Duration = Duration::from_millis(100);

    /// Write half of the motor controller UART.
    pub struct SerialActuator {
        port: Box<dyn serialport::SerialPort>,
    }

    /// Read half of the motor controller UART (sensor lines).
    pub struct SerialSensorReader {
        port: Box<dyn serialport::SerialPort>,
    }

    impl SerialActuator {
        /// Open the port as 8N1 without flow control and split it into a
        /// frame writer and a sensor reader.
        pub fn open(path: &str, baud_rate: u32) -> Result<(Self, SerialSensorReader)> {
            let port = serialport::new(path, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(READ_TIMEOUT)
                .open()
                .with_context(|| format!("failed to open UART {}", path))?;
            let reader = port
                .try_clone()
                .context("failed to clone UART handle for sensor reader")?;

            tracing::info!("UART initialized on {} @ {} baud", path, baud_rate);
            Ok((Self { port }, SerialSensorReader { port: reader }))
        }
    }

    impl ActuatorLink for SerialActuator {
        fn write_frame(&mut self, frame: &ActuatorFrame) -> Result<()> {
            let n = self.port.write(frame.as_bytes())?;
            if n != FRAME_LEN {
                anyhow::bail!("short UART write: {} of {} bytes", n, FRAME_LEN);
            }
            Ok(())
        }
    }

    impl Read for SerialSensorReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.port.read(buf)
        }
    }

    /// Information about a detected serial port.
    #[derive(Clone, Debug)]
    pub struct PortInfo {
        pub name: String,
        pub description: String,
    }

    /// List serial ports the OS knows about, for `--list-ports`.
    pub fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|p| PortInfo {
                description: match p.port_type {
                    serialport::SerialPortType::UsbPort(info) => format!(
                        "USB {:04x}:{:04x} {}",
                        info.vid,
                        info.pid,
                        info.product.unwrap_or_default()
                    ),
                    serialport::SerialPortType::PciPort => "PCI".to_string(),
                    serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                    serialport::SerialPortType::Unknown => "unknown".to_string(),
                },
                name: p.port_name,
            })
            .collect())
    }
}
