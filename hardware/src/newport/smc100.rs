//! Newport SMC100 single-axis motion controller driver.
//!
//! # Protocol Overview
//!
//! The SMC100 speaks a two-letter ASCII command set over RS-232, with several
//! controllers daisy-chained on one bus and selected by an address prefix:
//!
//! ```text
//! 1PR0.0125\r\n     move controller 1 by +0.0125 (relative)
//! 2TP\r\n           query position of controller 2  ->  2TP1.23450\r\n
//! 3TE\r\n           query last error of controller 3 ->  3TE@\r\n
//! ```
//!
//! Motion commands return nothing, so every command is followed by a `TE`
//! query. `@` means no error; letters `A`..`X` identify the failure.
//!
//! # Transport
//!
//! 57600 baud, 8N1, XON/XOFF flow control. The driver is generic over any
//! `Read + Write` transport so it can be exercised without a serial port.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::stage_interface::{StageChannel, StageInterface};

/// Baud rate fixed by the SMC100 firmware.
pub const BAUD_RATE: u32 = 57_600;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur during SMC100 communication.
#[derive(Error, Debug)]
pub enum Smc100Error {
    /// Low-level I/O error (serial read/write failure).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to open the serial port.
    #[error("Serial port error: {0}")]
    SerialPort(String),

    /// No response received within the timeout period.
    #[error("Timeout waiting for response")]
    Timeout,

    /// Response from controller doesn't match expected format.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Controller reported an error via the `TE` query.
    #[error("Controller {address} error {code}: {message}")]
    ControllerError {
        address: u8,
        code: char,
        message: String,
    },
}

pub type Smc100Result<T> = Result<T, Smc100Error>;

/// Controller state reported by the `TS` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    NotReferenced,
    Configuration,
    Homing,
    Moving,
    Ready,
    Disable,
    Jogging,
    Unknown(u8),
}

impl ControllerState {
    fn from_code(code: u8) -> Self {
        match code {
            0x0A..=0x10 => ControllerState::NotReferenced,
            0x14 => ControllerState::Configuration,
            0x1E => ControllerState::Homing,
            0x28 => ControllerState::Moving,
            0x32..=0x34 => ControllerState::Ready,
            0x3C..=0x3E => ControllerState::Disable,
            0x46 | 0x47 => ControllerState::Jogging,
            other => ControllerState::Unknown(other),
        }
    }
}

/// Driver for a bus of SMC100 controllers.
pub struct Smc100<T: Read + Write> {
    port: T,
}

impl Smc100<Box<dyn serialport::SerialPort>> {
    /// Open the controller bus on a serial device (e.g. `/dev/ttyUSB0`, `COM3`).
    pub fn open(path: &str) -> Smc100Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(DEFAULT_TIMEOUT)
            .flow_control(serialport::FlowControl::Software)
            .open()
            .map_err(|e| Smc100Error::SerialPort(format!("{path}: {e}")))?;
        debug!("Opened SMC100 bus on {}", path);
        Ok(Self::from_transport(port))
    }
}

impl<T: Read + Write> Smc100<T> {
    pub fn from_transport(port: T) -> Self {
        Self { port }
    }

    /// Send a raw command to one controller. Does not read a response.
    pub fn send(&mut self, address: u8, command: &str) -> Smc100Result<()> {
        let msg = format!("{address}{command}\r\n");
        debug!("SMC100 send: {:?}", msg.trim_end());
        self.port.write_all(msg.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    /// Read one CR LF terminated response line, without the terminator.
    pub fn read(&mut self) -> Smc100Result<String> {
        let mut buf = [0u8; 1];
        let mut bytes = Vec::new();

        loop {
            match self.port.read(&mut buf) {
                Ok(0) => return Err(Smc100Error::Timeout),
                Ok(_) => {
                    if buf[0] == b'\n' {
                        break;
                    }
                    bytes.push(buf[0]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(Smc100Error::Timeout);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        let response: String = bytes.iter().map(|&b| b as char).collect();
        trace!("SMC100 recv: {:?}", response);
        Ok(response)
    }

    /// Send a query and return the value with the echoed `<addr><cmd>` stripped.
    pub fn query(&mut self, address: u8, command: &str) -> Smc100Result<String> {
        self.send(address, command)?;
        let response = self.read()?;
        let prefix = format!("{address}{}", command.trim_end_matches('?'));
        response
            .strip_prefix(&prefix)
            .map(|v| v.trim().to_string())
            .ok_or_else(|| Smc100Error::InvalidResponse(response.clone()))
    }

    /// Send a command and check for errors (for commands with no response).
    pub fn command(&mut self, address: u8, command: &str) -> Smc100Result<()> {
        self.send(address, command)?;
        self.check_error(address)
    }

    /// Check for controller errors by querying `TE`.
    pub fn check_error(&mut self, address: u8) -> Smc100Result<()> {
        let value = self.query(address, "TE")?;
        let code = value
            .chars()
            .next()
            .ok_or_else(|| Smc100Error::InvalidResponse(format!("{address}TE{value}")))?;

        if code == '@' {
            Ok(())
        } else {
            Err(Smc100Error::ControllerError {
                address,
                code,
                message: Self::error_message(code),
            })
        }
    }

    /// Get human-readable message for an SMC100 error code.
    fn error_message(code: char) -> String {
        match code {
            'A' => "Unknown message code or floating point controller address".to_string(),
            'B' => "Controller address not correct".to_string(),
            'C' => "Parameter missing or out of range".to_string(),
            'D' => "Command not allowed".to_string(),
            'E' => "Home sequence already started".to_string(),
            'G' => "Displacement out of limits".to_string(),
            'H' => "Command not allowed in NOT REFERENCED state".to_string(),
            'I' => "Command not allowed in CONFIGURATION state".to_string(),
            'J' => "Command not allowed in DISABLE state".to_string(),
            'K' => "Command not allowed in READY state".to_string(),
            'L' => "Command not allowed in HOMING state".to_string(),
            'M' => "Command not allowed in MOVING state".to_string(),
            'N' => "Current position out of software limit".to_string(),
            'S' => "Communication time out".to_string(),
            'U' => "Error during EEPROM access".to_string(),
            'V' => "Error during command execution".to_string(),
            _ => format!("Unknown error ({code})"),
        }
    }

    // ==================== Motion Commands ====================

    /// Move a controller by a relative distance in its physical unit (mm).
    pub fn move_relative(&mut self, address: u8, distance: f64) -> Smc100Result<()> {
        self.command(address, &format!("PR{distance:.6}"))
    }

    /// Move a controller to an absolute position.
    pub fn move_absolute(&mut self, address: u8, position: f64) -> Smc100Result<()> {
        self.command(address, &format!("PA{position:.6}"))
    }

    /// Start the home search. Required after power-up before any move.
    pub fn home(&mut self, address: u8) -> Smc100Result<()> {
        self.command(address, "OR")
    }

    /// Stop motion on one controller.
    pub fn stop(&mut self, address: u8) -> Smc100Result<()> {
        self.send(address, "ST")
    }

    // ==================== Queries ====================

    /// Current position of a controller.
    pub fn position(&mut self, address: u8) -> Smc100Result<f64> {
        let value = self.query(address, "TP")?;
        value
            .parse()
            .map_err(|_| Smc100Error::InvalidResponse(format!("Invalid position: {value}")))
    }

    /// Controller state from the `TS` query.
    pub fn state(&mut self, address: u8) -> Smc100Result<ControllerState> {
        let value = self.query(address, "TS")?;
        let invalid = || Smc100Error::InvalidResponse(format!("Invalid state: {value}"));
        // Six ASCII characters: four error bits, then the state code.
        if value.len() != 6 || !value.is_ascii() {
            return Err(invalid());
        }
        let code = value
            .get(4..6)
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .ok_or_else(invalid)?;
        Ok(ControllerState::from_code(code))
    }

    /// Poll the controller state until it reports READY or timeout.
    pub fn wait_ready(&mut self, address: u8, timeout: Duration) -> Smc100Result<()> {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                return Err(Smc100Error::Timeout);
            }
            if self.state(address)? == ControllerState::Ready {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl<T: Read + Write> StageInterface for Smc100<T> {
    type Error = Smc100Error;

    fn move_relative(&mut self, channel: StageChannel, delta: f64) -> Result<(), Self::Error> {
        Smc100::move_relative(self, channel.address(), delta)
    }
}
