mod smc100;

pub use smc100::{ControllerState, Smc100, Smc100Error, Smc100Result, BAUD_RATE};

/// SMC100 bus on a local serial port.
pub type SerialSmc100 = Smc100<Box<dyn serialport::SerialPort>>;
