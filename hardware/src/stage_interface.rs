//! Stage interface trait for alignment workflows.

use std::fmt;

/// Stage axis used by the tip/tilt/power correction loop.
///
/// The discriminant is the controller address on the bench's stage bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageChannel {
    Tilt = 1,
    Tip = 2,
    Power = 3,
}

impl StageChannel {
    pub const ALL: [StageChannel; 3] = [StageChannel::Tilt, StageChannel::Tip, StageChannel::Power];

    /// Controller address of this channel.
    pub fn address(self) -> u8 {
        self as u8
    }

    pub fn from_address(address: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.address() == address)
    }
}

impl fmt::Display for StageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageChannel::Tilt => "tilt",
            StageChannel::Tip => "tip",
            StageChannel::Power => "power",
        };
        write!(f, "{name} (channel {})", self.address())
    }
}

/// Interface for stage control
///
/// Abstracts the stage hardware for testability in alignment workflows. Only
/// relative motion is needed by the correction loop.
pub trait StageInterface {
    type Error: fmt::Display;

    /// Move one channel by `delta` in the controller's physical units.
    fn move_relative(&mut self, channel: StageChannel, delta: f64) -> Result<(), Self::Error>;
}

impl<S: StageInterface + ?Sized> StageInterface for &mut S {
    type Error = S::Error;

    fn move_relative(&mut self, channel: StageChannel, delta: f64) -> Result<(), Self::Error> {
        (**self).move_relative(channel, delta)
    }
}
