//! Status codes and station commands

use strum::{Display, EnumIter, FromRepr};

use crate::error::MacError;

/// Last event reported by the station, numeric values are part of the
/// external interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum Status {
    Success = 1,
    UnspecifiedError = 2,
    RfInitFailed = 3,
    TxDelivered = 4,
    TxFailed = 5,
    BadBufSize = 6,
    BadAddress = 7,
    BadMacAddress = 8,
    IllegalArgument = 9,
    InsufficientBufferSpace = 10,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Backoff slot selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SlotSelection {
    /// Uniform in `[0, window]`
    Random,
    /// Always the full collision window
    Fixed,
}

/// Runtime commands accepted by the station
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Log the command list and current settings
    Help,
    /// Enable or disable diagnostic output
    Debug(bool),
    SlotSelection(SlotSelection),
    /// Beacon interval in seconds, `None` disables beacons
    BeaconInterval(Option<u32>),
}

impl Command {
    /// Parse a numeric `(code, value)` command pair
    pub fn parse(code: i32, value: i32) -> Result<Command, MacError> {
        match code {
            0 => Ok(Command::Help),
            1 => Ok(Command::Debug(value != 0)),
            2 if value == 0 => Ok(Command::SlotSelection(SlotSelection::Random)),
            2 => Ok(Command::SlotSelection(SlotSelection::Fixed)),
            3 if value == -1 => Ok(Command::BeaconInterval(None)),
            3 if value >= 0 => Ok(Command::BeaconInterval(Some(value as u32))),
            _ => Err(MacError::IllegalArgument),
        }
    }
}

pub const HELP: &str = "\
Cmd #0: Display command options and current settings
Cmd #1: Set debug level, 0 for no output, any other value for full output
Cmd #2: Set slot selection method, 0 for random, any other value for the full collision window
Cmd #3: Set beacon interval in seconds between the start of beacons, -1 disables";
