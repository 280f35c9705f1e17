use thiserror::Error;

use crate::types::{Button, PumpId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("{pump} already has an entry at {hour:02}:{minute:02}")]
    Duplicate { pump: PumpId, hour: u8, minute: u8 },
    #[error("{pump} has no entry at {hour:02}:{minute:02}")]
    NotFound { pump: PumpId, hour: u8, minute: u8 },
    #[error("invalid schedule entry: {0}")]
    InvalidEntry(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown pump command `{0}`")]
    UnknownPumpCommand(String),
    #[error("invalid run duration `{0}`")]
    InvalidDuration(String),
    #[error("invalid pump id {0}")]
    InvalidPump(i64),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalibrationError {
    #[error("measured volume must be greater than zero")]
    ZeroMeasurement,
    #[error("calibration is {actual}, expected {expected}")]
    InvalidStage {
        expected: &'static str,
        actual: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("failed to read {button} pin: {reason}")]
    PinRead { button: Button, reason: String },
}
