pub mod calibration;
pub mod commands;
pub mod config;
pub mod error;
pub mod input;
pub mod schedule;
pub mod topics;
pub mod types;
pub mod ui;

pub use calibration::{CalibrationEngine, CalibrationProgress, CalibrationStage, DutyMap};
pub use commands::{PumpCommand, ScheduleAddRequest, ScheduleDeleteRequest};
pub use config::{DoserConfig, NetworkConfig, RuntimeConfig};
pub use error::{CalibrationError, CommandError, InputError, ScheduleError};
pub use schedule::{RunLog, ScheduleEntry, ScheduleEvaluator, ScheduleStore};
pub use topics::{DoseTopics, InboundTopic};
pub use types::{Button, ButtonSet, PumpActivity, PumpId, StartOutcome};
pub use ui::{Screen, UiContext, UiEffect, UiLimits, UiMachine};
