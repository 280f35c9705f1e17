use serde_json::Value;
use tracing::{info, warn};

use crate::{error::CalibrationError, types::PumpId};

pub const MIN_DUTY: u16 = 100;
pub const MAX_DUTY: u16 = 1023;
pub const MAX_MEASURED_ML: u16 = 999;

pub fn clamp_duty(duty: u32) -> u16 {
    duty.clamp(u32::from(MIN_DUTY), u32::from(MAX_DUTY)) as u16
}

/// Duty that would have dispensed `reference_ml` given that `current` dispensed
/// `measured_ml`. Assumes output scales linearly with duty.
pub fn corrected_duty(current: u16, reference_ml: u16, measured_ml: u16) -> Option<u16> {
    if measured_ml == 0 {
        return None;
    }
    let scaled = u32::from(current) * u32::from(reference_ml) / u32::from(measured_ml);
    Some(clamp_duty(scaled))
}

/// Per-pump power level, always within `[MIN_DUTY, MAX_DUTY]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyMap {
    duties: [u16; 2],
}

impl DutyMap {
    pub fn uniform(duty: u16) -> Self {
        let duty = clamp_duty(u32::from(duty));
        Self {
            duties: [duty, duty],
        }
    }

    pub fn get(&self, pump: PumpId) -> u16 {
        self.duties[pump.index()]
    }

    /// Stores `duty` clamped into range and returns the stored value.
    pub fn set(&mut self, pump: PumpId, duty: u32) -> u16 {
        let clamped = clamp_duty(duty);
        self.duties[pump.index()] = clamped;
        clamped
    }

    /// Reads `{"pump_pwm_duty": {"1": 900, "2": 1023}}`. Missing or invalid
    /// pumps keep `default_duty`.
    pub fn from_value(value: &Value, default_duty: u16) -> Self {
        let mut map = Self::uniform(default_duty);
        let Some(duties) = value.get("pump_pwm_duty").and_then(Value::as_object) else {
            warn!("calibration data has no pump_pwm_duty map; using defaults");
            return map;
        };

        for (key, duty) in duties {
            let pump = key.parse::<u8>().ok().and_then(PumpId::from_number);
            match (pump, duty.as_u64()) {
                (Some(pump), Some(duty)) => {
                    let stored = map.set(pump, u32::try_from(duty).unwrap_or(u32::MAX));
                    info!("PWM LOADED: {pump} duty = {stored}");
                }
                _ => warn!("ignoring calibration entry {key}={duty}"),
            }
        }
        map
    }

    pub fn to_value(&self) -> Value {
        let duties: serde_json::Map<String, Value> = PumpId::ALL
            .into_iter()
            .map(|pump| (pump.number().to_string(), Value::from(self.get(pump))))
            .collect();
        serde_json::json!({ "pump_pwm_duty": duties })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStage {
    Idle,
    Running,
    AwaitingInput,
}

impl CalibrationStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::AwaitingInput => "awaiting input",
        }
    }
}

/// Elapsed/remaining seconds of a reference run, written by the measurement
/// worker and read by the display. Staleness is harmless.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalibrationProgress {
    pub elapsed_s: u64,
    pub remaining_s: u64,
}

impl CalibrationProgress {
    pub fn at(elapsed_ms: u64, duration_ms: u64) -> Self {
        Self {
            elapsed_s: elapsed_ms / 1_000,
            remaining_s: duration_ms.saturating_sub(elapsed_ms) / 1_000,
        }
    }
}

/// What the worker should do after `start` succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceRun {
    pub pump: PumpId,
    pub duty: u16,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationSaved {
    pub pump: PumpId,
    pub previous_duty: u16,
    pub new_duty: u16,
}

/// Guided measurement: run the pump for a reference duration, ask how much
/// actually came out, derive a corrected duty.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    stage: CalibrationStage,
    pump: PumpId,
    measured_ml: u16,
    digit_cursor: u8,
    reference_ml: u16,
    reference_duration_ms: u64,
}

impl CalibrationEngine {
    pub fn new(reference_ml: u16, reference_duration_ms: u64) -> Self {
        Self {
            stage: CalibrationStage::Idle,
            pump: PumpId::One,
            measured_ml: reference_ml,
            digit_cursor: 0,
            reference_ml,
            reference_duration_ms,
        }
    }

    pub fn stage(&self) -> CalibrationStage {
        self.stage
    }

    pub fn pump(&self) -> PumpId {
        self.pump
    }

    pub fn measured_ml(&self) -> u16 {
        self.measured_ml
    }

    pub fn digit_cursor(&self) -> u8 {
        self.digit_cursor
    }

    pub fn reference_ml(&self) -> u16 {
        self.reference_ml
    }

    pub fn reference_duration_ms(&self) -> u64 {
        self.reference_duration_ms
    }

    pub fn is_active(&self) -> bool {
        self.stage != CalibrationStage::Idle
    }

    /// Prepares a fresh session for `pump`.
    pub fn reset(&mut self, pump: PumpId) {
        self.stage = CalibrationStage::Idle;
        self.pump = pump;
        self.measured_ml = self.reference_ml;
        self.digit_cursor = 0;
    }

    pub fn start(&mut self, duties: &DutyMap) -> Result<ReferenceRun, CalibrationError> {
        self.expect_stage(CalibrationStage::Idle)?;
        self.stage = CalibrationStage::Running;
        info!(
            "CAL: {} reference run started ({} ml over {}ms)",
            self.pump, self.reference_ml, self.reference_duration_ms
        );
        Ok(ReferenceRun {
            pump: self.pump,
            duty: duties.get(self.pump),
            duration_ms: self.reference_duration_ms,
        })
    }

    /// The worker could not be started; nothing ran.
    pub fn abort_start(&mut self) {
        if self.stage == CalibrationStage::Running {
            self.stage = CalibrationStage::Idle;
        }
    }

    pub fn stop_early(&mut self) -> Result<(), CalibrationError> {
        self.expect_stage(CalibrationStage::Running)?;
        self.stage = CalibrationStage::AwaitingInput;
        info!("CAL: {} stopped early by user", self.pump);
        Ok(())
    }

    /// The worker reached the reference duration. Returns whether this moved
    /// the engine forward; a stop already did so.
    pub fn worker_finished(&mut self) -> bool {
        if self.stage != CalibrationStage::Running {
            return false;
        }
        self.stage = CalibrationStage::AwaitingInput;
        info!("CAL: {} reference run completed", self.pump);
        true
    }

    pub fn save(&mut self, duties: &mut DutyMap) -> Result<CalibrationSaved, CalibrationError> {
        self.expect_stage(CalibrationStage::AwaitingInput)?;
        let previous_duty = duties.get(self.pump);
        let Some(new_duty) = corrected_duty(previous_duty, self.reference_ml, self.measured_ml)
        else {
            warn!("CAL: {} rejected 0 ml measurement", self.pump);
            return Err(CalibrationError::ZeroMeasurement);
        };

        duties.set(self.pump, u32::from(new_duty));
        self.stage = CalibrationStage::Idle;
        info!(
            "CAL: {} saved duty {previous_duty} -> {new_duty} (expected {} ml, measured {} ml)",
            self.pump, self.reference_ml, self.measured_ml
        );
        Ok(CalibrationSaved {
            pump: self.pump,
            previous_duty,
            new_duty,
        })
    }

    pub fn cancel(&mut self) {
        if self.stage != CalibrationStage::Idle {
            info!("CAL: {} cancelled while {}", self.pump, self.stage.as_str());
        }
        self.stage = CalibrationStage::Idle;
    }

    fn place_value(&self) -> u16 {
        match self.digit_cursor {
            0 => 100,
            1 => 10,
            _ => 1,
        }
    }

    pub fn increment_digit(&mut self) {
        self.measured_ml = self
            .measured_ml
            .saturating_add(self.place_value())
            .min(MAX_MEASURED_ML);
    }

    pub fn decrement_digit(&mut self) {
        self.measured_ml = self.measured_ml.saturating_sub(self.place_value());
    }

    pub fn cursor_left(&mut self) {
        self.digit_cursor = self.digit_cursor.saturating_sub(1);
    }

    pub fn cursor_right(&mut self) {
        self.digit_cursor = (self.digit_cursor + 1).min(2);
    }

    fn expect_stage(&self, expected: CalibrationStage) -> Result<(), CalibrationError> {
        if self.stage == expected {
            Ok(())
        } else {
            Err(CalibrationError::InvalidStage {
                expected: expected.as_str(),
                actual: self.stage.as_str(),
            })
        }
    }
}
