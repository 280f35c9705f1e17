use serde::Deserialize;

use crate::{
    error::{CommandError, ScheduleError},
    schedule::ScheduleEntry,
    types::PumpId,
};

/// Payload of `<id>/DOSE/con/pump{1,2}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpCommand {
    /// Run for the configured remote-on duration if idle.
    On,
    /// Cancel the active run, if any.
    Off,
    Run { duration_ms: u64 },
}

impl PumpCommand {
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let trimmed = payload.trim();
        if trimmed.eq_ignore_ascii_case("on") {
            return Ok(Self::On);
        }
        if trimmed.eq_ignore_ascii_case("off") {
            return Ok(Self::Off);
        }

        let Some((prefix, raw)) = trimmed.split_once(':') else {
            return Err(CommandError::UnknownPumpCommand(trimmed.to_string()));
        };
        if !prefix.eq_ignore_ascii_case("run") {
            return Err(CommandError::UnknownPumpCommand(trimmed.to_string()));
        }

        match raw.trim().parse::<i64>() {
            Ok(duration_ms) if duration_ms > 0 => Ok(Self::Run {
                duration_ms: duration_ms as u64,
            }),
            _ => Err(CommandError::InvalidDuration(raw.trim().to_string())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawScheduleAdd {
    pump: i64,
    hour: i64,
    minute: i64,
    duration_ms: i64,
    #[serde(default = "default_interval_days")]
    interval_days: i64,
}

fn default_interval_days() -> i64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
struct RawScheduleDelete {
    pump: i64,
    hour: i64,
    minute: i64,
}

/// Validated `/con/schedule/add` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleAddRequest {
    pub pump: PumpId,
    pub entry: ScheduleEntry,
}

impl ScheduleAddRequest {
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let raw: RawScheduleAdd = serde_json::from_str(payload)
            .map_err(|err| CommandError::Malformed(err.to_string()))?;

        let pump = parse_pump(raw.pump)?;
        let (hour, minute) = parse_time(raw.hour, raw.minute)?;
        let duration_ms = u32::try_from(raw.duration_ms)
            .map_err(|_| ScheduleError::InvalidEntry("duration out of range"))?;
        let interval_days = u16::try_from(raw.interval_days)
            .map_err(|_| ScheduleError::InvalidEntry("interval out of range"))?;

        let entry = ScheduleEntry::new(hour, minute, duration_ms, interval_days)?;
        Ok(Self { pump, entry })
    }
}

/// Validated `/con/schedule/delete` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleDeleteRequest {
    pub pump: PumpId,
    pub hour: u8,
    pub minute: u8,
}

impl ScheduleDeleteRequest {
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let raw: RawScheduleDelete = serde_json::from_str(payload)
            .map_err(|err| CommandError::Malformed(err.to_string()))?;

        let pump = parse_pump(raw.pump)?;
        let (hour, minute) = parse_time(raw.hour, raw.minute)?;
        Ok(Self { pump, hour, minute })
    }
}

fn parse_pump(raw: i64) -> Result<PumpId, CommandError> {
    u8::try_from(raw)
        .ok()
        .and_then(PumpId::from_number)
        .ok_or(CommandError::InvalidPump(raw))
}

fn parse_time(hour: i64, minute: i64) -> Result<(u8, u8), CommandError> {
    if !(0..24).contains(&hour) {
        return Err(ScheduleError::InvalidEntry("hour must be 0-23").into());
    }
    if !(0..60).contains(&minute) {
        return Err(ScheduleError::InvalidEntry("minute must be 0-59").into());
    }
    Ok((hour as u8, minute as u8))
}
