use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    error::ScheduleError,
    types::{PumpId, StartOutcome},
};

/// One recurring dose: time of day, run time and repeat interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub hour: u8,
    pub minute: u8,
    pub duration_ms: u32,
    pub interval_days: u16,
}

impl ScheduleEntry {
    pub fn new(
        hour: u8,
        minute: u8,
        duration_ms: u32,
        interval_days: u16,
    ) -> Result<Self, ScheduleError> {
        let entry = Self {
            hour,
            minute,
            duration_ms,
            interval_days,
        };
        entry.validate()?;
        Ok(entry)
    }

    pub fn daily(hour: u8, minute: u8, duration_ms: u32) -> Result<Self, ScheduleError> {
        Self::new(hour, minute, duration_ms, 1)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.hour > 23 {
            return Err(ScheduleError::InvalidEntry("hour must be 0-23"));
        }
        if self.minute > 59 {
            return Err(ScheduleError::InvalidEntry("minute must be 0-59"));
        }
        if self.duration_ms == 0 {
            return Err(ScheduleError::InvalidEntry("duration must be positive"));
        }
        if self.interval_days == 0 {
            return Err(ScheduleError::InvalidEntry("interval must be at least one day"));
        }
        Ok(())
    }

    pub fn key(&self) -> (u8, u8) {
        (self.hour, self.minute)
    }

    pub fn minute_of_day(&self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }

    fn from_persisted(item: &Value) -> Option<Self> {
        let fields = item.as_array()?;
        let number = |index: usize| fields.get(index).and_then(Value::as_i64);

        let (hour, minute, duration_ms, interval_days) = match fields.len() {
            3 => (number(0)?, number(1)?, number(2)?, 1),
            4 => (number(0)?, number(1)?, number(2)?, number(3)?),
            _ => return None,
        };

        Self::new(
            u8::try_from(hour).ok()?,
            u8::try_from(minute).ok()?,
            u32::try_from(duration_ms).ok()?,
            u16::try_from(interval_days).ok()?,
        )
        .ok()
    }

    fn to_persisted(self) -> Value {
        Value::from(vec![
            u64::from(self.hour),
            u64::from(self.minute),
            u64::from(self.duration_ms),
            u64::from(self.interval_days),
        ])
    }
}

/// Per-pump dose lists, each kept sorted by `(hour, minute)` with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleStore {
    entries: [Vec<ScheduleEntry>; 2],
}

impl ScheduleStore {
    pub fn entries(&self, pump: PumpId) -> &[ScheduleEntry] {
        &self.entries[pump.index()]
    }

    pub fn len(&self, pump: PumpId) -> usize {
        self.entries[pump.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Vec::is_empty)
    }

    pub fn find(&self, pump: PumpId, hour: u8, minute: u8) -> Option<&ScheduleEntry> {
        self.entries(pump)
            .iter()
            .find(|entry| entry.key() == (hour, minute))
    }

    /// Inserts a new entry. Any entry already at the same time is a
    /// duplicate, whatever its duration or interval.
    pub fn add(&mut self, pump: PumpId, entry: ScheduleEntry) -> Result<(), ScheduleError> {
        entry.validate()?;
        if self.find(pump, entry.hour, entry.minute).is_some() {
            return Err(ScheduleError::Duplicate {
                pump,
                hour: entry.hour,
                minute: entry.minute,
            });
        }

        let list = &mut self.entries[pump.index()];
        list.push(entry);
        list.sort_by_key(ScheduleEntry::key);
        Ok(())
    }

    pub fn delete(
        &mut self,
        pump: PumpId,
        hour: u8,
        minute: u8,
    ) -> Result<ScheduleEntry, ScheduleError> {
        let list = &mut self.entries[pump.index()];
        let position = list
            .iter()
            .position(|entry| entry.key() == (hour, minute))
            .ok_or(ScheduleError::NotFound { pump, hour, minute })?;
        Ok(list.remove(position))
    }

    /// Swaps the entry at `original` for `entry`. The duplicate check runs
    /// against every entry, the original included, so an edit must move the
    /// entry to a free time.
    pub fn replace(
        &mut self,
        pump: PumpId,
        original: (u8, u8),
        entry: ScheduleEntry,
    ) -> Result<(), ScheduleError> {
        entry.validate()?;
        if self.find(pump, entry.hour, entry.minute).is_some() {
            return Err(ScheduleError::Duplicate {
                pump,
                hour: entry.hour,
                minute: entry.minute,
            });
        }

        let list = &mut self.entries[pump.index()];
        list.retain(|existing| existing.key() != original);
        list.push(entry);
        list.sort_by_key(ScheduleEntry::key);
        Ok(())
    }

    /// Rebuilds the store from its persisted JSON shape, skipping anything
    /// malformed. Three-field legacy entries default to a daily interval.
    pub fn from_value(value: &Value) -> Self {
        let mut store = Self::default();
        let Some(map) = value.as_object() else {
            warn!("persisted schedules are not a map; starting empty");
            return store;
        };

        for (key, items) in map {
            let Some(pump) = key.parse::<u8>().ok().and_then(PumpId::from_number) else {
                warn!("ignoring schedules for unknown pump key `{key}`");
                continue;
            };
            let Some(items) = items.as_array() else {
                warn!("ignoring non-list schedules for {pump}");
                continue;
            };

            for item in items {
                match ScheduleEntry::from_persisted(item) {
                    Some(entry) => {
                        if let Err(err) = store.add(pump, entry) {
                            warn!("ignoring persisted entry {item}: {err}");
                        }
                    }
                    None => warn!("ignoring malformed persisted entry {item} for {pump}"),
                }
            }
        }

        store
    }

    /// `{"1": [[h, m, duration_ms, interval_days], ...], "2": [...]}`
    pub fn to_value(&self) -> Value {
        let map: serde_json::Map<String, Value> = PumpId::ALL
            .into_iter()
            .map(|pump| {
                let items = self
                    .entries(pump)
                    .iter()
                    .map(|entry| entry.to_persisted())
                    .collect();
                (pump.number().to_string(), Value::Array(items))
            })
            .collect();
        Value::Object(map)
    }
}

/// Last calendar date each interval-gated entry actually fired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunLog {
    entries: BTreeMap<String, String>,
}

impl RunLog {
    pub fn key(pump: PumpId, hour: u8, minute: u8) -> String {
        format!("P{}_{hour:02}_{minute:02}", pump.number())
    }

    pub fn last_run(&self, pump: PumpId, hour: u8, minute: u8) -> Option<&str> {
        self.entries
            .get(&Self::key(pump, hour, minute))
            .map(String::as_str)
    }

    pub fn qualifies(&self, pump: PumpId, entry: &ScheduleEntry, today: NaiveDate) -> bool {
        if entry.interval_days <= 1 {
            return true;
        }

        let Some(last) = self.last_run(pump, entry.hour, entry.minute) else {
            return true;
        };

        match NaiveDate::parse_from_str(last, "%Y-%m-%d") {
            Ok(last) => (today - last).num_days() >= i64::from(entry.interval_days),
            Err(err) => {
                warn!("unreadable run log date `{last}` for {pump}: {err}; treating as due");
                true
            }
        }
    }

    pub fn record(&mut self, pump: PumpId, hour: u8, minute: u8, today: NaiveDate) {
        self.entries.insert(
            Self::key(pump, hour, minute),
            today.format("%Y-%m-%d").to_string(),
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationReport {
    pub fired: Vec<(PumpId, ScheduleEntry)>,
    pub skipped_busy: Vec<(PumpId, ScheduleEntry)>,
    pub skipped_interval: Vec<(PumpId, ScheduleEntry)>,
}

impl EvaluationReport {
    pub fn run_log_changed(&self) -> bool {
        !self.fired.is_empty()
    }
}

/// Decides once per clock minute which entries fire.
#[derive(Debug, Clone, Default)]
pub struct ScheduleEvaluator {
    last_minute: Option<u16>,
}

impl ScheduleEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates the store at `now`, calling `start` for every qualifying
    /// entry. `now` is `None` while wall-clock time is unsynced, in which case
    /// nothing fires. Repeated calls within one minute are no-ops.
    pub fn run<F>(
        &mut self,
        now: Option<NaiveDateTime>,
        store: &ScheduleStore,
        run_log: &mut RunLog,
        mut start: F,
    ) -> EvaluationReport
    where
        F: FnMut(PumpId, &ScheduleEntry) -> StartOutcome,
    {
        let mut report = EvaluationReport::default();
        let Some(now) = now else {
            return report;
        };

        let minute_of_day = (now.hour() * 60 + now.minute()) as u16;
        if self.last_minute == Some(minute_of_day) {
            return report;
        }
        self.last_minute = Some(minute_of_day);

        let today = now.date();
        for pump in PumpId::ALL {
            for entry in store
                .entries(pump)
                .iter()
                .filter(|entry| entry.minute_of_day() == minute_of_day)
            {
                if !run_log.qualifies(pump, entry, today) {
                    info!(
                        "SCHED: {pump} skipped at {:02}:{:02} (interval {} days not met)",
                        entry.hour, entry.minute, entry.interval_days
                    );
                    report.skipped_interval.push((pump, *entry));
                    continue;
                }

                match start(pump, entry) {
                    StartOutcome::Started => {
                        info!(
                            "SCHED: {pump} start at {:02}:{:02} for {}ms (every {} day(s))",
                            entry.hour, entry.minute, entry.duration_ms, entry.interval_days
                        );
                        run_log.record(pump, entry.hour, entry.minute, today);
                        report.fired.push((pump, *entry));
                    }
                    StartOutcome::Busy => {
                        info!(
                            "SCHED: {pump} skipped at {:02}:{:02} (already running)",
                            entry.hour, entry.minute
                        );
                        report.skipped_busy.push((pump, *entry));
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn entry(hour: u8, minute: u8, duration_ms: u32, interval_days: u16) -> ScheduleEntry {
        ScheduleEntry::new(hour, minute, duration_ms, interval_days).unwrap()
    }

    #[test]
    fn second_add_at_same_time_is_rejected() {
        let mut store = ScheduleStore::default();
        store.add(PumpId::One, entry(8, 30, 5_000, 1)).unwrap();

        let err = store.add(PumpId::One, entry(8, 30, 9_000, 3)).unwrap_err();
        assert_eq!(
            err,
            ScheduleError::Duplicate {
                pump: PumpId::One,
                hour: 8,
                minute: 30
            }
        );
        assert_eq!(store.entries(PumpId::One), &[entry(8, 30, 5_000, 1)]);

        // Same time on the other pump is fine.
        store.add(PumpId::Two, entry(8, 30, 9_000, 3)).unwrap();
        assert_eq!(store.len(PumpId::Two), 1);
    }

    #[test]
    fn entries_stay_sorted_by_time() {
        let mut store = ScheduleStore::default();
        store.add(PumpId::One, entry(18, 0, 1_000, 1)).unwrap();
        store.add(PumpId::One, entry(6, 45, 1_000, 1)).unwrap();
        store.add(PumpId::One, entry(6, 5, 1_000, 1)).unwrap();

        let keys: Vec<_> = store.entries(PumpId::One).iter().map(|e| e.key()).collect();
        assert_eq!(keys, vec![(6, 5), (6, 45), (18, 0)]);
    }

    #[test]
    fn delete_missing_is_noop_and_add_delete_restores() {
        let mut store = ScheduleStore::default();
        store.add(PumpId::One, entry(7, 0, 2_000, 1)).unwrap();
        let before = store.clone();

        assert!(matches!(
            store.delete(PumpId::One, 9, 9),
            Err(ScheduleError::NotFound { .. })
        ));
        assert_eq!(store, before);

        store.add(PumpId::One, entry(12, 0, 3_000, 2)).unwrap();
        let removed = store.delete(PumpId::One, 12, 0).unwrap();
        assert_eq!(removed, entry(12, 0, 3_000, 2));
        assert_eq!(store, before);
    }

    #[test]
    fn replace_moves_time_and_rejects_same_time_edits() {
        let mut store = ScheduleStore::default();
        store.add(PumpId::One, entry(7, 0, 2_000, 1)).unwrap();
        store.add(PumpId::One, entry(9, 0, 2_000, 1)).unwrap();

        // Time change: old slot disappears.
        store
            .replace(PumpId::One, (7, 0), entry(8, 0, 2_000, 1))
            .unwrap();
        assert!(store.find(PumpId::One, 7, 0).is_none());
        assert!(store.find(PumpId::One, 8, 0).is_some());

        // Keeping the time collides with the entry itself.
        let before = store.clone();
        assert!(matches!(
            store.replace(PumpId::One, (8, 0), entry(8, 0, 4_000, 2)),
            Err(ScheduleError::Duplicate { hour: 8, minute: 0, .. })
        ));
        assert_eq!(store, before);

        // Moving onto another entry's time is a duplicate and changes nothing.
        assert!(store
            .replace(PumpId::One, (8, 0), entry(9, 0, 1_000, 1))
            .is_err());
        assert_eq!(store, before);
    }

    #[test]
    fn invalid_entries_are_rejected() {
        assert!(ScheduleEntry::new(24, 0, 1_000, 1).is_err());
        assert!(ScheduleEntry::new(1, 60, 1_000, 1).is_err());
        assert!(ScheduleEntry::new(1, 0, 0, 1).is_err());
        assert!(ScheduleEntry::new(1, 0, 1_000, 0).is_err());
    }

    #[test]
    fn persisted_store_round_trips_and_accepts_legacy_entries() {
        let mut store = ScheduleStore::default();
        store.add(PumpId::One, entry(6, 0, 5_000, 3)).unwrap();
        store.add(PumpId::Two, entry(21, 15, 800, 1)).unwrap();

        let reloaded = ScheduleStore::from_value(&store.to_value());
        assert_eq!(reloaded, store);

        let legacy = json!({
            "1": [[10, 30, 4000], [11, 0, 1000, 7]],
            "2": [[25, 0, 1000], "junk", [1, 2, 0, 1]],
            "9": [[1, 1, 1]]
        });
        let loaded = ScheduleStore::from_value(&legacy);
        assert_eq!(
            loaded.entries(PumpId::One),
            &[entry(10, 30, 4_000, 1), entry(11, 0, 1_000, 7)]
        );
        assert!(loaded.entries(PumpId::Two).is_empty());
    }

    #[test]
    fn interval_gating_waits_for_enough_days() {
        let mut log = RunLog::default();
        let dose = entry(8, 0, 1_000, 3);
        let day = |d| NaiveDate::from_ymd_opt(2026, 3, d).unwrap();

        assert!(log.qualifies(PumpId::One, &dose, day(10)));
        log.record(PumpId::One, 8, 0, day(10));
        assert_eq!(log.last_run(PumpId::One, 8, 0), Some("2026-03-10"));

        assert!(!log.qualifies(PumpId::One, &dose, day(11)));
        assert!(!log.qualifies(PumpId::One, &dose, day(12)));
        assert!(log.qualifies(PumpId::One, &dose, day(13)));
        assert!(log.qualifies(PumpId::One, &dose, day(20)));
    }

    #[test]
    fn run_log_keys_match_persisted_format() {
        assert_eq!(RunLog::key(PumpId::Two, 7, 5), "P2_07_05");

        let mut log: RunLog = serde_json::from_value(json!({"P1_08_00": "garbage"})).unwrap();
        assert!(log.qualifies(PumpId::One, &entry(8, 0, 1_000, 5), at(1, 8, 0).date()));
        log.record(PumpId::One, 8, 0, at(1, 8, 0).date());
        assert_eq!(
            serde_json::to_value(&log).unwrap(),
            json!({"P1_08_00": "2026-03-01"})
        );
    }

    #[test]
    fn evaluator_fires_once_per_minute_and_records_runs() {
        let mut store = ScheduleStore::default();
        store.add(PumpId::One, entry(8, 0, 1_500, 1)).unwrap();
        store.add(PumpId::Two, entry(8, 0, 2_500, 2)).unwrap();
        store.add(PumpId::Two, entry(9, 0, 2_500, 1)).unwrap();
        let mut log = RunLog::default();
        let mut evaluator = ScheduleEvaluator::new();
        let mut started = Vec::new();

        let report = evaluator.run(Some(at(5, 8, 0)), &store, &mut log, |pump, entry| {
            started.push((pump, entry.duration_ms));
            StartOutcome::Started
        });
        assert_eq!(started, vec![(PumpId::One, 1_500), (PumpId::Two, 2_500)]);
        assert_eq!(report.fired.len(), 2);
        assert_eq!(log.len(), 2);

        // Same minute again: nothing happens.
        let again = evaluator.run(Some(at(5, 8, 0)), &store, &mut log, |_, _| {
            panic!("must not fire twice in one minute")
        });
        assert_eq!(again, EvaluationReport::default());
    }

    #[test]
    fn evaluator_skips_busy_pump_without_recording() {
        let mut store = ScheduleStore::default();
        store.add(PumpId::One, entry(8, 0, 1_000, 2)).unwrap();
        let mut log = RunLog::default();
        let mut evaluator = ScheduleEvaluator::new();

        let report = evaluator.run(Some(at(5, 8, 0)), &store, &mut log, |_, _| {
            StartOutcome::Busy
        });
        assert_eq!(report.skipped_busy.len(), 1);
        assert!(!report.run_log_changed());
        assert!(log.is_empty());
    }

    #[test]
    fn evaluator_gates_by_interval_across_days() {
        let mut store = ScheduleStore::default();
        store.add(PumpId::One, entry(8, 0, 1_000, 3)).unwrap();
        let mut log = RunLog::default();
        let mut fired_days = Vec::new();

        for day in 1..=7 {
            let mut evaluator = ScheduleEvaluator::new();
            let report = evaluator.run(Some(at(day, 8, 0)), &store, &mut log, |_, _| {
                StartOutcome::Started
            });
            if !report.fired.is_empty() {
                fired_days.push(day);
            }
        }
        assert_eq!(fired_days, vec![1, 4, 7]);
    }

    #[test]
    fn evaluator_waits_for_synced_clock() {
        let mut store = ScheduleStore::default();
        store.add(PumpId::One, entry(0, 0, 1_000, 1)).unwrap();
        let mut log = RunLog::default();
        let mut evaluator = ScheduleEvaluator::new();

        let report = evaluator.run(None, &store, &mut log, |_, _| StartOutcome::Started);
        assert!(report.fired.is_empty());
    }
}
