use std::{sync::OnceLock, time::Instant};

use chrono::{Datelike, NaiveDateTime, Offset, Utc};
use chrono_tz::Tz;

/// Wall-clock readings before this year mean time was never synced.
pub const MIN_SYNCED_YEAR: i32 = 2024;

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

pub fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

/// Local time for schedule decisions, `None` while the clock is unsynced or
/// the timezone is unknown.
pub fn synced_local_time(timezone: &str) -> Option<NaiveDateTime> {
    now_in_timezone(timezone)
        .map(|now| now.naive_local())
        .filter(|now| is_synced(*now))
}

pub fn is_synced(now: NaiveDateTime) -> bool {
    now.year() >= MIN_SYNCED_YEAR
}
