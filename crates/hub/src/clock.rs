//! Wall-clock helpers. Tick handlers take `now` as a parameter so tests can
//! drive them with fixed instants; only the task loops call [`now`].

use time::{Duration, OffsetDateTime, UtcOffset, Weekday};

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Milliseconds since the Unix epoch.
pub fn unix_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Fractional seconds as a `time::Duration`.
pub fn secs(s: f64) -> Duration {
    Duration::seconds_f64(s.max(0.0))
}

/// Seconds from `from` to `to`, negative when `to` is in the past.
pub fn secs_between(from: OffsetDateTime, to: OffsetDateTime) -> f64 {
    (to - from).as_seconds_f64()
}

/// Lowercase full weekday name of `t` as seen from `utc_offset_minutes`.
pub fn weekday_name(t: OffsetDateTime, utc_offset_minutes: i32) -> &'static str {
    let offset = UtcOffset::from_whole_seconds(utc_offset_minutes * 60).unwrap_or(UtcOffset::UTC);
    match t.to_offset(offset).weekday() {
        Weekday::Monday => "monday",
        Weekday::Tuesday => "tuesday",
        Weekday::Wednesday => "wednesday",
        Weekday::Thursday => "thursday",
        Weekday::Friday => "friday",
        Weekday::Saturday => "saturday",
        Weekday::Sunday => "sunday",
    }
}

pub const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

// ===========================================================================
// Tests
// ===========================================================================
