// src/utils/time.rs

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};

/// Resolves user time zones for quiet-hours gating.
#[derive(Debug, Clone)]
pub struct TimeService;

impl TimeService {
    pub fn new() -> Self {
        TimeService
    }

    /// Local wall-clock time for a user time zone expressed as "UTC" or
    /// "UTC±HH:MM". Unparseable zones fall back to UTC.
    pub fn local_time_in_zone(&self, time_zone: &str) -> NaiveTime {
        local_time_in_zone_at(Utc::now(), time_zone)
    }
}

/// Resolve a "UTC±HH:MM" style zone string against an instant.
pub fn local_time_in_zone_at(instant: DateTime<Utc>, time_zone: &str) -> NaiveTime {
    let offset = parse_utc_offset(time_zone).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    instant.with_timezone(&offset).time()
}

fn parse_utc_offset(time_zone: &str) -> Option<FixedOffset> {
    let tz = time_zone.trim();
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }

    let rest = tz.strip_prefix("UTC").or_else(|| tz.strip_prefix("utc"))?;
    let (sign, hhmm) = match *rest.as_bytes().first()? {
        b'+' => (1i32, &rest[1..]),
        b'-' => (-1i32, &rest[1..]),
        _ => return None,
    };

    let mut parts = hhmm.splitn(2, ':');
    let hours: i32 = parts.next()?.parse().ok()?;
    let minutes: i32 = parts.next().unwrap_or("0").parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

impl Default for TimeService {
    fn default() -> Self {
        Self::new()
    }
}
