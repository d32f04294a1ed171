use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{Ms, Span};

const DAY_MS: Ms = 24 * 3_600_000;

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// The calendar day containing `now` in `tz`: `[local midnight, midnight + 24h)`.
///
/// When midnight does not exist locally (a DST gap at 00:00) the first
/// instant of the day after the gap is used.
pub fn day_window(now: Ms, tz: Tz) -> Span {
    let local_date = match Utc.timestamp_millis_opt(now).single() {
        Some(utc) => utc.with_timezone(&tz).date_naive(),
        None => return Span::new(now, now + DAY_MS),
    };
    let start = (0..24)
        .filter_map(|hour| local_date.and_hms_opt(hour, 0, 0))
        .find_map(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(now);
    Span::new(start, start + DAY_MS)
}

/// Parse an RFC 3339 timestamp (`2024-01-01T10:00:00+01:00`) to Unix ms.
pub fn parse_rfc3339(s: &str) -> Option<Ms> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(s: &str) -> Ms {
        parse_rfc3339(s).unwrap()
    }

    #[test]
    fn utc_day_window() {
        let w = day_window(ms("2024-01-01T15:30:00Z"), chrono_tz::UTC);
        assert_eq!(w.start, ms("2024-01-01T00:00:00Z"));
        assert_eq!(w.end, ms("2024-01-02T00:00:00Z"));
    }

    #[test]
    fn day_window_follows_reference_timezone() {
        // 23:30 UTC on Jan 1 is already Jan 2 in Paris.
        let w = day_window(ms("2024-01-01T23:30:00Z"), chrono_tz::Europe::Paris);
        assert_eq!(w.start, ms("2024-01-02T00:00:00+01:00"));
        assert_eq!(w.duration_ms(), DAY_MS);
        assert!(w.contains_instant(ms("2024-01-01T23:30:00Z")));
    }

    #[test]
    fn day_window_west_of_utc() {
        let w = day_window(ms("2024-06-10T02:00:00Z"), chrono_tz::America::New_York);
        assert_eq!(w.start, ms("2024-06-09T00:00:00-04:00"));
    }

    #[test]
    fn rfc3339_parsing() {
        assert_eq!(parse_rfc3339("1970-01-01T00:00:01Z"), Some(1_000));
        assert_eq!(
            parse_rfc3339("2024-01-01T10:00:00+01:00"),
            parse_rfc3339("2024-01-01T09:00:00Z")
        );
        assert_eq!(parse_rfc3339("yesterday"), None);
    }
}
