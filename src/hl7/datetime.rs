//! HL7 `TS`/`DTM` values: `YYYY[MM[DD[HH[MM[SS[.ffff]]]]]][+/-ZZZZ]`.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

fn timestamp_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^(\d{4})(?:(\d{2})(?:(\d{2})(?:(\d{2})(?:(\d{2})(?:(\d{2})(?:\.(\d{1,4}))?)?)?)?)?)?([+-]\d{4})?$",
            )
            .ok()
        })
        .as_ref()
}

/// Parses an HL7 timestamp into UTC.
///
/// Missing trailing units take their first valid value, and a trailing offset is
/// subtracted to normalise to UTC. Anything that does not follow the format, or names an
/// impossible date, yields `None`.
///
/// ```
/// use hl7_processor::hl7::datetime::parse_timestamp;
/// let ts = parse_timestamp("202301011200+0100").unwrap();
/// assert_eq!(ts.to_rfc3339(), "2023-01-01T11:00:00+00:00");
/// ```
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let caps = timestamp_pattern()?.captures(value.trim())?;
    let unit = |i: usize, default: u32| -> Option<u32> {
        match caps.get(i) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(default),
        }
    };

    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, unit(2, 1)?, unit(3, 1)?)?;

    let micros = match caps.get(7) {
        // ".5" is half a second, not five ten-thousandths
        Some(m) => {
            let digits = m.as_str();
            let scaled: u32 = digits.parse().ok()?;
            scaled * 10u32.pow(6 - digits.len() as u32)
        }
        None => 0,
    };
    let time = NaiveTime::from_hms_micro_opt(unit(4, 0)?, unit(5, 0)?, unit(6, 0)?, micros)?;

    let mut local = NaiveDateTime::new(date, time);
    if let Some(offset) = caps.get(8) {
        local -= parse_offset(offset.as_str())?;
    }
    Some(local.and_utc())
}

fn parse_offset(value: &str) -> Option<Duration> {
    let (sign, digits) = value.split_at(1);
    let hours: i64 = digits.get(..2)?.parse().ok()?;
    let minutes: i64 = digits.get(2..4)?.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    let offset = Duration::hours(hours) + Duration::minutes(minutes);
    Some(if sign == "-" { -offset } else { offset })
}

/// Parses the date part of an HL7 timestamp, ignoring any time of day.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    let date_part = trimmed.get(..8.min(trimmed.len()))?;
    parse_timestamp(date_part).map(|ts| ts.date_naive())
}

/// `yyyyMMddHHmmss`, the precision used in generated headers.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%d%H%M%S").to_string()
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_full_precision() {
        let ts = parse_timestamp("20230101120000").unwrap();
        assert_eq!(format_timestamp(&ts), "20230101120000");
    }

    #[test]
    fn truncated_values_take_first_valid_unit() {
        let ts = parse_timestamp("2023").unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day(), ts.hour()), (2023, 1, 1, 0));

        let ts = parse_timestamp("20230615").unwrap();
        assert_eq!((ts.month(), ts.day(), ts.minute()), (6, 15, 0));
    }

    #[test]
    fn fractional_seconds_are_scaled() {
        let ts = parse_timestamp("20041104082400.5").unwrap();
        assert_eq!(ts.nanosecond(), 500_000_000);
        let ts = parse_timestamp("20041104082400.0001").unwrap();
        assert_eq!(ts.nanosecond(), 100_000);
    }

    #[test]
    fn offset_is_normalised_to_utc() {
        let ts = parse_timestamp("20041104082400.0000+0100").unwrap();
        assert_eq!(format_timestamp(&ts), "20041104072400");
        let ts = parse_timestamp("202301010030-0500").unwrap();
        assert_eq!(format_timestamp(&ts), "20230101053000");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("not a date").is_none());
        assert!(parse_timestamp("20231").is_none());
        assert!(parse_timestamp("20231301").is_none());
        assert!(parse_timestamp("202301.5").is_none());
        assert!(parse_timestamp("20230230").is_none());
    }

    #[test]
    fn parses_date_of_birth() {
        let date = parse_date("19480203").unwrap();
        assert_eq!(format_date(&date), "19480203");
        assert_eq!(parse_date("199001011230").unwrap(), NaiveDate::from_ymd_opt(1990, 1, 1).unwrap());
        assert!(parse_date("1990-01-01").is_none());
    }
}
