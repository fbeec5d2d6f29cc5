//! Time argument parsing
//!
//! Accepts epoch seconds, RFC3339, ANSIC, a handful of date formats, and
//! relative offsets of the form `-<N>d<N>h<N>m<N>s` (colon separators are
//! also tolerated, e.g. `-23d:4h:3m`).

use crate::{ProbeError, Result, Timestamp};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::time::{SystemTime, UNIX_EPOCH};

/// ANSIC layout, e.g. `Mon Jan 23 11:31:04 2023`
const ANSIC_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Absolute formats tried in order (interpreted as UTC)
static TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];

/// Parse a single time argument relative to the current wall clock
pub fn parse_time_argument(arg: &str) -> Result<Timestamp> {
    parse_time_argument_at(arg, unix_now())
}

/// Parse a single time argument relative to a fixed reference time
pub fn parse_time_argument_at(arg: &str, now: Timestamp) -> Result<Timestamp> {
    let arg = arg.trim();
    if arg.is_empty() {
        return Err(ProbeError::Query("empty time argument".into()));
    }

    if let Some(relative) = arg.strip_prefix('-') {
        return parse_relative(relative, now);
    }

    if arg.bytes().all(|b| b.is_ascii_digit()) {
        return arg
            .parse::<Timestamp>()
            .map_err(|_| ProbeError::Query(format!("invalid epoch timestamp '{}'", arg)));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(arg) {
        return Ok(dt.timestamp());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(arg, ANSIC_FORMAT) {
        return Ok(dt.and_utc().timestamp());
    }
    for format in TIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(arg, format) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(arg, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp());
        }
    }

    Err(ProbeError::Query(format!(
        "unable to parse time argument '{}'",
        arg
    )))
}

/// Parse an inclusive time range; unbounded ends are permitted by passing an
/// empty string (`first` defaults to 0, `last` to [`crate::MAX_TIME`])
pub fn parse_time_range(first: &str, last: &str) -> Result<(Timestamp, Timestamp)> {
    let now = unix_now();
    let first = if first.trim().is_empty() {
        0
    } else {
        parse_time_argument_at(first, now)?
    };
    let last = if last.trim().is_empty() {
        crate::MAX_TIME
    } else {
        parse_time_argument_at(last, now)?
    };

    if first > last {
        return Err(ProbeError::Query(format!(
            "invalid time range: first ({}) is after last ({})",
            first, last
        )));
    }
    Ok((first, last))
}

fn parse_relative(spec: &str, now: Timestamp) -> Result<Timestamp> {
    let cleaned: String = spec.chars().filter(|c| *c != ':').collect();
    if cleaned.is_empty() {
        return Err(ProbeError::Query("empty relative time offset".into()));
    }

    let mut total: i64 = 0;
    let mut digits = String::new();
    for c in cleaned.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: i64 = digits
            .parse()
            .map_err(|_| ProbeError::Query(format!("invalid relative offset '-{}'", spec)))?;
        digits.clear();

        let unit = match c {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => {
                return Err(ProbeError::Query(format!(
                    "unknown time unit '{}' in '-{}'",
                    c, spec
                )))
            }
        };
        total += n * unit;
    }
    if !digits.is_empty() {
        return Err(ProbeError::Query(format!(
            "missing unit in relative offset '-{}'",
            spec
        )));
    }

    Ok(now - total)
}

fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Timestamp = 1_700_000_000;

    #[test]
    fn test_epoch() {
        assert_eq!(parse_time_argument_at("1674492267", NOW).unwrap(), 1_674_492_267);
    }

    #[test]
    fn test_relative_offsets() {
        assert_eq!(parse_time_argument_at("-1d", NOW).unwrap(), NOW - 86_400);
        assert_eq!(
            parse_time_argument_at("-23d4h8m3s", NOW).unwrap(),
            NOW - (23 * 86_400 + 4 * 3_600 + 8 * 60 + 3)
        );
        assert_eq!(
            parse_time_argument_at("-23d:4h:3m", NOW).unwrap(),
            NOW - (23 * 86_400 + 4 * 3_600 + 3 * 60)
        );
        assert!(parse_time_argument_at("-23x", NOW).is_err());
        assert!(parse_time_argument_at("-23", NOW).is_err());
    }

    #[test]
    fn test_absolute_formats() {
        // RFC3339
        assert_eq!(
            parse_time_argument_at("2006-01-02T15:04:05-07:00", NOW).unwrap(),
            1_136_239_445
        );
        // ANSIC
        assert_eq!(
            parse_time_argument_at("Mon Jan 23 11:31:04 2023", NOW).unwrap(),
            1_674_473_464
        );
        // plain date formats
        assert!(parse_time_argument_at("2023-01-23 11:31:04", NOW).is_ok());
        assert!(parse_time_argument_at("23.01.2023 11:31", NOW).is_ok());
        assert!(parse_time_argument_at("2023-01-23", NOW).is_ok());

        assert!(parse_time_argument_at("not a time", NOW).is_err());
    }

    #[test]
    fn test_time_range() {
        let (first, last) = parse_time_range("1000", "2000").unwrap();
        assert_eq!((first, last), (1000, 2000));

        let (first, last) = parse_time_range("", "").unwrap();
        assert_eq!(first, 0);
        assert_eq!(last, crate::MAX_TIME);

        assert!(parse_time_range("2000", "1000").is_err());
    }
}
