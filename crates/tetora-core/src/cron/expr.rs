//! 5-field cron expressions
//!
//! `minute hour day-of-month month day-of-week` with `*`, numeric values,
//! comma lists, `a-b` ranges, and `*/step` or `a-b/step` steps.
//! Day-of-week runs 0–6 with Sunday = 0.

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike};

/// Field ranges: (min, max) per position
const FIELD_RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];
const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];

/// Upper bound on the forward scan: a little over four years covers any
/// satisfiable expression (including Feb 29)
const MAX_SCAN_MINUTES: i64 = 4 * 366 * 24 * 60;

/// A parsed cron expression; each field is a bitset of accepted values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronExpr {
    minute: u64,
    hour: u64,
    dom: u64,
    month: u64,
    dow: u64,
}

impl CronExpr {
    /// Parse a 5-field expression
    ///
    /// # Errors
    /// Returns `Error::Cron` on the wrong field count, out-of-range values,
    /// inverted ranges, or non-positive steps.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Cron(format!(
                "expected 5 fields, got {} in '{expression}'",
                fields.len()
            )));
        }

        let mut sets = [0u64; 5];
        for (i, field) in fields.iter().enumerate() {
            let (min, max) = FIELD_RANGES[i];
            sets[i] = parse_field(field, min, max)
                .map_err(|e| Error::Cron(format!("{} field: {e}", FIELD_NAMES[i])))?;
        }

        Ok(Self {
            minute: sets[0],
            hour: sets[1],
            dom: sets[2],
            month: sets[3],
            dow: sets[4],
        })
    }

    /// Whether the expression matches the given local time (minute precision)
    #[must_use]
    pub fn matches(&self, at: DateTime<FixedOffset>) -> bool {
        self.minute & (1 << at.minute()) != 0
            && self.hour & (1 << at.hour()) != 0
            && self.dom & (1 << at.day()) != 0
            && self.month & (1 << at.month()) != 0
            && self.dow & (1 << at.weekday().num_days_from_sunday()) != 0
    }

    /// The first matching minute strictly after `after`, if any within the
    /// scan horizon.
    #[must_use]
    pub fn next_after(&self, after: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let mut candidate = truncate_to_minute(after) + Duration::minutes(1);
        for _ in 0..MAX_SCAN_MINUTES {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn truncate_to_minute(at: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

/// Parse one field into a bitset
fn parse_field(field: &str, min: u32, max: u32) -> std::result::Result<u64, String> {
    let mut set = 0u64;
    for part in field.split(',') {
        set |= parse_part(part, min, max)?;
    }
    Ok(set)
}

fn parse_part(part: &str, min: u32, max: u32) -> std::result::Result<u64, String> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("invalid step '{step}'"))?;
            if step == 0 {
                return Err("step must be positive".to_string());
            }
            (range, step)
        }
        None => (part, 1),
    };

    let (start, end) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        let a: u32 = a.parse().map_err(|_| format!("invalid value '{a}'"))?;
        let b: u32 = b.parse().map_err(|_| format!("invalid value '{b}'"))?;
        if a > b {
            return Err(format!("inverted range {a}-{b}"));
        }
        (a, b)
    } else {
        let value: u32 = range
            .parse()
            .map_err(|_| format!("invalid value '{range}'"))?;
        (value, value)
    };

    if start < min || end > max {
        return Err(format!("value out of range {min}-{max}: '{part}'"));
    }

    let mut set = 0u64;
    let mut value = start;
    while value <= end {
        set |= 1 << value;
        value += step;
    }
    Ok(set)
}

/// Parse a fixed-offset timezone like `+09:00`, `-05:30`, or `UTC`
///
/// # Errors
/// Returns `Error::Cron` on an unparseable offset.
pub fn parse_timezone(spec: &str) -> Result<FixedOffset> {
    if spec.is_empty() || spec.eq_ignore_ascii_case("utc") {
        return Ok(FixedOffset::east_opt(0).expect("zero offset is valid"));
    }

    let (sign, rest) = match spec.split_at_checked(1) {
        Some(("+", rest)) => (1i32, rest),
        Some(("-", rest)) => (-1i32, rest),
        _ => return Err(Error::Cron(format!("invalid timezone '{spec}'"))),
    };

    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| Error::Cron(format!("invalid timezone '{spec}'")))?;
    let hours: i32 = hours
        .parse()
        .map_err(|_| Error::Cron(format!("invalid timezone '{spec}'")))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| Error::Cron(format!("invalid timezone '{spec}'")))?;
    if hours > 14 || minutes > 59 {
        return Err(Error::Cron(format!("timezone offset out of range '{spec}'")));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| Error::Cron(format!("timezone offset out of range '{spec}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<FixedOffset> {
        utc().with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_wildcard() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        assert!(expr.matches(at(2026, 8, 1, 12, 30)));
    }

    #[test]
    fn test_parse_values_and_lists() {
        let expr = CronExpr::parse("0,30 9 * * *").unwrap();
        assert!(expr.matches(at(2026, 8, 1, 9, 0)));
        assert!(expr.matches(at(2026, 8, 1, 9, 30)));
        assert!(!expr.matches(at(2026, 8, 1, 9, 15)));
        assert!(!expr.matches(at(2026, 8, 1, 10, 0)));
    }

    #[test]
    fn test_parse_ranges_and_steps() {
        let expr = CronExpr::parse("*/15 8-17 * * 1-5").unwrap();
        // 2026-08-03 is a Monday
        assert!(expr.matches(at(2026, 8, 3, 8, 45)));
        assert!(!expr.matches(at(2026, 8, 3, 7, 0)));
        // 2026-08-02 is a Sunday
        assert!(!expr.matches(at(2026, 8, 2, 9, 0)));

        let stepped = CronExpr::parse("10-30/10 * * * *").unwrap();
        assert!(stepped.matches(at(2026, 8, 1, 0, 10)));
        assert!(stepped.matches(at(2026, 8, 1, 0, 20)));
        assert!(stepped.matches(at(2026, 8, 1, 0, 30)));
        assert!(!stepped.matches(at(2026, 8, 1, 0, 15)));
    }

    #[test]
    fn test_sunday_is_zero() {
        let expr = CronExpr::parse("0 0 * * 0").unwrap();
        assert!(expr.matches(at(2026, 8, 2, 0, 0))); // Sunday
        assert!(!expr.matches(at(2026, 8, 3, 0, 0))); // Monday
    }

    #[test]
    fn test_rejects_bad_expressions() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 24 * * *").is_err());
        assert!(CronExpr::parse("* * 0 * *").is_err());
        assert!(CronExpr::parse("* * * 13 *").is_err());
        assert!(CronExpr::parse("* * * * 7").is_err());
        assert!(CronExpr::parse("30-10 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
    }

    #[test]
    fn test_next_after_scans_forward() {
        let expr = CronExpr::parse("30 9 * * *").unwrap();
        let next = expr.next_after(at(2026, 8, 1, 9, 31)).unwrap();
        assert_eq!(next, at(2026, 8, 2, 9, 30));

        let same_day = expr.next_after(at(2026, 8, 1, 8, 0)).unwrap();
        assert_eq!(same_day, at(2026, 8, 1, 9, 30));
    }

    #[test]
    fn test_next_after_is_strictly_increasing() {
        for expression in ["* * * * *", "*/5 * * * *", "0 0 1 * *", "15 6 * * 3"] {
            let expr = CronExpr::parse(expression).unwrap();
            let t0 = at(2026, 8, 1, 12, 0);
            let t1 = expr.next_after(t0).unwrap();
            let t2 = expr.next_after(t1).unwrap();
            assert!(t1 > t0, "{expression}");
            assert!(t2 > t1, "{expression}");
        }
    }

    #[test]
    fn test_next_after_feb_29() {
        let expr = CronExpr::parse("0 0 29 2 *").unwrap();
        let next = expr.next_after(at(2026, 3, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2028, 2, 29, 0, 0));
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_timezone("+09:00").unwrap().local_minus_utc(), 9 * 3600);
        assert_eq!(
            parse_timezone("-05:30").unwrap().local_minus_utc(),
            -(5 * 3600 + 30 * 60)
        );
        assert!(parse_timezone("+25:00").is_err());
        assert!(parse_timezone("nine").is_err());
    }

    #[test]
    fn test_timezone_shifts_matching() {
        let expr = CronExpr::parse("0 9 * * *").unwrap();
        let tz = parse_timezone("+09:00").unwrap();
        // 00:00 UTC is 09:00 in +09:00
        let utc_midnight = chrono::Utc
            .with_ymd_and_hms(2026, 8, 1, 0, 0, 0)
            .unwrap()
            .with_timezone(&tz);
        assert!(expr.matches(utc_midnight));
    }
}
