//! Standard 5-field cron expressions on top of the `cron` crate.
//!
//! The crate wants a leading seconds field and numbers days of the week
//! 1-7 starting at Sunday, where classic cron uses 0-7 with both 0 and 7
//! meaning Sunday.

use std::str::FromStr;

use cron::Schedule as CronSchedule;

use pipeliner_core::{PipelinerError, Result};

/// Parse and validate a 5-field expression.
pub fn parse(expr: &str) -> Result<CronSchedule> {
    let normalized = normalize(expr)?;
    CronSchedule::from_str(&normalized).map_err(|e| invalid(expr, e.to_string()))
}

/// Whether `expr` would arm a trigger.
pub fn is_valid(expr: &str) -> bool {
    parse(expr).is_ok()
}

/// Rewrite a 5-field expression into the crate's seconds-first form.
pub fn normalize(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid(
            expr,
            format!("expected 5 fields, found {}", fields.len()),
        ));
    }
    let day_of_week = normalize_day_of_week(fields[4]).map_err(|reason| invalid(expr, reason))?;
    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], day_of_week
    ))
}

fn invalid(expr: &str, reason: impl Into<String>) -> PipelinerError {
    PipelinerError::InvalidCron {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn normalize_day_of_week(field: &str) -> std::result::Result<String, String> {
    let parts = field
        .split(',')
        .map(normalize_day_part)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(parts.join(","))
}

fn normalize_day_part(part: &str) -> std::result::Result<String, String> {
    let (base, step) = match part.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (part, None),
    };
    let with_step = |s: String| match step {
        Some(step) => format!("{}/{}", s, step),
        None => s,
    };

    if base == "*" || base.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(part.to_string());
    }

    match base.split_once('-') {
        Some((from, to)) => {
            let from = day_number(from)?;
            let to = day_number(to)?;
            if from > to {
                return Err(format!("day-of-week range {} is reversed", base));
            }
            if to == 7 && from > 0 {
                // 5-7 is Fri..Sun, which wraps past the end of 1-7
                if step.is_some() {
                    return Err(format!(
                        "day-of-week range {} with a step is not supported",
                        part
                    ));
                }
                return Ok(format!("{}-7,1", from + 1));
            }
            if from == 0 && to == 7 {
                return Ok(with_step("1-7".to_string()));
            }
            Ok(with_step(format!("{}-{}", from + 1, to + 1)))
        }
        None => {
            let day = day_number(base)?;
            Ok(with_step((day % 7 + 1).to_string()))
        }
    }
}

fn day_number(raw: &str) -> std::result::Result<u32, String> {
    let day: u32 = raw
        .parse()
        .map_err(|_| format!("invalid day-of-week value '{}'", raw))?;
    if day > 7 {
        return Err(format!("day-of-week value {} is out of range 0-7", day));
    }
    Ok(day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Utc, Weekday};

    #[test]
    fn prepends_seconds() {
        assert_eq!(normalize("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize("0 2 1 * *").unwrap(), "0 0 2 1 * *");
    }

    #[test]
    fn maps_days_of_week() {
        assert_eq!(normalize("0 9 * * 0").unwrap(), "0 0 9 * * 1");
        assert_eq!(normalize("0 9 * * 7").unwrap(), "0 0 9 * * 1");
        assert_eq!(normalize("0 9 * * 1-5").unwrap(), "0 0 9 * * 2-6");
        assert_eq!(normalize("0 9 * * 5-7").unwrap(), "0 0 9 * * 6-7,1");
        assert_eq!(normalize("0 9 * * 0-7").unwrap(), "0 0 9 * * 1-7");
        assert_eq!(normalize("0 9 * * 1,3").unwrap(), "0 0 9 * * 2,4");
        assert_eq!(normalize("0 9 * * Mon-Fri").unwrap(), "0 0 9 * * Mon-Fri");
    }

    #[test]
    fn rejects_bad_expressions() {
        assert!(normalize("* * * *").is_err());
        assert!(normalize("* * * * * *").is_err());
        assert!(normalize("0 9 * * 8").is_err());
        assert!(normalize("0 9 * * 5-1").is_err());
        assert!(!is_valid("61 * * * *"));
        assert!(!is_valid("not a cron"));
        assert!(matches!(
            parse("* * *"),
            Err(PipelinerError::InvalidCron { .. })
        ));
    }

    #[test]
    fn weekday_expression_fires_on_monday() {
        let schedule = parse("30 9 * * 1").unwrap();
        // 2026-01-01 is a Thursday
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.after(&start).next().unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!((next.hour(), next.minute()), (9, 30));
    }

    #[test]
    fn sunday_as_zero_fires_on_sunday() {
        let schedule = parse("0 0 * * 0").unwrap();
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.after(&start).next().unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
    }
}
