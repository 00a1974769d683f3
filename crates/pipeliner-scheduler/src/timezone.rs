use std::sync::OnceLock;

use chrono::FixedOffset;
use regex::Regex;

const MIN_OFFSET_HOURS: i32 = -12;
const MAX_OFFSET_HOURS: i32 = 14;

fn offset_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([+-])?(\d{1,2})(?::(\d{2}))?$").unwrap())
}

/// Parse a UTC offset such as `"9"`, `"+9"`, `"-5"`, `"+09"` or `"+09:00"`.
///
/// Minutes are accepted but ignored. Returns `None` for malformed input or an
/// offset outside -12..=+14.
pub fn parse_offset_hours(value: &str) -> Option<i32> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Some(0);
    }
    let caps = offset_re().captures(trimmed)?;
    let hours: i32 = caps[2].parse().ok()?;
    let hours = if caps.get(1).map(|m| m.as_str()) == Some("-") {
        -hours
    } else {
        hours
    };
    (MIN_OFFSET_HOURS..=MAX_OFFSET_HOURS)
        .contains(&hours)
        .then_some(hours)
}

/// Resolve a schedule's timezone field. `None` means system local time.
pub fn resolve(offset: Option<&str>) -> Option<FixedOffset> {
    let raw = offset.map(str::trim).filter(|s| !s.is_empty())?;
    let hours = parse_offset_hours(raw)?;
    FixedOffset::east_opt(hours * 3600)
}

/// Human-readable form, e.g. `UTC+9`.
pub fn describe(offset: Option<&str>) -> String {
    match resolve(offset) {
        Some(tz) => {
            let hours = tz.local_minus_utc() / 3600;
            if hours == 0 {
                "UTC".to_string()
            } else {
                format!("UTC{:+}", hours)
            }
        }
        None => "local".to_string(),
    }
}
