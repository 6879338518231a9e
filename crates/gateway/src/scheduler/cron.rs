//! Timezone-aware 5-field cron evaluator (min hour dom month dow).

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Parse a timezone string into a `chrono_tz::Tz`, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

/// Validate a cron expression: exactly five fields, each of which must
/// match at least one value in its range.
pub fn validate(cron: &str) -> Result<(), String> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!(
            "expected 5 fields, got {} in '{cron}'",
            fields.len()
        ));
    }
    let ranges: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];
    for (field, (lo, hi)) in fields.iter().zip(ranges) {
        if !(lo..=hi).any(|v| field_matches(field, v)) {
            return Err(format!("field '{field}' matches no value in {lo}..={hi}"));
        }
    }
    Ok(())
}

fn field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
        return false;
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Check a **local** naive datetime against a cron expression.
///
/// POSIX day selection: when both day-of-month and day-of-week are
/// restricted (neither is `*`), the date matches if either field does;
/// when at least one is `*`, both must match.
fn matches_naive(cron: &str, dt: &chrono::NaiveDateTime) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    if !(field_matches(fields[0], dt.minute())
        && field_matches(fields[1], dt.hour())
        && field_matches(fields[3], dt.month()))
    {
        return false;
    }
    let dom = field_matches(fields[2], dt.day());
    let dow = field_matches(fields[4], dt.weekday().num_days_from_sunday());
    if fields[2] != "*" && fields[4] != "*" {
        dom || dow
    } else {
        dom && dow
    }
}

/// Check a UTC datetime against a cron expression.
pub fn matches(cron: &str, dt: &DateTime<Utc>) -> bool {
    matches_naive(cron, &dt.naive_utc())
}

/// Next occurrence strictly after `after`, evaluated in `tz`, as UTC.
///
/// DST: local times inside a spring-forward gap are skipped; fall-back
/// overlaps pick the earliest mapping.
pub fn next_after_tz(
    cron: &str,
    after: &DateTime<Utc>,
    tz: chrono_tz::Tz,
) -> Option<DateTime<Utc>> {
    use chrono::TimeZone;

    let local_after = after.with_timezone(&tz).naive_local();
    let to_next_minute = 60 - local_after.second() as i64;
    let mut candidate = local_after + chrono::Duration::seconds(to_next_minute);
    candidate = candidate.with_second(0).unwrap_or(candidate);

    let max_checks = 366 * 24 * 60; // one year of minutes
    for _ in 0..max_checks {
        if matches_naive(cron, &candidate) {
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc));
                }
                chrono::LocalResult::None => {
                    // DST gap, this local minute does not exist.
                }
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

/// Next occurrence in UTC.
pub fn next_after(cron: &str, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    next_after_tz(cron, after, chrono_tz::UTC)
}
