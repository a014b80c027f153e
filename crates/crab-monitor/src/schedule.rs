//! Cron schedule parsing and fire-instant enumeration.
//!
//! Standard five-field cron format: `minute hour day month weekday`, with
//! lists, ranges, steps and `*`. Evaluation is timezone-aware: the fields
//! are matched against local wall-clock time in the schedule's zone, so
//! local times skipped by a DST spring-forward never fire and local times
//! repeated by a fall-back fire once, at their first UTC occurrence.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{Result, ScheduleError};

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronSpec {
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

/// One field, expanded to its allowed values.
#[derive(Debug, Clone)]
struct CronField {
    /// Sorted allowed values.
    allowed: Vec<u32>,
    /// False when the field was written as a bare `*` (or `*/1`). Needed
    /// for the day-of-month / day-of-week disjunction rule.
    restricted: bool,
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        self.allowed.binary_search(&value).is_ok()
    }
}

impl CronSpec {
    /// Parse a five-field cron expression.
    ///
    /// # Examples
    ///
    /// - `0 0 * * *` - daily at local midnight
    /// - `*/5 * * * *` - every 5 minutes
    /// - `0 9-17 * * 1-5` - hourly 9am-5pm, Monday-Friday
    pub fn parse(expr: &str) -> Result<CronSpec> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ScheduleError::Parse(format!(
                "expected 5 fields, got {}: {expr:?}",
                parts.len()
            )));
        }

        Ok(CronSpec {
            minute: parse_field(parts[0], 0, 59)
                .map_err(|e| ScheduleError::Parse(format!("minute field: {e}")))?,
            hour: parse_field(parts[1], 0, 23)
                .map_err(|e| ScheduleError::Parse(format!("hour field: {e}")))?,
            day: parse_field(parts[2], 1, 31)
                .map_err(|e| ScheduleError::Parse(format!("day field: {e}")))?,
            month: parse_field(parts[3], 1, 12)
                .map_err(|e| ScheduleError::Parse(format!("month field: {e}")))?,
            weekday: parse_weekday_field(parts[4])
                .map_err(|e| ScheduleError::Parse(format!("weekday field: {e}")))?,
        })
    }

    /// Whether the spec matches the given local wall-clock minute.
    ///
    /// Day-of-month and day-of-week follow the classic cron rule: when both
    /// are restricted, a time matches if either does.
    fn matches_local(&self, local: NaiveDateTime) -> bool {
        if !self.minute.matches(local.minute())
            || !self.hour.matches(local.hour())
            || !self.month.matches(local.month())
        {
            return false;
        }

        let day_ok = self.day.matches(local.day());
        let weekday_ok = self.weekday.matches(local.weekday().num_days_from_sunday());
        if self.day.restricted && self.weekday.restricted {
            day_ok || weekday_ok
        } else {
            day_ok && weekday_ok
        }
    }
}

/// Enumerate the UTC instants in `[t0, t1)` at which `spec` fires in `tz`.
///
/// Stateless and deterministic: the same arguments always yield the same
/// sorted list, and adjacent windows concatenate to the single-window
/// result. The walk is per minute, so callers should keep windows to the
/// hours-to-days range the monitor actually uses.
pub fn expected_fires(spec: &CronSpec, tz: Tz, t0: DateTime<Utc>, t1: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let mut fires = Vec::new();
    // Repeated local minutes (DST fall-back) appear at two UTC instants;
    // only the first may fire.
    let mut seen_local: HashSet<NaiveDateTime> = HashSet::new();

    let mut t = ceil_to_minute(t0);
    while t < t1 {
        let local = t.with_timezone(&tz).naive_local();
        if spec.matches_local(local) && seen_local.insert(local) {
            fires.push(t);
        }
        t += Duration::minutes(1);
    }
    fires
}

/// Resolve an IANA zone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::Timezone(name.to_string()))
}

fn ceil_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp();
    let rem = secs.rem_euclid(60);
    if rem == 0 && t.timestamp_subsec_nanos() == 0 {
        return t;
    }
    DateTime::from_timestamp(secs - rem + 60, 0).unwrap_or(t)
}

fn parse_field(field: &str, min: u32, max: u32) -> std::result::Result<CronField, String> {
    let mut allowed = Vec::new();
    let mut restricted = false;

    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step_str)) => {
                let step: u32 = step_str
                    .parse()
                    .map_err(|_| format!("invalid step value: {step_str:?}"))?;
                if step == 0 {
                    return Err("step value must be at least 1".to_string());
                }
                (base, step)
            }
            None => (part, 1),
        };

        let (start, end, from_wildcard) = if base == "*" {
            (min, max, true)
        } else if let Some((a, b)) = base.split_once('-') {
            let start: u32 = a.parse().map_err(|_| format!("invalid range start: {a:?}"))?;
            let end: u32 = b.parse().map_err(|_| format!("invalid range end: {b:?}"))?;
            if start > end {
                return Err(format!("range start {start} exceeds end {end}"));
            }
            (start, end, false)
        } else {
            let value: u32 = base.parse().map_err(|_| format!("invalid value: {base:?}"))?;
            if step > 1 {
                // `n/step` means `n-max/step`, per vixie cron.
                (value, max, false)
            } else {
                (value, value, false)
            }
        };

        if start < min || end > max {
            return Err(format!("values must be within {min}-{max}"));
        }
        // A field written with a `*` base (even stepped) stays a star field
        // for the day-of-month/day-of-week disjunction rule.
        if !from_wildcard {
            restricted = true;
        }

        let mut v = start;
        while v <= end {
            allowed.push(v);
            v += step;
        }
    }

    if allowed.is_empty() {
        return Err("empty field".to_string());
    }
    allowed.sort_unstable();
    allowed.dedup();
    Ok(CronField { allowed, restricted })
}

/// Day-of-week accepts 0-7 with both 0 and 7 meaning Sunday.
fn parse_weekday_field(field: &str) -> std::result::Result<CronField, String> {
    let mut parsed = parse_field(field, 0, 7)?;
    if parsed.allowed.last() == Some(&7) {
        parsed.allowed.pop();
        parsed.allowed.insert(0, 0);
        parsed.allowed.dedup();
    }
    Ok(parsed)
}
