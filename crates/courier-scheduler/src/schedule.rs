//! Schedule expressions: standard cron plus shorthand forms.
//!
//! Accepted syntax:
//!
//! - five-field cron (`minute hour day-of-month month day-of-week`), day of
//!   week numbered `0-6` from Sunday (`7` is also Sunday) or named
//! - six-field cron with a leading seconds field
//! - `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight`,
//!   `@hourly`
//! - `@every <interval>` with an interval such as `5s`, `1m30s`, `1.5h`,
//!   `250ms`
//!
//! All cron times are evaluated in UTC.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Parsed schedule for a recurring job.
#[derive(Clone)]
pub struct Schedule {
    expression: String,
    kind: Kind,
}

#[derive(Clone)]
enum Kind {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    /// Parses a schedule expression.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidSchedule` describing why the
    /// expression was rejected.
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let invalid = |reason: String| SchedulerError::invalid_schedule(expression, reason);

        if trimmed.is_empty() {
            return Err(invalid("expression is empty".to_string()));
        }

        let kind = if let Some(interval) = trimmed.strip_prefix("@every") {
            let interval = parse_interval(interval.trim()).map_err(invalid)?;
            Kind::Every(interval)
        } else if trimmed.starts_with('@') {
            let cron_expr = match trimmed {
                "@yearly" | "@annually" => "0 0 0 1 1 *",
                "@monthly" => "0 0 0 1 * *",
                "@weekly" => "0 0 0 * * Sun",
                "@daily" | "@midnight" => "0 0 0 * * *",
                "@hourly" => "0 0 * * * *",
                other => return Err(invalid(format!("unknown descriptor {other}"))),
            };
            Kind::Cron(Box::new(parse_cron(cron_expr).map_err(invalid)?))
        } else {
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            let cron_expr = match fields.as_slice() {
                [minute, hour, dom, month, dow] => {
                    let dow = translate_day_of_week(dow).map_err(invalid)?;
                    format!("0 {minute} {hour} {dom} {month} {dow}")
                },
                [second, minute, hour, dom, month, dow] => {
                    let dow = translate_day_of_week(dow).map_err(invalid)?;
                    format!("{second} {minute} {hour} {dom} {month} {dow}")
                },
                _ => {
                    return Err(invalid(format!(
                        "expected 5 or 6 fields, found {}",
                        fields.len()
                    )))
                },
            };
            Kind::Cron(Box::new(parse_cron(&cron_expr).map_err(invalid)?))
        };

        Ok(Self { expression: expression.to_string(), kind })
    }

    /// Expression as originally given.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Fixed interval, for `@every` schedules.
    pub fn interval(&self) -> Option<Duration> {
        match &self.kind {
            Kind::Every(interval) => Some(*interval),
            Kind::Cron(_) => None,
        }
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            Kind::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .and_then(|interval| after.checked_add_signed(interval)),
            Kind::Cron(schedule) => schedule.after(&after).next(),
        }
    }

    /// Time to wait from `now` until the next fire time.
    ///
    /// Returns `None` if the schedule never fires again.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(now)?;
        Some((next - now).to_std().unwrap_or(Duration::ZERO))
    }
}

impl FromStr for Schedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Schedule").field(&self.expression).finish()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn parse_cron(expression: &str) -> std::result::Result<cron::Schedule, String> {
    cron::Schedule::from_str(expression).map_err(|e| e.to_string())
}

/// Rewrites a day-of-week field from Sunday=0 numbering to day names, which
/// the cron parser accepts unambiguously.
fn translate_day_of_week(field: &str) -> std::result::Result<String, String> {
    let mut parts = Vec::new();

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (part, None),
        };

        let mut translated = match range.split_once('-') {
            Some((start, end)) => {
                let start = day_name(start)?;
                if is_sunday_seven(end) {
                    // `x-7` wraps onto Sunday; split it so the range stays ascending.
                    if step.is_some() {
                        return Err(format!("unsupported day-of-week range {part}"));
                    }
                    parts.push(format!("{start}-Sat"));
                    parts.push("Sun".to_string());
                    continue;
                }
                format!("{start}-{}", day_name(end)?)
            },
            None if range == "*" || range == "?" => range.to_string(),
            None => day_name(range)?,
        };

        if let Some(step) = step {
            translated.push('/');
            translated.push_str(step);
        }
        parts.push(translated);
    }

    Ok(parts.join(","))
}

fn is_sunday_seven(value: &str) -> bool {
    value.trim() == "7"
}

fn day_name(value: &str) -> std::result::Result<String, String> {
    match value.parse::<usize>() {
        Ok(7) => Ok(DAY_NAMES[0].to_string()),
        Ok(n) if n < DAY_NAMES.len() => Ok(DAY_NAMES[n].to_string()),
        Ok(n) => Err(format!("day of week {n} out of range 0-7")),
        Err(_) if value.chars().all(|c| c.is_ascii_alphabetic()) && !value.is_empty() => {
            Ok(value.to_string())
        },
        Err(_) => Err(format!("invalid day of week {value:?}")),
    }
}

/// Parses a duration such as `5s`, `1h30m`, `1.5h` or `250ms`.
///
/// Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. The result must be
/// positive.
pub fn parse_interval(input: &str) -> std::result::Result<Duration, String> {
    if input.is_empty() {
        return Err("missing interval after @every".to_string());
    }

    let mut total_nanos = 0f64;
    let mut rest = input;

    while !rest.is_empty() {
        let number_len =
            rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("expected a number in interval {input:?}"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid number in interval {input:?}"))?;
        rest = &rest[number_len..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in interval {input:?}")),
            unit => return Err(format!("unknown unit {unit:?} in interval {input:?}")),
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }

    let total_nanos = total_nanos.round();
    if !total_nanos.is_finite() || total_nanos < 1.0 {
        return Err(format!("interval {input:?} must be positive"));
    }
    if total_nanos >= u64::MAX as f64 {
        return Err(format!("interval {input:?} is too long"));
    }
    Ok(Duration::from_nanos(total_nanos as u64))
}
