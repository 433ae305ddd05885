//! Recurrence expressions for schedule rules.
//!
//! Supported forms:
//!
//! - Five-field cron: `minute hour day-of-month month day-of-week`, each
//!   field a `*`, a number, a range `a-b`, a step `*/n` or `a-b/n`, or a
//!   comma-separated list of those. Months and weekdays also accept
//!   three-letter names (`JAN`, `MON`). Weekday `7` is Sunday, like `0`.
//!   When both day fields are restricted a day matches if either does.
//! - `@every <duration>` with units `s`, `m`, `h`, `d` (`@every 1h30m`).
//! - `@hourly`, `@daily` (`@midnight`), `@weekly`, `@monthly`,
//!   `@yearly` (`@annually`).
//!
//! All times are UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::BrainError;

/// Days searched before a cron expression is declared unsatisfiable
/// (a little over four years, enough to reach every leap day).
const SEARCH_LIMIT_DAYS: i64 = 366 * 4 + 31;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed recurrence expression.
///
/// # Examples
///
/// ```
/// use brain::scheduler::recurrence::Recurrence;
/// use chrono::{TimeZone, Utc};
///
/// let every = Recurrence::parse("@every 90s").unwrap();
/// let t = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
/// assert_eq!(every.next_after(t), Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 1, 30).unwrap()));
///
/// let cron = Recurrence::parse("30 9 * * MON-FRI").unwrap();
/// // 2025-03-01 is a Saturday; the next weekday 09:30 is Monday the 3rd.
/// assert_eq!(cron.next_after(t), Some(Utc.with_ymd_and_hms(2025, 3, 3, 9, 30, 0).unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    /// Fixed interval.
    Every(Duration),
    /// Calendar expression.
    Cron(CronSchedule),
}

impl Recurrence {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// [`BrainError::Validation`] for malformed expressions and intervals
    /// shorter than one second.
    pub fn parse(expression: &str) -> Result<Self, BrainError> {
        let expr = expression.trim();
        let invalid = |reason: &str| {
            BrainError::validation(format!("invalid recurrence '{expression}': {reason}"))
        };

        if let Some(rest) = expr.strip_prefix("@every") {
            let interval = parse_interval(rest.trim()).ok_or_else(|| invalid("bad interval"))?;
            if interval < Duration::seconds(1) {
                return Err(invalid("interval must be at least one second"));
            }
            return Ok(Self::Every(interval));
        }

        let cron = match expr.to_ascii_lowercase().as_str() {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other if other.starts_with('@') => return Err(invalid("unknown shorthand")),
            _ => expr,
        };
        CronSchedule::parse(cron)
            .map(Self::Cron)
            .map_err(|reason| invalid(&reason))
    }

    /// The first occurrence strictly after `after`.
    ///
    /// Returns `None` only for calendar expressions that never match, such
    /// as `0 0 30 2 *`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(interval) => after.checked_add_signed(*interval),
            Self::Cron(cron) => cron.next_after(after),
        }
    }

    /// The first occurrence strictly after `now`, continuing the series that
    /// contains `occurrence`.
    ///
    /// Interval series stay aligned to their original phase instead of
    /// restarting at `now`.
    pub fn first_after(
        &self,
        occurrence: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(interval) => {
                if occurrence > now {
                    return Some(occurrence);
                }
                let step = interval.num_milliseconds().max(1);
                let behind = (now - occurrence).num_milliseconds();
                let periods = behind / step + 1;
                occurrence.checked_add_signed(Duration::milliseconds(periods.checked_mul(step)?))
            }
            Self::Cron(cron) => cron.next_after(now),
        }
    }
}

impl FromStr for Recurrence {
    type Err = BrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every(interval) => write!(f, "@every {}s", interval.num_seconds()),
            Self::Cron(cron) => f.write_str(&cron.source),
        }
    }
}

fn parse_interval(text: &str) -> Option<Duration> {
    if text.is_empty() {
        return None;
    }
    let mut total = Duration::zero();
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: i64 = digits.parse().ok()?;
        digits.clear();
        let part = match c {
            's' => Duration::try_seconds(n)?,
            'm' => Duration::try_minutes(n)?,
            'h' => Duration::try_hours(n)?,
            'd' => Duration::try_days(n)?,
            _ => return None,
        };
        total = total.checked_add(&part)?;
    }
    // A bare trailing number is taken as seconds.
    if !digits.is_empty() {
        total = total.checked_add(&Duration::try_seconds(digits.parse().ok()?)?)?;
    }
    Some(total)
}

/// A five-field cron expression, stored as bit sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    fn parse(expr: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!("expected 5 fields, found {}", fields.len()));
        }

        let minutes = parse_field(fields[0], 0, 59, None)?;
        let hours = parse_field(fields[1], 0, 23, None)?;
        let days_of_month = parse_field(fields[2], 1, 31, None)?;
        let months = parse_field(fields[3], 1, 12, Some((MONTH_NAMES.as_slice(), 1)))?;
        let mut days_of_week = parse_field(fields[4], 0, 7, Some((WEEKDAY_NAMES.as_slice(), 0)))?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }

        Ok(Self {
            source: fields.join(" "),
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: days_of_week as u8,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// The first matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let mut date = start.date_naive();
        let last_date = date + Duration::days(SEARCH_LIMIT_DAYS);

        while date <= last_date {
            if self.months & (1 << date.month()) != 0 && self.day_matches(date) {
                let (from_hour, from_minute) = if date == start.date_naive() {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                if let Some((hour, minute)) = self.first_time_from(from_hour, from_minute) {
                    let naive = date.and_hms_opt(hour, minute, 0)?;
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    fn first_time_from(&self, from_hour: u32, from_minute: u32) -> Option<(u32, u32)> {
        (from_hour..24)
            .filter(|h| self.hours & (1 << h) != 0)
            .find_map(|h| {
                let first_minute = if h == from_hour { from_minute } else { 0 };
                (first_minute..60)
                    .find(|m| self.minutes & (1 << m) != 0)
                    .map(|m| (h, m))
            })
    }
}

fn parse_value(token: &str, names: Option<(&[&str], u32)>) -> Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return Ok(n);
    }
    if let Some((names, offset)) = names {
        let upper = token.to_ascii_uppercase();
        if let Some(idx) = names.iter().position(|name| *name == upper) {
            return Ok(idx as u32 + offset);
        }
    }
    Err(format!("invalid value '{token}'"))
}

fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<(&[&str], u32)>,
) -> Result<u64, String> {
    let mut bits = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step in '{part}'"))?;
                if step == 0 {
                    return Err(format!("zero step in '{part}'"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names)?, parse_value(b, names)?)
        } else {
            let v = parse_value(range, names)?;
            // `5/15` means "from 5 to the end, every 15".
            (v, if step > 1 { max } else { v })
        };

        if lo < min || hi > max || lo > hi {
            return Err(format!("'{part}' outside {min}-{max}"));
        }
        bits |= (lo..=hi)
            .step_by(step as usize)
            .fold(0u64, |acc, v| acc | (1 << v));
    }
    Ok(bits)
}
