use crate::errors::CronError;
use std::sync::LazyLock;

/// Shortest interval, in minutes, a schedule may fire at.
pub(crate) const MIN_INTERVAL_MINUTES: u32 = 5;

// How far ahead `next_after` searches before concluding that an expression
// has no reachable fire time. Eight years covers the worst leap-day gap
// (February 29th across a skipped century leap year).
const SEARCH_HORIZON_DAYS: u32 = 2_923;

// Accepted character set for the whole expression, checked before any field
// parsing so garbage input gets one uniform rejection.
#[allow(clippy::unwrap_used)]
static CHARSET: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[0-9\s,\-*/]+$").unwrap());

// Human descriptions for the well-known patterns the settings UI offers.
const KNOWN_SCHEDULES: [(&str, &str); 8] = [
    ("0 0 * * *", "Daily at midnight"),
    ("0 2 * * *", "Daily at 2 AM"),
    ("0 12 * * *", "Daily at noon"),
    ("0 */6 * * *", "Every 6 hours"),
    ("0 */12 * * *", "Every 12 hours"),
    ("*/15 * * * *", "Every 15 minutes"),
    ("0 0 * * 0", "Weekly on Sunday at midnight"),
    ("0 0 1 * *", "Monthly on the 1st at midnight"),
];

#[derive(Debug, Clone)]
/// A validated 5-field cron expression (minute, hour, day-of-month, month,
/// day-of-week) with every field expanded to the set of values it covers.
/// All evaluation is in UTC.
pub(crate) struct CronExpr {
    expr: String,
    minutes: [bool; 60],
    hours: [bool; 24],
    // Index 0 of days_of_month and months is unused; cron counts them from 1.
    days_of_month: [bool; 32],
    months: [bool; 13],
    days_of_week: [bool; 7],
    dom_restricted: bool,
    dow_restricted: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const FIELDS: [FieldSpec; 5] = [
    FieldSpec { name: "minute", min: 0, max: 59 },
    FieldSpec { name: "hour", min: 0, max: 23 },
    FieldSpec { name: "day-of-month", min: 1, max: 31 },
    FieldSpec { name: "month", min: 1, max: 12 },
    // 7 is accepted as an alias for Sunday and folded onto 0 afterwards.
    FieldSpec { name: "day-of-week", min: 0, max: 7 },
];

// Expand one field into the boolean set of values it covers. Supported
// syntax: `*`, single values, ranges `a-b`, lists `a,b,c`, and steps `/n`
// applied to either a star or a range.
fn parse_field(spec: &FieldSpec, text: &str) -> Result<Vec<bool>, CronError> {
    let field_error = |reason: String| CronError::Field {
        field: spec.name,
        value: text.to_string(),
        reason,
    };

    let mut set = vec![false; (spec.max as usize) + 1];

    for part in text.split(',') {
        if part.is_empty() {
            return Err(field_error("empty list element".to_string()));
        }

        let (range_text, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| field_error(format!("step '{s}' is not a number")))?;
                if step == 0 {
                    return Err(field_error("step must be greater than zero".to_string()));
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range_text == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range_text.split_once('-') {
            let a: u32 = a
                .parse()
                .map_err(|_| field_error(format!("range start '{a}' is not a number")))?;
            let b: u32 = b
                .parse()
                .map_err(|_| field_error(format!("range end '{b}' is not a number")))?;
            if a > b {
                return Err(field_error(format!("range start {a} exceeds range end {b}")));
            }
            (a, b)
        } else {
            let v: u32 = range_text
                .parse()
                .map_err(|_| field_error(format!("'{range_text}' is not a number")))?;
            // A step attached to a single value opens the range up to the
            // field maximum, matching the common cron dialect.
            if step > 1 { (v, spec.max) } else { (v, v) }
        };

        if start < spec.min || end > spec.max {
            return Err(field_error(format!(
                "values must lie within {}-{}",
                spec.min, spec.max
            )));
        }

        let mut v = start;
        while v <= end {
            set[v as usize] = true;
            v += step;
        }
    }

    Ok(set)
}

// The minimum-interval rule: looking only at the minute field, the smallest
// cyclic gap between two scheduled minutes must be at least
// `MIN_INTERVAL_MINUTES`. This rejects every-minute schedules like `*` and
// `*/1` as well as tight lists like `0,1`.
fn minute_gap_ok(minutes: &[bool; 60]) -> bool {
    let scheduled: Vec<u32> = (0..60_u32).filter(|m| minutes[*m as usize]).collect();
    if scheduled.len() < 2 {
        return true;
    }

    let mut min_gap = 60 - scheduled[scheduled.len() - 1] + scheduled[0];
    for pair in scheduled.windows(2) {
        min_gap = min_gap.min(pair[1] - pair[0]);
    }

    min_gap >= MIN_INTERVAL_MINUTES
}

/// Validate a 5-field cron expression and expand it into a [`CronExpr`].
pub(crate) fn validate(expr: &str) -> Result<CronExpr, CronError> {
    let trimmed = expr.trim();
    if trimmed.is_empty() || !CHARSET.is_match(trimmed) {
        return Err(CronError::InvalidCharacter);
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() != FIELDS.len() {
        return Err(CronError::FieldCount(fields.len()));
    }

    let minute_set = parse_field(&FIELDS[0], fields[0])?;
    let hour_set = parse_field(&FIELDS[1], fields[1])?;
    let dom_set = parse_field(&FIELDS[2], fields[2])?;
    let month_set = parse_field(&FIELDS[3], fields[3])?;
    let dow_set = parse_field(&FIELDS[4], fields[4])?;

    let mut minutes = [false; 60];
    let mut hours = [false; 24];
    let mut days_of_month = [false; 32];
    let mut months = [false; 13];
    let mut days_of_week = [false; 7];

    for (i, v) in minute_set.iter().enumerate() {
        minutes[i] = *v;
    }
    for (i, v) in hour_set.iter().enumerate() {
        hours[i] = *v;
    }
    for (i, v) in dom_set.iter().enumerate() {
        days_of_month[i] = *v;
    }
    for (i, v) in month_set.iter().enumerate() {
        months[i] = *v;
    }
    // Fold the Sunday alias 7 onto 0.
    for (i, v) in dow_set.iter().enumerate().take(7) {
        days_of_week[i] = *v;
    }
    if dow_set[7] {
        days_of_week[0] = true;
    }

    if !minute_gap_ok(&minutes) {
        return Err(CronError::TooFrequent);
    }

    Ok(CronExpr {
        expr: fields.join(" "),
        minutes,
        hours,
        days_of_month,
        months,
        days_of_week,
        dom_restricted: fields[2] != "*",
        dow_restricted: fields[4] != "*",
    })
}

impl CronExpr {
    /// The normalized expression text.
    pub(crate) fn expression(&self) -> &str {
        &self.expr
    }

    // Day matching follows the vixie-cron rule: when both day-of-month and
    // day-of-week are restricted, a day satisfying either one fires.
    fn day_matches(&self, date: chrono::NaiveDate) -> bool {
        use chrono::Datelike;

        if !self.months[date.month() as usize] {
            return false;
        }

        let dom_hit = self.days_of_month[date.day() as usize];
        let dow_hit = self.days_of_week[date.weekday().num_days_from_sunday() as usize];

        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_hit || dow_hit,
            _ => dom_hit && dow_hit,
        }
    }

    /// The next fire instant strictly after `from`, or `None` when no day
    /// within the search horizon matches (e.g. `0 0 30 2 *`).
    pub(crate) fn next_after(
        &self,
        from: chrono::DateTime<chrono::Utc>,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        let mut date = from.date_naive();
        for _ in 0..SEARCH_HORIZON_DAYS {
            if self.day_matches(date) {
                for hour in 0..24_u32 {
                    if !self.hours[hour as usize] {
                        continue;
                    }
                    for minute in 0..60_u32 {
                        if !self.minutes[minute as usize] {
                            continue;
                        }
                        let candidate = date
                            .and_hms_opt(hour, minute, 0)
                            .map(|naive| naive.and_utc())?;
                        if candidate > from {
                            return Some(candidate);
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }

        None
    }

    /// The next `n` fire instants strictly after `from`, strictly increasing.
    pub(crate) fn next_runs(
        &self,
        n: usize,
        from: chrono::DateTime<chrono::Utc>,
    ) -> Vec<chrono::DateTime<chrono::Utc>> {
        let mut runs = Vec::with_capacity(n);
        let mut cursor = from;
        while runs.len() < n {
            match self.next_after(cursor) {
                Some(next) => {
                    cursor = next;
                    runs.push(next);
                }
                None => break,
            }
        }
        runs
    }

    /// A human-readable description of the schedule.
    pub(crate) fn describe(&self) -> String {
        for (pattern, description) in &KNOWN_SCHEDULES {
            if self.expr == *pattern {
                return (*description).to_string();
            }
        }
        format!("Custom schedule: {}", self.expr)
    }
}
