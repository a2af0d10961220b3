//! Cron expression evaluation.
//!
//! The queue accepts standard 5-field Unix cron expressions
//! (`minute hour day-of-month month day-of-week`). The `cron` crate expects
//! a 7-field format, so expressions are converted by pinning seconds to `0`
//! (fire at :00 of each matching minute) and leaving the year open.
//!
//! Evaluation is pure: the next fire time is a function of `(expr, from)`
//! only, always in UTC.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{Error, Result};

/// Number of fields in the accepted cron dialect.
const CRON_FIELDS: usize = 5;

fn parse_schedule(expression: &str) -> Result<Schedule> {
    let field_count = expression.split_whitespace().count();
    if field_count != CRON_FIELDS {
        return Err(Error::InvalidCron(format!(
            "expected {CRON_FIELDS} fields, got {field_count} in {expression:?}"
        )));
    }
    Schedule::from_str(&format!("0 {expression} *"))
        .map_err(|e| Error::InvalidCron(e.to_string()))
}

/// Check whether `expression` is a valid 5-field cron expression.
pub fn validate(expression: &str) -> bool {
    parse_schedule(expression).is_ok()
}

/// Smallest instant strictly greater than `from` at which `expression`
/// fires.
pub fn next_after(expression: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = parse_schedule(expression)?;
    schedule
        .after(&from)
        .next()
        .ok_or_else(|| Error::InvalidCron(format!("no future occurrence for {expression:?}")))
}
