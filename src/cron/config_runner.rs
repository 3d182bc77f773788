//! Cron expression evaluation for configured schedules.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeDelta, Utc};

/// Normalize cron expression: 5-field (min hour dom month dow) -> 7-field (sec min hour dom month dow year).
pub fn normalize_cron_expr(expr: &str) -> String {
    let expr = expr.trim();
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() == 5 {
        format!("0 {} *", parts.join(" "))
    } else {
        expr.to_string()
    }
}

pub fn parse_schedule(expr: &str) -> Result<cron::Schedule> {
    let normalized = normalize_cron_expr(expr);
    cron::Schedule::from_str(&normalized)
        .with_context(|| format!("invalid cron expression '{expr}'"))
}

/// Next firing strictly after `after`, evaluated in local time.
pub fn next_run_after(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let local = after.with_timezone(&Local);
    schedule
        .after(&local)
        .next()
        .map(|next| next.with_timezone(&Utc))
}

/// How long to sleep from `now` until `at`; zero when `at` already passed.
pub fn delay_until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// `at` shifted by `secs` seconds, or `None` when the result leaves the
/// representable date range.
pub fn add_seconds(at: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_seconds(secs).and_then(|d| at.checked_add_signed(d))
}

/// First step of `interval_seconds` after `prev` that lands past `now`.
pub fn next_interval_after(
    prev: DateTime<Utc>,
    interval_seconds: u64,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(interval_seconds.max(1)).ok()?;
    let mut next = add_seconds(prev, secs)?;
    if next <= now {
        // Skip missed steps in one go.
        let behind = (now - next).num_seconds() / secs + 1;
        next = add_seconds(next, behind.checked_mul(secs)?)?;
    }
    Some(next)
}
