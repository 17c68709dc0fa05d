//! Trigger - 実行タイミングの指定（date / interval / cron）
//!
//! cron は「毎日 hour:minute（ローカル時刻）」のみをサポートする。
//! 当日の時刻を過ぎていれば翌日に回る。

use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::TaskSystemError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trigger {
    /// Fire once.
    Date {
        #[serde(rename = "runDate")]
        run_at: DateTime<Utc>,
    },
    /// Fire every `seconds`, first one interval from scheduling.
    Interval { seconds: u64 },
    /// Fire daily at `hour:minute` local time.
    Cron {
        hour: u32,
        #[serde(default)]
        minute: u32,
    },
}

impl Trigger {
    pub fn date(run_at: DateTime<Utc>) -> Self {
        Self::Date { run_at }
    }

    pub fn interval(seconds: u64) -> Self {
        Self::Interval { seconds }
    }

    pub fn daily(hour: u32, minute: u32) -> Self {
        Self::Cron { hour, minute }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Date { .. })
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), TaskSystemError> {
        match *self {
            Self::Date { run_at } if run_at <= now => Err(TaskSystemError::InvalidTrigger(format!(
                "run date {run_at} is not in the future"
            ))),
            Self::Interval { seconds: 0 } => Err(TaskSystemError::InvalidTrigger(
                "interval must be at least one second".to_string(),
            )),
            Self::Cron { hour, .. } if hour > 23 => Err(TaskSystemError::InvalidTrigger(format!(
                "cron hour {hour} is outside 0-23"
            ))),
            Self::Cron { minute, .. } if minute > 59 => Err(TaskSystemError::InvalidTrigger(
                format!("cron minute {minute} is outside 0-59"),
            )),
            _ => Ok(()),
        }
    }

    /// First fire time when scheduled at `now`.
    pub fn first_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Self::Date { run_at } => run_at,
            Self::Interval { seconds } => now + interval(seconds),
            Self::Cron { hour, minute } => next_daily(now, hour, minute),
        }
    }

    /// Next fire time after a firing at `now`; `None` for one-off triggers.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Self::Date { .. } => None,
            Self::Interval { seconds } => Some(now + interval(seconds)),
            Self::Cron { hour, minute } => Some(next_daily(now, hour, minute)),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Date { run_at } => write!(f, "date[{}]", run_at.to_rfc3339()),
            Self::Interval { seconds } => write!(f, "interval[{seconds}s]"),
            Self::Cron { hour, minute } => write!(f, "cron[{hour:02}:{minute:02}]"),
        }
    }
}

/// Interval as a chrono duration, capped at a century.
fn interval(seconds: u64) -> Duration {
    let cap = Duration::days(36_500);
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .map_or(cap, |d| d.min(cap))
}

/// Next local `hour:minute` strictly after `now`.
fn next_daily(now: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let local_now = now.with_timezone(&Local);
    let mut date: NaiveDate = local_now.date_naive();
    // Two days cover "later today" and "tomorrow"; the third absorbs a DST gap.
    for _ in 0..3 {
        if let Some(candidate) = date
            .and_hms_opt(hour, minute, 0)
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            && candidate > local_now
        {
            return candidate.with_timezone(&Utc);
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    now + Duration::days(1)
}
