//! Backup plans: what to back up, when, and what to keep.

use std::str::FromStr;

use chrono::{DateTime, Duration, Local, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, Result};
use crate::models::hook::Hook;

/// Reference time against which a schedule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleClock {
    #[default]
    Local,
    Utc,
    LastRunTime,
}

/// When a plan or policy runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Disabled,
    Cron { expr: String },
    IntervalDays { days: u32 },
    IntervalHours { hours: u32 },
    /// Run whenever at least `days` have elapsed since the last run.
    MaxFrequencyDays { days: u32 },
}

impl Default for Schedule {
    fn default() -> Self {
        Self::Disabled
    }
}

/// A schedule paired with its reference clock.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct SchedulePolicy {
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub clock: ScheduleClock,
}

impl SchedulePolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.schedule, Schedule::Disabled)
    }

    /// Validate that the schedule can be evaluated.
    pub fn validate(&self) -> Result<()> {
        match &self.schedule {
            Schedule::Cron { expr } => {
                parse_cron(expr)?;
                Ok(())
            }
            Schedule::IntervalDays { days } | Schedule::MaxFrequencyDays { days } => {
                if *days == 0 {
                    return Err(AppError::Validation("schedule interval must be nonzero".into()));
                }
                Ok(())
            }
            Schedule::IntervalHours { hours } => {
                if *hours == 0 {
                    return Err(AppError::Validation("schedule interval must be nonzero".into()));
                }
                Ok(())
            }
            Schedule::Disabled => Ok(()),
        }
    }

    /// Compute the next run time after `now`.
    ///
    /// A missed run under the `LAST_RUN_TIME` clock fires once immediately
    /// (the returned time is `now`), never as a catch-up flood. With no
    /// prior run a `LAST_RUN_TIME` schedule also returns `now`.
    pub fn next_after(
        &self,
        now: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match &self.schedule {
            Schedule::Disabled => None,
            Schedule::Cron { expr } => {
                let schedule = parse_cron(expr).ok()?;
                match self.clock {
                    ScheduleClock::Utc => schedule.after(&now).next(),
                    ScheduleClock::Local => schedule
                        .after(&now.with_timezone(&Local))
                        .next()
                        .map(|t| t.with_timezone(&Utc)),
                    ScheduleClock::LastRunTime => {
                        let anchor = match last_run {
                            Some(t) => t,
                            None => return Some(now),
                        };
                        let next = schedule.after(&anchor).next()?;
                        Some(next.max(now))
                    }
                }
            }
            Schedule::IntervalDays { days } => {
                self.next_interval(now, last_run, Duration::days(*days as i64))
            }
            Schedule::IntervalHours { hours } => {
                self.next_interval(now, last_run, Duration::hours(*hours as i64))
            }
            Schedule::MaxFrequencyDays { days } => {
                // Literal semantics: defer to last_run + days when the last
                // run is too recent, otherwise run now.
                let window = Duration::days(*days as i64);
                match last_run {
                    None => Some(now),
                    Some(last) if now < last + window => Some(last + window),
                    Some(_) => Some(now),
                }
            }
        }
    }

    fn next_interval(
        &self,
        now: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
        interval: Duration,
    ) -> Option<DateTime<Utc>> {
        match self.clock {
            ScheduleClock::LastRunTime => match last_run {
                None => Some(now),
                Some(last) => Some((last + interval).max(now)),
            },
            // Wall-clock interval schedules anchor at evaluation time.
            _ => Some(now + interval),
        }
    }
}

/// The `cron` crate expects 7-field expressions (sec min hour dom month dow
/// year) but users typically write 5-field (min hour dom month dow).
/// Prepend "0 " for seconds if we detect a 5-field expression.
fn parse_cron(expr: &str) -> Result<CronSchedule> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    CronSchedule::from_str(&normalized)
        .map_err(|e| AppError::Validation(format!("invalid cron expression '{}': {}", expr, e)))
}

/// What snapshots to keep when a plan's forget pass runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetentionPolicy {
    KeepAll,
    KeepLastN { count: u32 },
    KeepByTime {
        #[serde(default)]
        hourly: u32,
        #[serde(default)]
        daily: u32,
        #[serde(default)]
        weekly: u32,
        #[serde(default)]
        monthly: u32,
        #[serde(default)]
        yearly: u32,
        /// Duration expression understood by the backup tool, e.g. "2y5m7d".
        #[serde(default)]
        within: String,
    },
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::KeepAll
    }
}

impl RetentionPolicy {
    /// Arguments for the backup tool's forget subcommand, or `None` when the
    /// policy keeps everything and no forget pass should run.
    pub fn to_forget_args(&self) -> Option<Vec<String>> {
        match self {
            Self::KeepAll => None,
            Self::KeepLastN { count } => {
                Some(vec!["--keep-last".into(), count.to_string()])
            }
            Self::KeepByTime {
                hourly,
                daily,
                weekly,
                monthly,
                yearly,
                within,
            } => {
                let mut args = Vec::new();
                for (flag, value) in [
                    ("--keep-hourly", hourly),
                    ("--keep-daily", daily),
                    ("--keep-weekly", weekly),
                    ("--keep-monthly", monthly),
                    ("--keep-yearly", yearly),
                ] {
                    if *value > 0 {
                        args.push(flag.to_string());
                        args.push(value.to_string());
                    }
                }
                if !within.is_empty() {
                    args.push("--keep-within".into());
                    args.push(within.clone());
                }
                Some(args)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::KeepLastN { count } if *count == 0 => {
                Err(AppError::Validation("keep-last count must be nonzero".into()))
            }
            Self::KeepByTime { within, .. } if !within.is_empty() => {
                validate_within(within)
            }
            _ => Ok(()),
        }
    }
}

/// `within` durations are of the form `1y2m3d4h`, any subset in that order.
fn validate_within(within: &str) -> Result<()> {
    let mut seen_digit = false;
    let mut seen_unit = false;
    for c in within.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            'y' | 'm' | 'd' | 'h' => {
                if !seen_digit {
                    return Err(AppError::Validation(format!(
                        "invalid retention duration '{}'",
                        within
                    )));
                }
                seen_digit = false;
                seen_unit = true;
            }
            _ => {
                return Err(AppError::Validation(format!(
                    "invalid retention duration '{}'",
                    within
                )))
            }
        }
    }
    if !seen_unit || seen_digit {
        return Err(AppError::Validation(format!(
            "invalid retention duration '{}'",
            within
        )));
    }
    Ok(())
}

/// A backup plan: a set of paths backed up into one repo on a schedule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct Plan {
    pub id: String,
    /// Id of the repo this plan backs up into. Immutable after creation.
    pub repo: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Case-insensitive excludes.
    #[serde(default)]
    pub iexcludes: Vec<String>,
    #[serde(default)]
    pub schedule: SchedulePolicy,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}
