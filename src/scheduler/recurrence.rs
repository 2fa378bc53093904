//! Deciding whether a schedule is due.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::SchedulerError;
use crate::scheduler::schedule::{Schedule, ScheduleTask};

/// Result of evaluating a schedule at one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Due {
    Run,
    NotDue,
    /// Due, but the previous run has not completed.
    StillRunning { next_fire: Option<DateTime<Utc>> },
}

/// How a schedule recurs.
#[derive(Debug, Clone)]
pub enum Recurrence {
    Frequency(Duration),
    Cron(Box<cron::Schedule>),
}

impl Recurrence {
    /// Frequency wins when a schedule carries both.
    pub fn from_schedule(schedule: &Schedule) -> Result<Self, SchedulerError> {
        if let Some(frequency) = schedule.frequency {
            return Ok(Self::Frequency(frequency));
        }
        match &schedule.cron_expression {
            Some(expression) => parse_cron(expression)
                .map(|c| Self::Cron(Box::new(c)))
                .map_err(|reason| SchedulerError::InvalidCron {
                    name: schedule.name.clone(),
                    expression: expression.clone(),
                    reason,
                }),
            None => Err(SchedulerError::MissingRecurrence {
                name: schedule.name.clone(),
            }),
        }
    }

    /// Evaluate at `now`, given the schedule's last task.
    ///
    /// Frequency: due once `frequency` has elapsed since the last task was
    /// scheduled, or when there is none. Cron: due when a fire time falls
    /// within the last `tick_interval`, so each fire is seen by exactly one
    /// tick of a scheduler ticking at that interval.
    pub fn evaluate(
        &self,
        last: Option<&ScheduleTask>,
        now: DateTime<Utc>,
        tick_interval: Duration,
    ) -> Due {
        let due = match self {
            Self::Frequency(frequency) => match last {
                None => true,
                Some(task) => elapsed(task.scheduled_at, now) >= *frequency,
            },
            Self::Cron(schedule) => match chrono::Duration::from_std(tick_interval) {
                Ok(window) => schedule
                    .after(&(now - window))
                    .next()
                    .is_some_and(|fire| fire <= now),
                Err(_) => false,
            },
        };

        if !due {
            return Due::NotDue;
        }
        match last {
            Some(task) if !task.is_completed() => Due::StillRunning {
                next_fire: self.next_fire(last, now),
            },
            _ => Due::Run,
        }
    }

    /// Next time the schedule becomes due, for logging.
    pub fn next_fire(&self, last: Option<&ScheduleTask>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Frequency(frequency) => {
                let frequency = chrono::Duration::from_std(*frequency).ok()?;
                Some(last.map_or(now, |t| t.scheduled_at + frequency).max(now))
            }
            Self::Cron(schedule) => schedule.after(&now).next(),
        }
    }
}

/// Parse a cron expression. UNIX 5-field expressions get a leading seconds field.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, String> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| format!("invalid cron: {e}"))
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
