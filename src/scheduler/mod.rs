//! Periodic scheduler: submits due schedules and drives retention.

pub mod recurrence;
pub mod schedule;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, TaskError};
use crate::executor::{LoggingListener, TaskExecutor};
use crate::retention::{RetentionManager, RetentionReport};
use crate::store::Database;
use crate::task::TaskRegistry;

pub use recurrence::{Due, Recurrence};
pub use schedule::{Schedule, ScheduleStatus, ScheduleTask};

/// Tells whether this instance should stay passive.
pub trait LeadershipCheck: Send + Sync {
    fn is_follower(&self) -> bool;
}

/// Leadership fixed at startup.
pub struct StaticLeadership {
    follower: bool,
}

impl StaticLeadership {
    pub fn new(follower: bool) -> Self {
        Self { follower }
    }
}

impl LeadershipCheck for StaticLeadership {
    fn is_follower(&self) -> bool {
        self.follower
    }
}

/// What a tick did with one schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Submitted { run_id: Uuid },
    NotDue,
    /// Due, but its previous run has not completed.
    StillRunning,
    /// Another tick holds the schedule's running state.
    Busy,
    /// The task's target is gone; the schedule was stopped.
    Stopped,
}

/// Summary of one tick.
#[derive(Debug, Default)]
pub struct TickReport {
    /// The tick was skipped because another one was in progress.
    pub overlapped: bool,
    /// The tick was skipped because this instance is a follower.
    pub follower: bool,
    pub outcomes: Vec<(Uuid, ScheduleOutcome)>,
    pub failed: Vec<(Uuid, String)>,
    pub retention: Option<RetentionReport>,
}

impl TickReport {
    /// Runs submitted during the tick.
    pub fn submitted(&self) -> Vec<Uuid> {
        self.outcomes
            .iter()
            .filter_map(|(_, outcome)| match outcome {
                ScheduleOutcome::Submitted { run_id } => Some(*run_id),
                _ => None,
            })
            .collect()
    }

    pub fn outcome_for(&self, schedule_id: Uuid) -> Option<&ScheduleOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == schedule_id)
            .map(|(_, outcome)| outcome)
    }
}

/// Clears the tick flag however the tick ends.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The periodic scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn Database>,
    executor: Arc<TaskExecutor>,
    registry: Arc<TaskRegistry>,
    retention: Arc<RetentionManager>,
    leadership: Arc<dyn LeadershipCheck>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<TaskExecutor>,
        registry: Arc<TaskRegistry>,
        retention: Arc<RetentionManager>,
        leadership: Arc<dyn LeadershipCheck>,
    ) -> Self {
        Self {
            config,
            store: Arc::clone(executor.store()),
            executor,
            registry,
            retention,
            leadership,
            running: AtomicBool::new(false),
        }
    }

    /// Clear running flags left behind by a crashed process.
    pub async fn reset_running_states(&self) -> Result<u64, SchedulerError> {
        let reset = self.store.reset_schedule_running_states().await?;
        if reset > 0 {
            tracing::warn!(count = reset, "Reset schedule running states");
        }
        Ok(reset)
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// One scheduler pass evaluated at `now`.
    ///
    /// Overlapping ticks are skipped. A failing schedule is logged and does
    /// not stop the others. Retention runs at the end of every tick that got
    /// past the leadership check.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Previous scheduler tick still in progress, skipping");
            report.overlapped = true;
            return report;
        }
        let _guard = TickGuard(&self.running);

        if self.leadership.is_follower() {
            tracing::debug!("Follower instance, skipping scheduler tick");
            report.follower = true;
            return report;
        }

        let schedules = match self.store.list_active_schedules().await {
            Ok(schedules) => schedules,
            Err(e) => {
                tracing::error!("Failed to load schedules: {e}");
                Vec::new()
            }
        };

        for schedule in &schedules {
            match self.process_schedule(schedule, now).await {
                Ok(outcome) => report.outcomes.push((schedule.id, outcome)),
                Err(e) => {
                    tracing::error!(schedule = %schedule.name, "Error running schedule: {e}");
                    report.failed.push((schedule.id, e.to_string()));
                }
            }
        }

        match self.retention.run_retention(now).await {
            Ok(retention) => report.retention = Some(retention),
            Err(e) => tracing::error!("Retention pass failed: {e}"),
        }

        report
    }

    async fn process_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        let recurrence = Recurrence::from_schedule(schedule)?;

        if !self
            .store
            .set_schedule_running(schedule.id, false, true)
            .await?
        {
            tracing::debug!(schedule = %schedule.name, "Schedule is already being processed");
            return Ok(ScheduleOutcome::Busy);
        }

        let result = self.evaluate(schedule, &recurrence, now).await;

        if let Err(e) = self
            .store
            .set_schedule_running(schedule.id, true, false)
            .await
        {
            tracing::error!(schedule = %schedule.name, "Failed to release running state: {e}");
        }
        result
    }

    async fn evaluate(
        &self,
        schedule: &Schedule,
        recurrence: &Recurrence,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        let last = self.store.last_schedule_task(schedule.id).await?;
        match recurrence.evaluate(last.as_ref(), now, self.config.tick_interval) {
            Due::NotDue => Ok(ScheduleOutcome::NotDue),
            Due::StillRunning { next_fire } => {
                tracing::warn!(
                    schedule = %schedule.name,
                    next_fire = ?next_fire,
                    "Previous run has not completed, skipping"
                );
                Ok(ScheduleOutcome::StillRunning)
            }
            Due::Run => self.submit(schedule, now).await,
        }
    }

    async fn submit(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        let task = match self
            .registry
            .create(&schedule.task_type, &schedule.params)
            .await
        {
            Ok(task) => task,
            Err(TaskError::TargetMissing { target, .. }) => {
                tracing::warn!(
                    schedule = %schedule.name,
                    target = %target,
                    "Schedule target no longer exists, stopping schedule"
                );
                self.store
                    .set_schedule_status(schedule.id, ScheduleStatus::Stopped)
                    .await?;
                return Ok(ScheduleOutcome::Stopped);
            }
            Err(e) => return Err(e.into()),
        };

        let run = self
            .executor
            .create_runnable_task(task, schedule.owner.clone())
            .await?;
        let run_id = run.id();
        run.set_listener(Arc::new(LoggingListener))?;

        self.store
            .record_schedule_task(&ScheduleTask {
                task_id: run_id,
                schedule_id: schedule.id,
                scheduled_at: now,
                completed_at: None,
            })
            .await?;

        if let Err(e) = self.executor.submit(run, None).await {
            self.store.complete_schedule_task(run_id, Utc::now()).await?;
            return Err(e.into());
        }

        let executor = Arc::clone(&self.executor);
        let store = Arc::clone(&self.store);
        let name = schedule.name.clone();
        tokio::spawn(async move {
            let state = executor.wait_for_task(run_id).await;
            if let Err(e) = store.complete_schedule_task(run_id, Utc::now()).await {
                tracing::error!(schedule = %name, run_id = %run_id, "Failed to complete schedule task: {e}");
            }
            tracing::debug!(schedule = %name, run_id = %run_id, state = ?state, "Scheduled run finished");
        });

        tracing::info!(schedule = %schedule.name, run_id = %run_id, "Submitted scheduled run");
        Ok(ScheduleOutcome::Submitted { run_id })
    }
}

/// Spawn the scheduler tick loop.
pub fn spawn_ticker(scheduler: Arc<Scheduler>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let report = scheduler.tick().await;
            tracing::debug!(
                submitted = report.submitted().len(),
                failed = report.failed.len(),
                "Scheduler tick complete"
            );
        }
    })
}
