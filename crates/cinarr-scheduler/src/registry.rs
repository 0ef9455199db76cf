// SPDX-License-Identifier: GPL-3.0-or-later
//! Job table of the single worker. Every mutation goes through one lock that
//! is never held across an await, so the table can be changed from inside a
//! running job.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::job::Job;

pub const MIN_INTERVAL_SECONDS: u64 = 1;
pub const MAX_INTERVAL_SECONDS: u64 = 24 * 60 * 60;

/// Job schedule configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Run at fixed intervals (in seconds)
    Interval(u64),
    /// Run once at the given time, then drop the job
    Once(DateTime<Utc>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown task {0}")]
    UnknownTask(String),
    #[error("interval {seconds}s for {task} is outside {min}..={max}")]
    InvalidInterval {
        task: String,
        seconds: u64,
        min: u64,
        max: u64,
    },
}

/// How a recurring job behaves apart from its interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTraits {
    /// Slowed down in idle mode.
    pub dynamic: bool,
    /// Suspended by a scheduler pause.
    pub pausable: bool,
    pub enabled: bool,
}

impl Default for JobTraits {
    fn default() -> Self {
        Self {
            dynamic: false,
            pausable: true,
            enabled: true,
        }
    }
}

/// Registered job with its schedule
struct RegisteredJob {
    job: Arc<dyn Job>,
    task: String,
    schedule: Schedule,
    default_interval: u64,
    custom_interval: Option<u64>,
    multiplier: u32,
    traits: JobTraits,
    suspended: bool,
    next_run: DateTime<Utc>,
    retries: u32,
    next_run_override: Option<u64>,
}

impl RegisteredJob {
    fn effective_interval(&self) -> u64 {
        let base = self.custom_interval.unwrap_or(self.default_interval);
        base.saturating_mul(u64::from(self.multiplier.max(1)))
            .min(MAX_INTERVAL_SECONDS)
    }

    fn runnable(&self) -> bool {
        self.traits.enabled && !self.suspended
    }

    fn is_recurring(&self) -> bool {
        matches!(self.schedule, Schedule::Interval(_))
    }
}

/// Job picked by [`JobRegistry::next_due`].
#[derive(Clone)]
pub struct DueJob {
    pub job_id: String,
    pub task: String,
    pub job: Arc<dyn Job>,
}

/// What the worker reports back after running a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    RetryRequested,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub task: String,
    pub job_type: String,
    pub interval_seconds: Option<u64>,
    pub default_interval_seconds: Option<u64>,
    pub custom_interval_seconds: Option<u64>,
    /// `None` while the job is paused or disabled.
    pub next_run: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub paused: bool,
    pub dynamic: bool,
}

/// Job registry that manages the scheduled jobs of the single worker
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<BTreeMap<String, RegisteredJob>>,
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

pub fn validate_interval(task: &str, secs: u64) -> Result<u64, RegistryError> {
    if (MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&secs) {
        Ok(secs)
    } else {
        Err(RegistryError::InvalidInterval {
            task: task.to_string(),
            seconds: secs,
            min: MIN_INTERVAL_SECONDS,
            max: MAX_INTERVAL_SECONDS,
        })
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, BTreeMap<String, RegisteredJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            warn!(target: "registry", "job table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Register a recurring job under its task name. The first run is one
    /// interval after `now`.
    pub fn register(
        &self,
        task: impl Into<String>,
        job: Arc<dyn Job>,
        default_interval: u64,
        traits: JobTraits,
        now: DateTime<Utc>,
    ) {
        let task = task.into();
        let default_interval = default_interval.clamp(MIN_INTERVAL_SECONDS, MAX_INTERVAL_SECONDS);
        info!(target: "registry", job_id = %task, job_type = job.job_type(), interval = default_interval, enabled = traits.enabled, "registering job");
        let registered = RegisteredJob {
            job,
            task: task.clone(),
            schedule: Schedule::Interval(default_interval),
            default_interval,
            custom_interval: None,
            multiplier: 1,
            traits,
            suspended: false,
            next_run: now + seconds(default_interval),
            retries: 0,
            next_run_override: None,
        };
        self.jobs().insert(task, registered);
    }

    /// Register a date-triggered job that is dropped after it runs.
    pub fn add_once(
        &self,
        job_id: impl Into<String>,
        task: impl Into<String>,
        job: Arc<dyn Job>,
        at: DateTime<Utc>,
        pausable: bool,
    ) {
        let job_id = job_id.into();
        debug!(target: "registry", %job_id, %at, "adding one-shot job");
        let registered = RegisteredJob {
            job,
            task: task.into(),
            schedule: Schedule::Once(at),
            default_interval: 0,
            custom_interval: None,
            multiplier: 1,
            traits: JobTraits {
                dynamic: false,
                pausable,
                enabled: true,
            },
            suspended: false,
            next_run: at,
            retries: 0,
            next_run_override: None,
        };
        self.jobs().insert(job_id, registered);
    }

    pub fn remove(&self, job_id: &str) -> bool {
        self.jobs().remove(job_id).is_some()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs().contains_key(job_id)
    }

    /// The job object behind a recurring task.
    pub fn job_for(&self, task: &str) -> Option<Arc<dyn Job>> {
        self.jobs()
            .get(task)
            .filter(|j| j.is_recurring())
            .map(|j| j.job.clone())
    }

    /// Task a job id belongs to.
    pub fn task_of(&self, job_id: &str) -> Option<String> {
        self.jobs().get(job_id).map(|j| j.task.clone())
    }

    pub fn tasks(&self) -> Vec<String> {
        self.jobs()
            .iter()
            .filter(|(_, j)| j.is_recurring())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Earliest runnable job whose time has come.
    pub fn next_due(&self, now: DateTime<Utc>) -> Option<DueJob> {
        self.jobs()
            .iter()
            .filter(|(_, j)| j.runnable() && j.next_run <= now)
            .min_by_key(|(_, j)| j.next_run)
            .map(|(id, j)| DueJob {
                job_id: id.clone(),
                task: j.task.clone(),
                job: j.job.clone(),
            })
    }

    /// When the worker next has something to do.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.jobs()
            .values()
            .filter(|j| j.runnable())
            .map(|j| j.next_run)
            .min()
    }

    /// Book-keeping after a run: one-shots are dropped, recurring jobs move
    /// to their next slot unless they were paused or disabled meanwhile.
    pub fn complete(&self, job_id: &str, now: DateTime<Utc>, outcome: RunOutcome) {
        let mut jobs = self.jobs();
        let Some(job) = jobs.get_mut(job_id) else {
            return;
        };
        if !job.is_recurring() {
            jobs.remove(job_id);
            return;
        }

        let retry = outcome == RunOutcome::RetryRequested
            && job.job.is_retriable()
            && job.retries < job.job.max_retries();
        let delay = if retry {
            job.retries += 1;
            debug!(target: "registry", %job_id, attempt = job.retries, "scheduling early retry");
            job.job.retry_delay_seconds()
        } else {
            job.retries = 0;
            job.next_run_override
                .take()
                .unwrap_or_else(|| job.effective_interval())
        };
        job.next_run = now + seconds(delay);
    }

    /// Use `secs` instead of the interval for the next slot of `job_id` only.
    pub fn defer_next_run(&self, job_id: &str, secs: u64) {
        if let Some(job) = self.jobs().get_mut(job_id) {
            job.next_run_override = Some(secs.max(MIN_INTERVAL_SECONDS));
        }
    }

    /// Run a recurring job at `at` instead of its current slot.
    pub fn run_at(&self, job_id: &str, at: DateTime<Utc>) -> bool {
        match self.jobs().get_mut(job_id) {
            Some(job) => {
                job.next_run = at;
                true
            }
            None => false,
        }
    }

    /// Suspend every pausable, running job accepted by `filter` and return
    /// the ids that were actually suspended by this call.
    pub fn suspend_where(&self, filter: impl Fn(&str) -> bool) -> Vec<String> {
        let mut suspended = Vec::new();
        for (id, job) in self.jobs().iter_mut() {
            if job.traits.pausable && job.runnable() && filter(&job.task) {
                job.suspended = true;
                suspended.push(id.clone());
            }
        }
        suspended
    }

    /// Resume the listed jobs. Recurring jobs get a fresh slot one interval
    /// from `now`; one-shots keep their original time.
    pub fn resume(&self, ids: &[String], now: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs();
        let mut resumed = 0;
        for id in ids {
            let Some(job) = jobs.get_mut(id) else {
                continue;
            };
            if !job.suspended {
                continue;
            }
            job.suspended = false;
            if job.is_recurring() {
                job.next_run = now + seconds(job.effective_interval());
            }
            resumed += 1;
        }
        resumed
    }

    pub fn suspended(&self) -> Vec<String> {
        self.jobs()
            .iter()
            .filter(|(_, j)| j.suspended)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn set_enabled(&self, task: &str, enabled: bool, now: DateTime<Utc>) -> Result<(), RegistryError> {
        let mut jobs = self.jobs();
        let job = jobs
            .get_mut(task)
            .filter(|j| j.is_recurring())
            .ok_or_else(|| RegistryError::UnknownTask(task.to_string()))?;
        if job.traits.enabled != enabled {
            job.traits.enabled = enabled;
            if enabled {
                job.next_run = now + seconds(job.effective_interval());
            }
            info!(target: "registry", %task, enabled, "task toggled");
        }
        Ok(())
    }

    pub fn is_enabled(&self, task: &str) -> Option<bool> {
        self.jobs().get(task).map(|j| j.traits.enabled)
    }

    /// Install or clear a custom interval and reschedule the task from `now`.
    /// Returns the interval now in force.
    pub fn set_interval(
        &self,
        task: &str,
        custom: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<u64, RegistryError> {
        if let Some(secs) = custom {
            validate_interval(task, secs)?;
        }
        let mut jobs = self.jobs();
        let job = jobs
            .get_mut(task)
            .filter(|j| j.is_recurring())
            .ok_or_else(|| RegistryError::UnknownTask(task.to_string()))?;
        let default = job.default_interval;
        job.custom_interval = custom.filter(|secs| *secs != default);
        let effective = job.effective_interval();
        job.schedule = Schedule::Interval(effective);
        job.next_run = now + seconds(effective);
        info!(target: "registry", %task, interval = effective, "task interval changed");
        Ok(effective)
    }

    pub fn default_interval(&self, task: &str) -> Option<u64> {
        self.jobs()
            .get(task)
            .filter(|j| j.is_recurring())
            .map(|j| j.default_interval)
    }

    pub fn interval(&self, task: &str) -> Option<u64> {
        self.jobs()
            .get(task)
            .filter(|j| j.is_recurring())
            .map(RegisteredJob::effective_interval)
    }

    /// Stretch every dynamic job to `multiplier` times its base interval.
    /// Going back to 1 also makes the stretched jobs due immediately.
    /// Returns the jobs whose interval changed.
    pub fn apply_idle_multiplier(&self, multiplier: u32, now: DateTime<Utc>) -> Vec<String> {
        let multiplier = multiplier.max(1);
        let mut changed = Vec::new();
        for (id, job) in self.jobs().iter_mut() {
            if !job.traits.dynamic || !job.is_recurring() || job.multiplier == multiplier {
                continue;
            }
            let was_stretched = job.multiplier > 1;
            job.multiplier = multiplier;
            job.schedule = Schedule::Interval(job.effective_interval());
            if multiplier == 1 && was_stretched {
                job.next_run = now;
            }
            changed.push(id.clone());
        }
        changed
    }

    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        self.jobs()
            .iter()
            .map(|(id, j)| {
                let recurring = j.is_recurring();
                JobSnapshot {
                    id: id.clone(),
                    task: j.task.clone(),
                    job_type: j.job.job_type().to_string(),
                    interval_seconds: recurring.then(|| j.effective_interval()),
                    default_interval_seconds: recurring.then_some(j.default_interval),
                    custom_interval_seconds: j.custom_interval,
                    next_run: j.runnable().then_some(j.next_run),
                    enabled: j.traits.enabled,
                    paused: j.suspended,
                    dynamic: j.traits.dynamic,
                }
            })
            .collect()
    }

    pub fn next_run(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.jobs()
            .get(job_id)
            .filter(|j| j.runnable())
            .map(|j| j.next_run)
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobContext, JobResult};
    use chrono::TimeZone;

    struct NoopJob {
        retriable: bool,
    }

    #[async_trait::async_trait]
    impl Job for NoopJob {
        fn job_type(&self) -> &'static str {
            "noop"
        }

        fn name(&self) -> String {
            "Noop".into()
        }

        async fn execute(&self, _ctx: JobContext) -> anyhow::Result<JobResult> {
            Ok(JobResult::Success)
        }

        fn is_retriable(&self) -> bool {
            self.retriable
        }

        fn retry_delay_seconds(&self) -> u64 {
            5
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn registry() -> JobRegistry {
        let registry = JobRegistry::new();
        registry.register("a", Arc::new(NoopJob { retriable: false }), 10, JobTraits::default(), t0());
        registry.register(
            "b",
            Arc::new(NoopJob { retriable: true }),
            60,
            JobTraits {
                dynamic: true,
                ..JobTraits::default()
            },
            t0(),
        );
        registry
    }

    #[test]
    fn earliest_due_job_runs_first() {
        let registry = registry();
        assert!(registry.next_due(t0()).is_none());
        let due = registry.next_due(t0() + Duration::seconds(60)).unwrap();
        assert_eq!(due.job_id, "a");
        registry.complete("a", t0() + Duration::seconds(60), RunOutcome::Done);
        assert_eq!(registry.next_due(t0() + Duration::seconds(60)).unwrap().job_id, "b");
        assert_eq!(registry.next_run("a"), Some(t0() + Duration::seconds(70)));
    }

    #[test]
    fn one_shot_jobs_are_dropped_after_running() {
        let registry = registry();
        registry.add_once("a_manual_1", "a", Arc::new(NoopJob { retriable: false }), t0(), true);
        let due = registry.next_due(t0()).unwrap();
        assert_eq!(due.job_id, "a_manual_1");
        assert_eq!(due.task, "a");
        registry.complete(&due.job_id, t0(), RunOutcome::Done);
        assert!(!registry.contains("a_manual_1"));
        assert_eq!(registry.next_run("a"), Some(t0() + Duration::seconds(10)));
    }

    #[test]
    fn resume_only_touches_what_was_suspended() {
        let registry = registry();
        registry.set_enabled("b", false, t0()).unwrap();
        let suspended = registry.suspend_where(|_| true);
        assert_eq!(suspended, vec!["a".to_string()]);
        assert_eq!(registry.next_run("a"), None);

        let later = t0() + Duration::minutes(5);
        assert_eq!(registry.resume(&suspended, later), 1);
        assert!(registry.suspended().is_empty());
        assert_eq!(registry.next_run("a"), Some(later + Duration::seconds(10)));
        assert_eq!(registry.is_enabled("b"), Some(false));
    }

    #[test]
    fn custom_interval_equal_to_default_is_dropped() {
        let registry = registry();
        assert_eq!(registry.set_interval("a", Some(30), t0()).unwrap(), 30);
        let snap = registry.snapshot();
        assert_eq!(snap.iter().find(|s| s.id == "a").unwrap().custom_interval_seconds, Some(30));

        assert_eq!(registry.set_interval("a", Some(10), t0()).unwrap(), 10);
        let snap = registry.snapshot();
        assert_eq!(snap.iter().find(|s| s.id == "a").unwrap().custom_interval_seconds, None);
    }

    #[test]
    fn intervals_are_bounded() {
        let registry = registry();
        assert!(matches!(
            registry.set_interval("a", Some(0), t0()),
            Err(RegistryError::InvalidInterval { .. })
        ));
        assert!(registry.set_interval("a", Some(MAX_INTERVAL_SECONDS + 1), t0()).is_err());
        assert_eq!(
            registry.set_interval("nope", Some(5), t0()),
            Err(RegistryError::UnknownTask("nope".into()))
        );
    }

    #[test]
    fn idle_multiplier_stretches_dynamic_jobs_and_reset_runs_them_now() {
        let registry = registry();
        assert_eq!(registry.apply_idle_multiplier(4, t0()), vec!["b".to_string()]);
        assert_eq!(registry.interval("b"), Some(240));
        assert_eq!(registry.interval("a"), Some(10));

        let later = t0() + Duration::seconds(30);
        registry.apply_idle_multiplier(1, later);
        assert_eq!(registry.interval("b"), Some(60));
        assert_eq!(registry.next_run("b"), Some(later));
    }

    #[test]
    fn idle_multiplier_respects_the_day_cap() {
        let registry = JobRegistry::new();
        registry.register(
            "slow",
            Arc::new(NoopJob { retriable: false }),
            12 * 60 * 60,
            JobTraits {
                dynamic: true,
                ..JobTraits::default()
            },
            t0(),
        );
        registry.apply_idle_multiplier(4, t0());
        assert_eq!(registry.interval("slow"), Some(MAX_INTERVAL_SECONDS));
    }

    #[test]
    fn retriable_failures_come_back_early() {
        let registry = registry();
        let now = t0() + Duration::seconds(60);
        registry.complete("b", now, RunOutcome::RetryRequested);
        assert_eq!(registry.next_run("b"), Some(now + Duration::seconds(5)));
        registry.complete("a", now, RunOutcome::RetryRequested);
        assert_eq!(registry.next_run("a"), Some(now + Duration::seconds(10)));
    }

    #[test]
    fn deferred_slot_applies_once() {
        let registry = registry();
        registry.defer_next_run("a", 30);
        registry.complete("a", t0(), RunOutcome::Done);
        assert_eq!(registry.next_run("a"), Some(t0() + Duration::seconds(30)));
        registry.complete("a", t0(), RunOutcome::Done);
        assert_eq!(registry.next_run("a"), Some(t0() + Duration::seconds(10)));
    }
}
