// SPDX-License-Identifier: GPL-3.0-or-later
pub mod control;
pub mod job;
pub mod jobs;
pub mod load;
pub mod metrics;
pub mod pause;
pub mod registry;
pub mod settings;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration as StdDuration, Instant};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use cinarr_application::{ConnectivityError, SchedulerControl};
use cinarr_config::AppConfig;
use cinarr_infrastructure::state_files::{PerformanceEntry, PerformanceLog, PERFORMANCE_LOG_FILE};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use jobs::{catalogue, RateLimitResumeJob, IDLE_WATCHED_QUEUES};
use load::{process_memory_blocking, sample_blocking, LoadRegulator};
use metrics::ExecutionMetrics;
use pause::{connectivity_retry_delay, PauseScope, PauseState, PauseWindow};
use registry::{DueJob, JobRegistry, RunOutcome, MAX_INTERVAL_SECONDS};

// Re-export key types for convenience
pub use control::{ControlRequest, RunnerState, RunnerStatus};
pub use job::{Job, JobContext, JobResult};
pub use jobs::Services;
pub use load::{LoadSample, LoadSampler, SysinfoSampler};
pub use pause::{PauseInfo, PauseKind};
pub use registry::{JobSnapshot, RegistryError, Schedule};
pub use settings::TaskSettings;

/// Heartbeat flush cadence bounds, in seconds.
const HEARTBEAT_FLUSH_MIN: u64 = 30;
const HEARTBEAT_FLUSH_MAX: u64 = 300;
/// Writes slower than this double the heartbeat flush interval.
const HEARTBEAT_SLOW_WRITE: StdDuration = StdDuration::from_millis(50);
/// Upper bound on jobs run by one [`Scheduler::tick`].
const MAX_JOBS_PER_TICK: usize = 1024;

struct HeartbeatState {
    last_flush: Option<DateTime<Utc>>,
    flush_interval: u64,
}

struct Inner {
    config: Arc<AppConfig>,
    services: Arc<Services>,
    registry: JobRegistry,
    settings: TaskSettings,
    default_enabled: BTreeMap<String, bool>,
    pause: Mutex<PauseState>,
    window: Option<PauseWindow>,
    regulator: LoadRegulator,
    sampler: Arc<dyn LoadSampler>,
    metrics: ExecutionMetrics,
    idle_multiplier: Mutex<u32>,
    heartbeat: Mutex<HeartbeatState>,
    performance: Mutex<PerformanceLog>,
    runner: Mutex<RunnerState>,
    stop_requested: AtomicBool,
    wake: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!(target: "scheduler", "scheduler lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Single-worker scheduler driving the queues and maintenance tasks.
/// Cheap to clone; every clone drives the same job table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(services: Services) -> Self {
        Self::with_load_sampler(services, Arc::new(SysinfoSampler::new()))
    }

    pub fn with_load_sampler(services: Services, sampler: Arc<dyn LoadSampler>) -> Self {
        let config = services.ctx.config.clone();
        let state = services.ctx.state.clone();
        let now = services.ctx.now();
        let services = Arc::new(services);
        let settings = TaskSettings::new(state.clone());

        let registry = JobRegistry::new();
        let mut default_enabled = BTreeMap::new();
        for entry in catalogue(&config, &services) {
            default_enabled.insert(entry.task.clone(), entry.traits.enabled);
            registry.register(entry.task, entry.job, entry.default_interval, entry.traits, now);
        }
        info!(target: "scheduler", jobs = registry.len(), "task catalogue registered");

        let scheduler = Self {
            inner: Arc::new(Inner {
                window: PauseWindow::from_config(&config.queue),
                regulator: LoadRegulator::new(&config.scheduler, config.queue.main_loop_sleep_seconds),
                metrics: ExecutionMetrics::new(&config.scheduler),
                performance: Mutex::new(state.read_or_default(PERFORMANCE_LOG_FILE)),
                config,
                services,
                registry,
                settings,
                default_enabled,
                pause: Mutex::new(PauseState::default()),
                sampler,
                idle_multiplier: Mutex::new(1),
                heartbeat: Mutex::new(HeartbeatState {
                    last_flush: None,
                    flush_interval: HEARTBEAT_FLUSH_MIN,
                }),
                runner: Mutex::new(RunnerState::Initializing),
                stop_requested: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        };
        scheduler.apply_persisted_settings();
        scheduler
    }

    fn apply_persisted_settings(&self) {
        let now = self.now();
        match self.inner.settings.toggles() {
            Ok(toggles) => {
                for (task, enabled) in toggles.toggles {
                    if let Err(e) = self.inner.registry.set_enabled(&task, enabled, now) {
                        debug!(target: "scheduler", %task, error = %e, "ignoring stored toggle");
                    }
                }
            }
            Err(e) => warn!(target: "scheduler", error = %e, "could not load task toggles"),
        }
        for (task, secs) in self.inner.settings.intervals().0 {
            if let Err(e) = self.inner.registry.set_interval(&task, Some(secs), now) {
                warn!(target: "scheduler", %task, error = %e, "ignoring stored interval");
            }
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.inner.services
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.services.ctx.now()
    }

    // ------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------

    /// Start the scheduler and return a handle to the worker task
    pub fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Run due jobs one at a time until [`stop`](Self::stop) is called.
    /// The job in flight always finishes first.
    pub async fn run(&self) -> Result<()> {
        self.set_runner_state(RunnerState::Running);
        info!(target: "scheduler", jobs = self.inner.registry.len(), "scheduler running");

        while !self.inner.stop_requested.load(Ordering::SeqCst) {
            let now = self.now();
            if let Some(due) = self.inner.registry.next_due(now) {
                self.run_job(due).await;
                let sleep = self.inner.regulator.current_sleep();
                if sleep > 0.0 {
                    self.wait(StdDuration::from_secs_f64(sleep)).await;
                }
                continue;
            }
            let wait = self
                .inner
                .registry
                .next_wakeup()
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or(StdDuration::from_secs(1))
                .clamp(StdDuration::from_millis(10), StdDuration::from_secs(1));
            self.wait(wait).await;
        }

        self.set_runner_state(RunnerState::Stopped);
        info!(target: "scheduler", "scheduler stopped");
        Ok(())
    }

    async fn wait(&self, duration: StdDuration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.inner.wake.notified() => {}
        }
    }

    pub fn stop(&self) {
        if !self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            info!(target: "scheduler", "stop requested, finishing current task");
            self.set_runner_state(RunnerState::Stopping);
        }
        self.inner.wake.notify_one();
    }

    /// Run every job that is due at the current time, once each, then return
    /// how many ran.
    pub async fn tick(&self) -> usize {
        let now = self.now();
        let mut ran = 0;
        while ran < MAX_JOBS_PER_TICK {
            let Some(due) = self.inner.registry.next_due(now) else {
                break;
            };
            self.run_job(due).await;
            ran += 1;
        }
        ran
    }

    /// Execution wrapper: timing, share accounting, optional memory sample.
    async fn run_job(&self, due: DueJob) {
        let DueJob { job_id, task, job } = due;
        let started_at = self.now();
        let sample_memory = self.inner.metrics.begin(&job_id, &task);
        let memory_before = if sample_memory {
            process_memory_blocking(self.inner.sampler.clone()).await
        } else {
            None
        };
        let timer = Instant::now();
        debug!(target: "registry", job_id = %job_id, job_type = job.job_type(), "executing job");

        let ctx = JobContext::new(job_id.clone(), task.clone(), started_at, self.clone());
        let outcome = match job.execute(ctx).await {
            Ok(JobResult::Success) => RunOutcome::Done,
            Ok(JobResult::Failure { error, retry }) => {
                error!(target: "registry", job_id = %job_id, job_type = job.job_type(), %error, retry, "job failed");
                if retry {
                    RunOutcome::RetryRequested
                } else {
                    RunOutcome::Done
                }
            }
            Err(err) => {
                error!(target: "registry", job_id = %job_id, job_type = job.job_type(), error = %format!("{:#}", err), "job execution error");
                RunOutcome::RetryRequested
            }
        };
        let elapsed = timer.elapsed();

        if let Some(before) = memory_before {
            if let Some(after) = process_memory_blocking(self.inner.sampler.clone()).await {
                self.inner.metrics.record_memory(&task, before, after);
            }
        }
        let finished_at = self.now();
        self.inner.metrics.finish(&job_id, &task, finished_at, elapsed);
        self.inner.registry.complete(&job_id, finished_at, outcome);
        debug!(target: "registry", job_id = %job_id, elapsed_ms = elapsed.as_millis() as u64, "job finished");
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    fn set_runner_state(&self, state: RunnerState) {
        *lock(&self.inner.runner) = state;
        self.publish_status();
    }

    pub fn runner_state(&self) -> RunnerState {
        *lock(&self.inner.runner)
    }

    pub fn status(&self) -> RunnerStatus {
        let pause = lock(&self.inner.pause).clone();
        RunnerStatus {
            state: self.runner_state(),
            pause_info: pause.current().cloned(),
            currently_executing: self.inner.metrics.currently_executing(),
            paused_jobs: pause.suspended(),
            queue_sizes: self
                .inner
                .services
                .queues
                .sizes()
                .into_iter()
                .map(|(queue, len)| (queue.to_string(), len))
                .collect(),
            inter_task_sleep_seconds: self.inner.regulator.current_sleep(),
            updated_at: self.now(),
        }
    }

    /// Mirror [`status`](Self::status) to `runner_status.json`.
    pub fn publish_status(&self) {
        if let Err(e) = self.status().write(&self.inner.services.ctx.state) {
            warn!(target: "scheduler", error = %e, "could not write runner status");
        }
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.inner.registry.snapshot()
    }

    pub fn next_run(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.inner.registry.next_run(job_id)
    }

    pub fn interval(&self, task: &str) -> Option<u64> {
        self.inner.registry.interval(task)
    }

    /// The most recent active pause.
    pub fn pause_info(&self) -> Option<PauseInfo> {
        lock(&self.inner.pause).current().cloned()
    }

    /// Every active pause, oldest first.
    pub fn active_pauses(&self) -> Vec<PauseInfo> {
        lock(&self.inner.pause)
            .active()
            .iter()
            .map(|p| p.info.clone())
            .collect()
    }

    pub fn is_paused_for(&self, kind: PauseKind) -> bool {
        lock(&self.inner.pause).get(kind).is_some()
    }

    pub fn paused_jobs(&self) -> Vec<String> {
        lock(&self.inner.pause).suspended()
    }

    pub fn performance_log(&self) -> PerformanceLog {
        lock(&self.inner.performance).clone()
    }

    pub fn inter_task_sleep(&self) -> f64 {
        self.inner.regulator.current_sleep()
    }

    // ------------------------------------------------------------------
    // Pause and resume
    // ------------------------------------------------------------------

    /// Suspend every job outside the exempt set.
    pub fn pause(&self, info: PauseInfo) -> PauseInfo {
        self.pause_scoped(info, PauseScope::All)
    }

    /// Record a pause and suspend the runnable jobs its scope covers. Jobs
    /// already held by another pause stay with it.
    fn pause_scoped(&self, info: PauseInfo, scope: PauseScope) -> PauseInfo {
        let now = self.now();
        let recorded = {
            let mut pause = lock(&self.inner.pause);
            let suspended = self.inner.registry.suspend_where(|task| scope.covers(task));
            let count = suspended.len();
            let recorded = pause.record(info, scope, now, suspended);
            warn!(
                target: "scheduler",
                reason = %recorded.reason(),
                error_type = %recorded.error_type(),
                service = recorded.service_name().unwrap_or("-"),
                retry_count = recorded.retry_count(),
                suspended = count,
                "scheduler paused"
            );
            recorded
        };
        self.publish_status();
        recorded
    }

    /// Lift every pause and resume all the jobs they held.
    pub fn resume(&self) {
        self.resume_if(|_| true);
    }

    /// Lift the pauses whose kind `kind` accepts. Jobs another active pause
    /// covers stay suspended under that pause.
    pub fn resume_if(&self, kind: impl Fn(PauseKind) -> bool) {
        let lifted = {
            let mut pause = lock(&self.inner.pause);
            if pause.is_empty() {
                return;
            }
            pause.lift(kind, |id| self.inner.registry.task_of(id))
        };
        if lifted.kinds.is_empty() {
            return;
        }
        let resumed = self.inner.registry.resume(&lifted.released, self.now());
        for kind in &lifted.kinds {
            info!(
                target: "scheduler",
                error_type = %kind,
                resumed,
                still_held = lifted.handed_over,
                "pause lifted"
            );
        }
        self.publish_status();
    }

    /// Pause on a failed probe and bring the next probe of `task` forward.
    pub(crate) fn connectivity_failed(&self, task: &str, err: &ConnectivityError) {
        let retries = self.pause(PauseInfo::from_connectivity(err)).retry_count();
        let delay = connectivity_retry_delay(retries);
        self.inner.registry.defer_next_run(task, delay);
        self.inner
            .registry
            .run_at(task, self.now() + Duration::seconds(delay as i64));
    }

    pub(crate) fn check_scheduled_pause(&self) {
        let in_window = self
            .inner
            .window
            .is_some_and(|window| window.contains(self.now()));
        let scheduled = self.is_paused_for(PauseKind::SystemScheduled);
        if in_window && !scheduled {
            self.pause(PauseInfo::new(
                PauseKind::SystemScheduled,
                "inside the configured pause window",
            ));
        } else if !in_window && scheduled {
            self.resume_if(|kind| kind == PauseKind::SystemScheduled);
        }
    }

    /// Force pauses open that outlived `connectivity_fail_safe_minutes`.
    /// Scheduled and rate-limit pauses are left to their own clock.
    pub(crate) fn fail_safe_watchdog(&self) {
        let limit = Duration::minutes(self.inner.config.queue.connectivity_fail_safe_minutes as i64);
        let now = self.now();
        let stuck: Vec<PauseKind> = lock(&self.inner.pause)
            .active()
            .iter()
            .filter(|p| p.info.error_type().watchdog_may_resume() && now - p.since > limit)
            .map(|p| p.info.error_type())
            .collect();
        if stuck.is_empty() {
            return;
        }
        for kind in &stuck {
            warn!(target: "scheduler", error_type = %kind, "pause outlived the fail-safe limit, forcing resume");
        }
        self.resume_if(|kind| stuck.contains(&kind));
    }

    pub(crate) fn database_health(&self, healthy: bool) {
        if healthy {
            self.resume_if(|kind| kind == PauseKind::DbHealth);
            return;
        }
        error!(target: "scheduler", "database integrity check failed, operator attention needed");
        self.pause(PauseInfo::new(
            PauseKind::DbHealth,
            "database integrity check failed",
        ));
    }

    // ------------------------------------------------------------------
    // Task settings
    // ------------------------------------------------------------------

    /// Queue a one-shot run of `task` now, leaving its recurring slot alone.
    pub fn trigger_task(&self, task: &str) -> Result<String, RegistryError> {
        let job = self
            .inner
            .registry
            .job_for(task)
            .ok_or_else(|| RegistryError::UnknownTask(task.to_string()))?;
        let job_id = format!("{}_manual_{}", task, Uuid::new_v4());
        self.inner
            .registry
            .add_once(job_id.clone(), task, job, self.now(), true);
        info!(target: "scheduler", %task, %job_id, "task triggered");
        self.inner.wake.notify_one();
        Ok(job_id)
    }

    pub fn set_task_enabled(&self, task: &str, enabled: bool) -> Result<()> {
        self.inner.registry.set_enabled(task, enabled, self.now())?;
        self.inner.settings.save_toggle(task, enabled)?;
        Ok(())
    }

    /// Install (`Some`) or clear (`None`) a custom interval, live and on disk.
    pub fn set_task_interval(&self, task: &str, seconds: Option<u64>) -> Result<u64> {
        let effective = self.inner.registry.set_interval(task, seconds, self.now())?;
        let default = self.inner.registry.default_interval(task);
        self.inner.settings.save_interval(task, seconds, default)?;
        Ok(effective)
    }

    /// Delete both settings files and restore every task's defaults.
    pub fn reset_task_settings(&self) -> Result<()> {
        self.inner.settings.reset()?;
        let now = self.now();
        for (task, enabled) in &self.inner.default_enabled {
            self.inner.registry.set_enabled(task, *enabled, now)?;
            self.inner.registry.set_interval(task, None, now)?;
        }
        Ok(())
    }

    pub async fn apply_control(&self, request: ControlRequest) -> Result<()> {
        debug!(target: "scheduler", ?request, "control request");
        match request {
            ControlRequest::Stop => self.stop(),
            ControlRequest::Trigger { task } => {
                self.trigger_task(&task)?;
            }
            ControlRequest::Enable { task } => self.set_task_enabled(&task, true)?,
            ControlRequest::Disable { task } => self.set_task_enabled(&task, false)?,
            ControlRequest::SetInterval { task, seconds } => {
                self.set_task_interval(&task, Some(seconds))?;
            }
            ControlRequest::ClearInterval { task } => {
                self.set_task_interval(&task, None)?;
            }
            ControlRequest::ResetTasks => self.reset_task_settings()?,
            ControlRequest::Webhook { payload } => {
                let report = self.inner.services.sources.handle_webhook(&payload).await?;
                info!(target: "scheduler", inserted = report.inserted, existing = report.existing, "webhook request ingested");
            }
        }
        Ok(())
    }

    pub(crate) async fn process_control_requests(&self) -> Result<()> {
        let requests = ControlRequest::drain(&self.inner.services.ctx.state)?;
        for request in requests {
            if let Err(e) = self.apply_control(request).await {
                warn!(target: "scheduler", error = %format!("{:#}", e), "control request rejected");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Record liveness and flush it at an interval adapted to write latency.
    pub(crate) fn heartbeat(&self) -> Result<()> {
        let now = self.now();
        let due = {
            let beat = lock(&self.inner.heartbeat);
            beat.last_flush
                .map_or(true, |at| now - at >= Duration::seconds(beat.flush_interval as i64))
        };
        if due {
            let timer = Instant::now();
            self.inner.services.ctx.state.write_heartbeat(now.timestamp())?;
            let elapsed = timer.elapsed();
            let mut beat = lock(&self.inner.heartbeat);
            beat.flush_interval = next_heartbeat_interval(beat.flush_interval, elapsed);
            beat.last_flush = Some(now);
        }
        self.publish_status();
        Ok(())
    }

    pub(crate) async fn regulate_load(&self) {
        let Some(sample) = sample_blocking(self.inner.sampler.clone()).await else {
            return;
        };
        let sleep = self.inner.regulator.observe(sample);
        let now = self.now();
        let entry = PerformanceEntry {
            timestamp: now,
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            inter_task_sleep_seconds: sleep,
            task_share: self.inner.metrics.task_share(now),
        };
        lock(&self.inner.performance).push(entry);
    }

    pub(crate) fn flush_performance_log(&self) -> Result<()> {
        let log = self.performance_log();
        self.inner
            .services
            .ctx
            .state
            .write_json(PERFORMANCE_LOG_FILE, &log)?;
        Ok(())
    }

    /// Slow dynamic jobs down while Scraping, Adding and Checking are empty.
    pub(crate) async fn check_idle_mode(&self) -> Result<()> {
        let queues = &self.inner.services.queues;
        let mut busy = false;
        for queue in IDLE_WATCHED_QUEUES {
            busy |= queues.update(queue).await? > 0;
        }
        let max = self.inner.config.scheduler.idle_multiplier_max.max(1);
        let now = self.now();
        let mut multiplier = lock(&self.inner.idle_multiplier);
        let next = if busy {
            1
        } else {
            multiplier.saturating_mul(2).min(max)
        };
        if next != *multiplier {
            let changed = self.inner.registry.apply_idle_multiplier(next, now);
            if next == 1 {
                info!(target: "scheduler", jobs = changed.len(), "work arrived, leaving idle mode");
                self.inner.wake.notify_one();
            } else {
                info!(target: "scheduler", multiplier = next, jobs = changed.len(), cap = MAX_INTERVAL_SECONDS, "idle, stretching dynamic intervals");
            }
            *multiplier = next;
        }
        Ok(())
    }

    pub fn idle_multiplier(&self) -> u32 {
        *lock(&self.inner.idle_multiplier)
    }
}

fn next_heartbeat_interval(current: u64, write_time: StdDuration) -> u64 {
    if write_time < HEARTBEAT_SLOW_WRITE {
        HEARTBEAT_FLUSH_MIN
    } else {
        current.saturating_mul(2).clamp(HEARTBEAT_FLUSH_MIN, HEARTBEAT_FLUSH_MAX)
    }
}

impl SchedulerControl for Scheduler {
    /// Suspend the debrid-facing tasks and book a one-shot resume.
    fn pause_for_rate_limit(&self, service: &str) {
        if self.is_paused_for(PauseKind::RateLimit) {
            debug!(target: "scheduler", %service, "already paused for rate limit");
            return;
        }
        let minutes = self.inner.config.queue.rate_limit_pause_minutes;
        self.pause_scoped(
            PauseInfo::new(
                PauseKind::RateLimit,
                format!("{} rate limit, pausing for {} minutes", service, minutes),
            )
            .with_service(service)
            .with_status(Some(429)),
            PauseScope::RateLimited,
        );
        let resume_at = self.now() + Duration::minutes(minutes as i64);
        let job_id = format!("rate_limit_resume_{}", Uuid::new_v4());
        self.inner.registry.add_once(
            job_id.clone(),
            "rate_limit_resume",
            Arc::new(RateLimitResumeJob),
            resume_at,
            false,
        );
        info!(target: "scheduler", %job_id, %resume_at, "rate-limit resume booked");
    }

    fn trigger(&self, task: &str) {
        if let Err(e) = self.trigger_task(task) {
            warn!(target: "scheduler", %task, error = %e, "cannot trigger task");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.runner_state())
            .field("jobs", &self.inner.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_heartbeat_writes_keep_the_short_interval() {
        assert_eq!(next_heartbeat_interval(120, StdDuration::from_millis(3)), 30);
    }

    #[test]
    fn slow_heartbeat_writes_back_off_to_the_cap() {
        let slow = StdDuration::from_millis(80);
        let mut interval = HEARTBEAT_FLUSH_MIN;
        let mut seen = Vec::new();
        for _ in 0..5 {
            interval = next_heartbeat_interval(interval, slow);
            seen.push(interval);
        }
        assert_eq!(seen, vec![60, 120, 240, 300, 300]);
    }
}
