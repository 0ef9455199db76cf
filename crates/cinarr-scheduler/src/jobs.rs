// SPDX-License-Identifier: GPL-3.0-or-later
//! The task catalogue: one job per processing queue, one per content source,
//! and the maintenance jobs that keep the pipeline healthy.

use std::sync::Arc;

use anyhow::Result;
use cinarr_application::{
    ConnectivityProbe, ContentSourceDriver, LibraryVerifier, Maintenance, PipelineContext,
    QueueManager, QueueName, Reconciler,
};
use cinarr_config::{AppConfig, FileManagementMode};
use tracing::{debug, info, warn};

use crate::job::{Job, JobContext, JobResult};
use crate::pause::PauseKind;
use crate::registry::JobTraits;

/// Application services the jobs drive.
pub struct Services {
    pub ctx: PipelineContext,
    pub queues: Arc<QueueManager>,
    pub verifier: Arc<LibraryVerifier>,
    pub reconciler: Arc<Reconciler>,
    pub maintenance: Arc<Maintenance>,
    pub sources: Arc<ContentSourceDriver>,
    pub probe: Option<Arc<dyn ConnectivityProbe>>,
}

impl Services {
    pub fn new(ctx: PipelineContext, sources: ContentSourceDriver) -> Self {
        let verifier = Arc::new(LibraryVerifier::new(ctx.clone()));
        let queues = Arc::new(QueueManager::new(ctx.clone(), verifier.clone()));
        Self {
            reconciler: Arc::new(Reconciler::new(queues.clone())),
            queues,
            maintenance: Arc::new(Maintenance::new(ctx.clone())),
            sources: Arc::new(sources),
            verifier,
            probe: None,
            ctx,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

/// Default interval of a queue task in seconds.
pub fn queue_interval(queue: QueueName) -> u64 {
    match queue {
        QueueName::Wanted => 5,
        QueueName::Scraping | QueueName::Adding => 1,
        QueueName::Checking => 300,
        QueueName::Sleeping | QueueName::FinalCheck => 900,
        QueueName::Unreleased
        | QueueName::Blacklisted
        | QueueName::PendingUncached
        | QueueName::Upgrading => 3600,
        QueueName::Collected => 24 * 60 * 60,
    }
}

/// Queues that keep their pace in idle mode; their emptiness is what
/// idle mode watches.
pub const IDLE_WATCHED_QUEUES: [QueueName; 3] =
    [QueueName::Scraping, QueueName::Adding, QueueName::Checking];

pub const CONTENT_SOURCE_INTERVAL_SECONDS: u64 = 60 * 60;

/// Tasks suspended while the debrid provider is rate limiting us.
pub fn is_rate_limited_task(task: &str) -> bool {
    let queue_task = [
        QueueName::Wanted,
        QueueName::Scraping,
        QueueName::Adding,
        QueueName::Checking,
        QueueName::Upgrading,
        QueueName::PendingUncached,
    ]
    .iter()
    .any(|q| q.task_name() == task);
    queue_task || is_content_source_task(task)
}

pub fn is_content_source_task(task: &str) -> bool {
    task.starts_with("task_") && task.ends_with("_wanted")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MaintenanceTask {
    Heartbeat,
    CheckConnectivity,
    ReconcileQueues,
    UpdateQueueViews,
    RefreshShowStatus,
    RefreshReleaseDates,
    ProcessRemovalCache,
    VerifyRemovals,
    VerifySymlinks,
    ProcessCollectedNotifications,
    RegulateLoad,
    CheckIdleMode,
    CheckScheduledPause,
    FailSafeWatchdog,
    CheckDbHealth,
    ProcessControlRequests,
    FlushPerformanceLog,
}

impl MaintenanceTask {
    pub const ALL: [MaintenanceTask; 17] = [
        MaintenanceTask::Heartbeat,
        MaintenanceTask::CheckConnectivity,
        MaintenanceTask::ReconcileQueues,
        MaintenanceTask::UpdateQueueViews,
        MaintenanceTask::RefreshShowStatus,
        MaintenanceTask::RefreshReleaseDates,
        MaintenanceTask::ProcessRemovalCache,
        MaintenanceTask::VerifyRemovals,
        MaintenanceTask::VerifySymlinks,
        MaintenanceTask::ProcessCollectedNotifications,
        MaintenanceTask::RegulateLoad,
        MaintenanceTask::CheckIdleMode,
        MaintenanceTask::CheckScheduledPause,
        MaintenanceTask::FailSafeWatchdog,
        MaintenanceTask::CheckDbHealth,
        MaintenanceTask::ProcessControlRequests,
        MaintenanceTask::FlushPerformanceLog,
    ];

    pub fn task_name(self) -> &'static str {
        match self {
            MaintenanceTask::Heartbeat => "task_heartbeat",
            MaintenanceTask::CheckConnectivity => "task_check_connectivity",
            MaintenanceTask::ReconcileQueues => "task_reconcile_queues",
            MaintenanceTask::UpdateQueueViews => "task_update_queue_views",
            MaintenanceTask::RefreshShowStatus => "task_refresh_show_status",
            MaintenanceTask::RefreshReleaseDates => "task_refresh_release_dates",
            MaintenanceTask::ProcessRemovalCache => "task_process_removal_cache",
            MaintenanceTask::VerifyRemovals => "task_verify_removals",
            MaintenanceTask::VerifySymlinks => "task_verify_symlinks",
            MaintenanceTask::ProcessCollectedNotifications => "task_process_collected_notifications",
            MaintenanceTask::RegulateLoad => "task_regulate_load",
            MaintenanceTask::CheckIdleMode => "task_check_idle_mode",
            MaintenanceTask::CheckScheduledPause => "task_check_scheduled_pause",
            MaintenanceTask::FailSafeWatchdog => "task_fail_safe_watchdog",
            MaintenanceTask::CheckDbHealth => "task_check_db_health",
            MaintenanceTask::ProcessControlRequests => "task_process_control_requests",
            MaintenanceTask::FlushPerformanceLog => "task_flush_performance_log",
        }
    }

    pub fn from_task_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.task_name() == name)
    }

    pub fn default_interval(self) -> u64 {
        match self {
            MaintenanceTask::Heartbeat | MaintenanceTask::RegulateLoad => 30,
            MaintenanceTask::UpdateQueueViews => 30,
            MaintenanceTask::ProcessControlRequests => 5,
            MaintenanceTask::CheckConnectivity
            | MaintenanceTask::CheckIdleMode
            | MaintenanceTask::CheckScheduledPause
            | MaintenanceTask::FailSafeWatchdog => 60,
            MaintenanceTask::ProcessCollectedNotifications | MaintenanceTask::FlushPerformanceLog => 300,
            MaintenanceTask::VerifySymlinks => 900,
            MaintenanceTask::ReconcileQueues
            | MaintenanceTask::ProcessRemovalCache
            | MaintenanceTask::CheckDbHealth => 60 * 60,
            MaintenanceTask::RefreshShowStatus | MaintenanceTask::VerifyRemovals => 6 * 60 * 60,
            MaintenanceTask::RefreshReleaseDates => 12 * 60 * 60,
        }
    }

    fn dynamic(self) -> bool {
        matches!(
            self,
            MaintenanceTask::RefreshShowStatus
                | MaintenanceTask::RefreshReleaseDates
                | MaintenanceTask::VerifySymlinks
        )
    }

    fn enabled_by_default(self, config: &AppConfig) -> bool {
        match self {
            MaintenanceTask::VerifySymlinks => {
                config.file_management.mode == FileManagementMode::Symlink
            }
            _ => true,
        }
    }
}

/// One row of the task catalogue.
pub struct TaskEntry {
    pub task: String,
    pub job: Arc<dyn Job>,
    pub default_interval: u64,
    pub traits: JobTraits,
}

/// Default interval of a catalogue task, known without building the catalogue.
pub fn default_interval_for(task: &str) -> Option<u64> {
    if let Some(queue) = QueueName::from_task_name(task).filter(|q| q.is_processed()) {
        return Some(queue_interval(queue));
    }
    if let Some(task) = MaintenanceTask::from_task_name(task) {
        return Some(task.default_interval());
    }
    is_content_source_task(task).then_some(CONTENT_SOURCE_INTERVAL_SECONDS)
}

/// Every recurring task of a scheduler built over `services`.
pub fn catalogue(config: &AppConfig, services: &Arc<Services>) -> Vec<TaskEntry> {
    let mut entries = Vec::new();

    for queue in QueueName::ALL.into_iter().filter(|q| q.is_processed()) {
        entries.push(TaskEntry {
            task: queue.task_name().to_string(),
            job: Arc::new(QueueJob::new(queue, services.clone())),
            default_interval: queue_interval(queue),
            traits: JobTraits {
                dynamic: !IDLE_WATCHED_QUEUES.contains(&queue),
                ..JobTraits::default()
            },
        });
    }

    for source_id in services.sources.source_ids() {
        entries.push(TaskEntry {
            task: ContentSourceDriver::task_name(&source_id),
            job: Arc::new(ContentSourceJob::new(source_id, services.clone())),
            default_interval: CONTENT_SOURCE_INTERVAL_SECONDS,
            traits: JobTraits {
                dynamic: true,
                ..JobTraits::default()
            },
        });
    }

    for task in MaintenanceTask::ALL {
        entries.push(TaskEntry {
            task: task.task_name().to_string(),
            job: Arc::new(MaintenanceJob::new(task, services.clone())),
            default_interval: task.default_interval(),
            traits: JobTraits {
                dynamic: task.dynamic(),
                pausable: true,
                enabled: task.enabled_by_default(config),
            },
        });
    }

    entries
}

/// Runs one pass of a queue's rule.
pub struct QueueJob {
    queue: QueueName,
    services: Arc<Services>,
}

impl QueueJob {
    pub fn new(queue: QueueName, services: Arc<Services>) -> Self {
        Self { queue, services }
    }
}

#[async_trait::async_trait]
impl Job for QueueJob {
    fn job_type(&self) -> &'static str {
        "queue"
    }

    fn name(&self) -> String {
        format!("Process {} queue", self.queue)
    }

    async fn execute(&self, ctx: JobContext) -> Result<JobResult> {
        let report = self.services.queues.process(self.queue, &ctx.scheduler).await?;
        if report.failed > 0 {
            debug!(target: "jobs", queue = %self.queue, failed = report.failed, "queue pass isolated failures");
        }
        Ok(JobResult::Success)
    }
}

/// Polls one content source for wanted items.
pub struct ContentSourceJob {
    source_id: String,
    services: Arc<Services>,
}

impl ContentSourceJob {
    pub fn new(source_id: impl Into<String>, services: Arc<Services>) -> Self {
        Self {
            source_id: source_id.into(),
            services,
        }
    }
}

#[async_trait::async_trait]
impl Job for ContentSourceJob {
    fn job_type(&self) -> &'static str {
        "content_source"
    }

    fn name(&self) -> String {
        format!("Fetch wanted items from {}", self.source_id)
    }

    async fn execute(&self, _ctx: JobContext) -> Result<JobResult> {
        match self.services.sources.run(&self.source_id).await {
            Ok(report) => {
                info!(
                    target: "jobs",
                    source = %self.source_id,
                    fetched = report.fetched,
                    inserted = report.inserted,
                    existing = report.existing,
                    skipped = report.skipped_cached + report.skipped_filtered,
                    "content source polled"
                );
                Ok(JobResult::Success)
            }
            Err(e) => Ok(JobResult::Failure {
                error: format!("{:#}", e),
                retry: true,
            }),
        }
    }

    fn is_retriable(&self) -> bool {
        true
    }

    fn max_retries(&self) -> u32 {
        2
    }

    fn retry_delay_seconds(&self) -> u64 {
        300
    }
}

pub struct MaintenanceJob {
    task: MaintenanceTask,
    services: Arc<Services>,
}

impl MaintenanceJob {
    pub fn new(task: MaintenanceTask, services: Arc<Services>) -> Self {
        Self { task, services }
    }
}

#[async_trait::async_trait]
impl Job for MaintenanceJob {
    fn job_type(&self) -> &'static str {
        "maintenance"
    }

    fn name(&self) -> String {
        self.task.task_name().to_string()
    }

    async fn execute(&self, ctx: JobContext) -> Result<JobResult> {
        let scheduler = &ctx.scheduler;
        match self.task {
            MaintenanceTask::Heartbeat => scheduler.heartbeat()?,
            MaintenanceTask::CheckConnectivity => {
                let Some(probe) = &self.services.probe else {
                    return Ok(JobResult::Success);
                };
                if let Err(e) = probe.check().await {
                    scheduler.connectivity_failed(&ctx.task, &e);
                    return Ok(JobResult::Failure {
                        error: e.to_string(),
                        retry: false,
                    });
                }
                scheduler.resume_if(PauseKind::is_connectivity);
            }
            MaintenanceTask::ReconcileQueues => {
                let report = self.services.reconciler.run().await?;
                if !report.is_empty() {
                    self.services.queues.update_all().await?;
                }
            }
            MaintenanceTask::UpdateQueueViews => self.services.queues.update_all().await?,
            MaintenanceTask::RefreshShowStatus => {
                let shows = self.services.maintenance.refresh_show_status().await?;
                debug!(target: "jobs", shows, "show status refreshed");
            }
            MaintenanceTask::RefreshReleaseDates => {
                let changed = self.services.maintenance.refresh_release_dates().await?;
                debug!(target: "jobs", changed, "release dates refreshed");
            }
            MaintenanceTask::ProcessRemovalCache => {
                let report = self.services.verifier.process_removal_cache().await?;
                debug!(target: "jobs", removed = report.removed, skipped = report.skipped, deferred = report.deferred, "removal cache processed");
            }
            MaintenanceTask::VerifyRemovals => {
                let (verified, failed) = self.services.verifier.verify_removals().await?;
                debug!(target: "jobs", verified, failed, "removals verified");
            }
            MaintenanceTask::VerifySymlinks => {
                let promoted = self.services.verifier.verify_symlinks().await?;
                if promoted > 0 {
                    self.services.queues.update_all().await?;
                }
            }
            MaintenanceTask::ProcessCollectedNotifications => {
                if let Err(e) = self.services.maintenance.process_collected_notifications().await {
                    return Ok(JobResult::Failure {
                        error: format!("{:#}", e),
                        retry: false,
                    });
                }
            }
            MaintenanceTask::RegulateLoad => scheduler.regulate_load().await,
            MaintenanceTask::CheckIdleMode => scheduler.check_idle_mode().await?,
            MaintenanceTask::CheckScheduledPause => scheduler.check_scheduled_pause(),
            MaintenanceTask::FailSafeWatchdog => scheduler.fail_safe_watchdog(),
            MaintenanceTask::CheckDbHealth => {
                let healthy = match self.services.ctx.repos.items.health_check().await {
                    Ok(healthy) => healthy,
                    Err(e) => {
                        warn!(target: "jobs", error = %e, "database health probe errored");
                        false
                    }
                };
                scheduler.database_health(healthy);
            }
            MaintenanceTask::ProcessControlRequests => scheduler.process_control_requests().await?,
            MaintenanceTask::FlushPerformanceLog => scheduler.flush_performance_log()?,
        }
        Ok(JobResult::Success)
    }
}

/// One-shot job lifting a rate-limit pause.
pub struct RateLimitResumeJob;

#[async_trait::async_trait]
impl Job for RateLimitResumeJob {
    fn job_type(&self) -> &'static str {
        "resume"
    }

    fn name(&self) -> String {
        "Resume after rate limit".into()
    }

    async fn execute(&self, ctx: JobContext) -> Result<JobResult> {
        ctx.scheduler.resume_if(|kind| kind == PauseKind::RateLimit);
        Ok(JobResult::Success)
    }
}
