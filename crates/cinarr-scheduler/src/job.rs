// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt;

use crate::Scheduler;

/// Represents the execution context for a job
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    /// Catalogue task the job belongs to; equal to `job_id` for recurring jobs.
    pub task: String,
    pub execution_time: DateTime<Utc>,
    /// Handle back to the scheduler running the job.
    pub scheduler: Scheduler,
}

impl JobContext {
    pub fn new(
        job_id: impl Into<String>,
        task: impl Into<String>,
        execution_time: DateTime<Utc>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task: task.into(),
            execution_time,
            scheduler,
        }
    }
}

/// Job execution result with optional retry information
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    Failure { error: String, retry: bool },
}

/// Core trait for all scheduled tasks
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    /// Unique identifier for this job type
    fn job_type(&self) -> &'static str;

    /// Human-readable job name
    fn name(&self) -> String;

    /// Execute the job with given context
    async fn execute(&self, ctx: JobContext) -> Result<JobResult>;

    /// Whether a failed run is retried ahead of the next interval
    fn is_retriable(&self) -> bool {
        false
    }

    /// Consecutive early retries before falling back to the interval
    fn max_retries(&self) -> u32 {
        3
    }

    /// Delay in seconds before an early retry
    fn retry_delay_seconds(&self) -> u64 {
        60
    }
}

impl fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("type", &self.job_type())
            .field("name", &self.name())
            .finish()
    }
}
