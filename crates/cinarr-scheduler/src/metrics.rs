// SPDX-License-Identifier: GPL-3.0-or-later
//! Per-task execution accounting for the status view and performance log.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use cinarr_config::SchedulerConfig;
use tracing::{debug, warn};

/// Window over which each task's share of active time is reported.
pub const SHARE_WINDOW_SECONDS: i64 = 5 * 60;
/// Memory growth across one sampled run worth a warning.
pub const MEMORY_DELTA_WARN_BYTES: i64 = 1024 * 1024;

#[derive(Debug, Clone)]
struct Execution {
    finished_at: DateTime<Utc>,
    task: String,
    duration: StdDuration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!(target: "scheduler", "metrics lock poisoned, recovering");
        poisoned.into_inner()
    })
}

pub struct ExecutionMetrics {
    history: Mutex<VecDeque<Execution>>,
    executing: Mutex<BTreeSet<String>>,
    invocations: Mutex<HashMap<String, u64>>,
    memory_sample_every: Option<u32>,
}

impl ExecutionMetrics {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
            executing: Mutex::new(BTreeSet::new()),
            invocations: Mutex::new(HashMap::new()),
            memory_sample_every: config
                .memory_sampling
                .then_some(config.memory_sample_every.max(1)),
        }
    }

    /// Mark `job_id` as running. Returns true when this invocation of `task`
    /// should be bracketed by memory samples.
    pub fn begin(&self, job_id: &str, task: &str) -> bool {
        lock(&self.executing).insert(job_id.to_string());
        let mut invocations = lock(&self.invocations);
        let count = invocations.entry(task.to_string()).or_insert(0);
        *count += 1;
        self.memory_sample_every
            .is_some_and(|every| *count % u64::from(every) == 0)
    }

    pub fn finish(&self, job_id: &str, task: &str, finished_at: DateTime<Utc>, duration: StdDuration) {
        lock(&self.executing).remove(job_id);
        let mut history = lock(&self.history);
        history.push_back(Execution {
            finished_at,
            task: task.to_string(),
            duration,
        });
        prune(&mut history, finished_at);
    }

    pub fn currently_executing(&self) -> Vec<String> {
        lock(&self.executing).iter().cloned().collect()
    }

    pub fn invocations(&self, task: &str) -> u64 {
        lock(&self.invocations).get(task).copied().unwrap_or(0)
    }

    /// Percent of active time each task took over the last window.
    pub fn task_share(&self, now: DateTime<Utc>) -> BTreeMap<String, f64> {
        let mut history = lock(&self.history);
        prune(&mut history, now);
        let mut per_task: BTreeMap<String, f64> = BTreeMap::new();
        for execution in history.iter() {
            *per_task.entry(execution.task.clone()).or_default() += execution.duration.as_secs_f64();
        }
        let total: f64 = per_task.values().sum();
        if total <= 0.0 {
            return BTreeMap::new();
        }
        per_task
            .into_iter()
            .map(|(task, secs)| (task, secs / total * 100.0))
            .collect()
    }

    /// Log the memory movement of a sampled run.
    pub fn record_memory(&self, task: &str, before: u64, after: u64) -> i64 {
        let delta = after as i64 - before as i64;
        if delta > MEMORY_DELTA_WARN_BYTES {
            warn!(target: "scheduler", %task, before, after, delta, "task grew process memory");
        } else {
            debug!(target: "scheduler", %task, before, after, delta, "memory sample");
        }
        delta
    }
}

fn prune(history: &mut VecDeque<Execution>, now: DateTime<Utc>) {
    let horizon = now - Duration::seconds(SHARE_WINDOW_SECONDS);
    while history.front().is_some_and(|e| e.finished_at < horizon) {
        history.pop_front();
    }
}
