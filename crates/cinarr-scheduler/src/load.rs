// SPDX-License-Identifier: GPL-3.0-or-later
//! Host load sampling and the inter-task sleep it drives.

use std::sync::{Arc, Mutex};

use cinarr_config::SchedulerConfig;
use sysinfo::{Process, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Source of host and process measurements. Calls may block.
pub trait LoadSampler: Send + Sync {
    fn sample(&self) -> LoadSample;
    /// Resident memory of this process in bytes.
    fn process_memory(&self) -> Option<u64>;
}

/// [`LoadSampler`] reading the live system through `sysinfo`.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_with_specifics(RefreshKind::nothing())),
        }
    }

    fn system(&self) -> std::sync::MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(|poisoned| {
            warn!(target: "scheduler", "sysinfo lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SysinfoSampler {
    /// CPU usage is measured between consecutive calls; the first one reads 0.
    fn sample(&self) -> LoadSample {
        let mut system = self.system();
        system.refresh_cpu_usage();
        system.refresh_memory();
        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        };
        LoadSample {
            cpu_percent: system.global_cpu_usage(),
            memory_percent,
        }
    }

    fn process_memory(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(Process::memory)
    }
}

/// Take a sample off the async worker.
pub async fn sample_blocking(sampler: Arc<dyn LoadSampler>) -> Option<LoadSample> {
    match tokio::task::spawn_blocking(move || sampler.sample()).await {
        Ok(sample) => Some(sample),
        Err(e) => {
            debug!(target: "scheduler", error = %e, "load probe join failed");
            None
        }
    }
}

pub async fn process_memory_blocking(sampler: Arc<dyn LoadSampler>) -> Option<u64> {
    tokio::task::spawn_blocking(move || sampler.process_memory())
        .await
        .ok()
        .flatten()
}

/// Additive back-off of the pause between two tasks.
pub struct LoadRegulator {
    cpu_threshold: f32,
    ram_threshold: f32,
    step: f64,
    cap: f64,
    base: f64,
    current: Mutex<f64>,
}

impl LoadRegulator {
    /// Starts at `base_sleep` on every program start.
    pub fn new(config: &SchedulerConfig, base_sleep: f64) -> Self {
        let base = base_sleep.max(0.0);
        Self {
            cpu_threshold: config.cpu_threshold_percent,
            ram_threshold: config.ram_threshold_percent,
            step: config.load_sleep_step_seconds.max(0.0),
            cap: config.load_sleep_cap_seconds.max(base),
            base,
            current: Mutex::new(base),
        }
    }

    fn current_guard(&self) -> std::sync::MutexGuard<'_, f64> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current_sleep(&self) -> f64 {
        *self.current_guard()
    }

    pub fn base_sleep(&self) -> f64 {
        self.base
    }

    /// Grow the sleep by one step while either threshold is exceeded,
    /// shrink it back towards the base otherwise.
    pub fn observe(&self, sample: LoadSample) -> f64 {
        let overloaded =
            sample.cpu_percent > self.cpu_threshold || sample.memory_percent > self.ram_threshold;
        let mut current = self.current_guard();
        let previous = *current;
        *current = if overloaded {
            (previous + self.step).min(self.cap)
        } else {
            (previous - self.step).max(self.base)
        };
        if *current != previous {
            info!(
                target: "scheduler",
                cpu = sample.cpu_percent,
                memory = sample.memory_percent,
                sleep = *current,
                "inter-task sleep adjusted"
            );
        }
        *current
    }
}
