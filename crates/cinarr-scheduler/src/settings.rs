// SPDX-License-Identifier: GPL-3.0-or-later
//! Persisted per-task toggles and custom intervals.

use std::sync::Arc;

use cinarr_application::QueueName;
use cinarr_infrastructure::state_files::{
    StateDir, StateFileError, TaskIntervals, TaskToggles, TASK_INTERVALS_FILE, TASK_TOGGLES_FILE,
    TASK_TOGGLES_MIGRATION_VERSION,
};
use tracing::info;

#[derive(Debug, Clone)]
pub struct TaskSettings {
    state: Arc<StateDir>,
}

impl TaskSettings {
    pub fn new(state: Arc<StateDir>) -> Self {
        Self { state }
    }

    /// Current toggles, migrated and written back when the file is older
    /// than this build.
    pub fn toggles(&self) -> Result<TaskToggles, StateFileError> {
        let stored: TaskToggles = self.state.read_or_default(TASK_TOGGLES_FILE);
        let (toggles, migrated) = migrate_toggles(stored);
        if migrated {
            info!(target: "scheduler", version = toggles.migration_version, "task toggles migrated");
            self.state.write_json(TASK_TOGGLES_FILE, &toggles)?;
        }
        Ok(toggles)
    }

    pub fn intervals(&self) -> TaskIntervals {
        self.state.read_or_default(TASK_INTERVALS_FILE)
    }

    pub fn save_toggle(&self, task: &str, enabled: bool) -> Result<(), StateFileError> {
        let mut toggles = self.toggles()?;
        toggles.toggles.insert(task.to_string(), enabled);
        self.state.write_json(TASK_TOGGLES_FILE, &toggles)
    }

    /// Persist a custom interval. Clearing it, or saving the task's default,
    /// removes the key so the default applies again.
    pub fn save_interval(
        &self,
        task: &str,
        seconds: Option<u64>,
        default: Option<u64>,
    ) -> Result<(), StateFileError> {
        let mut intervals = self.intervals();
        match seconds.filter(|secs| Some(*secs) != default) {
            Some(secs) => {
                intervals.0.insert(task.to_string(), secs);
            }
            None => {
                intervals.0.remove(task);
            }
        }
        self.state.write_json(TASK_INTERVALS_FILE, &intervals)
    }

    /// Forget every toggle and custom interval.
    pub fn reset(&self) -> Result<(), StateFileError> {
        self.state.remove(TASK_TOGGLES_FILE)?;
        self.state.remove(TASK_INTERVALS_FILE)?;
        info!(target: "scheduler", "task settings reset");
        Ok(())
    }
}

/// Bring a toggles document up to the current layout. Version 0 keyed queue
/// tasks by their queue name ("Wanted", "Final_Check").
pub fn migrate_toggles(mut toggles: TaskToggles) -> (TaskToggles, bool) {
    if toggles.migration_version >= TASK_TOGGLES_MIGRATION_VERSION {
        return (toggles, false);
    }
    for queue in QueueName::ALL {
        if let Some(enabled) = toggles.toggles.remove(&queue.to_string()) {
            toggles.toggles.insert(queue.task_name().to_string(), enabled);
        }
    }
    toggles.migration_version = TASK_TOGGLES_MIGRATION_VERSION;
    (toggles, true)
}
