// SPDX-License-Identifier: GPL-3.0-or-later
//! Files shared between the running service and the control commands:
//! an inbox of requests and a status snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cinarr_infrastructure::state_files::{
    StateDir, StateFileError, CONTROL_REQUESTS_FILE, RUNNER_STATUS_FILE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pause::PauseInfo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    Stop,
    Trigger { task: String },
    Enable { task: String },
    Disable { task: String },
    SetInterval { task: String, seconds: u64 },
    ClearInterval { task: String },
    ResetTasks,
    /// Overseerr-shaped request payload.
    Webhook { payload: Value },
}

impl ControlRequest {
    pub fn submit(&self, state: &StateDir) -> Result<(), StateFileError> {
        state.append_json(CONTROL_REQUESTS_FILE, self.clone())
    }

    /// Claim every pending request.
    pub fn drain(state: &StateDir) -> Result<Vec<ControlRequest>, StateFileError> {
        Ok(state.take_json(CONTROL_REQUESTS_FILE)?.unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl RunnerState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerState::Initializing => "initializing",
            RunnerState::Running => "running",
            RunnerState::Stopping => "stopping",
            RunnerState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub state: RunnerState,
    pub pause_info: Option<PauseInfo>,
    pub currently_executing: Vec<String>,
    pub paused_jobs: Vec<String>,
    #[serde(default)]
    pub queue_sizes: BTreeMap<String, usize>,
    #[serde(default)]
    pub inter_task_sleep_seconds: f64,
    pub updated_at: DateTime<Utc>,
}

impl RunnerStatus {
    pub fn read(state: &StateDir) -> Result<Option<RunnerStatus>, StateFileError> {
        state.read_json(RUNNER_STATUS_FILE)
    }

    pub fn write(&self, state: &StateDir) -> Result<(), StateFileError> {
        state.write_json(RUNNER_STATUS_FILE, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_accumulate_until_drained() {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateDir::new(tmp.path()).unwrap();
        ControlRequest::Trigger { task: "queue_wanted".into() }.submit(&state).unwrap();
        ControlRequest::SetInterval {
            task: "queue_wanted".into(),
            seconds: 10,
        }
        .submit(&state)
        .unwrap();

        let raw = std::fs::read_to_string(state.path(CONTROL_REQUESTS_FILE)).unwrap();
        assert!(raw.contains("\"action\": \"set_interval\""));

        let drained = ControlRequest::drain(&state).unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], ControlRequest::Trigger { task: "queue_wanted".into() });
        assert!(ControlRequest::drain(&state).unwrap().is_empty());
    }

    #[test]
    fn status_round_trips_through_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateDir::new(tmp.path()).unwrap();
        assert!(RunnerStatus::read(&state).unwrap().is_none());

        let status = RunnerStatus {
            state: RunnerState::Running,
            pause_info: None,
            currently_executing: vec!["queue_scraping".into()],
            paused_jobs: Vec::new(),
            queue_sizes: BTreeMap::new(),
            inter_task_sleep_seconds: 0.0,
            updated_at: Utc::now(),
        };
        status.write(&state).unwrap();
        assert_eq!(RunnerStatus::read(&state).unwrap(), Some(status));
    }
}
