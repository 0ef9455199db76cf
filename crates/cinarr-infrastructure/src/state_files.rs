// SPDX-License-Identifier: GPL-3.0-or-later
//! Small JSON documents kept next to the database: task settings, caches,
//! notification inboxes. Every write goes to a temp file first and is renamed
//! into place.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cinarr_domain::ItemCollectedPayload;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const TASK_TOGGLES_FILE: &str = "task_toggles.json";
pub const TASK_INTERVALS_FILE: &str = "task_intervals.json";
pub const PRE_RELEASE_FILE: &str = "pre_release_data.json";
pub const REMOVAL_CACHE_FILE: &str = "plex_removal_cache.json";
pub const COLLECTED_NOTIFICATIONS_FILE: &str = "collected_notifications.json";
pub const HEARTBEAT_FILE: &str = "program_heartbeat";
pub const PERFORMANCE_LOG_FILE: &str = "performance_log.json";
pub const RUNNER_STATUS_FILE: &str = "runner_status.json";
pub const CONTROL_REQUESTS_FILE: &str = "control_requests.json";
pub const SOURCE_CACHE_DIR: &str = "source_cache";

/// Current layout of `task_toggles.json`.
pub const TASK_TOGGLES_MIGRATION_VERSION: u32 = 1;

pub const PERFORMANCE_LOG_CAPACITY: usize = 1440;

#[derive(Debug, Error)]
pub enum StateFileError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StateFileError + '_ {
    move |source| StateFileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Root directory of the persisted state files.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StateFileError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Returns `None` when the file does not exist.
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StateFileError> {
        let path = self.path(name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StateFileError::Json { path, source })
    }

    /// Like [`read_json`](Self::read_json) but a missing or corrupt file yields the default.
    pub fn read_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        match self.read_json(name) {
            Ok(Some(v)) => v,
            Ok(None) => T::default(),
            Err(e) => {
                warn!(target: "infrastructure", error = %e, "discarding unreadable state file");
                T::default()
            }
        }
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StateFileError> {
        let path = self.path(name);
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StateFileError::Json {
            path: path.clone(),
            source,
        })?;
        self.write_atomic(&path, &bytes)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StateFileError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        {
            let mut file = fs::File::create(&tmp).map_err(io_err(&tmp))?;
            file.write_all(bytes).map_err(io_err(&tmp))?;
            file.sync_all().map_err(io_err(&tmp))?;
        }
        fs::rename(&tmp, path).map_err(io_err(path))?;
        debug!(target: "infrastructure", path = %path.display(), "state file written");
        Ok(())
    }

    /// Atomically claim a file by renaming it aside, then read and delete it.
    /// Writers that append after the rename start a fresh file.
    pub fn take_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StateFileError> {
        let path = self.path(name);
        let claimed = path.with_extension("processing");
        match fs::rename(&path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        }
        let bytes = fs::read(&claimed).map_err(io_err(&claimed))?;
        let parsed = serde_json::from_slice(&bytes);
        fs::remove_file(&claimed).map_err(io_err(&claimed))?;
        parsed
            .map(Some)
            .map_err(|source| StateFileError::Json { path, source })
    }

    /// Read-modify-write append to a JSON array file.
    pub fn append_json<T: Serialize + DeserializeOwned>(
        &self,
        name: &str,
        value: T,
    ) -> Result<(), StateFileError> {
        let mut list: Vec<T> = self.read_json(name)?.unwrap_or_default();
        list.push(value);
        self.write_json(name, &list)
    }

    pub fn remove(&self, name: &str) -> Result<bool, StateFileError> {
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    pub fn write_heartbeat(&self, epoch: i64) -> Result<(), StateFileError> {
        let path = self.path(HEARTBEAT_FILE);
        self.write_atomic(&path, epoch.to_string().as_bytes())
    }

    pub fn read_heartbeat(&self) -> Result<Option<i64>, StateFileError> {
        let path = self.path(HEARTBEAT_FILE);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(s.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    pub fn source_cache_name(source_id: &str) -> String {
        format!("{}/{}.json", SOURCE_CACHE_DIR, source_id)
    }
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskToggles {
    #[serde(default)]
    pub migration_version: u32,
    #[serde(flatten)]
    pub toggles: BTreeMap<String, bool>,
}

impl Default for TaskToggles {
    fn default() -> Self {
        Self {
            migration_version: TASK_TOGGLES_MIGRATION_VERSION,
            toggles: BTreeMap::new(),
        }
    }
}

/// `task name -> seconds`; a missing key means the default interval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskIntervals(pub BTreeMap<String, u64>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreReleaseEntry {
    pub scrape_count: u32,
    pub last_scrape: DateTime<Utc>,
}

/// Keyed by item id.
pub type PreReleaseData = BTreeMap<String, PreReleaseEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalCacheEntry {
    pub title: String,
    pub path: String,
    pub episode_title: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Keyed by on-disk path.
pub type RemovalCache = BTreeMap<String, Vec<RemovalCacheEntry>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedNotification {
    #[serde(flatten)]
    pub payload: ItemCollectedPayload,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceEntry {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub inter_task_sleep_seconds: f64,
    /// Share of active time per task over the sampling window, in percent.
    pub task_share: BTreeMap<String, f64>,
}

/// Ring buffer persisted to `performance_log.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerformanceLog(pub VecDeque<PerformanceEntry>);

impl PerformanceLog {
    pub fn push(&mut self, entry: PerformanceEntry) {
        while self.0.len() >= PERFORMANCE_LOG_CAPACITY {
            self.0.pop_front();
        }
        self.0.push_back(entry);
    }
}

/// External ids a content source has already turned into items, with the
/// time each was last processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCache {
    pub seen: BTreeMap<String, DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SourceCache {
    /// True when `key` was processed less than `ttl` before `now`.
    pub fn is_fresh(&self, key: &str, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.seen.get(key).is_some_and(|at| now - *at < ttl)
    }

    pub fn mark(&mut self, key: impl Into<String>, now: DateTime<Utc>) {
        self.seen.insert(key.into(), now);
        self.updated_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinarr_domain::{Item, ItemId};

    fn dir() -> (tempfile::TempDir, StateDir) {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateDir::new(tmp.path()).unwrap();
        (tmp, state)
    }

    #[test]
    fn missing_file_reads_as_none() {
        let (_tmp, state) = dir();
        let v: Option<TaskIntervals> = state.read_json(TASK_INTERVALS_FILE).unwrap();
        assert!(v.is_none());
        let d: TaskIntervals = state.read_or_default(TASK_INTERVALS_FILE);
        assert!(d.0.is_empty());
    }

    #[test]
    fn toggles_keep_migration_version_next_to_task_names() {
        let (_tmp, state) = dir();
        let mut toggles = TaskToggles::default();
        toggles.toggles.insert("queue_wanted".into(), false);
        state.write_json(TASK_TOGGLES_FILE, &toggles).unwrap();

        let raw = std::fs::read_to_string(state.path(TASK_TOGGLES_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["migration_version"], 1);
        assert_eq!(json["queue_wanted"], false);

        let back: TaskToggles = state.read_json(TASK_TOGGLES_FILE).unwrap().unwrap();
        assert_eq!(back, toggles);
    }

    #[test]
    fn take_json_claims_the_file() {
        let (_tmp, state) = dir();
        let item = Item::new_movie("Film", "tt1", 2020);
        let note = CollectedNotification {
            payload: ItemCollectedPayload::from_item(&item, false),
            collected_at: Utc::now(),
        };
        state.append_json(COLLECTED_NOTIFICATIONS_FILE, note.clone()).unwrap();
        state.append_json(COLLECTED_NOTIFICATIONS_FILE, note).unwrap();

        let drained: Vec<CollectedNotification> =
            state.take_json(COLLECTED_NOTIFICATIONS_FILE).unwrap().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload.item_id, ItemId::UNSAVED);
        assert!(!state.path(COLLECTED_NOTIFICATIONS_FILE).exists());
        let again: Option<Vec<CollectedNotification>> =
            state.take_json(COLLECTED_NOTIFICATIONS_FILE).unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn corrupt_file_is_an_error_but_defaults_on_lenient_read() {
        let (_tmp, state) = dir();
        std::fs::write(state.path(PRE_RELEASE_FILE), b"{not json").unwrap();
        assert!(matches!(
            state.read_json::<PreReleaseData>(PRE_RELEASE_FILE),
            Err(StateFileError::Json { .. })
        ));
        let data: PreReleaseData = state.read_or_default(PRE_RELEASE_FILE);
        assert!(data.is_empty());
    }

    #[test]
    fn heartbeat_round_trip() {
        let (_tmp, state) = dir();
        assert_eq!(state.read_heartbeat().unwrap(), None);
        state.write_heartbeat(1_700_000_000).unwrap();
        assert_eq!(state.read_heartbeat().unwrap(), Some(1_700_000_000));
    }

    #[test]
    fn performance_log_is_bounded() {
        let mut log = PerformanceLog::default();
        for _ in 0..PERFORMANCE_LOG_CAPACITY + 10 {
            log.push(PerformanceEntry {
                timestamp: Utc::now(),
                cpu_percent: 1.0,
                memory_percent: 1.0,
                inter_task_sleep_seconds: 0.0,
                task_share: BTreeMap::new(),
            });
        }
        assert_eq!(log.0.len(), PERFORMANCE_LOG_CAPACITY);
    }

    #[test]
    fn source_cache_lives_in_subdirectory() {
        let (_tmp, state) = dir();
        let now = Utc::now();
        let mut cache = SourceCache::default();
        cache.mark("tt1856101", now);
        let name = StateDir::source_cache_name("mylist");
        state.write_json(&name, &cache).unwrap();
        assert!(state.root().join("source_cache/mylist.json").exists());
        let back: SourceCache = state.read_or_default(&name);
        let day = chrono::Duration::hours(24);
        assert!(back.is_fresh("tt1856101", now, day));
        assert!(!back.is_fresh("tt1856101", now + day, day));
        assert!(!back.is_fresh("tt0000001", now, day));
    }

    #[test]
    fn remove_reports_presence() {
        let (_tmp, state) = dir();
        state.write_json(TASK_INTERVALS_FILE, &TaskIntervals::default()).unwrap();
        assert!(state.remove(TASK_INTERVALS_FILE).unwrap());
        assert!(!state.remove(TASK_INTERVALS_FILE).unwrap());
    }
}
