// SPDX-License-Identifier: GPL-3.0-or-later
use std::fmt;

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use cinarr_application::ConnectivityError;
use cinarr_config::QueueConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::jobs::is_rate_limited_task;

/// Tasks that keep running while the scheduler is paused.
pub const PAUSE_EXEMPT_TASKS: &[&str] = &[
    "task_heartbeat",
    "task_check_connectivity",
    "task_check_scheduled_pause",
    "task_fail_safe_watchdog",
    "task_check_db_health",
    "task_process_control_requests",
];

/// Connectivity probes retry every 30s for the first two minutes of an
/// outage, then every minute.
pub const CONNECTIVITY_FAST_RETRY_SECONDS: u64 = 30;
pub const CONNECTIVITY_SLOW_RETRY_SECONDS: u64 = 60;
const CONNECTIVITY_FAST_RETRY_WINDOW_SECONDS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseKind {
    ConnectionError,
    Unauthorized,
    Forbidden,
    SystemScheduled,
    RateLimit,
    DbHealth,
}

impl PauseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PauseKind::ConnectionError => "CONNECTION_ERROR",
            PauseKind::Unauthorized => "UNAUTHORIZED",
            PauseKind::Forbidden => "FORBIDDEN",
            PauseKind::SystemScheduled => "SYSTEM_SCHEDULED",
            PauseKind::RateLimit => "RATE_LIMIT",
            PauseKind::DbHealth => "DB_HEALTH",
        }
    }

    /// Raised by the connectivity probe and cleared by it.
    pub fn is_connectivity(self) -> bool {
        matches!(
            self,
            PauseKind::ConnectionError | PauseKind::Unauthorized | PauseKind::Forbidden
        )
    }

    /// Pauses the fail-safe watchdog may force open. Scheduled and rate-limit
    /// pauses end on their own clock.
    pub fn watchdog_may_resume(self) -> bool {
        !matches!(self, PauseKind::SystemScheduled | PauseKind::RateLimit)
    }
}

impl fmt::Display for PauseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the scheduler is paused. Values are replaced, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseInfo {
    reason: String,
    error_type: PauseKind,
    service_name: Option<String>,
    status_code: Option<u16>,
    retry_count: u32,
}

impl PauseInfo {
    pub fn new(error_type: PauseKind, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            error_type,
            service_name: None,
            status_code: None,
            retry_count: 0,
        }
    }

    pub fn with_service(self, service: impl Into<String>) -> Self {
        Self {
            service_name: Some(service.into()),
            ..self
        }
    }

    pub fn with_status(self, status: Option<u16>) -> Self {
        Self {
            status_code: status,
            ..self
        }
    }

    /// The same pause observed once more.
    pub fn retried(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }

    pub fn from_connectivity(err: &ConnectivityError) -> Self {
        let kind = match err {
            ConnectivityError::Unauthorized { .. } => PauseKind::Unauthorized,
            ConnectivityError::Forbidden { .. } => PauseKind::Forbidden,
            _ => PauseKind::ConnectionError,
        };
        Self::new(kind, err.to_string())
            .with_service(err.service())
            .with_status(err.status_code())
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn error_type(&self) -> PauseKind {
        self.error_type
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

/// Which tasks a pause holds back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PauseScope {
    All,
    RateLimited,
}

impl PauseScope {
    pub fn covers(self, task: &str) -> bool {
        if PAUSE_EXEMPT_TASKS.contains(&task) {
            return false;
        }
        match self {
            PauseScope::All => true,
            PauseScope::RateLimited => is_rate_limited_task(task),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ActivePause {
    pub info: PauseInfo,
    pub scope: PauseScope,
    pub since: DateTime<Utc>,
    /// Jobs held by this pause, and only those.
    pub suspended: Vec<String>,
}

/// Live pause bookkeeping of a scheduler: at most one entry per kind,
/// oldest first. A job belongs to exactly one entry.
#[derive(Debug, Clone, Default)]
pub(crate) struct PauseState {
    active: Vec<ActivePause>,
}

/// Outcome of [`PauseState::lift`].
#[derive(Debug, Default)]
pub(crate) struct Lifted {
    pub kinds: Vec<PauseKind>,
    /// Jobs no remaining pause covers.
    pub released: Vec<String>,
    /// Jobs handed over to a pause that is still active.
    pub handed_over: usize,
}

impl PauseState {
    /// The most recent pause; what status reports.
    pub fn current(&self) -> Option<&PauseInfo> {
        self.active.last().map(|p| &p.info)
    }

    pub fn get(&self, kind: PauseKind) -> Option<&ActivePause> {
        self.active.iter().find(|p| p.info.error_type() == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active(&self) -> &[ActivePause] {
        &self.active
    }

    pub fn suspended(&self) -> Vec<String> {
        self.active
            .iter()
            .flat_map(|p| p.suspended.iter().cloned())
            .collect()
    }

    /// Record a pause. Repeating an active kind bumps its retry count and
    /// keeps its start time. Returns the info now on record for the kind.
    pub fn record(
        &mut self,
        info: PauseInfo,
        scope: PauseScope,
        now: DateTime<Utc>,
        suspended: Vec<String>,
    ) -> PauseInfo {
        let kind = info.error_type();
        if let Some(entry) = self.active.iter_mut().find(|p| p.info.error_type() == kind) {
            entry.info = entry.info.retried();
            entry.suspended.extend(suspended);
            return entry.info.clone();
        }
        self.active.push(ActivePause {
            info: info.clone(),
            scope,
            since: now,
            suspended,
        });
        info
    }

    /// Drop every pause whose kind `kind` accepts. Their jobs go to the
    /// oldest remaining pause that covers them, or are released.
    /// `task_of` maps a job id to its task; unknown ids are dropped.
    pub fn lift(
        &mut self,
        kind: impl Fn(PauseKind) -> bool,
        task_of: impl Fn(&str) -> Option<String>,
    ) -> Lifted {
        let (lifted, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|p| kind(p.info.error_type()));
        self.active = kept;

        let mut out = Lifted::default();
        for pause in lifted {
            out.kinds.push(pause.info.error_type());
            for id in pause.suspended {
                let Some(task) = task_of(&id) else {
                    continue;
                };
                match self.active.iter_mut().find(|p| p.scope.covers(&task)) {
                    Some(holder) => {
                        holder.suspended.push(id);
                        out.handed_over += 1;
                    }
                    None => out.released.push(id),
                }
            }
        }
        out
    }
}

/// Seconds until the next probe while an outage has lasted `retry_count` probes.
pub fn connectivity_retry_delay(retry_count: u32) -> u64 {
    if u64::from(retry_count) * CONNECTIVITY_FAST_RETRY_SECONDS < CONNECTIVITY_FAST_RETRY_WINDOW_SECONDS {
        CONNECTIVITY_FAST_RETRY_SECONDS
    } else {
        CONNECTIVITY_SLOW_RETRY_SECONDS
    }
}

/// Daily window during which the pipeline sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseWindow {
    start: NaiveTime,
    end: NaiveTime,
    tz: Tz,
}

impl PauseWindow {
    pub fn new(start: NaiveTime, end: NaiveTime, tz: Tz) -> Self {
        Self { start, end, tz }
    }

    /// `None` unless both ends are configured and parse as `HH:MM`.
    pub fn from_config(queue: &QueueConfig) -> Option<Self> {
        let start = queue.pause_start_time.as_deref()?;
        let end = queue.pause_end_time.as_deref()?;
        let parse = |raw: &str| NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok();
        let (Some(start), Some(end)) = (parse(start), parse(end)) else {
            warn!(target: "scheduler", %start, %end, "ignoring malformed pause window");
            return None;
        };
        let tz = queue.timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!(target: "scheduler", timezone = %queue.timezone, "unknown timezone, pause window uses UTC");
            Tz::UTC
        });
        Some(Self::new(start, end, tz))
    }

    /// Start inclusive, end exclusive; `start > end` wraps past midnight.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz).time();
        if self.start <= self.end {
            self.start <= local && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}
