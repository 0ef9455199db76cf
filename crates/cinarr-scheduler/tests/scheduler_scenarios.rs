// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use cinarr_application::debrid::{TorrentFile, TorrentFileList};
use cinarr_application::{
    Clock, ConnectivityError, ConnectivityProbe, ContentSourceDriver, DebridError, DebridProvider,
    ManualClock, PipelineContext, RawResult, ScrapeQuery, ScraperBackend, ScraperError,
    ScraperManager, SchedulerControl,
};
use cinarr_config::AppConfig;
use cinarr_domain::{Item, ItemState, ReleaseDate};
use cinarr_infrastructure::init_memory_database;
use cinarr_infrastructure::repositories::Repositories;
use cinarr_infrastructure::state_files::{StateDir, TaskIntervals, TASK_INTERVALS_FILE};
use cinarr_scheduler::{
    ControlRequest, LoadSample, LoadSampler, PauseKind, RunnerStatus, Scheduler, Services,
};

const BR_TITLE: &str = "Blade.Runner.2049.2017.1080p.BluRay.x264-GROUP";
const BR_MAGNET: &str = "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

struct QuietSampler;

impl LoadSampler for QuietSampler {
    fn sample(&self) -> LoadSample {
        LoadSample {
            cpu_percent: 5.0,
            memory_percent: 20.0,
        }
    }

    fn process_memory(&self) -> Option<u64> {
        Some(64 * 1024 * 1024)
    }
}

#[derive(Default)]
struct CannedBackend {
    results: Mutex<Vec<RawResult>>,
}

#[async_trait]
impl ScraperBackend for CannedBackend {
    fn id(&self) -> &str {
        "canned"
    }

    async fn search(&self, _query: &ScrapeQuery) -> Result<Vec<RawResult>, ScraperError> {
        Ok(self.results.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct FakeDebrid {
    rate_limited: Mutex<bool>,
    torrents: Mutex<BTreeMap<String, TorrentFileList>>,
}

impl FakeDebrid {
    fn check(&self) -> Result<(), DebridError> {
        if *self.rate_limited.lock().unwrap() {
            return Err(DebridError::RateLimit);
        }
        Ok(())
    }
}

#[async_trait]
impl DebridProvider for FakeDebrid {
    async fn add_torrent(&self, magnet: &str) -> Result<String, DebridError> {
        self.check()?;
        Ok(self
            .torrents
            .lock()
            .unwrap()
            .get(magnet)
            .map(|t| t.torrent_id.clone())
            .unwrap_or_else(|| "unknown".into()))
    }

    async fn get_torrent_file_list(&self, magnet: &str) -> Result<TorrentFileList, DebridError> {
        self.check()?;
        Ok(self
            .torrents
            .lock()
            .unwrap()
            .get(magnet)
            .cloned()
            .unwrap_or(TorrentFileList {
                torrent_id: "unknown".into(),
                filename: "unknown".into(),
                files: Vec::new(),
            }))
    }

    async fn get_total_library_size(&self) -> Result<f64, DebridError> {
        Ok(0.0)
    }

    async fn has_download_capacity(&self) -> Result<bool, DebridError> {
        Ok(true)
    }

    async fn remove_torrent(&self, _torrent_id: &str) -> Result<(), DebridError> {
        Ok(())
    }
}

#[derive(Default)]
struct FlakyProbe {
    down: Mutex<bool>,
}

#[async_trait]
impl ConnectivityProbe for FlakyProbe {
    async fn check(&self) -> Result<(), ConnectivityError> {
        if *self.down.lock().unwrap() {
            return Err(ConnectivityError::Unreachable {
                service: "debrid".into(),
                detail: "connection refused".into(),
            });
        }
        Ok(())
    }
}

struct Harness {
    scheduler: Scheduler,
    clock: ManualClock,
    ctx: PipelineContext,
    backend: Arc<CannedBackend>,
    debrid: Arc<FakeDebrid>,
    probe: Arc<FlakyProbe>,
    library: tempfile::TempDir,
    _data: tempfile::TempDir,
}

impl Harness {
    async fn new(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let data = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.file_management.original_files_path = library.path().to_path_buf();
        configure(&mut config);

        let backend = Arc::new(CannedBackend::default());
        let debrid = Arc::new(FakeDebrid::default());
        let probe = Arc::new(FlakyProbe::default());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());

        let scraper: Arc<dyn ScraperBackend> = backend.clone();
        let provider: Arc<dyn DebridProvider> = debrid.clone();
        let ctx = PipelineContext::builder(
            config,
            Repositories::sqlite(init_memory_database().await.unwrap()),
            StateDir::new(data.path()).unwrap(),
            ScraperManager::new(vec![scraper], StdDuration::from_secs(5)),
            provider,
        )
        .clock(Arc::new(clock.clone()))
        .build();

        let sources = ContentSourceDriver::from_config(ctx.clone(), reqwest::Client::new());
        let services = Services::new(ctx.clone(), sources).with_probe(probe.clone());
        let scheduler = Scheduler::with_load_sampler(services, Arc::new(QuietSampler));
        Self {
            scheduler,
            clock,
            ctx,
            backend,
            debrid,
            probe,
            library,
            _data: data,
        }
    }

    async fn run_now(&self, task: &str) -> usize {
        self.scheduler.trigger_task(task).unwrap();
        self.scheduler.tick().await
    }

    async fn insert(&self, mut item: Item) -> Item {
        item.last_state_change = self.ctx.now();
        item.last_updated = self.ctx.now();
        self.ctx.repos.items.insert(item).await.unwrap()
    }

    async fn state_of(&self, item: &Item) -> ItemState {
        self.ctx.repos.items.get(item.id).await.unwrap().unwrap().state
    }
}

fn blade_runner() -> Item {
    let mut item = Item::new_movie("Blade Runner 2049", "tt1856101", 2017).with_version("1080p");
    item.release_date = ReleaseDate::Known(NaiveDate::from_ymd_opt(2017, 10, 6).unwrap());
    item
}

#[tokio::test]
async fn catalogue_starts_one_interval_out() {
    let h = Harness::new(|_| {}).await;
    let start = h.clock.now();
    assert_eq!(h.scheduler.next_run("queue_wanted"), Some(start + Duration::seconds(5)));
    assert_eq!(h.scheduler.next_run("queue_blacklisted"), Some(start + Duration::hours(1)));
    assert!(h.scheduler.next_run("queue_collected").is_none());
    assert_eq!(h.scheduler.tick().await, 0);

    let jobs = h.scheduler.jobs();
    assert!(jobs.iter().any(|j| j.id == "task_heartbeat" && j.enabled));
    // The symlink verifier only runs in symlink mode.
    assert!(jobs.iter().any(|j| j.id == "task_verify_symlinks" && !j.enabled));
}

#[tokio::test]
async fn movie_walks_the_queues_to_collected() {
    let h = Harness::new(|_| {}).await;
    h.backend.results.lock().unwrap().push(RawResult {
        title: BR_TITLE.into(),
        size_gb: 14.2,
        magnet: BR_MAGNET.into(),
        source: "canned".into(),
        seeders: Some(40),
    });
    h.debrid.torrents.lock().unwrap().insert(
        BR_MAGNET.into(),
        TorrentFileList {
            torrent_id: "t1".into(),
            filename: BR_TITLE.into(),
            files: vec![TorrentFile {
                id: 1,
                path: format!("{}/{}.mkv", BR_TITLE, BR_TITLE),
                bytes: 14_000_000_000,
            }],
        },
    );
    let item = h.insert(blade_runner()).await;

    h.run_now("queue_wanted").await;
    h.run_now("queue_scraping").await;
    h.run_now("queue_adding").await;
    assert_eq!(h.state_of(&item).await, ItemState::Checking);

    let folder = h.library.path().join(BR_TITLE);
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join(format!("{}.mkv", BR_TITLE)), b"video").unwrap();
    h.run_now("queue_checking").await;
    assert_eq!(h.state_of(&item).await, ItemState::Collected);

    let status = h.scheduler.status();
    assert!(status.currently_executing.is_empty());
    assert_eq!(status.queue_sizes.get("Collected"), Some(&1));
}

#[tokio::test]
async fn rate_limit_pauses_debrid_tasks_until_the_resume_job() {
    let h = Harness::new(|_| {}).await;
    *h.debrid.rate_limited.lock().unwrap() = true;
    let mut item = blade_runner();
    item.state = ItemState::Scraping;
    h.insert(item).await;
    h.backend.results.lock().unwrap().push(RawResult {
        title: BR_TITLE.into(),
        size_gb: 14.2,
        magnet: BR_MAGNET.into(),
        source: "canned".into(),
        seeders: None,
    });

    h.run_now("queue_scraping").await;
    h.run_now("queue_adding").await;

    let info = h.scheduler.pause_info().expect("paused");
    assert_eq!(info.error_type(), PauseKind::RateLimit);
    assert_eq!(info.service_name(), Some("debrid"));
    let paused = h.scheduler.paused_jobs();
    for task in ["queue_wanted", "queue_scraping", "queue_adding", "queue_checking"] {
        assert!(paused.iter().any(|id| id == task), "{} should be paused", task);
    }
    assert!(!paused.iter().any(|id| id == "task_heartbeat"));
    assert!(!paused.iter().any(|id| id == "queue_sleeping"));
    assert!(h.scheduler.next_run("queue_adding").is_none());

    // A second rate limit while paused books nothing new.
    h.scheduler.pause_for_rate_limit("debrid");
    let resume_jobs = h.scheduler.jobs().into_iter().filter(|j| j.task == "rate_limit_resume").count();
    assert_eq!(resume_jobs, 1);

    h.clock.advance(Duration::minutes(30));
    h.scheduler.tick().await;
    assert!(h.scheduler.pause_info().is_none());
    assert!(h.scheduler.paused_jobs().is_empty());
    let now = h.clock.now();
    assert_eq!(h.scheduler.next_run("queue_adding"), Some(now + Duration::seconds(1)));
}

#[tokio::test]
async fn connectivity_loss_pauses_and_recovery_resumes() {
    let h = Harness::new(|_| {}).await;
    *h.probe.down.lock().unwrap() = true;
    h.run_now("task_check_connectivity").await;

    let info = h.scheduler.pause_info().expect("paused");
    assert_eq!(info.error_type(), PauseKind::ConnectionError);
    assert_eq!(info.service_name(), Some("debrid"));
    assert!(h.scheduler.paused_jobs().iter().any(|id| id == "queue_wanted"));
    assert!(h.scheduler.next_run("task_check_connectivity").is_some());

    *h.probe.down.lock().unwrap() = false;
    h.run_now("task_check_connectivity").await;
    assert!(h.scheduler.pause_info().is_none());
    assert!(h.scheduler.next_run("queue_wanted").is_some());
}

#[tokio::test]
async fn failed_probe_is_retried_on_the_fast_cadence() {
    let h = Harness::new(|_| {}).await;
    *h.probe.down.lock().unwrap() = true;
    h.clock.advance(Duration::seconds(60));
    h.scheduler.tick().await;
    let now = h.clock.now();
    assert_eq!(
        h.scheduler.next_run("task_check_connectivity"),
        Some(now + Duration::seconds(30))
    );
}

#[tokio::test]
async fn watchdog_forces_a_stuck_connectivity_pause_open() {
    let h = Harness::new(|_| {}).await;
    *h.probe.down.lock().unwrap() = true;
    h.run_now("task_check_connectivity").await;
    assert!(h.scheduler.pause_info().is_some());

    h.clock.advance(Duration::minutes(2));
    h.run_now("task_fail_safe_watchdog").await;
    assert!(h.scheduler.pause_info().is_some());

    h.clock.advance(Duration::minutes(2));
    h.run_now("task_fail_safe_watchdog").await;
    assert!(h.scheduler.pause_info().is_none());
}

#[tokio::test]
async fn watchdog_leaves_rate_limit_pauses_alone() {
    let h = Harness::new(|_| {}).await;
    h.scheduler.pause_for_rate_limit("debrid");
    h.clock.advance(Duration::minutes(10));
    h.run_now("task_fail_safe_watchdog").await;
    assert_eq!(h.scheduler.pause_info().map(|i| i.error_type()), Some(PauseKind::RateLimit));
}

fn paused_kind(h: &Harness) -> Option<PauseKind> {
    h.scheduler.pause_info().map(|i| i.error_type())
}

#[tokio::test]
async fn rate_limit_outlasts_a_connectivity_blip() {
    let h = Harness::new(|_| {}).await;
    let start = h.clock.now();
    h.scheduler.pause_for_rate_limit("debrid");

    *h.probe.down.lock().unwrap() = true;
    h.run_now("task_check_connectivity").await;
    assert_eq!(paused_kind(&h), Some(PauseKind::ConnectionError));
    assert_eq!(h.scheduler.active_pauses().len(), 2);

    h.clock.advance(Duration::seconds(150));
    *h.probe.down.lock().unwrap() = false;
    h.run_now("task_check_connectivity").await;
    assert_eq!(paused_kind(&h), Some(PauseKind::RateLimit));
    assert!(h.scheduler.next_run("queue_adding").is_none());
    assert!(h.scheduler.next_run("queue_checking").is_none());
    // Tasks only the outage held are running again.
    assert!(h.scheduler.next_run("queue_sleeping").is_some());

    // Past the fail-safe limit the watchdog still leaves it alone.
    h.clock.advance(Duration::minutes(5));
    h.run_now("task_fail_safe_watchdog").await;
    assert_eq!(paused_kind(&h), Some(PauseKind::RateLimit));
    assert!(h.scheduler.next_run("queue_adding").is_none());

    h.clock.set(start + Duration::minutes(30));
    h.scheduler.tick().await;
    assert!(h.scheduler.pause_info().is_none());
    assert!(h.scheduler.next_run("queue_adding").is_some());
}

#[tokio::test]
async fn rate_limit_during_an_outage_keeps_debrid_tasks_held() {
    let h = Harness::new(|_| {}).await;
    *h.probe.down.lock().unwrap() = true;
    h.run_now("task_check_connectivity").await;
    h.scheduler.pause_for_rate_limit("debrid");

    *h.probe.down.lock().unwrap() = false;
    h.run_now("task_check_connectivity").await;
    assert_eq!(paused_kind(&h), Some(PauseKind::RateLimit));
    let paused = h.scheduler.paused_jobs();
    assert!(paused.iter().any(|id| id == "queue_adding"));
    assert!(!paused.iter().any(|id| id == "queue_sleeping"));
    assert!(h.scheduler.next_run("queue_adding").is_none());
}

#[tokio::test]
async fn scheduled_window_pauses_everything_but_housekeeping() {
    let h = Harness::new(|config| {
        config.queue.pause_start_time = Some("11:00".into());
        config.queue.pause_end_time = Some("13:00".into());
    })
    .await;
    h.run_now("task_check_scheduled_pause").await;
    assert_eq!(
        h.scheduler.pause_info().map(|i| i.error_type()),
        Some(PauseKind::SystemScheduled)
    );
    let paused = h.scheduler.paused_jobs();
    assert!(paused.iter().any(|id| id == "queue_wanted"));
    assert!(paused.iter().any(|id| id == "task_reconcile_queues"));
    assert!(!paused.iter().any(|id| id == "task_heartbeat"));
    assert!(!paused.iter().any(|id| id == "task_check_scheduled_pause"));

    h.clock.set(Utc.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap());
    h.run_now("task_check_scheduled_pause").await;
    assert!(h.scheduler.pause_info().is_none());
}

#[tokio::test]
async fn idle_queues_stretch_dynamic_intervals() {
    let h = Harness::new(|_| {}).await;
    h.run_now("task_check_idle_mode").await;
    assert_eq!(h.scheduler.idle_multiplier(), 2);
    assert_eq!(h.scheduler.interval("queue_wanted"), Some(10));
    // Watched queues keep their pace.
    assert_eq!(h.scheduler.interval("queue_scraping"), Some(1));

    let mut item = blade_runner();
    item.state = ItemState::Scraping;
    h.insert(item).await;
    h.run_now("task_check_idle_mode").await;
    assert_eq!(h.scheduler.idle_multiplier(), 1);
    assert_eq!(h.scheduler.interval("queue_wanted"), Some(5));
}

#[tokio::test]
async fn control_requests_are_applied_from_the_inbox() {
    let h = Harness::new(|_| {}).await;
    ControlRequest::Disable {
        task: "queue_upgrading".into(),
    }
    .submit(&h.ctx.state)
    .unwrap();
    ControlRequest::SetInterval {
        task: "task_reconcile_queues".into(),
        seconds: 600,
    }
    .submit(&h.ctx.state)
    .unwrap();
    ControlRequest::SetInterval {
        task: "queue_wanted".into(),
        seconds: 0,
    }
    .submit(&h.ctx.state)
    .unwrap();

    h.run_now("task_process_control_requests").await;
    assert!(h.scheduler.next_run("queue_upgrading").is_none());
    assert_eq!(h.scheduler.interval("task_reconcile_queues"), Some(600));
    // Out-of-range values are rejected and leave the default alone.
    assert_eq!(h.scheduler.interval("queue_wanted"), Some(5));

    let intervals: TaskIntervals = h.ctx.state.read_json(TASK_INTERVALS_FILE).unwrap().unwrap();
    assert_eq!(intervals.0.get("task_reconcile_queues"), Some(&600));

    h.scheduler.reset_task_settings().unwrap();
    assert_eq!(h.scheduler.interval("task_reconcile_queues"), Some(3600));
    assert!(h.scheduler.next_run("queue_upgrading").is_some());
    assert!(!h.ctx.state.path(TASK_INTERVALS_FILE).exists());
}

#[tokio::test]
async fn persisted_settings_survive_a_restart() {
    let h = Harness::new(|_| {}).await;
    h.scheduler.set_task_interval("queue_checking", Some(120)).unwrap();
    h.scheduler.set_task_enabled("queue_sleeping", false).unwrap();

    let sources = ContentSourceDriver::from_config(h.ctx.clone(), reqwest::Client::new());
    let restarted = Scheduler::with_load_sampler(Services::new(h.ctx.clone(), sources), Arc::new(QuietSampler));
    assert_eq!(restarted.interval("queue_checking"), Some(120));
    assert!(restarted.next_run("queue_sleeping").is_none());
}

#[tokio::test]
async fn heartbeat_and_performance_log_are_written() {
    let h = Harness::new(|_| {}).await;
    h.run_now("task_heartbeat").await;
    assert_eq!(h.ctx.state.read_heartbeat().unwrap(), Some(h.clock.now().timestamp()));
    let status = RunnerStatus::read(&h.ctx.state).unwrap().unwrap();
    assert_eq!(status.updated_at, h.clock.now());

    h.run_now("task_regulate_load").await;
    h.run_now("task_flush_performance_log").await;
    let log = h.scheduler.performance_log();
    assert_eq!(log.0.len(), 1);
    assert_eq!(log.0[0].cpu_percent, 5.0);
    assert_eq!(h.scheduler.inter_task_sleep(), 0.0);
}

#[tokio::test]
async fn unknown_task_cannot_be_triggered() {
    let h = Harness::new(|_| {}).await;
    assert!(h.scheduler.trigger_task("task_does_not_exist").is_err());
    let id = h.scheduler.trigger_task("queue_wanted").unwrap();
    assert!(id.starts_with("queue_wanted_manual_"));
}

#[tokio::test]
async fn stop_ends_the_worker_loop() {
    let h = Harness::new(|_| {}).await;
    let handle = h.scheduler.clone().start();
    h.scheduler.stop();
    let result = tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("worker stops")
        .expect("worker joins");
    assert!(result.is_ok());
    assert_eq!(h.scheduler.runner_state().as_str(), "stopped");
}
