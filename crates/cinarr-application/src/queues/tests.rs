// SPDX-License-Identifier: GPL-3.0-or-later
use std::sync::{Arc, Mutex};

use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use cinarr_config::{AppConfig, QueueConfig, VersionSettings, WeightedPattern};
use cinarr_domain::{Item, ItemState, ReleaseDate, StoredResult};
use cinarr_infrastructure::repositories::ItemLookup;
use cinarr_infrastructure::state_files::{
    CollectedNotification, PreReleaseData, RemovalCache, COLLECTED_NOTIFICATIONS_FILE,
    PRE_RELEASE_FILE, REMOVAL_CACHE_FILE,
};

use super::*;
use crate::debrid::DebridProvider;
use crate::metadata::MetadataProvider;
use crate::scrapers::tests::raw;
use crate::scrapers::ScraperBackend;
use crate::test_support::{DebridFailure, FakeDebrid, Fixture, FixtureBuilder, SwitchableBackend};

const BR_WEB: &str = "Blade.Runner.2049.2017.1080p.WEB-DL.x264-WEB";
const BR_WEB_MAGNET: &str = "magnet:?xt=urn:btih:1111111111111111111111111111111111111111";
const BR_BLURAY: &str = "Blade.Runner.2049.2017.1080p.BluRay.x264-GROUP";
const BR_BLURAY_MAGNET: &str = "magnet:?xt=urn:btih:2222222222222222222222222222222222222222";

#[derive(Default)]
struct RecordingControl {
    paused: Mutex<Vec<String>>,
}

impl SchedulerControl for RecordingControl {
    fn pause_for_rate_limit(&self, service: &str) {
        self.paused.lock().unwrap().push(service.to_string());
    }

    fn trigger(&self, _task: &str) {}
}

struct Harness {
    fx: Fixture,
    queues: QueueManager,
    backend: Arc<SwitchableBackend>,
    debrid: Arc<FakeDebrid>,
    library: tempfile::TempDir,
}

impl Harness {
    async fn new(debrid: FakeDebrid, configure: impl FnOnce(&mut AppConfig)) -> Self {
        Self::with_metadata(debrid, None, configure).await
    }

    async fn with_metadata(
        debrid: FakeDebrid,
        metadata: Option<Arc<dyn MetadataProvider>>,
        configure: impl FnOnce(&mut AppConfig),
    ) -> Self {
        let library = tempfile::tempdir().unwrap();
        let backend = Arc::new(SwitchableBackend::default());
        let debrid = Arc::new(debrid);

        let mut builder = FixtureBuilder::new();
        builder.config.file_management.original_files_path = library.path().to_path_buf();
        configure(&mut builder.config);
        let scraper: Arc<dyn ScraperBackend> = backend.clone();
        builder.backends = vec![scraper];
        let provider: Arc<dyn DebridProvider> = debrid.clone();
        builder.debrid = provider;
        builder.metadata = metadata;
        let fx = builder.build().await;

        let verifier = Arc::new(LibraryVerifier::new(fx.ctx.clone()));
        let queues = QueueManager::new(fx.ctx.clone(), verifier);
        Self {
            fx,
            queues,
            backend,
            debrid,
            library,
        }
    }

    async fn insert(&self, mut item: Item) -> Item {
        item.last_state_change = self.fx.ctx.now();
        item.last_updated = self.fx.ctx.now();
        self.fx.ctx.repos.items.insert(item).await.unwrap()
    }

    async fn get(&self, item: &Item) -> Item {
        self.fx.ctx.repos.items.get(item.id).await.unwrap().unwrap()
    }

    async fn run(&self, queue: QueueName) -> ProcessReport {
        self.queues.process(queue, &NoopControl).await.unwrap()
    }

    /// Put `file` where the debrid mount exposes a torrent called `folder`.
    fn land(&self, folder: &str, file: &str) -> std::path::PathBuf {
        let dir = self.library.path().join(folder);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file);
        std::fs::write(&path, b"video").unwrap();
        path
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn movie(released: NaiveDate) -> Item {
    let mut item = Item::new_movie("Blade Runner 2049", "tt1856101", 2017).with_version("1080p");
    item.release_date = ReleaseDate::Known(released);
    item
}

fn episode(s: u32, e: u32, released: NaiveDate) -> Item {
    let mut item = Item::new_episode("Severance", "tt11280740", s, e).with_version("1080p");
    item.year = Some(2022);
    item.release_date = ReleaseDate::Known(released);
    item
}

fn stored(title: &str, magnet: &str, size_gb: f64) -> StoredResult {
    StoredResult {
        title: title.to_string(),
        magnet: magnet.to_string(),
        size_gb,
        source: "static".to_string(),
        score: 50.0,
        soft: false,
        scene_season: None,
        scene_episode: None,
    }
}

fn in_state(mut item: Item, state: ItemState) -> Item {
    item.state = state;
    item
}

#[test]
fn queue_names_map_to_states_and_tasks() {
    for queue in QueueName::ALL {
        assert_eq!(QueueName::from_state(queue.state()), queue);
        assert_eq!(QueueName::from_task_name(queue.task_name()), Some(queue));
    }
    assert_eq!(QueueName::PendingUncached.task_name(), "queue_pending_uncached");
    assert_eq!(QueueName::FinalCheck.to_string(), "Final_Check");
    assert!(!QueueName::Collected.is_processed());
}

#[test]
fn queue_view_tracks_membership() {
    let mut view = QueueView::new(QueueName::Wanted);
    let mut item = Item::new_movie("Film", "tt1", 2020);
    item.id = ItemId(3);
    view.add_item(item.clone());
    view.add_item(item.clone());
    assert_eq!(view.len(), 1);
    assert!(view.contains_item_id(ItemId(3)));
    assert_eq!(view.remove_item(ItemId(3)).map(|i| i.id), Some(ItemId(3)));
    assert!(view.is_empty());
}

#[test]
fn movie_is_due_exactly_at_its_offset() {
    let config = QueueConfig::default();
    let item = movie(date(2024, 6, 1));
    let due = release_due_at(&item, &config).unwrap();
    assert_eq!(due, Utc.with_ymd_and_hms(2024, 6, 1, 19, 0, 0).unwrap());
}

#[test]
fn episode_due_follows_show_timezone_or_utc() {
    let config = QueueConfig::default();
    let mut item = episode(1, 1, date(2024, 6, 1));
    item.airtime = NaiveTime::from_hms_opt(21, 0, 0);
    item.airs_timezone = Some("America/New_York".into());
    assert_eq!(
        release_due_at(&item, &config),
        Some(Utc.with_ymd_and_hms(2024, 6, 2, 1, 0, 0).unwrap())
    );

    item.airs_timezone = None;
    assert_eq!(
        release_due_at(&item, &config),
        Some(Utc.with_ymd_and_hms(2024, 6, 1, 21, 0, 0).unwrap())
    );

    item.release_date = ReleaseDate::Unknown;
    assert_eq!(release_due_at(&item, &config), None);
}

#[tokio::test]
async fn wanted_routes_on_release_date() {
    let h = Harness::new(FakeDebrid::default(), |_| {}).await;
    let released = h.insert(movie(date(2017, 10, 6))).await;
    let upcoming = h.insert(movie(date(2024, 7, 1))).await;
    let mut unknown = movie(date(2017, 10, 6));
    unknown.release_date = ReleaseDate::Unknown;
    let unknown = h.insert(unknown).await;

    let report = h.run(QueueName::Wanted).await;
    assert_eq!(report.examined, 3);
    assert_eq!(report.moved, 2);
    assert_eq!(h.get(&released).await.state, ItemState::Scraping);
    assert_eq!(h.get(&upcoming).await.state, ItemState::Unreleased);
    assert_eq!(h.get(&unknown).await.state, ItemState::Wanted);
}

#[tokio::test]
async fn release_day_boundary_is_inclusive() {
    let h = Harness::new(FakeDebrid::default(), |_| {}).await;
    h.fx.clock.set(Utc.with_ymd_and_hms(2024, 6, 1, 18, 59, 59).unwrap());
    let item = h.insert(movie(date(2024, 6, 1))).await;

    h.run(QueueName::Wanted).await;
    assert_eq!(h.get(&item).await.state, ItemState::Unreleased);

    h.fx.clock.advance(Duration::seconds(1));
    h.run(QueueName::Unreleased).await;
    assert_eq!(h.get(&item).await.state, ItemState::Wanted);
}

#[tokio::test]
async fn movie_flows_from_wanted_to_collected() {
    let debrid = FakeDebrid::default().with_torrent(
        BR_BLURAY_MAGNET,
        "RD1",
        &[
            (format!("{}/{}.mkv", BR_BLURAY, BR_BLURAY).as_str(), 14_000_000_000),
            (format!("{}/sample.mkv", BR_BLURAY).as_str(), 50_000_000),
        ],
    );
    let h = Harness::new(debrid, |_| {}).await;
    h.backend.serve(vec![raw(BR_BLURAY, 14.2, BR_BLURAY_MAGNET)]);
    let item = h.insert(movie(date(2017, 10, 6))).await;

    h.run(QueueName::Wanted).await;
    h.run(QueueName::Scraping).await;
    let scraped = h.get(&item).await;
    assert_eq!(scraped.state, ItemState::Adding);
    assert_eq!(scraped.scrape_results.len(), 1);
    assert_eq!(scraped.scrape_attempts, 1);

    h.run(QueueName::Adding).await;
    let added = h.get(&item).await;
    assert_eq!(added.state, ItemState::Checking);
    let file = format!("{}.mkv", BR_BLURAY);
    assert_eq!(added.filled_by_file.as_deref(), Some(file.as_str()));
    assert_eq!(added.filled_by_torrent_id.as_deref(), Some("RD1"));
    assert_eq!(added.original_scraped_torrent_title.as_deref(), Some(BR_BLURAY));
    let tracked = h
        .fx
        .ctx
        .repos
        .torrents
        .get("2222222222222222222222222222222222222222")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tracked.item_id, Some(item.id));
    assert_eq!(tracked.trigger_source, "queue_adding");

    h.run(QueueName::Checking).await;
    assert_eq!(h.get(&item).await.state, ItemState::Checking);

    let path = h.land(BR_BLURAY, &file);
    h.run(QueueName::Checking).await;
    let collected = h.get(&item).await;
    assert_eq!(collected.state, ItemState::Collected);
    assert_eq!(collected.location_on_disk.as_deref(), path.to_str());
    assert!(collected.collected_at.is_some());

    let names: Vec<String> = h
        .fx
        .events
        .drain()
        .iter()
        .filter_map(|e| e["name"].as_str().map(str::to_string))
        .collect();
    assert!(names.contains(&"item.collected".to_string()));
    let notes: Vec<CollectedNotification> = h
        .fx
        .ctx
        .state
        .read_json(COLLECTED_NOTIFICATIONS_FILE)
        .unwrap()
        .unwrap();
    assert_eq!(notes.len(), 1);
    assert!(!notes[0].payload.is_upgrade);
    assert_eq!(h.queues.queue_of(item.id), Some(QueueName::Collected));
}

#[tokio::test]
async fn empty_scrape_sleeps_and_wakes_after_backoff() {
    let h = Harness::new(FakeDebrid::default(), |_| {}).await;
    let item = h.insert(in_state(movie(date(2024, 5, 30)), ItemState::Scraping)).await;

    h.run(QueueName::Scraping).await;
    assert_eq!(h.get(&item).await.state, ItemState::Sleeping);

    h.run(QueueName::Sleeping).await;
    let sleeping = h.get(&item).await;
    assert_eq!(sleeping.wake_count, 1);
    assert_eq!(
        sleeping.sleep_until,
        Some(h.fx.ctx.now() + Duration::minutes(30))
    );

    h.fx.clock.advance(Duration::seconds(29 * 60));
    h.run(QueueName::Sleeping).await;
    assert_eq!(h.get(&item).await.state, ItemState::Sleeping);

    h.fx.clock.advance(Duration::seconds(60));
    h.run(QueueName::Sleeping).await;
    let woken = h.get(&item).await;
    assert_eq!(woken.state, ItemState::Wanted);
    assert_eq!(woken.sleep_until, None);
}

#[tokio::test]
async fn too_many_wakes_blacklists() {
    let h = Harness::new(FakeDebrid::default(), |config| config.queue.max_sleep_wakes = 1).await;
    let mut item = in_state(movie(date(2024, 5, 30)), ItemState::Sleeping);
    item.wake_count = 1;
    let item = h.insert(item).await;

    h.run(QueueName::Sleeping).await;
    assert_eq!(h.get(&item).await.state, ItemState::Blacklisted);
}

#[tokio::test]
async fn old_episode_with_nothing_found_blacklists_its_season() {
    let h = Harness::new(FakeDebrid::default(), |_| {}).await;
    let first = h.insert(in_state(episode(1, 1, date(2024, 1, 1)), ItemState::Scraping)).await;
    let second = h.insert(episode(1, 2, date(2024, 1, 8))).await;
    let other_season = h.insert(episode(2, 1, date(2024, 1, 8))).await;

    h.run(QueueName::Scraping).await;
    assert_eq!(h.get(&first).await.state, ItemState::Blacklisted);
    assert_eq!(h.get(&second).await.state, ItemState::Blacklisted);
    assert_eq!(h.get(&other_season).await.state, ItemState::Wanted);
    // a multi scrape was tried first because a sibling was still wanted
    let queries = h.backend.queries.lock().unwrap();
    assert!(queries.first().unwrap().multi);
    assert!(!queries.last().unwrap().multi);
}

#[tokio::test]
async fn adding_skips_torrents_without_a_matching_file() {
    let debrid = FakeDebrid::default().with_torrent(
        BR_WEB_MAGNET,
        "RD2",
        &[(format!("{}.mkv", BR_WEB).as_str(), 8_000_000_000)],
    );
    let h = Harness::new(debrid, |_| {}).await;
    let mut item = in_state(movie(date(2017, 10, 6)), ItemState::Adding);
    item.scrape_results = vec![
        stored(BR_BLURAY, "magnet:?xt=urn:btih:3333333333333333333333333333333333333333", 14.2),
        stored(BR_WEB, BR_WEB_MAGNET, 8.0),
    ];
    let item = h.insert(item).await;

    h.run(QueueName::Adding).await;
    let added = h.get(&item).await;
    assert_eq!(added.state, ItemState::Checking);
    assert_eq!(added.filled_by_title.as_deref(), Some(BR_WEB));
    assert_eq!(h.debrid.removed.lock().unwrap().as_slice(), ["unknown"]);
}

#[tokio::test]
async fn not_wanted_results_are_never_added() {
    let debrid = FakeDebrid::default().with_torrent(
        BR_WEB_MAGNET,
        "RD2",
        &[(format!("{}.mkv", BR_WEB).as_str(), 8_000_000_000)],
    );
    let h = Harness::new(debrid, |_| {}).await;
    h.fx.ctx.repos.not_wanted.add(BR_WEB_MAGNET).await.unwrap();
    let mut item = in_state(movie(date(2017, 10, 6)), ItemState::Adding);
    item.scrape_results = vec![stored(BR_WEB, BR_WEB_MAGNET, 8.0)];
    let item = h.insert(item).await;

    h.run(QueueName::Adding).await;
    assert_eq!(h.get(&item).await.state, ItemState::Sleeping);
    assert!(h.debrid.added.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rate_limit_keeps_item_and_pauses() {
    let debrid = FakeDebrid::default();
    *debrid.failure.lock().unwrap() = Some(DebridFailure::RateLimit);
    let h = Harness::new(debrid, |_| {}).await;
    let mut item = in_state(movie(date(2017, 10, 6)), ItemState::Adding);
    item.scrape_results = vec![stored(BR_WEB, BR_WEB_MAGNET, 8.0)];
    let item = h.insert(item).await;

    let control = RecordingControl::default();
    let report = h.queues.process(QueueName::Adding, &control).await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(h.get(&item).await.state, ItemState::Adding);
    assert_eq!(control.paused.lock().unwrap().as_slice(), ["debrid"]);
}

#[tokio::test]
async fn download_cap_parks_item_until_capacity_returns() {
    let debrid = FakeDebrid::default();
    *debrid.failure.lock().unwrap() = Some(DebridFailure::TooManyDownloads);
    let h = Harness::new(debrid, |_| {}).await;
    let mut item = in_state(movie(date(2017, 10, 6)), ItemState::Adding);
    item.scrape_results = vec![stored(BR_WEB, BR_WEB_MAGNET, 8.0)];
    let item = h.insert(item).await;

    h.run(QueueName::Adding).await;
    assert_eq!(h.get(&item).await.state, ItemState::PendingUncached);

    *h.debrid.failure.lock().unwrap() = None;
    *h.debrid.no_capacity.lock().unwrap() = true;
    h.run(QueueName::PendingUncached).await;
    assert_eq!(h.get(&item).await.state, ItemState::PendingUncached);

    *h.debrid.no_capacity.lock().unwrap() = false;
    h.run(QueueName::PendingUncached).await;
    assert_eq!(h.get(&item).await.state, ItemState::Adding);
}

#[tokio::test]
async fn season_pack_fills_waiting_siblings() {
    use crate::metadata::tests::show_with_counts;
    use crate::search_automation::tests::FakeMetadata;

    let pack = "Severance.S01.1080p.WEB-DL.x264-GRP";
    let pack_magnet = "magnet:?xt=urn:btih:4444444444444444444444444444444444444444";
    let files: Vec<(String, u64)> = (1..=3)
        .map(|e| (format!("{}/Severance.S01E0{}.1080p.WEB-DL.x264-GRP.mkv", pack, e), 2_000_000_000))
        .collect();
    let file_refs: Vec<(&str, u64)> = files.iter().map(|(p, b)| (p.as_str(), *b)).collect();
    let debrid = FakeDebrid::default().with_torrent(pack_magnet, "RD3", &file_refs);

    let library = tempfile::tempdir().unwrap();
    let mut metadata = FakeMetadata::default();
    metadata
        .shows
        .insert("tt11280740".into(), show_with_counts("tt11280740", "Severance", &[3]));
    let mut builder = FixtureBuilder::new();
    builder.config.file_management.original_files_path = library.path().to_path_buf();
    builder.debrid = Arc::new(debrid);
    builder.metadata = Some(Arc::new(metadata));
    let fx = builder.build().await;
    let queues = QueueManager::new(fx.ctx.clone(), Arc::new(LibraryVerifier::new(fx.ctx.clone())));

    let mut first = in_state(episode(1, 1, date(2022, 2, 18)), ItemState::Adding);
    first.scrape_results = vec![stored(pack, pack_magnet, 6.0)];
    let first = fx.ctx.repos.items.insert(first).await.unwrap();
    let second = fx.ctx.repos.items.insert(episode(1, 2, date(2022, 2, 25))).await.unwrap();
    let third = fx
        .ctx
        .repos
        .items
        .insert(in_state(episode(1, 3, date(2022, 3, 4)), ItemState::Sleeping))
        .await
        .unwrap();

    queues.process(QueueName::Adding, &NoopControl).await.unwrap();
    for (item, e) in [(&first, 1), (&second, 2), (&third, 3)] {
        let filled = fx.ctx.repos.items.get(item.id).await.unwrap().unwrap();
        assert_eq!(filled.state, ItemState::Checking);
        assert_eq!(
            filled.filled_by_file,
            Some(format!("Severance.S01E0{}.1080p.WEB-DL.x264-GRP.mkv", e))
        );
        assert_eq!(filled.filled_by_torrent_id.as_deref(), Some("RD3"));
    }
}

#[tokio::test]
async fn anime_episode_is_filled_by_its_absolute_number() {
    use crate::metadata::tests::show_with_counts;
    use crate::search_automation::tests::FakeMetadata;

    let release = "[Group] One Piece - 1000 [1080p].mkv";
    let magnet = "magnet:?xt=urn:btih:5555555555555555555555555555555555555555";
    let debrid = FakeDebrid::default().with_torrent(
        magnet,
        "RD5",
        &[
            ("[Group] One Piece - 999 [1080p].mkv", 1_300_000_000),
            (release, 1_200_000_000),
        ],
    );
    // Nineteen seasons of fifty and one of forty-nine put S21E01 at 1000.
    let mut counts = vec![50; 19];
    counts.push(49);
    let mut metadata = FakeMetadata::default();
    metadata
        .shows
        .insert("tt0388629".into(), show_with_counts("tt0388629", "One Piece", &counts));
    let h = Harness::with_metadata(debrid, Some(Arc::new(metadata)), |_| {}).await;
    h.backend.serve(vec![
        raw(release, 1.2, magnet),
        raw("One.Piece.S21E01.1080p.WEB-DL-GRP", 1.2, "magnet:?xt=urn:btih:6666666666666666666666666666666666666666"),
    ]);

    let mut item = Item::new_episode("One Piece", "tt0388629", 21, 1).with_version("1080p");
    item.genres = vec!["Anime".into()];
    item.release_date = ReleaseDate::Known(date(2021, 11, 21));
    let item = h.insert(in_state(item, ItemState::Scraping)).await;

    h.run(QueueName::Scraping).await;
    let scraped = h.get(&item).await;
    assert_eq!(scraped.state, ItemState::Adding);
    let titles: Vec<&str> = scraped.scrape_results.iter().map(|r| r.title.as_str()).collect();
    assert_eq!(titles, vec![release]);

    h.run(QueueName::Adding).await;
    let added = h.get(&item).await;
    assert_eq!(added.state, ItemState::Checking);
    assert_eq!(added.filled_by_file.as_deref(), Some(release));
    assert_eq!(added.filled_by_torrent_id.as_deref(), Some("RD5"));

    let path = h.library.path().join(release);
    std::fs::write(&path, b"video").unwrap();
    h.run(QueueName::Checking).await;
    let collected = h.get(&item).await;
    assert_eq!(collected.state, ItemState::Collected);
    assert_eq!(collected.location_on_disk.as_deref(), path.to_str());
}

#[tokio::test]
async fn missing_file_goes_through_final_check_to_blacklist() {
    let h = Harness::new(FakeDebrid::default(), |config| {
        config.scraping.versions.insert(
            "1080p".into(),
            VersionSettings {
                fallback_version: Some("720p".into()),
                ..VersionSettings::default()
            },
        );
        config.scraping.versions.insert("720p".into(), VersionSettings::default());
    })
    .await;
    let mut item = in_state(movie(date(2017, 10, 6)), ItemState::Checking);
    item.filled_by_title = Some(BR_BLURAY.into());
    item.filled_by_file = Some(format!("{}.mkv", BR_BLURAY));
    item.filled_by_magnet = Some(BR_BLURAY_MAGNET.into());
    item.filled_by_torrent_id = Some("RD9".into());
    let item = h.insert(item).await;
    h.backend.serve(vec![raw(BR_BLURAY, 14.2, BR_BLURAY_MAGNET)]);

    h.run(QueueName::Checking).await;
    assert_eq!(h.get(&item).await.state, ItemState::Checking);

    h.fx.clock.advance(Duration::seconds(121 * 60));
    h.run(QueueName::Checking).await;
    let final_check = h.get(&item).await;
    assert_eq!(final_check.state, ItemState::FinalCheck);
    assert_eq!(final_check.final_check_add_timestamp, Some(h.fx.ctx.now()));
    assert!(final_check.filled_by_file.is_none());
    assert!(h.fx.ctx.repos.not_wanted.contains(BR_BLURAY_MAGNET).await.unwrap());
    assert_eq!(h.debrid.removed.lock().unwrap().as_slice(), ["RD9"]);

    h.run(QueueName::FinalCheck).await;
    assert_eq!(h.get(&item).await.state, ItemState::FinalCheck);

    h.fx.clock.advance(Duration::seconds(24 * 60 * 60));
    h.run(QueueName::FinalCheck).await;
    assert_eq!(h.get(&item).await.state, ItemState::Blacklisted);

    let fallback = h
        .fx
        .ctx
        .repos
        .items
        .find_matching(&ItemLookup {
            version: Some("720p".into()),
            ..ItemLookup::for_item(&item)
        })
        .await
        .unwrap();
    assert_eq!(fallback.len(), 1);
    assert_eq!(fallback[0].state, ItemState::Wanted);

    // blacklisted items do not spawn a second fallback
    h.run(QueueName::Blacklisted).await;
    let again = h
        .fx
        .ctx
        .repos
        .items
        .find_matching(&ItemLookup::for_item(&item).any_version())
        .await
        .unwrap();
    assert_eq!(again.len(), 2);
}

#[tokio::test]
async fn leaving_checking_drops_the_scan_counter() {
    use crate::test_support::FakeMediaServer;

    let library = tempfile::tempdir().unwrap();
    let server = Arc::new(FakeMediaServer {
        locations: vec![library.path().to_path_buf()],
        ..FakeMediaServer::default()
    });
    let mut builder = FixtureBuilder::new();
    builder.config.file_management.original_files_path = library.path().to_path_buf();
    builder.media_server = Some(server);
    let fx = builder.build().await;
    let verifier = Arc::new(LibraryVerifier::new(fx.ctx.clone()));
    let queues = QueueManager::new(fx.ctx.clone(), verifier.clone());

    let file = format!("{}.mkv", BR_BLURAY);
    let mut item = in_state(movie(date(2017, 10, 6)), ItemState::Checking);
    item.filled_by_title = Some(BR_BLURAY.into());
    item.filled_by_file = Some(file.clone());
    item.last_state_change = fx.ctx.now();
    item.last_updated = fx.ctx.now();
    let item = fx.ctx.repos.items.insert(item).await.unwrap();
    // On disk but never picked up by the media server.
    let dir = library.path().join(BR_BLURAY);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(&file), b"video").unwrap();

    queues.process(QueueName::Checking, &NoopControl).await.unwrap();
    assert_eq!(verifier.scan_ticks(item.id), Some(1));

    fx.clock.advance(Duration::seconds(121 * 60));
    queues.process(QueueName::Checking, &NoopControl).await.unwrap();
    let moved = fx.ctx.repos.items.get(item.id).await.unwrap().unwrap();
    assert_eq!(moved.state, ItemState::FinalCheck);
    assert_eq!(verifier.scan_ticks(item.id), None);
}

#[tokio::test]
async fn final_check_without_timestamp_is_skipped() {
    let h = Harness::new(FakeDebrid::default(), |_| {}).await;
    let item = h.insert(in_state(movie(date(2017, 10, 6)), ItemState::FinalCheck)).await;

    h.fx.clock.advance(Duration::seconds(48 * 60 * 60));
    let report = h.run(QueueName::FinalCheck).await;
    assert_eq!(report.failed, 0);
    assert_eq!(h.get(&item).await.state, ItemState::FinalCheck);
    assert!(h.backend.queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn pre_release_scrape_runs_at_most_daily() {
    let h = Harness::new(FakeDebrid::default(), |_| {}).await;
    let item = h.insert(in_state(movie(date(2024, 6, 5)), ItemState::Unreleased)).await;
    let far = h.insert(in_state(movie(date(2024, 8, 1)), ItemState::Unreleased)).await;

    h.run(QueueName::Unreleased).await;
    let queries = h.backend.queries.lock().unwrap().len();
    assert!(queries > 0);
    let data: PreReleaseData = h.fx.ctx.state.read_json(PRE_RELEASE_FILE).unwrap().unwrap();
    assert_eq!(data[&item.id.to_string()].scrape_count, 1);
    assert!(!data.contains_key(&far.id.to_string()));

    h.fx.clock.advance(Duration::seconds(60 * 60));
    h.run(QueueName::Unreleased).await;
    assert_eq!(h.backend.queries.lock().unwrap().len(), queries);

    h.fx.clock.advance(Duration::seconds(24 * 60 * 60));
    h.backend.serve(vec![raw(BR_BLURAY, 14.2, BR_BLURAY_MAGNET)]);
    h.run(QueueName::Unreleased).await;
    let early = h.get(&item).await;
    assert_eq!(early.state, ItemState::Adding);
    assert_eq!(early.scrape_results.len(), 1);
    assert_eq!(h.get(&far).await.state, ItemState::Unreleased);
}

#[tokio::test]
async fn upgrade_replaces_release_and_queues_old_file_for_removal() {
    let web_file = format!("{}.mkv", BR_WEB);
    let bluray_file = format!("{}.mkv", BR_BLURAY);
    let debrid = FakeDebrid::default()
        .with_torrent(BR_WEB_MAGNET, "RD1", &[(web_file.as_str(), 8_000_000_000)])
        .with_torrent(BR_BLURAY_MAGNET, "RD2", &[(bluray_file.as_str(), 14_000_000_000)]);
    let h = Harness::new(debrid, |config| {
        config.scraping.versions.insert(
            "1080p".into(),
            VersionSettings {
                enable_upgrading: true,
                preferred_filter_in: vec![WeightedPattern("(?i)bluray".into(), 50)],
                ..VersionSettings::default()
            },
        );
    })
    .await;
    h.backend.serve(vec![raw(BR_WEB, 8.0, BR_WEB_MAGNET)]);
    let item = h.insert(in_state(movie(date(2017, 10, 6)), ItemState::Scraping)).await;

    h.run(QueueName::Scraping).await;
    h.run(QueueName::Adding).await;
    let web_path = h.land(BR_WEB, &web_file);
    h.run(QueueName::Checking).await;
    let collected = h.get(&item).await;
    assert_eq!(collected.state, ItemState::Upgrading);
    assert_eq!(collected.location_on_disk.as_deref(), web_path.to_str());

    h.backend.serve(vec![
        raw(BR_WEB, 8.0, BR_WEB_MAGNET),
        raw(BR_BLURAY, 14.2, BR_BLURAY_MAGNET),
    ]);
    h.fx.clock.advance(Duration::seconds(60 * 60));
    h.run(QueueName::Upgrading).await;
    let upgrading = h.get(&item).await;
    assert_eq!(upgrading.state, ItemState::Adding);
    assert_eq!(upgrading.upgrading_from_file.as_deref(), Some(web_file.as_str()));
    assert_eq!(upgrading.upgrading_from_torrent_id.as_deref(), Some("RD1"));

    h.run(QueueName::Adding).await;
    assert_eq!(h.get(&item).await.filled_by_file.as_deref(), Some(bluray_file.as_str()));
    let bluray_path = h.land(BR_BLURAY, &bluray_file);
    h.run(QueueName::Checking).await;

    let upgraded = h.get(&item).await;
    assert_eq!(upgraded.state, ItemState::Collected);
    assert_eq!(upgraded.location_on_disk.as_deref(), bluray_path.to_str());
    assert!(upgraded.upgrading_from_file.is_none());
    assert!(h.debrid.removed.lock().unwrap().contains(&"RD1".to_string()));

    let removals: RemovalCache = h.fx.ctx.state.read_json(REMOVAL_CACHE_FILE).unwrap().unwrap();
    assert!(removals.contains_key(web_path.to_str().unwrap()));
    let notes: Vec<CollectedNotification> = h
        .fx
        .ctx
        .state
        .read_json(COLLECTED_NOTIFICATIONS_FILE)
        .unwrap()
        .unwrap();
    assert_eq!(notes.len(), 2);
    assert!(notes[1].payload.is_upgrade);
}

#[tokio::test]
async fn upgrade_window_closes_back_to_collected() {
    let h = Harness::new(FakeDebrid::default(), |_| {}).await;
    let mut item = in_state(movie(date(2017, 10, 6)), ItemState::Upgrading);
    item.collected_at = Some(h.fx.ctx.now());
    item.filled_by_title = Some(BR_WEB.into());
    let item = h.insert(item).await;

    h.fx.clock.advance(Duration::seconds(7 * 24 * 60 * 60));
    h.run(QueueName::Upgrading).await;
    let closed = h.get(&item).await;
    assert_eq!(closed.state, ItemState::Collected);
    assert_eq!(closed.collected_at, item.collected_at);
}

#[tokio::test]
async fn views_follow_moves() {
    let h = Harness::new(FakeDebrid::default(), |_| {}).await;
    let item = h.insert(movie(date(2024, 7, 1))).await;
    h.queues.update_all().await.unwrap();
    assert_eq!(h.queues.queue_of(item.id), Some(QueueName::Wanted));

    h.run(QueueName::Wanted).await;
    assert_eq!(h.queues.queue_of(item.id), Some(QueueName::Unreleased));
    assert_eq!(h.queues.len(QueueName::Wanted), 0);
    assert_eq!(h.queues.sizes()[&QueueName::Unreleased], 1);
}
