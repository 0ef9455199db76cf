// SPDX-License-Identifier: GPL-3.0-or-later
//! Fakes and fixtures shared by the unit tests of this crate.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use cinarr_config::AppConfig;
use cinarr_infrastructure::init_memory_database;
use cinarr_infrastructure::repositories::Repositories;
use cinarr_infrastructure::state_files::StateDir;

use crate::clock::ManualClock;
use crate::context::PipelineContext;
use crate::debrid::{DebridError, DebridProvider, TorrentFile, TorrentFileList};
use crate::events::InMemoryEventBus;
use crate::media_server::{LibrarySection, MediaServer, MediaServerError, SectionKind};
use crate::metadata::{
    ContentKind, MetadataError, MetadataProvider, MovieMetadata, ShowMetadata,
};
use crate::scrapers::{RawResult, ScrapeQuery, ScraperBackend, ScraperError, ScraperManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DebridFailure {
    RateLimit,
    TooManyDownloads,
}

/// Debrid double keyed by magnet. Unknown magnets add fine but have no files.
#[derive(Default)]
pub(crate) struct FakeDebrid {
    pub torrents: Mutex<BTreeMap<String, TorrentFileList>>,
    pub failure: Mutex<Option<DebridFailure>>,
    pub no_capacity: Mutex<bool>,
    pub added: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

impl FakeDebrid {
    pub fn with_torrent(self, magnet: &str, torrent_id: &str, files: &[(&str, u64)]) -> Self {
        self.torrents.lock().unwrap().insert(
            magnet.to_string(),
            TorrentFileList {
                torrent_id: torrent_id.to_string(),
                filename: torrent_id.to_string(),
                files: files
                    .iter()
                    .enumerate()
                    .map(|(i, (path, bytes))| TorrentFile {
                        id: i as u64 + 1,
                        path: path.to_string(),
                        bytes: *bytes,
                    })
                    .collect(),
            },
        );
        self
    }

    fn fail(&self) -> Result<(), DebridError> {
        match *self.failure.lock().unwrap() {
            Some(DebridFailure::RateLimit) => Err(DebridError::RateLimit),
            Some(DebridFailure::TooManyDownloads) => Err(DebridError::TooManyDownloads),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DebridProvider for FakeDebrid {
    async fn add_torrent(&self, magnet: &str) -> Result<String, DebridError> {
        self.fail()?;
        self.added.lock().unwrap().push(magnet.to_string());
        Ok(self
            .torrents
            .lock()
            .unwrap()
            .get(magnet)
            .map(|t| t.torrent_id.clone())
            .unwrap_or_else(|| "unknown".to_string()))
    }

    async fn get_torrent_file_list(&self, magnet: &str) -> Result<TorrentFileList, DebridError> {
        self.fail()?;
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
        Ok(!*self.no_capacity.lock().unwrap())
    }

    async fn remove_torrent(&self, torrent_id: &str) -> Result<(), DebridError> {
        self.removed.lock().unwrap().push(torrent_id.to_string());
        Ok(())
    }
}

/// Media server that only "sees" the paths it is told about.
#[derive(Default)]
pub(crate) struct FakeMediaServer {
    pub visible: Mutex<HashSet<PathBuf>>,
    pub scans: Mutex<Vec<PathBuf>>,
    pub removed: Mutex<Vec<PathBuf>>,
    pub locations: Vec<PathBuf>,
}

#[async_trait]
impl MediaServer for FakeMediaServer {
    async fn sections(&self) -> Result<Vec<LibrarySection>, MediaServerError> {
        Ok(vec![LibrarySection {
            id: "1".into(),
            kind: SectionKind::Movie,
            locations: self.locations.clone(),
        }])
    }

    async fn scan_path(&self, _section_id: &str, path: &Path) -> Result<(), MediaServerError> {
        self.scans.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    async fn search(&self, _title: &str) -> Result<Vec<PathBuf>, MediaServerError> {
        Ok(self.visible.lock().unwrap().iter().cloned().collect())
    }

    async fn remove_item(&self, path: &Path) -> Result<bool, MediaServerError> {
        self.removed.lock().unwrap().push(path.to_path_buf());
        Ok(self.visible.lock().unwrap().remove(path))
    }
}

/// Backend whose canned results can be swapped between queue runs.
#[derive(Default)]
pub(crate) struct SwitchableBackend {
    pub results: Mutex<Vec<RawResult>>,
    pub queries: Mutex<Vec<ScrapeQuery>>,
}

impl SwitchableBackend {
    pub fn serve(&self, results: Vec<RawResult>) {
        *self.results.lock().unwrap() = results;
    }
}

#[async_trait]
impl ScraperBackend for SwitchableBackend {
    fn id(&self) -> &str {
        "static"
    }

    async fn search(&self, query: &ScrapeQuery) -> Result<Vec<RawResult>, ScraperError> {
        self.queries.lock().unwrap().push(query.clone());
        Ok(self.results.lock().unwrap().clone())
    }
}

/// Metadata provider backed by fixed movie and show records.
#[derive(Default)]
pub(crate) struct CatalogMetadata {
    pub movies: BTreeMap<String, MovieMetadata>,
    pub shows: BTreeMap<String, ShowMetadata>,
    /// tmdb id -> imdb id
    pub tmdb: BTreeMap<String, String>,
    pub lookups: Mutex<Vec<String>>,
}

#[async_trait]
impl MetadataProvider for CatalogMetadata {
    async fn imdb_to_tmdb(&self, imdb_id: &str, _kind: ContentKind) -> Result<Option<String>, MetadataError> {
        Ok(self
            .tmdb
            .iter()
            .find(|(_, imdb)| imdb.as_str() == imdb_id)
            .map(|(tmdb, _)| tmdb.clone()))
    }

    async fn tmdb_to_imdb(&self, tmdb_id: &str, _kind: ContentKind) -> Result<Option<String>, MetadataError> {
        Ok(self.tmdb.get(tmdb_id).cloned())
    }

    async fn show_metadata(&self, imdb_id: &str) -> Result<ShowMetadata, MetadataError> {
        self.lookups.lock().unwrap().push(imdb_id.to_string());
        self.shows
            .get(imdb_id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(imdb_id.to_string()))
    }

    async fn movie_metadata(&self, imdb_id: &str) -> Result<MovieMetadata, MetadataError> {
        self.lookups.lock().unwrap().push(imdb_id.to_string());
        self.movies
            .get(imdb_id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(imdb_id.to_string()))
    }

    async fn translate_title(
        &self,
        _imdb_id: &str,
        _kind: ContentKind,
        _language: &str,
    ) -> Result<Option<String>, MetadataError> {
        Ok(None)
    }

    async fn aliases(
        &self,
        _imdb_id: &str,
        _kind: ContentKind,
    ) -> Result<BTreeMap<String, Vec<String>>, MetadataError> {
        Ok(BTreeMap::new())
    }
}

pub(crate) struct Fixture {
    pub ctx: PipelineContext,
    pub clock: ManualClock,
    pub events: InMemoryEventBus,
    pub dir: tempfile::TempDir,
}

pub(crate) struct FixtureBuilder {
    pub config: AppConfig,
    pub backends: Vec<Arc<dyn ScraperBackend>>,
    pub debrid: Arc<dyn DebridProvider>,
    pub metadata: Option<Arc<dyn MetadataProvider>>,
    pub media_server: Option<Arc<dyn MediaServer>>,
}

impl FixtureBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            backends: Vec::new(),
            debrid: Arc::new(FakeDebrid::default()),
            metadata: None,
            media_server: None,
        }
    }

    pub async fn build(self) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repos = Repositories::sqlite(init_memory_database().await.unwrap());
        let state = StateDir::new(dir.path().join("data")).unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let events = InMemoryEventBus::new();

        let mut builder = PipelineContext::builder(
            self.config,
            repos,
            state,
            ScraperManager::new(self.backends, Duration::from_secs(5)),
            self.debrid,
        )
        .clock(Arc::new(clock.clone()))
        .events(Arc::new(events.clone()));
        if let Some(metadata) = self.metadata {
            builder = builder.metadata(metadata);
        }
        if let Some(media_server) = self.media_server {
            builder = builder.media_server(media_server);
        }

        Fixture {
            ctx: builder.build(),
            clock,
            events,
            dir,
        }
    }
}
