// SPDX-License-Identifier: GPL-3.0-or-later
//! Content sources: where wanted movies and shows come from, and how they
//! become item rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use cinarr_config::{ContentSourceConfig, ContentSourceKind, SourceMediaFilter};
use cinarr_domain::{Item, ItemState, ReleaseDate, WantedItem, WantedKind};
use cinarr_infrastructure::repositories::UpsertOutcome;
use cinarr_infrastructure::state_files::{SourceCache, StateDir};
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::PipelineContext;
use crate::metadata::{ContentKind, ShowMetadata};
use crate::queues::release_due_at;

/// How long a processed external id is skipped on later runs.
pub const SOURCE_CACHE_TTL_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum ContentSourceError {
    #[error("content source {0} is not configured")]
    UnknownSource(String),
    #[error("content source {0} has no url")]
    MissingUrl(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {status}")]
    HttpStatus { status: u16 },
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error("no enabled overseerr source to take webhook requests")]
    NoWebhookSource,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Everything the source currently wants. `versions` is informational for
    /// sources that can filter upstream.
    async fn fetch(
        &self,
        config: &ContentSourceConfig,
        versions: &[String],
    ) -> Result<Vec<WantedItem>, ContentSourceError>;
}

// ============================================================================
// List sources
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ListMediaType {
    Movie,
    #[serde(alias = "tv", alias = "series")]
    Show,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    media_type: ListMediaType,
    #[serde(default, deserialize_with = "loose_id")]
    imdb_id: Option<String>,
    #[serde(default, deserialize_with = "loose_id")]
    tmdb_id: Option<String>,
    #[serde(default, deserialize_with = "loose_id")]
    tvdb_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    requested_seasons: Option<Vec<u32>>,
}

/// Ids arrive as strings or numbers; blanks count as absent.
fn loose_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(id_value(&Value::deserialize(deserializer)?))
}

fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl From<ListEntry> for WantedItem {
    fn from(entry: ListEntry) -> Self {
        WantedItem {
            media_type: match entry.media_type {
                ListMediaType::Movie => WantedKind::Movie,
                ListMediaType::Show => WantedKind::Show,
            },
            imdb_id: entry.imdb_id,
            tmdb_id: entry.tmdb_id,
            tvdb_id: entry.tvdb_id,
            title: entry.title,
            year: entry.year,
            requested_seasons: entry.requested_seasons,
            content_source_detail: None,
        }
    }
}

/// Polls a URL serving a JSON array of `{media_type, imdb_id|tmdb_id, ..}`.
pub struct ListUrlSource {
    client: Client,
}

impl ListUrlSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ContentSource for ListUrlSource {
    async fn fetch(
        &self,
        config: &ContentSourceConfig,
        _versions: &[String],
    ) -> Result<Vec<WantedItem>, ContentSourceError> {
        let url = config.url.as_deref().ok_or_else(|| {
            ContentSourceError::MissingUrl(config.display_name.clone().unwrap_or_default())
        })?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ContentSourceError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ContentSourceError::HttpStatus {
                status: response.status().as_u16(),
            });
        }
        let entries: Vec<ListEntry> = response
            .json()
            .await
            .map_err(|e| ContentSourceError::Payload(e.to_string()))?;
        Ok(entries.into_iter().map(WantedItem::from).collect())
    }
}

/// Ids written straight into the configuration. `tt` ids are IMDb, anything
/// else is taken as a TMDB id.
#[derive(Debug, Clone, Default)]
pub struct StaticListSource;

fn wanted_from_id(id: &str, kind: WantedKind) -> WantedItem {
    let id = id.trim();
    let mut wanted = WantedItem::movie(id);
    wanted.media_type = kind;
    if !id.starts_with("tt") {
        wanted.imdb_id = None;
        wanted.tmdb_id = Some(id.trim_start_matches("tmdb:").to_string());
    }
    wanted
}

#[async_trait]
impl ContentSource for StaticListSource {
    async fn fetch(
        &self,
        config: &ContentSourceConfig,
        _versions: &[String],
    ) -> Result<Vec<WantedItem>, ContentSourceError> {
        let movies = config.movies.iter().map(|id| wanted_from_id(id, WantedKind::Movie));
        let shows = config.shows.iter().map(|id| wanted_from_id(id, WantedKind::Show));
        Ok(movies.chain(shows).collect())
    }
}

// ============================================================================
// Overseerr webhook
// ============================================================================

/// Turn an Overseerr notification payload into a wanted item.
pub fn overseerr_webhook(payload: &Value) -> Result<WantedItem, ContentSourceError> {
    let media = payload
        .get("media")
        .ok_or_else(|| ContentSourceError::Payload("missing media".into()))?;
    let kind = match media.get("media_type").and_then(Value::as_str) {
        Some("movie") => WantedKind::Movie,
        Some("tv") | Some("show") => WantedKind::Show,
        other => {
            return Err(ContentSourceError::Payload(format!(
                "unsupported media_type {:?}",
                other
            )))
        }
    };
    let field = |key: &str| media.get(key).and_then(id_value);
    let imdb_id = field("imdbId");
    let tmdb_id = field("tmdbId");
    if imdb_id.is_none() && tmdb_id.is_none() {
        return Err(ContentSourceError::Payload("no imdb or tmdb id".into()));
    }

    let requested_seasons = payload
        .get("extra")
        .and_then(Value::as_array)
        .and_then(|extra| {
            extra.iter().find(|e| {
                e.get("name").and_then(Value::as_str) == Some("Requested Seasons")
            })
        })
        .and_then(|e| e.get("value").and_then(Value::as_str))
        .map(|value| {
            value
                .split(',')
                .filter_map(|s| s.trim().parse::<u32>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|seasons| !seasons.is_empty());

    Ok(WantedItem {
        media_type: kind,
        imdb_id,
        tmdb_id,
        tvdb_id: field("tvdbId"),
        title: payload
            .get("subject")
            .and_then(Value::as_str)
            .map(str::to_string),
        year: None,
        requested_seasons,
        content_source_detail: payload
            .get("request")
            .and_then(|r| r.get("requestedBy_username"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

// ============================================================================
// Cutoff
// ============================================================================

/// `YYYY-MM-DD`, or a whole number of days before `today`.
pub fn parse_cutoff(raw: &str, today: NaiveDate) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(days) = raw.parse::<i64>() {
        return today.checked_sub_signed(Duration::days(days));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// Local release date and airtime of an episode that first aired at `aired`.
pub(crate) fn episode_release(
    aired: Option<DateTime<Utc>>,
    show: &ShowMetadata,
) -> (ReleaseDate, Option<NaiveTime>) {
    let Some(aired) = aired else {
        return (ReleaseDate::Unknown, show.airtime);
    };
    match show.airs_timezone.as_deref().and_then(|tz| tz.parse::<Tz>().ok()) {
        Some(tz) => {
            let local = aired.with_timezone(&tz);
            (
                ReleaseDate::Known(local.date_naive()),
                show.airtime.or(Some(local.time())),
            )
        }
        None => (ReleaseDate::Known(aired.date_naive()), show.airtime),
    }
}

// ============================================================================
// Driver
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRunReport {
    pub fetched: usize,
    pub skipped_cached: usize,
    pub skipped_filtered: usize,
    pub inserted: usize,
    pub existing: usize,
}

/// Fetches each configured source and upserts what it wants.
pub struct ContentSourceDriver {
    ctx: PipelineContext,
    sources: BTreeMap<String, Arc<dyn ContentSource>>,
}

impl ContentSourceDriver {
    /// One source per enabled entry of the configuration. Overseerr sources
    /// are push-only and get no poller.
    pub fn from_config(ctx: PipelineContext, client: Client) -> Self {
        let mut sources: BTreeMap<String, Arc<dyn ContentSource>> = BTreeMap::new();
        for (id, config) in ctx.config.content_sources.iter().filter(|(_, c)| c.enabled) {
            match config.kind {
                ContentSourceKind::ListUrl => {
                    sources.insert(id.clone(), Arc::new(ListUrlSource::new(client.clone())));
                }
                ContentSourceKind::StaticList => {
                    sources.insert(id.clone(), Arc::new(StaticListSource));
                }
                ContentSourceKind::Overseerr => {}
            }
        }
        Self { ctx, sources }
    }

    pub fn with_source(mut self, id: impl Into<String>, source: Arc<dyn ContentSource>) -> Self {
        self.sources.insert(id.into(), source);
        self
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// Scheduler task name for a source.
    pub fn task_name(source_id: &str) -> String {
        format!("task_{}_wanted", source_id)
    }

    pub async fn run(&self, source_id: &str) -> Result<SourceRunReport> {
        let config = self
            .ctx
            .config
            .content_sources
            .get(source_id)
            .ok_or_else(|| ContentSourceError::UnknownSource(source_id.to_string()))?;
        let source = self
            .sources
            .get(source_id)
            .ok_or_else(|| ContentSourceError::UnknownSource(source_id.to_string()))?;
        let versions = self.versions_for(config);
        let wanted = source.fetch(config, &versions).await?;
        self.ingest(source_id, config, &versions, wanted).await
    }

    /// Accept an Overseerr request on behalf of the first enabled Overseerr source.
    pub async fn handle_webhook(&self, payload: &Value) -> Result<SourceRunReport> {
        let (id, config) = self
            .ctx
            .config
            .content_sources
            .iter()
            .find(|(_, c)| c.enabled && c.kind == ContentSourceKind::Overseerr)
            .ok_or(ContentSourceError::NoWebhookSource)?;
        let wanted = overseerr_webhook(payload)?;
        info!(target: "content_source", source = %id, id = ?wanted.external_id(), "webhook request received");
        let versions = self.versions_for(config);
        let processed = self.ingest_uncached(id, config, &versions, vec![wanted]).await?;
        Ok(processed.report)
    }

    fn versions_for(&self, config: &ContentSourceConfig) -> Vec<String> {
        if config.versions.is_empty() {
            self.ctx.config.scraping.versions.keys().cloned().collect()
        } else {
            config.versions.clone()
        }
    }

    async fn ingest(
        &self,
        source_id: &str,
        config: &ContentSourceConfig,
        versions: &[String],
        wanted: Vec<WantedItem>,
    ) -> Result<SourceRunReport> {
        let now = self.ctx.now();
        let ttl = Duration::hours(SOURCE_CACHE_TTL_HOURS);
        let cache_name = StateDir::source_cache_name(source_id);
        let mut cache: SourceCache = self.ctx.state.read_or_default(&cache_name);

        let mut report = SourceRunReport {
            fetched: wanted.len(),
            ..SourceRunReport::default()
        };
        let mut fresh = Vec::new();
        for item in wanted {
            match item.external_id() {
                Some(key) if cache.is_fresh(&key, now, ttl) => report.skipped_cached += 1,
                _ => fresh.push(item),
            }
        }

        let processed = self.ingest_uncached(source_id, config, versions, fresh).await?;
        for key in &processed.keys {
            cache.mark(key.clone(), now);
        }
        self.ctx.state.write_json(&cache_name, &cache)?;

        report.skipped_filtered = processed.report.skipped_filtered;
        report.inserted = processed.report.inserted;
        report.existing = processed.report.existing;
        info!(
            target: "content_source",
            source = %source_id,
            fetched = report.fetched,
            cached = report.skipped_cached,
            inserted = report.inserted,
            "content source processed"
        );
        Ok(report)
    }

    async fn ingest_uncached(
        &self,
        source_id: &str,
        config: &ContentSourceConfig,
        versions: &[String],
        wanted: Vec<WantedItem>,
    ) -> Result<Processed> {
        let today = self.ctx.now().date_naive();
        let cutoff = config
            .cutoff_date
            .as_deref()
            .and_then(|raw| parse_cutoff(raw, today));
        let mut processed = Processed::default();
        processed.report.fetched = wanted.len();

        for item in wanted {
            let media_ok = match (config.media_type, item.media_type) {
                (SourceMediaFilter::All, _) => true,
                (SourceMediaFilter::Movies, kind) => kind == WantedKind::Movie,
                (SourceMediaFilter::Shows, kind) => kind == WantedKind::Show,
            };
            if !media_ok {
                processed.report.skipped_filtered += 1;
                continue;
            }

            let rows = match self.enrich(&item).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(target: "content_source", source = %source_id, id = ?item.external_id(), error = %err, "could not enrich wanted item");
                    continue;
                }
            };
            let rows: Vec<Item> = rows
                .into_iter()
                .filter(|row| match (cutoff, row.release_date.date()) {
                    (Some(cutoff), Some(date)) => date >= cutoff,
                    _ => true,
                })
                .collect();
            if rows.is_empty() {
                processed.report.skipped_filtered += 1;
                processed.keys.extend(item.external_id());
                continue;
            }

            for row in rows {
                for version in versions {
                    let mut row = row.clone().with_version(version.as_str());
                    row.content_source = Some(source_id.to_string());
                    row.content_source_detail = item
                        .content_source_detail
                        .clone()
                        .or_else(|| config.display_name.clone());
                    self.stamp_initial_state(&mut row);
                    match self.ctx.repos.items.upsert_wanted(row).await? {
                        UpsertOutcome::Inserted(id) => {
                            debug!(target: "content_source", item_id = %id, "wanted item inserted");
                            processed.report.inserted += 1;
                        }
                        UpsertOutcome::Existing(..) => processed.report.existing += 1,
                    }
                }
            }
            processed.keys.extend(item.external_id());
        }
        Ok(processed)
    }

    fn stamp_initial_state(&self, row: &mut Item) {
        let now = self.ctx.now();
        row.state = match release_due_at(row, &self.ctx.config.queue) {
            Some(due) if now < due => ItemState::Unreleased,
            _ => ItemState::Wanted,
        };
        row.last_state_change = now;
        row.last_updated = now;
    }

    /// One canonical row per movie, one per aired or announced episode.
    async fn enrich(&self, wanted: &WantedItem) -> Result<Vec<Item>> {
        let kind = match wanted.media_type {
            WantedKind::Movie => ContentKind::Movie,
            WantedKind::Show => ContentKind::Show,
        };
        let imdb_id = match (&wanted.imdb_id, &wanted.tmdb_id) {
            (Some(imdb), _) => imdb.clone(),
            (None, Some(tmdb)) => self
                .ctx
                .metadata
                .tmdb_to_imdb(tmdb, kind)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no imdb id for tmdb {}", tmdb))?,
            (None, None) => anyhow::bail!("wanted item without ids"),
        };

        match wanted.media_type {
            WantedKind::Movie => Ok(vec![self.enrich_movie(wanted, &imdb_id).await?]),
            WantedKind::Show => self.enrich_show(wanted, &imdb_id).await,
        }
    }

    async fn enrich_movie(&self, wanted: &WantedItem, imdb_id: &str) -> Result<Item> {
        match self.ctx.metadata.movie_metadata(imdb_id).await {
            Ok(meta) => {
                let mut item = Item::new_movie(meta.title, imdb_id, meta.year.unwrap_or_default());
                item.year = meta.year.or(wanted.year);
                item.tmdb_id = meta.tmdb_id.or_else(|| wanted.tmdb_id.clone());
                item.release_date = meta
                    .release_date
                    .as_deref()
                    .map(ReleaseDate::parse_str)
                    .unwrap_or(ReleaseDate::Unknown);
                item.genres = meta.genres;
                item.runtime_minutes = meta.runtime_minutes;
                item.country = meta.country;
                Ok(item)
            }
            Err(err) => {
                let Some(title) = wanted.title.clone() else {
                    return Err(err.into());
                };
                debug!(target: "content_source", imdb_id, error = %err, "movie metadata missing; using source fields");
                let mut item = Item::new_movie(title, imdb_id, wanted.year.unwrap_or_default());
                item.year = wanted.year;
                item.tmdb_id = wanted.tmdb_id.clone();
                Ok(item)
            }
        }
    }

    async fn enrich_show(&self, wanted: &WantedItem, imdb_id: &str) -> Result<Vec<Item>> {
        let show = self.ctx.metadata.show_metadata(imdb_id).await?;
        let seasons = wanted.requested_seasons.as_deref();
        let mut rows = Vec::new();
        for (&season, meta) in show.seasons.range(1..) {
            if seasons.is_some_and(|requested| !requested.contains(&season)) {
                continue;
            }
            for (&episode, ep) in &meta.episodes {
                let mut item = Item::new_episode(show.title.clone(), imdb_id, season, episode);
                item.tmdb_id = show.tmdb_id.clone().or_else(|| wanted.tmdb_id.clone());
                item.tvdb_id = show.tvdb_id.clone().or_else(|| wanted.tvdb_id.clone());
                item.year = show.year;
                item.genres = show.genres.clone();
                item.country = show.country.clone();
                item.runtime_minutes = ep.runtime_minutes.or(show.runtime_minutes);
                item.airs_timezone = show.airs_timezone.clone();
                item.episode_title = ep.title.clone();
                let (release_date, airtime) = episode_release(ep.first_aired, &show);
                item.release_date = release_date;
                item.airtime = airtime;
                rows.push(item);
            }
        }
        Ok(rows)
    }
}

#[derive(Debug, Default)]
struct Processed {
    report: SourceRunReport,
    keys: Vec<String>,
}
