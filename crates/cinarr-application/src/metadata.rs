// SPDX-License-Identifier: GPL-3.0-or-later
//! Metadata collaborator: id conversion, show and movie details, scene
//! numbering, translations and aliases.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use cinarr_domain::ShowStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("no metadata for {0}")]
    NotFound(String),
    #[error("metadata provider unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMeta {
    pub first_aired: Option<DateTime<Utc>>,
    pub title: Option<String>,
    #[serde(default)]
    pub runtime_minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeasonMeta {
    /// Declared count; falls back to the number of listed episodes.
    pub episode_count: Option<u32>,
    pub episodes: BTreeMap<u32, EpisodeMeta>,
}

impl SeasonMeta {
    pub fn count(&self) -> u32 {
        self.episode_count
            .unwrap_or_else(|| self.episodes.len() as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TvdbNumbering {
    pub season: u32,
    pub episode: u32,
    pub absolute: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneNumbering {
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XemEntry {
    pub tvdb: TvdbNumbering,
    pub scene: SceneNumbering,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShowMetadata {
    pub imdb_id: String,
    pub tmdb_id: Option<String>,
    pub tvdb_id: Option<String>,
    pub title: String,
    pub year: Option<i32>,
    pub genres: Vec<String>,
    pub country: Option<String>,
    pub status: Option<String>,
    pub airs_timezone: Option<String>,
    pub airtime: Option<NaiveTime>,
    pub runtime_minutes: Option<u32>,
    pub seasons: BTreeMap<u32, SeasonMeta>,
    #[serde(default)]
    pub xem_mapping: Vec<XemEntry>,
}

impl ShowMetadata {
    pub fn season_episode_count(&self, season: u32) -> Option<u32> {
        self.seasons.get(&season).map(SeasonMeta::count)
    }

    pub fn episode(&self, season: u32, episode: u32) -> Option<&EpisodeMeta> {
        self.seasons.get(&season)?.episodes.get(&episode)
    }

    /// Absolute number of `(season, episode)` counting every regular season
    /// before it. Specials (season 0) never count.
    pub fn absolute_episode(&self, season: u32, episode: u32) -> Option<u32> {
        if season == 0 {
            return None;
        }
        let mut total = 0;
        for s in 1..season {
            total += self.season_episode_count(s)?;
        }
        Some(total + episode)
    }

    /// Inverse of [`absolute_episode`](Self::absolute_episode).
    pub fn from_absolute(&self, absolute: u32) -> Option<(u32, u32)> {
        let mut remaining = absolute;
        for (&season, meta) in self.seasons.range(1..) {
            let count = meta.count();
            if count == 0 {
                continue;
            }
            if remaining <= count {
                return Some((season, remaining));
            }
            remaining -= count;
        }
        None
    }

    pub fn show_status(&self) -> ShowStatus {
        self.status
            .as_deref()
            .map(ShowStatus::parse)
            .unwrap_or(ShowStatus::Unknown)
    }

    pub fn total_episodes(&self) -> u32 {
        self.seasons.range(1..).map(|(_, s)| s.count()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovieMetadata {
    pub imdb_id: String,
    pub tmdb_id: Option<String>,
    pub title: String,
    pub year: Option<i32>,
    pub release_date: Option<String>,
    pub genres: Vec<String>,
    pub runtime_minutes: Option<u32>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Movie,
    Show,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn imdb_to_tmdb(&self, imdb_id: &str, kind: ContentKind) -> Result<Option<String>, MetadataError>;
    async fn tmdb_to_imdb(&self, tmdb_id: &str, kind: ContentKind) -> Result<Option<String>, MetadataError>;
    async fn show_metadata(&self, imdb_id: &str) -> Result<ShowMetadata, MetadataError>;
    async fn movie_metadata(&self, imdb_id: &str) -> Result<MovieMetadata, MetadataError>;
    /// Title in `language` (ISO 639-1), if the provider has one.
    async fn translate_title(
        &self,
        imdb_id: &str,
        kind: ContentKind,
        language: &str,
    ) -> Result<Option<String>, MetadataError>;
    /// Alternative titles keyed by country code.
    async fn aliases(
        &self,
        imdb_id: &str,
        kind: ContentKind,
    ) -> Result<BTreeMap<String, Vec<String>>, MetadataError>;
}

/// Provider used when no metadata backend is configured; every lookup misses
/// and enrichment falls back to what the content source supplied.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredMetadata;

#[async_trait]
impl MetadataProvider for UnconfiguredMetadata {
    async fn imdb_to_tmdb(&self, _imdb_id: &str, _kind: ContentKind) -> Result<Option<String>, MetadataError> {
        Ok(None)
    }

    async fn tmdb_to_imdb(&self, _tmdb_id: &str, _kind: ContentKind) -> Result<Option<String>, MetadataError> {
        Ok(None)
    }

    async fn show_metadata(&self, imdb_id: &str) -> Result<ShowMetadata, MetadataError> {
        Err(MetadataError::NotFound(imdb_id.to_string()))
    }

    async fn movie_metadata(&self, imdb_id: &str) -> Result<MovieMetadata, MetadataError> {
        Err(MetadataError::NotFound(imdb_id.to_string()))
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

// ============================================================================
// Scene numbering
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneMapping {
    pub season: u32,
    pub episode: u32,
    /// Came from the absolute-number fallback rather than a direct match.
    pub via_absolute: bool,
}

/// Scene numbering for a TVDB `(season, episode)`, or `None` when the show has
/// no mapping for it.
pub fn resolve_scene_numbering(
    show: &ShowMetadata,
    season: u32,
    episode: u32,
    anime: bool,
) -> Option<SceneMapping> {
    if show.xem_mapping.is_empty() {
        return None;
    }

    let direct = show
        .xem_mapping
        .iter()
        .find(|e| e.tvdb.season == season && e.tvdb.episode == episode);
    if let Some(entry) = direct {
        if let (Some(s), Some(e)) = (entry.scene.season, entry.scene.episode) {
            return Some(SceneMapping {
                season: s,
                episode: e,
                via_absolute: false,
            });
        }
    }

    let absolute = show.absolute_episode(season, episode)?;
    let entry = show
        .xem_mapping
        .iter()
        .find(|e| e.tvdb.absolute == Some(absolute))?;
    if anime {
        return Some(SceneMapping {
            season: entry.scene.season.unwrap_or(season),
            episode: absolute,
            via_absolute: true,
        });
    }
    match (entry.scene.season, entry.scene.episode) {
        (Some(s), Some(e)) => Some(SceneMapping {
            season: s,
            episode: e,
            via_absolute: true,
        }),
        _ => None,
    }
}
