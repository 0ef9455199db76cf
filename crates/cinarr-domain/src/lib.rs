// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Value Objects & IDs
// ============================================================================

/// Store-assigned numeric identifier of a media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub i64);

impl ItemId {
    /// Placeholder id carried by items that have not been inserted yet.
    pub const UNSAVED: ItemId = ItemId(0);

    pub fn is_saved(&self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trims the trailing `*` that marks a soft version.
pub fn strip_version(raw: &str) -> &str {
    raw.trim_end_matches('*')
}

/// Whether a version identifier carries the soft `*` marker.
pub fn is_soft_version(raw: &str) -> bool {
    raw.ends_with('*')
}

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Episode,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Episode => "episode",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "movie" => Some(Self::Movie),
            "episode" | "tv" | "show" => Some(Self::Episode),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative lifecycle state of an item. Every state doubles as a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ItemState {
    Wanted,
    Scraping,
    Adding,
    Checking,
    Sleeping,
    Unreleased,
    #[serde(rename = "Pending Uncached")]
    PendingUncached,
    Upgrading,
    Blacklisted,
    #[serde(rename = "Final_Check")]
    FinalCheck,
    Collected,
}

impl ItemState {
    pub const ALL: [ItemState; 11] = [
        ItemState::Wanted,
        ItemState::Scraping,
        ItemState::Adding,
        ItemState::Checking,
        ItemState::Sleeping,
        ItemState::Unreleased,
        ItemState::PendingUncached,
        ItemState::Upgrading,
        ItemState::Blacklisted,
        ItemState::FinalCheck,
        ItemState::Collected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wanted => "Wanted",
            Self::Scraping => "Scraping",
            Self::Adding => "Adding",
            Self::Checking => "Checking",
            Self::Sleeping => "Sleeping",
            Self::Unreleased => "Unreleased",
            Self::PendingUncached => "Pending Uncached",
            Self::Upgrading => "Upgrading",
            Self::Blacklisted => "Blacklisted",
            Self::FinalCheck => "Final_Check",
            Self::Collected => "Collected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(value.trim()))
    }

    /// Collected and Blacklisted only move again on an upgrade or fallback trigger.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Collected | Self::Blacklisted)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "Unknown")]
    Unknown,
    #[serde(rename = "480p")]
    R480p,
    #[serde(rename = "720p")]
    R720p,
    #[serde(rename = "1080p")]
    R1080p,
    #[serde(rename = "2160p")]
    R2160p,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::R480p => "480p",
            Self::R720p => "720p",
            Self::R1080p => "1080p",
            Self::R2160p => "2160p",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "480p" | "sd" => Some(Self::R480p),
            "720p" => Some(Self::R720p),
            "1080p" => Some(Self::R1080p),
            "2160p" | "4k" | "uhd" => Some(Self::R2160p),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Ordinal rank used for comparisons; Unknown ranks below every real resolution.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::R480p => 1,
            Self::R720p => 2,
            Self::R1080p => 3,
            Self::R2160p => 4,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowStatus {
    Returning,
    Ended,
    Canceled,
    Unknown,
}

impl ShowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Returning => "returning",
            Self::Ended => "ended",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "returning" | "returning series" | "continuing" => Self::Returning,
            "ended" => Self::Ended,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalStatus {
    Pending,
    Verified,
    Failed,
}

impl RemovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Verified => "Verified",
            Self::Failed => "Failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(Self::Pending),
            "Verified" => Some(Self::Verified),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

// ============================================================================
// Release dates
// ============================================================================

/// Item release date; the store keeps the literal `Unknown` when metadata has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseDate {
    Known(NaiveDate),
    Unknown,
}

impl ReleaseDate {
    /// Parse `YYYY-MM-DD`, an RFC 3339 timestamp, or `Unknown`.
    ///
    /// Years outside 1900-2100 are treated as unknown.
    pub fn parse_str(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("unknown") || s.eq_ignore_ascii_case("none") {
            return Self::Unknown;
        }

        let date = if s.len() > 10 {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc).date_naive())
                .ok()
        } else {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
        };

        match date {
            Some(d) if (1900..=2100).contains(&d.year()) => Self::Known(d),
            _ => Self::Unknown,
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            Self::Known(d) => Some(*d),
            Self::Unknown => None,
        }
    }

    pub fn to_iso8601(&self) -> String {
        match self {
            Self::Known(d) => d.format("%Y-%m-%d").to_string(),
            Self::Unknown => "Unknown".to_string(),
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A scraped release carried from Scraping to Adding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub title: String,
    pub magnet: String,
    pub size_gb: f64,
    pub source: String,
    pub score: f64,
    /// Accepted only under the relaxed rules of a soft (`*`) version.
    #[serde(default)]
    pub soft: bool,
    /// Scene numbering applied when the result was accepted.
    #[serde(default)]
    pub scene_season: Option<u32>,
    #[serde(default)]
    pub scene_episode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub imdb_id: Option<String>,
    pub tmdb_id: Option<String>,
    pub tvdb_id: Option<String>,
    pub media_type: MediaType,
    pub title: String,
    pub year: Option<i32>,
    pub genres: Vec<String>,
    pub runtime_minutes: Option<u32>,
    pub country: Option<String>,
    pub release_date: ReleaseDate,
    pub airtime: Option<NaiveTime>,
    pub airs_timezone: Option<String>,
    pub season_number: Option<u32>,
    pub episode_number: Option<u32>,
    pub episode_title: Option<String>,
    /// Raw version identifier, possibly ending in `*`.
    pub version: Option<String>,
    pub state: ItemState,
    pub content_source: Option<String>,
    pub content_source_detail: Option<String>,
    pub filled_by_title: Option<String>,
    pub filled_by_file: Option<String>,
    pub filled_by_magnet: Option<String>,
    pub filled_by_torrent_id: Option<String>,
    pub original_scraped_torrent_title: Option<String>,
    pub real_debrid_original_title: Option<String>,
    pub location_on_disk: Option<String>,
    pub scrape_results: Vec<StoredResult>,
    pub upgrading_from_file: Option<String>,
    pub upgrading_from_torrent_id: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub last_state_change: DateTime<Utc>,
    pub collected_at: Option<DateTime<Utc>>,
    pub final_check_add_timestamp: Option<DateTime<Utc>>,
    pub sleep_until: Option<DateTime<Utc>>,
    pub scrape_attempts: u32,
    pub wake_count: u32,
}

impl Item {
    fn blank(media_type: MediaType, title: String, imdb_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ItemId::UNSAVED,
            imdb_id,
            tmdb_id: None,
            tvdb_id: None,
            media_type,
            title,
            year: None,
            genres: Vec::new(),
            runtime_minutes: None,
            country: None,
            release_date: ReleaseDate::Unknown,
            airtime: None,
            airs_timezone: None,
            season_number: None,
            episode_number: None,
            episode_title: None,
            version: None,
            state: ItemState::Wanted,
            content_source: None,
            content_source_detail: None,
            filled_by_title: None,
            filled_by_file: None,
            filled_by_magnet: None,
            filled_by_torrent_id: None,
            original_scraped_torrent_title: None,
            real_debrid_original_title: None,
            location_on_disk: None,
            scrape_results: Vec::new(),
            upgrading_from_file: None,
            upgrading_from_torrent_id: None,
            last_updated: now,
            last_state_change: now,
            collected_at: None,
            final_check_add_timestamp: None,
            sleep_until: None,
            scrape_attempts: 0,
            wake_count: 0,
        }
    }

    pub fn new_movie(title: impl Into<String>, imdb_id: impl Into<String>, year: i32) -> Self {
        let mut item = Self::blank(MediaType::Movie, title.into(), Some(imdb_id.into()));
        item.year = Some(year);
        item
    }

    pub fn new_episode(
        title: impl Into<String>,
        imdb_id: impl Into<String>,
        season: u32,
        episode: u32,
    ) -> Self {
        let mut item = Self::blank(MediaType::Episode, title.into(), Some(imdb_id.into()));
        item.season_number = Some(season);
        item.episode_number = Some(episode);
        item
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Version with the soft marker removed; the grouping key for duplicates.
    pub fn version_stripped(&self) -> Option<&str> {
        self.version.as_deref().map(strip_version)
    }

    pub fn is_soft_version(&self) -> bool {
        self.version.as_deref().map(is_soft_version).unwrap_or(false)
    }

    pub fn is_anime(&self) -> bool {
        self.genres.iter().any(|g| g.eq_ignore_ascii_case("anime"))
    }

    pub fn grouping_key(&self) -> GroupingKey {
        GroupingKey {
            imdb_id: self.imdb_id.clone().unwrap_or_default(),
            version: self.version_stripped().unwrap_or_default().to_string(),
            season_number: self.season_number,
            episode_number: self.episode_number,
        }
    }

    /// Human readable label used in logs and notifications.
    pub fn display_label(&self) -> String {
        match (self.media_type, self.season_number, self.episode_number) {
            (MediaType::Episode, Some(s), Some(e)) => {
                format!("{} S{:02}E{:02}", self.title, s, e)
            }
            _ => match self.year {
                Some(y) => format!("{} ({})", self.title, y),
                None => self.title.clone(),
            },
        }
    }

    pub fn clear_fill(&mut self) {
        self.filled_by_title = None;
        self.filled_by_file = None;
        self.filled_by_magnet = None;
        self.filled_by_torrent_id = None;
        self.original_scraped_torrent_title = None;
        self.real_debrid_original_title = None;
        self.location_on_disk = None;
    }
}

/// `(imdb_id, version-stripped, season, episode)` identity of a logical item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupingKey {
    pub imdb_id: String,
    pub version: String,
    pub season_number: Option<u32>,
    pub episode_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TvShowStatus {
    pub imdb_id: String,
    pub status: ShowStatus,
    pub is_complete: bool,
    pub total_episodes: u32,
    pub last_status_check: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TvShowVersionStatus {
    pub imdb_id: String,
    /// Version identifier with the `*` trimmed.
    pub version_identifier: String,
    pub is_complete_and_present: bool,
    pub is_up_to_date: bool,
    pub present_episode_count: u32,
    pub last_checked: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalRecord {
    pub id: i64,
    pub item_path: String,
    pub item_title: String,
    pub episode_title: Option<String>,
    pub attempts: u32,
    pub status: RemovalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit record of why a torrent was added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentTrackingRecord {
    pub info_hash: String,
    pub torrent_id: Option<String>,
    pub item_id: Option<ItemId>,
    pub item_snapshot: Item,
    pub trigger_source: String,
    pub trigger_details: Option<String>,
    pub rationale: String,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkVerification {
    pub id: i64,
    pub item_id: ItemId,
    pub symlink_path: String,
    pub attempts: u32,
    pub verified: bool,
    pub added_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WantedKind {
    Movie,
    Show,
}

/// Minimal record a content source emits before metadata enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantedItem {
    pub media_type: WantedKind,
    pub imdb_id: Option<String>,
    pub tmdb_id: Option<String>,
    pub tvdb_id: Option<String>,
    pub title: Option<String>,
    pub year: Option<i32>,
    pub requested_seasons: Option<Vec<u32>>,
    pub content_source_detail: Option<String>,
}

impl WantedItem {
    pub fn movie(imdb_id: impl Into<String>) -> Self {
        Self {
            media_type: WantedKind::Movie,
            imdb_id: Some(imdb_id.into()),
            tmdb_id: None,
            tvdb_id: None,
            title: None,
            year: None,
            requested_seasons: None,
            content_source_detail: None,
        }
    }

    pub fn show(imdb_id: impl Into<String>) -> Self {
        Self {
            media_type: WantedKind::Show,
            ..Self::movie(imdb_id)
        }
    }

    /// Identifier used by the per-source cache.
    pub fn external_id(&self) -> Option<String> {
        self.imdb_id
            .clone()
            .or_else(|| self.tmdb_id.as_ref().map(|t| format!("tmdb:{}", t)))
            .or_else(|| self.tvdb_id.as_ref().map(|t| format!("tvdb:{}", t)))
    }
}

// ============================================================================
// Domain Validation
// ============================================================================

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Result<(), Vec<ValidationError>>;
}

impl Validate for Item {
    fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.title.trim().is_empty() {
            errors.push(ValidationError {
                field: "title",
                message: "title cannot be empty".into(),
            });
        }
        if self.imdb_id.is_none() && self.tmdb_id.is_none() {
            errors.push(ValidationError {
                field: "imdb_id",
                message: "an imdb or tmdb id is required".into(),
            });
        }
        if self.media_type == MediaType::Episode
            && (self.season_number.is_none() || self.episode_number.is_none())
        {
            errors.push(ValidationError {
                field: "episode_number",
                message: "episodes need a season and episode number".into(),
            });
        }
        if let Some(version) = &self.version {
            if strip_version(version).trim().is_empty() {
                errors.push(ValidationError {
                    field: "version",
                    message: "version cannot be only '*'".into(),
                });
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// ============================================================================
// Domain Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent<TPayload> {
    pub id: Uuid,
    pub name: &'static str,
    pub occurred_at: DateTime<Utc>,
    pub payload: TPayload,
}

impl<TPayload> DomainEvent<TPayload> {
    pub fn new(name: &'static str, payload: TPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            occurred_at: Utc::now(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemCollectedPayload {
    pub item_id: ItemId,
    pub title: String,
    pub media_type: MediaType,
    pub season_number: Option<u32>,
    pub episode_number: Option<u32>,
    pub version: Option<String>,
    pub filled_by_file: Option<String>,
    pub location_on_disk: Option<String>,
    pub is_upgrade: bool,
}

impl ItemCollectedPayload {
    pub fn from_item(item: &Item, is_upgrade: bool) -> Self {
        Self {
            item_id: item.id,
            title: item.title.clone(),
            media_type: item.media_type,
            season_number: item.season_number,
            episode_number: item.episode_number,
            version: item.version.clone(),
            filled_by_file: item.filled_by_file.clone(),
            location_on_disk: item.location_on_disk.clone(),
            is_upgrade,
        }
    }
}

pub type ItemCollected = DomainEvent<ItemCollectedPayload>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemStateChangedPayload {
    pub item_id: ItemId,
    pub from: ItemState,
    pub to: ItemState,
}

pub type ItemStateChanged = DomainEvent<ItemStateChangedPayload>;

// ============================================================================
// Tests
// ============================================================================
