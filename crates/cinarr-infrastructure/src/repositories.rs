// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use cinarr_domain::{
    Item, ItemId, ItemState, MediaType, RemovalRecord, RemovalStatus, SymlinkVerification,
    TorrentTrackingRecord, TvShowStatus, TvShowVersionStatus,
};
use sqlx::SqlitePool;

use crate::sqlite_adapters::{
    SqliteAliasRepository, SqliteItemRepository, SqliteNotWantedRepository,
    SqliteRemovalQueueRepository, SqliteShowStatusRepository, SqliteSymlinkVerificationRepository,
    SqliteTorrentTrackingRepository,
};

// ============================================================================
// Query helpers
// ============================================================================

/// Identity used to find the rows of one logical item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemLookup {
    pub imdb_id: String,
    pub media_type: MediaType,
    pub season_number: Option<u32>,
    pub episode_number: Option<u32>,
    /// Compared against the stored version with `*` trimmed; an empty string
    /// matches rows without a version. `None` matches any version.
    pub version: Option<String>,
}

impl ItemLookup {
    pub fn for_item(item: &Item) -> Self {
        Self {
            imdb_id: item.imdb_id.clone().unwrap_or_default(),
            media_type: item.media_type,
            season_number: item.season_number,
            episode_number: item.episode_number,
            version: Some(item.version_stripped().unwrap_or_default().to_string()),
        }
    }

    pub fn any_version(mut self) -> Self {
        self.version = None;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(ItemId),
    Existing(ItemId, ItemState),
}

/// A Checking row that absorbed a duplicate sharing its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollapsedPair {
    pub kept: ItemId,
    pub deleted: ItemId,
}

/// Key of a promoted search alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AliasKey {
    pub tmdb_id: String,
    pub imdb_id: String,
    pub content_type: MediaType,
    pub season_number: Option<u32>,
}

// ============================================================================
// Repository Traits
// ============================================================================

/// The item store. Every state mutation of the pipeline goes through here.
#[async_trait::async_trait]
pub trait ItemRepository: Send + Sync {
    async fn insert(&self, item: Item) -> Result<Item>;
    async fn get(&self, id: ItemId) -> Result<Option<Item>>;
    async fn update(&self, item: &Item) -> Result<()>;
    /// Move an item to `to`, stamping `last_state_change`. Entering Final_Check
    /// sets `final_check_add_timestamp`; entering Collected sets `collected_at`.
    async fn transition(&self, id: ItemId, to: ItemState, now: DateTime<Utc>) -> Result<()>;
    async fn list_by_state(&self, state: ItemState) -> Result<Vec<Item>>;
    async fn list_by_states(&self, states: &[ItemState]) -> Result<Vec<Item>>;
    async fn find_by_filled_file(&self, file: &str) -> Result<Vec<Item>>;
    async fn find_matching(&self, lookup: &ItemLookup) -> Result<Vec<Item>>;
    async fn list_show_episodes(&self, imdb_id: &str, season: Option<u32>) -> Result<Vec<Item>>;
    async fn delete_many(&self, ids: &[ItemId]) -> Result<u64>;
    /// File-path dedup: every Checking row absorbs non-Checking rows that share
    /// its `filled_by_file`, taking over their `location_on_disk` when it has
    /// none. Each pair is applied in its own transaction. Kept rows stay in
    /// Checking; collecting them is the caller's job.
    async fn collapse_checking_duplicates(&self, now: DateTime<Utc>) -> Result<Vec<CollapsedPair>>;
    /// Insert unless a row with the same imdb id, type, season, episode and
    /// stripped version already exists.
    async fn upsert_wanted(&self, item: Item) -> Result<UpsertOutcome>;
    async fn count_by_state(&self) -> Result<BTreeMap<ItemState, i64>>;
    async fn health_check(&self) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait ShowStatusRepository: Send + Sync {
    async fn get_status(&self, imdb_id: &str) -> Result<Option<TvShowStatus>>;
    async fn upsert_status(&self, status: &TvShowStatus) -> Result<()>;
    async fn get_version_status(
        &self,
        imdb_id: &str,
        version: &str,
    ) -> Result<Option<TvShowVersionStatus>>;
    async fn upsert_version_status(&self, status: &TvShowVersionStatus) -> Result<()>;
}

/// Append-only set of magnets and URLs that must never be chosen again.
#[async_trait::async_trait]
pub trait NotWantedRepository: Send + Sync {
    async fn add(&self, value: &str) -> Result<()>;
    async fn contains(&self, value: &str) -> Result<bool>;
    async fn all(&self) -> Result<HashSet<String>>;
}

#[async_trait::async_trait]
pub trait RemovalQueueRepository: Send + Sync {
    async fn enqueue(
        &self,
        item_path: &str,
        item_title: &str,
        episode_title: Option<&str>,
    ) -> Result<RemovalRecord>;
    async fn list_by_status(&self, status: RemovalStatus) -> Result<Vec<RemovalRecord>>;
    /// Bump the attempt counter and store the resulting status.
    async fn record_attempt(&self, id: i64, status: RemovalStatus) -> Result<()>;
}

#[async_trait::async_trait]
pub trait TorrentTrackingRepository: Send + Sync {
    async fn record(&self, record: &TorrentTrackingRecord) -> Result<()>;
    async fn get(&self, info_hash: &str) -> Result<Option<TorrentTrackingRecord>>;
    /// Point every record of `old_id` at `new_id`; returns rows touched.
    async fn migrate_torrent_id(&self, old_id: &str, new_id: &str) -> Result<u64>;
}

#[async_trait::async_trait]
pub trait AliasRepository: Send + Sync {
    async fn get_preferred(&self, key: &AliasKey) -> Result<Option<String>>;
    async fn set_preferred(&self, key: &AliasKey, alias: &str) -> Result<()>;
}

#[async_trait::async_trait]
pub trait SymlinkVerificationRepository: Send + Sync {
    async fn add(&self, item_id: ItemId, symlink_path: &str) -> Result<i64>;
    /// Unverified entries, newest first; `limit = None` returns all of them.
    async fn list_unverified(&self, limit: Option<i64>) -> Result<Vec<SymlinkVerification>>;
    async fn mark_verified(&self, id: i64, now: DateTime<Utc>) -> Result<()>;
    async fn record_attempt(&self, id: i64, now: DateTime<Utc>) -> Result<()>;
}

// ============================================================================
// Bundle
// ============================================================================

/// Every store the pipeline talks to, shared behind trait objects.
#[derive(Clone)]
pub struct Repositories {
    pub items: Arc<dyn ItemRepository>,
    pub show_status: Arc<dyn ShowStatusRepository>,
    pub not_wanted: Arc<dyn NotWantedRepository>,
    pub removals: Arc<dyn RemovalQueueRepository>,
    pub torrents: Arc<dyn TorrentTrackingRepository>,
    pub aliases: Arc<dyn AliasRepository>,
    pub symlinks: Arc<dyn SymlinkVerificationRepository>,
}

impl Repositories {
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self {
            items: Arc::new(SqliteItemRepository::new(pool.clone())),
            show_status: Arc::new(SqliteShowStatusRepository::new(pool.clone())),
            not_wanted: Arc::new(SqliteNotWantedRepository::new(pool.clone())),
            removals: Arc::new(SqliteRemovalQueueRepository::new(pool.clone())),
            torrents: Arc::new(SqliteTorrentTrackingRepository::new(pool.clone())),
            aliases: Arc::new(SqliteAliasRepository::new(pool.clone())),
            symlinks: Arc::new(SqliteSymlinkVerificationRepository::new(pool)),
        }
    }
}
