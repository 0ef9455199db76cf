// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use cinarr_domain::{
    Item, ItemId, ItemState, MediaType, ReleaseDate, RemovalRecord, RemovalStatus, ShowStatus,
    StoredResult, SymlinkVerification, TorrentTrackingRecord, TvShowStatus, TvShowVersionStatus,
};
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::repositories::{
    AliasKey, AliasRepository, CollapsedPair, ItemLookup, ItemRepository, NotWantedRepository,
    RemovalQueueRepository, ShowStatusRepository, SymlinkVerificationRepository,
    TorrentTrackingRepository, UpsertOutcome,
};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const ITEM_COLUMNS: [&str; 36] = [
    "imdb_id",
    "tmdb_id",
    "tvdb_id",
    "type",
    "title",
    "year",
    "genres",
    "runtime",
    "country",
    "release_date",
    "airtime",
    "airs_timezone",
    "season_number",
    "episode_number",
    "episode_title",
    "version",
    "state",
    "content_source",
    "content_source_detail",
    "filled_by_title",
    "filled_by_file",
    "filled_by_magnet",
    "filled_by_torrent_id",
    "original_scraped_torrent_title",
    "real_debrid_original_title",
    "location_on_disk",
    "scrape_results",
    "upgrading_from_file",
    "upgrading_from_torrent_id",
    "last_updated",
    "last_state_change",
    "collected_at",
    "final_check_add_timestamp",
    "sleep_until",
    "scrape_attempts",
    "wake_count",
];

// ----------------------------------------------------------------------------
// Items
// ----------------------------------------------------------------------------

/// SQLx-backed item store
pub struct SqliteItemRepository {
    pool: SqlitePool,
}

impl SqliteItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_items(&self, sql: &str, binds: Vec<String>) -> Result<Vec<Item>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(row_to_item(&r)?);
        }
        Ok(out)
    }
}

fn insert_item_sql() -> String {
    format!(
        "INSERT INTO media_items ({}) VALUES ({})",
        ITEM_COLUMNS.join(", "),
        vec!["?"; ITEM_COLUMNS.len()].join(", ")
    )
}

fn update_item_sql() -> String {
    let sets: Vec<String> = ITEM_COLUMNS.iter().map(|c| format!("{} = ?", c)).collect();
    format!("UPDATE media_items SET {} WHERE id = ?", sets.join(", "))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn bind_item<'q>(query: SqliteQuery<'q>, item: &Item) -> Result<SqliteQuery<'q>> {
    Ok(query
        .bind(item.imdb_id.clone())
        .bind(item.tmdb_id.clone())
        .bind(item.tvdb_id.clone())
        .bind(item.media_type.as_str())
        .bind(item.title.clone())
        .bind(item.year.map(i64::from))
        .bind(serde_json::to_string(&item.genres)?)
        .bind(item.runtime_minutes.map(i64::from))
        .bind(item.country.clone())
        .bind(item.release_date.to_iso8601())
        .bind(item.airtime.map(|t| t.format("%H:%M").to_string()))
        .bind(item.airs_timezone.clone())
        .bind(item.season_number.map(i64::from))
        .bind(item.episode_number.map(i64::from))
        .bind(item.episode_title.clone())
        .bind(item.version.clone())
        .bind(item.state.as_str())
        .bind(item.content_source.clone())
        .bind(item.content_source_detail.clone())
        .bind(item.filled_by_title.clone())
        .bind(item.filled_by_file.clone())
        .bind(item.filled_by_magnet.clone())
        .bind(item.filled_by_torrent_id.clone())
        .bind(item.original_scraped_torrent_title.clone())
        .bind(item.real_debrid_original_title.clone())
        .bind(item.location_on_disk.clone())
        .bind(serde_json::to_string(&item.scrape_results)?)
        .bind(item.upgrading_from_file.clone())
        .bind(item.upgrading_from_torrent_id.clone())
        .bind(item.last_updated.to_rfc3339())
        .bind(item.last_state_change.to_rfc3339())
        .bind(item.collected_at.map(|d| d.to_rfc3339()))
        .bind(item.final_check_add_timestamp.map(|d| d.to_rfc3339()))
        .bind(item.sleep_until.map(|d| d.to_rfc3339()))
        .bind(i64::from(item.scrape_attempts))
        .bind(i64::from(item.wake_count)))
}

#[async_trait::async_trait]
impl ItemRepository for SqliteItemRepository {
    async fn insert(&self, mut item: Item) -> Result<Item> {
        debug!(target: "repository", title = %item.title, state = %item.state, "inserting item");
        let sql = insert_item_sql();
        let result = bind_item(sqlx::query(&sql), &item)?
            .execute(&self.pool)
            .await?;
        item.id = ItemId(result.last_insert_rowid());
        Ok(item)
    }

    async fn get(&self, id: ItemId) -> Result<Option<Item>> {
        debug!(target: "repository", item_id = %id, "fetching item by id");
        let row = sqlx::query("SELECT * FROM media_items WHERE id = ? LIMIT 1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_item(&r)).transpose()
    }

    async fn update(&self, item: &Item) -> Result<()> {
        if !item.id.is_saved() {
            return Err(anyhow!("cannot update an item that was never inserted"));
        }
        debug!(target: "repository", item_id = %item.id, "updating item");
        let sql = update_item_sql();
        bind_item(sqlx::query(&sql), item)?
            .bind(item.id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn transition(&self, id: ItemId, to: ItemState, now: DateTime<Utc>) -> Result<()> {
        debug!(target: "repository", item_id = %id, state = %to, "transitioning item");
        let stamp = now.to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE media_items SET
                state = ?,
                last_state_change = ?,
                last_updated = ?,
                final_check_add_timestamp = CASE WHEN ? = 'Final_Check' THEN ? ELSE final_check_add_timestamp END,
                collected_at = CASE WHEN ? = 'Collected' THEN ? ELSE collected_at END
            WHERE id = ?
            "#,
        )
        .bind(to.as_str())
        .bind(&stamp)
        .bind(&stamp)
        .bind(to.as_str())
        .bind(&stamp)
        .bind(to.as_str())
        .bind(&stamp)
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("item {} not found", id));
        }
        Ok(())
    }

    async fn list_by_state(&self, state: ItemState) -> Result<Vec<Item>> {
        self.list_by_states(&[state]).await
    }

    async fn list_by_states(&self, states: &[ItemState]) -> Result<Vec<Item>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM media_items WHERE state IN ({}) ORDER BY id",
            placeholders(states.len())
        );
        let binds = states.iter().map(|s| s.as_str().to_string()).collect();
        self.fetch_items(&sql, binds).await
    }

    async fn find_by_filled_file(&self, file: &str) -> Result<Vec<Item>> {
        debug!(target: "repository", file, "fetching items by filled file");
        self.fetch_items(
            "SELECT * FROM media_items WHERE filled_by_file = ? ORDER BY id",
            vec![file.to_string()],
        )
        .await
    }

    async fn find_matching(&self, lookup: &ItemLookup) -> Result<Vec<Item>> {
        let mut sql = String::from(
            "SELECT * FROM media_items WHERE imdb_id = ? AND type = ? \
             AND season_number IS ? AND episode_number IS ?",
        );
        if lookup.version.is_some() {
            sql.push_str(" AND RTRIM(COALESCE(version, ''), '*') = ?");
        }
        sql.push_str(" ORDER BY id");

        let mut query = sqlx::query(&sql)
            .bind(lookup.imdb_id.clone())
            .bind(lookup.media_type.as_str())
            .bind(lookup.season_number.map(i64::from))
            .bind(lookup.episode_number.map(i64::from));
        if let Some(version) = &lookup.version {
            query = query.bind(version.clone());
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(row_to_item(&r)?);
        }
        Ok(out)
    }

    async fn list_show_episodes(&self, imdb_id: &str, season: Option<u32>) -> Result<Vec<Item>> {
        let rows = match season {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM media_items WHERE imdb_id = ? AND type = 'episode' \
                     AND season_number = ? ORDER BY season_number, episode_number, id",
                )
                .bind(imdb_id)
                .bind(i64::from(s))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM media_items WHERE imdb_id = ? AND type = 'episode' \
                     ORDER BY season_number, episode_number, id",
                )
                .bind(imdb_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(row_to_item(&r)?);
        }
        Ok(out)
    }

    async fn delete_many(&self, ids: &[ItemId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        debug!(target: "repository", count = ids.len(), "deleting items");
        let sql = format!(
            "DELETE FROM media_items WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut tx = self.pool.begin().await?;
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.0);
        }
        let result = query.execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn collapse_checking_duplicates(&self, now: DateTime<Utc>) -> Result<Vec<CollapsedPair>> {
        let pairs = sqlx::query(
            r#"
            SELECT a.id AS kept, b.id AS deleted
            FROM media_items a
            JOIN media_items b
              ON a.filled_by_file = b.filled_by_file AND a.id != b.id
            WHERE a.state = 'Checking'
              AND b.state != 'Checking'
              AND a.filled_by_file IS NOT NULL
              AND a.filled_by_file != ''
            ORDER BY a.id, b.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let stamp = now.to_rfc3339();
        let mut collapsed = Vec::new();
        for row in pairs {
            let kept: i64 = row.try_get("kept")?;
            let deleted: i64 = row.try_get("deleted")?;

            let mut tx = self.pool.begin().await?;
            let location: Option<Option<String>> =
                sqlx::query_scalar("SELECT location_on_disk FROM media_items WHERE id = ?")
                    .bind(deleted)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(location) = location else {
                // already removed by an earlier pair
                tx.rollback().await?;
                continue;
            };

            sqlx::query("DELETE FROM media_items WHERE id = ?")
                .bind(deleted)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                UPDATE media_items SET
                    location_on_disk = COALESCE(location_on_disk, ?),
                    last_updated = ?
                WHERE id = ?
                "#,
            )
            .bind(location)
            .bind(&stamp)
            .bind(kept)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            collapsed.push(CollapsedPair {
                kept: ItemId(kept),
                deleted: ItemId(deleted),
            });
        }
        Ok(collapsed)
    }

    async fn upsert_wanted(&self, item: Item) -> Result<UpsertOutcome> {
        let lookup = ItemLookup::for_item(&item);
        if let Some(existing) = self.find_matching(&lookup).await?.into_iter().next() {
            debug!(target: "repository", item_id = %existing.id, state = %existing.state, "wanted item already stored");
            return Ok(UpsertOutcome::Existing(existing.id, existing.state));
        }
        let inserted = self.insert(item).await?;
        Ok(UpsertOutcome::Inserted(inserted.id))
    }

    async fn count_by_state(&self) -> Result<BTreeMap<ItemState, i64>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM media_items GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = BTreeMap::new();
        for r in rows {
            let state: String = r.try_get("state")?;
            let n: i64 = r.try_get("n")?;
            match ItemState::parse(&state) {
                Some(s) => {
                    counts.insert(s, n);
                }
                None => warn!(target: "repository", state = %state, "unknown item state in store"),
            }
        }
        Ok(counts)
    }

    async fn health_check(&self) -> Result<bool> {
        let verdict: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await?;
        Ok(verdict == "ok")
    }
}

// ----------------------------------------------------------------------------
// TV show status
// ----------------------------------------------------------------------------

pub struct SqliteShowStatusRepository {
    pool: SqlitePool,
}

impl SqliteShowStatusRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ShowStatusRepository for SqliteShowStatusRepository {
    async fn get_status(&self, imdb_id: &str) -> Result<Option<TvShowStatus>> {
        let row = sqlx::query("SELECT * FROM tv_show_status WHERE imdb_id = ?")
            .bind(imdb_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else { return Ok(None) };
        Ok(Some(TvShowStatus {
            imdb_id: r.try_get("imdb_id")?,
            status: ShowStatus::parse(&r.try_get::<String, _>("status")?),
            is_complete: r.try_get("is_complete")?,
            total_episodes: to_u32(r.try_get("total_episodes")?),
            last_status_check: parse_dt(r.try_get("last_status_check")?)?,
        }))
    }

    async fn upsert_status(&self, status: &TvShowStatus) -> Result<()> {
        debug!(target: "repository", imdb_id = %status.imdb_id, status = status.status.as_str(), "saving show status");
        sqlx::query(
            r#"
            INSERT INTO tv_show_status (imdb_id, status, is_complete, total_episodes, last_status_check)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(imdb_id) DO UPDATE SET
                status = excluded.status,
                is_complete = excluded.is_complete,
                total_episodes = excluded.total_episodes,
                last_status_check = excluded.last_status_check
            "#,
        )
        .bind(&status.imdb_id)
        .bind(status.status.as_str())
        .bind(status.is_complete)
        .bind(i64::from(status.total_episodes))
        .bind(status.last_status_check.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_version_status(
        &self,
        imdb_id: &str,
        version: &str,
    ) -> Result<Option<TvShowVersionStatus>> {
        let row = sqlx::query(
            "SELECT * FROM tv_show_version_status WHERE imdb_id = ? AND version_identifier = ?",
        )
        .bind(imdb_id)
        .bind(cinarr_domain::strip_version(version))
        .fetch_optional(&self.pool)
        .await?;
        let Some(r) = row else { return Ok(None) };
        Ok(Some(TvShowVersionStatus {
            imdb_id: r.try_get("imdb_id")?,
            version_identifier: r.try_get("version_identifier")?,
            is_complete_and_present: r.try_get("is_complete_and_present")?,
            is_up_to_date: r.try_get("is_up_to_date")?,
            present_episode_count: to_u32(r.try_get("present_episode_count")?),
            last_checked: parse_dt(r.try_get("last_checked")?)?,
        }))
    }

    async fn upsert_version_status(&self, status: &TvShowVersionStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tv_show_version_status (
                imdb_id, version_identifier, is_complete_and_present, is_up_to_date,
                present_episode_count, last_checked
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(imdb_id, version_identifier) DO UPDATE SET
                is_complete_and_present = excluded.is_complete_and_present,
                is_up_to_date = excluded.is_up_to_date,
                present_episode_count = excluded.present_episode_count,
                last_checked = excluded.last_checked
            "#,
        )
        .bind(&status.imdb_id)
        .bind(cinarr_domain::strip_version(&status.version_identifier))
        .bind(status.is_complete_and_present)
        .bind(status.is_up_to_date)
        .bind(i64::from(status.present_episode_count))
        .bind(status.last_checked.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Not wanted
// ----------------------------------------------------------------------------

pub struct SqliteNotWantedRepository {
    pool: SqlitePool,
}

impl SqliteNotWantedRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl NotWantedRepository for SqliteNotWantedRepository {
    async fn add(&self, value: &str) -> Result<()> {
        debug!(target: "repository", value, "marking as not wanted");
        sqlx::query("INSERT OR IGNORE INTO not_wanted (value, added_at) VALUES (?, ?)")
            .bind(value)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn contains(&self, value: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM not_wanted WHERE value = ?")
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn all(&self) -> Result<HashSet<String>> {
        let values: Vec<String> = sqlx::query_scalar("SELECT value FROM not_wanted")
            .fetch_all(&self.pool)
            .await?;
        Ok(values.into_iter().collect())
    }
}

// ----------------------------------------------------------------------------
// Removal queue
// ----------------------------------------------------------------------------

pub struct SqliteRemovalQueueRepository {
    pool: SqlitePool,
}

impl SqliteRemovalQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_removal(r: &SqliteRow) -> Result<RemovalRecord> {
    let status: String = r.try_get("status")?;
    Ok(RemovalRecord {
        id: r.try_get("id")?,
        item_path: r.try_get("item_path")?,
        item_title: r.try_get("item_title")?,
        episode_title: r.try_get("episode_title")?,
        attempts: to_u32(r.try_get("attempts")?),
        status: RemovalStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown removal status: {}", status))?,
        created_at: parse_dt(r.try_get("created_at")?)?,
        updated_at: parse_dt(r.try_get("updated_at")?)?,
    })
}

#[async_trait::async_trait]
impl RemovalQueueRepository for SqliteRemovalQueueRepository {
    async fn enqueue(
        &self,
        item_path: &str,
        item_title: &str,
        episode_title: Option<&str>,
    ) -> Result<RemovalRecord> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO plex_removal_queue (item_path, item_title, episode_title, attempts, status, created_at, updated_at)
            VALUES (?, ?, ?, 0, 'Pending', ?, ?)
            "#,
        )
        .bind(item_path)
        .bind(item_title)
        .bind(episode_title)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        debug!(target: "repository", item_path, "queued removal verification");
        Ok(RemovalRecord {
            id: result.last_insert_rowid(),
            item_path: item_path.to_string(),
            item_title: item_title.to_string(),
            episode_title: episode_title.map(str::to_string),
            attempts: 0,
            status: RemovalStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    async fn list_by_status(&self, status: RemovalStatus) -> Result<Vec<RemovalRecord>> {
        let rows = sqlx::query("SELECT * FROM plex_removal_queue WHERE status = ? ORDER BY id")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_removal).collect()
    }

    async fn record_attempt(&self, id: i64, status: RemovalStatus) -> Result<()> {
        sqlx::query(
            "UPDATE plex_removal_queue SET attempts = attempts + 1, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Torrent tracking
// ----------------------------------------------------------------------------

pub struct SqliteTorrentTrackingRepository {
    pool: SqlitePool,
}

impl SqliteTorrentTrackingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TorrentTrackingRepository for SqliteTorrentTrackingRepository {
    async fn record(&self, record: &TorrentTrackingRecord) -> Result<()> {
        debug!(target: "repository", info_hash = %record.info_hash, trigger = %record.trigger_source, "tracking torrent");
        sqlx::query(
            r#"
            INSERT INTO torrent_tracking (
                info_hash, torrent_id, item_id, item_snapshot, trigger_source,
                trigger_details, rationale, added_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(info_hash) DO UPDATE SET
                torrent_id = excluded.torrent_id,
                item_id = excluded.item_id,
                item_snapshot = excluded.item_snapshot,
                trigger_source = excluded.trigger_source,
                trigger_details = excluded.trigger_details,
                rationale = excluded.rationale,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.info_hash.to_lowercase())
        .bind(record.torrent_id.clone())
        .bind(record.item_id.map(|i| i.0))
        .bind(serde_json::to_string(&record.item_snapshot)?)
        .bind(&record.trigger_source)
        .bind(record.trigger_details.clone())
        .bind(&record.rationale)
        .bind(record.added_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, info_hash: &str) -> Result<Option<TorrentTrackingRecord>> {
        let row = sqlx::query("SELECT * FROM torrent_tracking WHERE info_hash = ?")
            .bind(info_hash.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else { return Ok(None) };
        let snapshot: String = r.try_get("item_snapshot")?;
        Ok(Some(TorrentTrackingRecord {
            info_hash: r.try_get("info_hash")?,
            torrent_id: r.try_get("torrent_id")?,
            item_id: r.try_get::<Option<i64>, _>("item_id")?.map(ItemId),
            item_snapshot: serde_json::from_str(&snapshot)?,
            trigger_source: r.try_get("trigger_source")?,
            trigger_details: r.try_get("trigger_details")?,
            rationale: r.try_get("rationale")?,
            added_at: parse_dt(r.try_get("added_at")?)?,
            updated_at: parse_dt(r.try_get("updated_at")?)?,
        }))
    }

    async fn migrate_torrent_id(&self, old_id: &str, new_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE torrent_tracking SET torrent_id = ?, updated_at = ? WHERE torrent_id = ?",
        )
        .bind(new_id)
        .bind(Utc::now().to_rfc3339())
        .bind(old_id)
        .execute(&self.pool)
        .await?;
        debug!(target: "repository", old_id, new_id, rows = result.rows_affected(), "migrated torrent id");
        Ok(result.rows_affected())
    }
}

// ----------------------------------------------------------------------------
// Preferred aliases
// ----------------------------------------------------------------------------

pub struct SqliteAliasRepository {
    pool: SqlitePool,
}

impl SqliteAliasRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn alias_season(key: &AliasKey) -> i64 {
    key.season_number.map(i64::from).unwrap_or(-1)
}

#[async_trait::async_trait]
impl AliasRepository for SqliteAliasRepository {
    async fn get_preferred(&self, key: &AliasKey) -> Result<Option<String>> {
        let alias = sqlx::query_scalar(
            r#"
            SELECT alias FROM preferred_aliases
            WHERE tmdb_id = ? AND imdb_id = ? AND content_type = ? AND season_number = ?
            "#,
        )
        .bind(&key.tmdb_id)
        .bind(&key.imdb_id)
        .bind(key.content_type.as_str())
        .bind(alias_season(key))
        .fetch_optional(&self.pool)
        .await?;
        Ok(alias)
    }

    async fn set_preferred(&self, key: &AliasKey, alias: &str) -> Result<()> {
        debug!(target: "repository", imdb_id = %key.imdb_id, alias, "promoting preferred alias");
        sqlx::query(
            r#"
            INSERT INTO preferred_aliases (tmdb_id, imdb_id, content_type, season_number, alias, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(tmdb_id, imdb_id, content_type, season_number) DO UPDATE SET
                alias = excluded.alias,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&key.tmdb_id)
        .bind(&key.imdb_id)
        .bind(key.content_type.as_str())
        .bind(alias_season(key))
        .bind(alias)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Symlink verification
// ----------------------------------------------------------------------------

pub struct SqliteSymlinkVerificationRepository {
    pool: SqlitePool,
}

impl SqliteSymlinkVerificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SymlinkVerificationRepository for SqliteSymlinkVerificationRepository {
    async fn add(&self, item_id: ItemId, symlink_path: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO symlink_verification (item_id, symlink_path, added_at) VALUES (?, ?, ?)",
        )
        .bind(item_id.0)
        .bind(symlink_path)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_unverified(&self, limit: Option<i64>) -> Result<Vec<SymlinkVerification>> {
        let rows = sqlx::query(
            "SELECT * FROM symlink_verification WHERE verified = 0 ORDER BY added_at DESC, id DESC LIMIT ?",
        )
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let last_attempt: Option<String> = r.try_get("last_attempt")?;
            out.push(SymlinkVerification {
                id: r.try_get("id")?,
                item_id: ItemId(r.try_get("item_id")?),
                symlink_path: r.try_get("symlink_path")?,
                attempts: to_u32(r.try_get("attempts")?),
                verified: r.try_get("verified")?,
                added_at: parse_dt(r.try_get("added_at")?)?,
                last_attempt: last_attempt.map(parse_dt).transpose()?,
            });
        }
        Ok(out)
    }

    async fn mark_verified(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE symlink_verification SET verified = 1, last_attempt = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_attempt(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE symlink_verification SET attempts = attempts + 1, last_attempt = ? WHERE id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn to_u32(v: i64) -> u32 {
    u32::try_from(v.max(0)).unwrap_or(u32::MAX)
}

fn parse_dt(s: String) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // SQLite CURRENT_TIMESTAMP format
    let ndt = NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
}

fn parse_dt_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.filter(|v| !v.is_empty()).map(parse_dt).transpose()
}

fn parse_airtime(s: Option<String>) -> Option<NaiveTime> {
    let s = s?;
    NaiveTime::parse_from_str(&s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
        .ok()
}

fn row_to_item(row: &SqliteRow) -> Result<Item> {
    let type_str: String = row.try_get("type")?;
    let media_type =
        MediaType::parse(&type_str).ok_or_else(|| anyhow!("unknown item type: {}", type_str))?;
    let state_str: String = row.try_get("state")?;
    let state =
        ItemState::parse(&state_str).ok_or_else(|| anyhow!("unknown item state: {}", state_str))?;

    let genres: String = row.try_get("genres")?;
    let scrape_results: String = row.try_get("scrape_results")?;
    let release_date: String = row.try_get("release_date")?;

    let opt_u32 = |col: &str| -> Result<Option<u32>> {
        Ok(row.try_get::<Option<i64>, _>(col)?.map(to_u32))
    };

    Ok(Item {
        id: ItemId(row.try_get("id")?),
        imdb_id: row.try_get("imdb_id")?,
        tmdb_id: row.try_get("tmdb_id")?,
        tvdb_id: row.try_get("tvdb_id")?,
        media_type,
        title: row.try_get("title")?,
        year: row
            .try_get::<Option<i64>, _>("year")?
            .and_then(|y| i32::try_from(y).ok()),
        genres: serde_json::from_str(&genres).unwrap_or_default(),
        runtime_minutes: opt_u32("runtime")?,
        country: row.try_get("country")?,
        release_date: ReleaseDate::parse_str(&release_date),
        airtime: parse_airtime(row.try_get("airtime")?),
        airs_timezone: row.try_get("airs_timezone")?,
        season_number: opt_u32("season_number")?,
        episode_number: opt_u32("episode_number")?,
        episode_title: row.try_get("episode_title")?,
        version: row.try_get("version")?,
        state,
        content_source: row.try_get("content_source")?,
        content_source_detail: row.try_get("content_source_detail")?,
        filled_by_title: row.try_get("filled_by_title")?,
        filled_by_file: row.try_get("filled_by_file")?,
        filled_by_magnet: row.try_get("filled_by_magnet")?,
        filled_by_torrent_id: row.try_get("filled_by_torrent_id")?,
        original_scraped_torrent_title: row.try_get("original_scraped_torrent_title")?,
        real_debrid_original_title: row.try_get("real_debrid_original_title")?,
        location_on_disk: row.try_get("location_on_disk")?,
        scrape_results: serde_json::from_str::<Vec<StoredResult>>(&scrape_results)
            .unwrap_or_default(),
        upgrading_from_file: row.try_get("upgrading_from_file")?,
        upgrading_from_torrent_id: row.try_get("upgrading_from_torrent_id")?,
        last_updated: parse_dt(row.try_get("last_updated")?)?,
        last_state_change: parse_dt(row.try_get("last_state_change")?)?,
        collected_at: parse_dt_opt(row.try_get("collected_at")?)?,
        final_check_add_timestamp: parse_dt_opt(row.try_get("final_check_add_timestamp")?)?,
        sleep_until: parse_dt_opt(row.try_get("sleep_until")?)?,
        scrape_attempts: to_u32(row.try_get("scrape_attempts")?),
        wake_count: to_u32(row.try_get("wake_count")?),
    })
}
