// SPDX-License-Identifier: GPL-3.0-or-later
//! Housekeeping that keeps stored metadata fresh and delivers collected
//! notifications.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use cinarr_domain::{
    Item, ItemState, MediaType, ReleaseDate, ShowStatus, TvShowStatus, TvShowVersionStatus,
};
use cinarr_infrastructure::state_files::{CollectedNotification, COLLECTED_NOTIFICATIONS_FILE};
use tracing::{debug, info, warn};

use crate::content_sources::episode_release;
use crate::context::PipelineContext;
use crate::metadata::ShowMetadata;

/// Items whose release date may still move.
const DATED_STATES: [ItemState; 3] = [ItemState::Wanted, ItemState::Unreleased, ItemState::Sleeping];

pub struct Maintenance {
    ctx: PipelineContext,
}

impl Maintenance {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Refresh the status of every show with stored episodes, plus per-version
    /// completeness. Returns the number of shows refreshed.
    pub async fn refresh_show_status(&self) -> Result<usize> {
        let now = self.ctx.now();
        let episodes = self.ctx.repos.items.list_by_states(&ItemState::ALL).await?;
        let mut shows: BTreeMap<String, Vec<Item>> = BTreeMap::new();
        for item in episodes
            .into_iter()
            .filter(|i| i.media_type == MediaType::Episode)
        {
            if let Some(imdb) = item.imdb_id.clone() {
                shows.entry(imdb).or_default().push(item);
            }
        }

        let mut refreshed = 0;
        for (imdb_id, items) in shows {
            let show = match self.ctx.metadata.show_metadata(&imdb_id).await {
                Ok(show) => show,
                Err(err) => {
                    warn!(target: "maintenance", %imdb_id, error = %err, "show status refresh failed");
                    continue;
                }
            };
            let status = show.show_status();
            let total = show.total_episodes();
            let ended = matches!(status, ShowStatus::Ended | ShowStatus::Canceled);
            self.ctx
                .repos
                .show_status
                .upsert_status(&TvShowStatus {
                    imdb_id: imdb_id.clone(),
                    status,
                    is_complete: ended,
                    total_episodes: total,
                    last_status_check: now,
                })
                .await?;

            let aired = aired_episode_count(&show, now);
            let mut by_version: BTreeMap<String, u32> = BTreeMap::new();
            for item in &items {
                let version = item.version_stripped().unwrap_or_default().to_string();
                let present = by_version.entry(version).or_default();
                if item.state == ItemState::Collected && item.season_number != Some(0) {
                    *present += 1;
                }
            }
            for (version, present) in by_version {
                self.ctx
                    .repos
                    .show_status
                    .upsert_version_status(&TvShowVersionStatus {
                        imdb_id: imdb_id.clone(),
                        version_identifier: version,
                        is_complete_and_present: ended && present >= total,
                        is_up_to_date: present >= aired,
                        present_episode_count: present,
                        last_checked: now,
                    })
                    .await?;
            }
            debug!(target: "maintenance", %imdb_id, status = %status.as_str(), total, aired, "show status refreshed");
            refreshed += 1;
        }
        Ok(refreshed)
    }

    /// Re-read release dates of items that are not yet being searched for.
    /// Returns the number of items whose date changed.
    pub async fn refresh_release_dates(&self) -> Result<usize> {
        let items = self.ctx.repos.items.list_by_states(&DATED_STATES).await?;
        let mut shows: BTreeMap<String, Option<ShowMetadata>> = BTreeMap::new();
        let mut changed = 0;

        for mut item in items {
            let Some(imdb_id) = item.imdb_id.clone() else {
                continue;
            };
            let fresh = match item.media_type {
                MediaType::Movie => match self.ctx.metadata.movie_metadata(&imdb_id).await {
                    Ok(meta) => meta
                        .release_date
                        .as_deref()
                        .map(|d| (ReleaseDate::parse_str(d), item.airtime)),
                    Err(err) => {
                        debug!(target: "maintenance", %imdb_id, error = %err, "no movie metadata");
                        None
                    }
                },
                MediaType::Episode => {
                    if !shows.contains_key(&imdb_id) {
                        let show = self.ctx.metadata.show_metadata(&imdb_id).await.ok();
                        shows.insert(imdb_id.clone(), show);
                    }
                    let (Some(season), Some(episode)) = (item.season_number, item.episode_number) else {
                        continue;
                    };
                    shows
                        .get(&imdb_id)
                        .and_then(Option::as_ref)
                        .and_then(|show| {
                            show.episode(season, episode)
                                .map(|ep| episode_release(ep.first_aired, show))
                        })
                }
            };

            let Some((release_date, airtime)) = fresh else {
                continue;
            };
            if release_date == item.release_date && airtime == item.airtime {
                continue;
            }
            info!(
                target: "maintenance",
                item_id = %item.id,
                item = %item.display_label(),
                from = %item.release_date.to_iso8601(),
                to = %release_date.to_iso8601(),
                "release date changed"
            );
            item.release_date = release_date;
            item.airtime = airtime;
            item.last_updated = self.ctx.now();
            self.ctx.repos.items.update(&item).await?;
            changed += 1;
        }
        Ok(changed)
    }

    /// Drain the collected-notification inbox into the notifier. A failed
    /// delivery puts the batch back for the next run.
    pub async fn process_collected_notifications(&self) -> Result<usize> {
        let batch: Vec<CollectedNotification> = self
            .ctx
            .state
            .take_json(COLLECTED_NOTIFICATIONS_FILE)?
            .unwrap_or_default();
        if batch.is_empty() {
            return Ok(0);
        }
        if let Err(err) = self.ctx.notifier.notify_collected(&batch).await {
            warn!(target: "maintenance", count = batch.len(), error = %err, "notification delivery failed; requeueing");
            for note in batch {
                self.ctx.state.append_json(COLLECTED_NOTIFICATIONS_FILE, note)?;
            }
            return Err(err);
        }
        Ok(batch.len())
    }
}

fn aired_episode_count(show: &ShowMetadata, now: DateTime<Utc>) -> u32 {
    show.seasons
        .range(1..)
        .flat_map(|(_, season)| season.episodes.values())
        .filter(|ep| ep.first_aired.is_some_and(|at| at <= now))
        .count() as u32
}
