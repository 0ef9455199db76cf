// SPDX-License-Identifier: GPL-3.0-or-later
//! Scraping, Adding and Pending Uncached: finding a release and getting it
//! onto the debrid provider.

use std::collections::HashSet;

use anyhow::Result;
use cinarr_domain::{Item, ItemState, MediaType, StoredResult, TorrentTrackingRecord};
use tracing::{debug, info, warn};

use super::{stored_results, ProcessReport, QueueError, QueueManager, QueueName, SchedulerControl};
use crate::debrid::{extract_info_hash, DebridError, TorrentFile, TorrentFileList};
use crate::matcher::{largest_video, match_files, MatchTarget};
use crate::release_parsing::parse_release_title;

/// States whose episodes may be filled by a season pack found for a sibling.
const PACK_FILLABLE: [ItemState; 4] = [
    ItemState::Wanted,
    ItemState::Scraping,
    ItemState::Adding,
    ItemState::Sleeping,
];

/// How one scrape result fared on the provider.
enum AddAttempt {
    Filled,
    NoMatch,
}

impl QueueManager {
    pub(super) async fn process_scraping(&self) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();
        let Some(mut item) = self.contents(QueueName::Scraping).into_iter().next() else {
            return Ok(report);
        };
        let outcome = self.scraping_step(&mut item).await;
        self.settle(QueueName::Scraping, &mut item, outcome, &mut report).await;
        Ok(report)
    }

    async fn scraping_step(&self, item: &mut Item) -> Result<bool, QueueError> {
        let now = self.ctx.now();
        let multi = self.wants_season_pack(item).await?;
        let mut outcome = self.ctx.scrape.scrape(item, multi).await?;
        if multi && outcome.is_empty() {
            outcome = self.ctx.scrape.scrape(item, false).await?;
        }
        item.scrape_attempts += 1;

        if outcome.is_empty() {
            if self.is_old(item, now) {
                info!(target: "queue", item = %item.display_label(), "nothing found for an old release; blacklisting");
                match item.media_type {
                    MediaType::Episode => self.blacklist_season(item).await?,
                    MediaType::Movie => self.blacklist(item).await?,
                }
            } else {
                debug!(target: "queue", item = %item.display_label(), pre_size = outcome.pre_size, "no results; sleeping");
                self.move_item(item, ItemState::Sleeping).await?;
            }
            return Ok(true);
        }

        item.scrape_results = stored_results(&outcome);
        debug!(target: "queue", item = %item.display_label(), results = item.scrape_results.len(), multi, "scrape results stored");
        self.move_item(item, ItemState::Adding).await?;
        Ok(true)
    }

    /// True when other episodes of the same season and version are still being
    /// looked for, so a season pack would serve them all.
    async fn wants_season_pack(&self, item: &Item) -> Result<bool> {
        if item.media_type != MediaType::Episode {
            return Ok(false);
        }
        let (Some(imdb_id), Some(season)) = (item.imdb_id.as_deref(), item.season_number) else {
            return Ok(false);
        };
        let siblings = self
            .ctx
            .repos
            .items
            .list_show_episodes(imdb_id, Some(season))
            .await?;
        Ok(siblings.iter().any(|other| {
            other.id != item.id
                && other.version_stripped() == item.version_stripped()
                && matches!(other.state, ItemState::Wanted | ItemState::Scraping)
        }))
    }

    async fn season_siblings(&self, item: &Item, states: &[ItemState]) -> Result<Vec<Item>> {
        let (Some(imdb_id), Some(season)) = (item.imdb_id.as_deref(), item.season_number) else {
            return Ok(Vec::new());
        };
        Ok(self
            .ctx
            .repos
            .items
            .list_show_episodes(imdb_id, Some(season))
            .await?
            .into_iter()
            .filter(|other| {
                other.id != item.id
                    && other.version_stripped() == item.version_stripped()
                    && states.contains(&other.state)
            })
            .collect())
    }

    /// An episode that has been out for a while with nothing to find takes the
    /// rest of its searching season down with it.
    async fn blacklist_season(&self, item: &mut Item) -> Result<(), QueueError> {
        let searching = [ItemState::Wanted, ItemState::Scraping, ItemState::Sleeping];
        for mut sibling in self.season_siblings(item, &searching).await? {
            self.blacklist(&mut sibling).await?;
        }
        self.blacklist(item).await
    }

    pub(super) async fn process_adding(&self, control: &dyn SchedulerControl) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();
        let Some(mut item) = self.contents(QueueName::Adding).into_iter().next() else {
            return Ok(report);
        };
        let outcome = self.adding_step(&mut item, control).await;
        self.settle(QueueName::Adding, &mut item, outcome, &mut report).await;
        Ok(report)
    }

    async fn adding_step(&self, item: &mut Item, control: &dyn SchedulerControl) -> Result<bool, QueueError> {
        let not_wanted = if self.ctx.config.debug.disable_not_wanted_check {
            HashSet::new()
        } else {
            self.ctx.repos.not_wanted.all().await?
        };
        let not_wanted_hashes: HashSet<String> =
            not_wanted.iter().filter_map(|v| extract_info_hash(v)).collect();
        let upgrading = item.upgrading_from_file.is_some();

        for result in item.scrape_results.clone() {
            let blocked = not_wanted.contains(&result.magnet)
                || extract_info_hash(&result.magnet).is_some_and(|h| not_wanted_hashes.contains(&h));
            if blocked {
                debug!(target: "queue", title = %result.title, "skipping not-wanted release");
                continue;
            }
            if upgrading && item.filled_by_title.as_deref() == Some(result.title.as_str()) {
                continue;
            }

            match self.try_result(item, &result).await {
                Ok(AddAttempt::Filled) => return Ok(true),
                Ok(AddAttempt::NoMatch) => continue,
                Err(QueueError::Debrid(DebridError::RateLimit)) => {
                    warn!(target: "queue", item = %item.display_label(), "debrid rate limit; item stays in Adding");
                    control.pause_for_rate_limit("debrid");
                    return Ok(false);
                }
                Err(QueueError::Debrid(DebridError::TooManyDownloads)) => {
                    info!(target: "queue", item = %item.display_label(), "provider at download capacity");
                    self.move_item(item, ItemState::PendingUncached).await?;
                    return Ok(true);
                }
                Err(QueueError::Debrid(
                    err @ (DebridError::Unauthorized
                    | DebridError::Forbidden
                    | DebridError::ProviderUnavailable(_)),
                )) => {
                    warn!(target: "queue", item = %item.display_label(), error = %err, "debrid unreachable; item stays in Adding");
                    return Ok(false);
                }
                Err(QueueError::Debrid(err)) => {
                    warn!(target: "queue", title = %result.title, error = %err, "could not add release; trying next");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        if upgrading {
            info!(target: "queue", item = %item.display_label(), "no upgrade could be added; keeping the collected release");
            item.upgrading_from_file = None;
            item.upgrading_from_torrent_id = None;
            self.move_item(item, ItemState::Upgrading).await?;
        } else {
            debug!(target: "queue", item = %item.display_label(), "scrape results exhausted");
            self.move_item(item, ItemState::Sleeping).await?;
        }
        Ok(true)
    }

    async fn try_result(&self, item: &mut Item, result: &StoredResult) -> Result<AddAttempt, QueueError> {
        let added_id = self.ctx.debrid.add_torrent(&result.magnet).await?;
        let list = match self.ctx.debrid.get_torrent_file_list(&result.magnet).await {
            Ok(list) => list,
            Err(err) => {
                self.discard_torrent(&added_id).await;
                return Err(err.into());
            }
        };
        if list.torrent_id != added_id {
            let migrated = self
                .ctx
                .repos
                .torrents
                .migrate_torrent_id(&added_id, &list.torrent_id)
                .await?;
            debug!(target: "queue", from = %added_id, to = %list.torrent_id, migrated, "torrent id changed on provider");
        }

        let pack = parse_release_title(&result.title, Some(result.size_gb))
            .map(|info| info.is_season_pack())
            .unwrap_or(false);
        let siblings = if pack {
            self.season_siblings(item, &PACK_FILLABLE).await?
        } else {
            Vec::new()
        };

        let own = item.clone();
        let mut absolutes = Vec::with_capacity(siblings.len() + 1);
        for target in std::iter::once(&own).chain(siblings.iter()) {
            absolutes.push(
                self.ctx
                    .scrape
                    .episode_context(target)
                    .await
                    .and_then(|ctx| ctx.absolute),
            );
        }
        let scene = result.scene_season.zip(result.scene_episode);
        let assignments = {
            let targets: Vec<MatchTarget<'_>> = std::iter::once(&own)
                .chain(siblings.iter())
                .zip(absolutes)
                .map(|(target, absolute)| MatchTarget {
                    item: target,
                    absolute,
                    scene: if target.id == own.id { scene } else { None },
                })
                .collect();
            match_files(&list.files, &targets)
        };

        let file = assignments
            .iter()
            .find(|a| a.item_id == own.id)
            .map(|a| a.file.clone())
            .or_else(|| {
                if item.is_soft_version() {
                    largest_video(&list.files).cloned()
                } else {
                    None
                }
            });
        let Some(file) = file else {
            debug!(target: "queue", item = %item.display_label(), title = %result.title, "no matching file in torrent");
            self.discard_torrent(&list.torrent_id).await;
            return Ok(AddAttempt::NoMatch);
        };

        self.fill(item, result, &list, &file).await?;
        for mut sibling in siblings {
            if let Some(assignment) = assignments.iter().find(|a| a.item_id == sibling.id) {
                self.fill(&mut sibling, result, &list, &assignment.file).await?;
            }
        }
        Ok(AddAttempt::Filled)
    }

    async fn fill(
        &self,
        item: &mut Item,
        result: &StoredResult,
        list: &TorrentFileList,
        file: &TorrentFile,
    ) -> Result<(), QueueError> {
        let now = self.ctx.now();
        item.filled_by_title = Some(result.title.clone());
        item.filled_by_magnet = Some(result.magnet.clone());
        item.filled_by_torrent_id = Some(list.torrent_id.clone());
        item.filled_by_file = Some(file.basename().to_string());
        item.original_scraped_torrent_title = Some(result.title.clone());
        item.real_debrid_original_title = Some(list.filename.clone());

        if let Some(info_hash) = extract_info_hash(&result.magnet) {
            self.ctx
                .repos
                .torrents
                .record(&TorrentTrackingRecord {
                    info_hash,
                    torrent_id: Some(list.torrent_id.clone()),
                    item_id: Some(item.id),
                    item_snapshot: item.clone(),
                    trigger_source: "queue_adding".to_string(),
                    trigger_details: Some(result.source.clone()),
                    rationale: format!("score {:.1}", result.score),
                    added_at: now,
                    updated_at: now,
                })
                .await?;
        }

        info!(target: "queue", item = %item.display_label(), file = %file.basename(), torrent = %result.title, "release added");
        self.move_item(item, ItemState::Checking).await?;
        Ok(())
    }

    pub(super) async fn discard_torrent(&self, torrent_id: &str) {
        if let Err(err) = self.ctx.debrid.remove_torrent(torrent_id).await {
            warn!(target: "queue", %torrent_id, error = %err, "could not remove unused torrent");
        }
    }

    pub(super) async fn process_pending_uncached(&self, control: &dyn SchedulerControl) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();
        let items = self.contents(QueueName::PendingUncached);
        if items.is_empty() {
            return Ok(report);
        }
        match self.ctx.debrid.has_download_capacity().await {
            Ok(true) => {
                for mut item in items {
                    let outcome = self
                        .move_item(&mut item, ItemState::Adding)
                        .await
                        .map(|()| true)
                        .map_err(QueueError::from);
                    self.settle(QueueName::PendingUncached, &mut item, outcome, &mut report).await;
                }
            }
            Ok(false) => debug!(target: "queue", waiting = items.len(), "provider still at capacity"),
            Err(DebridError::RateLimit) => control.pause_for_rate_limit("debrid"),
            Err(err) => warn!(target: "queue", error = %err, "could not read download capacity"),
        }
        Ok(report)
    }
}
