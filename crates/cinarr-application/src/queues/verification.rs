// SPDX-License-Identifier: GPL-3.0-or-later
//! Checking, Upgrading and Final_Check: confirming a release landed and
//! deciding what to do when it did not.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use cinarr_domain::{Item, ItemState};
use tracing::{debug, info, warn};

use super::{stored_results, ProcessReport, QueueError, QueueManager, QueueName};
use crate::library_verifier::Verification;
use crate::ranking::is_material_upgrade;

impl QueueManager {
    pub(super) async fn process_checking(&self) -> Result<ProcessReport> {
        let now = self.ctx.now();
        let mut report = ProcessReport::default();
        for mut item in self.contents(QueueName::Checking) {
            let outcome = self.checking_step(&mut item, now).await;
            self.settle(QueueName::Checking, &mut item, outcome, &mut report).await;
        }
        Ok(report)
    }

    async fn checking_step(&self, item: &mut Item, now: DateTime<Utc>) -> Result<bool, QueueError> {
        if let Verification::Found(path) = self.verifier.verify(item).await? {
            self.promote_to_collected(item, path.to_string_lossy().into_owned())
                .await?;
            return Ok(true);
        }

        let grace = Duration::minutes(self.ctx.config.queue.checking_grace_minutes as i64);
        if now - item.last_state_change < grace {
            return Ok(false);
        }

        if item.upgrading_from_file.is_some() {
            self.abandon_upgrade(item).await?;
            return Ok(true);
        }

        warn!(target: "queue", item = %item.display_label(), file = ?item.filled_by_file, "file never appeared; moving to final check");
        if let Some(magnet) = item.filled_by_magnet.as_deref() {
            self.ctx.repos.not_wanted.add(magnet).await?;
        }
        if let Some(torrent_id) = item.filled_by_torrent_id.clone() {
            self.discard_torrent(&torrent_id).await;
        }
        item.clear_fill();
        self.move_item(item, ItemState::FinalCheck).await?;
        Ok(true)
    }

    /// The upgrade release never showed up; keep what was already collected.
    async fn abandon_upgrade(&self, item: &mut Item) -> Result<(), QueueError> {
        warn!(target: "queue", item = %item.display_label(), "upgrade never appeared; keeping the collected release");
        if let Some(magnet) = item.filled_by_magnet.take() {
            self.ctx.repos.not_wanted.add(&magnet).await?;
        }
        if let Some(torrent_id) = item.filled_by_torrent_id.take() {
            self.discard_torrent(&torrent_id).await;
        }
        item.filled_by_title = None;
        item.original_scraped_torrent_title = None;
        item.real_debrid_original_title = None;
        item.filled_by_file = item.upgrading_from_file.take();
        item.filled_by_torrent_id = item.upgrading_from_torrent_id.take();
        self.move_item(item, ItemState::Collected).await?;
        Ok(())
    }

    pub(super) async fn process_upgrading(&self) -> Result<ProcessReport> {
        let now = self.ctx.now();
        let mut report = ProcessReport::default();
        for mut item in self.contents(QueueName::Upgrading) {
            let outcome = self.upgrading_step(&mut item, now).await;
            self.settle(QueueName::Upgrading, &mut item, outcome, &mut report).await;
        }
        Ok(report)
    }

    async fn upgrading_step(&self, item: &mut Item, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let window = Duration::hours(self.ctx.config.queue.upgrade_window_hours as i64);
        let since = item.collected_at.unwrap_or(item.last_state_change);
        if now - since >= window {
            debug!(target: "queue", item = %item.display_label(), "upgrade window closed");
            self.move_item(item, ItemState::Collected).await?;
            return Ok(true);
        }

        let Some(current_title) = item.filled_by_title.clone() else {
            warn!(target: "queue", item = %item.display_label(), "collected item has no release title; not upgrading");
            self.move_item(item, ItemState::Collected).await?;
            return Ok(true);
        };
        let Some(current) = item
            .scrape_results
            .iter()
            .find(|r| r.title == current_title)
            .cloned()
        else {
            debug!(target: "queue", item = %item.display_label(), "collected release was never scored; not upgrading");
            return Ok(false);
        };

        let current_score = self.ctx.scrape.rescore(item, &current).await?;
        let outcome = self.ctx.scrape.scrape(item, false).await?;
        let Some(best) = outcome.ranked.iter().find(|r| r.candidate.raw.title != current_title) else {
            return Ok(false);
        };
        let margin = self.ctx.config.queue.upgrade_score_margin;
        let better = match current_score {
            Some(score) => is_material_upgrade(score, best.score.total, margin),
            None => true,
        };
        if !better {
            debug!(target: "queue", item = %item.display_label(), current = ?current_score, challenger = best.score.total, "no material upgrade");
            return Ok(false);
        }

        info!(
            target: "queue",
            item = %item.display_label(),
            from = %current_title,
            to = %best.candidate.raw.title,
            "upgrade found"
        );
        let floor = current_score.unwrap_or(f64::NEG_INFINITY);
        let mut results: Vec<_> = stored_results(&outcome)
            .into_iter()
            .filter(|r| r.title != current_title && r.score > floor)
            .collect();
        results.push(current);
        item.scrape_results = results;
        item.upgrading_from_file = item.filled_by_file.clone();
        item.upgrading_from_torrent_id = item.filled_by_torrent_id.clone();
        self.move_item(item, ItemState::Adding).await?;
        Ok(true)
    }

    pub(super) async fn process_final_check(&self) -> Result<ProcessReport> {
        let now = self.ctx.now();
        let mut report = ProcessReport::default();
        for mut item in self.contents(QueueName::FinalCheck) {
            let outcome = self.final_check_step(&mut item, now).await;
            self.settle(QueueName::FinalCheck, &mut item, outcome, &mut report).await;
        }
        Ok(report)
    }

    async fn final_check_step(&self, item: &mut Item, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let Some(added) = item.final_check_add_timestamp else {
            warn!(target: "queue", item_id = %item.id, item = %item.display_label(), "final check item without a timestamp; skipping");
            return Ok(false);
        };
        let delay = Duration::hours(self.ctx.config.queue.blacklist_final_scrape_delay_hours as i64);
        if now - added < delay {
            return Ok(false);
        }

        let outcome = self.ctx.scrape.scrape(item, false).await?;
        if outcome.is_empty() {
            info!(target: "queue", item = %item.display_label(), "final scrape found nothing; blacklisting");
            self.blacklist(item).await?;
        } else {
            item.scrape_results = stored_results(&outcome);
            self.move_item(item, ItemState::Adding).await?;
        }
        Ok(true)
    }
}
