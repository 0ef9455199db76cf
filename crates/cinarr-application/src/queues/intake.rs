// SPDX-License-Identifier: GPL-3.0-or-later
//! Wanted, Unreleased, Sleeping and Blacklisted: the queues that decide when
//! an item is worth searching for.

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use cinarr_config::QueueConfig;
use cinarr_domain::{Item, ItemState, MediaType};
use cinarr_infrastructure::state_files::{PreReleaseData, PreReleaseEntry, PRE_RELEASE_FILE};
use tracing::{debug, info};

use super::{stored_results, ProcessReport, QueueError, QueueManager, QueueName};

/// Items releasing within this many days get an early scrape.
const PRE_RELEASE_WINDOW_DAYS: i64 = 7;
const PRE_RELEASE_SCRAPE_EVERY_HOURS: i64 = 24;

/// Instant from which `item` counts as released, or `None` for an unknown date.
///
/// Movies count from local midnight in the configured timezone. Episodes count
/// from their airtime in the show's timezone, or in UTC when the show has none.
/// The matching airtime offset is added in both cases.
pub fn release_due_at(item: &Item, config: &QueueConfig) -> Option<DateTime<Utc>> {
    let date = item.release_date.date()?;
    let (local, zone, offset_hours) = match item.media_type {
        MediaType::Movie => (
            date.and_hms_opt(0, 0, 0)?,
            Some(config.timezone.as_str()),
            config.movie_airtime_offset_hours,
        ),
        MediaType::Episode => (
            match item.airtime {
                Some(airtime) => date.and_time(airtime),
                None => date.and_hms_opt(0, 0, 0)?,
            },
            item.airs_timezone.as_deref(),
            config.episode_airtime_offset_hours,
        ),
    };
    let zoned = zone
        .and_then(|name| name.parse::<Tz>().ok())
        .and_then(|tz| tz.from_local_datetime(&local).earliest())
        .map(|dt| dt.with_timezone(&Utc));
    let base = zoned.unwrap_or_else(|| Utc.from_utc_datetime(&local));
    Some(base + Duration::seconds((offset_hours * 3600.0).round() as i64))
}

impl QueueManager {
    pub(super) async fn process_wanted(&self) -> Result<ProcessReport> {
        let now = self.ctx.now();
        let mut report = ProcessReport::default();
        for mut item in self.contents(QueueName::Wanted) {
            let outcome = self.wanted_step(&mut item, now).await;
            self.settle(QueueName::Wanted, &mut item, outcome, &mut report).await;
        }
        Ok(report)
    }

    async fn wanted_step(&self, item: &mut Item, now: DateTime<Utc>) -> Result<bool, QueueError> {
        match release_due_at(item, &self.ctx.config.queue) {
            None => {
                debug!(target: "queue", item = %item.display_label(), "release date unknown; staying wanted");
                Ok(false)
            }
            Some(due) if now >= due => {
                self.move_item(item, ItemState::Scraping).await?;
                Ok(true)
            }
            Some(_) => {
                self.move_item(item, ItemState::Unreleased).await?;
                Ok(true)
            }
        }
    }

    pub(super) async fn process_unreleased(&self) -> Result<ProcessReport> {
        let now = self.ctx.now();
        let mut report = ProcessReport::default();
        let mut pre_release: PreReleaseData = self.ctx.state.read_or_default(PRE_RELEASE_FILE);
        let before = pre_release.clone();

        for mut item in self.contents(QueueName::Unreleased) {
            let outcome = self.unreleased_step(&mut item, now, &mut pre_release).await;
            self.settle(QueueName::Unreleased, &mut item, outcome, &mut report).await;
        }

        if pre_release != before {
            self.ctx.state.write_json(PRE_RELEASE_FILE, &pre_release)?;
        }
        Ok(report)
    }

    async fn unreleased_step(
        &self,
        item: &mut Item,
        now: DateTime<Utc>,
        pre_release: &mut PreReleaseData,
    ) -> Result<bool, QueueError> {
        let key = item.id.to_string();
        let due = match release_due_at(item, &self.ctx.config.queue) {
            Some(due) if now < due => due,
            _ => {
                pre_release.remove(&key);
                self.move_item(item, ItemState::Wanted).await?;
                return Ok(true);
            }
        };

        if due - now > Duration::days(PRE_RELEASE_WINDOW_DAYS) {
            return Ok(false);
        }
        if let Some(entry) = pre_release.get(&key) {
            if now - entry.last_scrape < Duration::hours(PRE_RELEASE_SCRAPE_EVERY_HOURS) {
                return Ok(false);
            }
        }

        let outcome = self.ctx.scrape.scrape(item, false).await?;
        let entry = pre_release.entry(key.clone()).or_insert(PreReleaseEntry {
            scrape_count: 0,
            last_scrape: now,
        });
        entry.scrape_count += 1;
        entry.last_scrape = now;
        if outcome.is_empty() {
            debug!(target: "queue", item = %item.display_label(), scrape_count = entry.scrape_count, "nothing out ahead of release");
            return Ok(false);
        }

        info!(target: "queue", item = %item.display_label(), results = outcome.ranked.len(), "release available ahead of date");
        pre_release.remove(&key);
        item.scrape_results = stored_results(&outcome);
        self.move_item(item, ItemState::Adding).await?;
        Ok(true)
    }

    pub(super) async fn process_sleeping(&self) -> Result<ProcessReport> {
        let now = self.ctx.now();
        let mut report = ProcessReport::default();
        for mut item in self.contents(QueueName::Sleeping) {
            let outcome = self.sleeping_step(&mut item, now).await;
            self.settle(QueueName::Sleeping, &mut item, outcome, &mut report).await;
        }
        Ok(report)
    }

    async fn sleeping_step(&self, item: &mut Item, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let config = &self.ctx.config.queue;
        match item.sleep_until {
            None => {
                item.wake_count += 1;
                if item.wake_count > config.max_sleep_wakes {
                    info!(target: "queue", item = %item.display_label(), wakes = item.wake_count - 1, "woken too often; blacklisting");
                    self.blacklist(item).await?;
                    return Ok(true);
                }
                let minutes = (config.sleeping_backoff_minutes * u64::from(item.wake_count))
                    .min(config.sleeping_backoff_cap_minutes);
                item.sleep_until = Some(now + Duration::minutes(minutes as i64));
                debug!(target: "queue", item = %item.display_label(), wake_count = item.wake_count, minutes, "sleeping");
                self.save(item).await?;
                Ok(false)
            }
            Some(until) if now >= until => {
                self.move_item(item, ItemState::Wanted).await?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    pub(super) async fn process_blacklisted(&self) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();
        for mut item in self.contents(QueueName::Blacklisted) {
            let outcome = self
                .ensure_fallback_version(&item)
                .await
                .map(|inserted| inserted.is_some())
                .map_err(QueueError::from);
            self.settle(QueueName::Blacklisted, &mut item, outcome, &mut report).await;
        }
        Ok(report)
    }
}
