// SPDX-License-Identifier: GPL-3.0-or-later
//! The eleven item queues and the rules that move items between them.
//!
//! The store is the source of truth. Each [`QueueView`] is a cache of the rows
//! in one state, refreshed before the queue is processed and patched in place
//! whenever an item moves.

mod acquisition;
mod intake;
mod verification;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Utc};
use cinarr_domain::{
    DomainEvent, Item, ItemCollectedPayload, ItemId, ItemState, ItemStateChangedPayload, MediaType,
    StoredResult,
};
use cinarr_infrastructure::repositories::ItemLookup;
use cinarr_infrastructure::state_files::{
    CollectedNotification, SourceCache, StateDir, StateFileError, COLLECTED_NOTIFICATIONS_FILE,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::context::PipelineContext;
use crate::debrid::DebridError;
use crate::events::publish_event;
use crate::library_verifier::LibraryVerifier;
use crate::search_automation::ScrapeOutcome;

pub use intake::release_due_at;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueueName {
    Wanted,
    Scraping,
    Adding,
    Checking,
    Sleeping,
    Unreleased,
    Blacklisted,
    PendingUncached,
    Upgrading,
    FinalCheck,
    Collected,
}

impl QueueName {
    pub const ALL: [QueueName; 11] = [
        QueueName::Wanted,
        QueueName::Scraping,
        QueueName::Adding,
        QueueName::Checking,
        QueueName::Sleeping,
        QueueName::Unreleased,
        QueueName::Blacklisted,
        QueueName::PendingUncached,
        QueueName::Upgrading,
        QueueName::FinalCheck,
        QueueName::Collected,
    ];

    pub fn state(self) -> ItemState {
        match self {
            QueueName::Wanted => ItemState::Wanted,
            QueueName::Scraping => ItemState::Scraping,
            QueueName::Adding => ItemState::Adding,
            QueueName::Checking => ItemState::Checking,
            QueueName::Sleeping => ItemState::Sleeping,
            QueueName::Unreleased => ItemState::Unreleased,
            QueueName::Blacklisted => ItemState::Blacklisted,
            QueueName::PendingUncached => ItemState::PendingUncached,
            QueueName::Upgrading => ItemState::Upgrading,
            QueueName::FinalCheck => ItemState::FinalCheck,
            QueueName::Collected => ItemState::Collected,
        }
    }

    pub fn from_state(state: ItemState) -> Self {
        match state {
            ItemState::Wanted => QueueName::Wanted,
            ItemState::Scraping => QueueName::Scraping,
            ItemState::Adding => QueueName::Adding,
            ItemState::Checking => QueueName::Checking,
            ItemState::Sleeping => QueueName::Sleeping,
            ItemState::Unreleased => QueueName::Unreleased,
            ItemState::Blacklisted => QueueName::Blacklisted,
            ItemState::PendingUncached => QueueName::PendingUncached,
            ItemState::Upgrading => QueueName::Upgrading,
            ItemState::FinalCheck => QueueName::FinalCheck,
            ItemState::Collected => QueueName::Collected,
        }
    }

    /// Name of the scheduled task that processes this queue.
    pub fn task_name(self) -> &'static str {
        match self {
            QueueName::Wanted => "queue_wanted",
            QueueName::Scraping => "queue_scraping",
            QueueName::Adding => "queue_adding",
            QueueName::Checking => "queue_checking",
            QueueName::Sleeping => "queue_sleeping",
            QueueName::Unreleased => "queue_unreleased",
            QueueName::Blacklisted => "queue_blacklisted",
            QueueName::PendingUncached => "queue_pending_uncached",
            QueueName::Upgrading => "queue_upgrading",
            QueueName::FinalCheck => "queue_final_check",
            QueueName::Collected => "queue_collected",
        }
    }

    pub fn from_task_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.task_name() == name)
    }

    /// Collected is terminal and has no processing step.
    pub fn is_processed(self) -> bool {
        self != QueueName::Collected
    }

    /// Queues whose failures park the item in Sleeping instead of leaving it.
    fn sleeps_on_error(self) -> bool {
        matches!(
            self,
            QueueName::Scraping
                | QueueName::Adding
                | QueueName::Upgrading
                | QueueName::FinalCheck
                | QueueName::PendingUncached
        )
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.state().as_str())
    }
}

/// In-memory mirror of the rows in one state.
#[derive(Debug, Clone)]
pub struct QueueView {
    name: QueueName,
    items: Vec<Item>,
}

impl QueueView {
    pub fn new(name: QueueName) -> Self {
        Self {
            name,
            items: Vec::new(),
        }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    /// Replace the contents with a fresh read of the store.
    pub fn update(&mut self, items: Vec<Item>) {
        self.items = items;
    }

    pub fn add_item(&mut self, item: Item) {
        match self.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    pub fn remove_item(&mut self, id: ItemId) -> Option<Item> {
        let idx = self.items.iter().position(|i| i.id == id)?;
        Some(self.items.remove(idx))
    }

    pub fn contains_item_id(&self, id: ItemId) -> bool {
        self.items.iter().any(|i| i.id == id)
    }

    pub fn get_contents(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Hooks a queue uses to influence the scheduler driving it.
pub trait SchedulerControl: Send + Sync {
    /// A provider signalled a rate limit; dependent tasks should back off.
    fn pause_for_rate_limit(&self, service: &str);
    /// Ask for `task` to run on the next loop iteration.
    fn trigger(&self, task: &str);
}

/// Control surface used when no scheduler is attached.
pub struct NoopControl;

impl SchedulerControl for NoopControl {
    fn pause_for_rate_limit(&self, service: &str) {
        debug!(target: "queue", %service, "rate limit reported without a scheduler");
    }

    fn trigger(&self, _task: &str) {}
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] anyhow::Error),
    #[error(transparent)]
    State(#[from] StateFileError),
    #[error("debrid: {0}")]
    Debrid(#[from] DebridError),
    #[error("item {id} is missing {field}")]
    MissingField { id: ItemId, field: &'static str },
}

/// Counts for one pass over a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub examined: usize,
    pub moved: usize,
    pub failed: usize,
}

pub struct QueueManager {
    ctx: PipelineContext,
    verifier: Arc<LibraryVerifier>,
    views: Mutex<BTreeMap<QueueName, QueueView>>,
}

impl QueueManager {
    pub fn new(ctx: PipelineContext, verifier: Arc<LibraryVerifier>) -> Self {
        let views = QueueName::ALL
            .into_iter()
            .map(|name| (name, QueueView::new(name)))
            .collect();
        Self {
            ctx,
            verifier,
            views: Mutex::new(views),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn verifier(&self) -> &Arc<LibraryVerifier> {
        &self.verifier
    }

    fn views(&self) -> MutexGuard<'_, BTreeMap<QueueName, QueueView>> {
        self.views.lock().unwrap_or_else(|poisoned| {
            warn!(target: "queue", "queue view lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Re-read one queue from the store.
    pub async fn update(&self, queue: QueueName) -> Result<usize> {
        let items = self.ctx.repos.items.list_by_state(queue.state()).await?;
        let count = items.len();
        if let Some(view) = self.views().get_mut(&queue) {
            view.update(items);
        }
        Ok(count)
    }

    pub async fn update_all(&self) -> Result<()> {
        for queue in QueueName::ALL {
            self.update(queue).await?;
        }
        Ok(())
    }

    pub fn contents(&self, queue: QueueName) -> Vec<Item> {
        self.views()
            .get(&queue)
            .map(|v| v.get_contents().to_vec())
            .unwrap_or_default()
    }

    pub fn len(&self, queue: QueueName) -> usize {
        self.views().get(&queue).map(QueueView::len).unwrap_or(0)
    }

    pub fn sizes(&self) -> BTreeMap<QueueName, usize> {
        self.views().iter().map(|(name, view)| (*name, view.len())).collect()
    }

    /// Queue currently holding `id`, if any.
    pub fn queue_of(&self, id: ItemId) -> Option<QueueName> {
        self.views()
            .values()
            .find(|view| view.contains_item_id(id))
            .map(QueueView::name)
    }

    /// Run one pass of `queue`'s rule.
    pub async fn process(&self, queue: QueueName, control: &dyn SchedulerControl) -> Result<ProcessReport> {
        self.update(queue).await?;
        let report = match queue {
            QueueName::Wanted => self.process_wanted().await?,
            QueueName::Scraping => self.process_scraping().await?,
            QueueName::Adding => self.process_adding(control).await?,
            QueueName::Checking => self.process_checking().await?,
            QueueName::Sleeping => self.process_sleeping().await?,
            QueueName::Unreleased => self.process_unreleased().await?,
            QueueName::Blacklisted => self.process_blacklisted().await?,
            QueueName::PendingUncached => self.process_pending_uncached(control).await?,
            QueueName::Upgrading => self.process_upgrading().await?,
            QueueName::FinalCheck => self.process_final_check().await?,
            QueueName::Collected => ProcessReport::default(),
        };
        if report.moved > 0 || report.failed > 0 {
            info!(
                target: "queue",
                queue = %queue,
                examined = report.examined,
                moved = report.moved,
                failed = report.failed,
                "queue processed"
            );
        }
        Ok(report)
    }

    /// Persist `item` in state `to` and mirror the move in the views.
    pub(crate) async fn move_item(&self, item: &mut Item, to: ItemState) -> Result<()> {
        let from = item.state;
        let now = self.ctx.now();
        item.state = to;
        item.last_state_change = now;
        item.last_updated = now;
        match to {
            ItemState::FinalCheck => item.final_check_add_timestamp = Some(now),
            ItemState::Collected if item.collected_at.is_none() => item.collected_at = Some(now),
            ItemState::Sleeping | ItemState::Wanted => item.sleep_until = None,
            _ => {}
        }
        self.ctx.repos.items.update(item).await?;
        if from == ItemState::Checking && to != ItemState::Checking {
            self.verifier.forget(item.id);
        }

        {
            let mut views = self.views();
            if let Some(view) = views.get_mut(&QueueName::from_state(from)) {
                view.remove_item(item.id);
            }
            if let Some(view) = views.get_mut(&QueueName::from_state(to)) {
                view.add_item(item.clone());
            }
        }

        debug!(target: "queue", item_id = %item.id, item = %item.display_label(), %from, %to, "item moved");
        publish_event(
            self.ctx.events.as_ref(),
            &DomainEvent::new(
                "item.state_changed",
                ItemStateChangedPayload {
                    item_id: item.id,
                    from,
                    to,
                },
            ),
        );
        Ok(())
    }

    /// Persist field changes on an item that stays where it is.
    pub(crate) async fn save(&self, item: &mut Item) -> Result<()> {
        item.last_updated = self.ctx.now();
        self.ctx.repos.items.update(item).await?;
        if let Some(view) = self.views().get_mut(&QueueName::from_state(item.state)) {
            view.add_item(item.clone());
        }
        Ok(())
    }

    /// Apply the outcome of a per-item step, isolating its failure.
    async fn settle(
        &self,
        queue: QueueName,
        item: &mut Item,
        outcome: Result<bool, QueueError>,
        report: &mut ProcessReport,
    ) {
        report.examined += 1;
        match outcome {
            Ok(true) => report.moved += 1,
            Ok(false) => {}
            Err(err) => {
                report.failed += 1;
                error!(target: "queue", queue = %queue, item_id = %item.id, item = %item.display_label(), error = %err, "item processing failed");
                if queue.sleeps_on_error() && item.state == queue.state() {
                    if let Err(err) = self.move_item(item, ItemState::Sleeping).await {
                        error!(target: "queue", item_id = %item.id, error = %err, "could not park failed item");
                    }
                }
            }
        }
    }

    /// Everything that happens when an item reaches the library.
    /// Collect a Checking item that absorbed a duplicate row sharing its file.
    /// Returns false when the item is gone or already moved on.
    pub async fn collect_absorbed(&self, id: ItemId) -> Result<bool> {
        let Some(mut item) = self.ctx.repos.items.get(id).await? else {
            return Ok(false);
        };
        if item.state != ItemState::Checking {
            return Ok(false);
        }
        let location = item
            .location_on_disk
            .clone()
            .map(PathBuf::from)
            .or_else(|| self.verifier.locate(&item))
            .or_else(|| self.verifier.candidate_paths(&item).pop());
        let Some(location) = location else {
            warn!(target: "queue", item_id = %item.id, "absorbed item has no file to collect");
            return Ok(false);
        };
        self.promote_to_collected(&mut item, location.to_string_lossy().into_owned())
            .await?;
        Ok(true)
    }

    pub(crate) async fn promote_to_collected(&self, item: &mut Item, location: String) -> Result<(), QueueError> {
        let now = self.ctx.now();
        let is_upgrade = item.upgrading_from_file.is_some();
        if is_upgrade {
            if let Some(old) = item.location_on_disk.clone().filter(|old| *old != location) {
                self.verifier
                    .queue_removal(&old, &item.title, item.episode_title.as_deref())?;
            }
            if let Some(old_torrent) = item.upgrading_from_torrent_id.take() {
                if item.filled_by_torrent_id.as_deref() != Some(old_torrent.as_str()) {
                    if let Err(err) = self.ctx.debrid.remove_torrent(&old_torrent).await {
                        warn!(target: "queue", item_id = %item.id, torrent_id = %old_torrent, error = %err, "could not remove replaced torrent");
                    }
                }
            }
            item.upgrading_from_file = None;
        }

        item.location_on_disk = Some(location);
        item.collected_at = Some(now);
        self.move_item(item, ItemState::Collected).await?;
        info!(target: "queue", item_id = %item.id, item = %item.display_label(), is_upgrade, "item collected");

        if let Some(source) = item.content_source.as_deref() {
            if let Some(key) = source_key(item) {
                let name = StateDir::source_cache_name(source);
                let mut cache: SourceCache = self.ctx.state.read_or_default(&name);
                cache.mark(key, now);
                self.ctx.state.write_json(&name, &cache)?;
            }
        }

        let payload = ItemCollectedPayload::from_item(item, is_upgrade);
        publish_event(
            self.ctx.events.as_ref(),
            &DomainEvent::new("item.collected", payload.clone()),
        );
        self.ctx.state.append_json(
            COLLECTED_NOTIFICATIONS_FILE,
            CollectedNotification {
                payload,
                collected_at: now,
            },
        )?;

        if let Err(err) = self.ctx.post_processing.on_collected(item.clone()).await {
            warn!(target: "queue", item_id = %item.id, error = %err, "post-processing hook failed");
        }

        let upgrading = self.ctx.scrape.version_settings(item).enable_upgrading
            || self.ctx.config.debug.enable_upgrading;
        if !is_upgrade && upgrading {
            self.move_item(item, ItemState::Upgrading).await?;
        }
        Ok(())
    }

    /// Blacklist `item` and make sure its fallback version is wanted.
    pub(crate) async fn blacklist(&self, item: &mut Item) -> Result<(), QueueError> {
        self.move_item(item, ItemState::Blacklisted).await?;
        self.ensure_fallback_version(item).await?;
        Ok(())
    }

    /// Insert the configured fallback version of `item` as Wanted unless that
    /// version already exists in any state.
    pub(crate) async fn ensure_fallback_version(&self, item: &Item) -> Result<Option<ItemId>> {
        let Some(fallback) = self.ctx.scrape.version_settings(item).fallback_version else {
            return Ok(None);
        };
        if item.version_stripped() == Some(fallback.as_str()) || item.imdb_id.is_none() {
            return Ok(None);
        }
        let lookup = ItemLookup {
            version: Some(fallback.clone()),
            ..ItemLookup::for_item(item)
        };
        if !self.ctx.repos.items.find_matching(&lookup).await?.is_empty() {
            return Ok(None);
        }

        let mut replacement = item.clone().with_version(&fallback);
        replacement.id = ItemId::UNSAVED;
        replacement.clear_fill();
        replacement.scrape_results.clear();
        replacement.scrape_attempts = 0;
        replacement.wake_count = 0;
        replacement.sleep_until = None;
        replacement.collected_at = None;
        replacement.final_check_add_timestamp = None;
        replacement.state = ItemState::Wanted;
        replacement.last_state_change = self.ctx.now();
        replacement.last_updated = self.ctx.now();
        let inserted = self.ctx.repos.items.insert(replacement).await?;
        info!(target: "queue", item = %item.display_label(), version = %fallback, item_id = %inserted.id, "fallback version wanted");
        if let Some(view) = self.views().get_mut(&QueueName::Wanted) {
            view.add_item(inserted.clone());
        }
        Ok(Some(inserted.id))
    }

    /// True when an item has been released long enough that an empty scrape
    /// means nothing will ever turn up.
    fn is_old(&self, item: &Item, now: DateTime<Utc>) -> bool {
        let days = match item.media_type {
            MediaType::Movie => self.ctx.config.queue.movie_blacklist_days,
            MediaType::Episode => self.ctx.config.queue.episode_blacklist_days,
        };
        match item.release_date.date() {
            Some(date) => (now.date_naive() - date).num_days() > days,
            None => false,
        }
    }
}

fn stored_results(outcome: &ScrapeOutcome) -> Vec<StoredResult> {
    outcome
        .ranked
        .iter()
        .map(|ranked| ranked.to_stored(outcome.scene))
        .collect()
}

/// Key under which a content source remembers an item it produced.
fn source_key(item: &Item) -> Option<String> {
    item.imdb_id
        .clone()
        .or_else(|| item.tmdb_id.as_ref().map(|id| format!("tmdb:{}", id)))
}

#[cfg(test)]
mod tests;
