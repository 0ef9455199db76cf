// SPDX-License-Identifier: GPL-3.0-or-later
//! Periodic cleanup of rows that describe the same thing twice.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use cinarr_domain::{GroupingKey, Item, ItemId, ItemState};
use cinarr_infrastructure::repositories::CollapsedPair;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::PipelineContext;
use crate::queues::QueueManager;

/// States searched for semantic duplicates.
const SEARCHING_STATES: [ItemState; 3] =
    [ItemState::Scraping, ItemState::Wanted, ItemState::Unreleased];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub collapsed: Vec<(ItemId, ItemId)>,
    pub deleted_duplicates: Vec<ItemId>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.collapsed.is_empty() && self.deleted_duplicates.is_empty()
    }
}

pub struct Reconciler {
    ctx: PipelineContext,
    queues: Arc<QueueManager>,
}

impl Reconciler {
    pub fn new(queues: Arc<QueueManager>) -> Self {
        Self {
            ctx: queues.context().clone(),
            queues,
        }
    }

    pub async fn run(&self) -> Result<ReconcileReport> {
        let collapsed = self
            .ctx
            .repos
            .items
            .collapse_checking_duplicates(self.ctx.now())
            .await
            .context("collapsing checking duplicates")?;
        for CollapsedPair { kept, deleted } in &collapsed {
            info!(target: "reconciler", kept = %kept, deleted = %deleted, "checking item absorbed a row sharing its file");
        }
        let kept: BTreeSet<ItemId> = collapsed.iter().map(|p| p.kept).collect();
        for id in kept {
            self.queues
                .collect_absorbed(id)
                .await
                .with_context(|| format!("collecting absorbed item {id}"))?;
        }

        let deleted_duplicates = self.dedupe_searching().await?;

        let report = ReconcileReport {
            collapsed: collapsed.iter().map(|p| (p.kept, p.deleted)).collect(),
            deleted_duplicates,
        };
        if report.is_empty() {
            debug!(target: "reconciler", "nothing to reconcile");
        }
        Ok(report)
    }

    /// Keep one row per grouping key among the searching states.
    async fn dedupe_searching(&self) -> Result<Vec<ItemId>> {
        let items = self.ctx.repos.items.list_by_states(&SEARCHING_STATES).await?;
        let doomed = duplicate_ids(&items);
        if doomed.is_empty() {
            return Ok(doomed);
        }
        let removed = self.ctx.repos.items.delete_many(&doomed).await?;
        info!(target: "reconciler", removed, "deleted duplicate wanted rows");
        Ok(doomed)
    }
}

fn state_priority(state: ItemState) -> u8 {
    match state {
        ItemState::Scraping => 0,
        ItemState::Wanted => 1,
        _ => 2,
    }
}

/// Ids that lose to a better row with the same grouping key. Scraping beats
/// Wanted beats Unreleased, a plain version beats its soft variant, and the
/// oldest row breaks what is left.
pub fn duplicate_ids(items: &[Item]) -> Vec<ItemId> {
    let mut groups: BTreeMap<GroupingKey, Vec<&Item>> = BTreeMap::new();
    for item in items {
        groups.entry(item.grouping_key()).or_default().push(item);
    }

    let mut doomed = Vec::new();
    for (key, mut group) in groups {
        if group.len() < 2 {
            continue;
        }
        group.sort_by_key(|i| (state_priority(i.state), i.is_soft_version(), i.id));
        debug!(target: "reconciler", imdb_id = %key.imdb_id, version = %key.version, kept = %group[0].id, dropped = group.len() - 1, "duplicate group");
        doomed.extend(group[1..].iter().map(|i| i.id));
    }
    doomed.sort();
    doomed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library_verifier::LibraryVerifier;
    use crate::queues::QueueName;
    use crate::test_support::FixtureBuilder;

    fn with(item: Item, id: i64, state: ItemState) -> Item {
        let mut item = item;
        item.id = ItemId(id);
        item.state = state;
        item
    }

    #[test]
    fn scraping_beats_wanted_beats_unreleased() {
        let base = Item::new_episode("Show", "tt1234567", 1, 5).with_version("1080p");
        let items = vec![
            with(base.clone(), 1, ItemState::Unreleased),
            with(base.clone(), 2, ItemState::Wanted),
            with(base, 3, ItemState::Scraping),
        ];
        assert_eq!(duplicate_ids(&items), vec![ItemId(1), ItemId(2)]);
    }

    #[test]
    fn plain_version_beats_soft_variant_then_oldest_wins() {
        let soft = Item::new_episode("Show", "tt1234567", 1, 5).with_version("1080p*");
        let plain = Item::new_episode("Show", "tt1234567", 1, 5).with_version("1080p");
        let items = vec![
            with(soft, 1, ItemState::Wanted),
            with(plain.clone(), 2, ItemState::Wanted),
            with(plain, 3, ItemState::Wanted),
        ];
        assert_eq!(duplicate_ids(&items), vec![ItemId(1), ItemId(3)]);
    }

    #[test]
    fn different_episodes_and_versions_are_not_duplicates() {
        let items = vec![
            with(Item::new_episode("Show", "tt1", 1, 1).with_version("1080p"), 1, ItemState::Wanted),
            with(Item::new_episode("Show", "tt1", 1, 2).with_version("1080p"), 2, ItemState::Wanted),
            with(Item::new_episode("Show", "tt1", 1, 1).with_version("2160p"), 3, ItemState::Wanted),
        ];
        assert!(duplicate_ids(&items).is_empty());
    }

    #[tokio::test]
    async fn run_is_idempotent() {
        let fx = FixtureBuilder::new().build().await;
        let repo = &fx.ctx.repos.items;
        repo.insert(Item::new_movie("Film", "tt7", 2021).with_version("1080p"))
            .await
            .unwrap();
        repo.insert(Item::new_movie("Film", "tt7", 2021).with_version("1080p*"))
            .await
            .unwrap();

        let mut checking = Item::new_movie("Other", "tt8", 2020).with_version("1080p");
        checking.state = ItemState::Checking;
        checking.filled_by_file = Some("Other.2020.1080p.mkv".into());
        let checking = repo.insert(checking).await.unwrap();
        let mut stale = Item::new_movie("Other", "tt8", 2020).with_version("2160p");
        stale.state = ItemState::Sleeping;
        stale.filled_by_file = Some("Other.2020.1080p.mkv".into());
        let stale = repo.insert(stale).await.unwrap();

        let verifier = Arc::new(LibraryVerifier::new(fx.ctx.clone()));
        let reconciler = Reconciler::new(Arc::new(QueueManager::new(fx.ctx.clone(), verifier)));
        let first = reconciler.run().await.unwrap();
        assert_eq!(first.collapsed, vec![(checking.id, stale.id)]);
        assert_eq!(first.deleted_duplicates.len(), 1);

        let second = reconciler.run().await.unwrap();
        assert!(second.is_empty());

        let wanted = repo.list_by_state(ItemState::Wanted).await.unwrap();
        assert_eq!(wanted.len(), 1);
        assert_eq!(wanted[0].version.as_deref(), Some("1080p"));
        let kept = repo.get(checking.id).await.unwrap().unwrap();
        assert_eq!(kept.state, ItemState::Collected);
    }

    #[tokio::test]
    async fn absorbed_item_is_collected_with_its_side_effects() {
        use cinarr_infrastructure::state_files::{CollectedNotification, COLLECTED_NOTIFICATIONS_FILE};

        let mut builder = FixtureBuilder::new();
        builder.config.file_management.original_files_path = "/mnt/debrid".into();
        let fx = builder.build().await;
        let repo = &fx.ctx.repos.items;

        let mut checking = Item::new_movie("Other", "tt8", 2020).with_version("1080p");
        checking.state = ItemState::Checking;
        checking.filled_by_file = Some("Other.2020.1080p.mkv".into());
        let checking = repo.insert(checking).await.unwrap();
        // Neither row knows where the file is.
        let mut stale = Item::new_movie("Other", "tt8", 2020).with_version("2160p");
        stale.state = ItemState::Sleeping;
        stale.filled_by_file = Some("Other.2020.1080p.mkv".into());
        repo.insert(stale).await.unwrap();

        let verifier = Arc::new(LibraryVerifier::new(fx.ctx.clone()));
        let queues = Arc::new(QueueManager::new(fx.ctx.clone(), verifier));
        Reconciler::new(queues.clone()).run().await.unwrap();

        let kept = repo.get(checking.id).await.unwrap().unwrap();
        assert_eq!(kept.state, ItemState::Collected);
        assert_eq!(kept.collected_at, Some(fx.ctx.now()));
        assert_eq!(
            kept.location_on_disk.as_deref(),
            Some("/mnt/debrid/Other.2020.1080p.mkv")
        );
        let notes: Vec<CollectedNotification> = fx
            .ctx
            .state
            .read_json(COLLECTED_NOTIFICATIONS_FILE)
            .unwrap()
            .unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].payload.item_id, checking.id);
        let names: Vec<String> = fx
            .events
            .drain()
            .iter()
            .filter_map(|e| e["name"].as_str().map(str::to_string))
            .collect();
        assert!(names.contains(&"item.collected".to_string()));
        assert_eq!(queues.queue_of(checking.id), Some(QueueName::Collected));
    }
}
