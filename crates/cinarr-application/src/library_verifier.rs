// SPDX-License-Identifier: GPL-3.0-or-later
//! Decides whether a filled item is visible in the library, and carries out
//! deferred removals against the media server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use cinarr_config::FileManagementMode;
use cinarr_domain::{Item, ItemId, ItemState, MediaType, RemovalStatus};
use cinarr_infrastructure::state_files::{RemovalCache, RemovalCacheEntry, REMOVAL_CACHE_FILE};
use tracing::{debug, info, warn};

use crate::context::PipelineContext;

/// Scans of the enclosing library section happen on these sightings only.
const MAX_SCAN_TICKS: u32 = 5;
/// Unverified symlinks checked by a "recent" pass.
const RECENT_SYMLINK_BATCH: i64 = 50;
/// Every Nth symlink pass walks the whole verification queue.
const FULL_SYMLINK_SCAN_EVERY: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Visible in the library at this path.
    Found(PathBuf),
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub removed: usize,
    pub skipped: usize,
    pub deferred: usize,
}

pub struct LibraryVerifier {
    ctx: PipelineContext,
    scan_ticks: Mutex<HashMap<ItemId, u32>>,
    symlink_runs: AtomicU64,
}

impl LibraryVerifier {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            scan_ticks: Mutex::new(HashMap::new()),
            symlink_runs: AtomicU64::new(0),
        }
    }

    fn ticks(&self) -> std::sync::MutexGuard<'_, HashMap<ItemId, u32>> {
        self.scan_ticks.lock().unwrap_or_else(|poisoned| {
            warn!(target: "verifier", "scan tick lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Drop the scan counter of an item that left Checking.
    pub fn forget(&self, id: ItemId) {
        self.ticks().remove(&id);
    }

    /// Section scans triggered for an item since it was last seen missing.
    pub fn scan_ticks(&self, id: ItemId) -> Option<u32> {
        self.ticks().get(&id).copied()
    }

    /// On-disk locations the item's file may have landed at, most specific first.
    pub fn candidate_paths(&self, item: &Item) -> Vec<PathBuf> {
        let Some(file) = item.filled_by_file.as_deref() else {
            return Vec::new();
        };
        let root = &self.ctx.config.file_management.original_files_path;
        let mut paths: Vec<PathBuf> = [
            item.original_scraped_torrent_title.as_deref(),
            item.real_debrid_original_title.as_deref(),
            item.filled_by_title.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|folder| !folder.is_empty())
        .map(|folder| root.join(folder).join(file))
        .collect();
        paths.push(root.join(file));
        paths.dedup();
        paths
    }

    /// First candidate path that exists.
    pub fn locate(&self, item: &Item) -> Option<PathBuf> {
        self.candidate_paths(item).into_iter().find(|p| p.exists())
    }

    /// Check one Checking item.
    pub async fn verify(&self, item: &Item) -> Result<Verification> {
        let Some(source) = self.locate(item) else {
            self.ticks().remove(&item.id);
            debug!(target: "verifier", item_id = %item.id, "file not on disk yet");
            return Ok(Verification::Missing);
        };

        match self.ctx.config.file_management.mode {
            FileManagementMode::Symlink => self.link(item, &source).await.map(Verification::Found),
            FileManagementMode::MediaServer => {
                if self.ctx.config.file_management.library_checks_disabled {
                    return Ok(Verification::Found(source));
                }
                if self.ctx.media_server.contains_path(&item.title, &source).await? {
                    self.ticks().remove(&item.id);
                    return Ok(Verification::Found(source));
                }
                let tick = {
                    let mut ticks = self.ticks();
                    let tick = ticks.entry(item.id).or_insert(0);
                    *tick += 1;
                    *tick
                };
                if tick <= MAX_SCAN_TICKS {
                    self.scan_enclosing_section(&source).await;
                }
                Ok(Verification::Missing)
            }
        }
    }

    async fn scan_enclosing_section(&self, path: &Path) {
        let sections = match self.ctx.media_server.sections().await {
            Ok(sections) => sections,
            Err(error) => {
                warn!(target: "verifier", %error, "could not list library sections");
                return;
            }
        };
        let folder = path.parent().unwrap_or(path);
        for section in sections.iter().filter(|s| s.contains(path)) {
            debug!(target: "verifier", section = %section.id, path = %folder.display(), "triggering section scan");
            if let Err(error) = self.ctx.media_server.scan_path(&section.id, folder).await {
                warn!(target: "verifier", section = %section.id, %error, "section scan failed");
            }
        }
    }

    /// Create (or refresh) the library symlink for `item` pointing at `source`.
    async fn link(&self, item: &Item, source: &Path) -> Result<PathBuf> {
        let Some(root) = self.ctx.config.file_management.symlinked_files_path.as_ref() else {
            bail!("symlink mode needs file_management.symlinked_files_path");
        };
        let file_name = source
            .file_name()
            .context("source path has no file name")?;
        let link = root.join(library_folder(item)).join(file_name);

        if let Some(parent) = link.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        match tokio::fs::read_link(&link).await {
            Ok(target) if target == source => return Ok(link),
            Ok(_) => tokio::fs::remove_file(&link).await?,
            Err(_) => {}
        }
        tokio::fs::symlink(source, &link)
            .await
            .with_context(|| format!("linking {}", link.display()))?;
        self.ctx
            .repos
            .symlinks
            .add(item.id, &link.to_string_lossy())
            .await?;
        info!(target: "verifier", item_id = %item.id, link = %link.display(), "symlink created");
        Ok(link)
    }

    /// Ask the media server about pending symlinks. Alternates between a
    /// bounded pass over the oldest entries and a full pass.
    pub async fn verify_symlinks(&self) -> Result<usize> {
        let run = self.symlink_runs.fetch_add(1, Ordering::Relaxed);
        let limit = (run % FULL_SYMLINK_SCAN_EVERY != 0).then_some(RECENT_SYMLINK_BATCH);
        let now = self.ctx.now();
        let mut verified = 0;

        for pending in self.ctx.repos.symlinks.list_unverified(limit).await? {
            let link = PathBuf::from(&pending.symlink_path);
            let title = match self.ctx.repos.items.get(pending.item_id).await? {
                Some(item) => item.title,
                None => link
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            };
            if tokio::fs::symlink_metadata(&link).await.is_ok()
                && self.ctx.media_server.contains_path(&title, &link).await?
            {
                self.ctx.repos.symlinks.mark_verified(pending.id, now).await?;
                verified += 1;
                continue;
            }
            self.ctx.repos.symlinks.record_attempt(pending.id, now).await?;
            self.scan_enclosing_section(&link).await;
        }
        Ok(verified)
    }

    /// Defer removal of `path` from the library.
    pub fn queue_removal(&self, path: &str, title: &str, episode_title: Option<&str>) -> Result<()> {
        let mut cache: RemovalCache = self.ctx.state.read_or_default(REMOVAL_CACHE_FILE);
        cache.entry(path.to_string()).or_default().push(RemovalCacheEntry {
            title: title.to_string(),
            path: path.to_string(),
            episode_title: episode_title.map(str::to_string),
            timestamp: self.ctx.now(),
        });
        self.ctx.state.write_json(REMOVAL_CACHE_FILE, &cache)?;
        debug!(target: "verifier", %path, "removal deferred");
        Ok(())
    }

    /// Execute deferred removals older than the configured minimum age.
    pub async fn process_removal_cache(&self) -> Result<RemovalReport> {
        let mut cache: RemovalCache = self.ctx.state.read_or_default(REMOVAL_CACHE_FILE);
        if cache.is_empty() {
            return Ok(RemovalReport::default());
        }
        let now = self.ctx.now();
        let min_age = chrono::Duration::hours(self.ctx.config.file_management.removal_min_age_hours as i64);
        let mut report = RemovalReport::default();

        let paths: Vec<String> = cache.keys().cloned().collect();
        for path in paths {
            let Some(entries) = cache.get(&path) else { continue };
            let Some(newest) = entries.iter().map(|e| e.timestamp).max() else {
                cache.remove(&path);
                continue;
            };
            if now - newest < min_age {
                report.deferred += 1;
                continue;
            }

            if self.is_back_in_library(&path).await? {
                info!(target: "verifier", %path, "item is back in the library; dropping removal");
                cache.remove(&path);
                report.skipped += 1;
                continue;
            }

            let disk_path = PathBuf::from(&path);
            let is_symlink = tokio::fs::symlink_metadata(&disk_path)
                .await
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            if is_symlink {
                if let Err(error) = tokio::fs::remove_file(&disk_path).await {
                    warn!(target: "verifier", %path, %error, "could not unlink symlink; retrying later");
                    report.deferred += 1;
                    continue;
                }
            }

            match self.ctx.media_server.remove_item(&disk_path).await {
                Ok(_) => {
                    let entries = cache.remove(&path).unwrap_or_default();
                    if let Some(entry) = entries.last() {
                        self.ctx
                            .repos
                            .removals
                            .enqueue(&path, &entry.title, entry.episode_title.as_deref())
                            .await?;
                    }
                    report.removed += 1;
                }
                Err(error) => {
                    warn!(target: "verifier", %path, %error, "media server removal failed; retrying later");
                    report.deferred += 1;
                }
            }
        }

        self.ctx.state.write_json(REMOVAL_CACHE_FILE, &cache)?;
        Ok(report)
    }

    async fn is_back_in_library(&self, path: &str) -> Result<bool> {
        let file = Path::new(path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let items = self.ctx.repos.items.find_by_filled_file(&file).await?;
        Ok(items.iter().any(|item| {
            matches!(
                item.state,
                ItemState::Collected | ItemState::Upgrading | ItemState::Checking
            ) && item.location_on_disk.as_deref().map_or(true, |loc| loc == path)
        }))
    }

    /// Re-check pending removals: gone means Verified, otherwise count the
    /// attempt and give up after the configured maximum.
    pub async fn verify_removals(&self) -> Result<(usize, usize)> {
        let max_attempts = self.ctx.config.file_management.removal_max_attempts;
        let (mut verified, mut failed) = (0, 0);
        for record in self.ctx.repos.removals.list_by_status(RemovalStatus::Pending).await? {
            let path = PathBuf::from(&record.item_path);
            let present = self
                .ctx
                .media_server
                .contains_path(&record.item_title, &path)
                .await?;
            let status = if !present {
                verified += 1;
                RemovalStatus::Verified
            } else if record.attempts + 1 >= max_attempts {
                warn!(target: "verifier", path = %record.item_path, attempts = record.attempts + 1, "removal never took effect");
                failed += 1;
                RemovalStatus::Failed
            } else {
                self.scan_enclosing_section(&path).await;
                RemovalStatus::Pending
            };
            self.ctx.repos.removals.record_attempt(record.id, status).await?;
        }
        Ok((verified, failed))
    }
}

/// `Title (Year)` for movies, `Title/Season NN` for episodes.
fn library_folder(item: &Item) -> PathBuf {
    let title: String = item
        .title
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { ' ' } else { c })
        .collect();
    let title = title.trim();
    match (item.media_type, item.year) {
        (MediaType::Movie, Some(year)) => PathBuf::from(format!("{title} ({year})")),
        (MediaType::Movie, None) => PathBuf::from(title),
        (MediaType::Episode, _) => PathBuf::from(title).join(format!(
            "Season {:02}",
            item.season_number.unwrap_or(1)
        )),
    }
}
