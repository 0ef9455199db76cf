// SPDX-License-Identifier: GPL-3.0-or-later
//! Turns an (item, version) pair into an ordered list of acceptable releases.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cinarr_config::{AppConfig, VersionSettings};
use cinarr_domain::{Item, MediaType, StoredResult};
use cinarr_infrastructure::repositories::{AliasKey, AliasRepository, NotWantedRepository};
use moka::sync::Cache;
use tracing::{debug, info, warn};

use crate::filtering::{filter_results, EpisodeContext, FilterInput, FilterOutcome, TitleCandidates};
use crate::metadata::{resolve_scene_numbering, ContentKind, MetadataProvider, ShowMetadata};
use crate::ranking::{rank, RankedResult, RankingContext};
use crate::release_parsing::parse_release_title;
use crate::scrapers::{RawResult, ScrapeQuery, ScraperManager};

const METADATA_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Result of one scrape for one item.
#[derive(Debug, Clone, Default)]
pub struct ScrapeOutcome {
    pub ranked: Vec<RankedResult>,
    /// Number of candidates that passed every gate except size and bitrate.
    pub pre_size: usize,
    pub scene: Option<(u32, u32)>,
    pub absolute: Option<u32>,
    /// Search title that produced `ranked`.
    pub query_title: String,
}

impl ScrapeOutcome {
    pub fn best(&self) -> Option<&RankedResult> {
        self.ranked.first()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct SearchTitles {
    candidates: TitleCandidates,
    /// Language code of `candidates.translated`.
    translated_language: Option<String>,
    /// Country aliases not already covered by the title or preferred alias.
    fallback_aliases: Vec<String>,
}

pub struct ScrapeService {
    config: Arc<AppConfig>,
    scrapers: ScraperManager,
    metadata: Arc<dyn MetadataProvider>,
    aliases: Arc<dyn AliasRepository>,
    not_wanted: Arc<dyn NotWantedRepository>,
    show_cache: Cache<String, Arc<ShowMetadata>>,
    translation_cache: Cache<(String, String), Option<String>>,
}

impl ScrapeService {
    pub fn new(
        config: Arc<AppConfig>,
        scrapers: ScraperManager,
        metadata: Arc<dyn MetadataProvider>,
        aliases: Arc<dyn AliasRepository>,
        not_wanted: Arc<dyn NotWantedRepository>,
    ) -> Self {
        Self {
            config,
            scrapers,
            metadata,
            aliases,
            not_wanted,
            show_cache: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(METADATA_CACHE_TTL)
                .build(),
            translation_cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(METADATA_CACHE_TTL)
                .build(),
        }
    }

    /// Settings of the item's version; unknown versions fall back to defaults.
    pub fn version_settings(&self, item: &Item) -> VersionSettings {
        let raw = item.version.as_deref().unwrap_or_default();
        match self.config.scraping.version(raw) {
            Some(settings) => settings.clone(),
            None => {
                warn!(target: "scraping", version = %raw, item = %item.display_label(), "version not configured; using defaults");
                VersionSettings::default()
            }
        }
    }

    pub async fn show_metadata(&self, imdb_id: &str) -> Option<Arc<ShowMetadata>> {
        if let Some(cached) = self.show_cache.get(imdb_id) {
            return Some(cached);
        }
        match self.metadata.show_metadata(imdb_id).await {
            Ok(show) => {
                let show = Arc::new(show);
                self.show_cache.insert(imdb_id.to_string(), Arc::clone(&show));
                Some(show)
            }
            Err(error) => {
                debug!(target: "scraping", %imdb_id, %error, "show metadata unavailable");
                None
            }
        }
    }

    /// Scene mapping, absolute number and air date of an episode item.
    pub async fn episode_context(&self, item: &Item) -> Option<EpisodeContext> {
        if item.media_type != MediaType::Episode {
            return None;
        }
        let (season, episode) = (item.season_number?, item.episode_number?);
        let mut context = EpisodeContext {
            air_date: item.release_date.date(),
            ..EpisodeContext::default()
        };

        if let Some(show) = match item.imdb_id.as_deref() {
            Some(imdb) => self.show_metadata(imdb).await,
            None => None,
        } {
            context.scene = resolve_scene_numbering(&show, season, episode, item.is_anime());
            context.absolute = show.absolute_episode(season, episode);
            context.season_episode_count = show.season_episode_count(season);
            if let Some(aired) = show.episode(season, episode).and_then(|e| e.first_aired) {
                context.air_date = Some(aired.date_naive());
            }
        }
        Some(context)
    }

    /// Scrape, filter and rank releases for `item`.
    pub async fn scrape(&self, item: &Item, multi: bool) -> Result<ScrapeOutcome> {
        let settings = self.version_settings(item);
        let soft = item.is_soft_version();
        let episode = self.episode_context(item).await;
        let scene = episode
            .as_ref()
            .and_then(|ctx| ctx.scene)
            .map(|m| (m.season, m.episode));

        let not_wanted = if self.config.debug.disable_not_wanted_check {
            HashSet::new()
        } else {
            self.not_wanted.all().await?
        };
        let titles = self.search_titles(item, &settings).await?;

        let evaluate = |results: Vec<RawResult>, titles: &TitleCandidates| -> FilterOutcome {
            filter_results(
                &FilterInput {
                    item,
                    settings: &settings,
                    soft,
                    titles,
                    episode: episode.as_ref(),
                    not_wanted: &not_wanted,
                    disable_not_wanted_check: self.config.debug.disable_not_wanted_check,
                    multi,
                },
                results,
            )
        };

        let primary_title = titles
            .candidates
            .preferred_alias
            .clone()
            .unwrap_or_else(|| titles.candidates.title.clone());
        let mut query_title = primary_title.clone();

        let mut raw = Vec::new();
        if let Some(translated) = &titles.candidates.translated {
            raw.extend(self.scrapers.scrape(&self.query(item, translated, multi, scene)).await);
        }
        raw.extend(self.scrapers.scrape(&self.query(item, &primary_title, multi, scene)).await);
        let mut outcome = evaluate(raw, &titles.candidates);

        if outcome.accepted.is_empty() && !titles.fallback_aliases.is_empty() {
            let mut best: Option<(String, FilterOutcome)> = None;
            for alias in &titles.fallback_aliases {
                let raw = self.scrapers.scrape(&self.query(item, alias, multi, scene)).await;
                let attempt = evaluate(raw, &titles.candidates);
                let prior = best.as_ref().map(|(_, o)| o.accepted.len()).unwrap_or(0);
                if attempt.accepted.len() > prior {
                    best = Some((alias.clone(), attempt));
                }
            }
            if let Some((alias, attempt)) = best {
                info!(target: "scraping", item = %item.display_label(), %alias, "promoting search alias");
                if let Some(key) = alias_key(item) {
                    self.aliases.set_preferred(&key, &alias).await?;
                }
                query_title = alias;
                outcome = attempt;
            }
        }

        let ranked = rank(
            outcome.accepted,
            &RankingContext {
                settings: &settings,
                sweet_spot_mbps: self.sweet_spot(item),
                multi,
                preferred_language: titles.translated_language.as_deref(),
                source_trust: &self.config.scraping.source_trust,
                ultimate_sort_order: self.config.scraping.ultimate_sort_order,
            },
        );

        debug!(
            target: "scraping",
            item = %item.display_label(),
            accepted = ranked.len(),
            rejected = outcome.rejected.len(),
            multi,
            "scrape finished"
        );

        Ok(ScrapeOutcome {
            ranked,
            pre_size: outcome.pre_size.len(),
            scene,
            absolute: episode.as_ref().and_then(|ctx| ctx.absolute),
            query_title,
        })
    }

    /// Score a previously accepted release under the current settings.
    /// `None` when it would no longer pass the filters.
    pub async fn rescore(&self, item: &Item, current: &StoredResult) -> Result<Option<f64>> {
        let settings = self.version_settings(item);
        let episode = self.episode_context(item).await;
        let titles = self.search_titles(item, &settings).await?;
        let multi = parse_release_title(&current.title, Some(current.size_gb))
            .map(|info| info.is_season_pack())
            .unwrap_or(false);
        let raw = RawResult {
            title: current.title.clone(),
            size_gb: current.size_gb,
            magnet: current.magnet.clone(),
            source: current.source.clone(),
            seeders: None,
        };
        let outcome = filter_results(
            &FilterInput {
                item,
                settings: &settings,
                soft: item.is_soft_version(),
                titles: &titles.candidates,
                episode: episode.as_ref(),
                not_wanted: &HashSet::new(),
                disable_not_wanted_check: true,
                multi,
            },
            vec![raw],
        );
        let ranked = rank(
            outcome.accepted,
            &RankingContext {
                settings: &settings,
                sweet_spot_mbps: self.sweet_spot(item),
                multi,
                preferred_language: titles.translated_language.as_deref(),
                source_trust: &self.config.scraping.source_trust,
                ultimate_sort_order: self.config.scraping.ultimate_sort_order,
            },
        );
        Ok(ranked.first().map(|r| r.score.total))
    }

    fn sweet_spot(&self, item: &Item) -> f64 {
        match item.media_type {
            MediaType::Movie => self.config.scraping.bitrate_sweet_spot_movie_mbps,
            MediaType::Episode => self.config.scraping.bitrate_sweet_spot_episode_mbps,
        }
    }

    fn query(&self, item: &Item, title: &str, multi: bool, scene: Option<(u32, u32)>) -> ScrapeQuery {
        let (season, episode) = match scene {
            Some((s, e)) => (Some(s), Some(e)),
            None => (item.season_number, item.episode_number),
        };
        ScrapeQuery {
            imdb_id: item.imdb_id.clone(),
            tmdb_id: item.tmdb_id.clone(),
            title: title.to_string(),
            year: item.year,
            media_type: item.media_type,
            season,
            episode,
            multi,
        }
    }

    async fn search_titles(&self, item: &Item, settings: &VersionSettings) -> Result<SearchTitles> {
        let mut titles = SearchTitles {
            candidates: TitleCandidates::new(item.title.clone()),
            ..SearchTitles::default()
        };
        let Some(imdb_id) = item.imdb_id.as_deref() else {
            return Ok(titles);
        };
        let kind = match item.media_type {
            MediaType::Movie => ContentKind::Movie,
            MediaType::Episode => ContentKind::Show,
        };

        if let Some(key) = alias_key(item) {
            titles.candidates.preferred_alias = self.aliases.get_preferred(&key).await?;
        }

        for language in settings.language_codes().into_iter().filter(|l| l != "en") {
            if let Some(translated) = self.translation(imdb_id, kind, &language).await {
                titles.candidates.translated = Some(translated);
                titles.translated_language = Some(language);
                break;
            }
        }

        let aliases = match self.metadata.aliases(imdb_id, kind).await {
            Ok(aliases) => aliases,
            Err(error) => {
                debug!(target: "scraping", %imdb_id, %error, "aliases unavailable");
                Default::default()
            }
        };
        if let Some(country) = item.country.as_deref() {
            let covered = [
                Some(titles.candidates.title.to_lowercase()),
                titles.candidates.preferred_alias.as_ref().map(|a| a.to_lowercase()),
            ];
            for (code, names) in &aliases {
                if !code.eq_ignore_ascii_case(country) {
                    continue;
                }
                for name in names {
                    titles.candidates.aliases.push(name.clone());
                    if !covered.contains(&Some(name.to_lowercase()))
                        && !titles.fallback_aliases.contains(name)
                    {
                        titles.fallback_aliases.push(name.clone());
                    }
                }
            }
        }
        Ok(titles)
    }

    async fn translation(&self, imdb_id: &str, kind: ContentKind, language: &str) -> Option<String> {
        let key = (imdb_id.to_string(), language.to_string());
        if let Some(cached) = self.translation_cache.get(&key) {
            return cached;
        }
        let translated = match self.metadata.translate_title(imdb_id, kind, language).await {
            Ok(t) => t.filter(|t| !t.trim().is_empty()),
            Err(error) => {
                debug!(target: "scraping", %imdb_id, %language, %error, "translation unavailable");
                return None;
            }
        };
        self.translation_cache.insert(key, translated.clone());
        translated
    }
}

fn alias_key(item: &Item) -> Option<AliasKey> {
    Some(AliasKey {
        tmdb_id: item.tmdb_id.clone().unwrap_or_default(),
        imdb_id: item.imdb_id.clone()?,
        content_type: item.media_type,
        season_number: item.season_number,
    })
}
