// SPDX-License-Identifier: GPL-3.0-or-later
//! Acceptability gates applied to scraped releases for one item and version.

use std::collections::HashSet;

use chrono::{Datelike, NaiveDate};
use cinarr_config::{ResolutionWanted, VersionSettings, WeightedPattern};
use cinarr_domain::{Item, MediaType, Resolution};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::debrid::extract_info_hash;
use crate::metadata::SceneMapping;
use crate::release_parsing::{parse_release_title, ParsedInfo};
use crate::scrapers::RawResult;
use crate::title_similarity::{best_match, normalize_title};

pub const DEFAULT_MOVIE_RUNTIME_MINUTES: u32 = 120;
pub const DEFAULT_EPISODE_RUNTIME_MINUTES: u32 = 30;

/// Long-running anime released with absolute numbers only.
const KNOWN_ABSOLUTE_SHOWS: &[&str] = &[
    "tt0388629", // One Piece
    "tt0409591", // Naruto
    "tt0988824", // Naruto Shippuden
    "tt0434665", // Bleach
    "tt0131179", // Detective Conan
];

/// Titles a release may legitimately carry for an item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TitleCandidates {
    pub title: String,
    pub preferred_alias: Option<String>,
    pub translated: Option<String>,
    pub aliases: Vec<String>,
}

impl TitleCandidates {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    fn references(&self) -> Vec<(TitleMatch, String)> {
        let mut refs = vec![(TitleMatch::Title, self.title.clone())];
        if let Some(alias) = &self.preferred_alias {
            refs.push((TitleMatch::PreferredAlias, alias.clone()));
        }
        if let Some(translated) = &self.translated {
            refs.push((TitleMatch::Translated, translated.clone()));
        }
        refs.extend(self.aliases.iter().map(|a| (TitleMatch::Alias, a.clone())));
        refs
    }
}

/// Numbering facts about the episode being filled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpisodeContext {
    pub scene: Option<SceneMapping>,
    pub absolute: Option<u32>,
    pub air_date: Option<NaiveDate>,
    pub season_episode_count: Option<u32>,
}

pub struct FilterInput<'a> {
    pub item: &'a Item,
    pub settings: &'a VersionSettings,
    /// Version carries the `*` marker.
    pub soft: bool,
    pub titles: &'a TitleCandidates,
    pub episode: Option<&'a EpisodeContext>,
    pub not_wanted: &'a HashSet<String>,
    pub disable_not_wanted_check: bool,
    pub multi: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleMatch {
    Title,
    PreferredAlias,
    Translated,
    Alias,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeMatch {
    Movie,
    Regular,
    Absolute,
    /// `SxxE<absolute>`.
    Combined,
    SeasonPack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub raw: RawResult,
    pub parsed: ParsedInfo,
    pub title_match: TitleMatch,
    pub title_score: f64,
    pub episode_match: EpisodeMatch,
    /// Size attributed to the single item being filled.
    pub per_item_size_gb: f64,
    pub bitrate_mbps: Option<f64>,
    pub soft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    Duplicate,
    Unparseable,
    TitleMismatch,
    YearMismatch,
    EpisodeMismatch,
    AirDateMismatch,
    Resolution,
    Hdr,
    Size,
    Bitrate,
    NotPhysical,
    NotWanted,
    FilteredOut(String),
    MissingRequired,
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub accepted: Vec<Candidate>,
    /// Candidates that passed every gate before the size gate.
    pub pre_size: Vec<Candidate>,
    pub rejected: Vec<(String, RejectReason)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    Strict,
    /// Soft versions only: resolution, HDR and required patterns are waived.
    Relaxed,
}

/// Run every gate over `results`. Soft versions that yield nothing under the
/// strict rules get a second, relaxed pass whose results are marked soft.
pub fn filter_results(input: &FilterInput<'_>, results: Vec<RawResult>) -> FilterOutcome {
    let strict = run_gates(input, results.clone(), Pass::Strict);
    if !strict.accepted.is_empty() || !input.soft {
        return strict;
    }
    debug!(target: "filter", item_id = %input.item.id, "strict pass empty; relaxing soft version");
    let mut relaxed = run_gates(input, results, Pass::Relaxed);
    relaxed.rejected.extend(strict.rejected);
    relaxed
}

fn run_gates(input: &FilterInput<'_>, results: Vec<RawResult>, pass: Pass) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();
    let item = input.item;
    let anime = item.is_anime();
    let references = input.titles.references();
    let reference_titles: Vec<String> = references.iter().map(|(_, t)| t.clone()).collect();
    let filter_out = compile_patterns(&input.settings.filter_out);
    let filter_in = compile_patterns(&input.settings.filter_in);
    let not_wanted_hashes: HashSet<String> = input
        .not_wanted
        .iter()
        .filter_map(|m| extract_info_hash(m))
        .collect();

    let mut seen_magnets = HashSet::new();
    let mut seen_releases = HashSet::new();

    for raw in results {
        if !seen_magnets.insert(normalize_magnet(&raw.magnet)) {
            outcome.rejected.push((raw.title, RejectReason::Duplicate));
            continue;
        }

        let parsed = match parse_release_title(&raw.title, Some(raw.size_gb)) {
            Ok(p) => p,
            Err(error) => {
                debug!(target: "filter", title = %raw.title, %error, "unparseable release dropped");
                outcome.rejected.push((raw.title, RejectReason::Unparseable));
                continue;
            }
        };

        let release_key = (
            normalize_title(&parsed.parsed_title),
            (raw.size_gb * 10.0).round() as i64,
            parsed.resolution,
        );
        if !seen_releases.insert(release_key) {
            outcome.rejected.push((raw.title, RejectReason::Duplicate));
            continue;
        }

        let Some((idx, title_score)) = best_match(&parsed.parsed_title, &reference_titles, anime)
        else {
            outcome.rejected.push((raw.title, RejectReason::TitleMismatch));
            continue;
        };
        let title_match = references[idx].0;

        let episode_match = match item.media_type {
            MediaType::Movie => {
                if let (Some(want), Some(got)) = (item.year, parsed.year) {
                    if (want - got).abs() > 1 {
                        outcome.rejected.push((raw.title, RejectReason::YearMismatch));
                        continue;
                    }
                }
                EpisodeMatch::Movie
            }
            MediaType::Episode => {
                let ctx = input.episode.cloned().unwrap_or_default();
                let Some(matched) = episode_gate(&parsed, item, &ctx, input.multi) else {
                    outcome.rejected.push((raw.title, RejectReason::EpisodeMismatch));
                    continue;
                };
                if let (Some(air), Some(year)) = (ctx.air_date, parsed.year) {
                    if (air.year() - year).abs() > 1 {
                        outcome.rejected.push((raw.title, RejectReason::AirDateMismatch));
                        continue;
                    }
                }
                matched
            }
        };

        if pass == Pass::Strict {
            if !resolution_allowed(parsed.resolution, input.settings) {
                outcome.rejected.push((raw.title, RejectReason::Resolution));
                continue;
            }
            if !input.settings.enable_hdr && parsed.hdr.is_hdr() {
                outcome.rejected.push((raw.title, RejectReason::Hdr));
                continue;
            }
        }

        let per_item_size_gb = per_item_size(raw.size_gb, &parsed, episode_match, input.episode);
        let runtime = item.runtime_minutes.unwrap_or(match item.media_type {
            MediaType::Movie => DEFAULT_MOVIE_RUNTIME_MINUTES,
            MediaType::Episode => DEFAULT_EPISODE_RUNTIME_MINUTES,
        });
        let bitrate_mbps = bitrate_mbps(per_item_size_gb, runtime);

        let candidate = Candidate {
            raw,
            parsed,
            title_match,
            title_score,
            episode_match,
            per_item_size_gb,
            bitrate_mbps,
            soft: pass == Pass::Relaxed,
        };
        outcome.pre_size.push(candidate.clone());

        let settings = input.settings;
        if per_item_size_gb < settings.min_size_gb
            || settings.max_size_gb.is_some_and(|max| per_item_size_gb > max)
        {
            outcome.rejected.push((candidate.raw.title, RejectReason::Size));
            continue;
        }
        if let Some(rate) = bitrate_mbps {
            if rate < settings.min_bitrate_mbps
                || settings.max_bitrate_mbps.is_some_and(|max| rate > max)
            {
                outcome.rejected.push((candidate.raw.title, RejectReason::Bitrate));
                continue;
            }
        }
        if settings.require_physical_release && !candidate.parsed.is_physical() {
            outcome.rejected.push((candidate.raw.title, RejectReason::NotPhysical));
            continue;
        }

        if !input.disable_not_wanted_check {
            let hash_blocked = extract_info_hash(&candidate.raw.magnet)
                .is_some_and(|h| not_wanted_hashes.contains(&h));
            if hash_blocked || input.not_wanted.contains(&candidate.raw.magnet) {
                outcome.rejected.push((candidate.raw.title, RejectReason::NotWanted));
                continue;
            }
        }

        if let Some(re) = filter_out.iter().find(|re| re.is_match(&candidate.raw.title)) {
            let pattern = re.as_str().to_string();
            outcome
                .rejected
                .push((candidate.raw.title, RejectReason::FilteredOut(pattern)));
            continue;
        }
        if pass == Pass::Strict
            && !filter_in.is_empty()
            && !filter_in.iter().any(|re| re.is_match(&candidate.raw.title))
        {
            outcome
                .rejected
                .push((candidate.raw.title, RejectReason::MissingRequired));
            continue;
        }

        outcome.accepted.push(candidate);
    }

    for (title, reason) in &outcome.rejected {
        debug!(target: "filter", %title, ?reason, "release rejected");
    }
    outcome
}

/// Magnet identity: the btih hash when present, else the link without its
/// display name and tracker parameters.
pub fn normalize_magnet(magnet: &str) -> String {
    if let Some(hash) = extract_info_hash(magnet) {
        return format!("btih:{}", hash);
    }
    let lower = magnet.trim().to_ascii_lowercase();
    match lower.split_once('?') {
        Some((head, query)) => {
            let kept: Vec<&str> = query
                .split('&')
                .filter(|p| !p.starts_with("dn=") && !p.starts_with("tr="))
                .collect();
            format!("{}?{}", head, kept.join("&"))
        }
        None => lower,
    }
}

/// Compile `(regex, weight)` patterns, skipping invalid ones.
pub(crate) fn compile_patterns(patterns: &[WeightedPattern]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|WeightedPattern(p, _)| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(error) => {
                warn!(target: "filter", pattern = %p, %error, "ignoring invalid filter pattern");
                None
            }
        })
        .collect()
}

pub fn resolution_allowed(resolution: Resolution, settings: &VersionSettings) -> bool {
    let max = settings.max_resolution;
    match settings.resolution_wanted {
        ResolutionWanted::AtMost => {
            resolution == Resolution::Unknown || resolution.rank() <= max.rank()
        }
        ResolutionWanted::AtLeast => {
            resolution != Resolution::Unknown && resolution.rank() >= max.rank()
        }
        ResolutionWanted::Exactly => resolution == max,
    }
}

/// Whether the show is released with absolute numbers only.
pub fn is_known_absolute(item: &Item) -> bool {
    if item
        .imdb_id
        .as_deref()
        .is_some_and(|id| KNOWN_ABSOLUTE_SHOWS.contains(&id))
    {
        return true;
    }
    match (item.season_number, item.episode_number) {
        (_, Some(e)) if e > 100 => true,
        (Some(s), Some(e)) => s > 10 && e > 50,
        _ => false,
    }
}

fn episode_gate(
    parsed: &ParsedInfo,
    item: &Item,
    ctx: &EpisodeContext,
    multi: bool,
) -> Option<EpisodeMatch> {
    let (season, episode) = match ctx.scene {
        Some(scene) => (scene.season, scene.episode),
        None => (item.season_number?, item.episode_number?),
    };

    if parsed.is_season_pack() {
        return (multi && parsed.seasons.contains(&season)).then_some(EpisodeMatch::SeasonPack);
    }

    let regular = || regular_match(parsed, season, episode);
    if !item.is_anime() {
        return regular();
    }

    let absolute = match ctx.scene {
        Some(scene) if scene.via_absolute => Some(scene.episode),
        _ => ctx.absolute,
    };
    let absolute_form = || absolute.and_then(|abs| absolute_match(parsed, abs));
    let combined_form = || absolute.and_then(|abs| combined_match(parsed, season, abs));

    if is_known_absolute(item) {
        return absolute_form().or_else(combined_form);
    }
    regular().or_else(absolute_form).or_else(combined_form)
}

fn regular_match(parsed: &ParsedInfo, season: u32, episode: u32) -> Option<EpisodeMatch> {
    let season_ok = if parsed.seasons.is_empty() {
        season == 1
    } else {
        parsed.seasons.contains(&season)
    };
    (season_ok && parsed.episodes.contains(&episode)).then_some(EpisodeMatch::Regular)
}

fn absolute_match(parsed: &ParsedInfo, absolute: u32) -> Option<EpisodeMatch> {
    (parsed.seasons.is_empty() && parsed.episodes.contains(&absolute))
        .then_some(EpisodeMatch::Absolute)
}

fn combined_match(parsed: &ParsedInfo, season: u32, absolute: u32) -> Option<EpisodeMatch> {
    (parsed.seasons.contains(&season) && parsed.episodes.contains(&absolute))
        .then_some(EpisodeMatch::Combined)
}

fn per_item_size(
    size_gb: f64,
    parsed: &ParsedInfo,
    matched: EpisodeMatch,
    ctx: Option<&EpisodeContext>,
) -> f64 {
    match matched {
        EpisodeMatch::SeasonPack => {
            let per_season = ctx
                .and_then(|c| c.season_episode_count)
                .filter(|c| *c > 0)
                .unwrap_or(10);
            size_gb / (per_season as f64 * parsed.seasons.len().max(1) as f64)
        }
        EpisodeMatch::Movie => size_gb,
        _ => size_gb / parsed.episodes.len().max(1) as f64,
    }
}

/// Average bitrate in Mbps of `size_gb` played over `runtime_minutes`.
pub fn bitrate_mbps(size_gb: f64, runtime_minutes: u32) -> Option<f64> {
    if runtime_minutes == 0 || size_gb <= 0.0 {
        return None;
    }
    let bits = size_gb * 1024.0_f64.powi(3) * 8.0;
    Some(bits / (runtime_minutes as f64 * 60.0) / 1_000_000.0)
}
