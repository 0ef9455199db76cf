// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::BTreeMap;

use cinarr_config::{UltimateSortOrder, VersionSettings, WeightedPattern};
use cinarr_domain::{Resolution, StoredResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::filtering::{Candidate, EpisodeMatch, TitleMatch};

const RESOLUTION_BONUS: f64 = 30.0;
const RESOLUTION_STEP_PENALTY: f64 = 10.0;
const HDR_BONUS: f64 = 10.0;
const TRANSLATED_TITLE_BONUS: f64 = 15.0;
const ALIAS_TITLE_BONUS: f64 = 5.0;
const LANGUAGE_MATCH_BONUS: f64 = 10.0;
const BITRATE_BONUS: f64 = 20.0;
const SEASON_PACK_BONUS: f64 = 15.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub preferred: f64,
    pub resolution: f64,
    pub hdr: f64,
    pub language: f64,
    pub bitrate: f64,
    pub season_pack: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub candidate: Candidate,
    pub score: ScoreBreakdown,
    /// Backend trust weight; only breaks ties.
    pub trust: f64,
}

impl RankedResult {
    pub fn to_stored(&self, scene: Option<(u32, u32)>) -> StoredResult {
        StoredResult {
            title: self.candidate.raw.title.clone(),
            magnet: self.candidate.raw.magnet.clone(),
            size_gb: self.candidate.raw.size_gb,
            source: self.candidate.raw.source.clone(),
            score: self.score.total,
            soft: self.candidate.soft,
            scene_season: scene.map(|(s, _)| s),
            scene_episode: scene.map(|(_, e)| e),
        }
    }
}

pub struct RankingContext<'a> {
    pub settings: &'a VersionSettings,
    pub sweet_spot_mbps: f64,
    pub multi: bool,
    pub preferred_language: Option<&'a str>,
    pub source_trust: &'a BTreeMap<String, f64>,
    pub ultimate_sort_order: UltimateSortOrder,
}

struct Preferences {
    boost: Vec<(Regex, i32)>,
    penalty: Vec<(Regex, i32)>,
}

impl Preferences {
    fn compile(settings: &VersionSettings) -> Self {
        Self {
            boost: compile_weighted(&settings.preferred_filter_in),
            penalty: compile_weighted(&settings.preferred_filter_out),
        }
    }

    fn score(&self, title: &str) -> f64 {
        let plus: i32 = self
            .boost
            .iter()
            .filter(|(re, _)| re.is_match(title))
            .map(|(_, w)| *w)
            .sum();
        let minus: i32 = self
            .penalty
            .iter()
            .filter(|(re, _)| re.is_match(title))
            .map(|(_, w)| *w)
            .sum();
        (plus - minus) as f64
    }
}

fn compile_weighted(patterns: &[WeightedPattern]) -> Vec<(Regex, i32)> {
    patterns
        .iter()
        .filter_map(|WeightedPattern(p, w)| match Regex::new(p) {
            Ok(re) => Some((re, *w)),
            Err(error) => {
                warn!(target: "ranking", pattern = %p, %error, "ignoring invalid preference pattern");
                None
            }
        })
        .collect()
}

/// Bonus peaking at the sweet spot and decaying symmetrically in log space.
pub fn bitrate_bonus(mbps: f64, sweet_spot: f64) -> f64 {
    if mbps <= 0.0 || sweet_spot <= 0.0 {
        return 0.0;
    }
    let distance = (mbps / sweet_spot).ln();
    BITRATE_BONUS * (-distance * distance).exp()
}

fn resolution_bonus(resolution: Resolution, max: Resolution) -> f64 {
    if resolution == Resolution::Unknown {
        return 0.0;
    }
    let steps = (resolution.rank() as f64 - max.rank() as f64).abs();
    (RESOLUTION_BONUS - RESOLUTION_STEP_PENALTY * steps).max(0.0)
}

fn score_with(candidate: &Candidate, ctx: &RankingContext<'_>, prefs: &Preferences) -> ScoreBreakdown {
    let parsed = &candidate.parsed;
    let mut score = ScoreBreakdown {
        preferred: prefs.score(&candidate.raw.title),
        resolution: resolution_bonus(parsed.resolution, ctx.settings.max_resolution),
        ..ScoreBreakdown::default()
    };
    if ctx.settings.enable_hdr && parsed.hdr.is_hdr() {
        score.hdr = HDR_BONUS;
    }
    score.language = match candidate.title_match {
        TitleMatch::Translated => TRANSLATED_TITLE_BONUS,
        TitleMatch::Alias | TitleMatch::PreferredAlias => ALIAS_TITLE_BONUS,
        TitleMatch::Title => 0.0,
    };
    if let Some(lang) = ctx.preferred_language {
        if parsed.languages.iter().any(|l| l == lang) {
            score.language += LANGUAGE_MATCH_BONUS;
        }
    }
    if let Some(rate) = candidate.bitrate_mbps {
        score.bitrate = bitrate_bonus(rate, ctx.sweet_spot_mbps);
    }
    if ctx.multi && candidate.episode_match == EpisodeMatch::SeasonPack {
        score.season_pack = SEASON_PACK_BONUS;
    }
    score.total = score.preferred
        + score.resolution
        + score.hdr
        + score.language
        + score.bitrate
        + score.season_pack;
    score
}

pub fn score(candidate: &Candidate, ctx: &RankingContext<'_>) -> ScoreBreakdown {
    score_with(candidate, ctx, &Preferences::compile(ctx.settings))
}

/// Order candidates best first. Soft results always follow strict ones.
pub fn rank(candidates: Vec<Candidate>, ctx: &RankingContext<'_>) -> Vec<RankedResult> {
    let prefs = Preferences::compile(ctx.settings);
    let mut ranked: Vec<RankedResult> = candidates
        .into_iter()
        .map(|candidate| {
            let score = score_with(&candidate, ctx, &prefs);
            let trust = ctx
                .source_trust
                .get(&candidate.raw.source)
                .copied()
                .unwrap_or(0.0);
            RankedResult {
                candidate,
                score,
                trust,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        a.candidate
            .soft
            .cmp(&b.candidate.soft)
            .then_with(|| b.score.total.total_cmp(&a.score.total))
            .then_with(|| b.trust.total_cmp(&a.trust))
            .then_with(|| {
                let by_size = a.candidate.raw.size_gb.total_cmp(&b.candidate.raw.size_gb);
                match ctx.ultimate_sort_order {
                    UltimateSortOrder::SizeAsc => by_size,
                    UltimateSortOrder::SizeDesc => by_size.reverse(),
                }
            })
            .then_with(|| a.candidate.raw.title.cmp(&b.candidate.raw.title))
    });

    if let Some(best) = ranked.first() {
        debug!(
            target: "ranking",
            title = %best.candidate.raw.title,
            total = best.score.total,
            candidates = ranked.len(),
            "best release selected"
        );
    }
    ranked
}

/// Whether `challenger` beats `current` by at least `margin`.
pub fn is_material_upgrade(current: f64, challenger: f64, margin: f64) -> bool {
    challenger >= current + margin
}
