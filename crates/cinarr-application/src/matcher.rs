// SPDX-License-Identifier: GPL-3.0-or-later
//! Assigns files inside a debrid torrent to the items they fill.

use cinarr_domain::{Item, ItemId, MediaType};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::debrid::TorrentFile;
use crate::release_parsing::{parse_release_title, ParsedInfo};

lazy_static! {
    static ref SAMPLE_REGEX: Regex =
        Regex::new(r"(?i)(?:^|[\s._\-/\[(])sample(?:[\s._\-\])/]|$)").expect("valid sample regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberingFormat {
    SeasonEpisode,
    Absolute,
    /// Season tags present but episodes keep counting across seasons.
    PseudoSeasonEpisode,
}

/// An item to fill plus the numbering facts the scrape already resolved.
#[derive(Debug, Clone)]
pub struct MatchTarget<'a> {
    pub item: &'a Item,
    pub absolute: Option<u32>,
    /// Scene `(season, episode)` when a scene mapping applied.
    pub scene: Option<(u32, u32)>,
}

impl<'a> MatchTarget<'a> {
    pub fn new(item: &'a Item) -> Self {
        Self {
            item,
            absolute: None,
            scene: None,
        }
    }

    fn season_episode(&self) -> Option<(u32, u32)> {
        self.scene
            .or_else(|| Some((self.item.season_number?, self.item.episode_number?)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAssignment {
    pub item_id: ItemId,
    pub file: TorrentFile,
}

struct ParsedFile<'f> {
    file: &'f TorrentFile,
    info: ParsedInfo,
}

impl ParsedFile<'_> {
    fn season(&self) -> Option<u32> {
        self.info.seasons.first().copied()
    }

    fn is_absolute_only(&self) -> bool {
        self.info.seasons.is_empty() && self.info.episodes.len() == 1
    }
}

pub fn is_sample(file: &TorrentFile) -> bool {
    SAMPLE_REGEX.is_match(&file.path)
}

/// Video files worth matching, samples excluded.
pub fn playable_files(files: &[TorrentFile]) -> Vec<&TorrentFile> {
    files
        .iter()
        .filter(|f| f.is_video() && !is_sample(f))
        .collect()
}

pub fn largest_video(files: &[TorrentFile]) -> Option<&TorrentFile> {
    playable_files(files).into_iter().max_by_key(|f| f.bytes)
}

/// Match `files` against `targets`. Every target gets at most one file; a
/// target whose candidates are ambiguous is left out.
pub fn match_files(files: &[TorrentFile], targets: &[MatchTarget<'_>]) -> Vec<FileAssignment> {
    let mut assignments = Vec::new();

    if targets
        .iter()
        .all(|t| t.item.media_type == MediaType::Movie)
    {
        if let Some(file) = largest_video(files) {
            for target in targets {
                assignments.push(FileAssignment {
                    item_id: target.item.id,
                    file: file.clone(),
                });
            }
        }
        return assignments;
    }

    let parsed: Vec<ParsedFile<'_>> = playable_files(files)
        .into_iter()
        .filter_map(|file| {
            parse_release_title(file.basename(), Some(file.size_gb()))
                .ok()
                .map(|info| ParsedFile { file, info })
        })
        .collect();
    let format = detect_format(&parsed);
    debug!(target: "matcher", ?format, files = parsed.len(), "numbering format detected");

    for target in targets {
        let matches: Vec<&ParsedFile<'_>> = parsed
            .iter()
            .filter(|pf| file_matches(pf, target, format))
            .collect();
        match matches.as_slice() {
            [only] => assignments.push(FileAssignment {
                item_id: target.item.id,
                file: only.file.clone(),
            }),
            [] => {
                debug!(target: "matcher", item = %target.item.display_label(), "no file matches");
            }
            many => {
                debug!(
                    target: "matcher",
                    item = %target.item.display_label(),
                    candidates = many.len(),
                    "ambiguous files; leaving unassigned"
                );
            }
        }
    }
    assignments
}

/// Pseudo season/episode takes priority: the `episode > 50 ∧ season > 1`
/// rule first, then the continuity rule. Absolute when most files carry a
/// bare episode number.
pub fn detect_format_of(files: &[TorrentFile]) -> NumberingFormat {
    let parsed: Vec<ParsedFile<'_>> = playable_files(files)
        .into_iter()
        .filter_map(|file| {
            parse_release_title(file.basename(), None)
                .ok()
                .map(|info| ParsedFile { file, info })
        })
        .collect();
    detect_format(&parsed)
}

fn detect_format(files: &[ParsedFile<'_>]) -> NumberingFormat {
    if files.is_empty() {
        return NumberingFormat::SeasonEpisode;
    }

    let high_numbers = files.iter().any(|pf| {
        pf.season().is_some_and(|s| s > 1) && pf.info.episodes.iter().any(|e| *e > 50)
    });
    if high_numbers || is_continuous_across_seasons(files) {
        return NumberingFormat::PseudoSeasonEpisode;
    }

    let absolute = files.iter().filter(|pf| pf.is_absolute_only()).count();
    if absolute * 2 > files.len() {
        return NumberingFormat::Absolute;
    }
    NumberingFormat::SeasonEpisode
}

/// Episode numbers keep increasing by one across a season change, and the
/// sequence covers more than 90% of the files.
fn is_continuous_across_seasons(files: &[ParsedFile<'_>]) -> bool {
    let mut numbered: Vec<(u32, u32)> = files
        .iter()
        .filter_map(|pf| Some((pf.season()?, *pf.info.episodes.first()?)))
        .collect();
    let max_season = numbered.iter().map(|(s, _)| *s).max().unwrap_or(0);
    if max_season <= 1 || numbered.len() < 2 {
        return false;
    }
    numbered.sort_unstable();

    let mut continuous = 1;
    let mut crosses_season = false;
    for pair in numbered.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if next.1 == prev.1 + 1 {
            continuous += 1;
            if next.0 != prev.0 {
                crosses_season = true;
            }
        }
    }
    crosses_season && continuous as f64 > 0.9 * files.len() as f64
}

fn file_matches(pf: &ParsedFile<'_>, target: &MatchTarget<'_>, format: NumberingFormat) -> bool {
    let Some((season, episode)) = target.season_episode() else {
        return false;
    };
    // A file without a season tag counts as season 1.
    let regular = || {
        let season_ok = if pf.info.seasons.is_empty() {
            season == 1
        } else {
            pf.info.seasons.contains(&season)
        };
        season_ok && pf.info.episodes.contains(&episode)
    };
    let absolute = || {
        target
            .absolute
            .is_some_and(|abs| pf.info.seasons.is_empty() && pf.info.episodes.contains(&abs))
    };

    match format {
        NumberingFormat::SeasonEpisode => regular() || (target.item.is_anime() && absolute()),
        NumberingFormat::Absolute => absolute() || (target.absolute.is_none() && regular()),
        NumberingFormat::PseudoSeasonEpisode => {
            let Some(file_season) = pf.season() else {
                return absolute();
            };
            let wanted = pseudo_absolute(season, episode);
            pf.info.episodes.iter().any(|e| {
                pseudo_absolute(file_season, *e) == wanted
                    || target.absolute.is_some_and(|abs| *e == abs)
            })
        }
    }
}

/// `(season - 1) * 100 + episode`.
pub fn pseudo_absolute(season: u32, episode: u32) -> u32 {
    season.saturating_sub(1) * 100 + episode
}
