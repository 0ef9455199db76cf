// SPDX-License-Identifier: GPL-3.0-or-later
use cinarr_domain::Resolution;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdrFormat {
    None,
    Hdr,
    Hdr10,
    Hdr10Plus,
    DolbyVision,
}

impl HdrFormat {
    pub fn is_hdr(&self) -> bool {
        !matches!(self, HdrFormat::None)
    }

    fn token(&self) -> Option<&'static str> {
        match self {
            HdrFormat::None => None,
            HdrFormat::Hdr => Some("HDR"),
            HdrFormat::Hdr10 => Some("HDR10"),
            HdrFormat::Hdr10Plus => Some("HDR10+"),
            HdrFormat::DolbyVision => Some("DV"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseSource {
    UhdBluRay,
    Remux,
    BdRip,
    BrRip,
    BluRay,
    DvdRip,
    WebRip,
    WebDl,
    Hdtv,
    Cam,
    Telesync,
}

impl ReleaseSource {
    /// Sourced from a disc rather than a stream or capture.
    pub fn is_physical(&self) -> bool {
        matches!(
            self,
            ReleaseSource::UhdBluRay
                | ReleaseSource::Remux
                | ReleaseSource::BdRip
                | ReleaseSource::BrRip
                | ReleaseSource::BluRay
                | ReleaseSource::DvdRip
        )
    }

    fn token(&self) -> &'static str {
        match self {
            ReleaseSource::UhdBluRay => "UHD BluRay",
            ReleaseSource::Remux => "REMUX",
            ReleaseSource::BdRip => "BDRip",
            ReleaseSource::BrRip => "BRRip",
            ReleaseSource::BluRay => "BluRay",
            ReleaseSource::DvdRip => "DVDRip",
            ReleaseSource::WebRip => "WEBRip",
            ReleaseSource::WebDl => "WEB-DL",
            ReleaseSource::Hdtv => "HDTV",
            ReleaseSource::Cam => "CAM",
            ReleaseSource::Telesync => "TS",
        }
    }
}

/// Structured facts extracted from a release or file name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedInfo {
    pub original_title: String,
    pub parsed_title: String,
    pub year: Option<i32>,
    /// Empty for absolute-numbered releases.
    pub seasons: Vec<u32>,
    pub episodes: Vec<u32>,
    pub resolution: Resolution,
    pub hdr: HdrFormat,
    pub codec: Option<String>,
    pub audio: Option<String>,
    pub group: Option<String>,
    pub container: Option<String>,
    pub source: Option<ReleaseSource>,
    pub languages: Vec<String>,
    pub other: Vec<String>,
    pub size_gb: Option<f64>,
}

impl ParsedInfo {
    pub fn is_season_pack(&self) -> bool {
        !self.seasons.is_empty() && self.episodes.is_empty()
    }

    pub fn is_physical(&self) -> bool {
        self.source.map(|s| s.is_physical()).unwrap_or(false)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty release title")]
    Empty,
    #[error("no title found in '{0}'")]
    NoTitle(String),
}

// ============================================================================
// Token tables
// ============================================================================

const SE_PATTERN: &str = r"\bS\d{1,2}\s?E\d{1,4}|\bS\d{1,2}\b|\b\d{1,2}x\d{2,3}\b|\bSeasons?\s?\d{1,2}\b|\s-\s\d{2,4}\b|\bE\d{2,4}\b";
const RESOLUTION_PATTERN: &str = r"\b(?:2160|1080|720|576|480)[pi]\b|\b(?:4K|UHD)\b";
const SOURCE_PATTERN: &str = r"\bBlu-?Ray\b|\bREMUX\b|\bBDRip\b|\bBRRip\b|\bDVDRip\b|\bWEB-?DL\b|\bWEB-?Rip\b|\bWEB\b|\bHDTV\b|\bPDTV\b|\b(?:HD)?CAM(?:Rip)?\b|\b(?:HD)?TS\b|\bTELESYNC\b";
const CODEC_PATTERN: &str = r"\b(?:x|h\s?)26[45]\b|\bHEVC\b|\bAVC\b|\bAV1\b|\bXviD\b";
const HDR_PATTERN: &str = r"\bDV\b|\bDoVi\b|\bDolby\s?Vision\b|\bHDR(?:10)?\b|\bHDR10(?:\+|Plus\b)";
const AUDIO_PATTERN: &str = r"\bTrueHD\b|\bDTS\b|\bDDP|\bDD\+|\bEAC3\b|\bAAC|\bFLAC\b|\bOPUS\b|\bAC3\b|\bATMOS\b";
const OTHER_PATTERN: &str = r"\bPROPER\b|\bREPACK\b|\bEXTENDED\b|\bREMASTERED\b|\bUNRATED\b|\bUNCUT\b|\bIMAX\b|\bHYBRID\b|\b3D\b|\b10[\s-]?bit\b|\bCOMPLETE\b|\bDirector'?s\s?Cut\b";
const LANGUAGE_PATTERN: &str =
    r"\b(?:FRENCH|TRUEFRENCH|VFF|GERMAN|ITALIAN|ITA|SPANISH|CASTELLANO|JAPANESE|JPN|RUSSIAN|RUS|KOREAN|KOR|PORTUGUESE|HINDI|MULTI|ENGLISH|ENG)\b";

/// Trailing `-TOKEN` fragments that belong to a quality tag rather than a group.
const NOT_A_GROUP: &[&str] = &["DL", "RIP", "HD", "MA", "RAY", "DV", "BR", "SUB", "SUBS", "AC"];

lazy_static! {
    static ref CONTAINER_REGEX: Regex =
        Regex::new(r"(?i)\.(mkv|mp4|avi)$").expect("valid container regex");
    static ref LEADING_GROUP_REGEX: Regex =
        Regex::new(r"^\[([^\]]+)\]\s*").expect("valid leading group regex");
    static ref TRAILING_BRACKET_REGEX: Regex =
        Regex::new(r"\s*\[[^\]]*\]\s*$").expect("valid trailing bracket regex");
    static ref TRAILING_GROUP_REGEX: Regex =
        Regex::new(r"-([A-Za-z0-9][A-Za-z0-9_]{1,30})$").expect("valid group regex");
    static ref YEAR_REGEX: Regex = Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("valid year regex");
    static ref HARD_STOP_REGEX: Regex =
        Regex::new(&format!(r"(?i){}|{}|\[", SE_PATTERN, RESOLUTION_PATTERN))
            .expect("valid hard stop regex");
    static ref SOFT_STOP_REGEX: Regex = Regex::new(&format!(
        r"(?i){}|{}|{}|{}|{}|(?-i:{})",
        SOURCE_PATTERN, CODEC_PATTERN, HDR_PATTERN, AUDIO_PATTERN, OTHER_PATTERN, LANGUAGE_PATTERN
    ))
    .expect("valid soft stop regex");

    static ref SXE_REGEX: Regex =
        Regex::new(r"(?i)\bS(\d{1,2})\s?E(\d{1,4})((?:-?E\d{1,4}|-\d{1,4})*)\b")
            .expect("valid season episode regex");
    static ref SXE_TAIL_REGEX: Regex =
        Regex::new(r"(?i)(-?)E?(\d{1,4})").expect("valid episode tail regex");
    static ref CROSS_REGEX: Regex =
        Regex::new(r"(?i)\b(\d{1,2})x(\d{2,3})\b").expect("valid NxNN regex");
    static ref SEASON_RANGE_REGEX: Regex =
        Regex::new(r"(?i)\bS(\d{1,2})(?:\s?-\s?S?(\d{1,2}))?\b").expect("valid season regex");
    static ref SEASON_WORD_REGEX: Regex =
        Regex::new(r"(?i)\bSeasons?\s?(\d{1,2})(?:\s?(?:-|to)\s?(\d{1,2}))?\b")
            .expect("valid season word regex");
    static ref ABSOLUTE_DASH_REGEX: Regex =
        Regex::new(r"\s-\s(\d{2,4})(?:v\d)?\b").expect("valid absolute dash regex");
    static ref ABSOLUTE_E_REGEX: Regex =
        Regex::new(r"(?i)\bE(?:p(?:isode)?\s?)?(\d{1,4})\b").expect("valid absolute episode regex");

    static ref RESOLUTION_REGEX: Regex =
        Regex::new(r"(?i)\b(2160|1080|720|576|480)[pi]\b").expect("valid resolution regex");
    static ref UHD_REGEX: Regex = Regex::new(r"(?i)\b(?:4K|UHD)\b").expect("valid uhd regex");

    static ref DV_REGEX: Regex =
        Regex::new(r"(?i)\b(?:DV|DoVi|Dolby\s?Vision)\b").expect("valid dv regex");
    static ref HDR10_PLUS_REGEX: Regex =
        Regex::new(r"(?i)\bHDR10(?:\+|Plus\b)").expect("valid hdr10+ regex");
    static ref HDR10_REGEX: Regex = Regex::new(r"(?i)\bHDR10\b").expect("valid hdr10 regex");
    static ref HDR_REGEX: Regex = Regex::new(r"(?i)\bHDR\b").expect("valid hdr regex");

    static ref SOURCE_TABLE: Vec<(Regex, ReleaseSource)> = vec![
        (r"\bUHD\s?Blu-?Ray\b", ReleaseSource::UhdBluRay),
        (r"\b(?:BD)?REMUX\b", ReleaseSource::Remux),
        (r"\bBDRip\b", ReleaseSource::BdRip),
        (r"\bBRRip\b", ReleaseSource::BrRip),
        (r"\bBlu-?Ray\b", ReleaseSource::BluRay),
        (r"\bDVDRip\b", ReleaseSource::DvdRip),
        (r"\bWEB-?Rip\b", ReleaseSource::WebRip),
        (r"\bWEB(?:-?DL)?\b", ReleaseSource::WebDl),
        (r"\b(?:HD|PD)TV\b", ReleaseSource::Hdtv),
        (r"\b(?:HD)?CAM(?:Rip)?\b", ReleaseSource::Cam),
        (r"\b(?:HD)?TS\b|\bTELESYNC\b", ReleaseSource::Telesync),
    ]
    .into_iter()
    .map(|(p, s)| (Regex::new(&format!("(?i){}", p)).expect("valid source regex"), s))
    .collect();

    static ref CODEC_TABLE: Vec<(Regex, &'static str)> = vec![
        (r"\b(?:x|h\s?)265\b|\bHEVC\b", "x265"),
        (r"\b(?:x|h\s?)264\b|\bAVC\b", "x264"),
        (r"\bAV1\b", "AV1"),
        (r"\bXviD\b", "XviD"),
    ]
    .into_iter()
    .map(|(p, c)| (Regex::new(&format!("(?i){}", p)).expect("valid codec regex"), c))
    .collect();

    static ref AUDIO_TABLE: Vec<(Regex, &'static str)> = vec![
        (r"\bTrueHD\b", "TrueHD"),
        (r"\bDTS[\s-]?HD(?:[\s-]?MA)?\b", "DTS-HD MA"),
        (r"\bDTS[\s-]?X\b", "DTS-X"),
        (r"\bDTS\b", "DTS"),
        (r"\b(?:DDP|EAC3)(?:\s?\d\.\d)?\b|\bDD\+|\bE-AC-3\b", "DDP"),
        (r"\b(?:DD|AC3)(?:\s?\d\.\d)?\b", "DD"),
        (r"\bAAC(?:\s?\d\.\d)?\b", "AAC"),
        (r"\bFLAC\b", "FLAC"),
        (r"\bOPUS\b", "Opus"),
    ]
    .into_iter()
    .map(|(p, a)| (Regex::new(&format!("(?i){}", p)).expect("valid audio regex"), a))
    .collect();

    // Uppercase only: "The French Dispatch" is a title, "FRENCH" is a dub.
    static ref LANGUAGE_TABLE: Vec<(Regex, &'static str, &'static str)> = vec![
        (r"\b(?:FRENCH|TRUEFRENCH|VFF)\b", "fr", "FRENCH"),
        (r"\bGERMAN\b", "de", "GERMAN"),
        (r"\b(?:ITALIAN|ITA)\b", "it", "ITALIAN"),
        (r"\b(?:SPANISH|CASTELLANO)\b", "es", "SPANISH"),
        (r"\b(?:JAPANESE|JPN)\b", "ja", "JAPANESE"),
        (r"\b(?:RUSSIAN|RUS)\b", "ru", "RUSSIAN"),
        (r"\b(?:KOREAN|KOR)\b", "ko", "KOREAN"),
        (r"\bPORTUGUESE\b", "pt", "PORTUGUESE"),
        (r"\bHINDI\b", "hi", "HINDI"),
        (r"\bMULTI\b", "multi", "MULTI"),
        (r"\b(?:ENGLISH|ENG)\b", "en", "ENGLISH"),
    ]
    .into_iter()
    .map(|(p, code, token)| (Regex::new(p).expect("valid language regex"), code, token))
    .collect();

    static ref OTHER_TABLE: Vec<(Regex, &'static str)> = vec![
        (r"\bPROPER\b", "PROPER"),
        (r"\bREPACK\b", "REPACK"),
        (r"\bEXTENDED\b", "EXTENDED"),
        (r"\bREMASTERED\b", "REMASTERED"),
        (r"\bUNRATED\b", "UNRATED"),
        (r"\bUNCUT\b", "UNCUT"),
        (r"\bIMAX\b", "IMAX"),
        (r"\bHYBRID\b", "HYBRID"),
        (r"\b3D\b", "3D"),
        (r"\b10[\s-]?bit\b", "10BIT"),
        (r"\bATMOS\b", "ATMOS"),
        (r"\bCOMPLETE\b", "COMPLETE"),
        (r"\bDirector'?s\s?Cut\b", "DIRECTORS CUT"),
    ]
    .into_iter()
    .map(|(p, o)| (Regex::new(&format!("(?i){}", p)).expect("valid tag regex"), o))
    .collect();
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse a release or file name. `size_gb` feeds resolution inference when the
/// name carries no resolution token.
pub fn parse_release_title(title: &str, size_gb: Option<f64>) -> Result<ParsedInfo, ParseError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let (body, container) = split_container(trimmed);
    let (body, leading_group) = split_leading_group(body);
    let spaced = spacify(body);
    let (spaced, trailing_group) = split_trailing_group(&spaced);

    let (parsed_title, year) = extract_title_and_year(&spaced);
    if parsed_title.is_empty() {
        return Err(ParseError::NoTitle(trimmed.to_string()));
    }

    let (seasons, episodes) = extract_numbering(&spaced, year);
    let resolution = detect_resolution(&spaced)
        .unwrap_or_else(|| infer_resolution(size_gb, &seasons, &episodes));

    Ok(ParsedInfo {
        original_title: title.to_string(),
        parsed_title,
        year,
        seasons,
        episodes,
        resolution,
        hdr: detect_hdr(&spaced),
        codec: first_match(&CODEC_TABLE, &spaced),
        audio: first_match(&AUDIO_TABLE, &spaced),
        group: leading_group.or(trailing_group),
        container,
        source: SOURCE_TABLE
            .iter()
            .find(|(re, _)| re.is_match(&spaced))
            .map(|(_, s)| *s),
        languages: LANGUAGE_TABLE
            .iter()
            .filter(|(re, _, _)| re.is_match(&spaced))
            .map(|(_, code, _)| code.to_string())
            .collect(),
        other: OTHER_TABLE
            .iter()
            .filter(|(re, _)| re.is_match(&spaced))
            .map(|(_, o)| o.to_string())
            .collect(),
        size_gb,
    })
}

/// Render parsed facts back into a release name that parses to the same facts.
pub fn canonical_title(info: &ParsedInfo) -> String {
    let mut parts: Vec<String> = vec![info.parsed_title.clone()];
    if let Some(year) = info.year {
        parts.push(year.to_string());
    }

    match (info.seasons.as_slice(), info.episodes.as_slice()) {
        ([], []) => {}
        ([], [first, ..]) => parts.push(format!("E{:02}", first)),
        ([season], episodes) if !episodes.is_empty() => {
            let mut tag = format!("S{:02}", season);
            for e in episodes {
                tag.push_str(&format!("E{:02}", e));
            }
            parts.push(tag);
        }
        (seasons, _) => {
            for s in seasons {
                parts.push(format!("S{:02}", s));
            }
        }
    }

    if info.resolution != Resolution::Unknown {
        parts.push(info.resolution.as_str().to_string());
    }
    if let Some(source) = info.source {
        parts.push(source.token().to_string());
    }
    if let Some(hdr) = info.hdr.token() {
        parts.push(hdr.to_string());
    }
    parts.extend(info.codec.iter().cloned());
    parts.extend(info.audio.iter().cloned());
    for code in &info.languages {
        if let Some((_, _, token)) = LANGUAGE_TABLE.iter().find(|(_, c, _)| c == code) {
            parts.push(token.to_string());
        }
    }
    parts.extend(info.other.iter().cloned());

    let mut out = parts.join(" ");
    if let Some(group) = &info.group {
        out.push('-');
        out.push_str(group);
    }
    if let Some(container) = &info.container {
        out.push('.');
        out.push_str(container);
    }
    out
}

/// Normalise a scraper-reported size (`"14.2 GB"`, `"700MB"`, raw bytes) to GB.
pub fn normalize_size_gb(raw: &str) -> Option<f64> {
    lazy_static! {
        static ref SIZE_REGEX: Regex =
            Regex::new(r"(?i)^\s*([\d.,]+)\s*(TiB|TB|GiB|GB|MiB|MB|KiB|KB|B|bytes)?\s*$")
                .expect("valid size regex");
    }

    let captures = SIZE_REGEX.captures(raw)?;
    let value: f64 = captures.get(1)?.as_str().replace(',', "").parse().ok()?;
    let gib = 1024.0_f64.powi(3);
    let gb = match captures.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(unit) if unit.starts_with('t') => value * 1024.0,
        Some(unit) if unit.starts_with('g') => value,
        Some(unit) if unit.starts_with('m') => value / 1024.0,
        Some(unit) if unit.starts_with('k') => value / (1024.0 * 1024.0),
        Some(_) => value / gib,
        // Unitless: large numbers are byte counts.
        None if value > 10_000.0 => value / gib,
        None => value,
    };
    Some(gb)
}

fn split_container(title: &str) -> (&str, Option<String>) {
    match CONTAINER_REGEX.captures(title) {
        Some(c) => {
            let ext = c.get(1).map(|m| m.as_str().to_ascii_lowercase());
            let start = c.get(0).map(|m| m.start()).unwrap_or(title.len());
            (&title[..start], ext)
        }
        None => (title, None),
    }
}

fn split_leading_group(title: &str) -> (&str, Option<String>) {
    match LEADING_GROUP_REGEX.captures(title) {
        Some(c) => {
            let end = c.get(0).map(|m| m.end()).unwrap_or(0);
            (&title[end..], c.get(1).map(|m| m.as_str().trim().to_string()))
        }
        None => (title, None),
    }
}

/// Dots and underscores become spaces, except the dot of a channel layout
/// such as `5.1` (a single digit on each side).
fn spacify(title: &str) -> String {
    let chars: Vec<char> = title.chars().collect();
    let digit_at = |i: usize| chars.get(i).map(|c| c.is_ascii_digit()).unwrap_or(false);
    let mut out = String::with_capacity(title.len());
    for (i, &c) in chars.iter().enumerate() {
        let keep_dot = c == '.'
            && i > 0
            && digit_at(i - 1)
            && digit_at(i + 1)
            && !(i > 1 && digit_at(i - 2))
            && !digit_at(i + 2);
        if (c == '.' && !keep_dot) || c == '_' {
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    normalize_whitespace(&out)
}

fn split_trailing_group(spaced: &str) -> (String, Option<String>) {
    let without_tag = TRAILING_BRACKET_REGEX.replace(spaced, "").to_string();
    let Some(c) = TRAILING_GROUP_REGEX.captures(&without_tag) else {
        return (spaced.to_string(), None);
    };
    let (Some(whole), Some(group)) = (c.get(0), c.get(1)) else {
        return (spaced.to_string(), None);
    };
    let group = group.as_str();
    let head = &without_tag[..whole.start()];
    let tagged = HARD_STOP_REGEX.is_match(head)
        || SOFT_STOP_REGEX.is_match(head)
        || YEAR_REGEX.find_iter(head).any(|m| m.start() > 0);
    if !tagged
        || group.chars().all(|c| c.is_ascii_digit())
        || NOT_A_GROUP.iter().any(|t| t.eq_ignore_ascii_case(group))
    {
        return (spaced.to_string(), None);
    }
    (head.trim_end().to_string(), Some(group.to_string()))
}

fn extract_title_and_year(spaced: &str) -> (String, Option<i32>) {
    let hard_stop = HARD_STOP_REGEX
        .find(spaced)
        .map(|m| m.start())
        .unwrap_or(spaced.len());
    let soft_stop = SOFT_STOP_REGEX
        .find(spaced)
        .map(|m| m.start())
        .unwrap_or(spaced.len());

    // The last year before the first hard tag ends the title, so
    // "Blade Runner 2049 2017" keeps 2049 in the title.
    let year_before_stop = YEAR_REGEX
        .find_iter(&spaced[..hard_stop])
        .filter(|m| m.start() > 0)
        .last();

    let (raw_title, year) = match year_before_stop {
        Some(m) => (&spaced[..m.start()], m.as_str().parse().ok()),
        None => {
            let year = YEAR_REGEX
                .find_iter(spaced)
                .find(|m| m.start() > 0)
                .and_then(|m| m.as_str().parse().ok());
            (&spaced[..hard_stop.min(soft_stop)], year)
        }
    };

    let cleaned = raw_title
        .trim_end_matches(|c: char| c.is_whitespace() || matches!(c, '-' | '(' | '['))
        .trim();
    (normalize_whitespace(cleaned), year)
}

fn extract_numbering(spaced: &str, year: Option<i32>) -> (Vec<u32>, Vec<u32>) {
    if let Some(c) = SXE_REGEX.captures(spaced) {
        let season = capture_u32(&c, 1);
        let first = capture_u32(&c, 2);
        if let (Some(season), Some(first)) = (season, first) {
            let mut episodes = vec![first];
            if let Some(tail) = c.get(3) {
                for piece in SXE_TAIL_REGEX.captures_iter(tail.as_str()) {
                    let Some(n) = capture_u32(&piece, 2) else {
                        continue;
                    };
                    let is_range = piece.get(1).map(|m| !m.as_str().is_empty()).unwrap_or(false);
                    let last = episodes.last().copied().unwrap_or(first);
                    if is_range && n > last && n - last <= 50 {
                        episodes.extend(last + 1..=n);
                    } else if !episodes.contains(&n) {
                        episodes.push(n);
                    }
                }
            }
            return (vec![season], episodes);
        }
    }

    if let Some(c) = CROSS_REGEX.captures(spaced) {
        if let (Some(s), Some(e)) = (capture_u32(&c, 1), capture_u32(&c, 2)) {
            return (vec![s], vec![e]);
        }
    }

    let mut seasons = Vec::new();
    for re in [&*SEASON_RANGE_REGEX, &*SEASON_WORD_REGEX] {
        for c in re.captures_iter(spaced) {
            let Some(start) = capture_u32(&c, 1) else {
                continue;
            };
            let end = capture_u32(&c, 2).filter(|e| *e >= start && *e - start <= 50);
            for s in start..=end.unwrap_or(start) {
                if !seasons.contains(&s) {
                    seasons.push(s);
                }
            }
        }
    }
    if !seasons.is_empty() {
        seasons.sort_unstable();
        return (seasons, Vec::new());
    }

    let absolute = ABSOLUTE_DASH_REGEX
        .captures(spaced)
        .and_then(|c| capture_u32(&c, 1))
        .filter(|n| year.map(|y| y as u32 != *n).unwrap_or(true))
        .or_else(|| {
            ABSOLUTE_E_REGEX
                .captures(spaced)
                .and_then(|c| capture_u32(&c, 1))
        });
    match absolute {
        Some(n) => (Vec::new(), vec![n]),
        None => (Vec::new(), Vec::new()),
    }
}

fn detect_resolution(spaced: &str) -> Option<Resolution> {
    if let Some(c) = RESOLUTION_REGEX.captures(spaced) {
        return match c.get(1).map(|m| m.as_str()) {
            Some("2160") => Some(Resolution::R2160p),
            Some("1080") => Some(Resolution::R1080p),
            Some("720") => Some(Resolution::R720p),
            _ => Some(Resolution::R480p),
        };
    }
    if UHD_REGEX.is_match(spaced) {
        return Some(Resolution::R2160p);
    }
    None
}

/// Rough per-file size thresholds; season packs are left unknown.
fn infer_resolution(size_gb: Option<f64>, seasons: &[u32], episodes: &[u32]) -> Resolution {
    let Some(size) = size_gb.filter(|s| *s > 0.0) else {
        return Resolution::Unknown;
    };
    if !seasons.is_empty() && episodes.is_empty() {
        return Resolution::Unknown;
    }
    let (uhd, fhd, hd) = if episodes.is_empty() {
        (20.0, 6.0, 2.5)
    } else {
        (5.0, 1.5, 0.6)
    };
    let per_file = size / episodes.len().max(1) as f64;
    if per_file >= uhd {
        Resolution::R2160p
    } else if per_file >= fhd {
        Resolution::R1080p
    } else if per_file >= hd {
        Resolution::R720p
    } else {
        Resolution::R480p
    }
}

fn detect_hdr(spaced: &str) -> HdrFormat {
    if DV_REGEX.is_match(spaced) {
        HdrFormat::DolbyVision
    } else if HDR10_PLUS_REGEX.is_match(spaced) {
        HdrFormat::Hdr10Plus
    } else if HDR10_REGEX.is_match(spaced) {
        HdrFormat::Hdr10
    } else if HDR_REGEX.is_match(spaced) {
        HdrFormat::Hdr
    } else {
        HdrFormat::None
    }
}

fn first_match(table: &[(Regex, &'static str)], spaced: &str) -> Option<String> {
    table
        .iter()
        .find(|(re, _)| re.is_match(spaced))
        .map(|(_, v)| v.to_string())
}

fn capture_u32(c: &regex::Captures<'_>, idx: usize) -> Option<u32> {
    c.get(idx).and_then(|m| m.as_str().parse().ok())
}

fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}
