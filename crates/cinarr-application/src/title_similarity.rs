// SPDX-License-Identifier: GPL-3.0-or-later
//! Fuzzy comparison between a wanted title and the title parsed out of a
//! release name.

use strsim::{jaro_winkler, normalized_levenshtein};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const REGULAR_THRESHOLD: f64 = 0.80;
/// Anime releases mix romaji, English and fansub spellings.
pub const ANIME_THRESHOLD: f64 = 0.70;

pub fn threshold(anime: bool) -> f64 {
    if anime {
        ANIME_THRESHOLD
    } else {
        REGULAR_THRESHOLD
    }
}

/// Lowercase ASCII-ish form: kana romanised, accents stripped, punctuation
/// collapsed to single spaces, `&` spelled out.
pub fn normalize_title(title: &str) -> String {
    let romanised = kana_to_romaji(title);
    let folded: String = romanised
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .replace('&', " and ");
    let cleaned: String = folded
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Balanced Jaro-Winkler / Levenshtein score over normalised titles.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize_title(a);
    let b = normalize_title(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    0.5 * jaro_winkler(&a, &b) + 0.5 * normalized_levenshtein(&a, &b)
}

/// Best `(index, score)` among `references` at or above the threshold.
pub fn best_match(candidate: &str, references: &[String], anime: bool) -> Option<(usize, f64)> {
    let limit = threshold(anime);
    references
        .iter()
        .enumerate()
        .map(|(i, r)| (i, similarity(candidate, r)))
        .filter(|(_, score)| *score >= limit)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

// ============================================================================
// Kana
// ============================================================================

/// Hepburn romanisation of hiragana U+3041..=U+3094, in code point order.
const HIRAGANA: [&str; 84] = [
    "a", "a", "i", "i", "u", "u", "e", "e", "o", "o", // ぁあぃいぅうぇえぉお
    "ka", "ga", "ki", "gi", "ku", "gu", "ke", "ge", "ko", "go", // か..ご
    "sa", "za", "shi", "ji", "su", "zu", "se", "ze", "so", "zo", // さ..ぞ
    "ta", "da", "chi", "ji", "", "tsu", "zu", "te", "de", "to", "do", // た..ど (っ handled apart)
    "na", "ni", "nu", "ne", "no", // な..の
    "ha", "ba", "pa", "hi", "bi", "pi", "fu", "bu", "pu", "he", "be", "pe", "ho", "bo", "po",
    "ma", "mi", "mu", "me", "mo", // ま..も
    "ya", "ya", "yu", "yu", "yo", "yo", // ゃやゅゆょよ
    "ra", "ri", "ru", "re", "ro", // ら..ろ
    "wa", "wa", "wi", "we", "wo", "n", "vu", // ゎわゐゑをんゔ
];

const SMALL_TSU: char = '\u{3063}';
const SMALL_YA: char = '\u{3083}';
const SMALL_YU: char = '\u{3085}';
const SMALL_YO: char = '\u{3087}';

fn to_hiragana(c: char) -> char {
    match c {
        '\u{30A1}'..='\u{30F4}' => char::from_u32(c as u32 - 0x60).unwrap_or(c),
        _ => c,
    }
}

fn hiragana_romaji(c: char) -> Option<&'static str> {
    match c {
        '\u{3041}'..='\u{3094}' => HIRAGANA.get((c as u32 - 0x3041) as usize).copied(),
        _ => None,
    }
}

/// Romanise hiragana and katakana, leaving every other character untouched.
pub fn kana_to_romaji(input: &str) -> String {
    let chars: Vec<char> = input.chars().map(to_hiragana).collect();
    let mut out = String::with_capacity(input.len());
    let mut double_next = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == SMALL_TSU {
            double_next = true;
            i += 1;
            continue;
        }
        // Long vowel mark.
        if c == '\u{30FC}' {
            i += 1;
            continue;
        }
        let Some(mut syllable) = hiragana_romaji(c).map(str::to_string) else {
            out.push(c);
            double_next = false;
            i += 1;
            continue;
        };
        if let Some(&next) = chars.get(i + 1) {
            let glide = match next {
                SMALL_YA => Some("a"),
                SMALL_YU => Some("u"),
                SMALL_YO => Some("o"),
                _ => None,
            };
            if let Some(vowel) = glide {
                if syllable.ends_with('i') && syllable.len() > 1 {
                    syllable.pop();
                    if !matches!(syllable.as_str(), "sh" | "ch" | "j") {
                        syllable.push('y');
                    }
                    syllable.push_str(vowel);
                    i += 1;
                }
            }
        }
        if double_next {
            if let Some(first) = syllable.chars().next() {
                out.push(if syllable.starts_with("ch") { 't' } else { first });
            }
            double_next = false;
        }
        out.push_str(&syllable);
        i += 1;
    }
    out
}
