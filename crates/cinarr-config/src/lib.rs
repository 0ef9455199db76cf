// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use cinarr_domain::Resolution;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://cinarr.db".to_string(),
            pool_max_size: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Emit JSON lines instead of the human readable formatter.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// `HH:MM` start of the daily pause window, local to `timezone`.
    pub pause_start_time: Option<String>,
    pub pause_end_time: Option<String>,
    /// IANA timezone used for the pause window and movie release offsets.
    pub timezone: String,
    pub movie_airtime_offset_hours: f64,
    pub episode_airtime_offset_hours: f64,
    pub main_loop_sleep_seconds: f64,
    pub checking_grace_minutes: u64,
    pub blacklist_final_scrape_delay_hours: u64,
    pub sleeping_backoff_minutes: u64,
    pub sleeping_backoff_cap_minutes: u64,
    pub max_sleep_wakes: u32,
    pub movie_blacklist_days: i64,
    pub episode_blacklist_days: i64,
    pub connectivity_fail_safe_minutes: u64,
    pub rate_limit_pause_minutes: u64,
    /// Hours after collection during which an item is still considered for upgrades.
    pub upgrade_window_hours: u64,
    /// Minimum score gain before an upgrade replaces the collected release.
    pub upgrade_score_margin: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pause_start_time: None,
            pause_end_time: None,
            timezone: "UTC".to_string(),
            movie_airtime_offset_hours: 19.0,
            episode_airtime_offset_hours: 0.0,
            main_loop_sleep_seconds: 0.0,
            checking_grace_minutes: 120,
            blacklist_final_scrape_delay_hours: 24,
            sleeping_backoff_minutes: 30,
            sleeping_backoff_cap_minutes: 24 * 60,
            max_sleep_wakes: 24,
            movie_blacklist_days: 30,
            episode_blacklist_days: 7,
            connectivity_fail_safe_minutes: 3,
            rate_limit_pause_minutes: 30,
            upgrade_window_hours: 24 * 7,
            upgrade_score_margin: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub cpu_threshold_percent: f32,
    pub ram_threshold_percent: f32,
    pub load_sleep_step_seconds: f64,
    pub load_sleep_cap_seconds: f64,
    pub idle_multiplier_max: u32,
    pub memory_sampling: bool,
    pub memory_sample_every: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: 90.0,
            ram_threshold_percent: 90.0,
            load_sleep_step_seconds: 0.5,
            load_sleep_cap_seconds: 10.0,
            idle_multiplier_max: 4,
            memory_sampling: false,
            memory_sample_every: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionWanted {
    #[serde(rename = "<=")]
    AtMost,
    #[serde(rename = ">=")]
    AtLeast,
    #[serde(rename = "==")]
    Exactly,
}

/// `(regex, weight)` pair used by the filter and preference lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedPattern(pub String, pub i32);

/// Quality profile applied to an item's version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionSettings {
    pub enable_hdr: bool,
    pub max_resolution: Resolution,
    pub resolution_wanted: ResolutionWanted,
    pub min_size_gb: f64,
    pub max_size_gb: Option<f64>,
    pub min_bitrate_mbps: f64,
    pub max_bitrate_mbps: Option<f64>,
    pub require_physical_release: bool,
    pub filter_in: Vec<WeightedPattern>,
    pub filter_out: Vec<WeightedPattern>,
    pub preferred_filter_in: Vec<WeightedPattern>,
    pub preferred_filter_out: Vec<WeightedPattern>,
    /// Comma separated language codes, e.g. `"en,fr"`.
    pub language_code: String,
    pub enable_upgrading: bool,
    /// Version inserted as Wanted when this version is blacklisted.
    pub fallback_version: Option<String>,
}

impl Default for VersionSettings {
    fn default() -> Self {
        Self {
            enable_hdr: false,
            max_resolution: Resolution::R1080p,
            resolution_wanted: ResolutionWanted::AtMost,
            min_size_gb: 0.01,
            max_size_gb: None,
            min_bitrate_mbps: 0.01,
            max_bitrate_mbps: None,
            require_physical_release: false,
            filter_in: Vec::new(),
            filter_out: Vec::new(),
            preferred_filter_in: Vec::new(),
            preferred_filter_out: Vec::new(),
            language_code: "en".to_string(),
            enable_upgrading: false,
            fallback_version: None,
        }
    }
}

impl VersionSettings {
    /// Language codes in configured order, lowercased, without blanks.
    pub fn language_codes(&self) -> Vec<String> {
        self.language_code
            .split(',')
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UltimateSortOrder {
    SizeDesc,
    SizeAsc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingConfig {
    pub versions: BTreeMap<String, VersionSettings>,
    pub ultimate_sort_order: UltimateSortOrder,
    pub scraper_timeout_seconds: u64,
    /// Tie-break weight per scraper backend id.
    pub source_trust: BTreeMap<String, f64>,
    pub bitrate_sweet_spot_movie_mbps: f64,
    pub bitrate_sweet_spot_episode_mbps: f64,
    /// JSON search endpoints keyed by backend id.
    #[serde(default)]
    pub backends: BTreeMap<String, ScraperBackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperBackendConfig {
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        let mut versions = BTreeMap::new();
        versions.insert("1080p".to_string(), VersionSettings::default());
        Self {
            versions,
            ultimate_sort_order: UltimateSortOrder::SizeDesc,
            scraper_timeout_seconds: 30,
            source_trust: BTreeMap::new(),
            bitrate_sweet_spot_movie_mbps: 20.0,
            bitrate_sweet_spot_episode_mbps: 10.0,
            backends: BTreeMap::new(),
        }
    }
}

impl ScrapingConfig {
    /// Settings for a raw version identifier; the trailing `*` is ignored for lookup.
    pub fn version(&self, raw: &str) -> Option<&VersionSettings> {
        self.versions.get(cinarr_domain::strip_version(raw))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebridConfig {
    pub provider: String,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Endpoint polled by the connectivity probe.
    pub probe_url: Option<String>,
}

impl Default for DebridConfig {
    fn default() -> Self {
        Self {
            provider: "real_debrid".to_string(),
            base_url: "https://api.real-debrid.com/rest/1.0".to_string(),
            api_key: None,
            probe_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileManagementMode {
    MediaServer,
    Symlink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManagementConfig {
    pub mode: FileManagementMode,
    /// Mount point of the debrid library.
    pub original_files_path: PathBuf,
    pub symlinked_files_path: Option<PathBuf>,
    pub library_checks_disabled: bool,
    pub plex_url: Option<String>,
    pub plex_token: Option<String>,
    pub removal_min_age_hours: u64,
    pub removal_max_attempts: u32,
}

impl Default for FileManagementConfig {
    fn default() -> Self {
        Self {
            mode: FileManagementMode::MediaServer,
            original_files_path: PathBuf::from("/mnt/debrid"),
            symlinked_files_path: None,
            library_checks_disabled: false,
            plex_url: None,
            plex_token: None,
            removal_min_age_hours: 6,
            removal_max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSourceKind {
    ListUrl,
    StaticList,
    Overseerr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceMediaFilter {
    All,
    Movies,
    Shows,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSourceConfig {
    pub kind: ContentSourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Version names inserted for every wanted item of this source.
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default = "default_media_filter")]
    pub media_type: SourceMediaFilter,
    /// `YYYY-MM-DD` or a number of days ago.
    #[serde(default)]
    pub cutoff_date: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Ids served by a static list source.
    #[serde(default)]
    pub movies: Vec<String>,
    #[serde(default)]
    pub shows: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_media_filter() -> SourceMediaFilter {
    SourceMediaFilter::All
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    pub sort_by_uncached_status: bool,
    pub disable_not_wanted_check: bool,
    pub enable_upgrading: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub telemetry: TelemetryConfig,
    pub paths: PathsConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub scraping: ScrapingConfig,
    pub debrid: DebridConfig,
    pub file_management: FileManagementConfig,
    #[serde(default)]
    pub content_sources: BTreeMap<String, ContentSourceConfig>,
    pub debug: DebugConfig,
}

impl AppConfig {
    /// Reject settings that would leave the pipeline unable to make decisions.
    pub fn check(&self) -> Result<()> {
        for (name, version) in &self.scraping.versions {
            if name.ends_with('*') {
                bail!("version name '{}' must not carry the soft marker", name);
            }
            if let Some(max) = version.max_size_gb {
                if max < version.min_size_gb {
                    bail!("version '{}' has max_size_gb below min_size_gb", name);
                }
            }
            if let Some(fallback) = &version.fallback_version {
                if !self.scraping.versions.contains_key(fallback.as_str()) {
                    warn!(target: "config", version = %name, fallback = %fallback, "fallback version is not configured");
                }
            }
        }
        for (id, backend) in &self.scraping.backends {
            if backend.url.trim().is_empty() {
                bail!("scraper backend '{}' needs a url", id);
            }
        }
        for (id, source) in &self.content_sources {
            if source.kind == ContentSourceKind::ListUrl && source.url.is_none() {
                bail!("content source '{}' needs a url", id);
            }
        }
        Ok(())
    }
}

/// Load configuration from defaults, optional TOML file, and environment overrides (prefix: CINARR_).
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("CINARR_").split("__"));

    let config: AppConfig = figment.extract()?;
    config.check()?;
    info!(
        target: "config",
        versions = config.scraping.versions.len(),
        content_sources = config.content_sources.len(),
        "configuration loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_usable() {
        let config = AppConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.queue.checking_grace_minutes, 120);
        assert_eq!(config.queue.connectivity_fail_safe_minutes, 3);
        assert_eq!(config.file_management.removal_min_age_hours, 6);
        assert_eq!(config.scheduler.idle_multiplier_max, 4);
        assert!(config.scraping.versions.contains_key("1080p"));
    }

    #[test]
    fn version_lookup_ignores_soft_marker() {
        let config = AppConfig::default();
        assert!(config.scraping.version("1080p*").is_some());
        assert!(config.scraping.version("720p").is_none());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[queue]
timezone = "Europe/Paris"
checking_grace_minutes = 60

[scraping.versions."2160p"]
enable_hdr = true
max_resolution = "2160p"
resolution_wanted = ">="
filter_out = [["(?i)\\bCAM\\b", 1]]

[content_sources.mylist]
kind = "list_url"
url = "http://localhost/list.json"
versions = ["2160p"]
media_type = "Movies"
"#
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.queue.timezone, "Europe/Paris");
        assert_eq!(config.queue.checking_grace_minutes, 60);

        let uhd = config.scraping.version("2160p").unwrap();
        assert!(uhd.enable_hdr);
        assert_eq!(uhd.max_resolution, Resolution::R2160p);
        assert_eq!(uhd.resolution_wanted, ResolutionWanted::AtLeast);
        assert_eq!(uhd.filter_out[0].1, 1);
        // untouched fields keep their defaults
        assert_eq!(uhd.min_size_gb, 0.01);

        let source = &config.content_sources["mylist"];
        assert!(source.enabled);
        assert_eq!(source.media_type, SourceMediaFilter::Movies);
    }

    #[test]
    fn list_source_without_url_is_rejected() {
        let mut config = AppConfig::default();
        config.content_sources.insert(
            "broken".into(),
            ContentSourceConfig {
                kind: ContentSourceKind::ListUrl,
                enabled: true,
                versions: vec!["1080p".into()],
                media_type: SourceMediaFilter::All,
                cutoff_date: None,
                url: None,
                display_name: None,
                movies: Vec::new(),
                shows: Vec::new(),
            },
        );
        assert!(config.check().is_err());
    }

    #[test]
    fn language_codes_are_split() {
        let settings = VersionSettings {
            language_code: "en, FR,,ja".into(),
            ..VersionSettings::default()
        };
        assert_eq!(settings.language_codes(), vec!["en", "fr", "ja"]);
    }
}
