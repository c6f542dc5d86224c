//! Settings
//!
//! Read-only application configuration. Values come from a JSON file
//! (`--config`, or `config.json` in the per-user config directory) with
//! every field optional; nothing is ever written back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::formats::FormatRules;
use crate::models::{AudioQuality, DownloadRequest, DEFAULT_FORMAT_SELECTOR};
use crate::output_locator::RECENCY_WINDOW;
use crate::tool_manager::ToolManagerConfig;

const CONFIG_FILE_NAME: &str = "config.json";

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default destination directory.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Format selector used when none is chosen.
    #[serde(default = "default_format")]
    pub default_format: String,

    /// Audio selector paired with video-only streams.
    #[serde(default = "default_audio_quality")]
    pub audio_quality: String,

    /// Parallel fragments, retries, zero sleeps.
    #[serde(default = "default_true")]
    pub speed_boost: bool,

    /// Prefer lower resolutions when the catalog offers them.
    #[serde(default)]
    pub fast_mode: bool,

    /// Pass `--force-overwrites`.
    #[serde(default)]
    pub force_overwrite: bool,

    /// Explicit yt-dlp binary.
    #[serde(default)]
    pub yt_dlp_path: Option<PathBuf>,

    /// Explicit ffmpeg binary.
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Timeout for the `--list-formats` call.
    #[serde(default = "default_catalog_timeout_secs")]
    pub catalog_timeout_secs: u64,

    /// Timeout for `--version` probes.
    #[serde(default = "default_version_timeout_secs")]
    pub version_timeout_secs: u64,

    /// How recent a media file must be to count as this run's output.
    #[serde(default = "default_recency_window_secs")]
    pub recency_window_secs: u64,

    /// Hosts accepted as download sources (subdomains included). Empty
    /// accepts any http(s) URL.
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,

    /// Provider format ids used by the classifier.
    #[serde(default)]
    pub format_rules: FormatRules,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            default_format: default_format(),
            audio_quality: default_audio_quality(),
            speed_boost: true,
            fast_mode: false,
            force_overwrite: false,
            yt_dlp_path: None,
            ffmpeg_path: None,
            catalog_timeout_secs: default_catalog_timeout_secs(),
            version_timeout_secs: default_version_timeout_secs(),
            recency_window_secs: default_recency_window_secs(),
            allowed_hosts: default_allowed_hosts(),
            format_rules: FormatRules::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, the per-user config file is
    /// used if present, otherwise defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        match default_config_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => {
                log::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_json(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse config JSON")
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_secs(self.catalog_timeout_secs)
    }

    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.recency_window_secs)
    }

    pub fn tool_manager_config(&self) -> ToolManagerConfig {
        ToolManagerConfig {
            yt_dlp_path: self.yt_dlp_path.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
            version_timeout: Duration::from_secs(self.version_timeout_secs),
            ..ToolManagerConfig::default()
        }
    }

    /// A request pre-filled with the configured defaults.
    pub fn request_for(&self, url: impl Into<String>) -> DownloadRequest {
        DownloadRequest {
            url: url.into(),
            custom_filename: String::new(),
            destination_dir: self.download_dir.clone(),
            format_id: self.default_format.clone(),
            audio_quality: self.audio_quality.clone(),
            fast_mode: self.fast_mode,
            speed_boost: self.speed_boost,
            force_overwrite: self.force_overwrite,
        }
    }
}

/// `<config dir>/tubegrab/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "tubegrab").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

fn default_download_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .or_else(dirs::download_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_format() -> String {
    DEFAULT_FORMAT_SELECTOR.to_string()
}

fn default_audio_quality() -> String {
    AudioQuality::Best.selector().to_string()
}

fn default_catalog_timeout_secs() -> u64 {
    30
}

fn default_version_timeout_secs() -> u64 {
    5
}

fn default_recency_window_secs() -> u64 {
    RECENCY_WINDOW.as_secs()
}

fn default_allowed_hosts() -> Vec<String> {
    vec!["youtube.com".to_string(), "youtu.be".to_string()]
}

fn default_true() -> bool {
    true
}
