use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Format selector used when the user never picked an entry from the catalog.
pub const DEFAULT_FORMAT_SELECTOR: &str = "best[height<=720]";

/// One row of the download utility's `--list-formats` table.
///
/// Rows are positional: the order follows the tool output and carries no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRecord {
    pub id: String,
    pub extension: String,
    /// Resolution column as reported (`1920x1080`, `audio`, ...).
    pub resolution: String,
    /// Size column as reported, `unknown` when the tool printed nothing usable.
    pub approximate_size: String,
    pub display_label: String,
}

impl FormatRecord {
    pub fn new(
        id: impl Into<String>,
        extension: impl Into<String>,
        resolution: impl Into<String>,
        approximate_size: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let extension = extension.into();
        let resolution = resolution.into();
        let approximate_size = approximate_size.into();
        let display_label = format!("{id} - {extension} - {resolution} - {approximate_size}");
        Self {
            id,
            extension,
            resolution,
            approximate_size,
            display_label,
        }
    }
}

/// Audio stream selectors offered next to high-resolution video formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioQuality {
    #[default]
    Best,
    High,
    Medium,
    Low,
}

impl AudioQuality {
    pub fn selector(self) -> &'static str {
        match self {
            AudioQuality::Best => "bestaudio",
            AudioQuality::High => "bestaudio[abr<=192]",
            AudioQuality::Medium => "bestaudio[abr<=128]",
            AudioQuality::Low => "bestaudio[abr<=64]",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AudioQuality::Best => "Best Audio",
            AudioQuality::High => "High Quality (192kbps)",
            AudioQuality::Medium => "Medium Quality (128kbps)",
            AudioQuality::Low => "Low Quality (64kbps)",
        }
    }
}

/// Everything needed for one download attempt. Built fresh per attempt and
/// never mutated once handed to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    /// Empty means "use the title reported by the source".
    pub custom_filename: String,
    pub destination_dir: PathBuf,
    pub format_id: String,
    pub audio_quality: String,
    pub fast_mode: bool,
    pub speed_boost: bool,
    pub force_overwrite: bool,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            custom_filename: String::new(),
            destination_dir: destination_dir.into(),
            format_id: DEFAULT_FORMAT_SELECTOR.to_string(),
            audio_quality: AudioQuality::Best.selector().to_string(),
            fast_mode: false,
            speed_boost: true,
            force_overwrite: false,
        }
    }
}

/// Which invocation shape the command builder emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadMode {
    /// The selected stream already carries audio.
    Combined,
    /// Video-only stream plus a separate audio stream, muxed by the tool.
    Merge,
}

impl DownloadMode {
    /// Label used in the running status line.
    pub fn status_label(self) -> &'static str {
        match self {
            DownloadMode::Combined => "Downloading",
            DownloadMode::Merge => "Downloading & merging",
        }
    }
}

/// Lifecycle of a single download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

/// Read-only view of the session for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: Option<Uuid>,
    pub state: SessionState,
    pub is_active: bool,
    pub last_percent: f64,
    pub last_url: Option<String>,
}

/// A media file found in the destination after a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocatedOutput {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Local>,
}

impl LocatedOutput {
    pub fn size_mib(&self) -> f64 {
        self.size_bytes as f64 / 1024.0 / 1024.0
    }
}

/// Final result of one download attempt, returned by the worker task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadOutcome {
    pub id: Uuid,
    pub state: SessionState,
    pub mode: Option<DownloadMode>,
    pub format_id: Option<String>,
    pub exit_code: Option<i32>,
    pub last_percent: f64,
    pub output: Option<LocatedOutput>,
}
