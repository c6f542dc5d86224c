//! Tool Manager
//!
//! Discovery and version probes for the external download utility (yt-dlp)
//! and the merge utility (ffmpeg). A missing tool is a warning, never a
//! hard stop: later downloads simply fail when the tool is invoked.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::events::Presenter;

/// External tools this front-end drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    YtDlp,
    Ffmpeg,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::YtDlp => "yt-dlp",
            Tool::Ffmpeg => "ffmpeg",
        }
    }

    pub fn binary_name(&self) -> &'static str {
        #[cfg(target_os = "windows")]
        {
            match self {
                Tool::YtDlp => "yt-dlp.exe",
                Tool::Ffmpeg => "ffmpeg.exe",
            }
        }
        #[cfg(not(target_os = "windows"))]
        {
            match self {
                Tool::YtDlp => "yt-dlp",
                Tool::Ffmpeg => "ffmpeg",
            }
        }
    }

    pub fn version_args(&self) -> &[&str] {
        match self {
            Tool::YtDlp => &["--version"],
            Tool::Ffmpeg => &["-version"],
        }
    }

    /// Installation guidance shown when the tool is unavailable.
    pub fn install_help(&self) -> &'static str {
        match self {
            Tool::YtDlp => {
                "yt-dlp not found. To install:\n\
                 1. Install Python from https://python.org\n\
                 2. Run: pip install yt-dlp\n\
                 3. Restart this application"
            }
            Tool::Ffmpeg => {
                "ffmpeg not found. It is needed to merge separate video and audio streams.\n\
                 1. Download ffmpeg from https://ffmpeg.org/download.html\n\
                 2. Put the ffmpeg binary on your PATH (or set ffmpeg_path in the config)\n\
                 3. Restart this application\n\
                 Package managers: choco install ffmpeg / brew install ffmpeg / apt install ffmpeg"
            }
        }
    }
}

/// Health status for a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Missing,
    Broken,
}

/// Information about an installed tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub tool: Tool,
    pub path: PathBuf,
    pub version: Option<String>,
    pub status: ToolStatus,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Combined toolchain status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainStatus {
    pub yt_dlp: ToolInfo,
    pub ffmpeg: ToolInfo,
}

impl ToolchainStatus {
    /// Human readable warnings for every tool that is not usable.
    pub fn warnings(&self) -> Vec<String> {
        [&self.yt_dlp, &self.ffmpeg]
            .into_iter()
            .filter(|info| info.status != ToolStatus::Ok)
            .map(|info| {
                let what = match info.tool {
                    Tool::YtDlp => "downloads will fail until it is installed",
                    Tool::Ffmpeg => "audio merging may not work",
                };
                let state = match info.status {
                    ToolStatus::Broken => "is not responding",
                    _ => "was not found",
                };
                format!(
                    "{} {} - {}.\n{}",
                    info.tool.as_str(),
                    state,
                    what,
                    info.tool.install_help()
                )
            })
            .collect()
    }
}

/// Tool Manager configuration.
#[derive(Debug, Clone)]
pub struct ToolManagerConfig {
    /// Explicit yt-dlp binary, bypassing discovery.
    pub yt_dlp_path: Option<PathBuf>,
    /// Explicit ffmpeg binary, bypassing discovery.
    pub ffmpeg_path: Option<PathBuf>,
    /// Directory checked for binaries shipped next to the executable.
    pub bundled_dir: Option<PathBuf>,
    /// How long to wait for version checks.
    pub version_timeout: Duration,
}

impl Default for ToolManagerConfig {
    fn default() -> Self {
        Self {
            yt_dlp_path: None,
            ffmpeg_path: None,
            bundled_dir: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|p| p.to_path_buf())),
            version_timeout: Duration::from_secs(5),
        }
    }
}

/// Tool Manager handles tool discovery and validation.
#[derive(Debug, Clone)]
pub struct ToolManager {
    config: ToolManagerConfig,
}

impl ToolManager {
    pub fn new(config: ToolManagerConfig) -> Self {
        Self { config }
    }

    fn configured_path(&self, tool: Tool) -> Option<&PathBuf> {
        match tool {
            Tool::YtDlp => self.config.yt_dlp_path.as_ref(),
            Tool::Ffmpeg => self.config.ffmpeg_path.as_ref(),
        }
    }

    /// Locate a tool binary without running it.
    ///
    /// Priority:
    /// 1. Path from configuration
    /// 2. Binary next to the executable
    /// 3. System PATH
    pub fn locate(&self, tool: Tool) -> Option<PathBuf> {
        if let Some(path) = self.configured_path(tool) {
            if path.exists() {
                return Some(path.clone());
            }
            if let Ok(found) = which::which(path) {
                return Some(found);
            }
            log::warn!(
                "Configured {} path {} does not exist",
                tool.as_str(),
                path.display()
            );
        }

        if let Some(ref bundled_dir) = self.config.bundled_dir {
            let bundled_path = bundled_dir.join(tool.binary_name());
            if bundled_path.is_file() {
                log::info!("Found bundled {} at {:?}", tool.as_str(), bundled_path);
                return Some(bundled_path);
            }
        }

        which::which(tool.binary_name()).ok()
    }

    /// Path to launch for `tool`. Falls back to the bare binary name so the
    /// OS lookup produces the spawn error if nothing was found.
    pub fn program(&self, tool: Tool) -> PathBuf {
        self.locate(tool).unwrap_or_else(|| {
            log::warn!(
                "Could not find {}, falling back to PATH lookup",
                tool.as_str()
            );
            PathBuf::from(tool.binary_name())
        })
    }

    /// Get detailed info about a specific tool.
    pub async fn get_tool_info(&self, tool: Tool) -> ToolInfo {
        let Some(path) = self.locate(tool) else {
            log::warn!("{} not found", tool.as_str());
            return ToolInfo {
                tool,
                path: PathBuf::new(),
                version: None,
                status: ToolStatus::Missing,
                last_checked: Some(Utc::now()),
            };
        };

        match self.get_version(&path, tool).await {
            Ok(version) => {
                log::info!("{} version: {}", tool.as_str(), version);
                ToolInfo {
                    tool,
                    path,
                    version: Some(version),
                    status: ToolStatus::Ok,
                    last_checked: Some(Utc::now()),
                }
            }
            Err(e) => {
                log::warn!("{} at {} is unhealthy: {:#}", tool.as_str(), path.display(), e);
                ToolInfo {
                    tool,
                    path,
                    version: None,
                    status: ToolStatus::Broken,
                    last_checked: Some(Utc::now()),
                }
            }
        }
    }

    /// Probe both tools.
    pub async fn probe(&self) -> ToolchainStatus {
        let (yt_dlp, ffmpeg) = tokio::join!(
            self.get_tool_info(Tool::YtDlp),
            self.get_tool_info(Tool::Ffmpeg)
        );
        ToolchainStatus { yt_dlp, ffmpeg }
    }

    /// Get the version string from a tool.
    pub async fn get_version(&self, path: &Path, tool: Tool) -> Result<String> {
        let mut cmd = Command::new(path);
        cmd.args(tool.version_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let output = tokio::time::timeout(self.config.version_timeout, cmd.output())
            .await
            .context("Version check timed out")?
            .context("Failed to execute tool")?;

        if !output.status.success() {
            return Err(anyhow!(
                "Tool returned non-zero exit code: {}",
                output.status
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_version(&stdout, tool).ok_or_else(|| anyhow!("Could not parse version from output"))
    }
}

/// Surface the probe result through the presenter: versions as log lines,
/// problems as warnings.
pub fn report_toolchain(status: &ToolchainStatus, presenter: &dyn Presenter) {
    for info in [&status.yt_dlp, &status.ffmpeg] {
        if let Some(ref version) = info.version {
            presenter.report_log(&format!("{} version: {}", info.tool.as_str(), version));
        }
    }
    if status.ffmpeg.status == ToolStatus::Ok {
        presenter.report_log("ffmpeg found - audio merging will work properly");
    }
    for warning in status.warnings() {
        presenter.report_warning(&warning);
    }
}

/// Parse version string from tool output.
fn parse_version(output: &str, tool: Tool) -> Option<String> {
    let first_line = output.lines().next()?.trim();
    if first_line.is_empty() {
        return None;
    }

    match tool {
        // yt-dlp prints just the version, e.g. "2024.01.01"
        Tool::YtDlp => Some(first_line.to_string()),
        // "ffmpeg version 6.1.1 Copyright (c) ..."
        Tool::Ffmpeg => {
            let parts: Vec<&str> = first_line.split_whitespace().collect();
            if parts.len() >= 3 && parts[0] == "ffmpeg" && parts[1] == "version" {
                Some(parts[2].to_string())
            } else {
                Some(first_line.to_string())
            }
        }
    }
}
