use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::command::build_list_formats_args;
use crate::formats::parse_format_catalog;
use crate::models::FormatRecord;

/// Where to find yt-dlp and how to call it.
#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    /// Path to the `yt-dlp` binary (or a bare name resolved through PATH).
    pub yt_dlp_path: PathBuf,

    /// Extra arguments placed right after the program in every call
    /// (wrapper scripts, proxies, ...). Empty by default.
    pub global_args: Vec<String>,

    /// Timeout for catalog calls (not for downloads).
    pub metadata_timeout: Duration,
}

impl YtDlpConfig {
    pub fn new(yt_dlp_path: PathBuf) -> Self {
        Self {
            yt_dlp_path,
            global_args: vec![],
            metadata_timeout: Duration::from_secs(30),
        }
    }
}

/// Low-level execution result.
#[derive(Debug, Clone, Default)]
pub struct YtDlpOutput {
    /// Raw stdout lines captured (bounded).
    pub stdout_lines: Vec<String>,
    /// Raw stderr lines captured (bounded).
    pub stderr_lines: Vec<String>,
    /// Exit code if available.
    pub exit_code: Option<i32>,
}

/// Error categories the front-end maps to remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YtDlpErrorKind {
    NotFound,
    Spawn,
    Io,
    Timeout,
    NonZeroExit,
}

#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct YtDlpError {
    pub kind: YtDlpErrorKind,
    pub message: String,
    pub output: Option<YtDlpOutput>,
}

impl YtDlpError {
    fn new(kind: YtDlpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            output: None,
        }
    }

    /// Last stderr line, the tool's own explanation of what went wrong.
    pub fn tool_message(&self) -> Option<&str> {
        self.output
            .as_ref()
            .and_then(|o| o.stderr_lines.iter().rev().find(|l| !l.trim().is_empty()))
            .map(|s| s.as_str())
    }
}

/// Runner for short, non-download calls (catalog listing).
#[derive(Debug, Clone)]
pub struct YtDlpRunner {
    cfg: YtDlpConfig,
}

impl YtDlpRunner {
    pub fn new(cfg: YtDlpConfig) -> Self {
        Self { cfg }
    }

    /// List the formats offered for `url` via `yt-dlp --list-formats`.
    ///
    /// Rows that do not parse are dropped; an empty list is not an error.
    pub async fn list_formats(
        &self,
        url: &str,
    ) -> Result<(Vec<FormatRecord>, YtDlpOutput), YtDlpError> {
        let args = build_list_formats_args(url);
        let output = self.exec_capture(&args, self.cfg.metadata_timeout).await?;
        let formats = parse_format_catalog(&output.stdout_lines.join("\n"));
        Ok((formats, output))
    }

    /// Execute yt-dlp and capture its output.
    ///
    /// - Captures bounded stdout/stderr for diagnostics.
    /// - Kills the process on timeout.
    /// - Fails on non-zero exit.
    async fn exec_capture(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> Result<YtDlpOutput, YtDlpError> {
        let program = &self.cfg.yt_dlp_path;
        if !program.exists() && which::which(program).is_err() {
            return Err(YtDlpError::new(
                YtDlpErrorKind::NotFound,
                format!("yt-dlp not found at {}", program.display()),
            ));
        }

        log::info!(
            "Running {} {} {}",
            program.display(),
            self.cfg.global_args.join(" "),
            args.join(" ")
        );

        let mut cmd = Command::new(program);
        cmd.args(&self.cfg.global_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|e| {
            YtDlpError::new(
                YtDlpErrorKind::Spawn,
                format!("failed to spawn yt-dlp {}: {e}", program.display()),
            )
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| YtDlpError::new(YtDlpErrorKind::Io, "failed to capture yt-dlp stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| YtDlpError::new(YtDlpErrorKind::Io, "failed to capture yt-dlp stderr"))?;

        // Split on raw bytes so a stray non-UTF-8 byte does not end the read.
        let mut stdout_reader = BufReader::new(stdout).split(b'\n');
        let mut stderr_reader = BufReader::new(stderr).split(b'\n');

        // Bound log capture to avoid unbounded memory use.
        const MAX_LINES: usize = 20_000;

        let mut output = YtDlpOutput::default();

        let read_task = async {
            let mut stdout_open = true;
            let mut stderr_open = true;
            while stdout_open || stderr_open {
                tokio::select! {
                    line = stdout_reader.next_segment(), if stdout_open => {
                        match line {
                            Ok(Some(bytes)) => {
                                let l = decode_line(&bytes);
                                if output.stdout_lines.len() < MAX_LINES {
                                    output.stdout_lines.push(l);
                                }
                            }
                            Ok(None) => stdout_open = false,
                            Err(e) => return Err(format!("error reading yt-dlp stdout: {e}")),
                        }
                    }
                    line = stderr_reader.next_segment(), if stderr_open => {
                        match line {
                            Ok(Some(bytes)) => {
                                let l = decode_line(&bytes);
                                log::debug!("yt-dlp stderr: {}", l);
                                if output.stderr_lines.len() < MAX_LINES {
                                    output.stderr_lines.push(l);
                                }
                            }
                            Ok(None) => stderr_open = false,
                            Err(e) => return Err(format!("error reading yt-dlp stderr: {e}")),
                        }
                    }
                }
            }
            Ok(())
        };

        let read_result = tokio::time::timeout(timeout, read_task).await;
        match read_result {
            Err(_) => {
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill timed out yt-dlp: {}", e);
                }
                return Err(YtDlpError {
                    kind: YtDlpErrorKind::Timeout,
                    message: format!("yt-dlp timed out after {:?}", timeout),
                    output: Some(output),
                });
            }
            Ok(Err(message)) => {
                return Err(YtDlpError {
                    kind: YtDlpErrorKind::Io,
                    message,
                    output: Some(output),
                });
            }
            Ok(Ok(())) => {}
        }

        let status = child.wait().await.map_err(|e| YtDlpError {
            kind: YtDlpErrorKind::Io,
            message: format!("failed to wait for yt-dlp: {e}"),
            output: None,
        })?;
        output.exit_code = status.code();

        if !status.success() {
            return Err(YtDlpError {
                kind: YtDlpErrorKind::NonZeroExit,
                message: format!(
                    "yt-dlp exited with status {:?}. See logs for details.",
                    output.exit_code
                ),
                output: Some(output),
            });
        }

        Ok(output)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string()
}
