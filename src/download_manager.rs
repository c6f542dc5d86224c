//! Download Manager
//!
//! Owns the single download session: validates requests, classifies the
//! chosen format, spawns yt-dlp on a worker task and streams its output to
//! the presenter. At most one session is active at a time.

use std::collections::VecDeque;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use regex::Regex;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::command::{build_download_args, display_command};
use crate::events::{action, Action, ActionKind, ErrorCode, Presenter};
use crate::formats::FormatRules;
use crate::models::{
    DownloadMode, DownloadOutcome, DownloadRequest, FormatRecord, SessionSnapshot, SessionState,
};
use crate::output_locator::{locate_recent_output, RECENCY_WINDOW};
use crate::settings::AppConfig;
use crate::url_utils::validate_download_url;
use crate::ytdlp::{YtDlpConfig, YtDlpError, YtDlpRunner};

/// Shown when the tool exits non-zero; details live in the log.
pub const FAILURE_MESSAGE: &str = "Download failed! Check log for details.";
pub const SHUTDOWN_QUESTION: &str = "Download in progress. Quit anyway?";
pub const MERGE_STATUS: &str = "Merging video and audio...";

/// Tail of tool output kept for error classification.
const MAX_DIAGNOSTIC_LINES: usize = 200;

/// Lines buffered between the pipe reader and the worker.
const LINE_BUFFER: usize = 256;

/// Configuration for the download manager.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub yt_dlp_path: PathBuf,
    /// Inserted between the program and the built arguments.
    pub global_args: Vec<String>,
    pub format_rules: FormatRules,
    pub recency_window: Duration,
    pub catalog_timeout: Duration,
    /// Empty accepts any http(s) URL.
    pub allowed_hosts: Vec<String>,
}

impl DownloadConfig {
    pub fn new(yt_dlp_path: PathBuf) -> Self {
        Self {
            yt_dlp_path,
            global_args: vec![],
            format_rules: FormatRules::default(),
            recency_window: RECENCY_WINDOW,
            catalog_timeout: Duration::from_secs(30),
            allowed_hosts: vec![],
        }
    }

    pub fn from_app_config(config: &AppConfig, yt_dlp_path: PathBuf) -> Self {
        Self {
            yt_dlp_path,
            global_args: vec![],
            format_rules: config.format_rules.clone(),
            recency_window: config.recency_window(),
            catalog_timeout: config.catalog_timeout(),
            allowed_hosts: config.allowed_hosts.clone(),
        }
    }
}

/// Why `start_download` refused a request. Nothing was spawned.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("A download is already in progress")]
    Busy,
    #[error("{0}")]
    InvalidUrl(String),
    #[error("Destination directory does not exist: {}", .0.display())]
    MissingDestination(PathBuf),
}

impl StartError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            StartError::Busy => None,
            StartError::InvalidUrl(_) => Some(ErrorCode::InvalidUrl),
            StartError::MissingDestination(_) => Some(ErrorCode::MissingDestination),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("No previous download to retry")]
    NothingToRetry,
    #[error(transparent)]
    Start(#[from] StartError),
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{0}")]
    InvalidUrl(String),
    #[error("Failed to list formats: {0}")]
    Tool(#[from] YtDlpError),
}

/// Failures inside the worker before the tool reports an exit status.
#[derive(Debug, thiserror::Error)]
enum DownloadError {
    #[error("yt-dlp not available: {0}")]
    ToolMissing(String),
    #[error("{0}")]
    Io(String),
    #[error("download worker aborted: {0}")]
    Aborted(String),
}

/// A download the manager accepted.
#[derive(Debug)]
pub struct DownloadTicket {
    pub id: Uuid,
    pub handle: JoinHandle<DownloadOutcome>,
}

impl DownloadTicket {
    /// Wait for the worker to finish.
    pub async fn finished(self) -> Option<DownloadOutcome> {
        match self.handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::error!("Download worker {} did not finish: {}", self.id, e);
                None
            }
        }
    }
}

/// Cancellation request shared between the controller and the worker.
/// `notify_one` stores a permit, so a request made before the worker
/// starts waiting is not lost.
#[derive(Debug, Default)]
struct CancelSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct DownloadSession {
    id: Option<Uuid>,
    state: SessionState,
    is_active: bool,
    last_percent: f64,
    last_url: Option<String>,
    last_request: Option<DownloadRequest>,
    cancel: Option<Arc<CancelSignal>>,
}

#[derive(Debug, Clone)]
struct CatalogSnapshot {
    url: String,
    formats: Vec<FormatRecord>,
}

/// Download Manager handles validation, scheduling and execution of the
/// single download session.
pub struct DownloadManager {
    config: DownloadConfig,
    presenter: Arc<dyn Presenter>,
    runner: YtDlpRunner,
    session: Arc<Mutex<DownloadSession>>,
    catalog: Arc<RwLock<Option<CatalogSnapshot>>>,
}

impl DownloadManager {
    /// Create a new download manager. Nothing is spawned until a download
    /// or catalog fetch is requested.
    pub fn new(config: DownloadConfig, presenter: Arc<dyn Presenter>) -> Self {
        let runner = YtDlpRunner::new(YtDlpConfig {
            yt_dlp_path: config.yt_dlp_path.clone(),
            global_args: config.global_args.clone(),
            metadata_timeout: config.catalog_timeout,
        });
        Self {
            config,
            presenter,
            runner,
            session: Arc::new(Mutex::new(DownloadSession::default())),
            catalog: Arc::new(RwLock::new(None)),
        }
    }

    /// Start a download. Rejected requests leave the session untouched.
    ///
    /// A running session wins over input errors: the busy check comes
    /// first and is repeated once the request has been validated.
    pub async fn start_download(
        &self,
        mut request: DownloadRequest,
    ) -> Result<DownloadTicket, StartError> {
        if self.session.lock().await.is_active {
            log::warn!("Rejecting download of {}: a session is active", request.url);
            return Err(StartError::Busy);
        }

        request.url = validate_download_url(&request.url, &self.config.allowed_hosts)
            .map_err(StartError::InvalidUrl)?;

        let dir_ok = tokio::fs::metadata(&request.destination_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !dir_ok {
            return Err(StartError::MissingDestination(
                request.destination_dir.clone(),
            ));
        }

        let id = Uuid::new_v4();
        let cancel = Arc::new(CancelSignal::default());
        {
            let mut session = self.session.lock().await;
            if session.is_active {
                log::warn!(
                    "Rejecting download of {}: session {:?} is still {}",
                    request.url,
                    session.id,
                    session.state.as_str()
                );
                return Err(StartError::Busy);
            }
            session.id = Some(id);
            session.state = SessionState::Starting;
            session.is_active = true;
            session.last_percent = 0.0;
            session.last_url = Some(request.url.clone());
            session.last_request = Some(request.clone());
            session.cancel = Some(cancel.clone());
        }

        let catalog = self.catalog_for(&request.url).await;
        log::info!(
            "Starting download {} for {} ({} catalog entries)",
            id,
            request.url,
            catalog.len()
        );

        let worker = Worker {
            id,
            config: self.config.clone(),
            presenter: self.presenter.clone(),
            session: self.session.clone(),
            cancel,
        };
        let handle = tokio::spawn(worker.run(request, catalog));

        Ok(DownloadTicket { id, handle })
    }

    /// Request cancellation of the active session. Returns false when
    /// nothing is running.
    pub async fn cancel_download(&self) -> bool {
        let session = self.session.lock().await;
        match (&session.cancel, session.is_active) {
            (Some(cancel), true) => {
                log::info!("Cancel requested for download {:?}", session.id);
                cancel.request();
                true
            }
            _ => {
                log::debug!("Cancel requested with no active download");
                false
            }
        }
    }

    /// Start the last request again with the same URL and options.
    pub async fn retry_last_download(&self) -> Result<DownloadTicket, RetryError> {
        let request = {
            let session = self.session.lock().await;
            session.last_request.clone()
        };
        let request = request.ok_or(RetryError::NothingToRetry)?;
        log::info!("Retrying download of {}", request.url);
        Ok(self.start_download(request).await?)
    }

    /// List the formats offered for `url` and remember them for the next
    /// download of the same URL.
    pub async fn fetch_format_catalog(&self, url: &str) -> Result<Vec<FormatRecord>, CatalogError> {
        let url = validate_download_url(url, &self.config.allowed_hosts)
            .map_err(CatalogError::InvalidUrl)?;

        let (formats, _output) = self.runner.list_formats(&url).await?;
        log::info!("Catalog for {} has {} formats", url, formats.len());

        *self.catalog.write().await = Some(CatalogSnapshot {
            url,
            formats: formats.clone(),
        });
        Ok(formats)
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let session = self.session.lock().await;
        SessionSnapshot {
            id: session.id,
            state: session.state,
            is_active: session.is_active,
            last_percent: session.last_percent,
            last_url: session.last_url.clone(),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.session.lock().await.is_active
    }

    /// Ask before quitting while a download runs. Returns true when the
    /// caller may exit; the running download is cancelled in that case.
    pub async fn confirm_shutdown(&self) -> bool {
        if !self.is_active().await {
            return true;
        }

        let presenter = self.presenter.clone();
        let quit = tokio::task::spawn_blocking(move || presenter.prompt_yes_no(SHUTDOWN_QUESTION))
            .await
            .unwrap_or(false);
        if quit {
            self.cancel_download().await;
        }
        quit
    }

    async fn catalog_for(&self, url: &str) -> Vec<FormatRecord> {
        match self.catalog.read().await.as_ref() {
            Some(snapshot) if snapshot.url == url => snapshot.formats.clone(),
            _ => vec![],
        }
    }
}

/// How the tool run ended.
#[derive(Debug)]
enum ProcessEnd {
    Exited {
        code: Option<i32>,
        success: bool,
        diagnostics: Vec<String>,
    },
    Cancelled,
}

/// Everything one download attempt needs, moved onto its task.
struct Worker {
    id: Uuid,
    config: DownloadConfig,
    presenter: Arc<dyn Presenter>,
    session: Arc<Mutex<DownloadSession>>,
    cancel: Arc<CancelSignal>,
}

impl Worker {
    async fn run(self, request: DownloadRequest, catalog: Vec<FormatRecord>) -> DownloadOutcome {
        let rules = &self.config.format_rules;
        let format_id = rules.fast_downgrade(&request.format_id, &catalog, request.fast_mode);
        let mode = if rules.needs_merge(&format_id, &catalog) {
            DownloadMode::Merge
        } else {
            DownloadMode::Combined
        };
        let args = build_download_args(&self.config.yt_dlp_path, &request, &format_id, mode);

        log::info!(
            "Download {} using format {} ({:?}): {}",
            self.id,
            format_id,
            mode,
            display_command(&args)
        );
        self.presenter
            .report_log(&format!("Command: {}", display_command(&args)));
        self.presenter.report_status("Starting download...");
        self.set_state(SessionState::Running).await;

        // Own task so a panic in the read loop still reaches finalization.
        let process = tokio::spawn(run_process(
            args,
            self.config.global_args.clone(),
            mode,
            self.presenter.clone(),
            self.session.clone(),
            self.cancel.clone(),
        ));
        let result = match process.await {
            Ok(result) => result,
            Err(e) => Err(DownloadError::Aborted(e.to_string())),
        };

        let (state, exit_code, diagnostics) = match &result {
            Ok(ProcessEnd::Exited {
                code,
                success: true,
                ..
            }) => (SessionState::Completed, *code, None),
            Ok(ProcessEnd::Exited {
                code, diagnostics, ..
            }) => (SessionState::Failed, *code, Some(diagnostics.as_slice())),
            Ok(ProcessEnd::Cancelled) => (SessionState::Cancelled, None, None),
            Err(_) => (SessionState::Failed, None, None),
        };

        let last_percent = self.finish(state).await;
        log::info!(
            "Download {} finished: {} (exit {:?}, {:.1}%)",
            self.id,
            state.as_str(),
            exit_code,
            last_percent
        );

        let output = match state {
            SessionState::Completed | SessionState::Failed => {
                match locate_recent_output(&request.destination_dir, self.config.recency_window)
                    .await
                {
                    Ok(found) => found,
                    Err(e) => {
                        log::warn!("Output lookup failed: {:#}", e);
                        None
                    }
                }
            }
            _ => None,
        };

        match state {
            SessionState::Completed => {
                match &output {
                    Some(file) if file.size_bytes > 0 => {
                        self.presenter.report_success(&format!(
                            "Download completed: {} ({:.2} MiB)",
                            file.path.display(),
                            file.size_mib()
                        ));
                    }
                    Some(file) => {
                        self.presenter.report_warning(&format!(
                            "Downloaded file is empty: {}",
                            file.path.display()
                        ));
                        self.presenter.report_success("Download completed.");
                    }
                    None => {
                        self.presenter.report_warning(&format!(
                            "Could not find the downloaded file in {}",
                            request.destination_dir.display()
                        ));
                        self.presenter.report_success("Download completed.");
                    }
                }
                self.presenter.report_status("Download complete");
            }
            SessionState::Failed => {
                if let Err(e) = &result {
                    log::error!("Download {} failed: {}", self.id, e);
                    self.presenter.report_log(&format!("ERROR: {e}"));
                }
                if let Some(lines) = diagnostics {
                    let (code, message, actions) = classify_error(&lines.join("\n"));
                    log::warn!("Download {} failed with {:?}", self.id, code);
                    self.presenter.report_log(&hint_line(&message, &actions));
                }
                if let Some(file) = &output {
                    self.presenter.report_log(&format!(
                        "Partial output: {} ({:.2} MiB)",
                        file.path.display(),
                        file.size_mib()
                    ));
                }
                self.presenter.report_error(FAILURE_MESSAGE);
                self.presenter.report_status("Download failed");
            }
            SessionState::Cancelled => {
                self.presenter.report_log("Download cancelled by user.");
                self.presenter.report_status("Download cancelled");
            }
            _ => {}
        }

        DownloadOutcome {
            id: self.id,
            state,
            mode: Some(mode),
            format_id: Some(format_id),
            exit_code,
            last_percent,
            output,
        }
    }

    async fn set_state(&self, state: SessionState) {
        let mut session = self.session.lock().await;
        if session.id == Some(self.id) {
            session.state = state;
        }
    }

    /// Release the session so a new download may start.
    async fn finish(&self, state: SessionState) -> f64 {
        debug_assert!(state.is_terminal());
        let mut session = self.session.lock().await;
        if session.id == Some(self.id) {
            session.state = state;
            session.is_active = false;
            session.cancel = None;
        }
        session.last_percent
    }
}

/// Spawn the tool and forward its output until it exits or cancellation
/// is requested. The child is killed on every early return.
///
/// stdout and stderr share one pipe so lines arrive in the order the tool
/// wrote them.
async fn run_process(
    args: Vec<String>,
    global_args: Vec<String>,
    mode: DownloadMode,
    presenter: Arc<dyn Presenter>,
    session: Arc<Mutex<DownloadSession>>,
    cancel: Arc<CancelSignal>,
) -> Result<ProcessEnd, DownloadError> {
    let Some((program, rest)) = args.split_first() else {
        return Err(DownloadError::Io("empty command line".to_string()));
    };

    let program_path = PathBuf::from(program);
    if !program_path.exists() && which::which(&program_path).is_err() {
        return Err(DownloadError::ToolMissing(format!("{program} not found")));
    }

    let (pipe_reader, pipe_writer) = os_pipe::pipe()
        .map_err(|e| DownloadError::Io(format!("failed to create output pipe: {e}")))?;
    let stderr_writer = pipe_writer
        .try_clone()
        .map_err(|e| DownloadError::Io(format!("failed to share output pipe: {e}")))?;

    let mut cmd = Command::new(&program_path);
    cmd.args(&global_args)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(pipe_writer)
        .stderr(stderr_writer)
        .kill_on_drop(true);

    // Hide console window on Windows
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let spawned = cmd.spawn();
    // The command holds our copies of the write end; EOF needs them closed.
    drop(cmd);
    let mut child = spawned.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DownloadError::ToolMissing(e.to_string()),
        _ => DownloadError::Io(format!("failed to start {program}: {e}")),
    })?;
    log::info!("Spawned {} (pid {:?})", program, child.id());

    let mut lines = spawn_line_reader(pipe_reader);

    let merge_re = Regex::new(r"\[Merger\]|Merging formats").ok();
    let mut diagnostics: VecDeque<String> = VecDeque::with_capacity(MAX_DIAGNOSTIC_LINES);

    loop {
        let line = tokio::select! {
            _ = cancel.notify.notified() => None,
            line = lines.recv() => match line {
                Some(l) => Some(l),
                None => break,
            },
        };

        if cancel.is_requested() {
            return Ok(kill_cancelled(&mut child, program).await);
        }

        let Some(line) = line else {
            // Spurious wakeup without a request; keep reading.
            continue;
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        log::debug!("yt-dlp: {}", line);
        presenter.report_log(line);

        if let Some(percent) = parse_progress(line) {
            session.lock().await.last_percent = percent;
            presenter.report_progress(percent);
            presenter.report_status(&format!("{}... {:.1}%", mode.status_label(), percent));
        }

        if merge_re.as_ref().is_some_and(|re| re.is_match(line)) {
            log::info!("Post-processing: merging streams");
            presenter.report_status(MERGE_STATUS);
        }

        if diagnostics.len() == MAX_DIAGNOSTIC_LINES {
            diagnostics.pop_front();
        }
        diagnostics.push_back(line.to_string());
    }

    // Output closed, but the tool may still be running.
    if cancel.is_requested() {
        return Ok(kill_cancelled(&mut child, program).await);
    }
    let status = tokio::select! {
        status = child.wait() => status
            .map_err(|e| DownloadError::Io(format!("failed to wait for {program}: {e}")))?,
        _ = cancel.notify.notified() => {
            return Ok(kill_cancelled(&mut child, program).await);
        }
    };
    log::info!("{} exited with {:?}", program, status.code());

    Ok(ProcessEnd::Exited {
        code: status.code(),
        success: status.success(),
        diagnostics: diagnostics.into(),
    })
}

async fn kill_cancelled(child: &mut Child, program: &str) -> ProcessEnd {
    log::info!("Cancellation observed, stopping {}", program);
    if let Err(e) = child.kill().await {
        log::warn!("Failed to kill {}: {}", program, e);
    }
    ProcessEnd::Cancelled
}

/// Read the combined output on a blocking thread, one line at a time.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the
/// stream. The channel closes at EOF, on a read error, or once the
/// receiver is gone.
fn spawn_line_reader(pipe: os_pipe::PipeReader) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    tokio::task::spawn_blocking(move || {
        let mut reader = std::io::BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Error reading tool output: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Percentage from a yt-dlp progress line such as
/// `[download]  42.5% of 10.00MiB at 1.50MiB/s ETA 00:05`.
///
/// The number is the token right before the first `%`.
pub fn parse_progress(line: &str) -> Option<f64> {
    if !line.contains("[download]") {
        return None;
    }
    let before = &line[..line.find('%')?];
    let token = before.split_whitespace().last()?;
    token.parse::<f64>().ok().filter(|p| p.is_finite())
}

fn hint_line(message: &str, actions: &[Action]) -> String {
    if actions.is_empty() {
        return format!("Hint: {message}");
    }
    let labels: Vec<&str> = actions.iter().map(|a| a.label.as_str()).collect();
    format!("Hint: {message} (try: {})", labels.join(", "))
}

/// Classify yt-dlp errors into user-friendly categories with remediation actions.
///
/// `ERROR:` lines are preferred; without any, the whole tail is used.
pub fn classify_error(output: &str) -> (ErrorCode, String, Vec<Action>) {
    let error_lines: Vec<&str> = output
        .lines()
        .filter(|l| l.trim_start().starts_with("ERROR:"))
        .collect();
    let relevant = if error_lines.is_empty() {
        output.to_string()
    } else {
        error_lines.join("\n")
    };
    let lower = relevant.to_lowercase();

    // Sign-in / cookies required
    if lower.contains("sign in")
        || lower.contains("login")
        || lower.contains("cookies")
        || lower.contains("age-restricted")
    {
        return (
            ErrorCode::LoginRequired,
            "This content requires sign-in. Export cookies from your browser and retry."
                .to_string(),
            vec![action(ActionKind::ImportCookies, "Use browser cookies")],
        );
    }

    // Bot check / CAPTCHA
    if lower.contains("captcha") || lower.contains("not a bot") || lower.contains("confirm you're not")
    {
        return (
            ErrorCode::BotCheck,
            "The site requires verification. Use cookies from a logged-in browser session."
                .to_string(),
            vec![action(ActionKind::ImportCookies, "Use browser cookies")],
        );
    }

    // Geo-restriction
    if lower.contains("not available in your country")
        || lower.contains("geo restrict")
        || lower.contains("geo-restrict")
        || lower.contains("blocked it in your country")
    {
        return (
            ErrorCode::GeoRestricted,
            "This content is not available in your region.".to_string(),
            vec![action(ActionKind::ConfigureProxy, "Configure a proxy")],
        );
    }

    // Format unavailable
    if lower.contains("requested format") || lower.contains("format not available") {
        return (
            ErrorCode::FormatUnavailable,
            "The requested format is not available for this video.".to_string(),
            vec![action(ActionKind::ChooseAnotherFormat, "Choose another format")],
        );
    }

    // Merge tool missing
    if lower.contains("ffmpeg") && (lower.contains("not installed") || lower.contains("not found"))
    {
        return (
            ErrorCode::ToolMissing,
            "Merging video and audio needs ffmpeg.".to_string(),
            vec![action(ActionKind::InstallFfmpeg, "Install ffmpeg")],
        );
    }

    // Extractor outdated
    if lower.contains("unsupported url")
        || lower.contains("no video formats")
        || lower.contains("extractor")
    {
        return (
            ErrorCode::ExtractorOutdated,
            "yt-dlp may be outdated for this site.".to_string(),
            vec![
                action(ActionKind::UpdateYtDlp, "Update yt-dlp"),
                action(ActionKind::Retry, "Retry"),
            ],
        );
    }

    // Network errors
    if lower.contains("network")
        || lower.contains("connection")
        || lower.contains("timeout")
        || lower.contains("timed out")
    {
        return (
            ErrorCode::Network,
            "Network error occurred. Check your connection and retry.".to_string(),
            vec![action(ActionKind::Retry, "Retry")],
        );
    }

    // Default: unknown error
    let trimmed = relevant.trim();
    let message = if trimmed.is_empty() {
        "Download failed with unknown error.".to_string()
    } else if trimmed.chars().count() > 200 {
        let head: String = trimmed.chars().take(200).collect();
        format!("Download failed: {head}…")
    } else {
        format!("Download failed: {trimmed}")
    };

    (
        ErrorCode::Unknown,
        message,
        vec![
            action(ActionKind::Retry, "Retry"),
            action(ActionKind::OpenLogs, "View logs"),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_token_before_percent() {
        assert_eq!(parse_progress("[download]  42.5% of 10.00MiB"), Some(42.5));
        assert_eq!(
            parse_progress("[download] 100% of 3.20MiB in 00:00:02"),
            Some(100.0)
        );
        assert_eq!(
            parse_progress("[download]   3.1% of ~ 120.00MiB at 2.00MiB/s ETA 01:00 (frag 2/80)"),
            Some(3.1)
        );
    }

    #[test]
    fn unparseable_progress_is_ignored() {
        assert_eq!(parse_progress("[download] garbage%"), None);
        assert_eq!(parse_progress("[download] NaN%"), None);
        assert_eq!(parse_progress("[download] Destination: a.mp4"), None);
        assert_eq!(parse_progress("[info] 50% done"), None);
        assert_eq!(parse_progress("[download] %"), None);
    }

    #[test]
    fn classify_login() {
        let (code, _, actions) =
            classify_error("ERROR: [youtube] abc: Sign in to confirm your age");
        assert_eq!(code, ErrorCode::LoginRequired);
        assert_eq!(actions[0].kind, ActionKind::ImportCookies);
    }

    #[test]
    fn classify_geo() {
        let (code, _, _) =
            classify_error("ERROR: Video not available in your country");
        assert_eq!(code, ErrorCode::GeoRestricted);
    }

    #[test]
    fn classify_prefers_error_lines() {
        let output = "[youtube] abc: Downloading cookies page\nERROR: Requested format is not available";
        let (code, _, _) = classify_error(output);
        assert_eq!(code, ErrorCode::FormatUnavailable);
    }

    #[test]
    fn classify_unknown_keeps_message_short() {
        let long = format!("ERROR: {}", "x".repeat(500));
        let (code, message, actions) = classify_error(&long);
        assert_eq!(code, ErrorCode::Unknown);
        assert!(message.chars().count() < 230);
        assert_eq!(actions.len(), 2);

        let (_, message, _) = classify_error("");
        assert_eq!(message, "Download failed with unknown error.");
    }

    #[test]
    fn start_errors_map_to_codes() {
        assert_eq!(StartError::Busy.code(), None);
        assert_eq!(
            StartError::InvalidUrl("bad".into()).code(),
            Some(ErrorCode::InvalidUrl)
        );
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use crate::events::{ChannelPresenter, DownloadEvent};
        use std::path::Path;
        use tokio::sync::mpsc::UnboundedReceiver;

        const URL: &str = "https://youtu.be/abc";

        /// A manager whose "yt-dlp" is `/bin/sh <script>`.
        fn manager_with_script(
            dir: &Path,
            body: &str,
        ) -> (DownloadManager, UnboundedReceiver<DownloadEvent>) {
            let script = dir.join("fake-yt-dlp.sh");
            std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();

            let mut config = DownloadConfig::new(PathBuf::from("/bin/sh"));
            config.global_args = vec![script.to_string_lossy().to_string()];
            config.allowed_hosts = vec!["youtu.be".to_string()];

            let (presenter, rx) = ChannelPresenter::new(true);
            (DownloadManager::new(config, Arc::new(presenter)), rx)
        }

        fn drain(rx: &mut UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
            let mut events = vec![];
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
            events
        }

        fn logs(events: &[DownloadEvent]) -> Vec<String> {
            events
                .iter()
                .filter_map(|e| match e {
                    DownloadEvent::Log { line } => Some(line.clone()),
                    _ => None,
                })
                .collect()
        }

        /// Wait until the worker forwards a log line equal to `wanted`.
        async fn wait_for_log(rx: &mut UnboundedReceiver<DownloadEvent>, wanted: &str) {
            let wait = async {
                while let Some(event) = rx.recv().await {
                    if let DownloadEvent::Log { line } = event {
                        if line == wanted {
                            return;
                        }
                    }
                }
                panic!("presenter channel closed before {wanted:?}");
            };
            tokio::time::timeout(Duration::from_secs(10), wait)
                .await
                .expect("log line did not arrive");
        }

        #[tokio::test]
        async fn completed_download_reports_progress_and_output() {
            let dir = tempfile::tempdir().unwrap();
            let out = dir.path().join("clip.mp4");
            let body = format!(
                r#"echo "[download] Destination: {out}"
echo "[download]  42.5% of 10.00MiB"
echo "[download] garbage%"
echo "some warning" >&2
printf 'data' > "{out}""#,
                out = out.display()
            );
            let (manager, mut rx) = manager_with_script(dir.path(), &body);

            let request = DownloadRequest::new(URL, dir.path());
            let ticket = manager.start_download(request).await.unwrap();
            let outcome = ticket.finished().await.unwrap();

            assert_eq!(outcome.state, SessionState::Completed);
            assert_eq!(outcome.exit_code, Some(0));
            assert_eq!(outcome.last_percent, 42.5);
            assert_eq!(outcome.mode, Some(DownloadMode::Combined));
            let output = outcome.output.expect("output located");
            assert_eq!(output.path, out);
            assert_eq!(output.size_bytes, 4);

            let events = drain(&mut rx);
            assert!(events.contains(&DownloadEvent::Progress { percent: 42.5 }));
            assert!(events.contains(&DownloadEvent::Status {
                text: "Downloading... 42.5%".to_string()
            }));
            let lines = logs(&events);
            assert!(lines.contains(&"[download] garbage%".to_string()));
            assert!(lines.contains(&"some warning".to_string()));
            assert!(events
                .iter()
                .any(|e| matches!(e, DownloadEvent::Success { message } if message.contains("clip.mp4"))));

            let snapshot = manager.snapshot().await;
            assert!(!snapshot.is_active);
            assert_eq!(snapshot.state, SessionState::Completed);
            assert_eq!(snapshot.last_url.as_deref(), Some(URL));
        }

        #[tokio::test]
        async fn stdout_order_is_preserved() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) =
                manager_with_script(dir.path(), "for i in 1 2 3 4 5; do echo \"line $i\"; done");

            let ticket = manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap();
            ticket.finished().await.unwrap();

            let lines: Vec<String> = logs(&drain(&mut rx))
                .into_iter()
                .filter(|l| l.starts_with("line "))
                .collect();
            assert_eq!(lines, vec!["line 1", "line 2", "line 3", "line 4", "line 5"]);
        }

        #[tokio::test]
        async fn missing_output_is_only_a_warning() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) = manager_with_script(dir.path(), "echo done");

            let ticket = manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap();
            let outcome = ticket.finished().await.unwrap();

            assert_eq!(outcome.state, SessionState::Completed);
            assert!(outcome.output.is_none());
            let events = drain(&mut rx);
            assert!(events
                .iter()
                .any(|e| matches!(e, DownloadEvent::Warning { .. })));
            assert!(events
                .iter()
                .any(|e| matches!(e, DownloadEvent::Success { .. })));
        }

        #[tokio::test]
        async fn non_zero_exit_fails_and_can_be_retried() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) = manager_with_script(
                dir.path(),
                "echo 'ERROR: [youtube] abc: Sign in to confirm your age' >&2\nexit 1",
            );

            let ticket = manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap();
            let outcome = ticket.finished().await.unwrap();

            assert_eq!(outcome.state, SessionState::Failed);
            assert_eq!(outcome.exit_code, Some(1));
            assert!(!manager.is_active().await);

            let events = drain(&mut rx);
            assert!(events.contains(&DownloadEvent::Error {
                message: FAILURE_MESSAGE.to_string()
            }));
            assert!(logs(&events)
                .iter()
                .any(|l| l.starts_with("Hint:") && l.contains("sign-in")));

            let retry = manager.retry_last_download().await.unwrap();
            let outcome = retry.finished().await.unwrap();
            assert_eq!(outcome.state, SessionState::Failed);
        }

        #[tokio::test]
        async fn cancel_mid_stream_then_start_again() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) = manager_with_script(
                dir.path(),
                "echo first\nsleep 3\necho after",
            );

            let ticket = manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap();
            wait_for_log(&mut rx, "first").await;

            let second = manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await;
            assert!(matches!(second, Err(StartError::Busy)));

            assert!(manager.cancel_download().await);
            let outcome = ticket.finished().await.unwrap();
            assert_eq!(outcome.state, SessionState::Cancelled);
            assert!(!manager.is_active().await);

            let events = drain(&mut rx);
            assert!(!logs(&events).contains(&"after".to_string()));
            assert!(events.contains(&DownloadEvent::Status {
                text: "Download cancelled".to_string()
            }));

            let again = manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap();
            assert!(manager.cancel_download().await);
            let outcome = again.finished().await.unwrap();
            assert_eq!(outcome.state, SessionState::Cancelled);
        }

        #[tokio::test]
        async fn fast_mode_uses_fetched_catalog() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) = manager_with_script(
                dir.path(),
                r#"case "$*" in
  *--list-formats*)
    echo "ID  EXT  RESOLUTION FPS"
    echo "136 mp4  1280x720   30 | 20MiB"
    echo "137 mp4  1920x1080  30 | 48MiB"
    ;;
  *)
    echo "args: $*"
    ;;
esac"#,
            );

            let formats = manager.fetch_format_catalog(URL).await.unwrap();
            assert_eq!(formats.len(), 2);

            let mut request = DownloadRequest::new(URL, dir.path());
            request.format_id = "137".to_string();
            request.fast_mode = true;
            let outcome = manager
                .start_download(request)
                .await
                .unwrap()
                .finished()
                .await
                .unwrap();

            assert_eq!(outcome.format_id.as_deref(), Some("136"));
            assert_eq!(outcome.mode, Some(DownloadMode::Combined));
            let args_line = logs(&drain(&mut rx))
                .into_iter()
                .find(|l| l.starts_with("args: "))
                .expect("script echoed its arguments");
            assert!(args_line.contains("--format 136 "));
            assert!(!args_line.contains("--merge-output-format"));
        }

        #[tokio::test]
        async fn invalid_requests_are_rejected_before_spawning() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) = manager_with_script(dir.path(), "echo should-not-run");

            let err = manager
                .start_download(DownloadRequest::new("", dir.path()))
                .await
                .unwrap_err();
            assert!(matches!(err, StartError::InvalidUrl(_)));

            let err = manager
                .start_download(DownloadRequest::new(
                    "https://example.com/v",
                    dir.path(),
                ))
                .await
                .unwrap_err();
            assert!(matches!(err, StartError::InvalidUrl(_)));

            let missing = dir.path().join("missing");
            let err = manager
                .start_download(DownloadRequest::new(URL, &missing))
                .await
                .unwrap_err();
            assert!(matches!(err, StartError::MissingDestination(p) if p == missing));

            assert!(drain(&mut rx).is_empty());
            let snapshot = manager.snapshot().await;
            assert_eq!(snapshot.state, SessionState::Idle);
            assert!(snapshot.last_url.is_none());
        }

        #[tokio::test]
        async fn nothing_to_retry_or_cancel_initially() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, _rx) = manager_with_script(dir.path(), "true");

            assert!(matches!(
                manager.retry_last_download().await,
                Err(RetryError::NothingToRetry)
            ));
            assert!(!manager.cancel_download().await);
            assert!(manager.confirm_shutdown().await);
        }

        #[tokio::test]
        async fn confirm_shutdown_cancels_running_download() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) = manager_with_script(dir.path(), "echo first\nsleep 3");

            let ticket = manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap();
            wait_for_log(&mut rx, "first").await;

            // ChannelPresenter answers yes.
            assert!(manager.confirm_shutdown().await);
            let outcome = ticket.finished().await.unwrap();
            assert_eq!(outcome.state, SessionState::Cancelled);
        }

        #[tokio::test]
        async fn invalid_bytes_are_replaced_and_reading_continues() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) = manager_with_script(
                dir.path(),
                r#"printf '[download] Destination: caf\351.mp4\n'
echo "[download]  50.0% of 1.00MiB"
echo after-bad-line"#,
            );

            let outcome = manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap()
                .finished()
                .await
                .unwrap();

            assert_eq!(outcome.state, SessionState::Completed);
            assert_eq!(outcome.last_percent, 50.0);
            let lines = logs(&drain(&mut rx));
            assert!(lines.contains(&"[download] Destination: caf\u{FFFD}.mp4".to_string()));
            assert!(lines.contains(&"after-bad-line".to_string()));
        }

        #[tokio::test]
        async fn stdout_and_stderr_keep_write_order() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) = manager_with_script(
                dir.path(),
                "echo o1\necho e1 >&2\necho o2\necho e2 >&2\necho o3",
            );

            manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap()
                .finished()
                .await
                .unwrap();

            let lines: Vec<String> = logs(&drain(&mut rx))
                .into_iter()
                .filter(|l| l.len() == 2 && (l.starts_with('o') || l.starts_with('e')))
                .collect();
            assert_eq!(lines, vec!["o1", "e1", "o2", "e2", "o3"]);
        }

        #[tokio::test]
        async fn blank_lines_are_not_forwarded() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) =
                manager_with_script(dir.path(), "echo\necho '   '\necho '  padded  '");

            manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap()
                .finished()
                .await
                .unwrap();

            let lines = logs(&drain(&mut rx));
            assert!(lines.contains(&"padded".to_string()));
            assert!(lines.iter().all(|l| !l.trim().is_empty()));
        }

        #[tokio::test]
        async fn busy_wins_over_invalid_input_while_running() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) = manager_with_script(dir.path(), "echo first\nsleep 3");

            let ticket = manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap();
            wait_for_log(&mut rx, "first").await;

            let empty_url = manager
                .start_download(DownloadRequest::new("", dir.path()))
                .await;
            assert!(matches!(empty_url, Err(StartError::Busy)));

            let missing = manager
                .start_download(DownloadRequest::new(URL, dir.path().join("missing")))
                .await;
            assert!(matches!(missing, Err(StartError::Busy)));

            assert!(manager.cancel_download().await);
            let outcome = ticket.finished().await.unwrap();
            assert_eq!(outcome.state, SessionState::Cancelled);
        }

        #[tokio::test]
        async fn missing_tool_fails_and_releases_session() {
            let dir = tempfile::tempdir().unwrap();
            let mut config = DownloadConfig::new(dir.path().join("no-such-yt-dlp"));
            config.allowed_hosts = vec!["youtu.be".to_string()];
            let (presenter, mut rx) = ChannelPresenter::new(true);
            let manager = DownloadManager::new(config, Arc::new(presenter));

            let outcome = manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap()
                .finished()
                .await
                .unwrap();

            assert_eq!(outcome.state, SessionState::Failed);
            assert_eq!(outcome.exit_code, None);
            assert!(!manager.is_active().await);
            let events = drain(&mut rx);
            assert!(events.contains(&DownloadEvent::Error {
                message: FAILURE_MESSAGE.to_string()
            }));
            assert!(logs(&events)
                .iter()
                .any(|l| l.starts_with("ERROR: yt-dlp not available")));

            let again = manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap();
            let outcome = again.finished().await.unwrap();
            assert_eq!(outcome.state, SessionState::Failed);
        }

        /// Panics when asked to show the line `explode`.
        struct ExplodingPresenter(ChannelPresenter);

        impl Presenter for ExplodingPresenter {
            fn report_log(&self, line: &str) {
                if line == "explode" {
                    panic!("presenter failed on {line:?}");
                }
                self.0.report_log(line);
            }
            fn report_status(&self, text: &str) {
                self.0.report_status(text);
            }
            fn report_progress(&self, percent: f64) {
                self.0.report_progress(percent);
            }
            fn report_error(&self, message: &str) {
                self.0.report_error(message);
            }
            fn report_success(&self, message: &str) {
                self.0.report_success(message);
            }
            fn report_warning(&self, message: &str) {
                self.0.report_warning(message);
            }
            fn prompt_yes_no(&self, question: &str) -> bool {
                self.0.prompt_yes_no(question)
            }
        }

        #[tokio::test]
        async fn worker_panic_fails_and_releases_session() {
            let dir = tempfile::tempdir().unwrap();
            let script = dir.path().join("fake-yt-dlp.sh");
            std::fs::write(&script, "#!/bin/sh\necho explode\n").unwrap();
            let mut config = DownloadConfig::new(PathBuf::from("/bin/sh"));
            config.global_args = vec![script.to_string_lossy().to_string()];
            config.allowed_hosts = vec!["youtu.be".to_string()];
            let (presenter, mut rx) = ChannelPresenter::new(true);
            let manager = DownloadManager::new(config, Arc::new(ExplodingPresenter(presenter)));

            let outcome = tokio::time::timeout(
                Duration::from_secs(10),
                manager
                    .start_download(DownloadRequest::new(URL, dir.path()))
                    .await
                    .unwrap()
                    .finished(),
            )
            .await
            .expect("worker finished")
            .unwrap();

            assert_eq!(outcome.state, SessionState::Failed);
            assert_eq!(outcome.exit_code, None);
            assert!(!manager.is_active().await);
            let events = drain(&mut rx);
            assert!(events.contains(&DownloadEvent::Error {
                message: FAILURE_MESSAGE.to_string()
            }));
            assert!(logs(&events)
                .iter()
                .any(|l| l.starts_with("ERROR: download worker aborted")));
        }

        #[tokio::test]
        async fn cancel_after_output_closes_stops_the_wait() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) = manager_with_script(
                dir.path(),
                "echo first\nexec >/dev/null 2>&1\nsleep 5",
            );

            let ticket = manager
                .start_download(DownloadRequest::new(URL, dir.path()))
                .await
                .unwrap();
            wait_for_log(&mut rx, "first").await;
            // Let the reader see EOF so the worker is parked in wait().
            tokio::time::sleep(Duration::from_millis(300)).await;

            assert!(manager.cancel_download().await);
            let outcome = tokio::time::timeout(Duration::from_secs(3), ticket.finished())
                .await
                .expect("cancel interrupts the wait")
                .unwrap();
            assert_eq!(outcome.state, SessionState::Cancelled);
            assert!(!manager.is_active().await);
        }
    }
}
