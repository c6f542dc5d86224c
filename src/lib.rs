use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;

pub mod command;
pub mod download_manager;
pub mod events;
pub mod formats;
pub mod models;
pub mod output_locator;
pub mod settings;
pub mod tool_manager;
pub mod url_utils;
pub mod ytdlp;

use download_manager::{CatalogError, DownloadConfig, DownloadManager, DownloadTicket, StartError};
use events::{deliver, ChannelPresenter, DownloadEvent, Presenter};
use models::{AudioQuality, DownloadOutcome, SessionState};
use settings::AppConfig;
use tool_manager::{report_toolchain, Tool, ToolManager, ToolStatus};

pub const RETRY_QUESTION: &str = "Retry the last download?";

/// Exit code after the user cancelled a download.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "tubegrab")]
#[command(author, version, about = "Download single videos with yt-dlp, merging streams with ffmpeg", long_about = None)]
pub struct Cli {
    /// Config file (JSON). Defaults to the per-user config if present
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that yt-dlp and ffmpeg are installed and responding
    Check,

    /// List the formats available for a video
    Formats {
        url: String,

        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download a video
    Download {
        url: String,

        /// Format id from `formats`, or any yt-dlp selector
        #[arg(short, long)]
        format: Option<String>,

        /// Audio quality paired with video-only formats
        #[arg(short, long, value_parser = parse_audio_quality)]
        audio: Option<AudioQuality>,

        /// File name without extension (defaults to the video title)
        #[arg(short, long)]
        name: Option<String>,

        /// Destination directory
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Prefer lower resolutions when available
        #[arg(long)]
        fast: bool,

        /// Disable parallel fragments and retry tuning
        #[arg(long)]
        no_speed_boost: bool,

        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },

    /// Open the download directory in the file manager
    OpenFolder { dir: Option<PathBuf> },
}

fn parse_audio_quality(s: &str) -> Result<AudioQuality, String> {
    match s.to_ascii_lowercase().as_str() {
        "best" => Ok(AudioQuality::Best),
        "high" => Ok(AudioQuality::High),
        "medium" => Ok(AudioQuality::Medium),
        "low" => Ok(AudioQuality::Low),
        other => Err(format!(
            "unknown audio quality {other:?} (expected best, high, medium or low)"
        )),
    }
}

/// Presenter for an interactive terminal: log lines above a single
/// rewritten status line, questions answered on stdin.
#[derive(Debug, Default)]
pub struct TerminalPresenter {
    status_shown: AtomicBool,
}

impl TerminalPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    fn clear_status(&self, out: &mut impl Write) {
        if self.status_shown.swap(false, Ordering::SeqCst) {
            let _ = write!(out, "\r\x1b[2K");
        }
    }
}

impl Presenter for TerminalPresenter {
    fn report_log(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        self.clear_status(&mut out);
        let _ = writeln!(out, "{line}");
    }

    fn report_status(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "\r\x1b[2K{text}");
        let _ = out.flush();
        self.status_shown.store(true, Ordering::SeqCst);
    }

    // The status line already carries the percentage.
    fn report_progress(&self, _percent: f64) {}

    fn report_error(&self, message: &str) {
        self.clear_status(&mut std::io::stdout().lock());
        eprintln!("Error: {message}");
    }

    fn report_success(&self, message: &str) {
        let mut out = std::io::stdout().lock();
        self.clear_status(&mut out);
        let _ = writeln!(out, "{message}");
    }

    fn report_warning(&self, message: &str) {
        self.clear_status(&mut std::io::stdout().lock());
        eprintln!("Warning: {message}");
    }

    fn prompt_yes_no(&self, question: &str) -> bool {
        {
            let mut out = std::io::stdout().lock();
            self.clear_status(&mut out);
            let _ = write!(out, "{question} [y/N] ");
            let _ = out.flush();
        }
        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => is_yes(&answer),
            Err(e) => {
                log::warn!("Could not read answer: {}", e);
                false
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// What the download manager talks to: reports are queued for the
/// foreground, questions go straight to the terminal.
struct QueuedPresenter {
    queue: ChannelPresenter,
    terminal: Arc<TerminalPresenter>,
}

impl Presenter for QueuedPresenter {
    fn report_log(&self, line: &str) {
        self.queue.report_log(line);
    }

    fn report_status(&self, text: &str) {
        self.queue.report_status(text);
    }

    fn report_progress(&self, percent: f64) {
        self.queue.report_progress(percent);
    }

    fn report_error(&self, message: &str) {
        self.queue.report_error(message);
    }

    fn report_success(&self, message: &str) {
        self.queue.report_success(message);
    }

    fn report_warning(&self, message: &str) {
        self.queue.report_warning(message);
    }

    fn prompt_yes_no(&self, question: &str) -> bool {
        self.terminal.prompt_yes_no(question)
    }
}

/// Everything a command handler needs.
struct App {
    config: AppConfig,
    tools: ToolManager,
    terminal: Arc<TerminalPresenter>,
}

impl App {
    fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = AppConfig::load(config_path)?;
        let tools = ToolManager::new(config.tool_manager_config());
        Ok(Self {
            config,
            tools,
            terminal: Arc::new(TerminalPresenter::new()),
        })
    }

    fn download_manager(&self) -> (DownloadManager, UnboundedReceiver<DownloadEvent>) {
        let (queue, rx) = ChannelPresenter::new(false);
        let presenter = QueuedPresenter {
            queue,
            terminal: self.terminal.clone(),
        };
        let config =
            DownloadConfig::from_app_config(&self.config, self.tools.program(Tool::YtDlp));
        (DownloadManager::new(config, Arc::new(presenter)), rx)
    }

    async fn ask(&self, question: &'static str) -> bool {
        let terminal = self.terminal.clone();
        tokio::task::spawn_blocking(move || terminal.prompt_yes_no(question))
            .await
            .unwrap_or(false)
    }
}

async fn check(app: &App) -> Result<ExitCode> {
    let status = app.tools.probe().await;
    for info in [&status.yt_dlp, &status.ffmpeg] {
        let state = match info.status {
            ToolStatus::Ok => "ok",
            ToolStatus::Missing => "missing",
            ToolStatus::Broken => "not responding",
        };
        println!(
            "{:<8} {:<15} {:<20} {}",
            info.tool.as_str(),
            state,
            info.version.as_deref().unwrap_or("-"),
            info.path.display()
        );
    }
    for warning in status.warnings() {
        app.terminal.report_warning(&warning);
    }

    Ok(if status.yt_dlp.status == ToolStatus::Ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn list_formats(app: &App, url: &str, json: bool) -> Result<ExitCode> {
    let (manager, _rx) = app.download_manager();
    let formats = match manager.fetch_format_catalog(url).await {
        Ok(formats) => formats,
        Err(CatalogError::Tool(e)) => {
            if let Some(message) = e.tool_message() {
                app.terminal.report_error(message);
            }
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&formats)?);
    } else if formats.is_empty() {
        app.terminal.report_warning("No formats could be parsed from yt-dlp output");
    } else {
        for format in &formats {
            println!("{}", format.display_label);
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[allow(clippy::too_many_arguments)]
async fn download(
    app: &App,
    url: String,
    format: Option<String>,
    audio: Option<AudioQuality>,
    name: Option<String>,
    dir: Option<PathBuf>,
    fast: bool,
    no_speed_boost: bool,
    force: bool,
) -> Result<ExitCode> {
    let mut request = app.config.request_for(url);
    if let Some(format) = format {
        request.format_id = format;
    }
    if let Some(audio) = audio {
        log::info!("Audio quality: {}", audio.label());
        request.audio_quality = audio.selector().to_string();
    }
    if let Some(name) = name {
        request.custom_filename = name;
    }
    if let Some(dir) = dir {
        request.destination_dir = dir;
    }
    request.fast_mode |= fast;
    request.speed_boost &= !no_speed_boost;
    request.force_overwrite |= force;

    // Missing tools are reported up front but never block the attempt.
    let toolchain = app.tools.probe().await;
    report_toolchain(&toolchain, app.terminal.as_ref());

    let (manager, mut rx) = app.download_manager();

    // The classifier only knows resolutions it has seen in the catalog.
    if request.fast_mode || request.format_id != models::DEFAULT_FORMAT_SELECTOR {
        if let Err(e) = manager.fetch_format_catalog(&request.url).await {
            log::warn!("Format catalog unavailable: {}", e);
            app.terminal
                .report_warning("Could not list formats; using the selected format as-is");
        }
    }

    let mut ticket = match manager.start_download(request).await {
        Ok(ticket) => ticket,
        Err(e @ (StartError::InvalidUrl(_) | StartError::MissingDestination(_))) => {
            app.terminal.report_error(&e.to_string());
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };

    loop {
        let outcome = follow(&manager, ticket, &mut rx, app.terminal.as_ref()).await?;
        match outcome.state {
            SessionState::Completed => return Ok(ExitCode::SUCCESS),
            SessionState::Cancelled => return Ok(ExitCode::from(EXIT_CANCELLED)),
            _ => {}
        }

        if !app.ask(RETRY_QUESTION).await {
            return Ok(ExitCode::FAILURE);
        }
        ticket = manager.retry_last_download().await?;
    }
}

/// Render worker events until the download ends. Ctrl-C asks before
/// cancelling.
async fn follow(
    manager: &DownloadManager,
    mut ticket: DownloadTicket,
    rx: &mut UnboundedReceiver<DownloadEvent>,
    terminal: &dyn Presenter,
) -> Result<DownloadOutcome> {
    let result = loop {
        tokio::select! {
            Some(event) = rx.recv() => deliver(terminal, &event),
            result = &mut ticket.handle => break result,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::warn!("Ctrl-C handler failed: {}", e);
                } else if manager.confirm_shutdown().await {
                    log::info!("Quit confirmed, cancelling download {}", ticket.id);
                }
            }
        }
    };

    // Worker reports sent right before it finished.
    while let Ok(event) = rx.try_recv() {
        deliver(terminal, &event);
    }

    result.map_err(|e| anyhow!("download worker {} crashed: {e}", ticket.id))
}

fn open_folder(app: &App, dir: Option<PathBuf>) -> Result<ExitCode> {
    let path = dir.unwrap_or_else(|| app.config.download_dir.clone());

    let folder = if path.is_file() {
        path.parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| path.clone())
    } else {
        path
    };
    if !folder.is_dir() {
        return Err(anyhow!("Folder does not exist: {}", folder.display()));
    }

    log::info!("Opening {}", folder.display());
    open::that(&folder).with_context(|| format!("Failed to open {}", folder.display()))?;
    Ok(ExitCode::SUCCESS)
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let app = App::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Check => check(&app).await,
        Commands::Formats { url, json } => list_formats(&app, &url, json).await,
        Commands::Download {
            url,
            format,
            audio,
            name,
            dir,
            fast,
            no_speed_boost,
            force,
        } => {
            download(
                &app,
                url,
                format,
                audio,
                name,
                dir,
                fast,
                no_speed_boost,
                force,
            )
            .await
        }
        Commands::OpenFolder { dir } => open_folder(&app, dir),
    }
}

fn init_logging(verbose: bool) {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => {
            builder.parse_filters(&filters);
        }
        Err(_) => {
            builder.filter_level(if verbose {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            });
        }
    }
    if let Err(e) = builder.try_init() {
        eprintln!("Logger already initialized: {e}");
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
