use serde::Serialize;
use tokio::sync::mpsc;

/// A UI-friendly remediation the front-end can offer next to an error.
/// `kind` should be stable; the UI can map it to behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    ImportCookies,
    UpdateYtDlp,
    InstallFfmpeg,
    ConfigureProxy,
    ChooseAnotherFormat,
    Retry,
    OpenLogs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub kind: ActionKind,
    pub label: String,
}

pub fn action(kind: ActionKind, label: impl Into<String>) -> Action {
    Action {
        kind,
        label: label.into(),
    }
}

/// Stable error codes so the front-end can pick wording and remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unknown,
    InvalidUrl,
    MissingDestination,
    Network,
    GeoRestricted,
    LoginRequired,
    BotCheck,
    ExtractorOutdated,
    FormatUnavailable,
    ToolMissing,
}

/// Everything the core tells the presentation layer, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum DownloadEvent {
    Log { line: String },
    Status { text: String },
    Progress { percent: f64 },
    Warning { message: String },
    Error { message: String },
    Success { message: String },
}

/// Callbacks the core invokes on the presentation layer.
///
/// Implementations must be callable from the download worker; the
/// foreground observes them however it likes (channel, shared state, ...).
pub trait Presenter: Send + Sync {
    fn report_log(&self, line: &str);
    fn report_status(&self, text: &str);
    /// 0..=100 as reported by the tool; no smoothing or clamping.
    fn report_progress(&self, percent: f64);
    fn report_error(&self, message: &str);
    fn report_success(&self, message: &str);

    /// Non-fatal conditions (missing merge tool, output not located, ...).
    fn report_warning(&self, message: &str) {
        self.report_log(&format!("WARNING: {message}"));
    }

    fn prompt_yes_no(&self, question: &str) -> bool;
}

/// Forwards every report as a `DownloadEvent` over a channel so the
/// foreground can render them on its own schedule.
///
/// Questions cannot round-trip through the channel; they are answered with
/// `default_answer`.
#[derive(Debug, Clone)]
pub struct ChannelPresenter {
    tx: mpsc::UnboundedSender<DownloadEvent>,
    default_answer: bool,
}

impl ChannelPresenter {
    pub fn new(default_answer: bool) -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, default_answer }, rx)
    }

    fn send(&self, event: DownloadEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("Presenter channel closed, dropping event");
        }
    }
}

impl Presenter for ChannelPresenter {
    fn report_log(&self, line: &str) {
        self.send(DownloadEvent::Log {
            line: line.to_string(),
        });
    }

    fn report_status(&self, text: &str) {
        self.send(DownloadEvent::Status {
            text: text.to_string(),
        });
    }

    fn report_progress(&self, percent: f64) {
        self.send(DownloadEvent::Progress { percent });
    }

    fn report_error(&self, message: &str) {
        self.send(DownloadEvent::Error {
            message: message.to_string(),
        });
    }

    fn report_success(&self, message: &str) {
        self.send(DownloadEvent::Success {
            message: message.to_string(),
        });
    }

    fn report_warning(&self, message: &str) {
        self.send(DownloadEvent::Warning {
            message: message.to_string(),
        });
    }

    fn prompt_yes_no(&self, question: &str) -> bool {
        log::info!(
            "Unattended question {:?}, answering {}",
            question,
            self.default_answer
        );
        self.default_answer
    }
}

/// Dispatch a buffered event to a presenter. Lets a foreground loop replay
/// what a `ChannelPresenter` captured on the worker.
pub fn deliver(presenter: &dyn Presenter, event: &DownloadEvent) {
    match event {
        DownloadEvent::Log { line } => presenter.report_log(line),
        DownloadEvent::Status { text } => presenter.report_status(text),
        DownloadEvent::Progress { percent } => presenter.report_progress(*percent),
        DownloadEvent::Warning { message } => presenter.report_warning(message),
        DownloadEvent::Error { message } => presenter.report_error(message),
        DownloadEvent::Success { message } => presenter.report_success(message),
    }
}
