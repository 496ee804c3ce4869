//! Pipeline progress reporting.
//!
//! Every component reports what it is doing through a [`ProgressReporter`].
//! The reporter never blocks the pipeline and never fails it: a listener that
//! went away is dropped silently.
//!
//! | Reporter | Destination |
//! |----------|-------------|
//! | [`ChannelProgress`] | one outbound `mpsc` channel per processing run (server fan-out) |
//! | [`StderrProgress`] | human-readable lines on stderr (CLI) |
//! | [`JsonProgress`] | one JSON object per line on stderr (CLI, scripts) |
//! | [`NoProgress`] | discarded |

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Pipeline stage an event belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    Conversion,
    Vision,
    Chunking,
    Indexing,
    Retrieval,
    Generation,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::Conversion => "conversion",
            Stage::Vision => "vision",
            Stage::Chunking => "chunking",
            Stage::Indexing => "indexing",
            Stage::Retrieval => "retrieval",
            Stage::Generation => "generation",
            Stage::Complete => "complete",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

/// A single progress event. Ephemeral: forwarded, never stored.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            severity,
            details: None,
            document_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn info(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Severity::Info, message)
    }

    pub fn success(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Severity::Success, message)
    }

    pub fn warning(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Severity::Warning, message)
    }

    pub fn error(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, Severity::Error, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn for_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }
}

/// Receives progress events from the pipeline.
pub trait ProgressReporter: Send + Sync {
    /// Deliver one event, best-effort. Must not block.
    fn report(&self, event: ProgressEvent);
}

/// Pushes events onto an unbounded channel owned by the orchestration layer.
///
/// Events are tagged with the run's document id. The first failed send
/// (receiver dropped) closes the reporter; later events are discarded.
pub struct ChannelProgress {
    document_id: Option<String>,
    tx: Mutex<Option<mpsc::UnboundedSender<ProgressEvent>>>,
}

impl ChannelProgress {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            document_id: None,
            tx: Mutex::new(Some(tx)),
        }
    }

    pub fn for_document(
        document_id: impl Into<String>,
        tx: mpsc::UnboundedSender<ProgressEvent>,
    ) -> Self {
        Self {
            document_id: Some(document_id.into()),
            tx: Mutex::new(Some(tx)),
        }
    }

    /// A reporter together with the receiving half of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, mut event: ProgressEvent) {
        tracing::debug!(stage = event.stage.as_str(), message = %event.message, "progress");
        if event.document_id.is_none() {
            event.document_id = self.document_id.clone();
        }
        let Ok(mut guard) = self.tx.lock() else {
            return;
        };
        if let Some(tx) = guard.as_ref() {
            if tx.send(event).is_err() {
                tracing::debug!("progress listener disconnected, dropping channel");
                *guard = None;
            }
        }
    }
}

/// Human-friendly progress on stderr: `[vision] analyzing page 1/3`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let marker = match event.severity {
            Severity::Warning => " warning:",
            Severity::Error => " error:",
            _ => "",
        };
        let line = format!("[{}]{} {}\n", event.stage.as_str(), marker, event.message);
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
