//! Verbosity-gated diagnostics written to runas's own stdout
//!
//! - quiet: nothing
//! - normal: the final summary only
//! - debug: settings header, one line per lifecycle step, and the summary
//!
//! Every line is flushed as soon as it is written so the header is on the
//! stream before the child's relayed output.
//!
//! Lines are written as given. Text from outside runas (OS error reasons,
//! command lines) goes through [`DiagnosticsReporter::scrub`] first.

use std::io::Write;

use chrono::{DateTime, Local};

use crate::args_parser::LogLevel;
use crate::secret::scrub_secret;

/// How an event is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Multi-line settings block, rendered as is
    Header,
    /// Lifecycle step, rendered with a timestamp
    Step,
    /// Terminal success or failure line
    Summary,
}

/// One diagnostic message
#[derive(Debug, Clone)]
pub struct DiagnosticEvent {
    /// Lowest log level at which the event is shown
    pub level: LogLevel,
    pub kind: EventKind,
    pub message: String,
    pub timestamp: DateTime<Local>,
}

impl DiagnosticEvent {
    pub fn new(level: LogLevel, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            level,
            kind,
            message: message.into(),
            timestamp: Local::now(),
        }
    }

    pub fn header(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, EventKind::Header, message)
    }

    pub fn step(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, EventKind::Step, message)
    }

    pub fn summary(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Normal, EventKind::Summary, message)
    }

    fn render(&self) -> String {
        match self.kind {
            EventKind::Step => format!(
                "[{}] {}",
                self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                self.message
            ),
            EventKind::Header | EventKind::Summary => self.message.clone(),
        }
    }
}

/// Writes diagnostic events to a sink, gated by log level
pub struct DiagnosticsReporter<W: Write> {
    level: LogLevel,
    sink: W,
    secrets: Vec<String>,
}

impl<W: Write> DiagnosticsReporter<W> {
    pub fn new(level: LogLevel, sink: W) -> Self {
        Self {
            level,
            sink,
            secrets: Vec::new(),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    /// Register a secret for [`scrub`](Self::scrub)
    pub fn redact(&mut self, secret: &str) {
        if !secret.is_empty() && !self.secrets.iter().any(|s| s == secret) {
            self.secrets.push(secret.to_string());
        }
    }

    /// Hide every registered secret in untrusted text
    pub fn scrub(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |text, secret| scrub_secret(&text, secret))
    }

    /// Whether an event of this level would be written
    pub fn is_enabled(&self, level: LogLevel) -> bool {
        self.level != LogLevel::Quiet && level <= self.level
    }

    pub fn report(&mut self, event: DiagnosticEvent) {
        if !self.is_enabled(event.level) {
            return;
        }

        let text = event.render();
        tracing::debug!(target: "runas::diagnostics", kind = ?event.kind, "{}", text);

        // Diagnostics must not change the outcome of the run
        let _ = writeln!(self.sink, "{}", text);
        let _ = self.sink.flush();
    }

    pub fn header(&mut self, text: impl Into<String>) {
        self.report(DiagnosticEvent::header(text));
    }

    pub fn step(&mut self, text: impl Into<String>) {
        self.report(DiagnosticEvent::step(text));
    }

    pub fn summary(&mut self, text: impl Into<String>) {
        self.report(DiagnosticEvent::summary(text));
    }

    /// Direct access to the sink, for text that is not a diagnostic
    pub fn sink_mut(&mut self) -> &mut W {
        &mut self.sink
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}
