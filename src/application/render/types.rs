use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::domain::types::{ActorId, RenderStrategy, SubjectId};

use super::workspace::Workspace;

/// Longest compiler log tail carried into a failure message.
const LOG_EXCERPT_CHARS: usize = 2000;

/// Longest compile deadline accepted from configuration or a caller.
pub const MAX_RENDER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimeoutError {
    #[error("timeout must be greater than zero")]
    Zero,
    #[error("timeout must not exceed {max_ms} ms")]
    TooLong { max_ms: u64 },
}

/// Validate a deadline given in milliseconds.
pub fn parse_timeout_ms(millis: u64) -> Result<Duration, TimeoutError> {
    let timeout = Duration::from_millis(millis);
    if timeout.is_zero() {
        return Err(TimeoutError::Zero);
    }
    if timeout > MAX_RENDER_TIMEOUT {
        return Err(TimeoutError::TooLong {
            max_ms: MAX_RENDER_TIMEOUT.as_millis() as u64,
        });
    }
    Ok(timeout)
}

/// Input handed to every backend.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub subject_id: SubjectId,
    pub requested_by: &'a ActorId,
    pub source_text: &'a str,
    pub workspace: &'a Workspace,
}

/// Successful compile output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Bytes,
    /// Compiler log when the backend produced one.
    pub log: Option<String>,
}

impl Artifact {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            log: None,
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }
}

/// Structured errors surfaced by the render backends. These are folded into a
/// single human-readable string before they reach observers.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("{reason}")]
    EngineUnavailable { reason: String },
    #[error("engine timed out")]
    EngineTimeout { log: Option<String> },
    #[error("{message}")]
    EngineFailure {
        message: String,
        log: Option<String>,
    },
    #[error("{message}")]
    NetworkFailure { message: String },
    #[error("external compiler returned a non-PDF body: {excerpt}")]
    InvalidUpstreamResponse { excerpt: String },
    #[error("workspace preparation failed: {message}")]
    Workspace { message: String },
    #[error("artifact persistence failed: {message}")]
    Persistence { message: String },
}

impl RenderError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::EngineUnavailable {
            reason: reason.into(),
        }
    }

    pub fn failure(message: impl Into<String>, log: Option<String>) -> Self {
        Self::EngineFailure {
            message: message.into(),
            log,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkFailure {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Stable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::EngineUnavailable { .. } => "EngineUnavailable",
            RenderError::EngineTimeout { .. } => "EngineTimeout",
            RenderError::EngineFailure { .. } => "EngineFailure",
            RenderError::NetworkFailure { .. } => "NetworkFailure",
            RenderError::InvalidUpstreamResponse { .. } => "InvalidUpstreamResponse",
            RenderError::Workspace { .. } => "WorkspaceFailure",
            RenderError::Persistence { .. } => "PersistenceFailure",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RenderError::EngineTimeout { .. })
    }

    pub fn log(&self) -> Option<&str> {
        match self {
            RenderError::EngineTimeout { log } | RenderError::EngineFailure { log, .. } => {
                log.as_deref()
            }
            _ => None,
        }
    }

    /// Message reported in the `finished` event: `<kind>: <detail>` followed
    /// by the tail of the compiler log when one was captured.
    pub fn summary(&self) -> String {
        let mut summary = format!("{}: {}", self.kind(), self);
        if let Some(log) = self.log().map(str::trim).filter(|log| !log.is_empty()) {
            summary.push_str("\n--- compiler log ---\n");
            summary.push_str(log_tail(log, LOG_EXCERPT_CHARS));
        }
        summary
    }
}

/// Outcome of the strategy selector: which backend was last attempted and
/// what it produced.
#[derive(Debug, Clone)]
pub struct RenderAttempt {
    pub strategy: RenderStrategy,
    pub result: Result<Artifact, RenderError>,
}

fn log_tail(log: &str, max_chars: usize) -> &str {
    let total = log.chars().count();
    if total <= max_chars {
        return log;
    }
    let skip = total - max_chars;
    match log.char_indices().nth(skip) {
        Some((offset, _)) => &log[offset..],
        None => log,
    }
}
