use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{info, warn};

use super::types::{Artifact, RenderError};

/// An embedded LaTeX compiler linked into the process.
///
/// Implementations are called from a blocking thread and may take as long as
/// they need; the adapter enforces the deadline.
pub trait EmbeddedCompiler: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn compile(&self, source_text: &str) -> Result<Vec<u8>, EmbeddedCompileError>;
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EmbeddedCompileError {
    pub message: String,
    pub log: Option<String>,
}

impl EmbeddedCompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            log: None,
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }
}

/// Adapter around an optional [`EmbeddedCompiler`]. Availability is decided
/// once, at construction.
#[derive(Clone, Default)]
pub struct InProcessEngine {
    compiler: Option<Arc<dyn EmbeddedCompiler>>,
}

impl InProcessEngine {
    pub fn new(compiler: Arc<dyn EmbeddedCompiler>) -> Self {
        Self {
            compiler: Some(compiler),
        }
    }

    pub fn unavailable() -> Self {
        Self { compiler: None }
    }

    pub fn is_available(&self) -> bool {
        self.compiler.is_some()
    }

    pub async fn run(&self, source_text: &str, timeout: Duration) -> Result<Artifact, RenderError> {
        let Some(compiler) = self.compiler.clone() else {
            return Err(RenderError::unavailable("no in-process engine available"));
        };

        let name = compiler.name().to_string();
        let source = source_text.to_owned();
        let task = tokio::task::spawn_blocking(move || compiler.compile(&source));

        // A timed-out compile keeps its blocking thread until it returns; its
        // result is discarded.
        let result = match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                warn!(
                    target = "application::render::embedded",
                    engine = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "in-process engine timed out"
                );
                return Err(RenderError::EngineTimeout { log: None });
            }
            Ok(Err(join_err)) => {
                warn!(
                    target = "application::render::embedded",
                    engine = %name,
                    error = %join_err,
                    "in-process engine aborted"
                );
                return Err(RenderError::failure(
                    format!("in-process engine `{name}` aborted: {join_err}"),
                    None,
                ));
            }
            Ok(Ok(result)) => result,
        };

        match result {
            Ok(bytes) if bytes.is_empty() => Err(RenderError::failure(
                format!("in-process engine `{name}` returned an empty artifact"),
                None,
            )),
            Ok(bytes) => {
                info!(
                    target = "application::render::embedded",
                    engine = %name,
                    pdf_bytes = bytes.len(),
                    "in-process engine produced artifact"
                );
                Ok(Artifact::new(bytes))
            }
            Err(err) => Err(RenderError::failure(err.message, err.log)),
        }
    }
}
