//! Render orchestration: turns stored LaTeX sources into PDF artifacts.
//!
//! A render is accepted synchronously by [`JobRunner::start`], which takes the
//! subject's lock and spawns a detached task. The task prepares a workspace,
//! lets the [`StrategySelector`] pick a backend, persists the artifact and
//! reports the outcome on the [`RenderEvents`] bus.

mod artifacts;
mod embedded;
mod engine;
mod events;
mod jobs;
mod network;
mod runtime;
mod strategy;
mod tokens;
mod types;
mod workspace;

pub use artifacts::{ArtifactError, ArtifactStore};
pub use embedded::{EmbeddedCompileError, EmbeddedCompiler, InProcessEngine};
pub use engine::{DEFAULT_ENGINE_BINARY, EngineRunner};
pub use events::{RenderEvent, RenderEvents};
pub use jobs::{JobRunner, JobRunnerParts, RenderHandle, RenderJob, StartError, StartRender};
pub use network::{HttpNetworkCompiler, NetworkBackend, NetworkCompiler, PDF_SIGNATURE, validate_pdf};
pub use runtime::{InFlightError, InFlightRenders, LeaseId, RenderGuard};
pub use strategy::{Backend, StrategySelector};
pub use tokens::{IssuedToken, TOKEN_LEN, TokenError, TokenGateway};
pub use types::{
    Artifact, CompileRequest, MAX_RENDER_TIMEOUT, RenderAttempt, RenderError, TimeoutError,
    parse_timeout_ms,
};
pub use workspace::{
    LOG_FILE_NAME, OUTPUT_FILE_NAME, SOURCE_FILE_NAME, Workspace, WorkspaceError,
    WorkspaceManager,
};
