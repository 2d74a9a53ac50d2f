//! Detached render jobs: lock, compile, persist, notify.

use std::{
    any::Any,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, gauge, histogram};
use quire_api_types::{RenderFinishedEvent, RenderStartedEvent, TriggerRenderResponse};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    application::{audit::AuditService, repos::DocumentsRepo},
    domain::{
        entities::VersionRecord,
        types::{ActorId, JobState, RenderStrategy, SubjectId},
    },
};

use super::{
    artifacts::ArtifactStore,
    events::{RenderEvent, RenderEvents},
    runtime::{InFlightRenders, RenderGuard},
    strategy::StrategySelector,
    types::{Artifact, CompileRequest, RenderError},
    workspace::WorkspaceManager,
};

#[derive(Debug, Error)]
pub enum StartError {
    #[error("render already in progress for subject {subject_id}")]
    LockConflict { subject_id: SubjectId },
}

impl From<StartError> for TriggerRenderResponse {
    fn from(err: StartError) -> Self {
        TriggerRenderResponse::rejected(err.to_string())
    }
}

/// Parameters of a single render request.
#[derive(Debug, Clone)]
pub struct StartRender {
    pub subject_id: SubjectId,
    pub requested_by: ActorId,
    /// Source to compile; the stored source is loaded when absent.
    pub source_text: Option<String>,
    /// Compile deadline; the runner default applies when absent.
    pub timeout: Option<Duration>,
    /// Compile in this directory instead of a fresh workspace. It must already
    /// contain `main.tex` and is never removed.
    pub workspace_dir: Option<PathBuf>,
}

impl StartRender {
    pub fn new(subject_id: SubjectId, requested_by: ActorId) -> Self {
        Self {
            subject_id,
            requested_by,
            source_text: None,
            timeout: None,
            workspace_dir: None,
        }
    }

    pub fn with_source(mut self, source_text: impl Into<String>) -> Self {
        self.source_text = Some(source_text.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_workspace_dir(mut self, dir: PathBuf) -> Self {
        self.workspace_dir = Some(dir);
        self
    }
}

/// In-memory record of one render, mutated only by the task running it.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub subject_id: SubjectId,
    pub requested_by: ActorId,
    pub strategy: Option<RenderStrategy>,
    pub state: JobState,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub artifact_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl RenderJob {
    fn new(subject_id: SubjectId, requested_by: ActorId) -> Self {
        Self {
            subject_id,
            requested_by,
            strategy: None,
            state: JobState::Locked,
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
            artifact_path: None,
            error: None,
        }
    }

    fn begin(&mut self) {
        debug_assert_eq!(self.state, JobState::Locked);
        self.state = JobState::Running;
    }

    fn succeed(&mut self, strategy: Option<RenderStrategy>, artifact_path: PathBuf) {
        debug_assert!(!self.state.is_terminal());
        self.strategy = strategy;
        self.state = JobState::Succeeded;
        self.artifact_path = Some(artifact_path);
        self.finished_at = Some(OffsetDateTime::now_utc());
    }

    fn fail(&mut self, strategy: Option<RenderStrategy>, err: &RenderError) {
        let state = if err.is_timeout() {
            JobState::TimedOut
        } else {
            JobState::Failed
        };
        self.strategy = strategy;
        self.conclude_with_error(state, err.summary());
    }

    fn conclude_with_error(&mut self, state: JobState, message: String) {
        debug_assert!(!self.state.is_terminal());
        self.state = state;
        self.error = Some(message);
        self.finished_at = Some(OffsetDateTime::now_utc());
    }

    pub fn is_success(&self) -> bool {
        self.state == JobState::Succeeded
    }

    fn started_event(&self) -> RenderEvent {
        RenderEvent::Started(RenderStartedEvent {
            subject_id: self.subject_id.get(),
            started_at: self.started_at,
            started_by: self.requested_by.to_string(),
        })
    }

    fn finished_event(&self) -> RenderEvent {
        RenderEvent::Finished(RenderFinishedEvent {
            subject_id: self.subject_id.get(),
            success: self.is_success(),
            artifact_path: self
                .artifact_path
                .as_ref()
                .map(|path| path.display().to_string()),
            error: self.error.clone(),
            finished_at: self.finished_at.unwrap_or_else(OffsetDateTime::now_utc),
            started_by: self.requested_by.to_string(),
        })
    }
}

/// Handle on an accepted render. Dropping it does not cancel the job.
#[derive(Debug)]
pub struct RenderHandle {
    subject_id: SubjectId,
    requested_by: ActorId,
    join: JoinHandle<RenderJob>,
}

impl RenderHandle {
    pub fn subject_id(&self) -> SubjectId {
        self.subject_id
    }

    /// Wait for the job to conclude and return its final record.
    pub async fn wait(self) -> RenderJob {
        match self.join.await {
            Ok(job) => job,
            Err(err) => {
                let mut job = RenderJob::new(self.subject_id, self.requested_by);
                job.conclude_with_error(
                    JobState::Failed,
                    format!("render supervisor aborted: {err}"),
                );
                job
            }
        }
    }
}

/// Collaborators a [`JobRunner`] is assembled from.
pub struct JobRunnerParts {
    pub locks: InFlightRenders,
    pub workspaces: WorkspaceManager,
    pub selector: StrategySelector,
    pub artifacts: ArtifactStore,
    pub documents: Arc<dyn DocumentsRepo>,
    pub audit: AuditService,
    pub events: RenderEvents,
    pub default_timeout: Duration,
}

/// Accepts render requests and runs each one as a detached task.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<JobRunnerParts>,
}

impl JobRunner {
    pub fn new(parts: JobRunnerParts) -> Self {
        Self {
            inner: Arc::new(parts),
        }
    }

    pub fn events(&self) -> &RenderEvents {
        &self.inner.events
    }

    pub fn locks(&self) -> &InFlightRenders {
        &self.inner.locks
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Accept a render for `request.subject_id`.
    ///
    /// Returns once the subject's lock is held, `started` has been emitted
    /// and the job task is spawned; compilation happens in the background.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, request: StartRender) -> Result<RenderHandle, StartError> {
        let subject_id = request.subject_id;
        let Some(guard) = self.inner.locks.try_acquire(subject_id) else {
            counter!("quire_render_rejected_total").increment(1);
            info!(
                target = "application::render::jobs",
                op = "jobs::start",
                result = "rejected",
                subject_id = %subject_id,
                requested_by = %request.requested_by,
                "render rejected: subject locked"
            );
            return Err(StartError::LockConflict { subject_id });
        };

        let job = RenderJob::new(subject_id, request.requested_by.clone());
        counter!("quire_render_started_total").increment(1);
        gauge!("quire_render_in_flight").set(self.inner.locks.len() as f64);
        self.inner.events.emit(job.started_event());
        info!(
            target = "application::render::jobs",
            op = "jobs::start",
            result = "accepted",
            subject_id = %subject_id,
            requested_by = %request.requested_by,
            "render accepted"
        );

        let requested_by = request.requested_by.clone();
        let runner = self.clone();
        let fallback = job.clone();
        let task = tokio::spawn(runner.clone().execute(job, guard, request));
        let join = tokio::spawn(async move { runner.supervise(task, fallback).await });

        Ok(RenderHandle {
            subject_id,
            requested_by,
            join,
        })
    }

    async fn supervise(&self, task: JoinHandle<RenderJob>, mut job: RenderJob) -> RenderJob {
        match task.await {
            Ok(job) => job,
            Err(err) => {
                let message = format!("render task panicked: {}", join_error_message(err));
                error!(
                    target = "application::render::jobs",
                    op = "jobs::supervise",
                    result = "panic",
                    subject_id = %job.subject_id,
                    error = %message,
                    "render task crashed"
                );
                job.conclude_with_error(JobState::Failed, message);
                self.report(&job, None);
                job
            }
        }
    }

    async fn execute(self, mut job: RenderJob, guard: RenderGuard, request: StartRender) -> RenderJob {
        let started = Instant::now();
        job.begin();

        let timeout = request.timeout.unwrap_or(self.inner.default_timeout);
        let (strategy, outcome) = self.compile_and_persist(&job, request, timeout).await;
        drop(guard);
        gauge!("quire_render_in_flight").set(self.inner.locks.len() as f64);

        match outcome {
            Ok(path) => job.succeed(strategy, path),
            Err(err) => job.fail(strategy, &err),
        }
        self.report(&job, Some(started.elapsed()));
        job
    }

    /// Runs every step that touches the filesystem. The workspace is cleaned
    /// up before this returns, whatever the outcome.
    async fn compile_and_persist(
        &self,
        job: &RenderJob,
        request: StartRender,
        timeout: Duration,
    ) -> (Option<RenderStrategy>, Result<PathBuf, RenderError>) {
        let subject_id = job.subject_id;
        let source = match request.source_text {
            Some(source) => source,
            None => match self.inner.documents.get_source(subject_id).await {
                Ok(source) => source,
                Err(err) => {
                    return (
                        None,
                        Err(RenderError::persistence(format!("failed to load source: {err}"))),
                    );
                }
            },
        };

        let assets = if request.workspace_dir.is_some() {
            Vec::new()
        } else {
            match self.inner.documents.list_assets(subject_id).await {
                Ok(assets) => assets,
                Err(err) => {
                    return (
                        None,
                        Err(RenderError::persistence(format!("failed to list assets: {err}"))),
                    );
                }
            }
        };

        let workspace = match self
            .inner
            .workspaces
            .prepare(subject_id, &source, &assets, request.workspace_dir)
            .await
        {
            Ok(workspace) => workspace,
            Err(err) => {
                return (
                    None,
                    Err(RenderError::Workspace {
                        message: err.to_string(),
                    }),
                );
            }
        };

        let attempt = self
            .inner
            .selector
            .render(
                &CompileRequest {
                    subject_id,
                    requested_by: &job.requested_by,
                    source_text: &source,
                    workspace: &workspace,
                },
                timeout,
            )
            .await;

        let outcome = match attempt.result {
            Ok(artifact) => self.persist(job, artifact, source).await,
            Err(err) => Err(err),
        };

        self.inner.workspaces.cleanup(workspace).await;
        (Some(attempt.strategy), outcome)
    }

    async fn persist(
        &self,
        job: &RenderJob,
        artifact: Artifact,
        source: String,
    ) -> Result<PathBuf, RenderError> {
        let display_name = match self
            .inner
            .documents
            .actor_display_name(&job.requested_by)
            .await
        {
            Ok(name) => name,
            Err(err) => {
                warn!(
                    target = "application::render::jobs",
                    subject_id = %job.subject_id,
                    error = %err,
                    "failed to resolve actor display name"
                );
                None
            }
        };

        let created_at = OffsetDateTime::now_utc();
        let path = self
            .inner
            .artifacts
            .persist(
                job.subject_id,
                &job.requested_by,
                display_name.as_deref(),
                artifact.bytes,
                created_at,
            )
            .await
            .map_err(|err| RenderError::persistence(err.to_string()))?;

        let version = VersionRecord {
            id: Uuid::new_v4(),
            subject_id: job.subject_id,
            actor_id: job.requested_by.clone(),
            source_snapshot: source,
            artifact_path: path.clone(),
            created_at,
        };
        if let Err(err) = self.inner.documents.record_version(version).await {
            if let Err(discard_err) = self.inner.artifacts.discard(&path).await {
                warn!(
                    target = "application::render::jobs",
                    path = %path.display(),
                    error = %discard_err,
                    "failed to discard orphaned artifact"
                );
            }
            return Err(RenderError::persistence(format!(
                "failed to record version: {err}"
            )));
        }

        if let Err(err) = self
            .inner
            .audit
            .record_compile(&job.requested_by, job.subject_id)
            .await
        {
            warn!(
                target = "application::render::jobs",
                subject_id = %job.subject_id,
                error = %err,
                "failed to append compile audit entry"
            );
        }

        Ok(path)
    }

    fn report(&self, job: &RenderJob, elapsed: Option<Duration>) {
        let result = job.state.as_str();
        counter!("quire_render_finished_total", "result" => result).increment(1);
        if let Some(elapsed) = elapsed {
            histogram!("quire_render_duration_ms").record(elapsed.as_millis() as f64);
        }

        if job.is_success() {
            info!(
                target = "application::render::jobs",
                op = "jobs::execute",
                result = "success",
                subject_id = %job.subject_id,
                strategy = job.strategy.map(RenderStrategy::as_str).unwrap_or("none"),
                elapsed_ms = elapsed.map(|value| value.as_millis() as u64),
                "render finished"
            );
        } else {
            warn!(
                target = "application::render::jobs",
                op = "jobs::execute",
                result = "error",
                state = result,
                subject_id = %job.subject_id,
                strategy = job.strategy.map(RenderStrategy::as_str).unwrap_or("none"),
                elapsed_ms = elapsed.map(|value| value.as_millis() as u64),
                error = job.error.as_deref().unwrap_or_default(),
                "render failed"
            );
        }

        self.inner.events.emit(job.finished_event());
    }
}

fn join_error_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task was cancelled".to_string();
    }
    panic_message(err.into_panic())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
