use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::types::RenderStrategy;

use super::{
    embedded::InProcessEngine,
    engine::EngineRunner,
    network::NetworkBackend,
    types::{Artifact, CompileRequest, RenderAttempt, RenderError},
};

/// One way of turning a workspace into a PDF.
#[derive(Clone)]
pub enum Backend {
    InProcess(InProcessEngine),
    LocalProcess(EngineRunner),
    Network(NetworkBackend),
}

impl Backend {
    pub fn strategy(&self) -> RenderStrategy {
        match self {
            Backend::InProcess(_) => RenderStrategy::InProcess,
            Backend::LocalProcess(_) => RenderStrategy::LocalProcess,
            Backend::Network(_) => RenderStrategy::Network,
        }
    }

    async fn compile(
        &self,
        request: &CompileRequest<'_>,
        timeout: Duration,
    ) -> Result<Artifact, RenderError> {
        let artifact = match self {
            Backend::InProcess(engine) => engine.run(request.source_text, timeout).await?,
            Backend::LocalProcess(runner) => runner.run(request.workspace, timeout).await?,
            Backend::Network(network) => network.run(request, timeout).await?,
        };
        if artifact.bytes.is_empty() {
            return Err(RenderError::failure(
                format!("{} backend returned an empty artifact", self.strategy()),
                artifact.log,
            ));
        }
        Ok(artifact)
    }
}

/// Picks the backend for a render: the in-process engine first, then the
/// configured fallbacks in order when external fallback is allowed.
#[derive(Clone)]
pub struct StrategySelector {
    primary: InProcessEngine,
    fallbacks: Vec<Backend>,
    allow_external_fallback: bool,
}

impl StrategySelector {
    pub fn new(primary: InProcessEngine, allow_external_fallback: bool) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
            allow_external_fallback,
        }
    }

    /// Append a fallback. Fallbacks are tried in insertion order.
    pub fn with_fallback(mut self, backend: Backend) -> Self {
        self.fallbacks.push(backend);
        self
    }

    pub fn allows_external_fallback(&self) -> bool {
        self.allow_external_fallback
    }

    pub fn fallback_strategies(&self) -> Vec<RenderStrategy> {
        self.fallbacks.iter().map(Backend::strategy).collect()
    }

    pub async fn render(&self, request: &CompileRequest<'_>, timeout: Duration) -> RenderAttempt {
        let primary = Backend::InProcess(self.primary.clone());
        let first = primary.compile(request, timeout).await;

        let primary_error = match first {
            Ok(artifact) => {
                return RenderAttempt {
                    strategy: RenderStrategy::InProcess,
                    result: Ok(artifact),
                };
            }
            Err(err) => err,
        };

        if !self.allow_external_fallback || self.fallbacks.is_empty() {
            debug!(
                target = "application::render::strategy",
                subject_id = %request.subject_id,
                allow_external_fallback = self.allow_external_fallback,
                error_kind = primary_error.kind(),
                "in-process render failed without fallback"
            );
            return RenderAttempt {
                strategy: RenderStrategy::InProcess,
                result: Err(primary_error),
            };
        }

        info!(
            target = "application::render::strategy",
            subject_id = %request.subject_id,
            error_kind = primary_error.kind(),
            "in-process render failed; trying fallbacks"
        );

        let mut last = RenderAttempt {
            strategy: RenderStrategy::InProcess,
            result: Err(primary_error),
        };
        for backend in &self.fallbacks {
            let strategy = backend.strategy();
            let result = backend.compile(request, timeout).await;
            if let Err(err) = &result {
                warn!(
                    target = "application::render::strategy",
                    subject_id = %request.subject_id,
                    strategy = %strategy,
                    error_kind = err.kind(),
                    "fallback render failed"
                );
            }
            let succeeded = result.is_ok();
            last = RenderAttempt { strategy, result };
            if succeeded {
                break;
            }
        }
        last
    }
}
