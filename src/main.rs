use std::{process, sync::Arc, time::Duration};

use quire::{
    application::{
        audit::AuditService,
        error::AppError,
        render::{
            ArtifactStore, Backend, EngineRunner, HttpNetworkCompiler, InFlightRenders,
            InProcessEngine, JobRunner, JobRunnerParts, NetworkBackend, RenderEvents, StartRender,
            StrategySelector, TokenGateway, WorkspaceManager,
        },
        repos::{AuditRepo, DocumentsRepo},
    },
    config,
    domain::types::{ActorId, SubjectId},
    infra::{
        documents::FsDocumentStore,
        error::InfraError,
        http::{self, AdminState, PublicState},
        telemetry,
    },
};
use tokio::{net::TcpListener, sync::watch, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match cli_args.command_or_default() {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, *args).await,
    }
}

struct ApplicationContext {
    runner: JobRunner,
    tokens: TokenGateway,
    documents: Arc<dyn DocumentsRepo>,
}

fn build_application_context(settings: &config::Settings) -> Result<ApplicationContext, AppError> {
    let store = Arc::new(
        FsDocumentStore::new(settings.documents.root.clone())
            .map_err(|err| AppError::from(InfraError::from(err)))?,
    );
    let documents: Arc<dyn DocumentsRepo> = store.clone();
    let audit_repo: Arc<dyn AuditRepo> = store;

    let locks = InFlightRenders::new();
    let tokens = TokenGateway::new(
        locks.clone(),
        documents.clone(),
        settings.render.public_base_url.clone(),
    );

    let mut selector = StrategySelector::new(
        InProcessEngine::unavailable(),
        settings.render.allow_external_fallback,
    );
    if let Some(binary) = settings.render.engine_binary.as_ref() {
        selector = selector.with_fallback(Backend::LocalProcess(EngineRunner::new(binary.clone())));
    }
    if let Some(base) = settings.render.external_compiler_base_url.as_ref() {
        let compiler = HttpNetworkCompiler::new(base.clone()).map_err(|err| {
            AppError::from(InfraError::configuration(format!(
                "failed to build external compiler client: {err}"
            )))
        })?;
        selector = selector.with_fallback(Backend::Network(NetworkBackend::new(
            Arc::new(compiler),
            tokens.clone(),
        )));
    }

    let workspaces = WorkspaceManager::new(settings.render.scratch_dir.clone())
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let artifacts = ArtifactStore::new(settings.render.artifact_dir.clone())
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        allow_external_fallback = selector.allows_external_fallback(),
        fallbacks = ?selector.fallback_strategies(),
        "render strategies configured"
    );

    let runner = JobRunner::new(JobRunnerParts {
        locks,
        workspaces,
        selector,
        artifacts,
        documents: documents.clone(),
        audit: AuditService::new(audit_repo),
        events: RenderEvents::new(),
        default_timeout: settings.render.render_timeout,
    });

    Ok(ApplicationContext {
        runner,
        tokens,
        documents,
    })
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings)?;
    let sweeper = app
        .tokens
        .spawn_sweeper(settings.render.token_sweep_interval);

    let public_router = http::build_public_router(PublicState {
        tokens: app.tokens.clone(),
    });
    let admin_router = http::build_admin_router(AdminState {
        runner: app.runner.clone(),
        tokens: app.tokens.clone(),
        documents: app.documents.clone(),
        token_ttl: settings.render.render_timeout,
    });

    let public_listener = TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        public_addr = %settings.server.public_addr,
        admin_addr = %settings.server.admin_addr,
        "listeners bound"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
        }
    });

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(shutdown_requested(shutdown_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown_requested(shutdown_rx.clone()));

    let servers = async { try_join!(public_server, admin_server) };
    let drain_deadline = drain_deadline(shutdown_rx, settings.server.graceful_shutdown);

    tokio::select! {
        result = servers => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        () = drain_deadline => {
            warn!(
                grace_secs = settings.server.graceful_shutdown.as_secs(),
                "graceful shutdown deadline elapsed; dropping open connections"
            );
        }
    }

    sweeper.abort();
    info!("quire shut down");
    Ok(())
}

async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Sender gone without a signal: keep serving.
            std::future::pending::<()>().await;
        }
    }
}

async fn drain_deadline(rx: watch::Receiver<bool>, grace: Duration) {
    shutdown_requested(rx).await;
    tokio::time::sleep(grace).await;
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let subject_id = SubjectId::new(args.subject_id);
    let requested_by = ActorId::parse(args.requester).map_err(AppError::from)?;

    let mut request = StartRender::new(subject_id, requested_by);
    if let Some(path) = args.source.as_ref() {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| AppError::from(InfraError::from(err)))?;
        request = request.with_source(source);
    }
    if let Some(timeout) = args.timeout {
        request = request.with_timeout(timeout);
    }

    let app = build_application_context(&settings)?;

    // The external compiler pulls the source back through the public listener.
    let content_server = if settings.render.allow_external_fallback
        && settings.render.external_compiler_base_url.is_some()
    {
        let listener = TcpListener::bind(settings.server.public_addr)
            .await
            .map_err(|err| AppError::from(InfraError::from(err)))?;
        let router = http::build_public_router(PublicState {
            tokens: app.tokens.clone(),
        });
        Some(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router.into_make_service()).await {
                error!(error = %err, "content server stopped");
            }
        }))
    } else {
        None
    };

    let handle = app
        .runner
        .start(request)
        .map_err(|err| AppError::validation(err.to_string()))?;
    let job = handle.wait().await;

    if let Some(server) = content_server {
        server.abort();
    }

    match (job.is_success(), job.artifact_path.as_ref()) {
        (true, Some(path)) => {
            info!(
                subject_id = %job.subject_id,
                strategy = ?job.strategy,
                artifact_path = %path.display(),
                "render succeeded"
            );
            println!("{}", path.display());
            Ok(())
        }
        _ => Err(AppError::unexpected(format!(
            "render of subject {} {}: {}",
            job.subject_id,
            job.state,
            job.error.as_deref().unwrap_or("no error reported")
        ))),
    }
}
