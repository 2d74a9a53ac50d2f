use std::{convert::Infallible, sync::Arc, time::Duration};

use async_stream::stream;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use quire_api_types::{
    IssueTokenRequest, IssuedTokenResponse, RenderLockStatus, TriggerRenderRequest,
    TriggerRenderResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, warn};

use crate::{
    application::{
        error::HttpError,
        render::{JobRunner, StartRender, TokenError, TokenGateway, parse_timeout_ms},
        repos::DocumentsRepo,
    },
    domain::types::{ActorId, SubjectId},
};

use super::{
    health,
    middleware::{log_responses, set_request_context},
    repo_error_to_http,
};

#[derive(Clone)]
pub struct AdminState {
    pub runner: JobRunner,
    pub tokens: TokenGateway,
    pub documents: Arc<dyn DocumentsRepo>,
    /// Lifetime of tokens issued through `POST /tokens`.
    pub token_ttl: Duration,
}

/// Router for the administrative listener: render triggers, lock status,
/// lifecycle events and pull-render token issuance.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/renders", post(trigger_render))
        .route("/renders/events", get(render_events))
        .route("/renders/{subject_id}", get(render_status))
        .route("/tokens", post(issue_token))
        .route("/_health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

fn parse_actor(source: &'static str, value: String) -> Result<ActorId, HttpError> {
    ActorId::parse(value).map_err(|err| {
        HttpError::from_error(source, StatusCode::BAD_REQUEST, "Invalid requester", &err)
    })
}

async fn trigger_render(
    State(state): State<AdminState>,
    Json(request): Json<TriggerRenderRequest>,
) -> Result<Response, HttpError> {
    const SOURCE: &str = "infra::http::admin::trigger_render";

    let subject_id = SubjectId::new(request.subject_id);
    let requested_by = parse_actor(SOURCE, request.requester_id)?;

    let timeout = request
        .timeout_ms
        .map(parse_timeout_ms)
        .transpose()
        .map_err(|err| {
            HttpError::from_error(SOURCE, StatusCode::BAD_REQUEST, "Invalid timeout", &err)
        })?;

    let source_text = match request.source_text {
        Some(source) => source,
        None => state
            .documents
            .get_source(subject_id)
            .await
            .map_err(|err| repo_error_to_http(SOURCE, err))?,
    };

    let mut start = StartRender::new(subject_id, requested_by).with_source(source_text);
    if let Some(timeout) = timeout {
        start = start.with_timeout(timeout);
    }

    let response = match state.runner.start(start) {
        Ok(_) => (StatusCode::ACCEPTED, Json(TriggerRenderResponse::accepted())).into_response(),
        Err(err) => (
            StatusCode::CONFLICT,
            Json(TriggerRenderResponse::from(err)),
        )
            .into_response(),
    };
    Ok(response)
}

async fn render_status(
    State(state): State<AdminState>,
    Path(subject_id): Path<u64>,
) -> Json<RenderLockStatus> {
    Json(RenderLockStatus {
        subject_id,
        locked: state.runner.locks().is_locked(SubjectId::new(subject_id)),
    })
}

async fn render_events(State(state): State<AdminState>) -> impl IntoResponse {
    let mut receiver = state.runner.events().subscribe();

    let events = stream! {
        loop {
            match receiver.recv().await {
                Ok(event) => match event.to_json() {
                    Ok(data) => {
                        yield Ok::<Event, Infallible>(Event::default().event(event.name()).data(data));
                    }
                    Err(err) => error!(
                        target = "infra::http::admin",
                        error = %err,
                        "failed to encode render event"
                    ),
                },
                Err(RecvError::Lagged(skipped)) => warn!(
                    target = "infra::http::admin",
                    skipped,
                    "render event subscriber lagged"
                ),
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn issue_token(
    State(state): State<AdminState>,
    Json(request): Json<IssueTokenRequest>,
) -> Result<Response, HttpError> {
    const SOURCE: &str = "infra::http::admin::issue_token";

    let subject_id = SubjectId::new(request.subject_id);
    let requester = parse_actor(SOURCE, request.requester_id)?;

    match state.tokens.issue(subject_id, &requester, state.token_ttl) {
        Ok(issued) => Ok((
            StatusCode::CREATED,
            Json(IssuedTokenResponse {
                token: issued.token,
                url: issued.url.to_string(),
                expires_at: issued.expires_at,
            }),
        )
            .into_response()),
        Err(err @ (TokenError::LockConflict { .. } | TokenError::AlreadyIssued { .. })) => Err(
            HttpError::from_error(SOURCE, StatusCode::CONFLICT, "Render already in progress", &err),
        ),
        Err(err) => Err(HttpError::from_error(
            SOURCE,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Token could not be issued",
            &err,
        )),
    }
}
