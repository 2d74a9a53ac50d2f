use axum::{
    Router,
    extract::{Path, State},
    http::{
        HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::application::{error::HttpError, render::TokenGateway};

use super::{
    health,
    middleware::{log_responses, set_request_context},
};

#[derive(Clone)]
pub struct PublicState {
    pub tokens: TokenGateway,
}

/// Router for the public listener. It only serves token-gated document
/// source to external compilers.
pub fn build_public_router(state: PublicState) -> Router {
    Router::new()
        .route("/content/{token}", get(serve_content))
        .route("/_health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn serve_content(State(state): State<PublicState>, Path(token): Path<String>) -> Response {
    match state.tokens.resolve(&token).await {
        Some(source) => {
            let mut response = source.into_response();
            let headers = response.headers_mut();
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
            response
        }
        None => HttpError::new(
            "infra::http::public::serve_content",
            StatusCode::NOT_FOUND,
            "Not found",
            "content token unknown or expired",
        )
        .into_response(),
    }
}
