mod admin;
mod middleware;
mod public;

pub use admin::{AdminState, build_admin_router};
pub use public::{PublicState, build_public_router};

use axum::http::StatusCode;

use crate::application::error::HttpError;
use crate::application::repos::RepoError;

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Map a repository error to a consistent HTTP error response.
pub fn repo_error_to_http(source: &'static str, err: RepoError) -> HttpError {
    match err {
        RepoError::NotFound => HttpError::new(
            source,
            StatusCode::NOT_FOUND,
            "Resource not found",
            "resource not found",
        ),
        RepoError::InvalidInput { message } => {
            HttpError::new(source, StatusCode::BAD_REQUEST, "Invalid input", message)
        }
        RepoError::Persistence(message) => HttpError::new(
            source,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Persistence error",
            message,
        ),
    }
}
