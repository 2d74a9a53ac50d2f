//! Repository traits describing the external collaborators the render
//! pipeline consumes.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::{AuditLogRecord, VersionRecord};
use crate::domain::types::{ActorId, SubjectId};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Read/write surface of the document store used by renders.
#[async_trait]
pub trait DocumentsRepo: Send + Sync {
    /// Current LaTeX source of the subject.
    async fn get_source(&self, subject_id: SubjectId) -> Result<String, RepoError>;

    /// Absolute paths of every file in the subject's asset store. Callers
    /// filter for the types they accept.
    async fn list_assets(&self, subject_id: SubjectId) -> Result<Vec<PathBuf>, RepoError>;

    /// Persist a compiled version pointing at its artifact.
    async fn record_version(&self, record: VersionRecord) -> Result<(), RepoError>;

    /// Human-readable name of an actor, when one is known.
    async fn actor_display_name(&self, actor_id: &ActorId) -> Result<Option<String>, RepoError>;
}

#[async_trait]
pub trait AuditRepo: Send + Sync {
    async fn append_log(&self, record: AuditLogRecord) -> Result<(), RepoError>;
}
