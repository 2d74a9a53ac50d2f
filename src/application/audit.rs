use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{AuditRepo, RepoError};
use crate::domain::entities::AuditLogRecord;
use crate::domain::types::{ActorId, SubjectId};

pub const COMPILE_ACTION: &str = "compile";
const DOCUMENT_ENTITY: &str = "document";

/// Thin wrapper around the audit repository to simplify logging render actions.
#[derive(Clone)]
pub struct AuditService {
    repo: Arc<dyn AuditRepo>,
}

impl AuditService {
    pub fn new(repo: Arc<dyn AuditRepo>) -> Self {
        Self { repo }
    }

    /// Record a successful compile of `subject_id` by `actor_id`.
    pub async fn record_compile(
        &self,
        actor_id: &ActorId,
        subject_id: SubjectId,
    ) -> Result<(), RepoError> {
        let record = AuditLogRecord {
            id: Uuid::new_v4(),
            actor: actor_id.as_str().to_string(),
            action: COMPILE_ACTION.to_string(),
            entity_type: DOCUMENT_ENTITY.to_string(),
            entity_id: Some(subject_id.to_string()),
            payload_text: None,
            created_at: OffsetDateTime::now_utc(),
        };

        self.repo.append_log(record).await
    }
}
