use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::types::{ActorId, SubjectId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogRecord {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub payload_text: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A compiled version of a document: the source that was compiled and the
/// artifact it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: Uuid,
    pub subject_id: SubjectId,
    pub actor_id: ActorId,
    pub source_snapshot: String,
    pub artifact_path: PathBuf,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
