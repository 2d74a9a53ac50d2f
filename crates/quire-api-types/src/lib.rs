//! Wire types shared between the quire server and its clients.
//!
//! Everything here is plain data: identifiers travel as primitives so that
//! consumers do not need the server crate to talk to it.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Body of `POST /renders`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRenderRequest {
    pub subject_id: u64,
    pub requester_id: String,
    /// Source to compile. When omitted the server reads the stored source.
    #[serde(default)]
    pub source_text: Option<String>,
    /// Hard deadline for the compile. Defaults to the server setting.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Synchronous acknowledgment of a trigger request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRenderResponse {
    pub started: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TriggerRenderResponse {
    pub fn accepted() -> Self {
        Self {
            started: true,
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            started: false,
            message: Some(message.into()),
        }
    }
}

/// Body of `GET /renders/{subject_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderLockStatus {
    pub subject_id: u64,
    pub locked: bool,
}

/// Body of `POST /tokens`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueTokenRequest {
    pub subject_id: u64,
    pub requester_id: String,
}

/// A freshly issued content token. The URL embeds only the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedTokenResponse {
    pub token: String,
    pub url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Payload of the `render:started` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderStartedEvent {
    pub subject_id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub started_by: String,
}

/// Payload of the `render:finished` event. Exactly one of `artifact_path`
/// and `error` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderFinishedEvent {
    pub subject_id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub started_by: String,
}

pub const RENDER_STARTED_EVENT: &str = "render:started";
pub const RENDER_FINISHED_EVENT: &str = "render:finished";

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn finished_event_omits_absent_outcome_fields() {
        let event = RenderFinishedEvent {
            subject_id: 42,
            success: false,
            artifact_path: None,
            error: Some("EngineUnavailable: no in-process engine available".into()),
            finished_at: datetime!(2026-10-19 12:00:00 UTC),
            started_by: "alice".into(),
        };

        let json = serde_json::to_value(&event).expect("serialize event");
        assert!(json.get("artifact_path").is_none());
        assert_eq!(json["finished_at"], "2026-10-19T12:00:00Z");
        assert_eq!(json["subject_id"], 42);
    }

    #[test]
    fn trigger_request_defaults_optional_fields() {
        let request: TriggerRenderRequest =
            serde_json::from_str(r#"{"subject_id": 7, "requester_id": "bob"}"#)
                .expect("parse request");
        assert_eq!(request.source_text, None);
        assert_eq!(request.timeout_ms, None);
    }
}
