//! Typed lifecycle notifications for render jobs.

use quire_api_types::{
    RENDER_FINISHED_EVENT, RENDER_STARTED_EVENT, RenderFinishedEvent, RenderStartedEvent,
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::types::SubjectId;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    Started(RenderStartedEvent),
    Finished(RenderFinishedEvent),
}

impl RenderEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            RenderEvent::Started(_) => RENDER_STARTED_EVENT,
            RenderEvent::Finished(_) => RENDER_FINISHED_EVENT,
        }
    }

    pub fn subject_id(&self) -> SubjectId {
        match self {
            RenderEvent::Started(event) => SubjectId::new(event.subject_id),
            RenderEvent::Finished(event) => SubjectId::new(event.subject_id),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            RenderEvent::Started(event) => serde_json::to_string(event),
            RenderEvent::Finished(event) => serde_json::to_string(event),
        }
    }

    pub fn as_finished(&self) -> Option<&RenderFinishedEvent> {
        match self {
            RenderEvent::Finished(event) => Some(event),
            RenderEvent::Started(_) => None,
        }
    }
}

/// Fan-out bus for [`RenderEvent`]s. Emitting with no subscribers is not an
/// error; subscribers only see events sent after they subscribed.
#[derive(Debug, Clone)]
pub struct RenderEvents {
    sender: broadcast::Sender<RenderEvent>,
}

impl RenderEvents {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RenderEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: RenderEvent) {
        let name = event.name();
        let subject_id = event.subject_id();
        let delivered = self.sender.send(event).unwrap_or(0);
        debug!(
            target = "application::render::events",
            event = name,
            subject_id = %subject_id,
            delivered,
            "render event emitted"
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RenderEvents {
    fn default() -> Self {
        Self::new()
    }
}
