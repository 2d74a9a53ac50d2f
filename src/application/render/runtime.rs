use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::types::SubjectId;

/// Identifies one acquisition of a subject's render lock.
pub type LeaseId = Uuid;

/// Tracks subjects that currently have an in-flight render.
///
/// Each entry records the lease of the holder so that a stale guard (one
/// whose lock was already reclaimed) can never release a newer holder's lock.
#[derive(Default, Clone)]
pub struct InFlightRenders {
    subjects: Arc<DashMap<SubjectId, LeaseId>>,
}

#[derive(Debug, Error)]
pub enum InFlightError {
    #[error("render already in progress for subject {subject_id}")]
    AlreadyRunning { subject_id: SubjectId },
}

impl InFlightRenders {
    pub fn new() -> Self {
        Self {
            subjects: Arc::new(DashMap::new()),
        }
    }

    pub fn acquire(&self, subject_id: SubjectId) -> Result<RenderGuard, InFlightError> {
        use dashmap::mapref::entry::Entry;

        match self.subjects.entry(subject_id) {
            Entry::Vacant(vacant) => {
                let lease = Uuid::new_v4();
                vacant.insert(lease);
                Ok(RenderGuard {
                    subject_id,
                    lease,
                    subjects: Arc::clone(&self.subjects),
                })
            }
            Entry::Occupied(_) => Err(InFlightError::AlreadyRunning { subject_id }),
        }
    }

    pub fn try_acquire(&self, subject_id: SubjectId) -> Option<RenderGuard> {
        self.acquire(subject_id).ok()
    }

    pub fn is_locked(&self, subject_id: SubjectId) -> bool {
        self.subjects.contains_key(&subject_id)
    }

    pub fn lease_of(&self, subject_id: SubjectId) -> Option<LeaseId> {
        self.subjects.get(&subject_id).map(|entry| *entry.value())
    }

    /// Unconditionally unlock `subject_id`. Releasing an unlocked subject is a no-op.
    pub fn release(&self, subject_id: SubjectId) {
        self.subjects.remove(&subject_id);
    }

    /// Unlock `subject_id` only while it is still held under `lease`.
    pub fn release_lease(&self, subject_id: SubjectId, lease: LeaseId) -> bool {
        self.subjects
            .remove_if(&subject_id, |_, held| *held == lease)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

/// Holds a subject's render lock until dropped.
pub struct RenderGuard {
    subject_id: SubjectId,
    lease: LeaseId,
    subjects: Arc<DashMap<SubjectId, LeaseId>>,
}

impl RenderGuard {
    pub fn subject_id(&self) -> SubjectId {
        self.subject_id
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }
}

impl std::fmt::Debug for RenderGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderGuard")
            .field("subject_id", &self.subject_id)
            .field("lease", &self.lease)
            .finish()
    }
}

impl Drop for RenderGuard {
    fn drop(&mut self) {
        let lease = self.lease;
        self.subjects
            .remove_if(&self.subject_id, |_, held| *held == lease);
    }
}
