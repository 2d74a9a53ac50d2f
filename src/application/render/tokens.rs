//! Short-lived capability tokens that let an external compiler pull a
//! document's source without data-store access.

use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use metrics::counter;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    application::repos::DocumentsRepo,
    domain::types::{ActorId, SubjectId},
};

use super::{
    runtime::{InFlightRenders, LeaseId, RenderGuard},
    types::MAX_RENDER_TIMEOUT,
};

/// Length of every issued token, in characters.
pub const TOKEN_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("render already in progress for subject {subject_id}")]
    LockConflict { subject_id: SubjectId },
    #[error("subject {subject_id} has no render in progress")]
    NotLocked { subject_id: SubjectId },
    #[error("a content token is already live for subject {subject_id}")]
    AlreadyIssued { subject_id: SubjectId },
    #[error("token lifetime of {ttl_ms} ms is out of range")]
    TtlOutOfRange { ttl_ms: u128 },
    #[error("failed to build content url: {0}")]
    Url(#[from] url::ParseError),
}

/// A freshly issued token. The raw token is only ever held by the caller.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub url: Url,
    pub expires_at: OffsetDateTime,
}

struct TokenRecord {
    subject_id: SubjectId,
    issued_by: ActorId,
    expires_at: Instant,
    lease: LeaseId,
    /// Present when the token itself owns the subject's render lock.
    _guard: Option<RenderGuard>,
}

/// Issues, resolves and expires content tokens.
///
/// Records are keyed by the SHA-256 digest of the token so the raw value
/// never sits in memory after issuance.
#[derive(Clone)]
pub struct TokenGateway {
    tokens: Arc<DashMap<String, TokenRecord>>,
    by_subject: Arc<DashMap<SubjectId, String>>,
    locks: InFlightRenders,
    documents: Arc<dyn DocumentsRepo>,
    public_base_url: Url,
}

impl TokenGateway {
    pub fn new(
        locks: InFlightRenders,
        documents: Arc<dyn DocumentsRepo>,
        public_base_url: Url,
    ) -> Self {
        Self {
            tokens: Arc::new(DashMap::new()),
            by_subject: Arc::new(DashMap::new()),
            locks,
            documents,
            public_base_url,
        }
    }

    /// Issue a token for a standalone pull render. The subject's render lock
    /// is taken and held by the token until it is purged or swept.
    pub fn issue(
        &self,
        subject_id: SubjectId,
        requester: &ActorId,
        ttl: Duration,
    ) -> Result<IssuedToken, TokenError> {
        let guard = self
            .locks
            .try_acquire(subject_id)
            .ok_or(TokenError::LockConflict { subject_id })?;
        let lease = guard.lease();
        self.insert(subject_id, requester, ttl, lease, Some(guard))
    }

    /// Issue a token on behalf of a job that already holds the subject's lock.
    pub fn issue_for_job(
        &self,
        subject_id: SubjectId,
        requester: &ActorId,
        ttl: Duration,
    ) -> Result<IssuedToken, TokenError> {
        let lease = self
            .locks
            .lease_of(subject_id)
            .ok_or(TokenError::NotLocked { subject_id })?;
        self.insert(subject_id, requester, ttl, lease, None)
    }

    fn insert(
        &self,
        subject_id: SubjectId,
        requester: &ActorId,
        ttl: Duration,
        lease: LeaseId,
        guard: Option<RenderGuard>,
    ) -> Result<IssuedToken, TokenError> {
        let now = Instant::now();
        let out_of_range = || TokenError::TtlOutOfRange {
            ttl_ms: ttl.as_millis(),
        };
        if ttl > MAX_RENDER_TIMEOUT {
            return Err(out_of_range());
        }
        let expires_at = now.checked_add(ttl).ok_or_else(out_of_range)?;
        let expires_at_utc = time::Duration::try_from(ttl)
            .ok()
            .and_then(|ttl| OffsetDateTime::now_utc().checked_add(ttl))
            .ok_or_else(out_of_range)?;

        let token = generate_token();
        let digest = digest(&token);
        let url = self.content_url(&token)?;

        match self.by_subject.entry(subject_id) {
            Entry::Occupied(mut occupied) => {
                let live = self
                    .tokens
                    .get(occupied.get())
                    .is_some_and(|record| now < record.expires_at);
                if live {
                    return Err(TokenError::AlreadyIssued { subject_id });
                }
                let previous = occupied.insert(digest.clone());
                self.tokens.remove(&previous);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(digest.clone());
            }
        }

        self.tokens.insert(
            digest,
            TokenRecord {
                subject_id,
                issued_by: requester.clone(),
                expires_at,
                lease,
                _guard: guard,
            },
        );

        debug!(
            target = "application::render::tokens",
            subject_id = %subject_id,
            issued_by = %requester,
            ttl_ms = ttl.as_millis() as u64,
            "content token issued"
        );

        Ok(IssuedToken {
            token,
            url,
            expires_at: expires_at_utc,
        })
    }

    /// Current source text of the token's subject, or `None` when the token
    /// is unknown or expired.
    pub async fn resolve(&self, token: &str) -> Option<String> {
        if token.len() != TOKEN_LEN {
            return None;
        }

        let subject_id = {
            let record = self.tokens.get(&digest(token))?;
            if Instant::now() >= record.expires_at {
                return None;
            }
            record.subject_id
        };

        match self.documents.get_source(subject_id).await {
            Ok(source) => Some(source),
            Err(err) => {
                warn!(
                    target = "application::render::tokens",
                    subject_id = %subject_id,
                    error = %err,
                    "failed to load source for content token"
                );
                None
            }
        }
    }

    /// Drop every token issued for `subject_id`.
    pub fn purge_subject(&self, subject_id: SubjectId) {
        if let Some((_, digest)) = self.by_subject.remove(&subject_id) {
            self.tokens.remove(&digest);
        }
        self.tokens
            .retain(|_, record| record.subject_id != subject_id);
    }

    /// Remove expired tokens and release the lock lease each one was issued
    /// under. Returns the number of tokens removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .tokens
            .iter()
            .filter(|entry| now >= entry.value().expires_at)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for digest in expired {
            let Some((_, record)) = self
                .tokens
                .remove_if(&digest, |_, record| now >= record.expires_at)
            else {
                continue;
            };
            self.by_subject
                .remove_if(&record.subject_id, |_, current| *current == digest);
            self.locks.release_lease(record.subject_id, record.lease);
            debug!(
                target = "application::render::tokens",
                subject_id = %record.subject_id,
                issued_by = %record.issued_by,
                "expired content token swept"
            );
            removed += 1;
        }

        if removed > 0 {
            counter!("quire_tokens_swept_total").increment(removed as u64);
            info!(
                target = "application::render::tokens",
                swept = removed,
                "expired content tokens removed"
            );
        }
        removed
    }

    /// Run [`TokenGateway::sweep`] every `interval` until the handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip the first immediate tick
            loop {
                ticker.tick().await;
                gateway.sweep();
            }
        })
    }

    pub fn live_tokens(&self) -> usize {
        self.tokens.len()
    }

    fn content_url(&self, token: &str) -> Result<Url, TokenError> {
        let mut url = self.public_base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push("content")
            .push(token);
        Ok(url)
    }
}

fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        application::repos::RepoError,
        domain::entities::VersionRecord,
    };
    use async_trait::async_trait;
    use std::{collections::HashMap, path::PathBuf, sync::Mutex};

    #[derive(Default)]
    struct MemoryDocuments {
        sources: Mutex<HashMap<SubjectId, String>>,
    }

    impl MemoryDocuments {
        fn with_source(subject_id: u64, source: &str) -> Arc<Self> {
            let docs = Self::default();
            docs.set(subject_id, source);
            Arc::new(docs)
        }

        fn set(&self, subject_id: u64, source: &str) {
            self.sources
                .lock()
                .expect("sources lock")
                .insert(SubjectId::new(subject_id), source.to_string());
        }
    }

    #[async_trait]
    impl DocumentsRepo for MemoryDocuments {
        async fn get_source(&self, subject_id: SubjectId) -> Result<String, RepoError> {
            self.sources
                .lock()
                .expect("sources lock")
                .get(&subject_id)
                .cloned()
                .ok_or(RepoError::NotFound)
        }

        async fn list_assets(&self, _subject_id: SubjectId) -> Result<Vec<PathBuf>, RepoError> {
            Ok(Vec::new())
        }

        async fn record_version(&self, _record: VersionRecord) -> Result<(), RepoError> {
            Ok(())
        }

        async fn actor_display_name(
            &self,
            _actor_id: &ActorId,
        ) -> Result<Option<String>, RepoError> {
            Ok(None)
        }
    }

    fn gateway(docs: Arc<MemoryDocuments>) -> (TokenGateway, InFlightRenders) {
        let locks = InFlightRenders::new();
        let url = Url::parse("https://render.example.edu/quire").expect("url");
        (TokenGateway::new(locks.clone(), docs, url), locks)
    }

    fn alice() -> ActorId {
        ActorId::parse("alice").expect("actor")
    }

    #[tokio::test(start_paused = true)]
    async fn token_resolves_until_its_deadline() {
        let (gateway, _locks) = gateway(MemoryDocuments::with_source(42, "\\section{A}"));
        let issued = gateway
            .issue(SubjectId::new(42), &alice(), Duration::from_millis(5000))
            .expect("issue");

        tokio::time::advance(Duration::from_millis(4999)).await;
        assert_eq!(
            gateway.resolve(&issued.token).await.as_deref(),
            Some("\\section{A}")
        );

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(gateway.resolve(&issued.token).await, None);
    }

    #[tokio::test]
    async fn url_embeds_only_the_token() {
        let (gateway, _locks) = gateway(MemoryDocuments::with_source(4242, "x"));
        let issued = gateway
            .issue(SubjectId::new(4242), &alice(), Duration::from_secs(5))
            .expect("issue");

        assert_eq!(issued.token.len(), TOKEN_LEN);
        assert!(issued.token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            issued.url.as_str(),
            format!("https://render.example.edu/quire/content/{}", issued.token)
        );
        assert!(!issued.url.as_str().contains("4242"));
    }

    #[tokio::test]
    async fn resolve_reads_live_source() {
        let docs = MemoryDocuments::with_source(1, "draft one");
        let (gateway, _locks) = gateway(Arc::clone(&docs));
        let issued = gateway
            .issue(SubjectId::new(1), &alice(), Duration::from_secs(5))
            .expect("issue");

        docs.set(1, "draft two");
        assert_eq!(
            gateway.resolve(&issued.token).await.as_deref(),
            Some("draft two")
        );
    }

    #[tokio::test]
    async fn unknown_tokens_resolve_to_nothing() {
        let (gateway, _locks) = gateway(MemoryDocuments::with_source(1, "x"));
        assert_eq!(gateway.resolve("nope").await, None);
        assert_eq!(gateway.resolve(&"0".repeat(TOKEN_LEN)).await, None);
    }

    #[tokio::test]
    async fn issue_is_rejected_for_locked_subject() {
        let (gateway, locks) = gateway(MemoryDocuments::with_source(3, "x"));
        let _guard = locks.acquire(SubjectId::new(3)).expect("lock");

        let err = gateway
            .issue(SubjectId::new(3), &alice(), Duration::from_secs(5))
            .expect_err("locked");
        assert!(matches!(err, TokenError::LockConflict { .. }));
        assert_eq!(gateway.live_tokens(), 0);
    }

    #[tokio::test]
    async fn oversized_ttl_is_rejected_without_holding_the_lock() {
        let (gateway, locks) = gateway(MemoryDocuments::with_source(10, "x"));

        let err = gateway
            .issue(SubjectId::new(10), &alice(), Duration::from_millis(u64::MAX))
            .expect_err("ttl out of range");
        assert!(matches!(err, TokenError::TtlOutOfRange { .. }));
        assert!(!locks.is_locked(SubjectId::new(10)));
        assert_eq!(gateway.live_tokens(), 0);

        let _guard = locks.try_acquire(SubjectId::new(10)).expect("lock");
        let err = gateway
            .issue_for_job(SubjectId::new(10), &alice(), MAX_RENDER_TIMEOUT + Duration::from_millis(1))
            .expect_err("ttl out of range");
        assert!(matches!(err, TokenError::TtlOutOfRange { .. }));
        assert_eq!(gateway.live_tokens(), 0);
    }

    #[tokio::test]
    async fn issued_token_holds_the_render_lock_until_purged() {
        let (gateway, locks) = gateway(MemoryDocuments::with_source(8, "x"));
        gateway
            .issue(SubjectId::new(8), &alice(), Duration::from_secs(5))
            .expect("issue");
        assert!(locks.is_locked(SubjectId::new(8)));

        gateway.purge_subject(SubjectId::new(8));
        assert!(!locks.is_locked(SubjectId::new(8)));
        assert_eq!(gateway.live_tokens(), 0);
    }

    #[tokio::test]
    async fn job_tokens_require_lock_and_are_single_per_subject() {
        let (gateway, locks) = gateway(MemoryDocuments::with_source(5, "x"));
        let err = gateway
            .issue_for_job(SubjectId::new(5), &alice(), Duration::from_secs(5))
            .expect_err("not locked");
        assert!(matches!(err, TokenError::NotLocked { .. }));

        let _guard = locks.acquire(SubjectId::new(5)).expect("lock");
        gateway
            .issue_for_job(SubjectId::new(5), &alice(), Duration::from_secs(5))
            .expect("first token");
        let err = gateway
            .issue_for_job(SubjectId::new(5), &alice(), Duration::from_secs(5))
            .expect_err("second token");
        assert!(matches!(err, TokenError::AlreadyIssued { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_tokens_and_reclaims_lock() {
        let (gateway, locks) = gateway(MemoryDocuments::with_source(6, "x"));
        let _job_guard = locks.acquire(SubjectId::new(6)).expect("lock");
        let issued = gateway
            .issue_for_job(SubjectId::new(6), &alice(), Duration::from_millis(100))
            .expect("issue");

        assert_eq!(gateway.sweep(), 0);
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(gateway.sweep(), 1);

        assert!(!locks.is_locked(SubjectId::new(6)));
        assert_eq!(gateway.resolve(&issued.token).await, None);
        assert_eq!(gateway.live_tokens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_runs_on_interval() {
        let (gateway, locks) = gateway(MemoryDocuments::with_source(9, "x"));
        gateway
            .issue(SubjectId::new(9), &alice(), Duration::from_millis(1000))
            .expect("issue");
        let sweeper = gateway.spawn_sweeper(Duration::from_millis(5000));

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(gateway.live_tokens(), 0);
        assert!(!locks.is_locked(SubjectId::new(9)));
        sweeper.abort();
    }
}
