//! In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use quire::{
    application::{
        audit::AuditService,
        render::{
            ArtifactStore, Backend, EmbeddedCompileError, EmbeddedCompiler, InFlightRenders,
            InProcessEngine, JobRunner, JobRunnerParts, NetworkBackend, NetworkCompiler,
            RenderEvent, RenderEvents, StrategySelector, TokenGateway, WorkspaceManager,
        },
        repos::{AuditRepo, DocumentsRepo, RepoError},
    },
    domain::{
        entities::{AuditLogRecord, VersionRecord},
        types::{ActorId, SubjectId},
    },
};
use quire_api_types::RenderFinishedEvent;
use tempfile::TempDir;
use tokio::sync::broadcast;
use url::Url;

pub const PDF_BYTES: &[u8] = b"%PDF-1.7\n%fake\n";

#[derive(Default)]
pub struct MemoryDocuments {
    sources: Mutex<HashMap<SubjectId, String>>,
    names: Mutex<HashMap<String, String>>,
    versions: Mutex<Vec<VersionRecord>>,
    audit: Mutex<Vec<AuditLogRecord>>,
    panic_on_list: AtomicBool,
    panic_on_names: AtomicBool,
    fail_versions: AtomicBool,
}

impl MemoryDocuments {
    pub fn with_source(self, subject_id: u64, source: &str) -> Self {
        self.sources
            .lock()
            .expect("sources lock")
            .insert(SubjectId::new(subject_id), source.to_string());
        self
    }

    pub fn with_display_name(self, actor: &str, name: &str) -> Self {
        self.names
            .lock()
            .expect("names lock")
            .insert(actor.to_string(), name.to_string());
        self
    }

    pub fn panicking_on_list(self) -> Self {
        self.panic_on_list.store(true, Ordering::SeqCst);
        self
    }

    pub fn panicking_on_names(self) -> Self {
        self.panic_on_names.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_versions(self) -> Self {
        self.fail_versions.store(true, Ordering::SeqCst);
        self
    }

    pub fn versions(&self) -> Vec<VersionRecord> {
        self.versions.lock().expect("versions lock").clone()
    }

    pub fn audit_entries(&self) -> Vec<AuditLogRecord> {
        self.audit.lock().expect("audit lock").clone()
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

    async fn list_assets(&self, subject_id: SubjectId) -> Result<Vec<PathBuf>, RepoError> {
        if self.panic_on_list.load(Ordering::SeqCst) {
            panic!("asset index corrupted for subject {subject_id}");
        }
        Ok(Vec::new())
    }

    async fn record_version(&self, record: VersionRecord) -> Result<(), RepoError> {
        if self.fail_versions.load(Ordering::SeqCst) {
            return Err(RepoError::from_persistence("version table is read-only"));
        }
        self.versions.lock().expect("versions lock").push(record);
        Ok(())
    }

    async fn actor_display_name(&self, actor_id: &ActorId) -> Result<Option<String>, RepoError> {
        if self.panic_on_names.load(Ordering::SeqCst) {
            panic!("display name index corrupted for {actor_id}");
        }
        Ok(self
            .names
            .lock()
            .expect("names lock")
            .get(actor_id.as_str())
            .cloned())
    }
}

#[async_trait]
impl AuditRepo for MemoryDocuments {
    async fn append_log(&self, record: AuditLogRecord) -> Result<(), RepoError> {
        self.audit.lock().expect("audit lock").push(record);
        Ok(())
    }
}

/// Embedded compiler returning a fixed PDF after an optional delay.
pub struct StubCompiler {
    pub delay: Duration,
}

impl EmbeddedCompiler for StubCompiler {
    fn name(&self) -> &str {
        "stub"
    }

    fn compile(&self, source_text: &str) -> Result<Vec<u8>, EmbeddedCompileError> {
        std::thread::sleep(self.delay);
        if source_text.contains("\\undefined") {
            return Err(EmbeddedCompileError::new("compile failed")
                .with_log("! Undefined control sequence."));
        }
        Ok(PDF_BYTES.to_vec())
    }
}

pub struct Harness {
    pub runner: JobRunner,
    pub tokens: TokenGateway,
    pub documents: Arc<MemoryDocuments>,
    pub scratch: TempDir,
    pub artifacts: TempDir,
}

impl Harness {
    /// Runner without an in-process engine and without fallbacks.
    pub fn without_engine(documents: MemoryDocuments) -> Self {
        Self::build(documents, |_, _| {
            StrategySelector::new(InProcessEngine::unavailable(), false)
        })
    }

    pub fn with_compiler_delay(documents: MemoryDocuments, delay: Duration) -> Self {
        Self::build(documents, |_, _| {
            StrategySelector::new(InProcessEngine::new(Arc::new(StubCompiler { delay })), false)
        })
    }

    /// Runner without an in-process engine whose only fallback is the
    /// network backend built around `compiler`.
    pub fn with_network<F>(documents: MemoryDocuments, compiler: F) -> Self
    where
        F: FnOnce(TokenGateway, InFlightRenders) -> Arc<dyn NetworkCompiler>,
    {
        Self::build(documents, |tokens, locks| {
            let backend = NetworkBackend::new(compiler(tokens.clone(), locks.clone()), tokens.clone());
            StrategySelector::new(InProcessEngine::unavailable(), true)
                .with_fallback(Backend::Network(backend))
        })
    }

    fn build<F>(documents: MemoryDocuments, selector: F) -> Self
    where
        F: FnOnce(&TokenGateway, &InFlightRenders) -> StrategySelector,
    {
        let documents = Arc::new(documents);
        let scratch = TempDir::new().expect("scratch dir");
        let artifacts = TempDir::new().expect("artifact dir");
        let locks = InFlightRenders::new();
        let documents_repo: Arc<dyn DocumentsRepo> = documents.clone();
        let audit_repo: Arc<dyn AuditRepo> = documents.clone();

        let tokens = TokenGateway::new(
            locks.clone(),
            documents_repo.clone(),
            Url::parse("http://127.0.0.1:3000/").expect("base url"),
        );

        let selector = selector(&tokens, &locks);
        let runner = JobRunner::new(JobRunnerParts {
            locks,
            workspaces: WorkspaceManager::new(scratch.path().to_path_buf())
                .expect("workspace manager"),
            selector,
            artifacts: ArtifactStore::new(artifacts.path().to_path_buf()).expect("artifact store"),
            documents: documents_repo,
            audit: AuditService::new(audit_repo),
            events: RenderEvents::new(),
            default_timeout: Duration::from_secs(5),
        });

        Self {
            runner,
            tokens,
            documents,
            scratch,
            artifacts,
        }
    }

    pub fn scratch_entries(&self) -> usize {
        count_entries(self.scratch.path())
    }

    /// Every file below the artifact root, at any depth.
    pub fn artifact_files(&self) -> Vec<PathBuf> {
        let mut pending = vec![self.artifacts.path().to_path_buf()];
        let mut files = Vec::new();
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).expect("read artifact dir") {
                let path = entry.expect("artifact entry").path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        files
    }
}

pub fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).expect("read dir").count()
}

pub fn actor(id: &str) -> ActorId {
    ActorId::parse(id).expect("actor id")
}

/// Receive events until the first `finished`, returning everything seen.
pub async fn collect_until_finished(
    rx: &mut broadcast::Receiver<RenderEvent>,
) -> (Vec<RenderEvent>, RenderFinishedEvent) {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("finished event within deadline")
            .expect("event channel open");
        let finished = event.as_finished().cloned();
        seen.push(event);
        if let Some(finished) = finished {
            return (seen, finished);
        }
    }
}
