//! Filesystem-backed document store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<subject>/main.tex        current source
//! <root>/<subject>/assets/...      binary assets (any depth)
//! <root>/<subject>/versions.jsonl  compiled versions, one JSON object per line
//! <root>/audit.jsonl               audit log
//! <root>/actors.json               {"<actor id>": "<display name>"}
//! ```

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

use crate::{
    application::repos::{AuditRepo, DocumentsRepo, RepoError},
    domain::{
        entities::{AuditLogRecord, VersionRecord},
        types::{ActorId, SubjectId},
    },
};

const SOURCE_FILE: &str = "main.tex";
const ASSETS_DIR: &str = "assets";
const VERSIONS_FILE: &str = "versions.jsonl";
const AUDIT_FILE: &str = "audit.jsonl";
const ACTORS_FILE: &str = "actors.json";

#[derive(Debug)]
pub struct FsDocumentStore {
    root: PathBuf,
    appends: Mutex<()>,
}

impl FsDocumentStore {
    /// Store rooted at `root`, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            appends: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn subject_dir(&self, subject_id: SubjectId) -> PathBuf {
        self.root.join(subject_id.to_string())
    }

    /// Replace the stored source of `subject_id`.
    pub async fn put_source(&self, subject_id: SubjectId, source: &str) -> Result<(), RepoError> {
        let dir = self.subject_dir(subject_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(RepoError::from_persistence)?;
        fs::write(dir.join(SOURCE_FILE), source)
            .await
            .map_err(RepoError::from_persistence)
    }

    async fn append_line<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), RepoError> {
        let mut line = serde_json::to_vec(value).map_err(RepoError::from_persistence)?;
        line.push(b'\n');

        let _guard = self.appends.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(RepoError::from_persistence)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(RepoError::from_persistence)?;
        file.write_all(&line)
            .await
            .map_err(RepoError::from_persistence)?;
        file.flush().await.map_err(RepoError::from_persistence)
    }
}

#[async_trait]
impl DocumentsRepo for FsDocumentStore {
    async fn get_source(&self, subject_id: SubjectId) -> Result<String, RepoError> {
        match fs::read_to_string(self.subject_dir(subject_id).join(SOURCE_FILE)).await {
            Ok(source) => Ok(source),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(RepoError::NotFound),
            Err(err) => Err(RepoError::from_persistence(err)),
        }
    }

    async fn list_assets(&self, subject_id: SubjectId) -> Result<Vec<PathBuf>, RepoError> {
        let mut pending = vec![self.subject_dir(subject_id).join(ASSETS_DIR)];
        let mut files = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(RepoError::from_persistence(err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(RepoError::from_persistence)?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(RepoError::from_persistence)?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    files.push(entry.path());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn record_version(&self, record: VersionRecord) -> Result<(), RepoError> {
        let path = self.subject_dir(record.subject_id).join(VERSIONS_FILE);
        self.append_line(&path, &record).await
    }

    async fn actor_display_name(&self, actor_id: &ActorId) -> Result<Option<String>, RepoError> {
        let raw = match fs::read(self.root.join(ACTORS_FILE)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(RepoError::from_persistence(err)),
        };
        let actors: HashMap<String, String> = serde_json::from_slice(&raw).map_err(|err| {
            RepoError::InvalidInput {
                message: format!("{ACTORS_FILE} is malformed: {err}"),
            }
        })?;
        Ok(actors.get(actor_id.as_str()).cloned())
    }
}

#[async_trait]
impl AuditRepo for FsDocumentStore {
    async fn append_log(&self, record: AuditLogRecord) -> Result<(), RepoError> {
        let path = self.root.join(AUDIT_FILE);
        self.append_line(&path, &record).await
    }
}
