//! Durable storage for compiled PDFs.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use slug::slugify;
use thiserror::Error;
use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};
use tokio::fs;

use crate::domain::types::{ActorId, SubjectId};

const STAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");

/// Attempts at finding a free file name when two artifacts share a stamp.
const MAX_NAME_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact payload is empty")]
    EmptyPayload,
    #[error("failed to format artifact timestamp: {0}")]
    Stamp(#[from] time::error::Format),
    #[error("no free artifact name under {0}")]
    NameExhausted(PathBuf),
    #[error("artifact storage task aborted: {0}")]
    Join(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Filesystem-backed artifact storage rooted at a single directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Storage rooted at `root`, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name for an artifact: `<subject>-<UTC stamp>-<actor slug>.pdf`.
    pub fn file_name(
        subject_id: SubjectId,
        actor_label: &str,
        at: OffsetDateTime,
    ) -> Result<String, ArtifactError> {
        let stamp = at.to_offset(time::UtcOffset::UTC).format(STAMP_FORMAT)?;
        let mut actor = slugify(actor_label);
        if actor.is_empty() {
            actor.push_str("unknown");
        }
        Ok(format!("{subject_id}-{stamp}-{actor}.pdf"))
    }

    /// Write `bytes` under `<root>/<subject>/` atomically. The payload goes to
    /// a temp file in the target directory first and is then linked into
    /// place without clobbering an existing artifact.
    pub async fn persist(
        &self,
        subject_id: SubjectId,
        actor: &ActorId,
        display_name: Option<&str>,
        bytes: Bytes,
        at: OffsetDateTime,
    ) -> Result<PathBuf, ArtifactError> {
        if bytes.is_empty() {
            return Err(ArtifactError::EmptyPayload);
        }

        let dir = self.root.join(subject_id.to_string());
        fs::create_dir_all(&dir).await?;
        let name = Self::file_name(subject_id, display_name.unwrap_or(actor.as_str()), at)?;

        tokio::task::spawn_blocking(move || write_noclobber(&dir, &name, &bytes))
            .await
            .map_err(|err| ArtifactError::Join(err.to_string()))?
    }

    /// Remove a previously persisted artifact. Missing files are ignored.
    pub async fn discard(&self, path: &Path) -> Result<(), io::Error> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn write_noclobber(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, ArtifactError> {
    let mut temp = tempfile::Builder::new()
        .prefix(".partial-")
        .suffix(".pdf")
        .tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;

    let stem = name.trim_end_matches(".pdf");
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 0 {
            dir.join(name)
        } else {
            dir.join(format!("{stem}-{}.pdf", attempt + 1))
        };
        match temp.persist_noclobber(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => temp = err.file,
            Err(err) => return Err(ArtifactError::Io(err.error)),
        }
    }
    Err(ArtifactError::NameExhausted(dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::macros::datetime;

    #[test]
    fn file_name_uses_utc_stamp_and_actor_slug() {
        let name = ArtifactStore::file_name(
            SubjectId::new(42),
            "Ada Lovelace",
            datetime!(2026-10-19 10:04:05 +2),
        )
        .expect("name");
        assert_eq!(name, "42-20261019T080405Z-ada-lovelace.pdf");
    }

    #[test]
    fn blank_actor_label_falls_back() {
        let name =
            ArtifactStore::file_name(SubjectId::new(1), "!!!", datetime!(2026-01-02 03:04:05 UTC))
                .expect("name");
        assert_eq!(name, "1-20260102T030405Z-unknown.pdf");
    }

    #[tokio::test]
    async fn persist_writes_under_subject_directory_without_partials() {
        let dir = TempDir::new().expect("temp dir");
        let store = ArtifactStore::new(dir.path().join("artifacts")).expect("store");
        let actor = ActorId::parse("u-7").expect("actor");
        let at = datetime!(2026-10-19 08:00:00 UTC);

        let first = store
            .persist(SubjectId::new(9), &actor, None, Bytes::from_static(b"%PDF-a"), at)
            .await
            .expect("first");
        let second = store
            .persist(SubjectId::new(9), &actor, None, Bytes::from_static(b"%PDF-b"), at)
            .await
            .expect("second");

        assert_eq!(
            first,
            dir.path().join("artifacts/9/9-20261019T080000Z-u-7.pdf")
        );
        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).expect("read"), b"%PDF-a");

        let names: Vec<_> = std::fs::read_dir(dir.path().join("artifacts/9"))
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().into_string().expect("utf8"))
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|name| !name.starts_with(".partial-")));
    }

    #[tokio::test]
    async fn discard_tolerates_missing_files() {
        let dir = TempDir::new().expect("temp dir");
        let store = ArtifactStore::new(dir.path().to_path_buf()).expect("store");
        store
            .discard(&dir.path().join("missing.pdf"))
            .await
            .expect("discard");
    }

    #[tokio::test]
    async fn empty_payload_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let store = ArtifactStore::new(dir.path().to_path_buf()).expect("store");
        let actor = ActorId::parse("u").expect("actor");
        let err = store
            .persist(
                SubjectId::new(1),
                &actor,
                None,
                Bytes::new(),
                OffsetDateTime::now_utc(),
            )
            .await
            .expect_err("empty");
        assert!(matches!(err, ArtifactError::EmptyPayload));
    }
}
