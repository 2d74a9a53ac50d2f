//! Ephemeral per-render directories.

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::domain::types::SubjectId;

pub const SOURCE_FILE_NAME: &str = "main.tex";
pub const OUTPUT_FILE_NAME: &str = "main.pdf";
pub const LOG_FILE_NAME: &str = "main.log";

/// Binary asset types copied into a workspace. Matching is case-insensitive.
const ASSET_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "pdf", "eps", "svg", "bmp", "tif", "tiff", "webp",
];

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to allocate workspace under {root}: {source}")]
    Allocate {
        root: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("supplied workspace {0} does not contain main.tex")]
    MissingSource(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A directory a single render compiles in.
///
/// Directories allocated by [`WorkspaceManager::prepare`] are owned and get
/// removed on [`WorkspaceManager::cleanup`] or drop. Caller-supplied
/// directories are never removed.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    owned: Option<TempDir>,
    assets: Vec<PathBuf>,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_path(&self) -> PathBuf {
        self.root.join(SOURCE_FILE_NAME)
    }

    pub fn output_path(&self) -> PathBuf {
        self.root.join(OUTPUT_FILE_NAME)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE_NAME)
    }

    pub fn is_owned(&self) -> bool {
        self.owned.is_some()
    }

    /// Assets materialized into the workspace, as workspace paths.
    pub fn assets(&self) -> &[PathBuf] {
        &self.assets
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    scratch_root: PathBuf,
}

impl WorkspaceManager {
    /// Manager allocating workspaces under `scratch_root`, creating it if necessary.
    pub fn new(scratch_root: PathBuf) -> Result<Self, io::Error> {
        std::fs::create_dir_all(&scratch_root)?;
        Ok(Self { scratch_root })
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Build the environment for one render.
    ///
    /// With `supplied` set, that directory is used as-is: nothing is written
    /// into it and it must already contain the source file.
    pub async fn prepare(
        &self,
        subject_id: SubjectId,
        source_text: &str,
        assets: &[PathBuf],
        supplied: Option<PathBuf>,
    ) -> Result<Workspace, WorkspaceError> {
        if let Some(root) = supplied {
            return adopt(root).await;
        }

        let dir = tempfile::Builder::new()
            .prefix(&format!("quire-{subject_id}-"))
            .tempdir_in(&self.scratch_root)
            .map_err(|source| WorkspaceError::Allocate {
                root: self.scratch_root.clone(),
                source,
            })?;
        let root = dir.path().to_path_buf();

        fs::write(root.join(SOURCE_FILE_NAME), source_text).await?;

        let mut copied = Vec::new();
        let mut names = HashSet::new();
        for asset in assets.iter().filter(|path| is_allowed_asset(path)) {
            let Some(name) = asset.file_name() else {
                continue;
            };
            // Flattening keeps the first asset listed under each file name.
            if !names.insert(name.to_os_string()) {
                warn!(
                    target = "application::render::workspace",
                    subject_id = %subject_id,
                    asset = %asset.display(),
                    "skipping asset with duplicate file name"
                );
                continue;
            }
            let target = root.join(name);
            fs::copy(asset, &target).await?;
            copied.push(target);
        }

        debug!(
            target = "application::render::workspace",
            subject_id = %subject_id,
            root = %root.display(),
            assets = copied.len(),
            skipped = assets.len() - copied.len(),
            "workspace prepared"
        );

        Ok(Workspace {
            root,
            owned: Some(dir),
            assets: copied,
        })
    }

    /// Remove a workspace this manager created. Failures are logged, never raised.
    pub async fn cleanup(&self, workspace: Workspace) {
        let Workspace { root, owned, .. } = workspace;
        let Some(dir) = owned else {
            debug!(
                target = "application::render::workspace",
                root = %root.display(),
                "leaving caller-supplied workspace in place"
            );
            return;
        };

        let result = tokio::task::spawn_blocking(move || dir.close()).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                target = "application::render::workspace",
                root = %root.display(),
                error = %err,
                "failed to remove workspace"
            ),
            Err(err) => warn!(
                target = "application::render::workspace",
                root = %root.display(),
                error = %err,
                "workspace cleanup task aborted"
            ),
        }
    }
}

async fn adopt(root: PathBuf) -> Result<Workspace, WorkspaceError> {
    match fs::metadata(root.join(SOURCE_FILE_NAME)).await {
        Ok(meta) if meta.is_file() => Ok(Workspace {
            root,
            owned: None,
            assets: Vec::new(),
        }),
        Ok(_) => Err(WorkspaceError::MissingSource(root)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(WorkspaceError::MissingSource(root))
        }
        Err(err) => Err(WorkspaceError::Io(err)),
    }
}

fn is_allowed_asset(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ASSET_EXTENSIONS
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}
