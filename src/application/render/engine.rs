use std::{
    io::ErrorKind,
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};

use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
};
use tracing::{info, warn};

use super::{
    types::{Artifact, RenderError},
    workspace::{SOURCE_FILE_NAME, Workspace},
};

pub const DEFAULT_ENGINE_BINARY: &str = "pdflatex";

/// How long captured pipes may keep draining after the engine was killed.
/// Grandchildren that inherited the pipes can otherwise hold them open.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs a local LaTeX engine process against a workspace.
#[derive(Debug, Clone)]
pub struct EngineRunner {
    binary: PathBuf,
}

impl EngineRunner {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    pub async fn run(
        &self,
        workspace: &Workspace,
        timeout: Duration,
    ) -> Result<Artifact, RenderError> {
        let started_at = Instant::now();
        let root = workspace.root();

        let mut child = Command::new(&self.binary)
            .arg("-interaction=nonstopmode")
            .arg("-halt-on-error")
            .arg(format!("-output-directory={}", root.display()))
            .arg(SOURCE_FILE_NAME)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                warn!(
                    target = "application::render::engine",
                    op = "engine::run",
                    result = "error",
                    error_code = "spawn_engine",
                    binary = %self.binary.display(),
                    error = %err,
                    "Failed to spawn LaTeX engine"
                );
                if err.kind() == ErrorKind::NotFound {
                    RenderError::unavailable(format!(
                        "engine binary `{}` not found",
                        self.binary.display()
                    ))
                } else {
                    RenderError::failure(format!("failed to spawn engine: {err}"), None)
                }
            })?;

        let stdout = spawn_capture(child.stdout.take());
        let stderr = spawn_capture(child.stderr.take());

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(timeout) => None,
        };

        let Some(status) = status else {
            if let Err(err) = child.kill().await {
                warn!(
                    target = "application::render::engine",
                    op = "engine::run",
                    error = %err,
                    "Failed to kill timed out LaTeX engine"
                );
            }
            let captured = drain_output(stdout, stderr).await;
            warn!(
                target = "application::render::engine",
                op = "engine::run",
                result = "timeout",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                timeout_ms = timeout.as_millis() as u64,
                "LaTeX engine timed out"
            );
            return Err(RenderError::EngineTimeout {
                log: non_empty(captured),
            });
        };

        let captured = drain_output(stdout, stderr).await;
        let status = status.map_err(|err| {
            RenderError::failure(format!("failed to wait for engine: {err}"), None)
        })?;

        if status.success() {
            match fs::read(workspace.output_path()).await {
                Ok(bytes) if !bytes.is_empty() => {
                    info!(
                        target = "application::render::engine",
                        op = "engine::run",
                        result = "success",
                        elapsed_ms = started_at.elapsed().as_millis() as u64,
                        pdf_bytes = bytes.len(),
                        "LaTeX engine produced artifact"
                    );
                    let artifact = Artifact::new(bytes);
                    return Ok(match non_empty(captured) {
                        Some(log) => artifact.with_log(log),
                        None => artifact,
                    });
                }
                Ok(_) | Err(_) => {}
            }
        }

        let message = if status.success() {
            "engine produced no readable output artifact".to_string()
        } else {
            match status.code() {
                Some(code) => format!("engine exited with status {code}"),
                None => "engine terminated by signal".to_string(),
            }
        };

        let log = match fs::read(workspace.log_path()).await {
            Ok(bytes) if !bytes.is_empty() => Some(String::from_utf8_lossy(&bytes).into_owned()),
            _ => non_empty(captured),
        };

        warn!(
            target = "application::render::engine",
            op = "engine::run",
            result = "error",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            exit_code = status.code().map(i64::from).unwrap_or(-1),
            error_code = "engine_failed",
            "LaTeX engine failed"
        );

        Err(RenderError::failure(message, log))
    }
}

fn spawn_capture<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer).await;
            buffer
        })
    })
}

async fn drain_output(
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
) -> String {
    let mut combined = String::new();
    for handle in [stdout, stderr].into_iter().flatten() {
        let abort = handle.abort_handle();
        match tokio::time::timeout(PIPE_DRAIN_GRACE, handle).await {
            Ok(Ok(bytes)) => combined.push_str(&String::from_utf8_lossy(&bytes)),
            Ok(Err(_)) => {}
            Err(_) => abort.abort(),
        }
    }
    combined
}

fn non_empty(value: String) -> Option<String> {
    (!value.trim().is_empty()).then_some(value)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{application::render::workspace::WorkspaceManager, domain::types::SubjectId};
    use std::{fs, os::unix::fs::PermissionsExt, path::Path};
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("set perms");
        path
    }

    async fn workspace(dir: &TempDir) -> Workspace {
        WorkspaceManager::new(dir.path().join("scratch"))
            .expect("manager")
            .prepare(SubjectId::new(1), "\\relax", &[], None)
            .await
            .expect("workspace")
    }

    #[tokio::test]
    async fn returns_artifact_when_engine_succeeds() {
        let dir = TempDir::new().expect("temp dir");
        let args_path = dir.path().join("args.log");
        let script = write_script(
            dir.path(),
            "fake-latex",
            &format!(
                r#"#!/bin/sh
echo "$@" > "{args}"
echo "This is fake TeX"
printf '%%PDF-1.5 fake' > main.pdf
"#,
                args = args_path.display()
            ),
        );
        let workspace = workspace(&dir).await;

        let artifact = EngineRunner::new(script)
            .run(&workspace, Duration::from_secs(5))
            .await
            .expect("artifact");

        assert!(artifact.bytes.starts_with(b"%PDF"));
        assert!(artifact.log.unwrap_or_default().contains("fake TeX"));
        let args = fs::read_to_string(&args_path).expect("args");
        assert!(args.contains("-interaction=nonstopmode"), "args: {args}");
        assert!(args.contains("-halt-on-error"), "args: {args}");
        assert!(args.contains("main.tex"), "args: {args}");
    }

    #[tokio::test]
    async fn prefers_engine_log_file_on_failure() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            dir.path(),
            "fake-latex",
            r#"#!/bin/sh
echo "stdout noise"
echo "! Undefined control sequence." > main.log
exit 1
"#,
        );
        let workspace = workspace(&dir).await;

        let err = EngineRunner::new(script)
            .run(&workspace, Duration::from_secs(5))
            .await
            .expect_err("engine failure");

        match err {
            RenderError::EngineFailure { message, log } => {
                assert_eq!(message, "engine exited with status 1");
                let log = log.expect("log captured");
                assert!(log.contains("Undefined control sequence"), "log: {log}");
                assert!(!log.contains("stdout noise"), "log: {log}");
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_exit_without_artifact_is_failure() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            dir.path(),
            "fake-latex",
            "#!/bin/sh\necho \"nothing written\" >&2\n",
        );
        let workspace = workspace(&dir).await;

        let err = EngineRunner::new(script)
            .run(&workspace, Duration::from_secs(5))
            .await
            .expect_err("missing artifact");

        match err {
            RenderError::EngineFailure { message, log } => {
                assert_eq!(message, "engine produced no readable output artifact");
                assert!(log.unwrap_or_default().contains("nothing written"));
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn kills_engine_after_timeout() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            dir.path(),
            "slow-latex",
            "#!/bin/sh\necho \"starting\"\nexec sleep 30\n",
        );
        let workspace = workspace(&dir).await;

        let started = Instant::now();
        let err = EngineRunner::new(script)
            .run(&workspace, Duration::from_millis(200))
            .await
            .expect_err("timeout");

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(err.is_timeout(), "unexpected error: {err:?}");
        assert_eq!(err.to_string(), "engine timed out");
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_unavailable() {
        let dir = TempDir::new().expect("temp dir");
        let workspace = workspace(&dir).await;

        let err = EngineRunner::new(dir.path().join("does-not-exist"))
            .run(&workspace, Duration::from_secs(1))
            .await
            .expect_err("spawn failure");

        assert!(matches!(err, RenderError::EngineUnavailable { .. }));
    }
}
