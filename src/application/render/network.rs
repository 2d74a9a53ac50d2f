//! Fallback that asks an external compile service to pull the source through
//! a content token and return the PDF.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::{info, warn};
use url::Url;

use super::{
    tokens::TokenGateway,
    types::{Artifact, CompileRequest, RenderError},
};

/// Leading bytes every PDF document starts with.
pub const PDF_SIGNATURE: &[u8] = b"%PDF";

/// Characters of a rejected body quoted back in the error.
const EXCERPT_CHARS: usize = 200;

/// Remote compile service. Given a URL that serves the LaTeX source, returns
/// the raw response body.
#[async_trait]
pub trait NetworkCompiler: Send + Sync {
    async fn compile(&self, source_url: &Url, timeout: Duration) -> Result<Bytes, RenderError>;
}

/// [`NetworkCompiler`] speaking the `GET /compile?url=...` protocol.
#[derive(Debug, Clone)]
pub struct HttpNetworkCompiler {
    client: Client,
    base: Url,
}

impl HttpNetworkCompiler {
    pub fn new(base: Url) -> Result<Self, reqwest::Error> {
        let client = Client::builder().user_agent(Self::user_agent()).build()?;
        Ok(Self { client, base })
    }

    pub fn user_agent() -> &'static str {
        concat!("quire/", env!("CARGO_PKG_VERSION"))
    }

    pub fn compile_url(&self, source_url: &Url) -> Result<Url, RenderError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                RenderError::network(format!("external compiler url `{}` cannot be a base", self.base))
            })?
            .pop_if_empty()
            .push("compile");
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("url", source_url.as_str())
            .append_pair("format", "pdf")
            .append_pair("force", "true");
        Ok(url)
    }
}

#[async_trait]
impl NetworkCompiler for HttpNetworkCompiler {
    async fn compile(&self, source_url: &Url, timeout: Duration) -> Result<Bytes, RenderError> {
        let url = self.compile_url(source_url)?;

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(RenderError::network(format!(
                "external compiler responded with status {status}: {}",
                excerpt(body.as_bytes())
            )));
        }

        response.bytes().await.map_err(map_transport_error)
    }
}

fn map_transport_error(err: reqwest::Error) -> RenderError {
    if err.is_timeout() {
        RenderError::EngineTimeout { log: None }
    } else {
        RenderError::network(format!("external compiler request failed: {err}"))
    }
}

/// Accept `body` only when it carries the PDF signature.
pub fn validate_pdf(body: Bytes) -> Result<Bytes, RenderError> {
    if body.starts_with(PDF_SIGNATURE) {
        Ok(body)
    } else {
        Err(RenderError::InvalidUpstreamResponse {
            excerpt: excerpt(&body),
        })
    }
}

fn excerpt(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(EXCERPT_CHARS)
        .collect()
}

/// Network fallback: issues a content token for the running job, lets the
/// remote compiler pull through it and purges the subject's tokens afterwards.
#[derive(Clone)]
pub struct NetworkBackend {
    compiler: Arc<dyn NetworkCompiler>,
    tokens: TokenGateway,
}

impl NetworkBackend {
    pub fn new(compiler: Arc<dyn NetworkCompiler>, tokens: TokenGateway) -> Self {
        Self { compiler, tokens }
    }

    pub async fn run(
        &self,
        request: &CompileRequest<'_>,
        timeout: Duration,
    ) -> Result<Artifact, RenderError> {
        let subject_id = request.subject_id;
        let issued = self
            .tokens
            .issue_for_job(subject_id, request.requested_by, timeout)
            .map_err(|err| RenderError::network(format!("content token unavailable: {err}")))?;

        let result = self.compiler.compile(&issued.url, timeout).await;
        self.tokens.purge_subject(subject_id);

        match result.and_then(validate_pdf) {
            Ok(bytes) => {
                info!(
                    target = "application::render::network",
                    op = "network::run",
                    result = "success",
                    subject_id = %subject_id,
                    pdf_bytes = bytes.len(),
                    "external compiler produced artifact"
                );
                Ok(Artifact::new(bytes))
            }
            Err(err) => {
                warn!(
                    target = "application::render::network",
                    op = "network::run",
                    result = "error",
                    subject_id = %subject_id,
                    error_kind = err.kind(),
                    error = %err,
                    "external compiler failed"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        application::{
            render::{runtime::InFlightRenders, workspace::WorkspaceManager},
            repos::{DocumentsRepo, RepoError},
        },
        domain::{
            entities::VersionRecord,
            types::{ActorId, SubjectId},
        },
    };
    use axum::{Router, extract::Query, http::StatusCode, routing::get};
    use std::{collections::HashMap, path::PathBuf, sync::Mutex};
    use tempfile::TempDir;

    struct StaticDocuments;

    #[async_trait]
    impl DocumentsRepo for StaticDocuments {
        async fn get_source(&self, _subject_id: SubjectId) -> Result<String, RepoError> {
            Ok("\\documentclass{article}".to_string())
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

    /// Pulls the source through the token it was handed, then replies with
    /// a canned body.
    struct PullingCompiler {
        tokens: TokenGateway,
        reply: Result<Bytes, RenderError>,
        pulled: Mutex<Option<String>>,
    }

    #[async_trait]
    impl NetworkCompiler for PullingCompiler {
        async fn compile(&self, source_url: &Url, _timeout: Duration) -> Result<Bytes, RenderError> {
            let token = source_url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or_default()
                .to_string();
            *self.pulled.lock().expect("pulled lock") = self.tokens.resolve(&token).await;
            self.reply.clone()
        }
    }

    fn gateway(locks: &InFlightRenders) -> TokenGateway {
        TokenGateway::new(
            locks.clone(),
            Arc::new(StaticDocuments),
            Url::parse("http://127.0.0.1:3000/").expect("url"),
        )
    }

    #[test]
    fn html_body_is_rejected_with_excerpt() {
        let body = format!("<html><body>{}</body></html>", "e".repeat(400));
        let err = validate_pdf(Bytes::from(body)).expect_err("html body");

        match err {
            RenderError::InvalidUpstreamResponse { excerpt } => {
                assert!(excerpt.starts_with("<html>"));
                assert_eq!(excerpt.chars().count(), 200);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn pdf_body_is_accepted() {
        let body = validate_pdf(Bytes::from_static(b"%PDF-1.7\n...")).expect("pdf");
        assert!(body.starts_with(PDF_SIGNATURE));
    }

    #[test]
    fn compile_url_carries_protocol_parameters() {
        let compiler =
            HttpNetworkCompiler::new(Url::parse("https://latex.example.net/api/").expect("url"))
                .expect("client");
        let source = Url::parse("http://quire.local/content/abc").expect("url");

        let url = compiler.compile_url(&source).expect("compile url");
        assert_eq!(url.path(), "/api/compile");
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["url"], "http://quire.local/content/abc");
        assert_eq!(query["format"], "pdf");
        assert_eq!(query["force"], "true");
    }

    #[tokio::test]
    async fn backend_serves_source_through_token_and_purges_it() {
        let dir = TempDir::new().expect("temp dir");
        let workspace = WorkspaceManager::new(dir.path().to_path_buf())
            .expect("manager")
            .prepare(SubjectId::new(12), "x", &[], None)
            .await
            .expect("workspace");
        let locks = InFlightRenders::new();
        let _job = locks.acquire(SubjectId::new(12)).expect("lock");
        let tokens = gateway(&locks);
        let compiler = Arc::new(PullingCompiler {
            tokens: tokens.clone(),
            reply: Ok(Bytes::from_static(b"%PDF-1.5 remote")),
            pulled: Mutex::new(None),
        });
        let backend = NetworkBackend::new(compiler.clone(), tokens.clone());
        let actor = ActorId::parse("bob").expect("actor");

        let artifact = backend
            .run(
                &CompileRequest {
                    subject_id: SubjectId::new(12),
                    requested_by: &actor,
                    source_text: "x",
                    workspace: &workspace,
                },
                Duration::from_secs(5),
            )
            .await
            .expect("artifact");

        assert_eq!(&artifact.bytes[..], b"%PDF-1.5 remote");
        assert_eq!(
            compiler.pulled.lock().expect("pulled lock").as_deref(),
            Some("\\documentclass{article}")
        );
        assert_eq!(tokens.live_tokens(), 0);
        assert!(locks.is_locked(SubjectId::new(12)));
    }

    #[tokio::test]
    async fn http_compiler_maps_error_status_to_network_failure() {
        let app = Router::new()
            .route(
                "/compile",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    if params.get("format").map(String::as_str) == Some("pdf") {
                        (StatusCode::BAD_GATEWAY, "upstream exploded")
                    } else {
                        (StatusCode::BAD_REQUEST, "missing format")
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let compiler = HttpNetworkCompiler::new(
            Url::parse(&format!("http://{addr}/")).expect("url"),
        )
        .expect("client");
        let err = compiler
            .compile(
                &Url::parse("http://quire.local/content/abc").expect("url"),
                Duration::from_secs(5),
            )
            .await
            .expect_err("bad gateway");

        assert_eq!(err.kind(), "NetworkFailure");
        assert!(err.to_string().contains("502"), "error: {err}");
        assert!(err.to_string().contains("upstream exploded"), "error: {err}");
        server.abort();
    }
}
