//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::application::render::parse_timeout_ms;

pub use cli::{CliArgs, Command, RenderArgs, RenderOverrides, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "quire";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_RENDER_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_TOKEN_SWEEP_INTERVAL_MS: u64 = 5_000;
const DEFAULT_SCRATCH_DIR: &str = "/tmp/quire-scratch";
const DEFAULT_ARTIFACT_DIR: &str = "artifacts";
const DEFAULT_DOCUMENTS_ROOT: &str = "documents";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub render: RenderSettings,
    pub documents: DocumentSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub allow_external_fallback: bool,
    pub render_timeout: Duration,
    /// Base URL of the external compile service; the network fallback is
    /// disabled without it.
    pub external_compiler_base_url: Option<Url>,
    /// URL under which this instance's public listener is reachable.
    pub public_base_url: Url,
    /// Local LaTeX engine; the local-process fallback is disabled without it.
    pub engine_binary: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub token_sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DocumentSettings {
    pub root: PathBuf,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("QUIRE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Render(args)) => raw.apply_render_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    use clap::Parser;

    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    render: RawRenderSettings,
    documents: RawDocumentSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(timeout) = overrides.render_timeout_ms {
            self.render.render_timeout_ms = Some(timeout);
        }
        if let Some(interval) = overrides.token_sweep_interval_ms {
            self.render.token_sweep_interval_ms = Some(interval);
        }

        self.apply_render_overrides(&overrides.render);
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(allow) = overrides.allow_external_fallback {
            self.render.allow_external_fallback = Some(allow);
        }
        if let Some(path) = overrides.engine_binary.as_ref() {
            self.render.engine_binary = Some(path.clone());
        }
        if let Some(url) = overrides.external_compiler_base_url.as_ref() {
            self.render.external_compiler_base_url = Some(url.clone());
        }
        if let Some(url) = overrides.public_base_url.as_ref() {
            self.render.public_base_url = Some(url.clone());
        }
        if let Some(dir) = overrides.scratch_dir.as_ref() {
            self.render.scratch_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.artifact_dir.as_ref() {
            self.render.artifact_dir = Some(dir.clone());
        }
        if let Some(root) = overrides.documents_root.as_ref() {
            self.documents.root = Some(root.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            render,
            documents,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let render = build_render_settings(render, &server)?;
        let documents = build_document_settings(documents)?;

        Ok(Self {
            server,
            logging,
            render,
            documents,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_render_settings(
    render: RawRenderSettings,
    server: &ServerSettings,
) -> Result<RenderSettings, LoadError> {
    let render_timeout =
        parse_timeout_ms(render.render_timeout_ms.unwrap_or(DEFAULT_RENDER_TIMEOUT_MS))
            .map_err(|err| LoadError::invalid("render.render_timeout_ms", err.to_string()))?;
    let token_sweep_interval = non_zero_millis(
        render
            .token_sweep_interval_ms
            .unwrap_or(DEFAULT_TOKEN_SWEEP_INTERVAL_MS),
        "render.token_sweep_interval_ms",
    )?;

    let external_compiler_base_url = match non_blank(render.external_compiler_base_url) {
        Some(value) => Some(parse_http_url(&value, "render.external_compiler_base_url")?),
        None => None,
    };

    let public_base_url = match non_blank(render.public_base_url) {
        Some(value) => parse_http_url(&value, "render.public_base_url")?,
        None => parse_http_url(
            &format!("http://{}/", server.public_addr),
            "render.public_base_url",
        )?,
    };

    let engine_binary = render
        .engine_binary
        .filter(|path| !path.as_os_str().is_empty());

    let scratch_dir = non_empty_path(
        render.scratch_dir,
        DEFAULT_SCRATCH_DIR,
        "render.scratch_dir",
    )?;
    let artifact_dir = non_empty_path(
        render.artifact_dir,
        DEFAULT_ARTIFACT_DIR,
        "render.artifact_dir",
    )?;

    Ok(RenderSettings {
        allow_external_fallback: render.allow_external_fallback.unwrap_or(false),
        render_timeout,
        external_compiler_base_url,
        public_base_url,
        engine_binary,
        scratch_dir,
        artifact_dir,
        token_sweep_interval,
    })
}

fn build_document_settings(documents: RawDocumentSettings) -> Result<DocumentSettings, LoadError> {
    let root = non_empty_path(documents.root, DEFAULT_DOCUMENTS_ROOT, "documents.root")?;
    Ok(DocumentSettings { root })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    allow_external_fallback: Option<bool>,
    render_timeout_ms: Option<u64>,
    external_compiler_base_url: Option<String>,
    public_base_url: Option<String>,
    engine_binary: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    artifact_dir: Option<PathBuf>,
    token_sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDocumentSettings {
    root: Option<PathBuf>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_http_url(value: &str, key: &'static str) -> Result<Url, LoadError> {
    let url = Url::parse(value)
        .map_err(|err| LoadError::invalid(key, format!("invalid url `{value}`: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(LoadError::invalid(
            key,
            format!("unsupported scheme `{other}`; expected http or https"),
        )),
    }
}

fn non_empty_path(
    value: Option<PathBuf>,
    default: &str,
    key: &'static str,
) -> Result<PathBuf, LoadError> {
    let path = value.unwrap_or_else(|| PathBuf::from(default));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid(key, "path must not be empty"));
    }
    Ok(path)
}
