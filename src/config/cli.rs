use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

use crate::application::render::parse_timeout_ms;

/// Command-line arguments for the quire binary.
#[derive(Debug, Parser)]
#[command(name = "quire", version, about = "LaTeX render orchestrator")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "QUIRE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl CliArgs {
    /// The selected command, defaulting to `serve`.
    pub fn command_or_default(&self) -> Command {
        self.command
            .clone()
            .unwrap_or_else(|| Command::Serve(Box::<ServeArgs>::default()))
    }
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the public and administrative HTTP listeners.
    Serve(Box<ServeArgs>),
    /// Render one document and wait for the result.
    Render(Box<RenderArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    /// Numeric identifier of the document to render.
    #[arg(value_name = "SUBJECT")]
    pub subject_id: u64,

    /// Actor recorded as the requester.
    #[arg(long, env = "QUIRE_REQUESTER", default_value = "cli", value_name = "ACTOR")]
    pub requester: String,

    /// Compile this file instead of the stored source.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub source: Option<PathBuf>,

    /// Compile deadline in milliseconds; defaults to `render.render_timeout_ms`.
    #[arg(long = "timeout-ms", value_name = "MILLIS", value_parser = parse_timeout_arg)]
    pub timeout: Option<Duration>,

    #[command(flatten)]
    pub overrides: RenderOverrides,
}

fn parse_timeout_arg(value: &str) -> Result<Duration, String> {
    let millis: u64 = value
        .parse()
        .map_err(|err| format!("`{value}` is not a number of milliseconds: {err}"))?;
    parse_timeout_ms(millis).map_err(|err| err.to_string())
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Allow falling back to external compilers when the in-process engine fails.
    #[arg(
        long = "render-allow-external-fallback",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub allow_external_fallback: Option<bool>,

    /// Override the local LaTeX engine used as a fallback.
    #[arg(long = "render-engine-binary", value_name = "PATH", value_hint = ValueHint::ExecutablePath)]
    pub engine_binary: Option<PathBuf>,

    /// Override the external compile service base URL.
    #[arg(long = "render-external-compiler-url", value_name = "URL")]
    pub external_compiler_base_url: Option<String>,

    /// Override the public URL content tokens are served under.
    #[arg(long = "render-public-base-url", value_name = "URL")]
    pub public_base_url: Option<String>,

    /// Override the directory render workspaces are created in.
    #[arg(long = "render-scratch-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub scratch_dir: Option<PathBuf>,

    /// Override the directory compiled artifacts are written to.
    #[arg(long = "render-artifact-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub artifact_dir: Option<PathBuf>,

    /// Override the document store root.
    #[arg(long = "documents-root", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub documents_root: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub render: RenderOverrides,

    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the default compile deadline.
    #[arg(long = "render-timeout-ms", value_name = "MILLIS")]
    pub render_timeout_ms: Option<u64>,

    /// Override how often expired content tokens are swept.
    #[arg(long = "render-token-sweep-interval-ms", value_name = "MILLIS")]
    pub token_sweep_interval_ms: Option<u64>,
}
