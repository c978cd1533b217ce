//! ---
//! hm_section: "05-command-line"
//! hm_subsection: "binary"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Binary entrypoint for the harbormaster command line."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use hm_common::{init_tracing, AppConfig, BackendKind};
use hm_spec::{ComposeParser, ComposeSpec, HookSlot};
use tracing::{debug, info, Instrument};

mod commands;
mod shutdown;

const DEFAULT_CONFIG: &str = "harbormaster.toml";
const DEFAULT_PROJECT: &str = "harbormaster";

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Dependency-ordered service orchestration with init/post containers and hooks",
    long_about = None
)]
struct Cli {
    #[arg(
        short = 'f',
        long = "file",
        value_name = "FILE",
        default_value = "harbor-compose.yml",
        global = true,
        help = "Compose file to load"
    )]
    file: PathBuf,

    #[arg(
        long = "env-file",
        value_name = "FILE",
        global = true,
        help = "KEY=VALUE file used for variable substitution"
    )]
    env_file: Option<PathBuf>,

    #[arg(
        short = 'p',
        long = "project-name",
        value_name = "NAME",
        global = true,
        help = "Project name used in logs (defaults to the compose file's directory)"
    )]
    project_name: Option<String>,

    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue, global = true, help = "Enable debug logging")]
    verbose: bool,

    #[arg(
        long,
        value_name = "FILE",
        env = "HM_CONFIG",
        global = true,
        help = "Path to the harbormaster configuration file"
    )]
    config: Option<PathBuf>,

    #[arg(long, value_enum, global = true, help = "Override the container backend")]
    backend: Option<CliBackend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliBackend {
    Auto,
    Docker,
    Stub,
}

impl From<CliBackend> for BackendKind {
    fn from(value: CliBackend) -> Self {
        match value {
            CliBackend::Auto => BackendKind::Auto,
            CliBackend::Docker => BackendKind::Docker,
            CliBackend::Stub => BackendKind::Stub,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create and start services in dependency order")]
    Up {
        #[arg(
            short = 'd',
            long = "detach",
            help = "Return once services are running instead of waiting for a shutdown signal"
        )]
        detach: bool,
    },
    #[command(about = "Stop and remove services in reverse dependency order")]
    Down,
    #[command(about = "Validate the compose file and print the resolved document")]
    Config,
    #[command(about = "Validate the compose file and print a summary")]
    Validate,
    #[command(about = "Run one hook slot for the selected services and report each hook")]
    Hooks {
        #[arg(value_name = "SLOT", help = "pre_start, post_start, pre_stop, post_stop, pre_build, post_build, pre_deploy, or post_deploy")]
        slot: HookSlot,
        #[arg(value_name = "SERVICE", help = "Services to run (all when omitted)")]
        services: Vec<String>,
    },
    #[command(about = "Print version information")]
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Commands::Version = cli.command {
        println!("harbormaster {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.backend.kind = backend.into();
    }
    init_tracing("harbormaster", &config.logging, cli.verbose)?;

    let spec = load_spec(&cli.file, cli.env_file.as_deref())?;
    let project = cli
        .project_name
        .clone()
        .unwrap_or_else(|| project_from_path(&cli.file));
    let span = tracing::info_span!("project", name = %project);

    async move {
        info!(file = %cli.file.display(), services = spec.services.len(), "compose file loaded");
        match cli.command {
            Commands::Up { detach } => commands::up(&config, &spec, detach).await,
            Commands::Down => commands::down(&config, &spec).await,
            Commands::Config => commands::print_config(&spec),
            Commands::Validate => commands::validate(&spec),
            Commands::Hooks { slot, services } => {
                commands::hooks(&config, &spec, slot, &services).await
            }
            Commands::Version => Ok(()),
        }
    }
    .instrument(span)
    .await
}

/// An explicit `--config` must exist; otherwise `harbormaster.toml` is used when
/// present and defaults apply when it is not.
fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let loaded = match explicit {
        Some(path) => AppConfig::load_with_source(&[path])?,
        None => AppConfig::load_or_default(&[PathBuf::from(DEFAULT_CONFIG)])?,
    };
    if let Some(source) = &loaded.source {
        debug!(config_path = %source.display(), "configuration loaded");
    }
    Ok(loaded.config)
}

fn load_spec(file: &Path, env_file: Option<&Path>) -> Result<ComposeSpec> {
    let mut parser = ComposeParser::new();
    if let Some(env_file) = env_file {
        parser
            .load_env_file(env_file)
            .with_context(|| format!("failed to load env file {}", env_file.display()))?;
    }
    parser
        .parse_file(file)
        .with_context(|| format!("failed to load compose file {}", file.display()))
}

fn project_from_path(file: &Path) -> String {
    file.canonicalize()
        .ok()
        .and_then(|path| {
            path.parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_PROJECT.to_string())
}
