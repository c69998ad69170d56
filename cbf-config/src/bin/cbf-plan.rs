use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use cbf_config::{ControllerSettings, plan};
use cbf_model::SubarrayId;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "cbf-plan",
    about = "Dry-run interface validation and spectrum partitioning"
)]
struct Cli {
    /// Configuration file; overrides CBF_CONFIG_PATH and the default search
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Env file loaded before the configuration is resolved
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a document's interface against the allow-list for a command
    Validate {
        /// Path to the JSON document, or `-` for stdin
        document: PathBuf,
        #[arg(long)]
        command: String,
    },
    /// Show how a scan configuration would be split across processing units
    Partition {
        /// Path to the JSON document, or `-` for stdin
        document: PathBuf,
        #[arg(long, default_value_t = 1)]
        subarray: u8,
    },
    /// Print the resolved configuration
    Config,
}

fn read_document(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read document from stdin")?;
        return Ok(buffer);
    }
    fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<ControllerSettings> {
    match dotenvy::from_path(&cli.env_file) {
        Ok(()) | Err(dotenvy::Error::Io(_)) => {}
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to load {}", cli.env_file.display())
            });
        }
    }
    match &cli.config {
        Some(path) => ControllerSettings::load_from_path(path),
        None => ControllerSettings::load_from_env(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    match &cli.command {
        Command::Validate { document, command } => {
            let raw = read_document(document)?;
            let verdict = plan::validate_document(&settings.config, &raw, command);
            print_json(&verdict)?;
            if !verdict.accepted {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Partition { document, subarray } => {
            let raw = read_document(document)?;
            let subarray = SubarrayId::new(*subarray)
                .context("invalid --subarray")?;
            let plan = plan::plan_partition(&settings.config, &raw, subarray)
                .await
                .context("partition failed")?;
            print_json(&plan)?;
        }
        Command::Config => {
            tracing::info!(source = %settings.source.describe(), "resolved configuration");
            print_json(&settings.config)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
