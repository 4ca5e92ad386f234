pub mod commands;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::process::ExitCode;
use tierflow_core::config::{AppConfig, LoadOptions, LogFormat};

#[derive(Debug, Parser)]
#[command(
    name = "tierflow",
    about = "Tierflow approval workflow operator CLI",
    long_about = "Inspect configuration, apply migrations, run escalation sweeps and render workflow timelines.",
    after_help = "Examples:\n  tierflow config\n  tierflow sweep\n  tierflow watch --max-sweeps 10\n  tierflow timeline WF-1042"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution"
    )]
    Config,
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Run one escalation sweep over in-progress workflow instances")]
    Sweep,
    #[command(about = "Run escalation sweeps on the configured interval until interrupted")]
    Watch {
        #[arg(long, help = "Stop after this many sweeps")]
        max_sweeps: Option<u32>,
    },
    #[command(about = "Print the chronological timeline of a workflow instance as JSON")]
    Timeline {
        #[arg(help = "Workflow instance id")]
        instance_id: String,
    },
}

pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    // A broken config is reported by the command itself through the JSON envelope.
    if let Ok(config) = AppConfig::load(LoadOptions::default()) {
        init_logging(&config)?;
    }

    let result = match cli.command {
        Command::Config => commands::config::run(),
        Command::Migrate => commands::migrate::run(),
        Command::Sweep => commands::sweep::run(),
        Command::Watch { max_sweeps } => commands::watch::run(max_sweeps),
        Command::Timeline { instance_id } => commands::timeline::run(&instance_id),
    };

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", result.output).context("failed to write command output")?;
    Ok(ExitCode::from(result.exit_code))
}

/// Logs go to stderr so stdout carries only the command envelope.
fn init_logging(config: &AppConfig) -> Result<()> {
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|error| anyhow!(error))
    .context("failed to initialize logging")
}
