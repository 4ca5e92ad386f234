pub mod config;
pub mod migrate;
pub mod sweep;
pub mod timeline;
pub mod watch;

use serde::Serialize;
use tierflow_core::config::{AppConfig, LoadOptions};
use tierflow_db::{connect_from_config, migrations, DbPool};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    fn from_failure(command: &str, failure: CommandFailure) -> Self {
        Self::failure(command, failure.error_class, failure.message, failure.exit_code)
    }
}

/// A failed command step: error class, user-facing message and process exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandFailure {
    pub error_class: &'static str,
    pub message: String,
    pub exit_code: u8,
}

impl CommandFailure {
    pub(crate) fn new(
        error_class: &'static str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self { error_class, message: message.into(), exit_code }
    }
}

pub(crate) fn load_config() -> Result<AppConfig, CommandFailure> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandFailure::new("config_validation", format!("configuration issue: {error}"), 2)
    })
}

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime, CommandFailure> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandFailure::new(
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })
}

/// Connects and applies pending migrations, so commands also work against a fresh
/// (or in-memory) database.
pub(crate) async fn open_database(config: &AppConfig) -> Result<DbPool, CommandFailure> {
    let pool = connect_from_config(&config.database)
        .await
        .map_err(|error| CommandFailure::new("db_connectivity", error.to_string(), 4))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| CommandFailure::new("migration", error.to_string(), 5))?;
    Ok(pool)
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}
