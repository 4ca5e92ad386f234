use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coordination::ResponseWindows;

pub const DEFAULT_CONFIG_FILE: &str = "tierflow.toml";
pub const NESTED_CONFIG_FILE: &str = "config/tierflow.toml";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub escalation: EscalationConfig,
    pub delegation: DelegationConfig,
    pub dispatch: ResponseWindows,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct EscalationConfig {
    pub sweep_interval_secs: u64,
    /// Actor recorded on auto-approvals and condition resolutions.
    pub system_actor_id: String,
}

#[derive(Clone, Debug)]
pub struct DelegationConfig {
    pub expiry_warning_hours: u32,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub sweep_interval_secs: Option<u64>,
    pub system_actor_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://tierflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            escalation: EscalationConfig {
                sweep_interval_secs: 300,
                system_actor_id: "system".to_string(),
            },
            delegation: DelegationConfig { expiry_warning_hours: 24 },
            dispatch: ResponseWindows::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

/// Environment keys for every file-backed setting, as `(key path, env var)`.
pub const ENV_KEYS: &[(&str, &str)] = &[
    ("database.url", "TIERFLOW_DATABASE_URL"),
    ("database.max_connections", "TIERFLOW_DATABASE_MAX_CONNECTIONS"),
    ("database.timeout_secs", "TIERFLOW_DATABASE_TIMEOUT_SECS"),
    ("escalation.sweep_interval_secs", "TIERFLOW_ESCALATION_SWEEP_INTERVAL_SECS"),
    ("escalation.system_actor_id", "TIERFLOW_ESCALATION_SYSTEM_ACTOR_ID"),
    ("delegation.expiry_warning_hours", "TIERFLOW_DELEGATION_EXPIRY_WARNING_HOURS"),
    ("dispatch.medium_hours", "TIERFLOW_DISPATCH_MEDIUM_HOURS"),
    ("dispatch.high_hours", "TIERFLOW_DISPATCH_HIGH_HOURS"),
    ("dispatch.critical_hours", "TIERFLOW_DISPATCH_CRITICAL_HOURS"),
    ("dispatch.emergency_hours", "TIERFLOW_DISPATCH_EMERGENCY_HOURS"),
    ("logging.level", "TIERFLOW_LOGGING_LEVEL"),
    ("logging.format", "TIERFLOW_LOGGING_FORMAT"),
];

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Flattened `(key path, rendered value)` pairs, in `ENV_KEYS` order.
    pub fn effective_values(&self) -> Vec<(&'static str, String)> {
        vec![
            ("database.url", self.database.url.clone()),
            ("database.max_connections", self.database.max_connections.to_string()),
            ("database.timeout_secs", self.database.timeout_secs.to_string()),
            ("escalation.sweep_interval_secs", self.escalation.sweep_interval_secs.to_string()),
            ("escalation.system_actor_id", self.escalation.system_actor_id.clone()),
            ("delegation.expiry_warning_hours", self.delegation.expiry_warning_hours.to_string()),
            ("dispatch.medium_hours", self.dispatch.medium_hours.to_string()),
            ("dispatch.high_hours", self.dispatch.high_hours.to_string()),
            ("dispatch.critical_hours", self.dispatch.critical_hours.to_string()),
            ("dispatch.emergency_hours", self.dispatch.emergency_hours.to_string()),
            ("logging.level", self.logging.level.clone()),
            ("logging.format", self.logging.format.as_str().to_string()),
        ]
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(escalation) = patch.escalation {
            if let Some(sweep_interval_secs) = escalation.sweep_interval_secs {
                self.escalation.sweep_interval_secs = sweep_interval_secs;
            }
            if let Some(system_actor_id) = escalation.system_actor_id {
                self.escalation.system_actor_id = system_actor_id;
            }
        }

        if let Some(delegation) = patch.delegation {
            if let Some(expiry_warning_hours) = delegation.expiry_warning_hours {
                self.delegation.expiry_warning_hours = expiry_warning_hours;
            }
        }

        if let Some(dispatch) = patch.dispatch {
            if let Some(hours) = dispatch.medium_hours {
                self.dispatch.medium_hours = hours;
            }
            if let Some(hours) = dispatch.high_hours {
                self.dispatch.high_hours = hours;
            }
            if let Some(hours) = dispatch.critical_hours {
                self.dispatch.critical_hours = hours;
            }
            if let Some(hours) = dispatch.emergency_hours {
                self.dispatch.emergency_hours = hours;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TIERFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TIERFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("TIERFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TIERFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TIERFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TIERFLOW_ESCALATION_SWEEP_INTERVAL_SECS") {
            self.escalation.sweep_interval_secs =
                parse_u64("TIERFLOW_ESCALATION_SWEEP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("TIERFLOW_ESCALATION_SYSTEM_ACTOR_ID") {
            self.escalation.system_actor_id = value;
        }

        if let Some(value) = read_env("TIERFLOW_DELEGATION_EXPIRY_WARNING_HOURS") {
            self.delegation.expiry_warning_hours =
                parse_u32("TIERFLOW_DELEGATION_EXPIRY_WARNING_HOURS", &value)?;
        }

        if let Some(value) = read_env("TIERFLOW_DISPATCH_MEDIUM_HOURS") {
            self.dispatch.medium_hours = parse_u32("TIERFLOW_DISPATCH_MEDIUM_HOURS", &value)?;
        }
        if let Some(value) = read_env("TIERFLOW_DISPATCH_HIGH_HOURS") {
            self.dispatch.high_hours = parse_u32("TIERFLOW_DISPATCH_HIGH_HOURS", &value)?;
        }
        if let Some(value) = read_env("TIERFLOW_DISPATCH_CRITICAL_HOURS") {
            self.dispatch.critical_hours = parse_u32("TIERFLOW_DISPATCH_CRITICAL_HOURS", &value)?;
        }
        if let Some(value) = read_env("TIERFLOW_DISPATCH_EMERGENCY_HOURS") {
            self.dispatch.emergency_hours =
                parse_u32("TIERFLOW_DISPATCH_EMERGENCY_HOURS", &value)?;
        }

        let log_level =
            read_env("TIERFLOW_LOGGING_LEVEL").or_else(|| read_env("TIERFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TIERFLOW_LOGGING_FORMAT").or_else(|| read_env("TIERFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(sweep_interval_secs) = overrides.sweep_interval_secs {
            self.escalation.sweep_interval_secs = sweep_interval_secs;
        }
        if let Some(system_actor_id) = overrides.system_actor_id {
            self.escalation.system_actor_id = system_actor_id;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_escalation(&self.escalation)?;
        validate_delegation(&self.delegation)?;
        validate_dispatch(&self.dispatch)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

/// The config file `load` would read: the explicit path when it exists, else the
/// first default location found.
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from(NESTED_CONFIG_FILE)]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_escalation(escalation: &EscalationConfig) -> Result<(), ConfigError> {
    if escalation.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "escalation.sweep_interval_secs must be greater than zero".to_string(),
        ));
    }

    if escalation.system_actor_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "escalation.system_actor_id must not be empty; auto-approvals are recorded under it"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_delegation(delegation: &DelegationConfig) -> Result<(), ConfigError> {
    if delegation.expiry_warning_hours > 24 * 30 {
        return Err(ConfigError::Validation(
            "delegation.expiry_warning_hours must be at most 720 (30 days)".to_string(),
        ));
    }
    Ok(())
}

fn validate_dispatch(dispatch: &ResponseWindows) -> Result<(), ConfigError> {
    let windows = [
        ("dispatch.medium_hours", dispatch.medium_hours),
        ("dispatch.high_hours", dispatch.high_hours),
        ("dispatch.critical_hours", dispatch.critical_hours),
        ("dispatch.emergency_hours", dispatch.emergency_hours),
    ];
    if let Some((key, _)) = windows.iter().find(|(_, hours)| *hours == 0) {
        return Err(ConfigError::Validation(format!("{key} must be greater than zero")));
    }

    let descending = windows.windows(2).all(|pair| pair[0].1 >= pair[1].1);
    if !descending {
        return Err(ConfigError::Validation(
            "dispatch windows must not grow with priority (medium >= high >= critical >= emergency)"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    escalation: Option<EscalationPatch>,
    delegation: Option<DelegationPatch>,
    dispatch: Option<DispatchPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EscalationPatch {
    sweep_interval_secs: Option<u64>,
    system_actor_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DelegationPatch {
    expiry_warning_hours: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DispatchPatch {
    medium_hours: Option<u32>,
    high_hours: Option<u32>,
    critical_hours: Option<u32>,
    emergency_hours: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
