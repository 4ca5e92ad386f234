use std::env;
use std::fs;
use std::path::Path;

use tierflow_core::config::{resolve_config_path, ENV_KEYS};
use toml::Value;

use crate::commands::{load_config, CommandResult};

const ENV_ALIASES: &[(&str, &str)] =
    &[("logging.level", "TIERFLOW_LOG_LEVEL"), ("logging.format", "TIERFLOW_LOG_FORMAT")];

pub fn run() -> CommandResult {
    let config = match load_config() {
        Ok(config) => config,
        Err(failure) => return CommandResult::from_failure("config", failure),
    };

    let config_file_path = resolve_config_path(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, value) in config.effective_values() {
        let source = field_source(key_path, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key_path, &value, source));
    }

    CommandResult::success("config", lines.join("\n"))
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn env_keys_for(key_path: &str) -> impl Iterator<Item = &'static str> + '_ {
    ENV_KEYS
        .iter()
        .chain(ENV_ALIASES.iter())
        .filter(move |(path, _)| *path == key_path)
        .map(|(_, env_key)| *env_key)
}

fn field_source(
    key_path: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys_for(key_path).find(|env_key| env::var_os(env_key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
