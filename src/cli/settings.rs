//! `chatlet set` and `chatlet unset`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::core::config::{Config, ConfigError, ConfigOrchestrator};

/// Keys accepted by `set`/`unset`, in display order.
pub const SETTING_KEYS: &[&str] = &[
    "data-dir",
    "temperature",
    "max-tokens",
    "stream-idle-timeout",
    "log-level",
    "log-file",
];

/// Errors that can occur when modifying configuration settings.
#[derive(Debug)]
pub enum SettingError {
    /// The provided setting key is not recognized.
    UnknownKey(String),
    /// The value does not fit the key.
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
    MissingValue(&'static str),
    /// An error occurred while persisting the configuration.
    Config(ConfigError),
}

impl fmt::Display for SettingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingError::UnknownKey(key) => write!(
                f,
                "Unknown config key: {key} (expected one of: {})",
                SETTING_KEYS.join(", ")
            ),
            SettingError::InvalidValue {
                key,
                value,
                expected,
            } => write!(f, "Invalid value for {key}: {value} ({expected})"),
            SettingError::MissingValue(key) => write!(f, "Missing value for {key}"),
            SettingError::Config(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SettingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingError::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for SettingError {
    fn from(err: ConfigError) -> Self {
        SettingError::Config(err)
    }
}

fn canonical_key(key: &str) -> Result<&'static str, SettingError> {
    let normalized = key.trim().to_lowercase().replace('_', "-");
    SETTING_KEYS
        .iter()
        .copied()
        .find(|candidate| *candidate == normalized)
        .ok_or_else(|| SettingError::UnknownKey(key.to_string()))
}

fn parse_value<T: FromStr>(
    key: &'static str,
    value: &str,
    expected: &'static str,
) -> Result<T, SettingError> {
    value.trim().parse().map_err(|_| SettingError::InvalidValue {
        key,
        value: value.to_string(),
        expected,
    })
}

/// Set `key` on `config`. Returns the confirmation to show.
pub fn apply_setting(config: &mut Config, key: &str, value: &str) -> Result<String, SettingError> {
    let key = canonical_key(key)?;
    let value = value.trim();
    if value.is_empty() {
        return Err(SettingError::MissingValue(key));
    }

    match key {
        "data-dir" => config.data_dir = Some(PathBuf::from(value)),
        "temperature" => {
            let temperature: f32 = parse_value(key, value, "a number from 0 to 2")?;
            if !(0.0..=2.0).contains(&temperature) {
                return Err(SettingError::InvalidValue {
                    key,
                    value: value.to_string(),
                    expected: "a number from 0 to 2",
                });
            }
            config.temperature = Some(temperature);
        }
        "max-tokens" => config.max_tokens = Some(parse_value(key, value, "a positive integer")?),
        "stream-idle-timeout" => {
            config.stream_idle_timeout_secs =
                Some(parse_value(key, value, "seconds, or 0 to wait forever")?)
        }
        "log-level" => config.log_level = Some(value.to_string()),
        "log-file" => config.log_file = Some(PathBuf::from(value)),
        _ => return Err(SettingError::UnknownKey(key.to_string())),
    }
    Ok(format!("✅ Set {key} to: {value}"))
}

pub fn clear_setting(config: &mut Config, key: &str) -> Result<String, SettingError> {
    let key = canonical_key(key)?;
    match key {
        "data-dir" => config.data_dir = None,
        "temperature" => config.temperature = None,
        "max-tokens" => config.max_tokens = None,
        "stream-idle-timeout" => config.stream_idle_timeout_secs = None,
        "log-level" => config.log_level = None,
        "log-file" => config.log_file = None,
        _ => return Err(SettingError::UnknownKey(key.to_string())),
    }
    Ok(format!("✅ Unset {key}"))
}

/// `chatlet set [key value...]`. Without a key the current values are shown.
pub fn handle_set(
    orchestrator: &ConfigOrchestrator,
    key: Option<String>,
    value: Vec<String>,
) -> Result<(), SettingError> {
    let Some(key) = key else {
        orchestrator.load_with_cache()?.print_all();
        return Ok(());
    };
    let value = value.join(" ");
    let message = orchestrator.mutate(|config| apply_setting(config, &key, &value))?;
    println!("{message}");
    Ok(())
}

pub fn handle_unset(orchestrator: &ConfigOrchestrator, key: &str) -> Result<(), SettingError> {
    let message = orchestrator.mutate(|config| clear_setting(config, key))?;
    println!("{message}");
    Ok(())
}
