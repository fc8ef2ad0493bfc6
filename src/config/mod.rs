use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_CONFIG_PATH: &str = "config/yakusu.toml";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub workers: WorkersConfig,
    pub dispatch: DispatchConfig,
    pub wire: WireConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 55002,
            max_connections: 50,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    pub count: u32,
    pub poll_interval_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 4,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    pub timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WireConfig {
    pub max_frame_size_bytes: u64,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_frame_size_bytes: 1_048_576,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    DefaultsSerialize(toml::ser::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::DefaultsSerialize(source) => {
                write!(f, "failed to build default config values: {source}")
            }
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl AppConfig {
    /// Loads configuration for the process: an optional leading
    /// `--config <path>` argument selects the TOML file (a missing file at
    /// the default path is not an error), and every remaining
    /// `--section.key value` pair overrides the loaded value, typed against
    /// the value it replaces.
    pub fn load(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let mut args = args.into_iter().peekable();
        let mut path = DEFAULT_CONFIG_PATH.to_owned();
        let mut path_explicit = false;

        if args.peek().map(String::as_str) == Some("--config") {
            args.next();
            path = args.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            path_explicit = true;
        }

        let mut root = defaults_value()?;
        if Path::new(&path).exists() {
            merge_file(&mut root, &path)?;
        } else if path_explicit {
            return Err(ConfigError::Io {
                path,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
            });
        }

        for (key_path, raw_value) in parse_cli_overrides(args)? {
            apply_override(&mut root, &key_path, &raw_value)?;
        }

        root.try_into().map_err(ConfigError::Deserialize)
    }

    pub fn load_from_file_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root = defaults_value()?;
        merge_file(&mut root, path.as_ref())?;

        for (key_path, raw_value) in parse_cli_overrides(args)? {
            apply_override(&mut root, &key_path, &raw_value)?;
        }

        root.try_into().map_err(ConfigError::Deserialize)
    }
}

fn defaults_value() -> Result<Value, ConfigError> {
    Value::try_from(AppConfig::default()).map_err(ConfigError::DefaultsSerialize)
}

fn merge_file(root: &mut Value, path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let rendered_path = path.as_ref().to_string_lossy().to_string();
    let content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
        path: rendered_path.clone(),
        source,
    })?;
    let file_value: Value = content.parse().map_err(|source| ConfigError::TomlParse {
        path: rendered_path,
        source,
    })?;

    merge_tables(root, &file_value);
    Ok(())
}

// File values win over defaults, section by section. Unknown sections or
// keys in the file are carried through and rejected by deserialization.
fn merge_tables(base: &mut Value, overlay: &Value) {
    let (Some(base_table), Some(overlay_table)) = (base.as_table_mut(), overlay.as_table()) else {
        *base = overlay.clone();
        return;
    };

    for (key, overlay_value) in overlay_table {
        match base_table.get_mut(key) {
            Some(base_value) if base_value.is_table() && overlay_value.is_table() => {
                merge_tables(base_value, overlay_value);
            }
            Some(base_value) => *base_value = overlay_value.clone(),
            None => {
                base_table.insert(key.clone(), overlay_value.clone());
            }
        }
    }
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };
        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;
        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.len() < 2 || parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::UnknownPath {
            key: key_path.to_owned(),
        });
    }

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(*section))
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
    }

    let final_key = parts[parts.len() - 1];
    let slot = current
        .as_table_mut()
        .and_then(|table| table.get_mut(final_key))
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;

    *slot = retype_raw_value(key_path, raw_value, slot)?;
    Ok(())
}

fn retype_raw_value(key_path: &str, raw_value: &str, slot: &Value) -> Result<Value, ConfigError> {
    match slot {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| ConfigError::InvalidValueForType {
                key: key_path.to_owned(),
                expected: "integer",
                value: raw_value.to_owned(),
            }),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| ConfigError::InvalidValueForType {
                key: key_path.to_owned(),
                expected: "float",
                value: raw_value.to_owned(),
            }),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| ConfigError::InvalidValueForType {
                key: key_path.to_owned(),
                expected: "boolean",
                value: raw_value.to_owned(),
            }),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
