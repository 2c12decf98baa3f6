//! TOML-based configuration for relink.
//!
//! Supports a config file (relink.toml) with environment variable expansion
//! in the database path.
//!
//! Example configuration:
//! ```toml
//! database = "${DREQ_HOME}/dreq.sqlite"
//!
//! [staging]
//! uid_table = "uids"
//! worklist_table = "relations"
//! key_column = "uid"
//! temp_prefix = "new_"
//!
//! [discovery]
//! unpopulated = "accept_hint"   # or "defer"
//!
//! [strip]
//! enabled = true
//! force = false
//!
//! [logging]
//! level = "info"
//! format = "text"
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::discover::UnpopulatedPolicy;

/// Database file used when nothing else is configured.
pub const DEFAULT_DATABASE: &str = "dreq.sqlite";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Path to the SQLite database (supports ${ENV_VAR} expansion).
    pub database: String,

    /// Names of the staging structures.
    pub staging: StagingSettings,

    /// Relation discovery settings.
    pub discovery: DiscoverySettings,

    /// Identity stripping settings.
    pub strip: StripSettings,

    /// Logging settings.
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            staging: StagingSettings::default(),
            discovery: DiscoverySettings::default(),
            strip: StripSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Names of the staging tables written by the schema generator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StagingSettings {
    /// Global identifier table: `(uid, table_name)`.
    pub uid_table: String,

    /// Relation worklist: `(table_name, field_name, foreign_table)`.
    pub worklist_table: String,

    /// Key column shared by every domain table.
    pub key_column: String,

    /// Prefix of the temporary table built during a rewrite.
    pub temp_prefix: String,
}

impl Default for StagingSettings {
    fn default() -> Self {
        Self {
            uid_table: "uids".to_string(),
            worklist_table: "relations".to_string(),
            key_column: "uid".to_string(),
            temp_prefix: "new_".to_string(),
        }
    }
}

impl StagingSettings {
    /// Name of the temporary table used while rewriting `table`.
    pub fn temp_name(&self, table: &str) -> String {
        format!("{}{}", self.temp_prefix, table)
    }

    /// Check whether `table` is one of the staging tables.
    pub fn is_staging(&self, table: &str) -> bool {
        table == self.uid_table || table == self.worklist_table
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let fields = [
            ("uid_table", &self.uid_table),
            ("worklist_table", &self.worklist_table),
            ("key_column", &self.key_column),
            ("temp_prefix", &self.temp_prefix),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(SettingsError::InvalidConfig(format!(
                    "staging.{} must not be empty",
                    field
                )));
            }
        }
        if self.uid_table == self.worklist_table {
            return Err(SettingsError::InvalidConfig(
                "staging.uid_table and staging.worklist_table must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// Relation discovery settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// What to do with a declared relation whose column holds no resolvable uids.
    pub unpopulated: UnpopulatedPolicy,
}

/// Identity stripping settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StripSettings {
    /// Drop the identifier table after materialization.
    pub enabled: bool,

    /// Strip even while relation claims are unresolved.
    pub force: bool,
}

impl Default for StripSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            force: false,
        }
    }
}

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// One of error, warn, info, debug, trace.
    pub level: String,

    /// Log line format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        settings.staging.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `RELINK_CONFIG`
    /// 2. `./relink.toml`
    /// 3. `~/.config/relink/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("RELINK_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("relink.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("relink").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// The database path with environment variables expanded.
    pub fn database_path(&self) -> Result<PathBuf, SettingsError> {
        Ok(PathBuf::from(expand_env_vars(&self.database)?))
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let var_name = if chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                name.push(ch);
            }
            name
        } else {
            let mut name = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_alphanumeric() || ch == '_' {
                    name.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
            name
        };

        let value = env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name))?;
        result.push_str(&value);
    }

    Ok(result)
}
