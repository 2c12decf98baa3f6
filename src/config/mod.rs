//! Configuration module for relink.
//!
//! Handles the config file, staging table names and environment variables.

mod settings;

pub use settings::{
    expand_env_vars, DiscoverySettings, LogFormat, LoggingSettings, Settings, SettingsError,
    StagingSettings, StripSettings, DEFAULT_DATABASE,
};
