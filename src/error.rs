//! Fatal error types.
//!
//! Only conditions that must abort a run live here. Evidence problems
//! (ambiguous relations, residual worklist claims, foreign-key violations)
//! are reported as data by the pass that found them.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::SettingsError;

/// Result type for relink operations.
pub type RelinkResult<T> = Result<T, RelinkError>;

/// Errors that abort a run.
#[derive(Error, Debug)]
pub enum RelinkError {
    /// Underlying SQLite failure.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid or unreadable settings.
    #[error("configuration error: {0}")]
    Config(#[from] SettingsError),

    /// A report could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The database file does not exist.
    #[error("database not found: {0}")]
    DatabaseNotFound(PathBuf),

    /// A staging table required by the pass is missing.
    #[error("staging table '{0}' does not exist")]
    MissingStagingTable(String),

    /// An identifier cannot be safely interpolated into DDL.
    #[error("invalid identifier {0:?}: {1}")]
    InvalidIdentifier(String, &'static str),

    /// A table named by the caller is not in the catalog.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A column named by the caller is not in the catalog.
    #[error("unknown column: {table}.{column}")]
    UnknownColumn { table: String, column: String },

    /// A leftover `new_<table>` blocks the swap.
    #[error("table '{table}' has a leftover '{staging}' from an interrupted rewrite")]
    InterruptedRewrite {
        /// Table being rewritten.
        table: String,
        /// The leftover staging table.
        staging: String,
    },

    /// Positional copy requires the same number of columns on both sides.
    #[error("positional copy into '{table}' expects {expected} columns, plan has {actual}")]
    ColumnCountMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    /// The swap copied a different number of rows than the source holds.
    #[error("copy of '{table}' produced {copied} rows, source has {source_rows}")]
    RowCountMismatch {
        table: String,
        source_rows: i64,
        copied: i64,
    },

    /// Stripping was requested while worklist claims are still pending.
    #[error("identity stripping blocked: {0} relation claims are unresolved")]
    StripBlocked(usize),

    /// Foreign-key enforcement is on and cannot be switched off because a
    /// transaction is open on the connection.
    #[error("foreign key enforcement is on inside an open transaction; commit or roll back first")]
    ForeignKeysEnforced,
}

impl RelinkError {
    /// Create an invalid identifier error.
    pub fn invalid_identifier(name: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidIdentifier(name.into(), reason)
    }

    /// Check if this error leaves the database in need of manual attention.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            Self::InterruptedRewrite { .. }
                | Self::ColumnCountMismatch { .. }
                | Self::RowCountMismatch { .. }
        )
    }
}
