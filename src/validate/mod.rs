//! Referential integrity audit.
//!
//! Runs after materialization. Violations are upstream data problems the
//! operator has to judge; they are reported, never repaired and never fatal.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::error::RelinkResult;
use crate::sql::quote_ident;
use crate::worklist::{Worklist, WorklistOutcome};

/// One row reported by `PRAGMA foreign_key_check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyViolation {
    /// Child table holding the dangling reference.
    pub table: String,
    /// `None` for WITHOUT ROWID tables.
    pub rowid: Option<i64>,
    /// Parent table the reference should resolve in.
    pub parent: String,
    /// Index into the child's `foreign_key_list`.
    pub fkid: i64,
    /// Child column, when the key is a single column.
    pub column: Option<String>,
    /// Offending value rendered as text.
    pub value: Option<String>,
}

impl std::fmt::Display for ForeignKeyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table)?;
        if let Some(rowid) = self.rowid {
            write!(f, "[rowid {}]", rowid)?;
        }
        if let Some(ref column) = self.column {
            write!(f, ".{}", column)?;
        }
        if let Some(ref value) = self.value {
            write!(f, " = {:?}", value)?;
        }
        write!(f, " -> missing in {}", self.parent)
    }
}

/// Result of the validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub violations: Vec<ForeignKeyViolation>,
    pub worklist: WorklistOutcome,
}

impl IntegrityReport {
    /// True when there are neither violations nor pending claims.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty() && self.worklist.pending() == 0
    }
}

/// Audits foreign keys and settles the worklist.
pub struct IntegrityValidator<'c> {
    conn: &'c Connection,
}

impl<'c> IntegrityValidator<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Run a whole-database foreign-key check.
    pub fn audit(&self) -> RelinkResult<Vec<ForeignKeyViolation>> {
        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let catalog = Catalog::new(self.conn);
        let mut violations = Vec::with_capacity(rows.len());
        for (table, rowid, parent, fkid) in rows {
            let column = catalog
                .table(&table)?
                .foreign_key_groups()
                .get(&fkid)
                .and_then(|group| match group.as_slice() {
                    [fk] => Some(fk.from.clone()),
                    _ => None,
                });
            let value = match (&column, rowid) {
                (Some(column), Some(rowid)) => self.value_at(&table, column, rowid)?,
                _ => None,
            };
            violations.push(ForeignKeyViolation {
                table,
                rowid,
                parent,
                fkid,
                column,
                value,
            });
        }

        if violations.is_empty() {
            info!("foreign key check passed");
        } else {
            warn!(
                count = violations.len(),
                "found the following foreign key violations"
            );
            for violation in &violations {
                warn!(%violation, "foreign key violation");
            }
        }

        Ok(violations)
    }

    /// Audit, then drop the worklist if drained or report what is left.
    pub fn validate(&self, worklist: Option<Worklist>) -> RelinkResult<IntegrityReport> {
        let violations = self.audit()?;
        let worklist = match worklist {
            Some(worklist) => worklist.finalize(self.conn)?,
            None => WorklistOutcome::Absent,
        };
        Ok(IntegrityReport {
            violations,
            worklist,
        })
    }

    fn value_at(&self, table: &str, column: &str, rowid: i64) -> RelinkResult<Option<String>> {
        let sql = format!(
            "SELECT CAST({} AS TEXT) FROM {} WHERE rowid = ?",
            quote_ident(column)?,
            quote_ident(table)?
        );
        let value: Option<Option<String>> = self
            .conn
            .query_row(&sql, params![rowid], |row| row.get(0))
            .optional()?;
        Ok(value.flatten())
    }
}
