//! Recreate-copy-swap table rewriting.
//!
//! SQLite cannot add or change constraints on an existing table. Every
//! schema change in this crate therefore goes through one primitive:
//!
//! ```text
//! CREATE TABLE "new_T" (<amended column list>)
//! INSERT INTO "new_T" SELECT * FROM "T"      -- positional, or by name
//! DROP TABLE "T"
//! ALTER TABLE "new_T" RENAME TO "T"
//! CREATE INDEX ... / CREATE TRIGGER ...      -- replayed from the old table
//! ```
//!
//! The caller owns the transaction. A crash before commit leaves the
//! original table untouched; [`recover_interrupted`] removes a stale
//! `new_T` left by a caller that did not use one.
//!
//! Positional copies rely on the planned column list having exactly the
//! introspected order. [`plan_columns`] only ever rewrites columns in place.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::catalog::{Catalog, ColumnInfo, TableSchema};
use crate::config::StagingSettings;
use crate::error::{RelinkError, RelinkResult};
use crate::sql::{quote_ident, quote_list, CreateTable, DropTable, RenameTable};

/// How rows move from the old table to the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyMode {
    /// `SELECT *`: the new table has the same columns in the same positions.
    Positional,
    /// Copy only these columns, matched by name.
    Named(Vec<String>),
}

/// A planned rewrite of one table.
#[derive(Debug, Clone)]
pub struct TableRewrite {
    /// The final definition, named after the table being rewritten.
    pub definition: CreateTable,
    pub copy: CopyMode,
}

impl TableRewrite {
    /// Rewrite keeping every column in place.
    pub fn positional(definition: CreateTable) -> Self {
        Self {
            definition,
            copy: CopyMode::Positional,
        }
    }

    /// Rewrite copying the given columns by name.
    pub fn named(definition: CreateTable, columns: Vec<String>) -> Self {
        Self {
            definition,
            copy: CopyMode::Named(columns),
        }
    }

    /// The table being rewritten.
    pub fn table(&self) -> &str {
        &self.definition.name
    }
}

/// What the primary key column should reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryKeyLink {
    /// The key references the identifier table.
    Identifier,
    /// The key references nothing.
    SelfContained,
}

/// Inputs for [`plan_columns`].
#[derive(Debug, Clone)]
pub struct ColumnPlan<'a> {
    pub primary_key: PrimaryKeyLink,
    /// Column -> confirmed owner table.
    pub relations: &'a BTreeMap<String, String>,
    pub staging: &'a StagingSettings,
}

/// Build the amended definition of a table.
///
/// Columns keep their name, type, position, NOT NULL, DEFAULT and primary
/// key flag. References are recomputed:
///
/// - a column in `relations` references its confirmed owner;
/// - any other column keeps the concrete foreign keys it already has;
/// - references to the identifier table are dropped, except on a
///   single-column primary key under [`PrimaryKeyLink::Identifier`].
///
/// Composite primary keys never reference the identifier table.
pub fn plan_columns(schema: &TableSchema, plan: &ColumnPlan<'_>) -> CreateTable {
    let uid_table = plan.staging.uid_table.as_str();
    let key_column = plan.staging.key_column.as_str();
    let mut table = schema.definition();

    for col in &mut table.columns {
        let mut planned = col.clone().without_references_to(uid_table);

        if let Some(owner) = plan.relations.get(&col.name) {
            planned = planned.without_references().references(owner, Some(key_column));
        }

        if col.primary_key && plan.primary_key == PrimaryKeyLink::Identifier {
            planned = planned.references(uid_table, Some(key_column));
        }

        *col = planned;
    }

    table
        .constraints
        .retain(|c| c.referenced_table() != Some(uid_table));

    table
}

/// Applies [`TableRewrite`]s on a connection or transaction.
pub struct TableRewriter<'c> {
    conn: &'c Connection,
    staging: &'c StagingSettings,
}

impl<'c> TableRewriter<'c> {
    pub fn new(conn: &'c Connection, staging: &'c StagingSettings) -> Self {
        Self { conn, staging }
    }

    /// Recreate the table with the planned definition and swap it in.
    ///
    /// Indexes and triggers of the old table are recreated on the new one.
    /// Returns `false` without touching the database when the plan equals
    /// the current definition.
    pub fn apply(&self, rewrite: &TableRewrite) -> RelinkResult<bool> {
        let catalog = Catalog::new(self.conn);
        let table = rewrite.table();
        let current = catalog.table(table)?;

        if rewrite.copy == CopyMode::Positional && current.definition() == rewrite.definition {
            debug!(table, "schema unchanged, skipping rewrite");
            return Ok(false);
        }

        let staged = self.staging.temp_name(table);
        if catalog.table_exists(&staged)? {
            return Err(RelinkError::InterruptedRewrite {
                table: table.to_string(),
                staging: staged,
            });
        }

        let copy_sql = match &rewrite.copy {
            CopyMode::Positional => {
                if current.columns.len() != rewrite.definition.columns.len() {
                    return Err(RelinkError::ColumnCountMismatch {
                        table: table.to_string(),
                        expected: current.columns.len(),
                        actual: rewrite.definition.columns.len(),
                    });
                }
                format!(
                    "INSERT INTO {} SELECT * FROM {}",
                    quote_ident(&staged)?,
                    quote_ident(table)?
                )
            }
            CopyMode::Named(columns) => {
                if let Some(missing) = columns.iter().find(|c| {
                    !current.has_column(c) || rewrite.definition.find_column(c).is_none()
                }) {
                    return Err(RelinkError::UnknownColumn {
                        table: table.to_string(),
                        column: missing.clone(),
                    });
                }
                let list = quote_list(columns)?;
                format!(
                    "INSERT INTO {} ({}) SELECT {} FROM {}",
                    quote_ident(&staged)?,
                    list,
                    list,
                    quote_ident(table)?
                )
            }
        };

        if let Some(sql) = catalog.table_sql(table)? {
            for clause in unreplayable_clauses(&sql) {
                warn!(table, clause, "table declares a clause that is not carried over by the rewrite");
            }
        }
        let dependents = catalog.dependent_sql(table)?;

        let create_sql = rewrite.definition.renamed(&staged).to_sql()?;
        debug!(table, sql = %create_sql, "creating replacement table");
        self.conn.execute_batch(&create_sql)?;
        self.conn.execute(&copy_sql, [])?;

        let source_rows = catalog.row_count(table)?;
        let copied = catalog.row_count(&staged)?;
        if source_rows != copied {
            return Err(RelinkError::RowCountMismatch {
                table: table.to_string(),
                source_rows,
                copied,
            });
        }

        self.conn.execute_batch(&DropTable::new(table).to_sql()?)?;
        self.conn
            .execute_batch(&RenameTable::new(&staged, table).to_sql()?)?;
        for sql in &dependents {
            debug!(table, sql = %sql, "recreating index or trigger");
            self.conn.execute_batch(sql)?;
        }

        debug!(table, rows = copied, dependents = dependents.len(), "table rewritten");
        Ok(true)
    }
}

/// CHECK and COLLATE clauses cannot be read back through the pragmas.
fn unreplayable_clauses(table_sql: &str) -> Vec<&'static str> {
    let upper = table_sql.to_ascii_uppercase();
    let mut found = Vec::new();
    if upper.contains("CHECK(") || upper.contains("CHECK (") {
        found.push("CHECK");
    }
    if upper.contains(" COLLATE ") {
        found.push("COLLATE");
    }
    found
}

fn same_shape(a: &[ColumnInfo], b: &[ColumnInfo]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.name == y.name
                && x.sql_type.eq_ignore_ascii_case(&y.sql_type)
                && x.not_null == y.not_null
                && x.pk == y.pk
                && x.default == y.default
        })
}

/// Drop replacement tables left behind by an interrupted rewrite.
///
/// Only `new_T` for a `T` in `candidates` is considered. It is dropped when
/// `T` exists with the same columns (name, type, NOT NULL, key, default) and
/// every row of `new_T` is also in `T`. A `new_T` holding rows `T` lacks is
/// left alone with a warning. Returns the dropped table names.
pub fn recover_interrupted(
    conn: &Connection,
    staging: &StagingSettings,
    candidates: &BTreeSet<String>,
) -> RelinkResult<Vec<String>> {
    let catalog = Catalog::new(conn);
    let mut dropped = Vec::new();

    for original in candidates {
        let staged = staging.temp_name(original);
        if !catalog.table_exists(original)? || !catalog.table_exists(&staged)? {
            continue;
        }

        let staged_columns = catalog.columns(&staged)?;
        if !same_shape(&staged_columns, &catalog.columns(original)?) {
            continue;
        }

        let extra_sql = format!(
            "SELECT COUNT(*) FROM (SELECT * FROM {} EXCEPT SELECT * FROM {})",
            quote_ident(&staged)?,
            quote_ident(original)?
        );
        let extra: i64 = conn.query_row(&extra_sql, [], |row| row.get(0))?;
        if extra > 0 {
            warn!(
                table = %original,
                leftover = %staged,
                rows = extra,
                "leftover table holds rows missing from the original, leaving it in place"
            );
            continue;
        }

        warn!(
            table = %original,
            leftover = %staged,
            "dropping leftover table from an interrupted rewrite"
        );
        conn.execute_batch(&DropTable::new(&staged).to_sql()?)?;
        dropped.push(staged);
    }

    Ok(dropped)
}
