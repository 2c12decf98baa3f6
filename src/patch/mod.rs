//! One-off schema patches.
//!
//! Data-repair scripts for a specific release need a few generic moves:
//! append a column to a table, repoint a stored uid, and change where a
//! pending relation claim points. The business rules stay with the caller;
//! these primitives only guarantee that each move is validated against the
//! catalog, transactional and safe to repeat.

use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::config::StagingSettings;
use crate::error::{RelinkError, RelinkResult};
use crate::rewrite::{TableRewrite, TableRewriter};
use crate::sql::{quote_ident, ColumnDef};
use crate::worklist::Worklist;

/// Append `column` to `table`, keeping every existing row and constraint.
///
/// Returns false when the table already has a column of that name.
pub fn add_column(
    conn: &mut Connection,
    staging: &StagingSettings,
    table: &str,
    column: ColumnDef,
) -> RelinkResult<bool> {
    let tx = conn.transaction()?;
    let schema = Catalog::new(&tx).table(table)?;
    if schema.has_column(&column.name) {
        debug!(table, column = %column.name, "column already present");
        return Ok(false);
    }

    let name = column.name.clone();
    let existing = schema.column_names();
    let definition = schema.definition().column(column);
    TableRewriter::new(&tx, staging).apply(&TableRewrite::named(definition, existing))?;
    tx.commit()?;

    info!(table, column = %name, "column added");
    Ok(true)
}

/// Replace every `from` uid stored in `table.column` with `to`.
///
/// Returns the number of rows changed.
pub fn repoint_reference(
    conn: &Connection,
    table: &str,
    column: &str,
    from: &str,
    to: &str,
) -> RelinkResult<usize> {
    let schema = Catalog::new(conn).table(table)?;
    if !schema.has_column(column) {
        return Err(RelinkError::UnknownColumn {
            table: table.to_string(),
            column: column.to_string(),
        });
    }

    let sql = format!(
        "UPDATE {table} SET {column} = ?1 WHERE {column} = ?2",
        table = quote_ident(table)?,
        column = quote_ident(column)?,
    );
    let changed = conn.execute(&sql, params![to, from])?;
    info!(table, column, from, to, rows = changed, "reference repointed");
    Ok(changed)
}

/// Point the pending claim for `table.field` at `foreign_table`.
///
/// The target must exist. Returns false when there is no worklist or no
/// matching claim.
pub fn retarget_relation(
    conn: &mut Connection,
    staging: &StagingSettings,
    table: &str,
    field: &str,
    foreign_table: &str,
) -> RelinkResult<bool> {
    let tx = conn.transaction()?;
    if !Catalog::new(&tx).table_exists(foreign_table)? {
        return Err(RelinkError::UnknownTable(foreign_table.to_string()));
    }
    let Some(mut worklist) = Worklist::load(&tx, &staging.worklist_table)? else {
        return Ok(false);
    };

    let changed = worklist.retarget(&tx, table, field, foreign_table)?;
    tx.commit()?;

    if changed {
        info!(table, field, foreign_table, "relation retargeted");
    }
    Ok(changed)
}
