//! Schema introspection.
//!
//! The catalog is the only place table and column names come from before
//! they are interpolated into DDL. Pragmas are queried through their
//! table-valued forms so the table name is bound, not formatted.
//!
//! ```text
//! sqlite_master            -> list_tables()
//! pragma_table_info(?)     -> columns()
//! pragma_foreign_key_list  -> foreign_keys()
//! pragma_index_list/info   -> unique_constraints()
//! sqlite_master (index)    -> dependent_sql()
//! ```

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::{RelinkError, RelinkResult};
use crate::sql::{ColumnDef, CreateTable, ForeignRef, ReferentialAction, TableConstraint};

/// Column metadata as reported by `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    /// Position in the table, starting at 0.
    pub cid: i64,
    pub name: String,
    /// Declared type, may be empty.
    pub sql_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    /// 1-based position within the primary key, 0 if not part of it.
    pub pk: i64,
}

/// One column pair of a foreign key, as reported by `PRAGMA foreign_key_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyInfo {
    /// Constraint id; rows sharing an id form one (possibly composite) key.
    pub id: i64,
    pub seq: i64,
    /// Parent table.
    pub table: String,
    pub from: String,
    /// Parent column, `None` when the parent's primary key is implied.
    pub to: Option<String>,
    pub on_update: String,
    pub on_delete: String,
}

/// Everything the rewriter needs to know about one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    pub name: String,
    /// Columns in `cid` order.
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    /// Column sets of UNIQUE constraints declared in the table body.
    pub unique: Vec<Vec<String>>,
}

impl TableSchema {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check whether a column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Column names in positional order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Primary key columns ordered by their key position.
    pub fn primary_key(&self) -> Vec<&ColumnInfo> {
        let mut pk: Vec<_> = self.columns.iter().filter(|c| c.pk > 0).collect();
        pk.sort_by_key(|c| c.pk);
        pk
    }

    /// The primary key column when the key is a single column.
    pub fn single_primary_key(&self) -> Option<&ColumnInfo> {
        match self.primary_key().as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Check whether `column` alone is this table's primary key.
    pub fn is_keyed_by(&self, column: &str) -> bool {
        self.single_primary_key()
            .map(|c| c.name == column)
            .unwrap_or(false)
    }

    /// Foreign keys grouped by constraint id.
    pub fn foreign_key_groups(&self) -> BTreeMap<i64, Vec<&ForeignKeyInfo>> {
        let mut groups: BTreeMap<i64, Vec<&ForeignKeyInfo>> = BTreeMap::new();
        for fk in &self.foreign_keys {
            groups.entry(fk.id).or_default().push(fk);
        }
        for group in groups.values_mut() {
            group.sort_by_key(|fk| fk.seq);
        }
        groups
    }

    /// Single-column foreign keys declared on `column`.
    pub fn references_of(&self, column: &str) -> Vec<ForeignRef> {
        self.foreign_key_groups()
            .into_values()
            .filter_map(|group| match group.as_slice() {
                [fk] if fk.from == column => Some(foreign_ref(fk)),
                _ => None,
            })
            .collect()
    }

    /// The table exactly as it is declared now.
    ///
    /// Single-column foreign keys and UNIQUE constraints become column
    /// clauses. Composite ones become table constraints.
    pub fn definition(&self) -> CreateTable {
        let single_pk = self.single_primary_key().map(|c| c.name.clone());
        let unique_columns: Vec<&str> = self
            .unique
            .iter()
            .filter_map(|cols| match cols.as_slice() {
                [only] => Some(only.as_str()),
                _ => None,
            })
            .collect();

        let columns = self.columns.iter().map(|info| {
            let mut col = ColumnDef::new(&info.name, Some(info.sql_type.as_str()));
            if single_pk.as_deref() == Some(info.name.as_str()) {
                col = col.primary_key();
            }
            if info.not_null {
                col = col.not_null();
            }
            if unique_columns.contains(&info.name.as_str()) {
                col = col.unique();
            }
            if let Some(ref expr) = info.default {
                col = col.default(expr.clone());
            }
            self.references_of(&info.name)
                .into_iter()
                .fold(col, |col, r| col.reference(r))
        });

        let mut table = CreateTable::new(&self.name).columns(columns);

        let pk = self.primary_key();
        if pk.len() > 1 {
            table = table.constraint(TableConstraint::primary_key(
                pk.iter().map(|c| c.name.clone()),
            ));
        }

        for cols in self.unique.iter().filter(|cols| cols.len() > 1) {
            table = table.constraint(TableConstraint::unique(cols.iter().cloned()));
        }

        for group in self.foreign_key_groups().into_values() {
            if group.len() < 2 {
                continue;
            }
            let first = group[0];
            table = table.constraint(
                TableConstraint::foreign_key(
                    group.iter().map(|fk| fk.from.clone()),
                    first.table.clone(),
                    group.iter().filter_map(|fk| fk.to.clone()),
                )
                .with_actions(
                    ReferentialAction::parse(&first.on_delete),
                    ReferentialAction::parse(&first.on_update),
                ),
            );
        }

        table
    }
}

fn foreign_ref(fk: &ForeignKeyInfo) -> ForeignRef {
    ForeignRef::new(&fk.table, fk.to.as_deref())
        .on_delete(ReferentialAction::parse(&fk.on_delete))
        .on_update(ReferentialAction::parse(&fk.on_update))
}

/// Read-only view of the database schema.
pub struct Catalog<'c> {
    conn: &'c Connection,
}

impl<'c> Catalog<'c> {
    /// Create a catalog over a connection (or an open transaction).
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// List user tables, sorted by name. Engine-internal tables are skipped.
    pub fn list_tables(&self) -> RelinkResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
             ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(tables)
    }

    /// Check whether a table exists.
    pub fn table_exists(&self, name: &str) -> RelinkResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Columns of a table in positional order.
    ///
    /// The order is load-bearing: positional copies rely on it.
    pub fn columns(&self, table: &str) -> RelinkResult<Vec<ColumnInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT cid, name, type, \"notnull\", dflt_value, pk \
             FROM pragma_table_info(?) ORDER BY cid",
        )?;
        let columns = stmt
            .query_map(params![table], |row| {
                Ok(ColumnInfo {
                    cid: row.get(0)?,
                    name: row.get(1)?,
                    sql_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    not_null: row.get::<_, i64>(3)? != 0,
                    default: row.get(4)?,
                    pk: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    /// Foreign keys declared on a table.
    pub fn foreign_keys(&self, table: &str) -> RelinkResult<Vec<ForeignKeyInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, seq, \"table\", \"from\", \"to\", on_update, on_delete \
             FROM pragma_foreign_key_list(?) ORDER BY id, seq",
        )?;
        let fks = stmt
            .query_map(params![table], |row| {
                Ok(ForeignKeyInfo {
                    id: row.get(0)?,
                    seq: row.get(1)?,
                    table: row.get(2)?,
                    from: row.get(3)?,
                    to: row.get(4)?,
                    on_update: row.get(5)?,
                    on_delete: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(fks)
    }

    /// Column sets of the table's UNIQUE constraints, sorted.
    ///
    /// Only constraint-backed indexes (origin `u`) are reported. Explicit
    /// indexes come from [`Catalog::dependent_sql`].
    pub fn unique_constraints(&self, table: &str) -> RelinkResult<Vec<Vec<String>>> {
        let mut stmt = self.conn.prepare(
            "SELECT il.name, ii.name \
             FROM pragma_index_list(?1) AS il \
             JOIN pragma_index_info(il.name) AS ii \
             WHERE il.origin = 'u' \
             ORDER BY il.name, ii.seqno",
        )?;
        let rows = stmt
            .query_map(params![table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for (index, column) in rows {
            match groups.last_mut() {
                Some((name, cols)) if *name == index => cols.push(column),
                _ => groups.push((index, vec![column])),
            }
        }
        let mut unique: Vec<Vec<String>> = groups.into_iter().map(|(_, cols)| cols).collect();
        unique.sort();
        Ok(unique)
    }

    /// Stored `CREATE INDEX` and `CREATE TRIGGER` statements attached to a
    /// table, indexes first. Dropping the table drops all of these.
    pub fn dependent_sql(&self, table: &str) -> RelinkResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT sql FROM sqlite_master \
             WHERE type IN ('index', 'trigger') AND tbl_name = ? AND sql IS NOT NULL \
             ORDER BY type, name",
        )?;
        let sql = stmt
            .query_map(params![table], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(sql)
    }

    /// The `CREATE TABLE` text SQLite stored for a table.
    pub fn table_sql(&self, table: &str) -> RelinkResult<Option<String>> {
        let sql = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(sql)
    }

    /// Complete schema of one table.
    ///
    /// Fails with [`RelinkError::UnknownTable`] if the table does not exist.
    pub fn table(&self, name: &str) -> RelinkResult<TableSchema> {
        if !self.table_exists(name)? {
            return Err(RelinkError::UnknownTable(name.to_string()));
        }
        Ok(TableSchema {
            name: name.to_string(),
            columns: self.columns(name)?,
            foreign_keys: self.foreign_keys(name)?,
            unique: self.unique_constraints(name)?,
        })
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> RelinkResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}",
            crate::sql::quote_ident(table)?
        );
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }
}
