//! DDL (Data Definition Language) builders for SQLite.
//!
//! Only the statements the recreate-copy-swap cycle needs: CREATE TABLE
//! with column and table constraints, DROP TABLE, and ALTER TABLE ... RENAME.
//! All identifiers are quoted on render.
//!
//! # Examples
//!
//! ```
//! use relink::sql::ddl::{ColumnDef, CreateTable};
//!
//! let table = CreateTable::new("experiment")
//!     .column(
//!         ColumnDef::new("uid", Some("TEXT"))
//!             .primary_key()
//!             .not_null()
//!             .references("uids", Some("uid")),
//!     )
//!     .column(ColumnDef::new("egid", Some("TEXT")).references("exptgroup", Some("uid")));
//!
//! let sql = table.to_sql().unwrap();
//! assert!(sql.contains("REFERENCES \"exptgroup\" (\"uid\")"));
//! ```

use serde::Serialize;

use super::ident::{quote_ident, quote_list};
use crate::error::RelinkResult;

// ============================================================================
// CREATE TABLE
// ============================================================================

/// CREATE TABLE statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[must_use = "DDL statements have no effect until converted to SQL with to_sql()"]
pub struct CreateTable {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<TableConstraint>,
}

impl CreateTable {
    /// Create a new CREATE TABLE statement.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Add a column definition.
    pub fn column(mut self, col: ColumnDef) -> Self {
        self.columns.push(col);
        self
    }

    /// Add multiple column definitions.
    pub fn columns(mut self, cols: impl IntoIterator<Item = ColumnDef>) -> Self {
        self.columns.extend(cols);
        self
    }

    /// Add a table constraint.
    pub fn constraint(mut self, constraint: TableConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// The same definition under another table name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Look up a column by name.
    pub fn find_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Render the statement.
    pub fn to_sql(&self) -> RelinkResult<String> {
        let mut parts = Vec::with_capacity(self.columns.len() + self.constraints.len());
        for col in &self.columns {
            parts.push(col.to_sql()?);
        }
        for constraint in &self.constraints {
            parts.push(constraint.to_sql()?);
        }

        Ok(format!(
            "CREATE TABLE {} (\n  {}\n)",
            quote_ident(&self.name)?,
            parts.join(",\n  ")
        ))
    }
}

// ============================================================================
// Column Definition
// ============================================================================

/// Column definition for CREATE TABLE.
///
/// References are kept sorted so that two definitions describing the same
/// constraints compare equal regardless of the order SQLite reports them in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    /// Declared type, verbatim. SQLite allows columns without one.
    pub data_type: Option<String>,
    pub primary_key: bool,
    pub not_null: bool,
    pub unique: bool,
    /// Default expression text, verbatim.
    pub default: Option<String>,
    pub references: Vec<ForeignRef>,
}

impl ColumnDef {
    /// Create a new column definition.
    pub fn new(name: impl Into<String>, data_type: Option<&str>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            primary_key: false,
            not_null: false,
            unique: false,
            default: None,
            references: Vec::new(),
        }
    }

    /// Mark column as NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Add PRIMARY KEY constraint.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Add UNIQUE constraint.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set default expression.
    pub fn default(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Add a REFERENCES constraint.
    pub fn references(self, table: impl Into<String>, column: Option<&str>) -> Self {
        self.reference(ForeignRef::new(table, column))
    }

    /// Add a fully specified REFERENCES constraint.
    pub fn reference(mut self, reference: ForeignRef) -> Self {
        if let Err(pos) = self.references.binary_search(&reference) {
            self.references.insert(pos, reference);
        }
        self
    }

    /// Remove every reference to `table`.
    pub fn without_references_to(mut self, table: &str) -> Self {
        self.references.retain(|r| r.table != table);
        self
    }

    /// Remove all references.
    pub fn without_references(mut self) -> Self {
        self.references.clear();
        self
    }

    /// Check whether the column references `table`.
    pub fn references_table(&self, table: &str) -> bool {
        self.references.iter().any(|r| r.table == table)
    }

    /// Render the column definition.
    pub fn to_sql(&self) -> RelinkResult<String> {
        let mut sql = quote_ident(&self.name)?;

        if let Some(ref ty) = self.data_type {
            sql.push(' ');
            sql.push_str(ty);
        }

        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        }

        if self.not_null {
            sql.push_str(" NOT NULL");
        }

        if self.unique {
            sql.push_str(" UNIQUE");
        }

        // PRAGMA table_info reports a parenthesized default without its
        // parentheses, so anything but a plain literal is wrapped again.
        if let Some(ref expr) = self.default {
            if is_literal(expr) {
                sql.push_str(" DEFAULT ");
                sql.push_str(expr);
            } else {
                sql.push_str(&format!(" DEFAULT ({})", expr));
            }
        }

        for reference in &self.references {
            sql.push(' ');
            sql.push_str(&reference.to_sql()?);
        }

        Ok(sql)
    }
}

fn is_literal(expr: &str) -> bool {
    let quoted = |q: char| {
        expr.len() >= 2
            && expr.starts_with(q)
            && expr.ends_with(q)
            && !expr[1..expr.len() - 1].replace(&format!("{q}{q}"), "").contains(q)
    };
    let numeric = expr
        .strip_prefix(['-', '+'])
        .unwrap_or(expr)
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.');
    quoted('\'') || quoted('"') || (!expr.is_empty() && numeric)
}

/// A `REFERENCES table (column)` clause.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ForeignRef {
    pub table: String,
    /// Parent column. `None` means the parent's primary key.
    pub column: Option<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

impl ForeignRef {
    /// Create a reference with no referential actions.
    pub fn new(table: impl Into<String>, column: Option<&str>) -> Self {
        Self {
            table: table.into(),
            column: column.map(str::to_string),
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
        }
    }

    /// Set the ON DELETE action.
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    /// Set the ON UPDATE action.
    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = action;
        self
    }

    fn to_sql(&self) -> RelinkResult<String> {
        let mut sql = format!("REFERENCES {}", quote_ident(&self.table)?);
        if let Some(ref column) = self.column {
            sql.push_str(&format!(" ({})", quote_ident(column)?));
        }
        push_actions(&mut sql, self.on_delete, self.on_update);
        Ok(sql)
    }
}

fn push_actions(sql: &mut String, on_delete: ReferentialAction, on_update: ReferentialAction) {
    if on_delete != ReferentialAction::NoAction {
        sql.push_str(" ON DELETE ");
        sql.push_str(on_delete.as_sql());
    }
    if on_update != ReferentialAction::NoAction {
        sql.push_str(" ON UPDATE ");
        sql.push_str(on_update.as_sql());
    }
}

/// Referential action for foreign key constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// Parse the spelling used by `PRAGMA foreign_key_list`.
    ///
    /// Unknown spellings map to `NoAction`, which is SQLite's default.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "RESTRICT" => ReferentialAction::Restrict,
            "CASCADE" => ReferentialAction::Cascade,
            "SET NULL" => ReferentialAction::SetNull,
            "SET DEFAULT" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }

    /// SQL spelling.
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

// ============================================================================
// Table Constraints
// ============================================================================

/// Table-level constraints.
///
/// Used for what a column clause cannot express: composite primary keys,
/// composite UNIQUE constraints and multi-column foreign keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TableConstraint {
    PrimaryKey {
        columns: Vec<String>,
    },
    Unique {
        columns: Vec<String>,
    },
    ForeignKey {
        columns: Vec<String>,
        references_table: String,
        references_columns: Vec<String>,
        on_delete: ReferentialAction,
        on_update: ReferentialAction,
    },
}

impl TableConstraint {
    /// Create a PRIMARY KEY constraint.
    pub fn primary_key(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        TableConstraint::PrimaryKey {
            columns: columns.into_iter().map(|c| c.into()).collect(),
        }
    }

    /// Create a UNIQUE constraint.
    pub fn unique(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        TableConstraint::Unique {
            columns: columns.into_iter().map(|c| c.into()).collect(),
        }
    }

    /// Create a FOREIGN KEY constraint.
    pub fn foreign_key(
        columns: impl IntoIterator<Item = impl Into<String>>,
        references_table: impl Into<String>,
        references_columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        TableConstraint::ForeignKey {
            columns: columns.into_iter().map(|c| c.into()).collect(),
            references_table: references_table.into(),
            references_columns: references_columns.into_iter().map(|c| c.into()).collect(),
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
        }
    }

    /// Set the ON DELETE / ON UPDATE actions of a foreign key.
    pub fn with_actions(mut self, delete: ReferentialAction, update: ReferentialAction) -> Self {
        if let TableConstraint::ForeignKey {
            on_delete,
            on_update,
            ..
        } = &mut self
        {
            *on_delete = delete;
            *on_update = update;
        }
        self
    }

    /// The table this constraint points at, if it is a foreign key.
    pub fn referenced_table(&self) -> Option<&str> {
        match self {
            TableConstraint::ForeignKey {
                references_table, ..
            } => Some(references_table),
            TableConstraint::PrimaryKey { .. } | TableConstraint::Unique { .. } => None,
        }
    }

    /// Render the constraint.
    pub fn to_sql(&self) -> RelinkResult<String> {
        match self {
            TableConstraint::PrimaryKey { columns } => {
                Ok(format!("PRIMARY KEY ({})", quote_list(columns)?))
            }
            TableConstraint::Unique { columns } => Ok(format!("UNIQUE ({})", quote_list(columns)?)),
            TableConstraint::ForeignKey {
                columns,
                references_table,
                references_columns,
                on_delete,
                on_update,
            } => {
                let mut sql = format!(
                    "FOREIGN KEY ({}) REFERENCES {}",
                    quote_list(columns)?,
                    quote_ident(references_table)?
                );
                if !references_columns.is_empty() {
                    sql.push_str(&format!(" ({})", quote_list(references_columns)?));
                }
                push_actions(&mut sql, *on_delete, *on_update);
                Ok(sql)
            }
        }
    }
}

// ============================================================================
// DROP TABLE / RENAME
// ============================================================================

/// DROP TABLE statement.
#[derive(Debug, Clone)]
#[must_use = "DDL statements have no effect until converted to SQL with to_sql()"]
pub struct DropTable {
    pub name: String,
    pub if_exists: bool,
}

impl DropTable {
    /// Create a new DROP TABLE statement.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            if_exists: false,
        }
    }

    /// Add IF EXISTS clause.
    pub fn if_exists(mut self) -> Self {
        self.if_exists = true;
        self
    }

    /// Render the statement.
    pub fn to_sql(&self) -> RelinkResult<String> {
        let guard = if self.if_exists { "IF EXISTS " } else { "" };
        Ok(format!("DROP TABLE {}{}", guard, quote_ident(&self.name)?))
    }
}

/// ALTER TABLE ... RENAME TO statement.
#[derive(Debug, Clone)]
#[must_use = "DDL statements have no effect until converted to SQL with to_sql()"]
pub struct RenameTable {
    pub from: String,
    pub to: String,
}

impl RenameTable {
    /// Create a new rename statement.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Render the statement.
    pub fn to_sql(&self) -> RelinkResult<String> {
        Ok(format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&self.from)?,
            quote_ident(&self.to)?
        ))
    }
}

// ============================================================================
// Tests
// ============================================================================
