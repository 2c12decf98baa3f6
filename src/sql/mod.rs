//! SQL generation for SQLite schema surgery.
//!
//! - [`ddl`]: CREATE / DROP / RENAME builders
//! - [`ident`]: identifier validation and quoting

pub mod ddl;
pub mod ident;

pub use ddl::{
    ColumnDef, CreateTable, DropTable, ForeignRef, ReferentialAction, RenameTable,
    TableConstraint,
};
pub use ident::{quote_ident, quote_list, validate_identifier};
