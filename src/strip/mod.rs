//! Identity stripping.
//!
//! Once every reference is typed, the global identifier table is redundant.
//! This pass trusts the foreign keys already recorded on each table rather
//! than sampling data: primary keys stop referencing the identifier table,
//! concrete foreign keys stay, and the identifier table is dropped.
//!
//! Irreversible. After stripping, a bare uid can no longer be traced to its
//! owning table.

use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::config::StagingSettings;
use crate::error::RelinkResult;
use crate::rewrite::{plan_columns, ColumnPlan, PrimaryKeyLink, TableRewrite, TableRewriter};
use crate::sql::DropTable;

/// Outcome of a stripping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StripReport {
    pub rewritten: Vec<String>,
    pub unchanged: Vec<String>,
    /// False when there was no identifier table to drop.
    pub dropped_identifier_table: bool,
}

/// Removes the identifier table and every reference to it.
pub struct IdentityStripper<'s> {
    staging: &'s StagingSettings,
}

impl<'s> IdentityStripper<'s> {
    pub fn new(staging: &'s StagingSettings) -> Self {
        Self { staging }
    }

    /// Rewrite every domain table without identifier references, then drop
    /// the identifier table. Each table is its own transaction.
    pub fn strip(&self, conn: &mut Connection) -> RelinkResult<StripReport> {
        let mut report = StripReport::default();
        let uid_table = &self.staging.uid_table;

        if !Catalog::new(conn).table_exists(uid_table)? {
            debug!(table = %uid_table, "no identifier table, nothing to strip");
            return Ok(report);
        }

        let tables = Catalog::new(conn).list_tables()?;
        let no_relations = BTreeMap::new();

        for table in tables.iter().filter(|t| !self.staging.is_staging(t)) {
            let tx = conn.transaction()?;
            let schema = Catalog::new(&tx).table(table)?;
            let definition = plan_columns(
                &schema,
                &ColumnPlan {
                    primary_key: PrimaryKeyLink::SelfContained,
                    relations: &no_relations,
                    staging: self.staging,
                },
            );
            let changed =
                TableRewriter::new(&tx, self.staging).apply(&TableRewrite::positional(definition))?;
            tx.commit()?;

            if changed {
                report.rewritten.push(table.clone());
            } else {
                report.unchanged.push(table.clone());
            }
        }

        let tx = conn.transaction()?;
        tx.execute_batch(&DropTable::new(uid_table).to_sql()?)?;
        tx.commit()?;
        report.dropped_identifier_table = true;

        info!(
            rewritten = report.rewritten.len(),
            unchanged = report.unchanged.len(),
            "identifier table stripped"
        );
        Ok(report)
    }
}
