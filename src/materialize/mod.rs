//! Relation materialization.
//!
//! Applies a [`Discovery`] table by table: plan the amended columns, swap
//! the table, and strike the settled claims off the worklist, all in one
//! transaction per table.

use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::catalog::Catalog;
use crate::config::StagingSettings;
use crate::discover::Discovery;
use crate::error::RelinkResult;
use crate::rewrite::{plan_columns, ColumnPlan, PrimaryKeyLink, TableRewrite, TableRewriter};
use crate::worklist::{RelationClaim, Worklist};

/// Outcome of a materialization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    /// Tables that were recreated.
    pub rewritten: Vec<String>,
    /// Tables whose schema already matched the plan.
    pub unchanged: Vec<String>,
    /// Claims removed from the worklist.
    pub resolved: Vec<RelationClaim>,
}

/// Materialize every confirmed relation in `discovery`.
pub fn materialize(
    conn: &mut Connection,
    staging: &StagingSettings,
    discovery: &Discovery,
    worklist: &mut Worklist,
) -> RelinkResult<MaterializeReport> {
    let mut report = MaterializeReport::default();

    for (table, relations) in &discovery.confirmed {
        let tx = conn.transaction()?;

        let schema = Catalog::new(&tx).table(table)?;
        let definition = plan_columns(
            &schema,
            &ColumnPlan {
                primary_key: PrimaryKeyLink::Identifier,
                relations,
                staging,
            },
        );

        let changed = TableRewriter::new(&tx, staging).apply(&TableRewrite::positional(definition))?;
        let settled = worklist.resolve(&tx, table, relations)?;
        tx.commit()?;

        info!(
            table = %table,
            relations = relations.len(),
            resolved = settled.len(),
            rewritten = changed,
            "materialized relations"
        );

        if changed {
            report.rewritten.push(table.clone());
        } else {
            report.unchanged.push(table.clone());
        }
        report.resolved.extend(settled);
    }

    Ok(report)
}
