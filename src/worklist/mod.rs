//! Relation worklist.
//!
//! The generator writes one row per declared cross-reference into a staging
//! table. The pipeline loads it once into an owned [`Worklist`] and threads
//! that value through discovery, materialization and validation. Every
//! in-memory change is mirrored to the staging table on the connection the
//! caller passes, so a claim disappears from disk in the same transaction
//! that materializes it and an interrupted run resumes where it stopped.

use std::collections::BTreeMap;

use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::RelinkResult;
use crate::sql::{quote_ident, DropTable};

/// An unverified claim: `table.field` references rows of `declared`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RelationClaim {
    pub table: String,
    pub field: String,
    pub declared: String,
}

impl RelationClaim {
    pub fn new(
        table: impl Into<String>,
        field: impl Into<String>,
        declared: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            field: field.into(),
            declared: declared.into(),
        }
    }
}

impl std::fmt::Display for RelationClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}) -> {}", self.table, self.field, self.declared)
    }
}

/// What happened to the worklist at the end of validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "claims", rename_all = "snake_case")]
pub enum WorklistOutcome {
    /// There was no worklist to begin with.
    Absent,
    /// Every claim was resolved and the staging table was dropped.
    Dropped,
    /// Claims remain; the staging table is kept for a later run.
    Pending(Vec<RelationClaim>),
}

impl WorklistOutcome {
    /// Number of unresolved claims.
    pub fn pending(&self) -> usize {
        match self {
            WorklistOutcome::Pending(claims) => claims.len(),
            WorklistOutcome::Absent | WorklistOutcome::Dropped => 0,
        }
    }
}

/// Pending relation claims, ordered by (table, field, declared).
#[derive(Debug, Clone)]
pub struct Worklist {
    staging_table: String,
    claims: Vec<RelationClaim>,
}

impl Worklist {
    /// Load the worklist from its staging table.
    ///
    /// Returns `None` when the staging table does not exist, which means a
    /// previous run already drained and dropped it.
    pub fn load(conn: &Connection, staging_table: &str) -> RelinkResult<Option<Self>> {
        if !Catalog::new(conn).table_exists(staging_table)? {
            return Ok(None);
        }

        let sql = format!(
            "SELECT table_name, field_name, foreign_table FROM {}",
            quote_ident(staging_table)?
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut claims = stmt
            .query_map([], |row| {
                Ok(RelationClaim {
                    table: row.get(0)?,
                    field: row.get(1)?,
                    declared: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        claims.sort();
        claims.dedup();

        debug!(table = staging_table, claims = claims.len(), "loaded worklist");
        Ok(Some(Self {
            staging_table: staging_table.to_string(),
            claims,
        }))
    }

    /// Build a worklist from claims without reading the database.
    pub fn from_claims(
        staging_table: impl Into<String>,
        claims: impl IntoIterator<Item = RelationClaim>,
    ) -> Self {
        let mut claims: Vec<_> = claims.into_iter().collect();
        claims.sort();
        claims.dedup();
        Self {
            staging_table: staging_table.into(),
            claims,
        }
    }

    /// Name of the persisted staging table.
    pub fn staging_table(&self) -> &str {
        &self.staging_table
    }

    /// All pending claims.
    pub fn claims(&self) -> &[RelationClaim] {
        &self.claims
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Pending claims grouped by table.
    pub fn by_table(&self) -> BTreeMap<&str, Vec<&RelationClaim>> {
        let mut grouped: BTreeMap<&str, Vec<&RelationClaim>> = BTreeMap::new();
        for claim in &self.claims {
            grouped.entry(claim.table.as_str()).or_default().push(claim);
        }
        grouped
    }

    /// Remove the claims of `table` that `confirmed` (field -> owner) settles.
    ///
    /// A claim is settled when its field is confirmed to the table it
    /// declared. Deleted rows are removed from the staging table on `conn`,
    /// which should be the transaction that materialized them.
    pub fn resolve(
        &mut self,
        conn: &Connection,
        table: &str,
        confirmed: &BTreeMap<String, String>,
    ) -> RelinkResult<Vec<RelationClaim>> {
        let (settled, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.claims).into_iter().partition(|c| {
                c.table == table && confirmed.get(&c.field) == Some(&c.declared)
            });
        self.claims = pending;

        if !settled.is_empty() && Catalog::new(conn).table_exists(&self.staging_table)? {
            let sql = format!(
                "DELETE FROM {} WHERE table_name = ? AND field_name = ? AND foreign_table = ?",
                quote_ident(&self.staging_table)?
            );
            let mut stmt = conn.prepare(&sql)?;
            for claim in &settled {
                stmt.execute(params![claim.table, claim.field, claim.declared])?;
            }
        }

        Ok(settled)
    }

    /// Point the claim for `table.field` at another table.
    ///
    /// Used by one-off corrections that restructure the target of a
    /// reference. Returns false when no claim matches.
    pub fn retarget(
        &mut self,
        conn: &Connection,
        table: &str,
        field: &str,
        foreign_table: &str,
    ) -> RelinkResult<bool> {
        let mut changed = false;
        for claim in self
            .claims
            .iter_mut()
            .filter(|c| c.table == table && c.field == field)
        {
            claim.declared = foreign_table.to_string();
            changed = true;
        }
        if !changed {
            return Ok(false);
        }
        self.claims.sort();
        self.claims.dedup();

        if Catalog::new(conn).table_exists(&self.staging_table)? {
            let sql = format!(
                "UPDATE {} SET foreign_table = ? WHERE table_name = ? AND field_name = ?",
                quote_ident(&self.staging_table)?
            );
            conn.execute(&sql, params![foreign_table, table, field])?;
        }
        Ok(true)
    }

    /// Drop the staging table if nothing is left, otherwise report and keep it.
    pub fn finalize(self, conn: &Connection) -> RelinkResult<WorklistOutcome> {
        if self.claims.is_empty() {
            conn.execute_batch(&DropTable::new(&self.staging_table).if_exists().to_sql()?)?;
            info!(table = %self.staging_table, "all relations resolved, worklist dropped");
            return Ok(WorklistOutcome::Dropped);
        }

        warn!(
            count = self.claims.len(),
            "the following relations were not addressed"
        );
        for claim in &self.claims {
            warn!(
                table = %claim.table,
                field = %claim.field,
                declared = %claim.declared,
                "unresolved relation"
            );
        }
        Ok(WorklistOutcome::Pending(self.claims))
    }
}
