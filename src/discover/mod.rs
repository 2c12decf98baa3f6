//! Relation discovery.
//!
//! Declared cross-reference types in the source format are advisory. Several
//! tables share the uid namespace, so only the data proves which table a
//! column actually points to. For every worklist claim the discoverer joins
//! the column against the identifier table and looks at the distinct owners:
//!
//! | owners observed          | verdict                                   |
//! |--------------------------|-------------------------------------------|
//! | none                     | no evidence, see [`UnpopulatedPolicy`]    |
//! | one, equal to the hint   | confirmed                                 |
//! | one, different           | contradicted, left for manual review      |
//! | several                  | ambiguous, left for manual review         |
//!
//! A column claimed more than once with different hints is never confirmed;
//! each of its claims is reported as conflicting.
//!
//! Conflicts are accumulated and logged; one bad claim never stops the rest.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, TableSchema};
use crate::config::StagingSettings;
use crate::error::{RelinkError, RelinkResult};
use crate::sql::quote_ident;
use crate::worklist::{RelationClaim, Worklist};

/// Policy for claims whose column holds no resolvable uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnpopulatedPolicy {
    /// Materialize the declared hint; nothing contradicts it.
    #[default]
    AcceptHint,
    /// Leave the claim pending until data proves it.
    Defer,
}

/// Why a claim could not be confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The only observed owner differs from the hint.
    Contradicted,
    /// More than one owner was observed.
    Ambiguous,
    /// No evidence and the policy is [`UnpopulatedPolicy::Defer`].
    Unpopulated,
    /// The claimed table does not exist.
    UnknownTable,
    /// The claimed column does not exist.
    UnknownColumn,
    /// The owner table does not exist.
    UnknownTarget,
    /// The owner table is not keyed by the key column.
    UnkeyedTarget,
    /// The same column is claimed with more than one hint.
    ConflictingHints,
}

impl ConflictKind {
    /// Short label used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Contradicted => "contradicted",
            ConflictKind::Ambiguous => "ambiguous",
            ConflictKind::Unpopulated => "unpopulated",
            ConflictKind::UnknownTable => "unknown table",
            ConflictKind::UnknownColumn => "unknown column",
            ConflictKind::UnknownTarget => "unknown target",
            ConflictKind::UnkeyedTarget => "unkeyed target",
            ConflictKind::ConflictingHints => "conflicting hints",
        }
    }
}

/// A claim the evidence does not support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationConflict {
    pub claim: RelationClaim,
    pub kind: ConflictKind,
    /// Owner tables actually observed in the data.
    pub observed: Vec<String>,
}

impl std::fmt::Display for RelationConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}): {:?} ({}) [{}]",
            self.claim.table,
            self.claim.field,
            self.observed,
            self.claim.declared,
            self.kind.as_str()
        )
    }
}

/// Result of a discovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Discovery {
    /// Per table: column -> confirmed owner table.
    ///
    /// Every table named by the worklist has an entry, possibly empty, so
    /// that it is rewritten even when none of its claims were confirmed.
    pub confirmed: BTreeMap<String, BTreeMap<String, String>>,
    pub conflicts: Vec<RelationConflict>,
}

impl Discovery {
    /// Number of confirmed relations across all tables.
    pub fn confirmed_count(&self) -> usize {
        self.confirmed.values().map(BTreeMap::len).sum()
    }
}

/// Verifies declared relations against the populated data.
pub struct RelationDiscoverer<'c> {
    conn: &'c Connection,
    staging: &'c StagingSettings,
    policy: UnpopulatedPolicy,
}

impl<'c> RelationDiscoverer<'c> {
    pub fn new(conn: &'c Connection, staging: &'c StagingSettings) -> Self {
        Self {
            conn,
            staging,
            policy: UnpopulatedPolicy::default(),
        }
    }

    /// Set the policy for claims without evidence.
    pub fn with_policy(mut self, policy: UnpopulatedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Classify every claim on the worklist.
    ///
    /// Fails only if the identifier table is missing or SQLite errors.
    pub fn discover(&self, worklist: &Worklist) -> RelinkResult<Discovery> {
        let catalog = Catalog::new(self.conn);
        if !catalog.table_exists(&self.staging.uid_table)? {
            return Err(RelinkError::MissingStagingTable(
                self.staging.uid_table.clone(),
            ));
        }

        let tables: BTreeSet<String> = catalog.list_tables()?.into_iter().collect();
        let mut schemas: BTreeMap<String, TableSchema> = BTreeMap::new();
        let mut discovery = Discovery::default();

        for (table, claims) in worklist.by_table() {
            let confirmed = discovery.confirmed.entry(table.to_string()).or_default();

            let mut by_field: BTreeMap<&str, Vec<&RelationClaim>> = BTreeMap::new();
            for claim in claims {
                by_field.entry(claim.field.as_str()).or_default().push(claim);
            }

            for (field, claims) in by_field {
                let verdicts = match claims.as_slice() {
                    [claim] => vec![self.classify(&catalog, &tables, &mut schemas, claim)?],
                    _ => self.conflicting(&catalog, &tables, &mut schemas, &claims)?,
                };

                for verdict in verdicts {
                    match verdict {
                        Ok(owner) => {
                            debug!(table, field, owner = %owner, "relation confirmed");
                            confirmed.insert(field.to_string(), owner);
                        }
                        Err(conflict) => {
                            warn!(
                                table,
                                field,
                                observed = ?conflict.observed,
                                declared = %conflict.claim.declared,
                                kind = conflict.kind.as_str(),
                                "relation not confirmed"
                            );
                            discovery.conflicts.push(conflict);
                        }
                    }
                }
            }
        }

        // A table the catalog does not know cannot be rewritten.
        discovery.confirmed.retain(|table, _| tables.contains(table));

        info!(
            confirmed = discovery.confirmed_count(),
            conflicts = discovery.conflicts.len(),
            "relation discovery finished"
        );
        Ok(discovery)
    }

    /// Distinct owner tables of the uids stored in `table.field`.
    ///
    /// Both names must already have been checked against the catalog.
    pub fn observe(&self, table: &str, field: &str) -> RelinkResult<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT u.table_name FROM {uids} AS u \
             INNER JOIN {table} AS t ON t.{field} = u.{key} \
             WHERE u.table_name IS NOT NULL \
             ORDER BY u.table_name",
            uids = quote_ident(&self.staging.uid_table)?,
            table = quote_ident(table)?,
            field = quote_ident(field)?,
            key = quote_ident(&self.staging.key_column)?,
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let owners = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(owners)
    }

    /// Verdicts for several claims on one column with different hints.
    fn conflicting(
        &self,
        catalog: &Catalog<'_>,
        tables: &BTreeSet<String>,
        schemas: &mut BTreeMap<String, TableSchema>,
        claims: &[&RelationClaim],
    ) -> RelinkResult<Vec<Result<String, RelationConflict>>> {
        let Some(first) = claims.first() else {
            return Ok(Vec::new());
        };
        if !tables.contains(&first.table)
            || !schema_of(catalog, schemas, &first.table)?.has_column(&first.field)
        {
            return claims
                .iter()
                .map(|claim| self.classify(catalog, tables, schemas, claim))
                .collect();
        }

        let observed = self.observe(&first.table, &first.field)?;
        Ok(claims
            .iter()
            .map(|claim| {
                Err(RelationConflict {
                    claim: (*claim).clone(),
                    kind: ConflictKind::ConflictingHints,
                    observed: observed.clone(),
                })
            })
            .collect())
    }

    fn classify(
        &self,
        catalog: &Catalog<'_>,
        tables: &BTreeSet<String>,
        schemas: &mut BTreeMap<String, TableSchema>,
        claim: &RelationClaim,
    ) -> RelinkResult<Result<String, RelationConflict>> {
        let conflict = |kind, observed| RelationConflict {
            claim: claim.clone(),
            kind,
            observed,
        };

        if !tables.contains(&claim.table) {
            return Ok(Err(conflict(ConflictKind::UnknownTable, Vec::new())));
        }
        if !schema_of(catalog, schemas, &claim.table)?.has_column(&claim.field) {
            return Ok(Err(conflict(ConflictKind::UnknownColumn, Vec::new())));
        }

        let observed = self.observe(&claim.table, &claim.field)?;
        let owner = match observed.as_slice() {
            [] => match self.policy {
                UnpopulatedPolicy::AcceptHint => claim.declared.clone(),
                UnpopulatedPolicy::Defer => {
                    return Ok(Err(conflict(ConflictKind::Unpopulated, observed)))
                }
            },
            [only] if *only == claim.declared => only.clone(),
            [_] => return Ok(Err(conflict(ConflictKind::Contradicted, observed))),
            _ => return Ok(Err(conflict(ConflictKind::Ambiguous, observed))),
        };

        if !tables.contains(&owner) {
            return Ok(Err(conflict(ConflictKind::UnknownTarget, observed)));
        }
        if !schema_of(catalog, schemas, &owner)?.is_keyed_by(&self.staging.key_column) {
            return Ok(Err(conflict(ConflictKind::UnkeyedTarget, observed)));
        }

        Ok(Ok(owner))
    }
}

fn schema_of<'s>(
    catalog: &Catalog<'_>,
    schemas: &'s mut BTreeMap<String, TableSchema>,
    table: &str,
) -> RelinkResult<&'s TableSchema> {
    if !schemas.contains_key(table) {
        schemas.insert(table.to_string(), catalog.table(table)?);
    }
    Ok(&schemas[table])
}
