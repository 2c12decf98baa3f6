//! End-to-end consistency pass.
//!
//! ```text
//! open ─► load worklist ─► recover ─► discover ─► materialize ─► validate ─► strip?
//! ```
//!
//! Every step is idempotent, so the whole pipeline can be re-run after an
//! interruption or on an already processed database.
//!
//! Dropping a referenced table during a swap only works with foreign-key
//! enforcement off. [`run`] and [`strip`] switch it off for their duration
//! and restore it afterwards.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::StagingSettings;
use crate::discover::{Discovery, RelationDiscoverer, UnpopulatedPolicy};
use crate::error::{RelinkError, RelinkResult};
use crate::materialize::{materialize, MaterializeReport};
use crate::rewrite::recover_interrupted;
use crate::strip::{IdentityStripper, StripReport};
use crate::validate::{IntegrityReport, IntegrityValidator};
use crate::worklist::Worklist;

/// Open an existing database for rewriting.
///
/// Never creates a file. Foreign-key enforcement is switched off so a
/// referenced table can be dropped during a swap; the validator audits
/// integrity explicitly instead.
pub fn open(path: impl AsRef<Path>) -> RelinkResult<Connection> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(RelinkError::DatabaseNotFound(path.to_path_buf()));
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
    Ok(conn)
}

/// Run `f` with foreign-key enforcement off, restoring it afterwards.
///
/// The pragma is a no-op inside a transaction, so an open transaction with
/// enforcement on is an error.
fn with_foreign_keys_off<T>(
    conn: &mut Connection,
    f: impl FnOnce(&mut Connection) -> RelinkResult<T>,
) -> RelinkResult<T> {
    let enforced: bool = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    if !enforced {
        return f(conn);
    }
    if !conn.is_autocommit() {
        return Err(RelinkError::ForeignKeysEnforced);
    }

    debug!("switching off foreign key enforcement");
    conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
    let result = f(conn);
    let restored = conn.execute_batch("PRAGMA foreign_keys = ON;");
    let value = result?;
    restored?;
    Ok(value)
}

/// Tables whose leftover replacement may be dropped before a run.
fn recovery_candidates(
    conn: &Connection,
    staging: &StagingSettings,
    worklist: Option<&Worklist>,
    stripping: bool,
) -> RelinkResult<BTreeSet<String>> {
    let mut candidates: BTreeSet<String> = worklist
        .map(|w| w.by_table().into_keys().map(str::to_string).collect())
        .unwrap_or_default();
    if stripping {
        candidates.extend(
            Catalog::new(conn)
                .list_tables()?
                .into_iter()
                .filter(|t| !staging.is_staging(t)),
        );
    }
    Ok(candidates)
}

/// Options for [`run`].
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub policy: UnpopulatedPolicy,
    /// Run identity stripping after validation.
    pub strip: bool,
    /// Strip even while relation claims are pending.
    pub force_strip: bool,
}

/// What happened to the stripping step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StripOutcome {
    NotRequested,
    /// Claims were still pending and stripping was not forced.
    Blocked { pending: usize },
    Completed(StripReport),
}

/// Everything a pipeline run found and did.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// Leftover replacement tables dropped before starting.
    pub recovered: Vec<String>,
    /// `None` when there was no worklist.
    pub discovery: Option<Discovery>,
    pub materialized: Option<MaterializeReport>,
    pub integrity: IntegrityReport,
    pub strip: StripOutcome,
}

impl PipelineReport {
    /// True when nothing needs an operator's attention.
    pub fn is_clean(&self) -> bool {
        self.integrity.is_clean()
            && self
                .discovery
                .as_ref()
                .map_or(true, |d| d.conflicts.is_empty())
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for table in &self.recovered {
            writeln!(f, "recovered: dropped leftover {}", table)?;
        }

        match (&self.discovery, &self.materialized) {
            (Some(discovery), Some(materialized)) => {
                writeln!(
                    f,
                    "relations: {} confirmed, {} conflicts",
                    discovery.confirmed_count(),
                    discovery.conflicts.len()
                )?;
                for conflict in &discovery.conflicts {
                    writeln!(f, "  conflict: {}", conflict)?;
                }
                writeln!(
                    f,
                    "tables: {} rewritten, {} unchanged",
                    materialized.rewritten.len(),
                    materialized.unchanged.len()
                )?;
            }
            _ => writeln!(f, "relations: no worklist")?,
        }

        writeln!(
            f,
            "foreign key violations: {}",
            self.integrity.violations.len()
        )?;
        for violation in &self.integrity.violations {
            writeln!(f, "  {}", violation)?;
        }

        let pending = self.integrity.worklist.pending();
        if pending > 0 {
            writeln!(f, "unresolved relations: {}", pending)?;
        }

        match &self.strip {
            StripOutcome::NotRequested => writeln!(f, "strip: skipped"),
            StripOutcome::Blocked { pending } => {
                writeln!(f, "strip: blocked by {} unresolved relations", pending)
            }
            StripOutcome::Completed(report) => writeln!(
                f,
                "strip: {} tables rewritten, identifier table {}",
                report.rewritten.len(),
                if report.dropped_identifier_table {
                    "dropped"
                } else {
                    "absent"
                }
            ),
        }
    }
}

/// Run the full pass on an open connection.
///
/// Leftover replacement tables are only cleaned up for tables this run is
/// about to rewrite: the tables named on the worklist, plus every table when
/// stripping is requested.
pub fn run(
    conn: &mut Connection,
    staging: &StagingSettings,
    options: &PipelineOptions,
) -> RelinkResult<PipelineReport> {
    with_foreign_keys_off(conn, |conn| run_pass(conn, staging, options))
}

fn run_pass(
    conn: &mut Connection,
    staging: &StagingSettings,
    options: &PipelineOptions,
) -> RelinkResult<PipelineReport> {
    let mut worklist = Worklist::load(conn, &staging.worklist_table)?;
    let candidates = recovery_candidates(conn, staging, worklist.as_ref(), options.strip)?;
    let recovered = recover_interrupted(conn, staging, &candidates)?;
    let (discovery, materialized) = match worklist.as_mut() {
        Some(worklist) => {
            info!(claims = worklist.len(), "processing relation worklist");
            let discovery = RelationDiscoverer::new(conn, staging)
                .with_policy(options.policy)
                .discover(worklist)?;
            let materialized = materialize(conn, staging, &discovery, worklist)?;
            (Some(discovery), Some(materialized))
        }
        None => {
            info!(table = %staging.worklist_table, "no relation worklist, skipping materialization");
            (None, None)
        }
    };

    let integrity = IntegrityValidator::new(conn).validate(worklist)?;

    let strip = if !options.strip {
        StripOutcome::NotRequested
    } else {
        let pending = integrity.worklist.pending();
        if pending > 0 && !options.force_strip {
            warn!(pending, "not stripping identifiers while relations are unresolved");
            StripOutcome::Blocked { pending }
        } else {
            StripOutcome::Completed(IdentityStripper::new(staging).strip(conn)?)
        }
    };

    Ok(PipelineReport {
        recovered,
        discovery,
        materialized,
        integrity,
        strip,
    })
}

/// Strip identifiers outside a full run.
///
/// Fails with [`RelinkError::StripBlocked`] while the worklist still holds
/// claims, unless `force` is set.
pub fn strip(
    conn: &mut Connection,
    staging: &StagingSettings,
    force: bool,
) -> RelinkResult<StripReport> {
    with_foreign_keys_off(conn, |conn| {
        let pending = Worklist::load(conn, &staging.worklist_table)?.map_or(0, |w| w.len());
        if pending > 0 && !force {
            return Err(RelinkError::StripBlocked(pending));
        }
        let candidates = recovery_candidates(conn, staging, None, true)?;
        recover_interrupted(conn, staging, &candidates)?;
        IdentityStripper::new(staging).strip(conn)
    })
}
