//! # relink
//!
//! Post-processes a SQLite database generated from a data request whose
//! cross-references are untyped uids, turning verified references into
//! enforced foreign keys.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Generated database + staging tables               │
//! │      (identifier table, relation worklist)               │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [discover]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Discovery: column -> confirmed owner, conflicts        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [materialize / rewrite]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Tables recreated with REFERENCES owner(uid)            │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [validate]
//! ┌─────────────────────────────────────────────────────────┐
//! │   foreign_key_check, worklist drained or reported        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [strip, optional]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Identifier table dropped, concrete keys only           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! [`pipeline::run`] chains the passes; each one is also usable alone.

pub mod catalog;
pub mod config;
pub mod discover;
pub mod error;
pub mod materialize;
pub mod patch;
pub mod pipeline;
pub mod rewrite;
pub mod sql;
pub mod strip;
pub mod validate;
pub mod worklist;

pub use error::{RelinkError, RelinkResult};

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::catalog::{Catalog, TableSchema};
    pub use crate::config::{Settings, StagingSettings};
    pub use crate::discover::{Discovery, RelationDiscoverer, UnpopulatedPolicy};
    pub use crate::error::{RelinkError, RelinkResult};
    pub use crate::pipeline::{PipelineOptions, PipelineReport, StripOutcome};
    pub use crate::rewrite::{TableRewrite, TableRewriter};
    pub use crate::sql::{ColumnDef, CreateTable};
    pub use crate::strip::IdentityStripper;
    pub use crate::validate::IntegrityValidator;
    pub use crate::worklist::{RelationClaim, Worklist};
}
