//! The writeback flush engine.
//!
//! `writeback-flush` is the **write path** of an object-relational
//! persistence layer: given the recorded changes of one unit of work, it
//! materializes row operations, orders and batches them so foreign-key and
//! uniqueness constraints hold, executes them through a collaborator, and
//! reconciles database-generated identifiers back into the object graph.
//!
//! # Pipeline
//!
//! - **[`RowFactory`]**: replay each object's diff into per-table row
//!   operations, including synthetic rows for flattened join tables and key
//!   propagation between related rows.
//! - **[`RowMerger`]**: fold rows colliding on one `(table, identity)` key.
//! - **[`RowSorter`]**: inserts, updates, then deletes; parents before
//!   children, reversed for deletes; reused identities delete-then-reinsert.
//! - **[`BatchBuilder`]**: fold consecutive same-shaped rows into batched
//!   statements.
//! - **[`FlushAction`]**: orchestrate the phases, dispatch per destination,
//!   and fail fast — any error marks the transaction rollback-only.
//! - **[`IdReconciler`]**: settle propagated keys and mint permanent
//!   replacement identities for the result diff.
//!
//! # Design Philosophy
//!
//! - **Identity over references**: rows know each other only by
//!   `ObjectId`, so cyclic object graphs need no special casing.
//! - **Pure pipeline, async edge**: factory, merger, sorter, and batcher
//!   are synchronous and reentrant; only statement execution and key
//!   generation suspend, through `Cx` + `Outcome`.
//! - **Fail fast**: the only recoverable condition is an empty change set.

pub mod batch;
pub mod diff;
pub mod executor;
pub mod factory;
pub mod flush;
pub mod merge;
pub mod reconcile;
pub mod row;
pub mod sort;

pub use batch::{BatchBuilder, BatchedStatement};
pub use diff::{ArcTarget, ChangeKind, ChangeSource, DiffEvent, ObjectDiff};
pub use executor::{
    KeyGenerator, RollbackFlag, StatementExecutor, StatementResult, TransactionContext,
};
pub use factory::{FactoryOutput, FkPropagation, RowFactory};
pub use flush::{FlushAction, FlushOptions, FlushPhase};
pub use merge::{MergeOutcome, RowMerger};
pub use reconcile::{FlushDiff, IdReconciler, ResultSink};
pub use row::{DbRow, Qualifier, RowKey, RowKind, Values};
pub use sort::RowSorter;
