//! Writeback - the write path of an object-relational persistence layer.
//!
//! Writeback turns an in-memory graph of created, modified, and deleted
//! domain objects into a correctly ordered, correctly batched sequence of
//! row operations against one or more relational schemas, then reconciles
//! database-generated identifiers back into the object graph — all inside
//! one logical transaction with fail-fast rollback.
//!
//! # Quick Start
//!
//! ```ignore
//! use writeback::prelude::*;
//!
//! async fn flush_example(
//!     cx: &Cx,
//!     schema: &SchemaRegistry,
//!     ids: &TempIdAllocator,
//!     keygen: &impl KeyGenerator,
//!     executor: &impl StatementExecutor,
//! ) {
//!     // Record what happened to each object during the unit of work.
//!     let artist = ObjectId::temporary(schema.descriptor("Artist").unwrap(), ids);
//!     let mut changes = vec![
//!         ObjectDiff::created(artist).set("name", "Claude Monet"),
//!     ];
//!
//!     // Flush: order, batch, execute, reconcile.
//!     let mut tx = RollbackFlag::new();
//!     let mut action = FlushAction::new(schema, ids);
//!     match action.run(cx, &mut changes, keygen, executor, &mut tx).await {
//!         Outcome::Ok(diff) => {
//!             for (old, new) in diff.replacements() {
//!                 println!("{old:?} -> {new:?}");
//!             }
//!         }
//!         Outcome::Err(e) => eprintln!("flush failed: {e}"),
//!         _ => {}
//!     }
//! }
//! ```
//!
//! # Features
//!
//! - **Identity management**: temporary and permanent object ids, compound
//!   and database-generated keys, two-phase replacement
//! - **Relationship-aware rows**: flattened join tables, dependent-PK key
//!   propagation, optimistic-lock qualifiers
//! - **Safe ordering**: topological table order, deletes reversed,
//!   delete-before-reinsert for reused identities
//! - **Structured concurrency**: the execution boundary is cancel-correct
//!   through asupersync

// Re-export asupersync primitives used at the execution boundary
pub use asupersync::{Cx, Outcome};

// Core types
pub use writeback_core::{
    AttributeMeta, ColumnMeta, DbJoin, EntityMeta, Error, ExecutionError, IdentityError,
    IdentityErrorKind, JoinStep, KeyGenerationError, MappingError, MappingErrorKind, ObjectId,
    ObjectIdDescriptor, ReconciliationError, RelationshipMeta, Result, SchemaRegistry,
    TempIdAllocator, Value,
};

// The engine
pub use writeback_flush::{
    ArcTarget, BatchBuilder, BatchedStatement, ChangeKind, ChangeSource, DbRow, DiffEvent,
    FlushAction, FlushDiff, FlushOptions, FlushPhase, FkPropagation, IdReconciler, KeyGenerator,
    MergeOutcome, ObjectDiff, Qualifier, ResultSink, RollbackFlag, RowFactory, RowKey, RowKind,
    RowMerger, RowSorter, StatementExecutor, StatementResult, TransactionContext, Values,
};

/// Convenience prelude: the types almost every caller touches.
pub mod prelude {
    pub use crate::{
        ChangeKind, Cx, EntityMeta, Error, FlushAction, FlushDiff, FlushOptions, KeyGenerator,
        ObjectDiff, ObjectId, ObjectIdDescriptor, Outcome, Result, RollbackFlag, SchemaRegistry,
        StatementExecutor, StatementResult, TempIdAllocator, TransactionContext, Value,
    };
}
