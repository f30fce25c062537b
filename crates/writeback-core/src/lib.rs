//! Core types for the writeback flush engine.
//!
//! This crate provides the foundational abstractions the write path builds
//! on:
//!
//! - `Value` for dynamically-typed SQL values
//! - `ObjectId` / `ObjectIdDescriptor` for portable object identity
//! - `TempIdAllocator` for minting temporary identity keys
//! - `SchemaRegistry` and entity metadata for mapping and ordering
//! - the flush error taxonomy

pub mod error;
pub mod identity;
pub mod schema;
pub mod value;

pub use error::{
    Error, ExecutionError, IdentityError, IdentityErrorKind, KeyGenerationError, MappingError,
    MappingErrorKind, ReconciliationError, Result,
};
pub use identity::{ObjectId, ObjectIdDescriptor, TempIdAllocator};
pub use schema::{
    AttributeMeta, ColumnMeta, DbJoin, EntityMeta, JoinStep, RelationshipMeta, SchemaRegistry,
};
pub use value::Value;
