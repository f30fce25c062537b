//! Error types for the flush engine.
//!
//! The flush path is fail-fast: every variant here aborts the flush, marks
//! the transaction rollback-only, and surfaces to the caller wrapping its
//! root cause. Nothing in this taxonomy is silently swallowed.

use std::fmt;

/// The primary error type for flush operations.
#[derive(Debug)]
pub enum Error {
    /// Malformed or contradictory object-identity state
    Identity(IdentityError),
    /// Mapping/configuration defects (read-only mutation, bad PK setup)
    Mapping(MappingError),
    /// Primary-key generator failure
    KeyGeneration(KeyGenerationError),
    /// A statement failed at the data source
    Execution(ExecutionError),
    /// Internal-invariant violation during id reconciliation
    Reconciliation(ReconciliationError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct IdentityError {
    pub kind: IdentityErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityErrorKind {
    /// Descriptor with no entity name or no primary-key attributes
    MalformedDescriptor,
    /// Key map does not cover the descriptor's primary-key attributes
    IncompleteKey,
    /// An attribute outside the descriptor's primary key was staged
    ForeignAttribute,
    /// A replacement value was re-staged with a different value
    ReplacementConflict,
}

#[derive(Debug)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// Mutation (insert/update/delete) of an entity mapped read-only
    ReadOnlyEntity,
    /// More than one ungenerated PK column left after key generation
    MultiColumnAutoPk,
    /// Entity name not present in the schema registry
    UnknownEntity,
    /// Attribute name not mapped on its entity
    UnknownAttribute,
    /// Relationship name not mapped on its entity
    UnknownRelationship,
}

#[derive(Debug)]
pub struct KeyGenerationError {
    pub table: String,
    pub column: String,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ExecutionError {
    /// Short description of the failed batch (table and operation)
    pub statement: String,
    /// Logical data source the batch was dispatched to
    pub destination: String,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ReconciliationError {
    pub message: String,
}

impl Error {
    /// Shorthand for a mapping error.
    pub fn mapping(kind: MappingErrorKind, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for an identity error.
    pub fn identity(kind: IdentityErrorKind, message: impl Into<String>) -> Self {
        Error::Identity(IdentityError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for a reconciliation (internal invariant) error.
    pub fn reconciliation(message: impl Into<String>) -> Self {
        Error::Reconciliation(ReconciliationError {
            message: message.into(),
        })
    }

    /// Is this a configuration defect rather than a runtime condition?
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Mapping(_) | Error::Identity(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Identity(e) => write!(f, "Identity error: {}", e.message),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e.message),
            Error::KeyGeneration(e) => write!(
                f,
                "Key generation failed for {}.{}: {}",
                e.table, e.column, e.message
            ),
            Error::Execution(e) => write!(
                f,
                "Execution failed ({} -> {}): {}",
                e.statement, e.destination, e.message
            ),
            Error::Reconciliation(e) => {
                write!(f, "Reconciliation invariant violated: {}", e.message)
            }
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::KeyGeneration(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Execution(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for KeyGenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.table, self.column, self.message)
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.statement, self.message)
    }
}

impl fmt::Display for ReconciliationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<IdentityError> for Error {
    fn from(err: IdentityError) -> Self {
        Error::Identity(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<KeyGenerationError> for Error {
    fn from(err: KeyGenerationError) -> Self {
        Error::KeyGeneration(err)
    }
}

impl From<ExecutionError> for Error {
    fn from(err: ExecutionError) -> Self {
        Error::Execution(err)
    }
}

impl From<ReconciliationError> for Error {
    fn from(err: ReconciliationError) -> Self {
        Error::Reconciliation(err)
    }
}

/// Result type alias for flush operations.
pub type Result<T> = std::result::Result<T, Error>;
