//! Error types for the tracking engine.
//!
//! One top-level [`Error`] with a variant per failure category. Consistency
//! violations are fatal and never retried; usage violations are caller bugs;
//! storage and shared-cache failures come from collaborators. Soft
//! conditions (cache miss, no tracking entry, no cached snapshot) are plain
//! `Option`/`None` results, never errors.

use std::fmt;

/// The primary error type for all tracking-engine operations.
#[derive(Debug)]
pub enum Error {
    /// Fatal integrity violations. The enclosing flush must be aborted and
    /// the transaction rolled back.
    Consistency(ConsistencyViolation),
    /// Caller misuse of the engine API.
    Usage(UsageViolation),
    /// Storage collaborator failure (snapshot or collection fetch).
    Storage(StorageFailure),
    /// Shared (cross-unit-of-work) cache collaborator failure.
    Cache(CacheFailure),
    /// Passivation image encode/decode failure.
    Passivation(String),
}

/// Fatal integrity violations detected by the engine.
#[derive(Debug)]
pub enum ConsistencyViolation {
    /// A collection instance was reached from two owners in one flush.
    SharedCollectionReference {
        /// Role of the second reach, when known.
        role: &'static str,
    },
    /// A collection tracking entry was processed twice in one flush.
    DuplicateCollectionProcess {
        /// Loaded or current role of the entry.
        role: &'static str,
    },
    /// An orphan-delete collection lost its owner reference while the owner
    /// itself is not being deleted.
    OrphanedCollectionDereference {
        /// Role that declared delete-orphan semantics.
        role: &'static str,
    },
    /// A non-ignored collection tracking entry was skipped by the flush.
    UnprocessedCollection {
        /// Loaded or current role of the entry.
        role: &'static str,
    },
    /// A mutable object is already tracked by a different registry whose
    /// unit-of-work is still open.
    CrossContextRegistration {
        /// Mapped-type name of the object.
        entity: &'static str,
    },
    /// Attempted mutation of state belonging to an immutable mapped type.
    ImmutableMutation {
        /// Mapped-type name.
        entity: &'static str,
        /// The operation that was attempted.
        operation: &'static str,
    },
    /// Read-only was toggled on an immutable mapped type.
    ReadOnlyToggleOnImmutable {
        /// Mapped-type name.
        entity: &'static str,
    },
}

/// Caller errors: the engine was asked something it cannot answer in the
/// current state.
#[derive(Debug)]
pub enum UsageViolation {
    /// Identity-key construction was requested with no identifier assigned.
    MissingIdentifier {
        /// Mapped-type name.
        entity: &'static str,
    },
    /// Read-only status was queried outside MANAGED/READ_ONLY.
    ReadOnlyStatusUnavailable {
        /// Mapped-type name.
        entity: &'static str,
        /// The status the record was actually in.
        status: &'static str,
    },
    /// Read-only status was queried on an immutable-type record that has
    /// been detached from any owning persistence context.
    ImmutableWithoutContext {
        /// Mapped-type name.
        entity: &'static str,
    },
    /// A natural-key operation was issued for a type with no natural key.
    NoNaturalKey {
        /// Mapped-type name.
        entity: &'static str,
    },
    /// An operation that requires a tracked object was given an untracked
    /// one (or a handle that no longer resolves).
    UntrackedInstance,
}

/// Failure reported by the storage collaborator.
#[derive(Debug)]
pub struct StorageFailure {
    /// Mapped-type or collection-role name involved.
    pub subject: String,
    /// Human-readable description.
    pub message: String,
    /// Underlying driver error, when available.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Failure reported by the shared natural-key cache.
#[derive(Debug)]
pub struct CacheFailure {
    /// Mapped-type name involved.
    pub entity: String,
    /// The cache operation that failed.
    pub operation: &'static str,
    /// Human-readable description.
    pub message: String,
    /// Underlying cache error, when available.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a storage failure without an underlying source.
    pub fn storage(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Storage(StorageFailure {
            subject: subject.into(),
            message: message.into(),
            source: None,
        })
    }

    /// Build a shared-cache failure without an underlying source.
    pub fn cache(
        entity: impl Into<String>,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Error::Cache(CacheFailure {
            entity: entity.into(),
            operation,
            message: message.into(),
            source: None,
        })
    }

    /// True for the fatal category: the enclosing flush cannot continue.
    #[must_use]
    pub const fn is_consistency_violation(&self) -> bool {
        matches!(self, Error::Consistency(_))
    }

    /// True when the failure came from a collaborator rather than the
    /// engine itself (storage or shared cache).
    #[must_use]
    pub const fn is_collaborator_failure(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Cache(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Consistency(e) => write!(f, "Consistency violation: {}", e),
            Error::Usage(e) => write!(f, "Invalid usage: {}", e),
            Error::Storage(e) => write!(f, "Storage error: {}", e),
            Error::Cache(e) => write!(f, "Shared cache error: {}", e),
            Error::Passivation(msg) => write!(f, "Passivation error: {}", msg),
        }
    }
}

impl fmt::Display for ConsistencyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyViolation::SharedCollectionReference { role } => {
                write!(f, "shared references to collection of role '{}'", role)
            }
            ConsistencyViolation::DuplicateCollectionProcess { role } => {
                write!(
                    f,
                    "collection of role '{}' was processed twice in one flush",
                    role
                )
            }
            ConsistencyViolation::OrphanedCollectionDereference { role } => {
                write!(
                    f,
                    "delete-orphan collection of role '{}' was dereferenced while its owner is not deleted",
                    role
                )
            }
            ConsistencyViolation::UnprocessedCollection { role } => {
                write!(
                    f,
                    "collection of role '{}' was not processed by the flush",
                    role
                )
            }
            ConsistencyViolation::CrossContextRegistration { entity } => {
                write!(
                    f,
                    "'{}' instance is already tracked by another open unit-of-work",
                    entity
                )
            }
            ConsistencyViolation::ImmutableMutation { entity, operation } => {
                write!(f, "cannot {} on immutable type '{}'", operation, entity)
            }
            ConsistencyViolation::ReadOnlyToggleOnImmutable { entity } => {
                write!(f, "cannot toggle read-only on immutable type '{}'", entity)
            }
        }
    }
}

impl fmt::Display for UsageViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageViolation::MissingIdentifier { entity } => {
                write!(f, "'{}' has no identifier assigned", entity)
            }
            UsageViolation::ReadOnlyStatusUnavailable { entity, status } => {
                write!(
                    f,
                    "read-only status of '{}' is undefined in status {}",
                    entity, status
                )
            }
            UsageViolation::ImmutableWithoutContext { entity } => {
                write!(
                    f,
                    "record for immutable type '{}' has no owning persistence context",
                    entity
                )
            }
            UsageViolation::NoNaturalKey { entity } => {
                write!(f, "'{}' does not declare a natural key", entity)
            }
            UsageViolation::UntrackedInstance => {
                write!(f, "operation requires an instance tracked by this unit-of-work")
            }
        }
    }
}

impl fmt::Display for StorageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.message)
    }
}

impl fmt::Display for CacheFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on '{}': {}", self.operation, self.entity, self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Cache(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Passivation(err.to_string())
    }
}

/// Result type alias for tracking-engine operations.
pub type Result<T> = std::result::Result<T, Error>;
