//! Error taxonomy for datamapper-rs
//!
//! Every failure surfaced by the mapping layer is one of these variants,
//! carrying the offending identifiers. "Not found" is a normal empty result
//! everywhere in this workspace, never an error.

use thiserror::Error;

use crate::entity::Id;

/// Core error type for all mapping-layer operations
#[derive(Error, Debug)]
pub enum DmError {
    /// Bad page number or page size. Caller error, not retried.
    #[error("invalid page request: page {page}, size {size}")]
    InvalidPageRequest { page: i64, size: i64 },

    /// A probe or projection shape the predicate builder cannot express
    /// (nesting beyond one association level, outer-join semantics).
    /// Caller error, surfaced before any store call.
    #[error("unsupported match shape at '{path}': {message}")]
    UnsupportedMatchShape { path: String, message: String },

    /// A fetch strategy combined with options it cannot be correct under
    /// (join-fetch with pagination). Caller error, surfaced before any
    /// store call.
    #[error("unsupported fetch combination: {message}")]
    UnsupportedFetchCombination { message: String },

    /// An internal invariant broke: count/content mismatch, or an id
    /// tracked under two different entity types. Hard failure, never
    /// silently corrected.
    #[error("consistency violation: {message}")]
    ConsistencyViolation { message: String },

    /// Version check failed at flush. The caller may retry the whole
    /// unit of work.
    #[error("optimistic lock conflict on {entity_type} id {id}: expected version {expected}, found {actual}")]
    OptimisticLockConflict {
        entity_type: String,
        id: Id,
        expected: i64,
        actual: i64,
    },

    /// A pessimistic row lock could not be acquired within the bounded
    /// wait. The unit of work is failed; the caller may retry with backoff.
    #[error("lock timeout on {entity_type} id {id} after {waited_ms}ms")]
    LockTimeout {
        entity_type: String,
        id: Id,
        waited_ms: u64,
    },

    /// A predicate, update, or projection referenced a field the entity
    /// does not declare. Caller error.
    #[error("unknown field '{field}' on {entity_type}")]
    UnknownField { entity_type: String, field: String },

    /// The underlying store adapter failed.
    #[error("store error: {0}")]
    Store(String),
}

impl DmError {
    /// Stable machine-readable code for each error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            DmError::InvalidPageRequest { .. } => "invalid_page_request",
            DmError::UnsupportedMatchShape { .. } => "unsupported_match_shape",
            DmError::UnsupportedFetchCombination { .. } => "unsupported_fetch_combination",
            DmError::ConsistencyViolation { .. } => "consistency_violation",
            DmError::OptimisticLockConflict { .. } => "optimistic_lock_conflict",
            DmError::LockTimeout { .. } => "lock_timeout",
            DmError::UnknownField { .. } => "unknown_field",
            DmError::Store(_) => "store_error",
        }
    }

    /// Whether retrying the whole unit of work can succeed without a
    /// caller-side fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DmError::OptimisticLockConflict { .. } | DmError::LockTimeout { .. }
        )
    }
}

/// Standard Result type for mapping-layer operations
pub type DmResult<T> = Result<T, DmError>;
