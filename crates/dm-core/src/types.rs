//! Fetch strategy and lock mode enumerations
//!
//! Association loading, read-only hints, and locking are explicit
//! configuration passed into the caller-facing API, never implicit
//! metadata attached to entity types.

use serde::{Deserialize, Serialize};

/// How association references on loaded records are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    /// Associations stay unloaded placeholders until first access.
    #[default]
    Lazy,
    /// Association rows are pulled together with the owner query.
    /// Rejected when combined with pagination, since joined row
    /// duplication corrupts page and count arithmetic.
    JoinFetch,
    /// Owner rows are loaded first, then all distinct association ids are
    /// resolved in one batched follow-up query. The only non-lazy strategy
    /// safe to combine with pagination.
    PrefetchGraph,
}

/// Row locking applied to loaded records for the unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    #[default]
    None,
    /// Version field is checked and incremented at flush; a mismatch
    /// fails the unit of work with an optimistic lock conflict.
    Optimistic,
    /// The store holds a row lock for the duration of the unit of work;
    /// an unavailable lock fails with a timeout after a bounded wait.
    Pessimistic,
}
