//! # dm-query
//!
//! Store-agnostic query building blocks:
//! - `Predicate`: the match condition tree handed to store adapters
//! - `SortOrder`: sort criteria with a deterministic id tie-break
//! - `Example`: dynamic predicates derived from probe objects

pub mod example;
pub mod predicate;
pub mod sorts;

pub use example::{Combinator, Example, ExampleMatcher, NullHandling, ProbeValue, StringMatchMode};
pub use predicate::{AssociationLookup, CompareOp, Predicate};
pub use sorts::{SortCriterion, SortDirection, SortOrder};
