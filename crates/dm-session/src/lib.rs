//! # dm-session
//!
//! The unit of work. A `Session` owns exactly one tracking context
//! (identity map + dirty checking), stamps audit metadata on the write
//! path, turns predicates into pages and slices, materializes association
//! graphs per fetch strategy, projects rows into flat or lazy views, and
//! reconciles the tracked cache with set-based bulk updates.
//!
//! Sessions are never shared across concurrent units of work and must be
//! discarded once their unit of work ends.

pub mod audit;
pub mod bulk;
pub mod fetch;
pub mod paging;
pub mod projection;
pub mod session;
pub mod tracking;

pub use audit::{AuditStamper, FixedPrincipal, PrincipalProvider};
pub use bulk::BulkOutcome;
pub use fetch::{AssocRef, AssocState, FetchOptions};
pub use projection::{FieldPath, FlatProjection, LazyView, ProjectionShape};
pub use session::Session;
pub use tracking::{AppliedWrite, Tracked, TrackingContext, WriteKind};
