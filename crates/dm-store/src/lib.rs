//! # dm-store
//!
//! The storage-engine seam. The mapping layer talks to any capable
//! relational or document store through the `StoreAdapter` trait; this
//! crate also ships `MemoryStore`, an in-memory reference adapter with
//! row-level pessimistic locks, so the whole layer runs in tests without
//! an external engine.

pub mod adapter;
pub mod memory;

pub use adapter::{FieldUpdate, LockHandle, Row, StoreAdapter, UpdateOp};
pub use memory::MemoryStore;
