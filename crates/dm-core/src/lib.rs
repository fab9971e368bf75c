//! # dm-core
//!
//! Core types, traits, and utilities for datamapper-rs.
//!
//! This crate provides the foundational building blocks used across all other crates:
//! - The error taxonomy (`DmError`) and result alias
//! - The dynamic field value type (`Value`) and field maps
//! - Core entity traits (`Entity`, audit and version capabilities)
//! - Page, slice, and page-request types
//! - Fetch strategy and lock mode enumerations
//! - Session configuration

pub mod config;
pub mod entity;
pub mod error;
pub mod page;
pub mod types;
pub mod value;

pub use config::*;
pub use entity::*;
pub use error::*;
pub use page::*;
pub use types::*;
pub use value::*;
