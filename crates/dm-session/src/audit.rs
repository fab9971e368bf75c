//! Audit interceptor
//!
//! Stamps lifecycle metadata on the write path. The acting principal is
//! an explicit injected value, never an ambient lookup; entities without
//! audit capability pass through untouched.

use chrono::{DateTime, Utc};

use dm_core::Entity;

/// Source of the acting principal for audit stamping.
pub trait PrincipalProvider: Send + Sync {
    fn current_principal(&self) -> String;
}

/// A constant principal, for tests and single-actor processes.
pub struct FixedPrincipal(pub String);

impl FixedPrincipal {
    pub fn named(principal: impl Into<String>) -> Self {
        Self(principal.into())
    }
}

impl PrincipalProvider for FixedPrincipal {
    fn current_principal(&self) -> String {
        self.0.clone()
    }
}

/// Wraps the insert/update paths of the flush.
pub struct AuditStamper;

impl AuditStamper {
    /// Set creation metadata exactly once, and initialize the
    /// modification metadata to the same values.
    pub fn before_insert<T: Entity>(entity: &mut T, principal: &str, now: DateTime<Utc>) {
        if let Some(audit) = entity.audit_mut() {
            audit.created_at = Some(now);
            audit.created_by = Some(principal.to_string());
            audit.last_modified_at = Some(now);
            audit.last_modified_by = Some(principal.to_string());
        }
    }

    /// Refresh modification metadata. Creation metadata is immutable
    /// after first insert and is left untouched here; external overwrite
    /// attempts are stripped from update field lists by the flush.
    pub fn before_update<T: Entity>(entity: &mut T, principal: &str, now: DateTime<Utc>) {
        if let Some(audit) = entity.audit_mut() {
            audit.last_modified_at = Some(now);
            audit.last_modified_by = Some(principal.to_string());
        }
    }
}
