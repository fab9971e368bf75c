//! Bulk consistency coordinator
//!
//! Set-based updates run entirely in the store and never pass through
//! tracked instances, so tracked state of the target type is stale the
//! moment one executes. Reconciliation evicts those entries (and the
//! type's association slots) instead of patching them, so later reads
//! re-fetch fresh rows. Unflushed local changes to evicted entries are
//! discarded, which is reported rather than silently absorbed.

use dm_core::{DmError, DmResult, Entity, VERSION_FIELD};
use dm_store::FieldUpdate;
use tracing::warn;

use crate::fetch::AssocCache;
use crate::tracking::TrackingContext;

/// Result of one set-based update plus its cache reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkOutcome {
    /// Rows the store reports as modified.
    pub affected: u64,
    /// Tracked entries of the target type dropped from the context.
    pub evicted: usize,
    /// Of those, entries whose unflushed local changes were discarded.
    pub discarded_dirty: usize,
}

/// Reject updates naming fields the target type does not declare, before
/// any store call.
pub(crate) fn validate_updates<T: Entity>(updates: &[FieldUpdate]) -> DmResult<()> {
    for update in updates {
        let field = update.field.as_str();
        if field != VERSION_FIELD && !T::field_names().contains(&field) {
            return Err(DmError::UnknownField {
                entity_type: T::TYPE_NAME.to_string(),
                field: update.field.clone(),
            });
        }
    }
    Ok(())
}

/// Evict the target type from the tracking context and the association
/// slot cache after a set-based update.
pub(crate) fn reconcile(
    tracking: &TrackingContext,
    cache: &AssocCache,
    entity_type: &str,
    affected: u64,
) -> BulkOutcome {
    let (evicted, discarded_dirty) = tracking.evict_type(entity_type);
    cache.evict_type(entity_type);
    if discarded_dirty > 0 {
        warn!(
            entity_type,
            discarded_dirty, "bulk update discarded unflushed tracked changes"
        );
    }
    BulkOutcome {
        affected,
        evicted,
        discarded_dirty,
    }
}
