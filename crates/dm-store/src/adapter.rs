//! Store adapter contract
//!
//! A thin interface to the underlying storage engine: filtered/sorted/
//! bounded queries, count queries, single-record writes, set-based bulk
//! updates, and bounded-wait row locks. Everything above this trait is
//! store-agnostic.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;

use dm_core::{DmError, DmResult, FieldMap, Id, Value};
use dm_query::{Predicate, SortOrder};

/// A stored record: id plus named field values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: Id,
    pub fields: FieldMap,
}

impl Row {
    pub fn new(id: Id, fields: FieldMap) -> Self {
        Self { id, fields }
    }

    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&Value::Null)
    }
}

/// A single field mutation in a set-based update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(Value),
    /// Add to an integer field in place (`age = age + n`).
    Increment(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub field: String,
    pub op: UpdateOp,
}

impl FieldUpdate {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: UpdateOp::Set(value.into()),
        }
    }

    pub fn increment(field: impl Into<String>, by: i64) -> Self {
        Self {
            field: field.into(),
            op: UpdateOp::Increment(by),
        }
    }

    /// Apply to a row's fields.
    pub fn apply(&self, fields: &mut FieldMap) -> DmResult<()> {
        match &self.op {
            UpdateOp::Set(value) => {
                fields.insert(self.field.clone(), value.clone());
                Ok(())
            }
            UpdateOp::Increment(by) => {
                let current = fields
                    .get(&self.field)
                    .and_then(Value::as_int)
                    .ok_or_else(|| {
                        DmError::Store(format!(
                            "cannot increment non-integer field '{}'",
                            self.field
                        ))
                    })?;
                fields.insert(self.field.clone(), Value::Int(current + by));
                Ok(())
            }
        }
    }
}

/// An acquired row lock. Dropping the handle releases the lock, which
/// ties its lifetime to the unit of work holding it.
pub struct LockHandle {
    _guard: Box<dyn Any + Send>,
}

impl LockHandle {
    pub fn new(guard: impl Any + Send) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle").finish_non_exhaustive()
    }
}

/// Thin interface to the underlying storage engine.
#[async_trait]
pub trait StoreAdapter: Send + Sync + 'static {
    /// Execute a filtered, sorted, bounded query.
    async fn query(
        &self,
        entity_type: &str,
        predicate: &Predicate,
        sort: &SortOrder,
        offset: i64,
        limit: Option<i64>,
    ) -> DmResult<Vec<Row>>;

    /// Count rows matching the predicate. Sort is irrelevant to counts.
    async fn count(&self, entity_type: &str, predicate: &Predicate) -> DmResult<i64>;

    /// Insert one record. `id` is `Some` for explicitly-assigned
    /// identifiers; otherwise the store allocates a surrogate id.
    async fn insert(&self, entity_type: &str, id: Option<Id>, fields: FieldMap) -> DmResult<Id>;

    /// Update the changed fields of one record. When `expected_version`
    /// is given, the stored version must match or the update fails with
    /// an optimistic lock conflict.
    async fn update(
        &self,
        entity_type: &str,
        id: Id,
        changes: FieldMap,
        expected_version: Option<i64>,
    ) -> DmResult<()>;

    /// Delete one record. Deleting an absent record is a no-op.
    async fn delete(&self, entity_type: &str, id: Id) -> DmResult<()>;

    /// Execute a set-based update over every matching row, returning the
    /// affected-row count. Runs entirely in the store; no per-row load.
    async fn bulk_update(
        &self,
        entity_type: &str,
        predicate: &Predicate,
        updates: &[FieldUpdate],
    ) -> DmResult<u64>;

    /// Acquire a row lock, waiting at most `timeout`.
    async fn begin_lock(
        &self,
        entity_type: &str,
        id: Id,
        timeout: Duration,
    ) -> DmResult<LockHandle>;
}
