//! Tracking context (identity map)
//!
//! Per-unit-of-work cache keyed by (type, id). Guarantees at most one live
//! instance per key: a second load of the same id returns the same
//! instance, never a new copy. Dirty fields are computed at flush time by
//! diffing each entry's current field state against its last-known
//! snapshot; only changed fields are written.
//!
//! The context's lifetime equals one unit of work. It must be discarded
//! once that unit ends so stale tracked instances never leak across units.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use dm_core::{audit_fields, DmError, DmResult, Entity, FieldMap, Id, Value, VERSION_FIELD};

use crate::audit::AuditStamper;

/// Shared handle to the canonical tracked instance of an entity.
pub struct Tracked<T: Entity> {
    inner: Arc<RwLock<T>>,
}

impl<T: Entity> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity + std::fmt::Debug> std::fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Tracked").field(&*self.inner.read()).finish()
    }
}

impl<T: Entity> Tracked<T> {
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.read())
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.write())
    }

    pub fn id(&self) -> Option<Id> {
        self.inner.read().id()
    }

    /// Detached copy of the current state.
    pub fn cloned(&self) -> T {
        self.inner.read().clone()
    }

    /// Pointer identity: two handles to the same tracked instance.
    pub fn same_instance(&self, other: &Tracked<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn matches_cell(&self, cell: &AnyCell) -> bool {
        Arc::as_ptr(cell) as *const () == Arc::as_ptr(&self.inner) as *const ()
    }
}

type AnyCell = Arc<dyn Any + Send + Sync>;

fn cell_of<T: Entity>(cell: &AnyCell) -> &RwLock<T> {
    cell.downcast_ref::<RwLock<T>>()
        .expect("tracked cell holds its registered type")
}

fn tracked_from_cell<T: Entity>(cell: &AnyCell) -> Tracked<T> {
    let inner = Arc::clone(cell)
        .downcast::<RwLock<T>>()
        .ok()
        .expect("tracked cell holds its registered type");
    Tracked { inner }
}

/// Monomorphized accessors for a type-erased tracked cell.
struct EntityOps {
    snapshot: fn(&AnyCell) -> FieldMap,
    current_id: fn(&AnyCell) -> Option<Id>,
    set_id: fn(&AnyCell, Id),
    version: fn(&AnyCell) -> Option<i64>,
    set_version: fn(&AnyCell, i64),
    stamp_insert: fn(&AnyCell, &str, DateTime<Utc>),
    stamp_update: fn(&AnyCell, &str, DateTime<Utc>),
}

impl EntityOps {
    fn of<T: Entity>() -> Self {
        fn snapshot<T: Entity>(cell: &AnyCell) -> FieldMap {
            cell_of::<T>(cell).read().snapshot()
        }
        fn current_id<T: Entity>(cell: &AnyCell) -> Option<Id> {
            cell_of::<T>(cell).read().id()
        }
        fn set_id<T: Entity>(cell: &AnyCell, id: Id) {
            cell_of::<T>(cell).write().set_id(id);
        }
        fn version<T: Entity>(cell: &AnyCell) -> Option<i64> {
            cell_of::<T>(cell).read().version()
        }
        fn set_version<T: Entity>(cell: &AnyCell, version: i64) {
            cell_of::<T>(cell).write().set_version(version);
        }
        fn stamp_insert<T: Entity>(cell: &AnyCell, principal: &str, now: DateTime<Utc>) {
            AuditStamper::before_insert(&mut *cell_of::<T>(cell).write(), principal, now);
        }
        fn stamp_update<T: Entity>(cell: &AnyCell, principal: &str, now: DateTime<Utc>) {
            AuditStamper::before_update(&mut *cell_of::<T>(cell).write(), principal, now);
        }
        Self {
            snapshot: snapshot::<T>,
            current_id: current_id::<T>,
            set_id: set_id::<T>,
            version: version::<T>,
            set_version: set_version::<T>,
            stamp_insert: stamp_insert::<T>,
            stamp_update: stamp_update::<T>,
        }
    }
}

struct TrackedEntry {
    type_name: &'static str,
    id: Option<Id>,
    cell: AnyCell,
    /// Last-known stored state. `None` means the entry has never been
    /// written (pending insert) or is read-only.
    snapshot: Option<FieldMap>,
    deleted: bool,
    read_only: bool,
    ops: EntityOps,
}

impl TrackedEntry {
    fn is_new(&self) -> bool {
        self.snapshot.is_none() && !self.read_only
    }

    fn dirty(&self) -> bool {
        match &self.snapshot {
            Some(snapshot) => {
                !diff_fields(&(self.ops.snapshot)(&self.cell), snapshot, &[]).is_empty()
            }
            None => !self.read_only,
        }
    }
}

/// A write the flush sent to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct AppliedWrite {
    pub kind: WriteKind,
    pub entity_type: &'static str,
    pub id: Id,
    /// Inserted fields, or the changed subset for updates. Empty for
    /// deletes.
    pub fields: FieldMap,
}

/// One store write the flush still has to execute.
#[derive(Debug)]
pub(crate) enum PlannedWrite {
    Insert {
        index: usize,
        entity_type: &'static str,
        id_hint: Option<Id>,
        fields: FieldMap,
    },
    Update {
        index: usize,
        entity_type: &'static str,
        id: Id,
        changes: FieldMap,
        expected_version: Option<i64>,
        refreshed: FieldMap,
    },
    Delete {
        index: usize,
        entity_type: &'static str,
        id: Id,
    },
}

/// Per-unit-of-work identity map and dirty-check bookkeeping.
#[derive(Default)]
pub struct TrackingContext {
    // Entries keep registration order so flush writes in a predictable
    // order. Lookup is a scan; contexts hold one unit of work's records.
    entries: Mutex<Vec<TrackedEntry>>,
}

impl TrackingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a caller-provided record. New records become pending
    /// inserts; detached records with an id become pending full updates.
    /// Registering a record already tracked under its (type, id) returns
    /// the existing tracked instance: the caller's object does not become
    /// canonical.
    pub fn register<T: Entity>(&self, entity: T) -> Tracked<T> {
        let snapshot = if entity.is_new() {
            None
        } else {
            // Detached record: no known stored state, so every field
            // counts as dirty at flush.
            Some(FieldMap::new())
        };
        self.insert_entry(entity, snapshot, false)
    }

    /// Register a record freshly loaded from the store. Read-only entries
    /// keep no snapshot and are never flushed.
    pub fn register_loaded<T: Entity>(&self, entity: T, read_only: bool) -> Tracked<T> {
        let snapshot = if read_only {
            None
        } else {
            Some(entity.snapshot())
        };
        self.insert_entry(entity, snapshot, read_only)
    }

    fn insert_entry<T: Entity>(
        &self,
        entity: T,
        snapshot: Option<FieldMap>,
        read_only: bool,
    ) -> Tracked<T> {
        if let Some(id) = entity.id() {
            if let Some(existing) = self.get::<T>(id) {
                return existing;
            }
        }
        let id = entity.id();
        let cell: Arc<RwLock<T>> = Arc::new(RwLock::new(entity));
        self.entries.lock().push(TrackedEntry {
            type_name: T::TYPE_NAME,
            id,
            cell: cell.clone() as AnyCell,
            snapshot,
            deleted: false,
            read_only,
            ops: EntityOps::of::<T>(),
        });
        Tracked { inner: cell }
    }

    /// The canonical tracked instance for (T, id), if live.
    pub fn get<T: Entity>(&self, id: Id) -> Option<Tracked<T>> {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|e| e.type_name == T::TYPE_NAME && e.id == Some(id) && !e.deleted)
            .map(|e| tracked_from_cell::<T>(&e.cell))
    }

    pub fn contains(&self, type_name: &str, id: Id) -> bool {
        let entries = self.entries.lock();
        entries
            .iter()
            .any(|e| e.type_name == type_name && e.id == Some(id) && !e.deleted)
    }

    /// Mark a tracked record for deletion at flush. An unpersisted new
    /// record is simply discarded.
    pub fn mark_deleted<T: Entity>(&self, tracked: &Tracked<T>) -> bool {
        let mut entries = self.entries.lock();
        let Some(position) = entries.iter().position(|e| tracked.matches_cell(&e.cell)) else {
            return false;
        };
        if entries[position].is_new() && entries[position].id.is_none() {
            entries.remove(position);
        } else {
            entries[position].deleted = true;
        }
        true
    }

    /// Drop every managed entry of a type so later reads re-fetch fresh
    /// state. Pending inserts and pending deletes stay: both resolve by
    /// id, untouched by set-based updates. Returns (evicted, of which
    /// dirty).
    pub fn evict_type(&self, type_name: &str) -> (usize, usize) {
        let mut entries = self.entries.lock();
        let mut evicted = 0;
        let mut dirty = 0;
        entries.retain(|e| {
            if e.type_name != type_name || e.is_new() || e.deleted {
                return true;
            }
            if e.dirty() {
                dirty += 1;
            }
            evicted += 1;
            false
        });
        (evicted, dirty)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Compute the writes this flush must execute. Stamps audit metadata
    /// and bumps optimistic versions on the entries being written.
    pub(crate) fn plan_flush(
        &self,
        principal: &str,
        now: DateTime<Utc>,
    ) -> DmResult<Vec<PlannedWrite>> {
        let mut entries = self.entries.lock();

        let mut ids_seen: HashMap<Id, &'static str> = HashMap::new();
        for entry in entries.iter() {
            if let Some(id) = entry.id {
                if let Some(other_type) = ids_seen.insert(id, entry.type_name) {
                    if other_type != entry.type_name {
                        return Err(DmError::ConsistencyViolation {
                            message: format!(
                                "id {id} tracked under both '{other_type}' and '{}'",
                                entry.type_name
                            ),
                        });
                    }
                }
            }
        }

        let mut plan = Vec::new();
        for (index, entry) in entries.iter_mut().enumerate() {
            if entry.deleted {
                if let Some(id) = entry.id {
                    plan.push(PlannedWrite::Delete {
                        index,
                        entity_type: entry.type_name,
                        id,
                    });
                }
                continue;
            }
            if entry.read_only {
                continue;
            }
            if entry.is_new() {
                (entry.ops.stamp_insert)(&entry.cell, principal, now);
                plan.push(PlannedWrite::Insert {
                    index,
                    entity_type: entry.type_name,
                    id_hint: (entry.ops.current_id)(&entry.cell),
                    fields: (entry.ops.snapshot)(&entry.cell),
                });
                continue;
            }

            let snapshot = entry
                .snapshot
                .as_ref()
                .expect("managed entries keep a snapshot");
            let current = (entry.ops.snapshot)(&entry.cell);
            if diff_fields(&current, snapshot, &audit_fields::IMMUTABLE).is_empty() {
                continue;
            }

            (entry.ops.stamp_update)(&entry.cell, principal, now);
            // A loaded entry's snapshot carries the stored version. A
            // detached entry's snapshot is empty; its own version is the
            // caller's claim about the stored state.
            let expected_version = (entry.ops.version)(&entry.cell).map(|current| {
                snapshot
                    .get(VERSION_FIELD)
                    .and_then(Value::as_int)
                    .unwrap_or(current)
            });
            if let Some(expected) = expected_version {
                (entry.ops.set_version)(&entry.cell, expected + 1);
            }
            let refreshed = (entry.ops.snapshot)(&entry.cell);
            let changes = diff_fields(&refreshed, snapshot, &audit_fields::IMMUTABLE);
            let id = entry.id.expect("managed entries have an id");
            plan.push(PlannedWrite::Update {
                index,
                entity_type: entry.type_name,
                id,
                changes,
                expected_version,
                refreshed,
            });
        }
        Ok(plan)
    }

    pub(crate) fn complete_insert(&self, index: usize, id: Id) {
        let mut entries = self.entries.lock();
        let entry = &mut entries[index];
        (entry.ops.set_id)(&entry.cell, id);
        entry.id = Some(id);
        entry.snapshot = Some((entry.ops.snapshot)(&entry.cell));
    }

    pub(crate) fn complete_update(&self, index: usize, refreshed: FieldMap) {
        self.entries.lock()[index].snapshot = Some(refreshed);
    }

    /// Remove flushed-deleted entries. Indices must come from the same
    /// plan, so removal runs highest-first.
    pub(crate) fn remove_entries(&self, mut indices: Vec<usize>) {
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let mut entries = self.entries.lock();
        for index in indices {
            entries.remove(index);
        }
    }
}

/// Fields of `current` that differ from `snapshot`, excluding the named
/// columns.
fn diff_fields(current: &FieldMap, snapshot: &FieldMap, exclude: &[&str]) -> FieldMap {
    current
        .iter()
        .filter(|(name, value)| {
            !exclude.contains(&name.as_str()) && snapshot.get(*name) != Some(*value)
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
