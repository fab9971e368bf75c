//! Fetch strategy controller
//!
//! Decides how association references on loaded records materialize.
//! Lazy references share one slot per (target type, id) for the unit of
//! work, so concurrent first accesses coalesce into a single store query.
//! Prefetching fills the same slots from one batched id query per
//! association. Join-fetch is rejected up front when combined with
//! pagination, before any store call.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;

use dm_core::{Association, DmError, DmResult, Entity, FetchStrategy, FieldMap, Id, LockMode};
use dm_query::{Predicate, SortOrder};
use dm_store::{Row, StoreAdapter};

/// Per-call read options: fetch strategy, locking, read-only hint, and an
/// optional pre-counted total for page assembly.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub strategy: FetchStrategy,
    pub lock: LockMode,
    /// Loaded records are tracked without a snapshot and never flushed.
    pub read_only: bool,
    /// Predicate whose count the caller expects to equal the page total.
    /// The full count still runs; a mismatch fails the query.
    pub count_hint: Option<Predicate>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join_fetch(mut self) -> Self {
        self.strategy = FetchStrategy::JoinFetch;
        self
    }

    pub fn prefetch(mut self) -> Self {
        self.strategy = FetchStrategy::PrefetchGraph;
        self
    }

    pub fn with_lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_count_hint(mut self, predicate: Predicate) -> Self {
        self.count_hint = Some(predicate);
        self
    }

    /// Reject combinations no strategy can execute correctly. Runs before
    /// any store call.
    pub(crate) fn validate(&self, paginated: bool) -> DmResult<()> {
        if paginated && self.strategy == FetchStrategy::JoinFetch {
            return Err(DmError::UnsupportedFetchCombination {
                message: "join-fetch duplicates owner rows and corrupts page arithmetic; \
                          use a prefetch graph with pagination"
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// Load state of one association slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssocState {
    Unloaded,
    /// A load is in flight; further accessors wait on it rather than
    /// issuing their own query.
    Loading,
    Loaded,
}

/// Shared single-flight cell for one (target type, id). `None` inside the
/// cell records a resolved-but-absent target, so dangling references are
/// not re-queried.
pub(crate) struct AssocSlot {
    cell: OnceCell<Option<FieldMap>>,
    in_flight: AtomicBool,
}

impl AssocSlot {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            in_flight: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> AssocState {
        if self.cell.initialized() {
            AssocState::Loaded
        } else if self.in_flight.load(Ordering::SeqCst) {
            AssocState::Loading
        } else {
            AssocState::Unloaded
        }
    }

    /// Fill from a prefetch batch. A no-op when already resolved.
    pub(crate) fn fill(&self, fields: Option<FieldMap>) {
        let _ = self.cell.set(fields);
    }

    #[cfg(test)]
    pub(crate) fn loaded(&self) -> Option<Option<FieldMap>> {
        self.cell.get().cloned()
    }

    /// Resolve the slot, querying the store at most once across every
    /// holder of this slot.
    pub(crate) async fn resolve(
        &self,
        store: &dyn StoreAdapter,
        target_type: &str,
        id: Id,
    ) -> DmResult<Option<FieldMap>> {
        if let Some(resolved) = self.cell.get() {
            return Ok(resolved.clone());
        }
        self.in_flight.store(true, Ordering::SeqCst);
        let result = self
            .cell
            .get_or_try_init(|| async {
                debug!(target_type, id, "lazy association load");
                let rows = store
                    .query(
                        target_type,
                        &Predicate::IdIn(vec![id]),
                        &SortOrder::unsorted(),
                        0,
                        Some(1),
                    )
                    .await?;
                Ok::<_, DmError>(rows.into_iter().next().map(|row| row.fields))
            })
            .await;
        self.in_flight.store(false, Ordering::SeqCst);
        result.cloned()
    }
}

/// Session-scoped slot registry keyed by (target type, id).
#[derive(Default)]
pub(crate) struct AssocCache {
    slots: Mutex<HashMap<(String, Id), Arc<AssocSlot>>>,
}

impl AssocCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn slot(&self, target_type: &str, id: Id) -> Arc<AssocSlot> {
        let mut slots = self.slots.lock();
        slots
            .entry((target_type.to_string(), id))
            .or_insert_with(|| Arc::new(AssocSlot::new()))
            .clone()
    }

    /// Drop every resolved or pending slot of a type. Used after bulk
    /// updates, which invalidate cached target rows wholesale.
    pub(crate) fn evict_type(&self, target_type: &str) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|(tt, _), _| tt != target_type);
        before - slots.len()
    }

    pub(crate) fn clear(&self) {
        self.slots.lock().clear();
    }
}

/// A typed handle to one record's association reference. Cheap to clone;
/// clones share the underlying slot.
pub struct AssocRef<A: Entity> {
    fk: Option<Id>,
    slot: Option<Arc<AssocSlot>>,
    _marker: PhantomData<fn() -> A>,
}

impl<A: Entity> Clone for AssocRef<A> {
    fn clone(&self) -> Self {
        Self {
            fk: self.fk,
            slot: self.slot.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Entity> std::fmt::Debug for AssocRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssocRef")
            .field("target_type", &A::TYPE_NAME)
            .field("fk", &self.fk)
            .field("state", &self.state())
            .finish()
    }
}

impl<A: Entity> AssocRef<A> {
    /// A reference whose foreign key is null. Resolves to `None` without
    /// touching the store.
    pub(crate) fn absent() -> Self {
        Self {
            fk: None,
            slot: None,
            _marker: PhantomData,
        }
    }

    pub(crate) fn to_slot(fk: Id, slot: Arc<AssocSlot>) -> Self {
        Self {
            fk: Some(fk),
            slot: Some(slot),
            _marker: PhantomData,
        }
    }

    pub fn fk(&self) -> Option<Id> {
        self.fk
    }

    pub fn state(&self) -> AssocState {
        match &self.slot {
            Some(slot) => slot.state(),
            // nothing to load
            None => AssocState::Loaded,
        }
    }

    pub(crate) async fn resolve_fields(
        &self,
        store: &dyn StoreAdapter,
    ) -> DmResult<Option<FieldMap>> {
        match (self.fk, &self.slot) {
            (Some(id), Some(slot)) => slot.resolve(store, A::TYPE_NAME, id).await,
            _ => Ok(None),
        }
    }
}

/// Resolve every association of a loaded row set with one batched id query
/// per association, filling the shared slots. Already-resolved targets are
/// skipped.
pub(crate) async fn prefetch_into_cache(
    store: &dyn StoreAdapter,
    cache: &AssocCache,
    associations: &[Association],
    rows: &[Row],
) -> DmResult<()> {
    for assoc in associations {
        let mut pending: Vec<Id> = Vec::new();
        let mut slots: Vec<(Id, Arc<AssocSlot>)> = Vec::new();
        for row in rows {
            let Some(fk) = row.get(assoc.fk_column).as_id() else {
                continue;
            };
            let slot = cache.slot(assoc.target_type, fk);
            if slot.state() == AssocState::Loaded {
                continue;
            }
            if !pending.contains(&fk) {
                pending.push(fk);
            }
            slots.push((fk, slot));
        }
        if pending.is_empty() {
            continue;
        }

        let fetched = store
            .query(
                assoc.target_type,
                &Predicate::IdIn(pending.clone()),
                &SortOrder::unsorted(),
                0,
                None,
            )
            .await?;
        debug!(
            association = assoc.field,
            requested = pending.len(),
            found = fetched.len(),
            "prefetched association batch"
        );
        let by_id: HashMap<Id, FieldMap> =
            fetched.into_iter().map(|row| (row.id, row.fields)).collect();
        for (fk, slot) in slots {
            slot.fill(by_id.get(&fk).cloned());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_core::Value;
    use dm_store::MemoryStore;

    #[derive(Debug, Clone, Default)]
    struct Team {
        id: Option<Id>,
        name: String,
    }

    impl Entity for Team {
        const TYPE_NAME: &'static str = "team";

        fn id(&self) -> Option<Id> {
            self.id
        }

        fn set_id(&mut self, id: Id) {
            self.id = Some(id);
        }

        fn field_names() -> &'static [&'static str] {
            &["name"]
        }

        fn get(&self, field: &str) -> Value {
            match field {
                "name" => Value::Str(self.name.clone()),
                _ => Value::Null,
            }
        }

        fn set(&mut self, field: &str, value: Value) {
            if field == "name" {
                self.name = value.as_str().unwrap_or_default().to_string();
            }
        }
    }

    #[test]
    fn test_join_fetch_with_pagination_rejected() {
        let options = FetchOptions::new().join_fetch();
        let err = options.validate(true).unwrap_err();
        assert!(matches!(err, DmError::UnsupportedFetchCombination { .. }));
        assert_eq!(err.error_code(), "unsupported_fetch_combination");

        options.validate(false).unwrap();
        FetchOptions::new().prefetch().validate(true).unwrap();
    }

    #[tokio::test]
    async fn test_absent_reference_resolves_without_store() {
        let store = MemoryStore::new();
        let reference = AssocRef::<Team>::absent();
        assert_eq!(reference.state(), AssocState::Loaded);
        assert!(reference.resolve_fields(&store).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slot_queries_once_across_clones() {
        let store = MemoryStore::new();
        let id = store
            .insert(
                "team",
                None,
                FieldMap::from([("name".to_string(), Value::Str("teamA".into()))]),
            )
            .await
            .unwrap();

        let cache = AssocCache::new();
        let reference = AssocRef::<Team>::to_slot(id, cache.slot("team", id));
        let twin = reference.clone();
        assert_eq!(reference.state(), AssocState::Unloaded);

        let fields = reference.resolve_fields(&store).await.unwrap().unwrap();
        assert_eq!(fields.get("name"), Some(&Value::Str("teamA".into())));
        assert_eq!(twin.state(), AssocState::Loaded);

        // a resolved slot answers from the cell even after the row is gone
        store.delete("team", id).await.unwrap();
        assert!(twin.resolve_fields(&store).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dangling_reference_resolves_to_none_once() {
        let store = MemoryStore::new();
        let cache = AssocCache::new();
        let reference = AssocRef::<Team>::to_slot(99, cache.slot("team", 99));

        assert!(reference.resolve_fields(&store).await.unwrap().is_none());
        assert_eq!(reference.state(), AssocState::Loaded);
    }

    #[tokio::test]
    async fn test_prefetch_fills_shared_slots() {
        let store = MemoryStore::new();
        let team_a = store
            .insert(
                "team",
                None,
                FieldMap::from([("name".to_string(), Value::Str("teamA".into()))]),
            )
            .await
            .unwrap();

        let assoc = Association {
            field: "team",
            fk_column: "team_id",
            target_type: "team",
        };
        let rows = vec![
            Row::new(10, FieldMap::from([("team_id".to_string(), Value::Ref(team_a))])),
            Row::new(11, FieldMap::from([("team_id".to_string(), Value::Ref(team_a))])),
            Row::new(12, FieldMap::from([("team_id".to_string(), Value::Null)])),
        ];

        let cache = AssocCache::new();
        prefetch_into_cache(&store, &cache, &[assoc], &rows)
            .await
            .unwrap();

        let slot = cache.slot("team", team_a);
        assert_eq!(slot.state(), AssocState::Loaded);
        let fields = slot.loaded().unwrap().unwrap();
        assert_eq!(fields.get("name"), Some(&Value::Str("teamA".into())));
    }
}
