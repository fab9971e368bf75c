//! Unit-of-work session
//!
//! A `Session` is the caller-facing surface: it owns one tracking
//! context, one association slot cache, and the pessimistic locks
//! acquired on its behalf. Reads go through the identity map before the
//! store; writes accumulate in the context until `flush`. A session is
//! single-unit-of-work state and must be discarded when that unit ends,
//! which also releases its locks.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use dm_core::{
    DmError, DmResult, Entity, FetchStrategy, Id, LockMode, Page, PageRequest, SessionConfig,
    Slice,
};
use dm_query::{Example, Predicate, SortOrder};
use dm_store::{FieldUpdate, LockHandle, Row, StoreAdapter};

use crate::audit::PrincipalProvider;
use crate::bulk::{self, BulkOutcome};
use crate::fetch::{prefetch_into_cache, AssocCache, AssocRef, FetchOptions};
use crate::paging::{fetch_page_rows, fetch_slice_rows};
use crate::projection::{project_row, FlatProjection, LazyView, ProjectionShape};
use crate::tracking::{AppliedWrite, PlannedWrite, Tracked, TrackingContext, WriteKind};

pub struct Session {
    store: Arc<dyn StoreAdapter>,
    principal: Arc<dyn PrincipalProvider>,
    config: SessionConfig,
    tracking: TrackingContext,
    assoc_cache: Arc<AssocCache>,
    // Held for the session's lifetime; dropping the session releases them.
    locks: Mutex<Vec<LockHandle>>,
}

impl Session {
    pub fn new(store: Arc<dyn StoreAdapter>, principal: Arc<dyn PrincipalProvider>) -> Self {
        Self::with_config(store, principal, SessionConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn StoreAdapter>,
        principal: Arc<dyn PrincipalProvider>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            principal,
            config,
            tracking: TrackingContext::new(),
            assoc_cache: Arc::new(AssocCache::new()),
            locks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// A page request of the configured default size.
    pub fn page_of(&self, number: i64) -> DmResult<PageRequest> {
        PageRequest::of(number, self.config.default_page_size)
    }

    /// Track a record for writing at the next flush. A new record becomes
    /// a pending insert; a detached record with an id becomes a pending
    /// full update. If the record's (type, id) is already tracked, the
    /// existing instance is returned unchanged.
    pub fn save<T: Entity>(&self, entity: T) -> Tracked<T> {
        self.tracking.register(entity)
    }

    /// Mark a tracked record for deletion at the next flush. Unpersisted
    /// new records are simply discarded.
    pub fn delete<T: Entity>(&self, tracked: &Tracked<T>) -> bool {
        self.tracking.mark_deleted(tracked)
    }

    /// The tracked instance for (T, id) if this session already holds one.
    pub fn tracked<T: Entity>(&self, id: Id) -> Option<Tracked<T>> {
        self.tracking.get::<T>(id)
    }

    /// Load one record by id. The identity map answers first: a tracked
    /// instance is returned as-is and the given options do not re-apply
    /// to it. Absence is `None`, never an error.
    pub async fn find_by_id<T: Entity>(
        &self,
        id: Id,
        options: &FetchOptions,
    ) -> DmResult<Option<Tracked<T>>> {
        if let Some(existing) = self.tracking.get::<T>(id) {
            return Ok(Some(existing));
        }
        options.validate(false)?;
        let rows = self
            .store
            .query(
                T::TYPE_NAME,
                &Predicate::IdIn(vec![id]),
                &SortOrder::unsorted(),
                0,
                Some(1),
            )
            .await?;
        if options.strategy != FetchStrategy::Lazy {
            prefetch_into_cache(
                self.store.as_ref(),
                &self.assoc_cache,
                T::associations(),
                &rows,
            )
            .await?;
        }
        Ok(self.attach_rows::<T>(rows, options).await?.into_iter().next())
    }

    pub async fn find_all<T: Entity>(&self, sort: &SortOrder) -> DmResult<Vec<Tracked<T>>> {
        self.find_where(&Predicate::All, sort, &FetchOptions::new())
            .await
    }

    /// Load every record matching the predicate. On an unpaginated query
    /// the join-fetch strategy degenerates to the same batched resolution
    /// a prefetch graph uses, since the row adapter has no joined shape.
    pub async fn find_where<T: Entity>(
        &self,
        predicate: &Predicate,
        sort: &SortOrder,
        options: &FetchOptions,
    ) -> DmResult<Vec<Tracked<T>>> {
        options.validate(false)?;
        let rows = self
            .store
            .query(T::TYPE_NAME, predicate, &sort.with_id_tiebreak(), 0, None)
            .await?;
        if options.strategy != FetchStrategy::Lazy {
            prefetch_into_cache(
                self.store.as_ref(),
                &self.assoc_cache,
                T::associations(),
                &rows,
            )
            .await?;
        }
        self.attach_rows::<T>(rows, options).await
    }

    /// Load one page with totals. Two store operations (content + count),
    /// plus a verification count when the options carry a count hint.
    pub async fn find_page<T: Entity>(
        &self,
        predicate: &Predicate,
        sort: &SortOrder,
        request: PageRequest,
        options: &FetchOptions,
    ) -> DmResult<Page<Tracked<T>>> {
        options.validate(true)?;
        self.check_page_size(request)?;
        let (rows, total) = fetch_page_rows(
            self.store.as_ref(),
            T::TYPE_NAME,
            predicate,
            sort,
            request,
            options.count_hint.as_ref(),
        )
        .await?;
        if options.strategy == FetchStrategy::PrefetchGraph {
            prefetch_into_cache(
                self.store.as_ref(),
                &self.assoc_cache,
                T::associations(),
                &rows,
            )
            .await?;
        }
        let content = self.attach_rows::<T>(rows, options).await?;
        Ok(Page::new(content, request, total))
    }

    /// Load one slice: no count query, a one-row look-ahead probe signals
    /// whether a next window exists.
    pub async fn find_slice<T: Entity>(
        &self,
        predicate: &Predicate,
        sort: &SortOrder,
        request: PageRequest,
        options: &FetchOptions,
    ) -> DmResult<Slice<Tracked<T>>> {
        options.validate(true)?;
        self.check_page_size(request)?;
        let (rows, has_next) = fetch_slice_rows(
            self.store.as_ref(),
            T::TYPE_NAME,
            predicate,
            sort,
            request,
        )
        .await?;
        if options.strategy == FetchStrategy::PrefetchGraph {
            prefetch_into_cache(
                self.store.as_ref(),
                &self.assoc_cache,
                T::associations(),
                &rows,
            )
            .await?;
        }
        let content = self.attach_rows::<T>(rows, options).await?;
        Ok(Slice::new(content, request, has_next))
    }

    /// Query by example: the probe's predicate tree, then a plain load.
    pub async fn find_by_example<T: Entity>(
        &self,
        example: &Example,
        sort: &SortOrder,
        options: &FetchOptions,
    ) -> DmResult<Vec<Tracked<T>>> {
        if example.entity_type() != T::TYPE_NAME {
            return Err(DmError::UnsupportedMatchShape {
                path: example.entity_type().to_string(),
                message: format!(
                    "example probes '{}', query targets '{}'",
                    example.entity_type(),
                    T::TYPE_NAME
                ),
            });
        }
        let predicate = example.build()?;
        self.find_where(&predicate, sort, options).await
    }

    pub async fn count<T: Entity>(&self, predicate: &Predicate) -> DmResult<i64> {
        self.store.count(T::TYPE_NAME, predicate).await
    }

    /// Typed reference to one of a tracked record's declared associations.
    /// The reference shares this session's slot cache, so resolution is
    /// single-flight across every holder.
    pub fn association<T: Entity, A: Entity>(
        &self,
        tracked: &Tracked<T>,
        field: &str,
    ) -> DmResult<AssocRef<A>> {
        let Some(association) = T::association(field) else {
            return Err(DmError::UnknownField {
                entity_type: T::TYPE_NAME.to_string(),
                field: field.to_string(),
            });
        };
        if association.target_type != A::TYPE_NAME {
            return Err(DmError::UnsupportedMatchShape {
                path: format!("{}.{field}", T::TYPE_NAME),
                message: format!(
                    "association targets '{}', requested '{}'",
                    association.target_type,
                    A::TYPE_NAME
                ),
            });
        }
        Ok(match tracked.with(|e| e.get(association.fk_column).as_id()) {
            Some(fk) => AssocRef::to_slot(fk, self.assoc_cache.slot(association.target_type, fk)),
            None => AssocRef::absent(),
        })
    }

    /// Eager flat projections over every matching row. Projections are
    /// detached read models; nothing here enters the tracking context.
    pub async fn project<T: Entity>(
        &self,
        predicate: &Predicate,
        sort: &SortOrder,
        paths: &[&str],
    ) -> DmResult<Vec<FlatProjection>> {
        let shape = ProjectionShape::of::<T>(paths)?;
        let rows = self
            .store
            .query(T::TYPE_NAME, predicate, &sort.with_id_tiebreak(), 0, None)
            .await?;
        let mut projections = Vec::with_capacity(rows.len());
        for row in &rows {
            projections.push(project_row(self.store.as_ref(), &self.assoc_cache, &shape, row).await?);
        }
        Ok(projections)
    }

    /// One page of flat projections, with page totals.
    pub async fn project_page<T: Entity>(
        &self,
        predicate: &Predicate,
        sort: &SortOrder,
        request: PageRequest,
        paths: &[&str],
    ) -> DmResult<Page<FlatProjection>> {
        let shape = ProjectionShape::of::<T>(paths)?;
        self.check_page_size(request)?;
        let (rows, total) = fetch_page_rows(
            self.store.as_ref(),
            T::TYPE_NAME,
            predicate,
            sort,
            request,
            None,
        )
        .await?;
        let mut content = Vec::with_capacity(rows.len());
        for row in &rows {
            content.push(project_row(self.store.as_ref(), &self.assoc_cache, &shape, row).await?);
        }
        Ok(Page::new(content, request, total))
    }

    /// Lazy views over every matching row: owner fields eager, association
    /// paths deferred to the shared slot cache.
    pub async fn lazy_views<T: Entity>(
        &self,
        predicate: &Predicate,
        sort: &SortOrder,
    ) -> DmResult<Vec<LazyView>> {
        let rows = self
            .store
            .query(T::TYPE_NAME, predicate, &sort.with_id_tiebreak(), 0, None)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                LazyView::new(
                    T::TYPE_NAME,
                    row,
                    T::associations(),
                    self.store.clone(),
                    self.assoc_cache.clone(),
                )
            })
            .collect())
    }

    /// Set-based update of every matching row, bypassing tracked
    /// instances. Tracked entries and cached association slots of the
    /// target type are evicted afterwards so later reads see the store's
    /// state; unflushed local changes to evicted entries are discarded.
    pub async fn bulk_update<T: Entity>(
        &self,
        predicate: &Predicate,
        updates: &[FieldUpdate],
    ) -> DmResult<BulkOutcome> {
        bulk::validate_updates::<T>(updates)?;
        let affected = self
            .store
            .bulk_update(T::TYPE_NAME, predicate, updates)
            .await?;
        let outcome = bulk::reconcile(&self.tracking, &self.assoc_cache, T::TYPE_NAME, affected);
        debug!(
            entity_type = T::TYPE_NAME,
            affected = outcome.affected,
            evicted = outcome.evicted,
            "bulk update reconciled"
        );
        Ok(outcome)
    }

    /// Write out every pending change: inserts with audit stamping and
    /// store-assigned ids, minimal diffs for dirty entries with version
    /// checks, then deletes. Returns what was written. A store failure
    /// aborts mid-flush; the unit of work is then failed as a whole and
    /// the caller retries with a fresh session.
    pub async fn flush(&self) -> DmResult<Vec<AppliedWrite>> {
        let principal = self.principal.current_principal();
        let plan = self.tracking.plan_flush(&principal, Utc::now())?;

        let mut applied = Vec::with_capacity(plan.len());
        let mut removed = Vec::new();
        for write in plan {
            match write {
                PlannedWrite::Insert {
                    index,
                    entity_type,
                    id_hint,
                    fields,
                } => {
                    let id = self.store.insert(entity_type, id_hint, fields.clone()).await?;
                    self.tracking.complete_insert(index, id);
                    debug!(entity_type, id, "flush: insert");
                    applied.push(AppliedWrite {
                        kind: WriteKind::Insert,
                        entity_type,
                        id,
                        fields,
                    });
                }
                PlannedWrite::Update {
                    index,
                    entity_type,
                    id,
                    changes,
                    expected_version,
                    refreshed,
                } => {
                    self.store
                        .update(entity_type, id, changes.clone(), expected_version)
                        .await?;
                    self.tracking.complete_update(index, refreshed);
                    debug!(entity_type, id, changed = changes.len(), "flush: update");
                    applied.push(AppliedWrite {
                        kind: WriteKind::Update,
                        entity_type,
                        id,
                        fields: changes,
                    });
                }
                PlannedWrite::Delete {
                    index,
                    entity_type,
                    id,
                } => {
                    self.store.delete(entity_type, id).await?;
                    removed.push(index);
                    debug!(entity_type, id, "flush: delete");
                    applied.push(AppliedWrite {
                        kind: WriteKind::Delete,
                        entity_type,
                        id,
                        fields: Default::default(),
                    });
                }
            }
        }
        self.tracking.remove_entries(removed);
        Ok(applied)
    }

    /// Discard every pending change, cached slot, and held lock.
    pub fn rollback(&self) {
        self.tracking.clear();
        self.assoc_cache.clear();
        self.locks.lock().clear();
    }

    fn check_page_size(&self, request: PageRequest) -> DmResult<()> {
        if request.size() > self.config.max_page_size {
            return Err(DmError::InvalidPageRequest {
                page: request.number(),
                size: request.size(),
            });
        }
        Ok(())
    }

    async fn attach_rows<T: Entity>(
        &self,
        rows: Vec<Row>,
        options: &FetchOptions,
    ) -> DmResult<Vec<Tracked<T>>> {
        let mut tracked = Vec::with_capacity(rows.len());
        for row in rows {
            if options.lock == LockMode::Pessimistic {
                let handle = self
                    .store
                    .begin_lock(T::TYPE_NAME, row.id, self.config.lock_wait())
                    .await?;
                self.locks.lock().push(handle);
            }
            let entity = T::hydrate(row.id, &row.fields);
            tracked.push(self.tracking.register_loaded(entity, options.read_only));
        }
        Ok(tracked)
    }
}

impl<A: Entity> AssocRef<A> {
    /// Resolve to the tracked target record. The session's identity map
    /// answers first; otherwise the shared slot loads at most once and
    /// the hydrated target joins the tracking context.
    pub async fn load(&self, session: &Session) -> DmResult<Option<Tracked<A>>> {
        let Some(fk) = self.fk() else {
            return Ok(None);
        };
        if let Some(existing) = session.tracking.get::<A>(fk) {
            return Ok(Some(existing));
        }
        let fields = self.resolve_fields(session.store.as_ref()).await?;
        Ok(fields.map(|fields| {
            session
                .tracking
                .register_loaded(A::hydrate(fk, &fields), false)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::FixedPrincipal;
    use dm_core::{Association, AuditMetadata, Value};
    use dm_store::MemoryStore;

    #[derive(Debug, Clone, Default)]
    struct Member {
        id: Option<Id>,
        username: String,
        age: i64,
        team_id: Option<Id>,
        audit: AuditMetadata,
        version: i64,
    }

    impl Member {
        fn new(username: &str, age: i64) -> Self {
            Self {
                username: username.to_string(),
                age,
                ..Default::default()
            }
        }
    }

    impl Entity for Member {
        const TYPE_NAME: &'static str = "member";

        fn id(&self) -> Option<Id> {
            self.id
        }

        fn set_id(&mut self, id: Id) {
            self.id = Some(id);
        }

        fn field_names() -> &'static [&'static str] {
            &["username", "age", "team_id"]
        }

        fn get(&self, field: &str) -> Value {
            match field {
                "username" => Value::Str(self.username.clone()),
                "age" => Value::Int(self.age),
                "team_id" => self.team_id.map(Value::Ref).unwrap_or(Value::Null),
                _ => Value::Null,
            }
        }

        fn set(&mut self, field: &str, value: Value) {
            match field {
                "username" => self.username = value.as_str().unwrap_or_default().to_string(),
                "age" => self.age = value.as_int().unwrap_or(0),
                "team_id" => self.team_id = value.as_id(),
                _ => {}
            }
        }

        fn associations() -> &'static [Association] {
            &[Association {
                field: "team",
                fk_column: "team_id",
                target_type: "team",
            }]
        }

        fn audit(&self) -> Option<&AuditMetadata> {
            Some(&self.audit)
        }

        fn audit_mut(&mut self) -> Option<&mut AuditMetadata> {
            Some(&mut self.audit)
        }

        fn version(&self) -> Option<i64> {
            Some(self.version)
        }

        fn set_version(&mut self, version: i64) {
            self.version = version;
        }
    }

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

    fn session(store: Arc<MemoryStore>) -> Session {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Session::new(store, Arc::new(FixedPrincipal::named("admin")))
    }

    #[tokio::test]
    async fn test_save_flush_assigns_id_and_stamps_audit() {
        let store = Arc::new(MemoryStore::new());
        let session = session(store.clone());

        let member = session.save(Member::new("m1", 10));
        assert_eq!(member.id(), None);

        let applied = session.flush().await.unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].kind, WriteKind::Insert);

        let id = member.id().unwrap();
        assert_eq!(applied[0].id, id);
        member.with(|m| {
            assert_eq!(m.audit.created_by.as_deref(), Some("admin"));
            assert_eq!(m.audit.last_modified_by.as_deref(), Some("admin"));
        });

        // clean context after flush
        assert!(session.flush().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_by_id_uses_identity_map() {
        let store = Arc::new(MemoryStore::new());
        let session = session(store.clone());
        let saved = session.save(Member::new("m1", 10));
        session.flush().await.unwrap();
        let id = saved.id().unwrap();

        let loaded = session
            .find_by_id::<Member>(id, &FetchOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.same_instance(&saved));
    }

    #[tokio::test]
    async fn test_dirty_flush_bumps_version() {
        let store = Arc::new(MemoryStore::new());
        let session = session(store.clone());
        let member = session.save(Member::new("m1", 10));
        session.flush().await.unwrap();
        assert_eq!(member.with(|m| m.version), 0);

        member.update(|m| m.age = 11);
        let applied = session.flush().await.unwrap();
        assert_eq!(applied[0].kind, WriteKind::Update);
        assert_eq!(member.with(|m| m.version), 1);
        assert!(applied[0].fields.contains_key("age"));
        assert!(!applied[0].fields.contains_key("username"));
    }

    #[tokio::test]
    async fn test_detached_save_uses_entity_version() {
        let store = Arc::new(MemoryStore::new());
        let writer = session(store.clone());
        let member = writer.save(Member::new("m1", 10));
        writer.flush().await.unwrap();
        member.update(|m| m.age = 11);
        writer.flush().await.unwrap();
        assert_eq!(member.with(|m| m.version), 1);

        // detached copy carrying the stored version, saved elsewhere
        let detached = member.cloned();
        let other = session(store.clone());
        let tracked = other.save(detached);
        let applied = other.flush().await.unwrap();

        assert_eq!(applied[0].kind, WriteKind::Update);
        assert_eq!(tracked.with(|m| m.version), 2);
    }

    #[tokio::test]
    async fn test_stale_detached_save_conflicts() {
        let store = Arc::new(MemoryStore::new());
        let writer = session(store.clone());
        let member = writer.save(Member::new("m1", 10));
        writer.flush().await.unwrap();
        let stale = member.cloned(); // version 0
        member.update(|m| m.age = 11);
        writer.flush().await.unwrap(); // store is now at version 1

        let other = session(store.clone());
        other.save(stale);
        let err = other.flush().await.unwrap_err();
        assert!(matches!(
            err,
            DmError::OptimisticLockConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_at_flush() {
        let store = Arc::new(MemoryStore::new());
        let writer = session(store.clone());
        let member = writer.save(Member::new("m1", 10));
        writer.flush().await.unwrap();
        let id = member.id().unwrap();

        let session_a = session(store.clone());
        let session_b = session(store.clone());
        let in_a = session_a
            .find_by_id::<Member>(id, &FetchOptions::new())
            .await
            .unwrap()
            .unwrap();
        let in_b = session_b
            .find_by_id::<Member>(id, &FetchOptions::new())
            .await
            .unwrap()
            .unwrap();

        in_a.update(|m| m.age = 11);
        session_a.flush().await.unwrap();

        in_b.update(|m| m.age = 12);
        let err = session_b.flush().await.unwrap_err();
        assert!(matches!(err, DmError::OptimisticLockConflict { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_read_only_load_never_flushes() {
        let store = Arc::new(MemoryStore::new());
        let writer = session(store.clone());
        let member = writer.save(Member::new("m1", 10));
        writer.flush().await.unwrap();
        let id = member.id().unwrap();

        let reader = session(store.clone());
        let loaded = reader
            .find_by_id::<Member>(id, &FetchOptions::new().read_only())
            .await
            .unwrap()
            .unwrap();
        loaded.update(|m| m.age = 99);

        assert!(reader.flush().await.unwrap().is_empty());
        assert_eq!(
            store.count("member", &Predicate::eq("age", 99i64)).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_rollback_discards_pending_writes() {
        let store = Arc::new(MemoryStore::new());
        let session = session(store.clone());
        session.save(Member::new("m1", 10));
        session.rollback();

        assert!(session.flush().await.unwrap().is_empty());
        assert_eq!(store.count("member", &Predicate::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_association_loads_through_identity_map() {
        let store = Arc::new(MemoryStore::new());
        let writer = session(store.clone());
        let team = writer.save(Team {
            id: None,
            name: "teamA".to_string(),
        });
        writer.flush().await.unwrap();
        let team_id = team.id().unwrap();
        let mut probe = Member::new("m1", 10);
        probe.team_id = Some(team_id);
        let member = writer.save(probe);
        writer.flush().await.unwrap();
        let member_id = member.id().unwrap();

        let session = session(store.clone());
        let loaded = session
            .find_by_id::<Member>(member_id, &FetchOptions::new())
            .await
            .unwrap()
            .unwrap();
        let reference: AssocRef<Team> = session.association(&loaded, "team").unwrap();
        let first = reference.load(&session).await.unwrap().unwrap();
        let second = reference.load(&session).await.unwrap().unwrap();

        assert!(first.same_instance(&second));
        assert_eq!(first.with(|t| t.name.clone()), "teamA");
    }

    #[derive(Debug, Clone, Default)]
    struct Item {
        id: Option<Id>,
        name: String,
        audit: AuditMetadata,
    }

    impl Entity for Item {
        const TYPE_NAME: &'static str = "item";

        fn id(&self) -> Option<Id> {
            self.id
        }

        fn set_id(&mut self, id: Id) {
            self.id = Some(id);
        }

        // ids are caller-assigned, so novelty comes from the audit marker
        fn is_new(&self) -> bool {
            self.audit.created_at.is_none()
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

        fn audit(&self) -> Option<&AuditMetadata> {
            Some(&self.audit)
        }

        fn audit_mut(&mut self) -> Option<&mut AuditMetadata> {
            Some(&mut self.audit)
        }
    }

    #[tokio::test]
    async fn test_assigned_id_insert_via_novelty_marker() {
        let store = Arc::new(MemoryStore::new());
        let session = session(store.clone());

        let item = session.save(Item {
            id: Some(500),
            name: "A".to_string(),
            audit: AuditMetadata::default(),
        });
        let applied = session.flush().await.unwrap();
        assert_eq!(applied[0].kind, WriteKind::Insert);
        assert_eq!(applied[0].id, 500);

        // persisted: the creation stamp now marks it as managed
        assert!(!item.with(|i| i.is_new()));
        item.update(|i| i.name = "B".to_string());
        let applied = session.flush().await.unwrap();
        assert_eq!(applied[0].kind, WriteKind::Update);
        assert_eq!(applied[0].id, 500);
    }

    async fn seed_members(store: &Arc<MemoryStore>) {
        let writer = session(store.clone());
        for (name, age) in [
            ("member1", 10),
            ("member2", 19),
            ("member3", 20),
            ("member4", 21),
            ("member5", 40),
        ] {
            writer.save(Member::new(name, age));
        }
        writer.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_page_window_with_totals() {
        let store = Arc::new(MemoryStore::new());
        seed_members(&store).await;

        let session = session(store);
        let page = session
            .find_page::<Member>(
                &Predicate::All,
                &SortOrder::by_desc("username"),
                PageRequest::of(0, 3).unwrap(),
                &FetchOptions::new(),
            )
            .await
            .unwrap();

        let names: Vec<_> = page
            .content
            .iter()
            .map(|m| m.with(|m| m.username.clone()))
            .collect();
        assert_eq!(names, ["member5", "member4", "member3"]);
        assert_eq!(page.total_elements, 5);
        assert_eq!(page.total_pages(), 2);
        assert!(page.is_first());
        assert!(page.has_next());

        // Page::map keeps the window metadata
        let name_page = page.map(|m| m.with(|m| m.username.clone()));
        assert_eq!(name_page.total_elements, 5);
        assert_eq!(name_page.content[0], "member5");
    }

    #[tokio::test]
    async fn test_slice_look_ahead() {
        let store = Arc::new(MemoryStore::new());
        seed_members(&store).await;

        let session = session(store);
        let slice = session
            .find_slice::<Member>(
                &Predicate::All,
                &SortOrder::by_asc("username"),
                PageRequest::of(1, 3).unwrap(),
                &FetchOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(slice.content.len(), 2);
        assert!(!slice.has_next);
    }

    #[tokio::test]
    async fn test_find_by_example_with_nested_probe() {
        use dm_query::ExampleMatcher;

        let store = Arc::new(MemoryStore::new());
        let writer = session(store.clone());
        let team_a = writer.save(Team {
            id: None,
            name: "teamA".to_string(),
        });
        let team_b = writer.save(Team {
            id: None,
            name: "teamB".to_string(),
        });
        writer.flush().await.unwrap();

        let mut m1 = Member::new("m1", 0);
        m1.team_id = team_a.id();
        let mut m2 = Member::new("m2", 0);
        m2.team_id = team_b.id();
        writer.save(m1.clone());
        writer.save(m2);
        writer.flush().await.unwrap();

        let mut probe = Member::new("m1", 0);
        probe.age = 77; // wrong on purpose, ignored below
        let probe_team = Team {
            id: None,
            name: "teamA".to_string(),
        };
        let example = Example::of(&probe)
            .with_matcher(ExampleMatcher::matching().with_ignore_paths(["age"]))
            .probe_association("team", &probe_team)
            .unwrap();

        let session = session(store);
        let found = session
            .find_by_example::<Member>(&example, &SortOrder::unsorted(), &FetchOptions::new())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].with(|m| m.username.clone()), "m1");
    }

    #[tokio::test]
    async fn test_bulk_update_evicts_and_rereads_fresh() {
        let store = Arc::new(MemoryStore::new());
        seed_members(&store).await;

        let session = session(store.clone());
        let member5 = session
            .find_where::<Member>(
                &Predicate::eq("username", "member5"),
                &SortOrder::unsorted(),
                &FetchOptions::new(),
            )
            .await
            .unwrap()
            .remove(0);
        let id = member5.id().unwrap();
        assert_eq!(member5.with(|m| m.age), 40);

        let outcome = session
            .bulk_update::<Member>(
                &Predicate::ge("age", 20i64),
                &[FieldUpdate::increment("age", 1)],
            )
            .await
            .unwrap();
        assert_eq!(outcome.affected, 3);
        assert_eq!(outcome.evicted, 1);

        // the stale instance left the context; a re-read sees the store
        assert!(session.tracked::<Member>(id).is_none());
        let fresh = session
            .find_by_id::<Member>(id, &FetchOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert!(!fresh.same_instance(&member5));
        assert_eq!(fresh.with(|m| m.age), 41);
    }

    #[tokio::test]
    async fn test_flat_projection_over_association() {
        let store = Arc::new(MemoryStore::new());
        let writer = session(store.clone());
        let team = writer.save(Team {
            id: None,
            name: "teamA".to_string(),
        });
        writer.flush().await.unwrap();
        let mut m1 = Member::new("m1", 10);
        m1.team_id = team.id();
        writer.save(m1);
        writer.flush().await.unwrap();

        let session = session(store);
        let projections = session
            .project::<Member>(&Predicate::All, &SortOrder::unsorted(), &[
                "username",
                "team.name",
            ])
            .await
            .unwrap();
        assert_eq!(projections.len(), 1);
        assert_eq!(projections[0].get("username"), &Value::Str("m1".into()));
        assert_eq!(projections[0].get("team.name"), &Value::Str("teamA".into()));
        // projections are detached; nothing was tracked
        assert!(session.flush().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pessimistic_lock_held_until_rollback() {
        let store = Arc::new(MemoryStore::new());
        seed_members(&store).await;

        let config = SessionConfig {
            lock_wait_ms: 10,
            ..Default::default()
        };
        let holder = Session::with_config(
            store.clone(),
            Arc::new(FixedPrincipal::named("admin")),
            config.clone(),
        );
        let locked = holder
            .find_where::<Member>(
                &Predicate::eq("username", "member1"),
                &SortOrder::unsorted(),
                &FetchOptions::new().with_lock(LockMode::Pessimistic),
            )
            .await
            .unwrap();
        let id = locked[0].id().unwrap();

        let contender = Session::with_config(
            store.clone(),
            Arc::new(FixedPrincipal::named("admin")),
            config,
        );
        let err = contender
            .find_by_id::<Member>(id, &FetchOptions::new().with_lock(LockMode::Pessimistic))
            .await
            .unwrap_err();
        assert!(matches!(err, DmError::LockTimeout { .. }));

        holder.rollback();
        contender
            .find_by_id::<Member>(id, &FetchOptions::new().with_lock(LockMode::Pessimistic))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_fetch_page_rejected_before_store() {
        let store = Arc::new(MemoryStore::new());
        let session = session(store);
        let err = session
            .find_page::<Member>(
                &Predicate::All,
                &SortOrder::unsorted(),
                PageRequest::of(0, 3).unwrap(),
                &FetchOptions::new().join_fetch(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DmError::UnsupportedFetchCombination { .. }));
    }

    #[tokio::test]
    async fn test_page_size_over_configured_max_rejected() {
        let store = Arc::new(MemoryStore::new());
        let config = SessionConfig {
            max_page_size: 10,
            ..Default::default()
        };
        let session =
            Session::with_config(store, Arc::new(FixedPrincipal::named("admin")), config);
        let err = session
            .find_page::<Member>(
                &Predicate::All,
                &SortOrder::unsorted(),
                PageRequest::of(0, 11).unwrap(),
                &FetchOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DmError::InvalidPageRequest { .. }));
    }
}
