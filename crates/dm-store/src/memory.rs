//! In-memory reference store
//!
//! Evaluates predicates in process and keeps one `BTreeMap` table per
//! entity type, so iteration is id-ascending before any sort is applied.
//! Content and count queries are separate calls here, as they are against
//! a real engine; between them the store may move on, which is the
//! documented weak-consistency caveat of page totals.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use dm_core::{DmError, DmResult, FieldMap, Id, VERSION_FIELD, Value};
use dm_query::{AssociationLookup, Predicate, SortOrder};

use crate::adapter::{FieldUpdate, LockHandle, Row, StoreAdapter};

type Table = BTreeMap<Id, FieldMap>;

/// In-memory store adapter with row-level pessimistic locks.
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
    next_id: AtomicI64,
    row_locks: Mutex<HashMap<(String, Id), Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            row_locks: Mutex::new(HashMap::new()),
        }
    }

    fn allocate_id(&self) -> Id {
        self.next_id.fetch_add(1, AtomicOrdering::SeqCst)
    }

    fn matching_ids(&self, entity_type: &str, predicate: &Predicate) -> Vec<Id> {
        let tables = self.tables.read();
        let lookup = TableLookup(&tables);
        tables
            .get(entity_type)
            .map(|table| {
                table
                    .iter()
                    .filter(|(id, fields)| predicate.matches(**id, fields, &lookup))
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Join resolution over the store's own tables.
struct TableLookup<'a>(&'a HashMap<String, Table>);

impl AssociationLookup for TableLookup<'_> {
    fn lookup(&self, target_type: &str, id: Id) -> Option<FieldMap> {
        self.0.get(target_type)?.get(&id).cloned()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn query(
        &self,
        entity_type: &str,
        predicate: &Predicate,
        sort: &SortOrder,
        offset: i64,
        limit: Option<i64>,
    ) -> DmResult<Vec<Row>> {
        let tables = self.tables.read();
        let lookup = TableLookup(&tables);
        let Some(table) = tables.get(entity_type) else {
            return Ok(vec![]);
        };

        // Table iteration is id-ascending; the sort below is stable, so
        // equal keys keep that order even without an explicit tie-break.
        let mut rows: Vec<Row> = table
            .iter()
            .filter(|(id, fields)| predicate.matches(**id, fields, &lookup))
            .map(|(id, fields)| Row::new(*id, fields.clone()))
            .collect();
        rows.sort_by(|a, b| sort.compare_rows(a.id, &a.fields, b.id, &b.fields));

        let offset = offset.max(0) as usize;
        let rows = rows.into_iter().skip(offset);
        Ok(match limit {
            Some(limit) => rows.take(limit.max(0) as usize).collect(),
            None => rows.collect(),
        })
    }

    async fn count(&self, entity_type: &str, predicate: &Predicate) -> DmResult<i64> {
        Ok(self.matching_ids(entity_type, predicate).len() as i64)
    }

    async fn insert(&self, entity_type: &str, id: Option<Id>, fields: FieldMap) -> DmResult<Id> {
        let id = id.unwrap_or_else(|| self.allocate_id());
        let mut tables = self.tables.write();
        let table = tables.entry(entity_type.to_string()).or_default();
        if table.contains_key(&id) {
            return Err(DmError::Store(format!(
                "duplicate id {id} on insert into '{entity_type}'"
            )));
        }
        table.insert(id, fields);
        debug!(entity_type, id, "inserted row");
        Ok(id)
    }

    async fn update(
        &self,
        entity_type: &str,
        id: Id,
        changes: FieldMap,
        expected_version: Option<i64>,
    ) -> DmResult<()> {
        let mut tables = self.tables.write();
        let row = tables
            .get_mut(entity_type)
            .and_then(|table| table.get_mut(&id))
            .ok_or_else(|| DmError::Store(format!("no row {id} in '{entity_type}'")))?;

        if let Some(expected) = expected_version {
            let actual = row.get(VERSION_FIELD).and_then(Value::as_int).unwrap_or(0);
            if actual != expected {
                return Err(DmError::OptimisticLockConflict {
                    entity_type: entity_type.to_string(),
                    id,
                    expected,
                    actual,
                });
            }
        }

        debug!(entity_type, id, changed = changes.len(), "updated row");
        row.extend(changes);
        Ok(())
    }

    async fn delete(&self, entity_type: &str, id: Id) -> DmResult<()> {
        let mut tables = self.tables.write();
        if let Some(table) = tables.get_mut(entity_type) {
            table.remove(&id);
        }
        Ok(())
    }

    async fn bulk_update(
        &self,
        entity_type: &str,
        predicate: &Predicate,
        updates: &[FieldUpdate],
    ) -> DmResult<u64> {
        let ids = self.matching_ids(entity_type, predicate);

        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(entity_type) else {
            return Ok(0);
        };
        let mut affected = 0u64;
        for id in ids {
            if let Some(fields) = table.get_mut(&id) {
                for update in updates {
                    update.apply(fields)?;
                }
                affected += 1;
            }
        }
        debug!(entity_type, affected, "bulk update applied");
        Ok(affected)
    }

    async fn begin_lock(
        &self,
        entity_type: &str,
        id: Id,
        timeout: Duration,
    ) -> DmResult<LockHandle> {
        let mutex = {
            let mut locks = self.row_locks.lock();
            locks
                .entry((entity_type.to_string(), id))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(LockHandle::new(guard)),
            Err(_) => Err(DmError::LockTimeout {
                entity_type: entity_type.to_string(),
                id,
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_query::SortOrder;

    fn member(username: &str, age: i64) -> FieldMap {
        FieldMap::from([
            ("username".to_string(), Value::Str(username.to_string())),
            ("age".to_string(), Value::Int(age)),
        ])
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for (name, age) in [
            ("member1", 10),
            ("member2", 19),
            ("member3", 20),
            ("member4", 21),
            ("member5", 40),
        ] {
            store.insert("member", None, member(name, age)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_query_filter_sort_window() {
        let store = seeded().await;
        let rows = store
            .query(
                "member",
                &Predicate::All,
                &SortOrder::by_desc("username").with_id_tiebreak(),
                0,
                Some(3),
            )
            .await
            .unwrap();
        let names: Vec<_> = rows
            .iter()
            .map(|r| r.get("username").as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["member5", "member4", "member3"]);
    }

    #[tokio::test]
    async fn test_count_ignores_window() {
        let store = seeded().await;
        let count = store
            .count("member", &Predicate::gt("age", 15i64))
            .await
            .unwrap();
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn test_query_offset_past_end() {
        let store = seeded().await;
        let rows = store
            .query("member", &Predicate::All, &SortOrder::unsorted(), 100, Some(3))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_insert_assigned_id_and_duplicate() {
        let store = MemoryStore::new();
        let id = store
            .insert("item", Some(42), FieldMap::new())
            .await
            .unwrap();
        assert_eq!(id, 42);
        let err = store
            .insert("item", Some(42), FieldMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DmError::Store(_)));
    }

    #[tokio::test]
    async fn test_update_with_version_check() {
        let store = MemoryStore::new();
        let mut fields = member("m1", 10);
        fields.insert(VERSION_FIELD.to_string(), Value::Int(1));
        let id = store.insert("member", None, fields).await.unwrap();

        let changes = FieldMap::from([
            ("age".to_string(), Value::Int(11)),
            (VERSION_FIELD.to_string(), Value::Int(2)),
        ]);
        store.update("member", id, changes, Some(1)).await.unwrap();

        let err = store
            .update("member", id, FieldMap::new(), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DmError::OptimisticLockConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_bulk_update_increment() {
        let store = seeded().await;
        let affected = store
            .bulk_update(
                "member",
                &Predicate::ge("age", 20i64),
                &[FieldUpdate::increment("age", 1)],
            )
            .await
            .unwrap();
        assert_eq!(affected, 3);

        let rows = store
            .query(
                "member",
                &Predicate::eq("username", "member5"),
                &SortOrder::unsorted(),
                0,
                None,
            )
            .await
            .unwrap();
        assert_eq!(rows[0].get("age"), &Value::Int(41));
    }

    #[tokio::test]
    async fn test_join_predicate_query() {
        let store = MemoryStore::new();
        let team_a = store
            .insert(
                "team",
                None,
                FieldMap::from([("name".to_string(), Value::Str("teamA".into()))]),
            )
            .await
            .unwrap();
        let mut m1 = member("m1", 0);
        m1.insert("team_id".to_string(), Value::Ref(team_a));
        store.insert("member", None, m1).await.unwrap();
        store.insert("member", None, member("m2", 0)).await.unwrap();

        let join = Predicate::Join {
            association: "team".to_string(),
            fk_column: "team_id".to_string(),
            target_type: "team".to_string(),
            predicate: Box::new(Predicate::eq("name", "teamA")),
        };
        let rows = store
            .query("member", &join, &SortOrder::unsorted(), 0, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("username").as_str(), Some("m1"));
    }

    #[tokio::test]
    async fn test_lock_timeout_and_release() {
        let store = MemoryStore::new();
        let id = store.insert("member", None, member("m1", 10)).await.unwrap();

        let held = store
            .begin_lock("member", id, Duration::from_millis(10))
            .await
            .unwrap();

        let err = store
            .begin_lock("member", id, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DmError::LockTimeout { .. }));

        drop(held);
        store
            .begin_lock("member", id, Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        let id = store.insert("member", None, member("m1", 10)).await.unwrap();
        store.delete("member", id).await.unwrap();
        store.delete("member", id).await.unwrap();
        assert_eq!(store.count("member", &Predicate::All).await.unwrap(), 0);
    }
}
