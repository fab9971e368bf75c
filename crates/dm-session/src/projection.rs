//! Projection engine
//!
//! Read models over stored rows: a `FlatProjection` is an eager map of
//! selected paths to values, fully detached from tracking; a `LazyView`
//! keeps the owner row's fields and defers association paths to shared
//! single-flight slots, so two views of the same target resolve with one
//! query between them. Paths nest at most one association level.

use std::collections::BTreeMap;
use std::sync::Arc;

use dm_core::{Association, DmError, DmResult, Entity, FieldMap, Id, Value};
use dm_store::{Row, StoreAdapter};

use crate::fetch::{AssocCache, AssocState};

/// A projection path: a plain field, or `association.field` one level deep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub root: String,
    pub nested: Option<String>,
}

impl FieldPath {
    pub fn parse(path: &str) -> DmResult<Self> {
        let mut parts = path.split('.');
        let root = parts.next().unwrap_or_default();
        let nested = parts.next();
        if root.is_empty() || nested.is_some_and(str::is_empty) || parts.next().is_some() {
            return Err(DmError::UnsupportedMatchShape {
                path: path.to_string(),
                message: "projection paths are a field name or association.field, \
                          one level deep"
                    .to_string(),
            });
        }
        Ok(Self {
            root: root.to_string(),
            nested: nested.map(str::to_string),
        })
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.nested {
            Some(nested) => write!(f, "{}.{}", self.root, nested),
            None => write!(f, "{}", self.root),
        }
    }
}

#[derive(Debug)]
enum ResolvedPath {
    OwnField {
        path: String,
    },
    Nested {
        path: String,
        association: Association,
        field: String,
    },
}

/// A set of projection paths validated against one entity type.
#[derive(Debug)]
pub struct ProjectionShape {
    entity_type: &'static str,
    paths: Vec<ResolvedPath>,
}

impl ProjectionShape {
    /// Validate paths against `T`'s declared fields and associations.
    /// Unknown roots and shapes deeper than one association level are
    /// rejected here, before any store call.
    pub fn of<T: Entity>(paths: &[&str]) -> DmResult<Self> {
        let mut resolved = Vec::with_capacity(paths.len());
        for raw in paths {
            let parsed = FieldPath::parse(raw)?;
            match parsed.nested {
                None => {
                    if parsed.root != "id" && !T::field_names().contains(&parsed.root.as_str()) {
                        if T::association(&parsed.root).is_some() {
                            return Err(DmError::UnsupportedMatchShape {
                                path: raw.to_string(),
                                message: "an association path must select a field on the \
                                          target"
                                    .to_string(),
                            });
                        }
                        return Err(DmError::UnknownField {
                            entity_type: T::TYPE_NAME.to_string(),
                            field: parsed.root,
                        });
                    }
                    resolved.push(ResolvedPath::OwnField {
                        path: raw.to_string(),
                    });
                }
                Some(nested) => {
                    let Some(association) = T::association(&parsed.root) else {
                        if T::field_names().contains(&parsed.root.as_str()) {
                            return Err(DmError::UnsupportedMatchShape {
                                path: raw.to_string(),
                                message: format!("'{}' is a plain field, not an association", parsed.root),
                            });
                        }
                        return Err(DmError::UnknownField {
                            entity_type: T::TYPE_NAME.to_string(),
                            field: parsed.root,
                        });
                    };
                    resolved.push(ResolvedPath::Nested {
                        path: raw.to_string(),
                        association,
                        field: nested,
                    });
                }
            }
        }
        Ok(Self {
            entity_type: T::TYPE_NAME,
            paths: resolved,
        })
    }

    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }
}

/// An eager, detached read model: selected paths resolved to plain values.
/// Changes to a projection never reach the store.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatProjection {
    values: BTreeMap<String, Value>,
}

impl FlatProjection {
    /// Value at a selected path. Unselected paths and dangling
    /// associations read as `Value::Null`.
    pub fn get(&self, path: &str) -> &Value {
        self.values.get(path).unwrap_or(&Value::Null)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// Materialize one row through a shape, resolving association paths
/// through the shared slot cache.
pub(crate) async fn project_row(
    store: &dyn StoreAdapter,
    cache: &AssocCache,
    shape: &ProjectionShape,
    row: &Row,
) -> DmResult<FlatProjection> {
    let mut values = BTreeMap::new();
    for path in &shape.paths {
        match path {
            ResolvedPath::OwnField { path } => {
                let value = if path == "id" {
                    Value::Ref(row.id)
                } else {
                    row.get(path).clone()
                };
                values.insert(path.clone(), value);
            }
            ResolvedPath::Nested {
                path,
                association,
                field,
            } => {
                let value = match row.get(association.fk_column).as_id() {
                    Some(fk) => {
                        let slot = cache.slot(association.target_type, fk);
                        slot.resolve(store, association.target_type, fk)
                            .await?
                            .and_then(|fields| fields.get(field).cloned())
                            .unwrap_or(Value::Null)
                    }
                    None => Value::Null,
                };
                values.insert(path.clone(), value);
            }
        }
    }
    Ok(FlatProjection { values })
}

/// A read model that keeps the owner row eager and association paths
/// lazy. Clones share association slots with every other view and lazy
/// reference in the same unit of work.
pub struct LazyView {
    entity_type: &'static str,
    id: Id,
    fields: FieldMap,
    associations: &'static [Association],
    store: Arc<dyn StoreAdapter>,
    cache: Arc<AssocCache>,
}

impl std::fmt::Debug for LazyView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyView")
            .field("id", &self.id)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

impl LazyView {
    pub(crate) fn new(
        entity_type: &'static str,
        row: Row,
        associations: &'static [Association],
        store: Arc<dyn StoreAdapter>,
        cache: Arc<AssocCache>,
    ) -> Self {
        Self {
            entity_type,
            id: row.id,
            fields: row.fields,
            associations,
            store,
            cache,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Owner-row field, available without any store access.
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&Value::Null)
    }

    fn association(&self, field: &str) -> DmResult<&Association> {
        self.associations
            .iter()
            .find(|a| a.field == field)
            .ok_or_else(|| DmError::UnknownField {
                entity_type: self.entity_type.to_string(),
                field: field.to_string(),
            })
    }

    /// Load state of one association path, without triggering a load.
    pub fn association_state(&self, association_field: &str) -> DmResult<AssocState> {
        let association = self.association(association_field)?;
        Ok(match self.fields.get(association.fk_column).and_then(Value::as_id) {
            Some(fk) => self.cache.slot(association.target_type, fk).state(),
            None => AssocState::Loaded,
        })
    }

    /// Resolve `association.field`, querying the target at most once per
    /// unit of work across all views and references sharing the cache.
    /// Null foreign keys and dangling targets read as `Value::Null`.
    pub async fn nested(&self, association_field: &str, field: &str) -> DmResult<Value> {
        let association = self.association(association_field)?;
        let Some(fk) = self.fields.get(association.fk_column).and_then(Value::as_id) else {
            return Ok(Value::Null);
        };
        let slot = self.cache.slot(association.target_type, fk);
        Ok(slot
            .resolve(self.store.as_ref(), association.target_type, fk)
            .await?
            .and_then(|fields| fields.get(field).cloned())
            .unwrap_or(Value::Null))
    }
}
