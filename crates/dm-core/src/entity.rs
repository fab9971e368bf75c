//! Core entity traits
//!
//! An `Entity` is an addressable record with a stable identifier, named
//! fields exposed as dynamic values, and zero or more one-level association
//! references to other entities. Identity equality is (type, id), never
//! field-value equality; the tracking context enforces that.

use chrono::{DateTime, Utc};

use crate::value::{FieldMap, Value};

/// Primary key type for all entities.
pub type Id = i64;

/// Reserved column name holding the optimistic-lock version.
pub const VERSION_FIELD: &str = "version";

/// Reserved audit column names.
pub mod audit_fields {
    pub const CREATED_AT: &str = "created_at";
    pub const CREATED_BY: &str = "created_by";
    pub const LAST_MODIFIED_AT: &str = "last_modified_at";
    pub const LAST_MODIFIED_BY: &str = "last_modified_by";

    /// Columns that are written once at insert and never updated.
    pub const IMMUTABLE: [&str; 2] = [CREATED_AT, CREATED_BY];
}

/// Static description of a one-level association reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    /// Logical field name used in probes and projections (e.g. "team").
    pub field: &'static str,
    /// Column on the owning record holding the foreign id (e.g. "team_id").
    pub fk_column: &'static str,
    /// `Entity::TYPE_NAME` of the referenced record.
    pub target_type: &'static str,
}

/// Lifecycle audit metadata for entities opting into auditing.
///
/// `created_*` is set exactly once, at first successful insert.
/// `last_modified_*` is updated on every successful update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditMetadata {
    pub created_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub last_modified_at: Option<DateTime<Utc>>,
    pub last_modified_by: Option<String>,
}

impl AuditMetadata {
    /// Serialize into row columns. Timestamps are RFC 3339 strings.
    pub fn to_fields(&self) -> FieldMap {
        let ts = |t: &Option<DateTime<Utc>>| {
            t.map(|t| Value::Str(t.to_rfc3339())).unwrap_or(Value::Null)
        };
        let by = |p: &Option<String>| {
            p.clone().map(Value::Str).unwrap_or(Value::Null)
        };
        FieldMap::from([
            (audit_fields::CREATED_AT.to_string(), ts(&self.created_at)),
            (audit_fields::CREATED_BY.to_string(), by(&self.created_by)),
            (
                audit_fields::LAST_MODIFIED_AT.to_string(),
                ts(&self.last_modified_at),
            ),
            (
                audit_fields::LAST_MODIFIED_BY.to_string(),
                by(&self.last_modified_by),
            ),
        ])
    }

    /// Restore from row columns produced by `to_fields`.
    pub fn apply_fields(&mut self, fields: &FieldMap) {
        let ts = |v: Option<&Value>| {
            v.and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        let by = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);

        if let Some(t) = ts(fields.get(audit_fields::CREATED_AT)) {
            self.created_at = Some(t);
        }
        if let Some(p) = by(fields.get(audit_fields::CREATED_BY)) {
            self.created_by = Some(p);
        }
        if let Some(t) = ts(fields.get(audit_fields::LAST_MODIFIED_AT)) {
            self.last_modified_at = Some(t);
        }
        if let Some(p) = by(fields.get(audit_fields::LAST_MODIFIED_BY)) {
            self.last_modified_by = Some(p);
        }
    }
}

/// A record type the mapping layer can manage.
///
/// `field_names` must list only plain data columns; audit columns and the
/// version column are contributed by the capability accessors and merged
/// into snapshots by the provided methods.
pub trait Entity: Clone + Default + Send + Sync + 'static {
    /// Logical type name, also the store table name.
    const TYPE_NAME: &'static str;

    fn id(&self) -> Option<Id>;
    fn set_id(&mut self, id: Id);

    /// Whether this record needs an insert rather than an update.
    ///
    /// The default treats an absent surrogate id as the new-marker.
    /// Entities with explicitly-assigned ids must override this with an
    /// explicit marker (typically: no creation timestamp yet), because the
    /// id itself cannot signal novelty.
    fn is_new(&self) -> bool {
        self.id().is_none()
    }

    /// Declared data columns, excluding id, audit, and version columns.
    fn field_names() -> &'static [&'static str];

    /// Read a declared field. Unknown names return `Value::Null`.
    fn get(&self, field: &str) -> Value;

    /// Write a declared field. Unknown names are ignored.
    fn set(&mut self, field: &str, value: Value);

    /// One-level association references declared by this type.
    fn associations() -> &'static [Association] {
        &[]
    }

    /// Audit capability. Entities opting into auditing return their
    /// metadata here; everything else stays `None` and the audit
    /// interceptor is a no-op for them.
    fn audit(&self) -> Option<&AuditMetadata> {
        None
    }

    fn audit_mut(&mut self) -> Option<&mut AuditMetadata> {
        None
    }

    /// Optimistic-lock version. Entities opting in return `Some`.
    fn version(&self) -> Option<i64> {
        None
    }

    fn set_version(&mut self, _version: i64) {}

    /// Full field snapshot: data columns plus audit and version columns.
    /// Used for dirty checking, inserts, and row materialization.
    fn snapshot(&self) -> FieldMap {
        let mut fields: FieldMap = Self::field_names()
            .iter()
            .map(|f| (f.to_string(), self.get(f)))
            .collect();
        if let Some(audit) = self.audit() {
            fields.extend(audit.to_fields());
        }
        if let Some(version) = self.version() {
            fields.insert(VERSION_FIELD.to_string(), Value::Int(version));
        }
        fields
    }

    /// Rebuild an instance from a stored row.
    fn hydrate(id: Id, fields: &FieldMap) -> Self {
        let mut entity = Self::default();
        entity.set_id(id);
        for field in Self::field_names() {
            if let Some(value) = fields.get(*field) {
                entity.set(field, value.clone());
            }
        }
        if let Some(audit) = entity.audit_mut() {
            audit.apply_fields(fields);
        }
        if let Some(Value::Int(version)) = fields.get(VERSION_FIELD) {
            entity.set_version(*version);
        }
        entity
    }

    /// Look up association metadata by logical field name.
    fn association(field: &str) -> Option<Association> {
        Self::associations().iter().copied().find(|a| a.field == field)
    }
}
