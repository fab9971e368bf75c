//! Match predicates
//!
//! A `Predicate` is the store-agnostic condition tree every read path hands
//! to the store adapter. Adapters that evaluate rows in process (the
//! in-memory reference store, tests) use `Predicate::matches`; a SQL or
//! document adapter would translate the tree instead.

use std::cmp::Ordering;

use dm_core::{Association, FieldMap, Id, Value};

/// Comparison operators on a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Substring match, string fields only.
    Contains,
    /// Prefix match, string fields only.
    StartsWith,
    /// Suffix match, string fields only.
    EndsWith,
}

/// A match condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every row.
    All,
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    IsNull {
        field: String,
    },
    /// Matches rows whose id is in the set. Used for batched association
    /// resolution.
    IdIn(Vec<Id>),
    /// Inner-join condition against a referenced record, one level only.
    Join {
        association: String,
        fk_column: String,
        target_type: String,
        predicate: Box<Predicate>,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

/// Resolution seam for join predicates: map (type, id) to the referenced
/// record's fields. In-memory adapters implement this over their tables.
pub trait AssociationLookup {
    fn lookup(&self, target_type: &str, id: Id) -> Option<FieldMap>;
}

impl Predicate {
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ne, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ge, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Le, value)
    }

    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(field, CompareOp::Contains, Value::Str(value.into()))
    }

    pub fn starts_with(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(field, CompareOp::StartsWith, Value::Str(value.into()))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Predicate::IsNull {
            field: field.into(),
        }
    }

    pub fn join(association: Association, predicate: Predicate) -> Self {
        Predicate::Join {
            association: association.field.to_string(),
            fk_column: association.fk_column.to_string(),
            target_type: association.target_type.to_string(),
            predicate: Box::new(predicate),
        }
    }

    /// AND-combine, flattening the trivial cases.
    pub fn and(mut predicates: Vec<Predicate>) -> Self {
        predicates.retain(|p| !matches!(p, Predicate::All));
        match predicates.len() {
            0 => Predicate::All,
            1 => predicates.pop().expect("length checked"),
            _ => Predicate::And(predicates),
        }
    }

    pub fn or(mut predicates: Vec<Predicate>) -> Self {
        match predicates.len() {
            0 => Predicate::All,
            1 => predicates.pop().expect("length checked"),
            _ => Predicate::Or(predicates),
        }
    }

    /// Whether any node requires resolving an association join.
    pub fn touches_associations(&self) -> bool {
        match self {
            Predicate::Join { .. } => true,
            Predicate::And(ps) | Predicate::Or(ps) => {
                ps.iter().any(Predicate::touches_associations)
            }
            _ => false,
        }
    }

    /// Evaluate against a row's fields. Comparisons between unordered
    /// value kinds never match.
    pub fn matches(&self, id: Id, fields: &FieldMap, lookup: &dyn AssociationLookup) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Compare { field, op, value } => {
                let actual = fields.get(field).unwrap_or(&Value::Null);
                compare_values(actual, *op, value)
            }
            Predicate::IsNull { field } => {
                fields.get(field).map_or(true, Value::is_null)
            }
            Predicate::IdIn(ids) => ids.contains(&id),
            Predicate::Join {
                fk_column,
                target_type,
                predicate,
                ..
            } => {
                // Inner-join semantics: no foreign id or no target row
                // means no match.
                let Some(fk) = fields.get(fk_column).and_then(Value::as_id) else {
                    return false;
                };
                match lookup.lookup(target_type, fk) {
                    Some(target_fields) => predicate.matches(fk, &target_fields, lookup),
                    None => false,
                }
            }
            Predicate::And(predicates) => {
                predicates.iter().all(|p| p.matches(id, fields, lookup))
            }
            Predicate::Or(predicates) => {
                predicates.iter().any(|p| p.matches(id, fields, lookup))
            }
        }
    }
}

fn compare_values(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Contains | CompareOp::StartsWith | CompareOp::EndsWith => {
            match (actual.as_str(), expected.as_str()) {
                (Some(a), Some(e)) => match op {
                    CompareOp::Contains => a.contains(e),
                    CompareOp::StartsWith => a.starts_with(e),
                    _ => a.ends_with(e),
                },
                _ => false,
            }
        }
        _ => {
            let Some(ordering) = actual.compare(expected) else {
                return false;
            };
            match op {
                CompareOp::Eq => ordering == Ordering::Equal,
                CompareOp::Ne => ordering != Ordering::Equal,
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Ge => ordering != Ordering::Less,
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                _ => unreachable!("string ops handled above"),
            }
        }
    }
}
