//! Query by example
//!
//! Turns a probe object plus matching rules into a predicate tree.
//! Association probes recurse exactly one level, producing an inner-join
//! condition; anything deeper fails fast with an unsupported-shape error
//! instead of silently building a wrong predicate.

use std::collections::{BTreeMap, BTreeSet};

use dm_core::{Association, DmError, DmResult, Entity, Value};

use crate::predicate::Predicate;

/// How string probe fields are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringMatchMode {
    #[default]
    Exact,
    Contains,
    StartsWith,
}

/// How null probe fields are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullHandling {
    /// Null probe fields contribute no condition.
    #[default]
    Ignore,
    /// Null probe fields require the stored field to be null.
    IncludeNull,
}

/// How per-field conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combinator {
    #[default]
    MatchAll,
    MatchAny,
}

/// Matching rules applied to a probe.
#[derive(Debug, Clone, Default)]
pub struct ExampleMatcher {
    ignored_paths: BTreeSet<String>,
    string_mode: StringMatchMode,
    null_handling: NullHandling,
    combinator: Combinator,
}

impl ExampleMatcher {
    /// All conditions must match (the default).
    pub fn matching() -> Self {
        Self::default()
    }

    /// Any condition may match.
    pub fn matching_any() -> Self {
        Self {
            combinator: Combinator::MatchAny,
            ..Self::default()
        }
    }

    /// Exclude probe fields by path ("age", "team.name").
    pub fn with_ignore_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_string_mode(mut self, mode: StringMatchMode) -> Self {
        self.string_mode = mode;
        self
    }

    pub fn with_include_null(mut self) -> Self {
        self.null_handling = NullHandling::IncludeNull;
        self
    }

    fn is_ignored(&self, path: &str) -> bool {
        self.ignored_paths.contains(path)
    }
}

/// A probe field: either a scalar or a one-level nested association probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeValue {
    Scalar(Value),
    Association(BTreeMap<String, ProbeValue>),
}

/// An example instance used to derive a dynamic match predicate.
#[derive(Debug, Clone)]
pub struct Example {
    entity_type: &'static str,
    associations: &'static [Association],
    fields: BTreeMap<String, ProbeValue>,
    matcher: ExampleMatcher,
}

impl Example {
    /// Capture the probe's declared fields. Association references are
    /// added separately through `probe_association`.
    pub fn of<T: Entity>(probe: &T) -> Self {
        let fields = T::field_names()
            .iter()
            .map(|f| (f.to_string(), ProbeValue::Scalar(probe.get(f))))
            .collect();
        Self {
            entity_type: T::TYPE_NAME,
            associations: T::associations(),
            fields,
            matcher: ExampleMatcher::default(),
        }
    }

    pub fn with_matcher(mut self, matcher: ExampleMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Type name of the probed entity.
    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    /// Attach a one-level association probe under the owner's declared
    /// association field.
    pub fn probe_association<A: Entity>(mut self, field: &str, probe: &A) -> DmResult<Self> {
        let Some(association) = self.associations.iter().find(|a| a.field == field) else {
            return Err(DmError::UnsupportedMatchShape {
                path: format!("{}.{}", self.entity_type, field),
                message: "no such association declared on the probe type".to_string(),
            });
        };
        if association.target_type != A::TYPE_NAME {
            return Err(DmError::UnsupportedMatchShape {
                path: format!("{}.{}", self.entity_type, field),
                message: format!(
                    "association targets '{}', probe is '{}'",
                    association.target_type,
                    A::TYPE_NAME
                ),
            });
        }
        // The nested probe's own fk columns are captured as scalars; the
        // recursion stops at this level.
        let nested = A::field_names()
            .iter()
            .map(|f| (f.to_string(), ProbeValue::Scalar(probe.get(f))))
            .collect();
        // The association's fk column no longer matches as a scalar once a
        // nested probe constrains the join.
        self.fields.remove(association.fk_column);
        self.fields
            .insert(field.to_string(), ProbeValue::Association(nested));
        Ok(self)
    }

    /// Build the predicate tree. Field order is the probe map's sorted
    /// name order; correctness does not depend on it.
    pub fn build(&self) -> DmResult<Predicate> {
        let mut conditions = Vec::new();
        for (name, probe_value) in &self.fields {
            if self.matcher.is_ignored(name) {
                continue;
            }
            match probe_value {
                ProbeValue::Scalar(value) => {
                    if let Some(condition) = self.scalar_condition(name, value) {
                        conditions.push(condition);
                    }
                }
                ProbeValue::Association(nested) => {
                    let association = self
                        .associations
                        .iter()
                        .find(|a| a.field == name.as_str())
                        .copied()
                        .ok_or_else(|| DmError::UnsupportedMatchShape {
                            path: format!("{}.{}", self.entity_type, name),
                            message: "probe value is not a declared association".to_string(),
                        })?;
                    let inner = self.nested_conditions(name, nested)?;
                    if !matches!(inner, Predicate::All) {
                        conditions.push(Predicate::join(association, inner));
                    }
                }
            }
        }
        Ok(self.combine(conditions))
    }

    fn nested_conditions(
        &self,
        association: &str,
        nested: &BTreeMap<String, ProbeValue>,
    ) -> DmResult<Predicate> {
        let mut conditions = Vec::new();
        for (name, probe_value) in nested {
            let path = format!("{}.{}", association, name);
            if self.matcher.is_ignored(&path) {
                continue;
            }
            match probe_value {
                ProbeValue::Scalar(value) => {
                    if let Some(condition) = self.scalar_condition(name, value) {
                        conditions.push(condition);
                    }
                }
                ProbeValue::Association(_) => {
                    return Err(DmError::UnsupportedMatchShape {
                        path,
                        message: "nesting beyond one association level".to_string(),
                    });
                }
            }
        }
        Ok(self.combine(conditions))
    }

    fn scalar_condition(&self, field: &str, value: &Value) -> Option<Predicate> {
        match value {
            Value::Null => match self.matcher.null_handling {
                NullHandling::Ignore => None,
                NullHandling::IncludeNull => Some(Predicate::is_null(field)),
            },
            Value::Str(s) => Some(match self.matcher.string_mode {
                StringMatchMode::Exact => Predicate::eq(field, s.clone()),
                StringMatchMode::Contains => Predicate::contains(field, s.clone()),
                StringMatchMode::StartsWith => Predicate::starts_with(field, s.clone()),
            }),
            other => Some(Predicate::eq(field, other.clone())),
        }
    }

    fn combine(&self, conditions: Vec<Predicate>) -> Predicate {
        match self.matcher.combinator {
            Combinator::MatchAll => Predicate::and(conditions),
            Combinator::MatchAny => Predicate::or(conditions),
        }
    }
}
