//! Sort orders
//!
//! Sort criteria are applied by the store adapter; the pagination engine
//! appends an id-ascending tie-break so that paging through a stable
//! dataset never skips or repeats rows.

use std::cmp::Ordering;

use dm_core::{FieldMap, Id, Value};

/// Sort attribute carried by the implicit tie-break.
pub const ID_ATTRIBUTE: &str = "id";

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "asc" | "ascending" => Some(Self::Asc),
            "desc" | "descending" => Some(Self::Desc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    pub fn reverse(&self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }

    fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            Self::Asc => ordering,
            Self::Desc => ordering.reverse(),
        }
    }
}

/// A single sort criterion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortCriterion {
    pub attribute: String,
    pub direction: SortDirection,
}

impl SortCriterion {
    pub fn new(attribute: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            attribute: attribute.into(),
            direction,
        }
    }

    pub fn asc(attribute: impl Into<String>) -> Self {
        Self::new(attribute, SortDirection::Asc)
    }

    pub fn desc(attribute: impl Into<String>) -> Self {
        Self::new(attribute, SortDirection::Desc)
    }
}

/// Collection of sort criteria
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortOrder {
    criteria: Vec<SortCriterion>,
}

impl SortOrder {
    pub fn unsorted() -> Self {
        Self { criteria: vec![] }
    }

    pub fn by(attribute: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            criteria: vec![SortCriterion::new(attribute, direction)],
        }
    }

    pub fn by_asc(attribute: impl Into<String>) -> Self {
        Self::by(attribute, SortDirection::Asc)
    }

    pub fn by_desc(attribute: impl Into<String>) -> Self {
        Self::by(attribute, SortDirection::Desc)
    }

    pub fn then(mut self, criterion: SortCriterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn then_asc(self, attribute: impl Into<String>) -> Self {
        self.then(SortCriterion::asc(attribute))
    }

    pub fn then_desc(self, attribute: impl Into<String>) -> Self {
        self.then(SortCriterion::desc(attribute))
    }

    pub fn criteria(&self) -> &[SortCriterion] {
        &self.criteria
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn primary(&self) -> Option<&SortCriterion> {
        self.criteria.first()
    }

    pub fn sorts_by(&self, attribute: &str) -> bool {
        self.criteria.iter().any(|c| c.attribute == attribute)
    }

    /// A copy with an id-ascending criterion appended unless the order
    /// already sorts by id. Ties on every earlier key break by id, so the
    /// total order is deterministic.
    pub fn with_id_tiebreak(&self) -> Self {
        if self.sorts_by(ID_ATTRIBUTE) {
            self.clone()
        } else {
            self.clone().then_asc(ID_ATTRIBUTE)
        }
    }

    /// Total ordering over rows under this sort order. Value kinds that
    /// do not compare are treated as ties and fall through to later
    /// criteria.
    pub fn compare_rows(
        &self,
        id_a: Id,
        fields_a: &FieldMap,
        id_b: Id,
        fields_b: &FieldMap,
    ) -> Ordering {
        for criterion in &self.criteria {
            let ordering = if criterion.attribute == ID_ATTRIBUTE {
                id_a.cmp(&id_b)
            } else {
                let a = fields_a.get(&criterion.attribute).unwrap_or(&Value::Null);
                let b = fields_b.get(&criterion.attribute).unwrap_or(&Value::Null);
                a.compare(b).unwrap_or(Ordering::Equal)
            };
            let ordering = criterion.direction.apply(ordering);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}
