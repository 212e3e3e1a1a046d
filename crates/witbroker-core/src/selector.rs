//! Narrowing a handle's items to the subset a bulk operation acts on.
//!
//! The resolver only ever returns identifiers already stored in the record.
//! Callers pick items by position or by stored attributes, never by naming
//! identifiers directly, so a misremembered id cannot slip into a bulk edit.
//!
//! # Wire shapes
//!
//! ```text
//! "all"
//! [0, 2, 5]
//! { "states": ["Active"], "titleContains": ["login"], "tags": ["ui"],
//!   "daysInactiveMin": 14, "daysInactiveMax": 90 }
//! ```

use std::collections::BTreeSet;
use std::fmt;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::ErrorCode;
use crate::model::{ItemMetadata, QueryRecord, WorkItemId};

/// Which items of a handle an operation targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSelector", into = "RawSelector")]
pub enum Selector {
    /// Every item, in stored order.
    #[default]
    All,
    /// Zero-based positions into the stored order.
    ByIndex(Vec<usize>),
    /// Attribute predicate over stored metadata.
    ByCriteria(Criteria),
}

impl Selector {
    /// Short rendering for logs and previews.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::ByIndex(indices) => format!("indices {indices:?}"),
            Self::ByCriteria(criteria) => format!("criteria {criteria}"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawSelector {
    Keyword(String),
    Indices(Vec<usize>),
    Criteria(Criteria),
}

impl TryFrom<RawSelector> for Selector {
    type Error = String;

    fn try_from(raw: RawSelector) -> Result<Self, Self::Error> {
        match raw {
            RawSelector::Keyword(word) if word.trim().eq_ignore_ascii_case("all") => Ok(Self::All),
            RawSelector::Keyword(word) => Err(format!(
                "unknown selector keyword '{word}': expected \"all\", an index array, or a criteria object"
            )),
            RawSelector::Indices(indices) => Ok(Self::ByIndex(indices)),
            RawSelector::Criteria(criteria) => Ok(Self::ByCriteria(criteria)),
        }
    }
}

impl From<Selector> for RawSelector {
    fn from(selector: Selector) -> Self {
        match selector {
            Selector::All => Self::Keyword("all".to_string()),
            Selector::ByIndex(indices) => Self::Indices(indices),
            Selector::ByCriteria(criteria) => Self::Criteria(criteria),
        }
    }
}

/// Attribute predicate. Present fields combine with AND; absent or empty
/// fields impose no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Criteria {
    /// Item state must be one of these (case-insensitive).
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub states: Vec<String>,
    /// Title must contain at least one of these (case-insensitive).
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub title_contains: Vec<String>,
    /// Item must carry at least one of these tags (case-insensitive).
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub tags: Vec<String>,
    /// Inclusive lower bound on days since last change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_inactive_min: Option<u32>,
    /// Inclusive upper bound on days since last change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_inactive_max: Option<u32>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

impl Criteria {
    /// True when no field constrains the selection.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
            && self.title_contains.is_empty()
            && self.tags.is_empty()
            && self.days_inactive_min.is_none()
            && self.days_inactive_max.is_none()
    }

    /// Evaluate against one item's metadata. Items without metadata only
    /// match an unconstrained criteria object.
    #[must_use]
    pub fn matches(&self, metadata: Option<&ItemMetadata>) -> bool {
        let Some(meta) = metadata else {
            return self.is_empty();
        };

        if !self.states.is_empty()
            && !self
                .states
                .iter()
                .any(|state| state.eq_ignore_ascii_case(&meta.state))
        {
            return false;
        }

        if !self.title_contains.is_empty() {
            let title = meta.title.to_lowercase();
            if !self
                .title_contains
                .iter()
                .any(|needle| title.contains(&needle.to_lowercase()))
            {
                return false;
            }
        }

        if !self.tags.is_empty()
            && !self
                .tags
                .iter()
                .any(|wanted| meta.tags.iter().any(|tag| tag.eq_ignore_ascii_case(wanted)))
        {
            return false;
        }

        if self.days_inactive_min.is_some() || self.days_inactive_max.is_some() {
            let Some(days) = meta.days_inactive else {
                return false;
            };
            if self.days_inactive_min.is_some_and(|min| days < min) {
                return false;
            }
            if self.days_inactive_max.is_some_and(|max| days > max) {
                return false;
            }
        }

        true
    }
}

impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.states.is_empty() {
            parts.push(format!("states={}", self.states.join("|")));
        }
        if !self.title_contains.is_empty() {
            parts.push(format!("title~{}", self.title_contains.join("|")));
        }
        if !self.tags.is_empty() {
            parts.push(format!("tags={}", self.tags.join("|")));
        }
        match (self.days_inactive_min, self.days_inactive_max) {
            (Some(min), Some(max)) => parts.push(format!("inactive={min}..={max}d")),
            (Some(min), None) => parts.push(format!("inactive>={min}d")),
            (None, Some(max)) => parts.push(format!("inactive<={max}d")),
            (None, None) => {}
        }
        if parts.is_empty() {
            f.write_str("{}")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}

/// An index that did not map to a stored item. Reported, never fatal.
///
/// Serialized with its [`ErrorCode::SelectorIndexOutOfRange`] code so callers
/// can treat it like any other coded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOutOfRange {
    pub index: usize,
    pub len: usize,
}

impl IndexOutOfRange {
    #[must_use]
    pub const fn code() -> ErrorCode {
        ErrorCode::SelectorIndexOutOfRange
    }
}

impl Serialize for IndexOutOfRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_struct("IndexOutOfRange", 4)?;
        out.serialize_field("code", Self::code().code())?;
        out.serialize_field("index", &self.index)?;
        out.serialize_field("len", &self.len)?;
        out.serialize_field("error", &self.to_string())?;
        out.end()
    }
}

impl fmt::Display for IndexOutOfRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "index {} is out of range for a handle with {} items",
            self.index, self.len
        )
    }
}

/// Resolved subset of a handle's items, in stored order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub ids: Vec<WorkItemId>,
    /// Number of stored items the selector was evaluated against.
    pub considered: usize,
    /// Number of items selected.
    pub matched: usize,
    pub index_errors: Vec<IndexOutOfRange>,
}

impl Selection {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Resolve `selector` against the record's stored items.
#[must_use]
pub fn resolve(record: &QueryRecord, selector: &Selector) -> Selection {
    let items = &record.item_ids;
    let (ids, index_errors) = match selector {
        Selector::All => (items.clone(), Vec::new()),
        Selector::ByIndex(indices) => {
            let mut valid = BTreeSet::new();
            let mut errors: Vec<IndexOutOfRange> = Vec::new();
            for &index in indices {
                if index < items.len() {
                    valid.insert(index);
                } else if !errors.iter().any(|e| e.index == index) {
                    errors.push(IndexOutOfRange {
                        index,
                        len: items.len(),
                    });
                }
            }
            (valid.into_iter().map(|i| items[i]).collect(), errors)
        }
        Selector::ByCriteria(criteria) => (
            items
                .iter()
                .copied()
                .filter(|id| criteria.matches(record.metadata(*id)))
                .collect(),
            Vec::new(),
        ),
    };

    tracing::debug!(
        handle = %record.handle,
        selector = %selector.describe(),
        considered = items.len(),
        matched = ids.len(),
        index_errors = index_errors.len(),
        "selector resolved"
    );

    Selection {
        matched: ids.len(),
        considered: items.len(),
        ids,
        index_errors,
    }
}
