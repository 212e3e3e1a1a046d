//! Records held behind a query handle.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Numeric work item identifier as issued by the remote tracker.
pub type WorkItemId = u64;

/// The per-item attributes the selector resolver and previews need.
///
/// Richer work item data stays with the query executor; a handle only keeps
/// what is required to narrow a selection without another round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    pub state: String,
    pub title: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_inactive: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

impl ItemMetadata {
    /// Minimal metadata with just a state and title.
    pub fn new(state: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            title: title.into(),
            tags: BTreeSet::new(),
            days_inactive: None,
            assigned_to: None,
        }
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_days_inactive(mut self, days: u32) -> Self {
        self.days_inactive = Some(days);
        self
    }

    #[must_use]
    pub fn with_assignee(mut self, user: impl Into<String>) -> Self {
        self.assigned_to = Some(user.into());
        self
    }
}

/// A stored query result, addressed by its opaque handle.
///
/// Everything except `operation_log` is fixed at creation. Indices used by
/// index selectors always refer to the order of `item_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub handle: String,
    pub item_ids: Vec<WorkItemId>,
    pub item_metadata: BTreeMap<WorkItemId, ItemMetadata>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source_description: String,
    pub operation_log: Vec<OperationRecord>,
}

impl QueryRecord {
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.item_ids.len()
    }

    /// A record is usable only while `now < expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    #[must_use]
    pub fn metadata(&self, id: WorkItemId) -> Option<&ItemMetadata> {
        self.item_metadata.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: WorkItemId) -> bool {
        self.item_metadata.contains_key(&id) || self.item_ids.contains(&id)
    }
}

/// Kind of bulk mutation recorded in a handle's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Comment,
    FieldUpdate,
    Assign,
    StateTransition,
    IterationMove,
    Link,
    Custom(String),
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Comment => f.write_str("comment"),
            Self::FieldUpdate => f.write_str("field-update"),
            Self::Assign => f.write_str("assign"),
            Self::StateTransition => f.write_str("state-transition"),
            Self::IterationMove => f.write_str("iteration-move"),
            Self::Link => f.write_str("link"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Snapshot of what a mutation touched on one work item, captured before the
/// write so the ledger can reverse it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BeforeState {
    /// Prior values of the written fields. `None` means the field was unset.
    Fields {
        values: BTreeMap<String, Option<String>>,
    },
    /// A comment was added; it cannot be removed remotely.
    Commented { text: String },
    /// A link was added and can be removed again.
    Linked {
        target: WorkItemId,
        link_type: String,
    },
    /// The mutation did not record anything that allows reversal.
    Unrecorded,
}

impl BeforeState {
    /// Single-field convenience constructor.
    pub fn field(name: impl Into<String>, prior: Option<String>) -> Self {
        let mut values = BTreeMap::new();
        values.insert(name.into(), prior);
        Self::Fields { values }
    }

    #[must_use]
    pub const fn is_reversible(&self) -> bool {
        !matches!(self, Self::Unrecorded)
    }
}

/// One live bulk mutation applied through a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    /// Assigned by the store on append; unique and increasing per handle.
    pub operation_id: u64,
    pub operation_type: OperationType,
    pub affected_ids: Vec<WorkItemId>,
    pub before_state: BTreeMap<WorkItemId, BeforeState>,
    pub applied_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl OperationRecord {
    #[must_use]
    pub const fn new(
        operation_type: OperationType,
        affected_ids: Vec<WorkItemId>,
        before_state: BTreeMap<WorkItemId, BeforeState>,
        applied_at: DateTime<Utc>,
    ) -> Self {
        Self {
            operation_id: 0,
            operation_type,
            affected_ids,
            before_state,
            applied_at,
            description: String::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// True when every affected item carries reversal data.
    #[must_use]
    pub fn is_reversible(&self) -> bool {
        self.affected_ids.iter().all(|id| {
            self.before_state
                .get(id)
                .is_some_and(BeforeState::is_reversible)
        })
    }
}

/// Operator-facing overview of one handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleSummary {
    pub handle: String,
    pub item_count: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
    pub operation_count: usize,
    pub source_description: String,
}

impl HandleSummary {
    /// Time left before expiry, clamped at zero.
    #[must_use]
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

/// Offset/limit pagination for handle listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub const DEFAULT_LIMIT: usize = 50;

    #[must_use]
    pub const fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, Self::DEFAULT_LIMIT)
    }
}

/// One page of handle summaries, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlePage {
    pub summaries: Vec<HandleSummary>,
    pub total: usize,
    pub has_more: bool,
}
