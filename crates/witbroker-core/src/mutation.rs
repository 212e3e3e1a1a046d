//! Mutation kinds and the remote work item capability they run against.
//!
//! Each [`Mutation`] captures the before-state of exactly the fields it
//! touches, then writes. The ledger later feeds that snapshot back through
//! [`reverse`] to undo it:
//!
//! | Mutation | Before-state | Reversal |
//! |---|---|---|
//! | `comment` | comment text | retraction comment (grow-only) |
//! | `update_field` | prior field value | restore field |
//! | `assign` | prior assignee | restore assignee |
//! | `transition_state` | prior state (and reason) | restore state |
//! | `move_iteration` | prior iteration path | restore path |
//! | `link` | link target and type | remove link |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::MutationError;
use crate::model::{BeforeState, ItemMetadata, OperationType, WorkItemId};

/// Well-known field reference names.
pub mod fields {
    pub const TITLE: &str = "System.Title";
    pub const TAGS: &str = "System.Tags";
    pub const STATE: &str = "System.State";
    pub const REASON: &str = "System.Reason";
    pub const ASSIGNED_TO: &str = "System.AssignedTo";
    pub const ITERATION_PATH: &str = "System.IterationPath";
}

/// The single capability bulk operations need from the remote tracker.
///
/// Implementations wrap whatever transport reaches the tracker; the core
/// never builds requests itself.
pub trait WorkItemBackend {
    /// Current value of a field, `None` if unset.
    ///
    /// # Errors
    ///
    /// Any transport or lookup failure.
    fn field(&self, id: WorkItemId, name: &str) -> Result<Option<String>, MutationError>;

    /// Write (or clear, with `None`) a field.
    ///
    /// # Errors
    ///
    /// Any transport or validation failure.
    fn set_field(
        &self,
        id: WorkItemId,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), MutationError>;

    /// Append a discussion comment.
    ///
    /// # Errors
    ///
    /// Any transport failure.
    fn add_comment(&self, id: WorkItemId, text: &str) -> Result<(), MutationError>;

    /// Add a relation from `id` to `target`.
    ///
    /// # Errors
    ///
    /// Any transport or validation failure.
    fn add_link(
        &self,
        id: WorkItemId,
        target: WorkItemId,
        link_type: &str,
    ) -> Result<(), MutationError>;

    /// Remove a relation previously added with [`Self::add_link`].
    ///
    /// # Errors
    ///
    /// Any transport failure, or the link no longer exists.
    fn remove_link(
        &self,
        id: WorkItemId,
        target: WorkItemId,
        link_type: &str,
    ) -> Result<(), MutationError>;
}

/// A bulk mutation, applied identically to every selected item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Mutation {
    /// Post a comment. `{id}`, `{title}`, `{state}`, `{assignedTo}` and
    /// `{daysInactive}` are substituted from the item's stored metadata.
    Comment { text: String },
    /// Set (or clear) an arbitrary field.
    UpdateField {
        field: String,
        value: Option<String>,
    },
    /// Assign to `user`, or unassign with `None`.
    Assign { user: Option<String> },
    /// Move to a new workflow state.
    TransitionState {
        state: String,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Move to another iteration path.
    MoveIteration { path: String },
    /// Link each item to `target`.
    Link {
        target: WorkItemId,
        link_type: String,
    },
}

/// What a single successful mutation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMutation {
    /// Human-readable value that was written.
    pub applied: String,
    pub before: BeforeState,
}

impl AppliedMutation {
    pub fn new(applied: impl Into<String>, before: BeforeState) -> Self {
        Self {
            applied: applied.into(),
            before,
        }
    }
}

impl Mutation {
    #[must_use]
    pub const fn operation_type(&self) -> OperationType {
        match self {
            Self::Comment { .. } => OperationType::Comment,
            Self::UpdateField { .. } => OperationType::FieldUpdate,
            Self::Assign { .. } => OperationType::Assign,
            Self::TransitionState { .. } => OperationType::StateTransition,
            Self::MoveIteration { .. } => OperationType::IterationMove,
            Self::Link { .. } => OperationType::Link,
        }
    }

    /// One-line description for previews and ledger entries.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Comment { text } => format!("comment: {}", truncate(text, 60)),
            Self::UpdateField { field, value } => {
                format!("set {field} = {}", value.as_deref().unwrap_or("<unset>"))
            }
            Self::Assign { user: Some(user) } => format!("assign to {user}"),
            Self::Assign { user: None } => "unassign".to_string(),
            Self::TransitionState { state, .. } => format!("transition to {state}"),
            Self::MoveIteration { path } => format!("move to iteration {path}"),
            Self::Link { target, link_type } => format!("link {link_type} -> {target}"),
        }
    }

    /// Capture the before-state, then apply this mutation to one item.
    ///
    /// # Errors
    ///
    /// Propagates the first backend failure. A failure while reading the
    /// before-state means nothing was written.
    pub fn apply(
        &self,
        backend: &dyn WorkItemBackend,
        id: WorkItemId,
        metadata: Option<&ItemMetadata>,
    ) -> Result<AppliedMutation, MutationError> {
        match self {
            Self::Comment { text } => {
                let rendered = render_template(text, id, metadata);
                backend.add_comment(id, &rendered)?;
                Ok(AppliedMutation::new(
                    rendered.clone(),
                    BeforeState::Commented { text: rendered },
                ))
            }
            Self::UpdateField { field, value } => {
                write_fields(backend, id, &[(field.as_str(), value.as_deref())])
            }
            Self::Assign { user } => {
                write_fields(backend, id, &[(fields::ASSIGNED_TO, user.as_deref())])
            }
            Self::TransitionState { state, reason } => {
                let mut writes = vec![(fields::STATE, Some(state.as_str()))];
                if let Some(reason) = reason {
                    writes.push((fields::REASON, Some(reason.as_str())));
                }
                write_fields(backend, id, &writes)
            }
            Self::MoveIteration { path } => {
                write_fields(backend, id, &[(fields::ITERATION_PATH, Some(path.as_str()))])
            }
            Self::Link { target, link_type } => {
                backend.add_link(id, *target, link_type)?;
                Ok(AppliedMutation::new(
                    format!("{link_type} -> {target}"),
                    BeforeState::Linked {
                        target: *target,
                        link_type: link_type.clone(),
                    },
                ))
            }
        }
    }
}

fn write_fields(
    backend: &dyn WorkItemBackend,
    id: WorkItemId,
    writes: &[(&str, Option<&str>)],
) -> Result<AppliedMutation, MutationError> {
    let mut prior = BTreeMap::new();
    for (name, _) in writes {
        prior.insert((*name).to_string(), backend.field(id, name)?);
    }
    for (done, (name, value)) in writes.iter().enumerate() {
        if let Err(err) = backend.set_field(id, name, *value) {
            return Err(roll_back(backend, id, &writes[..done], prior, err));
        }
    }

    let applied = writes
        .iter()
        .map(|(name, value)| format!("{name}={}", value.unwrap_or("<unset>")))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(AppliedMutation::new(
        applied,
        BeforeState::Fields { values: prior },
    ))
}

/// Undo the fields already written before `cause`. If that fails as well,
/// the error carries the captured before-state.
fn roll_back(
    backend: &dyn WorkItemBackend,
    id: WorkItemId,
    written: &[(&str, Option<&str>)],
    prior: BTreeMap<String, Option<String>>,
    cause: MutationError,
) -> MutationError {
    for (name, _) in written.iter().rev() {
        let restore = prior.get(*name).and_then(Option::as_deref);
        if let Err(err) = backend.set_field(id, name, restore) {
            warn!(id, field = *name, error = %err, "rollback of partial write failed");
            return MutationError::PartiallyApplied {
                error: format!("{cause}; rollback of {name} failed: {err}"),
                before: BeforeState::Fields { values: prior },
            };
        }
    }
    cause
}

/// How an item was reversed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reversal {
    /// The prior value or relation is back in place.
    Restored,
    /// Grow-only change: a retraction note was posted instead.
    Retracted { note: String },
}

/// Apply the inverse of a recorded mutation to one item.
///
/// # Errors
///
/// [`MutationError::Rejected`] for [`BeforeState::Unrecorded`]; otherwise the
/// first backend failure.
pub fn reverse(
    backend: &dyn WorkItemBackend,
    id: WorkItemId,
    operation_type: &OperationType,
    before: &BeforeState,
) -> Result<Reversal, MutationError> {
    match before {
        BeforeState::Fields { values } => {
            for (name, prior) in values {
                backend.set_field(id, name, prior.as_deref())?;
            }
            Ok(Reversal::Restored)
        }
        BeforeState::Commented { text } => {
            let note = retraction_note(text);
            backend.add_comment(id, &note)?;
            Ok(Reversal::Retracted { note })
        }
        BeforeState::Linked { target, link_type } => {
            backend.remove_link(id, *target, link_type)?;
            Ok(Reversal::Restored)
        }
        BeforeState::Unrecorded => Err(MutationError::Rejected {
            reason: format!("{operation_type} on work item {id} recorded no reversal data"),
        }),
    }
}

/// Comment posted in place of deleting an earlier bulk comment.
#[must_use]
pub fn retraction_note(original: &str) -> String {
    format!(
        "[Retracted] An earlier automated comment on this item was posted in error \
         and should be disregarded: \"{}\"",
        truncate(original, 200)
    )
}

/// Substitute `{placeholders}` in a comment template from stored metadata.
#[must_use]
pub fn render_template(template: &str, id: WorkItemId, metadata: Option<&ItemMetadata>) -> String {
    let mut out = template.replace("{id}", &id.to_string());
    let Some(meta) = metadata else {
        return out;
    };
    out = out
        .replace("{title}", &meta.title)
        .replace("{state}", &meta.state)
        .replace(
            "{assignedTo}",
            meta.assigned_to.as_deref().unwrap_or("unassigned"),
        );
    let days = meta
        .days_inactive
        .map_or_else(|| "unknown".to_string(), |d| d.to_string());
    out.replace("{daysInactive}", &days)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
