//! Per-handle history of live bulk mutations, and their reversal.
//!
//! Undo never re-queries the tracker: it replays each item's recorded
//! before-state through [`crate::mutation::reverse`]. Comments are grow-only
//! on the remote side, so undoing one posts a retraction note and reports
//! [`UndoOutcome::Retracted`] rather than pretending the comment is gone.
//!
//! Only items that were reversed leave the ledger. Failed items stay in the
//! operation record, and nothing is retried automatically.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ErrorCode, Result};
use crate::model::{OperationRecord, OperationType, WorkItemId};
use crate::mutation::{Reversal, WorkItemBackend, reverse};
use crate::store::HandleStore;

/// Result of reversing one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UndoOutcome {
    /// The prior value is back in place.
    Restored,
    /// The change could not truly be undone; a retraction note was posted.
    Retracted { note: String },
    /// The reversal call failed; the item stays in the ledger.
    Failed { error: String },
    /// No reversal data was recorded for this item.
    Unrecoverable,
}

impl UndoOutcome {
    /// Error code to surface alongside this outcome, if any.
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Restored => None,
            Self::Retracted { .. } | Self::Unrecoverable => Some(ErrorCode::IrreversibleOperation),
            Self::Failed { .. } => Some(ErrorCode::MutationFailure),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUndo {
    pub id: WorkItemId,
    #[serde(flatten)]
    pub outcome: UndoOutcome,
}

/// Overall state of one `undo_last` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UndoStatus {
    /// The ledger was empty.
    NothingToUndo,
    /// Every item was restored or retracted; the entry left the ledger.
    Reversed,
    /// Some items failed and remain in the ledger.
    PartiallyReversed,
    /// The operation carries no reversal data and was left untouched.
    Unrecoverable,
}

/// Report of reversing the newest ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoReport {
    pub status: UndoStatus,
    pub operation_id: Option<u64>,
    pub operation_type: Option<OperationType>,
    pub outcomes: Vec<ItemUndo>,
    /// Items of this operation still recorded in the ledger.
    pub remaining_ids: Vec<WorkItemId>,
}

impl UndoReport {
    const fn nothing() -> Self {
        Self {
            status: UndoStatus::NothingToUndo,
            operation_id: None,
            operation_type: None,
            outcomes: Vec::new(),
            remaining_ids: Vec::new(),
        }
    }

    /// True if any item was only retracted rather than truly reversed.
    #[must_use]
    pub fn has_irreversible(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.outcome, UndoOutcome::Retracted { .. }))
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, UndoOutcome::Failed { .. }))
            .count()
    }
}

/// Why `undo_all` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// The ledger is empty.
    Exhausted,
    /// The newest remaining operation cannot be reversed.
    Unrecoverable { operation_id: u64 },
    /// An operation was only partially reversed.
    PartialFailure { operation_id: u64 },
    /// The handle expired or was removed part way through.
    HandleUnavailable,
}

/// Report of reversing every ledger entry, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoAllReport {
    pub undone: Vec<UndoReport>,
    pub stopped: StopReason,
    /// Ledger entries left after stopping, oldest first.
    pub remaining: Vec<OperationRecord>,
}

/// Ledger facade over the handle store.
#[derive(Debug, Clone)]
pub struct OperationLedger {
    store: Arc<HandleStore>,
}

impl OperationLedger {
    #[must_use]
    pub const fn new(store: Arc<HandleStore>) -> Self {
        Self { store }
    }

    /// Append a completed live operation.
    ///
    /// # Errors
    ///
    /// See [`HandleStore::append_operation`].
    pub fn record(&self, handle: &str, operation: OperationRecord) -> Result<u64> {
        self.store.append_operation(handle, operation)
    }

    /// Ledger entries for `handle`, oldest first.
    ///
    /// # Errors
    ///
    /// See [`HandleStore::operations`].
    pub fn history(&self, handle: &str) -> Result<Vec<OperationRecord>> {
        self.store.operations(handle)
    }

    /// Reverse the newest operation recorded against `handle`.
    ///
    /// The handle's log stays locked while the reversal runs, so no new
    /// operation can slip in ahead of the one being undone and two callers
    /// cannot undo the same entry twice. Other handles are unaffected.
    ///
    /// # Errors
    ///
    /// [`crate::BrokerError::HandleNotFoundOrExpired`] if the handle is gone.
    /// Per-item reversal failures are reported in the [`UndoReport`].
    pub fn undo_last(&self, handle: &str, backend: &dyn WorkItemBackend) -> Result<UndoReport> {
        let report = self.store.with_operation_log(handle, |log| {
            let Some(last) = log.last_mut() else {
                return UndoReport::nothing();
            };

            if !last.is_reversible() {
                return UndoReport {
                    status: UndoStatus::Unrecoverable,
                    operation_id: Some(last.operation_id),
                    operation_type: Some(last.operation_type.clone()),
                    outcomes: last
                        .affected_ids
                        .iter()
                        .map(|&id| ItemUndo {
                            id,
                            outcome: UndoOutcome::Unrecoverable,
                        })
                        .collect(),
                    remaining_ids: last.affected_ids.clone(),
                };
            }

            let mut outcomes = Vec::with_capacity(last.affected_ids.len());
            let mut remaining = Vec::new();
            for &id in &last.affected_ids {
                let Some(before) = last.before_state.get(&id) else {
                    continue;
                };
                let outcome = match reverse(backend, id, &last.operation_type, before) {
                    Ok(Reversal::Restored) => UndoOutcome::Restored,
                    Ok(Reversal::Retracted { note }) => UndoOutcome::Retracted { note },
                    Err(err) => {
                        warn!(handle, id, error = %err, "undo failed for work item");
                        remaining.push(id);
                        UndoOutcome::Failed {
                            error: err.to_string(),
                        }
                    }
                };
                outcomes.push(ItemUndo { id, outcome });
            }

            let operation_id = last.operation_id;
            let operation_type = last.operation_type.clone();
            let status = if remaining.is_empty() {
                log.pop();
                UndoStatus::Reversed
            } else {
                last.before_state.retain(|id, _| remaining.contains(id));
                last.affected_ids.retain(|id| remaining.contains(id));
                UndoStatus::PartiallyReversed
            };

            UndoReport {
                status,
                operation_id: Some(operation_id),
                operation_type: Some(operation_type),
                outcomes,
                remaining_ids: remaining,
            }
        })?;

        if let (Some(operation_id), Some(operation_type)) =
            (report.operation_id, report.operation_type.as_ref())
        {
            info!(
                handle,
                operation_id,
                operation_type = %operation_type,
                status = ?report.status,
                failed = report.failed(),
                "undo applied"
            );
        }
        Ok(report)
    }

    /// Reverse operations newest first until the ledger is empty, an
    /// operation cannot be reversed, or a reversal is only partial.
    ///
    /// # Errors
    ///
    /// [`crate::BrokerError::HandleNotFoundOrExpired`] if the handle is gone
    /// before anything was undone. If it disappears later, the reports so
    /// far are returned with [`StopReason::HandleUnavailable`].
    pub fn undo_all(&self, handle: &str, backend: &dyn WorkItemBackend) -> Result<UndoAllReport> {
        let mut undone = Vec::new();
        let stopped = loop {
            let report = match self.undo_last(handle, backend) {
                Ok(report) => report,
                Err(err) if undone.is_empty() => return Err(err),
                Err(_) => break StopReason::HandleUnavailable,
            };

            match (report.status, report.operation_id) {
                (UndoStatus::NothingToUndo, _) => break StopReason::Exhausted,
                (UndoStatus::Reversed, _) => undone.push(report),
                (UndoStatus::Unrecoverable, Some(operation_id)) => {
                    undone.push(report);
                    break StopReason::Unrecoverable { operation_id };
                }
                (UndoStatus::PartiallyReversed, Some(operation_id)) => {
                    undone.push(report);
                    break StopReason::PartialFailure { operation_id };
                }
                (_, None) => break StopReason::Exhausted,
            }
        };

        let remaining = match stopped {
            StopReason::HandleUnavailable => Vec::new(),
            _ => self.store.operations(handle).unwrap_or_default(),
        };
        if !remaining.is_empty() {
            warn!(
                handle,
                remaining = remaining.len(),
                stopped = ?stopped,
                "undo all stopped with operations left in the ledger"
            );
        }

        Ok(UndoAllReport {
            undone,
            stopped,
            remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::MutationError;
    use crate::model::BeforeState;
    use chrono::Utc;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashMap, HashSet};

    #[derive(Default)]
    struct FlakyBackend {
        fields: RefCell<HashMap<(WorkItemId, String), String>>,
        comments: RefCell<Vec<(WorkItemId, String)>>,
        broken: HashSet<WorkItemId>,
    }

    impl WorkItemBackend for FlakyBackend {
        fn field(&self, id: WorkItemId, name: &str) -> std::result::Result<Option<String>, MutationError> {
            Ok(self.fields.borrow().get(&(id, name.to_string())).cloned())
        }

        fn set_field(
            &self,
            id: WorkItemId,
            name: &str,
            value: Option<&str>,
        ) -> std::result::Result<(), MutationError> {
            if self.broken.contains(&id) {
                return Err(MutationError::remote("503 Service Unavailable"));
            }
            let key = (id, name.to_string());
            match value {
                Some(v) => self.fields.borrow_mut().insert(key, v.to_string()),
                None => self.fields.borrow_mut().remove(&key),
            };
            Ok(())
        }

        fn add_comment(&self, id: WorkItemId, text: &str) -> std::result::Result<(), MutationError> {
            self.comments.borrow_mut().push((id, text.to_string()));
            Ok(())
        }

        fn add_link(&self, _: WorkItemId, _: WorkItemId, _: &str) -> std::result::Result<(), MutationError> {
            Ok(())
        }

        fn remove_link(&self, _: WorkItemId, _: WorkItemId, _: &str) -> std::result::Result<(), MutationError> {
            Ok(())
        }
    }

    fn setup() -> (OperationLedger, String) {
        let store = HandleStore::new(Arc::new(ManualClock::default())).shared();
        let handle = store.create(vec![1, 2, 3], Vec::new(), "q").expect("create");
        (OperationLedger::new(store), handle)
    }

    fn state_op(prior: &[(WorkItemId, &str)]) -> OperationRecord {
        let before: BTreeMap<_, _> = prior
            .iter()
            .map(|(id, state)| (*id, BeforeState::field("System.State", Some((*state).to_string()))))
            .collect();
        OperationRecord::new(
            OperationType::StateTransition,
            prior.iter().map(|(id, _)| *id).collect(),
            before,
            Utc::now(),
        )
    }

    fn comment_op(ids: &[WorkItemId]) -> OperationRecord {
        let before = ids
            .iter()
            .map(|id| (*id, BeforeState::Commented { text: "ping".into() }))
            .collect();
        OperationRecord::new(OperationType::Comment, ids.to_vec(), before, Utc::now())
    }

    fn custom_op(ids: &[WorkItemId]) -> OperationRecord {
        let before = ids.iter().map(|id| (*id, BeforeState::Unrecorded)).collect();
        OperationRecord::new(
            OperationType::Custom("script".into()),
            ids.to_vec(),
            before,
            Utc::now(),
        )
    }

    #[test]
    fn undo_on_empty_ledger_reports_nothing() {
        let (ledger, handle) = setup();
        let report = ledger
            .undo_last(&handle, &FlakyBackend::default())
            .expect("undo");
        assert_eq!(report.status, UndoStatus::NothingToUndo);
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn undo_last_restores_prior_state_and_pops_entry() {
        let (ledger, handle) = setup();
        let backend = FlakyBackend::default();
        ledger
            .record(&handle, state_op(&[(1, "New"), (2, "Active")]))
            .expect("record");

        let report = ledger.undo_last(&handle, &backend).expect("undo");
        assert_eq!(report.status, UndoStatus::Reversed);
        assert_eq!(
            backend.fields.borrow().get(&(1, "System.State".into())).map(String::as_str),
            Some("New")
        );
        assert_eq!(
            backend.fields.borrow().get(&(2, "System.State".into())).map(String::as_str),
            Some("Active")
        );
        assert!(ledger.history(&handle).expect("history").is_empty());
    }

    #[test]
    fn partial_undo_keeps_failed_items_in_ledger() {
        let (ledger, handle) = setup();
        let backend = FlakyBackend {
            broken: HashSet::from([2]),
            ..FlakyBackend::default()
        };
        ledger
            .record(&handle, state_op(&[(1, "New"), (2, "New"), (3, "New")]))
            .expect("record");

        let report = ledger.undo_last(&handle, &backend).expect("undo");
        assert_eq!(report.status, UndoStatus::PartiallyReversed);
        assert_eq!(report.remaining_ids, vec![2]);
        assert_eq!(report.failed(), 1);

        let history = ledger.history(&handle).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].affected_ids, vec![2]);
        assert_eq!(history[0].before_state.len(), 1);
    }

    #[test]
    fn comment_undo_is_reported_as_retraction() {
        let (ledger, handle) = setup();
        let backend = FlakyBackend::default();
        ledger.record(&handle, comment_op(&[1, 3])).expect("record");

        let report = ledger.undo_last(&handle, &backend).expect("undo");
        assert_eq!(report.status, UndoStatus::Reversed);
        assert!(report.has_irreversible());
        assert!(report.outcomes.iter().all(|o| {
            o.outcome.code() == Some(ErrorCode::IrreversibleOperation)
        }));
        assert_eq!(backend.comments.borrow().len(), 2);
    }

    #[test]
    fn undo_all_stops_at_unrecoverable_operation() {
        let (ledger, handle) = setup();
        let backend = FlakyBackend::default();
        ledger.record(&handle, state_op(&[(1, "New")])).expect("record");
        ledger.record(&handle, custom_op(&[2])).expect("record");
        ledger.record(&handle, comment_op(&[3])).expect("record");
        ledger.record(&handle, state_op(&[(3, "Active")])).expect("record");

        let report = ledger.undo_all(&handle, &backend).expect("undo all");
        assert_eq!(report.undone.len(), 3);
        assert_eq!(report.undone[2].status, UndoStatus::Unrecoverable);
        assert!(matches!(report.stopped, StopReason::Unrecoverable { .. }));
        assert_eq!(report.remaining.len(), 2, "custom op and the first transition remain");
        assert_eq!(
            report.remaining[1].operation_type,
            OperationType::Custom("script".into())
        );
    }

    #[test]
    fn undo_all_drains_reversible_ledger() {
        let (ledger, handle) = setup();
        let backend = FlakyBackend::default();
        ledger.record(&handle, state_op(&[(1, "New")])).expect("record");
        ledger.record(&handle, state_op(&[(1, "Active")])).expect("record");

        let report = ledger.undo_all(&handle, &backend).expect("undo all");
        assert_eq!(report.stopped, StopReason::Exhausted);
        assert_eq!(report.undone.len(), 2);
        assert!(report.remaining.is_empty());
        // Newest first: Active is restored, then New.
        assert_eq!(
            backend.fields.borrow().get(&(1, "System.State".into())).map(String::as_str),
            Some("New")
        );
    }

    #[test]
    fn undo_all_stops_after_partial_failure() {
        let (ledger, handle) = setup();
        let backend = FlakyBackend {
            broken: HashSet::from([2]),
            ..FlakyBackend::default()
        };
        ledger.record(&handle, state_op(&[(1, "New")])).expect("record");
        ledger
            .record(&handle, state_op(&[(1, "Active"), (2, "Active")]))
            .expect("record");

        let report = ledger.undo_all(&handle, &backend).expect("undo all");
        assert!(matches!(report.stopped, StopReason::PartialFailure { .. }));
        assert_eq!(report.undone.len(), 1);
        assert_eq!(report.remaining.len(), 2);
    }

    #[test]
    fn undo_on_unknown_handle_is_an_error() {
        let (ledger, _) = setup();
        assert!(ledger.undo_last("qh_missing", &FlakyBackend::default()).is_err());
        assert!(ledger.undo_all("qh_missing", &FlakyBackend::default()).is_err());
    }
}
