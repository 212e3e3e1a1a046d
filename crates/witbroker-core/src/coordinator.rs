//! Bulk execution against a resolved selection.
//!
//! # Flow
//!
//! ```text
//! handle ──get──▶ record ──resolve(selector)──▶ ids
//!                                              ├─ dry run ─▶ Previewed
//!                                              └─ live ────▶ FullySucceeded
//!                                                        ├▶ PartiallySucceeded
//!                                                        └▶ FullyFailed
//! ```
//!
//! Items are mutated one at a time in stored order. A failure on one item
//! never blocks its siblings unless `stop_on_error` is set, in which case the
//! rest are reported as not attempted. A repeated identifier is mutated once
//! per call. There is no retry state: one call is one pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BrokerError, MutationError, Result};
use crate::ledger::OperationLedger;
use crate::model::{OperationRecord, OperationType, QueryRecord, WorkItemId};
use crate::mutation::{AppliedMutation, Mutation, WorkItemBackend};
use crate::selector::{IndexOutOfRange, Selector, resolve};
use crate::store::HandleStore;

/// Default number of items shown in a preview.
pub const DEFAULT_MAX_PREVIEW_ITEMS: usize = 10;

/// Where one bulk call ended up. A call only returns once it is finished,
/// so the in-flight states are log events rather than variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkStatus {
    Previewed,
    FullySucceeded,
    PartiallySucceeded,
    FullyFailed,
}

/// Truncated list of the identifiers a call would touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    pub ids: Vec<WorkItemId>,
    pub total: usize,
    pub omitted: usize,
}

/// Dry-run scope: the first `max_preview_items` identifiers plus a count of
/// the rest. Never touches the tracker.
#[must_use]
pub fn preview(ids: &[WorkItemId], max_preview_items: usize) -> Preview {
    let shown = ids.len().min(max_preview_items);
    Preview {
        ids: ids[..shown].to_vec(),
        total: ids.len(),
        omitted: ids.len() - shown,
    }
}

/// A previewed item with its stored attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewItem {
    pub id: WorkItemId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

/// [`preview`] enriched with stored metadata.
#[must_use]
pub fn preview_items(
    record: &QueryRecord,
    ids: &[WorkItemId],
    max_preview_items: usize,
) -> (Vec<PreviewItem>, Preview) {
    let scope = preview(ids, max_preview_items);
    let items = scope
        .ids
        .iter()
        .map(|&id| {
            let meta = record.metadata(id);
            PreviewItem {
                id,
                title: meta.map(|m| m.title.clone()),
                state: meta.map(|m| m.state.clone()),
                assigned_to: meta.and_then(|m| m.assigned_to.clone()),
            }
        })
        .collect();
    (items, scope)
}

/// Outcome for one identifier in a live run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ItemResult {
    Succeeded { applied: String },
    Failed { error: String },
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub id: WorkItemId,
    #[serde(flatten)]
    pub result: ItemResult,
}

/// Per-item accounting for a live run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub status: BulkStatus,
    pub results: Vec<ItemReport>,
    /// Ledger entry recorded for the successful items, if any.
    pub operation_id: Option<u64>,
    /// Set when items were mutated but the ledger append failed, for
    /// example because the handle expired mid-run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_error: Option<String>,
}

impl ExecutionReport {
    fn count(&self, pred: impl Fn(&ItemResult) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.result)).count()
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(|r| matches!(r, ItemResult::Succeeded { .. }))
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|r| matches!(r, ItemResult::Failed { .. }))
    }

    #[must_use]
    pub fn not_attempted(&self) -> usize {
        self.count(|r| matches!(r, ItemResult::NotAttempted))
    }
}

/// A complete bulk call: which handle, which items, and how to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    pub handle: String,
    #[serde(default)]
    pub selector: Selector,
    /// Preview only. Defaults to `true`; live runs must opt in.
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default)]
    pub stop_on_error: bool,
    #[serde(default = "default_max_preview")]
    pub max_preview_items: usize,
}

const fn default_true() -> bool {
    true
}

const fn default_max_preview() -> usize {
    DEFAULT_MAX_PREVIEW_ITEMS
}

impl BulkRequest {
    /// A dry-run request over every item of `handle`.
    pub fn new(handle: impl Into<String>, selector: Selector) -> Self {
        Self {
            handle: handle.into(),
            selector,
            dry_run: true,
            stop_on_error: false,
            max_preview_items: DEFAULT_MAX_PREVIEW_ITEMS,
        }
    }

    /// Switch to a live run.
    #[must_use]
    pub const fn live(mut self) -> Self {
        self.dry_run = false;
        self
    }

    #[must_use]
    pub const fn stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    #[must_use]
    pub const fn max_preview_items(mut self, max: usize) -> Self {
        self.max_preview_items = max;
        self
    }
}

/// Everything a caller sees after [`BulkCoordinator::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReport {
    pub handle: String,
    pub status: BulkStatus,
    pub dry_run: bool,
    pub operation: String,
    pub selector: String,
    pub considered: usize,
    pub matched: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub index_errors: Vec<IndexOutOfRange>,
    pub preview: Vec<PreviewItem>,
    pub omitted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionReport>,
}

/// Applies per-item mutations across a selection and records the result.
#[derive(Debug, Clone)]
pub struct BulkCoordinator {
    store: Arc<HandleStore>,
    ledger: OperationLedger,
}

impl BulkCoordinator {
    #[must_use]
    pub fn new(store: Arc<HandleStore>) -> Self {
        let ledger = OperationLedger::new(Arc::clone(&store));
        Self { store, ledger }
    }

    #[must_use]
    pub const fn ledger(&self) -> &OperationLedger {
        &self.ledger
    }

    /// Dry-run scope for already-resolved identifiers.
    #[must_use]
    #[allow(clippy::unused_self)]
    pub fn preview(&self, resolved_ids: &[WorkItemId], max_preview_items: usize) -> Preview {
        preview(resolved_ids, max_preview_items)
    }

    /// Run `mutation_fn` once per distinct identifier, in order, and record
    /// every item that changed in the handle's ledger. That includes failed
    /// items a write left half applied.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::HandleNotFoundOrExpired`] before any mutation if the
    ///   handle is gone.
    /// - [`BrokerError::ForeignIdentifier`] before any mutation if an
    ///   identifier is not part of the handle.
    ///
    /// Per-item failures are never errors; they are in the report.
    pub fn execute<F>(
        &self,
        handle: &str,
        resolved_ids: &[WorkItemId],
        operation_type: OperationType,
        description: &str,
        mut mutation_fn: F,
        stop_on_error: bool,
    ) -> Result<ExecutionReport>
    where
        F: FnMut(WorkItemId) -> std::result::Result<AppliedMutation, MutationError>,
    {
        let record = self.store.get(handle)?;
        if let Some(&id) = resolved_ids.iter().find(|id| !record.contains(**id)) {
            return Err(BrokerError::ForeignIdentifier {
                handle: handle.to_string(),
                id,
            });
        }

        debug!(
            handle,
            items = resolved_ids.len(),
            operation_type = %operation_type,
            "bulk execution started"
        );

        let mut results = Vec::with_capacity(resolved_ids.len());
        let mut before_state = BTreeMap::new();
        let mut recorded_ids = Vec::new();
        let mut seen = BTreeSet::new();
        let mut succeeded = 0;
        let mut halted = false;

        for &id in resolved_ids {
            if !seen.insert(id) {
                debug!(handle, id, "repeated work item skipped");
                continue;
            }
            if halted {
                results.push(ItemReport {
                    id,
                    result: ItemResult::NotAttempted,
                });
                continue;
            }
            match mutation_fn(id) {
                Ok(applied) => {
                    succeeded += 1;
                    recorded_ids.push(id);
                    before_state.insert(id, applied.before);
                    results.push(ItemReport {
                        id,
                        result: ItemResult::Succeeded {
                            applied: applied.applied,
                        },
                    });
                }
                Err(err) => {
                    warn!(handle, id, error = %err, "work item mutation failed");
                    if let Some(before) = err.partial_before() {
                        recorded_ids.push(id);
                        before_state.insert(id, before.clone());
                    }
                    results.push(ItemReport {
                        id,
                        result: ItemResult::Failed {
                            error: err.to_string(),
                        },
                    });
                    halted = stop_on_error;
                }
            }
        }

        let status = if succeeded == results.len() {
            BulkStatus::FullySucceeded
        } else if succeeded == 0 {
            BulkStatus::FullyFailed
        } else {
            BulkStatus::PartiallySucceeded
        };

        let mut operation_id = None;
        let mut ledger_error = None;
        if !recorded_ids.is_empty() {
            let operation = OperationRecord::new(
                operation_type.clone(),
                recorded_ids,
                before_state,
                self.store.clock().now(),
            )
            .with_description(description);
            match self.ledger.record(handle, operation) {
                Ok(id) => operation_id = Some(id),
                Err(err) => {
                    warn!(handle, error = %err, "mutations applied but ledger append failed");
                    ledger_error = Some(err.to_string());
                }
            }
        }

        let report = ExecutionReport {
            status,
            results,
            operation_id,
            ledger_error,
        };
        info!(
            handle,
            operation_type = %operation_type,
            status = ?report.status,
            succeeded = report.succeeded(),
            failed = report.failed(),
            not_attempted = report.not_attempted(),
            "bulk execution finished"
        );
        Ok(report)
    }

    /// Resolve the request's selector against its handle, then preview or
    /// apply `mutation` through `backend`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::HandleNotFoundOrExpired`] before anything happens if
    /// the handle is missing or expired.
    pub fn run(
        &self,
        request: &BulkRequest,
        mutation: &Mutation,
        backend: &dyn WorkItemBackend,
    ) -> Result<BulkReport> {
        let record = self.store.get(&request.handle)?;
        let selection = resolve(&record, &request.selector);
        let (preview, scope) =
            preview_items(&record, &selection.ids, request.max_preview_items);

        let mut report = BulkReport {
            handle: request.handle.clone(),
            status: BulkStatus::Previewed,
            dry_run: request.dry_run,
            operation: mutation.describe(),
            selector: request.selector.describe(),
            considered: selection.considered,
            matched: selection.matched,
            index_errors: selection.index_errors,
            preview,
            omitted: scope.omitted,
            execution: None,
        };

        if request.dry_run {
            info!(
                handle = %request.handle,
                matched = report.matched,
                operation = %report.operation,
                "bulk dry run previewed"
            );
            return Ok(report);
        }

        let execution = self.execute(
            &request.handle,
            &selection.ids,
            mutation.operation_type(),
            &report.operation,
            |id| mutation.apply(backend, id, record.metadata(id)),
            request.stop_on_error,
        )?;
        report.status = execution.status;
        report.execution = Some(execution);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{BeforeState, ItemMetadata};
    use crate::store::handle_ttl;
    use std::cell::Cell;

    fn setup(ids: &[WorkItemId]) -> (BulkCoordinator, Arc<HandleStore>, ManualClock, String) {
        let clock = ManualClock::default();
        let store = HandleStore::new(Arc::new(clock.clone())).shared();
        let metadata = ids
            .iter()
            .map(|&id| (id, ItemMetadata::new("Active", format!("item {id}"))));
        let handle = store.create(ids.to_vec(), metadata, "q").expect("create");
        (BulkCoordinator::new(Arc::clone(&store)), store, clock, handle)
    }

    fn ok(id: WorkItemId) -> std::result::Result<AppliedMutation, MutationError> {
        Ok(AppliedMutation::new(
            "Closed",
            BeforeState::field("System.State", Some(format!("state-{id}"))),
        ))
    }

    #[test]
    fn preview_truncates_and_counts_omitted() {
        let scope = preview(&[1, 2, 3, 4, 5], 2);
        assert_eq!(scope.ids, vec![1, 2]);
        assert_eq!(scope.total, 5);
        assert_eq!(scope.omitted, 3);

        let all = preview(&[1, 2], 10);
        assert_eq!(all.omitted, 0);
    }

    #[test]
    fn one_failure_out_of_five_is_isolated() {
        let (coordinator, store, _, handle) = setup(&[1, 2, 3, 4, 5]);
        let report = coordinator
            .execute(
                &handle,
                &[1, 2, 3, 4, 5],
                OperationType::StateTransition,
                "close",
                |id| {
                    if id == 3 {
                        Err(MutationError::remote("409 conflict"))
                    } else {
                        ok(id)
                    }
                },
                false,
            )
            .expect("execute");

        assert_eq!(report.status, BulkStatus::PartiallySucceeded);
        assert_eq!(report.succeeded(), 4);
        assert_eq!(report.failed(), 1);

        let log = store.operations(&handle).expect("ops");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].affected_ids, vec![1, 2, 4, 5]);
        assert!(!log[0].before_state.contains_key(&3));
        assert_eq!(Some(log[0].operation_id), report.operation_id);
    }

    #[test]
    fn stop_on_error_halts_dispatch() {
        let (coordinator, _, _, handle) = setup(&[1, 2, 3, 4]);
        let calls = Cell::new(0);
        let report = coordinator
            .execute(
                &handle,
                &[1, 2, 3, 4],
                OperationType::Assign,
                "assign",
                |id| {
                    calls.set(calls.get() + 1);
                    if id == 2 {
                        Err(MutationError::remote("timeout"))
                    } else {
                        ok(id)
                    }
                },
                true,
            )
            .expect("execute");

        assert_eq!(calls.get(), 2);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.not_attempted(), 2);
        assert_eq!(report.results[3].result, ItemResult::NotAttempted);
        assert_eq!(report.status, BulkStatus::PartiallySucceeded);
    }

    #[test]
    fn all_failures_record_nothing() {
        let (coordinator, store, _, handle) = setup(&[1, 2]);
        let report = coordinator
            .execute(
                &handle,
                &[1, 2],
                OperationType::Comment,
                "comment",
                |_| Err(MutationError::remote("down")),
                false,
            )
            .expect("execute");
        assert_eq!(report.status, BulkStatus::FullyFailed);
        assert_eq!(report.operation_id, None);
        assert!(store.operations(&handle).expect("ops").is_empty());
    }

    #[test]
    fn expired_handle_aborts_before_any_mutation() {
        let (coordinator, _, clock, handle) = setup(&[1]);
        clock.advance(handle_ttl());
        let calls = Cell::new(0);
        let err = coordinator
            .execute(
                &handle,
                &[1],
                OperationType::Assign,
                "assign",
                |id| {
                    calls.set(calls.get() + 1);
                    ok(id)
                },
                false,
            )
            .expect_err("expired");
        assert!(matches!(err, BrokerError::HandleNotFoundOrExpired { .. }));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn foreign_identifiers_abort_before_any_mutation() {
        let (coordinator, _, _, handle) = setup(&[1, 2]);
        let calls = Cell::new(0);
        let err = coordinator
            .execute(
                &handle,
                &[1, 77],
                OperationType::Assign,
                "assign",
                |id| {
                    calls.set(calls.get() + 1);
                    ok(id)
                },
                false,
            )
            .expect_err("77 was never returned by the query");
        assert!(matches!(err, BrokerError::ForeignIdentifier { id: 77, .. }));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn empty_selection_succeeds_without_ledger_entry() {
        let (coordinator, store, _, handle) = setup(&[1]);
        let report = coordinator
            .execute(&handle, &[], OperationType::Assign, "assign", ok, false)
            .expect("execute");
        assert_eq!(report.status, BulkStatus::FullySucceeded);
        assert!(report.results.is_empty());
        assert!(store.operations(&handle).expect("ops").is_empty());
    }

    #[test]
    fn repeated_ids_are_mutated_once_and_keep_the_first_snapshot() {
        let (coordinator, store, _, handle) = setup(&[1, 1, 2]);
        let calls = Cell::new(0);
        let report = coordinator
            .execute(
                &handle,
                &[1, 1, 2],
                OperationType::StateTransition,
                "close",
                |id| {
                    calls.set(calls.get() + 1);
                    ok(id)
                },
                false,
            )
            .expect("execute");

        assert_eq!(calls.get(), 2);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.status, BulkStatus::FullySucceeded);

        let log = store.operations(&handle).expect("ops");
        assert_eq!(log[0].affected_ids, vec![1, 2]);
        assert_eq!(
            log[0].before_state[&1],
            BeforeState::field("System.State", Some("state-1".into()))
        );
    }

    #[test]
    fn half_applied_failures_are_recorded_for_undo() {
        let (coordinator, store, _, handle) = setup(&[1, 2]);
        let report = coordinator
            .execute(
                &handle,
                &[1, 2],
                OperationType::StateTransition,
                "close",
                |id| {
                    if id == 2 {
                        Err(MutationError::PartiallyApplied {
                            error: "reason rejected".into(),
                            before: BeforeState::field("System.State", Some("New".into())),
                        })
                    } else {
                        ok(id)
                    }
                },
                false,
            )
            .expect("execute");

        assert_eq!(report.status, BulkStatus::PartiallySucceeded);
        assert_eq!(report.failed(), 1);

        let log = store.operations(&handle).expect("ops");
        assert_eq!(log[0].affected_ids, vec![1, 2]);
        assert_eq!(
            log[0].before_state[&2],
            BeforeState::field("System.State", Some("New".into()))
        );
    }

    #[test]
    fn bulk_request_defaults_to_dry_run() {
        let request: BulkRequest =
            serde_json::from_str(r#"{"handle":"qh_x"}"#).expect("parse");
        assert!(request.dry_run);
        assert_eq!(request.selector, Selector::All);
        assert_eq!(request.max_preview_items, DEFAULT_MAX_PREVIEW_ITEMS);
        assert!(!BulkRequest::new("qh_x", Selector::All).live().dry_run);
    }
}
