//! witbroker-core library.
//!
//! Converts a query result into an opaque, one-hour handle and later
//! resolves that handle (optionally narrowed by a selector) back into the
//! exact identifiers a bulk operation may touch.
//!
//! # Conventions
//!
//! - **Errors**: whole-call failures are [`BrokerError`]; per-item failures
//!   are collected into reports, never returned as `Err`.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handle;
pub mod ledger;
pub mod model;
pub mod mutation;
pub mod selector;
pub mod store;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{BulkCoordinator, BulkReport, BulkRequest, BulkStatus, ExecutionReport};
pub use error::{BrokerError, ErrorCode, MutationError, Result};
pub use ledger::{OperationLedger, UndoAllReport, UndoReport};
pub use model::{
    BeforeState, HandlePage, HandleSummary, ItemMetadata, OperationRecord, OperationType, Page,
    QueryRecord, WorkItemId,
};
pub use mutation::{AppliedMutation, Mutation, WorkItemBackend};
pub use selector::{Criteria, Selection, Selector};
pub use store::HandleStore;
pub use sweeper::Sweeper;
