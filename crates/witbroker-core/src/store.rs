//! In-memory, time-bounded store of query records keyed by opaque handle.
//!
//! # Locking
//!
//! The handle map sits behind a single `RwLock` that is only held long enough
//! to look up, insert or remove an `Arc<Entry>`. Each entry owns its own
//! `Mutex` around the operation log, so appends to different handles never
//! contend and appends to one handle are serialized in arrival order.
//!
//! # Expiry
//!
//! Expiry is logical: every lookup compares the injected clock against
//! `expires_at`, so an expired record is invisible the instant its TTL
//! passes. Physical removal happens in [`HandleStore::sweep_expired`], which
//! the background [`crate::sweeper::Sweeper`] calls periodically.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::{BrokerError, Result};
use crate::handle;
use crate::model::{
    HandlePage, HandleSummary, ItemMetadata, OperationRecord, Page, QueryRecord, WorkItemId,
};

/// Lifetime of every handle, in seconds. Not configurable per call.
pub const HANDLE_TTL_SECS: i64 = 60 * 60;

/// Lifetime of every handle.
#[must_use]
pub fn handle_ttl() -> Duration {
    Duration::seconds(HANDLE_TTL_SECS)
}

#[derive(Debug, Default)]
struct OperationLog {
    records: Vec<OperationRecord>,
    next_id: u64,
}

#[derive(Debug)]
struct Entry {
    /// Immutable part of the record; `operation_log` is always empty here.
    base: QueryRecord,
    log: Mutex<OperationLog>,
}

impl Entry {
    /// The log lock is held while undo calls into the backend, so a
    /// panicking backend poisons it. Undo only edits the log after its
    /// backend calls return, so the log is still whole and the guard is
    /// recovered.
    fn log(&self) -> MutexGuard<'_, OperationLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> QueryRecord {
        let mut record = self.base.clone();
        record.operation_log.clone_from(&self.log().records);
        record
    }

    fn summary(&self, now: DateTime<Utc>) -> HandleSummary {
        let operation_count = self.log().records.len();
        HandleSummary {
            handle: self.base.handle.clone(),
            item_count: self.base.item_count(),
            created_at: self.base.created_at,
            expires_at: self.base.expires_at,
            expired: self.base.is_expired(now),
            operation_count,
            source_description: self.base.source_description.clone(),
        }
    }
}

/// Thread-safe handle store. Share it as `Arc<HandleStore>`.
#[derive(Debug)]
pub struct HandleStore {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    clock: Arc<dyn Clock>,
}

impl HandleStore {
    /// Create an empty store reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Create an empty store on wall-clock time.
    #[must_use]
    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Wrap in an `Arc` for sharing with the sweeper and callers.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// The clock this store measures expiry against.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Store a query result and return its new handle.
    ///
    /// `item_ids` keeps query order. Metadata for identifiers that are not in
    /// `item_ids` is discarded so a record never references foreign items.
    ///
    /// # Errors
    ///
    /// [`BrokerError::EmptyQuery`] when `item_ids` is empty.
    pub fn create(
        &self,
        item_ids: Vec<WorkItemId>,
        item_metadata: impl IntoIterator<Item = (WorkItemId, ItemMetadata)>,
        source_description: impl Into<String>,
    ) -> Result<String> {
        if item_ids.is_empty() {
            return Err(BrokerError::EmptyQuery);
        }

        let mut metadata: BTreeMap<WorkItemId, ItemMetadata> = item_metadata.into_iter().collect();
        metadata.retain(|id, _| item_ids.contains(id));
        let missing = item_ids.iter().filter(|id| !metadata.contains_key(id)).count();
        if missing > 0 {
            debug!(missing, "query result has items without metadata");
        }

        let created_at = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| BrokerError::LockPoisoned)?;
        let mut token = handle::generate();
        while entries.contains_key(&token) {
            token = handle::generate();
        }

        let record = QueryRecord {
            handle: token.clone(),
            item_ids,
            item_metadata: metadata,
            created_at,
            expires_at: created_at + handle_ttl(),
            source_description: source_description.into(),
            operation_log: Vec::new(),
        };
        info!(
            handle = %token,
            items = record.item_count(),
            expires_at = %record.expires_at,
            "query handle created"
        );

        entries.insert(
            token.clone(),
            Arc::new(Entry {
                base: record,
                log: Mutex::new(OperationLog::default()),
            }),
        );
        Ok(token)
    }

    /// Fetch a live entry; expired entries are reported as missing even if
    /// the sweeper has not removed them yet.
    fn live_entry(&self, handle: &str) -> Result<Arc<Entry>> {
        if !handle::looks_like_handle(handle) {
            debug!(handle, "lookup of malformed query handle");
            return Err(BrokerError::not_found(handle));
        }
        let entry = self
            .entries
            .read()
            .map_err(|_| BrokerError::LockPoisoned)?
            .get(handle)
            .cloned();

        match entry {
            Some(entry) if !entry.base.is_expired(self.clock.now()) => Ok(entry),
            Some(_) => {
                debug!(handle, "lookup of expired query handle");
                Err(BrokerError::not_found(handle))
            }
            None => Err(BrokerError::not_found(handle)),
        }
    }

    /// Return a snapshot of the record behind `handle`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::HandleNotFoundOrExpired`] when the handle was never
    /// issued, was removed, or has expired.
    pub fn get(&self, handle: &str) -> Result<QueryRecord> {
        Ok(self.live_entry(handle)?.snapshot())
    }

    /// Summarize a live handle without cloning its items.
    ///
    /// # Errors
    ///
    /// [`BrokerError::HandleNotFoundOrExpired`] as for [`Self::get`].
    pub fn validate(&self, handle: &str) -> Result<HandleSummary> {
        Ok(self.live_entry(handle)?.summary(self.clock.now()))
    }

    /// List handle summaries, newest first.
    ///
    /// Expired-but-unswept handles are included only when `include_expired`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::LockPoisoned`] if a writer panicked.
    pub fn list(&self, include_expired: bool, page: Page) -> Result<HandlePage> {
        let now = self.clock.now();
        let entries: Vec<Arc<Entry>> = self
            .entries
            .read()
            .map_err(|_| BrokerError::LockPoisoned)?
            .values()
            .cloned()
            .collect();

        let mut summaries = entries
            .iter()
            .map(|entry| entry.summary(now))
            .filter(|summary| include_expired || !summary.expired)
            .collect::<Vec<_>>();
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.handle.cmp(&b.handle))
        });

        let total = summaries.len();
        let summaries: Vec<HandleSummary> = summaries
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        let has_more = page.offset.saturating_add(summaries.len()) < total;

        Ok(HandlePage {
            summaries,
            total,
            has_more,
        })
    }

    /// Append an operation to the handle's ledger and return its assigned id.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::HandleNotFoundOrExpired`] for missing or expired handles.
    /// - [`BrokerError::ForeignIdentifier`] if `affected_ids` names an item
    ///   that is not part of the record.
    pub fn append_operation(&self, handle: &str, mut operation: OperationRecord) -> Result<u64> {
        let entry = self.live_entry(handle)?;
        if let Some(id) = operation
            .affected_ids
            .iter()
            .copied()
            .find(|id| !entry.base.contains(*id))
        {
            return Err(BrokerError::ForeignIdentifier {
                handle: handle.to_string(),
                id,
            });
        }

        let mut log = entry.log();
        log.next_id += 1;
        operation.operation_id = log.next_id;
        debug!(
            handle,
            operation_id = operation.operation_id,
            operation_type = %operation.operation_type,
            items = operation.affected_ids.len(),
            "operation recorded"
        );
        log.records.push(operation);
        Ok(log.next_id)
    }

    /// Copy of the handle's operation log, oldest first.
    ///
    /// # Errors
    ///
    /// [`BrokerError::HandleNotFoundOrExpired`] as for [`Self::get`].
    pub fn operations(&self, handle: &str) -> Result<Vec<OperationRecord>> {
        let entry = self.live_entry(handle)?;
        Ok(entry.log().records.clone())
    }

    /// Run `f` with exclusive access to the handle's operation log.
    pub(crate) fn with_operation_log<R>(
        &self,
        handle: &str,
        f: impl FnOnce(&mut Vec<OperationRecord>) -> R,
    ) -> Result<R> {
        let entry = self.live_entry(handle)?;
        Ok(f(&mut entry.log().records))
    }

    /// Drop a handle immediately. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// [`BrokerError::LockPoisoned`] if a writer panicked.
    pub fn remove(&self, handle: &str) -> Result<bool> {
        let removed = self
            .entries
            .write()
            .map_err(|_| BrokerError::LockPoisoned)?
            .remove(handle)
            .is_some();
        if removed {
            info!(handle, "query handle removed");
        }
        Ok(removed)
    }

    /// Physically remove every expired record. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// [`BrokerError::LockPoisoned`] if a writer panicked.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| BrokerError::LockPoisoned)?;
        let before = entries.len();
        entries.retain(|_, entry| !entry.base.is_expired(now));
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            info!(removed, "swept expired query handles");
        } else {
            debug!("sweep found no expired query handles");
        }
        Ok(removed)
    }

    /// Number of physically present records, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |entries| entries.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::OperationType;

    fn store() -> (HandleStore, ManualClock) {
        let clock = ManualClock::default();
        (HandleStore::new(Arc::new(clock.clone())), clock)
    }

    fn meta(state: &str) -> ItemMetadata {
        ItemMetadata::new(state, format!("{state} item"))
    }

    fn op(ids: &[WorkItemId]) -> OperationRecord {
        OperationRecord::new(
            OperationType::Assign,
            ids.to_vec(),
            BTreeMap::new(),
            Utc::now(),
        )
    }

    #[test]
    fn create_rejects_empty_query() {
        let (store, _) = store();
        let err = store
            .create(Vec::new(), Vec::new(), "empty")
            .expect_err("empty query must be rejected");
        assert_eq!(err, BrokerError::EmptyQuery);
        assert!(store.is_empty());
    }

    #[test]
    fn create_then_get_preserves_order() {
        let (store, _) = store();
        let handle = store
            .create(vec![303, 101, 202], vec![(101, meta("New"))], "q")
            .expect("create");
        let record = store.get(&handle).expect("get");
        assert_eq!(record.item_ids, vec![303, 101, 202]);
        assert_eq!(record.source_description, "q");
        assert_eq!(record.expires_at - record.created_at, handle_ttl());
    }

    #[test]
    fn foreign_metadata_is_dropped() {
        let (store, _) = store();
        let handle = store
            .create(vec![1], vec![(1, meta("New")), (99, meta("Active"))], "q")
            .expect("create");
        let record = store.get(&handle).expect("get");
        assert!(record.metadata(99).is_none());
        assert!(record.metadata(1).is_some());
    }

    #[test]
    fn expired_handle_is_not_found_before_sweep() {
        let (store, clock) = store();
        let handle = store.create(vec![1], Vec::new(), "q").expect("create");

        clock.advance(handle_ttl() - Duration::seconds(1));
        assert!(store.get(&handle).is_ok());

        clock.advance(Duration::seconds(1));
        assert_eq!(
            store.get(&handle).expect_err("expired"),
            BrokerError::not_found(&handle)
        );
        assert_eq!(store.len(), 1, "not swept yet");
        assert!(store.append_operation(&handle, op(&[1])).is_err());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let (store, clock) = store();
        let old = store.create(vec![1], Vec::new(), "old").expect("create");
        clock.advance(Duration::minutes(30));
        let fresh = store.create(vec![2], Vec::new(), "fresh").expect("create");
        clock.advance(Duration::minutes(31));

        assert_eq!(store.sweep_expired().expect("sweep"), 1);
        assert!(store.get(&old).is_err());
        assert!(store.get(&fresh).is_ok());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn append_assigns_increasing_ids() {
        let (store, _) = store();
        let handle = store.create(vec![1, 2], Vec::new(), "q").expect("create");
        let first = store.append_operation(&handle, op(&[1])).expect("append");
        let second = store.append_operation(&handle, op(&[2])).expect("append");
        assert!(second > first);

        let log = store.operations(&handle).expect("ops");
        assert_eq!(
            log.iter().map(|o| o.operation_id).collect::<Vec<_>>(),
            vec![first, second]
        );
    }

    #[test]
    fn append_rejects_foreign_ids() {
        let (store, _) = store();
        let handle = store.create(vec![1, 2], Vec::new(), "q").expect("create");
        let err = store
            .append_operation(&handle, op(&[1, 42]))
            .expect_err("42 is not in the record");
        assert_eq!(
            err,
            BrokerError::ForeignIdentifier {
                handle: handle.clone(),
                id: 42
            }
        );
        assert!(store.operations(&handle).expect("ops").is_empty());
    }

    #[test]
    fn list_paginates_newest_first_and_hides_expired() {
        let (store, clock) = store();
        let mut handles = Vec::new();
        for i in 0..5 {
            handles.push(store.create(vec![i + 1], Vec::new(), format!("q{i}")).expect("create"));
            clock.advance(Duration::minutes(15));
        }
        // The first handle is now 75 minutes old, the second 60.
        let live = store.list(false, Page::new(0, 10)).expect("list");
        assert_eq!(live.total, 3);
        assert_eq!(live.summaries[0].handle, handles[4]);

        let all = store.list(true, Page::new(0, 2)).expect("list");
        assert_eq!(all.total, 5);
        assert_eq!(all.summaries.len(), 2);
        assert!(all.has_more);

        let tail = store.list(true, Page::new(4, 2)).expect("list");
        assert_eq!(tail.summaries.len(), 1);
        assert!(!tail.has_more);
        assert!(tail.summaries[0].expired);
        assert_eq!(tail.summaries[0].handle, handles[0]);
    }

    #[test]
    fn malformed_handles_are_not_found() {
        let (store, _) = store();
        store.create(vec![1], Vec::new(), "q").expect("create");
        for bad in ["", "12345", "qh_", "QH_0123456789abcdef0123456789abcdef"] {
            assert_eq!(
                store.get(bad).expect_err("malformed"),
                BrokerError::not_found(bad)
            );
        }
    }

    #[test]
    fn panic_while_holding_the_log_does_not_lose_the_handle() {
        let (store, _) = store();
        let handle = store.create(vec![1], Vec::new(), "q").expect("create");
        store.append_operation(&handle, op(&[1])).expect("append");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            store.with_operation_log(&handle, |log| {
                assert!(log.is_empty(), "backend exploded mid-undo");
                log.len()
            })
        }));
        assert!(result.is_err());

        assert_eq!(store.operations(&handle).expect("ops").len(), 1);
        assert_eq!(store.validate(&handle).expect("validate").operation_count, 1);
        store.append_operation(&handle, op(&[1])).expect("append after panic");
    }

    #[test]
    fn remove_makes_handle_unusable() {
        let (store, _) = store();
        let handle = store.create(vec![1], Vec::new(), "q").expect("create");
        assert!(store.remove(&handle).expect("remove"));
        assert!(!store.remove(&handle).expect("remove twice"));
        assert!(store.validate(&handle).is_err());
    }

    #[test]
    fn validate_reports_operation_count() {
        let (store, _) = store();
        let handle = store.create(vec![1, 2, 3], Vec::new(), "q").expect("create");
        store.append_operation(&handle, op(&[2])).expect("append");
        let summary = store.validate(&handle).expect("validate");
        assert_eq!(summary.item_count, 3);
        assert_eq!(summary.operation_count, 1);
        assert!(!summary.expired);
    }
}
