//! Shared in-memory tracker for integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};

use witbroker_core::{MutationError, WorkItemBackend, WorkItemId};

#[derive(Default)]
pub struct MemoryTracker {
    pub fields: RefCell<HashMap<(WorkItemId, String), String>>,
    pub comments: RefCell<Vec<(WorkItemId, String)>>,
    pub links: RefCell<BTreeSet<(WorkItemId, WorkItemId, String)>>,
    pub failing: RefCell<HashSet<WorkItemId>>,
    pub writes: RefCell<usize>,
    /// Writes still allowed before the connection "drops".
    pub budget: Cell<Option<usize>>,
}

impl MemoryTracker {
    pub fn with_field(self, id: WorkItemId, name: &str, value: &str) -> Self {
        self.fields
            .borrow_mut()
            .insert((id, name.to_string()), value.to_string());
        self
    }

    pub fn get(&self, id: WorkItemId, name: &str) -> Option<String> {
        self.fields.borrow().get(&(id, name.to_string())).cloned()
    }

    pub fn fail_on(&self, id: WorkItemId) {
        self.failing.borrow_mut().insert(id);
    }

    pub fn fail_after(&self, writes: usize) {
        self.budget.set(Some(writes));
    }

    pub fn heal(&self) {
        self.failing.borrow_mut().clear();
        self.budget.set(None);
    }

    fn check(&self, id: WorkItemId) -> Result<(), MutationError> {
        if self.budget.get() == Some(0) {
            return Err(MutationError::remote(format!("connection reset updating {id}")));
        }
        if let Some(left) = self.budget.get() {
            self.budget.set(Some(left - 1));
        }
        if self.failing.borrow().contains(&id) {
            Err(MutationError::remote(format!("HTTP 500 updating {id}")))
        } else {
            *self.writes.borrow_mut() += 1;
            Ok(())
        }
    }
}

impl WorkItemBackend for MemoryTracker {
    fn field(&self, id: WorkItemId, name: &str) -> Result<Option<String>, MutationError> {
        Ok(self.get(id, name))
    }

    fn set_field(
        &self,
        id: WorkItemId,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), MutationError> {
        self.check(id)?;
        let key = (id, name.to_string());
        match value {
            Some(v) => {
                self.fields.borrow_mut().insert(key, v.to_string());
            }
            None => {
                self.fields.borrow_mut().remove(&key);
            }
        }
        Ok(())
    }

    fn add_comment(&self, id: WorkItemId, text: &str) -> Result<(), MutationError> {
        self.check(id)?;
        self.comments.borrow_mut().push((id, text.to_string()));
        Ok(())
    }

    fn add_link(
        &self,
        id: WorkItemId,
        target: WorkItemId,
        link_type: &str,
    ) -> Result<(), MutationError> {
        self.check(id)?;
        self.links
            .borrow_mut()
            .insert((id, target, link_type.to_string()));
        Ok(())
    }

    fn remove_link(
        &self,
        id: WorkItemId,
        target: WorkItemId,
        link_type: &str,
    ) -> Result<(), MutationError> {
        self.check(id)?;
        self.links
            .borrow_mut()
            .remove(&(id, target, link_type.to_string()));
        Ok(())
    }
}
