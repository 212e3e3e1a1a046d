//! In-memory work item tracker loaded from a JSON fixture.
//!
//! The fixture stands in for both collaborators the core expects: it acts as
//! the query executor (metadata for a list of ids) and as the
//! [`WorkItemBackend`] bulk mutations are applied through.
//!
//! ```json
//! [
//!   { "id": 101, "state": "Active", "title": "Fix login", "tags": ["auth"],
//!     "daysInactive": 42, "assignedTo": "ana@contoso.com" },
//!   { "id": 102, "state": "New", "title": "Flaky", "rejectWrites": true }
//! ]
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, warn};
use witbroker_core::mutation::fields;
use witbroker_core::{ItemMetadata, MutationError, WorkItemBackend, WorkItemId};

/// One work item as written in the fixture file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureItem {
    pub id: WorkItemId,
    #[serde(flatten)]
    pub metadata: ItemMetadata,
    /// Extra fields, keyed by reference name.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Every write to this item fails with a remote error.
    #[serde(default)]
    pub reject_writes: bool,
}

#[derive(Debug)]
struct TrackedItem {
    fields: BTreeMap<String, String>,
    comments: Vec<String>,
    links: BTreeSet<(WorkItemId, String)>,
    days_inactive: Option<u32>,
    reject_writes: bool,
}

impl TrackedItem {
    fn from_fixture(item: FixtureItem) -> Self {
        let FixtureItem {
            metadata,
            fields: mut values,
            reject_writes,
            ..
        } = item;
        values.insert(fields::STATE.to_string(), metadata.state);
        values.insert(fields::TITLE.to_string(), metadata.title);
        if !metadata.tags.is_empty() {
            let tags: Vec<_> = metadata.tags.into_iter().collect();
            values.insert(fields::TAGS.to_string(), tags.join("; "));
        }
        if let Some(user) = metadata.assigned_to {
            values.insert(fields::ASSIGNED_TO.to_string(), user);
        }
        Self {
            fields: values,
            comments: Vec::new(),
            links: BTreeSet::new(),
            days_inactive: metadata.days_inactive,
            reject_writes,
        }
    }

    fn metadata(&self) -> ItemMetadata {
        let field = |name: &str| self.fields.get(name).cloned().unwrap_or_default();
        let tags = self
            .fields
            .get(fields::TAGS)
            .map(|raw| {
                raw.split(';')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        ItemMetadata {
            state: field(fields::STATE),
            title: field(fields::TITLE),
            tags,
            days_inactive: self.days_inactive,
            assigned_to: self.fields.get(fields::ASSIGNED_TO).cloned(),
        }
    }
}

/// Fixture-backed tracker. Single-threaded: the serve loop owns it.
#[derive(Debug)]
pub struct FixtureBackend {
    items: RefCell<BTreeMap<WorkItemId, TrackedItem>>,
}

impl FixtureBackend {
    /// Build from already-parsed fixture items.
    ///
    /// # Errors
    ///
    /// Returns an error if two items share an id.
    pub fn from_items(items: Vec<FixtureItem>) -> Result<Self> {
        let mut tracked = BTreeMap::new();
        for item in items {
            let id = item.id;
            if tracked.insert(id, TrackedItem::from_fixture(item)).is_some() {
                bail!("duplicate work item {id} in fixture");
            }
        }
        Ok(Self {
            items: RefCell::new(tracked),
        })
    }

    /// Load a JSON array of [`FixtureItem`]s.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        let items: Vec<FixtureItem> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fixture {}", path.display()))?;
        debug!(path = %path.display(), items = items.len(), "fixture loaded");
        Self::from_items(items)
    }

    /// Run a "query": current metadata for `ids`, in the order given.
    /// Unknown ids are skipped.
    pub fn query(&self, ids: &[WorkItemId]) -> (Vec<WorkItemId>, Vec<(WorkItemId, ItemMetadata)>) {
        let items = self.items.borrow();
        let mut found = Vec::with_capacity(ids.len());
        let mut metadata = Vec::with_capacity(ids.len());
        for &id in ids {
            match items.get(&id) {
                Some(item) => {
                    found.push(id);
                    metadata.push((id, item.metadata()));
                }
                None => warn!(id, "query skipped unknown work item"),
            }
        }
        (found, metadata)
    }

    /// Comments posted to `id` so far.
    #[cfg(test)]
    pub fn comments(&self, id: WorkItemId) -> Vec<String> {
        self.items
            .borrow()
            .get(&id)
            .map(|item| item.comments.clone())
            .unwrap_or_default()
    }

    fn with_item<R>(
        &self,
        id: WorkItemId,
        write: bool,
        f: impl FnOnce(&mut TrackedItem) -> R,
    ) -> Result<R, MutationError> {
        let mut items = self.items.borrow_mut();
        let item = items.get_mut(&id).ok_or(MutationError::MissingItem { id })?;
        if write && item.reject_writes {
            return Err(MutationError::remote(format!(
                "TF401289: work item {id} rejected the update"
            )));
        }
        Ok(f(item))
    }
}

impl WorkItemBackend for FixtureBackend {
    fn field(&self, id: WorkItemId, name: &str) -> Result<Option<String>, MutationError> {
        self.with_item(id, false, |item| item.fields.get(name).cloned())
    }

    fn set_field(
        &self,
        id: WorkItemId,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), MutationError> {
        self.with_item(id, true, |item| match value {
            Some(value) => {
                item.fields.insert(name.to_string(), value.to_string());
            }
            None => {
                item.fields.remove(name);
            }
        })
    }

    fn add_comment(&self, id: WorkItemId, text: &str) -> Result<(), MutationError> {
        self.with_item(id, true, |item| item.comments.push(text.to_string()))
    }

    fn add_link(
        &self,
        id: WorkItemId,
        target: WorkItemId,
        link_type: &str,
    ) -> Result<(), MutationError> {
        if !self.items.borrow().contains_key(&target) {
            return Err(MutationError::MissingItem { id: target });
        }
        self.with_item(id, true, |item| {
            item.links.insert((target, link_type.to_string()));
        })
    }

    fn remove_link(
        &self,
        id: WorkItemId,
        target: WorkItemId,
        link_type: &str,
    ) -> Result<(), MutationError> {
        self.with_item(id, true, |item| {
            item.links.remove(&(target, link_type.to_string()));
        })
    }
}
