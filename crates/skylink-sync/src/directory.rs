//! Entity directory: the client's table of server entities.
//!
//! Maps [`EntityId`] to the latest confirmed [`EntityState`], lifecycle, and
//! control flag. Create, control, and delete messages may arrive in any order;
//! every operation here is idempotent so no ordering is required.
//!
//! A deleted id stays retired, even after its entry has been purged, until a
//! create or control message for it arrives. Snapshots sent before the delete
//! can therefore not bring it back.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use skylink_net::{EntityId, EntityState};

use crate::history::Snapshot;

/// Whether an entry is live or waiting for the presentation layer to drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Active,
    /// Deleted by the server; kept until [`EntityDirectory::purge_removed`].
    PendingRemoval,
}

/// One directory row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityEntry {
    pub id: EntityId,
    /// Most recent server-confirmed state.
    pub latest_state: EntityState,
    /// Exactly one entry at most has this set.
    pub is_controlled: bool,
    pub lifecycle: Lifecycle,
    /// Archetype tag from the create message; empty for placeholders.
    pub kind: String,
    /// Display name from the create message; empty for placeholders.
    pub display_name: String,
}

impl EntityEntry {
    fn placeholder(id: EntityId, state: EntityState) -> Self {
        Self {
            id,
            latest_state: state,
            is_controlled: false,
            lifecycle: Lifecycle::Active,
            kind: String::new(),
            display_name: String::new(),
        }
    }

    /// Whether the entry is live.
    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }
}

/// Per-connection entity table.
#[derive(Debug, Default)]
pub struct EntityDirectory {
    entries: BTreeMap<EntityId, EntityEntry>,
    controlled: Option<EntityId>,
    retired: BTreeSet<EntityId>,
}

impl EntityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity from a create message.
    ///
    /// Reactivates an id that is pending removal, so ids can be reused.
    /// Keeps the control flag of a placeholder created by an earlier
    /// control message.
    pub fn create(&mut self, id: EntityId, state: EntityState, kind: &str, display_name: &str) {
        let entry = self
            .entries
            .entry(id)
            .or_insert_with(|| EntityEntry::placeholder(id, state));
        entry.latest_state = state;
        entry.lifecycle = Lifecycle::Active;
        entry.kind = kind.to_string();
        entry.display_name = display_name.to_string();
        self.retired.remove(&id);
        tracing::debug!(%id, kind, display_name, "Entity created");
    }

    /// Overwrites the state of `id`, creating an active entry if unknown.
    ///
    /// Returns `false` without changes when `id` has been deleted and not
    /// created again.
    pub fn upsert(&mut self, id: EntityId, state: EntityState) -> bool {
        if self.retired.contains(&id) {
            return false;
        }
        let entry = self
            .entries
            .entry(id)
            .or_insert_with(|| EntityEntry::placeholder(id, state));
        entry.latest_state = state;
        true
    }

    /// Upserts every state of a confirmed snapshot. Returns how many applied.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> usize {
        snapshot
            .states
            .iter()
            .filter(|(id, state)| self.upsert(**id, **state))
            .count()
    }

    /// Marks `id` pending removal. No-op for unknown or already removed ids.
    ///
    /// Returns `true` if the entry transitioned. Removing the controlled
    /// entity clears control.
    pub fn remove(&mut self, id: EntityId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if !entry.is_active() {
            return false;
        }
        entry.lifecycle = Lifecycle::PendingRemoval;
        if entry.is_controlled {
            entry.is_controlled = false;
            self.controlled = None;
        }
        self.retired.insert(id);
        tracing::debug!(%id, "Entity removed");
        true
    }

    /// Drops and returns every entry pending removal. Their ids stay retired.
    pub fn purge_removed(&mut self) -> Vec<EntityEntry> {
        let removed: Vec<EntityId> = self
            .entries
            .values()
            .filter(|e| !e.is_active())
            .map(|e| e.id)
            .collect();
        removed
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityEntry> {
        self.entries.get(&id)
    }

    /// Gives control to `id` alone, returning the previously controlled id.
    ///
    /// An unknown id gets an active placeholder at the default state; a
    /// pending-removal id is reactivated.
    pub fn set_controlled(&mut self, id: EntityId) -> Option<EntityId> {
        let previous = self.clear_controlled();
        let entry = self
            .entries
            .entry(id)
            .or_insert_with(|| EntityEntry::placeholder(id, EntityState::default()));
        entry.lifecycle = Lifecycle::Active;
        entry.is_controlled = true;
        self.controlled = Some(id);
        self.retired.remove(&id);
        previous
    }

    /// Removes the control flag, returning the id that held it.
    pub fn clear_controlled(&mut self) -> Option<EntityId> {
        let previous = self.controlled.take()?;
        if let Some(entry) = self.entries.get_mut(&previous) {
            entry.is_controlled = false;
        }
        Some(previous)
    }

    pub fn controlled(&self) -> Option<EntityId> {
        self.controlled
    }

    /// Whether `id` was deleted and has not been created again.
    pub fn is_retired(&self, id: EntityId) -> bool {
        self.retired.contains(&id)
    }

    /// Latest state of every active entity, used to seed a history reset.
    pub fn baseline(&self) -> BTreeMap<EntityId, EntityState> {
        self.entries
            .values()
            .filter(|e| e.is_active())
            .map(|e| (e.id, e.latest_state))
            .collect()
    }

    /// All entries in id order, including those pending removal.
    pub fn iter(&self) -> impl Iterator<Item = &EntityEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
