//! Per-match dirty tracking between snapshots.
//!
//! Each match accumulates a window of changes since its last snapshot:
//! entities added, entities removed, and mutated cells of still-live
//! entities. Each mutated cell records the value it had when the window
//! first touched it (the before-image), so a set/unset sequence that nets
//! back to the original value can be recognized and excluded from the delta.
//!
//! Reconciliation rule: an entity created and destroyed inside one window
//! leaves no trace at all -- not in `added`, not in `removed`, and none of
//! its cell records survive.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::component::ComponentId;
use crate::entity::{EntityId, MatchId};
use crate::pool::ABSENT;

// ---------------------------------------------------------------------------
// DirtyWindow
// ---------------------------------------------------------------------------

/// The accumulated change set of one match since its last snapshot.
#[derive(Debug, Clone, Default)]
pub struct DirtyWindow {
    /// Entities created in this window (and still live at the time of use).
    pub added: BTreeSet<EntityId>,
    /// Entities destroyed in this window that existed before it opened.
    pub removed: BTreeSet<EntityId>,
    /// Mutated cells of pre-existing, still-live entities, with the cell's
    /// value at the first mutation in the window ([`ABSENT`] if it was
    /// absent then).
    pub changed: BTreeMap<(EntityId, ComponentId), f64>,
}

impl DirtyWindow {
    /// Whether the window recorded nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// DirtyTracker
// ---------------------------------------------------------------------------

/// Tracks a [`DirtyWindow`] per match.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    windows: HashMap<MatchId, DirtyWindow>,
}

impl DirtyTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&mut self, match_id: MatchId) -> &mut DirtyWindow {
        self.windows.entry(match_id).or_default()
    }

    /// Record an entity created in `match_id`.
    pub fn record_added(&mut self, match_id: MatchId, entity: EntityId) {
        self.window(match_id).added.insert(entity);
    }

    /// Record an entity destroyed in `match_id`.
    ///
    /// If the entity was created inside the same window it vanishes entirely
    /// (reconciliation); otherwise it lands in `removed`. Either way its cell
    /// records are dropped -- removed entities report no changed cells.
    pub fn record_removed(&mut self, match_id: MatchId, entity: EntityId) {
        let window = self.window(match_id);
        let transient = window.added.remove(&entity);
        if !transient {
            window.removed.insert(entity);
        }
        window
            .changed
            .retain(|(changed_entity, _), _| *changed_entity != entity);
    }

    /// Record a cell mutation on a live entity in `match_id`.
    ///
    /// `before` is the cell value the write replaced ([`ABSENT`] when the
    /// cell was absent). Only the first mutation of a cell in a window keeps
    /// its before-image; later writes to the same cell leave it untouched so
    /// the window always compares against the pre-window value.
    ///
    /// Mutations on entities added inside this window are not recorded: a
    /// new entity's cells travel with its `added` membership, not as changes.
    pub fn record_changed(
        &mut self,
        match_id: MatchId,
        entity: EntityId,
        component: ComponentId,
        before: Option<f64>,
    ) {
        let window = self.window(match_id);
        if window.added.contains(&entity) {
            return;
        }
        window
            .changed
            .entry((entity, component))
            .or_insert(before.unwrap_or(ABSENT));
    }

    /// Take the accumulated window for a match, atomically opening a fresh
    /// empty one. Writers that run afterwards accumulate into the new window.
    pub fn take_for(&mut self, match_id: MatchId) -> DirtyWindow {
        self.windows.remove(&match_id).unwrap_or_default()
    }

    /// Drop a match's window without reading it (match deletion).
    pub fn discard(&mut self, match_id: MatchId) {
        self.windows.remove(&match_id);
    }

    /// Whether a match has any recorded changes.
    pub fn is_dirty(&self, match_id: MatchId) -> bool {
        self.windows
            .get(&match_id)
            .is_some_and(|w| !w.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
