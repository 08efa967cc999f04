//! Full and delta snapshots of a match's state.
//!
//! A full snapshot is columnar: the match's entities sorted by id, and for
//! every module (in registration order) every component column aligned to
//! that entity order, absent cells serialized as explicit nulls. Full
//! snapshots carry a BLAKE3 content hash for integrity checks and cross-run
//! determinism testing.
//!
//! A delta carries the net changes since the previous snapshot of the same
//! match: entities added, entities removed, and a sparse map of changed
//! cells holding their current values. Snapshot boundaries are exactly the
//! dirty-window boundaries -- taking either kind of snapshot drains the
//! match's window and starts the next one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use squall_ecs::component::{ComponentId, ModuleId};
use squall_ecs::entity::{EntityId, MatchId};
use squall_ecs::pool::is_absent;
use squall_ecs::store::{Store, StoreWriter};
use squall_ecs::StoreError;

use crate::EngineError;

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

/// Which snapshot kind the tick worker emits per match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// Emit a complete columnar snapshot every tick.
    Full,
    /// Emit the net changes since the previous snapshot every tick.
    Delta,
}

/// One component column, aligned to the snapshot's entity order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentColumn {
    /// Component name.
    pub name: String,
    /// One value per entity; `None` (JSON null) keeps absent cells aligned.
    pub values: Vec<Option<f64>>,
}

/// All columns contributed by one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleData {
    /// Module name.
    pub module: String,
    /// Columns in component registration order.
    pub components: Vec<ComponentColumn>,
}

/// A complete columnar snapshot of one match at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSnapshot {
    /// The snapshotted match.
    pub match_id: MatchId,
    /// End-of-tick the state was read at.
    pub tick: u64,
    /// The match's entities, ascending by id. Columns align to this order.
    pub entities: Vec<EntityId>,
    /// Component columns grouped by module, in module registration order.
    pub data: Vec<ModuleData>,
    /// BLAKE3 hex digest of the document (computed with this field empty).
    pub state_hash: String,
}

impl FullSnapshot {
    /// Recompute the content hash (the digest of the document with
    /// `state_hash` blanked).
    pub fn compute_hash(&self) -> String {
        let mut unhashed = self.clone();
        unhashed.state_hash = String::new();
        let bytes = serde_json::to_vec(&unhashed).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }

    /// The column for `(module, component)`, if present.
    pub fn column(&self, module: &str, component: &str) -> Option<&ComponentColumn> {
        self.data
            .iter()
            .find(|m| m.module == module)?
            .components
            .iter()
            .find(|c| c.name == component)
    }

    /// The value of one entity's cell in this snapshot.
    pub fn cell(&self, module: &str, component: &str, entity: EntityId) -> Option<f64> {
        let row = self.entities.iter().position(|&e| e == entity)?;
        self.column(module, component)?.values.get(row).copied()?
    }
}

/// Sparse changed cells of one component: entity id to current value
/// (`None` when the net change removed the component from the entity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentChanges {
    /// Component name.
    pub name: String,
    /// Changed entities and their values at the delta's end tick.
    pub values: BTreeMap<EntityId, Option<f64>>,
}

/// Changed components contributed by one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleChanges {
    /// Module name.
    pub module: String,
    /// Changed components in registration order.
    pub components: Vec<ComponentChanges>,
}

/// The net difference between two snapshot boundaries of one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaSnapshot {
    /// The match the delta describes.
    pub match_id: MatchId,
    /// The tick of the previous snapshot (start of the window).
    pub from_tick: u64,
    /// The tick this delta was taken at (end of the window).
    pub to_tick: u64,
    /// Entities created in the window and still live, ascending.
    pub added_entities: Vec<EntityId>,
    /// Entities destroyed in the window that predate it, ascending.
    pub removed_entities: Vec<EntityId>,
    /// Net-changed cells of surviving entities, grouped by module.
    pub changed_components: Vec<ModuleChanges>,
    /// `|added| + |removed| + number of net-changed cells`.
    pub change_count: u64,
    /// `change_count` over the match's full-snapshot cell count; purely
    /// informational.
    pub compression_ratio: f64,
}

/// A snapshot of either kind, as handed to listeners and the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SnapshotPayload {
    /// A complete columnar snapshot.
    Full(FullSnapshot),
    /// A net-change delta.
    Delta(DeltaSnapshot),
}

impl SnapshotPayload {
    /// The match the payload describes.
    pub fn match_id(&self) -> MatchId {
        match self {
            SnapshotPayload::Full(s) => s.match_id,
            SnapshotPayload::Delta(d) => d.match_id,
        }
    }

    /// The tick the payload was taken at.
    pub fn tick(&self) -> u64 {
        match self {
            SnapshotPayload::Full(s) => s.tick,
            SnapshotPayload::Delta(d) => d.to_tick,
        }
    }

    /// The self-describing wire form (JSON bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Snapshotter
// ---------------------------------------------------------------------------

/// Produces full and delta snapshots for a container's matches.
///
/// Tracks the window-start tick per match so a delta request can be checked
/// against the boundary the dirty window actually opened at.
pub struct Snapshotter {
    store: Arc<Store>,
    windows: Mutex<HashMap<MatchId, u64>>,
}

impl Snapshotter {
    /// Create a snapshotter over `store`.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Take a full snapshot of `match_id` at `tick`.
    ///
    /// Resets the match's dirty window: the next delta starts here.
    pub fn full(&self, match_id: MatchId, tick: u64) -> Result<FullSnapshot, EngineError> {
        let mut w = self.store.write(ModuleId::CORE);
        self.full_with(&mut w, match_id, tick)
    }

    /// Like [`full`](Self::full) but gives up on lock acquisition after
    /// `deadline` with `Timeout`, never blocking an active writer.
    pub fn full_bounded(
        &self,
        match_id: MatchId,
        tick: u64,
        deadline: Duration,
    ) -> Result<FullSnapshot, EngineError> {
        let mut w = self.store.write_with_deadline(ModuleId::CORE, deadline)?;
        self.full_with(&mut w, match_id, tick)
    }

    /// Full snapshot through an already-held writer (the tick worker's
    /// end-of-tick emission path).
    pub fn full_with(
        &self,
        w: &mut StoreWriter<'_>,
        match_id: MatchId,
        tick: u64,
    ) -> Result<FullSnapshot, EngineError> {
        if !w.match_exists(match_id) {
            return Err(StoreError::UnknownMatch { match_id }.into());
        }
        let entities = w.entities_in_match(match_id);

        let catalog = w.catalog();
        let mut data = Vec::new();
        for (module_id, module_name) in catalog.modules() {
            let mut components = Vec::new();
            for def in catalog.components_of(module_id) {
                let values: Vec<Option<f64>> = entities
                    .iter()
                    .map(|&entity| w.get(entity, def.id).unwrap_or(None))
                    .collect();
                components.push(ComponentColumn {
                    name: def.name.clone(),
                    values,
                });
            }
            if !components.is_empty() {
                data.push(ModuleData {
                    module: module_name.to_owned(),
                    components,
                });
            }
        }

        let mut snapshot = FullSnapshot {
            match_id,
            tick,
            entities,
            data,
            state_hash: String::new(),
        };
        snapshot.state_hash = snapshot.compute_hash();

        // The snapshot is the new baseline: drain the window.
        let _ = w.take_dirty(match_id);
        self.windows.lock().insert(match_id, tick);
        Ok(snapshot)
    }

    /// Take the delta of `match_id` from `from_tick` to `to_tick`.
    ///
    /// `from_tick` must equal the boundary the match's window actually
    /// opened at (its last snapshot tick, or 0 if none was ever taken).
    pub fn delta(
        &self,
        match_id: MatchId,
        from_tick: u64,
        to_tick: u64,
    ) -> Result<DeltaSnapshot, EngineError> {
        let mut w = self.store.write(ModuleId::CORE);
        self.delta_with(&mut w, match_id, from_tick, to_tick)
    }

    /// Like [`delta`](Self::delta) with a bounded lock acquisition.
    pub fn delta_bounded(
        &self,
        match_id: MatchId,
        from_tick: u64,
        to_tick: u64,
        deadline: Duration,
    ) -> Result<DeltaSnapshot, EngineError> {
        let mut w = self.store.write_with_deadline(ModuleId::CORE, deadline)?;
        self.delta_with(&mut w, match_id, from_tick, to_tick)
    }

    /// Delta through an already-held writer.
    pub fn delta_with(
        &self,
        w: &mut StoreWriter<'_>,
        match_id: MatchId,
        from_tick: u64,
        to_tick: u64,
    ) -> Result<DeltaSnapshot, EngineError> {
        if !w.match_exists(match_id) {
            return Err(StoreError::UnknownMatch { match_id }.into());
        }
        let recorded = *self.windows.lock().entry(match_id).or_insert(0);
        if from_tick != recorded {
            return Err(EngineError::DeltaWindow {
                match_id,
                recorded,
                requested: from_tick,
            });
        }

        let window = w.take_dirty(match_id);
        let catalog = w.catalog();

        // Net-change filter: a cell whose current value equals its
        // before-image (including absent == absent) toggled back and is
        // excluded. Cells of components retired by a reload are dropped too.
        let mut changed: BTreeMap<(EntityId, ComponentId), Option<f64>> = BTreeMap::new();
        for ((entity, component), before) in window.changed {
            if !catalog.def(component).is_some_and(|d| !d.retired) {
                continue;
            }
            let current = w.get(entity, component)?;
            let before = if is_absent(before) { None } else { Some(before) };
            if before != current {
                changed.insert((entity, component), current);
            }
        }

        let mut changed_components = Vec::new();
        for (module_id, module_name) in catalog.modules() {
            let mut components = Vec::new();
            for def in catalog.components_of(module_id) {
                let values: BTreeMap<EntityId, Option<f64>> = changed
                    .iter()
                    .filter(|((_, component), _)| *component == def.id)
                    .map(|((entity, _), value)| (*entity, *value))
                    .collect();
                if !values.is_empty() {
                    components.push(ComponentChanges {
                        name: def.name.clone(),
                        values,
                    });
                }
            }
            if !components.is_empty() {
                changed_components.push(ModuleChanges {
                    module: module_name.to_owned(),
                    components,
                });
            }
        }

        let change_count =
            (window.added.len() + window.removed.len() + changed.len()) as u64;
        let full_cells =
            w.entities_in_match(match_id).len() as f64 * catalog.active_count() as f64;
        let compression_ratio = if full_cells > 0.0 {
            change_count as f64 / full_cells
        } else {
            0.0
        };

        self.windows.lock().insert(match_id, to_tick);
        Ok(DeltaSnapshot {
            match_id,
            from_tick,
            to_tick,
            added_entities: window.added.into_iter().collect(),
            removed_entities: window.removed.into_iter().collect(),
            changed_components,
            change_count,
            compression_ratio,
        })
    }

    /// Forget a match's window (match deleted).
    pub fn forget(&self, match_id: MatchId) {
        self.windows.lock().remove(&match_id);
    }

    /// The tick a match's current window opened at.
    pub fn window_start(&self, match_id: MatchId) -> u64 {
        self.windows.lock().get(&match_id).copied().unwrap_or(0)
    }
}

impl std::fmt::Debug for Snapshotter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshotter")
            .field("tracked_matches", &self.windows.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use squall_ecs::prelude::*;

    fn setup() -> (Arc<Store>, Snapshotter, MatchId, [ComponentId; 2]) {
        let store = Arc::new(Store::new());
        let mut w = store.write(ModuleId::CORE);
        let game = w.register_module("game");
        let px = w.register_component(game, "POSITION_X", PermissionLevel::Write);
        let hp = w.register_component(game, "HP", PermissionLevel::Write);
        let m = w.create_match();
        drop(w);
        let snapshotter = Snapshotter::new(Arc::clone(&store));
        (store, snapshotter, m, [px, hp])
    }

    #[test]
    fn full_snapshot_is_columnar_and_sorted() {
        let (store, snapshotter, m, [px, hp]) = setup();
        let mut w = store.write(ModuleId::CORE);
        let e1 = w.spawn(m).unwrap();
        let e2 = w.spawn(m).unwrap();
        w.set(e1, px, 1.0).unwrap();
        w.set(e2, px, 2.0).unwrap();
        w.set(e2, hp, 50.0).unwrap();
        drop(w);

        let snapshot = snapshotter.full(m, 10).unwrap();
        assert_eq!(snapshot.entities, vec![e1, e2]);
        assert_eq!(snapshot.tick, 10);

        let px_column = snapshot.column("game", "POSITION_X").unwrap();
        assert_eq!(px_column.values, vec![Some(1.0), Some(2.0)]);
        // Absent cells serialize as nulls to keep alignment.
        let hp_column = snapshot.column("game", "HP").unwrap();
        assert_eq!(hp_column.values, vec![None, Some(50.0)]);
        // The core module's MATCH_ID column is present too.
        let match_column = snapshot.column("core", MATCH_ID).unwrap();
        assert_eq!(
            match_column.values,
            vec![Some(m.to_cell()), Some(m.to_cell())]
        );
        assert!(!snapshot.state_hash.is_empty());
        assert_eq!(snapshot.state_hash, snapshot.compute_hash());
    }

    #[test]
    fn identical_states_hash_identically() {
        let (store_a, snap_a, m_a, [px_a, _]) = setup();
        let (store_b, snap_b, m_b, [px_b, _]) = setup();

        for (store, m, px) in [(&store_a, m_a, px_a), (&store_b, m_b, px_b)] {
            let mut w = store.write(ModuleId::CORE);
            let e = w.spawn(m).unwrap();
            w.set(e, px, 3.25).unwrap();
        }

        let a = snap_a.full(m_a, 5).unwrap();
        let b = snap_b.full(m_b, 5).unwrap();
        assert_eq!(a.state_hash, b.state_hash);
    }

    #[test]
    fn delta_reports_net_changes_only() {
        let (store, snapshotter, m, [px, _]) = setup();
        let mut w = store.write(ModuleId::CORE);
        let e41 = w.spawn(m).unwrap();
        let e42 = w.spawn(m).unwrap();
        let e43 = w.spawn(m).unwrap();
        w.set(e42, px, 100.0).unwrap();
        w.set(e43, px, 100.0).unwrap();
        drop(w);

        // Baseline at tick 100.
        snapshotter.full(m, 100).unwrap();

        let mut w = store.write(ModuleId::CORE);
        let e44 = w.spawn(m).unwrap();
        let e45 = w.spawn(m).unwrap();
        w.despawn(e41).unwrap();
        w.set(e42, px, 150.0).unwrap();
        w.set(e43, px, 200.0).unwrap();
        drop(w);

        let delta = snapshotter.delta(m, 100, 105).unwrap();
        assert_eq!(delta.added_entities, vec![e44, e45]);
        assert_eq!(delta.removed_entities, vec![e41]);
        assert_eq!(delta.change_count, 5);

        let changes = &delta.changed_components[0];
        assert_eq!(changes.module, "game");
        assert_eq!(changes.components.len(), 1);
        let px_changes = &changes.components[0];
        assert_eq!(px_changes.name, "POSITION_X");
        assert_eq!(px_changes.values[&e42], Some(150.0));
        assert_eq!(px_changes.values[&e43], Some(200.0));
    }

    #[test]
    fn transient_entity_leaves_no_trace() {
        let (store, snapshotter, m, [px, _]) = setup();
        snapshotter.full(m, 100).unwrap();

        let mut w = store.write(ModuleId::CORE);
        let e99 = w.spawn(m).unwrap();
        w.set(e99, px, 5.0).unwrap();
        w.despawn(e99).unwrap();
        drop(w);

        let delta = snapshotter.delta(m, 100, 101).unwrap();
        assert!(delta.added_entities.is_empty());
        assert!(delta.removed_entities.is_empty());
        assert!(delta.changed_components.is_empty());
        assert_eq!(delta.change_count, 0);
    }

    #[test]
    fn toggle_back_to_prior_value_is_excluded() {
        let (store, snapshotter, m, [px, hp]) = setup();
        let mut w = store.write(ModuleId::CORE);
        let e = w.spawn(m).unwrap();
        w.set(e, px, 10.0).unwrap();
        drop(w);
        snapshotter.full(m, 100).unwrap();

        let mut w = store.write(ModuleId::CORE);
        // px: away and back again -- nets to no change.
        w.set(e, px, 99.0).unwrap();
        w.set(e, px, 10.0).unwrap();
        // hp: set then unset on an originally-absent cell -- nets to absent.
        w.set(e, hp, 1.0).unwrap();
        w.unset(e, hp).unwrap();
        drop(w);

        let delta = snapshotter.delta(m, 100, 101).unwrap();
        assert_eq!(delta.change_count, 0);
        assert!(delta.changed_components.is_empty());
    }

    #[test]
    fn net_unset_appears_as_null_value() {
        let (store, snapshotter, m, [px, _]) = setup();
        let mut w = store.write(ModuleId::CORE);
        let e = w.spawn(m).unwrap();
        w.set(e, px, 10.0).unwrap();
        drop(w);
        snapshotter.full(m, 100).unwrap();

        let mut w = store.write(ModuleId::CORE);
        w.unset(e, px).unwrap();
        drop(w);

        let delta = snapshotter.delta(m, 100, 101).unwrap();
        assert_eq!(delta.change_count, 1);
        let values = &delta.changed_components[0].components[0].values;
        assert_eq!(values[&e], None);
    }

    #[test]
    fn delta_window_boundary_is_enforced() {
        let (_, snapshotter, m, _) = setup();
        snapshotter.full(m, 100).unwrap();
        let err = snapshotter.delta(m, 90, 105).unwrap_err();
        assert!(matches!(err, EngineError::DeltaWindow { recorded: 100, .. }));
    }

    #[test]
    fn consecutive_deltas_chain_their_windows() {
        let (store, snapshotter, m, [px, _]) = setup();
        let mut w = store.write(ModuleId::CORE);
        let e = w.spawn(m).unwrap();
        drop(w);
        snapshotter.full(m, 10).unwrap();

        let mut w = store.write(ModuleId::CORE);
        w.set(e, px, 1.0).unwrap();
        drop(w);
        let d1 = snapshotter.delta(m, 10, 20).unwrap();
        assert_eq!(d1.change_count, 1);

        let mut w = store.write(ModuleId::CORE);
        w.set(e, px, 2.0).unwrap();
        drop(w);
        let d2 = snapshotter.delta(m, 20, 30).unwrap();
        assert_eq!(d2.from_tick, 20);
        assert_eq!(d2.change_count, 1);
    }

    #[test]
    fn applying_delta_onto_full_reproduces_full() {
        let (store, snapshotter, m, [px, hp]) = setup();
        let mut w = store.write(ModuleId::CORE);
        let e1 = w.spawn(m).unwrap();
        let e2 = w.spawn(m).unwrap();
        w.set(e1, px, 1.0).unwrap();
        w.set(e2, px, 2.0).unwrap();
        w.set(e2, hp, 9.0).unwrap();
        drop(w);

        let before = snapshotter.full(m, 1).unwrap();

        let mut w = store.write(ModuleId::CORE);
        w.set(e1, px, 11.0).unwrap();
        w.unset(e2, hp).unwrap();
        drop(w);

        let delta = snapshotter.delta(m, 1, 2).unwrap();
        // A fresh full over the same entities must agree with before+delta
        // on every surviving cell.
        let window_reset = snapshotter.delta(m, 2, 2).unwrap();
        assert_eq!(window_reset.change_count, 0);
        let after = snapshotter.full(m, 2).unwrap();

        for module in &after.data {
            for column in &module.components {
                for (row, &entity) in after.entities.iter().enumerate() {
                    let expected = column.values[row];
                    // Start from the old full value, overlay the delta.
                    let mut value = before.cell(&module.module, &column.name, entity);
                    if let Some(changes) = delta
                        .changed_components
                        .iter()
                        .find(|mc| mc.module == module.module)
                        .and_then(|mc| mc.components.iter().find(|c| c.name == column.name))
                    {
                        if let Some(&new_value) = changes.values.get(&entity) {
                            value = new_value;
                        }
                    }
                    assert_eq!(value, expected, "cell {}/{}", module.module, column.name);
                }
            }
        }
    }

}
