//! The store facade: pool + catalog + query cache + dirty tracking behind
//! one read/write API.
//!
//! Synchronization follows a single-writer/many-reader discipline. Readers
//! ([`StoreReader`]) share a `parking_lot` read lock and may run concurrently
//! with each other (snapshot reads, query lookups, `get`/`has`); a writer
//! ([`StoreWriter`]) holds the write lock exclusively -- the simulation
//! worker during a tick, or an out-of-tick administrative mutation such as a
//! direct match delete. The query cache sits beside the lock in its own
//! mutex because cache bookkeeping mutates on reads too; it is only ever
//! locked briefly while already holding the state lock.
//!
//! Every writer is tagged with the module it acts for. Writes consult the
//! target component's permission level: the owning module always passes,
//! `Write` components accept anyone, everything else is denied with no
//! version bump and no dirty entry.

use std::collections::BTreeSet;
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::component::{Catalog, ComponentDef, ComponentId, ModuleId, PermissionLevel};
use crate::dirty::{DirtyTracker, DirtyWindow};
use crate::entity::{EntityId, MatchId};
use crate::pool::ComponentPool;
use crate::query::{QueryCache, QueryKey, QueryStats};
use crate::StoreError;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct StoreState {
    pool: ComponentPool,
    catalog: Catalog,
    dirty: DirtyTracker,
    matches: BTreeSet<MatchId>,
    next_match: u32,
}

/// The single source of truth for one container's simulation state.
pub struct Store {
    state: RwLock<StoreState>,
    cache: Mutex<QueryCache>,
}

impl Store {
    /// Create a store holding only the built-in core catalog.
    pub fn new() -> Self {
        let catalog = Catalog::new();
        let pool = ComponentPool::new(catalog.column_count());
        Self {
            state: RwLock::new(StoreState {
                pool,
                catalog,
                dirty: DirtyTracker::new(),
                matches: BTreeSet::new(),
                next_match: 1,
            }),
            cache: Mutex::new(QueryCache::new()),
        }
    }

    /// Acquire shared read access. Blocks while a writer is active.
    pub fn read(&self) -> StoreReader<'_> {
        StoreReader {
            state: self.state.read(),
            cache: &self.cache,
        }
    }

    /// Acquire shared read access, giving up after `deadline`.
    ///
    /// Expiry fails with [`StoreError::Timeout`] without ever blocking the
    /// writer.
    pub fn read_with_deadline(&self, deadline: Duration) -> Result<StoreReader<'_>, StoreError> {
        self.state
            .try_read_for(deadline)
            .map(|state| StoreReader {
                state,
                cache: &self.cache,
            })
            .ok_or(StoreError::Timeout)
    }

    /// Acquire exclusive write access on behalf of `origin`.
    pub fn write(&self, origin: ModuleId) -> StoreWriter<'_> {
        StoreWriter {
            state: self.state.write(),
            cache: &self.cache,
            origin,
        }
    }

    /// Acquire exclusive write access, giving up after `deadline` with
    /// [`StoreError::Timeout`].
    pub fn write_with_deadline(
        &self,
        origin: ModuleId,
        deadline: Duration,
    ) -> Result<StoreWriter<'_>, StoreError> {
        self.state
            .try_write_for(deadline)
            .map(|state| StoreWriter {
                state,
                cache: &self.cache,
                origin,
            })
            .ok_or(StoreError::Timeout)
    }

    /// Cumulative query-cache statistics.
    pub fn query_stats(&self) -> QueryStats {
        self.cache.lock().stats()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Store")
            .field("entities", &state.pool.entity_count())
            .field("components", &state.catalog.active_count())
            .field("matches", &state.matches.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Shared read logic
// ---------------------------------------------------------------------------

fn read_query(
    state: &StoreState,
    cache: &Mutex<QueryCache>,
    components: &[ComponentId],
) -> Vec<EntityId> {
    let (result, _) = cache.lock().lookup(&state.pool, QueryKey::new(components));
    result
}

fn read_entities_in_match(state: &StoreState, match_id: MatchId) -> Vec<EntityId> {
    let column = state.catalog.match_id_column();
    let wanted = match_id.to_cell();
    let mut entities: Vec<EntityId> = state
        .pool
        .column_entries(column)
        .filter(|(_, cell)| *cell == wanted)
        .map(|(entity, _)| entity)
        .collect();
    entities.sort_unstable();
    entities
}

fn read_match_of(state: &StoreState, entity: EntityId) -> Result<MatchId, StoreError> {
    let cell = state
        .pool
        .get(entity, state.catalog.match_id_column())?
        .ok_or(StoreError::UnknownEntity { entity })?;
    MatchId::from_cell(cell)
}

// ---------------------------------------------------------------------------
// StoreReader
// ---------------------------------------------------------------------------

/// Shared read access to the store.
pub struct StoreReader<'a> {
    state: RwLockReadGuard<'a, StoreState>,
    cache: &'a Mutex<QueryCache>,
}

impl StoreReader<'_> {
    /// The component catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.state.catalog
    }

    /// Resolve a component name to its id.
    pub fn lookup(&self, name: &str) -> Result<ComponentId, StoreError> {
        self.state
            .catalog
            .lookup(name)
            .ok_or_else(|| StoreError::UnknownComponent {
                name: name.to_owned(),
            })
    }

    /// Read a cell, `None` if absent.
    pub fn get(&self, entity: EntityId, component: ComponentId) -> Result<Option<f64>, StoreError> {
        self.state.pool.get(entity, component)
    }

    /// Whether the entity has the component.
    pub fn has(&self, entity: EntityId, component: ComponentId) -> Result<bool, StoreError> {
        self.state.pool.has(entity, component)
    }

    /// Number of entities carrying `component`.
    pub fn count(&self, component: ComponentId) -> u64 {
        self.state.pool.count(component)
    }

    /// Current version of a component column.
    pub fn version(&self, component: ComponentId) -> u64 {
        self.state.pool.version(component)
    }

    /// Whether `entity` is live.
    pub fn contains(&self, entity: EntityId) -> bool {
        self.state.pool.contains(entity)
    }

    /// Entities that have every component in `components`, ascending by id.
    pub fn query(&self, components: &[ComponentId]) -> Vec<EntityId> {
        read_query(&self.state, self.cache, components)
    }

    /// Entities belonging to a match, ascending by id.
    pub fn entities_in_match(&self, match_id: MatchId) -> Vec<EntityId> {
        read_entities_in_match(&self.state, match_id)
    }

    /// The match an entity belongs to.
    pub fn match_of(&self, entity: EntityId) -> Result<MatchId, StoreError> {
        read_match_of(&self.state, entity)
    }

    /// Whether a match exists.
    pub fn match_exists(&self, match_id: MatchId) -> bool {
        self.state.matches.contains(&match_id)
    }

    /// All live matches, ascending.
    pub fn matches(&self) -> Vec<MatchId> {
        self.state.matches.iter().copied().collect()
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.state.pool.entity_count()
    }
}

// ---------------------------------------------------------------------------
// StoreWriter
// ---------------------------------------------------------------------------

/// Exclusive write access to the store, tagged with the acting module.
pub struct StoreWriter<'a> {
    state: RwLockWriteGuard<'a, StoreState>,
    cache: &'a Mutex<QueryCache>,
    origin: ModuleId,
}

impl StoreWriter<'_> {
    /// The module this writer acts for.
    pub fn origin(&self) -> ModuleId {
        self.origin
    }

    /// Re-tag the writer. The tick worker does this between systems so each
    /// system writes under its own module's identity.
    pub fn set_origin(&mut self, origin: ModuleId) {
        self.origin = origin;
    }

    fn check_write(&self, component: ComponentId) -> Result<&ComponentDef, StoreError> {
        let def = self
            .state
            .catalog
            .def(component)
            .filter(|d| !d.retired)
            .ok_or_else(|| StoreError::UnknownComponent {
                name: format!("component #{}", component.to_raw()),
            })?;
        if def.module == self.origin || def.permission == PermissionLevel::Write {
            Ok(def)
        } else {
            Err(StoreError::PermissionDenied {
                component: def.name.clone(),
                module: self
                    .state
                    .catalog
                    .module_name(self.origin)
                    .unwrap_or("<unregistered>")
                    .to_owned(),
            })
        }
    }

    // -- matches ------------------------------------------------------------

    /// Create a new match.
    pub fn create_match(&mut self) -> MatchId {
        let match_id = MatchId::from_raw(self.state.next_match);
        self.state.next_match += 1;
        self.state.matches.insert(match_id);
        tracing::debug!(%match_id, "match created");
        match_id
    }

    /// Delete a match, destroying every entity that belongs to it. Returns
    /// the destroyed entities.
    pub fn delete_match(&mut self, match_id: MatchId) -> Result<Vec<EntityId>, StoreError> {
        if !self.state.matches.remove(&match_id) {
            return Err(StoreError::UnknownMatch { match_id });
        }
        let entities = read_entities_in_match(&self.state, match_id);
        for &entity in &entities {
            self.state.pool.destroy_entity(entity)?;
        }
        self.state.dirty.discard(match_id);
        tracing::debug!(%match_id, destroyed = entities.len(), "match deleted");
        Ok(entities)
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Spawn an entity into a match.
    pub fn spawn(&mut self, match_id: MatchId) -> Result<EntityId, StoreError> {
        if !self.state.matches.contains(&match_id) {
            return Err(StoreError::UnknownMatch { match_id });
        }
        let entity = self.state.pool.create_entity();
        let column = self.state.catalog.match_id_column();
        self.state.pool.set(entity, column, match_id.to_cell())?;
        self.state.dirty.record_added(match_id, entity);
        Ok(entity)
    }

    /// Destroy an entity.
    pub fn despawn(&mut self, entity: EntityId) -> Result<(), StoreError> {
        let match_id = read_match_of(&self.state, entity)?;
        self.state.pool.destroy_entity(entity)?;
        self.state.dirty.record_removed(match_id, entity);
        Ok(())
    }

    // -- cell access --------------------------------------------------------

    /// Write a cell, enforcing the component's permission level. A denied or
    /// invalid write changes nothing: no version bump, no dirty entry.
    pub fn set(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        value: f64,
    ) -> Result<(), StoreError> {
        self.check_write(component)?;
        let match_id = read_match_of(&self.state, entity)?;
        let before = self.state.pool.set(entity, component, value)?;
        if before != Some(value) {
            self.state
                .dirty
                .record_changed(match_id, entity, component, before);
        }
        Ok(())
    }

    /// Clear a cell, enforcing permissions. Clearing an absent cell is a
    /// no-op (no version bump, no dirty entry).
    pub fn unset(&mut self, entity: EntityId, component: ComponentId) -> Result<(), StoreError> {
        self.check_write(component)?;
        let match_id = read_match_of(&self.state, entity)?;
        if let Some(before) = self.state.pool.unset(entity, component)? {
            self.state
                .dirty
                .record_changed(match_id, entity, component, Some(before));
        }
        Ok(())
    }

    // -- reads through the writer (systems read and write in one pass) ------

    /// Read a cell, `None` if absent.
    pub fn get(&self, entity: EntityId, component: ComponentId) -> Result<Option<f64>, StoreError> {
        self.state.pool.get(entity, component)
    }

    /// Whether the entity has the component.
    pub fn has(&self, entity: EntityId, component: ComponentId) -> Result<bool, StoreError> {
        self.state.pool.has(entity, component)
    }

    /// Number of entities carrying `component`.
    pub fn count(&self, component: ComponentId) -> u64 {
        self.state.pool.count(component)
    }

    /// Current version of a component column.
    pub fn version(&self, component: ComponentId) -> u64 {
        self.state.pool.version(component)
    }

    /// Resolve a component name to its id.
    pub fn lookup(&self, name: &str) -> Result<ComponentId, StoreError> {
        self.state
            .catalog
            .lookup(name)
            .ok_or_else(|| StoreError::UnknownComponent {
                name: name.to_owned(),
            })
    }

    /// The component catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.state.catalog
    }

    /// Entities that have every component in `components`, ascending by id.
    pub fn query(&self, components: &[ComponentId]) -> Vec<EntityId> {
        read_query(&self.state, self.cache, components)
    }

    /// Entities belonging to a match, ascending by id.
    pub fn entities_in_match(&self, match_id: MatchId) -> Vec<EntityId> {
        read_entities_in_match(&self.state, match_id)
    }

    /// The match an entity belongs to.
    pub fn match_of(&self, entity: EntityId) -> Result<MatchId, StoreError> {
        read_match_of(&self.state, entity)
    }

    /// Whether a match exists.
    pub fn match_exists(&self, match_id: MatchId) -> bool {
        self.state.matches.contains(&match_id)
    }

    /// All live matches, ascending.
    pub fn matches(&self) -> Vec<MatchId> {
        self.state.matches.iter().copied().collect()
    }

    /// Whether `entity` is live.
    pub fn contains(&self, entity: EntityId) -> bool {
        self.state.pool.contains(entity)
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.state.pool.entity_count()
    }

    /// Rows currently occupied.
    pub fn rows_in_use(&self) -> usize {
        self.state.pool.rows_in_use()
    }

    /// Total rows ever allocated. Never shrinks.
    pub fn rows_total(&self) -> usize {
        self.state.pool.rows_total()
    }

    // -- registration & reload ----------------------------------------------

    /// Intern a module name.
    pub fn register_module(&mut self, name: &str) -> ModuleId {
        self.state.catalog.register_module(name)
    }

    /// Register a component, appending a column if the name is new.
    pub fn register_component(
        &mut self,
        module: ModuleId,
        name: &str,
        permission: PermissionLevel,
    ) -> ComponentId {
        let before = self.state.catalog.column_count();
        let id = self.state.catalog.register(module, name, permission);
        if self.state.catalog.column_count() > before {
            let column = self.state.pool.add_column();
            debug_assert_eq!(column, id);
        }
        id
    }

    /// Swap in a rebuilt catalog: sweep the cells of components that
    /// disappeared, append columns for new ones.
    ///
    /// The caller (the module registry) validates the declaration set and
    /// builds `next` via [`Catalog::rebuild`]; this method only applies the
    /// storage consequences, so a validation failure never touches the store.
    pub fn apply_reload(&mut self, next: Catalog, swept: Vec<ComponentId>) {
        for component in &swept {
            self.state.pool.sweep_column(*component);
        }
        while self.state.pool.width() < next.column_count() {
            self.state.pool.add_column();
        }
        tracing::debug!(
            swept = swept.len(),
            components = next.active_count(),
            "catalog reloaded"
        );
        self.state.catalog = next;
    }

    // -- dirty windows ------------------------------------------------------

    /// Take a match's dirty window, opening a fresh one.
    pub fn take_dirty(&mut self, match_id: MatchId) -> DirtyWindow {
        self.state.dirty.take_for(match_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
