//! The execution container: one isolated simulation runtime.
//!
//! A container owns one store, one command queue, one module registry, and
//! one tick worker, and exposes the whole surface through fluent operation
//! scopes (`matches()`, `ticks()`, `commands()`, `snapshots()`, `players()`,
//! `resources()`). Containers share nothing mutable with each other.
//!
//! Lifecycle:
//!
//! ```text
//! Created -> Starting -> Running <-> Paused -> Stopping -> Stopped
//! ```
//!
//! plus the fault-held `Faulted` state a system failure forces; a fault-held
//! container accepts only `stop()`. Illegal transitions fail with
//! `InvalidState` and leave the state unchanged.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde_json::json;

use squall_ecs::component::{ModuleId, PermissionLevel};
use squall_ecs::entity::{EntityId, MatchId};
use squall_ecs::store::Store;
use squall_ecs::StoreError;

use crate::command::{CommandFault, CommandQueue, CommandSchema, ParamSpec, ParamType};
use crate::listener::{ListenerHub, TickListener};
use crate::module::{ModuleDescriptor, ModuleRegistry};
use crate::registry::ContainerId;
use crate::sink::{SinkQueue, SnapshotSink};
use crate::snapshot::{DeltaSnapshot, FullSnapshot, SnapshotMode, Snapshotter};
use crate::tick::{TickContext, TickController};
use crate::{CommandError, EngineError};

// ---------------------------------------------------------------------------
// Built-in core module
// ---------------------------------------------------------------------------

/// Component: the numeric kind of a spawned entity.
pub const ENTITY_TYPE: &str = "ENTITY_TYPE";
/// Component: the player a game entity belongs to.
pub const OWNER_ID: &str = "OWNER_ID";
/// Component: marks a player roster entity and holds its player id.
pub const PLAYER_ID: &str = "PLAYER_ID";
/// Component: the kind of a per-match resource entity.
pub const RESOURCE_KIND: &str = "RESOURCE_KIND";
/// Component: the amount held by a resource entity.
pub const RESOURCE_AMOUNT: &str = "RESOURCE_AMOUNT";

/// The built-in module every container installs first: baseline components
/// plus `spawn`/`destroy` commands so a bare container is usable end to end.
fn core_module() -> ModuleDescriptor {
    ModuleDescriptor::new("core")
        .component(ENTITY_TYPE, PermissionLevel::Write)
        .component(OWNER_ID, PermissionLevel::Write)
        .component(PLAYER_ID, PermissionLevel::Read)
        .component(RESOURCE_KIND, PermissionLevel::Read)
        .component(RESOURCE_AMOUNT, PermissionLevel::Write)
        .command(
            "spawn",
            CommandSchema::new()
                .param(ParamSpec::required("matchId", ParamType::Entity))
                .param(ParamSpec::required("entityType", ParamType::Int))
                .param(ParamSpec::optional("playerId", ParamType::Int, json!(0))),
            |w, _tick, args| {
                let match_id = args
                    .get_match("matchId")
                    .ok_or_else(|| CommandError::new("matchId out of range"))?;
                let entity_type = args
                    .get_i64("entityType")
                    .ok_or_else(|| CommandError::new("entityType missing"))?;
                let player_id = args.get_i64("playerId").unwrap_or(0);

                let entity = w.spawn(match_id)?;
                let type_column = w.lookup(ENTITY_TYPE)?;
                let owner_column = w.lookup(OWNER_ID)?;
                w.set(entity, type_column, entity_type as f64)?;
                w.set(entity, owner_column, player_id as f64)?;
                Ok(())
            },
        )
        .command(
            "destroy",
            CommandSchema::new().param(ParamSpec::required("entityId", ParamType::Entity)),
            |w, _tick, args| {
                let entity = args
                    .get_entity("entityId")
                    .ok_or_else(|| CommandError::new("entityId missing"))?;
                w.despawn(entity)?;
                Ok(())
            },
        )
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle states of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Built, not yet started.
    Created,
    /// `start()` in progress.
    Starting,
    /// Ticking (manually or on the auto cadence).
    Running,
    /// Auto-advance halted; state retained.
    Paused,
    /// `stop()` in progress.
    Stopping,
    /// Workers joined, matches dropped. Terminal.
    Stopped,
    /// A system failed; only `stop()` is accepted.
    Faulted,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::Created => "created",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
            ContainerState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables of one container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Emit a snapshot for every match at the end of every tick.
    pub snapshot_on_tick: Option<SnapshotMode>,
    /// Command-error ring size.
    pub command_fault_capacity: usize,
    /// Undelivered tick-event bound.
    pub listener_queue_capacity: usize,
    /// Undelivered snapshot-bytes bound.
    pub sink_queue_capacity: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            snapshot_on_tick: None,
            command_fault_capacity: 128,
            listener_queue_capacity: 64,
            sink_queue_capacity: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

/// One isolated simulation runtime.
pub struct Container {
    id: ContainerId,
    config: ContainerConfig,
    state: Arc<Mutex<ContainerState>>,
    store: Arc<Store>,
    registry: Arc<ArcSwap<ModuleRegistry>>,
    queue: Arc<CommandQueue>,
    snapshotter: Arc<Snapshotter>,
    listeners: Arc<ListenerHub>,
    sink: Arc<SinkQueue>,
    ticks: Mutex<Option<Arc<TickController>>>,
    auto_interval: Mutex<Option<Duration>>,
}

impl Container {
    /// Build a container in the `Created` state with the core module
    /// installed. No worker threads tick until [`start`](Self::start).
    pub fn new(config: ContainerConfig) -> Arc<Self> {
        let store = Arc::new(Store::new());
        let registry = ModuleRegistry::build(&store, vec![core_module()])
            .expect("the built-in core module set is always valid");
        let container = Arc::new(Self {
            id: ContainerId::from_raw(NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed)),
            queue: Arc::new(CommandQueue::new(config.command_fault_capacity)),
            listeners: Arc::new(ListenerHub::spawn(config.listener_queue_capacity)),
            sink: Arc::new(SinkQueue::spawn(config.sink_queue_capacity)),
            snapshotter: Arc::new(Snapshotter::new(Arc::clone(&store))),
            registry: Arc::new(ArcSwap::from_pointee(registry)),
            state: Arc::new(Mutex::new(ContainerState::Created)),
            store,
            config,
            ticks: Mutex::new(None),
            auto_interval: Mutex::new(None),
        });
        tracing::debug!(container_id = %container.id, "container created");
        container
    }

    /// This container's process-unique id.
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    /// Direct access to the store (administrative reads and test setup).
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn invalid(&self, current: ContainerState, attempted: ContainerState) -> EngineError {
        EngineError::InvalidState { current, attempted }
    }

    fn require_live(&self) -> Result<(), EngineError> {
        let current = self.state();
        match current {
            ContainerState::Running | ContainerState::Paused => Ok(()),
            _ => Err(self.invalid(current, ContainerState::Running)),
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// `Created -> Starting -> Running`: spawn the tick worker.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if *state != ContainerState::Created {
            return Err(self.invalid(*state, ContainerState::Starting));
        }
        *state = ContainerState::Starting;

        let controller = TickController::spawn(TickContext {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            queue: Arc::clone(&self.queue),
            snapshotter: Arc::clone(&self.snapshotter),
            listeners: Arc::clone(&self.listeners),
            sink: Arc::clone(&self.sink),
            snapshot_mode: self.config.snapshot_on_tick,
            state: Arc::clone(&self.state),
        });
        *self.ticks.lock() = Some(Arc::new(controller));

        *state = ContainerState::Running;
        tracing::info!(container_id = %self.id, "container running");
        Ok(())
    }

    /// `Running -> Paused`: halt auto-advance, retain all state.
    pub fn pause(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if *state != ContainerState::Running {
            return Err(self.invalid(*state, ContainerState::Paused));
        }
        if let Some(controller) = self.ticks.lock().as_ref() {
            controller.stop_auto();
        }
        *state = ContainerState::Paused;
        Ok(())
    }

    /// `Paused -> Running`: resume the remembered auto cadence, if any.
    pub fn resume(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if *state != ContainerState::Paused {
            return Err(self.invalid(*state, ContainerState::Running));
        }
        if let Some(interval) = *self.auto_interval.lock() {
            if let Some(controller) = self.ticks.lock().as_ref() {
                controller.start_auto(interval);
            }
        }
        *state = ContainerState::Running;
        Ok(())
    }

    /// Any state `-> Stopping -> Stopped`: join the worker, drain the
    /// auxiliary threads, drop all matches. Idempotent once stopped.
    pub fn stop(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            match *state {
                ContainerState::Stopped | ContainerState::Stopping => return Ok(()),
                _ => *state = ContainerState::Stopping,
            }
        }

        if let Some(controller) = self.ticks.lock().take() {
            controller.shutdown();
        }
        self.listeners.shutdown();
        self.sink.shutdown();

        let mut w = self.store.write(ModuleId::CORE);
        for match_id in w.matches() {
            let _ = w.delete_match(match_id);
            self.snapshotter.forget(match_id);
        }
        drop(w);

        *self.state.lock() = ContainerState::Stopped;
        tracing::info!(container_id = %self.id, "container stopped");
        Ok(())
    }

    // -- module management ---------------------------------------------------

    /// Install one more module. Atomic: on any registry error the active
    /// module set and the store are unchanged.
    pub fn install(&self, descriptor: ModuleDescriptor) -> Result<(), EngineError> {
        let current = self.state();
        if matches!(
            current,
            ContainerState::Stopping | ContainerState::Stopped | ContainerState::Faulted
        ) {
            return Err(self.invalid(current, ContainerState::Running));
        }
        let mut descriptors = self.registry.load().descriptors().to_vec();
        descriptors.push(descriptor);
        let next = ModuleRegistry::build(&self.store, descriptors)?;
        self.registry.store(Arc::new(next));
        Ok(())
    }

    /// Replace every user module with `descriptors` (the core module always
    /// survives). Atomic with rollback semantics: a validation failure
    /// leaves the old registry active and the store untouched.
    pub fn reload(&self, descriptors: Vec<ModuleDescriptor>) -> Result<(), EngineError> {
        let current = self.state();
        if matches!(
            current,
            ContainerState::Stopping | ContainerState::Stopped | ContainerState::Faulted
        ) {
            return Err(self.invalid(current, ContainerState::Running));
        }
        let mut staged = vec![core_module()];
        staged.extend(descriptors);
        let next = ModuleRegistry::build(&self.store, staged)?;
        self.registry.store(Arc::new(next));
        tracing::info!(container_id = %self.id, "module registry reloaded");
        Ok(())
    }

    /// The active module registry.
    pub fn modules(&self) -> Arc<ModuleRegistry> {
        self.registry.load_full()
    }

    // -- fluent scopes -------------------------------------------------------

    /// Match lifecycle operations.
    pub fn matches(&self) -> MatchScope<'_> {
        MatchScope { container: self }
    }

    /// Tick stepping, cadence, and listeners.
    pub fn ticks(&self) -> TickScope<'_> {
        TickScope { container: self }
    }

    /// Command submission and the fault log.
    pub fn commands(&self) -> CommandScope<'_> {
        CommandScope { container: self }
    }

    /// Snapshot reads and the durable sink.
    pub fn snapshots(&self) -> SnapshotScope<'_> {
        SnapshotScope { container: self }
    }

    /// Player roster operations.
    pub fn players(&self) -> PlayerScope<'_> {
        PlayerScope { container: self }
    }

    /// Per-match resource operations.
    pub fn resources(&self) -> ResourceScope<'_> {
        ResourceScope { container: self }
    }

    fn controller(&self) -> Result<Arc<TickController>, EngineError> {
        self.ticks
            .lock()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| self.invalid(self.state(), ContainerState::Running))
    }

    fn current_tick(&self) -> u64 {
        self.ticks
            .lock()
            .as_ref()
            .map(|controller| controller.current_tick())
            .unwrap_or(0)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("tick", &self.current_tick())
            .finish()
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        // A dropped container must not leak its worker threads.
        let _ = self.stop();
    }
}

// ---------------------------------------------------------------------------
// MatchScope
// ---------------------------------------------------------------------------

/// Match lifecycle operations of one container.
pub struct MatchScope<'a> {
    container: &'a Container,
}

impl MatchScope<'_> {
    /// Create a match.
    pub fn create(&self) -> Result<MatchId, EngineError> {
        self.container.require_live()?;
        Ok(self.container.store.write(ModuleId::CORE).create_match())
    }

    /// Delete a match, cascading to every entity in it.
    pub fn delete(&self, match_id: MatchId) -> Result<(), EngineError> {
        self.container.require_live()?;
        let destroyed = self
            .container
            .store
            .write(ModuleId::CORE)
            .delete_match(match_id)?;
        self.container.snapshotter.forget(match_id);
        tracing::debug!(
            container_id = %self.container.id,
            %match_id,
            destroyed = destroyed.len(),
            "match deleted"
        );
        Ok(())
    }

    /// All live matches, ascending.
    pub fn list(&self) -> Vec<MatchId> {
        self.container.store.read().matches()
    }

    /// Whether a match exists.
    pub fn exists(&self, match_id: MatchId) -> bool {
        self.container.store.read().match_exists(match_id)
    }

    /// The entities of a match, ascending by id.
    pub fn entities(&self, match_id: MatchId) -> Result<Vec<EntityId>, EngineError> {
        let r = self.container.store.read();
        if !r.match_exists(match_id) {
            return Err(StoreError::UnknownMatch { match_id }.into());
        }
        Ok(r.entities_in_match(match_id))
    }
}

// ---------------------------------------------------------------------------
// TickScope
// ---------------------------------------------------------------------------

/// Tick stepping, cadence, and listener registration.
pub struct TickScope<'a> {
    container: &'a Container,
}

impl TickScope<'_> {
    /// Execute exactly one tick; returns the new tick number.
    pub fn advance(&self) -> Result<u64, EngineError> {
        let current = self.container.state();
        if current != ContainerState::Running {
            return Err(self.container.invalid(current, ContainerState::Running));
        }
        self.container.controller()?.advance()
    }

    /// Begin auto-advancing every `interval`.
    pub fn start_auto(&self, interval: Duration) -> Result<(), EngineError> {
        let current = self.container.state();
        if current != ContainerState::Running {
            return Err(self.container.invalid(current, ContainerState::Running));
        }
        *self.container.auto_interval.lock() = Some(interval);
        self.container.controller()?.start_auto(interval);
        Ok(())
    }

    /// Halt auto-advance; an executing tick completes.
    pub fn stop_auto(&self) -> Result<(), EngineError> {
        self.container.require_live()?;
        *self.container.auto_interval.lock() = None;
        self.container.controller()?.stop_auto();
        Ok(())
    }

    /// The last completed tick number.
    pub fn current(&self) -> u64 {
        self.container.current_tick()
    }

    /// Auto-advance slots skipped because a tick overran.
    pub fn skipped(&self) -> u64 {
        self.container
            .ticks
            .lock()
            .as_ref()
            .map(|controller| controller.skipped_ticks())
            .unwrap_or(0)
    }

    /// Register a tick listener. Listeners run off the simulation worker
    /// and must enqueue commands rather than mutate the store.
    pub fn add_listener(&self, listener: Arc<dyn TickListener>) {
        self.container.listeners.add(listener);
    }

    /// Tick events dropped because the listener dispatcher fell behind.
    pub fn dropped_events(&self) -> u64 {
        self.container.listeners.dropped()
    }
}

// ---------------------------------------------------------------------------
// CommandScope
// ---------------------------------------------------------------------------

/// Command submission and the bounded fault log.
pub struct CommandScope<'a> {
    container: &'a Container,
}

impl CommandScope<'_> {
    /// Validate and enqueue a command for the next tick's drain.
    pub fn enqueue(&self, name: &str, params: serde_json::Value) -> Result<(), EngineError> {
        self.container.require_live()?;
        self.container
            .queue
            .enqueue(&self.container.registry.load(), name, params)
    }

    /// Commands waiting for the next drain.
    pub fn pending(&self) -> usize {
        self.container.queue.pending_len()
    }

    /// The retained handler-failure log, oldest first.
    pub fn faults(&self) -> Vec<CommandFault> {
        self.container.queue.faults()
    }

    /// Total handler failures ever recorded.
    pub fn faults_total(&self) -> u64 {
        self.container.queue.faults_total()
    }
}

// ---------------------------------------------------------------------------
// SnapshotScope
// ---------------------------------------------------------------------------

/// Snapshot reads and the durable-sink hook.
pub struct SnapshotScope<'a> {
    container: &'a Container,
}

impl SnapshotScope<'_> {
    /// Take a full snapshot of a match at the current tick.
    pub fn full(&self, match_id: MatchId) -> Result<FullSnapshot, EngineError> {
        self.container.require_live()?;
        self.container
            .snapshotter
            .full(match_id, self.container.current_tick())
    }

    /// Like [`full`](Self::full), giving up after `deadline` with `Timeout`.
    pub fn full_bounded(
        &self,
        match_id: MatchId,
        deadline: Duration,
    ) -> Result<FullSnapshot, EngineError> {
        self.container.require_live()?;
        self.container
            .snapshotter
            .full_bounded(match_id, self.container.current_tick(), deadline)
    }

    /// Take the delta from `from_tick` to the current tick.
    pub fn delta(&self, match_id: MatchId, from_tick: u64) -> Result<DeltaSnapshot, EngineError> {
        self.delta_between(match_id, from_tick, self.container.current_tick())
    }

    /// Take the delta between two explicit tick boundaries.
    pub fn delta_between(
        &self,
        match_id: MatchId,
        from_tick: u64,
        to_tick: u64,
    ) -> Result<DeltaSnapshot, EngineError> {
        self.container.require_live()?;
        self.container
            .snapshotter
            .delta(match_id, from_tick, to_tick)
    }

    /// Install the durable snapshot sink.
    pub fn set_sink(&self, sink: Arc<dyn SnapshotSink>) {
        self.container.sink.set_sink(sink);
    }

    /// Snapshots dropped because the sink fell behind.
    pub fn sink_dropped(&self) -> u64 {
        self.container.sink.dropped()
    }

    /// Snapshots successfully handed to the sink.
    pub fn sink_persisted(&self) -> u64 {
        self.container.sink.persisted()
    }
}

// ---------------------------------------------------------------------------
// PlayerScope
// ---------------------------------------------------------------------------

/// Player roster operations over the core module's components.
pub struct PlayerScope<'a> {
    container: &'a Container,
}

impl PlayerScope<'_> {
    /// Add a player to a match; returns the roster entity.
    pub fn join(&self, match_id: MatchId, player_id: u64) -> Result<EntityId, EngineError> {
        self.container.require_live()?;
        let mut w = self.container.store.write(ModuleId::CORE);
        let entity = w.spawn(match_id)?;
        let column = w.lookup(PLAYER_ID)?;
        w.set(entity, column, player_id as f64)?;
        Ok(entity)
    }

    /// Remove a roster entity.
    pub fn leave(&self, entity: EntityId) -> Result<(), EngineError> {
        self.container.require_live()?;
        let mut w = self.container.store.write(ModuleId::CORE);
        w.despawn(entity)?;
        Ok(())
    }

    /// The players of a match as `(roster entity, player id)`.
    pub fn list(&self, match_id: MatchId) -> Result<Vec<(EntityId, u64)>, EngineError> {
        let r = self.container.store.read();
        if !r.match_exists(match_id) {
            return Err(StoreError::UnknownMatch { match_id }.into());
        }
        let column = r.lookup(PLAYER_ID)?;
        let mut players = Vec::new();
        for entity in r.entities_in_match(match_id) {
            if let Some(value) = r.get(entity, column)? {
                players.push((entity, value as u64));
            }
        }
        Ok(players)
    }
}

// ---------------------------------------------------------------------------
// ResourceScope
// ---------------------------------------------------------------------------

/// Per-match resource accounting over the core module's components.
pub struct ResourceScope<'a> {
    container: &'a Container,
}

impl ResourceScope<'_> {
    /// Grant `amount` of resource `kind` to a match; returns the resource
    /// entity.
    pub fn grant(
        &self,
        match_id: MatchId,
        kind: u32,
        amount: f64,
    ) -> Result<EntityId, EngineError> {
        self.container.require_live()?;
        let mut w = self.container.store.write(ModuleId::CORE);
        let entity = w.spawn(match_id)?;
        let kind_column = w.lookup(RESOURCE_KIND)?;
        let amount_column = w.lookup(RESOURCE_AMOUNT)?;
        w.set(entity, kind_column, kind as f64)?;
        w.set(entity, amount_column, amount)?;
        Ok(entity)
    }

    /// The total of resource `kind` held by a match.
    pub fn total(&self, match_id: MatchId, kind: u32) -> Result<f64, EngineError> {
        let r = self.container.store.read();
        if !r.match_exists(match_id) {
            return Err(StoreError::UnknownMatch { match_id }.into());
        }
        let kind_column = r.lookup(RESOURCE_KIND)?;
        let amount_column = r.lookup(RESOURCE_AMOUNT)?;
        let mut total = 0.0;
        for entity in r.entities_in_match(match_id) {
            if r.get(entity, kind_column)? == Some(kind as f64) {
                total += r.get(entity, amount_column)?.unwrap_or(0.0);
            }
        }
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
