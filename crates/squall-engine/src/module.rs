//! Module descriptors and the atomically-reloadable module registry.
//!
//! A module contributes three things to a container: component declarations
//! (name + permission), systems (run every tick, ordered by their declared
//! `requires` edges), and commands (schema + handler). The registry holds
//! the resolved active set; installs and reloads replace it atomically --
//! validation runs against a staged set first, and a failure leaves both the
//! registry and the store untouched.
//!
//! On a successful reload, components whose names survive keep their
//! columns (entities and their cells survive with them), vanished
//! components are swept in a single pass, and new names get fresh columns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use squall_ecs::component::{ModuleId, PermissionLevel, MATCH_ID};
use squall_ecs::store::{Store, StoreWriter};

use crate::command::{CommandSchema, QueuedCommand};
use crate::{CommandError, RegistryError, SystemError};

// ---------------------------------------------------------------------------
// Declaration types
// ---------------------------------------------------------------------------

/// A system function: reads and writes the store through the tick's writer.
pub type SystemFn =
    Arc<dyn Fn(&mut StoreWriter<'_>, u64) -> Result<(), SystemError> + Send + Sync>;

/// A command handler: applies one validated command during the drain.
pub type CommandHandlerFn = Arc<
    dyn Fn(&mut StoreWriter<'_>, u64, &crate::command::CommandArgs) -> Result<(), CommandError>
        + Send
        + Sync,
>;

/// A component declared by a module.
#[derive(Debug, Clone)]
pub struct ComponentDecl {
    /// Component name, unique across the whole staged set.
    pub name: String,
    /// Write permission granted to non-owning modules.
    pub permission: PermissionLevel,
}

/// A system declared by a module.
#[derive(Clone)]
pub struct SystemDecl {
    /// System name, unique across the whole staged set.
    pub name: String,
    /// Names of systems that must run before this one (any module).
    pub requires: Vec<String>,
    /// The per-tick function.
    pub run: SystemFn,
}

impl std::fmt::Debug for SystemDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemDecl")
            .field("name", &self.name)
            .field("requires", &self.requires)
            .finish()
    }
}

/// A command declared by a module.
#[derive(Clone)]
pub struct CommandDecl {
    /// Command name, unique across the whole staged set.
    pub name: String,
    /// Parameter schema enforced at enqueue time.
    pub schema: CommandSchema,
    /// The drain-time handler.
    pub handler: CommandHandlerFn,
}

impl std::fmt::Debug for CommandDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDecl")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish()
    }
}

/// Everything one module contributes to a container.
#[derive(Debug, Clone, Default)]
pub struct ModuleDescriptor {
    /// Module name, unique across the installed set.
    pub name: String,
    /// Declared components.
    pub components: Vec<ComponentDecl>,
    /// Declared systems.
    pub systems: Vec<SystemDecl>,
    /// Declared commands.
    pub commands: Vec<CommandDecl>,
}

impl ModuleDescriptor {
    /// Start an empty descriptor.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Declare a component.
    pub fn component(mut self, name: &str, permission: PermissionLevel) -> Self {
        self.components.push(ComponentDecl {
            name: name.to_owned(),
            permission,
        });
        self
    }

    /// Declare a system with no ordering requirements.
    pub fn system<F>(self, name: &str, run: F) -> Self
    where
        F: Fn(&mut StoreWriter<'_>, u64) -> Result<(), SystemError> + Send + Sync + 'static,
    {
        self.system_after(name, &[], run)
    }

    /// Declare a system that must run after the named systems.
    pub fn system_after<F>(mut self, name: &str, requires: &[&str], run: F) -> Self
    where
        F: Fn(&mut StoreWriter<'_>, u64) -> Result<(), SystemError> + Send + Sync + 'static,
    {
        self.systems.push(SystemDecl {
            name: name.to_owned(),
            requires: requires.iter().map(|s| s.to_string()).collect(),
            run: Arc::new(run),
        });
        self
    }

    /// Declare a command.
    pub fn command<F>(mut self, name: &str, schema: CommandSchema, handler: F) -> Self
    where
        F: Fn(&mut StoreWriter<'_>, u64, &crate::command::CommandArgs) -> Result<(), CommandError>
            + Send
            + Sync
            + 'static,
    {
        self.commands.push(CommandDecl {
            name: name.to_owned(),
            schema,
            handler: Arc::new(handler),
        });
        self
    }
}

// ---------------------------------------------------------------------------
// Resolved registry
// ---------------------------------------------------------------------------

/// A system bound to its module identity, in execution order.
#[derive(Clone)]
pub struct ResolvedSystem {
    /// The declaring module.
    pub module: ModuleId,
    /// System name.
    pub name: String,
    /// The per-tick function.
    pub run: SystemFn,
}

/// A command bound to its module identity.
#[derive(Clone)]
pub struct ResolvedCommand {
    /// The declaring module.
    pub module: ModuleId,
    /// Parameter schema enforced at enqueue time.
    pub schema: CommandSchema,
    /// The drain-time handler.
    pub handler: CommandHandlerFn,
}

/// The active module set of one container.
///
/// Immutable once built; the container swaps whole registries on install
/// and reload (`arc-swap`), so the tick worker always sees one consistent
/// set for the duration of a tick.
pub struct ModuleRegistry {
    descriptors: Vec<ModuleDescriptor>,
    systems: Vec<ResolvedSystem>,
    commands: HashMap<String, ResolvedCommand>,
}

impl ModuleRegistry {
    /// A registry with no modules at all (pre-start placeholder).
    pub fn empty() -> Self {
        Self {
            descriptors: Vec::new(),
            systems: Vec::new(),
            commands: HashMap::new(),
        }
    }

    /// Validate `descriptors` as a complete module set, apply the resulting
    /// catalog to `store`, and build the resolved registry.
    ///
    /// Validation is pure: on any [`RegistryError`] the store has not been
    /// touched and the previously active registry remains valid.
    pub fn build(
        store: &Store,
        descriptors: Vec<ModuleDescriptor>,
    ) -> Result<Self, RegistryError> {
        validate(&descriptors)?;
        let order = sort_systems(&descriptors)?;

        // Stage the catalog change, then apply it and the storage
        // consequences under one writer.
        let mut w = store.write(ModuleId::CORE);
        let decls: Vec<(String, String, PermissionLevel)> = descriptors
            .iter()
            .flat_map(|d| {
                d.components.iter().map(|c| {
                    (d.name.clone(), c.name.clone(), c.permission)
                })
            })
            .collect();
        let (mut next, swept) = w.catalog().rebuild(&decls);
        // Modules that declare no components still need an identity.
        for descriptor in &descriptors {
            next.register_module(&descriptor.name);
        }

        let module_ids: HashMap<&str, ModuleId> = descriptors
            .iter()
            .map(|d| {
                let id = next
                    .module_id(&d.name)
                    .expect("module interned during rebuild");
                (d.name.as_str(), id)
            })
            .collect();
        w.apply_reload(next, swept);
        drop(w);

        let systems: Vec<ResolvedSystem> = order
            .iter()
            .map(|&(module_idx, system_idx)| {
                let descriptor = &descriptors[module_idx];
                let system = &descriptor.systems[system_idx];
                ResolvedSystem {
                    module: module_ids[descriptor.name.as_str()],
                    name: system.name.clone(),
                    run: Arc::clone(&system.run),
                }
            })
            .collect();

        let commands: HashMap<String, ResolvedCommand> = descriptors
            .iter()
            .flat_map(|d| {
                let module = module_ids[d.name.as_str()];
                d.commands.iter().map(move |c| {
                    (
                        c.name.clone(),
                        ResolvedCommand {
                            module,
                            schema: c.schema.clone(),
                            handler: Arc::clone(&c.handler),
                        },
                    )
                })
            })
            .collect();

        tracing::debug!(
            modules = descriptors.len(),
            systems = systems.len(),
            commands = commands.len(),
            "module registry built"
        );

        Ok(Self {
            descriptors,
            systems,
            commands,
        })
    }

    /// The installed descriptors, in installation order.
    pub fn descriptors(&self) -> &[ModuleDescriptor] {
        &self.descriptors
    }

    /// Resolved systems in execution order.
    pub fn systems(&self) -> &[ResolvedSystem] {
        &self.systems
    }

    /// System names in execution order.
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    /// Look up a command by name.
    pub fn command(&self, name: &str) -> Option<&ResolvedCommand> {
        self.commands.get(name)
    }

    /// Run one drained command batch against the writer, reporting each
    /// handler failure through `fault`.
    pub fn run_drain(
        &self,
        w: &mut StoreWriter<'_>,
        tick: u64,
        batch: Vec<QueuedCommand>,
        mut fault: impl FnMut(&str, String),
    ) {
        for command in batch {
            match self.commands.get(&command.name) {
                Some(resolved) => {
                    w.set_origin(resolved.module);
                    if let Err(err) = (resolved.handler)(w, tick, &command.args) {
                        fault(&command.name, err.to_string());
                    }
                }
                // The command's module was unloaded between enqueue and
                // drain.
                None => fault(&command.name, "command is no longer registered".to_owned()),
            }
        }
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.descriptors.len())
            .field("systems", &self.system_names())
            .field("commands", &self.commands.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Validation & ordering
// ---------------------------------------------------------------------------

fn validate(descriptors: &[ModuleDescriptor]) -> Result<(), RegistryError> {
    let mut modules = HashSet::new();
    let mut components = HashSet::new();
    let mut systems = HashSet::new();
    let mut commands = HashSet::new();

    for descriptor in descriptors {
        if !modules.insert(descriptor.name.as_str()) {
            return Err(RegistryError::DuplicateModule {
                name: descriptor.name.clone(),
            });
        }
        for component in &descriptor.components {
            // MATCH_ID is owned by the runtime and cannot be redeclared.
            let reserved = component.name == MATCH_ID && descriptor.name != "core";
            if reserved || !components.insert(component.name.as_str()) {
                return Err(RegistryError::DuplicateComponent {
                    name: component.name.clone(),
                });
            }
        }
        for system in &descriptor.systems {
            if !systems.insert(system.name.as_str()) {
                return Err(RegistryError::DuplicateSystem {
                    name: system.name.clone(),
                });
            }
        }
        for command in &descriptor.commands {
            if !commands.insert(command.name.as_str()) {
                return Err(RegistryError::DuplicateCommand {
                    name: command.name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Topologically sort all systems by their `requires` edges.
///
/// Returns `(module index, system index)` pairs in execution order. Ties are
/// broken by declaration order, so the result is deterministic.
fn sort_systems(
    descriptors: &[ModuleDescriptor],
) -> Result<Vec<(usize, usize)>, RegistryError> {
    // Flatten to nodes in declaration order.
    let nodes: Vec<(usize, usize)> = descriptors
        .iter()
        .enumerate()
        .flat_map(|(mi, d)| (0..d.systems.len()).map(move |si| (mi, si)))
        .collect();
    let index_of: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, &(mi, si))| (descriptors[mi].systems[si].name.as_str(), i))
        .collect();

    // requires edges: dependency -> dependents.
    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, &(mi, si)) in nodes.iter().enumerate() {
        let system = &descriptors[mi].systems[si];
        for requirement in &system.requires {
            let &dep = index_of.get(requirement.as_str()).ok_or_else(|| {
                RegistryError::UnknownRequirement {
                    system: system.name.clone(),
                    requires: requirement.clone(),
                }
            })?;
            dependents[dep].push(i);
            in_degree[i] += 1;
        }
    }

    // Kahn's algorithm, always picking the lowest declaration index so the
    // order is stable across runs.
    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(pos) = ready.iter().enumerate().min_by_key(|(_, &i)| i).map(|(p, _)| p) {
        let node = ready.swap_remove(pos);
        order.push(nodes[node]);
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(dependent);
            }
        }
    }

    if order.len() != nodes.len() {
        // Some node never reached in-degree zero: name one of them.
        let (mi, si) = nodes
            .iter()
            .enumerate()
            .find(|(i, _)| in_degree[*i] > 0)
            .map(|(_, &n)| n)
            .expect("cycle implies a node with positive in-degree");
        return Err(RegistryError::DependencyCycle {
            system: descriptors[mi].systems[si].name.clone(),
        });
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
