//! Component declarations and the catalog that assigns columns.
//!
//! A component is nothing but a named numeric column. Modules declare
//! components at registration; the [`Catalog`] assigns each name a
//! [`ComponentId`] (its column index, append-only) and remembers the owning
//! module and its [`PermissionLevel`]. One name maps to exactly one id for
//! the lifetime of a container.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ComponentId
// ---------------------------------------------------------------------------

/// Opaque identifier for a registered component. Doubles as the column index
/// in the pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(pub(crate) u32);

impl ComponentId {
    /// Construct from a raw column index.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw column index.
    #[inline]
    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// The column index as a `usize`.
    #[inline]
    pub(crate) fn column(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ModuleId
// ---------------------------------------------------------------------------

/// Identity of a registered module, used to tag write origins for
/// permission enforcement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(pub(crate) u32);

impl ModuleId {
    /// The built-in core module. Owns `MATCH_ID` and the other reserved
    /// components; also the origin of administrative writes.
    pub const CORE: ModuleId = ModuleId(0);

    /// Construct from a raw index.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw index representation.
    #[inline]
    pub fn to_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// PermissionLevel
// ---------------------------------------------------------------------------

/// Write permission a component grants to modules other than its owner.
///
/// The owner may always write its own components. Permission is consulted on
/// writes only; reads are open to every module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    /// Only the owning module may write.
    Private,
    /// Other modules may read but not write (same write rule as `Private`;
    /// the distinction is advisory for external tooling).
    Read,
    /// Any module may write.
    Write,
}

// ---------------------------------------------------------------------------
// ComponentDef
// ---------------------------------------------------------------------------

/// A registered component: its column, name, owning module, and permission.
#[derive(Debug, Clone)]
pub struct ComponentDef {
    /// Column index assigned at registration.
    pub id: ComponentId,
    /// Declared name, unique among active components.
    pub name: String,
    /// The module that declared this component.
    pub module: ModuleId,
    /// Write permission granted to non-owning modules.
    pub permission: PermissionLevel,
    /// Set when the declaring module dropped this component on a reload.
    /// Retired columns keep their index (columns are append-only) but no
    /// longer resolve by name.
    pub retired: bool,
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Name of the built-in component that ties an entity to its match.
pub const MATCH_ID: &str = "MATCH_ID";

/// Maps component names to columns and modules to their declarations.
///
/// Columns are append-only: registration never removes a column, and a
/// reload retires vanished names rather than reclaiming their index. Module
/// insertion order is preserved; snapshots group components by module in
/// that order.
#[derive(Debug, Clone)]
pub struct Catalog {
    /// Active (non-retired) name -> id.
    by_name: HashMap<String, ComponentId>,
    /// All definitions ever registered, indexed by `ComponentId.0`.
    defs: Vec<ComponentDef>,
    /// Module names in insertion order, indexed by `ModuleId.0`.
    modules: Vec<String>,
}

impl Catalog {
    /// Create a catalog holding only the built-in core declarations.
    pub fn new() -> Self {
        let mut catalog = Self {
            by_name: HashMap::new(),
            defs: Vec::new(),
            modules: vec!["core".to_owned()],
        };
        catalog.register(ModuleId::CORE, MATCH_ID, PermissionLevel::Private);
        catalog
    }

    /// Register a component under `module`. Returns the existing id if the
    /// name is already active (the caller is expected to have validated that
    /// re-registrations come from the same module).
    pub fn register(
        &mut self,
        module: ModuleId,
        name: &str,
        permission: PermissionLevel,
    ) -> ComponentId {
        if let Some(&existing) = self.by_name.get(name) {
            return existing;
        }
        let id = ComponentId(self.defs.len() as u32);
        self.defs.push(ComponentDef {
            id,
            name: name.to_owned(),
            module,
            permission,
            retired: false,
        });
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Intern a module name, returning its id. Existing names keep their id.
    pub fn register_module(&mut self, name: &str) -> ModuleId {
        if let Some(pos) = self.modules.iter().position(|m| m == name) {
            return ModuleId(pos as u32);
        }
        let id = ModuleId(self.modules.len() as u32);
        self.modules.push(name.to_owned());
        id
    }

    /// Look up an active component by name.
    pub fn lookup(&self, name: &str) -> Option<ComponentId> {
        self.by_name.get(name).copied()
    }

    /// The definition behind an id, active or retired.
    pub fn def(&self, id: ComponentId) -> Option<&ComponentDef> {
        self.defs.get(id.column())
    }

    /// The column of the built-in `MATCH_ID` component.
    pub fn match_id_column(&self) -> ComponentId {
        self.by_name[MATCH_ID]
    }

    /// Name of a module.
    pub fn module_name(&self, id: ModuleId) -> Option<&str> {
        self.modules.get(id.0 as usize).map(|s| s.as_str())
    }

    /// Id of a module by name.
    pub fn module_id(&self, name: &str) -> Option<ModuleId> {
        self.modules
            .iter()
            .position(|m| m == name)
            .map(|pos| ModuleId(pos as u32))
    }

    /// Module names in insertion order.
    pub fn modules(&self) -> impl Iterator<Item = (ModuleId, &str)> {
        self.modules
            .iter()
            .enumerate()
            .map(|(i, name)| (ModuleId(i as u32), name.as_str()))
    }

    /// Active components declared by a module, in registration order.
    pub fn components_of(&self, module: ModuleId) -> impl Iterator<Item = &ComponentDef> {
        self.defs
            .iter()
            .filter(move |d| d.module == module && !d.retired)
    }

    /// All active definitions in column order.
    pub fn active_defs(&self) -> impl Iterator<Item = &ComponentDef> {
        self.defs.iter().filter(|d| !d.retired)
    }

    /// Total number of columns ever assigned (active + retired). This always
    /// equals the pool width.
    pub fn column_count(&self) -> usize {
        self.defs.len()
    }

    /// Number of active components.
    pub fn active_count(&self) -> usize {
        self.defs.iter().filter(|d| !d.retired).count()
    }

    /// Replace the declared component set with `decls`, preserving columns of
    /// names that survive.
    ///
    /// `decls` is the complete new declaration set: `(module name, component
    /// name, permission)` in module registration order. The caller has
    /// already validated name uniqueness. Returns the catalog to swap in and
    /// the retired columns whose cells must be swept.
    pub fn rebuild(
        &self,
        decls: &[(String, String, PermissionLevel)],
    ) -> (Catalog, Vec<ComponentId>) {
        let mut next = Catalog {
            by_name: HashMap::new(),
            defs: self.defs.clone(),
            modules: vec!["core".to_owned()],
        };

        // Core's built-ins always survive with their columns.
        for def in &mut next.defs {
            if def.module == ModuleId::CORE {
                next.by_name.insert(def.name.clone(), def.id);
            } else {
                def.retired = true;
            }
        }

        for (module_name, comp_name, permission) in decls {
            let module = next.register_module(module_name);
            match self.by_name.get(comp_name) {
                // Name survives the reload: keep its column, refresh the
                // declaration (owner and permission may have changed).
                Some(&id) => {
                    let def = &mut next.defs[id.column()];
                    def.module = module;
                    def.permission = *permission;
                    def.retired = false;
                    next.by_name.insert(comp_name.clone(), id);
                }
                None => {
                    let id = ComponentId(next.defs.len() as u32);
                    next.defs.push(ComponentDef {
                        id,
                        name: comp_name.clone(),
                        module,
                        permission: *permission,
                        retired: false,
                    });
                    next.by_name.insert(comp_name.clone(), id);
                }
            }
        }

        let swept: Vec<ComponentId> = next
            .defs
            .iter()
            .zip(self.defs.iter())
            .filter(|(new_def, old_def)| new_def.retired && !old_def.retired)
            .map(|(new_def, _)| new_def.id)
            .collect();

        (next, swept)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
