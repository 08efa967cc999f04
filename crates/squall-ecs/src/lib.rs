//! Squall ECS -- columnar entity-component store for match-scoped simulation.
//!
//! This crate is the storage layer of the Squall simulation runtime. All
//! component data lives in one flat numeric pool (an entity is a row, a
//! component is a column, absence is a NaN sentinel), fronted by a store
//! facade that layers on a version-validated query cache, per-match dirty
//! tracking, and module-scoped write permissions behind a single-writer /
//! many-reader lock.
//!
//! # Quick Start
//!
//! ```
//! use squall_ecs::prelude::*;
//!
//! let store = Store::new();
//! let mut w = store.write(ModuleId::CORE);
//!
//! let physics = w.register_module("physics");
//! let pos_x = w.register_component(physics, "POSITION_X", PermissionLevel::Write);
//!
//! let m = w.create_match();
//! let e = w.spawn(m).unwrap();
//! w.set(e, pos_x, 4.5).unwrap();
//! drop(w);
//!
//! let r = store.read();
//! assert_eq!(r.get(e, pos_x).unwrap(), Some(4.5));
//! assert_eq!(r.query(&[pos_x]), vec![e]);
//! ```

#![deny(unsafe_code)]

pub mod component;
pub mod dirty;
pub mod entity;
pub mod pool;
pub mod query;
pub mod store;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

use entity::{EntityId, MatchId};

/// Errors produced by store operations.
///
/// Messages are summaries; row indices, column indices, and sentinel bit
/// patterns never appear in them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The entity does not exist (destroyed or never spawned).
    #[error("entity {entity} does not exist")]
    UnknownEntity {
        entity: EntityId,
    },

    /// A component name that is not registered (or was retired on reload).
    #[error("component '{name}' is not registered")]
    UnknownComponent {
        name: String,
    },

    /// The match does not exist (deleted or never created).
    #[error("match {match_id} does not exist")]
    UnknownMatch {
        match_id: MatchId,
    },

    /// NaN or otherwise non-storable numeric value; the write was rejected.
    #[error("invalid numeric value for a component cell")]
    InvalidValue,

    /// An integer id too large to represent exactly as a cell value.
    #[error("integer {value} exceeds the exactly-representable cell range")]
    Overflow {
        value: u64,
    },

    /// A non-owning module attempted to write a protected component.
    #[error("module '{module}' may not write component '{component}'")]
    PermissionDenied {
        component: String,
        module: String,
    },

    /// A deadline-bounded read expired before the lock was available.
    #[error("store read deadline expired")]
    Timeout,
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{
        Catalog, ComponentDef, ComponentId, ModuleId, PermissionLevel, MATCH_ID,
    };
    pub use crate::dirty::{DirtyTracker, DirtyWindow};
    pub use crate::entity::{EntityId, MatchId};
    pub use crate::pool::{is_absent, ComponentPool, ABSENT};
    pub use crate::query::{QueryCache, QueryKey, QueryStats};
    pub use crate::store::{Store, StoreReader, StoreWriter};
    pub use crate::StoreError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    /// A store with a movement module: POSITION_X/Y and VELOCITY_X/Y.
    fn setup() -> (Store, ModuleId, [ComponentId; 4]) {
        let store = Store::new();
        let mut w = store.write(ModuleId::CORE);
        let movement = w.register_module("movement");
        let components = [
            w.register_component(movement, "POSITION_X", PermissionLevel::Write),
            w.register_component(movement, "POSITION_Y", PermissionLevel::Write),
            w.register_component(movement, "VELOCITY_X", PermissionLevel::Write),
            w.register_component(movement, "VELOCITY_Y", PermissionLevel::Write),
        ];
        drop(w);
        (store, movement, components)
    }

    #[test]
    fn spawn_write_read_roundtrip() {
        let (store, movement, [px, py, ..]) = setup();
        let mut w = store.write(movement);
        let m = w.create_match();
        let e = w.spawn(m).unwrap();
        w.set(e, px, 10.0).unwrap();
        w.set(e, py, -3.5).unwrap();
        drop(w);

        let r = store.read();
        assert_eq!(r.get(e, px).unwrap(), Some(10.0));
        assert_eq!(r.get(e, py).unwrap(), Some(-3.5));
        assert_eq!(r.match_of(e).unwrap(), m);
    }

    #[test]
    fn query_cache_hit_then_invalidation() {
        let (store, movement, [px, _, vx, _]) = setup();
        let mut w = store.write(movement);
        let m = w.create_match();
        let entities: Vec<EntityId> = (0..3)
            .map(|_| {
                let e = w.spawn(m).unwrap();
                w.set(e, px, 0.0).unwrap();
                w.set(e, vx, 1.0).unwrap();
                e
            })
            .collect();
        drop(w);

        let r = store.read();
        assert_eq!(r.query(&[px, vx]), entities);
        drop(r);
        let stats = store.query_stats();
        assert_eq!(stats.misses, 1);

        // Second lookup is a hit.
        let r = store.read();
        assert_eq!(r.query(&[px, vx]), entities);
        drop(r);
        assert_eq!(store.query_stats().hits, 1);

        // A membership change invalidates.
        let mut w = store.write(movement);
        w.unset(entities[0], px).unwrap();
        drop(w);
        let r = store.read();
        assert_eq!(r.query(&[px, vx]), entities[1..]);
        drop(r);
        assert_eq!(store.query_stats().misses, 2);
    }

    #[test]
    fn movement_pass_updates_positions() {
        let (store, movement, [px, py, vx, vy]) = setup();
        let mut w = store.write(movement);
        let m = w.create_match();
        let e = w.spawn(m).unwrap();
        w.set(e, px, 0.0).unwrap();
        w.set(e, py, 0.0).unwrap();
        w.set(e, vx, 10.0).unwrap();
        w.set(e, vy, 0.0).unwrap();

        // The shape of a movement system: query, read, write.
        for _ in 0..10 {
            for entity in w.query(&[px, py, vx, vy]) {
                let x = w.get(entity, px).unwrap().unwrap();
                let y = w.get(entity, py).unwrap().unwrap();
                let dx = w.get(entity, vx).unwrap().unwrap();
                let dy = w.get(entity, vy).unwrap().unwrap();
                w.set(entity, px, x + dx).unwrap();
                w.set(entity, py, y + dy).unwrap();
            }
        }

        assert_eq!(w.get(e, px).unwrap(), Some(100.0));
        assert_eq!(w.get(e, py).unwrap(), Some(0.0));
    }

    #[test]
    fn dirty_window_reconciles_transients() {
        let (store, movement, [px, ..]) = setup();
        let mut w = store.write(movement);
        let m = w.create_match();
        let survivor = w.spawn(m).unwrap();
        w.set(survivor, px, 1.0).unwrap();
        let _ = w.take_dirty(m);

        let transient = w.spawn(m).unwrap();
        w.set(transient, px, 2.0).unwrap();
        w.despawn(transient).unwrap();
        w.set(survivor, px, 5.0).unwrap();

        let window = w.take_dirty(m);
        assert!(!window.added.contains(&transient));
        assert!(!window.removed.contains(&transient));
        assert_eq!(
            window.changed.keys().copied().collect::<Vec<_>>(),
            vec![(survivor, px)]
        );
    }

    #[test]
    fn concurrent_readers_share_the_store() {
        let (store, movement, [px, ..]) = setup();
        let mut w = store.write(movement);
        let m = w.create_match();
        let e = w.spawn(m).unwrap();
        w.set(e, px, 7.0).unwrap();
        drop(w);

        let store = std::sync::Arc::new(store);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    let r = store.read();
                    r.get(e, px).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(7.0));
        }
    }
}
