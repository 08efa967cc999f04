//! Squall Engine -- multi-match simulation runtime over the columnar store.
//!
//! This crate builds on [`squall_ecs`] to provide the simulation driver: a
//! per-container tick worker that drains a schema-validated command queue,
//! runs module systems in dependency order, tracks per-match deltas, and
//! emits full or delta snapshots to listeners and an optional durable sink.
//!
//! A [`Container`](container::Container) is one isolated simulation runtime:
//! one store, one worker, one module registry. Containers are created and
//! destroyed through the process-wide
//! [`ContainerRegistry`](registry::ContainerRegistry) and share nothing
//! mutable with each other.
//!
//! # Quick Start
//!
//! ```
//! use squall_engine::prelude::*;
//!
//! let container = Container::new(ContainerConfig::default());
//! container.start().unwrap();
//!
//! let m = container.matches().create().unwrap();
//! container
//!     .commands()
//!     .enqueue("spawn", serde_json::json!({
//!         "matchId": m.to_raw(),
//!         "entityType": 1,
//!         "playerId": 7,
//!     }))
//!     .unwrap();
//!
//! container.ticks().advance().unwrap();
//! let snapshot = container.snapshots().full(m).unwrap();
//! assert_eq!(snapshot.entities.len(), 1);
//!
//! container.stop().unwrap();
//! ```

#![deny(unsafe_code)]

pub mod command;
pub mod container;
pub mod listener;
pub mod module;
pub mod registry;
pub mod sink;
pub mod snapshot;
pub mod tick;

/// Re-export the store crate for convenience.
pub use squall_ecs;

use squall_ecs::entity::MatchId;
use squall_ecs::StoreError;

use crate::container::ContainerState;
use crate::registry::ContainerId;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by module registration and reload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    /// Two modules in the staged set share a name.
    #[error("module '{name}' is declared more than once")]
    DuplicateModule {
        name: String,
    },

    /// Two components in the staged set share a name, or a reserved name
    /// was redeclared.
    #[error("component '{name}' is declared more than once")]
    DuplicateComponent {
        name: String,
    },

    /// Two commands in the staged set share a name.
    #[error("command '{name}' is declared more than once")]
    DuplicateCommand {
        name: String,
    },

    /// Two systems in the staged set share a name.
    #[error("system '{name}' is declared more than once")]
    DuplicateSystem {
        name: String,
    },

    /// A system requires a system that is not in the staged set.
    #[error("system '{system}' requires unknown system '{requires}'")]
    UnknownRequirement {
        system: String,
        requires: String,
    },

    /// The system requirement graph contains a cycle.
    #[error("system dependency cycle involving '{system}'")]
    DependencyCycle {
        system: String,
    },
}

/// A failure reported by a module system. Fatal to the current tick.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SystemError {
    /// Summary of what went wrong.
    pub message: String,
}

impl SystemError {
    /// Build from anything printable.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<StoreError> for SystemError {
    fn from(err: StoreError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

/// A domain failure reported by a command handler. Recorded in the
/// container's bounded command-error log; never aborts the tick.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CommandError {
    /// Summary of what went wrong.
    pub message: String,
}

impl CommandError {
    /// Build from anything printable.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

/// Errors produced by engine operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// A command payload did not match its schema; the command was not
    /// queued.
    #[error("bad command: {reason}")]
    BadCommand {
        reason: String,
    },

    /// A container operation was attempted in a state that disallows it.
    #[error("container in state {current} cannot transition to {attempted}")]
    InvalidState {
        current: ContainerState,
        attempted: ContainerState,
    },

    /// A system failed; the tick was aborted and the container fault-held.
    #[error("system '{system}' failed: {message}")]
    SystemFailure {
        system: String,
        message: String,
    },

    /// A delta was requested for a window that does not start where the
    /// snapshotter's records say it should.
    #[error("delta for match {match_id} must start at tick {recorded}, not {requested}")]
    DeltaWindow {
        match_id: MatchId,
        recorded: u64,
        requested: u64,
    },

    /// The container does not exist (destroyed or never created).
    #[error("container {container_id} does not exist")]
    UnknownContainer {
        container_id: ContainerId,
    },

    /// Module registration or reload failed; the previous registry is
    /// still active.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A store-level failure surfaced to the caller.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install a console `tracing` subscriber honoring `RUST_LOG`.
///
/// For binaries, demos, and tests that want engine logs on stderr; the
/// library itself never installs a global subscriber. Calling this more
/// than once is harmless.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use squall_ecs::prelude::*;

    pub use crate::command::{
        CommandArgs, CommandFault, CommandQueue, CommandSchema, ParamSpec, ParamType,
    };
    pub use crate::container::{Container, ContainerConfig, ContainerState};
    pub use crate::listener::TickListener;
    pub use crate::module::{ComponentDecl, ModuleDescriptor, ModuleRegistry};
    pub use crate::registry::{ContainerId, ContainerRegistry};
    pub use crate::sink::SnapshotSink;
    pub use crate::snapshot::{DeltaSnapshot, FullSnapshot, SnapshotMode, SnapshotPayload};
    pub use crate::tick::TickController;
    pub use crate::{CommandError, EngineError, RegistryError, SystemError};
}
