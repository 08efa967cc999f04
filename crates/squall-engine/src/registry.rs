//! Process-wide container registry.
//!
//! Containers are isolated runtimes; the only cross-container surface is
//! this registry: create, look up, list, destroy. The map is a `DashMap`,
//! so registry traffic never serializes against any container's own locks.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::container::{Container, ContainerConfig};
use crate::EngineError;

// ---------------------------------------------------------------------------
// ContainerId
// ---------------------------------------------------------------------------

/// Process-unique identifier of a container.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(u64);

impl ContainerId {
    /// Construct from a raw `u64`.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw `u64` representation.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ContainerRegistry
// ---------------------------------------------------------------------------

/// All live containers of this process.
#[derive(Default)]
pub struct ContainerRegistry {
    containers: DashMap<ContainerId, Arc<Container>>,
}

impl ContainerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a container in the `Created` state.
    pub fn create(&self, config: ContainerConfig) -> Arc<Container> {
        let container = Container::new(config);
        self.containers.insert(container.id(), Arc::clone(&container));
        tracing::debug!(container_id = %container.id(), "container registered");
        container
    }

    /// Look up a container.
    pub fn get(&self, container_id: ContainerId) -> Result<Arc<Container>, EngineError> {
        self.containers
            .get(&container_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::UnknownContainer { container_id })
    }

    /// Ids of all registered containers, ascending.
    pub fn list(&self) -> Vec<ContainerId> {
        let mut ids: Vec<ContainerId> = self.containers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered containers.
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    /// Whether no containers are registered.
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Stop and unregister a container.
    pub fn destroy(&self, container_id: ContainerId) -> Result<(), EngineError> {
        let (_, container) = self
            .containers
            .remove(&container_id)
            .ok_or(EngineError::UnknownContainer { container_id })?;
        container.stop()?;
        tracing::debug!(%container_id, "container destroyed");
        Ok(())
    }
}

impl fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("containers", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
