//! Schema-validated command queue.
//!
//! Commands are the only mutation path open to external callers: a caller
//! enqueues `{name, params}` before a tick, the payload is validated against
//! the command's declared schema at enqueue time (an invalid payload is
//! rejected with `BadCommand` and never queued), and the tick worker drains
//! the queue in FIFO order at the start of the next tick.
//!
//! Handler failures during the drain are domain errors, not infrastructure
//! errors: they land in a bounded ring of [`CommandFault`]s (drop-oldest)
//! and the drain continues.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use squall_ecs::component::ModuleId;
use squall_ecs::entity::{EntityId, MatchId};

use crate::module::ModuleRegistry;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Schema types
// ---------------------------------------------------------------------------

/// The type a command parameter must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// Any JSON number.
    Float,
    /// A whole JSON number.
    Int,
    /// A JSON boolean.
    Bool,
    /// A JSON string.
    Str,
    /// A non-negative whole JSON number naming an entity.
    Entity,
}

/// One declared command parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: String,
    /// Required payload type.
    pub ty: ParamType,
    /// Whether the payload must supply the parameter.
    pub required: bool,
    /// Filled in for omitted optional parameters.
    pub default: Option<Value>,
}

impl ParamSpec {
    /// A parameter the payload must supply.
    pub fn required(name: &str, ty: ParamType) -> Self {
        Self {
            name: name.to_owned(),
            ty,
            required: true,
            default: None,
        }
    }

    /// A parameter filled from `default` when omitted.
    pub fn optional(name: &str, ty: ParamType, default: Value) -> Self {
        Self {
            name: name.to_owned(),
            ty,
            required: false,
            default: Some(default),
        }
    }
}

/// The ordered parameter schema of one command.
#[derive(Debug, Clone, Default)]
pub struct CommandSchema {
    params: Vec<ParamSpec>,
}

impl CommandSchema {
    /// A schema with no parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter.
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// The declared parameters in order.
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Validate a payload, producing typed arguments with defaults filled.
    ///
    /// Returns the rejection reason on mismatch; the caller wraps it in
    /// `BadCommand`.
    pub fn validate(&self, payload: &Value) -> Result<CommandArgs, String> {
        let empty = serde_json::Map::new();
        let map = match payload {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err("params must be an object".to_owned()),
        };

        // Unknown parameters are rejected outright.
        for key in map.keys() {
            if !self.params.iter().any(|p| &p.name == key) {
                return Err(format!("unknown parameter '{key}'"));
            }
        }

        let mut values = BTreeMap::new();
        for spec in &self.params {
            let value = match map.get(&spec.name) {
                Some(value) => value.clone(),
                None if spec.required => {
                    return Err(format!("missing required parameter '{}'", spec.name));
                }
                None => match &spec.default {
                    Some(default) => default.clone(),
                    None => continue,
                },
            };
            check_type(&spec.name, spec.ty, &value)?;
            values.insert(spec.name.clone(), value);
        }
        Ok(CommandArgs { values })
    }
}

fn check_type(name: &str, ty: ParamType, value: &Value) -> Result<(), String> {
    let ok = match ty {
        ParamType::Float => value.is_number(),
        ParamType::Int => value.as_i64().is_some(),
        ParamType::Bool => value.is_boolean(),
        ParamType::Str => value.is_string(),
        ParamType::Entity => value.as_u64().is_some(),
    };
    if ok {
        Ok(())
    } else {
        Err(format!("parameter '{name}' has the wrong type"))
    }
}

// ---------------------------------------------------------------------------
// CommandArgs
// ---------------------------------------------------------------------------

/// Validated, typed command arguments handed to a handler.
#[derive(Debug, Clone, Default)]
pub struct CommandArgs {
    values: BTreeMap<String, Value>,
}

impl CommandArgs {
    /// A float parameter (accepts any numeric payload).
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.values.get(name)?.as_f64()
    }

    /// An integer parameter.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.values.get(name)?.as_i64()
    }

    /// A boolean parameter.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.values.get(name)?.as_bool()
    }

    /// A string parameter.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name)?.as_str()
    }

    /// An entity-id parameter.
    pub fn get_entity(&self, name: &str) -> Option<EntityId> {
        self.values.get(name)?.as_u64().map(EntityId::from_raw)
    }

    /// A match-id parameter.
    pub fn get_match(&self, name: &str) -> Option<MatchId> {
        let raw = self.values.get(name)?.as_u64()?;
        u32::try_from(raw).ok().map(MatchId::from_raw)
    }
}

// ---------------------------------------------------------------------------
// Queue types
// ---------------------------------------------------------------------------

/// A validated command waiting for the next tick's drain.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    /// The command's declared name.
    pub name: String,
    /// The module that declared the command at enqueue time.
    pub module: ModuleId,
    /// Validated arguments with defaults filled.
    pub args: CommandArgs,
}

/// One recorded handler failure.
#[derive(Debug, Clone, Serialize)]
pub struct CommandFault {
    /// The tick whose drain produced the failure.
    pub tick: u64,
    /// The failing command's name.
    pub command: String,
    /// The handler's error message.
    pub message: String,
}

/// Per-container FIFO command queue with a bounded fault ring.
pub struct CommandQueue {
    pending: Mutex<Vec<QueuedCommand>>,
    faults: Mutex<VecDeque<CommandFault>>,
    fault_capacity: usize,
    faults_total: AtomicU64,
}

impl CommandQueue {
    /// Create a queue whose fault ring keeps the latest `fault_capacity`
    /// entries.
    pub fn new(fault_capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            faults: Mutex::new(VecDeque::new()),
            fault_capacity: fault_capacity.max(1),
            faults_total: AtomicU64::new(0),
        }
    }

    /// Validate and enqueue a command.
    ///
    /// The named command must exist in the active registry and `params` must
    /// satisfy its schema; otherwise the call fails with
    /// [`EngineError::BadCommand`] and nothing is queued.
    pub fn enqueue(
        &self,
        registry: &ModuleRegistry,
        name: &str,
        params: Value,
    ) -> Result<(), EngineError> {
        let resolved = registry
            .command(name)
            .ok_or_else(|| EngineError::BadCommand {
                reason: format!("unknown command '{name}'"),
            })?;
        let args = resolved
            .schema
            .validate(&params)
            .map_err(|reason| EngineError::BadCommand { reason })?;
        self.pending.lock().push(QueuedCommand {
            name: name.to_owned(),
            module: resolved.module,
            args,
        });
        Ok(())
    }

    /// Take the queued batch in FIFO order, leaving the queue empty.
    ///
    /// The tick worker calls this exactly once at the start of a tick, so
    /// commands enqueued while the tick executes land in the next batch.
    pub fn take(&self) -> Vec<QueuedCommand> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Number of commands currently waiting.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Record a handler failure in the bounded ring (drop-oldest).
    pub fn record_fault(&self, tick: u64, command: &str, message: String) {
        tracing::warn!(tick, command, %message, "command handler failed");
        let mut faults = self.faults.lock();
        if faults.len() == self.fault_capacity {
            faults.pop_front();
        }
        faults.push_back(CommandFault {
            tick,
            command: command.to_owned(),
            message,
        });
        self.faults_total.fetch_add(1, Ordering::Relaxed);
    }

    /// The retained fault log, oldest first.
    pub fn faults(&self) -> Vec<CommandFault> {
        self.faults.lock().iter().cloned().collect()
    }

    /// Total faults ever recorded, including ones the ring dropped.
    pub fn faults_total(&self) -> u64 {
        self.faults_total.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("pending", &self.pending_len())
            .field("faults_total", &self.faults_total())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
