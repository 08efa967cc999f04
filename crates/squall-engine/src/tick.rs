//! The per-container tick worker.
//!
//! Exactly one thread advances a container's simulation. Each tick runs a
//! fixed cycle: drain the command queue (FIFO), run the registry's systems
//! in dependency order, increment the tick counter, hand tick events to the
//! listener dispatcher (off this thread), and emit per-match snapshots when
//! configured.
//!
//! `advance()` is synchronous from the caller's perspective: the request is
//! handed to the worker and the caller blocks on the reply. Auto-advance
//! schedules ticks at a fixed cadence on the same worker; when a tick
//! overruns its slot, the missed slots are skipped, never queued.
//!
//! A system failure is fatal to the tick: the tick aborts, the container
//! transitions to the fault-held state, and only `stop()` is accepted
//! afterwards.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use squall_ecs::component::ModuleId;
use squall_ecs::store::Store;

use crate::command::CommandQueue;
use crate::container::ContainerState;
use crate::listener::{ListenerHub, TickEvent};
use crate::module::ModuleRegistry;
use crate::sink::SinkQueue;
use crate::snapshot::{SnapshotMode, SnapshotPayload, Snapshotter};
use crate::EngineError;

// ---------------------------------------------------------------------------
// TickContext
// ---------------------------------------------------------------------------

/// Everything one tick needs, shared with the worker thread.
pub struct TickContext {
    /// The container's store.
    pub store: Arc<Store>,
    /// The swappable module registry; loaded once per tick.
    pub registry: Arc<ArcSwap<ModuleRegistry>>,
    /// The container's command queue.
    pub queue: Arc<CommandQueue>,
    /// The container's snapshotter.
    pub snapshotter: Arc<Snapshotter>,
    /// Off-hot-path listener dispatch.
    pub listeners: Arc<ListenerHub>,
    /// Durable snapshot hand-off.
    pub sink: Arc<SinkQueue>,
    /// Per-tick snapshot emission, if configured.
    pub snapshot_mode: Option<SnapshotMode>,
    /// The owning container's state, for the fault transition.
    pub state: Arc<Mutex<ContainerState>>,
}

// ---------------------------------------------------------------------------
// Worker messages
// ---------------------------------------------------------------------------

enum ControlMsg {
    Advance(Sender<Result<u64, EngineError>>),
    StartAuto(Duration),
    StopAuto,
    Shutdown,
}

struct AutoState {
    interval: Duration,
    next_due: Instant,
}

// ---------------------------------------------------------------------------
// TickController
// ---------------------------------------------------------------------------

/// Handle to a container's simulation worker.
pub struct TickController {
    tx: Sender<ControlMsg>,
    worker: Mutex<Option<JoinHandle<()>>>,
    current: Arc<AtomicU64>,
    faulted: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
}

impl TickController {
    /// Spawn the worker for `ctx`. The tick counter starts at 0.
    pub fn spawn(ctx: TickContext) -> Self {
        let current = Arc::new(AtomicU64::new(0));
        let faulted = Arc::new(AtomicBool::new(false));
        let skipped = Arc::new(AtomicU64::new(0));
        let (tx, rx) = channel();

        let worker = {
            let current = Arc::clone(&current);
            let faulted = Arc::clone(&faulted);
            let skipped = Arc::clone(&skipped);
            std::thread::Builder::new()
                .name("tick-worker".to_owned())
                .spawn(move || worker_loop(ctx, rx, current, faulted, skipped))
                .expect("failed to spawn tick worker thread")
        };

        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            current,
            faulted,
            skipped,
        }
    }

    /// Execute exactly one tick and return the new tick number.
    ///
    /// The tick runs on the worker; this call blocks until it completes.
    pub fn advance(&self) -> Result<u64, EngineError> {
        let (reply_tx, reply_rx) = channel();
        self.tx
            .send(ControlMsg::Advance(reply_tx))
            .map_err(|_| worker_gone())?;
        reply_rx.recv().map_err(|_| worker_gone())?
    }

    /// Begin scheduling ticks every `interval`. Returns immediately.
    ///
    /// A tick still running when the next slot is due causes that slot to be
    /// skipped (never queued).
    pub fn start_auto(&self, interval: Duration) {
        let _ = self.tx.send(ControlMsg::StartAuto(interval));
    }

    /// Halt scheduled ticks. A tick currently executing completes.
    pub fn stop_auto(&self) {
        let _ = self.tx.send(ControlMsg::StopAuto);
    }

    /// The last completed tick number.
    pub fn current_tick(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Whether a system failure fault-held the container.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Auto-advance slots skipped because the previous tick overran.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Stop the worker. Any tick currently executing completes first.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ControlMsg::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for TickController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickController")
            .field("current_tick", &self.current_tick())
            .field("faulted", &self.is_faulted())
            .finish()
    }
}

fn worker_gone() -> EngineError {
    EngineError::InvalidState {
        current: ContainerState::Stopped,
        attempted: ContainerState::Running,
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

fn worker_loop(
    ctx: TickContext,
    rx: Receiver<ControlMsg>,
    current: Arc<AtomicU64>,
    faulted: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
) {
    let mut auto: Option<AutoState> = None;

    loop {
        let message = match &auto {
            Some(state) => {
                let wait = state.next_due.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match rx.recv() {
                Ok(message) => Some(message),
                Err(_) => return,
            },
        };

        match message {
            Some(ControlMsg::Advance(reply)) => {
                let result = run_tick(&ctx, &current, &faulted);
                let _ = reply.send(result);
            }
            Some(ControlMsg::StartAuto(interval)) => {
                auto = Some(AutoState {
                    interval,
                    next_due: Instant::now() + interval,
                });
            }
            Some(ControlMsg::StopAuto) => {
                auto = None;
            }
            Some(ControlMsg::Shutdown) => return,
            // The cadence timer fired.
            None => {
                if let Err(err) = run_tick(&ctx, &current, &faulted) {
                    tracing::error!(error = %err, "auto-advance tick failed");
                }
                if let Some(state) = &mut auto {
                    state.next_due += state.interval;
                    let now = Instant::now();
                    while state.next_due <= now {
                        state.next_due += state.interval;
                        skipped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        if faulted.load(Ordering::Acquire) {
            auto = None;
        }
    }
}

/// One full tick cycle. On a system failure the tick aborts, the container
/// is fault-held, and the error is returned.
fn run_tick(
    ctx: &TickContext,
    current: &AtomicU64,
    faulted: &AtomicBool,
) -> Result<u64, EngineError> {
    if faulted.load(Ordering::Acquire) {
        return Err(EngineError::InvalidState {
            current: ContainerState::Faulted,
            attempted: ContainerState::Running,
        });
    }

    let tick = current.load(Ordering::Acquire) + 1;
    let registry = ctx.registry.load_full();
    let batch = ctx.queue.take();

    let mut w = ctx.store.write(ModuleId::CORE);

    // Phase 1: drain commands in FIFO order. Handler failures go to the
    // bounded fault log and the drain continues.
    registry.run_drain(&mut w, tick, batch, |command, message| {
        ctx.queue.record_fault(tick, command, message);
    });

    // Phase 2: systems in dependency order. A failure aborts the tick.
    for system in registry.systems() {
        w.set_origin(system.module);
        if let Err(err) = (system.run)(&mut w, tick) {
            drop(w);
            faulted.store(true, Ordering::Release);
            let mut state = ctx.state.lock();
            if !matches!(*state, ContainerState::Stopping | ContainerState::Stopped) {
                *state = ContainerState::Faulted;
            }
            tracing::error!(system = %system.name, error = %err, "system failed; tick aborted");
            return Err(EngineError::SystemFailure {
                system: system.name.clone(),
                message: err.to_string(),
            });
        }
    }

    // Phase 3: the tick is committed.
    current.store(tick, Ordering::Release);

    // Phase 4/5: emit snapshots while the end-of-tick state is still
    // exclusively held, then notify listeners off this thread.
    let matches = w.matches();
    let mut emitted: Vec<(squall_ecs::entity::MatchId, Arc<SnapshotPayload>)> = Vec::new();
    if let Some(mode) = ctx.snapshot_mode {
        for &match_id in &matches {
            let payload = match mode {
                SnapshotMode::Full => ctx
                    .snapshotter
                    .full_with(&mut w, match_id, tick)
                    .map(SnapshotPayload::Full),
                SnapshotMode::Delta => {
                    let from = ctx.snapshotter.window_start(match_id);
                    ctx.snapshotter
                        .delta_with(&mut w, match_id, from, tick)
                        .map(SnapshotPayload::Delta)
                }
            };
            match payload {
                Ok(payload) => emitted.push((match_id, Arc::new(payload))),
                Err(err) => {
                    tracing::warn!(%match_id, tick, error = %err, "snapshot emission failed");
                }
            }
        }
    }
    drop(w);

    for &match_id in &matches {
        let snapshot = emitted
            .iter()
            .find(|(m, _)| *m == match_id)
            .map(|(_, payload)| Arc::clone(payload));
        ctx.listeners.publish(TickEvent {
            match_id,
            tick,
            snapshot,
        });
    }
    if ctx.sink.is_active() {
        for (match_id, payload) in emitted {
            ctx.sink.push(match_id, tick, payload.to_bytes());
        }
    }

    Ok(tick)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandSchema, ParamSpec, ParamType};
    use crate::module::ModuleDescriptor;
    use crate::CommandError;
    use squall_ecs::prelude::*;
    use serde_json::json;

    fn context(descriptors: Vec<ModuleDescriptor>, mode: Option<SnapshotMode>) -> TickContext {
        let store = Arc::new(Store::new());
        let registry = ModuleRegistry::build(&store, descriptors).unwrap();
        TickContext {
            snapshotter: Arc::new(Snapshotter::new(Arc::clone(&store))),
            store,
            registry: Arc::new(ArcSwap::from_pointee(registry)),
            queue: Arc::new(CommandQueue::new(16)),
            listeners: Arc::new(ListenerHub::spawn(16)),
            sink: Arc::new(SinkQueue::spawn(16)),
            snapshot_mode: mode,
            state: Arc::new(Mutex::new(ContainerState::Running)),
        }
    }

    fn counter_module() -> ModuleDescriptor {
        ModuleDescriptor::new("game")
            .component("COUNTER", PermissionLevel::Write)
            .command(
                "seed",
                CommandSchema::new().param(ParamSpec::required("matchId", ParamType::Entity)),
                |w, _tick, args| {
                    let m = args
                        .get_match("matchId")
                        .ok_or_else(|| CommandError::new("matchId out of range"))?;
                    let e = w.spawn(m)?;
                    let counter = w.lookup("COUNTER")?;
                    w.set(e, counter, 0.0)?;
                    Ok(())
                },
            )
            .system("count_up", |w, _tick| {
                let counter = w.lookup("COUNTER")?;
                for e in w.query(&[counter]) {
                    let value = w.get(e, counter)?.unwrap_or(0.0);
                    w.set(e, counter, value + 1.0)?;
                }
                Ok(())
            })
    }

    #[test]
    fn advance_runs_commands_then_systems() {
        let ctx = context(vec![counter_module()], None);
        let store = Arc::clone(&ctx.store);
        let queue = Arc::clone(&ctx.queue);
        let registry = Arc::clone(&ctx.registry);

        let m = store.write(ModuleId::CORE).create_match();
        let controller = TickController::spawn(ctx);

        queue
            .enqueue(
                &registry.load(),
                "seed",
                json!({"matchId": m.to_raw()}),
            )
            .unwrap();

        // Tick 1: the seed command spawns at counter 0, then the system
        // increments it within the same tick.
        assert_eq!(controller.advance().unwrap(), 1);
        let r = store.read();
        let counter = r.lookup("COUNTER").unwrap();
        let entities = r.entities_in_match(m);
        assert_eq!(entities.len(), 1);
        assert_eq!(r.get(entities[0], counter).unwrap(), Some(1.0));
        drop(r);

        assert_eq!(controller.advance().unwrap(), 2);
        let r = store.read();
        assert_eq!(r.get(r.entities_in_match(m)[0], counter).unwrap(), Some(2.0));
        drop(r);

        controller.shutdown();
    }

    #[test]
    fn handler_fault_does_not_stop_the_drain() {
        let module = ModuleDescriptor::new("game")
            .component("SCORE", PermissionLevel::Write)
            .command("boom", CommandSchema::new(), |_w, _tick, _args| {
                Err(CommandError::new("always fails"))
            })
            .command(
                "score",
                CommandSchema::new().param(ParamSpec::required("matchId", ParamType::Entity)),
                |w, _tick, args| {
                    let m = args
                        .get_match("matchId")
                        .ok_or_else(|| CommandError::new("matchId out of range"))?;
                    let e = w.spawn(m)?;
                    let score = w.lookup("SCORE")?;
                    w.set(e, score, 10.0)?;
                    Ok(())
                },
            );
        let ctx = context(vec![module], None);
        let store = Arc::clone(&ctx.store);
        let queue = Arc::clone(&ctx.queue);
        let registry = Arc::clone(&ctx.registry);

        let m = store.write(ModuleId::CORE).create_match();
        let controller = TickController::spawn(ctx);

        queue.enqueue(&registry.load(), "boom", json!({})).unwrap();
        queue
            .enqueue(&registry.load(), "score", json!({"matchId": m.to_raw()}))
            .unwrap();

        controller.advance().unwrap();
        assert_eq!(queue.faults_total(), 1);
        assert_eq!(store.read().entities_in_match(m).len(), 1);
        controller.shutdown();
    }

    #[test]
    fn system_failure_faults_the_container() {
        let module = ModuleDescriptor::new("game").system("explode", |_w, _tick| {
            Err(crate::SystemError::new("kaboom"))
        });
        let ctx = context(vec![module], None);
        let state = Arc::clone(&ctx.state);
        let controller = TickController::spawn(ctx);

        let err = controller.advance().unwrap_err();
        assert!(matches!(err, EngineError::SystemFailure { .. }));
        assert!(controller.is_faulted());
        assert_eq!(*state.lock(), ContainerState::Faulted);
        // The counter never moved, and further ticks are refused.
        assert_eq!(controller.current_tick(), 0);
        assert!(matches!(
            controller.advance(),
            Err(EngineError::InvalidState { .. })
        ));
        controller.shutdown();
    }

    #[test]
    fn auto_advance_ticks_and_stops() {
        let ctx = context(vec![counter_module()], None);
        let store = Arc::clone(&ctx.store);
        let _m = store.write(ModuleId::CORE).create_match();
        let controller = TickController::spawn(ctx);

        controller.start_auto(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(120));
        let after_run = controller.current_tick();
        assert!(after_run >= 9, "expected >=9 ticks, got {after_run}");

        controller.stop_auto();
        // Let any in-flight tick complete, then verify stability.
        std::thread::sleep(Duration::from_millis(30));
        let settled = controller.current_tick();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(controller.current_tick(), settled);
        controller.shutdown();
    }

    #[test]
    fn snapshot_on_tick_reaches_listeners() {
        use crate::listener::TickListener;
        use parking_lot::Mutex as PlMutex;

        struct Capture {
            snapshots: PlMutex<Vec<(u64, bool)>>,
        }
        impl TickListener for Capture {
            fn on_tick_complete(
                &self,
                _match_id: MatchId,
                tick: u64,
                snapshot: Option<&SnapshotPayload>,
            ) -> anyhow::Result<()> {
                self.snapshots.lock().push((tick, snapshot.is_some()));
                Ok(())
            }
        }

        let ctx = context(vec![counter_module()], Some(SnapshotMode::Full));
        let store = Arc::clone(&ctx.store);
        let listeners = Arc::clone(&ctx.listeners);
        let capture = Arc::new(Capture {
            snapshots: PlMutex::new(Vec::new()),
        });
        listeners.add(capture.clone());

        let _m = store.write(ModuleId::CORE).create_match();
        let controller = TickController::spawn(ctx);
        controller.advance().unwrap();
        controller.advance().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while capture.snapshots.lock().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let seen = capture.snapshots.lock().clone();
        assert_eq!(seen, vec![(1, true), (2, true)]);
        controller.shutdown();
    }
}
