//! Off-hot-path tick listener dispatch.
//!
//! Tick listeners observe tick completion (and the tick's snapshot, when one
//! was emitted) without ever sharing the simulation worker's stack: the
//! worker pushes events into a bounded channel and returns to the next tick
//! immediately, while a dedicated dispatcher thread invokes the listeners.
//! A listener failure is logged and counted, never propagated; a full
//! channel drops the event and counts the drop rather than back-pressuring
//! the tick.
//!
//! Listeners must not mutate store state. A listener that needs to react
//! goes through the container's command queue like any other caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use squall_ecs::entity::MatchId;

use crate::snapshot::SnapshotPayload;

// ---------------------------------------------------------------------------
// Listener trait & event
// ---------------------------------------------------------------------------

/// Observer of completed ticks.
pub trait TickListener: Send + Sync {
    /// Called once per match per completed tick, off the simulation worker.
    ///
    /// `snapshot` is the payload emitted for this match this tick, when
    /// snapshot-on-tick is configured.
    fn on_tick_complete(
        &self,
        match_id: MatchId,
        tick: u64,
        snapshot: Option<&SnapshotPayload>,
    ) -> anyhow::Result<()>;
}

/// One dispatched tick-completion event.
#[derive(Debug, Clone)]
pub struct TickEvent {
    /// The match the event describes.
    pub match_id: MatchId,
    /// The completed tick.
    pub tick: u64,
    /// The snapshot emitted for the match this tick, if any.
    pub snapshot: Option<Arc<SnapshotPayload>>,
}

// ---------------------------------------------------------------------------
// ListenerHub
// ---------------------------------------------------------------------------

struct HubShared {
    listeners: RwLock<Vec<Arc<dyn TickListener>>>,
    dropped: AtomicU64,
    failures: AtomicU64,
}

/// Owns the dispatcher thread and the registered listener set.
pub struct ListenerHub {
    shared: Arc<HubShared>,
    tx: Mutex<Option<SyncSender<TickEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerHub {
    /// Spawn a hub whose channel holds at most `capacity` undelivered
    /// events.
    pub fn spawn(capacity: usize) -> Self {
        let shared = Arc::new(HubShared {
            listeners: RwLock::new(Vec::new()),
            dropped: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });
        let (tx, rx) = sync_channel(capacity.max(1));
        let dispatcher = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("tick-listeners".to_owned())
                .spawn(move || dispatch_loop(rx, shared))
                .expect("failed to spawn listener dispatcher thread")
        };
        Self {
            shared,
            tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Register a listener for all future events.
    pub fn add(&self, listener: Arc<dyn TickListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Publish an event without blocking.
    ///
    /// If the dispatcher has fallen behind and the channel is full, the
    /// event is dropped and counted; the tick never waits. Publishing after
    /// shutdown is a silent no-op.
    pub fn publish(&self, event: TickEvent) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else { return };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    match_id = %event.match_id,
                    tick = event.tick,
                    "listener queue full; tick event dropped"
                );
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Events dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Listener invocations that returned an error.
    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    /// Stop the dispatcher after it delivers everything already queued.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }
}

fn dispatch_loop(rx: Receiver<TickEvent>, shared: Arc<HubShared>) {
    while let Ok(event) = rx.recv() {
        let listeners = shared.listeners.read().clone();
        for listener in listeners {
            let result = listener.on_tick_complete(
                event.match_id,
                event.tick,
                event.snapshot.as_deref(),
            );
            if let Err(err) = result {
                shared.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    match_id = %event.match_id,
                    tick = event.tick,
                    error = %err,
                    "tick listener failed"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
