//! Durable snapshot sink hook.
//!
//! The core does not persist snapshots itself; it offers a single-producer
//! queue per container that hands encoded snapshot bytes to an external
//! [`SnapshotSink`] on a dedicated drainer thread. The queue is bounded
//! with a drop-oldest policy: when the sink falls behind, the oldest
//! undelivered snapshot is discarded and counted, and the tick worker never
//! blocks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, RwLock};

use squall_ecs::entity::MatchId;

// ---------------------------------------------------------------------------
// SnapshotSink trait
// ---------------------------------------------------------------------------

/// External durable storage for snapshot bytes.
pub trait SnapshotSink: Send + Sync {
    /// Persist one encoded snapshot. Failures are logged and counted; they
    /// never reach the simulation worker.
    fn persist(&self, match_id: MatchId, tick: u64, bytes: &[u8]) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// SinkQueue
// ---------------------------------------------------------------------------

struct SinkJob {
    match_id: MatchId,
    tick: u64,
    bytes: Vec<u8>,
}

struct SinkShared {
    queue: Mutex<std::collections::VecDeque<SinkJob>>,
    available: Condvar,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
    persisted: AtomicU64,
    failures: AtomicU64,
    sink: RwLock<Option<Arc<dyn SnapshotSink>>>,
}

/// Bounded single-producer queue feeding the container's snapshot sink.
pub struct SinkQueue {
    shared: Arc<SinkShared>,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

impl SinkQueue {
    /// Spawn a queue retaining at most `capacity` undelivered snapshots.
    pub fn spawn(capacity: usize) -> Self {
        let shared = Arc::new(SinkShared {
            queue: Mutex::new(std::collections::VecDeque::new()),
            available: Condvar::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            sink: RwLock::new(None),
        });
        let drainer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("snapshot-sink".to_owned())
                .spawn(move || drain_loop(shared))
                .expect("failed to spawn snapshot sink thread")
        };
        Self {
            shared,
            drainer: Mutex::new(Some(drainer)),
        }
    }

    /// Install (or replace) the destination sink.
    pub fn set_sink(&self, sink: Arc<dyn SnapshotSink>) {
        *self.shared.sink.write() = Some(sink);
    }

    /// Whether a destination sink is installed. The tick worker skips
    /// snapshot encoding entirely when there is nowhere to deliver.
    pub fn is_active(&self) -> bool {
        self.shared.sink.read().is_some()
    }

    /// Enqueue encoded snapshot bytes without blocking. When the queue is
    /// full the oldest entry is dropped and counted.
    pub fn push(&self, match_id: MatchId, tick: u64, bytes: Vec<u8>) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.shared.queue.lock();
        if queue.len() == self.shared.capacity {
            queue.pop_front();
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%match_id, tick, "snapshot sink backlogged; oldest snapshot dropped");
        }
        queue.push_back(SinkJob {
            match_id,
            tick,
            bytes,
        });
        self.shared.available.notify_one();
    }

    /// Snapshots discarded because the sink fell behind.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Snapshots successfully handed to the sink.
    pub fn persisted(&self) -> u64 {
        self.shared.persisted.load(Ordering::Relaxed)
    }

    /// Sink invocations that returned an error.
    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    /// Stop the drainer after it delivers everything already queued.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.available.notify_all();
        if let Some(handle) = self.drainer.lock().take() {
            let _ = handle.join();
        }
    }
}

fn drain_loop(shared: Arc<SinkShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if shared.closed.load(Ordering::Acquire) {
                    break None;
                }
                shared.available.wait(&mut queue);
            }
        };
        let Some(job) = job else { return };

        let sink = shared.sink.read().clone();
        if let Some(sink) = sink {
            match sink.persist(job.match_id, job.tick, &job.bytes) {
                Ok(()) => {
                    shared.persisted.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    shared.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        match_id = %job.match_id,
                        tick = job.tick,
                        error = %err,
                        "snapshot sink persist failed"
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MemorySink {
        records: PlMutex<Vec<(MatchId, u64, usize)>>,
    }

    impl SnapshotSink for MemorySink {
        fn persist(&self, match_id: MatchId, tick: u64, bytes: &[u8]) -> anyhow::Result<()> {
            self.records.lock().push((match_id, tick, bytes.len()));
            Ok(())
        }
    }

    struct FailingSink;

    impl SnapshotSink for FailingSink {
        fn persist(&self, _: MatchId, _: u64, _: &[u8]) -> anyhow::Result<()> {
            anyhow::bail!("disk on fire")
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn jobs_reach_the_sink_in_order() {
        let queue = SinkQueue::spawn(8);
        let sink = Arc::new(MemorySink::default());
        queue.set_sink(sink.clone());

        let m = MatchId::from_raw(1);
        for tick in 1..=3 {
            queue.push(m, tick, vec![0u8; tick as usize]);
        }

        assert!(wait_until(Duration::from_secs(2), || {
            sink.records.lock().len() == 3
        }));
        let records = sink.records.lock();
        assert_eq!(*records, vec![(m, 1, 1), (m, 2, 2), (m, 3, 3)]);
        drop(records);
        queue.shutdown();
        assert_eq!(queue.persisted(), 3);
    }

    #[test]
    fn sink_failures_are_counted_not_fatal() {
        let queue = SinkQueue::spawn(8);
        queue.set_sink(Arc::new(FailingSink));

        queue.push(MatchId::from_raw(1), 1, vec![1]);
        assert!(wait_until(Duration::from_secs(2), || queue.failures() == 1));
        queue.shutdown();
    }

    /// A sink that parks inside `persist` until released, so the test can
    /// back the queue up deterministically.
    struct GatedSink {
        entered_tx: std::sync::mpsc::Sender<()>,
        release_rx: PlMutex<std::sync::mpsc::Receiver<()>>,
        delivered: PlMutex<Vec<u64>>,
    }

    impl SnapshotSink for GatedSink {
        fn persist(&self, _: MatchId, tick: u64, _: &[u8]) -> anyhow::Result<()> {
            let _ = self.entered_tx.send(());
            let _ = self.release_rx.lock().recv();
            self.delivered.lock().push(tick);
            Ok(())
        }
    }

    #[test]
    fn overflow_drops_oldest() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let sink = Arc::new(GatedSink {
            entered_tx,
            release_rx: PlMutex::new(release_rx),
            delivered: PlMutex::new(Vec::new()),
        });

        let queue = SinkQueue::spawn(2);
        queue.set_sink(sink.clone());
        let m = MatchId::from_raw(1);

        // The drainer picks up tick 1 and parks inside persist.
        queue.push(m, 1, vec![]);
        entered_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("drainer never reached the sink");

        // With the drainer stalled, the bound applies: tick 2 is the oldest
        // queued entry and gets dropped when tick 4 arrives.
        queue.push(m, 2, vec![]);
        queue.push(m, 3, vec![]);
        queue.push(m, 4, vec![]);
        assert_eq!(queue.dropped(), 1);

        // Release every delivery and drain.
        for _ in 0..3 {
            let _ = release_tx.send(());
        }
        assert!(wait_until(Duration::from_secs(2), || {
            sink.delivered.lock().len() == 3
        }));
        assert_eq!(*sink.delivered.lock(), vec![1, 3, 4]);
        queue.shutdown();
    }
}
