//! Per-key sequential execution.
//!
//! Each key keeps one tail: the completion signal of the most recently scheduled unit. A
//! new unit waits for that signal, then replaces it with its own. Distinct keys never wait
//! on each other.

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Fires once when a unit finishes, whatever its outcome. A dropped sender counts as fired.
type CompletionSignal = Shared<BoxFuture<'static, ()>>;

struct Tail {
    seq: u64,
    done: CompletionSignal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unit of work panicked: {0}")]
pub struct UnitPanicked(pub String);

/// What a unit left behind when it finished.
#[derive(Debug)]
pub struct Settled<T> {
    pub key: String,
    pub seq: u64,
    pub outcome: Result<T, UnitPanicked>,
    /// No other unit was chained behind this one; the key's entry is gone.
    pub drained: bool,
}

/// Handle for one scheduled unit.
pub struct QueuedUnit<T> {
    pub key: String,
    pub seq: u64,
    /// Whether the unit had to wait behind an earlier one at scheduling time.
    pub chained: bool,
    pub handle: JoinHandle<Settled<T>>,
}

#[derive(Clone, Default)]
pub struct SequentialQueue {
    tails: Arc<DashMap<String, Tail>>,
    next_seq: Arc<AtomicU64>,
}

impl SequentialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `work` to run after everything already queued under `key`.
    ///
    /// The previous unit's result is never observed; a failed or panicked unit still lets
    /// the next one start.
    pub fn enqueue<F, T>(&self, key: impl Into<String>, work: F) -> QueuedUnit<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let key = key.into();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done: CompletionSignal = done_rx.map(|_| ()).boxed().shared();

        // Atomic swap of the tail under the shard lock.
        let previous = self
            .tails
            .insert(key.clone(), Tail { seq, done })
            .map(|tail| tail.done);
        let chained = previous.is_some();

        let tails = self.tails.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                previous.await;
            }

            let outcome = AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .map_err(|payload| UnitPanicked(panic_message(payload)));

            let drained = tails
                .remove_if(&task_key, |_, tail| tail.seq == seq)
                .is_some();
            let _ = done_tx.send(());

            Settled {
                key: task_key,
                seq,
                outcome,
                drained,
            }
        });

        tracing::trace!(key = %key, seq, chained, "unit enqueued");
        QueuedUnit {
            key,
            seq,
            chained,
            handle,
        }
    }

    /// Drops the key's entry if `seq` is still its tail. For units whose task was lost
    /// before it could clean up after itself.
    pub fn abandon(&self, key: &str, seq: u64) -> bool {
        self.tails.remove_if(key, |_, tail| tail.seq == seq).is_some()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.tails.contains_key(key)
    }

    /// Number of keys with queued or running work.
    pub fn pending_keys(&self) -> usize {
        self.tails.len()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
