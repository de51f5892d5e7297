use crate::active_set::ActiveSetTracker;
use crate::admission::{Admission, AdmissionController};
use crate::error::DispatchError;
use crate::processor::{Job, RequestProcessor};
use crate::queue::SequentialQueue;
use crate::resolver::ThreadResolver;
use crate::store::{CounterStore, KeySpace};
use crate::types::ThreadId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relay_channels::{ChatId, InboundMessage};
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    /// Queued plus in-flight units allowed per thread.
    pub max_thread_depth: i64,
    /// Active-chat cardinality at which a newly active chat is warned.
    pub congestion_threshold: u64,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_thread_depth: 3,
            congestion_threshold: 3,
        }
    }
}

/// How one unit ended, after its cleanup ran.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub unit_id: Uuid,
    pub succeeded: bool,
    /// This unit was the last one queued under its key in this process.
    pub drained: bool,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct UnitHandle {
    unit_id: Uuid,
    queue_key: String,
    handle: JoinHandle<UnitReport>,
}

impl UnitHandle {
    pub fn unit_id(&self) -> Uuid {
        self.unit_id
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    /// Resolves once the unit ran and its admission slot was given back.
    pub async fn wait(self) -> Result<UnitReport, JoinError> {
        self.handle.await
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Enqueued {
        /// The sender should be told replies may be slow.
        congested: bool,
        unit: UnitHandle,
    },
    /// The thread already holds its maximum number of units.
    Rejected { depth: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSnapshot {
    pub pending_chains: usize,
    /// `None` when the store could not be read.
    pub active_chats: Option<u64>,
}

/// Runs inbound messages through resolution, admission, the active set and the queue.
pub struct Dispatcher {
    resolver: ThreadResolver,
    admission: AdmissionController,
    active: ActiveSetTracker,
    queue: SequentialQueue,
    /// Units this process still owns per chat, across every queue key. The chat leaves the
    /// active set when its count here reaches zero.
    chat_units: Arc<DashMap<String, usize>>,
    processor: Arc<dyn RequestProcessor>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn CounterStore>,
        keys: KeySpace,
        limits: DispatchLimits,
        processor: Arc<dyn RequestProcessor>,
    ) -> Self {
        Self {
            resolver: ThreadResolver::new(store.clone(), &keys),
            active: ActiveSetTracker::new(store.clone(), &keys, limits.congestion_threshold),
            admission: AdmissionController::new(store, keys, limits.max_thread_depth),
            queue: SequentialQueue::new(),
            chat_units: Arc::new(DashMap::new()),
            processor,
        }
    }

    pub fn resolver(&self) -> &ThreadResolver {
        &self.resolver
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(chat_id = %message.chat_id, message_id = %message.message_id)
    )]
    pub async fn dispatch(&self, message: &InboundMessage) -> Result<DispatchOutcome, DispatchError> {
        let chat_id = message.chat_id.clone();
        let thread_id = self.resolver.resolve(&chat_id).await;

        let ticket = match self
            .admission
            .try_admit(thread_id.as_ref())
            .await
            .map_err(DispatchError::Admission)?
        {
            Admission::Admitted(ticket) => ticket,
            Admission::Rejected { depth } => return Ok(DispatchOutcome::Rejected { depth }),
        };

        // Counted before the chat is marked, so a finishing unit of the same chat cannot
        // clear the membership this request is about to rely on.
        *self.chat_units.entry(chat_id.to_string()).or_insert(0) += 1;
        let activation = match self.active.mark_active(&chat_id).await {
            Ok(activation) => activation,
            Err(e) => {
                release_chat_unit(&self.chat_units, &chat_id);
                if let Err(release_err) = self.admission.release(ticket).await {
                    tracing::error!(%release_err, "failed to release slot of a dropped request");
                }
                return Err(DispatchError::ActiveSet(e));
            }
        };
        let congested = self.active.should_warn(&activation);
        if congested {
            tracing::info!(
                active_chats = activation.cardinality,
                "chat joined a congested active set"
            );
        }

        let queue_key = self.queue_key(&chat_id, thread_id.as_ref());
        let unit_id = Uuid::new_v4();
        let job = Job {
            unit_id,
            chat_id: chat_id.clone(),
            message_id: message.message_id.clone(),
            text: message.content.clone(),
            thread_id,
        };

        let processor = self.processor.clone();
        let unit = self
            .queue
            .enqueue(queue_key.clone(), async move { processor.process(job).await });
        tracing::debug!(
            queue_key = %queue_key,
            chained = unit.chained,
            active_chats = activation.cardinality,
            "unit enqueued"
        );

        let seq = unit.seq;
        let admission = self.admission.clone();
        let active = self.active.clone();
        let queue = self.queue.clone();
        let chat_units = self.chat_units.clone();
        let key = queue_key.clone();
        let handle = tokio::spawn(async move {
            let (error, drained) = match unit.handle.await {
                Ok(settled) => {
                    let error = match settled.outcome {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(format!("{e:#}")),
                        Err(panicked) => Some(panicked.to_string()),
                    };
                    (error, settled.drained)
                }
                // The queue task itself was lost; make sure its tail does not linger.
                Err(join_err) => (Some(join_err.to_string()), queue.abandon(&key, seq)),
            };
            if let Some(error) = &error {
                tracing::error!(%unit_id, queue_key = %key, error = %error, "unit of work failed");
            }

            if let Err(e) = admission.release(ticket).await {
                tracing::error!(%unit_id, %e, "failed to release thread slot");
            }

            if release_chat_unit(&chat_units, &chat_id) {
                clear_chat(&active, &chat_units, &chat_id, unit_id).await;
            }

            UnitReport {
                unit_id,
                succeeded: error.is_none(),
                drained,
                error,
            }
        });

        Ok(DispatchOutcome::Enqueued {
            congested,
            unit: UnitHandle {
                unit_id,
                queue_key,
                handle,
            },
        })
    }

    pub async fn snapshot(&self) -> DispatcherSnapshot {
        DispatcherSnapshot {
            pending_chains: self.queue.pending_keys(),
            active_chats: self.active.cardinality().await.ok(),
        }
    }

    /// Messages of a chat whose thread does not exist yet share a provisional chain. Until
    /// that chain drains, later messages of the chat join it too, so they run after the
    /// unit that creates the thread.
    fn queue_key(&self, chat_id: &ChatId, thread_id: Option<&ThreadId>) -> String {
        let provisional = format!("chat:{chat_id}");
        if self.queue.is_pending(&provisional) {
            return provisional;
        }
        match thread_id {
            Some(thread_id) => format!("thread:{thread_id}"),
            None => provisional,
        }
    }
}

/// Takes a chat out of the active set after its last local unit finished.
///
/// A request for the same chat may be counted while the removal is in flight; the chat is
/// put back in that case so the pending unit keeps its membership.
async fn clear_chat(
    active: &ActiveSetTracker,
    chat_units: &DashMap<String, usize>,
    chat_id: &ChatId,
    unit_id: Uuid,
) {
    match active.clear_if_drained(chat_id).await {
        Ok(true) if chat_units.contains_key(chat_id.as_str()) => {
            if let Err(e) = active.mark_active(chat_id).await {
                tracing::error!(%unit_id, %e, "failed to restore chat in active set");
            }
        }
        Ok(_) => {}
        Err(e) => tracing::error!(%unit_id, %e, "failed to clear chat from active set"),
    }
}

/// Returns true when this was the chat's last unit in this process.
fn release_chat_unit(chat_units: &DashMap<String, usize>, chat_id: &ChatId) -> bool {
    match chat_units.entry(chat_id.to_string()) {
        Entry::Occupied(mut entry) => {
            let remaining = entry.get().saturating_sub(1);
            if remaining == 0 {
                entry.remove();
                true
            } else {
                *entry.get_mut() = remaining;
                false
            }
        }
        Entry::Vacant(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{FlakyStore, SlowFirstRelease};
    use async_trait::async_trait;
    use chrono::Utc;
    use relay_channels::{ChannelId, MessageId, SenderId};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Blocks each unit until the test hands out a permit; opens a thread on first use.
    struct GatedProcessor {
        resolver: ThreadResolver,
        gate: Semaphore,
        log: Mutex<Vec<String>>,
        threads_opened: AtomicUsize,
    }

    impl GatedProcessor {
        fn new(store: Arc<dyn CounterStore>) -> Self {
            Self {
                resolver: ThreadResolver::new(store, &KeySpace::default()),
                gate: Semaphore::new(0),
                log: Mutex::new(Vec::new()),
                threads_opened: AtomicUsize::new(0),
            }
        }

        fn open(&self, permits: usize) {
            self.gate.add_permits(permits);
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().expect("log lock").clone()
        }
    }

    #[async_trait]
    impl RequestProcessor for GatedProcessor {
        async fn process(&self, job: Job) -> anyhow::Result<()> {
            self.log.lock().expect("log lock").push(format!("start {}", job.text));
            self.gate.acquire().await.expect("gate").forget();

            let thread = match self.resolver.resolve(&job.chat_id).await {
                Some(thread) => thread,
                None => {
                    let n = self.threads_opened.fetch_add(1, Ordering::SeqCst);
                    let thread = ThreadId::new(format!("conv_{n}"));
                    self.resolver.remember(&job.chat_id, &thread).await?;
                    thread
                }
            };
            self.log
                .lock()
                .expect("log lock")
                .push(format!("end {} on {thread}", job.text));

            match job.text.as_str() {
                "fail" => anyhow::bail!("completion service returned 500"),
                "panic" => panic!("processor exploded"),
                _ => Ok(()),
            }
        }
    }

    struct InstantProcessor;

    #[async_trait]
    impl RequestProcessor for InstantProcessor {
        async fn process(&self, _job: Job) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn message(chat: &str, text: &str) -> InboundMessage {
        InboundMessage {
            message_id: MessageId::new(format!("{chat}-{text}")),
            channel_id: ChannelId::new("telegram"),
            sender_id: SenderId::new("u1"),
            chat_id: ChatId::new(chat),
            is_group: false,
            content: text.to_string(),
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<GatedProcessor>, Dispatcher) {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(GatedProcessor::new(store.clone()));
        let dispatcher = Dispatcher::new(
            store.clone(),
            KeySpace::default(),
            DispatchLimits::default(),
            processor.clone(),
        );
        (store, processor, dispatcher)
    }

    fn enqueued(outcome: DispatchOutcome) -> (bool, UnitHandle) {
        match outcome {
            DispatchOutcome::Enqueued { congested, unit } => (congested, unit),
            DispatchOutcome::Rejected { depth } => panic!("unexpected rejection at depth {depth}"),
        }
    }

    #[tokio::test]
    async fn full_thread_rejects_while_other_threads_and_new_chats_proceed() {
        let (store, processor, dispatcher) = setup();
        let resolver = dispatcher.resolver().clone();
        resolver
            .remember(&ChatId::new("c1"), &ThreadId::new("T1"))
            .await
            .expect("remember");
        resolver
            .remember(&ChatId::new("c2"), &ThreadId::new("T2"))
            .await
            .expect("remember");

        let mut units = Vec::new();
        for text in ["a", "b", "c"] {
            let outcome = dispatcher.dispatch(&message("c1", text)).await.expect("dispatch");
            units.push(enqueued(outcome).1);
        }
        let fourth = dispatcher.dispatch(&message("c1", "d")).await.expect("dispatch");
        assert!(matches!(fourth, DispatchOutcome::Rejected { depth: 3 }));

        let other = dispatcher.dispatch(&message("c2", "x")).await.expect("dispatch");
        units.push(enqueued(other).1);
        let fresh = dispatcher.dispatch(&message("c3", "y")).await.expect("dispatch");
        units.push(enqueued(fresh).1);

        processor.open(16);
        for unit in units {
            assert!(unit.wait().await.expect("join").succeeded);
        }
        assert_eq!(store.counter_count(), 0);
        let snapshot = dispatcher.snapshot().await;
        assert_eq!(snapshot.pending_chains, 0);
        assert_eq!(snapshot.active_chats, Some(0));
    }

    #[tokio::test]
    async fn follow_up_before_first_reply_lands_on_the_new_thread_in_order() {
        let (store, processor, dispatcher) = setup();
        let first = enqueued(dispatcher.dispatch(&message("C1", "m1")).await.expect("dispatch")).1;
        assert_eq!(dispatcher.snapshot().await.active_chats, Some(1));

        let second = enqueued(dispatcher.dispatch(&message("C1", "m2")).await.expect("dispatch")).1;
        assert_eq!(first.queue_key(), second.queue_key());
        assert_eq!(dispatcher.snapshot().await.active_chats, Some(1));

        processor.open(1);
        let report = first.wait().await.expect("join");
        assert!(report.succeeded);
        assert!(!report.drained);
        assert_eq!(dispatcher.snapshot().await.active_chats, Some(1));

        processor.open(1);
        let report = second.wait().await.expect("join");
        assert!(report.drained);
        assert_eq!(dispatcher.snapshot().await.active_chats, Some(0));

        assert_eq!(
            processor.log(),
            vec!["start m1", "end m1 on conv_0", "start m2", "end m2 on conv_0"]
        );
        assert_eq!(processor.threads_opened.load(Ordering::SeqCst), 1);
        assert_eq!(store.counter_count(), 0);

        // The thread now exists, so the next message is counted against it.
        let third = enqueued(dispatcher.dispatch(&message("C1", "m3")).await.expect("dispatch")).1;
        assert_eq!(third.queue_key(), "thread:conv_0");
        assert_eq!(store.counter_count(), 1);
        processor.open(1);
        third.wait().await.expect("join");
        assert_eq!(store.counter_count(), 0);
    }

    #[tokio::test]
    async fn congestion_warns_once_for_the_chat_that_crossed_the_threshold() {
        let (_store, processor, dispatcher) = setup();
        let mut units = Vec::new();
        let mut warnings = Vec::new();
        for (chat, text) in [("a", "1"), ("b", "1"), ("c", "1"), ("c", "2"), ("a", "2")] {
            let (congested, unit) =
                enqueued(dispatcher.dispatch(&message(chat, text)).await.expect("dispatch"));
            warnings.push(congested);
            units.push(unit);
        }
        assert_eq!(warnings, vec![false, false, true, false, false]);

        processor.open(16);
        for unit in units {
            unit.wait().await.expect("join");
        }
        assert_eq!(dispatcher.snapshot().await.active_chats, Some(0));
    }

    #[tokio::test]
    async fn failed_and_panicked_units_still_release_and_drain() {
        let (store, processor, dispatcher) = setup();
        dispatcher
            .resolver()
            .remember(&ChatId::new("c1"), &ThreadId::new("T1"))
            .await
            .expect("remember");

        let mut units = Vec::new();
        for text in ["fail", "panic", "ok"] {
            units.push(enqueued(dispatcher.dispatch(&message("c1", text)).await.expect("dispatch")).1);
        }
        processor.open(3);

        let mut reports = Vec::new();
        for unit in units {
            reports.push(unit.wait().await.expect("join"));
        }
        assert_eq!(
            reports.iter().map(|r| r.succeeded).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert!(reports[0].error.as_deref().is_some_and(|e| e.contains("500")));
        assert!(reports[1].error.as_deref().is_some_and(|e| e.contains("exploded")));
        assert!(reports[2].drained);
        assert_eq!(store.counter_count(), 0);
        assert_eq!(dispatcher.snapshot().await.active_chats, Some(0));
    }

    #[tokio::test]
    async fn store_failures_drop_the_request_without_leaking_a_slot() {
        let store = Arc::new(FlakyStore::new());
        let processor = Arc::new(GatedProcessor::new(store.clone()));
        let dispatcher = Dispatcher::new(
            store.clone(),
            KeySpace::default(),
            DispatchLimits::default(),
            processor.clone(),
        );
        dispatcher
            .resolver()
            .remember(&ChatId::new("c1"), &ThreadId::new("T1"))
            .await
            .expect("remember");

        store.fail_counters(true);
        let err = dispatcher
            .dispatch(&message("c1", "a"))
            .await
            .expect_err("admission must fail");
        assert!(matches!(err, DispatchError::Admission(_)));

        store.fail_counters(false);
        store.fail_sets(true);
        let err = dispatcher
            .dispatch(&message("c1", "b"))
            .await
            .expect_err("active set must fail");
        assert!(matches!(err, DispatchError::ActiveSet(_)));
        assert_eq!(store.inner.counter_count(), 0);
        assert!(processor.log().is_empty());

        // Thread lookup fails open: the message is handled as a new conversation.
        store.fail_sets(false);
        store.fail_hashes(true);
        let unit = enqueued(dispatcher.dispatch(&message("c1", "c")).await.expect("dispatch")).1;
        assert_eq!(unit.queue_key(), "chat:c1");
        assert_eq!(store.inner.counter_count(), 0);
        store.fail_hashes(false);
        processor.open(1);
        unit.wait().await.expect("join");
    }

    #[tokio::test]
    async fn chat_leaves_the_active_set_even_when_the_earlier_release_is_slow() {
        let store = Arc::new(SlowFirstRelease::new(Duration::from_millis(100)));
        let dispatcher = Dispatcher::new(
            store.clone(),
            KeySpace::default(),
            DispatchLimits::default(),
            Arc::new(InstantProcessor),
        );
        dispatcher
            .resolver()
            .remember(&ChatId::new("C1"), &ThreadId::new("T1"))
            .await
            .expect("remember");

        let first = enqueued(dispatcher.dispatch(&message("C1", "m1")).await.expect("dispatch")).1;
        let second = enqueued(dispatcher.dispatch(&message("C1", "m2")).await.expect("dispatch")).1;

        // m1 settles behind m2 on the chain, and its slot release is the slow one, so m2's
        // cleanup finishes first.
        let second = second.wait().await.expect("join");
        let first = first.wait().await.expect("join");
        assert!(!first.drained);
        assert!(second.drained);

        let snapshot = dispatcher.snapshot().await;
        assert_eq!(snapshot.pending_chains, 0);
        assert_eq!(snapshot.active_chats, Some(0));
        assert_eq!(store.inner.counter_count(), 0);
    }

    #[tokio::test]
    async fn two_dispatchers_on_one_store_share_the_thread_limit() {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(GatedProcessor::new(store.clone()));
        let make = || {
            Dispatcher::new(
                store.clone(),
                KeySpace::default(),
                DispatchLimits::default(),
                processor.clone(),
            )
        };
        let (east, west) = (make(), make());
        east.resolver()
            .remember(&ChatId::new("c1"), &ThreadId::new("T1"))
            .await
            .expect("remember");
        let depth_key = KeySpace::default().thread_depth(&ThreadId::new("T1"));

        let mut units = Vec::new();
        for (dispatcher, text) in [(&east, "a"), (&west, "b"), (&east, "c")] {
            units.push(enqueued(dispatcher.dispatch(&message("c1", text)).await.expect("dispatch")).1);
        }
        for (dispatcher, text) in [(&west, "d"), (&east, "e")] {
            let outcome = dispatcher.dispatch(&message("c1", text)).await.expect("dispatch");
            assert!(matches!(outcome, DispatchOutcome::Rejected { depth: 3 }));
        }
        assert_eq!(store.counter(&depth_key).await.expect("counter"), 3);

        processor.open(1);
        units.remove(0).wait().await.expect("join");
        assert_eq!(store.counter(&depth_key).await.expect("counter"), 2);
        // The freed slot is visible to the other process.
        units.push(enqueued(west.dispatch(&message("c1", "f")).await.expect("dispatch")).1);
        let outcome = east.dispatch(&message("c1", "g")).await.expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Rejected { depth: 3 }));

        processor.open(16);
        for unit in units {
            assert!(unit.wait().await.expect("join").succeeded);
        }
        assert!(!store.has_counter(&depth_key));
        assert_eq!(store.counter_count(), 0);
        assert_eq!(east.snapshot().await.active_chats, Some(0));
        assert_eq!(west.snapshot().await.active_chats, Some(0));
    }
}
