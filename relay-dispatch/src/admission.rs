use crate::error::StoreResult;
use crate::store::{BoundedIncr, CounterStore, KeySpace};
use crate::types::ThreadId;
use std::sync::Arc;

/// Proof that one unit of work was admitted. Hand it back to
/// [`AdmissionController::release`] exactly once when the unit completes.
#[derive(Debug)]
#[must_use = "an admitted unit must be released when it completes"]
pub struct AdmissionTicket {
    thread_id: Option<ThreadId>,
    depth: i64,
}

impl AdmissionTicket {
    pub fn thread_id(&self) -> Option<&ThreadId> {
        self.thread_id.as_ref()
    }

    /// Thread depth right after this admission (0 for a new conversation).
    pub fn depth(&self) -> i64 {
        self.depth
    }

    /// Whether this admission took a slot in a distributed depth counter.
    pub fn is_counted(&self) -> bool {
        self.thread_id.is_some()
    }
}

#[derive(Debug)]
pub enum Admission {
    Admitted(AdmissionTicket),
    Rejected { depth: i64 },
}

impl Admission {
    pub fn admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    pub fn current_depth(&self) -> i64 {
        match self {
            Self::Admitted(ticket) => ticket.depth,
            Self::Rejected { depth } => *depth,
        }
    }
}

/// Bounds how many units may be queued or in flight per thread, across every process
/// sharing the store.
#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn CounterStore>,
    keys: KeySpace,
    max_depth: i64,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn CounterStore>, keys: KeySpace, max_depth: i64) -> Self {
        Self {
            store,
            keys,
            max_depth: max_depth.max(1),
        }
    }

    pub fn max_depth(&self) -> i64 {
        self.max_depth
    }

    /// A new conversation (no thread yet) is always admitted and never counted.
    #[tracing::instrument(level = "debug", skip_all, fields(thread_id = ?thread_id.map(ThreadId::as_str)))]
    pub async fn try_admit(&self, thread_id: Option<&ThreadId>) -> StoreResult<Admission> {
        let Some(thread_id) = thread_id else {
            return Ok(Admission::Admitted(AdmissionTicket {
                thread_id: None,
                depth: 0,
            }));
        };

        let key = self.keys.thread_depth(thread_id);
        match self.store.incr_below(&key, self.max_depth).await? {
            BoundedIncr::Incremented(depth) => {
                tracing::debug!(depth, "unit admitted");
                Ok(Admission::Admitted(AdmissionTicket {
                    thread_id: Some(thread_id.clone()),
                    depth,
                }))
            }
            BoundedIncr::AtLimit(depth) => {
                tracing::info!(depth, max_depth = self.max_depth, "thread queue full; unit rejected");
                Ok(Admission::Rejected { depth })
            }
        }
    }

    /// Gives the ticket's slot back. Returns the remaining depth; the counter key is gone
    /// once that reaches zero.
    #[tracing::instrument(level = "debug", skip_all, fields(thread_id = ?ticket.thread_id.as_ref().map(ThreadId::as_str)))]
    pub async fn release(&self, ticket: AdmissionTicket) -> StoreResult<i64> {
        let Some(thread_id) = ticket.thread_id else {
            return Ok(0);
        };
        let key = self.keys.thread_depth(&thread_id);
        let remaining = self.store.decr_delete_at_zero(&key).await?;
        if remaining < 0 {
            tracing::warn!(remaining, "released a thread slot that was not held");
        }
        Ok(remaining.max(0))
    }

    pub async fn depth(&self, thread_id: &ThreadId) -> StoreResult<i64> {
        self.store.counter(&self.keys.thread_depth(thread_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn controller() -> (Arc<MemoryStore>, AdmissionController) {
        let store = Arc::new(MemoryStore::new());
        let admission = AdmissionController::new(store.clone(), KeySpace::default(), 3);
        (store, admission)
    }

    fn ticket(admission: Admission) -> AdmissionTicket {
        match admission {
            Admission::Admitted(ticket) => ticket,
            Admission::Rejected { depth } => panic!("unexpected rejection at depth {depth}"),
        }
    }

    #[tokio::test]
    async fn fourth_admission_is_rejected_while_other_threads_proceed() {
        let (_store, admission) = controller();
        let t1 = ThreadId::new("T1");
        let mut held = Vec::new();
        for expected in 1..=3 {
            let admitted = admission.try_admit(Some(&t1)).await.expect("admit");
            assert!(admitted.admitted());
            assert_eq!(admitted.current_depth(), expected);
            held.push(ticket(admitted));
        }

        let fourth = admission.try_admit(Some(&t1)).await.expect("admit");
        assert!(!fourth.admitted());
        assert_eq!(fourth.current_depth(), 3);

        let t2 = admission
            .try_admit(Some(&ThreadId::new("T2")))
            .await
            .expect("admit");
        assert!(t2.admitted());
        assert_eq!(t2.current_depth(), 1);
    }

    #[tokio::test]
    async fn new_conversation_is_always_admitted_and_never_counted() {
        let (store, admission) = controller();
        for _ in 0..10 {
            let admitted = ticket(admission.try_admit(None).await.expect("admit"));
            assert!(!admitted.is_counted());
            assert_eq!(admitted.depth(), 0);
            assert_eq!(admission.release(admitted).await.expect("release"), 0);
        }
        assert_eq!(store.counter_count(), 0);
    }

    #[tokio::test]
    async fn releasing_every_admission_leaves_no_key() {
        let (store, admission) = controller();
        let thread = ThreadId::new("T1");
        let a = ticket(admission.try_admit(Some(&thread)).await.expect("admit"));
        let b = ticket(admission.try_admit(Some(&thread)).await.expect("admit"));

        assert_eq!(admission.release(a).await.expect("release"), 1);
        assert_eq!(admission.depth(&thread).await.expect("depth"), 1);
        assert_eq!(admission.release(b).await.expect("release"), 0);
        assert!(!store.has_counter(&KeySpace::default().thread_depth(&thread)));

        let again = admission.try_admit(Some(&thread)).await.expect("admit");
        assert_eq!(again.current_depth(), 1);
    }

    #[tokio::test]
    async fn release_reopens_a_full_thread() {
        let (_store, admission) = controller();
        let thread = ThreadId::new("T1");
        let first = ticket(admission.try_admit(Some(&thread)).await.expect("admit"));
        let _second = ticket(admission.try_admit(Some(&thread)).await.expect("admit"));
        let _third = ticket(admission.try_admit(Some(&thread)).await.expect("admit"));
        assert!(!admission.try_admit(Some(&thread)).await.expect("admit").admitted());

        admission.release(first).await.expect("release");
        assert!(admission.try_admit(Some(&thread)).await.expect("admit").admitted());
    }
}
