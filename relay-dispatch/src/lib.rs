//! Admission control and per-thread dispatch for ThreadRelay.
//!
//! Work for one completion-service thread runs strictly in order inside this process, is
//! bounded in depth across every process sharing the store, and feeds a global active-chat
//! set used to warn users about contention.

mod active_set;
mod admission;
mod dispatcher;
mod error;
mod processor;
mod queue;
mod resolver;
mod store;
#[cfg(test)]
mod testing;
mod types;

pub use active_set::{Activation, ActiveSetTracker};
pub use admission::{Admission, AdmissionController, AdmissionTicket};
pub use dispatcher::{DispatchLimits, DispatchOutcome, Dispatcher, DispatcherSnapshot, UnitHandle, UnitReport};
pub use error::{DispatchError, StoreError, StoreResult};
pub use processor::{Job, RequestProcessor};
pub use queue::{QueuedUnit, SequentialQueue, Settled, UnitPanicked};
pub use resolver::ThreadResolver;
pub use store::{BoundedIncr, CounterStore, KeySpace, MemoryStore, RedisStore};
pub use types::ThreadId;
