//! PILOT Storage
//!
//! Persisted execution state and the collaborators the engine needs from
//! persistence:
//!
//! - [`record`]: workflow, execution and step records plus output summaries
//! - [`store`]: the [`ExecutionStore`] contract and an in-memory store
//! - [`lock`]: the time-boxed [`LockManager`] contract and an in-memory lock
//! - [`redb_store`]: a durable embedded store implementing both contracts
//!
//! Records are the single source of truth for scheduling state. Full step
//! payloads are never persisted; only [`OutputSummary`] snapshots are.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lock;
pub mod record;
pub mod redb_store;
pub mod store;

pub use lock::{LockLease, LockManager, MemoryLockManager};
pub use record::{
    ExecutionRecord, ExecutionStatus, ExecutionTrace, FailureCategory, OutputSummary, StepExecutionMetadata,
    StepExecutionRecord, StepStatus, WorkflowRecord,
};
pub use redb_store::RedbStore;
pub use store::{ExecutionStore, MemoryStore, StoreConfig, StoreError, StoreResult};
