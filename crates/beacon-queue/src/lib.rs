//! # beacon-queue - Request Queue and Dispatch
//!
//! The coordination core of the Beacon SDK: accepts operations against the
//! attribution service from many call sites, serializes them against a
//! single logical session, gates each one on cooperative wait locks,
//! dispatches with single-flight concurrency, and bounds retries and
//! stuck preconditions.
//!
//! Depends on [`beacon_core`] for the error taxonomy, session state
//! machine, and token store.
//!
//! ## Public API
//!
//! ### Operations
//! - [`Operation`] / [`OperationBuilder`] - queued units of remote work
//! - [`OperationHandle`] - single-use completion handle
//! - [`WaitLock`] - named dispatch preconditions
//!
//! ### Queue
//! - [`RequestQueue`] - bounded queue with privileged front insertion
//! - [`spawn_loop()`] - start the single-consumer processing loop
//! - [`QueueConfig`] / [`QueueState`]
//!
//! ### Dispatch
//! - [`Transport`] - seam to the external HTTP implementation
//! - [`Dispatcher`] - executes eligible operations, feeds results back
//! - [`classify_status()`] - retryable/unretryable/conflict split
//!
//! ### Retry bookkeeping
//! - [`RetryTracker`] / [`RetryInfo`] - per-operation attempt accounting
//! - [`recovery_action()`] - stuck-lock self-healing policy

pub mod dispatch;
pub mod operation;
pub mod queue;
pub mod retry;

pub use dispatch::{
    classify_status, Dispatcher, FailureClass, PreparedRequest, Transport, TransportResponse,
};
pub use operation::{
    HttpMethod, OpId, Operation, OperationBuilder, OperationHandle, OperationKind, WaitLock,
};
pub use queue::{spawn_loop, QueueConfig, QueueState, RequestQueue};
pub use retry::{recovery_action, RecoveryAction, RetryInfo, RetryTracker, USER_AGENT_FALLBACK};
