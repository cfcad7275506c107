//! Bounded request queue and its single-consumer processing loop.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        RequestQueue                           │
//! │                                                               │
//! │  producers (any task)          processing loop (one task)     │
//! │  ────────────────────          ─────────────────────────────  │
//! │  enqueue() ──┐                 wake ◀── Notify / state watch  │
//! │  insert_at_front() ─┼──items──▶ peek head                     │
//! │  unlock_all() ──────┘           ├─ eligible → dispatch (one   │
//! │                                 │   in flight at a time)      │
//! │                                 └─ ineligible → retry/stuck-  │
//! │                                     lock handling, re-poll    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Producers may enqueue from any task; the loop is the only consumer and
//! never runs two dispatches concurrently. One wake signal may coalesce
//! several enqueues, so the loop always re-checks the queue head instead of
//! assuming one wakeup per item.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use beacon_core::prelude::*;
use beacon_core::BeaconConfig;

use crate::dispatch::{Dispatcher, Transport};
use crate::operation::{OpId, Operation, WaitLock};
use crate::retry::{recovery_action, RecoveryAction, RetryTracker, USER_AGENT_FALLBACK};

/// Tuning knobs for the queue and dispatcher.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued operations before eviction kicks in.
    pub max_items: usize,
    /// Ineligibility checks (and transport retries) before failing out.
    pub retry_limit: u32,
    /// Upper bound on total time an operation may sit queued-but-ineligible.
    pub request_timeout: Duration,
    /// Delay between polls of an ineligible queue head.
    pub retry_delay: Duration,
    /// How long a wait lock may stay set before recovery is attempted.
    pub stuck_lock_threshold: Duration,
    /// Upper bound on a single transport call.
    pub task_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_items: 25,
            retry_limit: 5,
            request_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(100),
            stuck_lock_threshold: Duration::from_secs(10),
            task_timeout: Duration::from_millis(5_500),
        }
    }
}

impl From<&BeaconConfig> for QueueConfig {
    fn from(config: &BeaconConfig) -> Self {
        Self {
            max_items: config.max_queue_items,
            retry_limit: config.retry_limit,
            request_timeout: config.request_timeout(),
            retry_delay: config.retry_delay(),
            stuck_lock_threshold: config.stuck_lock_threshold(),
            task_timeout: config.task_timeout(),
        }
    }
}

/// Lifecycle state of a [`RequestQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing queued; the loop is waiting for a signal.
    Idle,
    /// The loop is working through queued operations.
    Processing,
    /// Processing is suspended; operations accumulate.
    Paused,
    /// Terminal: pending operations were cleared, the loop has exited.
    Shutdown,
}

/// Ordered, bounded collection of pending operations plus the wake signal
/// for its processing loop.
pub struct RequestQueue {
    items: Mutex<VecDeque<Arc<Operation>>>,
    notify: Notify,
    /// 0 or 1; at most one operation is ever mid-dispatch.
    in_flight: AtomicUsize,
    state_tx: watch::Sender<QueueState>,
    retries: RetryTracker,
    config: QueueConfig,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("size", &self.size())
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (state_tx, _) = watch::channel(QueueState::Idle);
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            in_flight: AtomicUsize::new(0),
            state_tx,
            retries: RetryTracker::new(),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> QueueState {
        *self.state_tx.borrow()
    }

    /// Watch queue state transitions (used by the loop and by tests).
    pub fn subscribe_state(&self) -> watch::Receiver<QueueState> {
        self.state_tx.subscribe()
    }

    /// Number of operations currently mid-dispatch (0 or 1)
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    // ── Mutation entry points ────────────────────────────────────────────

    /// Append an operation and signal the loop.
    ///
    /// When the bound is reached the element at index 1 is evicted — never
    /// the head, which may be mid-dispatch. Evicted operations are
    /// abandoned without resolving their handles.
    pub fn enqueue(&self, op: Arc<Operation>) {
        if self.state() == QueueState::Shutdown {
            warn!("cannot enqueue {}: queue is shut down", op.id());
            op.complete_err(Error::QueueShutdown);
            return;
        }

        debug!("enqueue {} ({})", op.id(), op.kind().name());
        let evicted = {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            items.push_back(op);
            if items.len() >= self.config.max_items && items.len() > 1 {
                items.remove(1)
            } else {
                None
            }
        };
        if let Some(evicted) = evicted {
            warn!("queue at capacity, evicting {}", evicted.id());
            self.retries.clear(evicted.id());
            evicted.abandon();
        }
        self.notify.notify_one();
    }

    /// Insert ahead of everything queued, without displacing a dispatch
    /// already in flight.
    ///
    /// The one supported priority override, reserved for session-
    /// establishing operations.
    pub fn insert_at_front(&self, op: Arc<Operation>) {
        if self.state() == QueueState::Shutdown {
            warn!("cannot insert {}: queue is shut down", op.id());
            op.complete_err(Error::QueueShutdown);
            return;
        }

        debug!("insert_at_front {} ({})", op.id(), op.kind().name());
        {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            let index = if self.in_flight() == 0 { 0 } else { 1 };
            let index = index.min(items.len());
            items.insert(index, op);
        }
        self.notify.notify_one();
    }

    /// Clone of the head operation, if any
    pub fn peek(&self) -> Option<Arc<Operation>> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .front()
            .cloned()
    }

    /// Clone of the operation at `index`, if any
    pub fn peek_at(&self, index: usize) -> Option<Arc<Operation>> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(index)
            .cloned()
    }

    /// Remove the operation with identity `id`.
    pub fn remove(&self, id: OpId) -> Option<Arc<Operation>> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let index = items.iter().position(|op| op.id() == id)?;
        items.remove(index)
    }

    /// Remove the operation at `index`.
    pub fn remove_at(&self, index: usize) -> Option<Arc<Operation>> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(index)
    }

    /// Pop the head only if it is still the operation with identity `id`.
    fn pop_if_head(&self, id: OpId) -> Option<Arc<Operation>> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.front().map(|op| op.id()) == Some(id) {
            items.pop_front()
        } else {
            None
        }
    }

    pub fn size(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drop all pending operations without resolving their handles, and
    /// discard retry bookkeeping.
    pub fn clear(&self) {
        let drained: Vec<Arc<Operation>> = {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            items.drain(..).collect()
        };
        debug!("queue cleared ({} operations dropped)", drained.len());
        for op in drained {
            op.abandon();
        }
        self.retries.clear_all();
    }

    /// Suspend processing; operations keep accumulating.
    pub fn pause(&self) {
        if self.state() != QueueState::Shutdown {
            self.set_state(QueueState::Paused);
        }
    }

    /// Resume processing after [`pause`](Self::pause).
    pub fn resume(&self) {
        if self.state() == QueueState::Paused {
            self.set_state(QueueState::Processing);
            self.notify.notify_one();
        }
    }

    /// Terminal shutdown: clears pending operations (callbacks are dropped,
    /// not invoked), discards bookkeeping, and stops the processing loop.
    pub fn shutdown(&self) {
        if self.state() == QueueState::Shutdown {
            return;
        }
        debug!("queue shutting down");
        self.set_state(QueueState::Shutdown);
        self.clear();
        self.notify.notify_one();
    }

    // ── Collaborator fan-in / fan-out ────────────────────────────────────

    /// Clear `lock` on every queued operation and wake the loop.
    ///
    /// Called by precondition providers when their precondition is
    /// satisfied; clearing an absent lock is a no-op.
    pub fn unlock_all(&self, lock: WaitLock) {
        debug!("unlock_all {}", lock.name());
        for op in self.snapshot() {
            op.remove_lock(lock);
        }
        self.notify.notify_one();
    }

    /// Visit every queued operation (token fan-out after session changes).
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Operation>)) {
        for op in self.snapshot() {
            f(&op);
        }
    }

    /// First queued session-establishing operation, if any
    pub fn find_session_initializer(&self) -> Option<Arc<Operation>> {
        self.snapshot()
            .into_iter()
            .find(|op| op.is_session_establishing())
    }

    fn snapshot(&self) -> Vec<Arc<Operation>> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn set_state(&self, state: QueueState) {
        self.state_tx.send_replace(state);
    }

    #[cfg(test)]
    fn force_in_flight(&self, n: usize) {
        self.in_flight.store(n, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Processing loop
// ---------------------------------------------------------------------------

/// Spawn the queue's single-consumer processing loop.
///
/// The loop runs until [`RequestQueue::shutdown`] is called.
pub fn spawn_loop<T>(
    queue: Arc<RequestQueue>,
    dispatcher: Arc<Dispatcher<T>>,
) -> tokio::task::JoinHandle<()>
where
    T: Transport + Send + Sync + 'static,
{
    tokio::spawn(run_loop(queue, dispatcher))
}

async fn run_loop<T>(queue: Arc<RequestQueue>, dispatcher: Arc<Dispatcher<T>>)
where
    T: Transport + Send + Sync,
{
    let mut state_rx = queue.subscribe_state();
    debug!("request queue processing loop started");

    loop {
        match queue.state() {
            QueueState::Shutdown => break,
            QueueState::Paused => {
                wait_for_wake(&queue, &mut state_rx).await;
                continue;
            }
            _ => {}
        }

        let Some(op) = queue.peek() else {
            if queue.state() == QueueState::Processing {
                queue.set_state(QueueState::Idle);
            }
            wait_for_wake(&queue, &mut state_rx).await;
            continue;
        };

        if queue.state() == QueueState::Idle {
            queue.set_state(QueueState::Processing);
        }

        let blocked = op.is_blocked();
        let eligible = !blocked
            && (op.is_session_establishing()
                || !op.needs_session()
                || dispatcher.tokens().is_session_valid());

        if eligible {
            // The head may have changed since the peek (front insertion);
            // dispatch only if this operation still holds the position.
            let Some(op) = queue.pop_if_head(op.id()) else {
                continue;
            };
            queue.retries.clear(op.id());

            queue.in_flight.fetch_add(1, Ordering::SeqCst);
            dispatcher.dispatch(&op, &queue).await;
            queue.in_flight.fetch_sub(1, Ordering::SeqCst);
            queue.notify.notify_one();
        } else {
            handle_ineligible_head(&queue, &dispatcher, &op);

            // The head stays put; re-poll after the retry delay, or earlier
            // if a producer or lock holder signals.
            tokio::select! {
                _ = tokio::time::sleep(queue.config.retry_delay) => {}
                _ = queue.notify.notified() => {}
            }
        }
    }

    debug!("request queue processing loop exited");
}

/// Retry/stuck-lock handling for an ineligible queue head.
fn handle_ineligible_head<T: Transport>(
    queue: &RequestQueue,
    dispatcher: &Dispatcher<T>,
    op: &Arc<Operation>,
) {
    let blocked = op.is_blocked();
    let snapshot = queue.retries.check(op.id(), blocked);
    let config = &queue.config;

    if snapshot.retry_count >= config.retry_limit || snapshot.elapsed >= config.request_timeout {
        warn!(
            "{} failed out after {} checks over {:?}",
            op.id(),
            snapshot.retry_count,
            snapshot.elapsed
        );
        queue.remove(op.id());
        queue.retries.clear(op.id());
        let err = if snapshot.elapsed >= config.request_timeout {
            Error::timeout(snapshot.elapsed.as_millis() as u64)
        } else {
            Error::NoSession
        };
        op.complete_err(err);
        return;
    }

    queue.retries.record_retry(op.id());

    let Some(blocked_for) = snapshot.blocked_for else {
        return;
    };
    if blocked_for < config.stuck_lock_threshold {
        return;
    }

    // Past the stuck threshold: attempt bounded self-healing per lock.
    let session_valid = dispatcher.tokens().is_session_valid();
    for lock in op.locks() {
        match recovery_action(lock, blocked_for, session_valid, config.stuck_lock_threshold) {
            RecoveryAction::Wait => {}
            RecoveryAction::ClearLock => {
                warn!(
                    "{} stuck on {} for {:?}, precondition verified satisfied; clearing",
                    op.id(),
                    lock.name(),
                    blocked_for
                );
                op.remove_lock(lock);
            }
            RecoveryAction::SubstituteUserAgent => {
                warn!(
                    "{} stuck on {} for {:?}; substituting fallback",
                    op.id(),
                    lock.name(),
                    blocked_for
                );
                op.update_payload(|payload| {
                    if let Some(object) = payload.as_object_mut() {
                        object.insert(
                            "user_agent".to_string(),
                            serde_json::Value::String(USER_AGENT_FALLBACK.to_string()),
                        );
                    }
                });
                op.remove_lock(lock);
            }
        }
    }
}
