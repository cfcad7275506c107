//! Retry bookkeeping and stuck-lock recovery.
//!
//! The processing loop consults a [`RetryTracker`] entry every time the
//! queue head is found ineligible, so that an operation whose preconditions
//! never clear is failed out after a bounded number of checks or a bounded
//! elapsed time rather than retried forever.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::operation::{OpId, WaitLock};

/// Per-operation retry bookkeeping.
///
/// Created lazily on the first ineligibility check, destroyed when the
/// operation becomes eligible or is failed out. `retry_count` and the
/// elapsed times are monotonic while the entry lives.
#[derive(Debug, Clone)]
pub struct RetryInfo {
    pub first_attempt: Instant,
    pub last_attempt: Instant,
    pub retry_count: u32,
    /// Set the first time the operation is seen blocked on wait locks.
    pub first_blocked: Option<Instant>,
}

/// Point-in-time view of an operation's retry state.
#[derive(Debug, Clone, Copy)]
pub struct RetrySnapshot {
    pub retry_count: u32,
    /// Time since the first ineligibility check.
    pub elapsed: Duration,
    /// Time spent blocked on wait locks, if ever blocked.
    pub blocked_for: Option<Duration>,
}

/// Tracks [`RetryInfo`] keyed by operation identity.
#[derive(Debug, Default)]
pub struct RetryTracker {
    inner: Mutex<HashMap<OpId, RetryInfo>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create the entry for `id` and snapshot it.
    ///
    /// `blocked` records whether the operation is currently held by wait
    /// locks; the first blocked observation starts the stuck-lock clock.
    pub fn check(&self, id: OpId, blocked: bool) -> RetrySnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let info = inner.entry(id).or_insert_with(|| RetryInfo {
            first_attempt: now,
            last_attempt: now,
            retry_count: 0,
            first_blocked: None,
        });

        if blocked && info.first_blocked.is_none() {
            info.first_blocked = Some(now);
        }

        RetrySnapshot {
            retry_count: info.retry_count,
            elapsed: now.duration_since(info.first_attempt),
            blocked_for: info.first_blocked.map(|t| now.duration_since(t)),
        }
    }

    /// Record one more ineligibility retry for `id`.
    pub fn record_retry(&self, id: OpId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = inner.get_mut(&id) {
            info.retry_count += 1;
            info.last_attempt = Instant::now();
        }
    }

    /// Drop the entry for `id` (operation became eligible or was failed out).
    pub fn clear(&self, id: OpId) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Drop all entries (queue shutdown / clear).
    pub fn clear_all(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the loop should do about one stuck wait lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Keep waiting; the lock is not recoverable (or not yet stuck).
    Wait,
    /// The precondition is verifiably already satisfied; clear the lock.
    ClearLock,
    /// Substitute the fallback user-agent string and clear the lock.
    SubstituteUserAgent,
}

/// Fallback user-agent substituted when the lookup never reports back.
pub const USER_AGENT_FALLBACK: &str = "beacon-sdk/fallback";

/// Decide how to recover a lock that has been held for `blocked_for`.
///
/// Collaborator signal delivery is not guaranteed exactly-once, so two
/// locks get bounded self-healing once past the stuck threshold: `SdkInit`
/// is cleared when the session tokens are independently verifiable as
/// present, and `UserAgent` is cleared by substituting a fallback string.
/// Every other lock keeps waiting and eventually rolls into the
/// precondition timeout.
pub fn recovery_action(
    lock: WaitLock,
    blocked_for: Duration,
    session_valid: bool,
    threshold: Duration,
) -> RecoveryAction {
    if blocked_for < threshold {
        return RecoveryAction::Wait;
    }
    match lock {
        WaitLock::SdkInit if session_valid => RecoveryAction::ClearLock,
        WaitLock::UserAgent => RecoveryAction::SubstituteUserAgent,
        _ => RecoveryAction::Wait,
    }
}
