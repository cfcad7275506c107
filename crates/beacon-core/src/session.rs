//! Session lifecycle state machine.
//!
//! The [`SessionStateMachine`] is the single piece of shared mutable truth the
//! rest of the SDK reads. All mutation goes through the validated
//! [`update_state`](SessionStateMachine::update_state) /
//! [`force_update_state`](SessionStateMachine::force_update_state) entry
//! points so the transition table stays authoritative.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Current state of the SDK session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session has been requested yet.
    Uninitialized,
    /// A session-establishing request is in flight.
    Initializing,
    /// A session is established and operations may proceed.
    Initialized,
    /// The last session-establishing request failed.
    Failed(String),
    /// The session is being torn down.
    Resetting,
}

impl SessionState {
    /// Check if the current state allows new operations
    pub fn can_perform_operations(&self) -> bool {
        matches!(self, SessionState::Initialized)
    }

    /// Check if the current state indicates an active session
    pub fn has_active_session(&self) -> bool {
        matches!(self, SessionState::Initialized)
    }

    /// Check if the current state indicates a terminal error
    pub fn is_error_state(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }

    /// Short name for logging and error messages
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "Uninitialized",
            SessionState::Initializing => "Initializing",
            SessionState::Initialized => "Initialized",
            SessionState::Failed(_) => "Failed",
            SessionState::Resetting => "Resetting",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Failed(msg) => write!(f, "Failed({msg})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = std::sync::Arc<dyn Fn(&SessionState, &SessionState) + Send + Sync>;

/// Validated session state machine with observer notification.
///
/// Observers are invoked synchronously, in transition order, once per
/// transition, with `(previous, current)`. Observer callbacks must not call
/// back into `update_state`/`force_update_state`/`reset`.
pub struct SessionStateMachine {
    /// Current state, readable without serializing against transitions.
    state: RwLock<SessionState>,
    /// Serializes transitions and their observer notifications.
    transition_lock: Mutex<()>,
    observers: Mutex<HashMap<ObserverId, Observer>>,
    next_observer_id: AtomicU64,
}

impl std::fmt::Debug for SessionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStateMachine")
            .field("state", &self.current())
            .field("observer_count", &self.observer_count())
            .finish()
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::Uninitialized),
            transition_lock: Mutex::new(()),
            observers: Mutex::new(HashMap::new()),
            next_observer_id: AtomicU64::new(1),
        }
    }

    /// Get the current session state
    pub fn current(&self) -> SessionState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Check whether `from -> to` is in the transition table.
    pub fn is_valid_transition(from: &SessionState, to: &SessionState) -> bool {
        use SessionState::*;
        match from {
            Uninitialized => matches!(to, Initializing | Resetting),
            Initializing => matches!(to, Initialized | Failed(_) | Resetting),
            // Re-initialization of an established session is allowed.
            Initialized => matches!(to, Resetting | Initializing),
            // A failed session may be retried.
            Failed(_) => matches!(to, Initializing | Resetting),
            Resetting => matches!(to, Uninitialized | Initializing),
        }
    }

    /// Transition to `new`, validating against the transition table.
    ///
    /// On success every registered observer is notified exactly once with
    /// `(previous, current)`; the new state value is visible to readers
    /// before any observer runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] and leaves the state unchanged
    /// if the pair is not in the table.
    pub fn update_state(&self, new: SessionState) -> Result<()> {
        let _guard = self
            .transition_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let previous = self.current();
        if !Self::is_valid_transition(&previous, &new) {
            warn!("Invalid session state transition: {} -> {}", previous, new);
            return Err(Error::invalid_transition(previous.name(), new.name()));
        }

        debug!("Session state transition: {} -> {}", previous, new);
        self.store_and_notify(previous, new);
        Ok(())
    }

    /// Transition to `new` without validation.
    ///
    /// Reserved for corrective resets where canonical teardown is required;
    /// the transition table gives no guarantees for this one transition.
    pub fn force_update_state(&self, new: SessionState) {
        let _guard = self
            .transition_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let previous = self.current();
        debug!("Forced session state transition: {} -> {}", previous, new);
        self.store_and_notify(previous, new);
    }

    fn store_and_notify(&self, previous: SessionState, new: SessionState) {
        {
            let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
            *guard = new.clone();
        }

        // Snapshot the observer list so callbacks can subscribe/unsubscribe
        // without deadlocking on the registry lock.
        let snapshot: Vec<Observer> = {
            let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            observers.values().cloned().collect()
        };
        for observer in snapshot {
            observer(&previous, &new);
        }
    }

    /// Register an observer for state transitions.
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&SessionState, &SessionState) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::SeqCst));
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, std::sync::Arc::new(observer));
        id
    }

    /// Remove a previously registered observer.
    ///
    /// Returns `true` if the observer was present.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    /// Get the number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn can_perform_operations(&self) -> bool {
        self.current().can_perform_operations()
    }

    pub fn has_active_session(&self) -> bool {
        self.current().has_active_session()
    }

    pub fn is_error_state(&self) -> bool {
        self.current().is_error_state()
    }

    /// Two-phase session reset.
    ///
    /// Immediately transitions to `Resetting`, waits out `grace` so any
    /// dispatch mid-flight can observe the resetting state, then force-
    /// transitions to `Uninitialized`.
    pub async fn reset(&self, grace: Duration) {
        if let Err(err) = self.update_state(SessionState::Resetting) {
            // Already resetting or torn down; the forced teardown below still applies.
            debug!("reset: {err}");
        }
        tokio::time::sleep(grace).await;
        self.force_update_state(SessionState::Uninitialized);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn all_states() -> Vec<SessionState> {
        vec![
            SessionState::Uninitialized,
            SessionState::Initializing,
            SessionState::Initialized,
            SessionState::Failed("err".to_string()),
            SessionState::Resetting,
        ]
    }

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Initialized.can_perform_operations());
        assert!(SessionState::Initialized.has_active_session());
        assert!(!SessionState::Initialized.is_error_state());

        for state in all_states() {
            if state != SessionState::Initialized {
                assert!(!state.can_perform_operations(), "{state}");
                assert!(!state.has_active_session(), "{state}");
            }
            assert_eq!(state.is_error_state(), matches!(state, SessionState::Failed(_)));
        }
    }

    #[test]
    fn test_transition_table_is_total() {
        use SessionState::*;
        let allowed: Vec<(SessionState, SessionState)> = vec![
            (Uninitialized, Initializing),
            (Uninitialized, Resetting),
            (Initializing, Initialized),
            (Initializing, Failed("e".into())),
            (Initializing, Resetting),
            (Initialized, Resetting),
            (Initialized, Initializing),
            (Failed("e".into()), Initializing),
            (Failed("e".into()), Resetting),
            (Resetting, Uninitialized),
            (Resetting, Initializing),
        ];

        for from in all_states() {
            for to in all_states() {
                let expected = allowed
                    .iter()
                    .any(|(f, t)| f.name() == from.name() && t.name() == to.name());
                assert_eq!(
                    SessionStateMachine::is_valid_transition(&from, &to),
                    expected,
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_update_state_rejects_invalid_and_leaves_state_unchanged() {
        let machine = SessionStateMachine::new();

        let result = machine.update_state(SessionState::Initialized);
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            Error::InvalidTransition { .. }
        ));
        assert_eq!(machine.current(), SessionState::Uninitialized);
    }

    #[test]
    fn test_update_state_walks_happy_path() {
        let machine = SessionStateMachine::new();

        machine.update_state(SessionState::Initializing).unwrap();
        machine.update_state(SessionState::Initialized).unwrap();
        assert!(machine.can_perform_operations());
        assert!(machine.has_active_session());

        machine.update_state(SessionState::Resetting).unwrap();
        machine.update_state(SessionState::Uninitialized).unwrap();
        assert_eq!(machine.current(), SessionState::Uninitialized);
    }

    #[test]
    fn test_failed_state_allows_retry() {
        let machine = SessionStateMachine::new();
        machine.update_state(SessionState::Initializing).unwrap();
        machine
            .update_state(SessionState::Failed("server error".into()))
            .unwrap();
        assert!(machine.is_error_state());

        machine.update_state(SessionState::Initializing).unwrap();
        assert_eq!(machine.current(), SessionState::Initializing);
    }

    #[test]
    fn test_observer_notified_once_per_transition_with_pair() {
        let machine = SessionStateMachine::new();
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        machine.subscribe(move |prev, cur| {
            seen_clone
                .lock()
                .unwrap()
                .push((prev.name().to_string(), cur.name().to_string()));
        });

        machine.update_state(SessionState::Initializing).unwrap();
        machine.update_state(SessionState::Initialized).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("Uninitialized".to_string(), "Initializing".to_string()),
                ("Initializing".to_string(), "Initialized".to_string()),
            ]
        );
    }

    #[test]
    fn test_observer_not_notified_on_rejected_transition() {
        let machine = SessionStateMachine::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        machine.subscribe(move |_, _| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let _ = machine.update_state(SessionState::Initialized);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let machine = SessionStateMachine::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        let id = machine.subscribe(move |_, _| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(machine.observer_count(), 1);

        assert!(machine.unsubscribe(id));
        assert!(!machine.unsubscribe(id));
        assert_eq!(machine.observer_count(), 0);

        machine.update_state(SessionState::Initializing).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_force_update_bypasses_validation() {
        let machine = SessionStateMachine::new();
        machine.force_update_state(SessionState::Initialized);
        assert_eq!(machine.current(), SessionState::Initialized);
    }

    #[tokio::test]
    async fn test_reset_passes_through_resetting() {
        let machine = SessionStateMachine::new();
        machine.update_state(SessionState::Initializing).unwrap();
        machine.update_state(SessionState::Initialized).unwrap();

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        machine.subscribe(move |_, cur| {
            seen_clone.lock().unwrap().push(cur.name().to_string());
        });

        machine.reset(Duration::from_millis(10)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["Resetting".to_string(), "Uninitialized".to_string()]);
        assert_eq!(machine.current(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_reset_from_uninitialized_still_lands_uninitialized() {
        let machine = SessionStateMachine::new();
        machine.reset(Duration::from_millis(1)).await;
        assert_eq!(machine.current(), SessionState::Uninitialized);
    }
}
