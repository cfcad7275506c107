//! User data tracking switch.
//!
//! When tracking is disabled the SDK sends no network calls: the dispatcher
//! short-circuits new operations, and flipping the switch clears everything
//! pending along with the stored session identifiers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use beacon_core::{SessionState, SessionStateMachine, TokenStore};
use beacon_queue::RequestQueue;

/// Controls the tracking-disabled state shared with the dispatcher.
pub struct TrackingController {
    disabled: Arc<AtomicBool>,
    queue: Arc<RequestQueue>,
    tokens: TokenStore,
    session: Arc<SessionStateMachine>,
}

impl TrackingController {
    pub fn new(
        queue: Arc<RequestQueue>,
        tokens: TokenStore,
        session: Arc<SessionStateMachine>,
    ) -> Self {
        Self {
            disabled: Arc::new(AtomicBool::new(false)),
            queue,
            tokens,
            session,
        }
    }

    /// The shared flag consulted by the dispatcher's tracking gate.
    pub fn switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.disabled)
    }

    pub fn is_tracking_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Flip the tracking state. No-op when already in the requested state.
    pub fn disable_tracking(&self, disable: bool) {
        if self.disabled.swap(disable, Ordering::SeqCst) == disable {
            return;
        }
        if disable {
            self.on_tracking_disabled();
        } else {
            self.on_tracking_enabled();
        }
    }

    /// Tear down everything that identifies the user or the session.
    fn on_tracking_disabled(&self) {
        info!("tracking disabled; clearing pending operations and session state");
        self.queue.clear();
        self.tokens.clear();
        // Corrective teardown: the session is gone regardless of prior state.
        self.session.force_update_state(SessionState::Uninitialized);
    }

    fn on_tracking_enabled(&self) {
        info!("tracking re-enabled; a new session must be opened");
    }
}
