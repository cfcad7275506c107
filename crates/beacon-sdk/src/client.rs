//! The Beacon client: explicitly constructed root object wiring the queue,
//! session state machine, token store, and tracking controller together.
//!
//! There is no singleton; tests and hosts construct fresh instances with
//! their own transport.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::warn;

use beacon_core::prelude::*;
use beacon_core::{BeaconConfig, ObserverId, SessionState, SessionStateMachine, TokenStore};
use beacon_queue::{
    spawn_loop, Dispatcher, Operation, OperationHandle, OperationKind, QueueConfig, RequestQueue,
    Transport, WaitLock,
};

use crate::events::EventData;
use crate::link::LinkData;
use crate::tracking::TrackingController;

/// Attribution SDK client.
///
/// Owns one request queue with its processing loop, one session state
/// machine, and the stored session tokens. All remote work flows through
/// [`OperationHandle`]s resolved by the queue.
pub struct Beacon {
    config: BeaconConfig,
    tokens: TokenStore,
    session: Arc<SessionStateMachine>,
    queue: Arc<RequestQueue>,
    tracking: TrackingController,
    loop_handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Beacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Beacon")
            .field("session", &self.session.current())
            .field("queue_size", &self.queue.size())
            .field("tracking_disabled", &self.tracking.is_tracking_disabled())
            .finish()
    }
}

impl Beacon {
    /// Construct a client and start its processing loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the configured app key is malformed.
    pub fn new<T>(config: BeaconConfig, transport: T) -> Result<Self>
    where
        T: Transport + Send + Sync + 'static,
    {
        config.validate_key()?;

        let tokens = TokenStore::new();
        let session = Arc::new(SessionStateMachine::new());
        let queue_config = QueueConfig::from(&config);
        let queue = Arc::new(RequestQueue::new(queue_config.clone()));
        let tracking =
            TrackingController::new(Arc::clone(&queue), tokens.clone(), Arc::clone(&session));
        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            tokens.clone(),
            Arc::clone(&session),
            tracking.switch(),
            queue_config,
        ));
        let loop_handle = spawn_loop(Arc::clone(&queue), dispatcher);

        Ok(Self {
            config,
            tokens,
            session,
            queue,
            tracking,
            loop_handle,
        })
    }

    // ── Session operations ───────────────────────────────────────────────

    /// Open a session for a known install.
    ///
    /// Inserted at the queue front, ahead of everything already queued.
    pub fn open_session(&self) -> OperationHandle {
        self.session_operation(OperationKind::OpenSession, &[])
    }

    /// Open a session gated on the given preconditions.
    pub fn open_session_gated(&self, locks: &[WaitLock]) -> OperationHandle {
        self.session_operation(OperationKind::OpenSession, locks)
    }

    /// Register a fresh install and open its first session.
    pub fn install_session(&self) -> OperationHandle {
        self.session_operation(OperationKind::InstallSession, &[])
    }

    /// Register an install gated on the given preconditions.
    pub fn install_session_gated(&self, locks: &[WaitLock]) -> OperationHandle {
        self.session_operation(OperationKind::InstallSession, locks)
    }

    fn session_operation(&self, kind: OperationKind, locks: &[WaitLock]) -> OperationHandle {
        if let Some(existing) = self.queue.find_session_initializer() {
            debug!("session initializer {} already queued", existing.id());
        }
        let mut builder = Operation::builder(kind).payload(Value::Object(self.base_payload()));
        for lock in locks {
            builder = builder.lock(*lock);
        }
        let (op, handle) = builder.build();
        if self.fail_if_tracking_disabled(&op) {
            return handle;
        }
        self.queue.insert_at_front(op);
        handle
    }

    /// Two-phase session reset; pending tokens are dropped afterwards.
    pub async fn reset_session(&self) {
        self.session.reset(self.config.reset_grace()).await;
        self.tokens.clear();
    }

    // ── Remote operations ────────────────────────────────────────────────

    /// Log an analytics/commerce event.
    pub fn log_event(&self, event: &EventData) -> OperationHandle {
        self.enqueue_sessioned(OperationKind::LogEvent, event.to_payload())
    }

    /// Create a short link.
    pub fn create_link(&self, link: &LinkData) -> OperationHandle {
        self.enqueue_sessioned(OperationKind::CreateLink, link.to_payload())
    }

    /// Create a short link, falling back to the long link when the service
    /// fails or reports a duplicate.
    pub async fn short_link(&self, link: &LinkData) -> Result<String> {
        match self.create_link(link).outcome().await {
            Ok(body) => body
                .get("url")
                .and_then(|u| u.as_str())
                .map(str::to_string)
                .ok_or_else(|| Error::network("link response carried no url")),
            Err(err) => {
                warn!("short link creation failed ({err}); using long link");
                link.long_url(&self.config.base_url, &self.config.app_key)
            }
        }
    }

    fn enqueue_sessioned(&self, kind: OperationKind, extra: Value) -> OperationHandle {
        let mut payload = self.base_payload();
        if let Value::Object(extra) = extra {
            payload.extend(extra);
        }
        let mut builder = Operation::builder(kind).payload(Value::Object(payload));
        // Until a session is established these wait on the initializer.
        if !self.session.has_active_session() {
            builder = builder.lock(WaitLock::SdkInit);
        }
        let (op, handle) = builder.build();
        if self.fail_if_tracking_disabled(&op) {
            return handle;
        }
        self.queue.enqueue(op);
        handle
    }

    /// Fail fast instead of queueing when tracking is disabled.
    fn fail_if_tracking_disabled(&self, op: &Arc<Operation>) -> bool {
        if self.tracking.is_tracking_disabled() && !op.allows_without_tracking() {
            op.complete_err(Error::TrackingDisabled);
            true
        } else {
            false
        }
    }

    // ── Identity ─────────────────────────────────────────────────────────

    /// Attach a developer-set identity. Client-side only; no network call.
    pub fn set_identity(&self, identity: &str) -> OperationHandle {
        let (op, handle) = Operation::builder(OperationKind::SetIdentity)
            .payload(json!({ "identity": identity }))
            .build();
        self.queue.enqueue(op);
        handle
    }

    /// Detach the developer-set identity. Client-side only; no network call.
    pub fn logout(&self) -> OperationHandle {
        let (op, handle) = Operation::builder(OperationKind::Logout)
            .payload(json!({}))
            .build();
        self.queue.enqueue(op);
        handle
    }

    // ── Precondition providers ───────────────────────────────────────────

    /// Advertising-identifier fetch finished.
    pub fn advertising_id_ready(&self, advertising_id: Option<&str>) {
        if let Some(id) = advertising_id {
            self.stamp_queued("advertising_id", id);
        }
        self.queue.unlock_all(WaitLock::AdvertisingId);
    }

    /// Install-referrer fetch finished.
    pub fn install_referrer_ready(&self, referrer: Option<&str>) {
        if let Some(referrer) = referrer {
            self.stamp_queued("install_referrer", referrer);
        }
        self.queue.unlock_all(WaitLock::InstallReferrer);
    }

    /// Launch intent/deep-link resolution finished.
    pub fn intent_resolved(&self) {
        self.queue.unlock_all(WaitLock::IntentPending);
    }

    /// User-agent lookup finished.
    pub fn user_agent_ready(&self, user_agent: &str) {
        self.stamp_queued("user_agent", user_agent);
        self.queue.unlock_all(WaitLock::UserAgent);
    }

    /// Clear an arbitrary wait lock on everything queued.
    pub fn clear_lock(&self, lock: WaitLock) {
        self.queue.unlock_all(lock);
    }

    fn stamp_queued(&self, key: &str, value: &str) {
        self.queue.for_each(|op| {
            op.update_payload(|payload| {
                if let Some(object) = payload.as_object_mut() {
                    object.insert(key.to_string(), json!(value));
                }
            });
        });
    }

    // ── Observability and lifecycle ──────────────────────────────────────

    pub fn session_state(&self) -> SessionState {
        self.session.current()
    }

    /// Observe session state transitions.
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&SessionState, &SessionState) + Send + Sync + 'static,
    {
        self.session.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.session.unsubscribe(id)
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    pub fn pause(&self) {
        self.queue.pause();
    }

    pub fn resume(&self) {
        self.queue.resume();
    }

    pub fn disable_tracking(&self, disable: bool) {
        self.tracking.disable_tracking(disable);
    }

    pub fn is_tracking_disabled(&self) -> bool {
        self.tracking.is_tracking_disabled()
    }

    /// Stop the processing loop and drop everything pending. Pending
    /// operation handles observe a closed channel.
    pub async fn shutdown(self) {
        self.queue.shutdown();
        let _ = self.loop_handle.await;
    }

    fn base_payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("app_key".to_string(), json!(self.config.app_key));
        payload.insert(
            "sdk".to_string(),
            json!(format!("rust/{}", env!("CARGO_PKG_VERSION"))),
        );
        payload
    }
}
