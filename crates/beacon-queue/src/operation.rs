//! Queued units of work against the attribution service.
//!
//! An [`Operation`] represents one logical remote call. Operations are
//! shared between the enqueuing caller, the processing loop, and the
//! precondition collaborators that add and clear [`WaitLock`]s, so all
//! mutable pieces live behind their own locks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;

use beacon_core::prelude::*;

/// Global operation ID counter
static OPERATION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Stable per-instance operation identity, used as the tracking key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(u64);

impl OpId {
    fn next() -> Self {
        Self(OPERATION_ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Named preconditions an operation may wait on before dispatch.
///
/// Cleared by external collaborators (identifier fetchers, intent
/// resolution, user-agent lookup) on their own schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitLock {
    /// A session-establishing operation has not yet succeeded.
    SdkInit,
    /// Advertising-identifier fetch is pending.
    AdvertisingId,
    /// Install-referrer fetch is pending.
    InstallReferrer,
    /// Launch intent/deep-link resolution is pending.
    IntentPending,
    /// User-agent string lookup is pending.
    UserAgent,
    /// A developer-set identity change is pending.
    UserIdentity,
}

impl WaitLock {
    pub const ALL: [WaitLock; 6] = [
        WaitLock::SdkInit,
        WaitLock::AdvertisingId,
        WaitLock::InstallReferrer,
        WaitLock::IntentPending,
        WaitLock::UserAgent,
        WaitLock::UserIdentity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            WaitLock::SdkInit => "sdk_init",
            WaitLock::AdvertisingId => "advertising_id",
            WaitLock::InstallReferrer => "install_referrer",
            WaitLock::IntentPending => "intent_pending",
            WaitLock::UserAgent => "user_agent",
            WaitLock::UserIdentity => "user_identity",
        }
    }
}

/// HTTP method used for the transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// The logical remote calls the SDK issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Open a session for a known install.
    OpenSession,
    /// Register a fresh install and open its first session.
    InstallSession,
    /// Create a short link.
    CreateLink,
    /// Log an analytics/commerce event.
    LogEvent,
    /// Attach a developer-set identity (client-side only).
    SetIdentity,
    /// Detach the developer-set identity (client-side only).
    Logout,
}

impl OperationKind {
    /// Operations whose success establishes the session and yields tokens.
    pub fn is_session_establishing(&self) -> bool {
        matches!(self, OperationKind::OpenSession | OperationKind::InstallSession)
    }

    /// Whether dispatch requires an established session.
    ///
    /// False for the session-establishing kinds (they are what establishes
    /// the session) and for the client-side-only identity operations.
    pub fn needs_session(&self) -> bool {
        !matches!(
            self,
            OperationKind::OpenSession
                | OperationKind::InstallSession
                | OperationKind::SetIdentity
                | OperationKind::Logout
        )
    }

    /// Whether the operation touches the network at all.
    pub fn is_client_side(&self) -> bool {
        matches!(self, OperationKind::SetIdentity | OperationKind::Logout)
    }

    /// Service endpoint path for this operation.
    pub fn endpoint(&self) -> &'static str {
        match self {
            OperationKind::OpenSession => "v1/open",
            OperationKind::InstallSession => "v1/install",
            OperationKind::CreateLink => "v1/url",
            OperationKind::LogEvent => "v2/event",
            OperationKind::SetIdentity => "v1/profile",
            OperationKind::Logout => "v1/logout",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::OpenSession => "open_session",
            OperationKind::InstallSession => "install_session",
            OperationKind::CreateLink => "create_link",
            OperationKind::LogEvent => "log_event",
            OperationKind::SetIdentity => "set_identity",
            OperationKind::Logout => "logout",
        }
    }
}

type Completion = oneshot::Sender<Result<Value>>;

/// One queued unit of work representing a remote call.
pub struct Operation {
    id: OpId,
    kind: OperationKind,
    method: HttpMethod,
    /// Request body; mutated by token stamping while queued.
    payload: Mutex<Value>,
    /// Active wait locks; mutated by collaborators from arbitrary tasks.
    locks: Mutex<HashSet<WaitLock>>,
    retryable: bool,
    /// Exempt from the tracking-disabled gate.
    allow_without_tracking: bool,
    /// Single-shot completion slot; the first resolution wins.
    completion: Mutex<Option<Completion>>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("blocked", &self.is_blocked())
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Operation {
    /// Start building an operation of the given kind.
    pub fn builder(kind: OperationKind) -> OperationBuilder {
        OperationBuilder {
            kind,
            method: HttpMethod::Post,
            payload: Value::Object(serde_json::Map::new()),
            locks: HashSet::new(),
            retryable: true,
            allow_without_tracking: kind.is_client_side(),
        }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn is_get_request(&self) -> bool {
        self.method == HttpMethod::Get
    }

    pub fn endpoint(&self) -> &'static str {
        self.kind.endpoint()
    }

    pub fn needs_session(&self) -> bool {
        self.kind.needs_session()
    }

    pub fn is_session_establishing(&self) -> bool {
        self.kind.is_session_establishing()
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn allows_without_tracking(&self) -> bool {
        self.allow_without_tracking
    }

    // ── Wait locks ───────────────────────────────────────────────────────

    /// Set a wait lock. Adding a lock that is already set is a no-op.
    pub fn add_lock(&self, lock: WaitLock) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(lock);
    }

    /// Clear a wait lock. Removing an absent lock is a no-op.
    pub fn remove_lock(&self, lock: WaitLock) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&lock);
    }

    pub fn has_lock(&self, lock: WaitLock) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&lock)
    }

    /// An operation is ineligible for dispatch while any lock is set.
    pub fn is_blocked(&self) -> bool {
        !self
            .locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Snapshot of the currently set locks
    pub fn locks(&self) -> Vec<WaitLock> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    // ── Payload ──────────────────────────────────────────────────────────

    /// Snapshot of the current payload
    pub fn payload(&self) -> Value {
        self.payload
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Mutate the payload in place (token stamping, fallback substitution).
    pub fn update_payload(&self, f: impl FnOnce(&mut Value)) {
        let mut payload = self.payload.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut payload);
    }

    // ── Completion ───────────────────────────────────────────────────────

    /// Resolve the operation successfully.
    ///
    /// Returns `false` if the operation was already resolved or abandoned;
    /// only the first resolution reaches the caller.
    pub fn complete_ok(&self, value: Value) -> bool {
        self.take_completion()
            .map(|tx| tx.send(Ok(value)).is_ok())
            .unwrap_or(false)
    }

    /// Resolve the operation with a failure.
    ///
    /// Same single-resolution contract as [`complete_ok`](Self::complete_ok).
    pub fn complete_err(&self, err: Error) -> bool {
        self.take_completion()
            .map(|tx| tx.send(Err(err)).is_ok())
            .unwrap_or(false)
    }

    /// Drop the completion callback without invoking it (queue shutdown,
    /// eviction). The caller's handle observes a closed channel.
    pub fn abandon(&self) {
        drop(self.take_completion());
    }

    /// `true` once the completion slot has been consumed
    pub fn is_completed(&self) -> bool {
        self.completion
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    fn take_completion(&self) -> Option<Completion> {
        self.completion
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// Builder for [`Operation`].
pub struct OperationBuilder {
    kind: OperationKind,
    method: HttpMethod,
    payload: Value,
    locks: HashSet<WaitLock>,
    retryable: bool,
    allow_without_tracking: bool,
}

impl OperationBuilder {
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn lock(mut self, lock: WaitLock) -> Self {
        self.locks.insert(lock);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn allow_without_tracking(mut self, allow: bool) -> Self {
        self.allow_without_tracking = allow;
        self
    }

    /// Finish building; returns the shared operation and the caller's
    /// single-use completion handle.
    pub fn build(self) -> (Arc<Operation>, OperationHandle) {
        let (tx, rx) = oneshot::channel();
        let id = OpId::next();
        let operation = Arc::new(Operation {
            id,
            kind: self.kind,
            method: self.method,
            payload: Mutex::new(self.payload),
            locks: Mutex::new(self.locks),
            retryable: self.retryable,
            allow_without_tracking: self.allow_without_tracking,
            completion: Mutex::new(Some(tx)),
        });
        (operation, OperationHandle { id, rx })
    }
}

/// Caller-side handle resolving to the operation's outcome.
///
/// Consuming the handle is the only way to observe completion, and it can
/// be consumed once; the exactly-once callback guarantee is a property of
/// the type.
pub struct OperationHandle {
    id: OpId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl OperationHandle {
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Wait for the operation to resolve.
    ///
    /// # Errors
    ///
    /// Returns the operation's failure, or [`Error::ChannelClosed`] if the
    /// queue abandoned the operation (shutdown, eviction) without resolving
    /// it.
    pub async fn outcome(self) -> Result<Value> {
        self.rx.await.map_err(|_| Error::ChannelClosed)?
    }
}
