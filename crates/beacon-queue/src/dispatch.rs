//! Dispatch of eligible operations against the external transport.
//!
//! The [`Dispatcher`] owns everything a single dispatch needs: the
//! transport, the token store, the session state machine, and the
//! tracking switch. It is invoked by the queue's processing loop with the
//! operation already removed from the queue and marked in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use beacon_core::prelude::*;
use beacon_core::{SessionState, SessionStateMachine, SessionTokens, TokenStore};

use crate::operation::{HttpMethod, Operation, OperationKind, WaitLock};
use crate::queue::{QueueConfig, RequestQueue};

/// Payload keys carrying session-identifying tokens.
const KEY_SESSION_ID: &str = "session_id";
const KEY_DEVICE_TOKEN: &str = "device_token";
const KEY_IDENTITY_TOKEN: &str = "identity_token";

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// A fully prepared request, ready for the wire.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    /// Service endpoint path, e.g. `v1/open`.
    pub endpoint: String,
    pub method: HttpMethod,
    pub payload: Value,
}

/// Response from the external transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

impl TransportResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn with_status(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Human-readable failure text pulled from the body, if any.
    pub fn failure_message(&self) -> String {
        self.body
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(|m| m.as_str())
            .unwrap_or("request failed")
            .to_string()
    }
}

/// External transport executing prepared requests.
///
/// The HTTP implementation lives outside this crate; tests substitute
/// scripted doubles. Transport-level errors map to [`Error::Network`].
#[trait_variant::make(Transport: Send)]
pub trait LocalTransport {
    async fn post(&self, request: &PreparedRequest) -> Result<TransportResponse>;
    async fn get(&self, request: &PreparedRequest) -> Result<TransportResponse>;
}

// ---------------------------------------------------------------------------
// Status classification
// ---------------------------------------------------------------------------

/// How a non-success status is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying: server errors, timeouts, throttling.
    Retryable,
    /// Client error; retrying the same request cannot succeed.
    Unretryable,
    /// Resource conflict; link creation maps this to its duplicate path.
    Conflict,
}

/// Classify a non-2xx status code.
///
/// One explicit table: 409 is a conflict, 408/429 are retryable, every
/// other 4xx is unretryable, and 5xx (plus anything outside the HTTP
/// range) is retryable.
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        409 => FailureClass::Conflict,
        408 | 429 => FailureClass::Retryable,
        400..=499 => FailureClass::Unretryable,
        _ => FailureClass::Retryable,
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Executes one eligible operation and feeds the result back into the
/// session state machine and the queue.
pub struct Dispatcher<T> {
    transport: T,
    tokens: TokenStore,
    session: Arc<SessionStateMachine>,
    /// Shared with the SDK's tracking controller.
    tracking_disabled: Arc<AtomicBool>,
    config: QueueConfig,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(
        transport: T,
        tokens: TokenStore,
        session: Arc<SessionStateMachine>,
        tracking_disabled: Arc<AtomicBool>,
        config: QueueConfig,
    ) -> Self {
        Self {
            transport,
            tokens,
            session,
            tracking_disabled,
            config,
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn session(&self) -> &Arc<SessionStateMachine> {
        &self.session
    }

    pub fn is_tracking_disabled(&self) -> bool {
        self.tracking_disabled.load(Ordering::SeqCst)
    }

    /// Execute `op` to completion.
    ///
    /// Resolves the operation's completion handle exactly once; transport
    /// retries happen internally and never reach the caller. Never returns
    /// an error: every failure is delivered through the operation itself.
    pub async fn dispatch(&self, op: &Arc<Operation>, queue: &RequestQueue) {
        // Client-side operations mutate local identity state only.
        if op.kind().is_client_side() {
            self.apply_client_side(op);
            return;
        }

        if self.is_tracking_disabled() && !op.allows_without_tracking() {
            debug!("{} not sent: tracking is disabled", op.id());
            op.complete_err(Error::TrackingDisabled);
            return;
        }

        self.stamp_tokens(op);

        if op.is_session_establishing() {
            // Invalid only when an initialization is already mid-flight.
            let _ = self.session.update_state(SessionState::Initializing);
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let request = self.prepare(op);
            let call = async {
                match op.method() {
                    HttpMethod::Get => self.transport.get(&request).await,
                    HttpMethod::Post => self.transport.post(&request).await,
                }
            };
            let result = match tokio::time::timeout(self.config.task_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(Error::network("transport call timed out")),
            };

            match result {
                Ok(response) if response.is_success() => {
                    self.on_success(op, response, queue);
                    return;
                }
                Ok(response) => match classify_status(response.status) {
                    FailureClass::Conflict if op.kind() == OperationKind::CreateLink => {
                        self.on_failure(op, Error::DuplicateLink);
                        return;
                    }
                    FailureClass::Retryable
                        if op.is_retryable() && attempt < self.config.retry_limit =>
                    {
                        debug!(
                            "{} got status {}, retrying (attempt {}/{})",
                            op.id(),
                            response.status,
                            attempt,
                            self.config.retry_limit
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                    _ => {
                        self.on_failure(
                            op,
                            Error::server(response.status, response.failure_message()),
                        );
                        return;
                    }
                },
                Err(err) if err.is_retryable() && op.is_retryable() && attempt < self.config.retry_limit => {
                    debug!(
                        "{} transport error ({err}), retrying (attempt {}/{})",
                        op.id(),
                        attempt,
                        self.config.retry_limit
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(err) => {
                    self.on_failure(op, err);
                    return;
                }
            }
        }
    }

    fn prepare(&self, op: &Operation) -> PreparedRequest {
        PreparedRequest {
            endpoint: op.endpoint().to_string(),
            method: op.method(),
            payload: op.payload(),
        }
    }

    /// Stamp the current tokens into the outgoing payload.
    fn stamp_tokens(&self, op: &Operation) {
        let tokens = self.tokens.snapshot();
        op.update_payload(|payload| {
            if let Some(object) = payload.as_object_mut() {
                if let Some(ref session_id) = tokens.session_id {
                    object.insert(KEY_SESSION_ID.to_string(), Value::String(session_id.clone()));
                }
                if let Some(ref device_token) = tokens.device_token {
                    object.insert(
                        KEY_DEVICE_TOKEN.to_string(),
                        Value::String(device_token.clone()),
                    );
                }
                if let Some(ref identity_token) = tokens.identity_token {
                    object.insert(
                        KEY_IDENTITY_TOKEN.to_string(),
                        Value::String(identity_token.clone()),
                    );
                }
            }
        });
    }

    fn apply_client_side(&self, op: &Arc<Operation>) {
        match op.kind() {
            OperationKind::SetIdentity => {
                let identity = op
                    .payload()
                    .get("identity")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.tokens.set_identity_token(identity.clone());
                op.complete_ok(serde_json::json!({ "identity": identity }));
            }
            OperationKind::Logout => {
                self.tokens.clear_identity_token();
                op.complete_ok(serde_json::json!({}));
            }
            other => {
                // Unreachable by construction; fail loudly rather than hang.
                warn!("{} unexpected client-side dispatch of {:?}", op.id(), other);
                op.complete_err(Error::network("unsupported client-side operation"));
            }
        }
    }

    fn on_success(&self, op: &Arc<Operation>, response: TransportResponse, queue: &RequestQueue) {
        if op.is_session_establishing() {
            self.store_session_tokens(&response.body);

            // Refresh token fields of everything still queued before the
            // state change makes those operations eligible.
            let tokens = self.tokens.snapshot();
            queue.for_each(|queued| {
                queued.update_payload(|payload| refresh_token_fields(payload, &tokens));
            });
            queue.unlock_all(WaitLock::SdkInit);

            let _ = self.session.update_state(SessionState::Initialized);
        }

        debug!("{} completed with status {}", op.id(), response.status);
        op.complete_ok(response.body);
    }

    fn on_failure(&self, op: &Arc<Operation>, err: Error) {
        warn!("{} failed: {err}", op.id());
        if op.is_session_establishing() && !self.tokens.is_session_valid() {
            let _ = self
                .session
                .update_state(SessionState::Failed(err.to_string()));
        }
        op.complete_err(err);
    }

    fn store_session_tokens(&self, body: &Value) {
        if let Some(session_id) = body.get(KEY_SESSION_ID).and_then(|v| v.as_str()) {
            self.tokens.set_session_id(session_id);
        }
        if let Some(device_token) = body.get(KEY_DEVICE_TOKEN).and_then(|v| v.as_str()) {
            self.tokens.set_device_token(device_token);
        }
        if let Some(identity_token) = body.get(KEY_IDENTITY_TOKEN).and_then(|v| v.as_str()) {
            self.tokens.set_identity_token(identity_token);
        }
    }
}

/// Update token fields that are already present in a queued payload.
///
/// Queue-wide fan-out after a session is (re-)established; only fields the
/// payload already carries are refreshed.
fn refresh_token_fields(payload: &mut Value, tokens: &SessionTokens) {
    let Some(object) = payload.as_object_mut() else {
        return;
    };
    if object.contains_key(KEY_SESSION_ID) {
        if let Some(ref session_id) = tokens.session_id {
            object.insert(KEY_SESSION_ID.to_string(), Value::String(session_id.clone()));
        }
    }
    if object.contains_key(KEY_DEVICE_TOKEN) {
        if let Some(ref device_token) = tokens.device_token {
            object.insert(
                KEY_DEVICE_TOKEN.to_string(),
                Value::String(device_token.clone()),
            );
        }
    }
    if object.contains_key(KEY_IDENTITY_TOKEN) {
        if let Some(ref identity_token) = tokens.identity_token {
            object.insert(
                KEY_IDENTITY_TOKEN.to_string(),
                Value::String(identity_token.clone()),
            );
        }
    }
}
