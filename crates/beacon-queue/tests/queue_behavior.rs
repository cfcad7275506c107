//! End-to-end behavior of the request queue, processing loop, and
//! dispatcher against a scripted transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use beacon_core::{Error, Result, SessionState, SessionStateMachine, TokenStore};
use beacon_queue::{
    spawn_loop, Dispatcher, Operation, OperationHandle, OperationKind, PreparedRequest,
    QueueConfig, QueueState, RequestQueue, Transport, TransportResponse, WaitLock,
};

// ---------------------------------------------------------------------------
// Test transport
// ---------------------------------------------------------------------------

type ResponseFn = dyn Fn(&PreparedRequest) -> Result<TransportResponse> + Send + Sync;

/// Transport double that records call order and observed concurrency.
struct RecordingTransport {
    delay: Duration,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    calls: Mutex<Vec<String>>,
    respond: Box<ResponseFn>,
}

impl RecordingTransport {
    fn new(respond: impl Fn(&PreparedRequest) -> Result<TransportResponse> + Send + Sync + 'static) -> Self {
        Self {
            delay: Duration::ZERO,
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Label calls by the payload's `tag` field, falling back to the endpoint.
    fn label(request: &PreparedRequest) -> String {
        request
            .payload
            .get("tag")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| request.endpoint.clone())
    }

    async fn run(&self, request: &PreparedRequest) -> Result<TransportResponse> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Self::label(request));
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        (self.respond)(request)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn max_observed_concurrency(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

/// Clonable transport handle so tests can keep the recorder for assertions.
#[derive(Clone)]
struct SharedTransport(Arc<RecordingTransport>);

impl Transport for SharedTransport {
    async fn post(&self, request: &PreparedRequest) -> Result<TransportResponse> {
        self.0.run(request).await
    }

    async fn get(&self, request: &PreparedRequest) -> Result<TransportResponse> {
        self.0.run(request).await
    }
}

fn ok_response() -> Result<TransportResponse> {
    Ok(TransportResponse::ok(json!({})))
}

fn session_response() -> Result<TransportResponse> {
    Ok(TransportResponse::ok(json!({
        "session_id": "session-1",
        "device_token": "device-1",
    })))
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    queue: Arc<RequestQueue>,
    session: Arc<SessionStateMachine>,
    tokens: TokenStore,
    transport: Arc<RecordingTransport>,
    loop_handle: tokio::task::JoinHandle<()>,
}

fn harness(config: QueueConfig, transport: RecordingTransport) -> Harness {
    let transport = Arc::new(transport);
    let tokens = TokenStore::new();
    let session = Arc::new(SessionStateMachine::new());
    let queue = Arc::new(RequestQueue::new(config.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        SharedTransport(Arc::clone(&transport)),
        tokens.clone(),
        Arc::clone(&session),
        Arc::new(AtomicBool::new(false)),
        config,
    ));
    let loop_handle = spawn_loop(Arc::clone(&queue), dispatcher);
    Harness {
        queue,
        session,
        tokens,
        transport,
        loop_handle,
    }
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        retry_delay: Duration::from_millis(5),
        task_timeout: Duration::from_millis(500),
        ..QueueConfig::default()
    }
}

fn event_op(tag: &str) -> (Arc<Operation>, OperationHandle) {
    Operation::builder(OperationKind::LogEvent)
        .payload(json!({ "tag": tag }))
        .build()
}

fn seed_session(harness: &Harness) {
    harness.tokens.set_session_id("session-0");
    harness.tokens.set_device_token("device-0");
    harness.session.force_update_state(SessionState::Initialized);
}

async fn expect_ok(handle: OperationHandle) -> Value {
    timeout(Duration::from_secs(2), handle.outcome())
        .await
        .expect("operation should resolve")
        .expect("operation should succeed")
}

async fn expect_err(handle: OperationHandle) -> Error {
    timeout(Duration::from_secs(2), handle.outcome())
        .await
        .expect("operation should resolve")
        .expect_err("operation should fail")
}

// ---------------------------------------------------------------------------
// Single-flight
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_flight_under_concurrent_enqueues() {
    let hx = harness(
        fast_config(),
        RecordingTransport::new(|_| ok_response()).with_delay(Duration::from_millis(10)),
    );
    seed_session(&hx);

    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for i in 0..8 {
        let (op, handle) = event_op(&format!("op-{i}"));
        handles.push(handle);
        let queue = Arc::clone(&hx.queue);
        tasks.push(tokio::spawn(async move { queue.enqueue(op) }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for handle in handles {
        expect_ok(handle).await;
    }

    assert_eq!(hx.transport.call_count(), 8);
    assert_eq!(
        hx.transport.max_observed_concurrency(),
        1,
        "at most one operation may be in flight at any instant"
    );
}

// ---------------------------------------------------------------------------
// FIFO-with-hold
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blocked_head_holds_position_and_later_operations_wait() {
    let hx = harness(
        QueueConfig {
            retry_limit: 1_000,
            ..fast_config()
        },
        RecordingTransport::new(|_| ok_response()),
    );
    seed_session(&hx);

    let (blocked, blocked_handle) = Operation::builder(OperationKind::LogEvent)
        .payload(json!({ "tag": "a" }))
        .lock(WaitLock::AdvertisingId)
        .build();
    let (eligible, eligible_handle) = event_op("b");

    hx.queue.enqueue(blocked);
    hx.queue.enqueue(eligible);

    // B is eligible but must not bypass the blocked head.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(hx.transport.call_count(), 0);

    hx.queue.unlock_all(WaitLock::AdvertisingId);

    expect_ok(blocked_handle).await;
    expect_ok(eligible_handle).await;
    assert_eq!(hx.transport.calls(), vec!["a", "b"]);
}

// ---------------------------------------------------------------------------
// Bounded retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn operation_with_stuck_precondition_fails_after_retry_limit() {
    let hx = harness(
        QueueConfig {
            retry_limit: 3,
            request_timeout: Duration::from_secs(60),
            ..fast_config()
        },
        RecordingTransport::new(|_| ok_response()),
    );
    seed_session(&hx);

    let (op, handle) = Operation::builder(OperationKind::LogEvent)
        .lock(WaitLock::InstallReferrer)
        .build();
    hx.queue.enqueue(op);

    let err = expect_err(handle).await;
    assert!(matches!(err, Error::NoSession), "got {err:?}");
    assert_eq!(hx.transport.call_count(), 0, "transport must never be hit");
    assert!(hx.queue.is_empty());
}

#[tokio::test]
async fn operation_with_stuck_precondition_fails_after_elapsed_timeout() {
    let hx = harness(
        QueueConfig {
            retry_limit: 100_000,
            request_timeout: Duration::from_millis(50),
            ..fast_config()
        },
        RecordingTransport::new(|_| ok_response()),
    );
    seed_session(&hx);

    let (op, handle) = Operation::builder(OperationKind::LogEvent)
        .lock(WaitLock::InstallReferrer)
        .build();
    hx.queue.enqueue(op);

    let err = expect_err(handle).await;
    assert!(matches!(err, Error::RequestTimeout { .. }), "got {err:?}");
    assert_eq!(hx.transport.call_count(), 0);
}

// ---------------------------------------------------------------------------
// Stuck-lock recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stuck_user_agent_lock_is_substituted_and_cleared() {
    let hx = harness(
        QueueConfig {
            retry_limit: 1_000,
            stuck_lock_threshold: Duration::from_millis(30),
            ..fast_config()
        },
        RecordingTransport::new(|_| ok_response()),
    );
    seed_session(&hx);

    let (op, handle) = Operation::builder(OperationKind::LogEvent)
        .payload(json!({ "tag": "ua" }))
        .lock(WaitLock::UserAgent)
        .build();
    hx.queue.enqueue(Arc::clone(&op));

    expect_ok(handle).await;
    assert_eq!(op.payload()["user_agent"], beacon_queue::USER_AGENT_FALLBACK);
    assert_eq!(hx.transport.call_count(), 1);
}

// ---------------------------------------------------------------------------
// Session establishment scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_operation_dispatches_once_lock_clears() {
    let hx = harness(
        fast_config(),
        RecordingTransport::new(|_| session_response()),
    );

    let (op, handle) = Operation::builder(OperationKind::OpenSession)
        .lock(WaitLock::AdvertisingId)
        .build();
    hx.queue.insert_at_front(op);

    let queue = Arc::clone(&hx.queue);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.unlock_all(WaitLock::AdvertisingId);
    });

    expect_ok(handle).await;
    assert_eq!(hx.transport.call_count(), 1, "exactly one dispatch expected");
    assert!(hx.tokens.is_session_valid());
    assert_eq!(hx.session.current(), SessionState::Initialized);
}

#[tokio::test]
async fn queued_operations_drain_in_order_after_session_established() {
    let hx = harness(
        QueueConfig {
            retry_limit: 100_000,
            ..fast_config()
        },
        RecordingTransport::new(|request| {
            if request.endpoint == "v1/open" {
                session_response()
            } else {
                ok_response()
            }
        }),
    );

    let mut handles = Vec::new();
    for i in 1..=5 {
        let (op, handle) = event_op(&i.to_string());
        handles.push(handle);
        hx.queue.enqueue(op);
    }

    // Without a session nothing is eligible.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(hx.transport.call_count(), 0);
    assert_eq!(hx.queue.size(), 5);

    let (init, init_handle) = Operation::builder(OperationKind::OpenSession).build();
    hx.queue.insert_at_front(init);

    expect_ok(init_handle).await;
    for handle in handles {
        expect_ok(handle).await;
    }

    assert_eq!(
        hx.transport.calls(),
        vec!["v1/open", "1", "2", "3", "4", "5"],
        "queued operations must drain in arrival order"
    );
}

// ---------------------------------------------------------------------------
// Duplicate link handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn conflict_on_link_creation_takes_duplicate_path() {
    let hx = harness(
        fast_config(),
        RecordingTransport::new(|_| Ok(TransportResponse::with_status(409, json!({})))),
    );
    seed_session(&hx);

    let (op, handle) = Operation::builder(OperationKind::CreateLink)
        .payload(json!({ "channel": "email" }))
        .build();
    hx.queue.enqueue(op);

    let err = expect_err(handle).await;
    assert!(matches!(err, Error::DuplicateLink), "got {err:?}");
    assert_eq!(hx.transport.call_count(), 1);
    assert!(hx.queue.is_empty());
}

// ---------------------------------------------------------------------------
// Reset during flight
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reset_during_flight_passes_through_resetting_and_fires_callback_once() {
    let hx = harness(
        fast_config(),
        RecordingTransport::new(|_| ok_response()).with_delay(Duration::from_millis(80)),
    );
    seed_session(&hx);

    let states: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let states_clone = Arc::clone(&states);
    hx.session.subscribe(move |_, current| {
        states_clone.lock().unwrap().push(current.name().to_string());
    });

    let (op, handle) = event_op("in-flight");
    hx.queue.enqueue(op);

    // Let the dispatch start, then reset mid-flight.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(hx.queue.in_flight(), 1);
    hx.session.reset(Duration::from_millis(10)).await;

    // The in-flight operation still resolves exactly once.
    expect_ok(handle).await;

    let states = states.lock().unwrap().clone();
    let resetting = states.iter().position(|s| s == "Resetting");
    let uninitialized = states.iter().position(|s| s == "Uninitialized");
    assert!(resetting.is_some(), "states seen: {states:?}");
    assert!(uninitialized.is_some(), "states seen: {states:?}");
    assert!(resetting < uninitialized);
}

// ---------------------------------------------------------------------------
// Pause / resume / shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn paused_queue_accumulates_until_resume() {
    let hx = harness(fast_config(), RecordingTransport::new(|_| ok_response()));
    seed_session(&hx);

    hx.queue.pause();
    let (op, handle) = event_op("paused");
    hx.queue.enqueue(op);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(hx.transport.call_count(), 0);
    assert_eq!(hx.queue.state(), QueueState::Paused);

    hx.queue.resume();
    expect_ok(handle).await;
    assert_eq!(hx.transport.call_count(), 1);
}

#[tokio::test]
async fn shutdown_clears_pending_without_invoking_callbacks_and_stops_loop() {
    let hx = harness(
        QueueConfig {
            retry_limit: 100_000,
            ..fast_config()
        },
        RecordingTransport::new(|_| ok_response()),
    );

    // Blocked forever; never dispatched.
    let (op, handle) = Operation::builder(OperationKind::LogEvent)
        .lock(WaitLock::InstallReferrer)
        .build();
    hx.queue.enqueue(op);

    tokio::time::sleep(Duration::from_millis(20)).await;
    hx.queue.shutdown();

    // The handle observes a dropped channel, not a synthesized result.
    let err = expect_err(handle).await;
    assert!(matches!(err, Error::ChannelClosed), "got {err:?}");

    // The loop task exits.
    timeout(Duration::from_secs(1), hx.loop_handle)
        .await
        .expect("loop should exit after shutdown")
        .unwrap();
    assert_eq!(hx.transport.call_count(), 0);
}
