//! Batch dispatcher tests: cardinality, ordering, admission, isolation,
//! timeouts, panics, and cancellation against an instrumented mock backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use apifarm::dispatch::batch::{BatchDispatcher, BatchJob};
use apifarm::dispatch::{CallParams, ChatBackend, ChatMessage, outcome_is_success};
use apifarm::error::{FailureKind, FarmError};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

/// Behavior is chosen by the request's last message content:
/// - `fail:*`        → upstream 500
/// - `hang:*`        → never answers within a test's lifetime
/// - `panic:*`       → panics inside the call
/// - `drop-panic:*`  → hangs, then panics when the call is dropped
/// - `sleep:<ms>:*`  → answers after `<ms>`
/// - anything else   → answers after the backend's base latency
#[derive(Default)]
struct MockBackend {
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockBackend {
    fn instant() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Default::default()
        })
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter even when the call is dropped mid-flight.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Panics when dropped, so abandoning the call that owns it panics.
struct PanicOnDrop;

impl Drop for PanicOnDrop {
    fn drop(&mut self) {
        panic!("call dropped");
    }
}

impl ChatBackend for MockBackend {
    async fn call(&self, messages: &[ChatMessage], _params: &CallParams) -> Result<Value, FarmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let content = messages.last().map(|m| m.content.clone()).unwrap_or_default();

        if content.starts_with("fail:") {
            return Err(FarmError::Upstream {
                server: "mock".to_string(),
                message: "500 Internal Server Error: boom".to_string(),
                status: Some(500),
            });
        }
        if content.starts_with("hang:") {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if content.starts_with("drop-panic:") {
            let _bomb = PanicOnDrop;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if content.starts_with("panic:") {
            panic!("mock backend panic for {content}");
        }
        if let Some(rest) = content.strip_prefix("sleep:") {
            let ms: u64 = rest.split(':').next().and_then(|s| s.parse().ok()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        } else if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        } else {
            tokio::task::yield_now().await;
        }

        Ok(json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        }))
    }
}

fn params() -> CallParams {
    CallParams::new("meta/llama-3.1-8b-instruct", 0.7, 5000)
}

fn conversation(content: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::user(content)]
}

fn numbered(n: usize) -> Vec<Vec<ChatMessage>> {
    (0..n).map(|i| conversation(&format!("req-{i}"))).collect()
}

fn echoed(v: &Value) -> &str {
    v["choices"][0]["message"]["content"].as_str().unwrap()
}

// ---------------------------------------------------------------------------
// Input validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_batch_returns_empty_without_calls() {
    let backend = MockBackend::instant();
    let dispatcher = BatchDispatcher::new(backend.clone());

    let job = BatchJob::new(vec![], params(), 10, Duration::from_secs(1));
    let outcomes = dispatcher.dispatch(job).await.unwrap();

    assert!(outcomes.is_empty());
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn zero_concurrency_is_programmer_error() {
    let backend = MockBackend::instant();
    let dispatcher = BatchDispatcher::new(backend.clone());

    let job = BatchJob::new(numbered(3), params(), 0, Duration::from_secs(1));
    let err = dispatcher.dispatch(job).await.unwrap_err();

    assert!(matches!(err, FarmError::InvalidBatch(_)));
    assert_eq!(backend.calls(), 0, "no call may start for a rejected batch");
}

#[tokio::test]
async fn invalid_shared_params_are_rejected() {
    let dispatcher = BatchDispatcher::new(MockBackend::instant());

    for bad in [
        CallParams::new("", 0.7, 10),
        CallParams::new("m", f64::NAN, 10),
        CallParams::new("m", -1.0, 10),
        CallParams::new("m", 0.7, 0),
    ] {
        let job = BatchJob::new(numbered(2), bad.clone(), 2, Duration::from_secs(1));
        let result = dispatcher.dispatch(job).await;
        assert!(
            matches!(result, Err(FarmError::InvalidBatch(_))),
            "params {bad:?} should be rejected"
        );
    }
}

#[tokio::test]
async fn concurrency_larger_than_batch_is_clamped() {
    let backend = MockBackend::instant();
    let dispatcher = BatchDispatcher::new(backend.clone());

    let job = BatchJob::new(numbered(3), params(), 1000, Duration::from_secs(5));
    let outcomes = dispatcher.dispatch(job).await.unwrap();

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(outcome_is_success));
    assert!(backend.max_in_flight() <= 3);
}

// ---------------------------------------------------------------------------
// Cardinality, ordering, admission
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_thousand_requests_all_succeed_in_order() {
    let backend = MockBackend::instant();
    let dispatcher = BatchDispatcher::new(backend.clone());

    let job = BatchJob::new(numbered(10_000), params(), 200, Duration::from_millis(600_000));
    let outcomes = dispatcher.dispatch(job).await.unwrap();

    assert_eq!(outcomes.len(), 10_000);
    for (i, outcome) in outcomes.iter().enumerate() {
        let value = outcome.as_ref().unwrap();
        assert_eq!(echoed(value), format!("req-{i}"));
    }
    let successes = outcomes.iter().filter(|o| outcome_is_success(o)).count();
    assert_eq!(successes, 10_000, "success rate must be 100%");
    assert_eq!(backend.calls(), 10_000);
    assert!(backend.max_in_flight() <= 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn output_order_ignores_completion_order() {
    let dispatcher = BatchDispatcher::new(MockBackend::instant());

    // Earlier requests take longer, so they complete last.
    let requests: Vec<_> = (0..8)
        .map(|i| conversation(&format!("sleep:{}:req-{i}", (8 - i) * 25)))
        .collect();
    let job = BatchJob::new(requests, params(), 8, Duration::from_secs(5));
    let outcomes = dispatcher.dispatch(job).await.unwrap();

    for (i, outcome) in outcomes.iter().enumerate() {
        let content = echoed(outcome.as_ref().unwrap());
        assert!(content.ends_with(&format!("req-{i}")), "slot {i} holds {content}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_exceeds_concurrency() {
    let backend = MockBackend::with_latency(Duration::from_millis(20));
    let dispatcher = BatchDispatcher::new(backend.clone());

    let job = BatchJob::new(numbered(50), params(), 5, Duration::from_secs(5));
    let outcomes = dispatcher.dispatch(job).await.unwrap();

    assert_eq!(outcomes.len(), 50);
    assert_eq!(backend.max_in_flight(), 5);
    assert_eq!(backend.in_flight(), 0);
}

#[tokio::test]
async fn concurrency_one_serializes_calls() {
    let backend = MockBackend::with_latency(Duration::from_millis(100));
    let dispatcher = BatchDispatcher::new(backend.clone());

    let start = Instant::now();
    let job = BatchJob::new(numbered(3), params(), 1, Duration::from_secs(5));
    let outcomes = dispatcher.dispatch(job).await.unwrap();

    assert!(outcomes.iter().all(outcome_is_success));
    assert!(
        start.elapsed() >= Duration::from_millis(300),
        "3 x 100ms at concurrency 1 finished in {:?}",
        start.elapsed()
    );
    assert_eq!(backend.max_in_flight(), 1);
}

// ---------------------------------------------------------------------------
// Isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_remote_failure_is_isolated() {
    let dispatcher = BatchDispatcher::new(MockBackend::instant());

    let requests = vec![
        conversation("req-0"),
        conversation("req-1"),
        conversation("fail:req-2"),
        conversation("req-3"),
        conversation("req-4"),
    ];
    let job = BatchJob::new(requests, params(), 2, Duration::from_secs(5));
    let outcomes = dispatcher.dispatch(job).await.unwrap();

    assert_eq!(outcomes.len(), 5);
    for i in [0, 1, 3, 4] {
        assert!(outcome_is_success(&outcomes[i]), "slot {i} should succeed");
    }
    let failure = outcomes[2].as_ref().unwrap_err();
    assert_eq!(failure.index, 2);
    assert_eq!(failure.kind, FailureKind::Remote);
    assert!(failure.message.contains("500"), "detail surfaced: {}", failure.message);
}

#[tokio::test]
async fn panicking_call_is_isolated() {
    let dispatcher = BatchDispatcher::new(MockBackend::instant());

    let requests = vec![
        conversation("req-0"),
        conversation("panic:req-1"),
        conversation("req-2"),
    ];
    let job = BatchJob::new(requests, params(), 3, Duration::from_secs(5));
    let outcomes = dispatcher.dispatch(job).await.unwrap();

    assert_eq!(outcomes.len(), 3);
    assert!(outcome_is_success(&outcomes[0]));
    assert!(outcome_is_success(&outcomes[2]));
    let failure = outcomes[1].as_ref().unwrap_err();
    assert_eq!(failure.index, 1);
    assert_eq!(failure.kind, FailureKind::Panicked);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_failures_never_shrink_output() {
    let dispatcher = BatchDispatcher::new(MockBackend::instant());

    let requests: Vec<_> = (0..200)
        .map(|i| {
            if i % 3 == 0 {
                conversation(&format!("fail:req-{i}"))
            } else {
                conversation(&format!("req-{i}"))
            }
        })
        .collect();
    let job = BatchJob::new(requests, params(), 16, Duration::from_secs(5));
    let outcomes = dispatcher.dispatch(job).await.unwrap();

    assert_eq!(outcomes.len(), 200);
    for (i, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.is_err(), i % 3 == 0, "slot {i}");
        if let Err(f) = outcome {
            assert_eq!(f.index, i);
        }
    }
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hung_call_times_out_without_blocking_batch() {
    let backend = MockBackend::instant();
    let dispatcher = BatchDispatcher::new(backend.clone());

    let requests = vec![
        conversation("req-0"),
        conversation("hang:req-1"),
        conversation("req-2"),
    ];
    let start = Instant::now();
    let job = BatchJob::new(requests, params(), 3, Duration::from_millis(200));
    let outcomes = dispatcher.dispatch(job).await.unwrap();
    let elapsed = start.elapsed();

    assert!(outcome_is_success(&outcomes[0]));
    assert!(outcome_is_success(&outcomes[2]));
    let failure = outcomes[1].as_ref().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(failure.message.contains("200ms"));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2), "batch held for {elapsed:?}");
    assert_eq!(backend.in_flight(), 0, "timed-out call must be abandoned");
}

#[tokio::test]
async fn timeout_excludes_time_waiting_for_a_slot() {
    let backend = MockBackend::with_latency(Duration::from_millis(150));
    let dispatcher = BatchDispatcher::new(backend.clone());

    // Total 450ms of work, but each call alone fits in the 300ms budget.
    let job = BatchJob::new(numbered(3), params(), 1, Duration::from_millis(300));
    let outcomes = dispatcher.dispatch(job).await.unwrap();

    assert!(
        outcomes.iter().all(outcome_is_success),
        "queue wait must not count against the per-call timeout: {outcomes:?}"
    );
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_fills_unfinished_slots() {
    let backend = MockBackend::instant();
    let dispatcher = BatchDispatcher::new(backend.clone());

    let mut requests = numbered(3);
    requests.extend((3..10).map(|i| conversation(&format!("hang:req-{i}"))));
    let job = BatchJob::new(requests, params(), 10, Duration::from_secs(60));

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let outcomes = dispatcher.dispatch_with_cancel(job, token).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(outcomes.len(), 10);
    for (i, outcome) in outcomes.iter().enumerate() {
        if i < 3 {
            assert!(outcome_is_success(outcome), "slot {i} finished before cancel");
        } else {
            let failure = outcome.as_ref().unwrap_err();
            assert_eq!(failure.index, i);
            assert_eq!(failure.kind, FailureKind::Cancelled);
        }
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_dispatch_abandons_in_flight_calls() {
    let backend = MockBackend::instant();
    let dispatcher = BatchDispatcher::new(backend.clone());

    let requests: Vec<_> = (0..4).map(|i| conversation(&format!("hang:req-{i}"))).collect();
    let job = BatchJob::new(requests, params(), 4, Duration::from_secs(60));

    let aborted = tokio::time::timeout(Duration::from_millis(100), dispatcher.dispatch(job)).await;
    assert!(aborted.is_err());

    // JoinSet drop aborts the tasks; give the runtime a moment to run the drops.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panic_while_aborting_is_recorded_as_panicked() {
    let backend = MockBackend::instant();
    let dispatcher = BatchDispatcher::new(backend.clone());

    let requests = vec![
        conversation("req-0"),
        conversation("drop-panic:req-1"),
        conversation("hang:req-2"),
    ];
    let job = BatchJob::new(requests, params(), 3, Duration::from_secs(60));

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let outcomes = dispatcher.dispatch_with_cancel(job, token).await.unwrap();

    assert_eq!(outcomes.len(), 3);
    assert!(outcome_is_success(&outcomes[0]));

    let panicked = outcomes[1].as_ref().unwrap_err();
    assert_eq!(panicked.index, 1);
    assert_eq!(panicked.kind, FailureKind::Panicked);

    let cancelled = outcomes[2].as_ref().unwrap_err();
    assert_eq!(cancelled.index, 2);
    assert_eq!(cancelled.kind, FailureKind::Cancelled);
}
