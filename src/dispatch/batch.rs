use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{CallFailure, CallParams, ChatBackend, ChatMessage, Outcome, millis};
use crate::error::{FailureKind, FarmError};

/// How long to wait for aborted tasks to wind down after cancellation.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Emit a progress line every this many completed requests.
const PROGRESS_EVERY: usize = 1000;

/// A batch of independent chat requests and the limits they run under.
#[derive(Debug, Clone)]
pub struct BatchJob {
    /// One conversation per request, in submission order.
    pub requests: Vec<Vec<ChatMessage>>,
    pub params: CallParams,
    /// Maximum number of calls in flight at once.
    pub concurrency: usize,
    /// Bound on each individual call, measured from slot admission.
    pub timeout: Duration,
}

impl BatchJob {
    pub fn new(
        requests: Vec<Vec<ChatMessage>>,
        params: CallParams,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            requests,
            params,
            concurrency,
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Number of admission slots actually used: never more than there are requests.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.min(self.requests.len())
    }

    pub fn validate(&self) -> Result<(), FarmError> {
        if self.concurrency == 0 {
            return Err(FarmError::InvalidBatch(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(FarmError::InvalidBatch("timeout must be positive".to_string()));
        }
        self.params.validate()
    }
}

/// Runs a batch against a single-request backend under a fixed concurrency ceiling.
///
/// - Output has one outcome per input, ordered by input index
/// - Each call is admitted through a semaphore, then bounded by the job timeout
/// - Per-request failures are captured into their slot, never returned as `Err`
/// - Panicking calls are attributed to their slot via the task id
pub struct BatchDispatcher<B> {
    backend: Arc<B>,
}

impl<B> Clone for BatchDispatcher<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: ChatBackend> BatchDispatcher<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub async fn dispatch(&self, job: BatchJob) -> Result<Vec<Outcome>, FarmError> {
        self.dispatch_with_cancel(job, CancellationToken::new()).await
    }

    /// Like [`dispatch`](Self::dispatch), but abandons unfinished calls once
    /// `cancel` fires. Filled slots are kept; the rest become `Cancelled`.
    pub async fn dispatch_with_cancel(
        &self,
        job: BatchJob,
        cancel: CancellationToken,
    ) -> Result<Vec<Outcome>, FarmError> {
        job.validate()?;

        let total = job.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let permits = job.effective_concurrency();
        let timeout = job.timeout;
        let semaphore = Arc::new(Semaphore::new(permits));
        let params = Arc::new(job.params);
        let start = Instant::now();

        tracing::debug!(total, concurrency = permits, timeout_ms = millis(timeout), "dispatching batch");

        let mut set = JoinSet::new();
        let mut task_index: HashMap<TaskId, usize> = HashMap::with_capacity(total);

        for (index, messages) in job.requests.into_iter().enumerate() {
            let backend = Arc::clone(&self.backend);
            let semaphore = Arc::clone(&semaphore);
            let params = Arc::clone(&params);

            let abort_handle = set.spawn(async move {
                let result = run_call(&*backend, &semaphore, &messages, &params, timeout).await;
                (index, result)
            });
            task_index.insert(abort_handle.id(), index);
        }

        let mut slots = ResultSlots::new(total);

        loop {
            tokio::select! {
                biased; // drain finished calls before honoring cancellation
                joined = set.join_next() => {
                    match joined {
                        Some(Ok((index, result))) => slots.fill_result(index, result),
                        Some(Err(join_err)) => {
                            let Some(&index) = task_index.get(&join_err.id()) else {
                                tracing::error!("batch task without slot mapping: {join_err}");
                                continue;
                            };
                            if join_err.is_panic() {
                                tracing::error!(index, "batch task panicked: {join_err}");
                                slots.fill_failure(index, FailureKind::Panicked, format!("task panicked: {join_err}"));
                            } else {
                                slots.fill_failure(index, FailureKind::Cancelled, "task aborted".to_string());
                            }
                        }
                        None => break,
                    }
                    if slots.filled() > 0 && slots.filled() % PROGRESS_EVERY == 0 {
                        tracing::debug!(done = slots.filled(), total, "batch progress");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::warn!(done = slots.filled(), total, "batch cancelled, abandoning remaining requests");
                    set.abort_all();
                    break;
                }
            }
        }

        // After abort_all(): keep results that raced the abort, drop the rest.
        if !set.is_empty() {
            let grace = tokio::time::sleep(DRAIN_GRACE);
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    biased;
                    joined = set.join_next() => {
                        match joined {
                            Some(Ok((index, result))) => slots.fill_result(index, result),
                            Some(Err(join_err)) if join_err.is_panic() => {
                                if let Some(&index) = task_index.get(&join_err.id()) {
                                    tracing::error!(index, "batch task panicked during abort: {join_err}");
                                    slots.fill_failure(index, FailureKind::Panicked, format!("task panicked: {join_err}"));
                                }
                            }
                            Some(Err(_)) => {} // aborted, filled as Cancelled by finish()
                            None => break,
                        }
                    }
                    _ = &mut grace => {
                        tracing::warn!("{} tasks hung after abort, abandoning drain", set.len());
                        break;
                    }
                }
            }
        }

        let elapsed_ms = millis(start.elapsed());
        let outcomes = slots.finish(elapsed_ms);
        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        tracing::info!(
            total,
            succeeded = total - failed,
            failed,
            elapsed_ms,
            "batch complete"
        );
        Ok(outcomes)
    }
}

/// Acquire an admission slot, then run one call under the per-call timeout.
/// The timeout clock starts only after the slot is held.
async fn run_call<B: ChatBackend>(
    backend: &B,
    semaphore: &Semaphore,
    messages: &[ChatMessage],
    params: &CallParams,
    timeout: Duration,
) -> Result<Value, FarmError> {
    let _permit = semaphore
        .acquire()
        .await
        .map_err(|_| FarmError::Other("semaphore closed".to_string()))?;

    // Dropping the call future on expiry cancels the underlying transport.
    match tokio::time::timeout(timeout, backend.call(messages, params)).await {
        Ok(result) => result,
        Err(_) => Err(FarmError::Timeout(millis(timeout))),
    }
}

/// Index-aligned outcome storage. Written only by the collecting task.
struct ResultSlots {
    slots: Vec<Option<Outcome>>,
    filled: usize,
}

impl ResultSlots {
    fn new(len: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(len).collect(),
            filled: 0,
        }
    }

    fn filled(&self) -> usize {
        self.filled
    }

    fn fill_result(&mut self, index: usize, result: Result<Value, FarmError>) {
        match result {
            Ok(value) => self.fill(index, Ok(value)),
            Err(e) => self.fill(index, Err(CallFailure::from_error(index, &e))),
        }
    }

    fn fill_failure(&mut self, index: usize, kind: FailureKind, message: String) {
        self.fill(
            index,
            Err(CallFailure {
                index,
                kind,
                message,
            }),
        );
    }

    fn fill(&mut self, index: usize, outcome: Outcome) {
        let Some(slot) = self.slots.get_mut(index) else {
            tracing::error!(index, "outcome for out-of-range slot dropped");
            return;
        };
        if slot.is_some() {
            tracing::error!(index, "slot already filled, keeping first outcome");
            return;
        }
        if let Err(f) = &outcome {
            tracing::warn!(index, kind = %f.kind, error = %f.message, "batch request failed");
        }
        *slot = Some(outcome);
        self.filled += 1;
    }

    /// Close out the batch. Any slot still empty was abandoned by cancellation.
    fn finish(self, elapsed_ms: u64) -> Vec<Outcome> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    Err(CallFailure::from_error(index, &FarmError::Cancelled(elapsed_ms)))
                })
            })
            .collect()
    }
}
