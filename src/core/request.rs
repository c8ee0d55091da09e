//! Request record for a single inference call.
//!
//! A request is created by the transport adapter with all immutable fields
//! set, owned by the queue while pending, transferred exclusively to a
//! runner at dispatch, and destroyed after its response (or error) is
//! delivered. The response sink is one-shot and idempotent, so a late
//! timeout and a normal completion can race without double delivery.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::core::tensor::{InputTensor, OutputTensor};
use crate::error::{Error, Result};

/// Unique identifier for a request.
pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle timestamps for a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTiming {
    enqueued: Option<Instant>,
    dequeued: Option<Instant>,
    completed: Option<Instant>,
}

impl RequestTiming {
    /// Record the moment the request entered the queue.
    pub fn record_queue_entry(&mut self, now: Instant) {
        self.enqueued = Some(now);
    }

    /// Record the moment the request was removed for dispatch.
    pub fn record_dequeue(&mut self, now: Instant) {
        self.dequeued = Some(now);
    }

    /// Record the moment the response was produced.
    pub fn record_complete(&mut self, now: Instant) {
        self.completed = Some(now);
    }

    /// When the request entered the queue.
    pub fn enqueued(&self) -> Option<Instant> {
        self.enqueued
    }

    /// When the request was removed for dispatch.
    pub fn dequeued(&self) -> Option<Instant> {
        self.dequeued
    }

    /// When the response was produced.
    pub fn completed(&self) -> Option<Instant> {
        self.completed
    }
}

/// A completed inference result delivered through the response sink.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    /// Id of the request this response answers.
    pub request_id: RequestId,
    /// Correlation id copied from the request.
    pub correlation_id: String,
    /// Output tensors, filtered to the request's `requested_outputs`.
    pub outputs: Vec<OutputTensor>,
}

type SinkFn = Box<dyn FnOnce(Result<InferenceResponse>) + Send>;

/// One-shot response delivery callback owned by the transport adapter.
///
/// Thread-safe and idempotent: the first `send` consumes the callback,
/// every later `send` is a no-op. Sinks from different requests may fire
/// concurrently.
#[derive(Clone)]
pub struct ResponseSender {
    slot: Arc<Mutex<Option<SinkFn>>>,
}

impl ResponseSender {
    /// Wrap a delivery callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<InferenceResponse>) + Send + 'static,
    {
        Self {
            slot: Arc::new(Mutex::new(Some(Box::new(callback)))),
        }
    }

    /// Create a sender backed by an mpsc channel, returning the receiver.
    pub fn channel() -> (Self, mpsc::Receiver<Result<InferenceResponse>>) {
        let (tx, rx) = mpsc::channel();
        let sender = Self::new(move |result| {
            let _ = tx.send(result);
        });
        (sender, rx)
    }

    /// Deliver the result. Returns false if the sink already fired.
    pub fn send(&self, result: Result<InferenceResponse>) -> bool {
        let callback = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match callback {
            Some(callback) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    /// Whether the sink has already fired.
    pub fn is_spent(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

impl fmt::Debug for ResponseSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSender")
            .field("spent", &self.is_spent())
            .finish()
    }
}

/// A single inference request.
///
/// # Example
///
/// ```
/// use microbatch::core::request::{InferenceRequest, ResponseSender};
/// use microbatch::core::tensor::{DType, InputTensor, TensorData};
///
/// let (sink, _rx) = ResponseSender::channel();
/// let input = InputTensor::new("x", DType::Fp32, vec![1, 4], TensorData::host(vec![0; 16]));
/// let request = InferenceRequest::new("corr-1", vec![input], vec!["y".into()], sink)
///     .with_priority(2);
/// assert_eq!(request.priority(), 2);
/// ```
pub struct InferenceRequest {
    id: RequestId,
    correlation_id: String,
    priority: u32,
    deadline: Option<Instant>,
    effective_deadline: Option<Instant>,
    batch_dim: usize,
    inputs: Vec<InputTensor>,
    requested_outputs: Vec<String>,
    timing: RequestTiming,
    sink: ResponseSender,
}

impl InferenceRequest {
    /// Create a request with a fresh monotonic id.
    ///
    /// An empty `requested_outputs` means "all outputs".
    pub fn new(
        correlation_id: impl Into<String>,
        inputs: Vec<InputTensor>,
        requested_outputs: Vec<String>,
        sink: ResponseSender,
    ) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            correlation_id: correlation_id.into(),
            priority: 0,
            deadline: None,
            effective_deadline: None,
            batch_dim: 1,
            inputs,
            requested_outputs,
            timing: RequestTiming::default(),
            sink,
        }
    }

    /// Set the priority (0 = unspecified, 1 = highest).
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    // ========== Getters ==========

    /// Request id.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Correlation id supplied by the client.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Priority (0 = unspecified).
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Client-supplied absolute deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Deadline in force while queued (level default unless overridden).
    pub fn effective_deadline(&self) -> Option<Instant> {
        self.effective_deadline
    }

    /// Input tensors in client order.
    pub fn inputs(&self) -> &[InputTensor] {
        &self.inputs
    }

    /// Look up an input by name.
    pub fn input(&self, name: &str) -> Option<&InputTensor> {
        self.inputs.iter().find(|input| input.name == name)
    }

    /// Requested output names; empty means all.
    pub fn requested_outputs(&self) -> &[String] {
        &self.requested_outputs
    }

    /// Leading batch dimension (1 when the model does not batch).
    pub fn batch_dim(&self) -> usize {
        self.batch_dim
    }

    /// Lifecycle timestamps.
    pub fn timing(&self) -> &RequestTiming {
        &self.timing
    }

    /// Mutable lifecycle timestamps; after dispatch only the owning
    /// runner may call this.
    pub fn timing_mut(&mut self) -> &mut RequestTiming {
        &mut self.timing
    }

    /// Clone of the response sink.
    pub fn sink(&self) -> ResponseSender {
        self.sink.clone()
    }

    // ========== Lifecycle ==========

    pub(crate) fn set_batch_dim(&mut self, batch_dim: usize) {
        self.batch_dim = batch_dim.max(1);
    }

    pub(crate) fn set_effective_deadline(&mut self, deadline: Option<Instant>) {
        self.effective_deadline = deadline;
    }

    /// Whether the effective deadline has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.effective_deadline.is_some_and(|d| d <= now)
    }

    /// Deliver a successful response. Returns false if the sink already
    /// fired.
    pub fn respond(&self, outputs: Vec<OutputTensor>) -> bool {
        self.sink.send(Ok(InferenceResponse {
            request_id: self.id,
            correlation_id: self.correlation_id.clone(),
            outputs,
        }))
    }

    /// Drop the request with an error response. Idempotent and safe to
    /// call after ownership has been taken: a second invocation is a
    /// no-op.
    pub fn abort(&self, error: Error) -> bool {
        self.sink.send(Err(error))
    }
}

impl fmt::Debug for InferenceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceRequest")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("priority", &self.priority)
            .field("batch_dim", &self.batch_dim)
            .field("inputs", &self.inputs.len())
            .finish()
    }
}
