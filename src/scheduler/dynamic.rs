//! Dynamic batching scheduler.
//!
//! Producer threads call [`DynamicBatchScheduler::enqueue`]; runner
//! threads share the queue through a single mutex/condvar and each
//! iteration asks the batch former for the largest legal batch, pops it,
//! gathers inputs, invokes the executor, scatters outputs, and publishes
//! responses - directly, or through the response orderer when global
//! ordering is requested. Blocking on one mutex is deliberate: per-batch
//! model execution dominates the protected section by orders of
//! magnitude.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::BatcherConfig;
use crate::core::request::{InferenceRequest, InferenceResponse};
use crate::core::schema::ModelSchema;
use crate::core::tensor::OutputTensor;
use crate::dataplane::{gather_input, scatter_output, TransferStream};
use crate::error::{Error, Result};
use crate::executor::{Batch, BatchOutput, Executor};
use crate::scheduler::batch::{BatchFormer, FormerDecision};
use crate::scheduler::ordering::{ReadyResponse, ResponseOrderer};
use crate::scheduler::queue::{PriorityQueueSet, PushOutcome};

struct Shared {
    queue: PriorityQueueSet,
    next_completion_id: u64,
    stop: bool,
}

struct SchedulerState {
    shared: Mutex<Shared>,
    work_available: Condvar,
    schema: ModelSchema,
    former: BatchFormer,
    config: BatcherConfig,
    executor: Arc<dyn Executor>,
    orderer: Option<ResponseOrderer>,
}

impl SchedulerState {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// What a runner found after one pass under the scheduler mutex.
enum Step {
    Batch {
        requests: Vec<InferenceRequest>,
        expired: Vec<InferenceRequest>,
        completion_id: Option<u64>,
    },
    Expired(Vec<InferenceRequest>),
    Shutdown,
}

/// Scheduler that feeds batched work to a pool of runner threads.
///
/// Dropping the scheduler signals every runner, waits for in-flight
/// batches to finish, and responds `Shutdown` to everything still
/// queued.
pub struct DynamicBatchScheduler {
    state: Arc<SchedulerState>,
    runners: Vec<JoinHandle<()>>,
}

impl DynamicBatchScheduler {
    /// Create the scheduler and spawn its runner threads.
    ///
    /// Each runner invokes `executor.init(runner_id)` synchronously;
    /// creation fails if any init fails. After a successful init each
    /// runner invokes `executor.warmup(runner_id)`; warmup errors are
    /// logged and non-fatal.
    ///
    /// # Errors
    ///
    /// Returns the first init failure, or [`Error::Internal`] when a
    /// runner thread cannot be spawned.
    pub fn build(
        schema: ModelSchema,
        config: BatcherConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        let mut config = config;
        if config.dynamic_batching && !schema.supports_batching() {
            warn!("model does not support batching; dynamic batching disabled");
            config.dynamic_batching = false;
        }
        let runner_count = config.runner_count.max(1);
        let state = Arc::new(SchedulerState {
            shared: Mutex::new(Shared {
                queue: PriorityQueueSet::new(&config),
                next_completion_id: 0,
                stop: false,
            }),
            work_available: Condvar::new(),
            former: BatchFormer::from_config(&config),
            orderer: config.preserve_ordering.then(ResponseOrderer::new),
            schema,
            config,
            executor,
        });

        let (init_tx, init_rx) = mpsc::channel::<Result<()>>();
        let mut runners = Vec::with_capacity(runner_count);
        let mut spawn_error = None;
        for runner_id in 0..runner_count {
            let state = Arc::clone(&state);
            let init_tx = init_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("batch-runner-{runner_id}"))
                .spawn(move || {
                    let init_result = state.executor.init(runner_id);
                    let failed = init_result.is_err();
                    let _ = init_tx.send(init_result);
                    if failed {
                        return;
                    }
                    info!(runner_id, nice = state.config.nice, "runner started");
                    if let Err(err) = state.executor.warmup(runner_id) {
                        warn!(runner_id, %err, "warmup failed");
                    }
                    runner_loop(&state, runner_id);
                    info!(runner_id, "runner exiting");
                });
            match spawned {
                Ok(handle) => runners.push(handle),
                Err(err) => {
                    spawn_error = Some(Error::Internal(format!(
                        "failed to spawn runner thread: {err}"
                    )));
                    break;
                }
            }
        }
        drop(init_tx);

        let mut first_error = spawn_error;
        for _ in 0..runners.len() {
            match init_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(_) => {
                    first_error.get_or_insert(Error::Internal(
                        "runner exited before reporting init".into(),
                    ));
                }
            }
        }

        if let Some(err) = first_error {
            error!(%err, "scheduler creation failed, stopping runners");
            state.lock().stop = true;
            state.work_available.notify_all();
            for handle in runners {
                let _ = handle.join();
            }
            return Err(err);
        }

        Ok(Self { state, runners })
    }

    /// Accept a request.
    ///
    /// Validation failures, queue-policy rejections, and shutdown are
    /// all delivered through the request's response sink; the call never
    /// blocks and never runs the model on the caller's thread.
    pub fn enqueue(&self, mut request: InferenceRequest) {
        match self.state.schema.validate(&request) {
            Ok(batch_dim) => request.set_batch_dim(batch_dim),
            Err(err) => {
                debug!(request_id = request.id(), %err, "rejecting request at validation");
                request.abort(err);
                return;
            }
        }

        let now = Instant::now();
        request.timing_mut().record_queue_entry(now);

        let outcome = {
            let mut shared = self.state.lock();
            if shared.stop {
                drop(shared);
                request.abort(Error::Shutdown);
                return;
            }
            let outcome = shared.queue.push(request, now);
            self.state.work_available.notify_one();
            outcome
        };

        match outcome {
            PushOutcome::Accepted { evicted } => {
                for victim in evicted {
                    victim.abort(Error::Timeout);
                }
            }
            PushOutcome::Rejected { request, error } => {
                request.abort(error);
            }
        }
    }

    /// Number of requests currently queued.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Number of runner threads.
    pub fn runner_count(&self) -> usize {
        self.runners.len()
    }
}

impl Drop for DynamicBatchScheduler {
    fn drop(&mut self) {
        self.state.lock().stop = true;
        self.state.work_available.notify_all();
        for handle in self.runners.drain(..) {
            let _ = handle.join();
        }

        let drained = self.state.lock().queue.drain_all();
        if !drained.is_empty() {
            info!(count = drained.len(), "responding to queued requests at shutdown");
        }
        for request in drained {
            request.abort(Error::Shutdown);
        }
    }
}

fn runner_loop(state: &SchedulerState, runner_id: usize) {
    loop {
        match next_step(state) {
            Step::Shutdown => return,
            Step::Expired(expired) => deliver_timeouts(expired),
            Step::Batch {
                requests,
                expired,
                completion_id,
            } => {
                deliver_timeouts(expired);
                debug!(
                    runner_id,
                    batch = requests.len(),
                    completion_id,
                    "dispatching batch"
                );
                run_batch(state, requests, completion_id);
            }
        }
    }
}

// One pass under the scheduler mutex: sweep timeouts, consult the
// former, and either take a batch or wait. Spurious wakes are safe
// because the whole decision is recomputed every iteration.
fn next_step(state: &SchedulerState) -> Step {
    let mut shared = state.lock();
    loop {
        if shared.stop {
            return Step::Shutdown;
        }
        let now = Instant::now();
        let expired = shared.queue.expire_timed_out(now);

        match state.former.form(&shared.queue, now) {
            FormerDecision::Dispatch(count) => {
                let mut requests = shared.queue.pop_front(count);
                let dequeued_at = Instant::now();
                for request in &mut requests {
                    request.timing_mut().record_dequeue(dequeued_at);
                }
                let completion_id = if state.orderer.is_some() {
                    let id = shared.next_completion_id;
                    shared.next_completion_id += 1;
                    Some(id)
                } else {
                    None
                };
                return Step::Batch {
                    requests,
                    expired,
                    completion_id,
                };
            }
            decision => {
                if !expired.is_empty() {
                    // Deliver timeout errors outside the lock before
                    // going back to sleep.
                    return Step::Expired(expired);
                }
                let hint = match decision {
                    FormerDecision::Wait(hint) => hint,
                    _ => None,
                };
                // Sleep no longer than the nearest queued deadline so
                // timeout sweeps stay prompt.
                let deadline_bound = shared
                    .queue
                    .earliest_deadline()
                    .map(|deadline| deadline.saturating_duration_since(now));
                let bound = match (hint, deadline_bound) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (Some(a), None) => Some(a),
                    (None, b) => b,
                };
                shared = match bound {
                    Some(timeout) => {
                        state
                            .work_available
                            .wait_timeout(shared, timeout)
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .0
                    }
                    None => state
                        .work_available
                        .wait(shared)
                        .unwrap_or_else(|poisoned| poisoned.into_inner()),
                };
            }
        }
    }
}

fn deliver_timeouts(expired: Vec<InferenceRequest>) {
    for request in expired {
        debug!(request_id = request.id(), "request timed out in queue");
        request.abort(Error::Timeout);
    }
}

// Gather, execute, scatter, publish. Requests checked once more before
// dispatch: an expired request never runs, but its response still goes
// through the batch's publication path so ordering holds.
fn run_batch(
    state: &SchedulerState,
    requests: Vec<InferenceRequest>,
    completion_id: Option<u64>,
) {
    let now = Instant::now();
    let total = requests.len();
    let mut outcomes: Vec<Option<Result<Vec<OutputTensor>>>> = Vec::with_capacity(total);
    for request in &requests {
        if request.is_expired(now) {
            outcomes.push(Some(Err(Error::Timeout)));
        } else {
            outcomes.push(None);
        }
    }

    // Split live requests out while remembering each one's original slot.
    let mut parked: Vec<Option<InferenceRequest>> = requests.into_iter().map(Some).collect();
    let mut live = Vec::new();
    let mut live_slots = Vec::new();
    for (index, slot) in parked.iter_mut().enumerate() {
        if outcomes[index].is_none() {
            if let Some(request) = slot.take() {
                live_slots.push(index);
                live.push(request);
            }
        }
    }

    let live = if live.is_empty() {
        live
    } else {
        execute_live(state, live, &live_slots, &mut outcomes)
    };

    // Reassemble in original batch order and publish.
    let completed_at = Instant::now();
    let mut live_iter = live.into_iter();
    let mut ready: Vec<ReadyResponse> = Vec::with_capacity(total);
    for (slot, outcome) in parked.into_iter().zip(outcomes) {
        let mut request = match slot {
            Some(request) => request,
            None => match live_iter.next() {
                Some(request) => request,
                None => continue,
            },
        };
        request.timing_mut().record_complete(completed_at);
        let result = match outcome {
            Some(Ok(outputs)) => Ok(InferenceResponse {
                request_id: request.id(),
                correlation_id: request.correlation_id().to_string(),
                outputs: filter_outputs(outputs, request.requested_outputs()),
            }),
            Some(Err(err)) => Err(err),
            None => {
                error!(request_id = request.id(), "request finished without an outcome");
                Err(Error::Internal("request finished without an outcome".into()))
            }
        };
        ready.push((request.sink(), result));
    }

    match (&state.orderer, completion_id) {
        (Some(orderer), Some(id)) => orderer.submit(id, ready),
        _ => {
            for (sink, result) in ready {
                sink.send(result);
            }
        }
    }
}

// Run the executor over the live subset. Outcome slots are written
// through `live_slots`, which maps live positions back to batch order.
fn execute_live(
    state: &SchedulerState,
    live: Vec<InferenceRequest>,
    live_slots: &[usize],
    outcomes: &mut [Option<Result<Vec<OutputTensor>>>],
) -> Vec<InferenceRequest> {
    let batchable = state.schema.supports_batching();
    let input_kind = state.executor.input_memory_kind();
    let mut stream = TransferStream::new();
    let mut gathered = Vec::new();
    let mut gather_failed = false;

    let names: Vec<String> = live[0].inputs().iter().map(|i| i.name.clone()).collect();
    for name in &names {
        match gather_input(name, &live, batchable, input_kind, &mut stream) {
            Ok((input, failures)) => {
                for (position, err) in failures {
                    outcomes[live_slots[position]].get_or_insert(Err(err));
                }
                gathered.push(input);
            }
            Err(err) => {
                error!(input = %name, %err, "failed to gather batch input");
                for &slot in live_slots {
                    outcomes[slot].get_or_insert(Err(err.clone()));
                }
                gather_failed = true;
                break;
            }
        }
    }
    if gather_failed {
        return live;
    }

    // One stream sync before execution covers every staged input copy.
    stream.synchronize();

    let batch = Batch::new(live, gathered);
    let executed = state.executor.execute(&batch);
    let (live, _gathered) = batch.into_parts();

    match executed {
        Err(err) => {
            // Batch-level failure fans out to every request that does
            // not already carry its own error.
            for &slot in live_slots {
                outcomes[slot].get_or_insert(Err(err.clone()));
            }
        }
        Ok(BatchOutput::PerRequest(results)) => {
            if results.len() != live.len() {
                let err = Error::Internal(format!(
                    "executor returned {} results for a batch of {}",
                    results.len(),
                    live.len()
                ));
                error!(%err, "dropping malformed executor output");
                for &slot in live_slots {
                    outcomes[slot].get_or_insert(Err(err.clone()));
                }
            } else {
                for (position, result) in results.into_iter().enumerate() {
                    outcomes[live_slots[position]].get_or_insert(result);
                }
            }
        }
        Ok(BatchOutput::Batched(outputs)) => {
            scatter_batched(state, &live, live_slots, outputs, outcomes);
        }
    }

    live
}

fn scatter_batched(
    state: &SchedulerState,
    live: &[InferenceRequest],
    live_slots: &[usize],
    outputs: Vec<OutputTensor>,
    outcomes: &mut [Option<Result<Vec<OutputTensor>>>],
) {
    let output_kind = state.executor.output_memory_kind();
    let batch_dims: Vec<usize> = live.iter().map(|r| r.batch_dim()).collect();
    let mut stream = TransferStream::new();
    let mut staging = Vec::new();
    let mut per_request: Vec<Vec<OutputTensor>> = vec![Vec::new(); live.len()];

    for output in outputs {
        match scatter_output(&output, &batch_dims, output_kind, &mut stream, &mut staging) {
            Ok(slices) => {
                for (position, slice) in slices.into_iter().enumerate() {
                    per_request[position].push(slice);
                }
            }
            Err(err) => {
                error!(output = %output.name, %err, "failed to scatter batch output");
                for &slot in live_slots {
                    outcomes[slot].get_or_insert(Err(err.clone()));
                }
                return;
            }
        }
    }

    // One sync settles every staged output copy before responses leave.
    stream.synchronize();
    drop(staging);

    for (position, outputs) in per_request.into_iter().enumerate() {
        outcomes[live_slots[position]].get_or_insert(Ok(outputs));
    }
}

fn filter_outputs(outputs: Vec<OutputTensor>, requested: &[String]) -> Vec<OutputTensor> {
    if requested.is_empty() {
        return outputs;
    }
    outputs
        .into_iter()
        .filter(|output| requested.iter().any(|name| *name == output.name))
        .collect()
}
