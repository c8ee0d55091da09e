//! Executor contract.
//!
//! The scheduler treats the model runtime as an opaque callable held
//! polymorphically: anything implementing [`Executor`] can be driven by
//! the runner threads. Executors receive a formed [`Batch`] with inputs
//! already packed into contiguous buffers and report either batched
//! outputs (which the runner scatters), per-request outcomes, or a
//! single batch-level error fanned out to every request.

use crate::core::request::InferenceRequest;
use crate::core::tensor::{MemoryKind, OutputTensor};
use crate::dataplane::GatheredInput;
use crate::error::Result;

/// A formed batch handed to the executor.
#[derive(Debug)]
pub struct Batch {
    requests: Vec<InferenceRequest>,
    inputs: Vec<GatheredInput>,
}

impl Batch {
    /// Assemble a batch from dispatched requests and gathered inputs.
    pub fn new(requests: Vec<InferenceRequest>, inputs: Vec<GatheredInput>) -> Self {
        Self { requests, inputs }
    }

    /// Requests in dispatch order.
    pub fn requests(&self) -> &[InferenceRequest] {
        &self.requests
    }

    /// Number of requests in the batch.
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Sum of per-request batch dimensions.
    pub fn effective_batch_size(&self) -> usize {
        self.requests.iter().map(|r| r.batch_dim()).sum()
    }

    /// Gathered inputs, one per input name.
    pub fn inputs(&self) -> &[GatheredInput] {
        &self.inputs
    }

    /// Look up a gathered input by name.
    pub fn input(&self, name: &str) -> Option<&GatheredInput> {
        self.inputs.iter().find(|input| input.name == name)
    }

    pub(crate) fn into_parts(self) -> (Vec<InferenceRequest>, Vec<GatheredInput>) {
        (self.requests, self.inputs)
    }
}

/// What an executor produced for a batch.
#[derive(Debug)]
pub enum BatchOutput {
    /// One batched tensor per output name; the runner strides these back
    /// into per-request slices.
    Batched(Vec<OutputTensor>),
    /// Already-split outcome per request, in batch order.
    PerRequest(Vec<Result<Vec<OutputTensor>>>),
}

/// A model runtime driven by the runner threads.
///
/// `init` runs once per runner before the scheduler accepts work;
/// `warmup` runs after a successful init and its failure is non-fatal.
/// `execute` must produce one outcome per request or return a
/// batch-level error.
pub trait Executor: Send + Sync {
    /// Prepare per-runner state. A failure aborts scheduler creation.
    fn init(&self, _runner_id: usize) -> Result<()> {
        Ok(())
    }

    /// Warm the runner (e.g. run a dummy batch). Failures are logged.
    fn warmup(&self, _runner_id: usize) -> Result<()> {
        Ok(())
    }

    /// Memory space gathered input buffers should be placed in.
    fn input_memory_kind(&self) -> MemoryKind {
        MemoryKind::Host
    }

    /// Memory space scattered output slices should be placed in.
    fn output_memory_kind(&self) -> MemoryKind {
        MemoryKind::Host
    }

    /// Execute one batch. A top-level `Err` fans out to every request.
    fn execute(&self, batch: &Batch) -> Result<BatchOutput>;
}

/// Adapter turning a closure into an [`Executor`], for tests and demos.
pub struct ClosureExecutor<F>
where
    F: Fn(&Batch) -> Result<BatchOutput> + Send + Sync,
{
    run: F,
}

impl<F> ClosureExecutor<F>
where
    F: Fn(&Batch) -> Result<BatchOutput> + Send + Sync,
{
    /// Wrap the closure.
    pub fn new(run: F) -> Self {
        Self { run }
    }
}

impl<F> Executor for ClosureExecutor<F>
where
    F: Fn(&Batch) -> Result<BatchOutput> + Send + Sync,
{
    fn execute(&self, batch: &Batch) -> Result<BatchOutput> {
        (self.run)(batch)
    }
}
