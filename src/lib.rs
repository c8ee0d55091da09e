//! microbatch: a dynamic request-batching scheduler for model inference
//! servers.
//!
//! This crate implements the scheduling core that sits between a
//! transport layer and a pool of executor workers:
//! - Multi-level priority queues with per-level timeout and capacity
//!   policies
//! - Batch formation driven by preferred sizes, shape-tensor equality,
//!   and a bounded queue delay
//! - Parallel runner threads fed through a single mutex/condvar
//! - Optional global response ordering across runners
//! - Data-plane helpers that gather per-request inputs into contiguous
//!   buffers and scatter batched outputs back

pub mod config;
pub mod error;

pub mod core;
pub mod dataplane;
pub mod executor;
pub mod scheduler;

pub use crate::core::request::{InferenceRequest, InferenceResponse, RequestId, ResponseSender};
pub use crate::core::schema::{InputSpec, ModelSchema};
pub use crate::core::tensor::{DType, InputTensor, MemoryKind, OutputTensor, TensorData};
pub use config::{BatcherConfig, OverflowAction, QueuePolicy, TimeoutAction};
pub use error::{Error, Result};
pub use executor::{Batch, BatchOutput, ClosureExecutor, Executor};
pub use scheduler::DynamicBatchScheduler;
