//! Request scheduling.
//!
//! This module contains:
//! - PriorityQueueSet with per-level queue policies
//! - BatchFormer for selecting legal batches
//! - DynamicBatchScheduler driving the runner threads
//! - ResponseOrderer for cross-runner response ordering

pub mod batch;
pub mod dynamic;
pub mod ordering;
pub mod queue;

pub use batch::{BatchFormer, FormerDecision};
pub use dynamic::DynamicBatchScheduler;
pub use ordering::ResponseOrderer;
pub use queue::{PriorityQueueSet, PushOutcome};
