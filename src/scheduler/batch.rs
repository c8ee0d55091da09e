//! Batch formation.
//!
//! The former walks the queue cursor and selects the largest legal
//! prefix: one that stays within `max_batch_size`, agrees on every
//! enforced shape tensor, and either lands exactly on a preferred batch
//! size or justifies dispatch because the oldest candidate has waited
//! out the queue delay. It never mutates the queue; the runner pops the
//! chosen count under the same lock after a dispatch decision.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::BatcherConfig;
use crate::core::request::InferenceRequest;
use crate::core::tensor::TensorData;
use crate::scheduler::queue::PriorityQueueSet;

/// What the runner should do with the current queue state.
#[derive(Debug, PartialEq, Eq)]
pub enum FormerDecision {
    /// Pop this many requests and run them as one batch.
    Dispatch(usize),
    /// Nothing dispatchable yet; wait on the condvar, bounded by the
    /// hint when one exists.
    Wait(Option<Duration>),
    /// The queue is empty.
    Idle,
}

// Shape (and, for shape tensors, value) constraints captured from the
// first request of a candidate batch.
#[derive(Debug)]
struct BatchFingerprint {
    entries: Vec<FingerprintEntry>,
}

#[derive(Debug)]
struct FingerprintEntry {
    name: String,
    shape: Option<Vec<i64>>,
    values: Option<TensorData>,
}

impl BatchFingerprint {
    fn capture(request: &InferenceRequest, enforced: &HashMap<String, bool>) -> Self {
        let mut names: Vec<_> = enforced.iter().collect();
        names.sort_by(|a, b| a.0.cmp(b.0));
        let entries = names
            .into_iter()
            .map(|(name, &is_shape_tensor)| {
                let input = request.input(name);
                FingerprintEntry {
                    name: name.clone(),
                    shape: input.map(|i| i.shape.clone()),
                    values: input
                        .filter(|_| is_shape_tensor)
                        .map(|i| i.data.clone()),
                }
            })
            .collect();
        Self { entries }
    }

    fn matches(&self, request: &InferenceRequest) -> bool {
        self.entries.iter().all(|entry| {
            let input = request.input(&entry.name);
            let shape_matches = match (&entry.shape, input) {
                (Some(shape), Some(input)) => input.shape == *shape,
                (None, None) => true,
                _ => false,
            };
            let values_match = match (&entry.values, input) {
                (Some(values), Some(input)) => input.data.as_slice() == values.as_slice(),
                (None, _) => true,
                (Some(_), None) => false,
            };
            shape_matches && values_match
        })
    }
}

/// Selects a legal batch from queue state under the model constraints.
#[derive(Debug)]
pub struct BatchFormer {
    dynamic_batching: bool,
    max_batch_size: usize,
    preferred_batch_sizes: Vec<usize>,
    max_queue_delay: Duration,
    enforce_equal_shape_tensors: HashMap<String, bool>,
}

impl BatchFormer {
    /// Build the former from the scheduler configuration, sanitising the
    /// preferred-size list.
    pub fn from_config(config: &BatcherConfig) -> Self {
        let mut preferred: Vec<usize> = config
            .preferred_batch_sizes
            .iter()
            .copied()
            .filter(|&size| {
                let in_range = size > 0 && size <= config.max_batch_size;
                if !in_range {
                    warn!(
                        size,
                        max_batch_size = config.max_batch_size,
                        "ignoring out-of-range preferred batch size"
                    );
                }
                in_range
            })
            .collect();
        preferred.sort_unstable();
        preferred.dedup();

        Self {
            dynamic_batching: config.dynamic_batching && config.max_batch_size > 0,
            max_batch_size: config.max_batch_size,
            preferred_batch_sizes: preferred,
            max_queue_delay: config.max_queue_delay(),
            enforce_equal_shape_tensors: config.enforce_equal_shape_tensors.clone(),
        }
    }

    /// Whether dynamic batching is in effect.
    pub fn dynamic_batching(&self) -> bool {
        self.dynamic_batching
    }

    /// Decide what to do with the current queue state.
    pub fn form(&self, queue: &PriorityQueueSet, now: Instant) -> FormerDecision {
        if queue.is_empty() {
            return FormerDecision::Idle;
        }
        if !self.dynamic_batching {
            return FormerDecision::Dispatch(1);
        }

        let mut size = 0usize;
        let mut count = 0usize;
        let mut batch_segment: Option<usize> = None;
        let mut fingerprint: Option<BatchFingerprint> = None;
        let mut best_preferred: Option<usize> = None;
        let mut oldest_entry: Option<Instant> = None;

        for (segment, request) in queue.cursor() {
            // A batch never spans priority levels (or the delayed
            // region); lower-priority work waits for the next batch.
            match batch_segment {
                None => batch_segment = Some(segment),
                Some(current) if current != segment => break,
                Some(_) => {}
            }
            let dim = request.batch_dim().max(1);
            if size + dim > self.max_batch_size {
                break;
            }
            match &fingerprint {
                None => {
                    fingerprint = Some(BatchFingerprint::capture(
                        request,
                        &self.enforce_equal_shape_tensors,
                    ));
                }
                // A mismatch stops extension; the request stays queued
                // for a later batch.
                Some(fp) if !fp.matches(request) => break,
                Some(_) => {}
            }

            size += dim;
            count += 1;
            let enqueued = request.timing().enqueued().unwrap_or(now);
            oldest_entry = Some(match oldest_entry {
                Some(oldest) => oldest.min(enqueued),
                None => enqueued,
            });

            if self.preferred_batch_sizes.binary_search(&size).is_ok() {
                best_preferred = Some(count);
            }
            if size == self.max_batch_size {
                break;
            }
        }

        if count == 0 {
            return FormerDecision::Idle;
        }

        // Dispatch at the largest preferred size the queue can fill now;
        // requests walked past it stay for the next batch.
        if let Some(preferred_count) = best_preferred {
            debug!(count = preferred_count, "dispatching at preferred batch size");
            return FormerDecision::Dispatch(preferred_count);
        }
        if size >= self.max_batch_size {
            debug!(count, "dispatching at max batch size");
            return FormerDecision::Dispatch(count);
        }

        let waited = now.saturating_duration_since(oldest_entry.unwrap_or(now));
        if waited >= self.max_queue_delay {
            debug!(count, ?waited, "dispatching on queue delay");
            return FormerDecision::Dispatch(count);
        }
        FormerDecision::Wait(Some(self.max_queue_delay - waited))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueuePolicy;
    use crate::core::request::ResponseSender;
    use crate::core::tensor::{DType, InputTensor};

    fn config(max_batch: usize, preferred: Vec<usize>, delay_us: u64) -> BatcherConfig {
        BatcherConfig {
            max_batch_size: max_batch,
            preferred_batch_sizes: preferred,
            max_queue_delay_us: delay_us,
            default_queue_policy: QueuePolicy::default(),
            ..Default::default()
        }
    }

    fn shaped_request(batch_dim: usize, shape_value: i32) -> InferenceRequest {
        let (sink, _rx) = ResponseSender::channel();
        let inputs = vec![
            InputTensor::new(
                "data",
                DType::Fp32,
                vec![batch_dim as i64, 1],
                TensorData::host(vec![0u8; batch_dim * 4]),
            ),
            InputTensor::new("S", DType::Int32, vec![batch_dim as i64], {
                let mut bytes = Vec::new();
                for _ in 0..batch_dim {
                    bytes.extend_from_slice(&shape_value.to_le_bytes());
                }
                TensorData::host(bytes)
            }),
        ];
        let mut request = InferenceRequest::new("corr", inputs, Vec::new(), sink);
        request.set_batch_dim(batch_dim);
        request.timing_mut().record_queue_entry(Instant::now());
        request
    }

    fn queue_with(requests: Vec<InferenceRequest>, cfg: &BatcherConfig) -> PriorityQueueSet {
        let mut queue = PriorityQueueSet::new(cfg);
        let now = Instant::now();
        for request in requests {
            queue.push(request, now);
        }
        queue
    }

    #[test]
    fn test_empty_queue_is_idle() {
        let cfg = config(8, vec![4], 10_000);
        let former = BatchFormer::from_config(&cfg);
        let queue = PriorityQueueSet::new(&cfg);
        assert_eq!(former.form(&queue, Instant::now()), FormerDecision::Idle);
    }

    #[test]
    fn test_preferred_size_dispatches_immediately() {
        let cfg = config(8, vec![4, 8], 10_000);
        let former = BatchFormer::from_config(&cfg);
        let queue = queue_with((0..4).map(|_| shaped_request(1, 1)).collect(), &cfg);
        assert_eq!(former.form(&queue, Instant::now()), FormerDecision::Dispatch(4));
    }

    #[test]
    fn test_below_preferred_waits_with_hint() {
        let cfg = config(8, vec![4, 8], 10_000);
        let former = BatchFormer::from_config(&cfg);
        let queue = queue_with((0..3).map(|_| shaped_request(1, 1)).collect(), &cfg);
        match former.form(&queue, Instant::now()) {
            FormerDecision::Wait(Some(hint)) => {
                assert!(hint <= Duration::from_millis(10));
            }
            other => panic!("expected wait, got {other:?}"),
        }
    }

    #[test]
    fn test_delay_elapsed_dispatches_partial() {
        let cfg = config(8, vec![4, 8], 10_000);
        let former = BatchFormer::from_config(&cfg);
        let queue = queue_with((0..3).map(|_| shaped_request(1, 1)).collect(), &cfg);
        let later = Instant::now() + Duration::from_millis(11);
        assert_eq!(former.form(&queue, later), FormerDecision::Dispatch(3));
    }

    #[test]
    fn test_six_queued_dispatches_largest_reachable_preferred() {
        let cfg = config(8, vec![4, 8], 10_000);
        let former = BatchFormer::from_config(&cfg);
        let queue = queue_with((0..6).map(|_| shaped_request(1, 1)).collect(), &cfg);
        assert_eq!(former.form(&queue, Instant::now()), FormerDecision::Dispatch(4));
    }

    #[test]
    fn test_max_batch_size_dispatches_without_preferred() {
        let cfg = config(4, vec![], 10_000);
        let former = BatchFormer::from_config(&cfg);
        let queue = queue_with((0..6).map(|_| shaped_request(1, 1)).collect(), &cfg);
        assert_eq!(former.form(&queue, Instant::now()), FormerDecision::Dispatch(4));
    }

    #[test]
    fn test_batch_dims_accumulate() {
        // Two requests of batch_dim 2 land exactly on preferred size 4.
        let cfg = config(8, vec![4], 10_000);
        let former = BatchFormer::from_config(&cfg);
        let queue = queue_with(vec![shaped_request(2, 1), shaped_request(2, 1)], &cfg);
        assert_eq!(former.form(&queue, Instant::now()), FormerDecision::Dispatch(2));
    }

    #[test]
    fn test_oversize_candidate_stops_extension() {
        // 3 + 3 fits in 8 but adding another 3 would not.
        let cfg = config(8, vec![], 0);
        let former = BatchFormer::from_config(&cfg);
        let queue = queue_with(
            vec![shaped_request(3, 1), shaped_request(3, 1), shaped_request(3, 1)],
            &cfg,
        );
        assert_eq!(former.form(&queue, Instant::now()), FormerDecision::Dispatch(2));
    }

    #[test]
    fn test_shape_tensor_mismatch_stops_extension() {
        let mut cfg = config(8, vec![], 0);
        cfg.enforce_equal_shape_tensors.insert("S".into(), true);
        let former = BatchFormer::from_config(&cfg);
        let queue = queue_with(
            vec![
                shaped_request(1, 1),
                shaped_request(1, 1),
                shaped_request(1, 2),
                shaped_request(1, 1),
            ],
            &cfg,
        );
        // Extension stops at the third request; delay 0 dispatches the
        // first two.
        assert_eq!(former.form(&queue, Instant::now()), FormerDecision::Dispatch(2));
    }

    #[test]
    fn test_batches_never_span_priority_levels() {
        let mut cfg = config(8, vec![], 0);
        cfg.priority_levels = 2;
        let former = BatchFormer::from_config(&cfg);
        let queue = queue_with(
            vec![
                shaped_request(1, 1).with_priority(2),
                shaped_request(1, 1).with_priority(2),
                shaped_request(1, 1).with_priority(1),
            ],
            &cfg,
        );
        // The high-priority request dispatches alone even though the
        // level-2 pair would fit; extension stops at the level boundary.
        assert_eq!(former.form(&queue, Instant::now()), FormerDecision::Dispatch(1));
    }

    #[test]
    fn test_batching_disabled_dispatches_singletons() {
        let mut cfg = config(8, vec![4], 10_000);
        cfg.dynamic_batching = false;
        let former = BatchFormer::from_config(&cfg);
        let queue = queue_with((0..3).map(|_| shaped_request(1, 1)).collect(), &cfg);
        assert_eq!(former.form(&queue, Instant::now()), FormerDecision::Dispatch(1));
    }

    #[test]
    fn test_out_of_range_preferred_sizes_ignored() {
        let cfg = config(4, vec![0, 2, 9], 0);
        let former = BatchFormer::from_config(&cfg);
        let queue = queue_with((0..2).map(|_| shaped_request(1, 1)).collect(), &cfg);
        // Only 2 survives sanitisation.
        assert_eq!(former.form(&queue, Instant::now()), FormerDecision::Dispatch(2));
    }
}
