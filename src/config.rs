//! Configuration types for microbatch.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens to a queued request once its effective timeout expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutAction {
    /// Remove the request and respond with a timeout error.
    Reject,
    /// Keep the request queued, but schedule it only after every live
    /// request at any priority level has been scheduled.
    Delay,
}

/// What happens when a request arrives at a level that is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowAction {
    /// Reject the arriving request with a queue-full error; the oldest
    /// entry stays.
    RejectNew,
    /// Evict the oldest entry with a timeout error and accept the new one.
    DropOldest,
}

/// Per-level queue policy.
///
/// One policy applies to every level unless overridden through
/// [`BatcherConfig::queue_policy_map`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// Maximum number of queued requests at this level (0 = unbounded).
    pub max_queue_size: usize,
    /// Default time a request may spend queued, in microseconds (0 = none).
    pub default_timeout_us: u64,
    /// Action taken when the effective timeout expires.
    pub timeout_action: TimeoutAction,
    /// Whether a request's own deadline may shorten the level default.
    pub allow_timeout_override: bool,
    /// Action taken when the level is at `max_queue_size`.
    pub overflow_action: OverflowAction,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_queue_size: 0,
            default_timeout_us: 0,
            timeout_action: TimeoutAction::Reject,
            allow_timeout_override: false,
            overflow_action: OverflowAction::RejectNew,
        }
    }
}

impl QueuePolicy {
    /// Level default timeout as a `Duration`, if one is configured.
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_us > 0).then(|| Duration::from_micros(self.default_timeout_us))
    }
}

/// Scheduler configuration.
///
/// Model constraints (`max_batch_size`, `preferred_batch_sizes`,
/// `enforce_equal_shape_tensors`) are immutable per scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Number of runner threads, each owning one executor instance.
    pub runner_count: usize,
    /// Niceness hint for runner threads, recorded at startup.
    pub nice: i32,
    /// If false, every request becomes a 1-element batch.
    pub dynamic_batching: bool,
    /// Upper bound on the effective batch size (0 = batching disabled).
    pub max_batch_size: usize,
    /// Batch sizes that trigger immediate dispatch when reached exactly.
    pub preferred_batch_sizes: Vec<usize>,
    /// Upper bound on additional wait once any request is queued, in
    /// microseconds.
    pub max_queue_delay_us: u64,
    /// Emit responses in dequeue order across parallel runners.
    pub preserve_ordering: bool,
    /// Number of priority levels (0 = a single unlabelled queue).
    pub priority_levels: u32,
    /// Level used for requests that carry no priority. Defaults to
    /// `floor(priority_levels / 2) + 1` when unset.
    pub default_priority_level: Option<u32>,
    /// Policy applied to any level lacking an override.
    pub default_queue_policy: QueuePolicy,
    /// Per-level policy overrides, keyed by level (1 = highest priority).
    pub queue_policy_map: HashMap<u32, QueuePolicy>,
    /// Input names requiring shape equality across a batch; a `true`
    /// value marks a shape tensor whose contents must also match.
    pub enforce_equal_shape_tensors: HashMap<String, bool>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            runner_count: 1,
            nice: 0,
            dynamic_batching: true,
            max_batch_size: 8,
            preferred_batch_sizes: Vec::new(),
            max_queue_delay_us: 0,
            preserve_ordering: false,
            priority_levels: 0,
            default_priority_level: None,
            default_queue_policy: QueuePolicy::default(),
            queue_policy_map: HashMap::new(),
            enforce_equal_shape_tensors: HashMap::new(),
        }
    }
}

impl BatcherConfig {
    /// Maximum queue delay as a `Duration`.
    pub fn max_queue_delay(&self) -> Duration {
        Duration::from_micros(self.max_queue_delay_us)
    }

    /// Level index used for requests that carry no priority.
    ///
    /// Clamped into `[1, priority_levels]`; meaningless when
    /// `priority_levels == 0`.
    pub fn resolved_default_priority(&self) -> u32 {
        if self.priority_levels == 0 {
            return 0;
        }
        let level = self
            .default_priority_level
            .unwrap_or(self.priority_levels / 2 + 1);
        level.clamp(1, self.priority_levels)
    }

    /// Policy for the given level, falling back to the default policy.
    pub fn policy_for_level(&self, level: u32) -> &QueuePolicy {
        self.queue_policy_map
            .get(&level)
            .unwrap_or(&self.default_queue_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_priority_resolution() {
        let mut config = BatcherConfig {
            priority_levels: 5,
            ..Default::default()
        };
        assert_eq!(config.resolved_default_priority(), 3);

        config.default_priority_level = Some(1);
        assert_eq!(config.resolved_default_priority(), 1);

        config.default_priority_level = Some(99);
        assert_eq!(config.resolved_default_priority(), 5);

        config.priority_levels = 0;
        assert_eq!(config.resolved_default_priority(), 0);
    }

    #[test]
    fn test_policy_lookup_falls_back_to_default() {
        let mut config = BatcherConfig {
            priority_levels: 2,
            ..Default::default()
        };
        config.queue_policy_map.insert(
            2,
            QueuePolicy {
                max_queue_size: 4,
                ..Default::default()
            },
        );

        assert_eq!(config.policy_for_level(1).max_queue_size, 0);
        assert_eq!(config.policy_for_level(2).max_queue_size, 4);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = BatcherConfig {
            priority_levels: 3,
            preferred_batch_sizes: vec![4, 8],
            max_queue_delay_us: 500,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: BatcherConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.priority_levels, 3);
        assert_eq!(back.preferred_batch_sizes, vec![4, 8]);
        assert_eq!(back.max_queue_delay_us, 500);
    }
}
