//! Multi-level priority queue with per-level policies.
//!
//! Requests at the same priority form a FIFO; levels are strictly
//! ordered (level 1 first). Each level carries its own capacity,
//! timeout, and overflow rules. A request whose timeout fires under
//! `TimeoutAction::Delay` moves to a per-level delayed FIFO that is only
//! visited once every live request at any priority has been scheduled.
//!
//! All operations here require the scheduler mutex held by the caller;
//! the type itself is plain data with no interior locking.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::warn;

use crate::config::{BatcherConfig, OverflowAction, QueuePolicy, TimeoutAction};
use crate::core::request::InferenceRequest;
use crate::error::Error;

/// Outcome of pushing a request into the queue set.
#[derive(Debug)]
pub enum PushOutcome {
    /// The request was queued. Any entries evicted to make room are
    /// returned so the caller can deliver their timeout errors.
    Accepted {
        /// Oldest entries evicted under `OverflowAction::DropOldest`.
        evicted: Vec<InferenceRequest>,
    },
    /// The level was full and the policy rejects new arrivals.
    Rejected {
        /// The request, returned so the caller can deliver the error.
        request: InferenceRequest,
        /// The queue-full error to deliver.
        error: Error,
    },
}

#[derive(Debug)]
struct QueueLevel {
    level: u32,
    policy: QueuePolicy,
    live: VecDeque<InferenceRequest>,
    delayed: VecDeque<InferenceRequest>,
}

impl QueueLevel {
    fn new(level: u32, policy: QueuePolicy) -> Self {
        Self {
            level,
            policy,
            live: VecDeque::new(),
            delayed: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.live.len() + self.delayed.len()
    }

    // Effective deadline: level default unless the request's own deadline
    // may shorten it.
    fn effective_deadline(&self, request: &InferenceRequest, now: Instant) -> Option<Instant> {
        let enqueued = request.timing().enqueued().unwrap_or(now);
        let default = self.policy.default_timeout().map(|t| enqueued + t);
        if !self.policy.allow_timeout_override {
            return default;
        }
        match (default, request.deadline()) {
            (Some(d), Some(own)) => Some(d.min(own)),
            (Some(d), None) => Some(d),
            (None, own) => own,
        }
    }
}

/// Ordered set of priority levels (1 = highest). With zero configured
/// levels a single unlabelled level is used and priorities are ignored.
#[derive(Debug)]
pub struct PriorityQueueSet {
    levels: Vec<QueueLevel>,
    priority_levels: u32,
    default_level_index: usize,
}

impl PriorityQueueSet {
    /// Build the level set from the scheduler configuration.
    pub fn new(config: &BatcherConfig) -> Self {
        let priority_levels = config.priority_levels;
        let levels = if priority_levels == 0 {
            vec![QueueLevel::new(0, config.default_queue_policy.clone())]
        } else {
            (1..=priority_levels)
                .map(|level| QueueLevel::new(level, config.policy_for_level(level).clone()))
                .collect()
        };
        let default_level_index = if priority_levels == 0 {
            0
        } else {
            config.resolved_default_priority() as usize - 1
        };
        Self {
            levels,
            priority_levels,
            default_level_index,
        }
    }

    fn level_index(&self, priority: u32) -> usize {
        if self.priority_levels == 0 {
            return 0;
        }
        if priority == 0 {
            return self.default_level_index;
        }
        (priority.clamp(1, self.priority_levels) - 1) as usize
    }

    /// Total pending count across every level.
    pub fn len(&self) -> usize {
        self.levels.iter().map(QueueLevel::len).sum()
    }

    /// Whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|l| l.live.is_empty() && l.delayed.is_empty())
    }

    /// Oldest live request at the given level index (0-based).
    pub fn head_of_level(&self, index: usize) -> Option<&InferenceRequest> {
        self.levels.get(index).and_then(|l| l.live.front())
    }

    /// Place a request in the level matching its priority.
    ///
    /// The effective deadline is computed here from the level policy and
    /// stamped on the request. Capacity overflow follows the level's
    /// `OverflowAction`.
    pub fn push(&mut self, mut request: InferenceRequest, now: Instant) -> PushOutcome {
        let index = self.level_index(request.priority());
        let level = &mut self.levels[index];

        let mut evicted = Vec::new();
        if level.policy.max_queue_size > 0 && level.len() >= level.policy.max_queue_size {
            match level.policy.overflow_action {
                OverflowAction::RejectNew => {
                    warn!(
                        level = level.level,
                        capacity = level.policy.max_queue_size,
                        "queue full, rejecting request"
                    );
                    return PushOutcome::Rejected {
                        request,
                        error: Error::QueueFull {
                            level: level.level,
                            capacity: level.policy.max_queue_size,
                        },
                    };
                }
                OverflowAction::DropOldest => {
                    // Delayed entries are the stalest work; evict them first.
                    let victim = level.delayed.pop_front().or_else(|| level.live.pop_front());
                    if let Some(victim) = victim {
                        warn!(
                            level = level.level,
                            request_id = victim.id(),
                            "queue full, evicting oldest request"
                        );
                        evicted.push(victim);
                    }
                }
            }
        }

        let deadline = level.effective_deadline(&request, now);
        request.set_effective_deadline(deadline);
        level.live.push_back(request);
        PushOutcome::Accepted { evicted }
    }

    /// Iterate pending requests in priority-then-FIFO order without
    /// removing them: live entries high-to-low priority first, then
    /// delayed entries high-to-low priority.
    ///
    /// Each entry is tagged with its scheduling segment (one per level,
    /// with delayed entries forming separate trailing segments); a batch
    /// never spans segments, so work at different priorities never runs
    /// together.
    pub fn cursor(&self) -> impl Iterator<Item = (usize, &InferenceRequest)> {
        let level_count = self.levels.len();
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(index, l)| l.live.iter().map(move |r| (index, r)))
            .chain(
                self.levels
                    .iter()
                    .enumerate()
                    .flat_map(move |(index, l)| {
                        l.delayed.iter().map(move |r| (level_count + index, r))
                    }),
            )
    }

    /// Remove the first `n` requests in cursor order.
    pub fn pop_front(&mut self, n: usize) -> Vec<InferenceRequest> {
        let mut out = Vec::with_capacity(n);
        for level in &mut self.levels {
            while out.len() < n {
                match level.live.pop_front() {
                    Some(request) => out.push(request),
                    None => break,
                }
            }
        }
        for level in &mut self.levels {
            while out.len() < n {
                match level.delayed.pop_front() {
                    Some(request) => out.push(request),
                    None => break,
                }
            }
        }
        out
    }

    /// Remove and return every pending request, for shutdown drains.
    pub fn drain_all(&mut self) -> Vec<InferenceRequest> {
        self.pop_front(self.len())
    }

    /// Walk each level from the head and act on expired requests.
    ///
    /// Under `TimeoutAction::Reject` the request is removed and returned
    /// for a timeout response; under `Delay` it moves to the delayed
    /// FIFO. The head scan stops at the first live entry per level; when
    /// `allow_timeout_override` makes deadlines non-monotone the whole
    /// level is scanned.
    pub fn expire_timed_out(&mut self, now: Instant) -> Vec<InferenceRequest> {
        let mut expired = Vec::new();
        for level in &mut self.levels {
            let full_scan = level.policy.allow_timeout_override;
            let mut index = 0;
            while index < level.live.len() {
                let is_expired = level.live[index].is_expired(now);
                if !is_expired {
                    if full_scan {
                        index += 1;
                        continue;
                    }
                    break;
                }
                if let Some(request) = level.live.remove(index) {
                    match level.policy.timeout_action {
                        TimeoutAction::Reject => expired.push(request),
                        TimeoutAction::Delay => level.delayed.push_back(request),
                    }
                }
            }
        }
        expired
    }

    /// Earliest effective deadline among live entries, used to bound how
    /// long a runner sleeps between sweeps.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.levels
            .iter()
            .flat_map(|l| l.live.iter())
            .filter_map(|r| r.effective_deadline())
            .min()
    }
}
