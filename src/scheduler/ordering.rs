//! Response ordering across parallel runners.
//!
//! Completion ids are reserved under the scheduler mutex at dispatch, so
//! they follow the order batches left the queue, which is
//! priority-then-FIFO request order. Emitting strictly in completion-id
//! order therefore restores arrival order to responses even when a later
//! batch finishes first on another runner.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::core::request::{InferenceResponse, ResponseSender};
use crate::error::Result;

/// One request's finished outcome awaiting emission.
pub type ReadyResponse = (ResponseSender, Result<InferenceResponse>);

#[derive(Debug, Default)]
struct OrdererState {
    next_to_emit: u64,
    ready: BTreeMap<u64, Vec<ReadyResponse>>,
}

/// Ensures responses leave in enqueue order across parallel runners.
#[derive(Debug, Default)]
pub struct ResponseOrderer {
    state: Mutex<OrdererState>,
}

impl ResponseOrderer {
    /// Create an orderer expecting completion ids from zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand over a completed batch and flush everything that became
    /// emittable: sinks fire for the head id as long as its slot is
    /// filled, in request order within each batch.
    pub fn submit(&self, completion_id: u64, responses: Vec<ReadyResponse>) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.ready.insert(completion_id, responses);

        while let Some(batch) = {
            let next = state.next_to_emit;
            state.ready.remove(&next)
        } {
            for (sink, result) in batch {
                sink.send(result);
            }
            state.next_to_emit += 1;
        }
    }

    /// Number of batches parked waiting for an earlier completion.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .ready
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use crate::error::Error;

    fn tagged_sender(
        tag: u64,
        tx: mpsc::Sender<u64>,
    ) -> ResponseSender {
        ResponseSender::new(move |_| {
            let _ = tx.send(tag);
        })
    }

    #[test]
    fn test_in_order_submission_flushes_immediately() {
        let orderer = ResponseOrderer::new();
        let (tx, rx) = mpsc::channel();

        orderer.submit(0, vec![(tagged_sender(0, tx.clone()), Err(Error::Timeout))]);
        orderer.submit(1, vec![(tagged_sender(1, tx), Err(Error::Timeout))]);

        assert_eq!(rx.try_recv().unwrap(), 0);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(orderer.pending(), 0);
    }

    #[test]
    fn test_out_of_order_submission_parks_until_head_arrives() {
        let orderer = ResponseOrderer::new();
        let (tx, rx) = mpsc::channel();

        orderer.submit(1, vec![(tagged_sender(1, tx.clone()), Err(Error::Timeout))]);
        assert!(rx.try_recv().is_err());
        assert_eq!(orderer.pending(), 1);

        orderer.submit(0, vec![(tagged_sender(0, tx), Err(Error::Timeout))]);
        assert_eq!(rx.try_recv().unwrap(), 0);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(orderer.pending(), 0);
    }

    #[test]
    fn test_requests_within_batch_keep_order() {
        let orderer = ResponseOrderer::new();
        let (tx, rx) = mpsc::channel();

        orderer.submit(
            0,
            vec![
                (tagged_sender(10, tx.clone()), Err(Error::Timeout)),
                (tagged_sender(11, tx), Err(Error::Timeout)),
            ],
        );

        assert_eq!(rx.try_recv().unwrap(), 10);
        assert_eq!(rx.try_recv().unwrap(), 11);
    }
}
