// Per-ordering-key FIFO with at most one batch in flight per key.
use hashbrown::HashMap;
use std::collections::VecDeque;

use super::batch::{OutstandingPublish, PendingBatch};
use crate::error::PublishError;

#[derive(Default)]
struct KeyQueue {
    in_flight: bool,
    queued: VecDeque<PendingBatch>,
    failed: Option<PublishError>,
}

impl KeyQueue {
    fn is_idle(&self) -> bool {
        !self.in_flight && self.queued.is_empty() && self.failed.is_none()
    }
}

/// Owned by the scheduler task; every method is synchronous and never blocks.
#[derive(Default)]
pub(crate) struct OrderingSequencer {
    keys: HashMap<String, KeyQueue>,
}

impl OrderingSequencer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fails fast when `key` is paused after an earlier permanent failure.
    pub(crate) fn check(&self, key: &str) -> Result<(), PublishError> {
        match self.keys.get(key).and_then(|queue| queue.failed.as_ref()) {
            Some(cause) => Err(paused(key, cause)),
            None => Ok(()),
        }
    }

    /// Returns the batch when it may be transmitted now; otherwise queues it
    /// behind the key's in-flight batch, or fails it if the key is paused.
    pub(crate) fn enqueue(&mut self, batch: PendingBatch) -> Option<PendingBatch> {
        let key = batch.ordering_key.clone();
        let queue = self.keys.entry(key.clone()).or_default();
        if let Some(cause) = &queue.failed {
            let err = paused(&key, cause);
            batch.fail(err);
            return None;
        }
        if queue.in_flight {
            queue.queued.push_back(batch);
            return None;
        }
        queue.in_flight = true;
        Some(batch)
    }

    /// Records the outcome of `key`'s in-flight batch and returns the next batch
    /// to transmit, if any.
    pub(crate) fn complete(
        &mut self,
        key: &str,
        outcome: Result<(), PublishError>,
    ) -> Option<PendingBatch> {
        let queue = self.keys.get_mut(key)?;
        queue.in_flight = false;
        let next = match outcome {
            Ok(()) => queue.queued.pop_front(),
            Err(cause) => {
                tracing::warn!(ordering_key = key, error = %cause, "ordering key paused");
                metrics::counter!("courier_publish_ordering_key_paused_total").increment(1);
                for batch in queue.queued.drain(..) {
                    batch.fail(paused(key, &cause));
                }
                queue.failed = Some(cause);
                None
            }
        };
        if next.is_some() {
            queue.in_flight = true;
        } else if queue.is_idle() {
            self.keys.remove(key);
        }
        next
    }

    /// Clears a paused key so new messages can be published with it.
    pub(crate) fn resume(&mut self, key: &str) {
        let Some(queue) = self.keys.get_mut(key) else {
            return;
        };
        if queue.failed.take().is_some() {
            tracing::info!(ordering_key = key, "ordering key resumed");
        }
        if queue.is_idle() {
            self.keys.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_paused(&self, key: &str) -> bool {
        self.keys.get(key).is_some_and(|queue| queue.failed.is_some())
    }

    /// Takes the message with `id` out of a queued batch. Batches already in
    /// flight are out of reach.
    pub(crate) fn remove(&mut self, id: u64) -> Option<OutstandingPublish> {
        for queue in self.keys.values_mut() {
            let Some(index) = queue
                .queued
                .iter()
                .position(|batch| batch.messages.iter().any(|publish| publish.id == id))
            else {
                continue;
            };
            let batch = &mut queue.queued[index];
            let publish = batch.remove(id);
            if batch.is_empty() {
                queue.queued.remove(index);
            }
            return publish;
        }
        None
    }

    /// True when nothing is queued or in flight. Paused keys do not count as busy.
    pub(crate) fn is_drained(&self) -> bool {
        self.keys
            .values()
            .all(|queue| !queue.in_flight && queue.queued.is_empty())
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.keys.len()
    }
}

fn paused(key: &str, cause: &PublishError) -> PublishError {
    PublishError::OrderingKeyPaused {
        key: key.to_string(),
        cause: Box::new(cause.clone()),
    }
}
