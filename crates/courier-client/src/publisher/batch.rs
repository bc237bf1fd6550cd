// Size, count and delay bounded batching of outgoing messages.
use courier_common::PubsubMessage;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::BatchingSettings;
use crate::error::PublishError;
use crate::flow_control::FlowReservation;

pub(crate) type PublishResponder = oneshot::Sender<Result<String, PublishError>>;

static NEXT_PUBLISH_ID: AtomicU64 = AtomicU64::new(1);

/// One `publish` call waiting for its message id.
pub(crate) struct OutstandingPublish {
    pub(crate) id: u64,
    pub(crate) message: PubsubMessage,
    pub(crate) size: u64,
    pub(crate) reservation: Option<FlowReservation>,
    pub(crate) responder: PublishResponder,
    pub(crate) cancel: Option<CancellationToken>,
    settled: CancellationToken,
    _settled_guard: DropGuard,
}

/// What a cancellation watcher needs after the publish moves to the scheduler.
pub(crate) struct CancelWatch {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
    /// Fires once the publish is resolved or dropped.
    pub(crate) settled: CancellationToken,
}

impl OutstandingPublish {
    pub(crate) fn new(
        message: PubsubMessage,
        reservation: Option<FlowReservation>,
        responder: PublishResponder,
        cancel: Option<CancellationToken>,
    ) -> Self {
        let size = message.size();
        let settled = CancellationToken::new();
        Self {
            id: NEXT_PUBLISH_ID.fetch_add(1, Ordering::Relaxed),
            message,
            size,
            reservation,
            responder,
            cancel,
            _settled_guard: settled.clone().drop_guard(),
            settled,
        }
    }

    pub(crate) fn cancel_watch(&self) -> Option<CancelWatch> {
        let cancel = self.cancel.clone()?;
        Some(CancelWatch {
            id: self.id,
            cancel,
            settled: self.settled.clone(),
        })
    }

    pub(crate) fn ordering_key(&self) -> &str {
        &self.message.ordering_key
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Releases flow-control budget, then resolves the caller's handle.
    pub(crate) fn resolve(mut self, result: Result<String, PublishError>) {
        if let Some(reservation) = self.reservation.take() {
            let _ = reservation.release();
        }
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!("courier_publish_messages_total", "result" => outcome).increment(1);
        let _ = self.responder.send(result);
    }
}

/// A sealed batch on its way to the transport.
pub(crate) struct PendingBatch {
    pub(crate) ordering_key: String,
    pub(crate) messages: Vec<OutstandingPublish>,
    pub(crate) bytes: u64,
}

impl PendingBatch {
    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Resolves callers whose cancellation fired while the batch was queued.
    pub(crate) fn remove_cancelled(&mut self) {
        if !self.messages.iter().any(OutstandingPublish::is_cancelled) {
            return;
        }
        let (cancelled, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.messages)
            .into_iter()
            .partition(OutstandingPublish::is_cancelled);
        self.messages = kept;
        self.bytes = self.messages.iter().map(|publish| publish.size).sum();
        for publish in cancelled {
            publish.resolve(Err(PublishError::Cancelled));
        }
    }

    /// Takes the message with `id` out of the batch, if it is here.
    pub(crate) fn remove(&mut self, id: u64) -> Option<OutstandingPublish> {
        let position = self.messages.iter().position(|publish| publish.id == id)?;
        let publish = self.messages.remove(position);
        self.bytes -= publish.size;
        Some(publish)
    }

    pub(crate) fn payload(&self) -> Vec<PubsubMessage> {
        self.messages
            .iter()
            .map(|publish| publish.message.clone())
            .collect()
    }

    /// Hands the Nth id to the Nth message. A short or long reply fails everything.
    pub(crate) fn complete(self, ids: Vec<String>) -> Result<(), PublishError> {
        if ids.len() != self.messages.len() {
            let err = PublishError::ResponseMismatch {
                expected: self.messages.len(),
                actual: ids.len(),
            };
            self.fail(err.clone());
            return Err(err);
        }
        for (publish, id) in self.messages.into_iter().zip(ids) {
            publish.resolve(Ok(id));
        }
        Ok(())
    }

    pub(crate) fn fail(self, err: PublishError) {
        for publish in self.messages {
            publish.resolve(Err(err.clone()));
        }
    }
}

struct OpenBatch {
    messages: Vec<OutstandingPublish>,
    bytes: u64,
    deadline: Instant,
}

/// Open batches keyed by ordering key ("" for unordered traffic).
pub(crate) struct BatchAccumulator {
    settings: BatchingSettings,
    open: HashMap<String, OpenBatch>,
}

impl BatchAccumulator {
    pub(crate) fn new(settings: BatchingSettings) -> Self {
        Self {
            settings,
            open: HashMap::new(),
        }
    }

    /// Appends `publish`, returning any batches that became ready. A batch that
    /// cannot take the message is sealed first; a message larger than
    /// `max_bytes` travels alone.
    pub(crate) fn add(&mut self, publish: OutstandingPublish, now: Instant) -> Vec<PendingBatch> {
        let key = publish.ordering_key().to_string();
        let mut ready = Vec::new();
        let max_bytes = self.settings.max_bytes;
        let overflows = self.open.get(&key).is_some_and(|open| {
            !open.messages.is_empty() && open.bytes + publish.size > max_bytes
        });
        if overflows && let Some(batch) = self.seal(&key) {
            ready.push(batch);
        }
        let max_delay = self.settings.max_delay;
        let open = self.open.entry(key.clone()).or_insert_with(|| OpenBatch {
            messages: Vec::new(),
            bytes: 0,
            deadline: now + max_delay,
        });
        open.bytes += publish.size;
        open.messages.push(publish);
        let full = open.messages.len() >= self.settings.max_elements || open.bytes >= max_bytes;
        if full && let Some(batch) = self.seal(&key) {
            ready.push(batch);
        }
        ready
    }

    /// Seals every batch whose delay threshold has passed.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<PendingBatch> {
        let expired: Vec<String> = self
            .open
            .iter()
            .filter(|(_, open)| open.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        expired.iter().filter_map(|key| self.seal(key)).collect()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.open.values().map(|open| open.deadline).min()
    }

    pub(crate) fn take(&mut self, key: &str) -> Option<PendingBatch> {
        self.seal(key)
    }

    pub(crate) fn drain_all(&mut self) -> Vec<PendingBatch> {
        let keys: Vec<String> = self.open.keys().cloned().collect();
        keys.iter().filter_map(|key| self.seal(key)).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Takes the message with `id` out of its open batch. An emptied batch is
    /// discarded along with its delay deadline.
    pub(crate) fn remove(&mut self, id: u64) -> Option<OutstandingPublish> {
        let (key, position) = self.open.iter().find_map(|(key, open)| {
            open.messages
                .iter()
                .position(|publish| publish.id == id)
                .map(|position| (key.clone(), position))
        })?;
        let open = self.open.get_mut(&key)?;
        let publish = open.messages.remove(position);
        open.bytes -= publish.size;
        if open.messages.is_empty() {
            self.open.remove(&key);
        }
        Some(publish)
    }

    fn seal(&mut self, key: &str) -> Option<PendingBatch> {
        let open = self.open.remove(key)?;
        tracing::trace!(
            ordering_key = key,
            messages = open.messages.len(),
            bytes = open.bytes,
            "batch sealed"
        );
        Some(PendingBatch {
            ordering_key: key.to_string(),
            messages: open.messages,
            bytes: open.bytes,
        })
    }
}
