// Single-owner task that seals batches, sequences ordered keys and sends with retry.
use courier_common::names::TopicName;
use courier_transport::PublisherTransport;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::batch::{BatchAccumulator, OutstandingPublish, PendingBatch};
use super::ordering::OrderingSequencer;
use crate::config::{BatchingSettings, RetrySettings};
use crate::error::PublishError;
use crate::retry::{RetryError, call_with_retry};

pub(crate) enum SchedulerCommand {
    Publish(OutstandingPublish),
    Flush { response: oneshot::Sender<()> },
    ResumePublish { key: String },
    /// The caller's cancellation fired for the publish with this id.
    Cancel { id: u64 },
    Shutdown { response: oneshot::Sender<()> },
}

pub(crate) struct SchedulerContext {
    pub(crate) topic: TopicName,
    pub(crate) transport: Arc<dyn PublisherTransport>,
    pub(crate) batching: BatchingSettings,
    pub(crate) retry: RetrySettings,
}

struct BatchOutcome {
    ordering_key: String,
    result: Result<(), PublishError>,
}

struct Scheduler {
    topic: Arc<TopicName>,
    transport: Arc<dyn PublisherTransport>,
    retry: Arc<RetrySettings>,
    accumulator: BatchAccumulator,
    sequencer: OrderingSequencer,
    in_flight: FuturesUnordered<BoxFuture<'static, BatchOutcome>>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    shutting_down: bool,
}

pub(crate) async fn run_publish_scheduler(
    context: SchedulerContext,
    mut rx: mpsc::Receiver<SchedulerCommand>,
) {
    let mut scheduler = Scheduler {
        topic: Arc::new(context.topic),
        transport: context.transport,
        retry: Arc::new(context.retry),
        accumulator: BatchAccumulator::new(context.batching),
        sequencer: OrderingSequencer::new(),
        in_flight: FuturesUnordered::new(),
        shutdown_waiters: Vec::new(),
        shutting_down: false,
    };
    let mut commands_open = true;
    loop {
        let next_deadline = scheduler.accumulator.next_deadline();
        tokio::select! {
            command = rx.recv(), if commands_open => match command {
                Some(command) => scheduler.handle(command),
                None => {
                    // Every handle is gone; flush what is left and finish.
                    commands_open = false;
                    scheduler.begin_shutdown();
                }
            },
            Some(outcome) = scheduler.in_flight.next(), if !scheduler.in_flight.is_empty() => {
                scheduler.on_batch_done(outcome);
            }
            _ = sleep_until_deadline(next_deadline), if next_deadline.is_some() => {
                let expired = scheduler.accumulator.take_expired(Instant::now());
                for batch in expired {
                    scheduler.dispatch(batch);
                }
            }
            else => break,
        }
        if scheduler.shutting_down && scheduler.is_idle() {
            for waiter in scheduler.shutdown_waiters.drain(..) {
                let _ = waiter.send(());
            }
            if !commands_open {
                break;
            }
        }
    }
    tracing::debug!(topic = %scheduler.topic, "publish scheduler stopped");
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

impl Scheduler {
    fn handle(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Publish(publish) => self.add(publish),
            SchedulerCommand::Flush { response } => {
                for batch in self.accumulator.drain_all() {
                    self.dispatch(batch);
                }
                let _ = response.send(());
            }
            SchedulerCommand::ResumePublish { key } => self.sequencer.resume(&key),
            SchedulerCommand::Cancel { id } => self.cancel(id),
            SchedulerCommand::Shutdown { response } => {
                self.shutdown_waiters.push(response);
                self.begin_shutdown();
            }
        }
    }

    fn add(&mut self, publish: OutstandingPublish) {
        if self.shutting_down {
            publish.resolve(Err(PublishError::Shutdown));
            return;
        }
        let key = publish.ordering_key().to_string();
        if !key.is_empty()
            && let Err(err) = self.sequencer.check(&key)
        {
            publish.resolve(Err(err));
            return;
        }
        for batch in self.accumulator.add(publish, Instant::now()) {
            self.dispatch(batch);
        }
    }

    /// Resolves a cancelled publish that has not been transmitted yet. One that
    /// already resolved or is in flight is left alone.
    fn cancel(&mut self, id: u64) {
        let Some(publish) = self
            .accumulator
            .remove(id)
            .or_else(|| self.sequencer.remove(id))
        else {
            return;
        };
        tracing::trace!(ordering_key = publish.ordering_key(), "queued publish cancelled");
        publish.resolve(Err(PublishError::Cancelled));
    }

    fn begin_shutdown(&mut self) {
        if !self.shutting_down {
            tracing::debug!(topic = %self.topic, "publisher draining");
        }
        self.shutting_down = true;
        for batch in self.accumulator.drain_all() {
            self.dispatch(batch);
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.accumulator.is_empty() && self.sequencer.is_drained()
    }

    fn dispatch(&mut self, batch: PendingBatch) {
        if batch.ordering_key.is_empty() {
            self.start(batch);
        } else if let Some(batch) = self.sequencer.enqueue(batch) {
            self.start(batch);
        }
    }

    fn start(&mut self, mut batch: PendingBatch) {
        batch.remove_cancelled();
        let ordering_key = batch.ordering_key.clone();
        let transport = self.transport.clone();
        let topic = self.topic.clone();
        let retry = self.retry.clone();
        self.in_flight.push(
            async move {
                let result = send_batch(transport.as_ref(), &topic, &retry, batch).await;
                BatchOutcome {
                    ordering_key,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn on_batch_done(&mut self, outcome: BatchOutcome) {
        let BatchOutcome {
            ordering_key,
            result,
        } = outcome;
        if ordering_key.is_empty() {
            return;
        }
        let failure = result.as_ref().err().cloned();
        if let Some(next) = self.sequencer.complete(&ordering_key, result) {
            self.start(next);
        }
        // Messages still accumulating for a poisoned key must not be sent.
        if let Some(cause) = failure
            && let Some(open) = self.accumulator.take(&ordering_key)
        {
            open.fail(PublishError::OrderingKeyPaused {
                key: ordering_key,
                cause: Box::new(cause),
            });
        }
    }
}

/// Sends one batch, retrying transient failures, and resolves every message in it.
async fn send_batch(
    transport: &dyn PublisherTransport,
    topic: &TopicName,
    retry: &RetrySettings,
    batch: PendingBatch,
) -> Result<(), PublishError> {
    if batch.is_empty() {
        return Ok(());
    }
    let payload = batch.payload();
    let count = batch.len();
    let started = StdInstant::now();
    metrics::counter!("courier_publish_batches_total").increment(1);
    let result = call_with_retry(retry, "publish", move || {
        transport.publish(topic, payload.clone())
    })
    .await;
    metrics::histogram!("courier_publish_batch_latency_seconds")
        .record(started.elapsed().as_secs_f64());
    match result {
        Ok(ids) => batch.complete(ids),
        Err(err) => {
            let err = match err {
                RetryError::Permanent(status) => PublishError::Rpc(status),
                RetryError::DeadlineExceeded { budget, last } => {
                    tracing::debug!(error = %last, "publish gave up after retry budget");
                    PublishError::DeadlineExceeded(budget)
                }
            };
            tracing::debug!(
                topic = %topic,
                ordering_key = %batch.ordering_key,
                messages = count,
                error = %err,
                "publish batch failed"
            );
            batch.fail(err.clone());
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::batch::tests::outstanding;
    use super::*;
    use courier_common::{Status, StatusCode};
    use courier_transport::in_memory::InMemoryPublisher;
    use std::time::Duration;

    type Receivers = Vec<oneshot::Receiver<Result<String, PublishError>>>;

    fn batch_of(key: &str, data: &[&str]) -> (PendingBatch, Receivers) {
        let mut messages = Vec::new();
        let mut receivers = Vec::new();
        for item in data {
            let (publish, rx) = outstanding(item, key);
            messages.push(publish);
            receivers.push(rx);
        }
        let bytes = messages.iter().map(|publish| publish.size).sum();
        (
            PendingBatch {
                ordering_key: key.to_string(),
                messages,
                bytes,
            },
            receivers,
        )
    }

    fn topic() -> TopicName {
        TopicName::new("p", "t").expect("topic")
    }

    #[tokio::test(start_paused = true)]
    async fn send_batch_resolves_ids_in_order() {
        let fake = InMemoryPublisher::new();
        let (batch, receivers) = batch_of("", &["a", "b", "c"]);
        send_batch(&fake, &topic(), &RetrySettings::publish_defaults(), batch)
            .await
            .expect("sent");
        let mut ids = Vec::new();
        for rx in receivers {
            ids.push(rx.await.expect("resolved").expect("id"));
        }
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_batch_retries_transient_then_succeeds() {
        let fake = InMemoryPublisher::new();
        fake.fail_next(Status::new(StatusCode::Unavailable, "blip"));
        let (batch, receivers) = batch_of("", &["a"]);
        send_batch(&fake, &topic(), &RetrySettings::publish_defaults(), batch)
            .await
            .expect("sent after retry");
        assert_eq!(fake.calls().len(), 2);
        for rx in receivers {
            rx.await.expect("resolved").expect("id");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_batch_does_not_retry_permanent_errors() {
        let fake = InMemoryPublisher::new();
        fake.fail_next(Status::new(StatusCode::InvalidArgument, "bad"));
        let (batch, receivers) = batch_of("", &["a", "b"]);
        let err = send_batch(&fake, &topic(), &RetrySettings::publish_defaults(), batch)
            .await
            .expect_err("permanent");
        assert!(matches!(err, PublishError::Rpc(ref status) if status.code == StatusCode::InvalidArgument));
        assert_eq!(fake.calls().len(), 1);
        for rx in receivers {
            assert_eq!(rx.await.expect("resolved"), Err(err.clone()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_batch_fails_with_deadline_exceeded_after_budget() {
        let fake = InMemoryPublisher::new();
        for _ in 0..50 {
            fake.fail_next(Status::new(StatusCode::Unavailable, "down"));
        }
        let retry = RetrySettings {
            total_timeout: Duration::from_secs(1),
            ..RetrySettings::publish_defaults()
        };
        let (batch, receivers) = batch_of("", &["a"]);
        let err = send_batch(&fake, &topic(), &retry, batch)
            .await
            .expect_err("deadline");
        assert_eq!(err, PublishError::DeadlineExceeded(Duration::from_secs(1)));
        for rx in receivers {
            assert_eq!(rx.await.expect("resolved"), Err(err.clone()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_is_not_sent() {
        let fake = InMemoryPublisher::new();
        let (batch, _) = batch_of("", &[]);
        send_batch(&fake, &topic(), &RetrySettings::publish_defaults(), batch)
            .await
            .expect("noop");
        assert!(fake.calls().is_empty());
    }
}
