// Publisher handle: flow control in front, batching scheduler behind.
//! A [`Publisher`] owns one scheduler task per topic. `publish` reserves
//! flow-control budget on the caller's task, then hands the message to the
//! scheduler over a bounded queue and returns a [`PublishHandle`] that resolves
//! to the broker-assigned message id.
use anyhow::{Context, Result};
use courier_common::PubsubMessage;
use courier_common::names::TopicName;
use courier_transport::PublisherTransport;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context as TaskContext, Poll};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::PublisherConfig;
use crate::error::PublishError;
use crate::flow_control::{FlowController, FlowUsage};

mod batch;
mod ordering;
mod scheduler;

use batch::{CancelWatch, OutstandingPublish};
use scheduler::{SchedulerCommand, SchedulerContext, run_publish_scheduler};

pub(crate) const SCHEDULER_QUEUE_DEPTH: usize = 1024;

/// Resolves to the message id, or to the terminal error for the message.
///
/// Cancelled publishes resolve to [`PublishError::Cancelled`].
pub struct PublishHandle {
    state: HandleState,
}

enum HandleState {
    Ready(Option<Result<String, PublishError>>),
    Pending(oneshot::Receiver<Result<String, PublishError>>),
}

impl PublishHandle {
    fn failed(err: PublishError) -> Self {
        Self {
            state: HandleState::Ready(Some(Err(err))),
        }
    }

    fn pending(rx: oneshot::Receiver<Result<String, PublishError>>) -> Self {
        Self {
            state: HandleState::Pending(rx),
        }
    }
}

impl Future for PublishHandle {
    type Output = Result<String, PublishError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            HandleState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(PublishError::Cancelled)))
            }
            HandleState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(PublishError::Cancelled))),
        }
    }
}

#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    topic: TopicName,
    runtime: Handle,
    tx: mpsc::Sender<SchedulerCommand>,
    flow: Arc<FlowController>,
    ordering_enabled: bool,
    shutdown: AtomicBool,
}

impl Publisher {
    /// Starts a publisher on the current tokio runtime.
    pub fn new(
        topic: TopicName,
        transport: Arc<dyn PublisherTransport>,
        config: PublisherConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current().context("publisher requires a tokio runtime")?;
        Self::new_on(&runtime, topic, transport, config)
    }

    /// Starts a publisher whose scheduler runs on `runtime`.
    pub fn new_on(
        runtime: &Handle,
        topic: TopicName,
        transport: Arc<dyn PublisherTransport>,
        config: PublisherConfig,
    ) -> Result<Self> {
        config.validate().context("invalid publisher config")?;
        let (tx, rx) = mpsc::channel(SCHEDULER_QUEUE_DEPTH);
        runtime.spawn(run_publish_scheduler(
            SchedulerContext {
                topic: topic.clone(),
                transport,
                batching: config.batching,
                retry: config.retry,
            },
            rx,
        ));
        tracing::debug!(topic = %topic, ordering = config.enable_message_ordering, "publisher started");
        Ok(Self {
            inner: Arc::new(PublisherInner {
                topic,
                runtime: runtime.clone(),
                tx,
                flow: FlowController::new(config.flow_control, "publisher"),
                ordering_enabled: config.enable_message_ordering,
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    pub fn topic(&self) -> &TopicName {
        &self.inner.topic
    }

    /// Outstanding (unresolved) publish usage counted by flow control.
    pub fn outstanding(&self) -> FlowUsage {
        self.inner.flow.usage()
    }

    /// Queues `message` for publication. May suspend while flow control blocks.
    pub async fn publish(&self, message: PubsubMessage) -> PublishHandle {
        self.publish_inner(message, None).await
    }

    /// Like [`Publisher::publish`]; `cancel` aborts the flow-control wait, and a
    /// message still queued when `cancel` fires is never transmitted.
    pub async fn publish_with_cancellation(
        &self,
        message: PubsubMessage,
        cancel: CancellationToken,
    ) -> PublishHandle {
        self.publish_inner(message, Some(cancel)).await
    }

    async fn publish_inner(
        &self,
        message: PubsubMessage,
        cancel: Option<CancellationToken>,
    ) -> PublishHandle {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::Acquire) {
            return PublishHandle::failed(PublishError::Shutdown);
        }
        if !message.ordering_key.is_empty() && !inner.ordering_enabled {
            return PublishHandle::failed(PublishError::OrderingDisabled);
        }
        let size = message.size();
        let reservation = match &cancel {
            Some(cancel) => inner.flow.reserve_with_cancellation(1, size, cancel).await,
            None => inner.flow.reserve(1, size).await,
        };
        let reservation = match reservation {
            Ok(reservation) => reservation,
            Err(err) => return PublishHandle::failed(err.into()),
        };
        let (responder, rx) = oneshot::channel();
        let publish = OutstandingPublish::new(message, Some(reservation), responder, cancel);
        let watch = publish.cancel_watch();
        if inner.tx.send(SchedulerCommand::Publish(publish)).await.is_err() {
            // The rejected command is dropped here, which returns its budget.
            return PublishHandle::failed(PublishError::Shutdown);
        }
        if let Some(watch) = watch {
            inner.runtime.spawn(forward_cancel(watch, inner.tx.downgrade()));
        }
        PublishHandle::pending(rx)
    }

    /// Clears the paused state of `key` after a permanent publish failure.
    pub async fn resume_publish(&self, key: impl Into<String>) -> Result<()> {
        self.inner
            .tx
            .send(SchedulerCommand::ResumePublish { key: key.into() })
            .await
            .context("publisher scheduler stopped")
    }

    /// Seals and sends every open batch without waiting for the delay threshold.
    pub async fn flush(&self) -> Result<()> {
        let (response, done) = oneshot::channel();
        self.inner
            .tx
            .send(SchedulerCommand::Flush { response })
            .await
            .context("publisher scheduler stopped")?;
        done.await.context("publisher flush response dropped")
    }

    /// Sends everything outstanding and waits until every batch has terminated.
    /// Later publishes fail with [`PublishError::Shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.store(true, Ordering::Release);
        let (response, done) = oneshot::channel();
        if self
            .inner
            .tx
            .send(SchedulerCommand::Shutdown { response })
            .await
            .is_err()
        {
            return Ok(());
        }
        done.await.context("publisher shutdown response dropped")?;
        tracing::debug!(topic = %self.inner.topic, "publisher shut down");
        Ok(())
    }
}

/// Turns a fired cancellation into a scheduler command. Holds only a weak
/// sender so pending watchers never keep the scheduler alive.
async fn forward_cancel(watch: CancelWatch, tx: mpsc::WeakSender<SchedulerCommand>) {
    tokio::select! {
        biased;
        _ = watch.settled.cancelled() => {}
        _ = watch.cancel.cancelled() => {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(SchedulerCommand::Cancel { id: watch.id }).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchingSettings, FlowControlSettings, LimitBehavior};
    use crate::error::FlowControlError;
    use courier_common::{Status, StatusCode};
    use courier_transport::in_memory::{InMemoryPublisher, PublishEvent};
    use std::time::Duration;

    fn topic() -> TopicName {
        TopicName::new("proj", "events").expect("topic")
    }

    fn config(max_elements: usize, max_delay: Duration) -> PublisherConfig {
        PublisherConfig {
            batching: BatchingSettings {
                max_elements,
                max_bytes: 1024 * 1024,
                max_delay,
            },
            ..PublisherConfig::default()
        }
    }

    fn ordered(config: PublisherConfig) -> PublisherConfig {
        PublisherConfig {
            enable_message_ordering: true,
            ..config
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delay_threshold_flushes_partial_batch() {
        let fake = Arc::new(InMemoryPublisher::new());
        let publisher = Publisher::new(topic(), fake.clone(), config(100, Duration::from_millis(10)))
            .expect("publisher");
        let handle = publisher.publish(PubsubMessage::new("lonely")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(fake.calls().is_empty());
        let id = handle.await.expect("id");
        assert_eq!(id, "1");
        assert_eq!(fake.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ordering_key_requires_ordering_enabled() {
        let fake = Arc::new(InMemoryPublisher::new());
        let publisher =
            Publisher::new(topic(), fake, config(10, Duration::from_millis(1))).expect("publisher");
        let err = publisher
            .publish(PubsubMessage::new("x").with_ordering_key("k"))
            .await
            .await
            .expect_err("ordering disabled");
        assert_eq!(err, PublishError::OrderingDisabled);
        assert_eq!(publisher.outstanding(), FlowUsage::default());
    }

    #[tokio::test(start_paused = true)]
    async fn throw_exception_flow_control_rejects_publish() {
        let fake = Arc::new(InMemoryPublisher::new().with_latency(Duration::from_millis(50)));
        let mut cfg = config(1, Duration::from_millis(1));
        cfg.flow_control = FlowControlSettings {
            max_outstanding_elements: 1,
            max_outstanding_bytes: 0,
            limit_behavior: LimitBehavior::ThrowException,
        };
        let publisher = Publisher::new(topic(), fake, cfg).expect("publisher");
        let first = publisher.publish(PubsubMessage::new("a")).await;
        let err = publisher
            .publish(PubsubMessage::new("b"))
            .await
            .await
            .expect_err("capacity");
        assert_eq!(
            err,
            PublishError::FlowControl(FlowControlError::MaxOutstandingElements { limit: 1 })
        );
        first.await.expect("first id");
        assert_eq!(publisher.outstanding(), FlowUsage::default());
    }

    #[tokio::test(start_paused = true)]
    async fn poisoned_key_fails_fast_until_resumed() {
        let fake = Arc::new(InMemoryPublisher::new());
        let publisher = Publisher::new(
            topic(),
            fake.clone(),
            ordered(config(1, Duration::from_millis(1))),
        )
        .expect("publisher");
        fake.fail_ordering_key("A", Status::new(StatusCode::InvalidArgument, "bad"));
        let err = publisher
            .publish(PubsubMessage::new("a1").with_ordering_key("A"))
            .await
            .await
            .expect_err("first failure");
        let cause = PublishError::Rpc(Status::new(StatusCode::InvalidArgument, "bad"));
        assert_eq!(err, cause);
        let calls_after_failure = fake.calls().len();

        fake.clear_ordering_key("A");
        let err = publisher
            .publish(PubsubMessage::new("a2").with_ordering_key("A"))
            .await
            .await
            .expect_err("paused");
        assert_eq!(err.root_cause(), &cause);
        assert_eq!(fake.calls().len(), calls_after_failure);

        publisher
            .publish(PubsubMessage::new("b1").with_ordering_key("B"))
            .await
            .await
            .expect("other key unaffected");

        publisher.resume_publish("A").await.expect("resume");
        publisher
            .publish(PubsubMessage::new("a3").with_ordering_key("A"))
            .await
            .await
            .expect("resumed");
        assert_eq!(publisher.outstanding(), FlowUsage::default());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_ordered_batches_fail_with_in_flight_failure() {
        let fake = Arc::new(InMemoryPublisher::new().with_latency(Duration::from_millis(20)));
        fake.fail_next(Status::new(StatusCode::PermissionDenied, "denied"));
        let publisher = Publisher::new(
            topic(),
            fake.clone(),
            ordered(config(1, Duration::from_millis(1))),
        )
        .expect("publisher");
        let mut handles = Vec::new();
        for i in 0..3 {
            handles.push(
                publisher
                    .publish(PubsubMessage::new(format!("m{i}")).with_ordering_key("K"))
                    .await,
            );
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await);
        }
        assert!(matches!(results[0], Err(PublishError::Rpc(_))));
        for result in &results[1..] {
            assert!(matches!(result, Err(PublishError::OrderingKeyPaused { .. })));
        }
        assert_eq!(fake.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ordered_batches_never_overlap() {
        let fake = Arc::new(InMemoryPublisher::new().with_latency(Duration::from_millis(5)));
        let publisher = Publisher::new(
            topic(),
            fake.clone(),
            ordered(config(2, Duration::from_millis(1))),
        )
        .expect("publisher");
        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(
                publisher
                    .publish(PubsubMessage::new(format!("{i}")).with_ordering_key("K"))
                    .await,
            );
        }
        for handle in handles {
            handle.await.expect("id");
        }
        let events = fake.events();
        let mut open = None;
        for event in events {
            match event {
                PublishEvent::Started(call) => {
                    assert!(open.is_none(), "batch {call} overlapped {open:?}");
                    open = Some(call);
                }
                PublishEvent::Finished(call) => {
                    assert_eq!(open, Some(call));
                    open = None;
                }
            }
        }
        let sent: Vec<String> = fake
            .calls()
            .iter()
            .flat_map(|call| call.messages.iter())
            .map(|message| String::from_utf8_lossy(&message.data).into_owned())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(sent, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_and_rejects_later_publishes() {
        let fake = Arc::new(InMemoryPublisher::new());
        let publisher = Publisher::new(topic(), fake.clone(), config(100, Duration::from_secs(60)))
            .expect("publisher");
        let handle = publisher.publish(PubsubMessage::new("pending")).await;
        publisher.shutdown().await.expect("shutdown");
        assert_eq!(fake.calls().len(), 1);
        handle.await.expect("flushed on shutdown");
        let err = publisher
            .publish(PubsubMessage::new("late"))
            .await
            .await
            .expect_err("after shutdown");
        assert_eq!(err, PublishError::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_sends_open_batches() {
        let fake = Arc::new(InMemoryPublisher::new());
        let publisher = Publisher::new(topic(), fake.clone(), config(100, Duration::from_secs(60)))
            .expect("publisher");
        let handle = publisher.publish(PubsubMessage::new("now")).await;
        publisher.flush().await.expect("flush");
        handle.await.expect("id");
        assert_eq!(fake.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_publish_is_not_transmitted() {
        let fake = Arc::new(InMemoryPublisher::new());
        let publisher = Publisher::new(topic(), fake.clone(), config(100, Duration::from_millis(10)))
            .expect("publisher");
        let cancel = CancellationToken::new();
        let cancelled = publisher
            .publish_with_cancellation(PubsubMessage::new("drop-me"), cancel.clone())
            .await;
        let kept = publisher.publish(PubsubMessage::new("keep-me")).await;
        cancel.cancel();
        assert_eq!(cancelled.await, Err(PublishError::Cancelled));
        kept.await.expect("id");
        let calls = fake.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].messages.len(), 1);
        assert_eq!(calls[0].messages[0].data, "keep-me");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_ordered_message_behind_slow_batch_resolves_at_once() {
        let fake = Arc::new(InMemoryPublisher::new().with_latency(Duration::from_secs(30)));
        let mut cfg = ordered(config(1, Duration::from_millis(1)));
        cfg.flow_control = FlowControlSettings::blocking(100, 0);
        let publisher = Publisher::new(topic(), fake.clone(), cfg).expect("publisher");
        let slow = publisher
            .publish(PubsubMessage::new("a").with_ordering_key("K"))
            .await;
        let cancel = CancellationToken::new();
        let queued = publisher
            .publish_with_cancellation(PubsubMessage::new("b").with_ordering_key("K"), cancel.clone())
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(publisher.outstanding().elements, 2);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), queued)
            .await
            .expect("resolved before the in-flight batch finished");
        assert_eq!(result, Err(PublishError::Cancelled));
        assert_eq!(publisher.outstanding().elements, 1);

        slow.await.expect("first id");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let calls = fake.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].messages[0].data, "a");
        assert_eq!(publisher.outstanding(), FlowUsage::default());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_message_leaves_its_open_batch_at_once() {
        let fake = Arc::new(InMemoryPublisher::new());
        let mut cfg = config(100, Duration::from_secs(10));
        cfg.flow_control = FlowControlSettings::blocking(100, 0);
        let publisher = Publisher::new(topic(), fake.clone(), cfg).expect("publisher");
        let cancel = CancellationToken::new();
        let handle = publisher
            .publish_with_cancellation(PubsubMessage::new("x"), cancel.clone())
            .await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("resolved before the delay threshold");
        assert_eq!(result, Err(PublishError::Cancelled));
        assert_eq!(publisher.outstanding(), FlowUsage::default());
        publisher.flush().await.expect("flush");
        assert!(fake.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_unblocks_flow_control_wait() {
        let fake = Arc::new(InMemoryPublisher::new().with_latency(Duration::from_secs(5)));
        let mut cfg = config(1, Duration::from_millis(1));
        cfg.flow_control = FlowControlSettings::blocking(1, 0);
        let publisher = Publisher::new(topic(), fake, cfg).expect("publisher");
        let first = publisher.publish(PubsubMessage::new("a")).await;
        let cancel = CancellationToken::new();
        let waiter = {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                publisher
                    .publish_with_cancellation(PubsubMessage::new("b"), cancel)
                    .await
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let err = waiter.await.expect("join").expect_err("cancelled");
        assert_eq!(err, PublishError::FlowControl(FlowControlError::Cancelled));
        first.await.expect("first id");
    }
}
