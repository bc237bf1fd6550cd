// Subscriber handle and its supervisor task.
//! A [`Subscriber`] runs `parallel_pull_count` streaming pulls plus one ack
//! processor and one lease extender, all on the caller's runtime. It keeps
//! running until [`Subscriber::shutdown`] is called or a stream fails with a
//! non-retryable status, which [`Subscriber::terminated`] reports.
use anyhow::Context;
use courier_common::{AckOutcome, Status, StatusCode};
use courier_common::names::SubscriptionName;
use courier_transport::SubscriberTransport;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::SubscriberConfig;
use crate::error::SubscriberError;

mod ack_tracker;
mod dispatcher;
mod flow;
mod lease;
mod shutdown;

pub use ack_tracker::AckResultHandle;
pub use dispatcher::{AckReply, MessageReceiver, StreamState};
pub use shutdown::{ShutdownMode, ShutdownSettings};

use dispatcher::{
    AckCommand, SubscriberShared, run_ack_processor, run_lease_extender, run_stream,
};
use shutdown::FINAL_NACK_TIMEOUT;

type Termination = Option<Result<(), SubscriberError>>;

#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

struct SubscriberInner {
    shared: Arc<SubscriberShared>,
    shutdown: CancellationToken,
    terminated: watch::Receiver<Termination>,
}

impl Subscriber {
    /// Validates `config` and starts pulling on the current tokio runtime.
    pub fn start(
        subscription: SubscriptionName,
        transport: Arc<dyn SubscriberTransport>,
        config: SubscriberConfig,
        receiver: Arc<dyn MessageReceiver>,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid subscriber config")?;
        let runtime = Handle::try_current().context("subscriber requires a tokio runtime")?;
        let (shared, ack_rx) = SubscriberShared::new(subscription, transport, config);
        let shutdown = CancellationToken::new();
        let (done, terminated) = watch::channel(None);
        runtime.spawn(run_subscriber(
            shared.clone(),
            receiver,
            ack_rx,
            shutdown.clone(),
            done,
        ));
        tracing::info!(
            subscription = %shared.subscription,
            streams = shared.config.parallel_pull_count,
            "subscriber started"
        );
        Ok(Self {
            inner: Arc::new(SubscriberInner {
                shared,
                shutdown,
                terminated,
            }),
        })
    }

    pub fn subscription(&self) -> &SubscriptionName {
        &self.inner.shared.subscription
    }

    pub fn stream_states(&self) -> Vec<StreamState> {
        self.inner.shared.stream_states()
    }

    /// Messages currently leased: received and not yet acked, nacked or expired.
    pub fn outstanding_leases(&self) -> usize {
        self.inner.shared.leases.len()
    }

    pub fn exactly_once_enabled(&self) -> bool {
        self.inner.shared.exactly_once()
    }

    /// Sends every pending ack, nack and modack now and waits for the requests.
    pub async fn flush_acks(&self) {
        let (done, flushed) = oneshot::channel();
        if self.inner.shared.send(AckCommand::Flush(done)) {
            let _ = flushed.await;
        }
    }

    /// Drains per the configured [`ShutdownSettings`] and waits for termination.
    pub async fn shutdown(&self) -> Result<(), SubscriberError> {
        self.inner.shutdown.cancel();
        self.terminated().await
    }

    /// Resolves once the subscriber has stopped: `Ok` after a requested
    /// shutdown, `Err` when a stream failed permanently.
    pub async fn terminated(&self) -> Result<(), SubscriberError> {
        let mut terminated = self.inner.terminated.clone();
        match terminated.wait_for(Option::is_some).await {
            Ok(outcome) => Option::clone(&outcome).unwrap_or(Ok(())),
            Err(_) => Err(SubscriberError::Shutdown),
        }
    }
}

async fn run_subscriber(
    shared: Arc<SubscriberShared>,
    receiver: Arc<dyn MessageReceiver>,
    ack_rx: mpsc::UnboundedReceiver<AckCommand>,
    shutdown: CancellationToken,
    done: watch::Sender<Termination>,
) {
    let processor = tokio::spawn(run_ack_processor(shared.clone(), ack_rx));
    let extender = tokio::spawn(run_lease_extender(shared.clone()));
    let mut streams = JoinSet::new();
    for index in 0..shared.config.parallel_pull_count {
        streams.spawn(run_stream(shared.clone(), receiver.clone(), index));
    }
    let failure = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break None,
            joined = streams.join_next() => match joined {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(status))) => {
                    tracing::error!(subscription = %shared.subscription, error = %status, "pull stream failed permanently");
                    break Some(SubscriberError::Stream(status));
                }
                Some(Err(err)) => {
                    tracing::error!(subscription = %shared.subscription, error = %err, "pull stream task aborted");
                    break Some(SubscriberError::Stream(Status::new(StatusCode::Internal, err.to_string())));
                }
                None => break None,
            },
        }
    };
    drain(&shared, streams, extender, processor).await;
    let _ = done.send(Some(match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }));
}

/// Stops pulling and extension, gives callbacks the grace period, nacks what is
/// left, then flushes and stops the ack processor.
async fn drain(
    shared: &Arc<SubscriberShared>,
    mut streams: JoinSet<Result<(), Status>>,
    extender: JoinHandle<()>,
    processor: JoinHandle<()>,
) {
    let settings = shared.config.shutdown;
    tracing::info!(subscription = %shared.subscription, mode = ?settings.mode, "subscriber draining");
    shared.set_all_states(StreamState::Draining);
    shared.stop.cancel();
    while streams.join_next().await.is_some() {}
    let _ = extender.await;

    shared.callbacks.close();
    match settings.grace_period() {
        None => shared.callbacks.wait().await,
        Some(grace) => {
            if tokio::time::timeout(grace, shared.callbacks.wait())
                .await
                .is_err()
            {
                tracing::warn!(
                    running = shared.callbacks.len(),
                    "callbacks still running after grace period"
                );
            }
        }
    }

    let leftover = shared.leases.drain();
    if !leftover.is_empty() {
        tracing::debug!(count = leftover.len(), "nacking unprocessed messages");
        for ack_id in leftover {
            shared.send(AckCommand::Nack(ack_id));
        }
    }
    let (close, closed) = oneshot::channel();
    if shared.send(AckCommand::Close(close)) {
        let flushed = match settings.timeout {
            Some(_) => tokio::time::timeout(FINAL_NACK_TIMEOUT, closed)
                .await
                .is_ok_and(|result| result.is_ok()),
            None => closed.await.is_ok(),
        };
        if !flushed {
            tracing::warn!("final ack flush did not finish in time");
            processor.abort();
        }
    }
    shared.tracker.complete_all(AckOutcome::Other);
    shared.set_all_states(StreamState::Disconnected);
    tracing::info!(subscription = %shared.subscription, "subscriber stopped");
}
