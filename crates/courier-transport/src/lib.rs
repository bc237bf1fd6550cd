// Transport seams used by the delivery engine.
//! The engine never speaks a wire protocol itself. Callers hand it an
//! implementation of [`PublisherTransport`] and/or [`SubscriberTransport`]
//! (a gRPC channel, a test fake, a proxy) and keep ownership of it.
//!
//! Design notes:
//! - Every call is addressed by a typed resource name.
//! - Errors are reported as [`Status`] so retry policy can be driven by status
//!   code without knowing the wire encoding.
//! - Acknowledgments and deadline changes are unary calls; the pull stream only
//!   carries inbound message batches.
use async_trait::async_trait;
use courier_common::names::{SubscriptionName, TopicName};
use courier_common::{PubsubMessage, ReceivedMessage, Status};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::fmt;

pub mod in_memory;

pub type TransportResult<T> = std::result::Result<T, Status>;

/// Unary publish call.
#[async_trait]
pub trait PublisherTransport: Send + Sync + 'static {
    /// Publishes `messages` in order and returns one broker-assigned id per message,
    /// in request order.
    async fn publish(
        &self,
        topic: &TopicName,
        messages: Vec<PubsubMessage>,
    ) -> TransportResult<Vec<String>>;
}

/// Streaming pull plus the unary acknowledgment calls.
#[async_trait]
pub trait SubscriberTransport: Send + Sync + 'static {
    async fn streaming_pull(&self, request: StreamingPullRequest) -> TransportResult<PullStream>;

    async fn acknowledge(
        &self,
        subscription: &SubscriptionName,
        ack_ids: Vec<String>,
    ) -> TransportResult<()>;

    /// A deadline of zero makes the messages eligible for redelivery immediately.
    async fn modify_ack_deadline(
        &self,
        subscription: &SubscriptionName,
        ack_ids: Vec<String>,
        ack_deadline_seconds: u32,
    ) -> TransportResult<()>;
}

/// First request sent when a pull stream is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingPullRequest {
    pub subscription: SubscriptionName,
    pub stream_ack_deadline_seconds: u32,
    /// Stable for the lifetime of one subscriber stream, across reconnects.
    pub client_id: String,
    pub max_outstanding_messages: u64,
    pub max_outstanding_bytes: u64,
}

/// One inbound batch from the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingPullResponse {
    pub received_messages: Vec<ReceivedMessage>,
    pub exactly_once_delivery_enabled: bool,
    pub message_ordering_enabled: bool,
}

/// Inbound half of an open streaming pull. Dropping it closes the stream.
pub struct PullStream {
    inner: BoxStream<'static, TransportResult<StreamingPullResponse>>,
}

impl PullStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = TransportResult<StreamingPullResponse>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    /// `None` means the broker closed the stream cleanly.
    pub async fn next_response(&mut self) -> Option<TransportResult<StreamingPullResponse>> {
        self.inner.next().await
    }
}

impl fmt::Debug for PullStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullStream").finish_non_exhaustive()
    }
}
