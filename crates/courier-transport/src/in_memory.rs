// Scriptable in-memory transports for tests and local wiring.
use async_trait::async_trait;
use courier_common::names::{SubscriptionName, TopicName};
use courier_common::{PubsubMessage, ReceivedMessage, Status};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::{
    PublisherTransport, PullStream, StreamingPullRequest, StreamingPullResponse,
    SubscriberTransport, TransportResult,
};

/// One recorded publish call.
#[derive(Debug, Clone)]
pub struct PublishCall {
    pub topic: TopicName,
    pub messages: Vec<PubsubMessage>,
}

/// Start/finish markers in the order the fake observed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishEvent {
    Started(usize),
    Finished(usize),
}

enum ScriptedPublish {
    Fail(Status),
    ShortResponse,
}

#[derive(Default)]
struct PublisherState {
    next_id: u64,
    calls: Vec<PublishCall>,
    events: Vec<PublishEvent>,
    scripted: VecDeque<ScriptedPublish>,
    failing_keys: HashMap<String, Status>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Publisher fake that assigns sequential ids and records every call.
///
/// ```
/// use courier_common::{PubsubMessage, names::TopicName};
/// use courier_transport::PublisherTransport;
/// use courier_transport::in_memory::InMemoryPublisher;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let fake = InMemoryPublisher::new();
///     let topic = TopicName::new("p", "t").expect("topic");
///     let ids = fake
///         .publish(&topic, vec![PubsubMessage::new("a"), PubsubMessage::new("b")])
///         .await
///         .expect("publish");
///     assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
/// });
/// ```
#[derive(Default)]
pub struct InMemoryPublisher {
    state: Mutex<PublisherState>,
    latency: Duration,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fails the next publish call with `status`.
    pub fn fail_next(&self, status: Status) {
        self.state.lock().scripted.push_back(ScriptedPublish::Fail(status));
    }

    /// Answers the next publish call with one id fewer than requested.
    pub fn short_response_next(&self) {
        self.state.lock().scripted.push_back(ScriptedPublish::ShortResponse);
    }

    /// Fails every call that carries a message with `key` until cleared.
    pub fn fail_ordering_key(&self, key: impl Into<String>, status: Status) {
        self.state.lock().failing_keys.insert(key.into(), status);
    }

    pub fn clear_ordering_key(&self, key: &str) {
        self.state.lock().failing_keys.remove(key);
    }

    pub fn calls(&self) -> Vec<PublishCall> {
        self.state.lock().calls.clone()
    }

    pub fn events(&self) -> Vec<PublishEvent> {
        self.state.lock().events.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

#[async_trait]
impl PublisherTransport for InMemoryPublisher {
    async fn publish(
        &self,
        topic: &TopicName,
        messages: Vec<PubsubMessage>,
    ) -> TransportResult<Vec<String>> {
        let (call, outcome) = {
            let mut state = self.state.lock();
            let call = state.calls.len();
            let key_failure = messages
                .iter()
                .find_map(|message| state.failing_keys.get(&message.ordering_key).cloned());
            let scripted = state.scripted.pop_front();
            state.calls.push(PublishCall {
                topic: topic.clone(),
                messages: messages.clone(),
            });
            state.events.push(PublishEvent::Started(call));
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            let outcome = match (key_failure, scripted) {
                (Some(status), _) | (None, Some(ScriptedPublish::Fail(status))) => Err(status),
                (None, scripted) => {
                    let short = matches!(scripted, Some(ScriptedPublish::ShortResponse));
                    let count = if short {
                        messages.len().saturating_sub(1)
                    } else {
                        messages.len()
                    };
                    let ids = (0..count)
                        .map(|_| {
                            state.next_id += 1;
                            state.next_id.to_string()
                        })
                        .collect::<Vec<_>>();
                    Ok(ids)
                }
            };
            (call, outcome)
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state.lock();
        state.in_flight -= 1;
        state.events.push(PublishEvent::Finished(call));
        outcome
    }
}

/// One recorded modify-ack-deadline call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModackCall {
    pub ack_ids: Vec<String>,
    pub ack_deadline_seconds: u32,
}

type ResponseSender = mpsc::UnboundedSender<TransportResult<StreamingPullResponse>>;

#[derive(Default)]
struct SubscriberState {
    streams: Vec<ResponseSender>,
    pull_requests: Vec<StreamingPullRequest>,
    connect_failures: VecDeque<Status>,
    ack_calls: Vec<Vec<String>>,
    modacks: Vec<ModackCall>,
    ack_results: VecDeque<TransportResult<()>>,
    modack_results: VecDeque<TransportResult<()>>,
}

/// Subscriber fake: tests push batches into the open pull streams and inspect
/// what the engine acknowledged.
#[derive(Default)]
pub struct InMemorySubscriber {
    state: Mutex<SubscriberState>,
    exactly_once: bool,
    message_ordering: bool,
}

impl InMemorySubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exactly_once(mut self, enabled: bool) -> Self {
        self.exactly_once = enabled;
        self
    }

    pub fn with_message_ordering(mut self, enabled: bool) -> Self {
        self.message_ordering = enabled;
        self
    }

    /// Sends one batch on the first live stream. Returns false when no stream is open.
    pub fn deliver(&self, messages: Vec<ReceivedMessage>) -> bool {
        let response = StreamingPullResponse {
            received_messages: messages,
            exactly_once_delivery_enabled: self.exactly_once,
            message_ordering_enabled: self.message_ordering,
        };
        let mut state = self.state.lock();
        state.streams.retain(|tx| !tx.is_closed());
        match state.streams.first() {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Terminates every open stream with `status`.
    pub fn fail_streams(&self, status: Status) {
        let streams = std::mem::take(&mut self.state.lock().streams);
        for tx in streams {
            let _ = tx.send(Err(status.clone()));
        }
    }

    pub fn fail_next_connect(&self, status: Status) {
        self.state.lock().connect_failures.push_back(status);
    }

    pub fn script_ack_result(&self, result: TransportResult<()>) {
        self.state.lock().ack_results.push_back(result);
    }

    pub fn script_modack_result(&self, result: TransportResult<()>) {
        self.state.lock().modack_results.push_back(result);
    }

    pub fn open_streams(&self) -> usize {
        let mut state = self.state.lock();
        state.streams.retain(|tx| !tx.is_closed());
        state.streams.len()
    }

    pub fn pull_requests(&self) -> Vec<StreamingPullRequest> {
        self.state.lock().pull_requests.clone()
    }

    pub fn acked_ids(&self) -> Vec<String> {
        self.state.lock().ack_calls.iter().flatten().cloned().collect()
    }

    pub fn ack_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().ack_calls.clone()
    }

    pub fn modacks(&self) -> Vec<ModackCall> {
        self.state.lock().modacks.clone()
    }

    /// Ack ids that were nacked (modacked to a zero deadline).
    pub fn nacked_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .modacks
            .iter()
            .filter(|call| call.ack_deadline_seconds == 0)
            .flat_map(|call| call.ack_ids.iter().cloned())
            .collect()
    }

    /// Polls until at least `count` streams are open.
    pub async fn wait_for_streams(&self, count: usize) {
        while self.open_streams() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl SubscriberTransport for InMemorySubscriber {
    async fn streaming_pull(&self, request: StreamingPullRequest) -> TransportResult<PullStream> {
        let mut state = self.state.lock();
        state.pull_requests.push(request);
        if let Some(status) = state.connect_failures.pop_front() {
            return Err(status);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.streams.push(tx);
        tracing::debug!(streams = state.streams.len(), "in-memory pull stream opened");
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(PullStream::new(stream))
    }

    async fn acknowledge(
        &self,
        _subscription: &SubscriptionName,
        ack_ids: Vec<String>,
    ) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.ack_calls.push(ack_ids);
        state.ack_results.pop_front().unwrap_or(Ok(()))
    }

    async fn modify_ack_deadline(
        &self,
        _subscription: &SubscriptionName,
        ack_ids: Vec<String>,
        ack_deadline_seconds: u32,
    ) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.modacks.push(ModackCall {
            ack_ids,
            ack_deadline_seconds,
        });
        state.modack_results.pop_front().unwrap_or(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::StatusCode;

    fn topic() -> TopicName {
        TopicName::new("p", "t").expect("topic")
    }

    fn subscription() -> SubscriptionName {
        SubscriptionName::new("p", "s").expect("subscription")
    }

    fn pull_request() -> StreamingPullRequest {
        StreamingPullRequest {
            subscription: subscription(),
            stream_ack_deadline_seconds: 60,
            client_id: "client".into(),
            max_outstanding_messages: 10,
            max_outstanding_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn publisher_fake_scripts_failures_and_short_responses() {
        let fake = InMemoryPublisher::new();
        fake.fail_next(Status::new(StatusCode::Unavailable, "down"));
        fake.short_response_next();
        let err = fake
            .publish(&topic(), vec![PubsubMessage::new("a")])
            .await
            .expect_err("scripted failure");
        assert_eq!(err.code, StatusCode::Unavailable);
        let ids = fake
            .publish(&topic(), vec![PubsubMessage::new("a"), PubsubMessage::new("b")])
            .await
            .expect("short");
        assert_eq!(ids.len(), 1);
        assert_eq!(fake.calls().len(), 2);
        assert_eq!(
            fake.events(),
            vec![
                PublishEvent::Started(0),
                PublishEvent::Finished(0),
                PublishEvent::Started(1),
                PublishEvent::Finished(1),
            ]
        );
    }

    #[tokio::test]
    async fn publisher_fake_fails_keys_until_cleared() {
        let fake = InMemoryPublisher::new();
        fake.fail_ordering_key("k", Status::new(StatusCode::InvalidArgument, "bad"));
        let keyed = vec![PubsubMessage::new("a").with_ordering_key("k")];
        assert!(fake.publish(&topic(), keyed.clone()).await.is_err());
        assert!(fake.publish(&topic(), vec![PubsubMessage::new("b")]).await.is_ok());
        fake.clear_ordering_key("k");
        assert!(fake.publish(&topic(), keyed).await.is_ok());
    }

    #[tokio::test]
    async fn subscriber_fake_delivers_and_records() {
        let fake = InMemorySubscriber::new().with_exactly_once(true);
        assert!(!fake.deliver(Vec::new()));
        fake.fail_next_connect(Status::new(StatusCode::Unavailable, "later"));
        assert!(fake.streaming_pull(pull_request()).await.is_err());
        let mut stream = fake.streaming_pull(pull_request()).await.expect("stream");
        assert_eq!(fake.open_streams(), 1);
        assert!(fake.deliver(vec![ReceivedMessage {
            ack_id: "a1".into(),
            message: PubsubMessage::new("x"),
            delivery_attempt: 0,
        }]));
        let response = stream.next_response().await.expect("item").expect("ok");
        assert!(response.exactly_once_delivery_enabled);
        assert_eq!(response.received_messages[0].ack_id, "a1");

        fake.acknowledge(&subscription(), vec!["a1".into()])
            .await
            .expect("ack");
        fake.modify_ack_deadline(&subscription(), vec!["a2".into()], 0)
            .await
            .expect("nack");
        assert_eq!(fake.acked_ids(), vec!["a1".to_string()]);
        assert_eq!(fake.nacked_ids(), vec!["a2".to_string()]);
        assert_eq!(fake.pull_requests().len(), 2);

        fake.fail_streams(Status::new(StatusCode::Internal, "boom"));
        let err = stream.next_response().await.expect("item").expect_err("failed");
        assert_eq!(err.code, StatusCode::Internal);
        assert!(stream.next_response().await.is_none());
    }
}
