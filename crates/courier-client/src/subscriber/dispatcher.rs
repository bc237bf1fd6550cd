// Streaming-pull dispatch: stream loops, callback delivery, ack coalescing and lease extension.
use async_trait::async_trait;
use courier_common::names::SubscriptionName;
use courier_common::{
    AckOutcome, DELIVERY_ATTEMPT_ATTRIBUTE, PubsubMessage, ReceivedMessage, Status, StatusCode,
};
use courier_transport::{StreamingPullRequest, StreamingPullResponse, SubscriberTransport};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::ack_tracker::{AckResultHandle, AckResultTracker, AckVerdict, classify};
use super::flow::SubscriberFlowController;
use super::lease::LeaseManager;
use crate::config::{LimitBehavior, SubscriberConfig};
use crate::flow_control::FlowReservation;
use crate::retry::{Backoff, RetryError, call_with_retry};

/// Application callback for delivered messages.
///
/// Resolve `reply` with [`AckReply::ack`] or [`AckReply::nack`], now or later from
/// another task. Dropping it unresolved nacks the message, and so does returning
/// `Err` before resolving it.
#[async_trait]
pub trait MessageReceiver: Send + Sync + 'static {
    async fn receive(&self, message: PubsubMessage, reply: AckReply) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Streaming,
    Draining,
}

pub(crate) enum AckCommand {
    Ack(String),
    Nack(String),
    Modack { ack_ids: Vec<String>, seconds: u32 },
    /// Sends everything pending and answers once those requests finished.
    Flush(oneshot::Sender<()>),
    /// Like `Flush`, then stops the processor.
    Close(oneshot::Sender<()>),
}

/// State shared by every task of one subscriber.
pub(crate) struct SubscriberShared {
    pub(crate) subscription: SubscriptionName,
    pub(crate) transport: Arc<dyn SubscriberTransport>,
    pub(crate) config: SubscriberConfig,
    pub(crate) leases: LeaseManager,
    pub(crate) flow: SubscriberFlowController,
    pub(crate) tracker: AckResultTracker,
    /// Cancelled when pulling and lease extension must stop.
    pub(crate) stop: CancellationToken,
    pub(crate) callbacks: TaskTracker,
    exactly_once: AtomicBool,
    acks: mpsc::UnboundedSender<AckCommand>,
    states: Mutex<Vec<StreamState>>,
}

impl SubscriberShared {
    pub(crate) fn new(
        subscription: SubscriptionName,
        transport: Arc<dyn SubscriberTransport>,
        config: SubscriberConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AckCommand>) {
        let (acks, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            subscription,
            transport,
            leases: LeaseManager::new(config.lease),
            flow: SubscriberFlowController::new(config.flow_control),
            tracker: AckResultTracker::default(),
            stop: CancellationToken::new(),
            callbacks: TaskTracker::new(),
            exactly_once: AtomicBool::new(config.enable_exactly_once_delivery),
            acks,
            states: Mutex::new(vec![StreamState::Disconnected; config.parallel_pull_count]),
            config,
        });
        (shared, rx)
    }

    pub(crate) fn exactly_once(&self) -> bool {
        self.exactly_once.load(Ordering::Acquire)
    }

    fn observe_response(&self, response: &StreamingPullResponse) {
        let enabled =
            self.config.enable_exactly_once_delivery || response.exactly_once_delivery_enabled;
        if self.exactly_once.swap(enabled, Ordering::AcqRel) != enabled {
            tracing::info!(
                subscription = %self.subscription,
                exactly_once = enabled,
                "exactly-once delivery changed"
            );
        }
    }

    pub(crate) fn send(&self, command: AckCommand) -> bool {
        self.acks.send(command).is_ok()
    }

    pub(crate) fn stream_states(&self) -> Vec<StreamState> {
        self.states.lock().clone()
    }

    fn set_state(&self, index: usize, state: StreamState) {
        if let Some(slot) = self.states.lock().get_mut(index) {
            *slot = state;
        }
    }

    pub(crate) fn set_all_states(&self, state: StreamState) {
        for slot in self.states.lock().iter_mut() {
            *slot = state;
        }
    }

    fn pull_request(&self, client_id: &str) -> StreamingPullRequest {
        let flow = self.config.flow_control;
        let (messages, bytes) = match flow.limit_behavior {
            LimitBehavior::Ignore => (0, 0),
            _ => (flow.max_outstanding_elements, flow.max_outstanding_bytes),
        };
        StreamingPullRequest {
            subscription: self.subscription.clone(),
            stream_ack_deadline_seconds: self.config.lease.stream_ack_deadline().as_secs() as u32,
            client_id: client_id.to_string(),
            max_outstanding_messages: messages,
            max_outstanding_bytes: bytes,
        }
    }
}

enum Resolution {
    Ack,
    Nack,
}

struct ReplyCore {
    ack_id: String,
    shared: Arc<SubscriberShared>,
    reservation: Mutex<Option<FlowReservation>>,
    resolved: AtomicBool,
}

impl ReplyCore {
    /// First resolution wins; later ones are ignored.
    fn resolve(&self, resolution: Resolution, want_result: bool) -> Option<AckResultHandle> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return None;
        }
        let shared = &self.shared;
        let handle = match resolution {
            Resolution::Ack => {
                shared.leases.acked(&self.ack_id, Instant::now());
                let handle = (want_result && shared.exactly_once())
                    .then(|| shared.tracker.register(&self.ack_id));
                if !shared.send(AckCommand::Ack(self.ack_id.clone())) {
                    shared.tracker.complete(&self.ack_id, AckOutcome::Other);
                }
                handle
            }
            Resolution::Nack => {
                shared.leases.remove(&self.ack_id);
                shared.send(AckCommand::Nack(self.ack_id.clone()));
                None
            }
        };
        self.reservation.lock().take();
        handle
    }
}

/// Acknowledgment handle for one delivered message.
pub struct AckReply {
    core: Arc<ReplyCore>,
}

impl AckReply {
    pub fn ack_id(&self) -> &str {
        &self.core.ack_id
    }

    pub fn ack(self) {
        self.core.resolve(Resolution::Ack, false);
    }

    /// Makes the message eligible for redelivery right away.
    pub fn nack(self) {
        self.core.resolve(Resolution::Nack, false);
    }

    /// Acks and returns the broker's verdict. Without exactly-once delivery the
    /// handle resolves to [`AckOutcome::Successful`] immediately.
    pub fn ack_with_response(self) -> AckResultHandle {
        self.core
            .resolve(Resolution::Ack, true)
            .unwrap_or(AckResultHandle::ready(AckOutcome::Successful))
    }
}

impl Drop for AckReply {
    fn drop(&mut self) {
        self.core.resolve(Resolution::Nack, false);
    }
}

struct Admitted {
    received: ReceivedMessage,
    reservation: FlowReservation,
}

/// Per-stream callback fan-out. Ordered keys run one callback at a time.
struct Delivery {
    shared: Arc<SubscriberShared>,
    receiver: Arc<dyn MessageReceiver>,
    permits: Semaphore,
    keyed: Mutex<HashMap<String, VecDeque<Admitted>>>,
}

impl Delivery {
    fn dispatch(self: &Arc<Self>, admitted: Admitted, ordered: bool) {
        let key = &admitted.received.message.ordering_key;
        if !ordered || key.is_empty() {
            let this = self.clone();
            self.shared
                .callbacks
                .spawn(async move { this.invoke(admitted).await });
            return;
        }
        let key = key.clone();
        {
            let mut keyed = self.keyed.lock();
            if let Some(queue) = keyed.get_mut(&key) {
                queue.push_back(admitted);
                return;
            }
            keyed.insert(key.clone(), VecDeque::new());
        }
        let this = self.clone();
        self.shared.callbacks.spawn(async move {
            let mut next = Some(admitted);
            while let Some(admitted) = next {
                this.invoke(admitted).await;
                next = this.next_for_key(&key);
            }
        });
    }

    fn next_for_key(&self, key: &str) -> Option<Admitted> {
        let mut keyed = self.keyed.lock();
        let next = keyed.get_mut(key)?.pop_front();
        if next.is_none() {
            keyed.remove(key);
        }
        next
    }

    async fn invoke(&self, admitted: Admitted) {
        let Admitted {
            received,
            reservation,
        } = admitted;
        let ReceivedMessage {
            ack_id,
            mut message,
            delivery_attempt,
        } = received;
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };
        // Expired or drained while queued: the broker redelivers it.
        if !self.shared.leases.contains(&ack_id) {
            tracing::debug!(ack_id = %ack_id, "lease gone before delivery; dropping message");
            return;
        }
        if delivery_attempt > 0 {
            message.attributes.insert(
                DELIVERY_ATTEMPT_ATTRIBUTE.to_string(),
                delivery_attempt.to_string(),
            );
        }
        let core = Arc::new(ReplyCore {
            ack_id,
            shared: self.shared.clone(),
            reservation: Mutex::new(Some(reservation)),
            resolved: AtomicBool::new(false),
        });
        let reply = AckReply { core: core.clone() };
        if let Err(err) = self.receiver.receive(message, reply).await {
            tracing::warn!(ack_id = %core.ack_id, error = %err, "receiver failed; nacking");
            core.resolve(Resolution::Nack, false);
        }
    }
}

fn is_retryable_stream_error(status: &Status) -> bool {
    match status.code {
        StatusCode::DeadlineExceeded
        | StatusCode::Internal
        | StatusCode::Cancelled
        | StatusCode::ResourceExhausted
        | StatusCode::Aborted
        | StatusCode::Unknown => true,
        StatusCode::Unavailable => !status.message.contains("Server shutdownNow invoked"),
        _ => false,
    }
}

/// One streaming pull with reconnects. Returns `Err` on a non-retryable stream
/// error and `Ok` once `shared.stop` fires.
pub(crate) async fn run_stream(
    shared: Arc<SubscriberShared>,
    receiver: Arc<dyn MessageReceiver>,
    index: usize,
) -> Result<(), Status> {
    let client_id = Uuid::new_v4().to_string();
    let delivery = Arc::new(Delivery {
        shared: shared.clone(),
        receiver,
        permits: Semaphore::new(shared.config.max_concurrent_callbacks),
        keyed: Mutex::new(HashMap::new()),
    });
    let mut backoff = Backoff::new(shared.config.reconnect_backoff);
    loop {
        shared.set_state(index, StreamState::Connecting);
        let request = shared.pull_request(&client_id);
        let opened = tokio::select! {
            biased;
            _ = shared.stop.cancelled() => return Ok(()),
            opened = shared.transport.streaming_pull(request) => opened,
        };
        match opened {
            Ok(mut stream) => {
                shared.set_state(index, StreamState::Streaming);
                tracing::debug!(subscription = %shared.subscription, stream = index, client_id = %client_id, "pull stream open");
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = shared.stop.cancelled() => return Ok(()),
                        next = stream.next_response() => next,
                    };
                    match next {
                        Some(Ok(response)) => {
                            backoff.reset();
                            handle_response(&shared, &delivery, response).await;
                        }
                        Some(Err(status)) if is_retryable_stream_error(&status) => {
                            tracing::debug!(stream = index, error = %status, "pull stream failed; reconnecting");
                            break;
                        }
                        Some(Err(status)) => {
                            shared.set_state(index, StreamState::Disconnected);
                            return Err(status);
                        }
                        None => {
                            tracing::debug!(stream = index, "pull stream closed by broker");
                            break;
                        }
                    }
                }
            }
            Err(status) if is_retryable_stream_error(&status) => {
                tracing::debug!(stream = index, error = %status, "pull stream connect failed");
            }
            Err(status) => {
                shared.set_state(index, StreamState::Disconnected);
                return Err(status);
            }
        }
        shared.set_state(index, StreamState::Disconnected);
        metrics::counter!("courier_sub_stream_reconnects_total").increment(1);
        let delay = backoff.next_delay();
        tokio::select! {
            biased;
            _ = shared.stop.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn handle_response(
    shared: &Arc<SubscriberShared>,
    delivery: &Arc<Delivery>,
    response: StreamingPullResponse,
) {
    shared.observe_response(&response);
    let exactly_once = shared.exactly_once();
    let ordered = response.message_ordering_enabled;
    let now = Instant::now();
    let mut fresh: Vec<ReceivedMessage> = response
        .received_messages
        .into_iter()
        .filter(|received| {
            let leased = shared.leases.insert(&received.ack_id, now, exactly_once);
            if !leased {
                tracing::debug!(ack_id = %received.ack_id, "duplicate delivery ignored");
            }
            leased
        })
        .collect();
    if fresh.is_empty() {
        return;
    }
    metrics::counter!("courier_sub_messages_received_total").increment(fresh.len() as u64);

    let seconds = shared.leases.extension(exactly_once).as_secs() as u32;
    let ack_ids: Vec<String> = fresh.iter().map(|received| received.ack_id.clone()).collect();
    if exactly_once {
        // Receipts must be confirmed before the callback sees the message.
        let outcomes = tokio::select! {
            biased;
            _ = shared.stop.cancelled() => return,
            outcomes = exactly_once_request(shared, AckRequest::Modack(seconds), ack_ids) => outcomes,
        };
        let rejected: HashSet<String> = outcomes
            .into_iter()
            .filter(|(_, outcome)| *outcome != AckOutcome::Successful)
            .map(|(ack_id, _)| ack_id)
            .collect();
        if !rejected.is_empty() {
            tracing::warn!(count = rejected.len(), "receipt modack rejected; dropping messages");
            for ack_id in &rejected {
                shared.leases.remove(ack_id);
            }
            fresh.retain(|received| !rejected.contains(&received.ack_id));
        }
    } else {
        shared.send(AckCommand::Modack { ack_ids, seconds });
    }

    for received in fresh {
        let Some(reservation) = shared.flow.admit(received.message.size(), &shared.stop).await
        else {
            return;
        };
        if !shared.leases.contains(&received.ack_id) {
            tracing::debug!(ack_id = %received.ack_id, "lease expired awaiting admission; dropping");
            continue;
        }
        delivery.dispatch(
            Admitted {
                received,
                reservation,
            },
            ordered,
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckRequest {
    Ack,
    Modack(u32),
}

impl AckRequest {
    fn operation(self) -> &'static str {
        match self {
            AckRequest::Ack => "acknowledge",
            AckRequest::Modack(_) => "modify_ack_deadline",
        }
    }
}

async fn send_request(
    shared: &SubscriberShared,
    request: AckRequest,
    ack_ids: Vec<String>,
) -> Result<(), Status> {
    match request {
        AckRequest::Ack => {
            shared
                .transport
                .acknowledge(&shared.subscription, ack_ids)
                .await
        }
        AckRequest::Modack(seconds) => {
            shared
                .transport
                .modify_ack_deadline(&shared.subscription, ack_ids, seconds)
                .await
        }
    }
}

/// Sends one exactly-once request and resolves every id, retrying only the ids
/// that may still succeed.
async fn exactly_once_request(
    shared: &SubscriberShared,
    request: AckRequest,
    ack_ids: Vec<String>,
) -> Vec<(String, AckOutcome)> {
    let retry = &shared.config.ack_retry;
    let deadline = Instant::now() + retry.total_timeout;
    let mut backoff = Backoff::from_retry(retry);
    let mut outcomes = Vec::with_capacity(ack_ids.len());
    let mut remaining = ack_ids;
    while !remaining.is_empty() {
        let status = match send_request(shared, request, remaining.clone()).await {
            Ok(()) => {
                outcomes.extend(remaining.drain(..).map(|id| (id, AckOutcome::Successful)));
                break;
            }
            Err(status) => status,
        };
        let mut retry_ids = Vec::new();
        for ack_id in remaining.drain(..) {
            match classify(&status, &ack_id, retry) {
                AckVerdict::Done(outcome) => outcomes.push((ack_id, outcome)),
                AckVerdict::Retry => retry_ids.push(ack_id),
            }
        }
        if retry_ids.is_empty() {
            break;
        }
        let delay = backoff.next_delay();
        if Instant::now() + delay >= deadline {
            tracing::warn!(
                operation = request.operation(),
                count = retry_ids.len(),
                error = %status,
                "exactly-once retry budget exhausted"
            );
            outcomes.extend(retry_ids.into_iter().map(|id| (id, AckOutcome::Other)));
            break;
        }
        tracing::debug!(
            operation = request.operation(),
            count = retry_ids.len(),
            error = %status,
            backoff = ?delay,
            "retrying transient ack failures"
        );
        tokio::time::sleep(delay).await;
        remaining = retry_ids;
    }
    outcomes
}

async fn best_effort_request(shared: &SubscriberShared, request: AckRequest, ack_ids: Vec<String>) {
    let count = ack_ids.len();
    let result = call_with_retry(&shared.config.ack_retry, request.operation(), || {
        send_request(shared, request, ack_ids.clone())
    })
    .await;
    let error = match result {
        Ok(()) => return,
        Err(RetryError::Permanent(status)) => status,
        Err(RetryError::DeadlineExceeded { last, .. }) => last,
    };
    tracing::warn!(operation = request.operation(), count, error = %error, "ack request failed");
}

async fn send_and_settle(shared: &SubscriberShared, request: AckRequest, ack_ids: Vec<String>) {
    if !shared.exactly_once() {
        best_effort_request(shared, request, ack_ids).await;
        return;
    }
    for (ack_id, outcome) in exactly_once_request(shared, request, ack_ids).await {
        match request {
            AckRequest::Ack => shared.tracker.complete(&ack_id, outcome),
            AckRequest::Modack(0) => {}
            AckRequest::Modack(_) => {
                if outcome != AckOutcome::Successful && shared.leases.remove(&ack_id) {
                    tracing::debug!(ack_id = %ack_id, outcome = %outcome, "lease extension rejected; forgetting lease");
                }
            }
        }
    }
}

/// Acks, nacks and modacks waiting for the next flush.
#[derive(Default)]
struct PendingAcks {
    acks: Vec<String>,
    nacks: Vec<String>,
    modacks: BTreeMap<u32, Vec<String>>,
}

impl PendingAcks {
    fn push(&mut self, command: AckCommand) {
        match command {
            AckCommand::Ack(ack_id) => self.acks.push(ack_id),
            AckCommand::Nack(ack_id) => self.nacks.push(ack_id),
            AckCommand::Modack { ack_ids, seconds } if seconds == 0 => self.nacks.extend(ack_ids),
            AckCommand::Modack { ack_ids, seconds } => {
                self.modacks.entry(seconds).or_default().extend(ack_ids)
            }
            AckCommand::Flush(_) | AckCommand::Close(_) => {}
        }
    }

    fn len(&self) -> usize {
        self.acks.len() + self.nacks.len() + self.modacks.values().map(Vec::len).sum::<usize>()
    }

    /// Splits into requests of at most `limit` ids each.
    fn into_requests(self, limit: usize) -> Vec<(AckRequest, Vec<String>)> {
        let mut requests = Vec::new();
        let mut push = |request: AckRequest, ids: Vec<String>| {
            for chunk in ids.chunks(limit) {
                requests.push((request, chunk.to_vec()));
            }
        };
        push(AckRequest::Ack, self.acks);
        push(AckRequest::Modack(0), self.nacks);
        for (seconds, ids) in self.modacks {
            push(AckRequest::Modack(seconds), ids);
        }
        requests
    }
}

fn flush(shared: &Arc<SubscriberShared>, pending: &mut PendingAcks, sends: &mut JoinSet<()>) {
    let requests = std::mem::take(pending).into_requests(shared.config.max_ack_ids_per_request);
    for (request, ack_ids) in requests {
        let count = ack_ids.len() as u64;
        match request {
            AckRequest::Ack => metrics::counter!("courier_sub_acks_total").increment(count),
            AckRequest::Modack(0) => metrics::counter!("courier_sub_nacks_total").increment(count),
            AckRequest::Modack(_) => {
                metrics::counter!("courier_sub_modacks_total").increment(count)
            }
        }
        let shared = shared.clone();
        sends.spawn(async move { send_and_settle(&shared, request, ack_ids).await });
    }
}

/// Coalesces ack traffic into requests, flushed every `ack_flush_interval` or
/// as soon as a full request's worth of ids is pending.
pub(crate) async fn run_ack_processor(
    shared: Arc<SubscriberShared>,
    mut rx: mpsc::UnboundedReceiver<AckCommand>,
) {
    let mut pending = PendingAcks::default();
    let mut sends = JoinSet::new();
    let mut ticker = tokio::time::interval(shared.config.ack_flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(AckCommand::Flush(done)) => {
                    flush(&shared, &mut pending, &mut sends);
                    while sends.join_next().await.is_some() {}
                    let _ = done.send(());
                }
                Some(AckCommand::Close(done)) => {
                    flush(&shared, &mut pending, &mut sends);
                    while sends.join_next().await.is_some() {}
                    let _ = done.send(());
                    break;
                }
                Some(command) => {
                    pending.push(command);
                    if pending.len() >= shared.config.max_ack_ids_per_request {
                        flush(&shared, &mut pending, &mut sends);
                    }
                }
                None => {
                    flush(&shared, &mut pending, &mut sends);
                    while sends.join_next().await.is_some() {}
                    break;
                }
            },
            _ = ticker.tick() => flush(&shared, &mut pending, &mut sends),
            Some(_) = sends.join_next(), if !sends.is_empty() => {}
        }
    }
    shared.tracker.complete_all(AckOutcome::Other);
    tracing::debug!(subscription = %shared.subscription, "ack processor stopped");
}

/// Runs the extension cycle every `lease.check_interval` until `shared.stop` fires.
pub(crate) async fn run_lease_extender(shared: Arc<SubscriberShared>) {
    let mut ticker = tokio::time::interval(shared.config.lease.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let plan = shared
            .leases
            .plan(Instant::now(), shared.exactly_once());
        if plan.is_empty() {
            continue;
        }
        if !plan.extend.is_empty() {
            tracing::trace!(count = plan.extend.len(), seconds = plan.extension_seconds, "extending leases");
            shared.send(AckCommand::Modack {
                ack_ids: plan.extend,
                seconds: plan.extension_seconds,
            });
        }
        for (seconds, ack_ids) in plan.final_modacks {
            shared.send(AckCommand::Modack { ack_ids, seconds });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowControlSettings;
    use courier_transport::in_memory::InMemorySubscriber;
    use std::time::Duration;

    fn shared_with(
        transport: Arc<InMemorySubscriber>,
        config: SubscriberConfig,
    ) -> (Arc<SubscriberShared>, mpsc::UnboundedReceiver<AckCommand>) {
        let subscription = SubscriptionName::new("p", "s").expect("subscription");
        SubscriberShared::new(subscription, transport, config)
    }

    fn ids(prefix: &str, count: usize) -> Vec<String> {
        (0..count).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn pending_acks_split_into_bounded_requests() {
        let mut pending = PendingAcks::default();
        for ack_id in ids("a", 5) {
            pending.push(AckCommand::Ack(ack_id));
        }
        pending.push(AckCommand::Nack("n".into()));
        pending.push(AckCommand::Modack {
            ack_ids: ids("m", 3),
            seconds: 30,
        });
        pending.push(AckCommand::Modack {
            ack_ids: vec!["z".into()],
            seconds: 0,
        });
        assert_eq!(pending.len(), 10);
        let requests = pending.into_requests(2);
        let shape: Vec<(AckRequest, usize)> = requests
            .iter()
            .map(|(request, ids)| (*request, ids.len()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (AckRequest::Ack, 2),
                (AckRequest::Ack, 2),
                (AckRequest::Ack, 1),
                (AckRequest::Modack(0), 2),
                (AckRequest::Modack(30), 2),
                (AckRequest::Modack(30), 1),
            ]
        );
    }

    #[test]
    fn pull_request_carries_flow_limits() {
        let transport = Arc::new(InMemorySubscriber::new());
        let mut config = SubscriberConfig::default();
        config.flow_control = FlowControlSettings::blocking(10, 2048);
        config.lease.initial_deadline = Duration::from_secs(3);
        let (shared, _rx) = shared_with(transport.clone(), config.clone());
        let request = shared.pull_request("client");
        assert_eq!(request.stream_ack_deadline_seconds, 10);
        assert_eq!(request.max_outstanding_messages, 10);
        assert_eq!(request.max_outstanding_bytes, 2048);

        config.flow_control.limit_behavior = LimitBehavior::Ignore;
        let (shared, _rx) = shared_with(transport, config);
        let request = shared.pull_request("client");
        assert_eq!(request.max_outstanding_messages, 0);
    }

    #[test]
    fn stream_errors_split_retryable_and_fatal() {
        assert!(is_retryable_stream_error(&Status::new(StatusCode::Unavailable, "blip")));
        assert!(is_retryable_stream_error(&Status::new(StatusCode::Internal, "blip")));
        assert!(!is_retryable_stream_error(&Status::new(
            StatusCode::Unavailable,
            "Server shutdownNow invoked"
        )));
        assert!(!is_retryable_stream_error(&Status::new(StatusCode::NotFound, "gone")));
    }

    #[tokio::test]
    async fn reply_resolves_once_and_dropping_nacks() {
        let transport = Arc::new(InMemorySubscriber::new());
        let (shared, mut rx) = shared_with(transport, SubscriberConfig::default());
        let now = Instant::now();
        for ack_id in ["a", "b"] {
            shared.leases.insert(ack_id, now, false);
        }
        let reply = |ack_id: &str| AckReply {
            core: Arc::new(ReplyCore {
                ack_id: ack_id.to_string(),
                shared: shared.clone(),
                reservation: Mutex::new(None),
                resolved: AtomicBool::new(false),
            }),
        };
        reply("a").ack();
        drop(reply("b"));
        assert!(matches!(rx.recv().await, Some(AckCommand::Ack(id)) if id == "a"));
        assert!(matches!(rx.recv().await, Some(AckCommand::Nack(id)) if id == "b"));
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.leases.len(), 0);

        let outcome = reply("c").ack_with_response().await;
        assert_eq!(outcome, AckOutcome::Successful);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_once_request_retries_only_transient_ids() {
        let transport = Arc::new(InMemorySubscriber::new());
        transport.script_ack_result(Err(Status::new(StatusCode::InvalidArgument, "partial")
            .with_detail("t", "TRANSIENT_FAILURE_UNORDERED_ACK_ID")
            .with_detail("p", "PERMANENT_FAILURE_INVALID_ACK_ID")));
        let (shared, _rx) = shared_with(transport.clone(), SubscriberConfig::default());
        let mut outcomes = exactly_once_request(
            &shared,
            AckRequest::Ack,
            vec!["ok".into(), "t".into(), "p".into()],
        )
        .await;
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            outcomes,
            vec![
                ("ok".to_string(), AckOutcome::Successful),
                ("p".to_string(), AckOutcome::Invalid),
                ("t".to_string(), AckOutcome::Successful),
            ]
        );
        assert_eq!(
            transport.ack_calls(),
            vec![
                vec!["ok".to_string(), "t".to_string(), "p".to_string()],
                vec!["t".to_string()],
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_once_request_gives_up_after_budget() {
        let transport = Arc::new(InMemorySubscriber::new());
        for _ in 0..100 {
            transport.script_modack_result(Err(Status::new(StatusCode::Unavailable, "down")));
        }
        let mut config = SubscriberConfig::default();
        config.ack_retry.total_timeout = Duration::from_secs(1);
        let (shared, _rx) = shared_with(transport, config);
        let outcomes =
            exactly_once_request(&shared, AckRequest::Modack(10), vec!["a".into()]).await;
        assert_eq!(outcomes, vec![("a".to_string(), AckOutcome::Other)]);
    }

    #[tokio::test(start_paused = true)]
    async fn processor_flushes_on_interval_and_on_close() {
        let transport = Arc::new(InMemorySubscriber::new());
        let (shared, rx) = shared_with(transport.clone(), SubscriberConfig::default());
        let processor = tokio::spawn(run_ack_processor(shared.clone(), rx));
        shared.send(AckCommand::Ack("a".into()));
        shared.send(AckCommand::Nack("n".into()));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(transport.acked_ids(), vec!["a".to_string()]);
        assert_eq!(transport.nacked_ids(), vec!["n".to_string()]);

        shared.send(AckCommand::Ack("b".into()));
        let (done, closed) = oneshot::channel();
        shared.send(AckCommand::Close(done));
        closed.await.expect("closed");
        processor.await.expect("join");
        assert_eq!(transport.acked_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn processor_flushes_full_requests_immediately() {
        let transport = Arc::new(InMemorySubscriber::new());
        let mut config = SubscriberConfig::default();
        config.max_ack_ids_per_request = 3;
        config.ack_flush_interval = Duration::from_secs(60);
        let (shared, rx) = shared_with(transport.clone(), config);
        tokio::spawn(run_ack_processor(shared.clone(), rx));
        // Let the first interval tick pass.
        tokio::time::sleep(Duration::from_millis(1)).await;
        for ack_id in ids("a", 3) {
            shared.send(AckCommand::Ack(ack_id));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.ack_calls(), vec![ids("a", 3)]);
    }
}
