// Exactly-once acknowledgment outcomes, correlated by ack id.
use courier_common::{AckOutcome, Status, StatusCode};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use crate::config::RetrySettings;

const TRANSIENT_PREFIX: &str = "TRANSIENT_";
const PERMANENT_PREFIX: &str = "PERMANENT_";

/// Resolves to the broker's verdict on one ack. Without exactly-once delivery it
/// resolves to [`AckOutcome::Successful`] immediately.
pub struct AckResultHandle {
    state: HandleState,
}

enum HandleState {
    Ready(AckOutcome),
    Pending(oneshot::Receiver<AckOutcome>),
}

impl AckResultHandle {
    pub(crate) fn ready(outcome: AckOutcome) -> Self {
        Self {
            state: HandleState::Ready(outcome),
        }
    }
}

impl Future for AckResultHandle {
    type Output = AckOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<AckOutcome> {
        match &mut self.state {
            HandleState::Ready(outcome) => Poll::Ready(*outcome),
            // A dropped tracker means the outcome is unknown.
            HandleState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(AckOutcome::Other)),
        }
    }
}

#[derive(Default)]
pub(crate) struct AckResultTracker {
    pending: Mutex<HashMap<String, Vec<oneshot::Sender<AckOutcome>>>>,
}

impl AckResultTracker {
    pub(crate) fn register(&self, ack_id: &str) -> AckResultHandle {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .entry_ref(ack_id)
            .or_default()
            .push(tx);
        AckResultHandle {
            state: HandleState::Pending(rx),
        }
    }

    pub(crate) fn complete(&self, ack_id: &str, outcome: AckOutcome) {
        let Some(waiters) = self.pending.lock().remove(ack_id) else {
            return;
        };
        metrics::counter!("courier_sub_ack_outcomes_total", "outcome" => outcome.to_string())
            .increment(1);
        for waiter in waiters {
            let _ = waiter.send(outcome);
        }
    }

    /// Resolves everything still pending, used once no more responses can arrive.
    pub(crate) fn complete_all(&self, outcome: AckOutcome) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, waiters) in pending {
            for waiter in waiters {
                let _ = waiter.send(outcome);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

/// What to do with one ack id after a failed exactly-once request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckVerdict {
    Done(AckOutcome),
    Retry,
}

/// Classifies `ack_id` against a failed acknowledge / modify-ack-deadline call.
///
/// Per-id details win: `TRANSIENT_*` retries, `PERMANENT_*` is invalid, and an
/// id missing from a non-empty detail map succeeded. Without details the status
/// code decides for the whole request.
pub(crate) fn classify(status: &Status, ack_id: &str, retry: &RetrySettings) -> AckVerdict {
    if !status.details.is_empty() {
        return match status.details.get(ack_id) {
            None => AckVerdict::Done(AckOutcome::Successful),
            Some(reason) if reason.starts_with(TRANSIENT_PREFIX) => AckVerdict::Retry,
            Some(reason) if reason.starts_with(PERMANENT_PREFIX) => {
                AckVerdict::Done(AckOutcome::Invalid)
            }
            Some(_) => AckVerdict::Done(AckOutcome::Other),
        };
    }
    match status.code {
        StatusCode::PermissionDenied => AckVerdict::Done(AckOutcome::PermissionDenied),
        StatusCode::FailedPrecondition => AckVerdict::Done(AckOutcome::FailedPrecondition),
        code if retry.is_retryable(code) => AckVerdict::Retry,
        _ => AckVerdict::Done(AckOutcome::Other),
    }
}
