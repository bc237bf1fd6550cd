// Error types surfaced through publish handles, flow control and subscribers.
use courier_common::Status;
use std::time::Duration;

/// Local flow-control failures. `MaxOutstanding*` and `RequestTooLarge` are
/// capacity rejections; callers apply their own backpressure on them.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowControlError {
    #[error("flow control: outstanding element limit {limit} reached")]
    MaxOutstandingElements { limit: u64 },
    #[error("flow control: outstanding byte limit {limit} reached")]
    MaxOutstandingBytes { limit: u64 },
    #[error("flow control: request of {requested} bytes can never fit limit {limit}")]
    RequestTooLarge { requested: u64, limit: u64 },
    #[error(
        "flow control: release of {elements} elements / {bytes} bytes exceeds outstanding usage"
    )]
    OverRelease { elements: u64, bytes: u64 },
    #[error("flow control: reservation cancelled")]
    Cancelled,
}

/// Terminal failure of a single publish. Cloned once per message of a failed batch.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("publish rpc failed: {0}")]
    Rpc(Status),
    #[error("publish did not complete within {0:?}")]
    DeadlineExceeded(Duration),
    #[error(transparent)]
    FlowControl(#[from] FlowControlError),
    #[error("ordering key {key:?} is paused after a failed publish: {cause}")]
    OrderingKeyPaused {
        key: String,
        cause: Box<PublishError>,
    },
    #[error("message has an ordering key but message ordering is disabled")]
    OrderingDisabled,
    #[error("publish result count {actual} does not match expected {expected}")]
    ResponseMismatch { expected: usize, actual: usize },
    #[error("publish cancelled")]
    Cancelled,
    #[error("publisher is shut down")]
    Shutdown,
}

impl PublishError {
    /// The failure that poisoned an ordering key, or `self` for any other error.
    pub fn root_cause(&self) -> &PublishError {
        match self {
            PublishError::OrderingKeyPaused { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    #[error("streaming pull failed permanently: {0}")]
    Stream(Status),
    #[error("subscriber is shut down")]
    Shutdown,
}
