// Client-side delivery engine for a publish/subscribe service.
//
// Publish path: `Publisher::publish` reserves flow-control budget on the caller's
// task, then a single scheduler task per publisher owns batching and per-key
// sequencing and drives transport calls with retry. Nothing on the publish path
// takes a lock shared with another publisher.
//
// Subscribe path: each `Subscriber` runs one task per streaming pull, one ack
// processor that coalesces acks/nacks/modacks into bounded requests, and one
// lease extender. Application callbacks run on their own tasks, bounded by a
// semaphore and by inbound flow control.
//
// The transport is injected (`courier_transport`), and every task runs on the
// caller's tokio runtime.
pub mod config;
pub mod error;
pub mod flow_control;
pub mod publisher;
mod retry;
pub mod subscriber;

pub use config::{
    BackoffSettings, BatchingSettings, FlowControlSettings, LeaseSettings, LimitBehavior,
    PublisherConfig, RetrySettings, SubscriberConfig,
};
pub use courier_common::{AckOutcome, PubsubMessage, ReceivedMessage, Status, StatusCode};
pub use courier_common::names::{SubscriptionName, TopicName};
pub use error::{FlowControlError, PublishError, SubscriberError};
pub use flow_control::{FlowController, FlowReservation, FlowUsage, ReserveOutcome};
pub use publisher::{PublishHandle, Publisher};
pub use subscriber::{
    AckReply, AckResultHandle, MessageReceiver, ShutdownMode, ShutdownSettings, StreamState,
    Subscriber,
};
