// Shared data types used by the publish and subscribe pipelines.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid resource name: {0}")]
    InvalidName(String),
    #[error("unknown status code: {0}")]
    UnknownStatusCode(String),
}

pub mod names {
    // Typed resource names so a topic can never be passed where a subscription is expected.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;

    macro_rules! resource_name {
        ($name:ident, $collection:literal) => {
            #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            #[serde(try_from = "String", into = "String")]
            pub struct $name {
                project: String,
                id: String,
            }

            impl $name {
                pub fn new(project: impl Into<String>, id: impl Into<String>) -> Result<Self> {
                    let project = project.into();
                    let id = id.into();
                    if !valid_segment(&project) || !valid_segment(&id) {
                        return Err(Error::InvalidName(format!(
                            "projects/{project}/{}/{id}",
                            $collection
                        )));
                    }
                    Ok(Self { project, id })
                }

                pub fn project(&self) -> &str {
                    &self.project
                }

                pub fn id(&self) -> &str {
                    &self.id
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "projects/{}/{}/{}", self.project, $collection, self.id)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    let mut parts = input.split('/');
                    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
                        (Some("projects"), Some(project), Some($collection), Some(id), None) => {
                            Self::new(project, id).map_err(|_| Error::InvalidName(input.into()))
                        }
                        _ => Err(Error::InvalidName(input.into())),
                    }
                }
            }

            impl TryFrom<String> for $name {
                type Error = Error;

                fn try_from(value: String) -> Result<Self> {
                    value.parse()
                }
            }

            impl From<$name> for String {
                fn from(value: $name) -> Self {
                    value.to_string()
                }
            }
        };
    }

    fn valid_segment(segment: &str) -> bool {
        !segment.is_empty() && !segment.contains('/')
    }

    resource_name!(TopicName, "topics");
    resource_name!(SubscriptionName, "subscriptions");
}

/// Attribute added to delivered messages that carry a broker delivery attempt.
pub const DELIVERY_ATTEMPT_ATTRIBUTE: &str = "googclient_deliveryattempt";

/// An application message as handed to the publisher or delivered to a subscriber.
///
/// ```
/// use courier_common::PubsubMessage;
///
/// let message = PubsubMessage::new("hello")
///     .with_attribute("origin", "doc")
///     .with_ordering_key("user-1");
/// assert_eq!(message.size(), 5 + 6 + 3 + 6);
/// assert!(message.message_id.is_none());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubsubMessage {
    pub data: Bytes,
    pub attributes: BTreeMap<String, String>,
    /// Empty means unordered.
    pub ordering_key: String,
    /// Assigned by the broker; absent before publication.
    pub message_id: Option<String>,
}

impl PubsubMessage {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = key.into();
        self
    }

    /// Bytes counted against batch and flow-control limits.
    pub fn size(&self) -> u64 {
        let attributes: usize = self
            .attributes
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum();
        (self.data.len() + attributes + self.ordering_key.len()) as u64
    }
}

/// A broker-delivered message plus the token used to acknowledge it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: PubsubMessage,
    /// Zero when the subscription does not track delivery attempts.
    pub delivery_attempt: u32,
}

/// Canonical RPC status codes reported by the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    pub const ALL: [StatusCode; 17] = [
        StatusCode::Ok,
        StatusCode::Cancelled,
        StatusCode::Unknown,
        StatusCode::InvalidArgument,
        StatusCode::DeadlineExceeded,
        StatusCode::NotFound,
        StatusCode::AlreadyExists,
        StatusCode::PermissionDenied,
        StatusCode::ResourceExhausted,
        StatusCode::FailedPrecondition,
        StatusCode::Aborted,
        StatusCode::OutOfRange,
        StatusCode::Unimplemented,
        StatusCode::Internal,
        StatusCode::Unavailable,
        StatusCode::DataLoss,
        StatusCode::Unauthenticated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusCode {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let normalized = input.trim().to_ascii_uppercase();
        StatusCode::ALL
            .into_iter()
            .find(|code| code.as_str() == normalized)
            .ok_or_else(|| Error::UnknownStatusCode(input.into()))
    }
}

impl TryFrom<String> for StatusCode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StatusCode> for String {
    fn from(value: StatusCode) -> Self {
        value.as_str().to_string()
    }
}

/// Error returned by the transport for a failed call or a failed stream.
///
/// `details` carries per-ack-id error reasons on exactly-once acknowledgment
/// responses, e.g. `PERMANENT_FAILURE_INVALID_ACK_ID`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
    pub details: BTreeMap<String, String>,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, ack_id: impl Into<String>, reason: impl Into<String>) -> Self {
        self.details.insert(ack_id.into(), reason.into());
        self
    }
}

/// Result of an exactly-once acknowledgment.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AckOutcome {
    /// The message will not be redelivered under this ack id.
    Successful,
    /// The ack id was unknown or its lease had already expired.
    Invalid,
    PermissionDenied,
    FailedPrecondition,
    /// Unclassified; the message may be redelivered.
    Other,
}

impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            AckOutcome::Successful => "successful",
            AckOutcome::Invalid => "invalid",
            AckOutcome::PermissionDenied => "permission_denied",
            AckOutcome::FailedPrecondition => "failed_precondition",
            AckOutcome::Other => "other",
        };
        f.write_str(value)
    }
}
