use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use thiserror::Error;

/// Header carrying the delivery attempt counter.
pub const ATTEMPT_HEADER: &str = "Attempt";

/// Content type of serialized actions.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Delivery attempt counter, starting at one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attempt(u32);

impl Attempt {
    /// The attempt of a freshly sent message.
    pub const FIRST: Self = Self(1);

    /// Returns the attempt that follows this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the numeric value.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for Attempt {
    fn default() -> Self {
        Self::FIRST
    }
}

impl TryFrom<i64> for Attempt {
    type Error = AttemptHeaderError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u32::try_from(value)
            .ok()
            .filter(|value| *value >= 1)
            .map(Self)
            .ok_or_else(|| AttemptHeaderError::Malformed(value.to_string()))
    }
}

impl Display for Attempt {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Errors decoding the attempt header of a delivery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptHeaderError {
    /// The delivery has no attempt header.
    #[error("delivery has no {ATTEMPT_HEADER} header")]
    Missing,

    /// The attempt header is not a positive integer.
    #[error("delivery has a malformed {ATTEMPT_HEADER} header: {0}")]
    Malformed(String),
}

/// Transport-neutral view of one delivery header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// Any integer-typed value.
    Integer(i64),
    /// A string value.
    Text(String),
    /// Anything else, kept as a debug rendering.
    Other(String),
}

/// Decodes the attempt counter from delivery headers.
pub fn parse_attempt_header(
    headers: &HashMap<String, HeaderValue>,
) -> Result<Attempt, AttemptHeaderError> {
    match headers.get(ATTEMPT_HEADER) {
        None => Err(AttemptHeaderError::Missing),
        Some(HeaderValue::Integer(value)) => Attempt::try_from(*value),
        Some(HeaderValue::Text(value)) => value
            .trim()
            .parse::<i64>()
            .map_err(|_| AttemptHeaderError::Malformed(value.clone()))
            .and_then(Attempt::try_from),
        Some(HeaderValue::Other(value)) => Err(AttemptHeaderError::Malformed(value.clone())),
    }
}

/// Immutable unit handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    body: Vec<u8>,
    content_type: String,
    attempt: Attempt,
}

impl Message {
    /// Creates a message.
    #[must_use]
    pub fn new(body: Vec<u8>, content_type: impl Into<String>, attempt: Attempt) -> Self {
        Self {
            body,
            content_type: content_type.into(),
            attempt,
        }
    }

    /// Creates a first-attempt JSON message.
    #[must_use]
    pub fn json(body: Vec<u8>) -> Self {
        Self::new(body, JSON_CONTENT_TYPE, Attempt::FIRST)
    }

    /// Returns the raw body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        self.body.as_slice()
    }

    /// Returns the content type.
    #[must_use]
    pub fn content_type(&self) -> &str {
        self.content_type.as_str()
    }

    /// Returns the attempt counter.
    #[must_use]
    pub fn attempt(&self) -> Attempt {
        self.attempt
    }

    /// Returns a copy with the next attempt counter.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            body: self.body.clone(),
            content_type: self.content_type.clone(),
            attempt: self.attempt.next(),
        }
    }
}

/// Single-use broker handle of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    /// Wraps a broker delivery tag.
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the broker value.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl Display for DeliveryTag {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// A message as delivered from one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    message: Message,
    origin_queue: String,
    delivery_tag: DeliveryTag,
}

impl ReceivedMessage {
    /// Creates a received message.
    #[must_use]
    pub fn new(message: Message, origin_queue: impl Into<String>, delivery_tag: DeliveryTag) -> Self {
        Self {
            message,
            origin_queue: origin_queue.into(),
            delivery_tag,
        }
    }

    /// Returns the underlying message.
    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Returns the queue the delivery came from.
    #[must_use]
    pub fn origin_queue(&self) -> &str {
        self.origin_queue.as_str()
    }

    /// Returns the delivery tag.
    #[must_use]
    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }
}
