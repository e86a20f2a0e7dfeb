mod connection;
mod message;
mod transport;

pub use connection::{ConnectionStatus, ExchangeKind, QueueInspection};
pub use message::{
    ATTEMPT_HEADER, Attempt, AttemptHeaderError, DeliveryTag, HeaderValue, JSON_CONTENT_TYPE,
    Message, ReceivedMessage, parse_attempt_header,
};
pub use transport::QueueTransport;
