use auditflow_core::{AppError, AppResult};

/// Broker connection health as seen by the connection owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    /// Nothing attempted yet.
    #[default]
    Idle,
    /// Dialing the broker.
    Connecting,
    /// Connection and channel are open.
    Connected,
    /// The broker closed the connection unexpectedly.
    ConnectionDropped,
    /// The connection was closed on request.
    ConnectionClosed,
    /// Dialing gave up.
    ConnectionFailed,
}

impl ConnectionStatus {
    /// Returns stable label value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ConnectionDropped => "connection_dropped",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionFailed => "connection_failed",
        }
    }
}

/// AMQP exchange routing kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExchangeKind {
    /// Exact routing key match.
    #[default]
    Direct,
    /// Every bound queue.
    Fanout,
    /// Pattern routing key match.
    Topic,
    /// Header match.
    Headers,
}

impl ExchangeKind {
    /// Returns broker value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }

    /// Parses broker value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "headers" => Ok(Self::Headers),
            _ => Err(AppError::Validation(format!(
                "unknown exchange kind '{value}'"
            ))),
        }
    }
}

/// Read-only depth snapshot of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueInspection {
    /// Ready messages waiting in the queue.
    pub messages_waiting: u32,
    /// Consumers attached to the queue.
    pub consumer_count: u32,
}
