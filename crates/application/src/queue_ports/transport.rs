use async_trait::async_trait;
use auditflow_core::AppResult;
use tokio::sync::mpsc;

use super::connection::{ConnectionStatus, ExchangeKind, QueueInspection};
use super::message::{DeliveryTag, Message, ReceivedMessage};

/// Broker port used by the action flow.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Declares a durable exchange. Re-declaring identical topology is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> AppResult<()>;

    /// Declares a durable queue.
    async fn declare_queue(&self, name: &str) -> AppResult<()>;

    /// Binds a queue to an exchange by routing key.
    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> AppResult<()>;

    /// Publishes one persistent message and waits for the broker confirm.
    async fn publish(&self, message: &Message, exchange: &str, routing_key: &str)
    -> AppResult<()>;

    /// Streams decoded deliveries of one queue into `sink`.
    ///
    /// Deliveries whose attempt header cannot be decoded are rejected and never
    /// reach the sink. Returns when the broker ends the stream, the connection
    /// stops, or the sink is closed; `sink` is dropped on return.
    async fn subscribe(
        &self,
        queue: &str,
        consumer: &str,
        sink: mpsc::Sender<ReceivedMessage>,
    ) -> AppResult<()>;

    /// Acknowledges one delivery.
    async fn ack(&self, tag: DeliveryTag) -> AppResult<()>;

    /// Rejects one delivery without requeueing it.
    async fn reject(&self, tag: DeliveryTag) -> AppResult<()>;

    /// Returns the depth of one queue without modifying it.
    async fn inspect(&self, queue: &str) -> AppResult<QueueInspection>;

    /// Returns the current connection status.
    fn status(&self) -> ConnectionStatus;

    /// Registers a listener receiving every later connection status change.
    fn notify_status_change(&self, listener: mpsc::UnboundedSender<ConnectionStatus>);
}
