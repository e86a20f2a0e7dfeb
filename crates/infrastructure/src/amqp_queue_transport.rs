//! AMQP 0.9.1 implementation of the queue transport port.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use auditflow_application::{
    ATTEMPT_HEADER, ConnectionStatus, DeliveryTag, ExchangeKind, HeaderValue, JSON_CONTENT_TYPE,
    Message, QueueInspection, QueueTransport, ReceivedMessage, parse_attempt_header,
};
use auditflow_core::{AppError, AppResult};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::amqp_connection_manager::AmqpConnectionManager;

const PERSISTENT_DELIVERY: u8 = 2;

/// Queue transport speaking AMQP through the shared connection manager.
#[derive(Clone)]
pub struct AmqpQueueTransport {
    manager: Arc<AmqpConnectionManager>,
}

impl AmqpQueueTransport {
    /// Creates a transport over a connected manager.
    #[must_use]
    pub fn new(manager: Arc<AmqpConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl QueueTransport for AmqpQueueTransport {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> AppResult<()> {
        self.manager
            .channel()
            .await?
            .exchange_declare(
                name,
                lapin_exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to declare exchange '{name}': {error}"))
            })
    }

    async fn declare_queue(&self, name: &str) -> AppResult<()> {
        self.manager
            .channel()
            .await?
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to declare queue '{name}': {error}"))
            })?;

        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> AppResult<()> {
        self.manager
            .channel()
            .await?
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|error| {
                AppError::Unavailable(format!(
                    "failed to bind queue '{queue}' to '{exchange}' by '{routing_key}': {error}"
                ))
            })
    }

    async fn publish(
        &self,
        message: &Message,
        exchange: &str,
        routing_key: &str,
    ) -> AppResult<()> {
        let mut headers = FieldTable::default();
        headers.insert(
            ATTEMPT_HEADER.into(),
            AMQPValue::LongLongInt(i64::from(message.attempt().get())),
        );

        let confirmation = self
            .manager
            .channel()
            .await?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                message.body(),
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT_DELIVERY)
                    .with_content_type(message.content_type().into())
                    .with_headers(headers),
            )
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to publish to '{routing_key}': {error}"))
            })?
            .await
            .map_err(|error| {
                AppError::Unavailable(format!(
                    "publish to '{routing_key}' was not confirmed: {error}"
                ))
            })?;

        if confirmation.is_nack() {
            return Err(AppError::Unavailable(format!(
                "broker refused message for '{routing_key}'"
            )));
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer: &str,
        sink: mpsc::Sender<ReceivedMessage>,
    ) -> AppResult<()> {
        let channel = self.manager.channel().await?;
        let mut deliveries = channel
            .basic_consume(
                queue,
                consumer,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to consume queue '{queue}': {error}"))
            })?;
        let mut stop = self.manager.stop_signal();
        info!(queue, consumer, "subscribed");

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = sink.closed() => break,
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let Some(received) = decode_delivery(queue, &delivery) else {
                            if let Err(reject_error) = delivery
                                .acker
                                .reject(BasicRejectOptions { requeue: false })
                                .await
                            {
                                warn!(queue, error = %reject_error, "failed to reject undecodable delivery");
                            }
                            continue;
                        };

                        if sink.send(received).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(consume_error)) => {
                        warn!(queue, error = %consume_error, "delivery stream failed");
                        break;
                    }
                    None => break,
                },
            }
        }

        debug!(queue, consumer, "subscription ended");
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> AppResult<()> {
        self.manager
            .channel()
            .await?
            .basic_ack(tag.value(), BasicAckOptions::default())
            .await
            .map_err(|error| AppError::Unavailable(format!("failed to ack delivery {tag}: {error}")))
    }

    async fn reject(&self, tag: DeliveryTag) -> AppResult<()> {
        self.manager
            .channel()
            .await?
            .basic_reject(tag.value(), BasicRejectOptions { requeue: false })
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to reject delivery {tag}: {error}"))
            })
    }

    async fn inspect(&self, queue: &str) -> AppResult<QueueInspection> {
        let state = self
            .manager
            .channel()
            .await?
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to inspect queue '{queue}': {error}"))
            })?;

        Ok(QueueInspection {
            messages_waiting: state.message_count(),
            consumer_count: state.consumer_count(),
        })
    }

    fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    fn notify_status_change(&self, listener: mpsc::UnboundedSender<ConnectionStatus>) {
        self.manager.notify_status_change(listener);
    }
}

fn decode_delivery(queue: &str, delivery: &Delivery) -> Option<ReceivedMessage> {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(header_map)
        .unwrap_or_default();

    let attempt = match parse_attempt_header(&headers) {
        Ok(attempt) => attempt,
        Err(header_error) => {
            warn!(
                queue,
                tag = delivery.delivery_tag,
                error = %header_error,
                "dropping delivery with unusable attempt header"
            );
            return None;
        }
    };

    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map_or(JSON_CONTENT_TYPE, |value| value.as_str());

    Some(ReceivedMessage::new(
        Message::new(delivery.data.clone(), content_type, attempt),
        queue,
        DeliveryTag::new(delivery.delivery_tag),
    ))
}

fn header_map(table: &FieldTable) -> HashMap<String, HeaderValue> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_owned(), header_value(value)))
        .collect()
}

fn header_value(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::ShortShortInt(value) => HeaderValue::Integer(i64::from(*value)),
        AMQPValue::ShortShortUInt(value) => HeaderValue::Integer(i64::from(*value)),
        AMQPValue::ShortInt(value) => HeaderValue::Integer(i64::from(*value)),
        AMQPValue::ShortUInt(value) => HeaderValue::Integer(i64::from(*value)),
        AMQPValue::LongInt(value) => HeaderValue::Integer(i64::from(*value)),
        AMQPValue::LongUInt(value) => HeaderValue::Integer(i64::from(*value)),
        AMQPValue::LongLongInt(value) => HeaderValue::Integer(*value),
        AMQPValue::ShortString(value) => HeaderValue::Text(value.as_str().to_owned()),
        AMQPValue::LongString(value) => {
            HeaderValue::Text(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        other => HeaderValue::Other(format!("{other:?}")),
    }
}

fn lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}
