use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use auditflow_application::{
    ATTEMPT_HEADER, ConnectionStatus, DeliveryTag, ExchangeKind, HeaderValue, Message,
    QueueInspection, QueueTransport, ReceivedMessage, parse_attempt_header,
};
use auditflow_core::{AppError, AppResult};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

/// Message as it sits in an in-memory queue, headers undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    /// Message body.
    pub body: Vec<u8>,
    /// Content type property.
    pub content_type: String,
    /// Delivery headers.
    pub headers: HashMap<String, HeaderValue>,
}

/// One recorded publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Target exchange.
    pub exchange: String,
    /// Routing key used.
    pub routing_key: String,
    /// Published message.
    pub message: Message,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<RawDelivery>,
    consumers: u32,
}

#[derive(Default)]
struct Broker {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: BTreeSet<(String, String, String)>,
    unsettled: HashMap<DeliveryTag, String>,
    next_tag: u64,
    published: Vec<PublishedMessage>,
    acked: Vec<DeliveryTag>,
    rejected: Vec<DeliveryTag>,
    failing_publishes: u32,
    status: ConnectionStatus,
    listeners: Vec<mpsc::UnboundedSender<ConnectionStatus>>,
}

/// Broker-less queue transport.
///
/// Exchanges route by exact routing key (fanout exchanges reach every bound
/// queue). Every publish, ack and reject is recorded for inspection.
pub struct InMemoryQueueTransport {
    broker: Mutex<Broker>,
    activity: Notify,
}

impl Default for InMemoryQueueTransport {
    fn default() -> Self {
        Self {
            broker: Mutex::new(Broker {
                status: ConnectionStatus::Connected,
                ..Broker::default()
            }),
            activity: Notify::new(),
        }
    }
}

impl InMemoryQueueTransport {
    /// Creates a connected transport without topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a raw delivery straight into `queue`, bypassing exchanges.
    pub fn inject(&self, queue: &str, delivery: RawDelivery) -> AppResult<()> {
        {
            let mut broker = self.lock();
            let state = broker
                .queues
                .get_mut(queue)
                .ok_or_else(|| AppError::NotFound(format!("queue '{queue}' is not declared")))?;
            state.ready.push_back(delivery);
        }
        self.activity.notify_waiters();
        Ok(())
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().failing_publishes = count;
    }

    /// Changes the connection status and notifies listeners.
    pub fn set_status(&self, status: ConnectionStatus) {
        {
            let mut broker = self.lock();
            if broker.status != status {
                broker.status = status;
                broker
                    .listeners
                    .retain(|listener| listener.send(status).is_ok());
            }
        }
        self.activity.notify_waiters();
    }

    /// Returns every publish in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Returns acknowledged tags in order.
    #[must_use]
    pub fn acked(&self) -> Vec<DeliveryTag> {
        self.lock().acked.clone()
    }

    /// Returns rejected tags in order.
    #[must_use]
    pub fn rejected(&self) -> Vec<DeliveryTag> {
        self.lock().rejected.clone()
    }

    /// Returns `(queue, exchange, routing_key)` bindings.
    #[must_use]
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.lock().bindings.iter().cloned().collect()
    }

    /// Returns declared queue names.
    #[must_use]
    pub fn queues(&self) -> BTreeSet<String> {
        self.lock().queues.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Broker> {
        self.broker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_delivery(&self, queue: &str) -> NextDelivery {
        let mut broker = self.lock();
        if broker.status != ConnectionStatus::Connected {
            return NextDelivery::Closed;
        }

        let Some(raw) = broker
            .queues
            .get_mut(queue)
            .and_then(|state| state.ready.pop_front())
        else {
            return NextDelivery::Empty;
        };

        broker.next_tag += 1;
        let tag = DeliveryTag::new(broker.next_tag);
        match parse_attempt_header(&raw.headers) {
            Ok(attempt) => {
                broker.unsettled.insert(tag, queue.to_owned());
                NextDelivery::Ready(ReceivedMessage::new(
                    Message::new(raw.body, raw.content_type, attempt),
                    queue,
                    tag,
                ))
            }
            Err(header_error) => {
                warn!(queue, tag = %tag, error = %header_error, "dropping delivery with unusable attempt header");
                broker.rejected.push(tag);
                NextDelivery::Dropped
            }
        }
    }

    fn settle(&self, tag: DeliveryTag, acked: bool) -> AppResult<()> {
        let mut broker = self.lock();
        if broker.unsettled.remove(&tag).is_none() {
            return Err(AppError::NotFound(format!(
                "delivery {tag} is unknown or already settled"
            )));
        }

        if acked {
            broker.acked.push(tag);
        } else {
            broker.rejected.push(tag);
        }
        Ok(())
    }
}

enum NextDelivery {
    Ready(ReceivedMessage),
    Dropped,
    Empty,
    Closed,
}

#[async_trait]
impl QueueTransport for InMemoryQueueTransport {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> AppResult<()> {
        let mut broker = self.lock();
        match broker.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(AppError::Conflict(format!(
                "exchange '{name}' already declared as {}",
                existing.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                broker.exchanges.insert(name.to_owned(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> AppResult<()> {
        self.lock().queues.entry(name.to_owned()).or_default();
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> AppResult<()> {
        let mut broker = self.lock();
        if !broker.queues.contains_key(queue) {
            return Err(AppError::NotFound(format!("queue '{queue}' is not declared")));
        }
        if !broker.exchanges.contains_key(exchange) {
            return Err(AppError::NotFound(format!(
                "exchange '{exchange}' is not declared"
            )));
        }

        broker.bindings.insert((
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        message: &Message,
        exchange: &str,
        routing_key: &str,
    ) -> AppResult<()> {
        {
            let mut broker = self.lock();
            if broker.failing_publishes > 0 {
                broker.failing_publishes -= 1;
                return Err(AppError::Unavailable("scripted publish failure".to_owned()));
            }
            if broker.status != ConnectionStatus::Connected {
                return Err(AppError::Unavailable(format!(
                    "transport is {}",
                    broker.status.as_str()
                )));
            }
            let Some(kind) = broker.exchanges.get(exchange).copied() else {
                return Err(AppError::NotFound(format!(
                    "exchange '{exchange}' is not declared"
                )));
            };

            let targets: Vec<String> = broker
                .bindings
                .iter()
                .filter(|(_, bound_exchange, bound_key)| {
                    bound_exchange == exchange
                        && (kind == ExchangeKind::Fanout || bound_key == routing_key)
                })
                .map(|(queue, _, _)| queue.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if targets.is_empty() {
                debug!(exchange, routing_key, "message is unroutable");
            }

            let delivery = RawDelivery {
                body: message.body().to_vec(),
                content_type: message.content_type().to_owned(),
                headers: HashMap::from([(
                    ATTEMPT_HEADER.to_owned(),
                    HeaderValue::Integer(i64::from(message.attempt().get())),
                )]),
            };
            for queue in targets {
                if let Some(state) = broker.queues.get_mut(queue.as_str()) {
                    state.ready.push_back(delivery.clone());
                }
            }

            broker.published.push(PublishedMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                message: message.clone(),
            });
        }

        self.activity.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer: &str,
        sink: mpsc::Sender<ReceivedMessage>,
    ) -> AppResult<()> {
        {
            let mut broker = self.lock();
            let state = broker
                .queues
                .get_mut(queue)
                .ok_or_else(|| AppError::NotFound(format!("queue '{queue}' is not declared")))?;
            state.consumers += 1;
        }
        debug!(queue, consumer, "subscribed");

        loop {
            let activity = self.activity.notified();
            match self.next_delivery(queue) {
                NextDelivery::Ready(received) => {
                    if sink.send(received).await.is_err() {
                        break;
                    }
                }
                NextDelivery::Dropped => {}
                NextDelivery::Closed => break,
                NextDelivery::Empty => {
                    tokio::select! {
                        () = activity => {}
                        () = sink.closed() => break,
                    }
                }
            }
        }

        if let Some(state) = self.lock().queues.get_mut(queue) {
            state.consumers = state.consumers.saturating_sub(1);
        }
        debug!(queue, consumer, "subscription ended");
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> AppResult<()> {
        self.settle(tag, true)
    }

    async fn reject(&self, tag: DeliveryTag) -> AppResult<()> {
        self.settle(tag, false)
    }

    async fn inspect(&self, queue: &str) -> AppResult<QueueInspection> {
        let broker = self.lock();
        let state = broker
            .queues
            .get(queue)
            .ok_or_else(|| AppError::NotFound(format!("queue '{queue}' is not declared")))?;

        Ok(QueueInspection {
            messages_waiting: u32::try_from(state.ready.len()).unwrap_or(u32::MAX),
            consumer_count: state.consumers,
        })
    }

    fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    fn notify_status_change(&self, listener: mpsc::UnboundedSender<ConnectionStatus>) {
        self.lock().listeners.push(listener);
    }
}
