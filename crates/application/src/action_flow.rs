use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use auditflow_core::{AppError, AppResult};
use auditflow_domain::Action;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::queue_ports::{ExchangeKind, Message, QueueTransport};

mod received;
mod state;


pub use received::ReceivedAction;
pub use state::{FlowState, FlowStatus};

/// Errors returned by action flow operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlowError {
    /// The action ran out of requeue attempts.
    #[error("action reached attempt {attempt}, more than the {max} allowed")]
    TooManyAttempts {
        /// The attempt the requeue would have produced.
        attempt: u32,
        /// Configured requeue ceiling.
        max: u32,
    },

    /// The action body could not be encoded or decoded.
    #[error("action serialization failed: {0}")]
    Serialization(String),

    /// Transport or validation failure.
    #[error(transparent)]
    App(#[from] AppError),
}

/// Broker topology and retry settings of one action flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    /// Exchange every action is published to.
    pub exchange: String,
    /// Routing kind of the exchange.
    pub exchange_kind: ExchangeKind,
    /// Primary action queue.
    pub queue: String,
    /// Routing key of the primary queue.
    pub routing_key: String,
    /// Queue receiving requeued actions.
    pub error_queue: String,
    /// Routing key of requeued actions.
    pub requeue_routing_key: String,
    /// Queue receiving actions that ran out of attempts.
    pub dead_letter_queue: String,
    /// Routing key of exhausted actions.
    pub dead_letter_routing_key: String,
    /// Highest attempt a requeue may produce.
    pub max_requeue: u32,
    /// Capacity of each receive channel.
    pub receive_buffer: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            exchange: "auditflow.actions".to_owned(),
            exchange_kind: ExchangeKind::Direct,
            queue: "actions".to_owned(),
            routing_key: "actions".to_owned(),
            error_queue: "actions.retry".to_owned(),
            requeue_routing_key: "actions.retry".to_owned(),
            dead_letter_queue: "actions.dead".to_owned(),
            dead_letter_routing_key: "actions.dead".to_owned(),
            max_requeue: 5,
            receive_buffer: 64,
        }
    }
}

impl FlowConfig {
    /// Validates names and bounds.
    pub fn validate(&self) -> AppResult<()> {
        for (field, value) in [
            ("exchange", &self.exchange),
            ("queue", &self.queue),
            ("routing_key", &self.routing_key),
            ("error_queue", &self.error_queue),
            ("requeue_routing_key", &self.requeue_routing_key),
            ("dead_letter_queue", &self.dead_letter_queue),
            ("dead_letter_routing_key", &self.dead_letter_routing_key),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "flow {field} must not be empty"
                )));
            }
        }

        if self.max_requeue == 0 {
            return Err(AppError::Validation(
                "flow max_requeue must be greater than zero".to_owned(),
            ));
        }

        if self.receive_buffer == 0 {
            return Err(AppError::Validation(
                "flow receive_buffer must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Typed action messaging on top of a queue transport.
#[derive(Clone)]
pub struct ActionFlow {
    inner: Arc<FlowInner>,
}

struct FlowInner {
    transport: Arc<dyn QueueTransport>,
    config: FlowConfig,
    state: Mutex<FlowState>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<FlowState>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ActionFlow {
    /// Creates an action flow after validating its configuration.
    pub fn new(transport: Arc<dyn QueueTransport>, config: FlowConfig) -> AppResult<Self> {
        config.validate()?;
        let state = FlowState::from(transport.status());

        Ok(Self {
            inner: Arc::new(FlowInner {
                transport,
                config,
                state: Mutex::new(state),
                listeners: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the flow configuration.
    #[must_use]
    pub fn config(&self) -> &FlowConfig {
        &self.inner.config
    }

    /// Publishes a new action with attempt one.
    pub async fn send(&self, action: &Action) -> Result<(), FlowError> {
        let body = serde_json::to_vec(action)
            .map_err(|error| FlowError::Serialization(error.to_string()))?;
        let config = &self.inner.config;

        self.inner
            .transport
            .publish(
                &Message::json(body),
                config.exchange.as_str(),
                config.routing_key.as_str(),
            )
            .await?;

        debug!(action_uid = %action.uid(), "action sent");
        Ok(())
    }

    /// Subscribes to one queue and returns the stream of received actions.
    ///
    /// The stream closes when the underlying subscription ends, which also stops the flow.
    pub fn receive(&self, queue: &str, consumer: &str) -> mpsc::Receiver<ReceivedAction> {
        let buffer = self.inner.config.receive_buffer;
        let (raw_sender, mut raw_receiver) = mpsc::channel(buffer);
        let (sender, receiver) = mpsc::channel(buffer);

        let transport = Arc::clone(&self.inner.transport);
        let queue_name = queue.to_owned();
        let consumer_name = consumer.to_owned();
        tokio::spawn(async move {
            if let Err(error) = transport
                .subscribe(queue_name.as_str(), consumer_name.as_str(), raw_sender)
                .await
            {
                warn!(queue = %queue_name, consumer = %consumer_name, error = %error, "subscription failed");
            }
        });

        let flow = self.clone();
        let queue_name = queue.to_owned();
        tokio::spawn(async move {
            while let Some(message) = raw_receiver.recv().await {
                if sender.send(ReceivedAction::new(message)).await.is_err() {
                    break;
                }
            }

            info!(queue = %queue_name, "receive stream ended");
            flow.stop();
        });

        receiver
    }

    /// Rejects the delivery and republishes it with the next attempt.
    ///
    /// Returns [`FlowError::TooManyAttempts`] without publishing once the next
    /// attempt would exceed `max_requeue`.
    pub async fn requeue(&self, received: &ReceivedAction) -> Result<(), FlowError> {
        let config = &self.inner.config;
        self.inner.transport.reject(received.tag()).await?;

        let message = received.clone_to_requeue();
        let attempt = message.attempt().get();
        if attempt > config.max_requeue {
            return Err(FlowError::TooManyAttempts {
                attempt,
                max: config.max_requeue,
            });
        }

        self.inner
            .transport
            .publish(
                &message,
                config.exchange.as_str(),
                config.requeue_routing_key.as_str(),
            )
            .await?;

        debug!(attempt, queue = %received.origin_queue(), "action requeued");
        Ok(())
    }

    /// Publishes an exhausted action to the dead-letter route.
    pub async fn dead_letter(&self, received: &ReceivedAction) -> Result<(), FlowError> {
        let config = &self.inner.config;
        self.inner
            .transport
            .publish(
                received.message(),
                config.exchange.as_str(),
                config.dead_letter_routing_key.as_str(),
            )
            .await?;

        Ok(())
    }

    /// Acknowledges the delivery of a received action.
    pub async fn ack(&self, received: &ReceivedAction) -> Result<(), FlowError> {
        Ok(self.inner.transport.ack(received.tag()).await?)
    }

    /// Rejects the delivery of a received action without requeueing it.
    pub async fn reject(&self, received: &ReceivedAction) -> Result<(), FlowError> {
        Ok(self.inner.transport.reject(received.tag()).await?)
    }

    /// Declares the exchange, queues and bindings of this flow.
    pub async fn scaffold(&self) -> AppResult<()> {
        let config = &self.inner.config;
        let transport = &self.inner.transport;

        transport
            .declare_exchange(config.exchange.as_str(), config.exchange_kind)
            .await?;
        debug!(exchange = %config.exchange, kind = config.exchange_kind.as_str(), "exchange declared");

        let routes = [
            (&config.queue, &config.routing_key),
            (&config.error_queue, &config.requeue_routing_key),
            (&config.dead_letter_queue, &config.dead_letter_routing_key),
        ];

        // A route sharing an earlier route's queue is not bound a second time.
        let mut declared: Vec<&str> = Vec::with_capacity(routes.len());
        for (queue, routing_key) in routes {
            if declared.contains(&queue.as_str()) {
                if routing_key != &config.routing_key {
                    warn!(
                        queue = %queue,
                        routing_key = %routing_key,
                        "route shares an already scaffolded queue and stays unbound"
                    );
                }
                continue;
            }

            transport.declare_queue(queue.as_str()).await?;
            transport
                .bind(queue.as_str(), config.exchange.as_str(), routing_key.as_str())
                .await?;
            declared.push(queue.as_str());
        }

        info!(exchange = %config.exchange, queues = declared.len(), "action flow scaffolded");
        Ok(())
    }

    /// Starts mirroring connection status changes into flow state.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.inner.transport.notify_status_change(sender);
        self.inner
            .update_state(FlowState::from(self.inner.transport.status()));

        let inner: Weak<FlowInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(status) = receiver.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.update_state(FlowState::from(status));
            }
        });
    }

    /// Closes every state listener. Later calls do nothing.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let closed = {
            let mut listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *listeners).len()
        };
        info!(listeners = closed, "action flow stopped");
    }

    /// Returns the current flow state.
    #[must_use]
    pub fn state(&self) -> FlowState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the flow state with the depth of the primary queue.
    pub async fn inspect(&self) -> AppResult<FlowStatus> {
        let inspection = self
            .inner
            .transport
            .inspect(self.inner.config.queue.as_str())
            .await?;

        Ok(FlowStatus {
            state: self.state(),
            messages_waiting: inspection.messages_waiting,
            consumer_count: inspection.consumer_count,
        })
    }

    /// Registers a listener receiving every later state transition.
    ///
    /// A listener registered after [`ActionFlow::stop`] is closed immediately.
    pub fn notify_on_state_change(&self, listener: mpsc::UnboundedSender<FlowState>) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}

impl FlowInner {
    fn update_state(&self, next: FlowState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == next {
            return;
        }
        *state = next;

        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|listener| listener.send(next).is_ok());
        debug!(state = next.as_str(), "action flow state changed");
    }
}
