use auditflow_domain::Action;

use super::FlowError;
use crate::queue_ports::{Attempt, DeliveryTag, Message, ReceivedMessage};

/// A delivered message viewed as an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedAction {
    received: ReceivedMessage,
}

impl ReceivedAction {
    /// Wraps a received message.
    #[must_use]
    pub fn new(received: ReceivedMessage) -> Self {
        Self { received }
    }

    /// Decodes and validates the carried action.
    pub fn action(&self) -> Result<Action, FlowError> {
        let action = serde_json::from_slice::<Action>(self.received.message().body())
            .map_err(|error| FlowError::Serialization(error.to_string()))?;
        action.validate()?;

        Ok(action)
    }

    /// Returns the delivery tag.
    #[must_use]
    pub fn tag(&self) -> DeliveryTag {
        self.received.delivery_tag()
    }

    /// Returns the delivery attempt.
    #[must_use]
    pub fn attempt(&self) -> Attempt {
        self.received.message().attempt()
    }

    /// Returns the queue the action came from.
    #[must_use]
    pub fn origin_queue(&self) -> &str {
        self.received.origin_queue()
    }

    /// Returns the delivered message.
    #[must_use]
    pub fn message(&self) -> &Message {
        self.received.message()
    }

    /// Returns a copy of the message with the next attempt.
    #[must_use]
    pub fn clone_to_requeue(&self) -> Message {
        self.received.message().next_attempt()
    }
}
