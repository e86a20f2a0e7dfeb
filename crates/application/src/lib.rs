//! Application services and ports.

#![forbid(unsafe_code)]

mod action_consumer;
mod action_flow;
mod action_persister;
mod action_receiver;
mod queue_ports;
mod store_ports;

#[cfg(test)]
mod test_support;

pub use action_consumer::{ActionConsumer, ConsumerExit, ConsumerStats};
pub use action_flow::{ActionFlow, FlowConfig, FlowError, FlowState, FlowStatus, ReceivedAction};
pub use action_persister::{
    ActionPersister, PersistenceResult, PersistenceStage, PersisterConfig,
};
pub use action_receiver::{ActionReceiver, DEDUP_WINDOW, ReceiveError, Registration, content_hash};
pub use queue_ports::{
    ATTEMPT_HEADER, Attempt, AttemptHeaderError, ConnectionStatus, DeliveryTag, ExchangeKind,
    HeaderValue, JSON_CONTENT_TYPE, Message, QueueInspection, QueueTransport, ReceivedMessage,
    parse_attempt_header,
};
pub use store_ports::{
    ActionRepository, CacheStore, EntityRepository, EntityTypeRepository, PersistenceStores,
    PropertyRepository, ServiceRepository, remember,
};
