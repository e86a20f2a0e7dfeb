//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod amqp_connection_manager;
mod amqp_queue_transport;
mod in_memory_action_store;
mod in_memory_cache_store;
mod in_memory_queue_transport;
mod postgres_action_store;
mod redis_cache_store;
mod retry;

#[cfg(test)]
mod test_fixtures;

pub use amqp_connection_manager::{AmqpConnectionConfig, AmqpConnectionManager};
pub use amqp_queue_transport::AmqpQueueTransport;
pub use in_memory_action_store::InMemoryActionStore;
pub use in_memory_cache_store::InMemoryCacheStore;
pub use in_memory_queue_transport::{InMemoryQueueTransport, PublishedMessage, RawDelivery};
pub use postgres_action_store::PostgresActionStore;
pub use redis_cache_store::RedisCacheStore;
pub use retry::{Backoff, retry_with_backoff};
