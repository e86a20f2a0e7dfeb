use std::sync::Arc;

use async_trait::async_trait;
use auditflow_core::AppResult;
use auditflow_domain::{Action, Entity, EntityType, Service};

use super::cache::CacheStore;

/// Service lookup port.
#[async_trait]
pub trait ServiceRepository: Send + Sync {
    /// Returns the service named `name`, creating it when missing.
    async fn first_or_create_by_name(&self, name: &str) -> AppResult<Service>;
}

/// Entity type lookup port.
#[async_trait]
pub trait EntityTypeRepository: Send + Sync {
    /// Returns the entity type of one service, creating it when missing.
    async fn first_or_create_by_name_and_service(
        &self,
        name: &str,
        service_id: &str,
    ) -> AppResult<EntityType>;
}

/// Entity lookup port.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// Returns the entity of one type by its external id, creating it when missing.
    async fn first_or_create_by_external_id_and_type(
        &self,
        external_id: &str,
        entity_type_id: &str,
    ) -> AppResult<Entity>;
}

/// Property lookup port.
#[async_trait]
pub trait PropertyRepository: Send + Sync {
    /// Returns the id of a named property of one entity, creating it when missing.
    async fn get_id_or_create(&self, name: &str, entity_id: &str) -> AppResult<String>;
}

/// Durable action write port.
#[async_trait]
pub trait ActionRepository: Send + Sync {
    /// Writes a fully resolved action.
    async fn create(&self, action: &Action) -> AppResult<Action>;
}

/// Every store the persister resolves against, plus the lookup cache.
#[derive(Clone)]
pub struct PersistenceStores {
    /// Service lookups.
    pub services: Arc<dyn ServiceRepository>,
    /// Entity type lookups.
    pub entity_types: Arc<dyn EntityTypeRepository>,
    /// Entity lookups.
    pub entities: Arc<dyn EntityRepository>,
    /// Property lookups.
    pub properties: Arc<dyn PropertyRepository>,
    /// Durable writes.
    pub actions: Arc<dyn ActionRepository>,
    /// Cache-aside store for service and entity lookups.
    pub cache: Arc<dyn CacheStore>,
}
