use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use auditflow_application::{
    ActionRepository, EntityRepository, EntityTypeRepository, PropertyRepository,
    ServiceRepository,
};
use auditflow_core::{AppError, AppResult};
use auditflow_domain::{Action, ActionUid, Entity, EntityType, Service};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    services: HashMap<String, Service>,
    entity_types: HashMap<(String, String), EntityType>,
    entities: HashMap<(String, String), Entity>,
    properties: HashMap<(String, String), String>,
    actions: Vec<Action>,
}

/// In-memory store implementing every persistence port.
#[derive(Default)]
pub struct InMemoryActionStore {
    tables: Mutex<Tables>,
}

impl InMemoryActionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every written action in write order.
    #[must_use]
    pub fn actions(&self) -> Vec<Action> {
        self.lock().actions.clone()
    }

    /// Returns one written action.
    #[must_use]
    pub fn find_action(&self, uid: &ActionUid) -> Option<Action> {
        self.lock()
            .actions
            .iter()
            .find(|action| action.uid() == uid)
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[async_trait]
impl ServiceRepository for InMemoryActionStore {
    async fn first_or_create_by_name(&self, name: &str) -> AppResult<Service> {
        Ok(self
            .lock()
            .services
            .entry(name.to_owned())
            .or_insert_with(|| Service {
                id: new_id(),
                name: name.to_owned(),
            })
            .clone())
    }
}

#[async_trait]
impl EntityTypeRepository for InMemoryActionStore {
    async fn first_or_create_by_name_and_service(
        &self,
        name: &str,
        service_id: &str,
    ) -> AppResult<EntityType> {
        let mut tables = self.lock();
        if !tables
            .services
            .values()
            .any(|service| service.id == service_id)
        {
            return Err(AppError::NotFound(format!(
                "service '{service_id}' does not exist"
            )));
        }

        Ok(tables
            .entity_types
            .entry((service_id.to_owned(), name.to_owned()))
            .or_insert_with(|| EntityType {
                id: new_id(),
                service_id: service_id.to_owned(),
                name: name.to_owned(),
            })
            .clone())
    }
}

#[async_trait]
impl EntityRepository for InMemoryActionStore {
    async fn first_or_create_by_external_id_and_type(
        &self,
        external_id: &str,
        entity_type_id: &str,
    ) -> AppResult<Entity> {
        let mut tables = self.lock();
        if !tables
            .entity_types
            .values()
            .any(|entity_type| entity_type.id == entity_type_id)
        {
            return Err(AppError::NotFound(format!(
                "entity type '{entity_type_id}' does not exist"
            )));
        }

        Ok(tables
            .entities
            .entry((entity_type_id.to_owned(), external_id.to_owned()))
            .or_insert_with(|| Entity {
                id: new_id(),
                entity_type_id: entity_type_id.to_owned(),
                external_id: external_id.to_owned(),
            })
            .clone())
    }
}

#[async_trait]
impl PropertyRepository for InMemoryActionStore {
    async fn get_id_or_create(&self, name: &str, entity_id: &str) -> AppResult<String> {
        let mut tables = self.lock();
        if !tables.entities.values().any(|entity| entity.id == entity_id) {
            return Err(AppError::NotFound(format!(
                "entity '{entity_id}' does not exist"
            )));
        }

        Ok(tables
            .properties
            .entry((entity_id.to_owned(), name.to_owned()))
            .or_insert_with(new_id)
            .clone())
    }
}

#[async_trait]
impl ActionRepository for InMemoryActionStore {
    async fn create(&self, action: &Action) -> AppResult<Action> {
        if action.resolved_actor().is_none() || action.resolved_target().is_none() {
            return Err(AppError::Validation(format!(
                "action '{}' must be resolved before it is written",
                action.uid()
            )));
        }
        if let Some(change) = action
            .changes()
            .iter()
            .find(|change| change.property_id.is_none())
        {
            return Err(AppError::Validation(format!(
                "property '{}' must be resolved before it is written",
                change.property_name
            )));
        }

        let mut tables = self.lock();
        if !tables
            .actions
            .iter()
            .any(|stored| stored.uid() == action.uid())
        {
            tables.actions.push(action.clone());
        }

        Ok(action.clone())
    }
}
