//! Actor/target references and their resolved store records.

use auditflow_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Entity reference as emitted by a producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    /// Entity type name inside the owning service.
    pub entity_type: String,
    /// Producer-side identifier of the entity.
    pub external_id: String,
}

impl EntityRef {
    /// Creates an entity reference.
    #[must_use]
    pub fn new(entity_type: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            external_id: external_id.into(),
        }
    }
}

/// Actor or target of an action: a service and optionally one of its entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionParty {
    /// Owning service name.
    pub service: String,
    /// Entity inside the service, when the party is narrower than the service.
    #[serde(default)]
    pub entity: Option<EntityRef>,
}

impl ActionParty {
    /// Creates a party reference.
    #[must_use]
    pub fn new(service: impl Into<String>, entity: Option<EntityRef>) -> Self {
        Self {
            service: service.into(),
            entity,
        }
    }

    pub(crate) fn validate(&self, role: &str) -> AppResult<()> {
        if self.service.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "{role} service must not be empty"
            )));
        }

        if let Some(entity) = &self.entity {
            if entity.entity_type.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "{role} entity type must not be empty"
                )));
            }
            if entity.external_id.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "{role} entity external id must not be empty"
                )));
            }
        }

        Ok(())
    }
}

/// Stored service record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Store identifier.
    pub id: String,
    /// Unique service name.
    pub name: String,
}

/// Stored entity type record, unique per service and name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityType {
    /// Store identifier.
    pub id: String,
    /// Owning service identifier.
    pub service_id: String,
    /// Type name.
    pub name: String,
}

/// Stored entity record, unique per type and external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Store identifier.
    pub id: String,
    /// Owning entity type identifier.
    pub entity_type_id: String,
    /// Producer-side identifier.
    pub external_id: String,
}

/// A party after its references were resolved against the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedParty {
    /// Resolved service.
    pub service: Service,
    /// Resolved entity type, if the party named an entity.
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    /// Resolved entity, if the party named an entity.
    #[serde(default)]
    pub entity: Option<Entity>,
}

impl ResolvedParty {
    /// Returns the resolved entity id, if any.
    #[must_use]
    pub fn entity_id(&self) -> Option<&str> {
        self.entity.as_ref().map(|entity| entity.id.as_str())
    }
}
