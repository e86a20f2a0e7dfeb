use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use auditflow_core::{AppError, AppResult};
use auditflow_domain::{Action, ActionParty, ResolvedParty};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::result::PersistenceStage;
use crate::store_ports::{PersistenceStores, remember};

/// Resolves action references against the stores, one stage at a time.
pub(crate) struct StageResolver {
    stores: PersistenceStores,
    service_cache_ttl: Duration,
    entity_cache_ttl: Duration,
}

impl StageResolver {
    pub(crate) fn new(
        stores: PersistenceStores,
        service_cache_ttl: Duration,
        entity_cache_ttl: Duration,
    ) -> Self {
        Self {
            stores,
            service_cache_ttl,
            entity_cache_ttl,
        }
    }

    pub(crate) async fn apply(&self, stage: PersistenceStage, action: &mut Action) -> AppResult<()> {
        match stage {
            PersistenceStage::Admission => Ok(()),
            PersistenceStage::Actor => {
                let actor = self.resolve_party(action.actor()).await?;
                action.assign_actor(actor);
                Ok(())
            }
            PersistenceStage::Target => {
                let target = self.resolve_party(action.target()).await?;
                action.assign_target(target);
                Ok(())
            }
            PersistenceStage::Properties => self.resolve_properties(action).await,
            PersistenceStage::Write => self.stores.actions.create(action).await.map(|_| ()),
        }
    }

    async fn resolve_party(&self, party: &ActionParty) -> AppResult<ResolvedParty> {
        let cache = self.stores.cache.as_ref();
        let service_name = party.service.as_str();

        let service = remember(
            cache,
            format!("service:{service_name}").as_str(),
            self.service_cache_ttl,
            || self.stores.services.first_or_create_by_name(service_name),
        )
        .await?;

        let Some(entity) = &party.entity else {
            return Ok(ResolvedParty {
                service,
                entity_type: None,
                entity: None,
            });
        };

        let entity_type = remember(
            cache,
            format!("entity_type:{}:{}", service.id, entity.entity_type).as_str(),
            self.entity_cache_ttl,
            || {
                self.stores
                    .entity_types
                    .first_or_create_by_name_and_service(entity.entity_type.as_str(), &service.id)
            },
        )
        .await?;

        let resolved_entity = remember(
            cache,
            format!("entity:{}:{}", entity_type.id, entity.external_id).as_str(),
            self.entity_cache_ttl,
            || {
                self.stores
                    .entities
                    .first_or_create_by_external_id_and_type(
                        entity.external_id.as_str(),
                        &entity_type.id,
                    )
            },
        )
        .await?;

        Ok(ResolvedParty {
            service,
            entity_type: Some(entity_type),
            entity: Some(resolved_entity),
        })
    }

    async fn resolve_properties(&self, action: &mut Action) -> AppResult<()> {
        let names = action.changed_property_names();
        if names.is_empty() {
            return Ok(());
        }

        let entity_id = action
            .resolved_target()
            .and_then(ResolvedParty::entity_id)
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "action '{}' changes properties without a target entity",
                    action.uid()
                ))
            })?
            .to_owned();

        let mut lookups = JoinSet::new();
        for name in names {
            let properties = Arc::clone(&self.stores.properties);
            let entity_id = entity_id.clone();
            lookups.spawn(async move {
                let id = properties
                    .get_id_or_create(name.as_str(), entity_id.as_str())
                    .await;
                (name, id)
            });
        }

        let mut property_ids = HashMap::new();
        while let Some(joined) = lookups.join_next().await {
            let (name, id) = joined.map_err(|error| {
                AppError::Internal(format!("property lookup task failed: {error}"))
            })?;
            let id = id?;

            if !is_uuid_v4(id.as_str()) {
                return Err(AppError::Internal(format!(
                    "property '{name}' resolved to '{id}', which is not a v4 uuid"
                )));
            }
            property_ids.insert(name, id);
        }

        action.assign_property_ids(&property_ids)
    }
}

fn is_uuid_v4(value: &str) -> bool {
    Uuid::parse_str(value)
        .map(|uuid| uuid.get_version_num() == 4)
        .unwrap_or(false)
}
