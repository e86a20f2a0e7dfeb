use async_trait::async_trait;
use auditflow_application::{
    ActionRepository, EntityRepository, EntityTypeRepository, PropertyRepository,
    ServiceRepository,
};
use auditflow_core::{AppError, AppResult};
use auditflow_domain::{Action, Entity, EntityType, ResolvedParty, Service};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

/// PostgreSQL-backed store for services, entities, properties and actions.
#[derive(Clone)]
pub struct PostgresActionStore {
    pool: PgPool,
}

impl PostgresActionStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_store_id(value: &str, field: &str) -> AppResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|error| AppError::Validation(format!("invalid {field} '{value}': {error}")))
}

fn party_ids(party: Option<&ResolvedParty>, role: &str) -> AppResult<(Uuid, Option<Uuid>)> {
    let party = party.ok_or_else(|| {
        AppError::Validation(format!("{role} must be resolved before it is written"))
    })?;
    let service_id = parse_store_id(party.service.id.as_str(), "service id")?;
    let entity_id = party
        .entity_id()
        .map(|id| parse_store_id(id, "entity id"))
        .transpose()?;

    Ok((service_id, entity_id))
}

#[async_trait]
impl ServiceRepository for PostgresActionStore {
    async fn first_or_create_by_name(&self, name: &str) -> AppResult<Service> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO services (id, name)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            AppError::Unavailable(format!("failed to resolve service '{name}': {error}"))
        })?;

        Ok(Service {
            id: id.to_string(),
            name: name.to_owned(),
        })
    }
}

#[async_trait]
impl EntityTypeRepository for PostgresActionStore {
    async fn first_or_create_by_name_and_service(
        &self,
        name: &str,
        service_id: &str,
    ) -> AppResult<EntityType> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO entity_types (id, service_id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (service_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(parse_store_id(service_id, "service id")?)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            AppError::Unavailable(format!("failed to resolve entity type '{name}': {error}"))
        })?;

        Ok(EntityType {
            id: id.to_string(),
            service_id: service_id.to_owned(),
            name: name.to_owned(),
        })
    }
}

#[async_trait]
impl EntityRepository for PostgresActionStore {
    async fn first_or_create_by_external_id_and_type(
        &self,
        external_id: &str,
        entity_type_id: &str,
    ) -> AppResult<Entity> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO entities (id, entity_type_id, external_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (entity_type_id, external_id) DO UPDATE SET external_id = EXCLUDED.external_id
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(parse_store_id(entity_type_id, "entity type id")?)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            AppError::Unavailable(format!("failed to resolve entity '{external_id}': {error}"))
        })?;

        Ok(Entity {
            id: id.to_string(),
            entity_type_id: entity_type_id.to_owned(),
            external_id: external_id.to_owned(),
        })
    }
}

#[async_trait]
impl PropertyRepository for PostgresActionStore {
    async fn get_id_or_create(&self, name: &str, entity_id: &str) -> AppResult<String> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO properties (id, entity_id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (entity_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(parse_store_id(entity_id, "entity id")?)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            AppError::Unavailable(format!("failed to resolve property '{name}': {error}"))
        })?;

        Ok(id.to_string())
    }
}

#[async_trait]
impl ActionRepository for PostgresActionStore {
    async fn create(&self, action: &Action) -> AppResult<Action> {
        let (actor_service_id, actor_entity_id) = party_ids(action.resolved_actor(), "actor")?;
        let (target_service_id, target_entity_id) =
            party_ids(action.resolved_target(), "target")?;
        let details = serde_json::to_string(action.details()).map_err(|error| {
            AppError::Internal(format!("failed to encode action details: {error}"))
        })?;

        let mut transaction =
            self.pool.begin().await.map_err(|error| {
                AppError::Unavailable(format!("failed to begin transaction: {error}"))
            })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO actions (
                uid,
                parent_uid,
                name,
                hash,
                actor_service_id,
                actor_entity_id,
                target_service_id,
                target_entity_id,
                status,
                status_code,
                is_async,
                emitted_at,
                registered_at,
                details
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14::jsonb)
            ON CONFLICT (uid) DO NOTHING
            "#,
        )
        .bind(action.uid().as_str())
        .bind(action.parent_uid().map(|uid| uid.as_str()))
        .bind(action.name().as_str())
        .bind(action.hash())
        .bind(actor_service_id)
        .bind(actor_entity_id)
        .bind(target_service_id)
        .bind(target_entity_id)
        .bind(action.status().as_str())
        .bind(action.status().code())
        .bind(action.is_async())
        .bind(action.emitted_at())
        .bind(action.registered_at())
        .bind(details)
        .execute(&mut *transaction)
        .await
        .map_err(|error| AppError::Unavailable(format!("failed to write action: {error}")))?;

        if inserted.rows_affected() == 0 {
            debug!(action_uid = %action.uid(), "action already stored");
            transaction.rollback().await.map_err(|error| {
                AppError::Unavailable(format!("failed to roll back transaction: {error}"))
            })?;
            return Ok(action.clone());
        }

        for change in action.changes() {
            let property_id = change.property_id.as_deref().ok_or_else(|| {
                AppError::Validation(format!(
                    "property '{}' must be resolved before it is written",
                    change.property_name
                ))
            })?;

            sqlx::query(
                r#"
                INSERT INTO action_property_changes (
                    action_uid,
                    property_id,
                    from_value,
                    to_value,
                    current_data_type
                )
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(action.uid().as_str())
            .bind(parse_store_id(property_id, "property id")?)
            .bind(change.from.as_deref())
            .bind(change.to.as_deref())
            .bind(change.current_data_type.as_deref())
            .execute(&mut *transaction)
            .await
            .map_err(|error| {
                AppError::Unavailable(format!(
                    "failed to write change of property '{}': {error}",
                    change.property_name
                ))
            })?;
        }

        transaction.commit().await.map_err(|error| {
            AppError::Unavailable(format!("failed to commit transaction: {error}"))
        })?;

        Ok(action.clone())
    }
}
