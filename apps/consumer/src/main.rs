//! Auditflow consumer runtime.

#![forbid(unsafe_code)]

mod consumer_config;
mod health;

use std::sync::Arc;

use auditflow_application::{
    ActionConsumer, ActionFlow, ActionPersister, CacheStore, ConsumerExit, PersistenceStores,
};
use auditflow_core::{AppError, AppResult};
use auditflow_infrastructure::{
    AmqpConnectionManager, AmqpQueueTransport, InMemoryCacheStore, PostgresActionStore,
    RedisCacheStore,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::consumer_config::ConsumerConfig;
use crate::health::serve_health;

const CACHE_KEY_PREFIX: &str = "auditflow";

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ConsumerConfig::load()?;

    let manager = Arc::new(AmqpConnectionManager::new(config.amqp.clone()));
    manager.connect(config.amqp.connect_timeout).await?;
    let maintenance = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.maintain().await }
    });

    let flow = ActionFlow::new(
        Arc::new(AmqpQueueTransport::new(Arc::clone(&manager))),
        config.flow.clone(),
    )?;
    flow.scaffold().await?;

    let pool = connect_pool(config.database_url.as_str()).await?;
    let store = Arc::new(PostgresActionStore::new(pool));
    let persister = ActionPersister::new(
        PersistenceStores {
            services: store.clone(),
            entity_types: store.clone(),
            entities: store.clone(),
            properties: store.clone(),
            actions: store,
            cache: build_cache(config.redis_url.as_deref())?,
        },
        config.persister.clone(),
    )?;
    let consumer = ActionConsumer::new(flow, persister);

    let (shutdown, signal) = watch::channel(false);
    let health = tokio::spawn(serve_health(
        config.health_port,
        consumer.clone(),
        signal.clone(),
    ));

    info!(
        consumer = %config.consumer_name,
        exchange = %config.flow.exchange,
        max_events = config.persister.max_events,
        stage_workers = config.persister.stage_workers,
        health_port = config.health_port,
        "auditflow-consumer started"
    );

    let queues = config.queues();
    let consumer_name = config.consumer_name.clone();
    let mut consuming = tokio::spawn(async move {
        consumer
            .start(queues.as_slice(), consumer_name.as_str(), signal)
            .await
    });

    let joined = tokio::select! {
        joined = &mut consuming => joined,
        () = shutdown_signal() => {
            info!("shutdown requested");
            let _ = shutdown.send(true);
            consuming.await
        }
    };

    let _ = shutdown.send(true);
    manager.stop().await;

    match maintenance.await {
        Ok(Ok(())) => {}
        Ok(Err(maintain_error)) => warn!(error = %maintain_error, "broker connection gave up"),
        Err(join_error) => error!(error = %join_error, "connection maintenance task failed"),
    }
    match health.await {
        Ok(Ok(())) => {}
        Ok(Err(health_error)) => warn!(error = %health_error, "health endpoint stopped with an error"),
        Err(join_error) => error!(error = %join_error, "health endpoint task failed"),
    }

    match joined {
        Ok(Ok(ConsumerExit::Interrupted)) => {
            info!("auditflow-consumer stopped");
            Ok(())
        }
        Ok(Ok(ConsumerExit::ConnectionLost)) => Err(AppError::Unavailable(
            "broker connection lost".to_owned(),
        )),
        Ok(Err(consumer_error)) => Err(consumer_error),
        Err(join_error) => Err(AppError::Internal(format!(
            "consumer task failed: {join_error}"
        ))),
    }
}

async fn shutdown_signal() {
    if let Err(signal_error) = tokio::signal::ctrl_c().await {
        error!(error = %signal_error, "failed to listen for the interrupt signal");
        std::future::pending::<()>().await;
    }
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

fn build_cache(redis_url: Option<&str>) -> AppResult<Arc<dyn CacheStore>> {
    match redis_url {
        Some(redis_url) => {
            let client = redis::Client::open(redis_url)
                .map_err(|error| AppError::Validation(format!("invalid REDIS_URL: {error}")))?;
            Ok(Arc::new(RedisCacheStore::new(client, CACHE_KEY_PREFIX)))
        }
        None => {
            warn!("REDIS_URL is not set, lookups are cached in process memory");
            Ok(Arc::new(InMemoryCacheStore::new()))
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
