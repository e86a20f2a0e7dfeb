use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use auditflow_application::{ExchangeKind, FlowConfig, PersisterConfig};
use auditflow_core::{AppError, AppResult};
use auditflow_infrastructure::AmqpConnectionConfig;

/// Runtime settings of the consumer process.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub amqp: AmqpConnectionConfig,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub flow: FlowConfig,
    pub persister: PersisterConfig,
    pub health_port: u16,
    pub consumer_name: String,
}

impl ConsumerConfig {
    pub fn load() -> AppResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let consumer_name = lookup("CONSUMER_NAME")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "auditflow-consumer".to_owned());

        let mut amqp = AmqpConnectionConfig::new(required(&lookup, "AMQP_URL")?);
        amqp.connection_name = consumer_name.clone();
        amqp.connect_timeout = Duration::from_secs(parse_or(
            &lookup,
            "AUDITFLOW_CONNECT_TIMEOUT_SECS",
            amqp.connect_timeout.as_secs(),
        )?);
        amqp.max_reconnect_cycles = parse_or(
            &lookup,
            "AUDITFLOW_MAX_RECONNECT_CYCLES",
            amqp.max_reconnect_cycles,
        )?;
        if amqp.connect_timeout.is_zero() {
            return Err(AppError::Validation(
                "AUDITFLOW_CONNECT_TIMEOUT_SECS must be greater than zero".to_owned(),
            ));
        }

        let defaults = FlowConfig::default();
        let exchange_kind = match lookup("AUDITFLOW_EXCHANGE_KIND") {
            Some(value) => ExchangeKind::parse(value.as_str())?,
            None => defaults.exchange_kind,
        };
        let flow = FlowConfig {
            exchange: text_or(&lookup, "AUDITFLOW_EXCHANGE", defaults.exchange),
            exchange_kind,
            queue: text_or(&lookup, "AUDITFLOW_QUEUE", defaults.queue),
            routing_key: text_or(&lookup, "AUDITFLOW_ROUTING_KEY", defaults.routing_key),
            error_queue: text_or(&lookup, "AUDITFLOW_ERROR_QUEUE", defaults.error_queue),
            requeue_routing_key: text_or(
                &lookup,
                "AUDITFLOW_REQUEUE_ROUTING_KEY",
                defaults.requeue_routing_key,
            ),
            dead_letter_queue: text_or(
                &lookup,
                "AUDITFLOW_DEAD_LETTER_QUEUE",
                defaults.dead_letter_queue,
            ),
            dead_letter_routing_key: text_or(
                &lookup,
                "AUDITFLOW_DEAD_LETTER_ROUTING_KEY",
                defaults.dead_letter_routing_key,
            ),
            max_requeue: parse_or(&lookup, "AUDITFLOW_MAX_REQUEUE", defaults.max_requeue)?,
            receive_buffer: defaults.receive_buffer,
        };
        flow.validate()?;

        let defaults = PersisterConfig::default();
        let max_events = parse_or(&lookup, "AUDITFLOW_MAX_EVENTS", defaults.max_events)?;
        let persister = PersisterConfig {
            max_events,
            stage_workers: parse_or(&lookup, "AUDITFLOW_STAGE_WORKERS", defaults.stage_workers)?,
            stage_timeout: Duration::from_millis(parse_or(
                &lookup,
                "AUDITFLOW_STAGE_TIMEOUT_MS",
                u64::try_from(defaults.stage_timeout.as_millis()).unwrap_or(u64::MAX),
            )?),
            observer_buffer: defaults.observer_buffer.max(max_events),
            ..defaults
        };
        persister.validate()?;

        Ok(Self {
            amqp,
            database_url: required(&lookup, "DATABASE_URL")?,
            redis_url: lookup("REDIS_URL").filter(|value| !value.trim().is_empty()),
            flow,
            persister,
            health_port: parse_or(&lookup, "HEALTH_PORT", 8080)?,
            consumer_name,
        })
    }

    /// Queues this process consumes: the primary queue, then the retry queue when distinct.
    pub fn queues(&self) -> Vec<String> {
        let mut queues = vec![self.flow.queue.clone()];
        if self.flow.error_queue != self.flow.queue {
            queues.push(self.flow.error_queue.clone());
        }
        queues
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> AppResult<String> {
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| AppError::Validation(format!("{name} is required")))
}

fn text_or(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: String) -> String {
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(default)
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> AppResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(value) => value.trim().parse::<T>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        None => Ok(default),
    }
}
