use std::sync::Arc;
use std::time::Duration;

use auditflow_core::AppError;
use auditflow_domain::{
    Action, ActionInput, ActionParty, ActionStatus, ActionUid, PropertyChange,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

use crate::action_flow::ActionFlow;
use crate::store_ports::CacheStore;

#[cfg(test)]
mod tests;

/// How long a received body hash blocks identical bodies.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Errors returned while accepting an incoming action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReceiveError {
    /// The body is empty, unparseable or fails validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An identical body was accepted recently.
    #[error("action already processed")]
    AlreadyProcessed,

    /// The action flow did not accept the action.
    #[error("data pipeline could not accept the new action: {0}")]
    PipelineUnavailable(String),
}

/// Acknowledgement of an accepted action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Uid of the accepted action.
    pub uid: ActionUid,
    /// Uppercase hex SHA-256 of the raw body.
    pub hash: String,
    /// Time the action was accepted.
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingAction {
    #[serde(default)]
    uid: Option<ActionUid>,
    #[serde(default)]
    parent_uid: Option<ActionUid>,
    name: String,
    actor: ActionParty,
    target: ActionParty,
    #[serde(default)]
    status: ActionStatus,
    #[serde(default)]
    is_async: bool,
    emitted_at: DateTime<Utc>,
    #[serde(default)]
    details: Value,
    #[serde(default)]
    changes: Vec<PropertyChange>,
}

/// Ingress gate: deduplicates raw bodies and hands new actions to the flow.
#[derive(Clone)]
pub struct ActionReceiver {
    flow: ActionFlow,
    cache: Arc<dyn CacheStore>,
}

impl ActionReceiver {
    /// Creates a receiver.
    #[must_use]
    pub fn new(flow: ActionFlow, cache: Arc<dyn CacheStore>) -> Self {
        Self { flow, cache }
    }

    /// Accepts one raw action body.
    pub async fn receive(&self, body: &[u8]) -> Result<Registration, ReceiveError> {
        if body.is_empty() {
            return Err(ReceiveError::InvalidInput(
                "empty body of incoming action payload".to_owned(),
            ));
        }

        let hash = content_hash(body);
        match self.cache.has(hash.as_str()).await {
            Ok(true) => return Err(ReceiveError::AlreadyProcessed),
            Ok(false) => {}
            Err(cache_error) => error!(hash = %hash, error = %cache_error, "receiver cache lookup failed"),
        }

        let action = parse_action(body, hash.as_str())?;

        if let Err(cache_error) = self.cache.create_key(hash.as_str(), DEDUP_WINDOW).await {
            error!(hash = %hash, error = %cache_error, "receiver cache write failed");
        }

        self.flow
            .send(&action)
            .await
            .map_err(|flow_error| ReceiveError::PipelineUnavailable(flow_error.to_string()))?;

        info!(action_uid = %action.uid(), hash = %hash, "action received");
        Ok(Registration {
            uid: action.uid().clone(),
            hash,
            registered_at: action.registered_at(),
        })
    }
}

fn parse_action(body: &[u8], hash: &str) -> Result<Action, ReceiveError> {
    let incoming = serde_json::from_slice::<IncomingAction>(body).map_err(|error| {
        ReceiveError::InvalidInput(format!("could not parse incoming action payload: {error}"))
    })?;

    Action::new(ActionInput {
        uid: incoming.uid,
        parent_uid: incoming.parent_uid,
        name: incoming.name,
        hash: hash.to_owned(),
        actor: incoming.actor,
        target: incoming.target,
        status: incoming.status,
        is_async: incoming.is_async,
        emitted_at: incoming.emitted_at,
        registered_at: Utc::now(),
        details: incoming.details,
        changes: incoming.changes,
    })
    .map_err(|error| match error {
        AppError::Validation(message) => ReceiveError::InvalidInput(message),
        other => ReceiveError::InvalidInput(other.to_string()),
    })
}

/// Computes the uppercase hex SHA-256 of a raw body.
#[must_use]
pub fn content_hash(body: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    use std::fmt::Write;

    let digest = Sha256::digest(body);
    digest
        .iter()
        .fold(String::with_capacity(64), |mut acc, byte| {
            let _ = write!(acc, "{byte:02X}");
            acc
        })
}
