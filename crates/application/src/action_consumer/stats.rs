use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health statistics of one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStats {
    /// False once the consumer lost its connection.
    pub status_ok: bool,
    /// Actions acknowledged after a successful write.
    pub persisted_actions: u64,
    /// Actions that failed decoding or persistence.
    pub failed_actions: u64,
    /// When consuming started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the consumer was marked unhealthy.
    pub failed_at: Option<DateTime<Utc>>,
}
