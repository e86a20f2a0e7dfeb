use std::sync::{Arc, Mutex, PoisonError};

use auditflow_core::AppError;
use auditflow_domain::ActionUid;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Pipeline stage of the persister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistenceStage {
    /// Waiting for the first stage.
    Admission,
    /// Actor service and entity resolution.
    Actor,
    /// Target service and entity resolution.
    Target,
    /// Changed property resolution.
    Properties,
    /// Durable write.
    Write,
}

impl PersistenceStage {
    /// Returns stable label value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admission => "admission",
            Self::Actor => "actor",
            Self::Target => "target",
            Self::Properties => "properties",
            Self::Write => "write",
        }
    }
}

/// Terminal outcome of one persisted action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceResult {
    /// Every stage succeeded and the action is stored.
    Succeeded {
        /// Uid of the stored action.
        action_id: ActionUid,
    },
    /// A stage failed and the action was not stored.
    Rejected {
        /// Uid of the rejected action.
        action_id: ActionUid,
        /// Stage that failed.
        stage: PersistenceStage,
        /// Failure cause.
        error: AppError,
    },
}

impl PersistenceResult {
    /// Returns the action uid.
    #[must_use]
    pub fn action_id(&self) -> &ActionUid {
        match self {
            Self::Succeeded { action_id } | Self::Rejected { action_id, .. } => action_id,
        }
    }

    /// Returns true when the action was stored.
    #[must_use]
    pub fn ok(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Returns the failure cause of a rejected action.
    #[must_use]
    pub fn error(&self) -> Option<&AppError> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Rejected { error, .. } => Some(error),
        }
    }

    /// Returns the failing stage of a rejected action.
    #[must_use]
    pub fn stage(&self) -> Option<PersistenceStage> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Rejected { stage, .. } => Some(*stage),
        }
    }
}

/// Observer registry receiving every terminal result.
#[derive(Clone, Default)]
pub(crate) struct ResultFanout {
    observers: Arc<Mutex<Vec<mpsc::Sender<PersistenceResult>>>>,
}

impl ResultFanout {
    pub(crate) fn register(&self, observer: mpsc::Sender<PersistenceResult>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Offers a result to every observer without waiting; full observers miss it.
    pub(crate) fn publish(&self, result: &PersistenceResult) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|observer| match observer.try_send(result.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(action_uid = %result.action_id(), "observer is full, result dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub(crate) fn close(&self) -> usize {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *observers).len()
    }
}
