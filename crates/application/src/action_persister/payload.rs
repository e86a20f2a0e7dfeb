use std::sync::{Mutex, PoisonError};

use auditflow_core::AppError;
use auditflow_domain::Action;
use tokio::sync::OwnedSemaphorePermit;

use super::result::{PersistenceResult, PersistenceStage, ResultFanout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PayloadStatus {
    Pending,
    Rejected,
    Succeeded,
}

struct Terminal {
    status: PayloadStatus,
    permit: Option<OwnedSemaphorePermit>,
}

/// One action travelling through the persister, holding its admission permit.
///
/// The permit is released and the result fanned out on the first terminal
/// transition only. A payload dropped while pending counts as rejected.
pub(crate) struct PersistencePayload {
    action: Action,
    stage: PersistenceStage,
    terminal: Mutex<Terminal>,
    fanout: ResultFanout,
}

impl PersistencePayload {
    pub(crate) fn new(action: Action, permit: OwnedSemaphorePermit, fanout: ResultFanout) -> Self {
        Self {
            action,
            stage: PersistenceStage::Admission,
            terminal: Mutex::new(Terminal {
                status: PayloadStatus::Pending,
                permit: Some(permit),
            }),
            fanout,
        }
    }

    pub(crate) fn action(&self) -> &Action {
        &self.action
    }

    pub(crate) fn action_mut(&mut self) -> &mut Action {
        &mut self.action
    }

    pub(crate) fn enter(&mut self, stage: PersistenceStage) {
        self.stage = stage;
    }

    pub(crate) fn status(&self) -> PayloadStatus {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.status() != PayloadStatus::Pending
    }

    /// Marks the payload rejected. Returns false when it already was terminal.
    pub(crate) fn try_reject(&self, error: AppError) -> bool {
        let result = PersistenceResult::Rejected {
            action_id: self.action.uid().clone(),
            stage: self.stage,
            error,
        };
        self.finish(PayloadStatus::Rejected, result)
    }

    /// Marks the payload succeeded. Returns false when it already was terminal.
    pub(crate) fn try_succeed(&self) -> bool {
        let result = PersistenceResult::Succeeded {
            action_id: self.action.uid().clone(),
        };
        self.finish(PayloadStatus::Succeeded, result)
    }

    fn finish(&self, status: PayloadStatus, result: PersistenceResult) -> bool {
        let permit = {
            let mut terminal = self.terminal.lock().unwrap_or_else(PoisonError::into_inner);
            if terminal.status != PayloadStatus::Pending {
                return false;
            }
            terminal.status = status;
            terminal.permit.take()
        };

        drop(permit);
        self.fanout.publish(&result);
        true
    }
}

impl Drop for PersistencePayload {
    fn drop(&mut self) {
        self.try_reject(AppError::Cancelled(format!(
            "action left the pipeline during the {} stage",
            self.stage.as_str()
        )));
    }
}
