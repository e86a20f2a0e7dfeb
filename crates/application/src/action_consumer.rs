use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use auditflow_core::{AppError, AppResult};
use auditflow_domain::ActionUid;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::action_flow::{ActionFlow, FlowError, FlowState, ReceivedAction};
use crate::action_persister::{ActionPersister, PersistenceResult};

mod stats;

#[cfg(test)]
mod tests;

pub use stats::ConsumerStats;

/// Why a consumer run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    /// The shutdown signal fired.
    Interrupted,
    /// The broker connection failed or every subscription ended.
    ConnectionLost,
}

struct InFlight {
    received: ReceivedAction,
    hash: String,
}

/// Joins the action flow and the persister, settling every delivery.
#[derive(Clone)]
pub struct ActionConsumer {
    flow: ActionFlow,
    persister: ActionPersister,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl ActionConsumer {
    /// Creates a consumer.
    #[must_use]
    pub fn new(flow: ActionFlow, persister: ActionPersister) -> Self {
        Self {
            flow,
            persister,
            stats: Arc::new(Mutex::new(ConsumerStats::default())),
        }
    }

    /// Returns a snapshot of the health statistics.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Consumes `queues` until shutdown or connection loss.
    ///
    /// Successful results are acked, failed ones requeued, and actions out of
    /// attempts are dead-lettered. On exit the persister is drained and the
    /// remaining results are still settled.
    pub async fn start(
        &self,
        queues: &[String],
        consumer_name: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> AppResult<ConsumerExit> {
        if queues.is_empty() {
            return Err(AppError::Validation(
                "consumer needs at least one queue".to_owned(),
            ));
        }

        let (state_listener, mut states) = mpsc::unbounded_channel();
        self.flow.notify_on_state_change(state_listener);
        let mut results = self.persister.results();
        self.flow.start();

        let (persister_shutdown, persister_signal) = watch::channel(false);
        let persister_task = self.persister.spawn(persister_signal)?;

        let (merged, mut received) = mpsc::channel(self.flow.config().receive_buffer);
        for queue in queues {
            let mut stream = self.flow.receive(queue.as_str(), consumer_name);
            let merged = merged.clone();
            tokio::spawn(async move {
                while let Some(action) = stream.recv().await {
                    if merged.send(action).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(merged);

        self.update_stats(|stats| {
            stats.status_ok = true;
            stats.started_at = Some(Utc::now());
        });
        info!(consumer = consumer_name, queues = ?queues, "consumer started");

        // Unread results never outnumber tracked deliveries, so the result
        // channel cannot overflow while at most `observer_buffer` are tracked.
        let max_tracked = self.persister.config().observer_buffer;
        let mut in_flight: HashMap<ActionUid, InFlight> = HashMap::new();
        let exit = if *shutdown.borrow_and_update() {
            ConsumerExit::Interrupted
        } else {
            loop {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow_and_update() {
                            break ConsumerExit::Interrupted;
                        }
                    }
                    Some(state) = states.recv() => {
                        if matches!(state, FlowState::Failed | FlowState::Stopped) {
                            warn!(state = state.as_str(), "action flow is down");
                            break ConsumerExit::ConnectionLost;
                        }
                    }
                    Some(result) = results.recv() => self.settle(result, &mut in_flight).await,
                    next = received.recv(), if in_flight.len() < max_tracked => match next {
                        Some(action) => self.admit(action, &mut in_flight).await,
                        None => {
                            warn!("every subscription ended");
                            break ConsumerExit::ConnectionLost;
                        }
                    },
                }
            }
        };

        if exit == ConsumerExit::ConnectionLost {
            self.mark_failed();
        }

        self.flow.stop();
        let _ = persister_shutdown.send(true);
        match persister_task.await {
            Ok(Err(AppError::Cancelled(_))) | Ok(Ok(())) => {}
            Ok(Err(persister_error)) => {
                error!(error = %persister_error, "action persister ended with an error");
            }
            Err(join_error) => error!(error = %join_error, "action persister task failed"),
        }

        while let Some(result) = results.recv().await {
            self.settle(result, &mut in_flight).await;
        }

        if !in_flight.is_empty() {
            warn!(
                unsettled = in_flight.len(),
                "deliveries left unsettled, the broker will redeliver them"
            );
        }

        info!(consumer = consumer_name, exit = ?exit, "consumer finished");
        Ok(exit)
    }

    async fn admit(&self, received: ReceivedAction, in_flight: &mut HashMap<ActionUid, InFlight>) {
        let action = match received.action() {
            Ok(action) => action,
            Err(decode_error) => {
                warn!(
                    tag = %received.tag(),
                    attempt = %received.attempt(),
                    queue = received.origin_queue(),
                    error = %decode_error,
                    "undecodable action, dead-lettering"
                );
                self.dead_letter(&received).await;
                if let Err(reject_error) = self.flow.reject(&received).await {
                    error!(tag = %received.tag(), error = %reject_error, "failed to reject delivery");
                }
                self.update_stats(|stats| stats.failed_actions += 1);
                return;
            }
        };

        let uid = action.uid().clone();
        if in_flight.contains_key(&uid) {
            debug!(action_uid = %uid, tag = %received.tag(), "action already in flight, acking duplicate");
            if let Err(ack_error) = self.flow.ack(&received).await {
                error!(action_uid = %uid, error = %ack_error, "failed to ack duplicate delivery");
            }
            return;
        }

        let hash = action.hash().to_owned();
        in_flight.insert(uid.clone(), InFlight { received, hash });
        if let Err(persist_error) = self.persister.persist(action).await {
            in_flight.remove(&uid);
            warn!(action_uid = %uid, error = %persist_error, "action was not admitted");
        }
    }

    async fn settle(&self, result: PersistenceResult, in_flight: &mut HashMap<ActionUid, InFlight>) {
        let Some(InFlight { received, hash }) = in_flight.remove(result.action_id()) else {
            debug!(action_uid = %result.action_id(), "result for an action this consumer does not track");
            return;
        };

        if result.ok() {
            if let Err(ack_error) = self.flow.ack(&received).await {
                error!(action_uid = %result.action_id(), error = %ack_error, "failed to ack persisted action");
            }
            self.update_stats(|stats| stats.persisted_actions += 1);
            debug!(action_uid = %result.action_id(), hash = %hash, "action persisted");
            return;
        }

        self.update_stats(|stats| stats.failed_actions += 1);
        warn!(
            action_uid = %result.action_id(),
            hash = %hash,
            attempt = %received.attempt(),
            stage = result.stage().map_or("unknown", |stage| stage.as_str()),
            error = ?result.error(),
            "action persistence failed"
        );

        match self.flow.requeue(&received).await {
            Ok(()) => {}
            Err(FlowError::TooManyAttempts { attempt, max }) => {
                warn!(action_uid = %result.action_id(), attempt, max, "action out of attempts, dead-lettering");
                self.dead_letter(&received).await;
            }
            Err(requeue_error) => {
                error!(action_uid = %result.action_id(), error = %requeue_error, "failed to requeue action");
            }
        }
    }

    async fn dead_letter(&self, received: &ReceivedAction) {
        if let Err(dead_letter_error) = self.flow.dead_letter(received).await {
            error!(tag = %received.tag(), error = %dead_letter_error, "failed to dead-letter delivery");
        }
    }

    fn mark_failed(&self) {
        self.update_stats(|stats| {
            stats.status_ok = false;
            stats.failed_at = Some(Utc::now());
        });
    }

    fn update_stats(&self, update: impl FnOnce(&mut ConsumerStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut stats);
    }
}
