use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use auditflow_core::{AppError, AppResult};
use auditflow_domain::Action;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::store_ports::PersistenceStores;

mod payload;
mod result;
mod stages;

#[cfg(test)]
mod tests;

use payload::PersistencePayload;
pub use result::{PersistenceResult, PersistenceStage};
use result::ResultFanout;
use stages::StageResolver;

/// Concurrency, timeout and cache settings of the persister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersisterConfig {
    /// Highest number of actions inside the pipeline at once.
    pub max_events: usize,
    /// Worker tasks per stage.
    pub stage_workers: usize,
    /// Capacity of the queue in front of each stage.
    pub stage_queue_capacity: usize,
    /// Upper bound of one stage call.
    pub stage_timeout: Duration,
    /// Lifetime of cached service lookups.
    pub service_cache_ttl: Duration,
    /// Lifetime of cached entity type and entity lookups.
    pub entity_cache_ttl: Duration,
    /// Capacity of result channels created by [`ActionPersister::results`].
    pub observer_buffer: usize,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            max_events: 64,
            stage_workers: 4,
            stage_queue_capacity: 16,
            stage_timeout: Duration::from_secs(10),
            service_cache_ttl: Duration::from_secs(3 * 60),
            entity_cache_ttl: Duration::from_secs(5 * 60),
            observer_buffer: 256,
        }
    }
}

impl PersisterConfig {
    /// Validates bounds.
    pub fn validate(&self) -> AppResult<()> {
        for (field, value) in [
            ("max_events", self.max_events),
            ("stage_workers", self.stage_workers),
            ("stage_queue_capacity", self.stage_queue_capacity),
            ("observer_buffer", self.observer_buffer),
        ] {
            if value == 0 {
                return Err(AppError::Validation(format!(
                    "persister {field} must be greater than zero"
                )));
            }
        }

        if self.max_events > Semaphore::MAX_PERMITS {
            return Err(AppError::Validation(format!(
                "persister max_events must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }

        if self.observer_buffer < self.max_events {
            return Err(AppError::Validation(
                "persister observer_buffer must not be smaller than max_events".to_owned(),
            ));
        }

        if self.stage_timeout.is_zero() {
            return Err(AppError::Validation(
                "persister stage_timeout must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }
}

const STAGES: [PersistenceStage; 4] = [
    PersistenceStage::Actor,
    PersistenceStage::Target,
    PersistenceStage::Properties,
    PersistenceStage::Write,
];

/// Multi-stage, admission-bounded action writer.
///
/// Actions are resolved actor first, then target, then changed properties,
/// and finally written. Every terminal outcome is offered to the registered
/// observers. Ordering across actions is not preserved.
#[derive(Clone)]
pub struct ActionPersister {
    inner: Arc<PersisterInner>,
}

struct PersisterInner {
    config: PersisterConfig,
    resolver: Arc<StageResolver>,
    admission: Arc<Semaphore>,
    fanout: ResultFanout,
    entry: Mutex<Option<mpsc::Sender<PersistencePayload>>>,
    running: AtomicBool,
}

impl ActionPersister {
    /// Creates a persister after validating its configuration.
    pub fn new(stores: PersistenceStores, config: PersisterConfig) -> AppResult<Self> {
        config.validate()?;
        let resolver = StageResolver::new(stores, config.service_cache_ttl, config.entity_cache_ttl);

        Ok(Self {
            inner: Arc::new(PersisterInner {
                admission: Arc::new(Semaphore::new(config.max_events)),
                resolver: Arc::new(resolver),
                config,
                fanout: ResultFanout::default(),
                entry: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the persister configuration.
    #[must_use]
    pub fn config(&self) -> &PersisterConfig {
        &self.inner.config
    }

    /// Returns the number of admitted actions without a terminal result yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner
            .config
            .max_events
            .saturating_sub(self.inner.admission.available_permits())
    }

    /// Returns true while actions are admitted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Registers an observer receiving every later terminal result.
    pub fn notify_on_result(&self, observer: mpsc::Sender<PersistenceResult>) {
        self.inner.fanout.register(observer);
    }

    /// Registers and returns a new observer channel sized by `observer_buffer`.
    #[must_use]
    pub fn results(&self) -> mpsc::Receiver<PersistenceResult> {
        let (sender, receiver) = mpsc::channel(self.inner.config.observer_buffer);
        self.notify_on_result(sender);
        receiver
    }

    /// Admits one action into the pipeline, waiting while `max_events` are in flight.
    pub async fn persist(&self, action: Action) -> AppResult<()> {
        let entry = self
            .inner
            .entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| AppError::Conflict("action persister is not running".to_owned()))?;

        let permit = Arc::clone(&self.inner.admission)
            .acquire_owned()
            .await
            .map_err(|_| AppError::Cancelled("action persister stopped admitting".to_owned()))?;

        let uid = action.uid().clone();
        let payload = PersistencePayload::new(action, permit, self.inner.fanout.clone());
        entry.send(payload).await.map_err(|_| {
            AppError::Cancelled(format!("action persister closed before admitting '{uid}'"))
        })?;

        debug!(action_uid = %uid, "action admitted");
        Ok(())
    }

    /// Runs the stage workers until `shutdown` turns true or its sender is dropped.
    ///
    /// Shutdown stops admission, drains admitted actions through the stages and
    /// then closes every observer channel. Always ends with [`AppError::Cancelled`]
    /// once stopped.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let workers = self.launch()?;
        self.drain_on(shutdown, workers).await
    }

    /// Opens admission right away and runs the rest of [`ActionPersister::run`] on a task.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> AppResult<JoinHandle<AppResult<()>>> {
        let workers = self.launch()?;
        let persister = self.clone();

        Ok(tokio::spawn(async move {
            persister.drain_on(shutdown, workers).await
        }))
    }

    fn launch(&self) -> AppResult<JoinSet<()>> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(AppError::Conflict(
                "action persister is already running".to_owned(),
            ));
        }

        let config = &self.inner.config;
        let (entry_sender, mut input) = mpsc::channel(config.stage_queue_capacity);
        let mut workers = JoinSet::new();

        for (index, stage) in STAGES.iter().copied().enumerate() {
            let (output, next_input) = if index + 1 == STAGES.len() {
                (None, None)
            } else {
                let (sender, receiver) = mpsc::channel(config.stage_queue_capacity);
                (Some(sender), Some(receiver))
            };

            let shared_input = Arc::new(tokio::sync::Mutex::new(input));
            for _ in 0..config.stage_workers {
                workers.spawn(stage_worker(
                    stage,
                    Arc::clone(&shared_input),
                    output.clone(),
                    Arc::clone(&self.inner.resolver),
                    config.stage_timeout,
                ));
            }

            match next_input {
                Some(next_input) => input = next_input,
                None => break,
            }
        }

        *self
            .inner
            .entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(entry_sender);
        info!(
            max_events = config.max_events,
            stage_workers = config.stage_workers,
            "action persister running"
        );

        Ok(workers)
    }

    async fn drain_on(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut workers: JoinSet<()>,
    ) -> AppResult<()> {
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!(in_flight = self.in_flight(), "action persister stopping admission");
        self.inner
            .entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.admission.close();

        while let Some(joined) = workers.join_next().await {
            if let Err(error) = joined {
                warn!(error = %error, "stage worker ended abnormally");
            }
        }

        let observers = self.inner.fanout.close();
        info!(observers, "action persister drained");

        Err(AppError::Cancelled(
            "action persister stopped by shutdown signal".to_owned(),
        ))
    }
}

async fn stage_worker(
    stage: PersistenceStage,
    input: Arc<tokio::sync::Mutex<mpsc::Receiver<PersistencePayload>>>,
    output: Option<mpsc::Sender<PersistencePayload>>,
    resolver: Arc<StageResolver>,
    stage_timeout: Duration,
) {
    loop {
        let next = input.lock().await.recv().await;
        let Some(mut payload) = next else {
            break;
        };

        if payload.is_terminal() {
            debug!(
                action_uid = %payload.action().uid(),
                stage = stage.as_str(),
                "dropping payload that already finished"
            );
            continue;
        }

        payload.enter(stage);
        let outcome = tokio::time::timeout(stage_timeout, resolver.apply(stage, payload.action_mut()))
            .await
            .unwrap_or_else(|_| {
                Err(AppError::Timeout(format!(
                    "{} stage took longer than {}ms",
                    stage.as_str(),
                    stage_timeout.as_millis()
                )))
            });

        if let Err(error) = outcome {
            warn!(
                action_uid = %payload.action().uid(),
                hash = %payload.action().hash(),
                stage = stage.as_str(),
                error = %error,
                "action rejected"
            );
            payload.try_reject(error);
            continue;
        }

        match &output {
            Some(next_stage) => {
                if next_stage.send(payload).await.is_err() {
                    warn!(stage = stage.as_str(), "next stage closed, payload dropped");
                }
            }
            None => {
                payload.try_succeed();
                debug!(action_uid = %payload.action().uid(), "action persisted");
            }
        }
    }

    debug!(stage = stage.as_str(), "stage worker finished");
}
