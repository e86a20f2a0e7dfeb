use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use uuid::Uuid;

use auditflow_core::AppError;

use crate::test_support::{FakeCache, FakeStores, persistence_stores, sample_action, within};

use super::payload::PersistencePayload;
use super::result::ResultFanout;
use super::{ActionPersister, PersistenceResult, PersistenceStage, PersisterConfig};

struct Harness {
    persister: ActionPersister,
    stores: Arc<FakeStores>,
    cache: Arc<FakeCache>,
    results: mpsc::Receiver<PersistenceResult>,
    shutdown: watch::Sender<bool>,
}

fn harness(config: PersisterConfig) -> Harness {
    let stores = Arc::new(FakeStores::default());
    let cache = Arc::new(FakeCache::default());
    let persister = ActionPersister::new(persistence_stores(&stores, cache.clone()), config)
        .unwrap_or_else(|error| panic!("{error}"));
    let results = persister.results();
    let (shutdown, signal) = watch::channel(false);
    if persister.spawn(signal).is_err() {
        panic!("persister failed to start");
    }

    Harness {
        persister,
        stores,
        cache,
        results,
        shutdown,
    }
}

#[test]
fn zero_bounds_are_rejected() {
    let stores = Arc::new(FakeStores::default());
    let config = PersisterConfig {
        max_events: 0,
        ..PersisterConfig::default()
    };

    let result = ActionPersister::new(
        persistence_stores(&stores, Arc::new(FakeCache::default())),
        config,
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn persist_before_run_is_a_typed_error() {
    let stores = Arc::new(FakeStores::default());
    let persister = ActionPersister::new(
        persistence_stores(&stores, Arc::new(FakeCache::default())),
        PersisterConfig::default(),
    )
    .unwrap_or_else(|error| panic!("{error}"));

    let result = persister.persist(sample_action("accounts")).await;

    assert!(matches!(result, Err(AppError::Conflict(_))));
    assert_eq!(persister.in_flight(), 0);
}

#[tokio::test]
async fn resolved_action_is_written_once_and_reported_to_every_observer() {
    let mut harness = harness(PersisterConfig::default());
    let mut second_observer = harness.persister.results();
    let action = sample_action("accounts");

    assert!(harness.persister.persist(action.clone()).await.is_ok());

    let expected = PersistenceResult::Succeeded {
        action_id: action.uid().clone(),
    };
    assert_eq!(within(harness.results.recv()).await, Some(expected.clone()));
    assert_eq!(within(second_observer.recv()).await, Some(expected));

    let written = harness.stores.written();
    assert_eq!(written.len(), 1);
    let stored = &written[0];
    assert_eq!(
        stored.resolved_actor().map(|party| party.service.name.as_str()),
        Some("billing")
    );
    assert!(stored.resolved_target().and_then(|party| party.entity_id()).is_some());
    assert!(stored.changes().iter().all(|change| {
        change
            .property_id
            .as_deref()
            .is_some_and(|id| Uuid::parse_str(id).is_ok())
    }));
    assert!(harness.cache.contains("service:billing"));
    assert!(harness.cache.contains("service:accounts"));
    assert_eq!(harness.persister.in_flight(), 0);
}

#[tokio::test]
async fn target_failure_rejects_once_and_skips_the_write() {
    let mut harness = harness(PersisterConfig::default());
    harness.stores.fail_service("accounts");
    let action = sample_action("accounts");

    assert!(harness.persister.persist(action.clone()).await.is_ok());

    let result = within(harness.results.recv())
        .await
        .unwrap_or_else(|| panic!("expected one result"));
    assert!(!result.ok());
    assert_eq!(result.action_id(), action.uid());
    assert_eq!(result.stage(), Some(PersistenceStage::Target));
    assert!(matches!(result.error(), Some(AppError::Unavailable(_))));

    let _ = harness.shutdown.send(true);
    assert!(within(harness.results.recv()).await.is_none());
    assert_eq!(harness.stores.write_calls(), 0);
    assert_eq!(harness.persister.in_flight(), 0);
}

#[tokio::test]
async fn non_uuid_property_id_rejects_in_property_stage() {
    let mut harness = harness(PersisterConfig::default());
    harness.stores.return_property_id("prop-17");

    assert!(harness.persister.persist(sample_action("accounts")).await.is_ok());

    let result = within(harness.results.recv())
        .await
        .unwrap_or_else(|| panic!("expected one result"));
    assert_eq!(result.stage(), Some(PersistenceStage::Properties));
    assert_eq!(harness.stores.write_calls(), 0);
}

#[tokio::test]
async fn slow_stage_times_out() {
    let mut harness = harness(PersisterConfig {
        stage_timeout: Duration::from_millis(20),
        ..PersisterConfig::default()
    });
    harness.stores.delay_services(Duration::from_millis(500));

    assert!(harness.persister.persist(sample_action("accounts")).await.is_ok());

    let result = within(harness.results.recv())
        .await
        .unwrap_or_else(|| panic!("expected one result"));
    assert_eq!(result.stage(), Some(PersistenceStage::Actor));
    assert!(matches!(result.error(), Some(AppError::Timeout(_))));
}

#[tokio::test]
async fn admission_never_exceeds_max_events() {
    let mut harness = harness(PersisterConfig {
        max_events: 2,
        ..PersisterConfig::default()
    });
    harness.stores.hold_writes();

    assert!(harness.persister.persist(sample_action("accounts")).await.is_ok());
    assert!(harness.persister.persist(sample_action("accounts")).await.is_ok());
    assert_eq!(harness.persister.in_flight(), 2);

    let third = harness.persister.persist(sample_action("accounts"));
    let blocked = tokio::time::timeout(Duration::from_millis(100), third).await;
    assert!(blocked.is_err());
    assert_eq!(harness.persister.in_flight(), 2);

    harness.stores.release_writes(2);
    for _ in 0..2 {
        let result = within(harness.results.recv()).await;
        assert!(result.is_some_and(|result| result.ok()));
    }

    assert!(
        within(harness.persister.persist(sample_action("accounts")))
            .await
            .is_ok()
    );
    harness.stores.release_writes(1);
    assert!(within(harness.results.recv()).await.is_some());
    assert_eq!(harness.stores.write_calls(), 3);
}

#[tokio::test]
async fn service_lookups_are_served_from_cache() {
    let mut harness = harness(PersisterConfig::default());

    for _ in 0..3 {
        assert!(harness.persister.persist(sample_action("accounts")).await.is_ok());
        assert!(within(harness.results.recv()).await.is_some());
    }

    assert_eq!(harness.stores.service_calls(), 2);
}

#[tokio::test]
async fn shutdown_drains_admitted_actions_then_closes_observers() {
    let stores = Arc::new(FakeStores::default());
    let persister = ActionPersister::new(
        persistence_stores(&stores, Arc::new(FakeCache::default())),
        PersisterConfig::default(),
    )
    .unwrap_or_else(|error| panic!("{error}"));
    let mut results = persister.results();
    let (shutdown, signal) = watch::channel(false);
    let running = persister
        .spawn(signal)
        .unwrap_or_else(|error| panic!("{error}"));

    stores.hold_writes();
    assert!(persister.persist(sample_action("accounts")).await.is_ok());
    let _ = shutdown.send(true);
    within(async {
        while persister.is_running() {
            tokio::task::yield_now().await;
        }
    })
    .await;

    assert!(matches!(
        persister.persist(sample_action("accounts")).await,
        Err(AppError::Conflict(_) | AppError::Cancelled(_))
    ));

    stores.release_writes(1);
    assert!(within(results.recv()).await.is_some_and(|result| result.ok()));
    assert!(within(results.recv()).await.is_none());

    let outcome = within(running).await;
    assert!(matches!(outcome, Ok(Err(AppError::Cancelled(_)))));
    assert!(persister.spawn(watch::channel(false).1).is_err());
}

fn pending_payload(
    admission: &Arc<Semaphore>,
) -> (PersistencePayload, mpsc::Receiver<PersistenceResult>) {
    let fanout = ResultFanout::default();
    let (observer, results) = mpsc::channel(8);
    fanout.register(observer);
    let permit = Arc::clone(admission)
        .try_acquire_owned()
        .unwrap_or_else(|error| panic!("{error}"));

    (
        PersistencePayload::new(sample_action("accounts"), permit, fanout),
        results,
    )
}

#[test]
fn racing_terminal_transitions_settle_a_payload_once() {
    for _ in 0..200 {
        let admission = Arc::new(Semaphore::new(2));
        let (payload, mut results) = pending_payload(&admission);
        assert_eq!(admission.available_permits(), 1);

        let start = std::sync::Barrier::new(2);
        let (rejected, succeeded) = std::thread::scope(|scope| {
            let rejecting = scope.spawn(|| {
                start.wait();
                payload.try_reject(AppError::Internal("store went away".to_owned()))
            });
            let succeeding = scope.spawn(|| {
                start.wait();
                payload.try_succeed()
            });
            (
                rejecting.join().unwrap_or_else(|_| panic!("reject thread panicked")),
                succeeding.join().unwrap_or_else(|_| panic!("succeed thread panicked")),
            )
        });

        assert!(rejected != succeeded, "exactly one transition must win");
        assert!(payload.is_terminal());
        assert_eq!(admission.available_permits(), 2);

        assert!(!payload.try_succeed());
        assert!(!payload.try_reject(AppError::Internal("late".to_owned())));
        drop(payload);

        let result = results
            .try_recv()
            .unwrap_or_else(|error| panic!("no result published: {error}"));
        assert_eq!(result.ok(), succeeded);
        assert!(results.try_recv().is_err());
        assert_eq!(admission.available_permits(), 2);
    }
}

#[test]
fn payload_dropped_while_pending_is_cancelled_once() {
    let admission = Arc::new(Semaphore::new(1));
    let (payload, mut results) = pending_payload(&admission);

    drop(payload);

    let result = results
        .try_recv()
        .unwrap_or_else(|error| panic!("no result published: {error}"));
    assert!(matches!(result.error(), Some(AppError::Cancelled(_))));
    assert_eq!(result.stage(), Some(PersistenceStage::Admission));
    assert!(results.try_recv().is_err());
    assert_eq!(admission.available_permits(), 1);
}
