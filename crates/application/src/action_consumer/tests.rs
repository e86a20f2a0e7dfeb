use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use auditflow_core::AppResult;

use crate::action_flow::{ActionFlow, FlowConfig};
use crate::action_persister::{ActionPersister, PersisterConfig};
use crate::queue_ports::{Attempt, ConnectionStatus};
use crate::test_support::{
    FakeCache, FakeStores, FakeTransport, action_body, persistence_stores, sample_action, within,
};

use super::{ActionConsumer, ConsumerExit};

struct Running {
    consumer: ActionConsumer,
    transport: Arc<FakeTransport>,
    stores: Arc<FakeStores>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<AppResult<ConsumerExit>>,
}

fn start_consumer(flow_config: FlowConfig) -> Running {
    start_consumer_with(flow_config, PersisterConfig::default())
}

fn start_consumer_with(flow_config: FlowConfig, persister_config: PersisterConfig) -> Running {
    let transport = FakeTransport::connected();
    let stores = Arc::new(FakeStores::default());
    let flow = ActionFlow::new(transport.clone(), flow_config)
        .unwrap_or_else(|error| panic!("{error}"));
    let persister = ActionPersister::new(
        persistence_stores(&stores, Arc::new(FakeCache::default())),
        persister_config,
    )
    .unwrap_or_else(|error| panic!("{error}"));
    let consumer = ActionConsumer::new(flow, persister);
    let (shutdown, signal) = watch::channel(false);

    let running_consumer = consumer.clone();
    let task = tokio::spawn(async move {
        running_consumer
            .start(&["actions".to_owned()], "consumer-1", signal)
            .await
    });

    Running {
        consumer,
        transport,
        stores,
        shutdown,
        task,
    }
}

async fn eventually(check: impl Fn() -> bool) {
    within(async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

async fn stop(running: Running) -> ConsumerExit {
    let _ = running.shutdown.send(true);
    within(running.task)
        .await
        .unwrap_or_else(|error| panic!("{error}"))
        .unwrap_or_else(|error| panic!("{error}"))
}

#[tokio::test]
async fn persisted_action_is_acked() {
    let running = start_consumer(FlowConfig::default());
    let action = sample_action("accounts");

    let tag = running
        .transport
        .deliver("actions", action_body(&action), Attempt::FIRST);

    eventually(|| running.transport.acked() == vec![tag]).await;
    assert_eq!(running.stores.written().len(), 1);
    assert!(running.transport.rejected().is_empty());

    let stats = running.consumer.stats();
    assert!(stats.status_ok);
    assert_eq!(stats.persisted_actions, 1);
    assert!(stats.started_at.is_some());

    assert_eq!(stop(running).await, ConsumerExit::Interrupted);
}

#[tokio::test]
async fn every_persisted_action_is_acked_under_sustained_inflow() {
    let running = start_consumer_with(
        FlowConfig::default(),
        PersisterConfig {
            max_events: 1,
            observer_buffer: 1,
            ..PersisterConfig::default()
        },
    );

    let mut tags: Vec<_> = (0..300)
        .map(|_| {
            running.transport.deliver(
                "actions",
                action_body(&sample_action("accounts")),
                Attempt::FIRST,
            )
        })
        .collect();

    eventually(|| running.transport.acked().len() == tags.len()).await;
    assert_eq!(running.stores.written().len(), tags.len());
    assert_eq!(running.consumer.stats().persisted_actions, 300);

    let mut acked = running.transport.acked();
    acked.sort();
    tags.sort();
    assert_eq!(acked, tags);
    assert!(running.transport.rejected().is_empty());

    stop(running).await;
}

#[tokio::test]
async fn failed_action_is_requeued_with_next_attempt() {
    let running = start_consumer(FlowConfig::default());
    running.stores.fail_service("accounts");

    let tag = running.transport.deliver(
        "actions",
        action_body(&sample_action("accounts")),
        Attempt::FIRST,
    );

    eventually(|| !running.transport.published().is_empty()).await;
    assert_eq!(running.transport.rejected(), vec![tag]);
    let published = running.transport.published();
    assert_eq!(published[0].routing_key, "actions.retry");
    assert_eq!(published[0].message.attempt().get(), 2);
    assert!(running.transport.acked().is_empty());
    assert_eq!(running.consumer.stats().failed_actions, 1);

    stop(running).await;
}

#[tokio::test]
async fn exhausted_action_is_dead_lettered() {
    let running = start_consumer(FlowConfig {
        max_requeue: 2,
        ..FlowConfig::default()
    });
    running.stores.fail_service("accounts");

    running.transport.deliver(
        "actions",
        action_body(&sample_action("accounts")),
        Attempt::FIRST.next(),
    );

    eventually(|| !running.transport.published().is_empty()).await;
    let published = running.transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "actions.dead");
    assert_eq!(published[0].message.attempt().get(), 2);

    stop(running).await;
}

#[tokio::test]
async fn undecodable_delivery_is_rejected_and_dead_lettered() {
    let running = start_consumer(FlowConfig::default());

    let tag = running
        .transport
        .deliver("actions", b"not an action".to_vec(), Attempt::FIRST);

    eventually(|| running.transport.rejected() == vec![tag]).await;
    let published = running.transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "actions.dead");
    assert_eq!(published[0].message.body(), b"not an action");
    assert_eq!(running.stores.write_calls(), 0);

    stop(running).await;
}

#[tokio::test]
async fn redelivery_of_an_in_flight_action_is_acked_once() {
    let running = start_consumer(FlowConfig::default());
    running.stores.hold_writes();
    let body = action_body(&sample_action("accounts"));

    let first = running
        .transport
        .deliver("actions", body.clone(), Attempt::FIRST);
    eventually(|| running.stores.write_calls() == 1).await;
    let duplicate = running.transport.deliver("actions", body, Attempt::FIRST);

    eventually(|| running.transport.acked() == vec![duplicate]).await;
    running.stores.release_writes(1);
    eventually(|| running.transport.acked() == vec![duplicate, first]).await;

    assert_eq!(running.stores.written().len(), 1);
    assert_eq!(running.consumer.stats().persisted_actions, 1);

    stop(running).await;
}

#[tokio::test]
async fn connection_failure_ends_with_connection_lost() {
    let running = start_consumer(FlowConfig::default());
    let action = sample_action("accounts");
    let tag = running
        .transport
        .deliver("actions", action_body(&action), Attempt::FIRST);
    eventually(|| running.transport.acked() == vec![tag]).await;

    running.transport.set_status(ConnectionStatus::ConnectionDropped);

    let exit = within(running.task)
        .await
        .unwrap_or_else(|error| panic!("{error}"))
        .unwrap_or_else(|error| panic!("{error}"));
    assert_eq!(exit, ConsumerExit::ConnectionLost);

    let stats = running.consumer.stats();
    assert!(!stats.status_ok);
    assert!(stats.failed_at.is_some());
}

#[tokio::test]
async fn shutdown_settles_actions_still_in_the_pipeline() {
    let running = start_consumer(FlowConfig::default());
    running.stores.hold_writes();
    let tag = running.transport.deliver(
        "actions",
        action_body(&sample_action("accounts")),
        Attempt::FIRST,
    );
    eventually(|| running.stores.write_calls() == 1).await;

    let _ = running.shutdown.send(true);
    running.stores.release_writes(1);

    let exit = within(running.task)
        .await
        .unwrap_or_else(|error| panic!("{error}"))
        .unwrap_or_else(|error| panic!("{error}"));
    assert_eq!(exit, ConsumerExit::Interrupted);
    assert_eq!(running.transport.acked(), vec![tag]);
}

#[tokio::test]
async fn consumer_needs_a_queue() {
    let transport = FakeTransport::connected();
    let stores = Arc::new(FakeStores::default());
    let flow = ActionFlow::new(transport, FlowConfig::default())
        .unwrap_or_else(|error| panic!("{error}"));
    let persister = ActionPersister::new(
        persistence_stores(&stores, Arc::new(FakeCache::default())),
        PersisterConfig::default(),
    )
    .unwrap_or_else(|error| panic!("{error}"));
    let consumer = ActionConsumer::new(flow, persister);

    let result = consumer.start(&[], "consumer-1", watch::channel(false).1).await;
    assert!(result.is_err());
}
