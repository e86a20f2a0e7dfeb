use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use serde_json::json;

use auditflow_domain::Action;

use crate::action_flow::{ActionFlow, FlowConfig};
use crate::test_support::{FakeCache, FakeTransport};

use super::{ActionReceiver, ReceiveError, content_hash};

fn body() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "name": "invoice.paid",
        "actor": {"service": "billing"},
        "target": {"service": "ledger", "entity": {"entityType": "invoice", "externalId": "inv-9"}},
        "status": "Success",
        "emittedAt": "2024-05-01T12:00:00Z",
        "changes": [{"propertyName": "state", "from": "open", "to": "paid"}]
    }))
    .unwrap_or_default()
}

fn receiver() -> (ActionReceiver, Arc<FakeTransport>, Arc<FakeCache>) {
    let transport = FakeTransport::connected();
    let cache = Arc::new(FakeCache::default());
    let flow = ActionFlow::new(transport.clone(), FlowConfig::default())
        .unwrap_or_else(|error| panic!("{error}"));

    (ActionReceiver::new(flow, cache.clone()), transport, cache)
}

#[test]
fn content_hash_is_uppercase_sha256_hex() {
    assert_eq!(
        content_hash(b"abc"),
        "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"
    );
}

#[tokio::test]
async fn new_body_is_stamped_and_sent() {
    let (receiver, transport, cache) = receiver();
    let before = Utc::now();

    let registration = receiver
        .receive(body().as_slice())
        .await
        .unwrap_or_else(|error| panic!("{error}"));

    assert_eq!(registration.hash, content_hash(body().as_slice()));
    assert!(registration.registered_at >= before);
    assert!(cache.contains(registration.hash.as_str()));

    let published = transport.published();
    assert_eq!(published.len(), 1);
    let sent = serde_json::from_slice::<Action>(published[0].message.body())
        .unwrap_or_else(|error| panic!("{error}"));
    assert_eq!(sent.uid(), &registration.uid);
    assert_eq!(sent.hash(), registration.hash);
    assert_eq!(sent.name().as_str(), "invoice.paid");
}

#[tokio::test]
async fn identical_body_is_rejected_as_duplicate() {
    let (receiver, transport, _cache) = receiver();

    assert!(receiver.receive(body().as_slice()).await.is_ok());
    let second = receiver.receive(body().as_slice()).await;

    assert_eq!(second, Err(ReceiveError::AlreadyProcessed));
    assert_eq!(transport.published().len(), 1);
}

#[tokio::test]
async fn cache_outage_is_treated_as_a_miss() {
    let (receiver, transport, cache) = receiver();
    cache.fail_reads.store(true, Ordering::SeqCst);
    cache.fail_writes.store(true, Ordering::SeqCst);

    assert!(receiver.receive(body().as_slice()).await.is_ok());
    assert_eq!(transport.published().len(), 1);
}

#[tokio::test]
async fn empty_and_invalid_bodies_are_invalid_input() {
    let (receiver, transport, _cache) = receiver();

    assert!(matches!(
        receiver.receive(b"").await,
        Err(ReceiveError::InvalidInput(_))
    ));
    assert!(matches!(
        receiver.receive(b"{\"name\":").await,
        Err(ReceiveError::InvalidInput(_))
    ));

    let missing_service = serde_json::to_vec(&json!({
        "name": "invoice.paid",
        "actor": {"service": ""},
        "target": {"service": "ledger"},
        "emittedAt": "2024-05-01T12:00:00Z"
    }))
    .unwrap_or_default();
    assert!(matches!(
        receiver.receive(missing_service.as_slice()).await,
        Err(ReceiveError::InvalidInput(_))
    ));
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn flow_failure_is_pipeline_unavailable() {
    let (receiver, transport, _cache) = receiver();
    transport.fail_publishing();

    assert!(matches!(
        receiver.receive(body().as_slice()).await,
        Err(ReceiveError::PipelineUnavailable(_))
    ));
}
