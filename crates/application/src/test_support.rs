use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use auditflow_core::{AppError, AppResult};
use auditflow_domain::{
    Action, ActionInput, ActionParty, ActionStatus, Entity, EntityRef, EntityType,
    PropertyChange, Service,
};
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::{Semaphore, mpsc};
use uuid::Uuid;

use crate::queue_ports::{
    Attempt, ConnectionStatus, DeliveryTag, ExchangeKind, Message, QueueInspection,
    QueueTransport, ReceivedMessage,
};
use crate::store_ports::{
    ActionRepository, CacheStore, EntityRepository, EntityTypeRepository, PersistenceStores,
    PropertyRepository, ServiceRepository,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .unwrap_or_else(|_| panic!("test step timed out"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Published {
    pub(crate) routing_key: String,
    pub(crate) message: Message,
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    exchanges: Mutex<BTreeSet<String>>,
    queues: Mutex<BTreeSet<String>>,
    bindings: Mutex<BTreeSet<(String, String, String)>>,
    published: Mutex<Vec<Published>>,
    acked: Mutex<Vec<DeliveryTag>>,
    rejected: Mutex<Vec<DeliveryTag>>,
    feeds: Mutex<HashMap<String, mpsc::UnboundedSender<ReceivedMessage>>>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedReceiver<ReceivedMessage>>>,
    status: Mutex<ConnectionStatus>,
    status_listeners: Mutex<Vec<mpsc::UnboundedSender<ConnectionStatus>>>,
    next_tag: AtomicU64,
    fail_publish: AtomicBool,
}

impl FakeTransport {
    pub(crate) fn connected() -> Arc<Self> {
        let transport = Self::default();
        *lock(&transport.status) = ConnectionStatus::Connected;
        Arc::new(transport)
    }

    fn feed(&self, queue: &str) -> mpsc::UnboundedSender<ReceivedMessage> {
        let mut feeds = lock(&self.feeds);
        if let Some(sender) = feeds.get(queue) {
            return sender.clone();
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.subscriptions).insert(queue.to_owned(), receiver);
        feeds.insert(queue.to_owned(), sender.clone());
        sender
    }

    pub(crate) fn deliver(&self, queue: &str, body: Vec<u8>, attempt: Attempt) -> DeliveryTag {
        let tag = DeliveryTag::new(self.next_tag.fetch_add(1, Ordering::SeqCst) + 1);
        let message = Message::new(body, "application/json", attempt);
        let _ = self
            .feed(queue)
            .send(ReceivedMessage::new(message, queue, tag));
        tag
    }

    pub(crate) fn close_feed(&self, queue: &str) {
        self.feed(queue);
        lock(&self.feeds).remove(queue);
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        *lock(&self.status) = status;
        lock(&self.status_listeners).retain(|listener| listener.send(status).is_ok());
    }

    pub(crate) fn fail_publishing(&self) {
        self.fail_publish.store(true, Ordering::SeqCst);
    }

    pub(crate) fn exchanges(&self) -> Vec<String> {
        lock(&self.exchanges).iter().cloned().collect()
    }

    pub(crate) fn queues(&self) -> Vec<String> {
        lock(&self.queues).iter().cloned().collect()
    }

    pub(crate) fn bindings(&self) -> Vec<(String, String, String)> {
        lock(&self.bindings).iter().cloned().collect()
    }

    pub(crate) fn published(&self) -> Vec<Published> {
        lock(&self.published).clone()
    }

    pub(crate) fn acked(&self) -> Vec<DeliveryTag> {
        lock(&self.acked).clone()
    }

    pub(crate) fn rejected(&self) -> Vec<DeliveryTag> {
        lock(&self.rejected).clone()
    }
}

#[async_trait]
impl QueueTransport for FakeTransport {
    async fn declare_exchange(&self, name: &str, _kind: ExchangeKind) -> AppResult<()> {
        lock(&self.exchanges).insert(name.to_owned());
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> AppResult<()> {
        lock(&self.queues).insert(name.to_owned());
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> AppResult<()> {
        lock(&self.bindings).insert((
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        message: &Message,
        _exchange: &str,
        routing_key: &str,
    ) -> AppResult<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("broker is unreachable".to_owned()));
        }

        lock(&self.published).push(Published {
            routing_key: routing_key.to_owned(),
            message: message.clone(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _consumer: &str,
        sink: mpsc::Sender<ReceivedMessage>,
    ) -> AppResult<()> {
        self.feed(queue);
        let mut receiver = lock(&self.subscriptions)
            .remove(queue)
            .ok_or_else(|| AppError::Conflict(format!("queue '{queue}' already consumed")))?;

        while let Some(message) = receiver.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }

        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> AppResult<()> {
        lock(&self.acked).push(tag);
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag) -> AppResult<()> {
        lock(&self.rejected).push(tag);
        Ok(())
    }

    async fn inspect(&self, queue: &str) -> AppResult<QueueInspection> {
        let waiting = lock(&self.published)
            .iter()
            .filter(|published| published.routing_key == queue)
            .count();
        Ok(QueueInspection {
            messages_waiting: u32::try_from(waiting).unwrap_or(u32::MAX),
            consumer_count: 1,
        })
    }

    fn status(&self) -> ConnectionStatus {
        *lock(&self.status)
    }

    fn notify_status_change(&self, listener: mpsc::UnboundedSender<ConnectionStatus>) {
        lock(&self.status_listeners).push(listener);
    }
}

#[derive(Default)]
pub(crate) struct FakeCache {
    entries: Mutex<HashMap<String, String>>,
    pub(crate) fail_reads: AtomicBool,
    pub(crate) fail_writes: AtomicBool,
}

impl FakeCache {
    pub(crate) fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub(crate) fn raw(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }
}

#[async_trait]
impl CacheStore for FakeCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("cache is down".to_owned()));
        }
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> AppResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("cache is down".to_owned()));
        }
        lock(&self.entries).insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn has(&self, key: &str) -> AppResult<bool> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("cache is down".to_owned()));
        }
        Ok(lock(&self.entries).contains_key(key))
    }

    async fn create_key(&self, key: &str, ttl: Duration) -> AppResult<()> {
        self.set(key, "1", ttl).await
    }
}

pub(crate) struct FakeStores {
    services: Mutex<HashMap<String, Service>>,
    entity_types: Mutex<HashMap<(String, String), EntityType>>,
    entities: Mutex<HashMap<(String, String), Entity>>,
    properties: Mutex<HashMap<(String, String), String>>,
    written: Mutex<Vec<Action>>,
    service_calls: AtomicUsize,
    write_calls: AtomicUsize,
    failing_services: Mutex<HashSet<String>>,
    property_id_override: Mutex<Option<String>>,
    gate_writes: AtomicBool,
    write_gate: Semaphore,
    service_delay: Mutex<Option<Duration>>,
}

impl Default for FakeStores {
    fn default() -> Self {
        Self {
            services: Mutex::default(),
            entity_types: Mutex::default(),
            entities: Mutex::default(),
            properties: Mutex::default(),
            written: Mutex::default(),
            service_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            failing_services: Mutex::default(),
            property_id_override: Mutex::default(),
            gate_writes: AtomicBool::new(false),
            write_gate: Semaphore::new(0),
            service_delay: Mutex::default(),
        }
    }
}

impl FakeStores {
    pub(crate) fn fail_service(&self, name: &str) {
        lock(&self.failing_services).insert(name.to_owned());
    }

    pub(crate) fn return_property_id(&self, id: &str) {
        *lock(&self.property_id_override) = Some(id.to_owned());
    }

    pub(crate) fn delay_services(&self, delay: Duration) {
        *lock(&self.service_delay) = Some(delay);
    }

    pub(crate) fn hold_writes(&self) {
        self.gate_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_writes(&self, count: usize) {
        self.write_gate.add_permits(count);
    }

    pub(crate) fn written(&self) -> Vec<Action> {
        lock(&self.written).clone()
    }

    pub(crate) fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn service_calls(&self) -> usize {
        self.service_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceRepository for FakeStores {
    async fn first_or_create_by_name(&self, name: &str) -> AppResult<Service> {
        self.service_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.service_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if lock(&self.failing_services).contains(name) {
            return Err(AppError::Unavailable(format!(
                "service store rejected '{name}'"
            )));
        }

        Ok(lock(&self.services)
            .entry(name.to_owned())
            .or_insert_with(|| Service {
                id: Uuid::new_v4().to_string(),
                name: name.to_owned(),
            })
            .clone())
    }
}

#[async_trait]
impl EntityTypeRepository for FakeStores {
    async fn first_or_create_by_name_and_service(
        &self,
        name: &str,
        service_id: &str,
    ) -> AppResult<EntityType> {
        Ok(lock(&self.entity_types)
            .entry((service_id.to_owned(), name.to_owned()))
            .or_insert_with(|| EntityType {
                id: Uuid::new_v4().to_string(),
                service_id: service_id.to_owned(),
                name: name.to_owned(),
            })
            .clone())
    }
}

#[async_trait]
impl EntityRepository for FakeStores {
    async fn first_or_create_by_external_id_and_type(
        &self,
        external_id: &str,
        entity_type_id: &str,
    ) -> AppResult<Entity> {
        Ok(lock(&self.entities)
            .entry((entity_type_id.to_owned(), external_id.to_owned()))
            .or_insert_with(|| Entity {
                id: Uuid::new_v4().to_string(),
                entity_type_id: entity_type_id.to_owned(),
                external_id: external_id.to_owned(),
            })
            .clone())
    }
}

#[async_trait]
impl PropertyRepository for FakeStores {
    async fn get_id_or_create(&self, name: &str, entity_id: &str) -> AppResult<String> {
        if let Some(id) = lock(&self.property_id_override).clone() {
            return Ok(id);
        }

        Ok(lock(&self.properties)
            .entry((entity_id.to_owned(), name.to_owned()))
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone())
    }
}

#[async_trait]
impl ActionRepository for FakeStores {
    async fn create(&self, action: &Action) -> AppResult<Action> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.gate_writes.load(Ordering::SeqCst) {
            self.write_gate
                .acquire()
                .await
                .map_err(|error| AppError::Internal(error.to_string()))?
                .forget();
        }

        lock(&self.written).push(action.clone());
        Ok(action.clone())
    }
}

pub(crate) fn persistence_stores(
    stores: &Arc<FakeStores>,
    cache: Arc<dyn CacheStore>,
) -> PersistenceStores {
    PersistenceStores {
        services: stores.clone(),
        entity_types: stores.clone(),
        entities: stores.clone(),
        properties: stores.clone(),
        actions: stores.clone(),
        cache,
    }
}

pub(crate) fn sample_action(target_service: &str) -> Action {
    Action::new(ActionInput {
        uid: None,
        parent_uid: None,
        name: "user.updated".to_owned(),
        hash: "5E3A".to_owned(),
        actor: ActionParty::new("billing", Some(EntityRef::new("operator", "operator-7"))),
        target: ActionParty::new(target_service, Some(EntityRef::new("user", "user-42"))),
        status: ActionStatus::Success,
        is_async: false,
        emitted_at: Utc
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now),
        registered_at: Utc::now(),
        details: json!({"source": "profile"}),
        changes: vec![
            PropertyChange::new("email", Some("a@x.io".to_owned()), Some("b@x.io".to_owned())),
            PropertyChange::new("name", None, Some("Bea".to_owned())),
        ],
    })
    .unwrap_or_else(|error| panic!("sample action is invalid: {error}"))
}

pub(crate) fn action_body(action: &Action) -> Vec<u8> {
    serde_json::to_vec(action).unwrap_or_default()
}
