use crate::auth::{AuthError, HeaderSource};
use crate::pubsub::{ApiCode, Message, PubsubClient, PubsubError, Subscription, Topic};
use crate::source::{ConfigMapError, ConfigMapSource};
use crate::storage::{ObjectAttrs, StorageClient, StorageError};
use crate::types::RuntimeConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{Notify, mpsc};

pub fn timestamp(offset_secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000 + offset_secs).unwrap()
}

pub fn descriptor_json(name: &str, version: &str, path_type: &str) -> String {
    serde_json::json!({
        "selector": {
            "name": name,
            "version": version,
            "target": "x86_64-unknown-linux-gnu",
            "binary_hash": format!("hash-{name}-{version}"),
        },
        "setup": {"path_type": path_type, "cmd_dir": "bin"},
    })
    .to_string()
}

pub fn notification(id: &str, event_type: &str, object_id: &str) -> Message {
    Message {
        id: id.to_string(),
        ack_id: format!("ack-{id}"),
        attributes: HashMap::from([
            ("eventType".to_string(), event_type.to_string()),
            ("objectId".to_string(), object_id.to_string()),
            ("objectGeneration".to_string(), "1".to_string()),
        ]),
        publish_time: None,
    }
}

/// Hands out a new bearer token (`token-1`, `token-2`, ...) for every
/// request.
pub struct RotatingToken {
    calls: AtomicUsize,
}

impl RotatingToken {
    pub fn new() -> Self {
        RotatingToken {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HeaderSource for RotatingToken {
    async fn headers(&self) -> Result<http::HeaderMap, AuthError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut headers = http::HeaderMap::new();
        let value = http::HeaderValue::from_str(&format!("Bearer token-{n}"))
            .map_err(|e| AuthError::Build(e.to_string()))?;
        headers.insert(http::header::AUTHORIZATION, value);
        Ok(headers)
    }
}

fn injected(code: ApiCode) -> PubsubError {
    PubsubError::Status {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code,
        message: "injected".to_string(),
    }
}

/// Subscription whose pulls are fed by the test.
pub struct FakeSubscription {
    tx: mpsc::UnboundedSender<Result<Vec<Message>, PubsubError>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Vec<Message>, PubsubError>>>,
    acked: Mutex<Vec<String>>,
    ack_notify: Notify,
    deleted: AtomicBool,
    fail_delete: AtomicBool,
}

impl FakeSubscription {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        FakeSubscription {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            acked: Mutex::new(Vec::new()),
            ack_notify: Notify::new(),
            deleted: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
        }
    }

    /// Queues one pull result.
    pub fn deliver(&self, messages: Vec<Message>) {
        self.tx.send(Ok(messages)).unwrap();
    }

    pub fn fail_pull(&self, code: ApiCode) {
        self.tx.send(Err(injected(code))).unwrap();
    }

    pub fn fail_delete(&self) {
        self.fail_delete.store(true, Ordering::SeqCst);
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().clone()
    }

    pub async fn wait_acked(&self, n: usize) {
        loop {
            let notified = self.ack_notify.notified();
            if self.acked.lock().len() >= n {
                return;
            }
            notified.await;
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subscription for FakeSubscription {
    fn name(&self) -> &str {
        "projects/test/subscriptions/fake"
    }

    async fn pull(&self, _max_messages: u32) -> Result<Vec<Message>, PubsubError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), PubsubError> {
        self.acked.lock().extend_from_slice(ack_ids);
        self.ack_notify.notify_waiters();
        Ok(())
    }

    async fn delete(&self) -> Result<(), PubsubError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(injected(ApiCode::PermissionDenied));
        }
        self.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePubsub {
    topics: Mutex<Vec<Topic>>,
    subscriptions: Mutex<HashMap<String, Topic>>,
    created: Mutex<Vec<(String, Topic, Duration)>>,
}

impl FakePubsub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_topic(&self, topic: Topic) {
        self.topics.lock().push(topic);
    }

    pub fn add_subscription(&self, id: &str, topic: Topic) {
        self.subscriptions.lock().insert(id.to_string(), topic);
    }

    pub fn created(&self) -> Vec<(String, Topic, Duration)> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl PubsubClient for FakePubsub {
    async fn topic_exists(&self, topic: &Topic) -> Result<bool, PubsubError> {
        Ok(self.topics.lock().contains(topic))
    }

    async fn subscription_topic(&self, id: &str) -> Result<Option<Topic>, PubsubError> {
        Ok(self.subscriptions.lock().get(id).cloned())
    }

    async fn create_subscription(
        &self,
        id: &str,
        topic: &Topic,
        expiration: Duration,
    ) -> Result<(), PubsubError> {
        self.created
            .lock()
            .push((id.to_string(), topic.clone(), expiration));
        self.add_subscription(id, topic.clone());
        Ok(())
    }

    fn subscription(&self, _id: &str) -> Arc<dyn Subscription> {
        Arc::new(FakeSubscription::new())
    }
}

struct StoredObject {
    data: Vec<u8>,
    updated: OffsetDateTime,
    delay: Duration,
}

#[derive(Default)]
struct StorageState {
    objects: BTreeMap<(String, String), StoredObject>,
    failing: HashSet<String>,
    fail_list: bool,
    topics: Vec<Topic>,
}

/// In-memory bucket store with injectable failures and read delays.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<StorageState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    reads: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, name: &str, data: impl AsRef<[u8]>) {
        self.put_at(bucket, name, data, timestamp(0));
    }

    pub fn put_at(&self, bucket: &str, name: &str, data: impl AsRef<[u8]>, updated: OffsetDateTime) {
        self.state.lock().objects.insert(
            (bucket.to_string(), name.to_string()),
            StoredObject {
                data: data.as_ref().to_vec(),
                updated,
                delay: Duration::ZERO,
            },
        );
    }

    pub fn remove(&self, bucket: &str, name: &str) {
        self.state
            .lock()
            .objects
            .remove(&(bucket.to_string(), name.to_string()));
    }

    /// Applies to objects of any bucket with this name.
    pub fn set_delay(&self, name: &str, delay: Duration) {
        for ((_, object), stored) in self.state.lock().objects.iter_mut() {
            if object == name {
                stored.delay = delay;
            }
        }
    }

    pub fn fail_read(&self, name: &str) {
        self.state.lock().failing.insert(name.to_string());
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().fail_list = fail;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing.clear();
        state.fail_list = false;
    }

    pub fn add_topic(&self, topic: Topic) {
        self.state.lock().topics.push(topic);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_in_flight(&self) {
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectAttrs>, StorageError> {
        let state = self.state.lock();
        if state.fail_list {
            return Err(StorageError::InvalidResponse("injected list failure".into()));
        }
        Ok(state
            .objects
            .iter()
            .filter(|((b, name), _)| b == bucket && name.starts_with(prefix))
            .map(|((_, name), stored)| ObjectAttrs {
                name: name.clone(),
                updated: stored.updated,
            })
            .collect())
    }

    async fn read_object(&self, bucket: &str, name: &str) -> Result<Vec<u8>, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let (delay, result) = {
            let state = self.state.lock();
            let key = (bucket.to_string(), name.to_string());
            match state.objects.get(&key) {
                _ if state.failing.contains(name) => (
                    Duration::ZERO,
                    Err(StorageError::InvalidResponse(format!("injected failure for {name}"))),
                ),
                Some(stored) => (stored.delay, Ok(stored.data.clone())),
                None => (
                    Duration::ZERO,
                    Err(StorageError::NotFound {
                        bucket: bucket.to_string(),
                        name: name.to_string(),
                    }),
                ),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn notification_topics(&self, _bucket: &str) -> Result<Vec<Topic>, StorageError> {
        Ok(self.state.lock().topics.clone())
    }
}

#[derive(Default)]
struct ConfigMapState {
    seqs: BTreeMap<String, String>,
    runtimes: HashMap<String, RuntimeConfig>,
    fail_seqs: bool,
    fail_runtime_configs: bool,
}

/// Config map whose contents are set directly by the test.
pub struct FakeConfigMap {
    bucket: String,
    state: Mutex<ConfigMapState>,
}

impl FakeConfigMap {
    pub fn new(bucket: &str) -> Self {
        FakeConfigMap {
            bucket: bucket.to_string(),
            state: Mutex::new(ConfigMapState::default()),
        }
    }

    pub fn set_runtime(&self, rc: RuntimeConfig, seq: &str) {
        let mut state = self.state.lock();
        state.seqs.insert(rc.name.clone(), seq.to_string());
        state.runtimes.insert(rc.name.clone(), rc);
    }

    pub fn set_seq(&self, name: &str, seq: &str) {
        self.state
            .lock()
            .seqs
            .insert(name.to_string(), seq.to_string());
    }

    pub fn remove_runtime(&self, name: &str) {
        let mut state = self.state.lock();
        state.seqs.remove(name);
        state.runtimes.remove(name);
    }

    /// Keeps the seq but drops the runtime metadata.
    pub fn remove_metadata(&self, name: &str) {
        self.state.lock().runtimes.remove(name);
    }

    pub fn fail_seqs(&self, fail: bool) {
        self.state.lock().fail_seqs = fail;
    }

    pub fn fail_runtime_configs(&self, fail: bool) {
        self.state.lock().fail_runtime_configs = fail;
    }
}

fn injected_config_map_error() -> ConfigMapError {
    ConfigMapError::Storage(StorageError::InvalidResponse("injected".into()))
}

#[async_trait]
impl ConfigMapSource for FakeConfigMap {
    async fn seqs(&self) -> Result<BTreeMap<String, String>, ConfigMapError> {
        let state = self.state.lock();
        if state.fail_seqs {
            return Err(injected_config_map_error());
        }
        Ok(state.seqs.clone())
    }

    async fn bucket(&self) -> Result<String, ConfigMapError> {
        Ok(self.bucket.clone())
    }

    async fn runtime_configs(&self) -> Result<HashMap<String, RuntimeConfig>, ConfigMapError> {
        let state = self.state.lock();
        if state.fail_runtime_configs {
            return Err(injected_config_map_error());
        }
        Ok(state.runtimes.clone())
    }
}
