use crate::metrics_defs::WATCHER_SETUP;
use crate::pubsub::{PubsubClient, PubsubError, Topic};
use crate::storage::{StorageClient, StorageError, split_gcs_path};
use crate::types::{ConfigMap, RuntimeConfig};
use crate::watcher::{ConfigMapWatcher, Poller, PubsubWatcher};
use async_trait::async_trait;
use shared::counter;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);

// Minimum is one day. The extra 12 hours cover daylight saving switches.
const SUBSCRIPTION_EXPIRATION: Duration = Duration::from_secs(36 * 60 * 60);

#[derive(thiserror::Error, Debug)]
pub enum ConfigMapError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("could not read config map file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config map: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum WatcherSetupError {
    #[error("invalid bucket: {0}")]
    Storage(#[from] StorageError),

    #[error("pubsub error: {0}")]
    Pubsub(#[from] PubsubError),

    #[error("no pubsub client configured")]
    NoPubsubClient,

    #[error("notification:{bucket} not found in {found:?}")]
    NotificationNotFound { bucket: String, found: Vec<String> },

    #[error("notification topic {0} does not exist")]
    TopicNotFound(Topic),

    #[error("subscriber id is not specified")]
    NoSubscriberId,

    #[error("topic mismatch for subscription {subscription}: {actual} != {expected}")]
    TopicMismatch {
        subscription: String,
        actual: Topic,
        expected: Topic,
    },
}

/// Read access to the toolchain config map.
#[async_trait]
pub trait ConfigMapSource: Send + Sync {
    /// Sequence token of every runtime that has published one.
    async fn seqs(&self) -> Result<BTreeMap<String, String>, ConfigMapError>;

    /// The toolchain config bucket.
    async fn bucket(&self) -> Result<String, ConfigMapError>;

    /// Runtime configs keyed by runtime name.
    async fn runtime_configs(&self) -> Result<HashMap<String, RuntimeConfig>, ConfigMapError>;
}

/// Config map backed by a storage bucket.
///
/// The runtime list comes from `config_map`, or from `config_map_file` when
/// set, which is re-read on every call. Sequence tokens are read from
/// `<bucket>/<runtime>/seq`.
pub struct ConfigMapBucket {
    /// `gs://<bucket>/`
    pub uri: String,
    pub config_map: ConfigMap,
    pub config_map_file: Option<PathBuf>,
    pub storage: Arc<dyn StorageClient>,
    pub pubsub: Option<Arc<dyn PubsubClient>>,
    /// Must be unique per server instance so that every instance is notified.
    pub subscriber_id: String,
    /// Used for runtimes without a service address.
    pub remoteexec_addr: String,
    pub poll_interval: Duration,
}

impl ConfigMapBucket {
    pub fn new(uri: impl Into<String>, storage: Arc<dyn StorageClient>) -> Self {
        ConfigMapBucket {
            uri: uri.into(),
            config_map: ConfigMap::default(),
            config_map_file: None,
            storage,
            pubsub: None,
            subscriber_id: String::new(),
            remoteexec_addr: String::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    async fn load_config_map(&self) -> Result<ConfigMap, ConfigMapError> {
        let Some(path) = &self.config_map_file else {
            return Ok(self.config_map.clone());
        };
        let buf = tokio::fs::read(path)
            .await
            .map_err(|source| ConfigMapError::ReadFile {
                path: path.clone(),
                source,
            })?;
        Ok(serde_yaml::from_slice(&buf)?)
    }

    /// Returns a pubsub watcher if one can be set up, otherwise a poller.
    ///
    /// The choice is made once and is not retried.
    pub async fn watcher(&self) -> Box<dyn ConfigMapWatcher> {
        match self.pubsub_watcher().await {
            Ok(watcher) => {
                counter!(WATCHER_SETUP, "strategy" => "pubsub").increment(1);
                info!("use pubsub watcher");
                Box::new(watcher)
            }
            Err(err) => {
                counter!(WATCHER_SETUP, "strategy" => "poll").increment(1);
                error!(error = %err, "failed to use pubsub watcher, polling");
                Box::new(Poller::new(self.poll_interval))
            }
        }
    }

    async fn pubsub_watcher(&self) -> Result<PubsubWatcher, WatcherSetupError> {
        let (bucket, _) = split_gcs_path(&self.uri)?;
        let pubsub = self
            .pubsub
            .as_ref()
            .ok_or(WatcherSetupError::NoPubsubClient)?;

        // The default notification topic is named after the bucket, as
        // created by `gsutil notification create -f none <bucket>`.
        let topics = self.storage.notification_topics(&bucket).await?;
        let topic = topics
            .iter()
            .find(|t| t.id == bucket)
            .cloned()
            .ok_or_else(|| WatcherSetupError::NotificationNotFound {
                bucket: bucket.clone(),
                found: topics.iter().map(Topic::to_string).collect(),
            })?;
        info!(topic = %topic, "notification topic");

        if !pubsub.topic_exists(&topic).await? {
            return Err(WatcherSetupError::TopicNotFound(topic));
        }
        if self.subscriber_id.is_empty() {
            return Err(WatcherSetupError::NoSubscriberId);
        }

        match pubsub.subscription_topic(&self.subscriber_id).await? {
            Some(actual) if actual != topic => {
                return Err(WatcherSetupError::TopicMismatch {
                    subscription: self.subscriber_id.clone(),
                    actual,
                    expected: topic,
                });
            }
            Some(_) => {}
            None => {
                info!(subscriber = %self.subscriber_id, "subscription not found, creating");
                pubsub
                    .create_subscription(&self.subscriber_id, &topic, SUBSCRIPTION_EXPIRATION)
                    .await?;
            }
        }

        Ok(PubsubWatcher::start(
            pubsub.subscription(&self.subscriber_id),
        ))
    }
}

#[async_trait]
impl ConfigMapSource for ConfigMapBucket {
    async fn seqs(&self) -> Result<BTreeMap<String, String>, ConfigMapError> {
        let (bucket, _) = split_gcs_path(&self.uri)?;
        let config_map = self.load_config_map().await?;

        let mut seqs = BTreeMap::new();
        for runtime in &config_map.runtimes {
            let obj = format!("{}/seq", runtime.name);
            match self.storage.read_object(&bucket, &obj).await {
                Ok(buf) => {
                    seqs.insert(
                        runtime.name.clone(),
                        String::from_utf8_lossy(&buf).into_owned(),
                    );
                }
                Err(err @ StorageError::NotFound { .. }) => {
                    info!(object = %obj, error = %err, "ignore runtime without seq");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(seqs)
    }

    async fn bucket(&self) -> Result<String, ConfigMapError> {
        let (bucket, _) = split_gcs_path(&self.uri)?;
        Ok(bucket)
    }

    async fn runtime_configs(&self) -> Result<HashMap<String, RuntimeConfig>, ConfigMapError> {
        let config_map = self.load_config_map().await?;
        Ok(config_map
            .runtimes
            .into_iter()
            .map(|mut rt| {
                if rt.service_addr.is_empty() {
                    rt.service_addr = self.remoteexec_addr.clone();
                }
                (rt.name.clone(), rt)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FakePubsub, MemoryStorage};
    use crate::types::RuntimeConfig;

    const BUCKET: &str = "toolchain-config";

    fn runtime(name: &str, addr: &str) -> RuntimeConfig {
        RuntimeConfig {
            name: name.into(),
            service_addr: addr.into(),
            ..Default::default()
        }
    }

    fn bucket_with(storage: Arc<MemoryStorage>) -> ConfigMapBucket {
        let mut bucket = ConfigMapBucket::new(format!("gs://{BUCKET}/"), storage);
        bucket.config_map = ConfigMap {
            runtimes: vec![runtime("clang", ""), runtime("gcc", "gcc.internal:443")],
        };
        bucket.remoteexec_addr = "rbe.internal:443".into();
        bucket
    }

    #[tokio::test]
    async fn test_seqs_skips_missing() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put(BUCKET, "clang/seq", "7");
        let bucket = bucket_with(storage);

        let seqs = bucket.seqs().await.unwrap();
        assert_eq!(seqs, BTreeMap::from([("clang".into(), "7".into())]));
        assert_eq!(bucket.bucket().await.unwrap(), BUCKET);
    }

    #[tokio::test]
    async fn test_seqs_storage_error() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put(BUCKET, "clang/seq", "7");
        storage.fail_read("gcc/seq");
        let bucket = bucket_with(storage);

        assert!(matches!(
            bucket.seqs().await,
            Err(ConfigMapError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_runtime_configs_default_addr() {
        let bucket = bucket_with(Arc::new(MemoryStorage::new()));
        let configs = bucket.runtime_configs().await.unwrap();
        assert_eq!(configs["clang"].service_addr, "rbe.internal:443");
        assert_eq!(configs["gcc"].service_addr, "gcc.internal:443");
    }

    #[tokio::test]
    async fn test_config_map_file_is_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configmap.yaml");
        std::fs::write(&path, "runtimes:\n  - name: clang\n").unwrap();

        let mut bucket = bucket_with(Arc::new(MemoryStorage::new()));
        bucket.config_map_file = Some(path.clone());

        let configs = bucket.runtime_configs().await.unwrap();
        assert_eq!(configs.keys().collect::<Vec<_>>(), vec!["clang"]);

        std::fs::write(&path, "runtimes:\n  - name: msvc\n").unwrap();
        let configs = bucket.runtime_configs().await.unwrap();
        assert_eq!(configs.keys().collect::<Vec<_>>(), vec!["msvc"]);

        std::fs::write(&path, "runtimes: [").unwrap();
        assert!(matches!(
            bucket.runtime_configs().await,
            Err(ConfigMapError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_uri() {
        let bucket = ConfigMapBucket::new("/local/path", Arc::new(MemoryStorage::new()));
        assert!(matches!(
            bucket.bucket().await,
            Err(ConfigMapError::Storage(StorageError::InvalidUri(_)))
        ));
    }

    fn storage_with_topic() -> Arc<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
        storage.add_topic(Topic::new("p", "other"));
        storage.add_topic(Topic::new("p", BUCKET));
        storage
    }

    #[tokio::test]
    async fn test_pubsub_watcher_setup_creates_subscription() {
        let pubsub = Arc::new(FakePubsub::new());
        pubsub.add_topic(Topic::new("p", BUCKET));

        let mut bucket = bucket_with(storage_with_topic());
        bucket.pubsub = Some(pubsub.clone());
        bucket.subscriber_id = "instance-1".into();

        let watcher = bucket.pubsub_watcher().await.unwrap();
        assert_eq!(
            pubsub.created(),
            vec![("instance-1".to_string(), Topic::new("p", BUCKET), SUBSCRIPTION_EXPIRATION)]
        );
        watcher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pubsub_watcher_setup_reuses_subscription() {
        let pubsub = Arc::new(FakePubsub::new());
        pubsub.add_topic(Topic::new("p", BUCKET));
        pubsub.add_subscription("instance-1", Topic::new("p", BUCKET));

        let mut bucket = bucket_with(storage_with_topic());
        bucket.pubsub = Some(pubsub.clone());
        bucket.subscriber_id = "instance-1".into();

        let watcher = bucket.pubsub_watcher().await.unwrap();
        assert!(pubsub.created().is_empty());
        watcher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pubsub_watcher_setup_failures() {
        // No pubsub client
        let bucket = bucket_with(storage_with_topic());
        assert!(matches!(
            bucket.pubsub_watcher().await,
            Err(WatcherSetupError::NoPubsubClient)
        ));

        // No notification on the bucket
        let pubsub = Arc::new(FakePubsub::new());
        pubsub.add_topic(Topic::new("p", BUCKET));
        let mut bucket = bucket_with(Arc::new(MemoryStorage::new()));
        bucket.pubsub = Some(pubsub.clone());
        bucket.subscriber_id = "instance-1".into();
        assert!(matches!(
            bucket.pubsub_watcher().await,
            Err(WatcherSetupError::NotificationNotFound { .. })
        ));

        // Topic deleted
        let mut bucket = bucket_with(storage_with_topic());
        bucket.pubsub = Some(Arc::new(FakePubsub::new()));
        bucket.subscriber_id = "instance-1".into();
        assert!(matches!(
            bucket.pubsub_watcher().await,
            Err(WatcherSetupError::TopicNotFound(_))
        ));

        // Missing subscriber id
        let mut bucket = bucket_with(storage_with_topic());
        bucket.pubsub = Some(pubsub.clone());
        assert!(matches!(
            bucket.pubsub_watcher().await,
            Err(WatcherSetupError::NoSubscriberId)
        ));

        // Subscription attached to another topic
        let pubsub = Arc::new(FakePubsub::new());
        pubsub.add_topic(Topic::new("p", BUCKET));
        pubsub.add_subscription("instance-1", Topic::new("p", "other"));
        let mut bucket = bucket_with(storage_with_topic());
        bucket.pubsub = Some(pubsub);
        bucket.subscriber_id = "instance-1".into();
        assert!(matches!(
            bucket.pubsub_watcher().await,
            Err(WatcherSetupError::TopicMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_falls_back_to_poller() {
        let mut bucket = bucket_with(Arc::new(MemoryStorage::new()));
        bucket.poll_interval = Duration::from_secs(10);

        let watcher = bucket.watcher().await;
        let start = tokio::time::Instant::now();
        watcher
            .next(&tokio_util::sync::CancellationToken::new())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(8));
        watcher.close().await.unwrap();
    }
}
