use crate::auth::{self, AuthError};
use crate::fetcher::{ConfigLoader, DEFAULT_CONCURRENCY_MULTIPLIER};
use crate::gcs::GcsClient;
use crate::pubsub::{self, PubsubClient, PubsubError, PubsubRestClient};
use crate::source::{ConfigMapBucket, DEFAULT_POLL_INTERVAL};
use crate::serve::DEFAULT_RETRY_DELAY;
use crate::storage::{FilesystemStorage, StorageClient, StorageError, split_gcs_path};
use crate::types::ConfigMap;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("bucket_uri must look like gs://<bucket>/, got {0:?}")]
    InvalidBucketUri(String),

    #[error("config_map and config_map_file are mutually exclusive")]
    ConflictingConfigMap,

    #[error("{0} must be greater than 0")]
    ZeroValue(&'static str),

    #[error("duplicate runtime name: {0}")]
    DuplicateRuntime(String),

    #[error("runtime name cannot be empty")]
    EmptyRuntimeName,

    #[error("pubsub.project cannot be empty")]
    EmptyProject,
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("storage client: {0}")]
    Storage(#[from] StorageError),

    #[error("pubsub client: {0}")]
    Pubsub(#[from] PubsubError),

    #[error("credentials: {0}")]
    Auth(#[from] AuthError),
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StorageBackend {
    /// Cloud Storage JSON API.
    Gcs {
        /// Overrides the service endpoint, for emulators.
        #[serde(default)]
        endpoint: Option<String>,
        /// Skips application default credentials.
        #[serde(default)]
        anonymous: bool,
    },
    /// A local mirror laid out as `<base_dir>/<bucket>/<object>`.
    Filesystem { base_dir: PathBuf },
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::Gcs {
            endpoint: None,
            anonymous: false,
        }
    }
}

fn default_pubsub_endpoint() -> String {
    pubsub::DEFAULT_ENDPOINT.into()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct PubsubConfig {
    pub project: String,
    #[serde(default = "default_pubsub_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub anonymous: bool,
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_retry_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY.as_secs()
}

fn default_enable_parallel() -> bool {
    true
}

fn default_concurrency_multiplier() -> usize {
    DEFAULT_CONCURRENCY_MULTIPLIER
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    /// `gs://<bucket>/` holding `<runtime>/seq` and the descriptors.
    pub bucket_uri: String,
    /// Inline config map. Mutually exclusive with `config_map_file`.
    #[serde(default)]
    pub config_map: Option<ConfigMap>,
    /// YAML config map, re-read on every load.
    #[serde(default)]
    pub config_map_file: Option<PathBuf>,
    /// Must be unique per instance. Without it the watcher falls back to
    /// polling.
    #[serde(default)]
    pub subscriber_id: String,
    /// Address used by runtimes that do not set their own.
    #[serde(default)]
    pub remoteexec_addr: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Delay before retrying a failed load.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_enable_parallel")]
    pub enable_parallel: bool,
    #[serde(default = "default_concurrency_multiplier")]
    pub fetch_concurrency_multiplier: usize,
    #[serde(default)]
    pub storage: StorageBackend,
    #[serde(default)]
    pub pubsub: Option<PubsubConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        split_gcs_path(&self.bucket_uri)
            .ok()
            .filter(|(bucket, _)| !bucket.is_empty())
            .ok_or_else(|| ValidationError::InvalidBucketUri(self.bucket_uri.clone()))?;

        if self.config_map.is_some() && self.config_map_file.is_some() {
            return Err(ValidationError::ConflictingConfigMap);
        }
        if let Some(config_map) = &self.config_map {
            let mut names = std::collections::HashSet::new();
            for rt in &config_map.runtimes {
                if rt.name.is_empty() {
                    return Err(ValidationError::EmptyRuntimeName);
                }
                if !names.insert(&rt.name) {
                    return Err(ValidationError::DuplicateRuntime(rt.name.clone()));
                }
            }
        }

        if self.poll_interval_secs == 0 {
            return Err(ValidationError::ZeroValue("poll_interval_secs"));
        }
        if self.enable_parallel && self.fetch_concurrency_multiplier == 0 {
            return Err(ValidationError::ZeroValue("fetch_concurrency_multiplier"));
        }
        if let Some(pubsub) = &self.pubsub {
            if pubsub.project.is_empty() {
                return Err(ValidationError::EmptyProject);
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub async fn storage_client(&self) -> Result<Arc<dyn StorageClient>, BuildError> {
        let client: Arc<dyn StorageClient> = match &self.storage {
            StorageBackend::Gcs {
                endpoint,
                anonymous,
            } => {
                let credentials = auth::credentials(*anonymous)?;
                Arc::new(GcsClient::new(endpoint.as_deref(), credentials).await?)
            }
            StorageBackend::Filesystem { base_dir } => {
                Arc::new(FilesystemStorage::new(base_dir.clone()))
            }
        };
        Ok(client)
    }

    pub fn pubsub_client(&self) -> Result<Option<Arc<dyn PubsubClient>>, BuildError> {
        let Some(pubsub) = &self.pubsub else {
            return Ok(None);
        };
        let credentials = auth::credentials(pubsub.anonymous)?;
        let client =
            PubsubRestClient::new(&pubsub.endpoint, &pubsub.project, Arc::new(credentials))?;
        Ok(Some(Arc::new(client)))
    }

    pub fn config_loader(&self, storage: Arc<dyn StorageClient>) -> ConfigLoader {
        ConfigLoader::new(storage, self.enable_parallel)
            .with_concurrency_multiplier(self.fetch_concurrency_multiplier)
    }

    pub fn config_map_bucket(&self, storage: Arc<dyn StorageClient>) -> Result<ConfigMapBucket, BuildError> {
        let mut bucket = ConfigMapBucket::new(self.bucket_uri.clone(), storage);
        bucket.config_map = self.config_map.clone().unwrap_or_default();
        bucket.config_map_file = self.config_map_file.clone();
        bucket.pubsub = self.pubsub_client()?;
        bucket.subscriber_id = self.subscriber_id.clone();
        bucket.remoteexec_addr = self.remoteexec_addr.clone();
        bucket.poll_interval = self.poll_interval();
        Ok(bucket)
    }
}
