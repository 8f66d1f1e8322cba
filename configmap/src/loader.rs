use crate::fetcher::{ConfigLoader, FetchError};
use crate::metrics_defs::{LOAD_DURATION, RUNTIMES_DELETED, RUNTIMES_RELOADED};
use crate::source::{ConfigMapError, ConfigMapSource};
use crate::store::ConfigStore;
use crate::types::ConfigResp;
use shared::{counter, histogram};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("config map error: {0}")]
    ConfigMap(#[from] ConfigMapError),

    #[error("runtime config {0} not found")]
    RuntimeConfigNotFound(String),

    #[error("load configs for {runtime}: {source}")]
    Fetch {
        runtime: String,
        #[source]
        source: FetchError,
    },

    #[error("load cancelled")]
    Cancelled,

    #[error("load lock closed: {0}")]
    LockClosed(#[from] AcquireError),
}

#[derive(Debug)]
pub enum LoadOutcome {
    Updated(ConfigResp),
    /// No runtime changed since the last load.
    NoUpdate,
}

/// Keeps the config store in sync with the config map.
pub struct ConfigMapLoader {
    config_map: Arc<dyn ConfigMapSource>,
    config_loader: ConfigLoader,
    store: ConfigStore,
    update_lock: Semaphore,
}

impl ConfigMapLoader {
    pub fn new(config_map: Arc<dyn ConfigMapSource>, config_loader: ConfigLoader) -> Self {
        ConfigMapLoader {
            config_map,
            config_loader,
            store: ConfigStore::new(),
            update_lock: Semaphore::new(1),
        }
    }

    pub fn with_store(mut self, store: ConfigStore) -> Self {
        self.store = store;
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    async fn get_permit(&self, cancel: &CancellationToken) -> Result<SemaphorePermit<'_>, LoadError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LoadError::Cancelled),
            permit = self.update_lock.acquire() => Ok(permit?),
        }
    }

    /// Reloads the runtimes whose seq changed and drops the ones that are
    /// gone. With `force`, the response is rebuilt even if nothing changed.
    ///
    /// A failure leaves the store as it was after the last completed
    /// mutation; calling `load` again converges.
    pub async fn load(
        &self,
        cancel: &CancellationToken,
        force: bool,
    ) -> Result<LoadOutcome, LoadError> {
        let start = Instant::now();
        let result = self.load_inner(cancel, force).await;
        let label = match &result {
            Ok(LoadOutcome::Updated(_)) => "updated",
            Ok(LoadOutcome::NoUpdate) => "no_update",
            Err(_) => "error",
        };
        histogram!(LOAD_DURATION, "result" => label).record(start.elapsed().as_secs_f64());
        result
    }

    async fn load_inner(
        &self,
        cancel: &CancellationToken,
        force: bool,
    ) -> Result<LoadOutcome, LoadError> {
        let _permit = self.get_permit(cancel).await?;

        let mut deleted: BTreeSet<String> = self.store.list().into_iter().collect();
        let seqs = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LoadError::Cancelled),
            seqs = self.config_map.seqs() => seqs?,
        };

        let mut updated = BTreeMap::new();
        for (name, seq) in seqs {
            deleted.remove(&name);
            if self.store.seq(&name).as_deref() != Some(seq.as_str()) {
                updated.insert(name, seq);
            }
        }
        if updated.is_empty() && deleted.is_empty() {
            if !force {
                return Ok(LoadOutcome::NoUpdate);
            }
            info!("configmap no update, but force to load");
        }

        for name in &deleted {
            info!(runtime = %name, "delete config");
            self.store.delete(name);
        }
        counter!(RUNTIMES_DELETED).increment(deleted.len() as u64);

        let (bucket, runtime_configs) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LoadError::Cancelled),
            fetched = async {
                let bucket = self.config_map.bucket().await?;
                let runtime_configs = self.config_map.runtime_configs().await?;
                Ok::<_, ConfigMapError>((bucket, runtime_configs))
            } => fetched?,
        };
        info!(runtimes = ?runtime_configs.keys().collect::<BTreeSet<_>>(), "runtime configs");

        let mut reloaded = 0;
        for (name, seq) in &updated {
            info!(runtime = %name, seq = %seq, "update config");
            let rc = runtime_configs
                .get(name)
                .ok_or_else(|| LoadError::RuntimeConfigNotFound(name.clone()))?;
            if rc.service_addr.is_empty() {
                warn!(runtime = %name, "no addr, ignoring");
                continue;
            }

            let uri = format!("gs://{bucket}/{name}/");
            let configs = self
                .config_loader
                .load(cancel, &uri, rc)
                .await
                .map_err(|source| match source {
                    FetchError::Cancelled => LoadError::Cancelled,
                    source => LoadError::Fetch {
                        runtime: name.clone(),
                        source,
                    },
                })?;
            self.store.set(name, seq, configs);
            reloaded += 1;
        }
        counter!(RUNTIMES_RELOADED).increment(reloaded);

        let resp = self.store.config_resp();
        info!(
            version_id = %resp.version_id,
            reloaded,
            deleted = deleted.len(),
            configs = resp.configs.len(),
            "config version"
        );
        Ok(LoadOutcome::Updated(resp))
    }
}
