use crate::loader::{ConfigMapLoader, LoadError, LoadOutcome};
use crate::types::ConfigResp;
use crate::watcher::{ConfigMapWatcher, WatchError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Publishes the latest config response to subscribers.
pub struct ConfigServer {
    loader: Arc<ConfigMapLoader>,
    retry_delay: Duration,
    tx: watch::Sender<Option<Arc<ConfigResp>>>,
}

impl ConfigServer {
    pub fn new(loader: Arc<ConfigMapLoader>, retry_delay: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        ConfigServer {
            loader,
            retry_delay,
            tx,
        }
    }

    /// `None` until the first load succeeds.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ConfigResp>>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<Arc<ConfigResp>> {
        self.tx.borrow().clone()
    }

    /// Runs one load and publishes the result if anything changed.
    pub async fn load(
        &self,
        cancel: &CancellationToken,
        force: bool,
    ) -> Result<LoadOutcome, LoadError> {
        let outcome = self.loader.load(cancel, force).await?;
        if let LoadOutcome::Updated(resp) = &outcome {
            self.tx.send_replace(Some(Arc::new(resp.clone())));
        }
        Ok(outcome)
    }

    /// Loads once, then reloads on every change signalled by `watcher` until
    /// `cancel` fires or the watcher closes.
    ///
    /// Loads are forced until one succeeds. Failed loads are retried after
    /// the retry delay.
    pub async fn run(&self, cancel: &CancellationToken, watcher: &dyn ConfigMapWatcher) {
        let mut force = true;
        loop {
            match self.load(cancel, force).await {
                Ok(LoadOutcome::Updated(resp)) => {
                    info!(version_id = %resp.version_id, configs = resp.configs.len(), "published configs");
                    force = false;
                }
                Ok(LoadOutcome::NoUpdate) => info!("configmap no update"),
                Err(LoadError::Cancelled) => break,
                Err(err) => {
                    error!(error = %err, retry_delay = ?self.retry_delay, "failed to load configmap");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_delay) => continue,
                    }
                }
            }

            match watcher.next(cancel).await {
                Ok(()) => {}
                Err(WatchError::Cancelled) => break,
                Err(WatchError::Closed) => {
                    warn!("configmap watcher closed");
                    break;
                }
                Err(err) => error!(error = %err, "configmap watcher error"),
            }
        }
        info!("config server stopped");
    }
}
