//! Change notification for the config map.
//!
//! The pubsub watcher wakes on `OBJECT_FINALIZE` events for `*/seq` objects in
//! the config bucket. The poller wakes on a jittered timer and is used when the
//! pubsub watcher can not be set up.
use crate::metrics_defs::PUBSUB_RECEIVE_ERROR;
use crate::pubsub::{Message, PubsubError, Subscription};
use crate::storage::base_name;
use async_trait::async_trait;
use rand::Rng;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const OBJECT_FINALIZE: &str = "OBJECT_FINALIZE";
const SEQ_OBJECT: &str = "seq";
const MAX_MESSAGES: u32 = 100;
const MESSAGE_BUFFER: usize = 64;
const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
const POLL_JITTER: f64 = 0.2;

#[derive(thiserror::Error, Debug)]
pub enum WatchError {
    #[error("watcher closed")]
    Closed,

    #[error("watch cancelled")]
    Cancelled,

    #[error("subscription error: {0}")]
    Pubsub(#[from] PubsubError),
}

#[async_trait]
pub trait ConfigMapWatcher: Send + Sync {
    /// Waits until the config map may have changed.
    async fn next(&self, cancel: &CancellationToken) -> Result<(), WatchError>;

    /// Releases the watcher. Pending and later calls to `next` return
    /// `WatchError::Closed`.
    async fn close(&self) -> Result<(), WatchError>;
}

fn is_seq_update(msg: &Message) -> bool {
    msg.attribute("eventType") == OBJECT_FINALIZE
        && base_name(msg.attribute("objectId")) == SEQ_OBJECT
}

/// Watches the bucket's notification topic through a dedicated subscription.
pub struct PubsubWatcher {
    subscription: Arc<dyn Subscription>,
    stop: CancellationToken,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl PubsubWatcher {
    /// Starts the receive loop on `subscription`.
    pub fn start(subscription: Arc<dyn Subscription>) -> Self {
        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        let stop = CancellationToken::new();
        tokio::spawn(receive_loop(subscription.clone(), tx, stop.clone()));

        PubsubWatcher {
            subscription,
            stop,
            rx: Mutex::new(Some(rx)),
        }
    }

    // Notifications are only triggers, so acking is unconditional and a
    // failed ack merely causes a redelivery.
    async fn ack(&self, ack_ids: &[String]) {
        if let Err(err) = self.subscription.acknowledge(ack_ids).await {
            warn!(error = %err, count = ack_ids.len(), "failed to ack messages");
        }
    }
}

async fn receive_loop(
    subscription: Arc<dyn Subscription>,
    tx: mpsc::Sender<Message>,
    stop: CancellationToken,
) {
    info!(subscription = subscription.name(), "watch start");
    let mut retries: u32 = 0;

    'receive: loop {
        let pulled = tokio::select! {
            _ = stop.cancelled() => break,
            pulled = subscription.pull(MAX_MESSAGES) => pulled,
        };

        match pulled {
            Ok(messages) => {
                retries = 0;
                for msg in messages {
                    debug!(message_id = %msg.id, "receive message");
                    tokio::select! {
                        _ = stop.cancelled() => break 'receive,
                        sent = tx.send(msg) => {
                            if sent.is_err() {
                                break 'receive;
                            }
                        }
                    }
                }
            }
            Err(err) if err.is_retriable() => {
                counter!(PUBSUB_RECEIVE_ERROR).increment(1);
                let delay = BASE_RETRY_DELAY
                    .saturating_mul(2_u32.saturating_pow(retries))
                    .min(MAX_RETRY_DELAY);
                retries = retries.saturating_add(1);
                warn!(error = %err, ?delay, retries, "receive failed, retrying");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => {
                counter!(PUBSUB_RECEIVE_ERROR).increment(1);
                error!(error = %err, "receive failed, giving up");
                break;
            }
        }
    }

    info!(subscription = subscription.name(), "watch finished");
}

#[async_trait]
impl ConfigMapWatcher for PubsubWatcher {
    async fn next(&self, cancel: &CancellationToken) -> Result<(), WatchError> {
        let mut guard = tokio::select! {
            _ = cancel.cancelled() => return Err(WatchError::Cancelled),
            guard = self.rx.lock() => guard,
        };
        let rx = guard.as_mut().ok_or(WatchError::Closed)?;

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return Err(WatchError::Cancelled),
                msg = rx.recv() => msg.ok_or(WatchError::Closed)?,
            };
            debug!(
                message_id = %msg.id,
                event_type = msg.attribute("eventType"),
                object_id = msg.attribute("objectId"),
                "handle message"
            );
            self.ack(std::slice::from_ref(&msg.ack_id)).await;

            if !is_seq_update(&msg) {
                continue;
            }
            info!(
                object_id = msg.attribute("objectId"),
                generation = msg.attribute("objectGeneration"),
                event_time = msg.attribute("eventTime"),
                publish_time = msg.publish_time.as_deref().unwrap_or(""),
                "config map updated"
            );

            // Everything already queued predates the reload the caller is
            // about to do, so it is acked without waking again.
            let mut drained = Vec::new();
            while let Ok(pending) = rx.try_recv() {
                debug!(message_id = %pending.id, "drain message");
                drained.push(pending.ack_id);
            }
            if !drained.is_empty() {
                self.ack(&drained).await;
            }
            return Ok(());
        }
    }

    async fn close(&self) -> Result<(), WatchError> {
        info!(subscription = self.subscription.name(), "watcher close");
        self.stop.cancel();

        if let Some(mut rx) = self.rx.lock().await.take() {
            let subscription = self.subscription.clone();
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    debug!(message_id = %msg.id, "drain message");
                    if let Err(err) = subscription
                        .acknowledge(std::slice::from_ref(&msg.ack_id))
                        .await
                    {
                        warn!(error = %err, "failed to ack drained message");
                    }
                }
            });
        }

        info!(subscription = self.subscription.name(), "delete subscription");
        self.subscription.delete().await?;
        Ok(())
    }
}

/// Wakes every `base_delay` ±20%.
pub struct Poller {
    base_delay: Duration,
    closed: CancellationToken,
}

impl Poller {
    pub fn new(base_delay: Duration) -> Self {
        Poller {
            base_delay,
            closed: CancellationToken::new(),
        }
    }

    fn jittered_delay(&self) -> Duration {
        let factor = 1.0 + rand::thread_rng().gen_range(-POLL_JITTER..=POLL_JITTER);
        self.base_delay.mul_f64(factor)
    }
}

#[async_trait]
impl ConfigMapWatcher for Poller {
    async fn next(&self, cancel: &CancellationToken) -> Result<(), WatchError> {
        let delay = self.jittered_delay();
        info!(?delay, "poll wait");
        tokio::select! {
            _ = cancel.cancelled() => Err(WatchError::Cancelled),
            _ = self.closed.cancelled() => Err(WatchError::Closed),
            // The loader may still find no seq change.
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), WatchError> {
        info!("poller close");
        self.closed.cancel();
        Ok(())
    }
}
