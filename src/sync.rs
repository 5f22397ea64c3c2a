//! Cross-instance state synchronization.
//!
//! Every live limiter owns a [`Synchronizer`]: a publisher task draining an
//! outbox of encoded updates onto the limiter's channel, and a receive loop
//! merging updates published by other instances. Both run off the decision
//! path and stop when the synchronizer is closed.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::limiter::{Limiter, MergeOutcome};
use crate::store::{StoreGateway, Subscription};

/// Process-wide identity used to recognize self-originated updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(Arc<str>);

impl InstanceId {
    /// Generate a random identity. Call once at startup.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string().into())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Publish/subscribe pair of one live limiter.
pub struct Synchronizer {
    channel: String,
    outbox: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("channel", &self.channel)
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Synchronizer {
    /// Subscribe to `channel` and start the publisher and receive tasks on
    /// `tasks`.
    ///
    /// A failed subscription is logged, not returned: the limiter keeps
    /// deciding locally and keeps publishing, it just stops hearing peers.
    pub async fn start(
        store: Arc<dyn StoreGateway>,
        channel: String,
        instance: InstanceId,
        state: Arc<Mutex<Limiter>>,
        tasks: &TaskTracker,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (outbox, pending) = mpsc::unbounded_channel();

        match store.subscribe(&channel).await {
            Ok(subscription) => {
                tasks.spawn(receive_loop(
                    subscription,
                    channel.clone(),
                    instance,
                    state,
                    cancel.clone(),
                ));
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Failed to subscribe to limiter updates");
            }
        }
        tasks.spawn(publish_loop(store, channel.clone(), pending, cancel.clone()));

        Self {
            channel,
            outbox,
            cancel,
        }
    }

    /// Queue an encoded update for broadcast. Never blocks.
    pub fn publish(&self, payload: String) {
        if self.outbox.send(payload).is_err() {
            trace!(channel = %self.channel, "Dropping update for closed synchronizer");
        }
    }

    /// Stop both tasks and close the subscription.
    ///
    /// Updates queued before the call are still published; later ones are
    /// dropped.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The channel this synchronizer publishes to and listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

async fn publish_loop(
    store: Arc<dyn StoreGateway>,
    channel: String,
    mut pending: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                pending.close();
                while let Ok(payload) = pending.try_recv() {
                    publish_one(store.as_ref(), &channel, payload).await;
                }
                break;
            }
            payload = pending.recv() => match payload {
                Some(payload) => publish_one(store.as_ref(), &channel, payload).await,
                None => break,
            },
        }
    }
    trace!(channel = %channel, "Publisher stopped");
}

async fn publish_one(store: &dyn StoreGateway, channel: &str, payload: String) {
    if let Err(e) = store.publish(channel, payload).await {
        warn!(channel = %channel, error = %e, "Failed to publish limiter update");
    }
}

async fn receive_loop(
    mut subscription: Subscription,
    channel: String,
    instance: InstanceId,
    state: Arc<Mutex<Limiter>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            payload = subscription.next() => match payload {
                Some(payload) => {
                    let outcome = state.lock().apply_update(&instance, &payload);
                    match outcome {
                        MergeOutcome::Applied => trace!(channel = %channel, "Merged peer update"),
                        MergeOutcome::Malformed => {
                            trace!(channel = %channel, "Dropped malformed update")
                        }
                        MergeOutcome::Stale | MergeOutcome::SelfOriginated => {}
                    }
                }
                None => {
                    debug!(channel = %channel, "Subscription ended");
                    break;
                }
            },
        }
    }
    drop(subscription);
    trace!(channel = %channel, "Receive loop stopped");
}
