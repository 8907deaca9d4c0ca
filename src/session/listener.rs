//! Expired-key notification listener.
//!
//! Redis pub/sub and regular commands cannot share a connection, so the
//! listener owns a second, dedicated connection subscribed to the
//! `__keyevent@<db>__:expired` channel. Every message carries the name of a
//! key that just expired; idle sentinels among them are dispatched to
//! [`SessionStore::on_expiration`] on their own task so a slow pre-destroy
//! hook never stalls the notification stream.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::health::{NOTIFICATIONS_CHECK, ServiceState};
use crate::session::backend::KvBackend;
use crate::session::store::SessionStore;

/// Running expiry-notification subscription.
///
/// Dropping the handle stops the task (the stop channel closes and the task
/// unsubscribes on its way out); [`shutdown`](Self::shutdown) additionally
/// waits for that to complete.
pub struct ExpiryListener {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ExpiryListener {
    /// Subscribe to expired-key events on `redis_url` and start dispatching
    /// them to `store`.
    ///
    /// `db` selects the keyspace channel (`__keyevent@<db>__:expired`) and
    /// must match the database the command connection writes to. Signals the
    /// `redis-sub` readiness check once the subscription is established.
    pub async fn spawn<B: KvBackend>(
        redis_url: &str,
        db: i64,
        store: Arc<SessionStore<B>>,
        state: Arc<dyn ServiceState>,
    ) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url)?;
        let mut pubsub = client.get_async_pubsub().await?;
        let channel = format!("__keyevent@{db}__:expired");
        pubsub.subscribe(&channel).await?;

        info!(channel, "subscribed to expired-key notifications");
        state.signal_ready(NOTIFICATIONS_CHECK);

        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            // Stream end means the connection dropped; there
                            // is no resubscribe on this connection, so flag
                            // the check and stop.
                            error!(channel, "expired-key notification stream closed");
                            state.signal_not_ready(NOTIFICATIONS_CHECK);
                            break;
                        };
                        let expired_key: String = match msg.get_payload() {
                            Ok(key) => key,
                            Err(e) => {
                                warn!(error = %e, "undecodable expiry notification payload");
                                continue;
                            }
                        };
                        let store = Arc::clone(&store);
                        let channel = channel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = store.on_expiration(&channel, &expired_key).await {
                                warn!(expired_key, error = %e, "expiry handling failed");
                            }
                        });
                    }
                }
            }
            drop(messages);
            if let Err(e) = pubsub.unsubscribe(&channel).await {
                warn!(error = %e, "unsubscribe failed during listener shutdown");
            }
        });

        Ok(Self { stop, task })
    }

    /// Unsubscribe and wait for the listener task to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "expiry listener task ended abnormally");
        }
        info!("expiry listener stopped");
    }
}
