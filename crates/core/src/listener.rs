//! Subscription listener
//!
//! A listener is a background task that owns one subscription and captures
//! the first message it yields. As soon as the message arrives the task
//! releases the subscription and then resolves a one-shot slot, so by the
//! time the waiting call sees the payload no subscription is left behind.
//!
//! [`ListenerHandle::cancel`] is the forced-teardown path used on timeout.
//! It waits until the task has released its subscription and may be called
//! any number of times, before or after the listener fired. Dropping a handle
//! aborts a task that is still running.

use crate::transport::{Message, PubSubTransport};
use crate::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Handle to an armed listener
pub struct ListenerHandle {
    channel: String,
    reply_rx: Option<oneshot::Receiver<Result<Message>>>,
    cancel_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Decrements the session's active-listener count however the task ends
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Subscribe to `channel_in` and start the listener task
///
/// Returns only after the subscription is established, so a request published
/// afterwards cannot race ahead of it.
pub(crate) async fn arm(
    transport: Arc<dyn PubSubTransport>,
    channel_in: &str,
    active: Arc<AtomicUsize>,
) -> Result<ListenerHandle> {
    let mut subscription = transport.subscribe(channel_in).await?;

    let (reply_tx, reply_rx) = oneshot::channel::<Result<Message>>();
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

    active.fetch_add(1, Ordering::AcqRel);
    let active_guard = ActiveGuard(active);
    let channel = channel_in.to_string();
    let task_channel = channel.clone();

    let task = tokio::spawn(async move {
        let _active = active_guard;

        let received = tokio::select! {
            biased;
            // A dropped sender counts as cancellation too
            _ = &mut cancel_rx => None,
            next = subscription.next_message() => Some(next),
        };

        if let Err(e) = subscription.unsubscribe().await {
            tracing::warn!("Failed to release subscription on '{}': {}", task_channel, e);
        }
        drop(subscription);

        match received {
            None => tracing::debug!("Listener on '{}' cancelled", task_channel),
            Some(next) => {
                let reply = match next {
                    Ok(Some(message)) => {
                        tracing::debug!(
                            "Listener on '{}' captured {} byte(s) from '{}'",
                            task_channel,
                            message.payload.len(),
                            message.channel
                        );
                        Ok(message)
                    }
                    Ok(None) => Err(Error::ListenerTerminated(format!(
                        "subscription on '{}' closed",
                        task_channel
                    ))),
                    Err(e) => Err(e),
                };
                // The call may already have given up on this reply
                if reply_tx.send(reply).is_err() {
                    tracing::warn!("Late reply on '{}' discarded", task_channel);
                }
            }
        }
    });

    tracing::debug!("Listener armed on '{}'", channel);

    Ok(ListenerHandle {
        channel,
        reply_rx: Some(reply_rx),
        cancel_tx: Some(cancel_tx),
        task: Some(task),
    })
}

impl ListenerHandle {
    /// Inbound channel pattern this listener is subscribed to
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait up to `limit` for the reply
    ///
    /// # Returns
    ///
    /// * `Some(Ok(message))` - The listener fired
    /// * `Some(Err(e))` - The listener ended without a reply, or was cancelled
    /// * `None` - Nothing yet; call again
    pub async fn wait_for(&mut self, limit: Duration) -> Option<Result<Message>> {
        let Some(reply_rx) = self.reply_rx.as_mut() else {
            return Some(Err(Error::ListenerTerminated(format!(
                "listener on '{}' already resolved",
                self.channel
            ))));
        };

        match tokio::time::timeout(limit, reply_rx).await {
            Ok(Ok(reply)) => {
                self.reply_rx = None;
                Some(reply)
            }
            Ok(Err(_)) => {
                self.reply_rx = None;
                Some(Err(Error::ListenerTerminated(format!(
                    "listener task on '{}' ended",
                    self.channel
                ))))
            }
            Err(_elapsed) => None,
        }
    }

    /// Stop the listener and wait until its subscription is released
    ///
    /// Safe to call after the listener fired and safe to call repeatedly.
    /// A reply that arrives during cancellation is discarded.
    pub async fn cancel(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            // Err means the task already finished
            let _ = cancel_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!("Listener task on '{}' failed: {}", self.channel, e);
                }
            }
        }
        self.reply_rx = None;
    }

    /// Whether the background task has ended
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
