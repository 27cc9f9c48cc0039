//! In-process pub/sub broker
//!
//! Fan-out is a `tokio::sync::broadcast` channel; each subscription filters
//! the feed with a Redis-style glob pattern. Clones share the same broker, so
//! a test can hand one clone to a session and publish replies through another.

use super::{Message, PubSubTransport, Subscription};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use glob::Pattern;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};

/// Default number of messages buffered per subscriber
const DEFAULT_CAPACITY: usize = 1024;

/// Process-local publish/subscribe broker
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    sender: broadcast::Sender<Message>,
    closed_tx: watch::Sender<bool>,
    patterns: Mutex<HashMap<u64, Pattern>>,
    next_id: AtomicU64,
}

impl Inner {
    fn remove(&self, id: u64) -> bool {
        self.patterns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

impl InMemoryTransport {
    /// Create a broker with the default per-subscriber buffer
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broker buffering up to `capacity` messages per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                sender,
                closed_tx,
                patterns: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Number of subscriptions that have not been released
    pub fn subscription_count(&self) -> usize {
        self.inner
            .patterns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubTransport for InMemoryTransport {
    fn endpoint(&self) -> String {
        "memory://".to_string()
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Transport("In-memory transport is closed".into()));
        }

        let receivers = self
            .inner
            .patterns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|pattern| pattern.matches(channel))
            .count();

        // No receivers is not an error, same as PUBLISH on a quiet Redis channel
        let _ = self.inner.sender.send(Message::new(channel, payload));
        tracing::trace!("Published on '{}' to {} subscriber(s)", channel, receivers);
        Ok(receivers)
    }

    async fn subscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>> {
        if self.is_closed() {
            return Err(Error::Transport("In-memory transport is closed".into()));
        }

        let compiled = Pattern::new(pattern).map_err(|e| {
            Error::ConfigError(format!("Invalid channel pattern '{}': {}", pattern, e))
        })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        // Receiver is created before registration, so nothing published after
        // this call returns can be missed.
        let receiver = self.inner.sender.subscribe();
        self.inner
            .patterns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, compiled.clone());

        tracing::debug!("In-memory subscription {} on pattern '{}'", id, pattern);

        Ok(Box::new(InMemorySubscription {
            id,
            pattern: compiled,
            receiver,
            closed_rx: self.inner.closed_tx.subscribe(),
            inner: Arc::clone(&self.inner),
            active: true,
        }))
    }

    async fn close(&self) -> Result<()> {
        // send_replace never fails, even without receivers
        let was_closed = self.inner.closed_tx.send_replace(true);
        if !was_closed {
            tracing::debug!("In-memory transport closed");
        }
        Ok(())
    }
}

struct InMemorySubscription {
    id: u64,
    pattern: Pattern,
    receiver: broadcast::Receiver<Message>,
    closed_rx: watch::Receiver<bool>,
    inner: Arc<Inner>,
    active: bool,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            if !self.active || *self.closed_rx.borrow() {
                return Ok(None);
            }

            tokio::select! {
                changed = self.closed_rx.changed() => {
                    if changed.is_err() || *self.closed_rx.borrow() {
                        return Ok(None);
                    }
                }
                received = self.receiver.recv() => match received {
                    Ok(message) if self.pattern.matches(&message.channel) => {
                        return Ok(Some(message));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "In-memory subscription {} lagged, {} message(s) skipped",
                            self.id,
                            skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(None),
                },
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if self.active {
            self.active = false;
            self.inner.remove(self.id);
            tracing::debug!("In-memory subscription {} released", self.id);
        }
        Ok(())
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        if self.active {
            self.inner.remove(self.id);
        }
    }
}
