//! Publish/subscribe transport abstraction
//!
//! The bridge only needs three things from the broker: publish a payload on a
//! channel, subscribe to a channel pattern, and release that subscription
//! again. Everything else (delivery guarantees, persistence, clustering) is
//! the broker's business.
//!
//! # Architecture
//!
//! ```text
//! Session ──publish()──────────────> PubSubTransport ──> broker
//!    │                                     │
//!    └── Listener ──subscribe(pattern)──> Subscription <── broker
//! ```
//!
//! Two implementations are provided:
//! - [`RedisTransport`] talks to a Redis server (feature `redis-transport`)
//! - [`InMemoryTransport`] is a process-local broker used for tests and dry runs

use crate::config::ConnectionConfig;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub mod memory;
#[cfg(feature = "redis-transport")]
pub mod redis;

pub use memory::InMemoryTransport;
#[cfg(feature = "redis-transport")]
pub use self::redis::RedisTransport;

/// A message received on a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message was published on
    pub channel: String,
    /// Raw payload
    pub payload: Bytes,
}

impl Message {
    /// Create a message
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Connection to a publish/subscribe service
///
/// # Thread Safety
///
/// Implementations must be Send + Sync; the session shares the transport
/// with the listener task it spawns.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Endpoint description for logging ("redis://host:port/db", "memory://")
    fn endpoint(&self) -> String;

    /// Publish a payload, returning the number of subscribers that received it
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize>;

    /// Subscribe to a channel pattern (Redis glob syntax)
    ///
    /// The subscription is established when this returns, so a message
    /// published afterwards is guaranteed to be seen.
    async fn subscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>>;

    /// Release the connection
    ///
    /// Must be idempotent.
    async fn close(&self) -> Result<()>;
}

/// An active pattern subscription
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message
    ///
    /// # Returns
    ///
    /// * `Ok(Some(message))` - A message matching the pattern
    /// * `Ok(None)` - The subscription was released or the transport closed
    /// * `Err(Error)` - Transport failure
    async fn next_message(&mut self) -> Result<Option<Message>>;

    /// Release the subscription
    ///
    /// Calling this more than once is a no-op.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Open a Redis transport for the given connection settings
///
/// Fails with `Error::Connection` when the server cannot be reached; there is
/// no retry here, retry policy belongs to the caller.
#[cfg(feature = "redis-transport")]
pub async fn connect(config: &ConnectionConfig) -> Result<Arc<dyn PubSubTransport>> {
    let transport =
        RedisTransport::connect(&config.redis_host, config.redis_port, config.redis_db).await?;
    Ok(Arc::new(transport))
}

/// Without the Redis feature there is nothing to connect to
#[cfg(not(feature = "redis-transport"))]
pub async fn connect(config: &ConnectionConfig) -> Result<Arc<dyn PubSubTransport>> {
    Err(crate::Error::ConfigError(format!(
        "Cannot connect to {}: Redis support not enabled - compile with 'redis-transport' feature",
        config.endpoint()
    )))
}
