//! Redis pub/sub transport
//!
//! Publishing goes through a multiplexed connection that is opened eagerly,
//! so an unreachable server is reported when the session is opened rather
//! than on the first publish. Each subscription gets its own dedicated
//! pub/sub connection (`PSUBSCRIBE`), which is dropped on unsubscribe.

use super::{Message, PubSubTransport, Subscription};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};

/// Transport backed by a Redis server
pub struct RedisTransport {
    endpoint: String,
    client: redis::Client,
    connection: MultiplexedConnection,
    closed: AtomicBool,
}

impl RedisTransport {
    /// Connect to `redis://host:port/db`
    ///
    /// # Errors
    ///
    /// * `Error::Connection` - The server is unreachable or rejected the connection
    pub async fn connect(host: &str, port: u16, db: u32) -> Result<Self> {
        let endpoint = format!("redis://{}:{}/{}", host, port, db);

        let client = redis::Client::open(endpoint.as_str()).map_err(|e| Error::Connection {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Connection {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!("Connected to {}", endpoint);

        Ok(Self {
            endpoint,
            client,
            connection,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport(format!(
                "Connection to {} is closed",
                self.endpoint
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        self.ensure_open()?;

        let mut connection = self.connection.clone();
        let receivers: i64 = connection
            .publish(channel, payload.as_ref())
            .await
            .map_err(|e| Error::Transport(format!("PUBLISH to '{}' failed: {}", channel, e)))?;

        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;

        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            Error::Transport(format!(
                "Failed to open pub/sub connection to {}: {}",
                self.endpoint, e
            ))
        })?;

        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| Error::Transport(format!("PSUBSCRIBE '{}' failed: {}", pattern, e)))?;

        tracing::debug!("Subscribed to pattern '{}' on {}", pattern, self.endpoint);

        Ok(Box::new(RedisSubscription {
            pattern: pattern.to_string(),
            messages: Some(pubsub.into_on_message().boxed()),
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Closed connection to {}", self.endpoint);
        }
        Ok(())
    }
}

struct RedisSubscription {
    pattern: String,
    // Dropping the stream drops the dedicated pub/sub connection
    messages: Option<BoxStream<'static, redis::Msg>>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> Result<Option<Message>> {
        let Some(messages) = self.messages.as_mut() else {
            return Ok(None);
        };

        match messages.next().await {
            Some(msg) => Ok(Some(Message::new(
                msg.get_channel_name().to_string(),
                Bytes::copy_from_slice(msg.get_payload_bytes()),
            ))),
            None => {
                tracing::debug!("Pub/sub stream for '{}' ended", self.pattern);
                self.messages = None;
                Ok(None)
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if self.messages.take().is_some() {
            tracing::debug!("Released subscription on pattern '{}'", self.pattern);
        }
        Ok(())
    }
}
