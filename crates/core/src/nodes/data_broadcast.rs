//! Data broadcast writer node
//!
//! Publishes every record as a JSON object on `channel_out`. Source and
//! metadata are left out; the image bytes are embedded (base64) only when
//! `include_image` is set.

use super::{Node, NodeFactory, NodeRole, Writer};
use crate::config::{BroadcastConfig, Timing};
use crate::data::{DataItem, DictOptions, RecordKind};
use crate::session::{Channels, Session};
use crate::transport::PubSubTransport;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;

/// Plugin name
pub const NODE_TYPE: &str = "redis-data-broadcast";

/// Broadcasts records as JSON
pub struct DataBroadcastWriter {
    params: Value,
    transport: Option<Arc<dyn PubSubTransport>>,
    session: Option<Session>,
    options: DictOptions,
}

impl DataBroadcastWriter {
    /// Create an uninitialized writer
    pub fn new(params: Value) -> Self {
        Self {
            params,
            transport: None,
            session: None,
            options: DictOptions::default(),
        }
    }

    /// Use an already connected transport instead of connecting to Redis
    pub fn with_transport(mut self, transport: Arc<dyn PubSubTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// JSON payload published for `item`
    pub fn render(&self, item: &DataItem) -> Result<Bytes> {
        let value = item.to_dict(self.options)?;
        Ok(Bytes::from(serde_json::to_vec(&value)?))
    }
}

#[async_trait]
impl Writer for DataBroadcastWriter {
    fn node_type(&self) -> &str {
        NODE_TYPE
    }

    fn accepts(&self) -> Vec<RecordKind> {
        RecordKind::ALL.to_vec()
    }

    async fn initialize(&mut self) -> Result<()> {
        let config = BroadcastConfig::from_params(&self.params)?;
        self.options = DictOptions {
            source: false,
            metadata: false,
            image: config.include_image,
        };

        let channels = Channels::outbound(&config.channel_out);
        let session = match &self.transport {
            Some(transport) => Session::with_transport(Arc::clone(transport), channels, Timing::default()),
            None => Session::open(&config.connection, channels, Timing::default()).await?,
        };

        tracing::info!(
            "{} initialized on {} (out='{}', include_image={})",
            NODE_TYPE,
            session.endpoint(),
            config.channel_out,
            config.include_image
        );

        self.session = Some(session);
        Ok(())
    }

    async fn write(&mut self, items: &[DataItem]) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::ConfigError(format!("{} used before initialize()", NODE_TYPE)))?;

        for item in items {
            let payload = self.render(item)?;
            let receivers = session.publish(payload).await?;
            tracing::debug!("Broadcast '{}' to {} subscriber(s)", item.image_name, receivers);
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            session.close().await?;
        }
        Ok(())
    }
}

/// Factory for [`DataBroadcastWriter`]
pub struct DataBroadcastWriterFactory;

impl NodeFactory for DataBroadcastWriterFactory {
    fn create(&self, params: &Value, transport: Option<Arc<dyn PubSubTransport>>) -> Result<Node> {
        let mut node = DataBroadcastWriter::new(params.clone());
        if let Some(transport) = transport {
            node = node.with_transport(transport);
        }
        Ok(Node::Writer(Box::new(node)))
    }

    fn node_type(&self) -> &str {
        NODE_TYPE
    }

    fn role(&self) -> NodeRole {
        NodeRole::Writer
    }

    fn description(&self) -> &str {
        "Broadcasts the data as JSON on a Redis channel."
    }
}
