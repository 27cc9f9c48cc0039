//! Prediction filter node
//!
//! Publishes each incoming image on `channel_out`, waits for the model's reply
//! on `channel_in` and attaches the converted prediction to the record.
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "node_type": "redis-predict-is",
//!   "params": {
//!     "redis_host": "localhost",
//!     "channel_out": "images",
//!     "channel_in": "predictions",
//!     "timeout": 5.0,
//!     "timeout_action": "passthrough",
//!     "image_format": "indexedpng",
//!     "labels": ["background", "road", "car"]
//!   }
//! }
//! ```

use super::{Filter, Node, NodeFactory, NodeRole};
use crate::bridge;
use crate::config::FilterConfig;
use crate::converters::{PredictionKind, ResponseConverter};
use crate::data::{DataItem, RecordKind};
use crate::policy::FilterTimeoutAction;
use crate::session::{Channels, Session};
use crate::transport::PubSubTransport;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Filter-mode bridge for one prediction kind
pub struct PredictFilter {
    kind: PredictionKind,
    params: Value,
    transport: Option<Arc<dyn PubSubTransport>>,
    state: Option<FilterState>,
}

struct FilterState {
    session: Session,
    converter: Box<dyn ResponseConverter>,
    action: FilterTimeoutAction,
}

impl PredictFilter {
    /// Create an uninitialized filter
    pub fn new(kind: PredictionKind, params: Value) -> Self {
        Self {
            kind,
            params,
            transport: None,
            state: None,
        }
    }

    /// Use an already connected transport instead of connecting to Redis
    pub fn with_transport(mut self, transport: Arc<dyn PubSubTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Prediction kind
    pub fn kind(&self) -> PredictionKind {
        self.kind
    }

    /// Session, once initialized
    pub fn session(&self) -> Option<&Session> {
        self.state.as_ref().map(|state| &state.session)
    }

    fn check_kind(&self, item: &DataItem) -> Result<()> {
        if item.kind != self.kind.record_kind() {
            return Err(Error::InvalidData(format!(
                "{} accepts {} records, got {} ('{}')",
                self.kind.node_type(),
                self.kind.record_kind(),
                item.kind,
                item.image_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Filter for PredictFilter {
    fn node_type(&self) -> &str {
        self.kind.node_type()
    }

    fn accepts(&self) -> Vec<RecordKind> {
        vec![self.kind.record_kind()]
    }

    fn generates(&self) -> Vec<RecordKind> {
        vec![self.kind.record_kind()]
    }

    async fn initialize(&mut self) -> Result<()> {
        let config = FilterConfig::from_params(&self.params)?;
        config.validate()?;
        let action = config.timeout_action()?;
        let converter = self.kind.converter(&self.params)?;

        let channels = Channels::request_response(&config.channel_out, &config.channel_in);
        let session = match &self.transport {
            Some(transport) => Session::with_transport(Arc::clone(transport), channels, config.timing()),
            None => Session::open(&config.connection, channels, config.timing()).await?,
        };

        tracing::info!(
            "{} initialized on {} (out='{}', in='{}', timeout={}, action={}, converter={})",
            self.kind.node_type(),
            session.endpoint(),
            config.channel_out,
            config.channel_in,
            config.timeout,
            action,
            converter.name()
        );

        self.state = Some(FilterState {
            session,
            converter,
            action,
        });
        Ok(())
    }

    async fn process(&mut self, batch: Vec<DataItem>) -> Result<Vec<DataItem>> {
        for item in &batch {
            self.check_kind(item)?;
        }
        let state = self.state.as_ref().ok_or_else(|| {
            Error::ConfigError(format!("{} used before initialize()", self.kind.node_type()))
        })?;

        bridge::request_batch(&state.session, state.converter.as_ref(), state.action, &batch).await
    }

    async fn finalize(&mut self) -> Result<()> {
        if let Some(state) = self.state.take() {
            state.session.close().await?;
        }
        Ok(())
    }
}

/// Factory for one prediction kind
pub struct PredictFilterFactory {
    kind: PredictionKind,
}

impl PredictFilterFactory {
    /// Create a factory
    pub fn new(kind: PredictionKind) -> Self {
        Self { kind }
    }
}

impl NodeFactory for PredictFilterFactory {
    fn create(&self, params: &Value, transport: Option<Arc<dyn PubSubTransport>>) -> Result<Node> {
        let mut node = PredictFilter::new(self.kind, params.clone());
        if let Some(transport) = transport {
            node = node.with_transport(transport);
        }
        Ok(Node::Filter(Box::new(node)))
    }

    fn node_type(&self) -> &str {
        self.kind.node_type()
    }

    fn role(&self) -> NodeRole {
        NodeRole::Filter
    }

    fn description(&self) -> &str {
        self.kind.description()
    }
}
