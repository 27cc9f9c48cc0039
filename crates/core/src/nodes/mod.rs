//! Pipeline nodes
//!
//! The bridge is exposed to a pipeline host through three node roles:
//!
//! - [`Filter`]: receives batches and returns the converted results
//!   (`redis-predict-ic`, `redis-predict-od`, `redis-predict-is`, `redis-predict-dp`)
//! - [`Reader`]: produces a lazy stream of records (`redis-image-listen`)
//! - [`Writer`]: consumes records (`redis-data-broadcast`)
//!
//! Nodes are created by name through the [`NodeRegistry`]. Creating a node
//! only stores its parameters; options are validated and the session is
//! opened in `initialize()`, which is where configuration errors surface.

use crate::data::{DataItem, RecordKind};
use crate::transport::PubSubTransport;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub mod data_broadcast;
pub mod listen_reader;
pub mod predict_filter;

pub use data_broadcast::{DataBroadcastWriter, DataBroadcastWriterFactory};
pub use listen_reader::{ImageListenReader, ImageListenReaderFactory};
pub use predict_filter::{PredictFilter, PredictFilterFactory};

/// Request/response node
#[async_trait]
pub trait Filter: Send + Sync {
    /// Registered plugin name
    fn node_type(&self) -> &str;

    /// Record kinds accepted by `process`
    fn accepts(&self) -> Vec<RecordKind>;

    /// Record kinds produced by `process`
    fn generates(&self) -> Vec<RecordKind>;

    /// Validate options and open the session
    ///
    /// # Errors
    ///
    /// * `Error::Connection` - Service unreachable
    /// * `Error::ConfigError` / `Error::UnhandledPolicy` - Invalid options
    async fn initialize(&mut self) -> Result<()>;

    /// Process a batch, one bridge call per item, preserving order
    async fn process(&mut self, batch: Vec<DataItem>) -> Result<Vec<DataItem>>;

    /// Close the session
    async fn finalize(&mut self) -> Result<()>;
}

/// Source node producing records as they arrive
#[async_trait]
pub trait Reader: Send {
    /// Registered plugin name
    fn node_type(&self) -> &str;

    /// Record kinds produced
    fn generates(&self) -> Vec<RecordKind>;

    /// Validate options and open the session
    async fn initialize(&mut self) -> Result<()>;

    /// Lazy stream of records
    ///
    /// The stream ends only when the timeout policy says so or the transport
    /// goes away. Calling `read()` again starts a new stream.
    fn read(&mut self) -> Result<BoxStream<'_, Result<DataItem>>>;

    /// Close the session
    async fn finalize(&mut self) -> Result<()>;
}

/// Sink node
#[async_trait]
pub trait Writer: Send + Sync {
    /// Registered plugin name
    fn node_type(&self) -> &str;

    /// Record kinds accepted
    fn accepts(&self) -> Vec<RecordKind>;

    /// Validate options and open the session
    async fn initialize(&mut self) -> Result<()>;

    /// Write a batch
    async fn write(&mut self, items: &[DataItem]) -> Result<()>;

    /// Close the session
    async fn finalize(&mut self) -> Result<()>;
}

/// Role a node plays in a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Request/response
    Filter,
    /// Source
    Reader,
    /// Sink
    Writer,
}

impl NodeRole {
    /// Convert to string for logging/display
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Filter => "filter",
            NodeRole::Reader => "reader",
            NodeRole::Writer => "writer",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A created node
pub enum Node {
    /// Request/response node
    Filter(Box<dyn Filter>),
    /// Source node
    Reader(Box<dyn Reader>),
    /// Sink node
    Writer(Box<dyn Writer>),
}

impl Node {
    /// Role of the node
    pub fn role(&self) -> NodeRole {
        match self {
            Node::Filter(_) => NodeRole::Filter,
            Node::Reader(_) => NodeRole::Reader,
            Node::Writer(_) => NodeRole::Writer,
        }
    }

    /// Registered plugin name
    pub fn node_type(&self) -> &str {
        match self {
            Node::Filter(node) => node.node_type(),
            Node::Reader(node) => node.node_type(),
            Node::Writer(node) => node.node_type(),
        }
    }

    /// Unwrap as a filter
    pub fn into_filter(self) -> Result<Box<dyn Filter>> {
        match self {
            Node::Filter(node) => Ok(node),
            other => Err(other.wrong_role(NodeRole::Filter)),
        }
    }

    /// Unwrap as a reader
    pub fn into_reader(self) -> Result<Box<dyn Reader>> {
        match self {
            Node::Reader(node) => Ok(node),
            other => Err(other.wrong_role(NodeRole::Reader)),
        }
    }

    /// Unwrap as a writer
    pub fn into_writer(self) -> Result<Box<dyn Writer>> {
        match self {
            Node::Writer(node) => Ok(node),
            other => Err(other.wrong_role(NodeRole::Writer)),
        }
    }

    fn wrong_role(&self, expected: NodeRole) -> Error {
        Error::ConfigError(format!(
            "Node '{}' is a {}, not a {}",
            self.node_type(),
            self.role(),
            expected
        ))
    }
}

/// Factory for one plugin name
pub trait NodeFactory: Send + Sync {
    /// Create a node
    ///
    /// # Arguments
    /// * `params` - Node parameters (connection, channels, timing, converter options)
    /// * `transport` - Already connected transport to use instead of connecting
    ///   to Redis in `initialize()`
    fn create(&self, params: &Value, transport: Option<Arc<dyn PubSubTransport>>) -> Result<Node>;

    /// Plugin name this factory creates
    fn node_type(&self) -> &str;

    /// Role of the created nodes
    fn role(&self) -> NodeRole;

    /// One-line description
    fn description(&self) -> &str;
}

/// Registry of node factories keyed by plugin name
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under its node type
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        self.factories.insert(node_type, factory);
    }

    /// Create a node by plugin name
    pub fn create_node(&self, node_type: &str, params: &Value) -> Result<Node> {
        self.create_node_with_transport(node_type, params, None)
    }

    /// Create a node by plugin name on an existing transport
    pub fn create_node_with_transport(
        &self,
        node_type: &str,
        params: &Value,
        transport: Option<Arc<dyn PubSubTransport>>,
    ) -> Result<Node> {
        let factory = self.factories.get(node_type).ok_or_else(|| {
            Error::ConfigError(format!(
                "No node factory registered for type '{}'. Available types: {:?}",
                node_type,
                self.list_types()
            ))
        })?;

        factory.create(params, transport)
    }

    /// Check if a node type is registered
    pub fn has_node_type(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Role and description of a node type
    pub fn describe(&self, node_type: &str) -> Option<(NodeRole, String)> {
        self.factories
            .get(node_type)
            .map(|factory| (factory.role(), factory.description().to_string()))
    }

    /// List all registered node types, sorted
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        create_default_registry()
    }
}

/// Registry with every built-in node
pub fn create_default_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();

    for kind in crate::converters::PredictionKind::ALL {
        registry.register(Arc::new(PredictFilterFactory::new(kind)));
    }
    registry.register(Arc::new(ImageListenReaderFactory));
    registry.register(Arc::new(DataBroadcastWriterFactory));

    registry
}
