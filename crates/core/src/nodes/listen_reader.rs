//! Image listen reader node
//!
//! Waits for images broadcast on `channel_in` and forwards each as a record of
//! the configured data type.

use super::{Node, NodeFactory, NodeRole, Reader};
use crate::bridge;
use crate::config::ReaderConfig;
use crate::converters::{ImageListenConverter, ReaderConverter};
use crate::data::{DataItem, RecordKind};
use crate::policy::ReaderTimeoutAction;
use crate::session::{Channels, Session};
use crate::transport::PubSubTransport;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// Plugin name
pub const NODE_TYPE: &str = "redis-image-listen";

/// Reader-mode bridge producing image records
pub struct ImageListenReader {
    params: Value,
    transport: Option<Arc<dyn PubSubTransport>>,
    session: Option<Session>,
    converter: Option<ImageListenConverter>,
    action: ReaderTimeoutAction,
}

impl ImageListenReader {
    /// Create an uninitialized reader
    pub fn new(params: Value) -> Self {
        Self {
            params,
            transport: None,
            session: None,
            converter: None,
            action: ReaderTimeoutAction::default(),
        }
    }

    /// Use an already connected transport instead of connecting to Redis
    pub fn with_transport(mut self, transport: Arc<dyn PubSubTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Session, once initialized
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Images received so far
    pub fn count(&self) -> u64 {
        self.converter.as_ref().map_or(0, |c| c.count())
    }
}

/// Whether a read error ends the stream
///
/// A payload that cannot be decoded affects only that payload.
fn ends_stream(error: &Error) -> bool {
    !matches!(error, Error::UnsupportedFormat { .. } | Error::InvalidData(_))
}

struct ReadState<'a> {
    session: &'a Session,
    converter: &'a mut ImageListenConverter,
    action: ReaderTimeoutAction,
    pending: VecDeque<DataItem>,
    done: bool,
}

#[async_trait]
impl Reader for ImageListenReader {
    fn node_type(&self) -> &str {
        NODE_TYPE
    }

    fn generates(&self) -> Vec<RecordKind> {
        match &self.converter {
            Some(converter) => vec![converter.kind()],
            None => RecordKind::ALL.to_vec(),
        }
    }

    async fn initialize(&mut self) -> Result<()> {
        let config = ReaderConfig::from_params(&self.params)?;
        config.validate()?;
        let action = config.timeout_action()?;
        let converter = ImageListenConverter::from_params(&self.params)?;

        let channels = Channels::inbound(&config.channel_in);
        let session = match &self.transport {
            Some(transport) => Session::with_transport(Arc::clone(transport), channels, config.timing()),
            None => Session::open(&config.connection, channels, config.timing()).await?,
        };

        tracing::info!(
            "{} initialized on {} (in='{}', timeout={}, action={}, data_type={})",
            NODE_TYPE,
            session.endpoint(),
            config.channel_in,
            config.timeout,
            action,
            converter.kind().data_type()
        );

        self.session = Some(session);
        self.converter = Some(converter);
        self.action = action;
        Ok(())
    }

    fn read(&mut self) -> Result<BoxStream<'_, Result<DataItem>>> {
        let (Some(session), Some(converter)) = (self.session.as_ref(), self.converter.as_mut()) else {
            return Err(Error::ConfigError(format!("{} used before initialize()", NODE_TYPE)));
        };

        let state = ReadState {
            session,
            converter,
            action: self.action,
            pending: VecDeque::new(),
            done: false,
        };

        Ok(stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((Ok(item), state));
                }
                if state.done {
                    return None;
                }
                let converter: &mut dyn ReaderConverter = &mut *state.converter;
                match bridge::receive_converted(state.session, converter, state.action).await {
                    Ok(Some(output)) => state.pending.extend(output),
                    Ok(None) => {
                        tracing::info!("{} stopped after timeout", NODE_TYPE);
                        state.done = true;
                    }
                    Err(e) => {
                        if ends_stream(&e) {
                            tracing::warn!("{} stream ended: {}", NODE_TYPE, e);
                            state.done = true;
                        }
                        return Some((Err(e), state));
                    }
                }
            }
        })
        .boxed())
    }

    async fn finalize(&mut self) -> Result<()> {
        self.converter = None;
        if let Some(session) = self.session.take() {
            session.close().await?;
        }
        Ok(())
    }
}

/// Factory for [`ImageListenReader`]
pub struct ImageListenReaderFactory;

impl NodeFactory for ImageListenReaderFactory {
    fn create(&self, params: &Value, transport: Option<Arc<dyn PubSubTransport>>) -> Result<Node> {
        let mut node = ImageListenReader::new(params.clone());
        if let Some(transport) = transport {
            node = node.with_transport(transport);
        }
        Ok(Node::Reader(Box::new(node)))
    }

    fn node_type(&self) -> &str {
        NODE_TYPE
    }

    fn role(&self) -> NodeRole {
        NodeRole::Reader
    }

    fn description(&self) -> &str {
        "Listens for images being broadcast and forwards them as the specified data type."
    }
}
