//! Redis Bridge Core - request/response calls over publish/subscribe
//!
//! This crate turns an asynchronous pub/sub channel pair into a synchronous,
//! timeout-bounded call: a record is published on an outbound channel, the
//! reply is awaited on an inbound channel, and the result is either the
//! converted reply or whatever the timeout policy prescribes.
//!
//! # Architecture
//!
//! ```text
//! Filter / Reader / Writer nodes
//!          │
//!          ▼
//!   bridge (call state machine) ──> converters (reply -> DataItem)
//!          │
//!          ▼
//!   Session ──> Listener (one background subscription per call)
//!          │
//!          ▼
//!   PubSubTransport (Redis, in-memory)
//! ```
//!
//! - [`session::Session`] owns the connection, channel names and timing
//! - [`listener`] captures exactly one reply per call and releases its
//!   subscription before handing the reply over
//! - [`bridge`] arms, publishes, waits, tears down and applies the policy
//! - [`converters`] decode classification, detection, segmentation and
//!   depth replies
//! - [`nodes`] wrap all of the above as pipeline filters, readers and writers
//!
//! # Example
//!
//! ```ignore
//! use redis_bridge_core::nodes::{Filter, PredictFilter};
//! use redis_bridge_core::converters::PredictionKind;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> redis_bridge_core::Result<()> {
//!     let mut filter = PredictFilter::new(
//!         PredictionKind::Classification,
//!         json!({"channel_out": "images", "channel_in": "predictions", "timeout": 0.2}),
//!     );
//!     filter.initialize().await?;
//!     let results = filter.process(load_images()?).await?;
//!     filter.finalize().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod config;
pub mod converters;
pub mod data;
mod error;
pub mod listener;
pub mod nodes;
pub mod policy;
pub mod session;
pub mod transport;

pub use error::{Error, Result};

pub use bridge::CallOutcome;
pub use config::{BroadcastConfig, ConnectionConfig, FilterConfig, ReaderConfig, Timing};
pub use data::{Annotation, DataItem, RecordKind};
pub use policy::{FilterTimeoutAction, ReaderTimeoutAction};
pub use session::{CallState, Channels, Session};

/// Install a `tracing` subscriber honouring `RUST_LOG` (default "info")
///
/// Fails if a global subscriber is already installed.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| Error::ConfigError(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::info!("Redis bridge core initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // Second call reports the existing subscriber instead of panicking
        init().ok();
        init().ok();
    }
}
