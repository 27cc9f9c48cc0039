//! Mock model service for bridge tests
//!
//! Listens for requests on the outbound channel of an in-memory transport and
//! publishes replies on the inbound channel, the way a model server sitting
//! on Redis would.
//!
//! # Usage
//!
//! ```ignore
//! let transport = InMemoryTransport::new();
//! let responder = MockResponder::start(&transport, "images", "predictions", |index, _request| {
//!     Some((Duration::from_millis(50), Bytes::from(format!("{{\"n\":{}}}", index))))
//! })
//! .await;
//!
//! // Run the filter against the same transport...
//!
//! responder.shutdown().await;
//! ```

#![allow(dead_code)]

use bytes::Bytes;
use redis_bridge_core::transport::{InMemoryTransport, PubSubTransport, Subscription};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Decides the reply for the n-th request (0-based); `None` stays silent
pub type ReplyFn = dyn Fn(usize, &Bytes) -> Option<(Duration, Bytes)> + Send + Sync;

/// Mock model service
pub struct MockResponder {
    requests: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockResponder {
    /// Start answering requests on `channel_out` with replies on `channel_in`
    ///
    /// The request subscription is established before this returns.
    pub async fn start<F>(transport: &InMemoryTransport, channel_out: &str, channel_in: &str, reply: F) -> Self
    where
        F: Fn(usize, &Bytes) -> Option<(Duration, Bytes)> + Send + Sync + 'static,
    {
        let reply: Arc<ReplyFn> = Arc::new(reply);
        let mut subscription = transport
            .subscribe(channel_out)
            .await
            .expect("mock responder subscribe");
        let requests = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let transport = transport.clone();
        let channel_in = channel_in.to_string();
        let counter = Arc::clone(&requests);

        let handle = tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    next = subscription.next_message() => match next {
                        Ok(Some(message)) => message,
                        _ => break,
                    },
                };

                let index = counter.fetch_add(1, Ordering::SeqCst);
                if let Some((delay, payload)) = reply(index, &request.payload) {
                    tokio::time::sleep(delay).await;
                    let _ = transport.publish(&channel_in, payload).await;
                }
            }
            let _ = subscription.unsubscribe().await;
        });

        Self {
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Answer every request with the same payload after `delay`
    pub async fn always(transport: &InMemoryTransport, reply: &'static [u8], delay: Duration) -> Self {
        Self::start(transport, "images", "predictions", move |_, _| {
            Some((delay, Bytes::from_static(reply)))
        })
        .await
    }

    /// Number of requests seen so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Stop the responder and wait for it to release its subscription
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for MockResponder {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Encode a small RGB image in the given format
pub fn encoded_image(width: u32, height: u32, format: image::ImageFormat) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height))
        .write_to(&mut out, format)
        .expect("encode test image");
    out.into_inner()
}
