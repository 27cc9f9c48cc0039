//! Reader-mode bridge tests
//!
//! Images are published on "data_in" by a background task while the reader
//! stream is being polled. The clock is paused, so poll cycles are exact.

#[path = "../fixtures/mock_responder.rs"]
mod mock_responder;

use futures::StreamExt;
use mock_responder::encoded_image;
use redis_bridge_core::nodes::{ImageListenReader, Reader};
use redis_bridge_core::transport::{InMemoryTransport, PubSubTransport};
use redis_bridge_core::{Error, RecordKind};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

async fn reader(transport: &InMemoryTransport, params: Value) -> ImageListenReader {
    let mut node = ImageListenReader::new(params).with_transport(Arc::new(transport.clone()));
    node.initialize().await.unwrap();
    node
}

/// Publish each payload on "data_in" after its delay (delays are cumulative)
fn publish_later(transport: &InMemoryTransport, payloads: Vec<(Duration, Vec<u8>)>) -> tokio::task::JoinHandle<()> {
    let transport = transport.clone();
    tokio::spawn(async move {
        for (delay, payload) in payloads {
            tokio::time::sleep(delay).await;
            transport.publish("data_in", payload.into()).await.unwrap();
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_wait_forever_keep_waiting_after_k_cycles() {
    for k in [1u64, 5, 50] {
        let transport = InMemoryTransport::new();
        let mut node = reader(
            &transport,
            json!({"data_type": "ic", "timeout": 0.0, "sleep_time": 0.01, "timeout_action": "keep-waiting"}),
        )
        .await;

        let delay = Duration::from_millis(10 * k + 5);
        let publisher = publish_later(&transport, vec![(delay, encoded_image(4, 4, image::ImageFormat::Png))]);

        let mut stream = node.read().unwrap();
        let item = stream.next().await.unwrap().unwrap();
        assert_eq!(item.image_name, "1.png", "k = {}", k);
        assert_eq!(item.kind, RecordKind::ImageClassification);
        drop(stream);

        publisher.await.unwrap();
        assert!(!node.session().unwrap().listener_active());
        node.finalize().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_keep_waiting_across_deadlines() {
    let transport = InMemoryTransport::new();
    let mut node = reader(
        &transport,
        json!({"data_type": "dp", "timeout": 0.05, "timeout_action": "keep-waiting"}),
    )
    .await;

    // Seven deadlines pass before the image shows up
    let publisher = publish_later(
        &transport,
        vec![(Duration::from_millis(375), encoded_image(2, 2, image::ImageFormat::Jpeg))],
    );

    let mut stream = node.read().unwrap();
    let item = stream.next().await.unwrap().unwrap();
    assert_eq!(item.image_name, "1.jpg");
    assert_eq!(item.kind, RecordKind::Depth);

    drop(stream);
    publisher.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_stream_and_read_restarts() {
    let transport = InMemoryTransport::new();
    let mut node = reader(
        &transport,
        json!({"data_type": "od", "prefix": "cam", "timeout": 0.1, "timeout_action": "stop"}),
    )
    .await;

    let publisher = publish_later(
        &transport,
        vec![
            (Duration::from_millis(20), encoded_image(3, 3, image::ImageFormat::Png)),
            (Duration::from_millis(30), encoded_image(3, 3, image::ImageFormat::Png)),
        ],
    );

    {
        let mut stream = node.read().unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.image_name, "cam-1.png");
        assert_eq!(second.image_name, "cam-2.png");
        assert_eq!((second.image_width, second.image_height), (Some(3), Some(3)));

        // Nothing more arrives, so the deadline ends the stream
        assert!(stream.next().await.is_none());
    }
    publisher.await.unwrap();
    assert!(!node.session().unwrap().listener_active());

    // A new read() starts over; numbering continues
    let publisher = publish_later(
        &transport,
        vec![(Duration::from_millis(10), encoded_image(3, 3, image::ImageFormat::Png))],
    );
    let mut stream = node.read().unwrap();
    let third = stream.next().await.unwrap().unwrap();
    assert_eq!(third.image_name, "cam-3.png");
    drop(stream);

    publisher.await.unwrap();
    assert_eq!(node.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_payload_does_not_end_stream() {
    let transport = InMemoryTransport::new();
    let mut node = reader(&transport, json!({"data_type": "ic", "timeout": 0.0})).await;

    let publisher = publish_later(
        &transport,
        vec![
            (Duration::from_millis(10), b"not an image".to_vec()),
            (Duration::from_millis(20), encoded_image(2, 2, image::ImageFormat::Png)),
        ],
    );

    let mut stream = node.read().unwrap();
    let first = stream.next().await.unwrap();
    assert!(matches!(first, Err(Error::UnsupportedFormat { .. })));

    // The undecodable payload used up number 1
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.image_name, "2.png");

    drop(stream);
    publisher.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transport_close_ends_stream() {
    let transport = InMemoryTransport::new();
    let mut node = reader(&transport, json!({"data_type": "ic", "timeout": 0.0})).await;

    let closer = {
        let transport = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            transport.close().await.unwrap();
        })
    };

    let mut stream = node.read().unwrap();
    assert!(matches!(
        stream.next().await,
        Some(Err(Error::ListenerTerminated(_)))
    ));
    assert!(stream.next().await.is_none());

    drop(stream);
    closer.await.unwrap();
}
