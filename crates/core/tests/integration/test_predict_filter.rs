//! Filter-mode bridge tests against a mock model service
//!
//! All tests run on a paused clock, so deadlines and reply delays are exact.

#[path = "../fixtures/mock_responder.rs"]
mod mock_responder;

use bytes::Bytes;
use mock_responder::{encoded_image, MockResponder};
use redis_bridge_core::bridge::{self, CallOutcome};
use redis_bridge_core::converters::PredictionKind;
use redis_bridge_core::nodes::{Filter, PredictFilter};
use redis_bridge_core::transport::InMemoryTransport;
use redis_bridge_core::{
    Annotation, CallState, Channels, DataItem, Error, RecordKind, Session, Timing,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn classification_item(name: &str) -> DataItem {
    DataItem::new(RecordKind::ImageClassification, name, Bytes::from(name.to_string()))
        .with_source(format!("/images/{}", name))
        .with_dimensions(64, 48)
        .with_metadata("camera", "front")
}

async fn filter(transport: &InMemoryTransport, kind: PredictionKind, params: Value) -> PredictFilter {
    let mut node = PredictFilter::new(kind, params).with_transport(Arc::new(transport.clone()));
    node.initialize().await.unwrap();
    node
}

fn label(item: &DataItem) -> Option<&str> {
    match &item.annotation {
        Some(Annotation::Classification { label }) => label.as_deref(),
        other => panic!("expected a classification, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reply_before_deadline_yields_converted_result() {
    let transport = InMemoryTransport::new();
    let responder =
        MockResponder::always(&transport, br#"{"cat":0.2,"dog":0.9}"#, Duration::from_millis(50)).await;

    let mut node = filter(
        &transport,
        PredictionKind::Classification,
        json!({"channel_out": "images", "channel_in": "predictions", "timeout": 0.2, "sleep_time": 0.01}),
    )
    .await;

    let original = classification_item("pet.jpg");
    let results = node.process(vec![original.clone()]).await.unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(label(result), Some("dog"));
    assert_eq!(result.source, original.source);
    assert_eq!(result.data, original.data);
    assert_eq!(result.metadata, original.metadata);
    assert_eq!((result.image_width, result.image_height), (Some(64), Some(48)));

    let session = node.session().unwrap();
    assert!(!session.listener_active());
    assert_eq!(session.state(), CallState::Idle);
    assert_eq!(responder.request_count(), 1);

    responder.shutdown().await;
    node.finalize().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timeout_drop_yields_nothing_after_deadline() {
    let transport = InMemoryTransport::new();
    let mut node = filter(
        &transport,
        PredictionKind::Classification,
        json!({"timeout": 0.2, "sleep_time": 0.01, "timeout_action": "drop"}),
    )
    .await;

    let start = Instant::now();
    let results = node.process(vec![classification_item("a.jpg")]).await.unwrap();
    let elapsed = start.elapsed();

    assert!(results.is_empty());
    assert!(elapsed >= Duration::from_millis(200), "elapsed {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(210), "elapsed {:?}", elapsed);
    assert!(!node.session().unwrap().listener_active());
    assert_eq!(transport.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_passthrough_returns_original() {
    let transport = InMemoryTransport::new();
    for spelling in ["passthrough", "input"] {
        let mut node = filter(
            &transport,
            PredictionKind::Classification,
            json!({"timeout": 0.05, "timeout_action": spelling}),
        )
        .await;

        let original = classification_item("a.jpg");
        let results = node.process(vec![original.clone()]).await.unwrap();
        assert_eq!(results, vec![original]);
        node.finalize().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_batch_with_even_items_timing_out() {
    let transport = InMemoryTransport::new();
    let responder = MockResponder::start(&transport, "images", "predictions", |index, _| {
        (index % 2 == 1).then(|| {
            let reply = format!("{{\"item{}\": 0.8}}", index);
            (Duration::from_millis(20), Bytes::from(reply))
        })
    })
    .await;

    let mut node = filter(
        &transport,
        PredictionKind::Classification,
        json!({"timeout": 0.1, "timeout_action": "drop"}),
    )
    .await;

    let batch: Vec<DataItem> = (0..6)
        .map(|i| classification_item(&format!("{}.jpg", i)))
        .collect();
    let results = node.process(batch).await.unwrap();

    let names: Vec<&str> = results.iter().map(|r| r.image_name.as_str()).collect();
    assert_eq!(names, vec!["1.jpg", "3.jpg", "5.jpg"]);
    let labels: Vec<Option<&str>> = results.iter().map(label).collect();
    assert_eq!(labels, vec![Some("item1"), Some("item3"), Some("item5")]);
    assert_eq!(responder.request_count(), 6);

    responder.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_batch_passthrough_keeps_positions() {
    let transport = InMemoryTransport::new();
    let responder = MockResponder::start(&transport, "images", "predictions", |index, _| {
        (index != 1).then(|| (Duration::from_millis(5), Bytes::from_static(br#"{"ok": 1.0}"#)))
    })
    .await;

    let mut node = filter(
        &transport,
        PredictionKind::Classification,
        json!({"timeout": 0.05, "timeout_action": "passthrough"}),
    )
    .await;

    let batch: Vec<DataItem> = (0..3).map(|i| classification_item(&format!("{}.jpg", i))).collect();
    let results = node.process(batch.clone()).await.unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(label(&results[0]), Some("ok"));
    assert_eq!(results[1], batch[1]);
    assert_eq!(label(&results[2]), Some("ok"));

    responder.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_converter_failure_leaves_session_usable() {
    let transport = InMemoryTransport::new();
    let responder = MockResponder::start(&transport, "images", "predictions", |index, _| {
        let reply: &'static [u8] = if index == 0 { b"<html>" } else { br#"{"cat": 0.7}"# };
        Some((Duration::from_millis(5), Bytes::from_static(reply)))
    })
    .await;

    let mut node = filter(&transport, PredictionKind::Classification, json!({"timeout": 0.1})).await;

    let err = node.process(vec![classification_item("a.jpg")]).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat { .. }));
    assert_eq!(node.session().unwrap().state(), CallState::Idle);
    assert!(!node.session().unwrap().listener_active());

    let results = node.process(vec![classification_item("b.jpg")]).await.unwrap();
    assert_eq!(label(&results[0]), Some("cat"));

    responder.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_is_not_delivered_to_next_item() {
    let transport = InMemoryTransport::new();
    // First reply arrives after the first call gave up
    let responder = MockResponder::start(&transport, "images", "predictions", |index, _| {
        let (delay, reply): (u64, &'static [u8]) = if index == 0 {
            (80, br#"{"stale": 1.0}"#)
        } else {
            (10, br#"{"fresh": 1.0}"#)
        };
        Some((Duration::from_millis(delay), Bytes::from_static(reply)))
    })
    .await;

    let mut node = filter(
        &transport,
        PredictionKind::Classification,
        json!({"timeout": 0.05, "timeout_action": "drop"}),
    )
    .await;

    let first = node.process(vec![classification_item("a.jpg")]).await.unwrap();
    assert!(first.is_empty());

    // Let the stale reply go out while no listener is armed
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = node.process(vec![classification_item("b.jpg")]).await.unwrap();
    assert_eq!(label(&second[0]), Some("fresh"));

    responder.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_call_rejected() {
    let transport = InMemoryTransport::new();
    let session = Session::with_transport(
        Arc::new(transport.clone()),
        Channels::request_response("images", "predictions"),
        Timing::new(0.05, 0.01),
    );

    let (first, second) = tokio::join!(
        bridge::call(&session, Some(Bytes::from_static(b"one"))),
        bridge::call(&session, Some(Bytes::from_static(b"two"))),
    );

    assert!(matches!(first, Ok(CallOutcome::TimedOut { .. })));
    assert!(matches!(second, Err(Error::CallInProgress(_))));
    assert_eq!(session.state(), CallState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_no_subscription_left_behind() {
    let transport = InMemoryTransport::new();
    let responder = MockResponder::always(&transport, br#"{"a": 1.0}"#, Duration::from_millis(1)).await;
    let mut node = filter(&transport, PredictionKind::Classification, json!({"timeout": 0.05})).await;

    let batch: Vec<DataItem> = (0..10).map(|i| classification_item(&format!("{}.jpg", i))).collect();
    let results = node.process(batch).await.unwrap();
    assert_eq!(results.len(), 10);

    // Only the responder's own subscription remains
    assert_eq!(transport.subscription_count(), 1);
    responder.shutdown().await;
    assert_eq!(transport.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_detection_round_trip() {
    let transport = InMemoryTransport::new();
    let reply: &'static [u8] = br#"{"objects": [
        {"label": "car", "score": 0.5,
         "bbox": {"left": 1, "top": 2, "right": 10, "bottom": 12},
         "polygon": {"points": [[1, 2], [10, 2], [10, 12], [1, 12]]}}
    ]}"#;
    let responder = MockResponder::always(&transport, reply, Duration::from_millis(5)).await;
    let mut node = filter(
        &transport,
        PredictionKind::Detection,
        json!({"timeout": 0.1, "key_label": "label"}),
    )
    .await;

    let item = DataItem::new(RecordKind::ObjectDetection, "street.jpg", vec![0u8; 8]);
    let results = node.process(vec![item]).await.unwrap();

    let Some(Annotation::Detection { objects }) = &results[0].annotation else {
        panic!("expected detection annotation");
    };
    assert_eq!((objects[0].width, objects[0].height), (10, 11));
    assert_eq!(objects[0].metadata["label"], "car");

    responder.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_segmentation_reply_resized_to_request() {
    let transport = InMemoryTransport::new();
    let mask = {
        let gray = image::GrayImage::from_pixel(2, 2, image::Luma([1]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageLuma8(gray)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    };
    let responder = MockResponder::start(&transport, "images", "predictions", move |_, _| {
        Some((Duration::from_millis(5), mask.clone()))
    })
    .await;

    let mut node = filter(
        &transport,
        PredictionKind::Segmentation,
        json!({"timeout": 0.1, "image_format": "indexedpng", "labels": ["background", "road"]}),
    )
    .await;

    // Dimensions come from the request image itself
    let item = DataItem::new(
        RecordKind::ImageSegmentation,
        "road.png",
        encoded_image(4, 4, image::ImageFormat::Png),
    );
    let results = node.process(vec![item]).await.unwrap();

    let Some(Annotation::Segmentation(mask)) = &results[0].annotation else {
        panic!("expected segmentation annotation");
    };
    assert_eq!((mask.width, mask.height), (4, 4));
    assert_eq!(mask.pixel_counts()["road"], 16);

    responder.shutdown().await;
}
