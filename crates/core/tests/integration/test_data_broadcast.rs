//! Broadcast writer tests: what ends up on the outbound channel

use bytes::Bytes;
use redis_bridge_core::data::{Annotation, LocatedObject};
use redis_bridge_core::nodes::{create_default_registry, DataBroadcastWriter, Node, Writer};
use redis_bridge_core::transport::{InMemoryTransport, PubSubTransport, Subscription};
use redis_bridge_core::{DataItem, RecordKind};
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn labelled(name: &str) -> DataItem {
    DataItem::new(RecordKind::ImageClassification, name, Bytes::from_static(b"\x01\x02\x03"))
        .with_source(format!("/data/{}", name))
        .with_image_format("PNG")
        .with_dimensions(8, 6)
        .with_metadata("camera", "rear")
        .with_annotation(Annotation::Classification {
            label: Some("bird".into()),
        })
}

async fn next_json(subscription: &mut Box<dyn Subscription>) -> Value {
    let message = subscription.next_message().await.unwrap().unwrap();
    serde_json::from_slice(&message.payload).unwrap()
}

#[tokio::test]
async fn test_broadcast_omits_source_and_metadata() {
    let transport = InMemoryTransport::new();
    let mut subscription = transport.subscribe("data_out").await.unwrap();

    let mut writer = DataBroadcastWriter::new(json!({})).with_transport(Arc::new(transport.clone()));
    writer.initialize().await.unwrap();
    writer.write(&[labelled("a.png"), labelled("b.png")]).await.unwrap();

    for expected in ["a.png", "b.png"] {
        let value = next_json(&mut subscription).await;
        assert_eq!(value["image_name"], expected);
        assert_eq!(value["kind"], "ic");
        assert_eq!(value["image_width"], 8);
        assert_eq!(value["annotation"]["label"], "bird");
        assert!(value.get("source").is_none());
        assert!(value.get("metadata").is_none());
        assert!(value.get("image").is_none());
    }

    writer.finalize().await.unwrap();
    assert!(!transport.is_closed());
}

#[tokio::test]
async fn test_broadcast_embeds_image_when_asked() {
    let transport = InMemoryTransport::new();
    let mut subscription = transport.subscribe("detections").await.unwrap();

    let mut writer = DataBroadcastWriter::new(json!({"channel_out": "detections", "include_image": true}))
        .with_transport(Arc::new(transport.clone()));
    writer.initialize().await.unwrap();

    let mut box_meta = Map::new();
    box_meta.insert("type".into(), Value::from("car"));
    let item = DataItem::new(RecordKind::ObjectDetection, "street.png", Bytes::from_static(b"\x01\x02\x03"))
        .with_annotation(Annotation::Detection {
            objects: vec![LocatedObject {
                x: 1,
                y: 2,
                width: 3,
                height: 4,
                polygon: vec![(1, 2), (4, 6)],
                metadata: box_meta,
            }],
        });
    writer.write(&[item]).await.unwrap();

    let value = next_json(&mut subscription).await;
    assert_eq!(value["image"], "AQID");
    assert_eq!(value["annotation"]["objects"][0]["metadata"]["type"], "car");
    assert_eq!(value["annotation"]["objects"][0]["width"], 3);
}

#[tokio::test]
async fn test_broadcast_without_subscribers_succeeds() {
    let transport = InMemoryTransport::new();
    let registry = create_default_registry();

    let node = registry
        .create_node_with_transport("redis-data-broadcast", &json!({}), Some(Arc::new(transport.clone())))
        .unwrap();
    let Node::Writer(mut writer) = node else {
        panic!("expected a writer");
    };

    writer.initialize().await.unwrap();
    writer.write(&[labelled("lonely.png")]).await.unwrap();
    writer.finalize().await.unwrap();
}
