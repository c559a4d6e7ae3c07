//! Publish, subscribe and inbound message delivery through a session

use mqtt_session::testing::{EngineCall, MockEngine};
use mqtt_session::{EngineStatus, MqttClient, MqttMessage, Qos, RawEvent, RawMessage};
use std::time::Duration;
use tokio_test::assert_ready;

use test_helpers::*;

#[tokio::test]
async fn test_commands_complete_in_issue_order() {
    let engine = MockEngine::new().with_delay("publish", Duration::from_millis(30));
    let probe = engine.probe();
    let (acks, mut ack_rx) = recorder();
    let client = MqttClient::builder(test_config("messaging-1"))
        .on_publish(move |mid| {
            let _ = acks.send(mid);
        })
        .build(engine)
        .unwrap();
    client.connect("localhost", 1883, 60).await.unwrap();

    let mut first =
        tokio_test::task::spawn(client.publish_str("A", "order/a", Qos::AtLeastOnce, false));
    let second = client.publish_str("B", "order/b", Qos::AtLeastOnce, false);

    let second = second.await.unwrap();
    // A was issued first, so it is already resolved
    let first = assert_ready!(first.poll()).unwrap();
    assert!(first.is_success());
    assert!(second.is_success());

    assert_eq!(recv_within(&mut ack_rx).await, first.message_id);
    assert_eq!(recv_within(&mut ack_rx).await, second.message_id);

    let topics: Vec<String> = probe
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            EngineCall::Publish { topic, .. } => Some(topic),
            _ => None,
        })
        .collect();
    assert_eq!(topics, vec!["order/a", "order/b"]);
}

#[tokio::test]
async fn test_loopback_message_text() {
    let (messages, mut message_rx) = recorder::<MqttMessage>();
    let client = MqttClient::builder(test_config("messaging-2"))
        .on_message(move |message| {
            let _ = messages.send(message);
        })
        .build(MockEngine::new())
        .unwrap();
    client.connect("localhost", 1883, 60).await.unwrap();

    client.subscribe("greetings/#", Qos::AtLeastOnce).await.unwrap();
    client
        .publish_str("hello", "greetings/en", Qos::AtLeastOnce, false)
        .await
        .unwrap();

    let message = recv_within(&mut message_rx).await;
    assert_eq!(message.topic, "greetings/en");
    assert_eq!(message.payload_str(), Some("hello"));
    assert_eq!(message.payload_text(), "hello");
    assert_eq!(message.qos, Qos::AtLeastOnce);
    assert!(!message.retain);
}

#[tokio::test]
async fn test_binary_payload_is_delivered_byte_exact() {
    let (messages, mut message_rx) = recorder::<MqttMessage>();
    let client = MqttClient::builder(test_config("messaging-3"))
        .on_message(move |message| {
            let _ = messages.send(message);
        })
        .build(MockEngine::new())
        .unwrap();
    client.connect("localhost", 1883, 60).await.unwrap();

    client.subscribe("raw/+", Qos::AtMostOnce).await.unwrap();
    client
        .publish(vec![0u8, 1, 0, 0], "raw/bytes", Qos::AtMostOnce, false)
        .await
        .unwrap();

    let message = recv_within(&mut message_rx).await;
    assert_eq!(message.payload.len(), 4);
    assert_eq!(&message.payload[..], &[0u8, 1, 0, 0]);
}

#[tokio::test]
async fn test_undecodable_topic_never_reaches_callback() {
    let engine = MockEngine::new();
    let probe = engine.probe();
    let (messages, mut message_rx) = recorder::<MqttMessage>();
    let client = MqttClient::builder(test_config("messaging-4"))
        .on_message(move |message| {
            let _ = messages.send(message);
        })
        .build(engine)
        .unwrap();
    client.connect("localhost", 1883, 60).await.unwrap();

    probe.inject(RawEvent::Message(RawMessage {
        mid: 1,
        topic: Some(vec![0xff, 0xfe, 0xfd]),
        payload: Some(bytes::Bytes::from_static(b"lost")),
        qos: 0,
        retain: false,
    }));
    probe.inject(RawEvent::Message(RawMessage {
        mid: 2,
        topic: None,
        payload: None,
        qos: 0,
        retain: false,
    }));
    assert_quiet(&mut message_rx).await;
}

#[tokio::test]
async fn test_one_publish_callback_per_qos() {
    let (acks, mut ack_rx) = recorder();
    let client = MqttClient::builder(test_config("messaging-5"))
        .on_publish(move |mid| {
            let _ = acks.send(mid);
        })
        .build(MockEngine::new())
        .unwrap();
    client.connect("localhost", 1883, 60).await.unwrap();

    for qos in [Qos::AtMostOnce, Qos::AtLeastOnce, Qos::ExactlyOnce] {
        let result = client.publish_str("x", "qos/test", qos, false).await.unwrap();
        assert!(result.is_success());
        assert_eq!(recv_within(&mut ack_rx).await, result.message_id);
    }
    assert_quiet(&mut ack_rx).await;
}

#[tokio::test]
async fn test_granted_qos_list_matches_filter_count() {
    let (grants, mut grant_rx) = recorder();
    let client = MqttClient::builder(test_config("messaging-6"))
        .on_subscribe(move |mid, granted| {
            let _ = grants.send((mid, granted));
        })
        .build(MockEngine::new())
        .unwrap();
    client.connect("localhost", 1883, 60).await.unwrap();

    let single = client.subscribe("one", Qos::AtLeastOnce).await.unwrap();
    let (mid, granted) = recv_within(&mut grant_rx).await;
    assert_eq!(mid, single.message_id);
    assert_eq!(granted, vec![1]);

    let many = client
        .subscribe_many(["a", "b/+", "c/#"], Qos::ExactlyOnce)
        .await
        .unwrap();
    let (mid, granted) = recv_within(&mut grant_rx).await;
    assert_eq!(mid, many.message_id);
    assert_eq!(granted, vec![2, 2, 2]);
}

#[tokio::test]
async fn test_unsubscribe_ack_and_no_more_delivery() {
    let (messages, mut message_rx) = recorder::<MqttMessage>();
    let (unsubs, mut unsub_rx) = recorder();
    let client = MqttClient::builder(test_config("messaging-7"))
        .on_message(move |message| {
            let _ = messages.send(message);
        })
        .on_unsubscribe(move |mid| {
            let _ = unsubs.send(mid);
        })
        .build(MockEngine::new())
        .unwrap();
    client.connect("localhost", 1883, 60).await.unwrap();

    client.subscribe("news", Qos::AtMostOnce).await.unwrap();
    let result = client.unsubscribe("news").await.unwrap();
    assert!(result.is_success());
    assert_eq!(recv_within(&mut unsub_rx).await, result.message_id);

    client
        .publish_str("late", "news", Qos::AtMostOnce, false)
        .await
        .unwrap();
    assert_quiet(&mut message_rx).await;
}

#[tokio::test]
async fn test_publish_before_connect_reports_no_connection() {
    let client = MqttClient::builder(test_config("messaging-8"))
        .build(MockEngine::new())
        .unwrap();

    let result = client
        .publish_str("x", "a/b", Qos::AtMostOnce, false)
        .await
        .unwrap();
    assert_eq!(result.status, EngineStatus::NoConn);
    assert_eq!(result.message_id, 0);

    let result = client.subscribe("a/+/c/#", Qos::AtMostOnce).await.unwrap();
    assert_eq!(result.status, EngineStatus::NoConn);
}

#[tokio::test]
async fn test_invalid_filters_are_refused_locally() {
    let engine = MockEngine::new();
    let probe = engine.probe();
    let client = MqttClient::builder(test_config("messaging-9"))
        .build(engine)
        .unwrap();
    client.connect("localhost", 1883, 60).await.unwrap();

    let result = client.subscribe("a/#/b", Qos::AtMostOnce).await.unwrap();
    assert_eq!(result.status, EngineStatus::Inval);
    let result = client.unsubscribe("").await.unwrap();
    assert_eq!(result.status, EngineStatus::Inval);

    assert_eq!(probe.count("subscribe"), 0);
    assert_eq!(probe.count("unsubscribe"), 0);
}
