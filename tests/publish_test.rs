// Synchronous publish timeouts: a broker ack that never arrives resolves
// the caller with a timeout error instead of hanging forever.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{init_tracing, MockBroker};
use relinkmq::{Client, ClientConfig, CodecRegistry, Error, Payload, PublishOpts};

#[tokio::test]
async fn confirm_publish_times_out_when_the_ack_never_arrives() {
    init_tracing();
    let broker = MockBroker::new();
    broker.hold_confirms();
    let client = Client::with_transport(
        ClientConfig::default(),
        CodecRegistry::json(),
        Arc::new(broker.clone()),
    );
    client.connected().await;

    let publisher = client.publisher("ex").await.unwrap();
    let err = publisher
        .publish_with(
            "rk",
            Payload::Value(json!({"n": 1})),
            PublishOpts {
                confirm: Some(true),
                timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PublishTimeout(_)), "got {err:?}");

    // the message reached the broker; only its ack went missing
    assert_eq!(broker.published().len(), 1);

    // a fire-and-forget publish on the same connection is unaffected
    publisher
        .publish("rk", Payload::Value(json!({"n": 2})))
        .await
        .unwrap();
    assert_eq!(broker.published().len(), 2);
}
