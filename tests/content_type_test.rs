// Content-based serialization: producers with different default content
// types share one exchange, and each message decodes with the codec its
// own content type names.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::{init_tracing, MockBroker};
use relinkmq::{
    handler, Client, ClientConfig, CodecRegistry, CodecRegistryBuilder, DecodeFn, EncodeFn,
    Payload, APPLICATION_JSON,
};

const X_PICKLE: &str = "application/x-pickle";

// stand-in for a second wire format: JSON behind a magic prefix
fn pickle_codec() -> (EncodeFn, DecodeFn) {
    let encode: EncodeFn = Arc::new(|value| {
        let mut body = b"PKL:".to_vec();
        body.extend(serde_json::to_vec(value)?);
        Ok(body)
    });
    let decode: DecodeFn = Arc::new(|body| {
        let rest = body
            .strip_prefix(b"PKL:".as_slice())
            .ok_or("missing pickle prefix")?;
        Ok(serde_json::from_slice(rest)?)
    });
    (encode, decode)
}

fn registry_with_pickle() -> CodecRegistry {
    let (encode, decode) = pickle_codec();
    CodecRegistryBuilder::new()
        .register(X_PICKLE, encode, decode)
        .unwrap()
        .default_content_type(APPLICATION_JSON)
        .build()
        .unwrap()
}

#[tokio::test]
async fn producers_with_different_content_types_do_not_cross_contaminate() {
    init_tracing();
    let broker = MockBroker::new();

    // shared consumer, registry understands both formats
    let consumer_client = Client::with_transport(
        ClientConfig::default(),
        registry_with_pickle(),
        Arc::new(broker.clone()),
    );
    consumer_client.connected().await;

    let (seen_tx, mut seen_rx) = mpsc::channel::<(Option<String>, Value)>(8);
    let spec = consumer_client.binding(
        "shared-exchange",
        "rk",
        "shared-queue",
        handler(move |delivery| {
            let seen_tx = seen_tx.clone();
            async move {
                let value = delivery
                    .body
                    .as_value()
                    .cloned()
                    .ok_or("expected decoded body")?;
                seen_tx
                    .send((delivery.content_type.clone(), value))
                    .await
                    .map_err(|e| e.to_string().into())
            }
        }),
    );
    consumer_client.setup_read_queue(spec).await.unwrap();

    // two producers on the same exchange, different default content types
    let json_client = Client::with_transport(
        ClientConfig::default().with_default_content_type(APPLICATION_JSON),
        registry_with_pickle(),
        Arc::new(broker.clone()),
    );
    let pickle_client = Client::with_transport(
        ClientConfig::default().with_default_content_type(X_PICKLE),
        registry_with_pickle(),
        Arc::new(broker.clone()),
    );
    json_client.connected().await;
    pickle_client.connected().await;

    let json_pub = json_client.publisher("shared-exchange").await.unwrap();
    let pickle_pub = pickle_client.publisher("shared-exchange").await.unwrap();

    json_pub
        .publish("rk", Payload::Value(json!({"fmt": "json"})))
        .await
        .unwrap();
    pickle_pub
        .publish("rk", Payload::Value(json!({"fmt": "pickle"})))
        .await
        .unwrap();

    let mut got = Vec::new();
    for _ in 0..2 {
        let item = timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("consumer channel closed");
        got.push(item);
    }
    got.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(
        got[0],
        (
            Some(APPLICATION_JSON.to_string()),
            json!({"fmt": "json"})
        )
    );
    assert_eq!(
        got[1],
        (Some(X_PICKLE.to_string()), json!({"fmt": "pickle"}))
    );

    // pickle bodies really carried the other wire format
    let pickled = broker
        .published()
        .into_iter()
        .find(|m| m.content_type == X_PICKLE)
        .unwrap();
    assert!(pickled.body.starts_with(b"PKL:"));

    for client in [&consumer_client, &json_client, &pickle_client] {
        client.shutdown().await.unwrap();
    }
}
