//! Live-delivery tests: tailing, stream scoping, at-most-once behavior.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tailstore::{Action, ActionMeta, Config, Store};

async fn connected_store() -> Store {
    let store = Store::new(Config::for_test());
    store.connect().await.expect("connect");
    store
}

fn make_action(stream_id: &Value, sequence_number: u64) -> Action {
    let mut payload = Map::new();
    payload.insert("type".to_string(), json!("ADD_ITEM"));
    Action {
        meta: ActionMeta::new(stream_id.clone(), sequence_number),
        payload,
    }
}

type Received = Arc<Mutex<Vec<Action>>>;

fn recorder() -> (Received, impl Fn(Action) + Send + Sync + 'static) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    (received, move |action| sink.lock().unwrap().push(action))
}

/// Wait until `count` deliveries arrived, yielding to the watch consumer.
async fn wait_for(received: &Received, count: usize) {
    for _ in 0..200 {
        if received.lock().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "timed out waiting for {count} deliveries, got {}",
        received.lock().unwrap().len()
    );
}

/// Give the watch consumer time to drain anything in flight.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_stream_subscriber_receives_exactly_one_censored_action() {
    let store = connected_store().await;
    let orders = json!("orders");
    let carts = json!("carts");

    let (orders_seen, orders_cb) = recorder();
    let (carts_seen, carts_cb) = recorder();
    store.on_new_action_from_stream(&orders, orders_cb).unwrap();
    store.on_new_action_from_stream(&carts, carts_cb).unwrap();

    let action = make_action(&orders, 0);
    store.save_action(&action).await.unwrap();

    wait_for(&orders_seen, 1).await;
    settle().await;

    let orders_seen = orders_seen.lock().unwrap();
    assert_eq!(orders_seen.len(), 1);
    assert_eq!(orders_seen[0].meta.stream_id, orders);
    assert_eq!(orders_seen[0].meta.sequence_number, 0);
    assert_eq!(orders_seen[0].payload, action.payload);
    assert!(orders_seen[0].payload.get("_key").is_none());

    // The other stream's subscriber saw nothing.
    assert!(carts_seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_global_subscriber_sees_every_stream_in_order() {
    let store = connected_store().await;

    let (seen, callback) = recorder();
    store.on_new_action(callback).unwrap();

    store
        .save_action(&make_action(&json!("orders"), 0))
        .await
        .unwrap();
    store
        .save_action(&make_action(&json!("carts"), 0))
        .await
        .unwrap();
    store
        .save_action(&make_action(&json!("orders"), 1))
        .await
        .unwrap();

    wait_for(&seen, 3).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].meta.stream_id, json!("orders"));
    assert_eq!(seen[0].meta.sequence_number, 0);
    assert_eq!(seen[1].meta.stream_id, json!("carts"));
    assert_eq!(seen[2].meta.stream_id, json!("orders"));
    assert_eq!(seen[2].meta.sequence_number, 1);
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_actions() {
    let store = connected_store().await;
    let orders = json!("orders");

    store.save_action(&make_action(&orders, 0)).await.unwrap();
    settle().await;

    let (seen, callback) = recorder();
    store.on_new_action_from_stream(&orders, callback).unwrap();

    store.save_action(&make_action(&orders, 1)).await.unwrap();
    wait_for(&seen, 1).await;
    settle().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].meta.sequence_number, 1);
}

#[tokio::test]
async fn test_multiple_subscribers_on_one_stream() {
    let store = connected_store().await;
    let orders = json!("orders");

    let (first, first_cb) = recorder();
    let (second, second_cb) = recorder();
    store.on_new_action_from_stream(&orders, first_cb).unwrap();
    store.on_new_action_from_stream(&orders, second_cb).unwrap();

    store.save_action(&make_action(&orders, 0)).await.unwrap();

    wait_for(&first, 1).await;
    wait_for(&second, 1).await;
}

#[tokio::test]
async fn test_stream_scoping_uses_structural_identity() {
    let store = connected_store().await;

    let (seen, callback) = recorder();
    store
        .on_new_action_from_stream(&json!({"tenant": "acme", "cart": 1}), callback)
        .unwrap();

    // Same stream spelled with another field order.
    store
        .save_action(&make_action(&json!({"cart": 1, "tenant": "acme"}), 0))
        .await
        .unwrap();

    wait_for(&seen, 1).await;
}
