//! Consumer dispatch against the in-memory broker.

mod helpers;

use classify_gateway::broker::consumer::Settlement;
use classify_gateway::broker::{Delivery, QueueKind};
use classify_gateway::services::providers::ProviderKind;
use helpers::*;
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;

fn classify_payload() -> serde_json::Value {
    json!({
        "requesterId": 11,
        "workspaceId": 3,
        "testClass": ["cat", "dog"],
        "testImages": [
            {"id": 1, "url": "http://cdn/cat-1.png"},
            {"id": 2, "url": "http://cdn/dog-2.jpg"},
            {"id": 3, "url": "http://cdn/anim.gif"},
            {"id": 4, "url": "http://cdn/cat-4.jpeg"}
        ]
    })
}

#[tokio::test]
async fn test_classify_job_is_answered_and_acked() {
    let harness = Harness::new();
    let entry = harness
        .broker
        .push_json(QueueKind::Classify, "corr-1", &classify_payload());

    let handled = harness.consumer().poll_once().await.unwrap();
    assert_eq!(handled, 1);

    let responses = harness.broker.responses();
    assert_eq!(responses.len(), 1);
    let (correlation_id, body) = &responses[0];
    assert_eq!(correlation_id, "corr-1");
    assert_eq!(body["requesterId"], 11);
    assert_eq!(body["workspaceId"], 3);
    assert_eq!(
        body["labelsAndIds"],
        json!([{"label": "cat", "ids": [1, 4]}, {"label": "dog", "ids": [2]}])
    );
    assert_eq!(harness.broker.acked(), vec![entry]);

    // The gif never reached a provider or the store.
    assert_eq!(harness.store.saved().len(), 3);
}

#[tokio::test]
async fn test_single_encoded_body_is_accepted() {
    let harness = Harness::new();
    harness.broker.push(
        QueueKind::Classify,
        "corr-2",
        &classify_payload().to_string(),
    );

    harness.consumer().poll_once().await.unwrap();
    let (_, body) = &harness.broker.responses()[0];
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn test_undecodable_body_gets_error_envelope() {
    let harness = Harness::new();
    let entry = harness.broker.push(QueueKind::Export, "corr-3", "{not json");

    harness.consumer().poll_once().await.unwrap();

    let (correlation_id, body) = &harness.broker.responses()[0];
    assert_eq!(correlation_id, "corr-3");
    assert_eq!(body["error"]["code"], "JSON_DECODE_ERROR");
    assert_eq!(body["error"]["correlationId"], "corr-3");
    assert_eq!(harness.broker.acked(), vec![entry]);
}

#[tokio::test]
async fn test_train_without_ids_is_processing_error() {
    let harness = Harness::new();
    harness
        .broker
        .push_json(QueueKind::Train, "corr-4", &json!({"workspaceId": 5}));

    harness.consumer().poll_once().await.unwrap();

    let (_, body) = &harness.broker.responses()[0];
    assert_eq!(body["error"]["code"], "MESSAGE_PROCESSING_ERROR");
    assert_eq!(
        body["error"]["message"],
        "workspaceId or requesterId was not provided."
    );
}

#[tokio::test]
async fn test_invalid_classify_job_is_validation_error() {
    let harness = Harness::new();
    harness.broker.push_json(
        QueueKind::Classify,
        "corr-5",
        &json!({"workspaceId": 1, "testClass": [], "testImages": []}),
    );

    harness.consumer().poll_once().await.unwrap();

    let (_, body) = &harness.broker.responses()[0];
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert!(harness.client.calls().is_empty());
}

#[tokio::test]
async fn test_train_forwards_progress_and_publishes_result() {
    let harness = Harness::new();
    let mut events = harness.events.register("u7");
    harness.broker.push_json(
        QueueKind::Train,
        "corr-6",
        &json!({"workspaceId": 9, "requesterId": "u7", "epochs": 3}),
    );

    harness.consumer().poll_once().await.unwrap();

    let (_, body) = &harness.broker.responses()[0];
    assert_eq!(body["requesterId"], "u7");
    assert_eq!(body["trainResult"]["version"], "20250101_000000");

    let first = events.recv().await.unwrap();
    assert_eq!(first.event, "train_progress");
    assert_eq!(first.data["progress"]["epochs"], 3);
    assert_eq!(first.data["workspaceId"], 9);

    let progress = harness.broker.progress();
    assert_eq!(progress.len(), 2);
    assert!(progress
        .iter()
        .all(|(client, event, _)| client == "u7" && event == "train_progress"));
}

#[tokio::test]
async fn test_trainer_failure_maps_to_not_found() {
    let harness = Harness::new();
    harness.broker.push_json(
        QueueKind::Train,
        "corr-7",
        &json!({"workspaceId": "missing", "requesterId": 1}),
    );

    harness.consumer().poll_once().await.unwrap();

    let (_, body) = &harness.broker.responses()[0];
    assert_eq!(body["error"]["code"], "RESOURCE_NOT_FOUND");
    assert_eq!(body["error"]["details"]["resource"], "workspace");
}

#[tokio::test]
async fn test_export_publishes_then_emits_completion() {
    let harness = Harness::new();
    let mut events = harness.events.register("42");
    harness.broker.push_json(
        QueueKind::Export,
        "corr-8",
        &json!({"workspaceId": 2, "requesterId": 42, "format": "TFLITE"}),
    );

    harness.consumer().poll_once().await.unwrap();

    let (_, body) = &harness.broker.responses()[0];
    assert_eq!(body["format"], "TFLITE");
    assert_eq!(
        body["exportedPath"],
        "models/exported_2_20250101_000000.tflite"
    );

    let event = events.recv().await.unwrap();
    assert_eq!(event.event, "export_complete");
    assert_eq!(event.data["exportedPath"], body["exportedPath"]);
    assert_eq!(harness.broker.progress()[0].1, "export_complete");
}

#[tokio::test]
async fn test_failed_export_emits_no_completion() {
    let harness = Harness::new();
    let mut events = harness.events.register("1");
    harness.broker.push_json(
        QueueKind::Export,
        "corr-9",
        &json!({"workspaceId": "untrained", "requesterId": 1}),
    );

    harness.consumer().poll_once().await.unwrap();

    let (_, body) = &harness.broker.responses()[0];
    assert_eq!(body["error"]["code"], "RESOURCE_NOT_FOUND");
    assert!(events.try_recv().is_err());
    assert!(harness.broker.progress().is_empty());
}

#[tokio::test]
async fn test_export_with_path_like_format_is_rejected() {
    let harness = Harness::new();
    let mut events = harness.events.register("1");
    harness.broker.push_json(
        QueueKind::Export,
        "corr-15",
        &json!({"workspaceId": 2, "requesterId": 1, "format": "onnx/../../x"}),
    );

    harness.consumer().poll_once().await.unwrap();

    let (_, body) = &harness.broker.responses()[0];
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_publish_exhaustion_requeues_entry() {
    let harness = Harness::new();
    // One attempt plus two retries, all failing.
    harness.broker.fail_next_publishes(3);
    let delivery = Delivery {
        queue: QueueKind::Export,
        entry_id: "1-0".into(),
        correlation_id: "corr-10".into(),
        body: json!({"workspaceId": 2, "requesterId": 1}).to_string(),
    };

    let settlement = harness.consumer().dispatch(&delivery).await;
    assert_eq!(settlement, Settlement::Requeue);
    assert!(harness.broker.responses().is_empty());
}

#[tokio::test]
async fn test_requeued_entry_is_answered_on_redelivery() {
    let harness = Harness::new();
    harness.broker.fail_next_publishes(3);
    let entry = harness
        .broker
        .push_json(QueueKind::Classify, "corr-11", &classify_payload());
    let consumer = harness.consumer();

    consumer.poll_once().await.unwrap();
    assert_eq!(harness.broker.requeued(), vec![entry.clone()]);
    assert!(harness.broker.acked().is_empty());

    consumer.poll_once().await.unwrap();
    assert_eq!(harness.broker.acked(), vec![entry]);
    assert_eq!(harness.broker.responses().len(), 1);
}

#[tokio::test]
async fn test_provider_fallback_is_transparent() {
    let harness = Harness::with_client(ScriptedClient::failing(&[ProviderKind::OpenRouter]));
    harness
        .broker
        .push_json(QueueKind::Classify, "corr-12", &classify_payload());

    harness.consumer().poll_once().await.unwrap();

    let (_, body) = &harness.broker.responses()[0];
    assert_eq!(body["labelsAndIds"][0]["label"], "cat");
    let providers: Vec<ProviderKind> = harness.client.calls().into_iter().map(|(k, _)| k).collect();
    assert_eq!(providers, vec![ProviderKind::OpenRouter, ProviderKind::Gemini]);
}

#[tokio::test]
async fn test_all_providers_failing_degrades_to_none() {
    let harness = Harness::with_client(ScriptedClient::failing(&[
        ProviderKind::OpenRouter,
        ProviderKind::Gemini,
    ]));
    harness
        .broker
        .push_json(QueueKind::Classify, "corr-13", &classify_payload());

    harness.consumer().poll_once().await.unwrap();

    let (_, body) = &harness.broker.responses()[0];
    assert_eq!(body["labelsAndIds"], json!([{"label": "NONE", "ids": [1, 2, 4]}]));
}

#[tokio::test]
async fn test_run_reconnects_after_connect_failures_and_stops_on_shutdown() {
    let harness = Harness::new();
    // Two failed attempts exhaust the first connect cycle.
    harness.broker.fail_next_connects(2);
    harness
        .broker
        .push_json(QueueKind::Classify, "corr-14", &classify_payload());

    let (tx, rx) = watch::channel(false);
    let consumer = harness.consumer();
    let handle = tokio::spawn(async move { consumer.run(rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.broker.responses().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("response was not published");

    tx.send_replace(true);
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("consumer did not stop")
        .unwrap();
    assert_eq!(harness.broker.connects(), 1);
    assert_eq!(harness.broker.queued_len(), 0);
}
