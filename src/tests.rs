use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use mockito::Matcher;

use super::*;
use crate::core::RegistrationOutcome;

fn config_for(server_url: &str) -> Config {
    Config::from_toml_str(&format!(
        r#"
        [api]
        base_url = "{server_url}/api"
        storage_base_url = "https://cdn.test/photos"
        user_id = "7"

        [upload]
        profile = "resilient"
        retry_delay_ms = 10
        "#
    ))
    .unwrap()
}

#[tokio::test]
async fn test_upload_through_http_backend() {
    let mut server = mockito::Server::new_async().await;
    let url = server.url();

    let batch_urls = server
        .mock("POST", "/api/uploads/batch-urls")
        .match_header("x-user-id", "7")
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"{{"uploads":[
                {{"name":"IMG_0001.jpg","url":"{url}/bucket/IMG_0001.jpg?sig=1","key":"u/7/IMG_0001.jpg"}},
                {{"name":"IMG_0002.jpg","url":"{url}/bucket/IMG_0002.jpg?sig=2","key":"u/7/IMG_0002.jpg"}}
            ]}}"#
        ))
        .expect(1)
        .create_async()
        .await;
    let puts = server
        .mock("PUT", Matcher::Regex(r"^/bucket/IMG_000[12]\.jpg".into()))
        .match_header("content-type", "image/jpeg")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;
    let confirms = server
        .mock("POST", "/api/uploads/confirm")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;
    let container = server
        .mock("POST", "/api/containers")
        .match_body(Matcher::Json(serde_json::json!({"name": "Wedding"})))
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": 42}"#)
        .expect(1)
        .create_async()
        .await;
    let insert = server
        .mock("POST", "/api/containers/42/photos/batch")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""storageUrl":"https://cdn\.test/photos/u/7/IMG_0001\.jpg""#.into()),
            Matcher::Regex(r#""storageUrl":"https://cdn\.test/photos/u/7/IMG_0002\.jpg""#.into()),
        ]))
        .with_header("content-type", "application/json")
        .with_body(r#"{"inserted": 2}"#)
        .expect(1)
        .create_async()
        .await;

    let orchestrator = UploadOrchestrator::from_config(&config_for(&url), Arc::new(NetworkMonitor::default())).unwrap();
    let mut queue = FileIngestQueue::new();
    queue
        .ingest(vec![
            FileHandle::from_bytes("IMG_0001.jpg", Utc::now(), Bytes::from_static(b"first")),
            FileHandle::from_bytes("IMG_0002.jpg", Utc::now(), Bytes::from_static(b"second")),
        ])
        .await;

    let results = tokio::time::timeout(
        Duration::from_secs(10),
        orchestrator.run(queue.into_batch(ContainerTarget::New { name: "Wedding".into() })),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(results.succeeded, 2);
    assert_eq!(results.storage_keys.len(), 2);
    match results.registration {
        RegistrationOutcome::Committed(report) => {
            assert_eq!(report.container, ContainerId(42));
            assert_eq!(report.inserted, 2);
            assert!(!report.fallback_used);
        }
        other => panic!("unexpected registration outcome: {:?}", other),
    }
    assert_eq!(orchestrator.target(), Some(ContainerTarget::Existing { id: ContainerId(42) }));

    batch_urls.assert_async().await;
    puts.assert_async().await;
    confirms.assert_async().await;
    container.assert_async().await;
    insert.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_backend_fails_run() {
    let config = config_for("http://127.0.0.1:1");
    let orchestrator = UploadOrchestrator::from_config(&config, Arc::new(NetworkMonitor::default())).unwrap();
    let batch = UploadBatch::new(
        vec![UploadRecord::new(
            FileHandle::from_bytes("IMG_0001.jpg", Utc::now(), Bytes::from_static(b"data")),
            Utc::now(),
        )],
        ContainerTarget::Existing { id: ContainerId(3) },
    );

    let err = orchestrator.run(batch).await.unwrap_err();
    assert!(matches!(err, UploadError::BackendUnreachable(_)));
    assert_eq!(orchestrator.counts().pending, 1);
}

#[tokio::test]
async fn test_invalid_batch_is_rejected_before_work() {
    let orchestrator =
        UploadOrchestrator::from_config(&config_for("http://127.0.0.1:1"), Arc::new(NetworkMonitor::default())).unwrap();
    let err = orchestrator
        .run(UploadBatch::new(Vec::new(), ContainerTarget::New { name: "   ".into() }))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidBatch(_)));
}
