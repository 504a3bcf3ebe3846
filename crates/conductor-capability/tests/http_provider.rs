#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the HTTP capability provider and registry health loop.

use conductor_capability::{CapabilityProvider, CapabilityRegistry, HttpCapabilityProvider};
use conductor_core::{ConductorError, EventBus, ProviderRecord, ProviderStatus};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider_for(server: &MockServer) -> HttpCapabilityProvider {
    let record = ProviderRecord::new("search", server.uri(), vec!["web_search".to_string()]);
    HttpCapabilityProvider::from_record(&record, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn http_provider_posts_params_to_capability_route() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invoke/web_search"))
        .and(body_json(serde_json::json!({"query": "tokio"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"hits": 3})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let invocation = provider
        .invoke("web_search", serde_json::json!({"query": "tokio"}))
        .await
        .unwrap();
    assert_eq!(invocation.output["hits"], 3);
    assert!(invocation.response_time.is_none());
}

#[tokio::test]
async fn http_provider_surfaces_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invoke/web_search"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let err = provider
        .invoke("web_search", serde_json::Value::Null)
        .await
        .unwrap_err();
    match err {
        ConductorError::Http(msg) => {
            assert!(msg.contains("503"));
            assert!(msg.contains("overloaded"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn registry_probe_tracks_health_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let registry = CapabilityRegistry::new(EventBus::default());
    registry.register(Arc::new(provider_for(&server))).await;
    assert_eq!(
        registry.get("search").await.unwrap().status,
        ProviderStatus::Unknown
    );

    let status = registry.probe("search").await.unwrap();
    assert_eq!(status, ProviderStatus::Healthy);
    let snap = registry.get("search").await.unwrap();
    assert!(snap.last_response_ms.is_some());
    assert!(snap.last_health_check.is_some());
}

#[tokio::test]
async fn registry_health_loop_marks_unreachable_provider() {
    // Nothing listens on port 1, so every probe fails.
    let provider = HttpCapabilityProvider::new(
        "dead",
        "http://127.0.0.1:1",
        vec!["web_search".to_string()],
        Duration::from_millis(500),
    )
    .unwrap();

    let registry = Arc::new(CapabilityRegistry::new(EventBus::default()));
    registry.register(Arc::new(provider)).await;
    let handle = registry.clone().start_health_loop(Duration::from_millis(50));

    let mut status = ProviderStatus::Unknown;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        status = registry.get("dead").await.unwrap().status;
        if status == ProviderStatus::Error {
            break;
        }
    }
    handle.abort();
    assert_eq!(status, ProviderStatus::Error);
}
