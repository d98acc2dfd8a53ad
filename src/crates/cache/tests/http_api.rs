//! Cache HTTP surface tests against an ephemeral listener

use std::sync::Arc;

use cache::{create_router, AppState, ArtifactCache, CacheLimits, MemoryStorage};

async fn spawn_server(auth_token: Option<&str>) -> String {
    let cache = ArtifactCache::open(Arc::new(MemoryStorage::new()), CacheLimits::default())
        .await
        .unwrap();
    let state = AppState {
        cache: Arc::new(cache),
        auth_token: auth_token.map(|t| Arc::new(t.to_string())),
    };
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn put_get_delete_round_trip() {
    let base = spawn_server(None).await;
    let client = reqwest::Client::new();

    let put = client
        .put(format!("{base}/cache/K1"))
        .header("x-meta", r#"{"task":"assemble"}"#)
        .body(vec![42u8; 1024])
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), 200);
    let put_body: serde_json::Value = put.json().await.unwrap();
    assert_eq!(put_body["stored"], true);
    assert_eq!(put_body["size"], 1024);

    let got = client.get(format!("{base}/cache/K1")).send().await.unwrap();
    assert_eq!(got.status(), 200);
    let metadata = got.headers().get("x-meta").unwrap().to_str().unwrap().to_string();
    assert!(metadata.contains("assemble"));
    assert_eq!(got.bytes().await.unwrap().len(), 1024);

    let missing = client
        .get(format!("{base}/cache/Kmissing"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    let missing_body: serde_json::Value = missing.json().await.unwrap();
    assert_eq!(missing_body["found"], false);

    let deleted = client
        .delete(format!("{base}/cache/K1"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);
    let after = client.get(format!("{base}/cache/K1")).send().await.unwrap();
    assert_eq!(after.status(), 404);
}

#[tokio::test]
async fn stats_reflect_traffic() {
    let base = spawn_server(None).await;
    let client = reqwest::Client::new();

    client
        .put(format!("{base}/cache/K1"))
        .body(b"data".to_vec())
        .send()
        .await
        .unwrap();
    client.get(format!("{base}/cache/K1")).send().await.unwrap();
    client.get(format!("{base}/cache/nope")).send().await.unwrap();

    let stats: serde_json::Value = client
        .get(format!("{base}/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["entry_count"], 1);
    assert_eq!(stats["hits"], 1);
    assert_eq!(stats["misses"], 1);
}

#[tokio::test]
async fn cleanup_endpoint_reports_removed() {
    let base = spawn_server(None).await;
    let client = reqwest::Client::new();

    client
        .put(format!("{base}/cache/short"))
        .header("x-ttl-seconds", "1")
        .body(b"x".to_vec())
        .send()
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let cleaned: serde_json::Value = client
        .post(format!("{base}/cleanup"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleaned["removed"], 1);
}

#[tokio::test]
async fn bearer_auth_guards_non_health_routes() {
    let base = spawn_server(Some("sekrit")).await;
    let client = reqwest::Client::new();

    // Health stays open
    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let denied = client.get(format!("{base}/stats")).send().await.unwrap();
    assert_eq!(denied.status(), 401);

    let wrong = client
        .get(format!("{base}/stats"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let allowed = client
        .get(format!("{base}/stats"))
        .bearer_auth("sekrit")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
}

#[tokio::test]
async fn invalid_ttl_header_is_bad_request() {
    let base = spawn_server(None).await;
    let client = reqwest::Client::new();

    let response = client
        .put(format!("{base}/cache/K1"))
        .header("x-ttl-seconds", "soon")
        .body(b"x".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}
