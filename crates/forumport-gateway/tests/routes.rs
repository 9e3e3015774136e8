//! Route tests for the redirect gateway.

use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use forumport_core::idmap::{IdMapStore, ReadOnlyIdMap, IMPORT_LOG_TREE};
use forumport_gateway::{create_router, AppState, GatewayConfig};
use serde_json::Value;

/// Server over a temporary import table with a few translations.
fn server(config: GatewayConfig) -> TestServer {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let ids = IdMapStore::open(&db).unwrap();
    ids.put("thread", 7u64, 207).unwrap();
    ids.put("post", 99u64, 1099).unwrap();
    ids.put("forum", 4u64, 14).unwrap();
    ids.put_excluded("user", 1u64).unwrap();
    ids.flush().unwrap();

    let lookup = ReadOnlyIdMap::open(&db, IMPORT_LOG_TREE).unwrap();
    let state = AppState::new(Arc::new(lookup), config).unwrap();
    TestServer::new(create_router(state)).unwrap()
}

#[tokio::test]
async fn test_legacy_thread_redirects_permanently() {
    let server = server(GatewayConfig::default().with_base_url("https://forum.example"));
    let response = server.get("/forum/index.php?thread/7-hello-world/").await;
    response.assert_status(StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.header("location"), "https://forum.example/threads/207/");
}

#[tokio::test]
async fn test_legacy_query_links_redirect() {
    let server = server(GatewayConfig::default());
    let response = server.get("/index.php?page=Thread&postID=99").await;
    response.assert_status(StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.header("location"), "/posts/1099/");

    let response = server.get("/board/4-news/").await;
    assert_eq!(response.header("location"), "/forums/14/");
}

#[tokio::test]
async fn test_unmapped_urls_are_not_found() {
    let server = server(GatewayConfig::default());
    server.get("/thread/8-missing/").await.assert_status_not_found();
    server.get("/user/1-excluded/").await.assert_status_not_found();
    server.get("/some/other/page").await.assert_status_not_found();
}

#[tokio::test]
async fn test_redirects_can_be_disabled() {
    let server = server(GatewayConfig::default().with_redirects(false));
    server.get("/thread/7-hello-world/").await.assert_status_not_found();
}

#[tokio::test]
async fn test_translation_lookup() {
    let server = server(GatewayConfig::default());

    let mapped: Value = server.get("/translations/thread/7").await.json();
    assert_eq!(mapped["state"], "mapped");
    assert_eq!(mapped["target_id"], 207);

    let excluded: Value = server.get("/translations/user/1").await.json();
    assert_eq!(excluded["state"], "excluded");
    assert!(excluded["target_id"].is_null());

    let missing: Value = server.get("/translations/post/5").await.json();
    assert_eq!(missing["state"], "missing");
}

#[tokio::test]
async fn test_health() {
    let server = server(GatewayConfig::default());
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["import_table"], IMPORT_LOG_TREE);
}

#[test]
fn test_missing_import_table_is_rejected() {
    let db = sled::Config::new().temporary(true).open().unwrap();
    assert!(ReadOnlyIdMap::open(&db, "import:other").is_err());
}
