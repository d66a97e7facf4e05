//! HTTP surface checks: status codes and error shapes, without driving the
//! storage backends.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use persisto::config::Config;
use persisto::context::ServiceContext;
use persisto::object_store::{InMemoryObjectStore, ObjectStore};
use persisto::server;
use tower::ServiceExt;

fn test_router() -> axum::Router {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
    let ctx = Arc::new(ServiceContext::new(Config::default(), store));
    server::router(ctx)
}

#[tokio::test]
async fn test_health_endpoint() {
    let response = test_router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_list_databases_empty() {
    let response = test_router()
        .oneshot(Request::get("/databases").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_create_with_invalid_name_is_rejected() {
    let request = Request::post("/databases")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"name":"bad/name"}"#))
        .unwrap();

    let response = test_router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_query_unknown_database_is_404() {
    let request = Request::post("/databases/ghost/query")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"queries":["SELECT 1"]}"#))
        .unwrap();

    let response = test_router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_query_statement_count_bounds() {
    let queries: Vec<String> = (0..17).map(|i| format!("SELECT {}", i)).collect();
    let body = serde_json::json!({ "queries": queries }).to_string();

    let request = Request::post("/databases/ghost/query")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = test_router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
