//! HTTP surface.
//!
//! - `GET /health` → `{ "ok": true, "service": "collaboration-backend" }`
//! - `GET /documents/:id` → snapshot JSON, created with defaults if absent
//!
//! CORS is limited to the configured origin allowlist.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::engine::DocumentEngine;

pub const SERVICE_NAME: &str = "collaboration-backend";

#[derive(Clone)]
struct HttpState {
    engine: Arc<DocumentEngine>,
}

/// Build the router.
pub fn router(engine: Arc<DocumentEngine>, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/documents/:id", get(get_document))
        .with_state(HttpState { engine })
        .layer(cors(allowed_origins))
}

/// Serve `app` on an already bound listener.
pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    log::info!("HTTP server listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await
}

fn cors(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("Ignoring unusable CORS origin {origin:?}");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "service": SERVICE_NAME }))
}

async fn get_document(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    match state.engine.get(&id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            log::error!("GET /documents/{id} failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "message": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, SnapshotStore, StoreError};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use docsync_core::{DocumentSnapshot, TextOperation};
    use serde_json::Value;
    use tower::ServiceExt;

    fn engine() -> Arc<DocumentEngine> {
        Arc::new(DocumentEngine::new(Arc::new(MemoryStore::new())))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(engine(), &["http://localhost:5173".into()]);
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true, "service": "collaboration-backend" }));
    }

    #[tokio::test]
    async fn test_get_document_creates_default() {
        let engine = engine();
        let app = router(engine.clone(), &[]);
        let (status, body) = get_json(app, "/documents/fresh").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "fresh");
        assert_eq!(body["content"], "");
        assert_eq!(body["version"], 0);
        assert!(body["updatedAt"].is_u64());
    }

    #[tokio::test]
    async fn test_get_document_after_edit() {
        let engine = engine();
        engine
            .apply(&TextOperation {
                doc_id: "doc".into(),
                position: 0,
                delete_count: 0,
                insert_text: "hello".into(),
                client_id: "c".into(),
                base_version: 0,
            })
            .await
            .unwrap();
        let (_, body) = get_json(router(engine, &[]), "/documents/doc").await;
        assert_eq!(body["content"], "hello");
        assert_eq!(body["version"], 1);
    }

    struct DownStore;

    #[async_trait]
    impl SnapshotStore for DownStore {
        async fn get(&self, _id: &str) -> Result<DocumentSnapshot, StoreError> {
            Err(StoreError::DatabaseError("disk gone".into()))
        }

        async fn compare_and_set(&self, _: u64, _: &DocumentSnapshot) -> Result<bool, StoreError> {
            Err(StoreError::DatabaseError("disk gone".into()))
        }

        fn backend(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_503() {
        let app = router(Arc::new(DocumentEngine::new(Arc::new(DownStore))), &[]);
        let (status, body) = get_json(app, "/documents/doc").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["message"].as_str().unwrap().contains("disk gone"));
    }

    #[tokio::test]
    async fn test_cors_allowlist() {
        let app = router(engine(), &["http://localhost:5173".into()]);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:5173"
        );

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "http://evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }
}
