use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::server::handlers::{agent, conversations, query, status};
use crate::state::AppState;

/// The full `/api` surface, with permissive CORS and request tracing.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(status::status))
        .route("/api/upload", post(status::upload))
        .route("/api/build-start", post(status::build_start))
        .route("/api/build-progress", get(status::build_progress))
        .route("/api/query", post(query::query))
        .route("/api/query-stream", post(query::query_stream))
        .route("/api/agent/query", post(agent::agent_query))
        .route("/api/agent/smart-query", post(agent::smart_query))
        .route("/api/agent/query-stream", post(agent::agent_query_stream))
        .route(
            "/api/agent/conversation/create",
            post(agent::create_conversation),
        )
        .route("/api/conversations", get(conversations::list_conversations))
        .route(
            "/api/conversations/:conversation_id",
            get(conversations::get_conversation).delete(conversations::delete_conversation),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::config::test_settings;

    async fn test_state() -> Arc<AppState> {
        let mut settings = test_settings();
        let scratch = std::env::temp_dir().join(format!("lorebase-router-{}", uuid::Uuid::new_v4()));
        settings.documents_path = scratch.join("documents");
        settings.vector_db_path = scratch.join("vector_db");
        settings.conversations_path = scratch.join("conversations.db");
        std::fs::create_dir_all(&scratch).unwrap();
        AppState::initialize(settings).await.unwrap()
    }

    #[tokio::test]
    async fn status_reports_unbuilt_store() {
        let app = router(test_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["vector_store_loaded"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn query_on_unbuilt_store_is_conflict() {
        let app = router(test_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/query")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"question": "anything"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let app = router(test_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/query")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"question": "  "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn conversation_lifecycle_over_http() {
        let state = test_state().await;
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/agent/conversation/create")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = value["conversation_id"].as_str().unwrap().to_string();

        state.history.append(&id, "user", "hello").await.unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/conversations/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/conversations/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/conversations/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let app = router(test_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/conversations/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn build_progress_starts_idle() {
        let app = router(test_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/build-progress")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], serde_json::json!("idle"));
        assert_eq!(value["processing"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn stream_endpoint_returns_event_stream() {
        let app = router(test_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/query-stream")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"question": "hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
    }
}
