//! Agent HTTP endpoints: `POST /a2a`, `POST /agui` (SSE), `GET /health`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::agui::StreamWriter;

use super::service::{A2aRequest, AgentService};

pub fn router(service: Arc<AgentService>) -> Router {
    Router::new()
        .route("/a2a", post(a2a))
        .route("/agui", post(agui))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn a2a(
    State(service): State<Arc<AgentService>>,
    Json(request): Json<A2aRequest>,
) -> impl IntoResponse {
    if request.messages.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "messages must not be empty"})),
        )
            .into_response();
    }

    // Domain failures still return 200 with error_message in the body.
    let response = service
        .handle(request, None, CancellationToken::new())
        .await;
    Json(response).into_response()
}

async fn agui(
    State(service): State<Arc<AgentService>>,
    Json(request): Json<A2aRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let cancel = CancellationToken::new();
    let run_id = Uuid::new_v4().to_string();
    let (writer, rx) = StreamWriter::channel(run_id, cancel.clone());

    tokio::spawn(async move {
        service.handle(request, Some(writer), cancel).await;
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok(Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}")))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::planner::BasicPlanner;
    use crate::agent::tools::LocalTransport;
    use crate::config::{AgentConfig, RiskMcpConfig};
    use crate::data::fixture::FixtureProvider;
    use crate::mcp::metrics::McpMetrics;
    use crate::mcp::server::RiskMcpServer;
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt as _;

    fn test_router() -> Router {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 12, 1).unwrap();
        let provider = FixtureProvider::seeded(&["SBER", "GAZP"], from, to);
        let server = RiskMcpServer::new(
            Arc::new(provider),
            RiskMcpConfig::default(),
            Arc::new(McpMetrics::new()),
            None,
        );
        let service = AgentService::new(
            AgentConfig::default(),
            Arc::new(LocalTransport::new(server)),
            Arc::new(BasicPlanner),
            None,
        );
        router(Arc::new(service))
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = test_router();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn a2a_rejects_empty_messages() {
        let app = test_router();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/a2a")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"messages": []}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn a2a_happy_path_returns_output() {
        let app = test_router();
        let body = json!({
            "messages": [{"role": "user",
                          "content": "Portfolio risk SBER=60%, GAZP=40% over 2024-01-01..2024-11-01"}],
            "session_id": "http-test"
        });
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/a2a")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["session_id"], "http-test");
        assert!(value["output"]["text"].as_str().unwrap().len() > 10);
        assert!(value["output"]["error_message"].is_null());
    }

    #[tokio::test]
    async fn agui_stream_emits_sse_events() {
        let app = test_router();
        let body = json!({
            "messages": [{"role": "user",
                          "content": "Portfolio risk SBER=60%, GAZP=40% over 2024-01-01..2024-11-01"}]
        });
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/agui")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("RUN_STARTED"));
        assert!(text.contains("TEXT_MESSAGE_CONTENT"));
        assert!(text.contains("STATE_SNAPSHOT"));
        assert!(text.contains("RUN_FINISHED"));
    }
}
