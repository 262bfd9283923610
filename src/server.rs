// HTTP server (C9): the aquaserver/quickserver API surface. Per-request
// failures are caught and folded into the server's error field rather than
// crashing the process or the connection.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::report::{self, IncomingResult};
use crate::scheduler;
use crate::state::Server;
use crate::testmodel::Dispatch;

#[derive(Deserialize)]
pub struct NextTestQuery {
    #[serde(default)]
    #[allow(dead_code)]
    old: Option<bool>,
}

async fn next_test(State(server): State<Arc<Server>>, Query(_query): Query<NextTestQuery>) -> Json<Dispatch> {
    let snapshots = server.snapshots();
    let now_ms = current_time_ms();
    let mut rng = rand::thread_rng();
    let dispatch = scheduler::dispatch_browser(&mut rng, &snapshots, now_ms);
    server.record_dispatch(now_ms);
    Json(dispatch)
}

#[derive(serde::Serialize)]
struct ReceivedAck {
    received: &'static str,
}

async fn test_result(State(server): State<Arc<Server>>, body: Result<Json<IncomingResult>, axum::extract::rejection::JsonRejection>) -> Response {
    let Json(incoming) = match body {
        Ok(b) => b,
        Err(e) => {
            server.set_error(format!("malformed test-result body: {e}"));
            return (StatusCode::BAD_REQUEST, Json(ReceivedAck { received: "false" })).into_response();
        }
    };
    let now_ms = current_time_ms();
    report::record_result(&server, now_ms, incoming);
    (StatusCode::OK, Json(ReceivedAck { received: "true" })).into_response()
}

async fn status(State(server): State<Arc<Server>>) -> Json<crate::state::Status> {
    Json(server.status())
}

async fn report_handler(State(server): State<Arc<Server>>) -> Response {
    let json = server.report_json();
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        json.to_string(),
    )
        .into_response()
}

async fn quickserver_status(State(server): State<Arc<Server>>) -> Json<crate::quick::TestingState> {
    Json((*server.testing_state()).clone())
}

async fn healthz() -> &'static str {
    "ok"
}

fn current_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Builds the full router: `/aquaserver/*`, `/quickserver/status`, and the
/// ambient `/healthz` liveness check, all with a permissive CORS layer
/// (`Access-Control-Allow-Origin: *` per §4.9).
pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/aquaserver/next-test", get(next_test))
        .route("/aquaserver/test-result", post(test_result))
        .route("/aquaserver/status", get(status))
        .route("/aquaserver/report", get(report_handler))
        .route("/quickserver/status", get(quickserver_status))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_server() -> Arc<Server> {
        Arc::new(Server::new(ServerConfig::default(), 1000))
    }

    #[tokio::test]
    async fn empty_server_next_test_returns_literal_empty_dispatch() {
        let app = router(test_server());
        let response = app
            .oneshot(Request::builder().uri("/aquaserver/next-test?old=false").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["snapshotName"], serde_json::Value::Null);
        assert_eq!(parsed["test"], serde_json::Value::Null);
        assert_eq!(parsed["url"], "no-test.html");
    }

    #[tokio::test]
    async fn status_reports_startup_timestamp() {
        let app = router(test_server());
        let response = app
            .oneshot(Request::builder().uri("/aquaserver/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["startupTimestamp"], 1000);
    }

    #[tokio::test]
    async fn malformed_test_result_body_is_rejected_but_keeps_server_alive() {
        let app = router(test_server());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/aquaserver/test-result")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let app = router(test_server());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
