//! HTTP surface of the rate limit service.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::{RateSyncError, Result};
use crate::limiter::Decision;
use crate::service::{CheckRequest, ConfigureRequest, RateLimitService};

/// Capacity of the limiter that answered.
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Whole units left after the decision.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Seconds until capacity frees up, rounded.
pub const RESET_HEADER: &str = "x-ratelimit-reset";

impl IntoResponse for RateSyncError {
    fn into_response(self) -> Response {
        match self {
            RateSyncError::KeyNotConfigured(_) => {
                (StatusCode::NOT_FOUND, "rate limiter not found").into_response()
            }
            RateSyncError::InvalidConfiguration { field, reason } => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "field": field, "error": reason })),
            )
                .into_response(),
            other => {
                error!(error = %other, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

/// Routes of the service.
pub fn router(service: Arc<RateLimitService>) -> Router {
    Router::new()
        .route("/check", get(check))
        .route("/configure", post(configure))
        .route("/metrics", get(metrics))
        .with_state(service)
}

fn decision_response(decision: Decision) -> Response {
    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    let reset_secs = decision.reset_after.as_secs_f64().round() as u64;

    (
        status,
        [
            (LIMIT_HEADER, decision.limit.to_string()),
            (REMAINING_HEADER, decision.remaining.to_string()),
            (RESET_HEADER, reset_secs.to_string()),
        ],
    )
        .into_response()
}

async fn check(
    State(service): State<Arc<RateLimitService>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response> {
    let request = CheckRequest::from_query(&pairs);
    let decision = service.check(&request).await?;
    Ok(decision_response(decision))
}

async fn configure(
    State(service): State<Arc<RateLimitService>>,
    body: std::result::Result<Json<ConfigureRequest>, JsonRejection>,
) -> Result<&'static str> {
    let Json(request) = body.map_err(|rejection| {
        warn!(error = %rejection, "Rejected configure body");
        RateSyncError::invalid("body", rejection.body_text())
    })?;
    service.configure(&request).await?;
    Ok("configured")
}

#[derive(Debug, Default, Deserialize)]
struct MetricsQuery {
    #[serde(default)]
    reset: bool,
}

async fn metrics(
    State(service): State<Arc<RateLimitService>>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let snapshot = service.metrics();
    if query.reset {
        service.reset_metrics();
    }
    Json(snapshot).into_response()
}

/// HTTP server for the rate limit service.
pub struct HttpServer {
    addr: SocketAddr,
    service: Arc<RateLimitService>,
}

impl HttpServer {
    /// Server for `service` bound to `addr` once serving starts.
    pub fn new(addr: SocketAddr, service: Arc<RateLimitService>) -> Self {
        Self { addr, service }
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "HTTP server listening");

        axum::serve(listener, router(self.service))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                RateSyncError::Io(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::LimiterManager;
    use crate::store::MemoryStore;
    use crate::sync::InstanceId;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<RateLimitService>) {
        let manager = LimiterManager::new(Arc::new(MemoryStore::new()), InstanceId::generate());
        let service = Arc::new(RateLimitService::new(Arc::new(manager)));
        (router(service.clone()), service)
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    fn configure_body(body: serde_json::Value) -> Request<Body> {
        Request::post("/configure")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn header(response: &Response, name: &str) -> String {
        response.headers()[name].to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_check_unknown_key_is_not_found() {
        let (app, _) = app();
        let response = send(&app, get_request("/check?key=missing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "rate limiter not found");
    }

    #[tokio::test]
    async fn test_check_without_key_is_bad_request() {
        let (app, _) = app();
        let response = send(&app, get_request("/check?args=u1")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["field"], "key");
        assert_eq!(body["error"], "Valid key is required");
    }

    #[tokio::test]
    async fn test_configure_and_check_flow() {
        let (app, service) = app();
        let response = send(
            &app,
            configure_body(json!({
                "key": "api",
                "limiterType": 20,
                "configuration": {"capacity": 2, "windowSize": 60}
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "configured");

        let first = send(&app, get_request("/check?key=api&args=u1")).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(header(&first, LIMIT_HEADER), "2");
        assert_eq!(header(&first, REMAINING_HEADER), "1");

        send(&app, get_request("/check?key=api&args=u1")).await;
        let blocked = send(&app, get_request("/check?key=api&args=u1")).await;
        assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&blocked, REMAINING_HEADER), "0");
        assert_eq!(header(&blocked, RESET_HEADER), "60");

        // Different args, different limiter.
        let other = send(&app, get_request("/check?key=api&args=u2")).await;
        assert_eq!(other.status(), StatusCode::OK);

        service.manager().shutdown().await;
    }

    #[tokio::test]
    async fn test_configure_validation_errors() {
        let (app, _) = app();
        let response = send(
            &app,
            configure_body(json!({
                "key": "api",
                "limiterType": 10,
                "configuration": {"capacity": 5}
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["field"], "refillRate");

        let malformed = Request::post("/configure")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = send(&app, malformed).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_report_and_reset() {
        let (app, service) = app();
        send(
            &app,
            configure_body(json!({
                "key": "api",
                "limiterType": 10,
                "configuration": {"capacity": 1, "refillRate": 0.1}
            })),
        )
        .await;
        send(&app, get_request("/check?key=api")).await;
        send(&app, get_request("/check?key=api")).await;

        let response = send(&app, get_request("/metrics?reset=true")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["total_requests"], 2);
        assert_eq!(body["allowed"], 1);
        assert_eq!(body["blocked"], 1);

        let response = send(&app, get_request("/metrics")).await;
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["total_requests"], 0);

        service.manager().shutdown().await;
    }

    #[tokio::test]
    async fn test_store_outage_on_configure_is_internal_error() {
        let store = Arc::new(MemoryStore::new());
        let manager = LimiterManager::new(store.clone(), InstanceId::generate());
        let app = router(Arc::new(RateLimitService::new(Arc::new(manager))));
        store.set_available(false);

        let response = send(
            &app,
            configure_body(json!({
                "key": "api",
                "limiterType": 10,
                "configuration": {"capacity": 1, "refillRate": 1}
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "Internal server error");
    }
}
