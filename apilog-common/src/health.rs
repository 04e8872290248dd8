use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::database::{PingError, StoreHandle};
use crate::responses::StatusBody;

/// `GET /live` for processes whose liveness is just "the listener answers".
pub async fn live() -> StatusBody {
    StatusBody::ok()
}

/// `GET /ready`: 200 when the store answers a ping, 503 otherwise.
pub async fn ready(State(store): State<StoreHandle>) -> Response {
    match store.ping().await {
        Ok(()) => StatusBody::ready().into_response(),
        Err(error) => {
            if let PingError::Unreachable(ref cause) = error {
                warn!(error = %cause, "readiness check failed");
            }
            StatusBody::error(error.message()).with_status(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_json_diff::assert_json_eq;
    use axum::body::Body;
    use axum::http;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::database::ConnectionManager;
    use crate::test_utils::MemoryLogStore;

    fn app(store: StoreHandle) -> Router {
        Router::new()
            .route("/live", get(live))
            .route("/ready", get(ready))
            .with_state(store)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_live() {
        let (status, body) = get_json(app(StoreHandle::unconfigured()), "/live").await;

        assert_eq!(status, StatusCode::OK);
        assert_json_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_ready_with_reachable_store() {
        let store = Arc::new(MemoryLogStore::new());
        let manager = ConnectionManager::with_store(store);

        let (status, body) = get_json(app(manager.handle()), "/ready").await;

        assert_eq!(status, StatusCode::OK);
        assert_json_eq!(body, json!({"status": "ready"}));
    }

    #[tokio::test]
    async fn test_ready_during_outage() {
        let store = Arc::new(MemoryLogStore::new());
        let manager = ConnectionManager::with_store(store.clone());
        store.set_reachable(false);

        let (status, body) = get_json(app(manager.handle()), "/ready").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_json_eq!(body, json!({"status": "error", "message": "db unreachable"}));

        store.set_reachable(true);
        let (status, _) = get_json(app(manager.handle()), "/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_without_store() {
        let (status, body) = get_json(app(StoreHandle::unconfigured()), "/ready").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_json_eq!(
            body,
            json!({"status": "error", "message": "db not configured"})
        );
    }
}
